//! The x86-64 relocation catalog.
//!
//! One closed enum for the psABI relocation set plus the pure per-type
//! tables the scanner and relocator key off: reference flags, relocatable
//! -link sizes, dynamic-loader support, and the function-pointer subset used
//! by identical-code-folding safety checks.

use crate::backend::elf::{STV_HIDDEN, STV_INTERNAL, STV_PROTECTED};
use crate::backend::linker_common::{reference, LinkOptions};
use crate::common::error::DiagnosticEngine;

/// The x86-64 psABI relocation types. Discriminants are the ELF r_type
/// numbers, so `as u32` round-trips through `from_u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RelocType {
    None = 0,
    Abs64 = 1,
    Pc32 = 2,
    Got32 = 3,
    Plt32 = 4,
    Copy = 5,
    GlobDat = 6,
    JumpSlot = 7,
    Relative = 8,
    GotPcRel = 9,
    Abs32 = 10,
    Abs32S = 11,
    Abs16 = 12,
    Pc16 = 13,
    Abs8 = 14,
    Pc8 = 15,
    DtpMod64 = 16,
    DtpOff64 = 17,
    TpOff64 = 18,
    TlsGd = 19,
    TlsLd = 20,
    DtpOff32 = 21,
    GotTpOff = 22,
    TpOff32 = 23,
    Pc64 = 24,
    GotOff64 = 25,
    GotPc32 = 26,
    Got64 = 27,
    GotPcRel64 = 28,
    GotPc64 = 29,
    GotPlt64 = 30,
    PltOff64 = 31,
    Size32 = 32,
    Size64 = 33,
    GotPc32TlsDesc = 34,
    TlsDescCall = 35,
    TlsDesc = 36,
    IRelative = 37,
    GnuVtInherit = 250,
    GnuVtEntry = 251,
}

impl RelocType {
    pub fn from_u32(value: u32) -> Option<RelocType> {
        use RelocType::*;
        Some(match value {
            0 => None,
            1 => Abs64,
            2 => Pc32,
            3 => Got32,
            4 => Plt32,
            5 => Copy,
            6 => GlobDat,
            7 => JumpSlot,
            8 => Relative,
            9 => GotPcRel,
            10 => Abs32,
            11 => Abs32S,
            12 => Abs16,
            13 => Pc16,
            14 => Abs8,
            15 => Pc8,
            16 => DtpMod64,
            17 => DtpOff64,
            18 => TpOff64,
            19 => TlsGd,
            20 => TlsLd,
            21 => DtpOff32,
            22 => GotTpOff,
            23 => TpOff32,
            24 => Pc64,
            25 => GotOff64,
            26 => GotPc32,
            27 => Got64,
            28 => GotPcRel64,
            29 => GotPc64,
            30 => GotPlt64,
            31 => PltOff64,
            32 => Size32,
            33 => Size64,
            34 => GotPc32TlsDesc,
            35 => TlsDescCall,
            36 => TlsDesc,
            37 => IRelative,
            250 => GnuVtInherit,
            251 => GnuVtEntry,
            _ => return Option::None,
        })
    }

    /// True for the dynamic relocation types that never appear in
    /// relocatable object files.
    pub fn is_outstanding_dynamic(self) -> bool {
        use RelocType::*;
        matches!(
            self,
            Copy | GlobDat | JumpSlot | Relative | IRelative | TpOff64 | DtpMod64 | TlsDesc
        )
    }

    /// True for the initial TLS relocation types the compiler emits.
    pub fn is_initial_tls(self) -> bool {
        use RelocType::*;
        matches!(
            self,
            TlsGd | GotPc32TlsDesc | TlsDescCall | TlsLd | DtpOff32 | DtpOff64 | GotTpOff | TpOff32
        )
    }
}

/// How a relocation of the given type references its symbol. The symbol
/// answers "do you need a dynamic reloc / should I use your PLT address"
/// based on these bits.
pub fn reference_flags(r_type: RelocType) -> u32 {
    use RelocType::*;
    match r_type {
        None | GnuVtInherit | GnuVtEntry | GotPc32 | GotPc64 => 0,

        Abs64 | Abs32 | Abs32S | Abs16 | Abs8 => reference::ABSOLUTE,

        Pc64 | Pc32 | Pc16 | Pc8 | GotOff64 => reference::RELATIVE,

        Plt32 | PltOff64 => reference::FUNCTION_CALL | reference::RELATIVE,

        // Absolute address stored in the GOT.
        Got64 | Got32 | GotPcRel64 | GotPcRel | GotPlt64 => reference::ABSOLUTE,

        TlsGd | GotPc32TlsDesc | TlsDescCall | TlsLd | DtpOff32 | DtpOff64 | GotTpOff
        | TpOff32 => reference::TLS,

        // Not expected in input; the scanner reports these separately.
        Copy | GlobDat | JumpSlot | Relative | IRelative | TpOff64 | DtpMod64 | TlsDesc
        | Size32 | Size64 => 0,
    }
}

/// Size in bytes of the field a relocation patches, used while scanning
/// relocs during a relocatable link. Unexpected and unsupported types are
/// reported and sized 0.
pub fn size_for_relocatable(r_type: RelocType, object: &str, diag: &mut DiagnosticEngine) -> u32 {
    use RelocType::*;
    match r_type {
        None | GnuVtInherit | GnuVtEntry | TlsGd | GotPc32TlsDesc | TlsDescCall | TlsLd
        | DtpOff32 | DtpOff64 | GotTpOff | TpOff32 => 0,

        Abs64 | Pc64 | GotOff64 | GotPc64 | PltOff64 | Got64 | GotPcRel64 | GotPlt64 => 8,

        Abs32 | Abs32S | Pc32 | Plt32 | GotPc32 | Got32 | GotPcRel => 4,

        Abs16 | Pc16 => 2,

        Abs8 | Pc8 => 1,

        Copy | GlobDat | JumpSlot | Relative | IRelative | TpOff64 | DtpMod64 | TlsDesc => {
            diag.error_object(object, format!("unexpected reloc {} in object file", r_type as u32));
            0
        }

        Size32 | Size64 => {
            diag.error_object(object, format!("unsupported reloc {} against local symbol", r_type as u32));
            0
        }
    }
}

/// The relocation types the glibc dynamic loader handles on x86-64. Any
/// other type required in a position-independent output means the input was
/// not compiled for PIC.
pub fn dynamic_loader_supports(r_type: RelocType) -> bool {
    use RelocType::*;
    matches!(
        r_type,
        Relative | IRelative | GlobDat | JumpSlot | DtpMod64 | DtpOff64 | TpOff64 | Abs64
            | Abs32 | Pc32 | Copy
    )
}

/// Whether a relocation of this type could be taking the address of a
/// function: the direct-address and GOT-address subset.
pub fn possible_function_pointer_reloc(r_type: RelocType) -> bool {
    use RelocType::*;
    matches!(
        r_type,
        Abs64 | Abs32 | Abs32S | Abs16 | Abs8 | Got64 | Got32 | GotPcRel64 | GotPcRel | GotPlt64
    )
}

/// Identical-code-folding safety: may this reloc against a local symbol be
/// a function pointer being taken? When building a shared library a call
/// and an address-take cannot be distinguished, so nothing local is folded.
pub fn local_reloc_may_be_function_pointer(options: &LinkOptions, r_type: RelocType) -> bool {
    options.output_kind.is_shared() || possible_function_pointer_reloc(r_type)
}

/// Identical-code-folding safety for globals: non-default visibility in a
/// shared library binds locally, so it gets the conservative treatment too.
pub fn global_reloc_may_be_function_pointer(
    options: &LinkOptions,
    r_type: RelocType,
    visibility: u8,
) -> bool {
    (options.output_kind.is_shared()
        && matches!(visibility, STV_INTERNAL | STV_PROTECTED | STV_HIDDEN))
        || possible_function_pointer_reloc(r_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::linker_common::OutputKind;

    #[test]
    fn test_from_u32_roundtrip() {
        for value in (0..=37).chain([250, 251]) {
            let r_type = RelocType::from_u32(value).unwrap();
            assert_eq!(r_type as u32, value);
        }
        assert_eq!(RelocType::from_u32(38), None);
        assert_eq!(RelocType::from_u32(249), None);
    }

    #[test]
    fn test_reference_flags_table() {
        assert_eq!(reference_flags(RelocType::Abs64), reference::ABSOLUTE);
        assert_eq!(reference_flags(RelocType::Pc32), reference::RELATIVE);
        assert_eq!(
            reference_flags(RelocType::Plt32),
            reference::FUNCTION_CALL | reference::RELATIVE
        );
        assert_eq!(reference_flags(RelocType::GotPcRel), reference::ABSOLUTE);
        assert_eq!(reference_flags(RelocType::TlsGd), reference::TLS);
        assert_eq!(reference_flags(RelocType::GotPc32), 0);
        assert_eq!(reference_flags(RelocType::JumpSlot), 0);
    }

    #[test]
    fn test_relocatable_sizes() {
        let mut diag = DiagnosticEngine::new();
        assert_eq!(size_for_relocatable(RelocType::Abs64, "a.o", &mut diag), 8);
        assert_eq!(size_for_relocatable(RelocType::Plt32, "a.o", &mut diag), 4);
        assert_eq!(size_for_relocatable(RelocType::Pc16, "a.o", &mut diag), 2);
        assert_eq!(size_for_relocatable(RelocType::Pc8, "a.o", &mut diag), 1);
        assert_eq!(size_for_relocatable(RelocType::TlsGd, "a.o", &mut diag), 0);
        assert!(!diag.has_errors());

        // SIZE32/SIZE64 are recognized but unsupported, not silently sized.
        assert_eq!(size_for_relocatable(RelocType::Size32, "a.o", &mut diag), 0);
        assert!(diag.has_errors());
    }

    #[test]
    fn test_dynamic_loader_set() {
        assert!(dynamic_loader_supports(RelocType::Relative));
        assert!(dynamic_loader_supports(RelocType::Copy));
        assert!(dynamic_loader_supports(RelocType::Pc32));
        assert!(!dynamic_loader_supports(RelocType::Abs32S));
        assert!(!dynamic_loader_supports(RelocType::Abs16));
        assert!(!dynamic_loader_supports(RelocType::GotPcRel));
    }

    #[test]
    fn test_function_pointer_subset() {
        assert!(possible_function_pointer_reloc(RelocType::Abs64));
        assert!(possible_function_pointer_reloc(RelocType::GotPcRel));
        assert!(!possible_function_pointer_reloc(RelocType::Pc32));
        assert!(!possible_function_pointer_reloc(RelocType::Plt32));

        let shared = LinkOptions {
            output_kind: OutputKind::SharedLibrary,
            ..LinkOptions::default()
        };
        // Shared output folds nothing local, whatever the reloc type.
        assert!(local_reloc_may_be_function_pointer(&shared, RelocType::Pc32));
        let exec = LinkOptions::default();
        assert!(!local_reloc_may_be_function_pointer(&exec, RelocType::Pc32));
        assert!(global_reloc_may_be_function_pointer(&shared, RelocType::Pc32, STV_HIDDEN));
        assert!(!global_reloc_may_be_function_pointer(&exec, RelocType::Pc32, STV_HIDDEN));
    }
}
