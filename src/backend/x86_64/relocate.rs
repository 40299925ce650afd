//! Pass 2: apply relocations to output section bytes.
//!
//! By the time this runs every address is frozen: the scanner has allocated
//! all PLT/GOT slots and the driver has laid out the output sections. The
//! relocator computes each symbol's value (substituting the PLT address
//! where the symbol uses one), dispatches on the relocation type to an
//! arithmetic kernel, and hands the TLS types to the rewrite logic.
//!
//! Narrow kernels detect overflow: `R_X86_64_32` requires the value to
//! zero-extend, `R_X86_64_32S` and the PC-relative forms to sign-extend.

use crate::backend::elf::{w16, w32, w64, SHF_EXECINSTR};
use crate::backend::linker_common::{
    Elf64Rela, InputObject, LayoutView, OutputSectionInfo, SymbolId, SymbolTable, TlsSegment,
};
use crate::backend::x86_64::got::GotEntryKind;
use crate::backend::x86_64::reloc::{reference_flags, RelocType};
use crate::backend::x86_64::tls::{self, optimize_tls_reloc, TlsOptimization};
use crate::backend::x86_64::{Target, TLS_GET_ADDR};
use crate::common::error::DiagnosticEngine;

/// The relocation applier. One instance per relocation section; `finish`
/// must run after the loop so an unconsumed TLS-skip is reported.
#[derive(Debug, Default)]
pub struct Relocator {
    /// Set after a GD/LD rewrite: the following reloc must be the
    /// `__tls_get_addr` call, which the rewrite already absorbed.
    skip_call_tls_get_addr: bool,
}

impl Relocator {
    pub fn new() -> Self {
        Relocator { skip_call_tls_get_addr: false }
    }

    /// Apply every relocation of one input section's contribution.
    /// `view` covers the bytes the relocation offsets index into and
    /// `address` is the virtual address of `view[0]`.
    pub fn relocate_section(
        &mut self,
        target: &Target,
        symtab: &SymbolTable,
        object: &InputObject,
        relocs: &[Elf64Rela],
        section: &OutputSectionInfo,
        view: &mut [u8],
        address: u64,
        tls: Option<&TlsSegment>,
        layout: &LayoutView,
        diag: &mut DiagnosticEngine,
    ) {
        for rela in relocs {
            let r_type = match RelocType::from_u32(rela.rela_type) {
                Some(r_type) => r_type,
                None => {
                    diag.error_at(
                        &object.name,
                        &section.name,
                        rela.offset,
                        format!("unsupported reloc {}", rela.rela_type),
                    );
                    continue;
                }
            };
            let sym = object.global_id(rela.sym_idx);
            self.relocate_one(
                target,
                symtab,
                Some(object),
                sym,
                rela,
                r_type,
                section,
                view,
                address,
                tls,
                layout,
                diag,
            );
        }
        self.finish(&object.name, section, diag);
    }

    /// Apply a single relocation against a global symbol. This is the
    /// incremental-update entry point; incremental relocations always refer
    /// to global symbols.
    pub fn apply_relocation(
        &mut self,
        target: &Target,
        symtab: &SymbolTable,
        sym: SymbolId,
        r_offset: u64,
        r_type: u32,
        r_addend: i64,
        section: &OutputSectionInfo,
        view: &mut [u8],
        address: u64,
        tls: Option<&TlsSegment>,
        layout: &LayoutView,
        diag: &mut DiagnosticEngine,
    ) {
        let rela = Elf64Rela { offset: r_offset, sym_idx: 0, rela_type: r_type, addend: r_addend };
        let r_type = match RelocType::from_u32(r_type) {
            Some(r_type) => r_type,
            None => {
                diag.error_at("", &section.name, r_offset, format!("unsupported reloc {}", r_type));
                return;
            }
        };
        self.relocate_one(
            target, symtab, None, Some(sym), &rela, r_type, section, view, address, tls, layout,
            diag,
        );
    }

    /// Report an unconsumed TLS skip. Matches the source's invariant that
    /// the flag is clear when a relocation pass ends.
    pub fn finish(&mut self, object_name: &str, section: &OutputSectionInfo, diag: &mut DiagnosticEngine) {
        if self.skip_call_tls_get_addr {
            self.skip_call_tls_get_addr = false;
            diag.error_at(object_name, &section.name, 0, "missing expected TLS relocation");
        }
    }

    fn relocate_one(
        &mut self,
        target: &Target,
        symtab: &SymbolTable,
        object: Option<&InputObject>,
        sym: Option<SymbolId>,
        rela: &Elf64Rela,
        r_type: RelocType,
        section: &OutputSectionInfo,
        view: &mut [u8],
        address: u64,
        tls: Option<&TlsSegment>,
        layout: &LayoutView,
        diag: &mut DiagnosticEngine,
    ) {
        let object_name = object.map(|o| o.name.as_str()).unwrap_or("");

        // After a GD/LD rewrite the next reloc must be the absorbed
        // __tls_get_addr call.
        if self.skip_call_tls_get_addr {
            let is_call = matches!(r_type, RelocType::Plt32 | RelocType::Pc32);
            let is_tls_get_addr =
                sym.map(|s| symtab[s].name == TLS_GET_ADDR).unwrap_or(false);
            if is_call && is_tls_get_addr {
                self.skip_call_tls_get_addr = false;
                return;
            }
            diag.error_at(object_name, &section.name, rela.offset, "missing expected TLS relocation");
        }

        // Symbol value, substituting the PLT address where the symbol uses
        // its PLT entry.
        let mut value = match sym {
            Some(id) => {
                let symbol = &symtab[id];
                if symbol.use_plt_offset(&target.options, reference_flags(r_type)) {
                    layout.plt_addr + symbol.plt_offset.unwrap_or(0)
                } else {
                    symbol.value
                }
            }
            None => match object.and_then(|o| o.local(rela.sym_idx)) {
                Some(lsym) => {
                    let mut value = lsym.value;
                    if lsym.is_ifunc() {
                        if let Some(plt_offset) =
                            object.and_then(|o| o.local_plt_offset(rela.sym_idx))
                        {
                            value = layout.plt_addr + plt_offset;
                        }
                    }
                    value
                }
                None => 0,
            },
        };

        let roff = rela.offset as usize;
        let addend = rela.addend;
        let place = address + rela.offset;

        // Address of the standard GOT slot, for the GOT-relative types.
        let standard_got_slot = || -> Option<u64> {
            let offset = match sym {
                Some(id) => symtab[id].got_offset(GotEntryKind::Standard.as_u32()),
                None => object
                    .and_then(|o| o.local_got_offset(rela.sym_idx, GotEntryKind::Standard.as_u32())),
            }?;
            Some(layout.got_addr + offset as u64)
        };

        match r_type {
            RelocType::None | RelocType::GnuVtInherit | RelocType::GnuVtEntry => {}

            RelocType::Abs64 => {
                self.rela64(view, roff, value.wrapping_add(addend as u64), object_name, section, rela.offset, diag);
            }

            RelocType::Pc64 => {
                let x = value.wrapping_add(addend as u64).wrapping_sub(place);
                self.rela64(view, roff, x, object_name, section, rela.offset, diag);
            }

            RelocType::Abs32 => {
                let x = value.wrapping_add(addend as u64);
                self.rela32(view, roff, x, Overflow::Unsigned, object_name, section, rela.offset, diag);
            }

            RelocType::Abs32S => {
                let x = value.wrapping_add(addend as u64);
                self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
            }

            RelocType::Pc32 | RelocType::Plt32 => {
                // For PLT32 the value already points at the PLT entry.
                let x = value.wrapping_add(addend as u64).wrapping_sub(place);
                self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
            }

            RelocType::Abs16 => {
                let x = value.wrapping_add(addend as u64);
                self.rela16(view, roff, x, Overflow::Unsigned, object_name, section, rela.offset, diag);
            }

            RelocType::Pc16 => {
                let x = value.wrapping_add(addend as u64).wrapping_sub(place);
                self.rela16(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
            }

            RelocType::Abs8 => {
                let x = value.wrapping_add(addend as u64);
                self.rela8(view, roff, x, Overflow::Unsigned, object_name, section, rela.offset, diag);
            }

            RelocType::Pc8 => {
                let x = value.wrapping_add(addend as u64).wrapping_sub(place);
                self.rela8(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
            }

            RelocType::PltOff64 => {
                // L + A - GOT, where GOT is the _GLOBAL_OFFSET_TABLE_ base.
                let x = value
                    .wrapping_add(addend as u64)
                    .wrapping_sub(layout.got_plt_addr);
                self.rela64(view, roff, x, object_name, section, rela.offset, diag);
            }

            RelocType::Got32 => match standard_got_slot() {
                Some(slot) => {
                    let got_offset = slot.wrapping_sub(layout.got_plt_addr);
                    let x = got_offset.wrapping_add(addend as u64);
                    self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
                }
                None => self.missing_got(object_name, section, rela.offset, diag),
            },

            RelocType::Got64 | RelocType::GotPlt64 => match standard_got_slot() {
                // GOTPLT64 is "like GOT64, but a PLT entry is wanted too";
                // the field itself holds the same GOT offset.
                Some(slot) => {
                    let got_offset = slot.wrapping_sub(layout.got_plt_addr);
                    let x = got_offset.wrapping_add(addend as u64);
                    self.rela64(view, roff, x, object_name, section, rela.offset, diag);
                }
                None => self.missing_got(object_name, section, rela.offset, diag),
            },

            RelocType::GotPc32 => {
                let x = layout
                    .got_plt_addr
                    .wrapping_add(addend as u64)
                    .wrapping_sub(place);
                self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
            }

            RelocType::GotPc64 => {
                let x = layout
                    .got_plt_addr
                    .wrapping_add(addend as u64)
                    .wrapping_sub(place);
                self.rela64(view, roff, x, object_name, section, rela.offset, diag);
            }

            RelocType::GotOff64 => {
                let x = value
                    .wrapping_sub(layout.got_plt_addr)
                    .wrapping_add(addend as u64);
                self.rela64(view, roff, x, object_name, section, rela.offset, diag);
            }

            RelocType::GotPcRel => match standard_got_slot() {
                Some(slot) => {
                    let x = slot.wrapping_add(addend as u64).wrapping_sub(place);
                    self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
                }
                None => self.missing_got(object_name, section, rela.offset, diag),
            },

            RelocType::GotPcRel64 => match standard_got_slot() {
                Some(slot) => {
                    let x = slot.wrapping_add(addend as u64).wrapping_sub(place);
                    self.rela64(view, roff, x, object_name, section, rela.offset, diag);
                }
                None => self.missing_got(object_name, section, rela.offset, diag),
            },

            _ if r_type.is_outstanding_dynamic() => {
                diag.error_at(
                    object_name,
                    &section.name,
                    rela.offset,
                    format!("unexpected reloc {} in object file", r_type as u32),
                );
            }

            _ if r_type.is_initial_tls() => {
                self.relocate_tls(
                    target, symtab, object, sym, rela, r_type, section, view, address, &mut value,
                    tls, layout, diag,
                );
            }

            _ => {
                diag.error_at(
                    object_name,
                    &section.name,
                    rela.offset,
                    format!("unsupported reloc {}", r_type as u32),
                );
            }
        }
    }

    // ── TLS ──────────────────────────────────────────────────────────────

    fn relocate_tls(
        &mut self,
        target: &Target,
        symtab: &SymbolTable,
        object: Option<&InputObject>,
        sym: Option<SymbolId>,
        rela: &Elf64Rela,
        r_type: RelocType,
        section: &OutputSectionInfo,
        view: &mut [u8],
        address: u64,
        value: &mut u64,
        tls: Option<&TlsSegment>,
        layout: &LayoutView,
        diag: &mut DiagnosticEngine,
    ) {
        let object_name = object.map(|o| o.name.as_str()).unwrap_or("");
        let roff = rela.offset as usize;
        let addend = rela.addend;
        let place = address + rela.offset;
        let is_executable = section.flags & SHF_EXECINSTR != 0;

        let is_final = match sym {
            Some(id) => symtab[id].final_value_known,
            None => !target.options.output_kind.is_shared(),
        };
        let mut optimized = optimize_tls_reloc(&target.options, is_final, r_type);

        // A TLS code sequence in a non-executable section is data (most
        // likely debug info); leave the bytes alone.
        if !is_executable
            && optimized == TlsOptimization::ToLe
            && matches!(
                r_type,
                RelocType::TlsGd
                    | RelocType::GotPc32TlsDesc
                    | RelocType::TlsDescCall
                    | RelocType::TlsLd
            )
        {
            optimized = TlsOptimization::None;
        }

        let tls_memsz = tls.map(|t| t.memsz);
        let require_tls = |diag: &mut DiagnosticEngine| -> Option<u64> {
            if tls_memsz.is_none() {
                diag.error_at(object_name, &section.name, rela.offset, "TLS relocation but no TLS segment");
            }
            tls_memsz
        };

        // GOT slot address for a TLS slot kind.
        let got_slot = |kind: GotEntryKind| -> Option<u64> {
            let offset = match sym {
                Some(id) => symtab[id].got_offset(kind.as_u32()),
                None => object.and_then(|o| o.local_got_offset(rela.sym_idx, kind.as_u32())),
            }?;
            let base = match kind {
                GotEntryKind::TlsDesc => layout.got_tlsdesc_addr,
                _ => layout.got_addr,
            };
            Some(base + offset as u64)
        };

        match r_type {
            RelocType::TlsGd => {
                if optimized == TlsOptimization::ToLe {
                    if let Some(memsz) = require_tls(diag) {
                        match tls::gd_to_le(view, roff, *value, memsz) {
                            Ok(()) => self.skip_call_tls_get_addr = true,
                            Err(message) => {
                                diag.error_at(object_name, &section.name, rela.offset, message)
                            }
                        }
                    }
                    return;
                }
                let kind = if optimized == TlsOptimization::ToIe {
                    GotEntryKind::TlsOffset
                } else {
                    GotEntryKind::TlsPair
                };
                let slot = match got_slot(kind) {
                    Some(slot) => slot,
                    None => return self.missing_got(object_name, section, rela.offset, diag),
                };
                match optimized {
                    TlsOptimization::ToIe => {
                        match tls::gd_to_ie(view, roff, slot, addend, place) {
                            Ok(()) => self.skip_call_tls_get_addr = true,
                            Err(message) => {
                                diag.error_at(object_name, &section.name, rela.offset, message)
                            }
                        }
                    }
                    TlsOptimization::None => {
                        let x = slot.wrapping_add(addend as u64).wrapping_sub(place);
                        self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
                    }
                    TlsOptimization::ToLe => {}
                }
            }

            RelocType::GotPc32TlsDesc | RelocType::TlsDescCall => {
                if optimized == TlsOptimization::ToLe {
                    if let Some(memsz) = require_tls(diag) {
                        if let Err(message) = tls::desc_gd_to_le(r_type, view, roff, *value, memsz) {
                            diag.error_at(object_name, &section.name, rela.offset, message);
                        }
                    }
                    return;
                }
                let kind = if optimized == TlsOptimization::ToIe {
                    GotEntryKind::TlsOffset
                } else {
                    GotEntryKind::TlsDesc
                };
                match optimized {
                    TlsOptimization::ToIe => {
                        let slot = match got_slot(kind) {
                            Some(slot) => slot,
                            None => return self.missing_got(object_name, section, rela.offset, diag),
                        };
                        if let Err(message) =
                            tls::desc_gd_to_ie(r_type, view, roff, slot, addend, place)
                        {
                            diag.error_at(object_name, &section.name, rela.offset, message);
                        }
                    }
                    TlsOptimization::None => {
                        if r_type == RelocType::GotPc32TlsDesc {
                            let slot = match got_slot(kind) {
                                Some(slot) => slot,
                                None => {
                                    return self.missing_got(object_name, section, rela.offset, diag)
                                }
                            };
                            let x = slot.wrapping_add(addend as u64).wrapping_sub(place);
                            self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
                        }
                        // TLSDESC_CALL needs no field change when the
                        // descriptor stays.
                    }
                    TlsOptimization::ToLe => {}
                }
            }

            RelocType::TlsLd => {
                if optimized == TlsOptimization::ToLe {
                    match tls::ld_to_le(view, roff) {
                        Ok(()) => self.skip_call_tls_get_addr = true,
                        Err(message) => diag.error_at(object_name, &section.name, rela.offset, message),
                    }
                    return;
                }
                match target.got_mod_index_offset() {
                    Some(offset) => {
                        let slot = layout.got_addr + offset as u64;
                        let x = slot.wrapping_add(addend as u64).wrapping_sub(place);
                        self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
                    }
                    None => self.missing_got(object_name, section, rela.offset, diag),
                }
            }

            RelocType::DtpOff32 => {
                // Used in debug info too; only adjust executable code.
                if optimized == TlsOptimization::ToLe && is_executable {
                    if let Some(memsz) = require_tls(diag) {
                        *value = value.wrapping_sub(memsz);
                    }
                }
                let x = value.wrapping_add(addend as u64);
                self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
            }

            RelocType::DtpOff64 => {
                if optimized == TlsOptimization::ToLe && is_executable {
                    if let Some(memsz) = require_tls(diag) {
                        *value = value.wrapping_sub(memsz);
                    }
                }
                self.rela64(view, roff, value.wrapping_add(addend as u64), object_name, section, rela.offset, diag);
            }

            RelocType::GotTpOff => {
                if optimized == TlsOptimization::ToLe {
                    if let Some(memsz) = require_tls(diag) {
                        if let Err(message) = tls::ie_to_le(view, roff, *value, memsz) {
                            diag.error_at(object_name, &section.name, rela.offset, message);
                        }
                    }
                    return;
                }
                if optimized == TlsOptimization::None {
                    let slot = match got_slot(GotEntryKind::TlsOffset) {
                        Some(slot) => slot,
                        None => return self.missing_got(object_name, section, rela.offset, diag),
                    };
                    let x = slot.wrapping_add(addend as u64).wrapping_sub(place);
                    self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
                }
            }

            RelocType::TpOff32 => {
                if let Some(memsz) = require_tls(diag) {
                    let x = value.wrapping_sub(memsz).wrapping_add(addend as u64);
                    self.rela32(view, roff, x, Overflow::Signed, object_name, section, rela.offset, diag);
                }
            }

            _ => {}
        }
    }

    // ── Arithmetic kernels ───────────────────────────────────────────────

    fn rela64(
        &self,
        view: &mut [u8],
        roff: usize,
        x: u64,
        object_name: &str,
        section: &OutputSectionInfo,
        offset: u64,
        diag: &mut DiagnosticEngine,
    ) {
        if roff + 8 > view.len() {
            diag.error_at(object_name, &section.name, offset, "relocation offset out of range");
            return;
        }
        w64(view, roff, x);
    }

    fn rela32(
        &self,
        view: &mut [u8],
        roff: usize,
        x: u64,
        overflow: Overflow,
        object_name: &str,
        section: &OutputSectionInfo,
        offset: u64,
        diag: &mut DiagnosticEngine,
    ) {
        if roff + 4 > view.len() {
            diag.error_at(object_name, &section.name, offset, "relocation offset out of range");
            return;
        }
        if !overflow.fits32(x) {
            diag.error_at(object_name, &section.name, offset, "relocation overflow");
        }
        w32(view, roff, x as u32);
    }

    fn rela16(
        &self,
        view: &mut [u8],
        roff: usize,
        x: u64,
        overflow: Overflow,
        object_name: &str,
        section: &OutputSectionInfo,
        offset: u64,
        diag: &mut DiagnosticEngine,
    ) {
        if roff + 2 > view.len() {
            diag.error_at(object_name, &section.name, offset, "relocation offset out of range");
            return;
        }
        if !overflow.fits16(x) {
            diag.error_at(object_name, &section.name, offset, "relocation overflow");
        }
        w16(view, roff, x as u16);
    }

    fn rela8(
        &self,
        view: &mut [u8],
        roff: usize,
        x: u64,
        overflow: Overflow,
        object_name: &str,
        section: &OutputSectionInfo,
        offset: u64,
        diag: &mut DiagnosticEngine,
    ) {
        if roff >= view.len() {
            diag.error_at(object_name, &section.name, offset, "relocation offset out of range");
            return;
        }
        if !overflow.fits8(x) {
            diag.error_at(object_name, &section.name, offset, "relocation overflow");
        }
        view[roff] = x as u8;
    }

    fn missing_got(
        &self,
        object_name: &str,
        section: &OutputSectionInfo,
        offset: u64,
        diag: &mut DiagnosticEngine,
    ) {
        diag.error_at(object_name, &section.name, offset, "relocation against symbol with no GOT entry");
    }
}

/// Overflow discipline for the narrow kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overflow {
    /// The value must zero-extend from the field.
    Unsigned,
    /// The value must sign-extend from the field.
    Signed,
}

impl Overflow {
    fn fits32(self, x: u64) -> bool {
        match self {
            Overflow::Unsigned => x == (x as u32) as u64,
            Overflow::Signed => x as i64 == (x as i32) as i64,
        }
    }

    fn fits16(self, x: u64) -> bool {
        match self {
            Overflow::Unsigned => x == (x as u16) as u64,
            Overflow::Signed => x as i64 == (x as i16) as i64,
        }
    }

    fn fits8(self, x: u64) -> bool {
        match self {
            Overflow::Unsigned => x == (x as u8) as u64,
            Overflow::Signed => x as i64 == (x as i8) as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_discipline() {
        assert!(Overflow::Unsigned.fits32(0xffff_ffff));
        assert!(!Overflow::Unsigned.fits32(0x1_0000_0000));
        assert!(!Overflow::Unsigned.fits32((-1i64) as u64));
        assert!(Overflow::Signed.fits32((-1i64) as u64));
        assert!(Overflow::Signed.fits32(0x7fff_ffff));
        assert!(!Overflow::Signed.fits32(0xffff_ffff));
        assert!(Overflow::Signed.fits16((-4i64) as u64));
        assert!(!Overflow::Signed.fits16(0x8000));
        assert!(Overflow::Unsigned.fits8(0xff));
        assert!(!Overflow::Signed.fits8(0xff));
    }
}
