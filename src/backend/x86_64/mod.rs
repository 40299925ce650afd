//! The x86-64 relocation backend.
//!
//! Owns everything x86-64-specific about a link: relocation classification
//! (`scan`), the PLT/GOT/dynamic-relocation state machine (`plt`, `got`,
//! `dynrel`), TLS access-model optimization (`tls`), relocation application
//! (`relocate`), and split-stack fixups (`split_stack`).
//!
//! The driver calls `scan::scan_relocs` for every relocation section of
//! every input, then `Target::finalize` once addresses are frozen, then
//! `relocate::Relocator::relocate_section` for every section with
//! relocation targets.
//!
//! Section shapes contributed to the output:
//! - `.plt`: ALLOC|EXECINSTR, entsize 16, `sh_info`-target of `.rela.plt`.
//! - `.got`: ALLOC|WRITE, RELRO.
//! - `.got.plt`: ALLOC|WRITE, non-RELRO, 3 reserved words first; the
//!   `.got.tlsdesc` image is its trailing part.
//! - `.rela.plt` / `.rela.dyn`: SHT_RELA, ALLOC.

pub mod reloc;
pub mod plt;
pub mod got;
pub mod dynrel;
pub mod scan;
pub mod tls;
pub mod relocate;
pub mod split_stack;

use crate::backend::elf::{
    DT_JMPREL, DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ, DT_RELA, DT_RELAENT, DT_RELASZ,
    DT_TLSDESC_GOT, DT_TLSDESC_PLT, RELA_ENTRY_SIZE, STB_GLOBAL, STB_LOCAL, STT_NOTYPE,
    STT_OBJECT, STT_TLS, STV_HIDDEN,
};
use crate::backend::linker_common::{
    DynamicTags, InputObject, LayoutView, LinkOptions, Symbol, SymbolId, SymbolTable, TlsSegment,
};
use crate::common::error::DiagnosticEngine;
use self::dynrel::{CopyRelocs, RelaSection, TlsdescInfo};
use self::got::Got;
use self::plt::Plt;

// ── Target information ───────────────────────────────────────────────────

pub const DEFAULT_TEXT_SEGMENT_ADDRESS: u64 = 0x400000;
pub const ABI_PAGESIZE: u64 = 0x1000;
pub const COMMON_PAGESIZE: u64 = 0x1000;
pub const DYNAMIC_LINKER: &str = "/lib/ld64.so.1";
/// The ABI-defined TLS accessor the GD/LD models call.
pub const TLS_GET_ADDR: &str = "__tls_get_addr";

/// Section index for large common symbols.
pub const SHN_X86_64_LCOMMON: u16 = 0xff02;
/// Section flag marking sections placed far from the small code model's
/// reach.
pub const SHF_X86_64_LARGE: u64 = 0x1000_0000;

/// Whether a new output section belongs to the large-section region.
pub fn is_large_section(flags: u64) -> bool {
    flags & SHF_X86_64_LARGE != 0
}

// ── Backend state ────────────────────────────────────────────────────────

/// Per-link x86-64 backend state. Sections are created lazily on first
/// demand during the scan; after `finalize` everything is frozen and the
/// relocator only reads.
#[derive(Debug)]
pub struct Target {
    pub options: LinkOptions,
    got: Option<Got>,
    plt: Option<Plt>,
    rela_dyn: Option<RelaSection>,
    pub copy_relocs: CopyRelocs,
    got_mod_index_offset: Option<u32>,
    tlsdesc_info: Vec<TlsdescInfo>,
    tls_base_symbol_defined: bool,
    got_symbol: Option<SymbolId>,
    rela_iplt_symbols: Option<(SymbolId, SymbolId)>,
    tls_base_symbol: Option<SymbolId>,
    has_static_tls: bool,
}

/// The backend-owned section contents, produced at finalize time.
#[derive(Debug, Default)]
pub struct SectionImages {
    pub plt: Vec<u8>,
    pub got: Vec<u8>,
    pub got_plt: Vec<u8>,
    pub got_tlsdesc: Vec<u8>,
    pub rela_dyn: Vec<u8>,
    pub rela_plt: Vec<u8>,
}

impl Target {
    pub fn new(options: LinkOptions) -> Self {
        Target {
            options,
            got: None,
            plt: None,
            rela_dyn: None,
            copy_relocs: CopyRelocs::new(),
            got_mod_index_offset: None,
            tlsdesc_info: Vec::new(),
            tls_base_symbol_defined: false,
            got_symbol: None,
            rela_iplt_symbols: None,
            tls_base_symbol: None,
            has_static_tls: false,
        }
    }

    /// Create the GOT and PLT pre-sized for an incremental update;
    /// existing entries are rebound through `register_global_plt_entry` and
    /// the GOT reservation paths.
    pub fn new_for_update(
        options: LinkOptions,
        symtab: &mut SymbolTable,
        got_count: usize,
        plt_count: u32,
    ) -> Self {
        let mut target = Target::new(options);
        target.got = Some(Got::new_for_update(got_count, plt_count as usize));
        target.got_symbol = Some(symtab.define_predefined(
            "_GLOBAL_OFFSET_TABLE_",
            STT_OBJECT,
            STB_LOCAL,
            STV_HIDDEN,
        ));
        target.plt = Some(Plt::new_for_update(plt_count));
        target.rela_dyn = Some(RelaSection::new());
        target
    }

    // ── Section accessors ────────────────────────────────────────────────

    /// Create the GOT sections on first demand and define
    /// `_GLOBAL_OFFSET_TABLE_` at the `.got.plt` base.
    pub fn ensure_got(&mut self, symtab: &mut SymbolTable) {
        if self.got.is_none() {
            self.got = Some(Got::new());
            self.got_symbol = Some(symtab.define_predefined(
                "_GLOBAL_OFFSET_TABLE_",
                STT_OBJECT,
                STB_LOCAL,
                STV_HIDDEN,
            ));
        }
    }

    pub fn got(&self) -> Option<&Got> {
        self.got.as_ref()
    }

    pub fn plt(&self) -> Option<&Plt> {
        self.plt.as_ref()
    }

    pub fn rela_dyn_section(&self) -> Option<&RelaSection> {
        self.rela_dyn.as_ref()
    }

    /// The dynamic relocation section, created on first demand.
    pub fn rela_dyn(&mut self) -> &mut RelaSection {
        self.rela_dyn.get_or_insert_with(RelaSection::new)
    }

    /// Both the GOT and `.rela.dyn`, for the allocate-and-register paths.
    pub fn got_rela_dyn(&mut self, symtab: &mut SymbolTable) -> (&mut Got, &mut RelaSection) {
        self.ensure_got(symtab);
        let Target { got, rela_dyn, .. } = self;
        (got.get_or_insert_with(Got::new), rela_dyn.get_or_insert_with(RelaSection::new))
    }

    /// The GOT and the TLSDESC part of `.rela.plt`.
    pub fn got_rela_tlsdesc(&mut self, symtab: &mut SymbolTable) -> (&mut Got, &mut RelaSection) {
        self.make_plt_section(symtab);
        let Target { got, plt, .. } = self;
        (
            got.get_or_insert_with(Got::new),
            plt.get_or_insert_with(Plt::new).rela_tlsdesc_mut(),
        )
    }

    /// Create the PLT section on first demand. A static link also defines
    /// `__rela_iplt_start` / `__rela_iplt_end` around `.rela.plt` so the
    /// startup code can apply IRELATIVE relocations itself.
    pub fn make_plt_section(&mut self, symtab: &mut SymbolTable) {
        self.ensure_got(symtab);
        if self.plt.is_none() {
            self.plt = Some(Plt::new());
            if self.options.static_link {
                let start = symtab.define_predefined(
                    "__rela_iplt_start",
                    STT_NOTYPE,
                    STB_GLOBAL,
                    STV_HIDDEN,
                );
                let end = symtab.define_predefined(
                    "__rela_iplt_end",
                    STT_NOTYPE,
                    STB_GLOBAL,
                    STV_HIDDEN,
                );
                self.rela_iplt_symbols = Some((start, end));
            }
        }
    }

    // ── PLT entries ──────────────────────────────────────────────────────

    /// Create a PLT entry for a global symbol. Idempotent.
    pub fn make_plt_entry(&mut self, symtab: &mut SymbolTable, sym: SymbolId) -> Result<(), String> {
        if symtab[sym].has_plt_offset() {
            return Ok(());
        }
        self.make_plt_section(symtab);
        let Target { plt, got, .. } = self;
        let plt = plt.get_or_insert_with(Plt::new);
        let got = got.get_or_insert_with(Got::new);
        plt.add_entry(symtab, sym, got)
    }

    /// Create a PLT entry for a local STT_GNU_IFUNC symbol. Idempotent.
    pub fn make_local_ifunc_plt_entry(
        &mut self,
        symtab: &mut SymbolTable,
        object: &mut InputObject,
        obj: usize,
        r_sym: u32,
    ) -> Result<(), String> {
        if object.local_has_plt_offset(r_sym) {
            return Ok(());
        }
        self.make_plt_section(symtab);
        let Target { plt, got, .. } = self;
        let plt = plt.get_or_insert_with(Plt::new);
        let got = got.get_or_insert_with(Got::new);
        plt.add_local_ifunc_entry(object, obj, r_sym, got)?;
        Ok(())
    }

    /// Re-bind an existing PLT slot in an incremental update.
    pub fn register_global_plt_entry(
        &mut self,
        symtab: &mut SymbolTable,
        plt_index: u32,
        sym: SymbolId,
    ) {
        if let Some(plt) = self.plt.as_mut() {
            plt.register_global_entry(symtab, plt_index, sym);
        }
    }

    // ── TLS bookkeeping ──────────────────────────────────────────────────

    /// Create the reserved PLT and GOT entries for the TLS descriptor
    /// resolver. Idempotent.
    pub fn reserve_tlsdesc_entries(&mut self, symtab: &mut SymbolTable) {
        self.make_plt_section(symtab);
        let Target { plt, got, .. } = self;
        let plt = plt.get_or_insert_with(Plt::new);
        if !plt.has_tlsdesc_entry() {
            let got_offset = got.get_or_insert_with(Got::new).add_constant(0);
            plt.reserve_tlsdesc_entry(got_offset);
        }
    }

    /// The GOT entry pair for the Local-Dynamic module index, created
    /// lazily with its DTPMOD64 relocation against local symbol 0 of the
    /// requesting object.
    pub fn got_mod_index_entry(&mut self, symtab: &mut SymbolTable, obj: usize) -> u32 {
        if let Some(offset) = self.got_mod_index_offset {
            return offset;
        }
        let (got, rela_dyn) = self.got_rela_dyn(symtab);
        let offset = got.add_constant(0);
        rela_dyn.add_local(obj, 0, reloc::RelocType::DtpMod64, dynrel::RelocPlace::Got(offset), 0);
        got.add_constant(0);
        self.got_mod_index_offset = Some(offset);
        offset
    }

    pub fn got_mod_index_offset(&self) -> Option<u32> {
        self.got_mod_index_offset
    }

    /// Define `_TLS_MODULE_BASE_` in the TLS segment. Idempotent; the value
    /// is fixed at finalize (end of segment for executables, start for
    /// shared objects).
    pub fn define_tls_base_symbol(&mut self, symtab: &mut SymbolTable) {
        if self.tls_base_symbol_defined {
            return;
        }
        self.tls_base_symbol =
            Some(symtab.define_predefined("_TLS_MODULE_BASE_", STT_TLS, STB_LOCAL, STV_HIDDEN));
        self.tls_base_symbol_defined = true;
    }

    /// Record `(object, local symbol)` for a local TLSDESC relocation and
    /// return the info-table index used as its opaque addend argument.
    pub fn add_tlsdesc_info(&mut self, obj: usize, r_sym: u32) -> usize {
        self.tlsdesc_info.push(TlsdescInfo { obj, r_sym });
        self.tlsdesc_info.len() - 1
    }

    pub fn tlsdesc_info(&self) -> &[TlsdescInfo] {
        &self.tlsdesc_info
    }

    pub fn set_has_static_tls(&mut self) {
        self.has_static_tls = true;
    }

    pub fn has_static_tls(&self) -> bool {
        self.has_static_tls
    }

    // ── Dynamic symbol values ────────────────────────────────────────────

    /// The value to publish in .dynsym for a symbol that needs special
    /// treatment: a from-dynobj symbol with a PLT entry resolves to the PLT
    /// so function pointers compare equal across shared objects.
    pub fn dynsym_value_for(&self, symbol: &Symbol, layout: &LayoutView) -> Option<u64> {
        if symbol.from_dynobj && symbol.has_plt_offset() {
            Some(layout.plt_addr + symbol.plt_offset.unwrap_or(0))
        } else {
            None
        }
    }

    // ── Finalization ─────────────────────────────────────────────────────

    /// Freeze the backend: emit deferred copy relocations, contribute the
    /// dynamic tags, size `_GLOBAL_OFFSET_TABLE_`, resolve the predefined
    /// symbols, and stream the section bytes.
    pub fn finalize(
        &mut self,
        symtab: &mut SymbolTable,
        objects: &[InputObject],
        tls: Option<&TlsSegment>,
        layout: &LayoutView,
        dynamic: &mut DynamicTags,
        diag: &mut DiagnosticEngine,
    ) -> SectionImages {
        // Deferred copy relocations first: they append to .rela.dyn and the
        // tags below must see the final sizes.
        if self.copy_relocs.any_saved() {
            let Target { copy_relocs, rela_dyn, .. } = self;
            copy_relocs.emit(symtab, rela_dyn.get_or_insert_with(RelaSection::new), diag);
        }

        if self.got.is_some() {
            dynamic.add(DT_PLTGOT, layout.got_plt_addr);
        }
        if let Some(plt) = &self.plt {
            if plt.rela_plt_size() > 0 {
                dynamic.add(DT_JMPREL, layout.rela_plt_addr);
                dynamic.add(DT_PLTRELSZ, plt.rela_plt_size());
                dynamic.add(DT_PLTREL, DT_RELA as u64);
            }
            if plt.has_tlsdesc_entry() {
                dynamic.add(DT_TLSDESC_PLT, layout.plt_addr + plt.tlsdesc_plt_offset());
                if let Some(got_offset) = plt.tlsdesc_got_offset() {
                    dynamic.add(DT_TLSDESC_GOT, layout.got_addr + got_offset as u64);
                }
            }
        }
        if let Some(rela_dyn) = &self.rela_dyn {
            if rela_dyn.count() > 0 {
                dynamic.add(DT_RELA, layout.rela_dyn_addr);
                dynamic.add(DT_RELASZ, rela_dyn.data_size());
                dynamic.add(DT_RELAENT, RELA_ENTRY_SIZE);
            }
        }

        // Size _GLOBAL_OFFSET_TABLE_ to the final .got.plt size.
        if let (Some(id), Some(got)) = (self.got_symbol, &self.got) {
            symtab[id].value = layout.got_plt_addr;
            symtab[id].size = got.got_plt_size();
        }

        // __rela_iplt_start/end bracket the IRELATIVE part of .rela.plt.
        if let Some((start, end)) = self.rela_iplt_symbols {
            let rel_size = self.plt.as_ref().map(|p| p.rel().data_size()).unwrap_or(0);
            symtab[start].value = layout.rela_plt_addr;
            symtab[end].value = layout.rela_plt_addr + rel_size;
        }

        // _TLS_MODULE_BASE_ sits at the end of the TLS segment in an
        // executable and at its start in a shared object, in TLS-offset
        // terms.
        if let Some(id) = self.tls_base_symbol {
            symtab[id].value = if self.options.output_kind.is_executable() {
                tls.map(|t| t.memsz).unwrap_or(0)
            } else {
                0
            };
        }

        let mut images = SectionImages::default();
        if let Some(got) = &self.got {
            images.got = got.write(symtab, objects, layout);
            images.got_tlsdesc = got.write_tlsdesc();
        }
        match (&self.plt, &self.got) {
            (Some(plt), Some(got)) => {
                let (plt_bytes, got_plt_bytes) = plt.write(layout, got.got_plt_size());
                images.plt = plt_bytes;
                images.got_plt = got_plt_bytes;
            }
            (None, Some(got)) => {
                // No PLT: .got.plt is just the reserved header.
                let mut got_plt = vec![0u8; got.got_plt_size() as usize];
                crate::backend::elf::w64(&mut got_plt, 0, layout.dynamic_addr);
                images.got_plt = got_plt;
            }
            _ => {}
        }
        if let Some(rela_dyn) = &self.rela_dyn {
            images.rela_dyn = rela_dyn.write(symtab, objects, &self.tlsdesc_info, layout);
        }
        if let Some(plt) = &self.plt {
            // JUMP_SLOT/IRELATIVE entries first, TLSDESC entries after.
            let mut rela_plt = plt.rel().write(symtab, objects, &self.tlsdesc_info, layout);
            rela_plt.extend(plt.rela_tlsdesc().write(symtab, objects, &self.tlsdesc_info, layout));
            images.rela_plt = rela_plt;
        }
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::elf::{
        read_u32, read_u64, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_RELA, STT_FUNC,
        STT_GNU_IFUNC,
    };
    use crate::backend::linker_common::{
        Elf64Rela, LocalSymbol, OutputSectionInfo, OutputKind,
    };
    use crate::backend::x86_64::relocate::Relocator;
    use crate::backend::x86_64::scan::{scan_relocs, ScanState};

    fn text_section() -> OutputSectionInfo {
        OutputSectionInfo { id: 0, name: ".text".to_string(), flags: SHF_ALLOC | SHF_EXECINSTR }
    }

    fn data_section() -> OutputSectionInfo {
        OutputSectionInfo { id: 1, name: ".data".to_string(), flags: SHF_ALLOC | SHF_WRITE }
    }

    fn object_with_locals(locals: Vec<LocalSymbol>) -> InputObject {
        let mut object = InputObject::new("a.o");
        object.locals = locals;
        object.section_out.insert(0, (0, 0));
        object.section_out.insert(1, (1, 0));
        object
    }

    fn null_local() -> LocalSymbol {
        LocalSymbol { sym_type: 0, value: 0, shndx: 0, shndx_ordinary: true }
    }

    fn layout<'a>(section_addr: &'a [u64], section_dynsym: &'a [u32]) -> LayoutView<'a> {
        LayoutView {
            section_addr,
            section_dynsym,
            plt_addr: 0x401000,
            got_addr: 0x402000,
            got_plt_addr: 0x403000,
            got_tlsdesc_addr: 0x403800,
            rela_dyn_addr: 0x404000,
            rela_plt_addr: 0x405000,
            dynamic_addr: 0x406000,
            dynbss_addr: 0x407000,
        }
    }

    #[test]
    fn test_pc32_call_to_undefined_puts() {
        // An executable calling puts from libc: one PLT entry at offset 16,
        // one .got.plt slot at 24, one JUMP_SLOT in .rela.plt, and the call
        // field resolves to the PLT entry.
        let options = LinkOptions::default();
        let mut target = Target::new(options);
        let mut symtab = SymbolTable::new();
        let mut puts = Symbol::new_dynamic("puts", STT_FUNC, 0);
        puts.dynsym_index = Some(1);
        let puts = symtab.add(puts);
        let mut object = object_with_locals(vec![null_local()]);
        object.globals.push(puts);

        let relocs = vec![Elf64Rela { offset: 5, sym_idx: 1, rela_type: reloc::RelocType::Pc32 as u32, addend: -4 }];
        let section = text_section();
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 0, SHT_RELA, &relocs, &section,
            &mut state, &mut diag,
        )
        .unwrap();
        assert!(!diag.has_errors());

        // Scanning the same reloc again allocates nothing more.
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 0, SHT_RELA, &relocs, &section,
            &mut state, &mut diag,
        )
        .unwrap();
        let plt = target.plt().unwrap();
        assert_eq!(plt.entry_count(), 1);
        assert_eq!(symtab[puts].plt_offset, Some(16));
        assert_eq!(target.got().unwrap().got_plt_size(), 32);

        let section_addr = [0x400000u64, 0x600000];
        let section_dynsym = [0u32, 0];
        let view = layout(&section_addr, &section_dynsym);
        let mut dynamic = DynamicTags::new();
        let objects = [object];
        let images =
            target.finalize(&mut symtab, &objects, None, &view, &mut dynamic, &mut diag);

        // One JUMP_SLOT against puts, applied at the .got.plt slot.
        assert_eq!(images.rela_plt.len(), 24);
        assert_eq!(read_u64(&images.rela_plt, 0), 0x403018);
        assert_eq!(read_u32(&images.rela_plt, 8), reloc::RelocType::JumpSlot as u32);
        assert_eq!(read_u32(&images.rela_plt, 12), 1);

        // Applying the call writes plt_entry + addend - place.
        let mut bytes = vec![0u8; 16];
        let mut relocator = Relocator::new();
        relocator.relocate_section(
            &target, &symtab, &objects[0], &relocs, &section, &mut bytes, 0x400000, None,
            &view, &mut diag,
        );
        assert!(!diag.has_errors());
        let expected = (0x401010u64).wrapping_add((-4i64) as u64).wrapping_sub(0x400005);
        assert_eq!(read_u32(&bytes, 5), expected as u32);
    }

    #[test]
    fn test_abs64_local_in_pie() {
        // R_X86_64_64 at .data+0x8 against a local with value 0x100: one
        // RELATIVE entry with addend 0x100, and the word is applied in
        // place.
        let options = LinkOptions {
            output_kind: OutputKind::PositionIndependentExecutable,
            ..LinkOptions::default()
        };
        let mut target = Target::new(options);
        let mut symtab = SymbolTable::new();
        let mut object = object_with_locals(vec![
            null_local(),
            LocalSymbol { sym_type: STT_OBJECT, value: 0x100, shndx: 1, shndx_ordinary: true },
        ]);
        object.name = "pie.o".to_string();

        let relocs = vec![Elf64Rela { offset: 8, sym_idx: 1, rela_type: reloc::RelocType::Abs64 as u32, addend: 0 }];
        let section = data_section();
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 1, SHT_RELA, &relocs, &section,
            &mut state, &mut diag,
        )
        .unwrap();
        assert!(!diag.has_errors());
        assert_eq!(target.rela_dyn_section().unwrap().count(), 1);

        let section_addr = [0x1000u64, 0x3000];
        let section_dynsym = [0u32, 0];
        let view = layout(&section_addr, &section_dynsym);
        let mut dynamic = DynamicTags::new();
        let objects = [object];
        let images = target.finalize(&mut symtab, &objects, None, &view, &mut dynamic, &mut diag);

        assert_eq!(images.rela_dyn.len(), 24);
        assert_eq!(read_u64(&images.rela_dyn, 0), 0x3008); // .data + 8
        assert_eq!(read_u32(&images.rela_dyn, 8), reloc::RelocType::Relative as u32);
        assert_eq!(read_u64(&images.rela_dyn, 16), 0x100); // addend = value

        let mut bytes = vec![0u8; 16];
        let mut relocator = Relocator::new();
        relocator.relocate_section(
            &target, &symtab, &objects[0], &relocs, &section, &mut bytes, 0x3000, None, &view,
            &mut diag,
        );
        assert_eq!(read_u64(&bytes, 8), 0x100);
    }

    #[test]
    fn test_static_link_with_local_ifunc() {
        // A static link referencing a local ifunc through R_X86_64_64: one
        // PLT entry, one IRELATIVE against the .got.plt slot, and the
        // __rela_iplt symbols bracketing .rela.plt.
        let options = LinkOptions { static_link: true, ..LinkOptions::default() };
        let mut target = Target::new(options);
        let mut symtab = SymbolTable::new();
        let mut object = object_with_locals(vec![
            null_local(),
            LocalSymbol { sym_type: STT_GNU_IFUNC, value: 0x1234, shndx: 0, shndx_ordinary: true },
        ]);

        let relocs = vec![Elf64Rela { offset: 0, sym_idx: 1, rela_type: reloc::RelocType::Abs64 as u32, addend: 0 }];
        let section = data_section();
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 1, SHT_RELA, &relocs, &section,
            &mut state, &mut diag,
        )
        .unwrap();
        assert!(!diag.has_errors());

        assert_eq!(object.local_plt_offset(1), Some(16));
        let plt = target.plt().unwrap();
        assert_eq!(plt.entry_count(), 1);
        assert_eq!(plt.rel().count(), 1);
        let entry = &plt.rel().entries()[0];
        assert_eq!(entry.r_type, reloc::RelocType::IRelative);
        assert_eq!(entry.place, dynrel::RelocPlace::GotPlt(24));

        let section_addr = [0x400000u64, 0x600000];
        let section_dynsym = [0u32, 0];
        let view = layout(&section_addr, &section_dynsym);
        let mut dynamic = DynamicTags::new();
        let objects = [object];
        let images = target.finalize(&mut symtab, &objects, None, &view, &mut dynamic, &mut diag);

        // The IRELATIVE addend is the resolver's link-time address.
        assert_eq!(read_u32(&images.rela_plt, 8), reloc::RelocType::IRelative as u32);
        assert_eq!(read_u64(&images.rela_plt, 16), 0x1234);

        let start = symtab.lookup("__rela_iplt_start").unwrap();
        let end = symtab.lookup("__rela_iplt_end").unwrap();
        assert_eq!(symtab[start].value, 0x405000);
        assert_eq!(symtab[end].value, 0x405000 + 24);
    }

    #[test]
    fn test_non_pic_reported_once_per_object() {
        // Two PC16 relocations against a preemptible symbol in a shared
        // library: the loader cannot apply PC16, and the "recompile with
        // -fPIC" report appears exactly once for the object.
        let options = LinkOptions {
            output_kind: OutputKind::SharedLibrary,
            ..LinkOptions::default()
        };
        let mut target = Target::new(options);
        let mut symtab = SymbolTable::new();
        let mut var = Symbol::new_defined("var", STT_OBJECT, 0x100, 8);
        var.preemptible = true;
        var.final_value_known = false;
        let var = symtab.add(var);
        let mut object = object_with_locals(vec![null_local()]);
        object.globals.push(var);

        let relocs = vec![
            Elf64Rela { offset: 0, sym_idx: 1, rela_type: reloc::RelocType::Pc16 as u32, addend: 0 },
            Elf64Rela { offset: 8, sym_idx: 1, rela_type: reloc::RelocType::Pc16 as u32, addend: 0 },
        ];
        let section = data_section();
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 1, SHT_RELA, &relocs, &section,
            &mut state, &mut diag,
        )
        .unwrap();
        let fpic: Vec<_> = diag
            .diagnostics()
            .iter()
            .filter(|d| d.message.contains("recompile with -fPIC"))
            .collect();
        assert_eq!(fpic.len(), 1);
        // The relocations themselves were still recorded.
        assert_eq!(target.rela_dyn_section().unwrap().count(), 2);
    }

    #[test]
    fn test_rel_section_rejected() {
        let mut target = Target::new(LinkOptions::default());
        let mut symtab = SymbolTable::new();
        let mut object = object_with_locals(vec![null_local()]);
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 0, crate::backend::elf::SHT_REL, &[],
            &text_section(), &mut state, &mut diag,
        )
        .unwrap();
        assert!(diag.has_errors());
        assert!(diag.diagnostics()[0].message.contains("unsupported REL reloc section"));
    }

    #[test]
    fn test_tlsdesc_relocs_follow_jump_slots() {
        // A shared library with both a PLT call and a TLSDESC access: in
        // the concatenated .rela.plt, every TLSDESC entry's index exceeds
        // every JUMP_SLOT's.
        let options = LinkOptions {
            output_kind: OutputKind::SharedLibrary,
            ..LinkOptions::default()
        };
        let mut target = Target::new(options);
        let mut symtab = SymbolTable::new();
        let mut tls_var = Symbol::new_dynamic("tls_var", STT_TLS, 8);
        tls_var.dynsym_index = Some(2);
        let tls_var = symtab.add(tls_var);
        let mut callee = Symbol::new_dynamic("callee", STT_FUNC, 0);
        callee.dynsym_index = Some(1);
        let callee = symtab.add(callee);
        let mut object = object_with_locals(vec![null_local()]);
        object.globals.push(tls_var);
        object.globals.push(callee);

        let relocs = vec![
            // TLSDESC first in input order; it must still sort after the
            // jump slot in the output.
            Elf64Rela { offset: 4, sym_idx: 1, rela_type: reloc::RelocType::GotPc32TlsDesc as u32, addend: 0 },
            Elf64Rela { offset: 12, sym_idx: 2, rela_type: reloc::RelocType::Plt32 as u32, addend: -4 },
        ];
        let section = text_section();
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 0, SHT_RELA, &relocs, &section,
            &mut state, &mut diag,
        )
        .unwrap();
        assert!(!diag.has_errors());

        let section_addr = [0x1000u64, 0x3000];
        let section_dynsym = [0u32, 0];
        let view = layout(&section_addr, &section_dynsym);
        let mut dynamic = DynamicTags::new();
        let objects = [object];
        let images = target.finalize(&mut symtab, &objects, None, &view, &mut dynamic, &mut diag);

        assert_eq!(images.rela_plt.len(), 48);
        let first_type = read_u32(&images.rela_plt, 8);
        let second_type = read_u32(&images.rela_plt, 24 + 8);
        assert_eq!(first_type, reloc::RelocType::JumpSlot as u32);
        assert_eq!(second_type, reloc::RelocType::TlsDesc as u32);

        // The TLSDESC tags point at the reserved PLT entry and GOT slot.
        assert_eq!(
            dynamic.get(DT_TLSDESC_PLT),
            Some(view.plt_addr + target.plt().unwrap().tlsdesc_plt_offset())
        );
        assert!(dynamic.get(DT_TLSDESC_GOT).is_some());
        assert_eq!(dynamic.get(DT_PLTREL), Some(DT_RELA as u64));
        assert_eq!(dynamic.get(DT_PLTGOT), Some(view.got_plt_addr));
    }

    #[test]
    fn test_global_offset_table_symbol_sized_at_finalize() {
        let mut target = Target::new(LinkOptions::default());
        let mut symtab = SymbolTable::new();
        let mut f = Symbol::new_dynamic("f", STT_FUNC, 0);
        f.dynsym_index = Some(1);
        let f = symtab.add(f);
        target.make_plt_entry(&mut symtab, f).unwrap();

        let section_addr = [0u64];
        let section_dynsym = [0u32];
        let view = layout(&section_addr, &section_dynsym);
        let mut dynamic = DynamicTags::new();
        let mut diag = DiagnosticEngine::new();
        target.finalize(&mut symtab, &[], None, &view, &mut dynamic, &mut diag);

        let got_sym = symtab.lookup("_GLOBAL_OFFSET_TABLE_").unwrap();
        assert_eq!(symtab[got_sym].value, view.got_plt_addr);
        assert_eq!(symtab[got_sym].size, 32); // 3 reserved words + 1 slot
        assert_eq!(symtab[got_sym].binding, STB_LOCAL);
        assert_eq!(symtab[got_sym].visibility, STV_HIDDEN);
    }

    #[test]
    fn test_gd_to_le_rewrite_consumes_tls_get_addr() {
        // The full GD->LE path through the relocator: the sequence is
        // rewritten and the following __tls_get_addr call is absorbed
        // silently.
        let mut target = Target::new(LinkOptions::default());
        let mut symtab = SymbolTable::new();
        let mut tga = Symbol::new_dynamic("__tls_get_addr", STT_FUNC, 0);
        tga.dynsym_index = Some(1);
        let tga = symtab.add(tga);
        let mut object = object_with_locals(vec![
            null_local(),
            LocalSymbol { sym_type: STT_TLS, value: 8, shndx: 2, shndx_ordinary: true },
        ]);
        object.globals.push(tga);

        let relocs = vec![
            Elf64Rela { offset: 4, sym_idx: 1, rela_type: reloc::RelocType::TlsGd as u32, addend: -4 },
            Elf64Rela { offset: 12, sym_idx: 2, rela_type: reloc::RelocType::Plt32 as u32, addend: -4 },
        ];
        let section = text_section();
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 0, SHT_RELA, &relocs, &section,
            &mut state, &mut diag,
        )
        .unwrap();

        let mut bytes = vec![0u8; 20];
        bytes[0..4].copy_from_slice(&[0x66, 0x48, 0x8d, 0x3d]);
        bytes[8..12].copy_from_slice(&[0x66, 0x66, 0x48, 0xe8]);

        let section_addr = [0x400000u64, 0x600000];
        let section_dynsym = [0u32, 0];
        let view = layout(&section_addr, &section_dynsym);
        let tls = TlsSegment { memsz: 32 };
        let mut relocator = Relocator::new();
        relocator.relocate_section(
            &target, &symtab, &object, &relocs, &section, &mut bytes, 0x400000, Some(&tls),
            &view, &mut diag,
        );
        assert!(!diag.has_errors());
        assert_eq!(
            &bytes[0..16],
            &[0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, 0x48, 0x8d, 0x80, 0xe8, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_missing_tls_get_addr_is_reported() {
        // If the reloc after a GD->LE rewrite is not the __tls_get_addr
        // call, the protocol violation is reported.
        let mut target = Target::new(LinkOptions::default());
        let mut symtab = SymbolTable::new();
        let mut object = object_with_locals(vec![
            null_local(),
            LocalSymbol { sym_type: STT_TLS, value: 8, shndx: 2, shndx_ordinary: true },
            LocalSymbol { sym_type: STT_OBJECT, value: 0, shndx: 1, shndx_ordinary: true },
        ]);

        let relocs = vec![
            Elf64Rela { offset: 4, sym_idx: 1, rela_type: reloc::RelocType::TlsGd as u32, addend: -4 },
            Elf64Rela { offset: 16, sym_idx: 2, rela_type: reloc::RelocType::Abs32 as u32, addend: 0 },
        ];
        let section = text_section();
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 0, SHT_RELA, &relocs, &section,
            &mut state, &mut diag,
        )
        .unwrap();
        assert!(!diag.has_errors());

        let mut bytes = vec![0u8; 24];
        bytes[0..4].copy_from_slice(&[0x66, 0x48, 0x8d, 0x3d]);
        bytes[8..12].copy_from_slice(&[0x66, 0x66, 0x48, 0xe8]);

        let section_addr = [0x400000u64, 0x600000];
        let section_dynsym = [0u32, 0];
        let view = layout(&section_addr, &section_dynsym);
        let tls = TlsSegment { memsz: 32 };
        let mut relocator = Relocator::new();
        relocator.relocate_section(
            &target, &symtab, &object, &relocs, &section, &mut bytes, 0x400000, Some(&tls),
            &view, &mut diag,
        );
        assert!(diag
            .diagnostics()
            .iter()
            .any(|d| d.message.contains("missing expected TLS relocation")));
    }

    #[test]
    fn test_ie_to_le_through_relocator() {
        // GOTTPOFF against a link-time-final TLS symbol in an executable:
        // the movq is rewritten to an immediate load of value - memsz.
        let mut target = Target::new(LinkOptions::default());
        let mut symtab = SymbolTable::new();
        let mut tls_var = Symbol::new_defined("tls_var", STT_TLS, 0x10, 8);
        tls_var.final_value_known = true;
        let tls_var = symtab.add(tls_var);
        let mut object = object_with_locals(vec![null_local()]);
        object.globals.push(tls_var);

        let relocs = vec![Elf64Rela { offset: 3, sym_idx: 1, rela_type: reloc::RelocType::GotTpOff as u32, addend: -4 }];
        let section = text_section();
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 0, SHT_RELA, &relocs, &section,
            &mut state, &mut diag,
        )
        .unwrap();
        // IE->LE allocates no GOT slot.
        assert!(target.got().is_none());

        let mut bytes = vec![0u8; 8];
        bytes[0..3].copy_from_slice(&[0x48, 0x8b, 0x05]);
        let section_addr = [0x400000u64, 0x600000];
        let section_dynsym = [0u32, 0];
        let view = layout(&section_addr, &section_dynsym);
        let tls = TlsSegment { memsz: 0x40 };
        let mut relocator = Relocator::new();
        relocator.relocate_section(
            &target, &symtab, &object, &relocs, &section, &mut bytes, 0x400000, Some(&tls),
            &view, &mut diag,
        );
        assert!(!diag.has_errors());
        assert_eq!(&bytes[0..7], &[0x48, 0xc7, 0xc0, 0xd0, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_tpoff32_in_shared_is_reported() {
        let options = LinkOptions {
            output_kind: OutputKind::SharedLibrary,
            ..LinkOptions::default()
        };
        let mut target = Target::new(options);
        let mut symtab = SymbolTable::new();
        let mut object = object_with_locals(vec![
            null_local(),
            LocalSymbol { sym_type: STT_TLS, value: 0, shndx: 2, shndx_ordinary: true },
        ]);
        let relocs = vec![Elf64Rela { offset: 0, sym_idx: 1, rela_type: reloc::RelocType::TpOff32 as u32, addend: 0 }];
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 0, SHT_RELA, &relocs, &text_section(),
            &mut state, &mut diag,
        )
        .unwrap();
        assert!(diag.has_errors());
        assert!(target.has_static_tls());
    }

    #[test]
    fn test_copy_reloc_deferral_through_finalize() {
        // An executable referencing a dynamic data symbol directly: the
        // candidate becomes a COPY reloc and a reservation at finalize.
        let mut target = Target::new(LinkOptions::default());
        let mut symtab = SymbolTable::new();
        let mut environ = Symbol::new_dynamic("environ", STT_OBJECT, 8);
        environ.alignment = 8;
        environ.dynsym_index = Some(1);
        let environ = symtab.add(environ);
        let mut object = object_with_locals(vec![null_local()]);
        object.globals.push(environ);

        let relocs = vec![Elf64Rela { offset: 0x10, sym_idx: 1, rela_type: reloc::RelocType::Abs64 as u32, addend: 0 }];
        let mut state = ScanState::new();
        let mut diag = DiagnosticEngine::new();
        scan_relocs(
            &mut target, &mut symtab, &mut object, 0, 1, SHT_RELA, &relocs, &data_section(),
            &mut state, &mut diag,
        )
        .unwrap();
        assert!(target.copy_relocs.any_saved());

        let section_addr = [0x1000u64, 0x3000];
        let section_dynsym = [0u32, 0];
        let view = layout(&section_addr, &section_dynsym);
        let mut dynamic = DynamicTags::new();
        let objects = [object];
        let images = target.finalize(&mut symtab, &objects, None, &view, &mut dynamic, &mut diag);

        assert_eq!(target.copy_relocs.reserved_size(), 8);
        assert_eq!(read_u32(&images.rela_dyn, 8), reloc::RelocType::Copy as u32);
        assert_eq!(read_u64(&images.rela_dyn, 0), view.dynbss_addr);
        assert_eq!(dynamic.get(DT_RELASZ), Some(24));
    }
}
