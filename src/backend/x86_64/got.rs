//! The GOT sections: `.got`, `.got.plt`, and `.got.tlsdesc`.
//!
//! `.got` holds per-symbol data and TLS slots and is read-only after
//! relocation (RELRO). `.got.plt` starts with the three reserved words the
//! lazy PLT resolver uses and then one slot per PLT entry; its contents are
//! produced together with the PLT bytes. `.got.tlsdesc` trails `.got.plt`
//! and holds the descriptor pairs the TLSDESC trampoline resolves lazily.
//!
//! Slot assignment is idempotent per `(symbol, kind)`: the offset is
//! recorded on the symbol (or in the object's local-offset map) the first
//! time and handed back unchanged afterwards.

use crate::backend::elf::w64;
use crate::backend::linker_common::{InputObject, LayoutView, SymbolId, SymbolTable};
use crate::backend::x86_64::dynrel::{RelaSection, RelocPlace};
use crate::backend::x86_64::reloc::RelocType;

/// The kinds of GOT entries this target uses. The discriminants are exposed
/// to the incremental-link format; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GotEntryKind {
    /// GOT entry for a regular symbol.
    Standard = 0,
    /// GOT entry for a TP-relative TLS offset.
    TlsOffset = 1,
    /// GOT entry pair for a TLS module index / dtv offset.
    TlsPair = 2,
    /// GOT entry pair for a TLS descriptor.
    TlsDesc = 3,
}

impl GotEntryKind {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<GotEntryKind> {
        match value {
            0 => Some(GotEntryKind::Standard),
            1 => Some(GotEntryKind::TlsOffset),
            2 => Some(GotEntryKind::TlsPair),
            3 => Some(GotEntryKind::TlsDesc),
            _ => None,
        }
    }
}

/// What a `.got` slot holds at link time. Slots covered by dynamic
/// relocations stay `Constant(0)` for the loader to fill.
#[derive(Debug, Clone, Copy)]
enum GotEntry {
    Constant(u64),
    /// The symbol's link-time value.
    Global(SymbolId),
    /// The symbol's PLT address (ifunc pointer identity).
    GlobalPlt(SymbolId),
    /// A local symbol's link-time value.
    Local { obj: usize, r_sym: u32 },
    /// A local symbol's PLT address.
    LocalPlt { obj: usize, r_sym: u32 },
}

const GOT_ENTRY_SIZE: u64 = 8;
/// The three reserved words at the start of `.got.plt`: the dynamic
/// structure pointer, the link-map slot, and the resolver slot.
pub const GOT_PLT_RESERVED: u64 = 3 * GOT_ENTRY_SIZE;

/// The GOT manager.
#[derive(Debug)]
pub struct Got {
    entries: Vec<GotEntry>,
    tlsdesc_entries: Vec<GotEntry>,
    got_plt_size: u64,
}

impl Got {
    pub fn new() -> Self {
        Got { entries: Vec::new(), tlsdesc_entries: Vec::new(), got_plt_size: GOT_PLT_RESERVED }
    }

    /// Pre-sized `.got` for an incremental update: `got_count` slots that
    /// `reserve_*_entry` rebinds in place.
    pub fn new_for_update(got_count: usize, plt_count: usize) -> Self {
        Got {
            entries: vec![GotEntry::Constant(0); got_count],
            tlsdesc_entries: Vec::new(),
            got_plt_size: (plt_count as u64 + 3) * GOT_ENTRY_SIZE,
        }
    }

    pub fn data_size(&self) -> u64 {
        self.entries.len() as u64 * GOT_ENTRY_SIZE
    }

    pub fn got_plt_size(&self) -> u64 {
        self.got_plt_size
    }

    pub fn tlsdesc_size(&self) -> u64 {
        self.tlsdesc_entries.len() as u64 * GOT_ENTRY_SIZE
    }

    /// Extend `.got.plt` by one slot, returning the new slot's offset.
    pub fn extend_got_plt(&mut self) -> u32 {
        let offset = self.got_plt_size;
        self.got_plt_size += GOT_ENTRY_SIZE;
        offset as u32
    }

    /// Append a constant `.got` entry, returning its offset.
    pub fn add_constant(&mut self, value: u64) -> u32 {
        let offset = self.data_size();
        self.entries.push(GotEntry::Constant(value));
        offset as u32
    }

    fn push(&mut self, entry: GotEntry) -> u32 {
        let offset = self.data_size();
        self.entries.push(entry);
        offset as u32
    }

    /// Reserve a `.got` slot for a global symbol. Returns true if the slot
    /// is new.
    pub fn add_global(&mut self, symtab: &mut SymbolTable, sym: SymbolId, kind: GotEntryKind) -> bool {
        if symtab[sym].has_got_offset(kind.as_u32()) {
            return false;
        }
        let offset = self.push(GotEntry::Global(sym));
        symtab[sym].set_got_offset(kind.as_u32(), offset);
        true
    }

    /// Reserve a `.got` slot whose initial value is the symbol's PLT
    /// address. Returns true if the slot is new.
    pub fn add_global_plt(&mut self, symtab: &mut SymbolTable, sym: SymbolId, kind: GotEntryKind) -> bool {
        if symtab[sym].has_got_offset(kind.as_u32()) {
            return false;
        }
        let offset = self.push(GotEntry::GlobalPlt(sym));
        symtab[sym].set_got_offset(kind.as_u32(), offset);
        true
    }

    /// Reserve a `.got` slot for a global together with its dynamic
    /// relocation.
    pub fn add_global_with_rela(
        &mut self,
        symtab: &mut SymbolTable,
        sym: SymbolId,
        kind: GotEntryKind,
        rela_dyn: &mut RelaSection,
        r_type: RelocType,
    ) {
        if symtab[sym].has_got_offset(kind.as_u32()) {
            return;
        }
        let offset = self.push(GotEntry::Constant(0));
        symtab[sym].set_got_offset(kind.as_u32(), offset);
        rela_dyn.add_global(sym, r_type, RelocPlace::Got(offset), 0);
    }

    /// Reserve two consecutive `.got` slots for a global with a dynamic
    /// relocation on each (module index / dtv offset).
    pub fn add_global_pair_with_rela(
        &mut self,
        symtab: &mut SymbolTable,
        sym: SymbolId,
        kind: GotEntryKind,
        rela_dyn: &mut RelaSection,
        r_type_1: RelocType,
        r_type_2: RelocType,
    ) {
        if symtab[sym].has_got_offset(kind.as_u32()) {
            return;
        }
        let offset = self.push(GotEntry::Constant(0));
        self.push(GotEntry::Constant(0));
        symtab[sym].set_got_offset(kind.as_u32(), offset);
        rela_dyn.add_global(sym, r_type_1, RelocPlace::Got(offset), 0);
        rela_dyn.add_global(sym, r_type_2, RelocPlace::Got(offset + 8), 0);
    }

    /// Reserve a `.got` slot for a local symbol. Returns true if new.
    pub fn add_local(
        &mut self,
        object: &mut InputObject,
        obj: usize,
        r_sym: u32,
        kind: GotEntryKind,
    ) -> bool {
        if object.local_has_got_offset(r_sym, kind.as_u32()) {
            return false;
        }
        let offset = self.push(GotEntry::Local { obj, r_sym });
        object.set_local_got_offset(r_sym, kind.as_u32(), offset);
        true
    }

    /// Reserve a `.got` slot holding a local ifunc's PLT address.
    pub fn add_local_plt(
        &mut self,
        object: &mut InputObject,
        obj: usize,
        r_sym: u32,
        kind: GotEntryKind,
    ) -> bool {
        if object.local_has_got_offset(r_sym, kind.as_u32()) {
            return false;
        }
        let offset = self.push(GotEntry::LocalPlt { obj, r_sym });
        object.set_local_got_offset(r_sym, kind.as_u32(), offset);
        true
    }

    /// Reserve a `.got` slot for a local together with its dynamic
    /// relocation.
    pub fn add_local_with_rela(
        &mut self,
        object: &mut InputObject,
        obj: usize,
        r_sym: u32,
        kind: GotEntryKind,
        rela_dyn: &mut RelaSection,
        r_type: RelocType,
    ) {
        if object.local_has_got_offset(r_sym, kind.as_u32()) {
            return;
        }
        let offset = self.push(GotEntry::Constant(0));
        object.set_local_got_offset(r_sym, kind.as_u32(), offset);
        rela_dyn.add_local(obj, r_sym, r_type, RelocPlace::Got(offset), 0);
    }

    /// Reserve a module-index / dtv-offset pair for a local symbol: a
    /// dynamic relocation fills the module index, the dtv offset is the
    /// symbol's link-time TLS offset.
    pub fn add_local_pair_with_rela(
        &mut self,
        object: &mut InputObject,
        obj: usize,
        r_sym: u32,
        kind: GotEntryKind,
        rela_dyn: &mut RelaSection,
        r_type: RelocType,
    ) {
        if object.local_has_got_offset(r_sym, kind.as_u32()) {
            return;
        }
        let offset = self.push(GotEntry::Constant(0));
        self.push(GotEntry::Local { obj, r_sym });
        object.set_local_got_offset(r_sym, kind.as_u32(), offset);
        rela_dyn.add_local(obj, r_sym, r_type, RelocPlace::Got(offset), 0);
    }

    /// Reserve a TLS descriptor pair in `.got.tlsdesc` for a global, with
    /// its lazily-resolved relocation in the TLSDESC part of `.rela.plt`.
    pub fn add_tlsdesc_global_pair(
        &mut self,
        symtab: &mut SymbolTable,
        sym: SymbolId,
        rela_tlsdesc: &mut RelaSection,
    ) {
        if symtab[sym].has_got_offset(GotEntryKind::TlsDesc.as_u32()) {
            return;
        }
        let offset = self.tlsdesc_size() as u32;
        self.tlsdesc_entries.push(GotEntry::Constant(0));
        self.tlsdesc_entries.push(GotEntry::Constant(0));
        symtab[sym].set_got_offset(GotEntryKind::TlsDesc.as_u32(), offset);
        rela_tlsdesc.add_global(sym, RelocType::TlsDesc, RelocPlace::GotTlsdesc(offset), 0);
    }

    /// Reserve a TLS descriptor pair for a local symbol; the relocation's
    /// addend is resolved through the TLSDESC info table.
    pub fn add_tlsdesc_local_pair(
        &mut self,
        object: &mut InputObject,
        r_sym: u32,
        tlsdesc_index: usize,
        rela_tlsdesc: &mut RelaSection,
    ) {
        if object.local_has_got_offset(r_sym, GotEntryKind::TlsDesc.as_u32()) {
            return;
        }
        let offset = self.tlsdesc_size() as u32;
        self.tlsdesc_entries.push(GotEntry::Constant(0));
        self.tlsdesc_entries.push(GotEntry::Constant(0));
        object.set_local_got_offset(r_sym, GotEntryKind::TlsDesc.as_u32(), offset);
        rela_tlsdesc.add_target_specific(tlsdesc_index, RelocPlace::GotTlsdesc(offset), 0);
    }

    /// Rebind a pre-sized `.got` slot to a local symbol in an incremental
    /// update, regenerating the dynamic relocations the slot needs.
    pub fn reserve_local_entry(
        &mut self,
        object: &mut InputObject,
        obj: usize,
        r_sym: u32,
        kind: GotEntryKind,
        got_index: u32,
        position_independent: bool,
        rela_dyn: &mut RelaSection,
    ) -> Result<(), String> {
        let offset = got_index * GOT_ENTRY_SIZE as u32;
        object.set_local_got_offset(r_sym, kind.as_u32(), offset);
        match kind {
            GotEntryKind::Standard => {
                self.set_entry(got_index, GotEntry::Local { obj, r_sym });
                if position_independent {
                    rela_dyn.add_local_relative(obj, r_sym, RelocType::Relative, RelocPlace::Got(offset), 0);
                }
            }
            GotEntryKind::TlsOffset => {
                self.set_entry(got_index, GotEntry::Constant(0));
                rela_dyn.add_local(obj, r_sym, RelocType::TpOff64, RelocPlace::Got(offset), 0);
            }
            GotEntryKind::TlsPair => {
                self.set_entry(got_index, GotEntry::Constant(0));
                self.set_entry(got_index + 1, GotEntry::Local { obj, r_sym });
                rela_dyn.add_local(obj, r_sym, RelocType::DtpMod64, RelocPlace::Got(offset), 0);
            }
            GotEntryKind::TlsDesc => {
                return Err("TLS_DESC not yet supported for incremental linking".to_string());
            }
        }
        Ok(())
    }

    /// Rebind a pre-sized `.got` slot to a global symbol in an incremental
    /// update.
    pub fn reserve_global_entry(
        &mut self,
        symtab: &mut SymbolTable,
        sym: SymbolId,
        kind: GotEntryKind,
        got_index: u32,
        position_independent: bool,
        rela_dyn: &mut RelaSection,
    ) -> Result<(), String> {
        let offset = got_index * GOT_ENTRY_SIZE as u32;
        symtab[sym].set_got_offset(kind.as_u32(), offset);
        match kind {
            GotEntryKind::Standard => {
                if symtab[sym].final_value_known {
                    self.set_entry(got_index, GotEntry::Global(sym));
                } else if symtab[sym].from_dynobj
                    || symtab[sym].is_undefined()
                    || symtab[sym].preemptible
                    || symtab[sym].is_ifunc()
                {
                    self.set_entry(got_index, GotEntry::Constant(0));
                    rela_dyn.add_global(sym, RelocType::GlobDat, RelocPlace::Got(offset), 0);
                } else {
                    self.set_entry(got_index, GotEntry::Global(sym));
                    if position_independent {
                        rela_dyn.add_global_relative(sym, RelocType::Relative, RelocPlace::Got(offset), 0);
                    }
                }
            }
            GotEntryKind::TlsOffset => {
                self.set_entry(got_index, GotEntry::Constant(0));
                rela_dyn.add_global(sym, RelocType::TpOff64, RelocPlace::Got(offset), 0);
            }
            GotEntryKind::TlsPair => {
                self.set_entry(got_index, GotEntry::Constant(0));
                self.set_entry(got_index + 1, GotEntry::Constant(0));
                rela_dyn.add_global(sym, RelocType::DtpMod64, RelocPlace::Got(offset), 0);
                rela_dyn.add_global(sym, RelocType::DtpOff64, RelocPlace::Got(offset + 8), 0);
            }
            GotEntryKind::TlsDesc => {
                return Err("TLS_DESC not yet supported for incremental linking".to_string());
            }
        }
        Ok(())
    }

    fn set_entry(&mut self, index: u32, entry: GotEntry) {
        if let Some(slot) = self.entries.get_mut(index as usize) {
            *slot = entry;
        }
    }

    /// Produce the `.got` bytes with link-time initial values.
    pub fn write(
        &self,
        symtab: &SymbolTable,
        objects: &[InputObject],
        layout: &LayoutView,
    ) -> Vec<u8> {
        let mut out = vec![0u8; self.entries.len() * GOT_ENTRY_SIZE as usize];
        for (i, entry) in self.entries.iter().enumerate() {
            let value = match *entry {
                GotEntry::Constant(v) => v,
                GotEntry::Global(id) => symtab[id].value,
                GotEntry::GlobalPlt(id) => {
                    layout.plt_addr + symtab[id].plt_offset.unwrap_or(0)
                }
                GotEntry::Local { obj, r_sym } => objects
                    .get(obj)
                    .and_then(|o| o.local(r_sym))
                    .map(|l| l.value)
                    .unwrap_or(0),
                GotEntry::LocalPlt { obj, r_sym } => {
                    let plt_offset = objects
                        .get(obj)
                        .and_then(|o| o.local_plt_offset(r_sym))
                        .unwrap_or(0);
                    layout.plt_addr + plt_offset
                }
            };
            w64(&mut out, i * GOT_ENTRY_SIZE as usize, value);
        }
        out
    }

    /// Produce the `.got.tlsdesc` bytes. Every descriptor pair is resolved
    /// lazily, so the image is zero-filled.
    pub fn write_tlsdesc(&self) -> Vec<u8> {
        vec![0u8; self.tlsdesc_entries.len() * GOT_ENTRY_SIZE as usize]
    }
}

impl Default for Got {
    fn default() -> Self {
        Got::new()
    }
}
