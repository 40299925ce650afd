//! Shared linker-side data model consumed by the target backends.
//!
//! The symbol table's resolution algorithm, input-file parsing, section
//! layout, and output writing belong to the driver; the backend only sees
//! the views defined here:
//!
//! - **`Elf64Rela`**: one input relocation record (RELA only on x86-64).
//! - **`Symbol` / `SymbolTable`**: the resolved-global view, including the
//!   mutable fields the backend populates (PLT offset, per-kind GOT offsets,
//!   dynamic-symbol flags).
//! - **`InputObject` / `LocalSymbol`**: per-object local-symbol views plus
//!   the local GOT/PLT offset maps.
//! - **`LinkOptions`**: the driver-parsed configuration the backend consults.
//! - **`LayoutView` / `DynamicTags` / `TlsSegment`**: frozen layout facts
//!   handed to the backend for finalization and relocation.

use std::collections::HashMap;

use crate::backend::elf::{STB_WEAK, STT_FUNC, STT_GNU_IFUNC, STT_SECTION, STT_TLS};

// ── Input relocation record ──────────────────────────────────────────────

/// Parsed ELF64 relocation with addend (RELA).
#[derive(Debug, Clone)]
pub struct Elf64Rela {
    pub offset: u64,
    pub sym_idx: u32,
    pub rela_type: u32,
    pub addend: i64,
}

// ── Link configuration ───────────────────────────────────────────────────

/// What kind of output file the driver is producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Executable,
    PositionIndependentExecutable,
    SharedLibrary,
}

impl OutputKind {
    pub fn is_shared(self) -> bool {
        self == OutputKind::SharedLibrary
    }

    pub fn is_executable(self) -> bool {
        !self.is_shared()
    }

    pub fn is_position_independent(self) -> bool {
        self != OutputKind::Executable
    }
}

/// Driver-parsed options the backend consults. Mirrors the subset of the
/// command line that changes backend behavior.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub output_kind: OutputKind,
    /// -static: no dynamic linker at runtime.
    pub static_link: bool,
    /// --incremental: the PLT/GOT are pre-sized and patched in place.
    pub incremental_update: bool,
    /// -z nocopyreloc turns this off.
    pub emit_copy_relocs: bool,
    /// --split-stack-adjust-size (bytes added to non-split prologues).
    pub split_stack_adjust_size: u32,
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions {
            output_kind: OutputKind::Executable,
            static_link: false,
            incremental_update: false,
            emit_copy_relocs: true,
            split_stack_adjust_size: 0x4000,
        }
    }
}

// ── Resolved global symbols ──────────────────────────────────────────────

pub type SymbolId = usize;

/// A resolved global symbol as the backend sees it.
///
/// The resolution fields (`defined`, `from_dynobj`, `preemptible`,
/// `final_value_known`) are set by the symbol-resolution phase before the
/// scan; the backend only reads them. The PLT/GOT fields are written by the
/// backend, once per symbol, guarded by the `has_*` idempotence checks.
///
/// For `STT_TLS` symbols `value` is the offset within the TLS segment.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub sym_type: u8,
    pub binding: u8,
    pub visibility: u8,
    pub value: u64,
    pub size: u64,
    pub alignment: u64,
    pub defined: bool,
    pub from_dynobj: bool,
    pub preemptible: bool,
    pub final_value_known: bool,

    pub plt_offset: Option<u64>,
    got_offsets: Vec<(u32, u32)>,
    pub needs_dynsym_entry: bool,
    /// The dynamic symbol table entry must hold the PLT address rather than
    /// the symbol value (function-pointer identity across DSOs).
    pub needs_dynsym_value: bool,
    /// Index in .dynsym, assigned by the driver before reloc emission.
    pub dynsym_index: Option<u32>,
}

impl Symbol {
    pub fn new_defined(name: &str, sym_type: u8, value: u64, size: u64) -> Self {
        Symbol {
            name: name.to_string(),
            sym_type,
            binding: crate::backend::elf::STB_GLOBAL,
            visibility: crate::backend::elf::STV_DEFAULT,
            value,
            size,
            alignment: 1,
            defined: true,
            from_dynobj: false,
            preemptible: false,
            final_value_known: true,
            plt_offset: None,
            got_offsets: Vec::new(),
            needs_dynsym_entry: false,
            needs_dynsym_value: false,
            dynsym_index: None,
        }
    }

    pub fn new_undefined(name: &str) -> Self {
        Symbol {
            defined: false,
            final_value_known: false,
            value: 0,
            size: 0,
            ..Symbol::new_defined(name, crate::backend::elf::STT_NOTYPE, 0, 0)
        }
    }

    pub fn new_dynamic(name: &str, sym_type: u8, size: u64) -> Self {
        Symbol {
            defined: false,
            from_dynobj: true,
            final_value_known: false,
            ..Symbol::new_defined(name, sym_type, 0, size)
        }
    }

    pub fn is_undefined(&self) -> bool {
        !self.defined && !self.from_dynobj
    }

    pub fn is_weak_undefined(&self) -> bool {
        self.is_undefined() && self.binding == STB_WEAK
    }

    pub fn is_func(&self) -> bool {
        self.sym_type == STT_FUNC || self.sym_type == STT_GNU_IFUNC
    }

    pub fn is_ifunc(&self) -> bool {
        self.sym_type == STT_GNU_IFUNC
    }

    pub fn is_tls(&self) -> bool {
        self.sym_type == STT_TLS
    }

    pub fn has_plt_offset(&self) -> bool {
        self.plt_offset.is_some()
    }

    pub fn set_plt_offset(&mut self, offset: u64) {
        self.plt_offset = Some(offset);
    }

    pub fn has_got_offset(&self, kind: u32) -> bool {
        self.got_offsets.iter().any(|&(k, _)| k == kind)
    }

    pub fn got_offset(&self, kind: u32) -> Option<u32> {
        self.got_offsets.iter().find(|&&(k, _)| k == kind).map(|&(_, off)| off)
    }

    pub fn set_got_offset(&mut self, kind: u32, offset: u32) {
        if !self.has_got_offset(kind) {
            self.got_offsets.push((kind, offset));
        }
    }

    /// Whether a call through this symbol must go through the PLT.
    pub fn needs_plt_entry(&self, options: &LinkOptions) -> bool {
        // An ifunc always resolves through a PLT entry, even statically.
        if self.is_ifunc() {
            return true;
        }
        if options.static_link {
            return false;
        }
        self.is_func() && (self.from_dynobj || self.is_undefined() || self.preemptible)
    }

    /// Whether a reference with the given flags (see the backend's
    /// relocation catalog) requires a dynamic relocation.
    pub fn needs_dynamic_reloc(&self, options: &LinkOptions, flags: u32) -> bool {
        if options.static_link {
            return false;
        }
        // An undefined reference from an executable resolves statically to 0.
        if self.is_undefined() && !options.output_kind.is_shared() {
            return false;
        }
        if (flags & reference::ABSOLUTE != 0) && options.output_kind.is_position_independent() {
            return true;
        }
        // A function call that lands on a local PLT entry is static.
        if (flags & reference::FUNCTION_CALL != 0) && self.has_plt_offset() {
            return false;
        }
        if !options.output_kind.is_position_independent() && self.has_plt_offset() {
            return false;
        }
        self.from_dynobj || self.is_undefined() || self.preemptible
    }

    /// Whether the relocated value should be the symbol's PLT address.
    pub fn use_plt_offset(&self, options: &LinkOptions, flags: u32) -> bool {
        if !self.has_plt_offset() {
            return false;
        }
        if self.is_ifunc() {
            return true;
        }
        if self.needs_dynamic_reloc(options, flags) {
            return false;
        }
        if self.from_dynobj {
            return true;
        }
        if options.output_kind.is_shared() && (self.is_undefined() || self.preemptible) {
            return true;
        }
        // A call to a weak undefined symbol may be satisfied by a library
        // loaded at runtime.
        (flags & reference::FUNCTION_CALL != 0) && self.is_weak_undefined()
    }

    /// Whether a direct data reference to this symbol may be satisfied by a
    /// COPY relocation instead of a dynamic relocation.
    pub fn may_need_copy_reloc(&self, options: &LinkOptions) -> bool {
        !options.output_kind.is_position_independent()
            && options.emit_copy_relocs
            && self.from_dynobj
            && self.sym_type != STT_FUNC
    }

    /// Whether a RELATIVE relocation can be used for this symbol.
    pub fn can_use_relative_reloc(&self, is_function_call: bool) -> bool {
        if is_function_call && self.has_plt_offset() {
            return true;
        }
        !(self.from_dynobj || self.preemptible)
    }
}

/// Reference-flag bits describing how a relocation uses its symbol. The
/// backend's relocation catalog maps each relocation type to a combination
/// of these; `Symbol::needs_dynamic_reloc` consumes them.
pub mod reference {
    pub const ABSOLUTE: u32 = 1;
    pub const RELATIVE: u32 = 2;
    pub const TLS: u32 = 4;
    pub const FUNCTION_CALL: u32 = 8;
}

/// The resolved-symbol table view. Resolution happens before the backend
/// runs; the backend only appends its own predefined symbols and mutates
/// per-symbol backend fields.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable { symbols: Vec::new() }
    }

    pub fn add(&mut self, symbol: Symbol) -> SymbolId {
        self.symbols.push(symbol);
        self.symbols.len() - 1
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.symbols.iter().position(|s| s.name == name)
    }

    /// Define a linker-provided symbol. Its value is filled in at finalize
    /// time, once addresses are frozen.
    pub fn define_predefined(&mut self, name: &str, sym_type: u8, binding: u8, visibility: u8) -> SymbolId {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        let mut sym = Symbol::new_defined(name, sym_type, 0, 0);
        sym.binding = binding;
        sym.visibility = visibility;
        self.add(sym)
    }
}

impl std::ops::Index<SymbolId> for SymbolTable {
    type Output = Symbol;
    fn index(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }
}

impl std::ops::IndexMut<SymbolId> for SymbolTable {
    fn index_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }
}

// ── Input objects ────────────────────────────────────────────────────────

/// A local symbol as the backend sees it. For `STT_TLS` locals `value` is
/// the offset within the TLS segment.
#[derive(Debug, Clone)]
pub struct LocalSymbol {
    pub sym_type: u8,
    pub value: u64,
    pub shndx: u16,
    /// False when `shndx` is an escape value that could not be mapped back
    /// to an ordinary section (bad input).
    pub shndx_ordinary: bool,
}

impl LocalSymbol {
    pub fn is_ifunc(&self) -> bool {
        self.sym_type == STT_GNU_IFUNC
    }

    pub fn is_tls(&self) -> bool {
        self.sym_type == STT_TLS
    }

    pub fn is_section(&self) -> bool {
        self.sym_type == STT_SECTION
    }
}

/// Per-object state: the local symbol views, the mapping from the object's
/// relocation symbol indices to the resolved global table, and the local
/// GOT/PLT offsets the backend assigns.
#[derive(Debug, Default)]
pub struct InputObject {
    pub name: String,
    pub locals: Vec<LocalSymbol>,
    /// Resolved ids for symbol indices >= locals.len(), in order.
    pub globals: Vec<SymbolId>,
    /// Input section index -> (output section id, offset within it).
    pub section_out: HashMap<usize, (usize, u64)>,
    /// Local symbol index -> .dynsym index, for locals that need dynamic
    /// relocations carrying a symbol reference.
    pub local_dynsym_indexes: HashMap<u32, u32>,
    /// The object was compiled without split-stack support markers.
    pub has_no_split_stack: bool,

    local_got_offsets: HashMap<(u32, u32), u32>,
    local_plt_offsets: HashMap<u32, u64>,
}

impl InputObject {
    pub fn new(name: &str) -> Self {
        InputObject { name: name.to_string(), ..Default::default() }
    }

    pub fn local_symbol_count(&self) -> u32 {
        self.locals.len() as u32
    }

    pub fn local(&self, r_sym: u32) -> Option<&LocalSymbol> {
        self.locals.get(r_sym as usize)
    }

    /// Resolved global id for a relocation symbol index, if it refers past
    /// the locals.
    pub fn global_id(&self, r_sym: u32) -> Option<SymbolId> {
        let idx = (r_sym as usize).checked_sub(self.locals.len())?;
        self.globals.get(idx).copied()
    }

    pub fn local_has_got_offset(&self, r_sym: u32, kind: u32) -> bool {
        self.local_got_offsets.contains_key(&(r_sym, kind))
    }

    pub fn local_got_offset(&self, r_sym: u32, kind: u32) -> Option<u32> {
        self.local_got_offsets.get(&(r_sym, kind)).copied()
    }

    pub fn set_local_got_offset(&mut self, r_sym: u32, kind: u32, offset: u32) {
        self.local_got_offsets.entry((r_sym, kind)).or_insert(offset);
    }

    pub fn local_has_plt_offset(&self, r_sym: u32) -> bool {
        self.local_plt_offsets.contains_key(&r_sym)
    }

    pub fn local_plt_offset(&self, r_sym: u32) -> Option<u64> {
        self.local_plt_offsets.get(&r_sym).copied()
    }

    pub fn set_local_plt_offset(&mut self, r_sym: u32, offset: u64) {
        self.local_plt_offsets.entry(r_sym).or_insert(offset);
    }

    pub fn output_section_of(&self, shndx: usize) -> Option<(usize, u64)> {
        self.section_out.get(&shndx).copied()
    }
}

// ── Output-side views ────────────────────────────────────────────────────

/// Identity and flags of the output section a relocation applies to.
#[derive(Debug, Clone)]
pub struct OutputSectionInfo {
    pub id: usize,
    pub name: String,
    pub flags: u64,
}

/// The TLS segment, as laid out by the driver.
#[derive(Debug, Clone, Copy)]
pub struct TlsSegment {
    pub memsz: u64,
}

/// Append-only list of dynamic-section entries the backend contributes.
#[derive(Debug, Default)]
pub struct DynamicTags {
    pub entries: Vec<(i64, u64)>,
}

impl DynamicTags {
    pub fn new() -> Self {
        DynamicTags { entries: Vec::new() }
    }

    pub fn add(&mut self, tag: i64, value: u64) {
        self.entries.push((tag, value));
    }

    pub fn get(&self, tag: i64) -> Option<u64> {
        self.entries.iter().find(|&&(t, _)| t == tag).map(|&(_, v)| v)
    }
}

/// Frozen addresses the backend needs once layout is done: where its own
/// sections landed plus the address of every output section it may have
/// recorded relocations against.
#[derive(Debug, Clone, Default)]
pub struct LayoutView<'a> {
    /// Output section id -> virtual address.
    pub section_addr: &'a [u64],
    /// Output section id -> .dynsym index of the section symbol (used by
    /// section-relative dynamic relocations).
    pub section_dynsym: &'a [u32],
    pub plt_addr: u64,
    pub got_addr: u64,
    pub got_plt_addr: u64,
    pub got_tlsdesc_addr: u64,
    pub rela_dyn_addr: u64,
    pub rela_plt_addr: u64,
    pub dynamic_addr: u64,
    /// Base of the reservation backing COPY relocations.
    pub dynbss_addr: u64,
}
