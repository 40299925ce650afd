//! The `.plt` section: reserved entry 0, per-symbol stubs, and the optional
//! reserved TLSDESC trampoline entry.
//!
//! The stub bytes contain PC-relative displacements against the final
//! addresses of `.plt` and `.got.plt`, so the section is held as a sized but
//! unwritten buffer until finalization streams the bytes. `.got.plt` slot
//! contents (the lazy-resolution back-pointers) are produced in the same
//! pass, preserving the 1-to-1 correspondence: the slot for entry `i` lives
//! at offset `24 + 8·(i-1)` and points at `plt_base + 16·i + 6`, the pushq
//! that follows the entry's indirect jump.

use crate::backend::elf::{w32, w64};
use crate::backend::linker_common::{InputObject, LayoutView, SymbolId, SymbolTable};
use crate::backend::x86_64::dynrel::{RelaSection, RelocPlace};
use crate::backend::x86_64::got::Got;
use crate::backend::x86_64::reloc::RelocType;

pub const PLT_ENTRY_SIZE: u64 = 16;

// From the AMD64 ABI: the same procedure linkage table serves programs and
// shared objects.
const FIRST_PLT_ENTRY: [u8; 16] = [
    0xff, 0x35, 0, 0, 0, 0, // pushq GOT+8(%rip)
    0xff, 0x25, 0, 0, 0, 0, // jmpq *GOT+16(%rip)
    0x90, 0x90, 0x90, 0x90, // nop (x4)
];

const PLT_ENTRY: [u8; 16] = [
    0xff, 0x25, 0, 0, 0, 0, // jmpq *sym@GOT(%rip)
    0x68, 0, 0, 0, 0, // pushq reloc-index
    0xe9, 0, 0, 0, 0, // jmpq plt[0]
];

// From "Thread-Local Storage Descriptors for IA32 and AMD64/EM64T".
const TLSDESC_PLT_ENTRY: [u8; 16] = [
    0xff, 0x35, 0, 0, 0, 0, // pushq GOT+8(%rip)
    0xff, 0x25, 0, 0, 0, 0, // jmpq *tlsdesc@GOT(%rip)
    0x0f, 0x1f, 0x40, 0x00, // nop
];

// ── Free list for incremental updates ────────────────────────────────────

/// First-fit free list over byte ranges of the pre-sized PLT.
#[derive(Debug, Default)]
struct FreeList {
    ranges: Vec<(u64, u64)>,
}

impl FreeList {
    fn new(len: u64) -> Self {
        FreeList { ranges: vec![(0, len)] }
    }

    /// Mark `[start, end)` as in use.
    fn remove(&mut self, start: u64, end: u64) {
        let mut next = Vec::with_capacity(self.ranges.len() + 1);
        for &(rs, re) in &self.ranges {
            if end <= rs || start >= re {
                next.push((rs, re));
                continue;
            }
            if rs < start {
                next.push((rs, start));
            }
            if end < re {
                next.push((end, re));
            }
        }
        self.ranges = next;
    }

    /// Allocate `len` bytes aligned to `align`, or None if no range fits.
    fn allocate(&mut self, len: u64, align: u64) -> Option<u64> {
        for i in 0..self.ranges.len() {
            let (range_start, range_end) = self.ranges[i];
            let start = (range_start + align - 1) & !(align - 1);
            if start + len <= range_end {
                self.remove(start, start + len);
                return Some(start);
            }
        }
        None
    }
}

// ── The PLT section ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Plt {
    /// Number of per-symbol entries (excluding entry 0 and the TLSDESC
    /// entry). In incremental-update mode this is the pre-sized capacity.
    count: u32,
    /// Present in incremental-update mode.
    free_list: Option<FreeList>,
    /// `.got` offset of the reserved TLSDESC slot, once reserved.
    tlsdesc_got_offset: Option<u32>,
    /// JUMP_SLOT / IRELATIVE entries, in PLT-index order.
    rel: RelaSection,
    /// TLSDESC entries; concatenated after `rel` in the output `.rela.plt`.
    tlsdesc_rel: RelaSection,
}

impl Plt {
    pub fn new() -> Self {
        Plt {
            count: 0,
            free_list: None,
            tlsdesc_got_offset: None,
            rel: RelaSection::new(),
            tlsdesc_rel: RelaSection::new(),
        }
    }

    /// Pre-sized PLT for an incremental update: `plt_count` entries whose
    /// slots are handed out by the free list. Entry 0 stays reserved.
    pub fn new_for_update(plt_count: u32) -> Self {
        let mut free_list = FreeList::new((plt_count as u64 + 1) * PLT_ENTRY_SIZE);
        free_list.remove(0, PLT_ENTRY_SIZE);
        Plt {
            count: plt_count,
            free_list: Some(free_list),
            tlsdesc_got_offset: None,
            rel: RelaSection::new(),
            tlsdesc_rel: RelaSection::new(),
        }
    }

    pub fn entry_count(&self) -> u32 {
        self.count
    }

    pub fn first_plt_entry_offset() -> u64 {
        PLT_ENTRY_SIZE
    }

    pub fn has_tlsdesc_entry(&self) -> bool {
        self.tlsdesc_got_offset.is_some()
    }

    pub fn tlsdesc_got_offset(&self) -> Option<u32> {
        self.tlsdesc_got_offset
    }

    /// Offset of the reserved TLSDESC entry: it trails the per-symbol
    /// entries.
    pub fn tlsdesc_plt_offset(&self) -> u64 {
        (self.count as u64 + 1) * PLT_ENTRY_SIZE
    }

    /// Record that the trailing reserved TLSDESC entry is needed.
    /// Idempotent.
    pub fn reserve_tlsdesc_entry(&mut self, got_offset: u32) {
        if self.tlsdesc_got_offset.is_none() {
            self.tlsdesc_got_offset = Some(got_offset);
        }
    }

    pub fn data_size(&self) -> u64 {
        let mut count = self.count as u64 + 1;
        if self.has_tlsdesc_entry() {
            count += 1;
        }
        count * PLT_ENTRY_SIZE
    }

    /// The JUMP_SLOT / IRELATIVE part of `.rela.plt`.
    pub fn rel(&self) -> &RelaSection {
        &self.rel
    }

    /// The TLSDESC part of `.rela.plt`.
    pub fn rela_tlsdesc(&self) -> &RelaSection {
        &self.tlsdesc_rel
    }

    pub fn rela_tlsdesc_mut(&mut self) -> &mut RelaSection {
        &mut self.tlsdesc_rel
    }

    /// Total `.rela.plt` size: jump slots followed by TLSDESC entries.
    pub fn rela_plt_size(&self) -> u64 {
        self.rel.data_size() + self.tlsdesc_rel.data_size()
    }

    /// Add an entry for a global symbol. The caller guarantees the symbol
    /// has no PLT offset yet.
    pub fn add_entry(
        &mut self,
        symtab: &mut SymbolTable,
        sym: SymbolId,
        got: &mut Got,
    ) -> Result<(), String> {
        let (plt_offset, got_offset) = self.allocate_entry(got)?;
        symtab[sym].set_plt_offset(plt_offset);
        self.add_relocation(symtab, sym, got_offset);
        Ok(())
    }

    /// Add an entry for a local STT_GNU_IFUNC symbol and return its PLT
    /// offset. The relocation is IRELATIVE with the resolver's link-time
    /// address as addend.
    pub fn add_local_ifunc_entry(
        &mut self,
        object: &mut InputObject,
        obj: usize,
        r_sym: u32,
        got: &mut Got,
    ) -> Result<u64, String> {
        let (plt_offset, got_offset) = self.allocate_entry(got)?;
        object.set_local_plt_offset(r_sym, plt_offset);
        self.rel.add_symbolless_local_addend(
            obj,
            r_sym,
            RelocType::IRelative,
            RelocPlace::GotPlt(got_offset),
            0,
        );
        Ok(plt_offset)
    }

    /// Allocate one PLT entry and its `.got.plt` slot; returns
    /// `(plt offset, got.plt offset)`.
    fn allocate_entry(&mut self, got: &mut Got) -> Result<(u64, u32), String> {
        match &mut self.free_list {
            None => {
                // Entry 0 is reserved, so the new entry is number count+1.
                let entry = self.count as u64 + 1;
                self.count += 1;
                let plt_offset = entry * PLT_ENTRY_SIZE;
                let got_offset = got.extend_got_plt();
                Ok((plt_offset, got_offset))
            }
            Some(free_list) => {
                let plt_offset = free_list
                    .allocate(PLT_ENTRY_SIZE, PLT_ENTRY_SIZE)
                    .ok_or_else(|| {
                        "out of patch space (PLT); relink with --incremental-full".to_string()
                    })?;
                // The GOT and PLT entries correspond 1-1, so the slot
                // offset follows from the entry number.
                let entry = plt_offset / PLT_ENTRY_SIZE;
                let got_offset = ((entry - 1) * 8 + 24) as u32;
                Ok((plt_offset, got_offset))
            }
        }
    }

    /// Add the relocation for a PLT entry: IRELATIVE for a locally-bound
    /// ifunc, JUMP_SLOT (with a dynamic symbol) otherwise.
    pub fn add_relocation(&mut self, symtab: &mut SymbolTable, sym: SymbolId, got_offset: u32) {
        if symtab[sym].is_ifunc() && symtab[sym].can_use_relative_reloc(false) {
            self.rel.add_symbolless_global_addend(
                sym,
                RelocType::IRelative,
                RelocPlace::GotPlt(got_offset),
                0,
            );
        } else {
            symtab[sym].needs_dynsym_entry = true;
            self.rel.add_global(sym, RelocType::JumpSlot, RelocPlace::GotPlt(got_offset), 0);
        }
    }

    /// Take `[16·(i+1), 16·(i+2))` off the incremental free list for the
    /// existing entry with 0-based index `i`.
    pub fn reserve_slot(&mut self, plt_index: u32) {
        if let Some(free_list) = &mut self.free_list {
            free_list.remove(
                (plt_index as u64 + 1) * PLT_ENTRY_SIZE,
                (plt_index as u64 + 2) * PLT_ENTRY_SIZE,
            );
        }
    }

    /// Re-bind an existing PLT slot to a symbol in an incremental update.
    pub fn register_global_entry(&mut self, symtab: &mut SymbolTable, plt_index: u32, sym: SymbolId) {
        self.reserve_slot(plt_index);
        symtab[sym].set_plt_offset((plt_index as u64 + 1) * PLT_ENTRY_SIZE);
        self.add_relocation(symtab, sym, (plt_index + 3) * 8);
    }

    /// Produce the `.plt` bytes and the `.got.plt` bytes.
    pub fn write(&self, layout: &LayoutView, got_plt_size: u64) -> (Vec<u8>, Vec<u8>) {
        let plt_address = layout.plt_addr;
        let got_address = layout.got_plt_addr;
        let got_base = layout.got_addr;

        let mut plt = vec![0u8; self.data_size() as usize];
        let mut got_plt = vec![0u8; got_plt_size as usize];

        // Entry 0: push the link-map slot and jump through the resolver
        // slot. Displacements are PC-relative from the end of each
        // instruction.
        plt[0..16].copy_from_slice(&FIRST_PLT_ENTRY);
        w32(&mut plt, 2, (got_address + 8).wrapping_sub(plt_address + 6) as u32);
        w32(&mut plt, 8, (got_address + 16).wrapping_sub(plt_address + 12) as u32);

        // Reserved words: the dynamic structure pointer, then the link-map
        // and resolver slots the loader fills.
        w64(&mut got_plt, 0, layout.dynamic_addr);

        let mut plt_offset = PLT_ENTRY_SIZE;
        let mut got_offset = 24u64;
        for plt_index in 0..self.count as u64 {
            let base = plt_offset as usize;
            plt[base..base + 16].copy_from_slice(&PLT_ENTRY);
            w32(
                &mut plt,
                base + 2,
                (got_address + got_offset).wrapping_sub(plt_address + plt_offset + 6) as u32,
            );
            // The pushq immediate indexes the relocation table.
            w32(&mut plt, base + 7, plt_index as u32);
            w32(&mut plt, base + 12, (plt_offset + PLT_ENTRY_SIZE).wrapping_neg() as u32);

            // The slot initially points back into its own PLT entry, at the
            // pushq following the indirect jump.
            w64(&mut got_plt, got_offset as usize, plt_address + plt_offset + 6);

            plt_offset += PLT_ENTRY_SIZE;
            got_offset += 8;
        }

        if let Some(tlsdesc_got_offset) = self.tlsdesc_got_offset {
            let base = plt_offset as usize;
            plt[base..base + 16].copy_from_slice(&TLSDESC_PLT_ENTRY);
            w32(
                &mut plt,
                base + 2,
                (got_address + 8).wrapping_sub(plt_address + plt_offset + 6) as u32,
            );
            w32(
                &mut plt,
                base + 8,
                (got_base + tlsdesc_got_offset as u64)
                    .wrapping_sub(plt_address + plt_offset + 12) as u32,
            );
        }

        (plt, got_plt)
    }
}

impl Default for Plt {
    fn default() -> Self {
        Plt::new()
    }
}

// ── Code fill ────────────────────────────────────────────────────────────

/// Fill executable padding. Long gaps get a jump over the rest; short gaps
/// use the canonical multi-byte NOP encodings.
pub fn code_fill(length: usize) -> Vec<u8> {
    if length >= 16 {
        let mut fill = vec![0u8; length];
        fill[0] = 0xe9; // jmp rel32
        w32(&mut fill, 1, (length - 5) as u32);
        return fill;
    }

    const NOPS: [&[u8]; 16] = [
        &[],
        &[0x90],                                                       // nop
        &[0x66, 0x90],                                                 // xchg %ax,%ax
        &[0x0f, 0x1f, 0x00],                                           // nop (%rax)
        &[0x0f, 0x1f, 0x40, 0x00],                                     // nop 0(%rax)
        &[0x0f, 0x1f, 0x44, 0x00, 0x00],                               // nop 0(%rax,%rax,1)
        &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],                         // nopw 0(%rax,%rax,1)
        &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],                   // nopl 0L(%rax)
        &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],             // nopl 0L(%rax,%rax,1)
        &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],       // nopw 0L(%rax,%rax,1)
        &[0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00], // nopw %cs:0L(%rax,%rax,1)
        &[0x66, 0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        &[0x66, 0x66, 0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        &[0x66, 0x66, 0x66, 0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        &[0x66, 0x66, 0x66, 0x66, 0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        &[0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    ];
    NOPS[length].to_vec()
}
