//! TLS access-model optimization and the byte-level code rewrites.
//!
//! The optimizer decides, per relocation, whether a general-dynamic or
//! initial-exec access sequence can be lowered given the output kind and
//! whether the symbol's address is known at link time. The rewrites patch
//! the fixed instruction sequences the compiler emits for each model; every
//! rewrite validates the expected opcode bytes first and reports a
//! mismatch rather than patching blind.
//!
//! TLS info comes from the ELF Handling For Thread-Local Storage and the
//! TLSDESC proposal for IA32 and AMD64.

use crate::backend::elf::w32;
use crate::backend::linker_common::LinkOptions;
use crate::backend::x86_64::reloc::RelocType;

/// What the linker can do with a TLS relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsOptimization {
    /// Leave the access model alone.
    None,
    /// Lower General-Dynamic to Initial-Exec.
    ToIe,
    /// Lower to Local-Exec.
    ToLe,
}

/// Decide the optimization for a TLS relocation. `is_final` is true when
/// the symbol's address is known at link time.
pub fn optimize_tls_reloc(
    options: &LinkOptions,
    is_final: bool,
    r_type: RelocType,
) -> TlsOptimization {
    // When producing a shared library nothing is known at link time, so
    // nothing can be lowered.
    if options.output_kind.is_shared() {
        return TlsOptimization::None;
    }

    match r_type {
        // General-Dynamic permits fully general access. In an executable it
        // lowers to Initial-Exec, or all the way to Local-Exec when the
        // symbol is local.
        RelocType::TlsGd | RelocType::GotPc32TlsDesc | RelocType::TlsDescCall => {
            if is_final {
                TlsOptimization::ToLe
            } else {
                TlsOptimization::ToIe
            }
        }

        // Local-Dynamic refers to a local symbol in the dynamic TLS block;
        // an executable can always switch to Local-Exec.
        RelocType::TlsLd | RelocType::DtpOff32 | RelocType::DtpOff64 => TlsOptimization::ToLe,

        // Initial-Exec reads the thread offset from the GOT; with a local
        // symbol the offset can be linked into the instruction instead.
        RelocType::GotTpOff => {
            if is_final {
                TlsOptimization::ToLe
            } else {
                TlsOptimization::None
            }
        }

        // Already Local-Exec.
        RelocType::TpOff32 => TlsOptimization::None,

        _ => TlsOptimization::None,
    }
}

// ── Sequence validation ──────────────────────────────────────────────────

fn check_range(view_len: usize, roff: usize, delta: i64) -> Result<(), String> {
    let pos = roff as i64 + delta;
    if pos < 0 || pos > view_len as i64 {
        return Err("TLS relocation out of range".to_string());
    }
    Ok(())
}

fn check_tls(valid: bool) -> Result<(), String> {
    if !valid {
        return Err("unsupported TLS instruction sequence".to_string());
    }
    Ok(())
}

// ── Rewrites ─────────────────────────────────────────────────────────────
//
// Offsets are relative to the relocation offset `roff` within `view`;
// `address` is the virtual address of the relocation field itself.

/// General-Dynamic to Initial-Exec:
/// `.byte 0x66; leaq foo@tlsgd(%rip),%rdi; .word 0x6666; rex64; call __tls_get_addr`
/// becomes `movq %fs:0,%rax; addq foo@gottpoff(%rip),%rax`.
/// `value` is the address of the symbol's TLS_OFFSET GOT entry.
pub fn gd_to_ie(
    view: &mut [u8],
    roff: usize,
    value: u64,
    addend: i64,
    address: u64,
) -> Result<(), String> {
    check_range(view.len(), roff, -4)?;
    check_range(view.len(), roff, 12)?;
    check_tls(view[roff - 4..roff] == [0x66, 0x48, 0x8d, 0x3d])?;
    check_tls(view[roff + 4..roff + 8] == [0x66, 0x66, 0x48, 0xe8])?;

    view[roff - 4..roff + 12].copy_from_slice(&[
        0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // movq %fs:0,%rax
        0x48, 0x03, 0x05, 0, 0, 0, 0, // addq x(%rip),%rax
    ]);
    w32(view, roff + 8, (value as i64 + addend - 8 - address as i64) as u32);
    Ok(())
}

/// General-Dynamic to Local-Exec: the same sequence becomes
/// `movq %fs:0,%rax; leaq x@tpoff(%rax),%rax`.
pub fn gd_to_le(
    view: &mut [u8],
    roff: usize,
    value: u64,
    tls_memsz: u64,
) -> Result<(), String> {
    check_range(view.len(), roff, -4)?;
    check_range(view.len(), roff, 12)?;
    check_tls(view[roff - 4..roff] == [0x66, 0x48, 0x8d, 0x3d])?;
    check_tls(view[roff + 4..roff + 8] == [0x66, 0x66, 0x48, 0xe8])?;

    view[roff - 4..roff + 12].copy_from_slice(&[
        0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // movq %fs:0,%rax
        0x48, 0x8d, 0x80, 0, 0, 0, 0, // leaq x(%rax),%rax
    ]);
    w32(view, roff + 8, value.wrapping_sub(tls_memsz) as u32);
    Ok(())
}

/// TLSDESC General-Dynamic to Initial-Exec.
/// On `GOTPC32_TLSDESC`: `leaq foo@tlsdesc(%rip),%rax` becomes
/// `movq foo@gottpoff(%rip),%rax`; on `TLSDESC_CALL`: `call *(%rax)`
/// becomes a two-byte nop.
pub fn desc_gd_to_ie(
    r_type: RelocType,
    view: &mut [u8],
    roff: usize,
    value: u64,
    addend: i64,
    address: u64,
) -> Result<(), String> {
    if r_type == RelocType::GotPc32TlsDesc {
        check_range(view.len(), roff, -3)?;
        check_range(view.len(), roff, 4)?;
        check_tls(view[roff - 3..roff] == [0x48, 0x8d, 0x05])?;
        view[roff - 2] = 0x8b;
        w32(view, roff, (value as i64 + addend - address as i64) as u32);
    } else {
        check_range(view.len(), roff, 2)?;
        check_tls(view[roff] == 0xff && view[roff + 1] == 0x10)?;
        view[roff] = 0x66;
        view[roff + 1] = 0x90;
    }
    Ok(())
}

/// TLSDESC General-Dynamic to Local-Exec.
/// On `GOTPC32_TLSDESC`: `leaq foo@tlsdesc(%rip),%rax` becomes
/// `movq $foo@tpoff,%rax`; the call is nopped as in the IE form.
pub fn desc_gd_to_le(
    r_type: RelocType,
    view: &mut [u8],
    roff: usize,
    value: u64,
    tls_memsz: u64,
) -> Result<(), String> {
    if r_type == RelocType::GotPc32TlsDesc {
        check_range(view.len(), roff, -3)?;
        check_range(view.len(), roff, 4)?;
        check_tls(view[roff - 3..roff] == [0x48, 0x8d, 0x05])?;
        view[roff - 2] = 0xc7;
        view[roff - 1] = 0xc0;
        w32(view, roff, value.wrapping_sub(tls_memsz) as u32);
    } else {
        check_range(view.len(), roff, 2)?;
        check_tls(view[roff] == 0xff && view[roff + 1] == 0x10)?;
        view[roff] = 0x66;
        view[roff + 1] = 0x90;
    }
    Ok(())
}

/// Local-Dynamic to Local-Exec:
/// `leaq foo@tlsld(%rip),%rdi; call __tls_get_addr@plt` becomes
/// `.word 0x6666; .byte 0x66; movq %fs:0,%rax`.
pub fn ld_to_le(view: &mut [u8], roff: usize) -> Result<(), String> {
    check_range(view.len(), roff, -3)?;
    check_range(view.len(), roff, 9)?;
    check_tls(view[roff - 3..roff] == [0x48, 0x8d, 0x3d])?;
    check_tls(view[roff + 4] == 0xe8)?;

    view[roff - 3..roff + 9].copy_from_slice(&[
        0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0,
    ]);
    Ok(())
}

/// Initial-Exec to Local-Exec: examine the instruction to tell a
/// `movq foo@gottpoff(%rip),%reg` from an `addq`, then link the thread
/// offset straight into it.
pub fn ie_to_le(
    view: &mut [u8],
    roff: usize,
    value: u64,
    tls_memsz: u64,
) -> Result<(), String> {
    check_range(view.len(), roff, -3)?;
    check_range(view.len(), roff, 4)?;

    let op1 = view[roff - 3];
    let op2 = view[roff - 2];
    let op3 = view[roff - 1];
    let reg = op3 >> 3;

    if op2 == 0x8b {
        // movq -> movq $imm32,%reg
        if op1 == 0x4c {
            view[roff - 3] = 0x49;
        }
        view[roff - 2] = 0xc7;
        view[roff - 1] = 0xc0 | reg;
    } else if reg == 4 {
        // %rsp needs the full addq $imm32 form.
        if op1 == 0x4c {
            view[roff - 3] = 0x49;
        }
        view[roff - 2] = 0x81;
        view[roff - 1] = 0xc0 | reg;
    } else {
        // addq -> leaq imm32(%reg),%reg
        if op1 == 0x4c {
            view[roff - 3] = 0x4d;
        }
        view[roff - 2] = 0x8d;
        view[roff - 1] = 0x80 | reg | (reg << 3);
    }

    w32(view, roff, value.wrapping_sub(tls_memsz) as u32);
    Ok(())
}
