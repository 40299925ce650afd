//! Target backends for the linker.
//!
//! `elf` holds the ELF64 constants and byte helpers shared by every target;
//! `linker_common` holds the target-independent linker-side data model (input
//! relocation records, the resolved-symbol view, link options); `x86_64` is
//! the x86-64 relocation backend.

pub mod elf;
pub mod linker_common;
pub mod x86_64;
