//! Split-stack prologue fixups.
//!
//! A function compiled with split stacks begins by comparing the stack
//! pointer against a TCB field and calling `__morestack` when it is short.
//! When such a function calls code without split-stack support, the check
//! must be forced (or its headroom grown) and the call redirected to
//! `__morestack_non_split`, which allocates a conventionally large stack.

use crate::backend::linker_common::{InputObject, LinkOptions};
use crate::backend::x86_64::plt::code_fill;
use crate::common::error::DiagnosticEngine;

/// The call redirection the driver must apply after a successful fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitStackRedirect {
    pub from: &'static str,
    pub to: &'static str,
}

const MORESTACK_REDIRECT: SplitStackRedirect =
    SplitStackRedirect { from: "__morestack", to: "__morestack_non_split" };

fn match_view(view: &[u8], offset: usize, pattern: &[u8]) -> bool {
    view.len() >= offset + pattern.len() && &view[offset..offset + pattern.len()] == pattern
}

/// Patch the prologue of the split-stack function at `fnoffset` (length
/// `fnsize`) in `view`, which covers section `shndx` of `object`. Returns
/// the symbol redirection to apply, or None when the prologue could not be
/// matched.
pub fn calls_non_split(
    object: &InputObject,
    shndx: usize,
    fnoffset: usize,
    fnsize: usize,
    view: &mut [u8],
    options: &LinkOptions,
    diag: &mut DiagnosticEngine,
) -> Option<SplitStackRedirect> {
    // cmp %fs:NN,%rsp; the carry flag selects the __morestack call, so an
    // stc forces it and the comparison bytes become nops.
    if match_view(view, fnoffset, &[0x64, 0x48, 0x3b, 0x24, 0x25]) && fnsize > 9 {
        view[fnoffset] = 0xf9;
        view[fnoffset + 1..fnoffset + 9].copy_from_slice(&code_fill(8));
        return Some(MORESTACK_REDIRECT);
    }

    // lea NN(%rsp),%r10 / lea NN(%rsp),%r11: the negative displacement is
    // the headroom being checked; grow it by the configured adjustment.
    if (match_view(view, fnoffset, &[0x4c, 0x8d, 0x94, 0x24])
        || match_view(view, fnoffset, &[0x4c, 0x8d, 0x9c, 0x24]))
        && fnsize > 8
    {
        let pos = fnoffset + 4;
        let displacement = crate::backend::elf::read_u32(view, pos);
        let adjusted = displacement.wrapping_sub(options.split_stack_adjust_size);
        crate::backend::elf::w32(view, pos, adjusted);
        return Some(MORESTACK_REDIRECT);
    }

    if !object.has_no_split_stack {
        diag.error_object(
            &object.name,
            format!(
                "failed to match split-stack sequence at section {} offset 0x{:x}",
                shndx, fnoffset
            ),
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> LinkOptions {
        LinkOptions::default()
    }

    #[test]
    fn test_cmp_prologue_becomes_stc() {
        let object = InputObject::new("a.o");
        let mut view = vec![0u8; 24];
        view[0..5].copy_from_slice(&[0x64, 0x48, 0x3b, 0x24, 0x25]);
        view[5..9].copy_from_slice(&[0x10, 0, 0, 0]);
        let mut diag = DiagnosticEngine::new();
        let redirect = calls_non_split(&object, 1, 0, 24, &mut view, &options(), &mut diag);
        assert_eq!(redirect, Some(MORESTACK_REDIRECT));
        assert_eq!(view[0], 0xf9);
        // The next 8 bytes are one canonical 8-byte nop.
        assert_eq!(&view[1..9], &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(!diag.has_errors());
    }

    #[test]
    fn test_lea_prologue_adjusts_displacement() {
        let object = InputObject::new("a.o");
        let mut view = vec![0u8; 16];
        view[0..4].copy_from_slice(&[0x4c, 0x8d, 0x94, 0x24]);
        crate::backend::elf::w32(&mut view, 4, (-0x100i32) as u32);
        let mut diag = DiagnosticEngine::new();
        let redirect = calls_non_split(&object, 1, 0, 16, &mut view, &options(), &mut diag);
        assert_eq!(redirect, Some(MORESTACK_REDIRECT));
        let adjusted = crate::backend::elf::read_u32(&view, 4) as i32;
        assert_eq!(adjusted, -0x100 - 0x4000);
    }

    #[test]
    fn test_unmatched_prologue_reports_unless_annotated() {
        let mut object = InputObject::new("a.o");
        let mut view = vec![0u8; 16];
        let mut diag = DiagnosticEngine::new();
        assert_eq!(calls_non_split(&object, 2, 0, 16, &mut view, &options(), &mut diag), None);
        assert!(diag.has_errors());

        object.has_no_split_stack = true;
        let mut diag = DiagnosticEngine::new();
        assert_eq!(calls_non_split(&object, 2, 0, 16, &mut view, &options(), &mut diag), None);
        assert!(!diag.has_errors());
    }
}
