// Linker functions naturally accumulate parameters (target state, symbol
// table, object, section, diagnostics). Refactoring every one into a struct
// would add boilerplate without improving clarity.
#![allow(clippy::too_many_arguments)]

pub mod common;
pub mod backend;
