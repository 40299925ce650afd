//! Structured diagnostic infrastructure for the linker.
//!
//! Provides a `DiagnosticEngine` that collects errors and warnings with
//! input-file locations and renders them in GCC-compatible format. Per-reloc
//! problems are reported through the engine so a single link run surfaces as
//! many issues as possible; the driver checks `has_errors()` after each phase
//! and fails the link at the end. Conditions that make continuing pointless
//! (out of patch space, unimplemented incremental paths) are instead
//! propagated as `Err(String)` through the normal `?` fatal path.
//!
//! # Output format
//! ```text
//! foo.o: error: unsupported reloc 33 against local symbol
//! foo.o(.text+0x1c): error: missing expected TLS relocation
//! ```

use std::fmt;

/// Severity level for a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// An error that makes the link fail once all inputs have been scanned.
    Error,
    /// A warning that does not prevent the link from succeeding.
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Where in the inputs a diagnostic points.
///
/// `section` and `offset` refer to the section containing the relocation and
/// the relocation's offset within it, matching how relocation problems are
/// reported to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub object: String,
    pub section: Option<String>,
    pub offset: Option<u64>,
}

impl Location {
    pub fn object(object: &str) -> Self {
        Location { object: object.to_string(), section: None, offset: None }
    }

    pub fn reloc(object: &str, section: &str, offset: u64) -> Self {
        Location {
            object: object.to_string(),
            section: Some(section.to_string()),
            offset: Some(offset),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.section, self.offset) {
            (Some(sec), Some(off)) => write!(f, "{}({}+0x{:x})", self.object, sec, off),
            (Some(sec), None) => write!(f, "{}({})", self.object, sec),
            _ => write!(f, "{}", self.object),
        }
    }
}

/// A single diagnostic message with severity and optional location.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: Option<Location>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}: {}: {}", loc, self.severity, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Collects diagnostics for one link invocation.
///
/// The engine never aborts; callers keep going after reporting so that one
/// run shows every problem. The driver inspects `has_errors()` between
/// phases and before writing the output file.
#[derive(Debug, Default)]
pub struct DiagnosticEngine {
    diagnostics: Vec<Diagnostic>,
    error_count: usize,
}

impl DiagnosticEngine {
    pub fn new() -> Self {
        DiagnosticEngine { diagnostics: Vec::new(), error_count: 0 }
    }

    /// Report an error with no particular location.
    pub fn error(&mut self, message: impl Into<String>) {
        self.emit(Diagnostic { severity: Severity::Error, message: message.into(), location: None });
    }

    /// Report an error against an input object.
    pub fn error_object(&mut self, object: &str, message: impl Into<String>) {
        self.emit(Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            location: Some(Location::object(object)),
        });
    }

    /// Report an error at a relocation location: `(section, offset)` inside
    /// an object.
    pub fn error_at(&mut self, object: &str, section: &str, offset: u64, message: impl Into<String>) {
        self.emit(Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            location: Some(Location::reloc(object, section, offset)),
        });
    }

    pub fn warning_object(&mut self, object: &str, message: impl Into<String>) {
        self.emit(Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            location: Some(Location::object(object)),
        });
    }

    fn emit(&mut self, diag: Diagnostic) {
        if diag.severity == Severity::Error {
            self.error_count += 1;
        }
        self.diagnostics.push(diag);
    }

    /// True once any error has been reported. The driver treats this as the
    /// "errors occurred" flag for the whole link.
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Render all collected diagnostics to stderr.
    pub fn print_all(&self) {
        for diag in &self.diagnostics {
            eprintln!("{}", diag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_flag_accumulates() {
        let mut engine = DiagnosticEngine::new();
        assert!(!engine.has_errors());
        engine.warning_object("a.o", "something dubious");
        assert!(!engine.has_errors());
        engine.error_object("a.o", "bad reloc");
        engine.error_object("b.o", "bad reloc");
        assert!(engine.has_errors());
        assert_eq!(engine.error_count(), 2);
        assert_eq!(engine.diagnostics().len(), 3);
    }

    #[test]
    fn test_location_rendering() {
        let d = Diagnostic {
            severity: Severity::Error,
            message: "missing expected TLS relocation".to_string(),
            location: Some(Location::reloc("foo.o", ".text", 0x1c)),
        };
        assert_eq!(d.to_string(), "foo.o(.text+0x1c): error: missing expected TLS relocation");
    }
}
