//! Compile-error reporting.

use std::fmt;

/// Compilation failed. Diagnostics were already printed to stderr as they
/// were discovered (panic-mode suppresses cascades); they are carried here
/// too so hosts and tests can inspect them without re-parsing stderr.
#[derive(Debug)]
pub struct CompileError {
    pub diagnostics: Vec<String>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.diagnostics.is_empty() {
            return write!(f, "compile error");
        }
        write!(f, "{}", self.diagnostics.join("\n"))
    }
}

impl std::error::Error for CompileError {}
