//! Runtime-error reporting.

use std::fmt;

/// A runtime failure: type error, arity mismatch, stack overflow, bad
/// coroutine transition. Carries the message plus the stack trace captured
/// from the coroutine that was running; the coroutine itself has been
/// reset to the ERROR state by the time this value exists.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    /// `[line N] in f()` entries, outermost frame first.
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.trace {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
