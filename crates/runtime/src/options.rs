//! Runtime configuration.

/// Toggles resolved from CLI flags and `SKIFF_*` environment variables.
/// Flags win; the environment fills in whatever the command line left
/// unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Collect on every allocation.
    pub stress_gc: bool,
    /// Print each instruction and the stack before executing it.
    pub trace_execution: bool,
    /// Disassemble compiled chunks before running them.
    pub print_code: bool,
}

impl RuntimeOptions {
    pub fn from_env() -> RuntimeOptions {
        RuntimeOptions {
            stress_gc: env_flag("SKIFF_STRESS_GC"),
            trace_execution: env_flag("SKIFF_TRACE"),
            print_code: env_flag("SKIFF_PRINT_CODE"),
        }
    }

    /// Overlay command-line flags on top of this.
    pub fn with_flags(mut self, stress_gc: bool, trace: bool, print_code: bool) -> RuntimeOptions {
        self.stress_gc |= stress_gc;
        self.trace_execution |= trace;
        self.print_code |= print_code;
        self
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => !matches!(value.as_str(), "" | "0" | "false"),
        Err(_) => false,
    }
}
