//! Shared helpers for the end-to-end tests.

// Each integration-test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use skiff_cli::{RunError, run_source_with_output};
use skiff_runtime::RuntimeOptions;

#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// Run `source` and return everything it printed.
pub fn eval(source: &str) -> Result<String, RunError> {
    eval_with(source, RuntimeOptions::default())
}

pub fn eval_with(source: &str, options: RuntimeOptions) -> Result<String, RunError> {
    let buf = SharedBuf::default();
    run_source_with_output(source, options, Box::new(buf.clone()))?;
    Ok(buf.contents())
}

/// Run under collect-on-every-allocation; any liveness bug in the GC roots
/// shows up as wrong output or a crash here.
pub fn eval_stress(source: &str) -> Result<String, RunError> {
    eval_with(
        source,
        RuntimeOptions {
            stress_gc: true,
            ..RuntimeOptions::default()
        },
    )
}

/// Unwrap a runtime error and return its message.
pub fn runtime_error(source: &str) -> String {
    match eval(source) {
        Err(RunError::Runtime(e)) => e.message,
        other => panic!("expected a runtime error, got {other:?}"),
    }
}
