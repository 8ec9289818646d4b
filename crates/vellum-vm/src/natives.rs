//! Host-implemented native functions exposed to scripts (§6).

use std::sync::OnceLock;
use std::time::Instant;

use vellum_core::Value;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// `clock()` — seconds since process start, as a float. Grounded in the
/// original implementation's `clockNative`, which returns `(double)clock()
/// / CLOCKS_PER_SEC`; an `Instant` captured on first use stands in for C's
/// process-CPU-time `clock()`, since Rust has no direct analog without an
/// extra platform-specific crate.
pub fn clock(_args: &[Value]) -> Result<Value, String> {
    let start = PROCESS_START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

/// `sqrt(n)` — the non-negative square root of a number argument.
pub fn sqrt(args: &[Value]) -> Result<Value, String> {
    match args.first().and_then(|v| v.as_number()) {
        Some(n) if n >= 0.0 => Ok(Value::Number(n.sqrt())),
        Some(_) => Err("sqrt: argument must not be negative.".to_string()),
        None => Err("sqrt: argument must be a number.".to_string()),
    }
}
