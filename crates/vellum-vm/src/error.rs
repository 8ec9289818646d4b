//! Runtime errors (§7), carrying the clox-style call-stack trace that
//! accompanies an uncaught runtime fault.

use thiserror::Error;

/// A runtime fault: the source line it occurred on, the message, and a
/// rendered call-stack trace (innermost frame first), matching the `[line
/// N] in <name>` lines clox prints below the error message itself.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct VmError {
    /// The line in the currently executing frame when the fault occurred.
    pub line: u32,
    /// The human-readable fault description (e.g. "Undefined variable 'x'.").
    pub message: String,
    /// One `"[line N] in <name>"` entry per active call frame, innermost first.
    pub trace: Vec<String>,
}
