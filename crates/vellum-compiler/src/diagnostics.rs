//! Compile-time diagnostics (§7): accumulated rather than printed, so the
//! compiler stays usable as a library independent of the CLI's stderr
//! format.

use std::fmt;

use thiserror::Error;

/// Where, relative to the offending token, a diagnostic applies.
#[derive(Debug, Clone)]
pub enum AtToken {
    /// At a specific lexeme.
    Lexeme(String),
    /// At end of input.
    End,
}

impl fmt::Display for AtToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtToken::Lexeme(s) => write!(f, " at '{s}'"),
            AtToken::End => write!(f, " at end"),
        }
    }
}

/// One compile-time error, matching the `[line N] Error<at>: message`
/// surface format (§6).
#[derive(Debug, Clone, Error)]
#[error("[line {line}] Error{at}: {message}")]
pub struct CompileError {
    pub line: u32,
    pub at: AtToken,
    pub message: String,
}
