use thiserror::Error;

/// Errors surfaced by the allocator, heap, and chunk layers.
#[derive(Debug, Error)]
pub enum Error {
    /// The backing region has no block large enough to satisfy a request.
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request, in bytes.
        requested: usize,
    },

    /// A chunk's constant pool would exceed the 24-bit index space.
    #[error("chunk: too many constants (max {max})")]
    TooManyConstants {
        /// The maximum number of constants a chunk may hold.
        max: usize,
    },

    /// Generic chunk-format complaint (used by disassembly/loading code paths).
    #[error("chunk: {0}")]
    Chunk(String),
}

/// Convenience alias used across `vellum-core`.
pub type Result<T, E = Error> = core::result::Result<T, E>;
