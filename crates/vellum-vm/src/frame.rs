//! A single call frame (§3, §4.H): which closure is executing, where its
//! instruction pointer sits, and where its stack window begins.

use vellum_core::ObjRef;

/// One activation record on the VM's call stack.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    /// The `Closure` object this frame is executing.
    pub closure: ObjRef,
    /// Byte offset of the next instruction in the closure's function chunk.
    pub ip: usize,
    /// Index into the value stack where this frame's locals begin (slot 0
    /// holds the callee itself, matching the calling convention's reserved
    /// receiver/closure slot).
    pub base: usize,
}
