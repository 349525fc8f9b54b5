//! handler.rs — the exception-handler stack (§4.4.4 "try/catch").
//!
//! `TrySetup` pushes a `HandlerEntry` recording everything needed to
//! resume execution at the matching `catch` block: which chunk/frame it
//! belongs to, where to jump, and how far to unwind the value stack first.
//! `Throw` searches this stack from the top down for the nearest handler
//! still in scope.

use std::sync::Arc;

use crate::bytecode::chunk::Chunk;

#[derive(Debug)]
pub struct HandlerEntry {
    pub resume_ip: usize,
    pub chunk: Arc<Chunk>,
    /// Index into the frame stack of the frame that installed this
    /// handler — unwinding pops every frame above this one first.
    pub frame_index: usize,
    /// Value-stack length to restore before pushing the caught exception
    /// value and resuming at `resume_ip`.
    pub stack_top: usize,
    /// Defer-stack length at install time — defers registered after this
    /// point, in frames discarded during unwind, run before the handler.
    pub defer_top: usize,
}
