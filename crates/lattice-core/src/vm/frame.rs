//! frame.rs — a single activation record on the VM's call-frame stack
//! (§4.4.1, §4.4.3).

use std::sync::Arc;

use crate::bytecode::chunk::Chunk;

use super::upvalue::Upvalue;

#[derive(Debug)]
pub struct CallFrame {
    pub chunk: Arc<Chunk>,
    pub ip: usize,
    /// Index into the value stack of this frame's slot 0 (its first local
    /// / first parameter).
    pub slot_base: usize,
    pub upvalues: Vec<Arc<Upvalue>>,
    /// Index into the defer stack of the first defer entry registered by
    /// this frame — defers at or above this index belong to it.
    pub defer_base: usize,
    /// Index into the handler stack of the first `try` handler installed
    /// by this frame.
    pub handler_base: usize,
    /// Set only for the synthetic frame a defer body runs in (§4.4.4): the
    /// stack length to restore on `Return` instead of `slot_base`, since a
    /// defer body reuses its parent's slots rather than owning a fresh
    /// region and must not truncate them away.
    pub cleanup_base: Option<usize>,
    pub name: Option<Arc<str>>,
}

impl CallFrame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chunk: Arc<Chunk>,
        slot_base: usize,
        upvalues: Vec<Arc<Upvalue>>,
        defer_base: usize,
        handler_base: usize,
        cleanup_base: Option<usize>,
    ) -> Self {
        let name = chunk.name().map(Arc::from);
        Self { chunk, ip: 0, slot_base, upvalues, defer_base, handler_base, cleanup_base, name }
    }

    /// The stack index at/above which this frame's own slots live. Normal
    /// frames truncate here on return; a defer frame truncates to
    /// `cleanup_base` instead, to avoid freeing its parent's locals.
    pub fn truncate_point(&self) -> usize {
        self.cleanup_base.unwrap_or(self.slot_base)
    }
}
