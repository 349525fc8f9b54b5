//! defer.rs — the defer stack (§4.4.4 "defer/scope-exit").
//!
//! `DeferRegister` pushes a `DeferEntry` describing a defer body's entry
//! point without running it. Bodies run later, in LIFO order, either when
//! their frame returns normally, when `ScopeExit` closes a lexical scope
//! early, or while unwinding for an uncaught exception. A defer body
//! shares its frame's stack slots (via `slot_base`), executed through the
//! "next frame slot base override" mechanism in `Vm::run_defer`.

use std::sync::Arc;

use crate::bytecode::chunk::Chunk;

#[derive(Debug, Clone)]
pub struct DeferEntry {
    pub body_ip: usize,
    pub chunk: Arc<Chunk>,
    pub frame_index: usize,
    pub slot_base: usize,
    pub scope_depth: u8,
}
