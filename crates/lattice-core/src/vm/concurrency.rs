//! concurrency.rs — worker VMs and structured-concurrency scopes (§4.4.5,
//! §5).
//!
//! A worker VM is a fresh `Vm` built around a deep clone of the parent's
//! `Environment`, sharing the parent's struct/native registries and intern
//! table by `Arc`, with its own empty module cache and empty stacks. It
//! does not own function sub-chunks — closures captured before the spawn
//! still point at the same `Arc<Chunk>` the parent holds, so spawning
//! never copies code, only the (deep-cloned) data it closes over.
//!
//! A "scope" runs a batch of closures on worker threads and waits for all
//! of them: if one throws, the others are asked to cancel at their next
//! safe point and the scope re-throws the first exception it saw.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{LatticeError, Result};
use crate::value::Value;

use super::Vm;

/// Checked by the dispatch loop between instructions and before any
/// blocking channel operation (§4.4.5 "safe points").
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Spawns `closure` on its own OS thread with a fresh worker `Vm` cloned
/// from `parent`, and blocks the current thread until every closure in
/// `closures` has returned (or one has thrown).
///
/// On the first exception from any child, the remaining children's
/// cancel tokens are flipped; they stop at their next safe point with a
/// `FaultKind::Custom` cancellation fault, which this function discards
/// in favor of re-throwing the original exception, matching "a child's
/// exception cancels its siblings and propagates" (§4.4.5).
pub fn run_scope(parent: &Vm, closures: Vec<(Value, Vec<Value>)>) -> Result<Vec<Value>> {
    if closures.len() > parent.limits.max_workers {
        return Err(LatticeError::from(crate::error::LimitKind::WorkerLimitExceeded {
            capacity: parent.limits.max_workers,
        }));
    }

    let token = CancelToken::new();
    let mut handles = Vec::with_capacity(closures.len());
    for (callee, args) in closures {
        let mut worker = parent.fork_worker(token.clone())?;
        handles.push(std::thread::spawn(move || worker.call_value(callee, &args)));
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut first_error: Option<LatticeError> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(err)) => {
                token.cancel();
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(_) => {
                token.cancel();
                if first_error.is_none() {
                    first_error = Some(LatticeError::internal("worker thread panicked"));
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}
