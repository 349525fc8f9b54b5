//! upvalue.rs — captured-variable cells shared between a closure and the
//! stack frame that created it (§4.4.2 "closure construction", §4.4.3
//! "closing upvalues on return").
//!
//! An upvalue starts `Open`, pointing at a live stack slot in some still-
//! running frame, so mutations made through ordinary `StoreLocal` are
//! visible to every closure that captured it. When the owning frame
//! returns, every upvalue open on its slots is *closed*: the value is
//! copied out of the stack into the upvalue's own storage, and further
//! reads/writes go through that storage instead.

use parking_lot::RwLock;

use crate::value::Value;

#[derive(Debug)]
enum State {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Upvalue {
    state: RwLock<State>,
}

impl Upvalue {
    pub fn new_open(stack_slot: usize) -> Self {
        Self { state: RwLock::new(State::Open(stack_slot)) }
    }

    pub fn new_closed(value: Value) -> Self {
        Self { state: RwLock::new(State::Closed(value)) }
    }

    /// The stack slot this upvalue currently tracks, if still open.
    pub fn open_slot(&self) -> Option<usize> {
        match &*self.state.read() {
            State::Open(slot) => Some(*slot),
            State::Closed(_) => None,
        }
    }

    pub fn get(&self, stack: &[Value]) -> Value {
        match &*self.state.read() {
            State::Open(slot) => stack[*slot].clone(),
            State::Closed(value) => value.clone(),
        }
    }

    pub fn set(&self, stack: &mut [Value], value: Value) {
        let slot = match &*self.state.read() {
            State::Open(slot) => Some(*slot),
            State::Closed(_) => None,
        };
        match slot {
            Some(slot) => stack[slot] = value,
            None => *self.state.write() = State::Closed(value),
        }
    }

    /// Copies the live stack value into owned storage and stops tracking
    /// the slot. Called once per upvalue when its owning frame returns.
    pub fn close(&self, stack: &[Value]) {
        let mut guard = self.state.write();
        if let State::Open(slot) = &*guard {
            let value = stack[*slot].clone();
            *guard = State::Closed(value);
        }
    }
}

/// The VM's open-upvalue list, kept ordered by descending stack slot so
/// that closing every upvalue at or above a departing frame's base is a
/// prefix of the list (§4.4.3: "O(k) closing where k is the number of
/// upvalues open on the departing frame").
#[derive(Debug, Default)]
pub struct OpenUpvalues {
    entries: Vec<std::sync::Arc<Upvalue>>,
}

impl OpenUpvalues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds (or creates) the open upvalue for `slot`, inserting it at the
    /// position that keeps the list ordered by descending slot.
    pub fn capture(&mut self, slot: usize) -> std::sync::Arc<Upvalue> {
        if let Some(existing) = self.entries.iter().find(|u| u.open_slot() == Some(slot)) {
            return existing.clone();
        }
        let insert_at = self.entries.iter().position(|u| u.open_slot().is_some_and(|s| s < slot)).unwrap_or(self.entries.len());
        let fresh = std::sync::Arc::new(Upvalue::new_open(slot));
        self.entries.insert(insert_at, fresh.clone());
        fresh
    }

    /// Closes every open upvalue at or above `base`, then drops them from
    /// the open list (they're now self-contained).
    pub fn close_from(&mut self, base: usize, stack: &[Value]) {
        self.entries.retain(|u| match u.open_slot() {
            Some(slot) if slot >= base => {
                u.close(stack);
                false
            }
            Some(_) => true,
            None => false,
        });
    }
}
