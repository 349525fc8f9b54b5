//! builtins.rs — the native functions that make `Value::Ref` and
//! `Value::Channel` actually operable from Lattice bytecode rather than
//! merely constructible. `Value::new_ref`/`Value::new_channel` are a
//! host-side API; a running program has no other way to read/replace a
//! Ref's contents or create/use a Channel, so these are the concrete
//! realization of §5's "Refs are reference cells with atomic replace" and
//! "Channels are bounded FIFOs supporting blocking send and receive".
//!
//! Mirrors the teacher's `install_stdlib`/`define_native` pairing: a host
//! that wants these opts in by calling [`install_builtins`] once, the same
//! way `print`/`clock_ms` are opted into there.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{FaultKind, LatticeError, Result};
use crate::value::Value;
use crate::vm::Vm;

/// How long a blocking channel op waits before re-checking cancellation.
/// §5: the signal is "checked at safe points — specifically between
/// instructions and before each blocking channel operation"; polling at
/// this grain lets a cancelled scope interrupt a send/recv that would
/// otherwise block forever.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn cancelled_fault() -> LatticeError {
    LatticeError::from(FaultKind::Custom("task cancelled".to_string()))
}

fn type_error(expected: &'static str, found: &Value) -> LatticeError {
    LatticeError::from(FaultKind::TypeError { expected, found: found.value_kind().name() })
}

/// Registers `ref_new`, `ref_get`, `ref_set`, `channel_new`, `channel_send`
/// and `channel_recv` as globals on `vm`.
pub fn install_builtins(vm: &mut Vm) {
    vm.define_native("ref_new", Arc::new(|_vm, args: &[Value]| {
        Ok(Value::new_ref(args.first().cloned().unwrap_or(Value::Unit)))
    }));

    vm.define_native("ref_get", Arc::new(|_vm, args: &[Value]| match args.first() {
        Some(Value::Ref(cell)) => Ok(cell.read().clone()),
        Some(other) => Err(type_error("Ref", other)),
        None => Err(LatticeError::from(FaultKind::ArityMismatch { expected: 1, found: 0 })),
    }));

    vm.define_native("ref_set", Arc::new(|_vm, args: &[Value]| {
        let cell = match args.first() {
            Some(Value::Ref(cell)) => cell,
            Some(other) => return Err(type_error("Ref", other)),
            None => return Err(LatticeError::from(FaultKind::ArityMismatch { expected: 2, found: 0 })),
        };
        let new_value = args.get(1).cloned().unwrap_or(Value::Unit);
        // The write lock makes the replace a single totally-ordered step
        // (§5 "writes to a Ref are totally ordered"); returning the
        // previous value gives callers an atomic swap for free.
        let mut guard = cell.write();
        Ok(std::mem::replace(&mut *guard, new_value))
    }));

    vm.define_native("channel_new", Arc::new(|_vm, args: &[Value]| {
        let capacity = match args.first() {
            Some(Value::Int(n)) => (*n).max(0) as usize,
            Some(other) => return Err(type_error("Int capacity", other)),
            None => 0,
        };
        Ok(Value::new_channel(capacity))
    }));

    vm.define_native("channel_send", Arc::new(|vm, args: &[Value]| {
        let channel = match args.first() {
            Some(Value::Channel(c)) => Arc::clone(c),
            Some(other) => return Err(type_error("Channel", other)),
            None => return Err(LatticeError::from(FaultKind::ArityMismatch { expected: 2, found: 0 })),
        };
        let mut value = args.get(1).cloned().unwrap_or(Value::Unit);
        loop {
            if vm.is_cancelled() {
                return Err(cancelled_fault());
            }
            match channel.sender.send_timeout(value, POLL_INTERVAL) {
                Ok(()) => return Ok(Value::Unit),
                Err(crossbeam_channel::SendTimeoutError::Timeout(back)) => value = back,
                Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                    return Err(LatticeError::from(FaultKind::ChannelClosed));
                }
            }
        }
    }));

    vm.define_native("channel_recv", Arc::new(|vm, args: &[Value]| {
        let channel = match args.first() {
            Some(Value::Channel(c)) => Arc::clone(c),
            Some(other) => return Err(type_error("Channel", other)),
            None => return Err(LatticeError::from(FaultKind::ArityMismatch { expected: 1, found: 0 })),
        };
        loop {
            if vm.is_cancelled() {
                return Err(cancelled_fault());
            }
            match channel.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(value) => return Ok(value),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(LatticeError::from(FaultKind::ChannelClosed));
                }
            }
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::vm::VmLimits;

    fn vm() -> Vm {
        let mut vm = Vm::new(Runtime::new(RuntimeConfig::default()), VmLimits::default());
        install_builtins(&mut vm);
        vm
    }

    fn call(vm: &mut Vm, name: &str, args: &[Value]) -> Result<Value> {
        let f = vm.runtime().environment.get(name).unwrap();
        vm.call_value(f, args)
    }

    #[test]
    fn ref_get_set_round_trip_through_the_same_cell() {
        let mut vm = vm();
        let r = call(&mut vm, "ref_new", &[Value::int(1)]).unwrap();
        assert_eq!(call(&mut vm, "ref_get", &[r.clone()]).unwrap().to_string(), "1");
        let old = call(&mut vm, "ref_set", &[r.clone(), Value::int(2)]).unwrap();
        assert_eq!(old.to_string(), "1");
        assert_eq!(call(&mut vm, "ref_get", &[r]).unwrap().to_string(), "2");
    }

    #[test]
    fn ref_get_on_a_non_ref_is_a_type_error() {
        let mut vm = vm();
        assert!(call(&mut vm, "ref_get", &[Value::int(1)]).is_err());
    }

    #[test]
    fn channel_send_then_recv_delivers_the_same_value() {
        let mut vm = vm();
        let ch = call(&mut vm, "channel_new", &[Value::int(1)]).unwrap();
        call(&mut vm, "channel_send", &[ch.clone(), Value::string("hi")]).unwrap();
        let got = call(&mut vm, "channel_recv", &[ch]).unwrap();
        assert_eq!(got.to_string(), "hi");
    }

    #[test]
    fn channel_recv_blocks_until_a_send_is_posted() {
        let mut vm = vm();
        let ch = call(&mut vm, "channel_new", &[Value::int(0)]).unwrap();
        let ch_sender = ch.clone();

        let mut sender_vm = Vm::new(Runtime::new(RuntimeConfig::default()), VmLimits::default());
        install_builtins(&mut sender_vm);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            call(&mut sender_vm, "channel_send", &[ch_sender, Value::int(42)]).unwrap();
        });

        let got = call(&mut vm, "channel_recv", &[ch]).unwrap();
        assert_eq!(got.to_string(), "42");
        handle.join().unwrap();
    }
}
