//! tests/integration.rs — end-to-end coverage of the testable properties
//! in spec.md §8: codec determinism/round-trip/header validation, closure
//! upvalue-close semantics, defer ordering, exception unwinding, resource
//! limits, and the literal end-to-end scenarios.

use std::sync::Arc;

use lattice_core::bytecode::chunk::Chunk;
use lattice_core::bytecode::codec;
use lattice_core::bytecode::ops::Op;
use lattice_core::runtime::{Runtime, RuntimeConfig};
use lattice_core::value::{ClosureObj, Value};
use lattice_core::vm::{Vm, VmLimits};

fn new_vm() -> Vm {
    Vm::new(Runtime::new(RuntimeConfig::default()), VmLimits::default())
}

fn captured_vm() -> (Vm, Arc<parking_lot::Mutex<String>>) {
    let captured = Arc::new(parking_lot::Mutex::new(String::new()));
    let sink = Arc::clone(&captured);
    let rt = Runtime::new(RuntimeConfig {
        program_args: vec![],
        print_capture: Some(Arc::new(move |s: &str| sink.lock().push_str(s))),
    });
    (Vm::new(rt, VmLimits::default()), captured)
}

// A native `print` that writes through the runtime's print-capture hook,
// followed by a newline — this is the `print` builtin's observable
// contract for every literal scenario in §8.
fn install_print(vm: &mut Vm) {
    vm.runtime_mut().native_registry.register(
        "print",
        Arc::new(|vm, args: &[Value]| {
            let text = args.first().map(Value::to_string).unwrap_or_default();
            vm.runtime().print(&text);
            vm.runtime().print("\n");
            Ok(Value::Unit)
        }),
    );
    let print_value = vm.runtime().native_registry.lookup_value("print").unwrap();
    vm.runtime_mut().environment.define(Arc::from("print"), print_value);
}

fn call_global_print(c: &mut Chunk, arg_line: u32) {
    let name = c.add_constant(Value::string("print"));
    c.append_op(Op::LoadGlobal(name as u8), arg_line);
}

// ---------------------------------------------------------------------
// §8.1 / §8.2 — codec determinism and round-trip identity
// ---------------------------------------------------------------------

fn sample_chunk_with_closure() -> Chunk {
    let mut inner = Chunk::with_name("adder_body");
    inner.append_op(Op::LoadLocal(0), 1);
    inner.append_op(Op::LoadUpvalue(0), 1);
    inner.append_op(Op::Add, 1);
    inner.append_op(Op::Return, 1);

    let mut outer = Chunk::with_name("main");
    let k_closure = outer.add_constant(Value::Closure(Arc::new(ClosureObj {
        param_count: 1,
        param_names: None,
        variadic: false,
        defaults: Vec::new(),
        body: Some(Arc::new(inner)),
        upvalues: Vec::new(),
        native: None,
        name: Some(Arc::from("adder_body")),
    })));
    outer.append_closure(k_closure as u16, &[(true, 0)], 1);
    outer.append_op(Op::Return, 1);
    outer.set_local_name(0, "n");
    outer
}

#[test]
fn codec_serialization_is_deterministic() {
    let chunk = sample_chunk_with_closure();
    let a = codec::serialize(&chunk).unwrap();
    let b = codec::serialize(&chunk).unwrap();
    assert_eq!(a, b);
}

#[test]
fn codec_roundtrip_preserves_structure_recursively() {
    let chunk = sample_chunk_with_closure();
    let bytes = codec::serialize(&chunk).unwrap();
    let back = codec::deserialize(&bytes).unwrap();

    assert_eq!(chunk.code(), back.code());
    assert_eq!(chunk.lines(), back.lines());
    assert_eq!(chunk.constants().len(), back.constants().len());
    assert_eq!(chunk.name(), back.name());
    assert_eq!(chunk.local_names().len(), back.local_names().len());

    match (&chunk.constants()[0], &back.constants()[0]) {
        (Value::Closure(a), Value::Closure(b)) => {
            let (ba, bb) = (a.body.as_ref().unwrap(), b.body.as_ref().unwrap());
            assert_eq!(ba.code(), bb.code());
            assert_eq!(ba.name(), bb.name());
        }
        _ => panic!("expected a closure constant in slot 0"),
    }
}

#[test]
fn codec_roundtripped_chunk_executes_identically() {
    let chunk = sample_chunk_with_closure();
    let bytes = codec::serialize(&chunk).unwrap();
    let back = codec::deserialize(&bytes).unwrap();

    // Calling the inner closure with a captured upvalue of 10 and an
    // argument of 5 should yield 15 whether we run the original chunk's
    // closure constant or the deserialized one.
    for c in [&chunk, &back] {
        let Value::Closure(template) = &c.constants()[0] else { panic!("not a closure") };
        let closure = ClosureObj {
            param_count: template.param_count,
            param_names: None,
            variadic: false,
            defaults: Vec::new(),
            body: template.body.clone(),
            upvalues: vec![Arc::new(lattice_core::vm::upvalue::Upvalue::new_closed(Value::int(10)))],
            native: None,
            name: None,
        };
        let mut vm = new_vm();
        let result = vm.call_value(Value::Closure(Arc::new(closure)), &[Value::int(5)]).unwrap();
        assert_eq!(result.to_string(), "15");
    }
}

#[test]
fn header_rejects_bad_magic_bad_version_and_every_truncation() {
    let bytes = codec::serialize(&sample_chunk_with_closure()).unwrap();

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert!(codec::deserialize(&bad_magic).is_err());

    let mut bad_version = bytes.clone();
    bad_version[4] = 0xFF;
    assert!(codec::deserialize(&bad_version).is_err());

    for len in 0..bytes.len() {
        assert!(codec::deserialize(&bytes[..len]).is_err(), "truncation at {len} must be rejected, not panic");
    }
}

// ---------------------------------------------------------------------
// §8.4 — closure identity / upvalue-close semantics
// ---------------------------------------------------------------------

// fn make_counter() { flux n = 0; return |_| { n = n + 1; n } }
// fn main() { let c = make_counter(); print(c(0)); print(c(0)); print(c(0)) }
#[test]
fn closure_observes_mutation_through_open_upvalue_and_keeps_last_value_after_close() {
    let mut counter_body = Chunk::with_name("counter_closure");
    // n = n + 1
    counter_body.append_op(Op::LoadUpvalue(0), 1);
    let one = counter_body.add_constant(Value::int(1));
    counter_body.append_op(Op::LoadConst(one as u8), 1);
    counter_body.append_op(Op::Add, 1);
    counter_body.append_op(Op::StoreUpvalue(0), 1);
    counter_body.append_op(Op::Pop, 1);
    // return n
    counter_body.append_op(Op::LoadUpvalue(0), 1);
    counter_body.append_op(Op::Return, 1);

    let mut make_counter = Chunk::with_name("make_counter");
    let zero = make_counter.add_constant(Value::int(0));
    make_counter.append_op(Op::LoadConst(zero as u8), 1); // slot 0 = n
    let k_closure = make_counter.add_constant(Value::Closure(Arc::new(ClosureObj {
        param_count: 1,
        param_names: None,
        variadic: false,
        defaults: Vec::new(),
        body: Some(Arc::new(counter_body)),
        upvalues: Vec::new(),
        native: None,
        name: Some(Arc::from("counter_closure")),
    })));
    make_counter.append_closure(k_closure as u16, &[(true, 0)], 1);
    make_counter.append_op(Op::Return, 1);
    make_counter.set_local_name(0, "n");

    let mut vm = new_vm();
    let counter = vm.run(Arc::new(make_counter)).unwrap();

    let Value::Closure(_) = &counter else { panic!("expected a closure") };
    assert_eq!(vm.call_value(counter.clone(), &[Value::Unit]).unwrap().to_string(), "1");
    assert_eq!(vm.call_value(counter.clone(), &[Value::Unit]).unwrap().to_string(), "2");
    assert_eq!(vm.call_value(counter, &[Value::Unit]).unwrap().to_string(), "3");
}

// ---------------------------------------------------------------------
// §8.5 — defer ordering
// ---------------------------------------------------------------------

// fn main() { defer { print("A") }; defer { print("B") }; print("mid") }
#[test]
fn defers_run_in_lifo_order_on_normal_return() {
    let (mut vm, captured) = captured_vm();
    install_print(&mut vm);

    let mut main = Chunk::with_name("main");

    // defer { print("A") } — body lives after the main sequence; we lay
    // both defer bodies out after the "mid" print and jump over them in
    // registration order (a compiler would do the same via jump-over).
    let defer_a = main.add_constant(Value::string("A"));
    let defer_b = main.add_constant(Value::string("B"));
    let mid = main.add_constant(Value::string("mid"));

    // We build: DeferRegister(A) ; DeferRegister(B) ; print(mid) ; Return
    // with the two bodies appended at the tail and jumped past.
    // Layout:
    //   0: DeferRegister -> bodyA       (placeholder offset, patched below)
    //   1: DeferRegister -> bodyB
    //   2: load "mid" ; call print ; pop result
    //   3: LoadUnit ; Return
    //   bodyA: load "A"; call print; pop; Return
    //   bodyB: load "B"; call print; pop; Return
    //
    // Since `append_op` returns start offsets, we can compute relative
    // jumps precisely instead of hand-laying bytes.
    let defer_a_site = main.append_op(Op::DeferRegister { body_offset: 0, scope_depth: 1 }, 1);
    let defer_b_site = main.append_op(Op::DeferRegister { body_offset: 0, scope_depth: 1 }, 1);

    main.append_op(Op::LoadConst(mid as u8), 1);
    call_global_print(&mut main, 1);
    main.append_op(Op::Call(1), 1);
    main.append_op(Op::Pop, 1);
    main.append_op(Op::LoadUnit, 1);
    main.append_op(Op::Return, 1);

    let body_a_start = main.append_op(Op::LoadConst(defer_a as u8), 1);
    call_global_print(&mut main, 1);
    main.append_op(Op::Call(1), 1);
    main.append_op(Op::Return, 1);

    let body_b_start = main.append_op(Op::LoadConst(defer_b as u8), 1);
    call_global_print(&mut main, 1);
    main.append_op(Op::Call(1), 1);
    main.append_op(Op::Return, 1);

    patch_defer_offset(&mut main, defer_a_site, body_a_start);
    patch_defer_offset(&mut main, defer_b_site, body_b_start);

    let mut vm2 = vm;
    vm2.run(Arc::new(main)).unwrap();
    assert_eq!(captured.lock().as_str(), "mid\nB\nA\n");
}

/// Rewrites the `DeferRegister` instruction at `site` (its `body_offset`,
/// relative to the byte right after the 3-byte instruction) so that it
/// targets `body_start`. Test-only helper: a real compiler computes this
/// offset at emission time instead of patching after the fact.
fn patch_defer_offset(chunk: &mut Chunk, site: usize, body_start: usize) {
    let next_pc = site + 4;
    let offset = (body_start as i64 - next_pc as i64) as i16;
    let bytes = offset.to_le_bytes();
    // `DeferRegister` layout: [tag][offset_lo][offset_hi][scope_depth].
    // We reach into the chunk's code through a fresh Chunk built from
    // raw parts since `Chunk` keeps `code` private; round-trip via
    // from_raw_parts to get mutable access in this test helper.
    let mut code = chunk.code().to_vec();
    code[site + 1] = bytes[0];
    code[site + 2] = bytes[1];
    *chunk = Chunk::from_raw_parts(
        code,
        chunk.lines().to_vec(),
        chunk.constants().to_vec(),
        chunk.local_names().to_vec(),
        chunk.name().map(Arc::from),
    );
}

// ---------------------------------------------------------------------
// §8.6 — exception unwind through nested defers to the nearest catch
// ---------------------------------------------------------------------

// fn main() { try { let x = 1 / 0 } catch e { print("caught") } }
#[test]
fn division_by_zero_is_caught_by_the_nearest_handler() {
    let (mut vm, captured) = captured_vm();
    install_print(&mut vm);

    let mut main = Chunk::with_name("main");
    let one = main.add_constant(Value::int(1));
    let zero = main.add_constant(Value::int(0));
    let caught = main.add_constant(Value::string("caught"));

    let try_site = main.append_op(Op::TrySetup(0), 1);
    main.append_op(Op::LoadConst(one as u8), 1);
    main.append_op(Op::LoadConst(zero as u8), 1);
    main.append_op(Op::Div, 1);
    main.append_op(Op::Pop, 1);
    main.append_op(Op::PopHandler, 1);
    let jump_over_catch = main.append_op(Op::Jump(0), 1);

    let catch_start = main.append_op(Op::Pop, 1); // discard thrown value ("e")
    main.append_op(Op::LoadConst(caught as u8), 1);
    call_global_print(&mut main, 1);
    main.append_op(Op::Call(1), 1);
    main.append_op(Op::Pop, 1);

    let after_catch = main.append_op(Op::LoadUnit, 1);
    main.append_op(Op::Return, 1);

    patch_jump(&mut main, try_site, catch_start);
    patch_jump(&mut main, jump_over_catch, after_catch);

    vm.run(Arc::new(main)).unwrap();
    assert_eq!(captured.lock().as_str(), "caught\n");
}

// fn inner() { defer { print("inner") }; let x = 1 / 0 }
// fn main() { try { defer { print("outer") }; inner() } catch e { print("caught") } }
//
// The exception is raised inside `inner`'s own frame, which has no handler
// of its own — unwinding to `main`'s handler must pop `inner`'s frame
// (running its defer), then run `main`'s own defer registered before the
// call, in that order (innermost first), before control reaches the catch.
#[test]
fn exception_thrown_in_a_nested_frame_unwinds_both_scopes_defers_in_lifo_order() {
    let (mut vm, captured) = captured_vm();
    install_print(&mut vm);

    let mut inner = Chunk::with_name("inner");
    let inner_tag = inner.add_constant(Value::string("inner"));
    let one = inner.add_constant(Value::int(1));
    let zero = inner.add_constant(Value::int(0));

    let inner_defer_site = inner.append_op(Op::DeferRegister { body_offset: 0, scope_depth: 1 }, 1);
    inner.append_op(Op::LoadConst(one as u8), 1);
    inner.append_op(Op::LoadConst(zero as u8), 1);
    inner.append_op(Op::Div, 1);
    inner.append_op(Op::Pop, 1);
    inner.append_op(Op::LoadUnit, 1);
    inner.append_op(Op::Return, 1);

    let inner_defer_start = inner.append_op(Op::LoadConst(inner_tag as u8), 1);
    call_global_print(&mut inner, 1);
    inner.append_op(Op::Call(1), 1);
    inner.append_op(Op::Return, 1);

    patch_defer_offset(&mut inner, inner_defer_site, inner_defer_start);

    let inner_closure = Value::Closure(Arc::new(ClosureObj {
        param_count: 0,
        param_names: None,
        variadic: false,
        defaults: Vec::new(),
        body: Some(Arc::new(inner)),
        upvalues: Vec::new(),
        native: None,
        name: Some(Arc::from("inner")),
    }));
    vm.runtime_mut().environment.define(Arc::from("inner"), inner_closure);

    let mut main = Chunk::with_name("main");
    let outer_tag = main.add_constant(Value::string("outer"));
    let caught = main.add_constant(Value::string("caught"));
    let inner_name = main.add_constant(Value::string("inner"));

    let try_site = main.append_op(Op::TrySetup(0), 1);
    let outer_defer_site = main.append_op(Op::DeferRegister { body_offset: 0, scope_depth: 1 }, 1);
    main.append_op(Op::LoadGlobal(inner_name as u8), 1);
    main.append_op(Op::Call(0), 1);
    main.append_op(Op::Pop, 1);
    main.append_op(Op::PopHandler, 1);
    let jump_over_catch = main.append_op(Op::Jump(0), 1);

    let catch_start = main.append_op(Op::Pop, 1); // discard thrown value
    main.append_op(Op::LoadConst(caught as u8), 1);
    call_global_print(&mut main, 1);
    main.append_op(Op::Call(1), 1);
    main.append_op(Op::Pop, 1);

    let after_catch = main.append_op(Op::LoadUnit, 1);
    main.append_op(Op::Return, 1);

    let outer_defer_start = main.append_op(Op::LoadConst(outer_tag as u8), 1);
    call_global_print(&mut main, 1);
    main.append_op(Op::Call(1), 1);
    main.append_op(Op::Return, 1);

    patch_defer_offset(&mut main, outer_defer_site, outer_defer_start);
    patch_jump(&mut main, try_site, catch_start);
    patch_jump(&mut main, jump_over_catch, after_catch);

    vm.run(Arc::new(main)).unwrap();
    assert_eq!(captured.lock().as_str(), "inner\nouter\ncaught\n");
}

/// Rewrites a 3-byte `Jump`/`JumpIfFalse`/`JumpIfTrue`/`Loop`/`TrySetup`
/// instruction's `i16` offset at `site` so it targets `target`, relative to
/// the program counter right after the instruction (`site + 3`).
fn patch_jump(chunk: &mut Chunk, site: usize, target: usize) {
    let next_pc = site + 3;
    let offset = (target as i64 - next_pc as i64) as i16;
    let bytes = offset.to_le_bytes();
    let mut code = chunk.code().to_vec();
    code[site + 1] = bytes[0];
    code[site + 2] = bytes[1];
    *chunk = Chunk::from_raw_parts(
        code,
        chunk.lines().to_vec(),
        chunk.constants().to_vec(),
        chunk.local_names().to_vec(),
        chunk.name().map(Arc::from),
    );
}

// ---------------------------------------------------------------------
// §8.7 — resource-limit faults
// ---------------------------------------------------------------------

#[test]
fn recursion_beyond_frame_cap_faults_with_frame_overflow() {
    // fn recurse() { return recurse() } — infinitely recurses, tripping
    // the frame-stack cap well before the native call stack would.
    let mut recurse = Chunk::with_name("recurse");
    let k_self = recurse.add_constant(Value::Unit); // placeholder, patched below
    recurse.append_op(Op::LoadGlobal(k_self as u8), 1);
    recurse.append_op(Op::Call(0), 1);
    recurse.append_op(Op::Return, 1);
    // Patch the constant to be the global name "recurse" instead of Unit.
    let recurse_name = recurse.add_constant(Value::string("recurse"));
    let mut code = recurse.code().to_vec();
    code[1] = recurse_name as u8;
    let recurse = Chunk::from_raw_parts(code, recurse.lines().to_vec(), recurse.constants().to_vec(), recurse.local_names().to_vec(), recurse.name().map(Arc::from));

    let mut vm = Vm::new(Runtime::new(RuntimeConfig::default()), VmLimits::builder().frame_stack(16).build());
    let recurse_chunk = Arc::new(recurse);
    let closure = Value::Closure(Arc::new(ClosureObj {
        param_count: 0,
        param_names: None,
        variadic: false,
        defaults: Vec::new(),
        body: Some(recurse_chunk),
        upvalues: Vec::new(),
        native: None,
        name: Some(Arc::from("recurse")),
    }));
    vm.runtime_mut().environment.define(Arc::from("recurse"), closure.clone());

    let err = vm.call_value(closure, &[]).unwrap_err();
    assert!(matches!(err, lattice_core::error::LatticeError::ResourceLimit(lattice_core::error::LimitKind::FrameStackOverflow { .. })));
}

#[test]
fn value_stack_overflow_is_a_resource_limit_fault() {
    let mut main = Chunk::with_name("main");
    let k = main.add_constant(Value::int(1));
    for _ in 0..20 {
        main.append_op(Op::LoadConst(k as u8), 1);
    }
    main.append_op(Op::Return, 1);

    let mut vm = Vm::new(Runtime::new(RuntimeConfig::default()), VmLimits::builder().value_stack(8).build());
    let err = vm.run(Arc::new(main)).unwrap_err();
    assert!(matches!(err, lattice_core::error::LatticeError::ResourceLimit(lattice_core::error::LimitKind::ValueStackOverflow { .. })));
}

#[test]
fn nested_try_blocks_beyond_the_handler_cap_fault_with_handler_overflow() {
    // A flat run of `TrySetup` with no matching `PopHandler` in between
    // models handler nesting beyond the configured cap; none of them is
    // ever reached by a jump, so offset 0 (resume right after itself) is
    // fine — the fault fires on installation, well before any would run.
    let mut main = Chunk::with_name("main");
    for _ in 0..8 {
        main.append_op(Op::TrySetup(0), 1);
    }
    main.append_op(Op::Return, 1);

    let mut vm = Vm::new(Runtime::new(RuntimeConfig::default()), VmLimits::builder().handler_stack(4).build());
    let err = vm.run(Arc::new(main)).unwrap_err();
    assert!(matches!(err, lattice_core::error::LatticeError::ResourceLimit(lattice_core::error::LimitKind::HandlerStackOverflow { .. })));
}

#[test]
fn defers_registered_beyond_the_defer_cap_fault_with_defer_overflow() {
    let mut main = Chunk::with_name("main");
    for _ in 0..8 {
        main.append_op(Op::DeferRegister { body_offset: 0, scope_depth: 1 }, 1);
    }
    main.append_op(Op::Return, 1);

    let mut vm = Vm::new(Runtime::new(RuntimeConfig::default()), VmLimits::builder().defer_stack(4).build());
    let err = vm.run(Arc::new(main)).unwrap_err();
    assert!(matches!(err, lattice_core::error::LatticeError::ResourceLimit(lattice_core::error::LimitKind::DeferStackOverflow { .. })));
}

// ---------------------------------------------------------------------
// §8.8 — concurrency: blocking channel send/recv and scope cancellation
// ---------------------------------------------------------------------

#[test]
fn channel_recv_blocks_in_one_scope_worker_until_another_worker_sends() {
    use lattice_core::builtins::install_builtins;
    use lattice_core::vm::concurrency::run_scope;

    let mut vm = new_vm();
    install_builtins(&mut vm);

    // Capacity 0 is a rendezvous channel: `channel_send` cannot complete
    // until a concurrent `channel_recv` is waiting to take the value, so a
    // successful round trip through `run_scope` proves the two workers
    // actually overlapped rather than running one after the other.
    let channel = vm.call_value(vm.runtime().environment.get("channel_new").unwrap(), &[Value::int(0)]).unwrap();
    let recv_fn = vm.runtime().environment.get("channel_recv").unwrap();
    let send_fn = vm.runtime().environment.get("channel_send").unwrap();

    let results = run_scope(
        &vm,
        vec![(recv_fn, vec![channel.clone()]), (send_fn, vec![channel, Value::int(7)])],
    )
    .unwrap();

    assert_eq!(results[0].to_string(), "7");
}

#[test]
fn run_scope_rethrows_the_first_child_fault_and_cancels_the_blocked_sibling() {
    use lattice_core::builtins::install_builtins;
    use lattice_core::vm::concurrency::run_scope;

    let mut vm = new_vm();
    install_builtins(&mut vm);

    // Nobody ever sends on this channel; the `channel_recv` sibling blocks
    // forever unless cancelled. Listing the always-failing closure first
    // means its handle joins first, setting the cancel token before
    // `run_scope` blocks on the `channel_recv` handle's join.
    let channel = vm.call_value(vm.runtime().environment.get("channel_new").unwrap(), &[Value::int(0)]).unwrap();
    let recv_fn = vm.runtime().environment.get("channel_recv").unwrap();

    vm.define_native(
        "boom",
        Arc::new(|_vm, _args: &[Value]| Err(lattice_core::error::LatticeError::from(lattice_core::error::FaultKind::Custom("boom".to_string())))),
    );
    let boom_fn = vm.runtime().environment.get("boom").unwrap();

    let err = run_scope(&vm, vec![(boom_fn, vec![]), (recv_fn, vec![channel])]).unwrap_err();
    assert!(matches!(
        err,
        lattice_core::error::LatticeError::Fault(lattice_core::error::FaultKind::Custom(ref msg)) if msg == "boom"
    ));
}

// ---------------------------------------------------------------------
// §8 — literal end-to-end scenarios
// ---------------------------------------------------------------------

#[test]
fn scenario_string_concat() {
    let (mut vm, captured) = captured_vm();
    install_print(&mut vm);

    let mut main = Chunk::with_name("main");
    let s1 = main.add_constant(Value::string("hi"));
    let s2 = main.add_constant(Value::string(" world"));
    main.append_op(Op::LoadConst(s1 as u8), 1);
    main.append_op(Op::LoadConst(s2 as u8), 1);
    main.append_op(Op::Add, 1);
    call_global_print(&mut main, 1);
    main.append_op(Op::Call(1), 1);
    main.append_op(Op::Pop, 1);
    main.append_op(Op::LoadUnit, 1);
    main.append_op(Op::Return, 1);

    vm.run(Arc::new(main)).unwrap();
    assert_eq!(captured.lock().as_str(), "hi world\n");
}

#[test]
fn scenario_fib_recursive() {
    // fn fib(n) { if n <= 1 { return n }; return fib(n-1) + fib(n-2) }
    let mut fib = Chunk::with_name("fib");
    let one = fib.add_constant(Value::int(1));
    let two = fib.add_constant(Value::int(2));
    let fib_name = fib.add_constant(Value::string("fib"));

    fib.append_op(Op::LoadLocal(0), 1);
    fib.append_op(Op::LoadConst(one as u8), 1);
    fib.append_op(Op::Le, 1);
    let jump_site = fib.append_op(Op::JumpIfFalse(0), 1);
    fib.append_op(Op::LoadLocal(0), 1);
    fib.append_op(Op::Return, 1);
    let after_if = fib.append_op(Op::LoadGlobal(fib_name as u8), 1);
    fib.append_op(Op::LoadLocal(0), 1);
    fib.append_op(Op::LoadConst(one as u8), 1);
    fib.append_op(Op::Sub, 1);
    fib.append_op(Op::Call(1), 1);
    fib.append_op(Op::LoadGlobal(fib_name as u8), 1);
    fib.append_op(Op::LoadLocal(0), 1);
    fib.append_op(Op::LoadConst(two as u8), 1);
    fib.append_op(Op::Sub, 1);
    fib.append_op(Op::Call(1), 1);
    fib.append_op(Op::Add, 1);
    fib.append_op(Op::Return, 1);
    patch_jump(&mut fib, jump_site, after_if);
    fib.set_local_name(0, "n");

    let closure = Value::Closure(Arc::new(ClosureObj {
        param_count: 1,
        param_names: None,
        variadic: false,
        defaults: Vec::new(),
        body: Some(Arc::new(fib)),
        upvalues: Vec::new(),
        native: None,
        name: Some(Arc::from("fib")),
    }));

    let mut vm = new_vm();
    vm.runtime_mut().environment.define(Arc::from("fib"), closure.clone());
    let result = vm.call_value(closure, &[Value::int(10)]).unwrap();
    assert_eq!(result.to_string(), "55");
}
