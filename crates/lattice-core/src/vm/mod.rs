//! vm — the stack-based execution engine (§4.4): frames, upvalues,
//! exception handlers, defers, and the opcode dispatch loop that ties them
//! together, plus the worker-VM concurrency support of §4.4.5.

pub mod concurrency;
pub mod defer;
pub mod dispatch;
pub mod frame;
pub mod handler;
pub mod iter;
pub mod upvalue;

use std::sync::Arc;

use ahash::AHashMap;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::ops::Op;
use crate::error::{LatticeError, Result};
use crate::runtime::Runtime;
use crate::value::Value;

use concurrency::CancelToken;
use defer::DeferEntry;
use frame::CallFrame;
use handler::HandlerEntry;
use upvalue::OpenUpvalues;

/// Resource ceilings a `Vm` enforces before falling over with a
/// `LimitKind` fault rather than exhausting host memory or the native
/// call stack (§4.4.1, §9 "resource limits").
#[derive(Debug, Clone, Copy)]
pub struct VmLimits {
    pub value_stack: usize,
    pub frame_stack: usize,
    pub handler_stack: usize,
    pub defer_stack: usize,
    pub max_workers: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self { value_stack: 4096, frame_stack: 256, handler_stack: 64, defer_stack: 256, max_workers: 16 }
    }
}

impl VmLimits {
    pub fn builder() -> VmLimitsBuilder {
        VmLimitsBuilder(Self::default())
    }
}

/// Builder for `VmLimits`, following the same "start from defaults,
/// override a field at a time" shape used elsewhere in this crate's
/// configuration surface (`RuntimeConfig`).
#[derive(Debug, Clone, Copy)]
pub struct VmLimitsBuilder(VmLimits);

impl VmLimitsBuilder {
    pub fn value_stack(mut self, n: usize) -> Self {
        self.0.value_stack = n;
        self
    }

    pub fn frame_stack(mut self, n: usize) -> Self {
        self.0.frame_stack = n;
        self
    }

    pub fn handler_stack(mut self, n: usize) -> Self {
        self.0.handler_stack = n;
        self
    }

    pub fn defer_stack(mut self, n: usize) -> Self {
        self.0.defer_stack = n;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.0.max_workers = n;
        self
    }

    pub fn build(self) -> VmLimits {
        self.0
    }
}

/// A scratch arena for the short-lived `String`s built during bytecode
/// string concatenation (`Op::Add` on two strings). Reused across calls
/// instead of allocating a fresh buffer every time; `fast_path` records
/// whether the arena's last use stayed within its existing capacity, a
/// cheap signal callers can use to decide whether to pre-reserve before a
/// hot loop of concatenations.
#[derive(Debug, Default)]
struct ScratchArena {
    buf: String,
    fast_path: bool,
}

impl ScratchArena {
    fn concat(&mut self, a: &str, b: &str) -> Arc<str> {
        self.buf.clear();
        self.fast_path = self.buf.capacity() >= a.len() + b.len();
        self.buf.reserve(a.len() + b.len());
        self.buf.push_str(a);
        self.buf.push_str(b);
        Arc::from(self.buf.as_str())
    }
}

/// The execution engine described by §4.4. One `Vm` runs one logical
/// thread of Lattice code; worker VMs spawned for structured concurrency
/// (§4.4.5) are independent `Vm`s sharing only the parts of `Runtime` that
/// are immutable after program start.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    handlers: Vec<HandlerEntry>,
    defers: Vec<DeferEntry>,
    open_upvalues: OpenUpvalues,
    module_cache: AHashMap<Arc<str>, Arc<Chunk>>,
    /// When `Some`, the next frame pushed by a call reuses this slot base
    /// instead of `stack.len()` — how a defer body shares its parent
    /// frame's locals (§4.4.4).
    next_frame_slot_base_override: Option<usize>,
    scratch: ScratchArena,
    /// Single-instruction `Call(0)` + `Return` chunk used as a synthetic
    /// caller frame when native code invokes a Lattice closure
    /// (`call_value`) — it gives the dispatch loop a normal frame to
    /// return into instead of special-casing a top-level re-entrant call.
    wrapper_chunk: Arc<Chunk>,
    runtime: Runtime,
    limits: VmLimits,
    cancel: Option<CancelToken>,
}

impl Vm {
    pub fn new(runtime: Runtime, limits: VmLimits) -> Self {
        // A sentinel caller frame for `call_value`: just a bare `Return`.
        // The real call is set up directly via `begin_call` (the same
        // helper `Op::Call` uses), so when the callee eventually returns
        // control lands here and immediately returns again, unwinding
        // back to the native caller with the result on top of the stack.
        let mut wrapper = Chunk::with_name("<native-call-wrapper>");
        wrapper.append_op(Op::Return, 0);

        Self {
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(16),
            handlers: Vec::new(),
            defers: Vec::new(),
            open_upvalues: OpenUpvalues::new(),
            module_cache: AHashMap::new(),
            next_frame_slot_base_override: None,
            scratch: ScratchArena::default(),
            wrapper_chunk: Arc::new(wrapper),
            runtime,
            limits,
            cancel: None,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    pub fn limits(&self) -> VmLimits {
        self.limits
    }

    /// Caches a loaded chunk under `name` so repeated `import`-style
    /// lookups within this VM's lifetime don't redeserialize it.
    pub fn cache_chunk(&mut self, name: impl Into<Arc<str>>, chunk: Arc<Chunk>) {
        self.module_cache.insert(name.into(), chunk);
    }

    pub fn cached_chunk(&self, name: &str) -> Option<Arc<Chunk>> {
        self.module_cache.get(name).cloned()
    }

    /// Builds the `Vm` a structured-concurrency scope hands to a freshly
    /// spawned worker (§4.4.5): a forked `Runtime` (deep-cloned
    /// environment, shared registries), empty stacks and module cache,
    /// the same limits, and the scope's shared cancel token.
    pub(crate) fn fork_worker(&self, cancel: CancelToken) -> Result<Vm> {
        let runtime = self.runtime.fork_for_worker()?;
        let mut worker = Vm::new(runtime, self.limits);
        worker.cancel = Some(cancel);
        Ok(worker)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Runs `chunk` as a top-level program: pushes its implicit zero-arg
    /// frame and drives the dispatch loop until the frame stack empties.
    pub fn run(&mut self, chunk: Arc<Chunk>) -> Result<Value> {
        chunk.verify().map_err(LatticeError::from)?;
        self.push_frame(chunk, Vec::new(), Vec::new(), None)?;
        self.execute(0)
    }

    /// Invokes `callee` (native or Lattice closure) with `args` from
    /// outside the bytecode dispatch loop — the path native functions use
    /// to call back into user code, and the path `concurrency::run_scope`
    /// uses to start a worker.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value> {
        match &callee {
            Value::Closure(c) if c.is_native() => {
                let native = c.native.clone().expect("checked by is_native");
                native(self, args)
            }
            Value::Closure(_) => {
                let depth_before = self.frames.len();
                self.push_frame(self.wrapper_chunk.clone(), Vec::new(), Vec::new(), None)?;
                self.push_value(callee)?;
                for arg in args {
                    self.push_value(arg.clone())?;
                }
                self.begin_call(args.len() as u8)?;
                self.execute(depth_before)
            }
            _ => Err(LatticeError::from(crate::error::FaultKind::NotCallable)),
        }
    }

    pub(crate) fn push_frame(
        &mut self,
        chunk: Arc<Chunk>,
        upvalues: Vec<Arc<upvalue::Upvalue>>,
        initial_slots: Vec<Value>,
        cleanup_base: Option<usize>,
    ) -> Result<()> {
        if self.frames.len() >= self.limits.frame_stack {
            return Err(LatticeError::from(crate::error::LimitKind::FrameStackOverflow { capacity: self.limits.frame_stack }));
        }
        let slot_base = self.next_frame_slot_base_override.take().unwrap_or(self.stack.len());
        for slot in initial_slots {
            self.push_value(slot)?;
        }
        let defer_base = self.defers.len();
        let handler_base = self.handlers.len();
        #[cfg(feature = "tracing")]
        tracing::trace!(
            target: "lattice_core::vm",
            chunk = chunk.name().unwrap_or("<anonymous>"),
            depth = self.frames.len() + 1,
            slot_base,
            "frame entry"
        );
        self.frames.push(CallFrame::new(chunk, slot_base, upvalues, defer_base, handler_base, cleanup_base));
        Ok(())
    }

    /// Registers a native function under `name` in the runtime's
    /// `NativeRegistry` and binds it as a global of the same name, so
    /// bytecode can call it like any other global (mirrors the teacher's
    /// `define_native`/`install_stdlib` pairing).
    pub fn define_native(&mut self, name: impl Into<Arc<str>>, f: crate::value::NativeFn) {
        let name = name.into();
        self.runtime.native_registry.register(name.clone(), f);
        let value = self.runtime.native_registry.lookup_value(&name).expect("just registered");
        self.runtime.environment.define(name, value);
    }

    pub(crate) fn push_value(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= self.limits.value_stack {
            return Err(LatticeError::from(crate::error::LimitKind::ValueStackOverflow { capacity: self.limits.value_stack }));
        }
        self.stack.push(value);
        Ok(())
    }
}
