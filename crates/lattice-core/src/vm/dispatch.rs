//! dispatch.rs — the opcode dispatch loop (§4.4.2–§4.4.4): fetch/decode via
//! `Op::decode`, execute, repeat until the frame stack unwinds back to the
//! depth the caller asked to stop at.
//!
//! Faults that a Lattice program can recover from (`FaultKind`, e.g. a
//! division by zero or an out-of-bounds index) don't bubble up through
//! plain `?` — they're routed through [`Vm::raise_fault`], which searches
//! the handler stack exactly as `Op::Throw` does. Only an uncaught fault,
//! or a genuine `LatticeError::Internal`/`ResourceLimit`, escapes `execute`
//! as an `Err`.

use std::sync::Arc;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::ops::Op;
use crate::error::{FaultKind, LatticeError, Result};
use crate::value::{ClosureObj, EnumObj, LatRange, StructObj, Value};
use crate::vm::defer::DeferEntry;
use crate::vm::frame::CallFrame;
use crate::vm::handler::HandlerEntry;
use crate::vm::iter::{ArrayIter, RangeIter};
use crate::vm::upvalue::Upvalue;
use crate::vm::Vm;

/// Outcome of a pure (non-stack-mutating) operator: either the resulting
/// value, or the `FaultKind` that `raise_fault` should route to the nearest
/// handler.
type OpResult<T> = std::result::Result<T, FaultKind>;

impl Vm {
    /// Drives the fetch-decode-execute cycle until `self.frames.len()`
    /// drops to `stop_depth` (reached via a `Return` that empties the
    /// frame(s) pushed since the caller's `execute` call began), then
    /// returns the value that `Return` left on top of the stack.
    pub(crate) fn execute(&mut self, stop_depth: usize) -> Result<Value> {
        loop {
            if self.frames.len() <= stop_depth {
                return Ok(self.stack.pop().unwrap_or(Value::Unit));
            }

            if self.is_cancelled() {
                self.raise_fault(FaultKind::Custom("task cancelled".to_string()))?;
                continue;
            }

            let frame_idx = self.frames.len() - 1;
            let (chunk, ip) = {
                let frame = &self.frames[frame_idx];
                (frame.chunk.clone(), frame.ip)
            };
            let (op, width) = Op::decode(chunk.code(), ip)
                .ok_or_else(|| LatticeError::internal(format!("undecodable instruction at offset {ip}")))?;
            self.frames[frame_idx].ip = ip + width;

            self.step(op, &chunk, ip + width)?;
        }
    }

    /// Executes one already-decoded instruction. `next_pc` is the offset
    /// immediately after the instruction's fixed-width header — the base
    /// relative jump/try/defer offsets are computed from, and (for
    /// `MakeClosure`) where its variable-length upvalue descriptors start.
    fn step(&mut self, op: Op, chunk: &Arc<Chunk>, next_pc: usize) -> Result<()> {
        match op {
            Op::LoadConst(i) => self.load_const(chunk, i as u32)?,
            Op::LoadConstWide(i) => self.load_const(chunk, i as u32)?,
            Op::LoadTrue => self.push_value(Value::Bool(true))?,
            Op::LoadFalse => self.push_value(Value::Bool(false))?,
            Op::LoadNil => self.push_value(Value::Nil)?,
            Op::LoadUnit => self.push_value(Value::Unit)?,

            Op::Pop => {
                self.pop_value()?;
            }
            Op::Dup => {
                let v = self.peek_value()?.clone();
                self.push_value(v)?;
            }

            Op::LoadLocal(i) => {
                let slot = self.current_frame().slot_base + i as usize;
                let v = self.stack.get(slot).cloned().ok_or_else(|| LatticeError::internal("local slot out of bounds"))?;
                self.push_value(v)?;
            }
            Op::StoreLocal(i) => {
                let slot = self.current_frame().slot_base + i as usize;
                let v = self.peek_value()?.clone();
                if slot >= self.stack.len() {
                    return Err(LatticeError::internal("local slot out of bounds"));
                }
                self.stack[slot] = v;
            }

            Op::LoadGlobal(i) => self.load_global(chunk, i as u32)?,
            Op::LoadGlobalWide(i) => self.load_global(chunk, i as u32)?,
            Op::StoreGlobal(i) => self.store_global(chunk, i as u32)?,
            Op::StoreGlobalWide(i) => self.store_global(chunk, i as u32)?,
            Op::DefineGlobal(i) => self.define_global(chunk, i as u32)?,
            Op::DefineGlobalWide(i) => self.define_global(chunk, i as u32)?,

            Op::LoadUpvalue(i) => {
                let up = self.current_frame().upvalues.get(i as usize).cloned();
                match up {
                    Some(up) => {
                        let v = up.get(&self.stack);
                        self.push_value(v)?;
                    }
                    None => return Err(LatticeError::internal("upvalue index out of bounds")),
                }
            }
            Op::StoreUpvalue(i) => {
                let up = self.current_frame().upvalues.get(i as usize).cloned();
                match up {
                    Some(up) => {
                        let v = self.peek_value()?.clone();
                        up.set(&mut self.stack, v);
                    }
                    None => return Err(LatticeError::internal("upvalue index out of bounds")),
                }
            }

            Op::Add => self.binary_add()?,
            Op::Sub => self.binary_numeric(i64::wrapping_sub, |a, b| a - b)?,
            Op::Mul => self.binary_numeric(i64::wrapping_mul, |a, b| a * b)?,
            Op::Div => self.binary_div()?,
            Op::Mod => self.binary_mod()?,
            Op::Neg => self.unary_neg()?,
            Op::BitAnd => self.binary_int(|a, b| a & b)?,
            Op::BitOr => self.binary_int(|a, b| a | b)?,
            Op::BitXor => self.binary_int(|a, b| a ^ b)?,
            Op::BitNot => self.unary_bitnot()?,
            Op::Shl => self.binary_int(|a, b| a.wrapping_shl(b as u32))?,
            Op::Shr => self.binary_int(|a, b| a.wrapping_shr(b as u32))?,

            Op::Not => {
                let v = self.pop_value()?;
                self.push_value(Value::Bool(!v.is_truthy()))?;
            }
            Op::LogicalAnd => {
                let b = self.pop_value()?;
                let a = self.pop_value()?;
                self.push_value(Value::Bool(a.is_truthy() && b.is_truthy()))?;
            }
            Op::LogicalOr => {
                let b = self.pop_value()?;
                let a = self.pop_value()?;
                self.push_value(Value::Bool(a.is_truthy() || b.is_truthy()))?;
            }
            Op::Eq => {
                let b = self.pop_value()?;
                let a = self.pop_value()?;
                self.push_value(Value::Bool(a.value_eq(&b)))?;
            }
            Op::Ne => {
                let b = self.pop_value()?;
                let a = self.pop_value()?;
                self.push_value(Value::Bool(!a.value_eq(&b)))?;
            }
            Op::Lt => self.compare(|o| o == std::cmp::Ordering::Less)?,
            Op::Le => self.compare(|o| o != std::cmp::Ordering::Greater)?,
            Op::Gt => self.compare(|o| o == std::cmp::Ordering::Greater)?,
            Op::Ge => self.compare(|o| o != std::cmp::Ordering::Less)?,

            Op::Jump(off) => self.jump_to(next_pc, off),
            Op::Loop(off) => self.jump_to(next_pc, off),
            Op::JumpIfFalse(off) => {
                let v = self.pop_value()?;
                if !v.is_truthy() {
                    self.jump_to(next_pc, off);
                }
            }
            Op::JumpIfTrue(off) => {
                let v = self.pop_value()?;
                if v.is_truthy() {
                    self.jump_to(next_pc, off);
                }
            }

            Op::Call(argc) => self.begin_call(argc)?,
            Op::Return => self.op_return()?,

            Op::MakeClosure { chunk_const, upvalue_count } => {
                self.make_closure(chunk, chunk_const, upvalue_count, next_pc)?;
            }

            Op::TrySetup(off) => self.try_setup(chunk, next_pc, off)?,
            Op::PopHandler => {
                self.handlers.pop().ok_or_else(|| LatticeError::internal("PopHandler with no installed handler"))?;
            }
            Op::Throw => {
                let v = self.pop_value()?;
                self.unwind_to_handler(v)?;
            }
            Op::DeferRegister { body_offset, scope_depth } => {
                self.defer_register(chunk, next_pc, body_offset, scope_depth)?;
            }
            Op::ScopeExit(depth) => self.scope_exit(depth)?,

            Op::StructBuild { type_name_const, field_count } => {
                self.struct_build(chunk, type_name_const, field_count)?;
            }
            Op::FieldGet(i) => self.field_get(chunk, i as u32)?,
            Op::FieldSet(i) => self.field_set(chunk, i as u32)?,
            Op::EnumBuild { enum_name_const, variant_name_const, payload_count } => {
                self.enum_build(chunk, enum_name_const, variant_name_const, payload_count)?;
            }
            Op::VariantTest(i) => self.variant_test(chunk, i as u32)?,
            Op::TupleBuild(n) => self.collection_build(n, |items| Value::tuple(items))?,
            Op::ArrayBuild(n) => self.collection_build(n, Value::array)?,
            Op::MapBuild(n) => self.map_build(n)?,
            Op::RangeBuild => self.range_build()?,
            Op::IndexGet => self.index_get()?,
            Op::IndexSet => self.index_set()?,
            Op::IterOpen => self.iter_open()?,
            Op::IterNext => self.iter_next()?,
        }
        Ok(())
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("execute only steps while frames.len() > stop_depth")
    }

    fn pop_value(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| LatticeError::from(FaultKind::StackUnderflow))
    }

    fn peek_value(&self) -> Result<&Value> {
        self.stack.last().ok_or_else(|| LatticeError::from(FaultKind::StackUnderflow))
    }

    fn jump_to(&mut self, next_pc: usize, offset: i16) {
        let target = (next_pc as i64 + offset as i64) as usize;
        let idx = self.frames.len() - 1;
        self.frames[idx].ip = target;
    }

    fn const_at<'c>(chunk: &'c Chunk, idx: u32) -> Result<&'c Value> {
        chunk.constants().get(idx as usize).ok_or_else(|| LatticeError::internal("constant index out of range"))
    }

    fn const_str<'c>(chunk: &'c Chunk, idx: u32) -> Result<&'c str> {
        match Self::const_at(chunk, idx)? {
            Value::String(s) => Ok(s),
            _ => Err(LatticeError::internal("constant is not a string where a name was expected")),
        }
    }

    fn load_const(&mut self, chunk: &Arc<Chunk>, idx: u32) -> Result<()> {
        let v = Self::const_at(chunk, idx)?.clone();
        self.push_value(v)
    }

    fn load_global(&mut self, chunk: &Arc<Chunk>, idx: u32) -> Result<()> {
        let name = Self::const_str(chunk, idx)?.to_string();
        match self.runtime.environment.get(&name) {
            Ok(v) => self.push_value(v),
            Err(_) => self.raise_fault(FaultKind::UnknownGlobal { name }),
        }
    }

    fn store_global(&mut self, chunk: &Arc<Chunk>, idx: u32) -> Result<()> {
        let name = Self::const_str(chunk, idx)?.to_string();
        let v = self.pop_value()?;
        match self.runtime.environment.set(&name, v) {
            Ok(()) => Ok(()),
            Err(_) => self.raise_fault(FaultKind::UnknownGlobal { name }),
        }
    }

    fn define_global(&mut self, chunk: &Arc<Chunk>, idx: u32) -> Result<()> {
        let name: Arc<str> = Arc::from(Self::const_str(chunk, idx)?);
        let v = self.pop_value()?;
        self.runtime.environment.define(name, v);
        Ok(())
    }

    // ---------------------------------------------------------------
    // arithmetic / bitwise / comparison
    // ---------------------------------------------------------------

    fn raise_fault(&mut self, fault: FaultKind) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::debug!(target: "lattice_core::vm", %fault, "runtime fault raised");
        let value = Value::string(fault.to_string());
        self.unwind_to_handler(value)
    }

    fn numeric_binary(a: &Value, b: &Value, iop: impl Fn(i64, i64) -> i64, fop: impl Fn(f64, f64) -> f64) -> OpResult<Value> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(iop(*x, *y))),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(fop(*x, *y))),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Float(fop(*x as f64, *y))),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(fop(*x, *y as f64))),
            (a, b) => Err(FaultKind::TypeError {
                expected: "number",
                found: if a.is_numeric() { b.value_kind().name() } else { a.value_kind().name() },
            }),
        }
    }

    fn binary_numeric(&mut self, iop: impl Fn(i64, i64) -> i64, fop: impl Fn(f64, f64) -> f64) -> Result<()> {
        let b = self.pop_value()?;
        let a = self.pop_value()?;
        match Self::numeric_binary(&a, &b, iop, fop) {
            Ok(v) => self.push_value(v),
            Err(f) => self.raise_fault(f),
        }
    }

    fn binary_add(&mut self) -> Result<()> {
        let b = self.pop_value()?;
        let a = self.pop_value()?;
        match (&a, &b) {
            (Value::String(x), Value::String(y)) => {
                let s = self.scratch.concat(x, y);
                self.push_value(Value::String(s))
            }
            _ => match Self::numeric_binary(&a, &b, i64::wrapping_add, |x, y| x + y) {
                Ok(v) => self.push_value(v),
                Err(f) => self.raise_fault(f),
            },
        }
    }

    fn binary_div(&mut self) -> Result<()> {
        let b = self.pop_value()?;
        let a = self.pop_value()?;
        let result = match (&a, &b) {
            (Value::Int(_), Value::Int(0)) => Err(FaultKind::DivisionByZero),
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_div(*y))),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x / y)),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 / y)),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x / *y as f64)),
            (a, b) => Err(FaultKind::TypeError {
                expected: "number",
                found: if a.is_numeric() { b.value_kind().name() } else { a.value_kind().name() },
            }),
        };
        match result {
            Ok(v) => self.push_value(v),
            Err(f) => self.raise_fault(f),
        }
    }

    fn binary_mod(&mut self) -> Result<()> {
        let b = self.pop_value()?;
        let a = self.pop_value()?;
        let result = match (&a, &b) {
            (Value::Int(_), Value::Int(0)) => Err(FaultKind::DivisionByZero),
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_rem(*y))),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x % y)),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 % y)),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x % *y as f64)),
            (a, b) => Err(FaultKind::TypeError {
                expected: "number",
                found: if a.is_numeric() { b.value_kind().name() } else { a.value_kind().name() },
            }),
        };
        match result {
            Ok(v) => self.push_value(v),
            Err(f) => self.raise_fault(f),
        }
    }

    fn unary_neg(&mut self) -> Result<()> {
        let a = self.pop_value()?;
        let result = match &a {
            Value::Int(x) => Ok(Value::Int(x.wrapping_neg())),
            Value::Float(x) => Ok(Value::Float(-x)),
            other => Err(FaultKind::TypeError { expected: "number", found: other.value_kind().name() }),
        };
        match result {
            Ok(v) => self.push_value(v),
            Err(f) => self.raise_fault(f),
        }
    }

    fn unary_bitnot(&mut self) -> Result<()> {
        let a = self.pop_value()?;
        let result = match &a {
            Value::Int(x) => Ok(Value::Int(!x)),
            other => Err(FaultKind::TypeError { expected: "Int", found: other.value_kind().name() }),
        };
        match result {
            Ok(v) => self.push_value(v),
            Err(f) => self.raise_fault(f),
        }
    }

    fn binary_int(&mut self, f: impl Fn(i64, i64) -> i64) -> Result<()> {
        let b = self.pop_value()?;
        let a = self.pop_value()?;
        let result = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(f(*x, *y))),
            (a, b) => Err(FaultKind::TypeError {
                expected: "Int",
                found: if matches!(a, Value::Int(_)) { b.value_kind().name() } else { a.value_kind().name() },
            }),
        };
        match result {
            Ok(v) => self.push_value(v),
            Err(f) => self.raise_fault(f),
        }
    }

    fn compare(&mut self, test: impl Fn(std::cmp::Ordering) -> bool) -> Result<()> {
        let b = self.pop_value()?;
        let a = self.pop_value()?;
        let ordering = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
            (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).ok_or(FaultKind::TypeError {
                expected: "a non-NaN Float",
                found: "Float",
            }),
            (Value::String(x), Value::String(y)) => Ok(x.as_bytes().cmp(y.as_bytes())),
            _ => Err(FaultKind::TypeError { expected: "two Ints, two Floats, or two Strings", found: b.value_kind().name() }),
        };
        match ordering {
            Ok(o) => self.push_value(Value::Bool(test(o))),
            Err(f) => self.raise_fault(f),
        }
    }

    // ---------------------------------------------------------------
    // calls / return
    // ---------------------------------------------------------------

    pub(crate) fn begin_call(&mut self, argc: u8) -> Result<()> {
        let argc = argc as usize;
        if argc > self.stack.len() {
            return Err(LatticeError::internal("Call operand exceeds available stack"));
        }
        let callee_index = self.stack.len() - argc - 1;
        let callee = self.stack[callee_index].clone();

        match &callee {
            Value::Closure(c) if c.is_native() => {
                let native = c.native.clone().expect("checked by is_native");
                let args: Vec<Value> = self.stack[callee_index + 1..].to_vec();
                let result = native(self, &args);
                self.stack.truncate(callee_index);
                match result {
                    Ok(v) => self.push_value(v),
                    Err(LatticeError::Fault(f)) => self.raise_fault(f),
                    Err(e) => Err(e),
                }
            }
            Value::Closure(c) => {
                let param_count = c.param_count as usize;
                if c.variadic {
                    let fixed = param_count.saturating_sub(1);
                    if argc < fixed {
                        return self.raise_fault(FaultKind::ArityMismatch { expected: fixed as u8, found: argc as u8 });
                    }
                    let extra = self.stack.split_off(callee_index + 1 + fixed);
                    self.push_value(Value::array(extra))?;
                } else if argc > param_count {
                    return self.raise_fault(FaultKind::ArityMismatch { expected: param_count as u8, found: argc as u8 });
                } else if argc < param_count {
                    let missing = param_count - argc;
                    if missing > c.defaults.len() {
                        return self.raise_fault(FaultKind::ArityMismatch { expected: param_count as u8, found: argc as u8 });
                    }
                    let start = c.defaults.len() - missing;
                    let fill: Vec<Value> = c.defaults[start..].to_vec();
                    for v in fill {
                        self.push_value(v)?;
                    }
                }
                let body = match &c.body {
                    Some(b) => b.clone(),
                    None => return Err(LatticeError::internal("closure has neither a native fn nor a body")),
                };
                let upvalues = c.upvalues.clone();
                self.next_frame_slot_base_override = Some(callee_index);
                self.push_frame(body, upvalues, Vec::new(), None)
            }
            _ => self.raise_fault(FaultKind::NotCallable),
        }
    }

    fn op_return(&mut self) -> Result<()> {
        let retval = self.pop_value()?;
        let frame = self.frames.pop().ok_or_else(|| LatticeError::internal("Return with no active frame"))?;
        #[cfg(feature = "tracing")]
        tracing::trace!(
            target: "lattice_core::vm",
            chunk = frame.name.as_deref().unwrap_or("<anonymous>"),
            depth = self.frames.len() + 1,
            "frame exit"
        );
        self.run_owned_defers(&frame)?;
        self.finish_frame(&frame);
        self.handlers.truncate(frame.handler_base);
        self.push_value(retval)
    }

    /// Closes upvalues and truncates the stack for a frame that is ending,
    /// normally or via exception unwind. A no-op on upvalue closing for a
    /// defer frame (`cleanup_base.is_some()`) since its slots alias the
    /// still-live parent frame's.
    fn finish_frame(&mut self, frame: &CallFrame) {
        if frame.cleanup_base.is_none() {
            self.open_upvalues.close_from(frame.slot_base, &self.stack);
        }
        self.stack.truncate(frame.truncate_point());
    }

    fn run_owned_defers(&mut self, frame: &CallFrame) -> Result<()> {
        let upvalues = frame.upvalues.clone();
        while self.defers.len() > frame.defer_base {
            let entry = self.defers.pop().expect("len checked by while condition");
            self.run_defer_entry(entry, upvalues.clone())?;
        }
        Ok(())
    }

    /// Runs one defer body to completion, sharing the registering frame's
    /// slots (§4.4.4: "as if it were a one-shot inline block").
    fn run_defer_entry(&mut self, entry: DeferEntry, upvalues: Vec<Arc<Upvalue>>) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::trace!(target: "lattice_core::vm", body_ip = entry.body_ip, frame_index = entry.frame_index, "defer executed");
        let depth_before = self.frames.len();
        let cleanup_base = self.stack.len();
        self.next_frame_slot_base_override = Some(entry.slot_base);
        self.push_frame(entry.chunk.clone(), upvalues, Vec::new(), Some(cleanup_base))?;
        self.frames.last_mut().expect("just pushed").ip = entry.body_ip;
        self.execute(depth_before).map(|_| ())
    }

    // ---------------------------------------------------------------
    // closures
    // ---------------------------------------------------------------

    fn make_closure(&mut self, chunk: &Arc<Chunk>, chunk_const: u16, upvalue_count: u8, next_pc: usize) -> Result<()> {
        let template = match Self::const_at(chunk, chunk_const as u32)? {
            Value::Closure(c) => c.clone(),
            _ => return Err(LatticeError::internal("MakeClosure constant is not a closure template")),
        };

        let descriptor_bytes = 2 * upvalue_count as usize;
        let code = chunk.code();
        if next_pc + descriptor_bytes > code.len() {
            return Err(LatticeError::internal("MakeClosure upvalue descriptors run past end of code"));
        }

        let enclosing_upvalues = self.current_frame().upvalues.clone();
        let slot_base = self.current_frame().slot_base;
        let mut captured = Vec::with_capacity(upvalue_count as usize);
        for i in 0..upvalue_count as usize {
            let is_local = code[next_pc + 2 * i] != 0;
            let index = code[next_pc + 2 * i + 1] as usize;
            let up = if is_local {
                self.open_upvalues.capture(slot_base + index)
            } else {
                enclosing_upvalues
                    .get(index)
                    .cloned()
                    .ok_or_else(|| LatticeError::internal("non-local upvalue index out of bounds"))?
            };
            captured.push(up);
        }
        {
            let idx = self.frames.len() - 1;
            self.frames[idx].ip = next_pc + descriptor_bytes;
        }

        let closure = ClosureObj {
            param_count: template.param_count,
            param_names: template.param_names.clone(),
            variadic: template.variadic,
            defaults: template.defaults.clone(),
            body: template.body.clone(),
            upvalues: captured,
            native: None,
            name: template.name.clone(),
        };
        self.push_value(Value::Closure(Arc::new(closure)))
    }

    // ---------------------------------------------------------------
    // exceptions / defers
    // ---------------------------------------------------------------

    fn try_setup(&mut self, chunk: &Arc<Chunk>, next_pc: usize, offset: i16) -> Result<()> {
        if self.handlers.len() >= self.limits.handler_stack {
            return Err(LatticeError::from(crate::error::LimitKind::HandlerStackOverflow { capacity: self.limits.handler_stack }));
        }
        let resume_ip = (next_pc as i64 + offset as i64) as usize;
        self.handlers.push(HandlerEntry {
            resume_ip,
            chunk: chunk.clone(),
            frame_index: self.frames.len() - 1,
            stack_top: self.stack.len(),
            defer_top: self.defers.len(),
        });
        Ok(())
    }

    fn defer_register(&mut self, chunk: &Arc<Chunk>, next_pc: usize, body_offset: i16, scope_depth: u8) -> Result<()> {
        if self.defers.len() >= self.limits.defer_stack {
            return Err(LatticeError::from(crate::error::LimitKind::DeferStackOverflow { capacity: self.limits.defer_stack }));
        }
        let body_ip = (next_pc as i64 + body_offset as i64) as usize;
        let frame = self.current_frame();
        self.defers.push(DeferEntry {
            body_ip,
            chunk: chunk.clone(),
            frame_index: self.frames.len() - 1,
            slot_base: frame.slot_base,
            scope_depth,
        });
        Ok(())
    }

    fn scope_exit(&mut self, depth: u8) -> Result<()> {
        let defer_base = self.current_frame().defer_base;
        let upvalues = self.current_frame().upvalues.clone();
        loop {
            match self.defers.last() {
                Some(entry) if self.defers.len() > defer_base && entry.scope_depth > depth => {
                    let entry = self.defers.pop().expect("just matched");
                    self.run_defer_entry(entry, upvalues.clone())?;
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Transfers control to the nearest exception handler, running every
    /// defer registered since (frames discarded along the way, then the
    /// handler's own frame since it installed its `try`), or propagates as
    /// an uncaught-exception error if the handler stack is empty (§4.4.4).
    fn unwind_to_handler(&mut self, value: Value) -> Result<()> {
        let handler = match self.handlers.pop() {
            Some(h) => h,
            None => return Err(LatticeError::from(FaultKind::UncaughtException(value.to_string()))),
        };

        while self.frames.len() > handler.frame_index + 1 {
            let frame = self.frames.pop().expect("frames.len() checked by while condition");
            self.run_owned_defers(&frame)?;
            self.finish_frame(&frame);
        }

        let owner_upvalues = self.current_frame().upvalues.clone();
        while self.defers.len() > handler.defer_top {
            let entry = self.defers.pop().expect("len checked by while condition");
            self.run_defer_entry(entry, owner_upvalues.clone())?;
        }

        self.stack.truncate(handler.stack_top);
        self.push_value(value)?;
        let idx = self.frames.len() - 1;
        self.frames[idx].ip = handler.resume_ip;
        Ok(())
    }

    // ---------------------------------------------------------------
    // structs / enums / collections
    // ---------------------------------------------------------------

    fn struct_build(&mut self, chunk: &Arc<Chunk>, type_name_const: u16, field_count: u8) -> Result<()> {
        let type_name = Self::const_str(chunk, type_name_const as u32)?;
        let layout = self.runtime.struct_registry.fields_of(type_name);
        let field_names = match layout {
            Some(f) => f,
            None => return self.raise_fault(FaultKind::Custom(format!("unknown struct type `{type_name}`"))),
        };
        if field_names.len() != field_count as usize {
            return self.raise_fault(FaultKind::ArityMismatch {
                expected: field_names.len() as u8,
                found: field_count,
            });
        }
        let mut values = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            values.push(self.pop_value()?);
        }
        values.reverse();
        let fields = field_names.into_iter().zip(values).collect();
        let type_name: Arc<str> = Arc::from(type_name);
        self.push_value(Value::Struct(Arc::new(parking_lot::RwLock::new(StructObj { type_name, fields }))))
    }

    fn field_get(&mut self, chunk: &Arc<Chunk>, idx: u32) -> Result<()> {
        let name = Self::const_str(chunk, idx)?.to_string();
        let target = self.pop_value()?;
        match &target {
            Value::Struct(s) => {
                let guard = s.read();
                match guard.get_field(&name) {
                    Some(v) => {
                        let v = v.clone();
                        drop(guard);
                        self.push_value(v)
                    }
                    None => {
                        let struct_name = guard.type_name.to_string();
                        drop(guard);
                        self.raise_fault(FaultKind::UnknownField { struct_name, field: name })
                    }
                }
            }
            other => self.raise_fault(FaultKind::TypeError { expected: "Struct", found: other.value_kind().name() }),
        }
    }

    fn field_set(&mut self, chunk: &Arc<Chunk>, idx: u32) -> Result<()> {
        let name = Self::const_str(chunk, idx)?.to_string();
        let value = self.pop_value()?;
        let target = self.pop_value()?;
        match &target {
            Value::Struct(s) => {
                let mut guard = s.write();
                if guard.set_field(&name, value) {
                    let struct_name = guard.type_name.clone();
                    drop(guard);
                    let _ = struct_name;
                    self.push_value(target)
                } else {
                    let struct_name = guard.type_name.to_string();
                    drop(guard);
                    self.raise_fault(FaultKind::UnknownField { struct_name, field: name })
                }
            }
            other => self.raise_fault(FaultKind::TypeError { expected: "Struct", found: other.value_kind().name() }),
        }
    }

    fn enum_build(&mut self, chunk: &Arc<Chunk>, enum_name_const: u16, variant_name_const: u16, payload_count: u8) -> Result<()> {
        let enum_name: Arc<str> = Arc::from(Self::const_str(chunk, enum_name_const as u32)?);
        let variant_name: Arc<str> = Arc::from(Self::const_str(chunk, variant_name_const as u32)?);
        let mut payload = Vec::with_capacity(payload_count as usize);
        for _ in 0..payload_count {
            payload.push(self.pop_value()?);
        }
        payload.reverse();
        let payload = if payload.is_empty() { None } else { Some(payload) };
        self.push_value(Value::Enum(Arc::new(EnumObj { enum_name, variant_name, payload })))
    }

    fn variant_test(&mut self, chunk: &Arc<Chunk>, idx: u32) -> Result<()> {
        let variant_name = Self::const_str(chunk, idx)?;
        let target = self.pop_value()?;
        match &target {
            Value::Enum(e) => {
                let matches = &*e.variant_name == variant_name;
                self.push_value(Value::Bool(matches))
            }
            other => self.raise_fault(FaultKind::TypeError { expected: "Enum", found: other.value_kind().name() }),
        }
    }

    fn collection_build(&mut self, n: u16, make: impl Fn(Vec<Value>) -> Value) -> Result<()> {
        let n = n as usize;
        if n > self.stack.len() {
            return Err(LatticeError::internal("collection-build operand exceeds available stack"));
        }
        let items = self.stack.split_off(self.stack.len() - n);
        self.push_value(make(items))
    }

    fn map_build(&mut self, n: u16) -> Result<()> {
        let n = n as usize;
        if 2 * n > self.stack.len() {
            return Err(LatticeError::internal("MapBuild operand exceeds available stack"));
        }
        let pairs = self.stack.split_off(self.stack.len() - 2 * n);
        let mut map = ahash::AHashMap::with_capacity(n);
        for chunk in pairs.chunks(2) {
            let key = match &chunk[0] {
                Value::String(s) => s.clone(),
                other => {
                    return self.raise_fault(FaultKind::TypeError { expected: "String key", found: other.value_kind().name() })
                }
            };
            map.insert(key, chunk[1].clone());
        }
        self.push_value(Value::Map(Arc::new(parking_lot::RwLock::new(map))))
    }

    fn range_build(&mut self) -> Result<()> {
        let step = self.pop_value()?;
        let end = self.pop_value()?;
        let start = self.pop_value()?;
        match (start.as_i64(), end.as_i64(), step.as_i64()) {
            (Ok(start), Ok(end), Ok(step)) => self.push_value(Value::Range(LatRange { start, end, step })),
            _ => self.raise_fault(FaultKind::TypeError { expected: "Int", found: "non-Int range bound" }),
        }
    }

    // ---------------------------------------------------------------
    // indexing / iteration
    // ---------------------------------------------------------------

    fn index_to_usize(index: &Value, len: usize) -> OpResult<usize> {
        match index {
            Value::Int(i) if *i >= 0 && (*i as usize) < len => Ok(*i as usize),
            Value::Int(i) => Err(FaultKind::IndexOutOfBounds { index: *i, len }),
            other => Err(FaultKind::TypeError { expected: "Int index", found: other.value_kind().name() }),
        }
    }

    fn index_get(&mut self) -> Result<()> {
        let index = self.pop_value()?;
        let container = self.pop_value()?;
        let result = match &container {
            Value::Array(a) => {
                let guard = a.read();
                Self::index_to_usize(&index, guard.len()).map(|i| guard[i].clone())
            }
            Value::Tuple(items) => Self::index_to_usize(&index, items.len()).map(|i| items[i].clone()),
            Value::Buffer(b) => {
                let guard = b.read();
                Self::index_to_usize(&index, guard.len()).map(|i| Value::Int(guard[i] as i64))
            }
            Value::Map(m) => match &index {
                Value::String(key) => m.read().get(key).cloned().ok_or(FaultKind::KeyNotFound),
                other => Err(FaultKind::TypeError { expected: "String key", found: other.value_kind().name() }),
            },
            other => Err(FaultKind::TypeError { expected: "an indexable value", found: other.value_kind().name() }),
        };
        match result {
            Ok(v) => self.push_value(v),
            Err(f) => self.raise_fault(f),
        }
    }

    fn index_set(&mut self) -> Result<()> {
        let value = self.pop_value()?;
        let index = self.pop_value()?;
        let container = self.pop_value()?;
        let result: OpResult<()> = match &container {
            Value::Array(a) => {
                let mut guard = a.write();
                let len = guard.len();
                Self::index_to_usize(&index, len).map(|i| guard[i] = value.clone())
            }
            Value::Buffer(b) => {
                let mut guard = b.write();
                let len = guard.len();
                match (Self::index_to_usize(&index, len), &value) {
                    (Ok(i), Value::Int(n)) if (0..=255).contains(n) => {
                        guard[i] = *n as u8;
                        Ok(())
                    }
                    (Ok(_), other) => {
                        Err(FaultKind::TypeError { expected: "a byte (0..=255)", found: other.value_kind().name() })
                    }
                    (Err(f), _) => Err(f),
                }
            }
            Value::Map(m) => match &index {
                Value::String(key) => {
                    m.write().insert(key.clone(), value.clone());
                    Ok(())
                }
                other => Err(FaultKind::TypeError { expected: "String key", found: other.value_kind().name() }),
            },
            Value::Tuple(_) => Err(FaultKind::TypeError { expected: "a mutable container", found: "Tuple" }),
            other => Err(FaultKind::TypeError { expected: "an indexable mutable container", found: other.value_kind().name() }),
        };
        match result {
            Ok(()) => self.push_value(container),
            Err(f) => self.raise_fault(f),
        }
    }

    fn iter_open(&mut self) -> Result<()> {
        let container = self.pop_value()?;
        let driver: OpResult<Box<dyn crate::value::LatticeIterator>> = match &container {
            Value::Array(a) => Ok(Box::new(ArrayIter::new(a.read().clone()))),
            Value::Range(r) => Ok(Box::new(RangeIter::new(r.start, r.end, r.step))),
            Value::Set(s) => Ok(Box::new(ArrayIter::new(s.read().iter_values().collect()))),
            Value::Map(m) => {
                let items = m.read().iter().map(|(k, v)| Value::tuple(vec![Value::String(k.clone()), v.clone()])).collect();
                Ok(Box::new(ArrayIter::new(items)))
            }
            other => Err(FaultKind::TypeError { expected: "an iterable value", found: other.value_kind().name() }),
        };
        match driver {
            Ok(driver) => self.push_value(Value::Iterator(Arc::new(parking_lot::Mutex::new(driver)))),
            Err(f) => self.raise_fault(f),
        }
    }

    fn iter_next(&mut self) -> Result<()> {
        let it = self.pop_value()?;
        match &it {
            Value::Iterator(driver) => {
                let next = driver.lock().next_value();
                self.push_value(next.unwrap_or(Value::Nil))
            }
            other => {
                let kind = other.value_kind().name();
                self.raise_fault(FaultKind::TypeError { expected: "Iterator", found: kind })
            }
        }
    }
}
