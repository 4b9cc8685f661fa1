//! The opcode dispatch loop (spec §4/§6): the register/call-frame stack
//! machine that actually runs compiled Lily functions, wiring together
//! every other module in this crate — `gc`, `raiser`, `closure`, `hash`,
//! `list`, `value_ops`, `ffi`, and `coroutine` — the way the teacher's own
//! interpreter loop (deleted from this workspace) wired together its
//! stack/raiser/closures/GC modules.
//!
//! `Shared` holds everything a coroutine's nested VM must see in common
//! with its parent (the heap's GC, the constant/global pools, the foreign
//! module registry, the siphash key) — state.rs's embedding API owns one
//! per `State`. `Interpreter` is the part that is NOT shared: one register
//! stack, one call stack, one jump stack per active VM, exactly the split
//! spec §4.8 draws between "each coroutine owns a nested VM" and the
//! single heap/GC they all still share.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use lily_core::error::{ExceptionClass, RaiseError};
use lily_core::heap::{
    ContainerKind, ContainerObj, CoroutineObj, CoroutineStatus, FunctionObj, HashObj, NativeFn,
};
use lily_core::value::{Cell, Value};

use crate::closure::{self, UpvalueSource};
use crate::coroutine::{BodyOutcome, CoroutineBody, CoroutineChannel, CoroutineEngine, ResumeOutcome};
use crate::ffi::{ForeignCallBridge, ForeignContext, ModuleRegistry, VmInvoker};
use crate::frame::{CallFrame, RegisterStack};
use crate::gc::Collector;
use crate::opcode::{ArithOp, BitwiseOp, CompareOp, Decoder, Opcode, ShiftOp};
use crate::pool::FramePool;
use crate::raiser::{JumpSource, Raiser};
use crate::scheduler::Scheduler;
use crate::{hash, value_ops};

/// State every VM sharing one heap needs in common. A coroutine's nested
/// VM is built over `Rc::clone` of its parent's `Shared`, never a copy —
/// they allocate into, and get collected against, the same heap.
pub struct Shared {
    pub gc: Collector,
    pub modules: ModuleRegistry,
    pub constants: Vec<Value>,
    pub globals: HashMap<u16, Value>,
    pub class_field_counts: HashMap<u32, usize>,
    pub case_tables: Vec<HashMap<u32, i16>>,
    pub sipkey: [u8; 16],
    pub scheduler: Scheduler,
}

impl Shared {
    pub fn new(gc_start: usize, gc_multiplier: usize, sipkey: [u8; 16]) -> Self {
        Shared {
            gc: Collector::new(gc_start, gc_multiplier),
            modules: ModuleRegistry::new(),
            constants: Vec::new(),
            globals: HashMap::new(),
            class_field_counts: HashMap::new(),
            case_tables: Vec::new(),
            sipkey,
            scheduler: Scheduler::new(),
        }
    }
}

/// Maps an `Except` clause's `class_id` operand onto a built-in exception
/// class. Emission is out of scope, so there is no real class table to
/// consult here; the reserved ids below (plus `u16::MAX` as a catch-all)
/// are the only thing a hand-written or assembled bytecode body can
/// target. A `class_id` naming a user-defined `Exception` subclass has no
/// numeric slot in this scheme and simply never matches — a documented
/// limitation of running without the out-of-scope symbol table, not a
/// runtime-core defect.
fn builtin_class_for_id(id: u16) -> Option<ExceptionClass> {
    match id {
        0 => Some(ExceptionClass::RuntimeError),
        1 => Some(ExceptionClass::ValueError),
        2 => Some(ExceptionClass::IndexError),
        3 => Some(ExceptionClass::KeyError),
        4 => Some(ExceptionClass::IOError),
        5 => Some(ExceptionClass::SyntaxError),
        6 => Some(ExceptionClass::DivisionByZeroError),
        _ => None,
    }
}

/// One active VM: its own register window, call stack, jump stack, and the
/// scratch state a handful of opcodes need between instructions
/// (`MakeCell`'s freshly-promoted cells awaiting a `MakeFunction`, and the
/// exception currently in flight between a `Raise`/propagated error and
/// the `Except` clause that claims it).
pub struct Interpreter {
    shared: Rc<RefCell<Shared>>,
    registers: RegisterStack,
    /// Pool slot indices, one per live call, innermost last —
    /// `call_stack.len()` is call depth exactly as it was when this held
    /// `CallFrame`s directly; the frames themselves live in `pool` and are
    /// acquired/released rather than allocated/dropped per call.
    call_stack: Vec<usize>,
    pool: FramePool,
    raiser: Raiser,
    try_stack: Vec<TryRecord>,
    pending_cells: Vec<Rc<RefCell<Cell>>>,
    pending_exception: Option<RaiseError>,
    /// Set only on a coroutine's nested VM (`bind_coroutine`); `Yield`'s
    /// dispatch arm reaches through this to suspend back to the `resume`
    /// call site. `None` on every ordinary (non-coroutine) `Interpreter`,
    /// where a `Yield` opcode is simply a runtime error.
    coroutine_channel: Option<CoroutineChannel>,
}

struct TryRecord {
    call_depth: usize,
    handler_pc: usize,
}

impl Interpreter {
    pub fn new(shared: Rc<RefCell<Shared>>) -> Self {
        Interpreter {
            shared,
            registers: RegisterStack::new(),
            call_stack: Vec::new(),
            pool: FramePool::new(),
            raiser: Raiser::new(),
            try_stack: Vec::new(),
            pending_cells: Vec::new(),
            pending_exception: None,
            coroutine_channel: None,
        }
    }

    pub fn shared(&self) -> Rc<RefCell<Shared>> {
        Rc::clone(&self.shared)
    }

    pub fn raiser(&self) -> &Raiser {
        &self.raiser
    }

    /// Marks this VM as a coroutine's nested VM (spec §4.8): stashes the
    /// channel `Yield` dispatches through, and opens the "base frame" jump
    /// record `build` conceptually holds, so the `Vm`-source record
    /// `call_native` pushes for the coroutine's top-level call brings the
    /// stack to exactly two — the depth `has_exactly_two_records` expects
    /// at the point a top-level `yield` actually runs.
    pub fn bind_coroutine(&mut self, channel: CoroutineChannel) {
        self.coroutine_channel = Some(channel);
        self.raiser.push_jump(0, JumpSource::Raw);
    }

    /// `execute`: the embedding-level entry point — runs `function` to
    /// completion with `args` and returns its value or the unhandled raise.
    pub fn execute(&mut self, function: &Rc<RefCell<FunctionObj>>, args: &[Value]) -> Result<Value, RaiseError> {
        self.call_function(function, args)
    }

    fn call_function(&mut self, function: &Rc<RefCell<FunctionObj>>, args: &[Value]) -> Result<Value, RaiseError> {
        if function.borrow().is_foreign() {
            self.call_foreign(function, args)
        } else {
            self.call_native(function, args)
        }
    }

    fn call_foreign(&mut self, function: &Rc<RefCell<FunctionObj>>, args: &[Value]) -> Result<Value, RaiseError> {
        if function.borrow().foreign.is_none() {
            return Err(self.raise_here(RaiseError::runtime("call: function has no foreign body.")));
        }

        let mut scratch = RegisterStack::new();
        scratch.reserve_through(args.len() + 1);
        for (i, a) in args.iter().enumerate() {
            scratch.init(i, a.clone());
        }
        let return_slot = args.len();
        scratch.init(return_slot, Value::Unit);

        let mut modules = std::mem::take(&mut self.shared.borrow_mut().modules);
        let call_result = {
            let mut ctx = ForeignContext::new(&mut scratch, 0, args.len(), Some(return_slot), self, &mut modules);
            let mut bridge = ForeignCallBridge::new(&mut ctx);
            let f = function.borrow();
            match &f.foreign {
                Some(NativeFn::Foreign(native)) => native(&mut bridge as &mut dyn std::any::Any),
                None => unreachable!("checked above"),
            }
        };
        self.shared.borrow_mut().modules = modules;
        call_result?;
        Ok(scratch.get(return_slot).clone())
    }

    fn call_native(&mut self, function: &Rc<RefCell<FunctionObj>>, args: &[Value]) -> Result<Value, RaiseError> {
        let (reg_count, code, upvalues, module, name) = {
            let f = function.borrow();
            let code = f
                .code
                .clone()
                .ok_or_else(|| RaiseError::runtime("call: function has no compiled body."))?;
            (f.reg_count as usize, code, f.upvalues.clone(), f.proto_module.clone(), f.proto_name.clone())
        };

        let start = self.registers.len();
        let slot_count = reg_count.max(args.len());
        let end = start + slot_count;
        self.registers.reserve_through(end);
        for (i, a) in args.iter().enumerate() {
            self.registers.init(start + i, a.clone());
        }
        for i in args.len()..slot_count {
            self.registers.init(start + i, Value::Unset);
        }

        let idx = self.pool.acquire(start, end, None);
        let frame = self.pool.get_mut(idx);
        frame.owner = Some(Rc::clone(function));
        frame.upvalues = upvalues;
        frame.module = module;
        frame.function = name;
        self.call_stack.push(idx);
        self.raiser.enter_frame();
        self.raiser.push_jump(self.call_stack.len(), JumpSource::Vm);

        let result = self.run_frame(&code);

        self.raiser.pop_jump();
        self.raiser.exit_frame();
        let idx = self.call_stack.pop().expect("call_native always pushed one");
        self.pool.release(idx);
        // `RegisterStack` never shrinks back (its growth policy only grows
        // by doubling, matching the teacher's own contiguous-array stack);
        // a finished frame's slots are simply left behind as slack until
        // the next `reserve_through` reuses them.
        result
    }

    fn frame(&self, frame_idx: usize) -> &CallFrame {
        self.pool.get(self.call_stack[frame_idx])
    }

    fn frame_mut(&mut self, frame_idx: usize) -> &mut CallFrame {
        self.pool.get_mut(self.call_stack[frame_idx])
    }

    fn raise_here(&self, mut err: RaiseError) -> RaiseError {
        if err.traceback.is_empty() {
            let frames = self.call_stack.iter().map(|&idx| self.pool.get(idx));
            self.raiser.attach_traceback(&mut err, frames);
        }
        err
    }

    fn reg_get(&self, frame_idx: usize, rel: u16) -> Value {
        let start = self.frame(frame_idx).start;
        self.registers.get(start + rel as usize).clone()
    }

    fn reg_set(&mut self, frame_idx: usize, rel: u16, value: Value) {
        let start = self.frame(frame_idx).start;
        self.registers.set(start + rel as usize, value);
    }

    fn run_frame(&mut self, code: &lily_core::heap::Bytecode) -> Result<Value, RaiseError> {
        loop {
            let frame_idx = self.call_stack.len() - 1;
            let pc = self.frame(frame_idx).pc;
            if pc >= code.len() {
                return Ok(Value::Unit);
            }

            let mut dec = Decoder::new(code, pc);
            let inst = dec.decode();
            let new_pc = dec.position();
            let frame = self.frame_mut(frame_idx);
            frame.pc = new_pc;
            frame.line = inst.line;

            match self.dispatch(frame_idx, inst.op) {
                Ok(Some(v)) => return Ok(v),
                Ok(None) => continue,
                Err(e) => {
                    let e = self.raise_here(e);
                    if let Some(jump_pc) = self.catch_at(frame_idx, e.clone()) {
                        self.frame_mut(frame_idx).pc = jump_pc;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// If a `try` block opened in this same frame can claim `err`, pops it
    /// and returns the handler's pc; otherwise the error keeps propagating.
    fn catch_at(&mut self, frame_idx: usize, err: RaiseError) -> Option<usize> {
        let frame_len = frame_idx + 1;
        if matches!(self.try_stack.last(), Some(rec) if rec.call_depth == frame_len) {
            let rec = self.try_stack.pop().unwrap();
            self.pending_exception = Some(err);
            Some(rec.handler_pc)
        } else {
            None
        }
    }

    /// Runs one instruction. `Ok(Some(v))` means the frame returned `v`;
    /// `Ok(None)` means keep looping; `Err` is a raise still looking for a
    /// handler.
    fn dispatch(&mut self, frame_idx: usize, op: Opcode) -> Result<Option<Value>, RaiseError> {
        match op {
            Opcode::Assign { dest, src } | Opcode::RefAssign { dest, src } => {
                let v = self.reg_get(frame_idx, src);
                self.reg_set(frame_idx, dest, v);
                Ok(None)
            }

            Opcode::Arith { op, dest, left, right } => {
                let l = self.reg_get(frame_idx, left);
                let r = self.reg_get(frame_idx, right);
                let v = arith(op, &l, &r)?;
                self.reg_set(frame_idx, dest, v);
                Ok(None)
            }
            Opcode::Shift { op, dest, left, right } => {
                let l = self.reg_get(frame_idx, left).as_integer().expect("shift left operand must be Integer");
                let r = self.reg_get(frame_idx, right).as_integer().expect("shift right operand must be Integer") as u32;
                let v = match op {
                    ShiftOp::Left => l.wrapping_shl(r),
                    ShiftOp::Right => l.wrapping_shr(r),
                };
                self.reg_set(frame_idx, dest, Value::Integer(v));
                Ok(None)
            }
            Opcode::Bitwise { op, dest, left, right } => {
                let l = self.reg_get(frame_idx, left).as_integer().expect("bitwise left operand must be Integer");
                let r = self.reg_get(frame_idx, right).as_integer().expect("bitwise right operand must be Integer");
                let v = match op {
                    BitwiseOp::And => l & r,
                    BitwiseOp::Or => l | r,
                    BitwiseOp::Xor => l ^ r,
                };
                self.reg_set(frame_idx, dest, Value::Integer(v));
                Ok(None)
            }
            Opcode::Compare { op, dest, left, right } => {
                let l = self.reg_get(frame_idx, left);
                let r = self.reg_get(frame_idx, right);
                let v = compare(op, &l, &r)?;
                self.reg_set(frame_idx, dest, Value::Boolean(v));
                Ok(None)
            }

            Opcode::Jump { offset } => {
                self.jump(frame_idx, offset);
                Ok(None)
            }
            Opcode::JumpIfFalse { cond, offset } => {
                let c = self.reg_get(frame_idx, cond).as_boolean().expect("jump condition must be Boolean");
                if !c {
                    self.jump(frame_idx, offset);
                }
                Ok(None)
            }
            Opcode::JumpIfTrue { cond, offset } => {
                let c = self.reg_get(frame_idx, cond).as_boolean().expect("jump condition must be Boolean");
                if c {
                    self.jump(frame_idx, offset);
                }
                Ok(None)
            }

            // `stop` is unused here: `IntegerFor` re-reads it fresh each
            // iteration rather than trusting a snapshot taken at setup.
            Opcode::ForSetup { counter, start, stop: _, step } => {
                let start_v = self.reg_get(frame_idx, start).as_integer().expect("for start must be Integer");
                let step_v = self.reg_get(frame_idx, step).as_integer().expect("for step must be Integer");
                if step_v == 0 {
                    return Err(RaiseError::runtime("For loop step cannot be zero."));
                }
                self.reg_set(frame_idx, counter, Value::Integer(start_v));
                Ok(None)
            }
            Opcode::IntegerFor { counter, stop, step, offset } => {
                let step_v = self.reg_get(frame_idx, step).as_integer().expect("for step must be Integer");
                let stop_v = self.reg_get(frame_idx, stop).as_integer().expect("for stop must be Integer");
                let next = self.reg_get(frame_idx, counter).as_integer().expect("for counter must be Integer") + step_v;
                self.reg_set(frame_idx, counter, Value::Integer(next));
                let still_in_range = if step_v > 0 { next <= stop_v } else { next >= stop_v };
                if still_in_range {
                    self.jump(frame_idx, offset);
                }
                Ok(None)
            }

            Opcode::CallNative { function, args_start, argc, dest } => {
                let func = self.reg_get(frame_idx, function);
                let args = self.collect_args(frame_idx, args_start, argc);
                let f = match func {
                    Value::Function(f) => f,
                    other => return Err(RaiseError::runtime(format!("call: not a Function value (got {:?}).", other.base()))),
                };
                let result = self.call_function(&f, &args)?;
                self.reg_set(frame_idx, dest, result);
                Ok(None)
            }
            Opcode::CallForeign { function, args_start, argc, dest } => {
                let func = self.reg_get(frame_idx, function);
                let args = self.collect_args(frame_idx, args_start, argc);
                let f = match func {
                    Value::Function(f) => f,
                    other => return Err(RaiseError::runtime(format!("call: not a Function value (got {:?}).", other.base()))),
                };
                let result = self.call_foreign(&f, &args)?;
                self.reg_set(frame_idx, dest, result);
                Ok(None)
            }

            Opcode::ReturnVal { src } => Ok(Some(self.reg_get(frame_idx, src))),
            Opcode::ReturnUnit => Ok(Some(Value::Unit)),
            Opcode::ReturnFromVm => Ok(Some(Value::Unit)),

            Opcode::BuildList { dest, values_start, count } => {
                let values = self.collect_args(frame_idx, values_start, count);
                let obj = Rc::new(RefCell::new(ContainerObj::new(ContainerKind::List, 0, values)));
                self.gc_tag_container(&obj);
                self.reg_set(frame_idx, dest, Value::List(obj));
                Ok(None)
            }
            Opcode::BuildTuple { dest, values_start, count } => {
                let values = self.collect_args(frame_idx, values_start, count);
                let obj = Rc::new(RefCell::new(ContainerObj::new(ContainerKind::Tuple, 0, values)));
                self.gc_tag_container(&obj);
                self.reg_set(frame_idx, dest, Value::Tuple(obj));
                Ok(None)
            }
            Opcode::BuildHash { dest, pairs_start, count } => {
                let flat = self.collect_args(frame_idx, pairs_start, count * 2);
                let mut table = HashObj::new((count as usize).max(1));
                let sipkey = self.shared.borrow().sipkey;
                for pair in flat.chunks(2) {
                    hash::set(&mut table, pair[0].clone(), pair[1].clone(), &sipkey)?;
                }
                let obj = Rc::new(RefCell::new(table));
                let entry = self.shared.borrow_mut().gc.register(&obj);
                obj.borrow_mut().gc_entry = Some(entry);
                self.reg_set(frame_idx, dest, Value::Hash(obj));
                Ok(None)
            }
            Opcode::BuildVariant { dest, class_id, values_start, count } => {
                let values = self.collect_args(frame_idx, values_start, count);
                if values.is_empty() {
                    self.reg_set(frame_idx, dest, Value::EmptyVariant(class_id as u32));
                } else {
                    let obj = Rc::new(RefCell::new(ContainerObj::new(ContainerKind::Variant, class_id as u32, values)));
                    self.gc_tag_container(&obj);
                    self.reg_set(frame_idx, dest, Value::Variant(obj));
                }
                Ok(None)
            }
            Opcode::NewInstance { dest, class_id } => {
                let field_count = self.shared.borrow().class_field_counts.get(&(class_id as u32)).copied().unwrap_or(0);
                let values = vec![Value::Unit; field_count];
                let obj = Rc::new(RefCell::new(ContainerObj::new(ContainerKind::Instance, class_id as u32, values)));
                self.gc_tag_container(&obj);
                self.reg_set(frame_idx, dest, Value::Instance(obj));
                Ok(None)
            }

            Opcode::GetItem { dest, container, index } => {
                let c = self.reg_get(frame_idx, container);
                let i = self.reg_get(frame_idx, index);
                let v = self.get_item(&c, &i)?;
                self.reg_set(frame_idx, dest, v);
                Ok(None)
            }
            Opcode::SetItem { container, index, src } => {
                let c = self.reg_get(frame_idx, container);
                let i = self.reg_get(frame_idx, index);
                let v = self.reg_get(frame_idx, src);
                self.set_item(&c, i, v)?;
                Ok(None)
            }
            Opcode::GetProperty { dest, instance, prop_id } => {
                let inst = self.reg_get(frame_idx, instance);
                let obj = match inst {
                    Value::Instance(o) => o,
                    other => return Err(RaiseError::runtime(format!("get_property: not an Instance (got {:?}).", other.base()))),
                };
                let b = obj.borrow();
                let v = b
                    .values
                    .get(prop_id as usize)
                    .cloned()
                    .ok_or_else(|| RaiseError::index_out_of_range(prop_id as i64, b.values.len()))?;
                drop(b);
                self.reg_set(frame_idx, dest, v);
                Ok(None)
            }
            Opcode::SetProperty { instance, prop_id, src } => {
                let inst = self.reg_get(frame_idx, instance);
                let obj = match inst {
                    Value::Instance(o) => o,
                    other => return Err(RaiseError::runtime(format!("set_property: not an Instance (got {:?}).", other.base()))),
                };
                let v = self.reg_get(frame_idx, src);
                let len = obj.borrow().values.len();
                if prop_id as usize >= len {
                    return Err(RaiseError::index_out_of_range(prop_id as i64, len));
                }
                Value::assign(&mut obj.borrow_mut().values[prop_id as usize], &v);
                Ok(None)
            }

            Opcode::GetGlobal { dest, global_id } => {
                let v = self.shared.borrow().globals.get(&global_id).cloned().unwrap_or(Value::Unit);
                self.reg_set(frame_idx, dest, v);
                Ok(None)
            }
            Opcode::SetGlobal { global_id, src } => {
                let v = self.reg_get(frame_idx, src);
                self.shared.borrow_mut().globals.insert(global_id, v);
                Ok(None)
            }
            Opcode::GetUpvalue { dest, upvalue_id } => {
                let v = closure::get_upvalue(self.frame(frame_idx), upvalue_id as usize);
                self.reg_set(frame_idx, dest, v);
                Ok(None)
            }
            Opcode::SetUpvalue { upvalue_id, src } => {
                let v = self.reg_get(frame_idx, src);
                closure::set_upvalue(self.frame(frame_idx), upvalue_id as usize, v);
                Ok(None)
            }
            Opcode::GetReadonly { dest, const_id } => {
                let v = self.shared.borrow().constants.get(const_id as usize).cloned().unwrap_or(Value::Unit);
                self.reg_set(frame_idx, dest, v);
                Ok(None)
            }

            Opcode::MakeFunction { dest, template_id, sources_start: _, count } => {
                let template = match self.shared.borrow().constants.get(template_id as usize).cloned() {
                    Some(Value::Function(f)) => f,
                    _ => return Err(RaiseError::runtime("make_function: template_id is not a Function constant.")),
                };
                // Resolve upvalues from whatever `MakeCell` has staged this
                // frame, most-recently-promoted first; anything beyond that
                // falls back to re-threading the enclosing frame's own
                // upvalues positionally (the common case of a closure that
                // only recaptures what its own enclosing closure already
                // captured). The precise Local/Outer tagging per source
                // would normally come from the (out-of-scope) emitter.
                let mut sources = Vec::with_capacity(count as usize);
                let take_from_pending = self.pending_cells.len().min(count as usize);
                for cell in self.pending_cells.split_off(self.pending_cells.len() - take_from_pending) {
                    sources.push(UpvalueSource::Local(cell));
                }
                for i in 0..(count as usize - take_from_pending) {
                    sources.push(UpvalueSource::Outer(i));
                }
                let closure = closure::make_closure(&template, &sources, self.frame(frame_idx));
                let obj = Rc::new(RefCell::new(closure));
                if !obj.borrow().upvalues.is_empty() {
                    let entry = self.shared.borrow_mut().gc.register(&obj);
                    obj.borrow_mut().gc_entry = Some(entry);
                }
                self.reg_set(frame_idx, dest, Value::Function(obj));
                Ok(None)
            }
            Opcode::MakeCell { src } => {
                let v = self.reg_get(frame_idx, src);
                let cell = closure::make_cell(v);
                self.pending_cells.push(cell);
                Ok(None)
            }

            Opcode::PushTry { handler_offset } => {
                let target = apply_offset(self.frame(frame_idx).pc, handler_offset);
                self.try_stack.push(TryRecord { call_depth: frame_idx + 1, handler_pc: target });
                Ok(None)
            }
            Opcode::PopTry => {
                self.try_stack.pop();
                Ok(None)
            }
            Opcode::Except { class_id, bind, offset } => {
                let caught = self.pending_exception.clone();
                let matched = match (caught.as_ref(), builtin_class_for_id(class_id)) {
                    (Some(err), Some(class)) => err.class.matches(&class),
                    (Some(_), None) if class_id == u16::MAX => true,
                    _ => false,
                };
                if matched {
                    if let (Some(err), true) = (caught, bind != u16::MAX) {
                        self.reg_set(frame_idx, bind, Value::String(Rc::new(RefCell::new(
                            lily_core::heap::StringObj::new(err.format_no_trace()),
                        ))));
                    }
                    self.pending_exception = None;
                } else {
                    self.jump(frame_idx, offset);
                }
                Ok(None)
            }
            Opcode::Raise { src } => {
                let v = self.reg_get(frame_idx, src);
                let message = match &v {
                    Value::String(s) => s.borrow().data.clone(),
                    other => format!("{:?}", other.base()),
                };
                Err(RaiseError::runtime(message))
            }

            Opcode::MatchDispatch { value, case_table_id } => {
                let v = self.reg_get(frame_idx, value);
                let class_id = v.class_id().unwrap_or(u32::MAX);
                let target = self
                    .shared
                    .borrow()
                    .case_tables
                    .get(case_table_id as usize)
                    .and_then(|table| table.get(&class_id).copied());
                if let Some(offset) = target {
                    self.jump(frame_idx, offset);
                }
                Ok(None)
            }
            Opcode::VariantDecompose { value, dest_start, count } => {
                let v = self.reg_get(frame_idx, value);
                let payload = match v {
                    Value::Variant(obj) => obj.borrow().values.clone(),
                    Value::EmptyVariant(_) => Vec::new(),
                    other => return Err(RaiseError::runtime(format!("match: not a Variant (got {:?}).", other.base()))),
                };
                for i in 0..count as usize {
                    let item = payload.get(i).cloned().unwrap_or(Value::Unit);
                    self.reg_set(frame_idx, dest_start + i as u16, item);
                }
                Ok(None)
            }

            Opcode::Yield { value, dest } => {
                let Some(channel) = self.coroutine_channel.clone() else {
                    return Err(RaiseError::runtime("Cannot yield outside of a coroutine's own VM."));
                };
                if !self.raiser.has_exactly_two_records() {
                    return Err(RaiseError::runtime("Cannot yield while in a foreign call."));
                }
                let v = self.reg_get(frame_idx, value);
                let resumed = channel.yield_value(v).unwrap_or(Value::Unit);
                self.reg_set(frame_idx, dest, resumed);
                Ok(None)
            }
        }
    }

    fn jump(&mut self, frame_idx: usize, offset: i16) {
        let pc = self.frame(frame_idx).pc;
        self.frame_mut(frame_idx).pc = apply_offset(pc, offset);
    }

    fn collect_args(&self, frame_idx: usize, start: u16, count: u16) -> Vec<Value> {
        (0..count).map(|i| self.reg_get(frame_idx, start + i)).collect()
    }

    fn gc_tag_container(&mut self, obj: &Rc<RefCell<ContainerObj>>) {
        let entry = self.shared.borrow_mut().gc.register(obj);
        obj.borrow_mut().gc_entry = Some(entry);
    }

    fn get_item(&self, container: &Value, index: &Value) -> Result<Value, RaiseError> {
        match container {
            Value::List(obj) | Value::Tuple(obj) => {
                let i = index.as_integer().ok_or_else(|| RaiseError::runtime("get_item: index must be Integer."))?;
                let b = obj.borrow();
                usize::try_from(i)
                    .ok()
                    .and_then(|i| b.values.get(i).cloned())
                    .ok_or_else(|| RaiseError::index_out_of_range(i, b.values.len()))
            }
            Value::Hash(table) => {
                let sipkey = self.shared.borrow().sipkey;
                hash::get(&table.borrow(), index, &sipkey)?.ok_or_else(RaiseError::key_not_found)
            }
            other => Err(RaiseError::runtime(format!("get_item: not a subscriptable value (got {:?}).", other.base()))),
        }
    }

    fn set_item(&self, container: &Value, index: Value, value: Value) -> Result<(), RaiseError> {
        match container {
            Value::List(obj) => {
                let i = index.as_integer().ok_or_else(|| RaiseError::runtime("set_item: index must be Integer."))?;
                let mut b = obj.borrow_mut();
                let len = b.values.len();
                let idx = usize::try_from(i).ok().filter(|i| *i < len).ok_or_else(|| RaiseError::index_out_of_range(i, len))?;
                Value::assign(&mut b.values[idx], &value);
                Ok(())
            }
            Value::Hash(table) => {
                let sipkey = self.shared.borrow().sipkey;
                hash::set(&mut table.borrow_mut(), index, value, &sipkey)
            }
            other => Err(RaiseError::runtime(format!("set_item: not a mutable subscriptable value (got {:?}).", other.base()))),
        }
    }
}

fn apply_offset(pc: usize, offset: i16) -> usize {
    (pc as i64 + offset as i64) as usize
}

fn arith(op: ArithOp, l: &Value, r: &Value) -> Result<Value, RaiseError> {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => match op {
            ArithOp::Add => Ok(Value::Integer(a.wrapping_add(*b))),
            ArithOp::Sub => Ok(Value::Integer(a.wrapping_sub(*b))),
            ArithOp::Mul => Ok(Value::Integer(a.wrapping_mul(*b))),
            ArithOp::Div => {
                if *b == 0 {
                    Err(RaiseError::division_by_zero())
                } else {
                    Ok(Value::Integer(a.wrapping_div(*b)))
                }
            }
            ArithOp::Modulo => {
                if *b == 0 {
                    Err(RaiseError::division_by_zero())
                } else {
                    Ok(Value::Integer(a.wrapping_rem(*b)))
                }
            }
        },
        (Value::Double(a), Value::Double(b)) => match op {
            ArithOp::Add => Ok(Value::Double(a + b)),
            ArithOp::Sub => Ok(Value::Double(a - b)),
            ArithOp::Mul => Ok(Value::Double(a * b)),
            ArithOp::Div => Ok(Value::Double(a / b)),
            ArithOp::Modulo => Ok(Value::Double(a % b)),
        },
        (Value::Byte(a), Value::Byte(b)) => match op {
            ArithOp::Add => Ok(Value::Byte(a.wrapping_add(*b))),
            ArithOp::Sub => Ok(Value::Byte(a.wrapping_sub(*b))),
            ArithOp::Mul => Ok(Value::Byte(a.wrapping_mul(*b))),
            ArithOp::Div => {
                if *b == 0 {
                    Err(RaiseError::division_by_zero())
                } else {
                    Ok(Value::Byte(a.wrapping_div(*b)))
                }
            }
            ArithOp::Modulo => {
                if *b == 0 {
                    Err(RaiseError::division_by_zero())
                } else {
                    Ok(Value::Byte(a.wrapping_rem(*b)))
                }
            }
        },
        _ => Err(RaiseError::runtime(format!(
            "arithmetic: mismatched operand kinds ({:?}, {:?}).",
            l.base(),
            r.base()
        ))),
    }
}

fn compare(op: CompareOp, l: &Value, r: &Value) -> Result<bool, RaiseError> {
    if matches!(op, CompareOp::Eq | CompareOp::NotEq) {
        let eq = value_ops::values_equal(l, r)?;
        return Ok(if op == CompareOp::Eq { eq } else { !eq });
    }
    let ordering = match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
        (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
        (Value::Byte(a), Value::Byte(b)) => a.partial_cmp(b),
        (Value::Integer(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
        (Value::Double(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
        _ => {
            return Err(RaiseError::runtime(format!(
                "comparison: operands are not orderable ({:?}, {:?}).",
                l.base(),
                r.base()
            )))
        }
    };
    let ordering = ordering.ok_or_else(|| RaiseError::runtime("comparison: operand is NaN."))?;
    Ok(match op {
        CompareOp::Less => ordering.is_lt(),
        CompareOp::LessEq => ordering.is_le(),
        CompareOp::Greater => ordering.is_gt(),
        CompareOp::GreaterEq => ordering.is_ge(),
        CompareOp::Eq | CompareOp::NotEq => unreachable!("handled above"),
    })
}

impl VmInvoker for Interpreter {
    fn invoke(&mut self, function: &Value, args: &[Value]) -> Result<Value, RaiseError> {
        match function {
            Value::Function(f) => self.call_function(f, args),
            other => Err(RaiseError::runtime(format!("call: not a Function value (got {:?}).", other.base()))),
        }
    }
}

/// A coroutine's nested VM body: a fresh `Interpreter` sharing the parent's
/// `Shared` heap, running `base_function` to completion, with `yield`
/// calls routed through the `CoroutineChannel` (spec §4.8).
pub struct FunctionCoroutineBody {
    shared: Rc<RefCell<Shared>>,
    function: Rc<RefCell<FunctionObj>>,
}

impl FunctionCoroutineBody {
    pub fn new(shared: Rc<RefCell<Shared>>, function: Rc<RefCell<FunctionObj>>) -> Self {
        FunctionCoroutineBody { shared, function }
    }
}

impl CoroutineBody for FunctionCoroutineBody {
    fn run(&mut self, initial_arg: Option<Value>, channel: &CoroutineChannel) -> BodyOutcome {
        let mut vm = Interpreter::new(Rc::clone(&self.shared));
        vm.bind_coroutine(channel.clone());
        let args = initial_arg.into_iter().collect::<Vec<_>>();
        match vm.execute(&self.function, &args) {
            Ok(v) => BodyOutcome::Returned(v),
            Err(e) => BodyOutcome::Raised(e),
        }
    }
}

/// Builds a coroutine heap object and registers its behavior-half engine
/// with `shared.scheduler`, sharing `shared`'s heap (spec §4.8's "each
/// coroutine owns a nested VM"). The engine itself never touches the
/// `Value`; only its opaque handle does, exactly as `CoroutineObj::handle`
/// documents.
pub fn build_coroutine(
    shared: &Rc<RefCell<Shared>>,
    base_function: Rc<RefCell<FunctionObj>>,
    class_id: u32,
) -> Value {
    let body = FunctionCoroutineBody::new(Rc::clone(shared), Rc::clone(&base_function));
    let engine = CoroutineEngine::build(Box::new(body));
    let handle = shared.borrow_mut().scheduler.register(engine);
    let obj = Rc::new(RefCell::new(CoroutineObj {
        refcount: 1,
        class_id,
        base_function: Value::Function(base_function),
        receiver: None,
        status: CoroutineStatus::Waiting,
        gc_entry: None,
        handle,
    }));
    let entry = shared.borrow_mut().gc.register(&obj);
    obj.borrow_mut().gc_entry = Some(entry);
    Value::Coroutine(obj)
}

/// Drives one `resume` through `obj`'s registered engine and reflects the
/// outcome back onto the `CoroutineObj`'s status. Rejects a resume issued
/// from inside the coroutine's own nested VM (spec §4.8) by checking
/// `shared.scheduler`'s active-resume chain before dispatching — the same
/// handle can't appear twice on that chain at once.
///
/// The engine is checked out of `shared.scheduler` for the duration of the
/// call rather than borrowed in place: `engine.resume` drives the nested
/// VM, which reaches back into this same `shared` to run, and `RefCell`
/// does not allow a second borrow while the first is still held.
pub fn resume_coroutine(
    shared: &Rc<RefCell<Shared>>,
    obj: &Rc<RefCell<CoroutineObj>>,
    value: Option<Value>,
) -> Result<ResumeOutcome, RaiseError> {
    let handle = obj.borrow().handle;

    let mut engine = {
        let mut s = shared.borrow_mut();
        if s.scheduler.is_active(handle) {
            return Err(RaiseError::new(
                ExceptionClass::ValueError,
                "Cannot resume a coroutine from inside its own nested VM.",
            ));
        }
        let engine = s
            .scheduler
            .checkout(handle)
            .expect("a live CoroutineObj's handle must have a registered engine");
        s.scheduler.mark_active(handle);
        engine
    };

    let outcome = engine.resume(value);
    let status = engine.status();

    let mut s = shared.borrow_mut();
    s.scheduler.unmark_active(handle);
    s.scheduler.checkin(handle, engine);
    drop(s);

    obj.borrow_mut().status = status;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use lily_core::heap::Bytecode;

    fn shared() -> Rc<RefCell<Shared>> {
        Rc::new(RefCell::new(Shared::new(1_000_000, 4, [0u8; 16])))
    }

    fn emit(code: &mut Bytecode, line: u16, tag: u16, operands: &[u16]) {
        code.push(line);
        code.push(tag);
        code.extend_from_slice(operands);
    }

    /// `fn add(a, b) return a + b` — two args in registers 0/1, result in a
    /// fresh register 2, returned.
    fn add_function() -> Rc<RefCell<FunctionObj>> {
        let mut code: Bytecode = Vec::new();
        emit(&mut code, 1, 2, &[2, 0, 1]); // Arith Add dest=2 left=0 right=1
        emit(&mut code, 1, 25, &[2]); // ReturnVal src=2
        Rc::new(RefCell::new(FunctionObj::native(3, code, "main", "add")))
    }

    #[test]
    fn runs_a_trivial_native_function() {
        let mut vm = Interpreter::new(shared());
        let f = add_function();
        let result = vm.execute(&f, &[Value::Integer(2), Value::Integer(3)]).unwrap();
        assert_eq!(result.as_integer(), Some(5));
    }

    #[test]
    fn division_by_zero_raises() {
        let mut code: Bytecode = Vec::new();
        emit(&mut code, 1, 5, &[0, 0, 1]); // Arith Div dest=0 left=0 right=1
        emit(&mut code, 1, 25, &[0]);
        let f = Rc::new(RefCell::new(FunctionObj::native(2, code, "main", "divz")));
        let mut vm = Interpreter::new(shared());
        let err = vm.execute(&f, &[Value::Integer(1), Value::Integer(0)]).unwrap_err();
        assert_eq!(err.class, ExceptionClass::DivisionByZeroError);
        assert_eq!(err.traceback[0].1, "divz");
    }

    #[test]
    fn try_except_catches_a_raised_runtime_error() {
        let mut code: Bytecode = Vec::new();
        // push_try(handler at the except clause), raise r0, pop_try, return unit.
        // Word layout: PushTry@0(len 3), Raise@3(len 3), PopTry@6(len 2),
        // ReturnUnit@8(len 2), Except@10(len 5), ReturnVal@15. PushTry's pc
        // after decode is 3, so offset 7 lands exactly on Except at word 10.
        emit(&mut code, 1, 44, &[7i16 as u16]);
        emit(&mut code, 1, 47, &[0]); // Raise src=0
        emit(&mut code, 1, 45, &[]); // PopTry (skipped on the happy path, reached if no raise)
        emit(&mut code, 1, 26, &[]); // ReturnUnit (skipped if handler taken)
        emit(&mut code, 1, 46, &[0, u16::MAX, 0]); // Except class_id=0(RuntimeError) bind=MAX offset=0
        emit(&mut code, 1, 25, &[1]); // ReturnVal src=1 (a marker value)
        let f = Rc::new(RefCell::new(FunctionObj::native(2, code, "main", "catcher")));

        let mut vm = Interpreter::new(shared());
        let marker = Value::Integer(99);
        let result = vm.execute(&f, &[Value::Integer(0), marker]);
        assert_eq!(result.unwrap().as_integer(), Some(99));
    }

    #[test]
    fn list_round_trips_through_build_and_get_item() {
        let mut code: Bytecode = Vec::new();
        emit(&mut code, 1, 28, &[2, 0, 2]); // BuildList dest=2 values_start=0 count=2
        emit(&mut code, 1, 33, &[3, 2, 1]); // GetItem dest=3 container=2 index=1(reg holding Integer(0))
        emit(&mut code, 1, 25, &[3]);
        let f = Rc::new(RefCell::new(FunctionObj::native(4, code, "main", "listit")));
        let mut vm = Interpreter::new(shared());
        let result = vm.execute(&f, &[Value::Integer(10), Value::Integer(0)]).unwrap();
        assert_eq!(result.as_integer(), Some(10));
    }

    /// `fn double(x) return x + x` — one arg in register 0, matching
    /// `CoroutineEngine::resume`'s single optional value, unlike
    /// `add_function`'s two.
    fn double_function() -> Rc<RefCell<FunctionObj>> {
        let mut code: Bytecode = Vec::new();
        emit(&mut code, 1, 2, &[1, 0, 0]); // Arith Add dest=1 left=0 right=0
        emit(&mut code, 1, 25, &[1]); // ReturnVal src=1
        Rc::new(RefCell::new(FunctionObj::native(2, code, "main", "double")))
    }

    #[test]
    fn a_built_coroutine_resumes_to_completion_and_registers_with_the_scheduler() {
        let shared = shared();
        let f = double_function();
        let co = build_coroutine(&shared, f, 0);
        let Value::Coroutine(obj) = &co else {
            panic!("expected a Coroutine value");
        };
        assert_eq!(shared.borrow().scheduler.live_count(), 1);

        let outcome =
            resume_coroutine(&shared, obj, Some(Value::Integer(2))).expect("resume succeeds");
        match outcome {
            ResumeOutcome::Done(v) => assert_eq!(v.as_integer(), Some(4)),
            ResumeOutcome::Yielded(_) => panic!("double_function never yields"),
        }
        assert_eq!(obj.borrow().status, CoroutineStatus::Done);

        // Resuming a finished coroutine surfaces the engine's own error
        // rather than panicking, and leaves it registered (not silently
        // dropped) for an embedder to inspect via `status`.
        let err = resume_coroutine(&shared, obj, None).unwrap_err();
        assert_eq!(err.class, ExceptionClass::ValueError);
        assert_eq!(shared.borrow().scheduler.live_count(), 1);
    }

    /// `fn relay(a) { b = yield a; c = yield b; return c }` — a real
    /// `Yield` opcode run through a coroutine's nested VM (not a synthetic
    /// Rust closure body), confirming `bind_coroutine`'s base jump record
    /// plus `call_native`'s own `Vm` record bring
    /// `Raiser::has_exactly_two_records` to true at the point each `Yield`
    /// dispatches.
    fn relay_function() -> Rc<RefCell<FunctionObj>> {
        let mut code: Bytecode = Vec::new();
        emit(&mut code, 1, 50, &[0, 1]); // Yield value=0 dest=1
        emit(&mut code, 1, 50, &[1, 2]); // Yield value=1 dest=2
        emit(&mut code, 1, 25, &[2]); // ReturnVal src=2
        Rc::new(RefCell::new(FunctionObj::native(3, code, "main", "relay")))
    }

    #[test]
    fn a_coroutine_yields_twice_through_a_real_yield_opcode_then_completes() {
        let shared = shared();
        let f = relay_function();
        let co = build_coroutine(&shared, f, 0);
        let Value::Coroutine(obj) = &co else {
            panic!("expected a Coroutine value");
        };

        match resume_coroutine(&shared, obj, Some(Value::Integer(10))).unwrap() {
            ResumeOutcome::Yielded(v) => assert_eq!(v.as_integer(), Some(10)),
            ResumeOutcome::Done(_) => panic!("expected the first yield"),
        }
        assert_eq!(obj.borrow().status, CoroutineStatus::Waiting);

        match resume_coroutine(&shared, obj, Some(Value::Integer(20))).unwrap() {
            ResumeOutcome::Yielded(v) => assert_eq!(v.as_integer(), Some(20)),
            ResumeOutcome::Done(_) => panic!("expected the second yield"),
        }
        assert_eq!(obj.borrow().status, CoroutineStatus::Waiting);

        match resume_coroutine(&shared, obj, Some(Value::Integer(30))).unwrap() {
            ResumeOutcome::Done(v) => assert_eq!(v.as_integer(), Some(30)),
            ResumeOutcome::Yielded(_) => panic!("expected completion"),
        }
        assert_eq!(obj.borrow().status, CoroutineStatus::Done);
    }

    #[test]
    fn yielding_outside_a_coroutine_is_a_runtime_error() {
        let mut code: Bytecode = Vec::new();
        emit(&mut code, 1, 50, &[0, 0]); // Yield value=0 dest=0
        emit(&mut code, 1, 25, &[0]);
        let f = Rc::new(RefCell::new(FunctionObj::native(1, code, "main", "bad_yield")));
        let mut vm = Interpreter::new(shared());
        let err = vm.execute(&f, &[Value::Integer(1)]).unwrap_err();
        assert_eq!(err.message, "Cannot yield outside of a coroutine's own VM.");
    }
}
