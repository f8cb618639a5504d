//! The stack-machine interpreter.
//!
//! Calls are executed by Rust-level recursion: each script frame is a
//! `Frame` run by `run_frame`. Suspension travels through the non-error
//! half of `FrameExit`: when a callee suspends, the current frame snapshots
//! its locals (split into primitive and object banks per the compile-time
//! slot kinds), its captured cells, and the operand-stack values the resume
//! point declares live, pushes the record onto the suspension's chain, and
//! returns `Suspended` to its own caller. Resuming validates the record
//! against the function's resume table and re-enters at the saved ip.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexMap;
use regex::Regex;

use crate::{
    ast::{CaptureSource, SlotKind},
    codegen::{ClassUnit, CompiledFunction, CompiledProgram, Const, Instr, LitKey, ReplPart, NO_SUSPEND},
    context::Context,
    continuation::{Continuation, ResumeTarget, Suspension},
    decimal::Decimal,
    error::{RuntimeError, RuntimeErrorKind},
    io::PrintWriter,
    native::{NativeCall, NativeInput, NativeOutcome},
    types::Type,
    value::{FuncTarget, FunctionValue, Instance, Value},
};

/// Global bindings visible to a running script.
pub type Globals = IndexMap<Rc<str>, Value>;

/// How a frame finished.
#[derive(Debug)]
pub enum FrameExit {
    Return(Value),
    /// Execution suspended; the chain re-enters every frame on resume.
    Suspended(Box<Suspension>),
}

pub type ExecResult = Result<FrameExit, RuntimeError>;

const MAX_CALL_DEPTH: usize = 256;

/// Which unit's function table a frame executes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum UnitRef {
    Program,
    Class(Rc<str>),
}

/// One executing frame.
struct Frame {
    locals: Vec<Value>,
    stack: Vec<Value>,
    captures: Vec<Value>,
    unit: UnitRef,
}

impl Frame {
    fn new(func: &CompiledFunction, unit: UnitRef, captures: Vec<Value>) -> Self {
        let locals = func
            .slot_kinds
            .iter()
            .map(|kind| match kind {
                SlotKind::PrimBool => Value::Bool(false),
                SlotKind::PrimInt => Value::Int(0),
                SlotKind::PrimLong => Value::Long(0),
                SlotKind::PrimDouble => Value::Double(0.0),
                SlotKind::Obj => Value::Null,
                SlotKind::Cell => Value::Cell(Rc::new(RefCell::new(Value::Null))),
            })
            .collect();
        Self { locals, stack: Vec::new(), captures, unit }
    }

    fn write_slot(&mut self, slot: u16, value: Value) -> Result<(), RuntimeError> {
        match &self.locals[slot as usize] {
            Value::Cell(cell) => {
                *cell.borrow_mut() = value;
            }
            _ => self.locals[slot as usize] = value,
        }
        Ok(())
    }
}

/// The interpreter. Borrows everything it needs; owns only caches.
pub struct Vm<'a> {
    program: &'a CompiledProgram,
    context: &'a Context,
    globals: &'a mut Globals,
    output: &'a mut dyn PrintWriter,
    regex_cache: AHashMap<(Rc<str>, bool), Rc<Regex>>,
    call_depth: usize,
}

impl<'a> Vm<'a> {
    pub fn new(
        program: &'a CompiledProgram,
        context: &'a Context,
        globals: &'a mut Globals,
        output: &'a mut dyn PrintWriter,
    ) -> Self {
        Self {
            program,
            context,
            globals,
            output,
            regex_cache: AHashMap::new(),
            call_depth: 0,
        }
    }

    /// Runs the script body from the top.
    pub fn run_main(&mut self) -> ExecResult {
        let program = self.program;
        let func = program.function(CompiledProgram::MAIN);
        self.exec_function(func, UnitRef::Program, Vec::new(), Vec::new())
    }

    // ---- function invocation ----------------------------------------------

    fn lookup_class(&self, name: &str) -> Result<Rc<ClassUnit>, RuntimeError> {
        if let Some(unit) = self.program.find_class(name) {
            return Ok(unit.clone());
        }
        self.context
            .find_class(name)
            .cloned()
            .ok_or_else(|| RuntimeError::general(format!("unknown class '{name}'")))
    }

    fn exec_function(
        &mut self,
        func: &CompiledFunction,
        unit: UnitRef,
        args: Vec<Value>,
        captures: Vec<Value>,
    ) -> ExecResult {
        self.call_depth += 1;
        if self.call_depth > MAX_CALL_DEPTH {
            self.call_depth -= 1;
            return Err(RuntimeError::general("call depth exceeded"));
        }
        let mut frame = Frame::new(func, unit, captures);
        self.bind_args(func, &mut frame, args)?;
        let result = self.run_frame(func, &mut frame, 0);
        self.call_depth -= 1;
        result
    }

    fn bind_args(&self, func: &CompiledFunction, frame: &mut Frame, args: Vec<Value>) -> Result<(), RuntimeError> {
        let params = usize::from(func.param_count);
        if args.len() > params {
            return Err(RuntimeError::general(format!(
                "too many arguments for '{}'",
                func.name
            )));
        }
        let default_base = params - func.defaults.len().min(params);
        let mut args = args.into_iter();
        for slot in 0..params {
            let value = match args.next() {
                Some(v) => v,
                None => func
                    .defaults
                    .get(slot.wrapping_sub(default_base))
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            // primitive parameter slots hold exactly their declared width,
            // whatever width the (possibly dynamic) caller supplied
            let value = coerce_to_slot(func.slot_kinds[slot], value, &func.name)?;
            frame.write_slot(slot as u16, value)?;
        }
        Ok(())
    }

    /// Invokes a first-class function value.
    fn call_value(&mut self, fv: &FunctionValue, mut args: Vec<Value>) -> ExecResult {
        if let Some(receiver) = &fv.receiver {
            args.insert(0, receiver.clone());
        }
        match &fv.target {
            FuncTarget::Script(index) => {
                let program = self.program;
                let func = program
                    .functions
                    .get(*index as usize)
                    .ok_or_else(|| RuntimeError::internal("bad function index"))?;
                self.exec_function(func, UnitRef::Program, args, fv.captures.clone())
            }
            FuncTarget::Method { class, index } => {
                let unit = self.lookup_class(class)?;
                let func = unit
                    .methods
                    .get(*index as usize)
                    .ok_or_else(|| RuntimeError::internal("bad method index"))?;
                self.exec_function(func, UnitRef::Class(class.clone()), args, fv.captures.clone())
            }
            FuncTarget::Native(id) => self.call_native(*id, args),
        }
    }

    /// Drives a native step machine until it returns, suspends, or calls
    /// back into script code.
    fn call_native(&mut self, id: u32, mut args: Vec<Value>) -> ExecResult {
        let native = self.context.native(id)?.clone();
        while args.len() < native.arity() {
            args.push(Value::Null);
        }
        self.drive_native(id, NativeCall::first(args))
    }

    fn drive_native(&mut self, id: u32, mut call: NativeCall) -> ExecResult {
        let native = self.context.native(id)?.clone();
        loop {
            match (native.imp)(call)? {
                NativeOutcome::Return(value) => return Ok(FrameExit::Return(value)),
                NativeOutcome::Suspend(cause) => {
                    return Ok(FrameExit::Suspended(Box::new(Suspension::new(cause))));
                }
                NativeOutcome::CallValue { callee, args, state, next_step } => {
                    let Value::Function(fv) = &callee else {
                        return Err(RuntimeError::general(format!(
                            "cannot invoke {} as a function",
                            callee.type_of()
                        )));
                    };
                    match self.call_value(fv, args)? {
                        FrameExit::Return(value) => {
                            call = NativeCall {
                                step: next_step,
                                state,
                                input: NativeInput::Resumed(value),
                            };
                        }
                        FrameExit::Suspended(mut susp) => {
                            // the native's own record: its state vector is
                            // the object bank, the step is the location
                            susp.push_frame(Continuation::new(
                                ResumeTarget::Native(id),
                                next_step,
                                Vec::new(),
                                state,
                            ));
                            return Ok(FrameExit::Suspended(susp));
                        }
                    }
                }
            }
        }
    }

    // ---- suspension --------------------------------------------------------

    /// Builds the continuation record for the current frame suspended at
    /// location `loc`.
    fn snapshot_frame(
        &self,
        func: &CompiledFunction,
        frame: &Frame,
        resume_target: ResumeTarget,
        loc: u32,
    ) -> Result<Continuation, RuntimeError> {
        let point = func
            .code
            .resume_points
            .get(loc as usize)
            .ok_or_else(|| RuntimeError::internal("Internal error: Invalid location in continuation"))?;
        let mut prims = Vec::new();
        let mut objs = Vec::new();
        for (slot, kind) in func.slot_kinds.iter().enumerate() {
            let value = &frame.locals[slot];
            match kind {
                SlotKind::PrimBool => prims.push(i64::from(matches!(value, Value::Bool(true)))),
                SlotKind::PrimInt => match value {
                    Value::Int(v) => prims.push(i64::from(*v)),
                    _ => return Err(RuntimeError::internal("int slot holds non-int")),
                },
                SlotKind::PrimLong => match value {
                    Value::Long(v) => prims.push(*v),
                    _ => return Err(RuntimeError::internal("long slot holds non-long")),
                },
                SlotKind::PrimDouble => match value {
                    Value::Double(v) => prims.push(v.to_bits() as i64),
                    _ => return Err(RuntimeError::internal("double slot holds non-double")),
                },
                SlotKind::Obj | SlotKind::Cell => objs.push(value.clone()),
            }
        }
        objs.extend(frame.captures.iter().cloned());
        if frame.stack.len() != usize::from(point.saved_stack) {
            return Err(RuntimeError::internal("operand stack depth mismatch at suspension"));
        }
        objs.extend(frame.stack.iter().cloned());
        Ok(Continuation::new(resume_target, loc, prims, objs))
    }

    /// Re-enters one suspended frame with the result of the call it was
    /// blocked on. This is the resume dispatch: the record's target names
    /// the function, the location picks the resume point.
    pub fn resume_one(&mut self, cont: Continuation, result: Value) -> ExecResult {
        match &cont.target {
            ResumeTarget::Native(id) => {
                let call = NativeCall {
                    step: cont.method_location,
                    state: cont.local_objects,
                    input: NativeInput::Resumed(result),
                };
                self.drive_native(*id, call)
            }
            ResumeTarget::Script(index) => {
                let program = self.program;
                let func = program
                    .functions
                    .get(*index as usize)
                    .ok_or_else(|| RuntimeError::internal("Internal error: Invalid location in continuation"))?;
                let target = ResumeTarget::Script(*index);
                self.resume_script_frame(func, UnitRef::Program, target, cont, result)
            }
            ResumeTarget::Method { class, index } => {
                let unit = self.lookup_class(class)?;
                let func = unit
                    .methods
                    .get(*index as usize)
                    .ok_or_else(|| RuntimeError::internal("Internal error: Invalid location in continuation"))?;
                let target = ResumeTarget::Method { class: class.clone(), index: *index };
                self.resume_script_frame(func, UnitRef::Class(class.clone()), target, cont, result)
            }
        }
    }

    fn resume_script_frame(
        &mut self,
        func: &CompiledFunction,
        unit: UnitRef,
        _target: ResumeTarget,
        cont: Continuation,
        result: Value,
    ) -> ExecResult {
        let point = *func
            .code
            .resume_points
            .get(cont.method_location as usize)
            .ok_or_else(|| RuntimeError::internal("Internal error: Invalid location in continuation"))?;

        let mut prims = cont.local_primitives.into_iter();
        let mut objs = cont.local_objects.into_iter();
        let mut frame = Frame {
            locals: Vec::with_capacity(func.slot_kinds.len()),
            stack: Vec::new(),
            captures: Vec::new(),
            unit,
        };
        for kind in &func.slot_kinds {
            let value = match kind {
                SlotKind::PrimBool => Value::Bool(prims.next().map(|v| v != 0).ok_or_else(bad_state)?),
                SlotKind::PrimInt => Value::Int(prims.next().ok_or_else(bad_state)? as i32),
                SlotKind::PrimLong => Value::Long(prims.next().ok_or_else(bad_state)?),
                SlotKind::PrimDouble => {
                    Value::Double(f64::from_bits(prims.next().ok_or_else(bad_state)? as u64))
                }
                SlotKind::Obj | SlotKind::Cell => objs.next().ok_or_else(bad_state)?,
            };
            frame.locals.push(value);
        }
        for _ in 0..func.captures.len() {
            frame.captures.push(objs.next().ok_or_else(bad_state)?);
        }
        for _ in 0..point.saved_stack {
            frame.stack.push(objs.next().ok_or_else(bad_state)?);
        }
        if objs.next().is_some() {
            return Err(bad_state());
        }
        frame.stack.push(result);

        self.call_depth += 1;
        let exit = self.run_frame(func, &mut frame, point.ip as usize);
        self.call_depth -= 1;
        exit
    }

    // ---- the dispatch loop -------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn run_frame(&mut self, func: &CompiledFunction, frame: &mut Frame, start_ip: usize) -> ExecResult {
        let code = &func.code;
        let mut ip = start_ip;
        macro_rules! throw {
            ($err:expr) => {
                return Err($err.with_location(
                    &self.program.script_name,
                    &self.program.source,
                    code.location_at(ip.saturating_sub(1) as u32),
                ))
            };
        }
        macro_rules! rt {
            ($result:expr) => {
                match $result {
                    Ok(v) => v,
                    Err(e) => throw!(e),
                }
            };
        }

        loop {
            let Some(instr) = code.instrs.get(ip) else {
                // running off the end returns the top of stack
                let value = frame.stack.pop().unwrap_or(Value::Null);
                return Ok(FrameExit::Return(value));
            };
            ip += 1;
            match instr {
                Instr::Const(id) => {
                    let Const::Value(value) = &code.consts[*id as usize] else {
                        throw!(RuntimeError::internal("bad constant reference"));
                    };
                    frame.stack.push(value.clone());
                }
                Instr::Null => frame.stack.push(Value::Null),
                Instr::LoadLocal(slot) => frame.stack.push(frame.locals[*slot as usize].clone()),
                Instr::StoreLocal(slot) => {
                    let value = pop(frame);
                    frame.locals[*slot as usize] = value;
                }
                Instr::LoadCell(slot) => match &frame.locals[*slot as usize] {
                    Value::Cell(cell) => frame.stack.push(cell.borrow().clone()),
                    _ => throw!(RuntimeError::internal("cell slot holds non-cell")),
                },
                Instr::StoreCell(slot) => {
                    let value = pop(frame);
                    match &frame.locals[*slot as usize] {
                        Value::Cell(cell) => *cell.borrow_mut() = value,
                        _ => throw!(RuntimeError::internal("cell slot holds non-cell")),
                    }
                }
                Instr::NewCell(slot) => {
                    let old = std::mem::replace(&mut frame.locals[*slot as usize], Value::Null);
                    frame.locals[*slot as usize] = Value::Cell(Rc::new(RefCell::new(old)));
                }
                Instr::LoadCapture(index) => match &frame.captures[*index as usize] {
                    Value::Cell(cell) => frame.stack.push(cell.borrow().clone()),
                    other => frame.stack.push(other.clone()),
                },
                Instr::StoreCapture(index) => {
                    let value = pop(frame);
                    match &frame.captures[*index as usize] {
                        Value::Cell(cell) => *cell.borrow_mut() = value,
                        _ => throw!(RuntimeError::internal("capture is not a cell")),
                    }
                }
                Instr::LoadGlobal(name) => {
                    let name = rt!(self.const_str(code, *name));
                    match self.globals.get(&name) {
                        Some(value) => frame.stack.push(value.clone()),
                        None => throw!(RuntimeError::general(format!(
                            "variable '{name}' is not defined"
                        ))),
                    }
                }
                Instr::StoreGlobal(name) => {
                    let name = rt!(self.const_str(code, *name));
                    let value = pop(frame);
                    self.globals.insert(name, value);
                }

                Instr::Pop => {
                    pop(frame);
                }
                Instr::Dup => {
                    let top = frame.stack.last().cloned().unwrap_or(Value::Null);
                    frame.stack.push(top);
                }

                Instr::Add => rt!(binary(frame, |a, b| a.add(&b))),
                Instr::Sub => rt!(binary(frame, |a, b| a.sub(&b))),
                Instr::Mul => rt!(binary(frame, |a, b| a.mul(&b))),
                Instr::Div => rt!(binary(frame, |a, b| a.div(&b))),
                Instr::Rem => rt!(binary(frame, |a, b| a.rem(&b))),
                Instr::Neg => {
                    let value = pop(frame);
                    frame.stack.push(rt!(value.negate()));
                }
                Instr::Not => {
                    let value = pop(frame);
                    frame.stack.push(Value::Bool(!value.truthy()));
                }
                Instr::CmpEq => {
                    let (b, a) = (pop(frame), pop(frame));
                    frame.stack.push(Value::Bool(a.loose_eq(&b)));
                }
                Instr::CmpNe => {
                    let (b, a) = (pop(frame), pop(frame));
                    frame.stack.push(Value::Bool(!a.loose_eq(&b)));
                }
                Instr::CmpLt => rt!(compare(frame, |o| o.is_lt())),
                Instr::CmpLe => rt!(compare(frame, |o| o.is_le())),
                Instr::CmpGt => rt!(compare(frame, |o| o.is_gt())),
                Instr::CmpGe => rt!(compare(frame, |o| o.is_ge())),

                Instr::Jump(target) => ip = *target as usize,
                Instr::JumpIfFalse(target) => {
                    if !pop(frame).truthy() {
                        ip = *target as usize;
                    }
                }
                Instr::JumpIfTrue(target) => {
                    if pop(frame).truthy() {
                        ip = *target as usize;
                    }
                }
                Instr::JumpIfNull(target) => {
                    if frame.stack.last().is_some_and(Value::is_null) {
                        ip = *target as usize;
                    }
                }
                Instr::LookupSwitch(table) => {
                    let Const::JumpTable { entries, default } = &code.consts[*table as usize] else {
                        throw!(RuntimeError::internal("bad jump table reference"));
                    };
                    let subject = pop(frame);
                    let target = LitKey::of_value(&subject)
                        .and_then(|key| {
                            entries.iter().find(|(k, _)| *k == key).map(|&(_, target)| target)
                        })
                        .unwrap_or(*default);
                    ip = target as usize;
                }

                Instr::NewList(n) => {
                    let items = frame.stack.split_off(frame.stack.len() - usize::from(*n));
                    frame.stack.push(Value::list(items));
                }
                Instr::NewMap(n) => {
                    let mut flat = frame.stack.split_off(frame.stack.len() - 2 * usize::from(*n));
                    let mut map = IndexMap::new();
                    for _ in 0..*n {
                        let key = flat.remove(0);
                        let value = flat.remove(0);
                        let Value::Str(key) = key else {
                            throw!(RuntimeError::internal("map key is not a string"));
                        };
                        map.insert(key, value);
                    }
                    frame.stack.push(Value::map(map));
                }
                Instr::BuildString(n) => {
                    let parts = frame.stack.split_off(frame.stack.len() - usize::from(*n));
                    let mut text = String::new();
                    for part in parts {
                        text.push_str(&part.display_string());
                    }
                    frame.stack.push(Value::string(text));
                }

                Instr::GetField { name, safe: _ } => {
                    let name = rt!(self.const_str(code, *name));
                    let receiver = pop(frame);
                    let value = rt!(self.get_field(&receiver, &name));
                    frame.stack.push(value);
                }
                Instr::SetField { name } => {
                    let name = rt!(self.const_str(code, *name));
                    let value = pop(frame);
                    let receiver = pop(frame);
                    rt!(self.set_field(&receiver, &name, value.clone()));
                    frame.stack.push(value);
                }
                Instr::GetIndex => {
                    let index = pop(frame);
                    let receiver = pop(frame);
                    let value = rt!(get_index(&receiver, &index));
                    frame.stack.push(value);
                }
                Instr::SetIndex => {
                    let value = pop(frame);
                    let index = pop(frame);
                    let receiver = pop(frame);
                    rt!(set_index(&receiver, &index, value.clone()));
                    frame.stack.push(value);
                }
                Instr::Size => {
                    let value = pop(frame);
                    frame.stack.push(rt!(size_of(&value)));
                }

                Instr::TypeTest(ty) => {
                    let ty = rt!(self.const_type(code, *ty));
                    let value = pop(frame);
                    frame.stack.push(Value::Bool(self.type_matches(&value, &ty)));
                }
                Instr::InstanceCheck { ty, negated } => {
                    let ty = rt!(self.const_type(code, *ty));
                    let value = pop(frame);
                    let mut matched = self.type_matches(&value, &ty);
                    if *negated {
                        matched = !matched;
                    }
                    frame.stack.push(Value::Bool(matched));
                }
                Instr::Cast(ty) => {
                    let ty = rt!(self.const_type(code, *ty));
                    let value = pop(frame);
                    frame.stack.push(rt!(self.cast_value(value, &ty)));
                }
                Instr::CheckCast(ty) => {
                    let ty = rt!(self.const_type(code, *ty));
                    let value = pop(frame);
                    if !self.type_matches(&value, &ty) {
                        throw!(RuntimeError::general(format!(
                            "cannot cast {} to {ty}",
                            value.type_of()
                        )));
                    }
                    frame.stack.push(value);
                }

                Instr::ListGet(index) => {
                    let receiver = pop(frame);
                    let Value::List(list) = &receiver else {
                        throw!(RuntimeError::internal("list expected for element extraction"));
                    };
                    let list = list.borrow();
                    let idx = if *index >= 0 {
                        usize::from(index.unsigned_abs())
                    } else {
                        list.len().wrapping_sub(usize::from(index.unsigned_abs()))
                    };
                    let Some(value) = list.get(idx) else {
                        throw!(RuntimeError::internal("element index out of range"));
                    };
                    frame.stack.push(value.clone());
                }
                Instr::MapGet(key) => {
                    let key = rt!(self.const_str(code, *key));
                    let receiver = pop(frame);
                    let Value::Map(map) = &receiver else {
                        throw!(RuntimeError::internal("map expected for entry extraction"));
                    };
                    let value = map.borrow().get(&key).cloned().unwrap_or(Value::Null);
                    frame.stack.push(value);
                }
                Instr::MapHas(key) => {
                    let key = rt!(self.const_str(code, *key));
                    let receiver = pop(frame);
                    let Value::Map(map) = &receiver else {
                        throw!(RuntimeError::internal("map expected for key probe"));
                    };
                    let has = map.borrow().contains_key(&key);
                    frame.stack.push(Value::Bool(has));
                }

                Instr::RegexFind(id) => {
                    let regex = rt!(self.const_regex(code, *id));
                    let subject = pop(frame);
                    let Value::Str(subject) = &subject else {
                        throw!(RuntimeError::general(format!(
                            "regex match requires String, not {}",
                            subject.type_of()
                        )));
                    };
                    let found = self.regex_find(func, frame, &regex, subject);
                    frame.stack.push(Value::Bool(found));
                }
                Instr::RegexMatchDyn { case_insensitive } => {
                    let pattern = pop(frame);
                    let subject = pop(frame);
                    let Value::Str(subject) = &subject else {
                        throw!(RuntimeError::general(format!(
                            "regex match requires String, not {}",
                            subject.type_of()
                        )));
                    };
                    let regex = rt!(self.dynamic_regex(&pattern.display_string(), *case_insensitive));
                    let found = self.regex_find(func, frame, &regex, subject);
                    frame.stack.push(Value::Bool(found));
                }
                Instr::RegexSubst { regex, replacement, global } => {
                    let regex = rt!(self.const_regex(code, *regex));
                    let Const::Replacement(template) = &code.consts[*replacement as usize] else {
                        throw!(RuntimeError::internal("bad replacement reference"));
                    };
                    let subject = pop(frame);
                    let Value::Str(subject) = &subject else {
                        throw!(RuntimeError::general(format!(
                            "substitution requires String, not {}",
                            subject.type_of()
                        )));
                    };
                    let replaced = substitute(&regex, subject, template, *global);
                    frame.stack.push(Value::string(replaced));
                }
                Instr::LoadCaptureVar(n) => {
                    let value = func
                        .match_slot
                        .and_then(|slot| match &frame.locals[slot as usize] {
                            Value::List(groups) => groups.borrow().get(usize::from(*n)).cloned(),
                            _ => None,
                        })
                        .unwrap_or(Value::Null);
                    frame.stack.push(value);
                }

                Instr::CallScript { func: index, argc, loc } => {
                    let args = frame.stack.split_off(frame.stack.len() - usize::from(*argc));
                    let exit = match &frame.unit {
                        UnitRef::Program => {
                            let program = self.program;
                            let callee = program
                                .functions
                                .get(*index as usize)
                                .ok_or_else(|| RuntimeError::internal("bad function index"))?;
                            self.exec_function(callee, UnitRef::Program, args, Vec::new())
                        }
                        UnitRef::Class(name) => {
                            let class = name.clone();
                            let unit = self.lookup_class(&class)?;
                            let callee = unit
                                .methods
                                .get(*index as usize)
                                .ok_or_else(|| RuntimeError::internal("bad function index"))?;
                            self.exec_function(callee, UnitRef::Class(class), args, Vec::new())
                        }
                    };
                    if let Some(exit) = self.finish_call(func, frame, exit, *loc, ip)? {
                        return Ok(exit);
                    }
                }
                Instr::CallNative { native, argc, loc } => {
                    let args = frame.stack.split_off(frame.stack.len() - usize::from(*argc));
                    let exit = self.call_native(*native, args);
                    if let Some(exit) = self.finish_call(func, frame, exit, *loc, ip)? {
                        return Ok(exit);
                    }
                }
                Instr::CallValue { argc, loc } => {
                    let args = frame.stack.split_off(frame.stack.len() - usize::from(*argc));
                    let callee = pop(frame);
                    let Value::Function(fv) = &callee else {
                        throw!(RuntimeError::general(format!(
                            "cannot invoke {} as a function",
                            callee.type_of()
                        )));
                    };
                    let exit = self.call_value(fv, args);
                    if let Some(exit) = self.finish_call(func, frame, exit, *loc, ip)? {
                        return Ok(exit);
                    }
                }
                Instr::CallMethod { name, argc, safe: _, loc } => {
                    let name = rt!(self.const_str(code, *name));
                    let args = frame.stack.split_off(frame.stack.len() - usize::from(*argc));
                    let receiver = pop(frame);
                    let exit = self.call_method(&receiver, &name, args);
                    if let Some(exit) = self.finish_call(func, frame, exit, *loc, ip)? {
                        return Ok(exit);
                    }
                }
                Instr::NewInstance { class, argc } => {
                    let class = rt!(self.const_str(code, *class));
                    let args = frame.stack.split_off(frame.stack.len() - usize::from(*argc));
                    let value = rt!(self.instantiate(&class, args));
                    frame.stack.push(value);
                }
                Instr::MakeClosure { func: index } => {
                    let value = rt!(self.make_closure(frame, *index));
                    frame.stack.push(value);
                }
                Instr::EvalInstr { loc: _ } => {
                    let source = pop(frame);
                    let value = rt!(self.eval_source(&source.display_string()));
                    frame.stack.push(value);
                }

                Instr::Print { newline } => {
                    let value = pop(frame);
                    let text = value.display_string();
                    if *newline {
                        self.output.println(&text);
                    } else {
                        self.output.print(&text);
                    }
                }
                Instr::DieInstr => {
                    let value = pop(frame);
                    let message = if value.is_null() {
                        "die".to_owned()
                    } else {
                        value.display_string()
                    };
                    throw!(RuntimeError::die(message));
                }
                Instr::Return => {
                    let value = pop(frame);
                    return Ok(FrameExit::Return(value));
                }
            }
        }
    }

    /// Routes a callee's exit: push the result and continue, propagate the
    /// error, or snapshot this frame onto the suspension chain.
    fn finish_call(
        &mut self,
        func: &CompiledFunction,
        frame: &mut Frame,
        exit: ExecResult,
        loc: u32,
        ip: usize,
    ) -> Result<Option<FrameExit>, RuntimeError> {
        match exit {
            Ok(FrameExit::Return(value)) => {
                frame.stack.push(value);
                Ok(None)
            }
            Ok(FrameExit::Suspended(mut susp)) => {
                if loc == NO_SUSPEND {
                    return Err(RuntimeError::internal("suspension reached a synchronous frame"));
                }
                let target = self.frame_resume_target(frame, func)?;
                susp.push_frame(self.snapshot_frame(func, frame, target, loc)?);
                Ok(Some(FrameExit::Suspended(susp)))
            }
            Err(e) => Err(e.with_location(
                &self.program.script_name,
                &self.program.source,
                func.code.location_at(ip.saturating_sub(1) as u32),
            )),
        }
    }

    /// The resume handle for the currently executing frame.
    fn frame_resume_target(&self, frame: &Frame, func: &CompiledFunction) -> Result<ResumeTarget, RuntimeError> {
        match &frame.unit {
            UnitRef::Program => {
                let index = self
                    .program
                    .functions
                    .iter()
                    .position(|f| std::ptr::eq(f, func))
                    .ok_or_else(|| RuntimeError::internal("frame function not in program"))?;
                Ok(ResumeTarget::Script(index as u32))
            }
            UnitRef::Class(name) => {
                let unit = self.lookup_class(name)?;
                let index = unit
                    .methods
                    .iter()
                    .position(|f| std::ptr::eq(f, func))
                    .ok_or_else(|| RuntimeError::internal("frame function not in class"))?;
                Ok(ResumeTarget::Method { class: name.clone(), index: index as u32 })
            }
        }
    }

    // ---- helpers -----------------------------------------------------------

    fn const_str(&self, code: &crate::codegen::Code, id: u16) -> Result<Rc<str>, RuntimeError> {
        match &code.consts[id as usize] {
            Const::Value(Value::Str(s)) => Ok(s.clone()),
            _ => Err(RuntimeError::internal("bad string constant reference")),
        }
    }

    fn const_type(&self, code: &crate::codegen::Code, id: u16) -> Result<Type, RuntimeError> {
        match &code.consts[id as usize] {
            Const::Type(ty) => Ok(ty.clone()),
            _ => Err(RuntimeError::internal("bad type constant reference")),
        }
    }

    fn const_regex(&mut self, code: &crate::codegen::Code, id: u16) -> Result<Rc<Regex>, RuntimeError> {
        match &code.consts[id as usize] {
            Const::Regex { pattern, case_insensitive } => {
                self.dynamic_regex(pattern, *case_insensitive)
            }
            _ => Err(RuntimeError::internal("bad regex constant reference")),
        }
    }

    fn dynamic_regex(&mut self, pattern: &str, case_insensitive: bool) -> Result<Rc<Regex>, RuntimeError> {
        let key = (Rc::<str>::from(pattern), case_insensitive);
        if let Some(regex) = self.regex_cache.get(&key) {
            return Ok(regex.clone());
        }
        let regex = regex::RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| RuntimeError::general(format!("invalid regex: {e}")))?;
        let regex = Rc::new(regex);
        self.regex_cache.insert(key, regex.clone());
        Ok(regex)
    }

    /// Runs a find, writing capture groups into the frame's match slot.
    fn regex_find(&self, func: &CompiledFunction, frame: &mut Frame, regex: &Regex, subject: &str) -> bool {
        match regex.captures(subject) {
            Some(caps) => {
                if let Some(slot) = func.match_slot {
                    let groups: Vec<Value> = caps
                        .iter()
                        .map(|g| g.map_or(Value::Null, |m| Value::string(m.as_str().to_owned())))
                        .collect();
                    frame.locals[slot as usize] = Value::list(groups);
                }
                true
            }
            None => false,
        }
    }

    fn type_matches(&self, value: &Value, ty: &Type) -> bool {
        match ty {
            Type::Def => true,
            Type::Null => value.is_null(),
            Type::Bool => matches!(value, Value::Bool(_)),
            Type::Int => matches!(value, Value::Int(_)),
            Type::Long => matches!(value, Value::Long(_)),
            Type::Double => matches!(value, Value::Double(_)),
            Type::Decimal => matches!(value, Value::Decimal(_)),
            Type::Str => matches!(value, Value::Str(_)),
            Type::Bytes => matches!(value, Value::Bytes(_)),
            Type::List | Type::Array(_) => matches!(value, Value::List(_)),
            Type::Map => matches!(value, Value::Map(_)),
            Type::Function => matches!(value, Value::Function(_)),
            Type::Instance(name) => match value {
                Value::Instance(inst) => {
                    let class = inst.borrow().class.clone();
                    self.context.class_is_a(&self.program.classes, &class, name)
                }
                _ => false,
            },
        }
    }

    fn cast_value(&self, value: Value, ty: &Type) -> Result<Value, RuntimeError> {
        let fail = |value: &Value, ty: &Type| {
            Err(RuntimeError::general(format!(
                "cannot cast {} to {ty}",
                value.type_of()
            )))
        };
        match ty {
            Type::Def => Ok(value),
            Type::Str => Ok(Value::string(value.display_string())),
            Type::Bool => Ok(Value::Bool(value.truthy())),
            Type::Int => match &value {
                Value::Int(_) => Ok(value),
                Value::Long(v) => Ok(Value::Int(*v as i32)),
                Value::Double(v) => Ok(Value::Int(*v as i32)),
                Value::Decimal(d) => Ok(Value::Int(d.to_f64() as i32)),
                Value::Bool(b) => Ok(Value::Int(i32::from(*b))),
                Value::Str(s) => s
                    .trim()
                    .parse::<i32>()
                    .map(Value::Int)
                    .map_err(|_| RuntimeError::general(format!("cannot convert '{s}' to int"))),
                _ => fail(&value, ty),
            },
            Type::Long => match &value {
                Value::Long(_) => Ok(value),
                Value::Int(v) => Ok(Value::Long(i64::from(*v))),
                Value::Double(v) => Ok(Value::Long(*v as i64)),
                Value::Decimal(d) => Ok(Value::Long(d.to_f64() as i64)),
                Value::Bool(b) => Ok(Value::Long(i64::from(*b))),
                Value::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Long)
                    .map_err(|_| RuntimeError::general(format!("cannot convert '{s}' to long"))),
                _ => fail(&value, ty),
            },
            Type::Double => match &value {
                Value::Double(_) => Ok(value),
                Value::Int(v) => Ok(Value::Double(f64::from(*v))),
                Value::Long(v) => Ok(Value::Double(*v as f64)),
                Value::Decimal(d) => Ok(Value::Double(d.to_f64())),
                Value::Str(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Double)
                    .map_err(|_| RuntimeError::general(format!("cannot convert '{s}' to double"))),
                _ => fail(&value, ty),
            },
            Type::Decimal => match &value {
                Value::Decimal(_) => Ok(value),
                Value::Int(v) => Ok(Value::Decimal(Decimal::from_i64(i64::from(*v)))),
                Value::Long(v) => Ok(Value::Decimal(Decimal::from_i64(*v))),
                Value::Double(v) => Decimal::from_f64(*v)
                    .map(Value::Decimal)
                    .ok_or_else(|| RuntimeError::general("cannot convert non-finite double to Decimal")),
                Value::Str(s) => s
                    .trim()
                    .parse::<Decimal>()
                    .map(Value::Decimal)
                    .map_err(|()| RuntimeError::general(format!("cannot convert '{s}' to Decimal"))),
                Value::Null => Ok(Value::Null),
                _ => fail(&value, ty),
            },
            Type::List | Type::Array(_) => match &value {
                Value::List(_) | Value::Null => Ok(value),
                _ => fail(&value, ty),
            },
            Type::Map => match &value {
                Value::Map(_) | Value::Null => Ok(value),
                _ => fail(&value, ty),
            },
            Type::Instance(_) => {
                if value.is_null() || self.type_matches(&value, ty) {
                    Ok(value)
                } else {
                    fail(&value, ty)
                }
            }
            Type::Bytes | Type::Function | Type::Null => {
                if self.type_matches(&value, ty) {
                    Ok(value)
                } else {
                    fail(&value, ty)
                }
            }
        }
    }

    fn get_field(&self, receiver: &Value, name: &str) -> Result<Value, RuntimeError> {
        match receiver {
            Value::Null => Err(RuntimeError::null(format!(
                "null value for field access '{name}'"
            ))),
            Value::Map(map) => Ok(map.borrow().get(name).cloned().unwrap_or(Value::Null)),
            Value::Instance(inst) => {
                let borrowed = inst.borrow();
                if let Some(value) = borrowed.fields.get(name) {
                    return Ok(value.clone());
                }
                let class = borrowed.class.clone();
                drop(borrowed);
                // a method reference becomes a bound handle
                if let Some((class_name, index)) = self.find_method(&class, name)? {
                    return Ok(Value::Function(Rc::new(FunctionValue {
                        target: FuncTarget::Method { class: class_name, index },
                        captures: Vec::new(),
                        receiver: Some(receiver.clone()),
                    })));
                }
                Err(RuntimeError::general(format!(
                    "no such field '{name}' for {class}"
                )))
            }
            other => Err(RuntimeError::general(format!(
                "cannot access field '{name}' of {}",
                other.type_of()
            ))),
        }
    }

    fn set_field(&self, receiver: &Value, name: &str, value: Value) -> Result<(), RuntimeError> {
        match receiver {
            Value::Null => Err(RuntimeError::null(format!(
                "null value for field access '{name}'"
            ))),
            Value::Map(map) => {
                map.borrow_mut().insert(name.into(), value);
                Ok(())
            }
            Value::Instance(inst) => {
                let mut borrowed = inst.borrow_mut();
                if borrowed.fields.contains_key(name) {
                    borrowed.fields.insert(name.into(), value);
                    Ok(())
                } else {
                    let class = borrowed.class.clone();
                    Err(RuntimeError::general(format!(
                        "no such field '{name}' for {class}"
                    )))
                }
            }
            other => Err(RuntimeError::general(format!(
                "cannot access field '{name}' of {}",
                other.type_of()
            ))),
        }
    }

    /// Finds a method by walking the class hierarchy. Returns the class
    /// that owns it plus the method index.
    fn find_method(&self, class: &str, name: &str) -> Result<Option<(Rc<str>, u32)>, RuntimeError> {
        let mut current: Rc<str> = class.into();
        loop {
            let unit = self.lookup_class(&current)?;
            if let Some(&index) = unit.method_index.get(name) {
                return Ok(Some((unit.name.clone(), index)));
            }
            match &unit.superclass {
                Some(superclass) => current = superclass.clone(),
                None => return Ok(None),
            }
        }
    }

    fn call_method(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> ExecResult {
        match receiver {
            Value::Null => Err(RuntimeError::null(format!(
                "null value for method call '{name}'"
            ))),
            Value::Instance(inst) => {
                let class = inst.borrow().class.clone();
                if let Some((class_name, index)) = self.find_method(&class, name)? {
                    let unit = self.lookup_class(&class_name)?;
                    let func = &unit.methods[index as usize];
                    let mut full_args = Vec::with_capacity(args.len() + 1);
                    full_args.push(receiver.clone());
                    full_args.extend(args);
                    return self.exec_function(func, UnitRef::Class(class_name.clone()), full_args, Vec::new());
                }
                // a field holding a closure is callable; release the borrow
                // before re-entering script code
                let field = inst.borrow().fields.get(name).cloned();
                if let Some(Value::Function(fv)) = &field {
                    return self.call_value(fv, args);
                }
                Err(RuntimeError::general(format!(
                    "no such method '{name}' for {class}"
                )))
            }
            Value::Map(map) => {
                let entry = map.borrow().get(name).cloned();
                if let Some(Value::Function(fv)) = &entry {
                    return self.call_value(fv, args);
                }
                self.builtin_method(receiver, name, args)
            }
            Value::Function(fv) if name == "call" => {
                let fv = fv.clone();
                self.call_value(&fv, args)
            }
            other => self.builtin_method(other, name, args),
        }
    }

    /// The built-in value method set.
    fn builtin_method(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> ExecResult {
        let value = match (name, receiver) {
            ("size", _) if args.is_empty() => size_of(receiver)?,
            ("toString", _) if args.is_empty() => Value::string(receiver.display_string()),
            ("sum", Value::List(items)) if args.is_empty() => {
                let mut total = Value::Int(0);
                for item in items.borrow().iter() {
                    total = total.add(item)?;
                }
                total
            }
            ("lines", Value::Str(s)) if args.is_empty() => {
                Value::list(s.lines().map(|l| Value::string(l.to_owned())).collect())
            }
            _ => {
                return Err(RuntimeError::general(format!(
                    "no such method '{name}' for {}",
                    receiver.type_of()
                )));
            }
        };
        Ok(FrameExit::Return(value))
    }

    /// Allocates an instance, binding constructor arguments to the fields
    /// (superclass fields first) that have no initialiser.
    fn instantiate(&self, class: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        // collect the field list root-first
        let mut chain = Vec::new();
        let mut current: Rc<str> = class.into();
        loop {
            let unit = self.lookup_class(&current)?;
            let superclass = unit.superclass.clone();
            chain.push(unit);
            match superclass {
                Some(s) => current = s,
                None => break,
            }
        }
        chain.reverse();

        let mut fields: IndexMap<Rc<str>, Value> = IndexMap::new();
        let mut mandatory: Vec<Rc<str>> = Vec::new();
        for unit in &chain {
            for field in &unit.fields {
                match &field.default {
                    Some(default) => {
                        fields.insert(field.name.clone(), default.clone());
                    }
                    None => {
                        fields.insert(field.name.clone(), default_for_type(&field.ty));
                        mandatory.push(field.name.clone());
                    }
                }
            }
        }
        if args.len() > mandatory.len() {
            return Err(RuntimeError::general(format!(
                "too many arguments for new {class}"
            )));
        }
        if args.len() < mandatory.len() {
            return Err(RuntimeError::general(format!(
                "missing value for field '{}' of {class}",
                mandatory[args.len()]
            )));
        }
        for (name, value) in mandatory.iter().zip(args) {
            fields.insert(name.clone(), value);
        }
        Ok(Value::Instance(Rc::new(RefCell::new(Instance {
            class: class.into(),
            fields,
        }))))
    }

    fn make_closure(&self, frame: &Frame, index: u32) -> Result<Value, RuntimeError> {
        let (func, target) = match &frame.unit {
            UnitRef::Program => {
                let func = self
                    .program
                    .functions
                    .get(index as usize)
                    .ok_or_else(|| RuntimeError::internal("bad closure index"))?;
                (func.captures.clone(), FuncTarget::Script(index))
            }
            UnitRef::Class(name) => {
                let unit = self.lookup_class(name)?;
                let func = unit
                    .methods
                    .get(index as usize)
                    .ok_or_else(|| RuntimeError::internal("bad closure index"))?;
                (func.captures.clone(), FuncTarget::Method { class: name.clone(), index })
            }
        };
        let captures = func
            .iter()
            .map(|source| match source {
                CaptureSource::EnclosingLocal(slot) => frame.locals[*slot as usize].clone(),
                CaptureSource::EnclosingCapture(i) => frame.captures[*i as usize].clone(),
            })
            .collect();
        Ok(Value::Function(Rc::new(FunctionValue {
            target,
            captures,
            receiver: None,
        })))
    }

    /// `eval`: compile and run nested source against the same context,
    /// with fresh globals, driving any suspensions inline.
    fn eval_source(&mut self, source: &str) -> Result<Value, RuntimeError> {
        let program = crate::run::compile_source(source, "<eval>", self.context, &[])
            .map_err(|e| RuntimeError::general(format!("eval compile error: {}", e.message)))?;
        let mut globals = Globals::new();
        crate::run::drive_sync(&program, self.context, &mut globals, &mut *self.output)
    }
}

fn bad_state() -> RuntimeError {
    RuntimeError::internal("Internal error: Invalid location in continuation")
}

/// Converts an argument to the width a primitive parameter slot stores.
fn coerce_to_slot(kind: SlotKind, value: Value, func_name: &str) -> Result<Value, RuntimeError> {
    let mismatch = |value: &Value| {
        RuntimeError::general(format!(
            "cannot convert {} argument for '{func_name}'",
            value.type_of()
        ))
    };
    match kind {
        SlotKind::Obj | SlotKind::Cell => Ok(value),
        SlotKind::PrimBool => match value {
            Value::Bool(_) => Ok(value),
            other => Ok(Value::Bool(other.truthy())),
        },
        SlotKind::PrimInt => match value {
            Value::Int(_) => Ok(value),
            Value::Long(v) => Ok(Value::Int(v as i32)),
            Value::Double(v) => Ok(Value::Int(v as i32)),
            Value::Decimal(d) => Ok(Value::Int(d.to_f64() as i32)),
            other => Err(mismatch(&other)),
        },
        SlotKind::PrimLong => match value {
            Value::Long(_) => Ok(value),
            Value::Int(v) => Ok(Value::Long(i64::from(v))),
            Value::Double(v) => Ok(Value::Long(v as i64)),
            Value::Decimal(d) => Ok(Value::Long(d.to_f64() as i64)),
            other => Err(mismatch(&other)),
        },
        SlotKind::PrimDouble => match value {
            Value::Double(_) => Ok(value),
            Value::Int(v) => Ok(Value::Double(f64::from(v))),
            Value::Long(v) => Ok(Value::Double(v as f64)),
            Value::Decimal(d) => Ok(Value::Double(d.to_f64())),
            other => Err(mismatch(&other)),
        },
    }
}

fn pop(frame: &mut Frame) -> Value {
    frame.stack.pop().unwrap_or(Value::Null)
}

fn binary(frame: &mut Frame, op: impl Fn(Value, Value) -> Result<Value, RuntimeError>) -> Result<(), RuntimeError> {
    let b = pop(frame);
    let a = pop(frame);
    frame.stack.push(op(a, b)?);
    Ok(())
}

fn compare(frame: &mut Frame, test: impl Fn(std::cmp::Ordering) -> bool) -> Result<(), RuntimeError> {
    let b = pop(frame);
    let a = pop(frame);
    let ordering = a.loose_cmp(&b)?;
    frame.stack.push(Value::Bool(test(ordering)));
    Ok(())
}

fn get_index(receiver: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match receiver {
        Value::Null => Err(RuntimeError::null("null value for indexed access")),
        Value::List(list) => {
            let list = list.borrow();
            let idx = index_to_usize(index, list.len())?;
            Ok(list.get(idx).cloned().unwrap_or(Value::Null))
        }
        Value::Map(map) => Ok(map
            .borrow()
            .get(index.display_string().as_str())
            .cloned()
            .unwrap_or(Value::Null)),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = index_to_usize(index, chars.len())?;
            Ok(chars
                .get(idx)
                .map_or(Value::Null, |c| Value::string(c.to_string())))
        }
        other => Err(RuntimeError::general(format!(
            "cannot index into {}",
            other.type_of()
        ))),
    }
}

fn set_index(receiver: &Value, index: &Value, value: Value) -> Result<(), RuntimeError> {
    match receiver {
        Value::Null => Err(RuntimeError::null("null value for indexed access")),
        Value::List(list) => {
            let mut list = list.borrow_mut();
            let len = list.len();
            let idx = index_to_usize(index, len.max(1))?;
            if idx >= list.len() {
                list.resize(idx + 1, Value::Null);
            }
            list[idx] = value;
            Ok(())
        }
        Value::Map(map) => {
            map.borrow_mut().insert(index.display_string().into(), value);
            Ok(())
        }
        other => Err(RuntimeError::general(format!(
            "cannot index into {}",
            other.type_of()
        ))),
    }
}

fn index_to_usize(index: &Value, len: usize) -> Result<usize, RuntimeError> {
    let raw = match index {
        Value::Int(v) => i64::from(*v),
        Value::Long(v) => *v,
        other => {
            return Err(RuntimeError::general(format!(
                "index must be numeric, not {}",
                other.type_of()
            )));
        }
    };
    if raw < 0 {
        let adjusted = len as i64 + raw;
        if adjusted < 0 {
            return Err(RuntimeError::general(format!("index {raw} out of range")));
        }
        return Ok(adjusted as usize);
    }
    Ok(raw as usize)
}

fn size_of(value: &Value) -> Result<Value, RuntimeError> {
    let size = match value {
        Value::List(l) => l.borrow().len(),
        Value::Map(m) => m.borrow().len(),
        Value::Str(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        other => {
            return Err(RuntimeError::general(format!(
                "cannot get size of {}",
                other.type_of()
            )));
        }
    };
    Ok(Value::Int(size as i32))
}

fn default_for_type(ty: &Type) -> Value {
    match ty {
        Type::Int => Value::Int(0),
        Type::Long => Value::Long(0),
        Type::Double => Value::Double(0.0),
        Type::Bool => Value::Bool(false),
        _ => Value::Null,
    }
}

fn substitute(regex: &Regex, subject: &str, template: &[ReplPart], global: bool) -> String {
    let mut result = String::new();
    let mut last = 0usize;
    for caps in regex.captures_iter(subject) {
        let whole = caps.get(0).expect("group 0 always present");
        result.push_str(&subject[last..whole.start()]);
        for part in template {
            match part {
                ReplPart::Text(text) => result.push_str(text),
                ReplPart::Capture(n) => {
                    if let Some(group) = caps.get(usize::from(*n)) {
                        result.push_str(group.as_str());
                    }
                }
            }
        }
        last = whole.end();
        if !global {
            break;
        }
    }
    result.push_str(&subject[last..]);
    result
}

/// Kind check used by tests and the REPL to distinguish die from faults.
#[must_use]
pub fn is_die(err: &RuntimeError) -> bool {
    err.kind == RuntimeErrorKind::Die
}
