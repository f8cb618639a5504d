//! The embedding surface: compile scripts, run them, resume them.
//!
//! `Script` is a compiled program plus the entry points the host uses:
//! synchronous runs, handler-based asynchronous runs driven through a
//! `RuntimeEnv`, and checkpoint restoration. The drive loops here are the
//! only place suspension causes are serviced: a `Sleep` schedules the
//! resume, a `Checkpoint` serialises the chain and hands it to the host's
//! callback before resuming.

use std::cell::RefCell;
use std::fmt::{self, Display};
use std::rc::Rc;

use crate::{
    analyse::analyse,
    codegen::{compile, CompiledProgram},
    context::{CheckpointRequest, Context},
    continuation::{Continuation, ResumeTarget, Suspension},
    decorate::decorate_script,
    env::{DefaultEnv, RuntimeEnv},
    error::{CompileError, RuntimeError},
    io::{PrintWriter, StdPrint},
    native::SuspendCause,
    parse::parse,
    resolve::resolve,
    tracer::{StderrTracer, TraceEvent, Tracer},
    value::Value,
    vm::{ExecResult, FrameExit, Globals, Vm},
};

/// Either compilation or execution failed.
#[derive(Debug, Clone)]
pub enum ScriptError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(e) => write!(f, "{e}"),
            Self::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<CompileError> for ScriptError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

impl From<RuntimeError> for ScriptError {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

/// Receives the result of an asynchronous run.
pub type ResultHandler = Box<dyn FnOnce(Result<Value, RuntimeError>)>;

/// Runs the full frontend over `source`, producing a compiled program.
/// `global_names` are the host bindings visible to the resolver.
pub(crate) fn compile_source(
    source: &str,
    script_name: &str,
    context: &Context,
    global_names: &[Rc<str>],
) -> Result<CompiledProgram, CompileError> {
    compile_transformed(source, script_name, context, global_names, None)
}

pub(crate) fn compile_transformed(
    source: &str,
    script_name: &str,
    context: &Context,
    global_names: &[Rc<str>],
    rewrite: Option<&mut dyn FnMut(crate::ast::Expr) -> crate::ast::Expr>,
) -> Result<CompiledProgram, CompileError> {
    let mut tracer: Box<dyn Tracer> = if context.debug > 0 {
        Box::new(StderrTracer)
    } else {
        Box::new(crate::tracer::NoopTracer)
    };
    let attach = |e: CompileError| e.with_source(script_name, source);

    let mut parsed = parse(source).map_err(attach)?;
    tracer.event(TraceEvent::Stage { stage: "parse", unit: script_name });
    if let Some(mut rewrite) = rewrite {
        decorate_script(&mut parsed, &mut rewrite);
    }
    let mut resolved = resolve(parsed, context, global_names).map_err(attach)?;
    tracer.event(TraceEvent::Stage { stage: "resolve", unit: script_name });
    analyse(&mut resolved, context).map_err(attach)?;
    tracer.event(TraceEvent::Stage { stage: "analyse", unit: script_name });
    let program = compile(&resolved, context, script_name, source).map_err(attach)?;
    tracer.event(TraceEvent::Stage { stage: "compile", unit: script_name });
    Ok(program)
}

/// A compiled script ready to run.
#[derive(Debug, Clone)]
pub struct Script {
    program: Rc<CompiledProgram>,
}

impl Script {
    /// Compiles `source`, registering any declared classes in the context.
    pub fn compile(source: &str, script_name: &str, context: &mut Context) -> Result<Self, CompileError> {
        Self::compile_with_globals(source, script_name, context, &[])
    }

    /// Compiles with the given host binding names visible as globals.
    pub fn compile_with_globals(
        source: &str,
        script_name: &str,
        context: &mut Context,
        global_names: &[Rc<str>],
    ) -> Result<Self, CompileError> {
        let program = compile_source(source, script_name, context, global_names)?;
        for class in &program.classes {
            context.register_class(class.clone());
        }
        Ok(Self { program: Rc::new(program) })
    }

    /// Compiles after applying a tree rewrite to every eligible expression
    /// (see `decorate`). The forced-suspension test harness passes
    /// `sleep_wrap` here.
    pub fn compile_transformed(
        source: &str,
        script_name: &str,
        context: &mut Context,
        global_names: &[Rc<str>],
        rewrite: &mut dyn FnMut(crate::ast::Expr) -> crate::ast::Expr,
    ) -> Result<Self, CompileError> {
        let program = compile_transformed(source, script_name, context, global_names, Some(rewrite))?;
        for class in &program.classes {
            context.register_class(class.clone());
        }
        Ok(Self { program: Rc::new(program) })
    }

    /// Serialises the compiled program. Reload with `load` against a
    /// context carrying the same native registrations.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(&*self.program)
    }

    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        let program: CompiledProgram = postcard::from_bytes(bytes)?;
        Ok(Self { program: Rc::new(program) })
    }

    /// Runs to completion on the calling thread, servicing suspensions
    /// inline. Bindings are read as globals and updated in place.
    pub fn run_sync(&self, bindings: &mut Globals, context: &Context) -> Result<Value, RuntimeError> {
        let mut output = StdPrint;
        drive_sync(&self.program, context, bindings, &mut output)
    }

    /// As `run_sync`, with print output routed to `output`.
    pub fn run_sync_with_output(
        &self,
        bindings: &mut Globals,
        context: &Context,
        output: &mut dyn PrintWriter,
    ) -> Result<Value, RuntimeError> {
        drive_sync(&self.program, context, bindings, output)
    }

    /// Runs asynchronously: scheduling goes through `env` and the result is
    /// delivered to `handler` when the script completes.
    pub fn run(
        &self,
        bindings: Globals,
        context: Rc<Context>,
        env: Rc<dyn RuntimeEnv>,
        handler: ResultHandler,
    ) {
        self.run_with_io(bindings, context, env, Box::new(StdPrint), handler);
    }

    /// As `run`, with an owned print writer.
    pub fn run_with_io(
        &self,
        bindings: Globals,
        context: Rc<Context>,
        env: Rc<dyn RuntimeEnv>,
        output: Box<dyn PrintWriter>,
        handler: ResultHandler,
    ) {
        let state = ExecState {
            program: self.program.clone(),
            context,
            globals: bindings,
            output,
            uuid: new_uuid(),
            checkpoint_counter: 0,
        };
        let ctx = env.thread_context();
        let env_inner = env.clone();
        env.schedule_event(
            &ctx,
            Box::new(move || {
                let mut state = state;
                let exit = state.start();
                drive_async(state, env_inner, exit, handler);
            }),
        );
    }

    /// Restores a checkpoint produced by this script and runs it to
    /// completion synchronously. The resumed `checkpoint()` call returns
    /// null.
    pub fn restore(
        &self,
        bytes: &[u8],
        bindings: &mut Globals,
        context: &Context,
        output: &mut dyn PrintWriter,
    ) -> Result<Value, RuntimeError> {
        let chain = Suspension::restore_chain(bytes)
            .map_err(|e| RuntimeError::general(format!("cannot restore checkpoint: {e}")))?
            .ok_or_else(|| RuntimeError::general("empty checkpoint"))?;
        let mut vm = Vm::new(&self.program, context, bindings, output);
        let exit = resume_chain(&mut vm, chain, Value::Null);
        drive_exit(&self.program, context, bindings, output, exit, &new_uuid(), &mut 0)
    }
}

/// Compiles a source of class declarations and registers them.
pub fn compile_class(source: &str, script_name: &str, context: &mut Context) -> Result<(), CompileError> {
    let program = compile_source(source, script_name, context, &[])?;
    if program.classes.is_empty() {
        return Err(CompileError::new("no class declared", Default::default())
            .with_source(script_name, source));
    }
    for class in &program.classes {
        context.register_class(class.clone());
    }
    Ok(())
}

/// Compile and run in one step; the bindings' names are visible to the
/// resolver as globals, and the map is updated in place.
pub fn eval(source: &str, bindings: &mut Globals, context: &mut Context) -> Result<Value, ScriptError> {
    let names: Vec<Rc<str>> = bindings.keys().cloned().collect();
    let script = Script::compile_with_globals(source, "<eval>", context, &names)?;
    Ok(script.run_sync(bindings, context)?)
}

fn new_uuid() -> Rc<str> {
    uuid::Uuid::new_v4().to_string().into()
}

// ---------------------------------------------------------------------------
// drive loops
// ---------------------------------------------------------------------------

/// Resumes a continuation chain from the inside out. When a re-entered
/// frame suspends again, the not-yet-resumed outer records are spliced
/// onto the new chain.
pub(crate) fn resume_chain(vm: &mut Vm<'_>, chain: Box<Continuation>, value: Value) -> ExecResult {
    let records = chain.into_resume_order();
    let mut value = value;
    let mut iter = records.into_iter();
    while let Some(record) = iter.next() {
        match vm.resume_one(record, value)? {
            FrameExit::Return(v) => value = v,
            FrameExit::Suspended(mut susp) => {
                for outer in iter {
                    susp.push_frame(outer);
                }
                return Ok(FrameExit::Suspended(susp));
            }
        }
    }
    Ok(FrameExit::Return(value))
}

/// Synchronous drive: run from the top, then service suspensions inline
/// until the script completes.
pub(crate) fn drive_sync(
    program: &CompiledProgram,
    context: &Context,
    globals: &mut Globals,
    output: &mut dyn PrintWriter,
) -> Result<Value, RuntimeError> {
    let exit = {
        let mut vm = Vm::new(program, context, globals, output);
        vm.run_main()
    };
    drive_exit(program, context, globals, output, exit, &new_uuid(), &mut 0)
}

fn drive_exit(
    program: &CompiledProgram,
    context: &Context,
    globals: &mut Globals,
    output: &mut dyn PrintWriter,
    mut exit: ExecResult,
    uuid: &Rc<str>,
    checkpoint_counter: &mut u64,
) -> Result<Value, RuntimeError> {
    loop {
        match exit? {
            FrameExit::Return(value) => return Ok(value),
            FrameExit::Suspended(susp) => {
                let Suspension { cause, chain } = *susp;
                let Some(chain) = chain else {
                    return Err(RuntimeError::internal("suspension without frames"));
                };
                match cause {
                    SuspendCause::Sleep { millis, result } => {
                        if millis > 0 {
                            std::thread::sleep(std::time::Duration::from_millis(millis.unsigned_abs()));
                        }
                        let mut vm = Vm::new(program, context, globals, output);
                        exit = resume_chain(&mut vm, chain, result);
                    }
                    SuspendCause::Checkpoint => {
                        *checkpoint_counter += 1;
                        let value = service_checkpoint(program, context, &chain, uuid, *checkpoint_counter)?;
                        let mut vm = Vm::new(program, context, globals, output);
                        exit = resume_chain(&mut vm, chain, value);
                    }
                }
            }
        }
    }
}

/// Serialises the chain and hands it to the host's checkpoint callback.
/// The synchronous drive requires the host to invoke the resumer before
/// returning.
fn service_checkpoint(
    program: &CompiledProgram,
    context: &Context,
    chain: &Continuation,
    uuid: &Rc<str>,
    checkpoint_id: u64,
) -> Result<Value, RuntimeError> {
    let Some(checkpointer) = &context.checkpointer else {
        return Ok(Value::Null);
    };
    let bytes = postcard::to_allocvec(&Some(chain))
        .map_err(|e| RuntimeError::general(format!("cannot serialise checkpoint: {e}")))?;
    let offset = checkpoint_offset(program, chain);
    let slot: Rc<RefCell<Option<Result<Value, RuntimeError>>>> = Rc::new(RefCell::new(None));
    let resumer_slot = slot.clone();
    checkpointer(CheckpointRequest {
        uuid: uuid.clone(),
        checkpoint_id,
        bytes,
        source: program.source.clone(),
        offset,
        result: Value::Null,
        resumer: Box::new(move |result| {
            *resumer_slot.borrow_mut() = Some(result);
        }),
    });
    let taken = slot.borrow_mut().take();
    match taken {
        Some(result) => result,
        None => Err(RuntimeError::general(
            "checkpoint resumer was not invoked synchronously",
        )),
    }
}

/// Source offset of the innermost script frame of a chain, for checkpoint
/// metadata.
fn checkpoint_offset(program: &CompiledProgram, chain: &Continuation) -> u32 {
    let mut offset = 0;
    let mut current = Some(chain);
    while let Some(record) = current {
        if let ResumeTarget::Script(index) = &record.target {
            if let Some(func) = program.functions.get(*index as usize) {
                if let Some(point) = func.code.resume_points.get(record.method_location as usize) {
                    offset = func.code.location_at(point.ip.saturating_sub(1)).offset;
                }
            }
        }
        current = record.caller.as_deref();
    }
    offset
}

// ---------------------------------------------------------------------------
// asynchronous drive
// ---------------------------------------------------------------------------

struct ExecState {
    program: Rc<CompiledProgram>,
    context: Rc<Context>,
    globals: Globals,
    output: Box<dyn PrintWriter>,
    uuid: Rc<str>,
    checkpoint_counter: u64,
}

impl ExecState {
    fn start(&mut self) -> ExecResult {
        let mut vm = Vm::new(&self.program, &self.context, &mut self.globals, &mut *self.output);
        vm.run_main()
    }

    fn resume(&mut self, chain: Box<Continuation>, value: Value) -> ExecResult {
        let mut vm = Vm::new(&self.program, &self.context, &mut self.globals, &mut *self.output);
        resume_chain(&mut vm, chain, value)
    }
}

/// One step of the asynchronous drive: deliver the result, or schedule the
/// next resume through the environment and return. Each suspension posts a
/// fresh task, so the compute thread is never blocked.
fn drive_async(mut state: ExecState, env: Rc<dyn RuntimeEnv>, exit: ExecResult, handler: ResultHandler) {
    match exit {
        Err(e) => handler(Err(e)),
        Ok(FrameExit::Return(value)) => handler(Ok(value)),
        Ok(FrameExit::Suspended(susp)) => {
            let Suspension { cause, chain } = *susp;
            let Some(chain) = chain else {
                handler(Err(RuntimeError::internal("suspension without frames")));
                return;
            };
            match cause {
                SuspendCause::Sleep { millis, result } => {
                    let ctx = env.thread_context();
                    let env_inner = env.clone();
                    env.schedule_event_delayed(
                        &ctx,
                        Box::new(move || {
                            let exit = state.resume(chain, result);
                            drive_async(state, env_inner, exit, handler);
                        }),
                        millis,
                    );
                }
                SuspendCause::Checkpoint => {
                    state.checkpoint_counter += 1;
                    let value = match service_checkpoint(
                        &state.program,
                        &state.context,
                        &chain,
                        &state.uuid,
                        state.checkpoint_counter,
                    ) {
                        Ok(value) => value,
                        Err(e) => {
                            handler(Err(e));
                            return;
                        }
                    };
                    let exit = state.resume(chain, value);
                    drive_async(state, env, exit, handler);
                }
            }
        }
    }
}

/// The default environment, for hosts that have no scheduler of their own.
#[must_use]
pub fn default_env() -> Rc<dyn RuntimeEnv> {
    DefaultEnv::rc()
}
