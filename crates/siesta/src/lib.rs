#![doc = include_str!("../../../README.md")]

pub mod analyse;
pub mod ast;
mod codegen;
mod context;
pub mod decimal;
pub mod decorate;
mod env;
mod error;
mod io;
mod lex;
mod native;
mod parse;
mod resolve;
mod run;
pub mod token;
pub mod tracer;
mod types;
mod value;
mod vm;
pub mod continuation;

pub use crate::{
    codegen::{ClassUnit, CompiledProgram},
    context::{CheckpointRequest, Checkpointer, Context},
    env::{DefaultEnv, RuntimeEnv, Task, ThreadContext},
    error::{CodeRange, CompileError, RuntimeError, RuntimeErrorKind},
    io::{CollectPrint, PrintWriter, StdPrint},
    lex::tokenise,
    native::{
        NativeCall, NativeFunction, NativeImpl, NativeInput, NativeOutcome, NativeParam,
        NativeResult, SuspendCause,
    },
    parse::parse,
    resolve::resolve,
    run::{compile_class, default_env, eval, ResultHandler, Script, ScriptError},
    types::{Type, TypeTags},
    value::{FuncTarget, FunctionValue, Instance, Value},
    vm::{FrameExit, Globals},
};
