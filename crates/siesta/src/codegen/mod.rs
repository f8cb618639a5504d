//! Code generation: the stack-machine target and the compiler that lowers
//! the annotated tree onto it.
//!
//! # Module structure
//!
//! - `instr` — instruction and constant-pool definitions
//! - `code` — `Code` objects and the emitting `CodeBuilder`
//! - `program` — compiled functions, classes, and whole scripts
//! - `compiler` — expression/statement lowering
//! - `patterns` — switch-case lowering (further methods on the compiler)

pub use code::{Code, CodeBuilder, ResumePoint};
pub use compiler::compile;
pub use instr::{Const, Instr, LitKey, ReplPart, NO_SUSPEND};
pub use program::{ClassUnit, CompiledFunction, CompiledProgram, FieldInfo};

mod code;
mod compiler;
mod instr;
mod patterns;
mod program;
