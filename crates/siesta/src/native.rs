//! Host-registered (native) functions.
//!
//! A native function is a Rust closure driven as a small step machine so it
//! can cooperate with suspension: instead of calling back into the
//! interpreter directly, it returns an outcome telling the VM what to do
//! next. A native that invokes a script closure returns `CallValue` with a
//! serialisable state vector and the step to re-enter at; if the closure
//! suspends, that state rides in the continuation chain like any script
//! frame's locals.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{
    error::RuntimeError,
    types::Type,
    value::Value,
};

/// Why an execution suspended. The drive loop services the cause and then
/// resumes the continuation chain with a result value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SuspendCause {
    /// Suspend for `millis`, then resume with `result`. Zero still takes
    /// the full suspend/resume path; the forced-suspension test harness
    /// depends on that.
    Sleep { millis: i64, result: Value },
    /// Persist the continuation chain through the host's checkpoint
    /// callback, then resume.
    Checkpoint,
}

/// What the VM receives when it invokes a native function.
#[derive(Debug)]
pub enum NativeInput {
    /// First entry: the evaluated arguments.
    Args(Vec<Value>),
    /// Re-entry after a `CallValue`: the callee's result.
    Resumed(Value),
}

/// One invocation of a native function: the step to run and the state saved
/// by the previous step (empty on first entry).
#[derive(Debug)]
pub struct NativeCall {
    pub step: u32,
    pub state: Vec<Value>,
    pub input: NativeInput,
}

impl NativeCall {
    #[must_use]
    pub fn first(args: Vec<Value>) -> Self {
        Self { step: 0, state: Vec::new(), input: NativeInput::Args(args) }
    }
}

/// What a native function asks the VM to do.
#[derive(Debug)]
pub enum NativeOutcome {
    /// Done; this is the call's value.
    Return(Value),
    /// Suspend the whole execution. The drive loop resumes the chain with
    /// the cause's result value.
    Suspend(SuspendCause),
    /// Invoke `callee` (a script closure or method handle) with `args`,
    /// then re-enter this native at `next_step` carrying `state`.
    CallValue {
        callee: Value,
        args: Vec<Value>,
        state: Vec<Value>,
        next_step: u32,
    },
}

pub type NativeResult = Result<NativeOutcome, RuntimeError>;
pub type NativeImpl = Rc<dyn Fn(NativeCall) -> NativeResult>;

/// A parameter of a native function.
#[derive(Debug, Clone)]
pub struct NativeParam {
    pub name: Rc<str>,
    pub ty: Type,
    /// Marks a parameter whose asyncness infects the call: when the
    /// argument is an async closure, the call site becomes a suspension
    /// point even if the native itself is synchronous.
    pub async_if_arg_async: bool,
}

impl NativeParam {
    #[must_use]
    pub fn new(name: &str, ty: Type) -> Self {
        Self { name: name.into(), ty, async_if_arg_async: false }
    }

    #[must_use]
    pub fn async_param(name: &str, ty: Type) -> Self {
        Self { name: name.into(), ty, async_if_arg_async: true }
    }
}

/// A registered native function.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: Rc<str>,
    pub params: Vec<NativeParam>,
    pub return_ty: Type,
    /// Unconditionally async: every call is a suspension point.
    pub is_async: bool,
    pub imp: NativeImpl,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("is_async", &self.is_async)
            .finish_non_exhaustive()
    }
}

impl NativeFunction {
    pub fn new(
        name: &str,
        params: Vec<NativeParam>,
        return_ty: Type,
        is_async: bool,
        imp: impl Fn(NativeCall) -> NativeResult + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            return_ty,
            is_async,
            imp: Rc::new(imp),
        }
    }

    /// Minimum arguments a call must supply (params without defaults; native
    /// params have no defaults, so optional means trailing `def`-typed ones
    /// the implementation tolerates missing).
    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

fn int_arg(args: &[Value], index: usize, what: &str) -> Result<i64, RuntimeError> {
    match arg(args, index) {
        Value::Int(v) => Ok(i64::from(v)),
        Value::Long(v) => Ok(v),
        other => Err(RuntimeError::general(format!(
            "{what} must be numeric, not {}",
            other.type_of()
        ))),
    }
}

/// `sleep(millis)` / `sleep(millis, result)`: the built-in suspension
/// primitive. Always suspends, even for zero.
pub fn sleep_native() -> NativeFunction {
    NativeFunction::new(
        "sleep",
        vec![
            NativeParam::new("millis", Type::Long),
            NativeParam::new("result", Type::Def),
        ],
        Type::Def,
        true,
        |call| {
            let NativeInput::Args(args) = call.input else {
                return Err(RuntimeError::internal("sleep does not re-enter"));
            };
            let millis = int_arg(&args, 0, "sleep time")?;
            let result = arg(&args, 1);
            Ok(NativeOutcome::Suspend(SuspendCause::Sleep { millis, result }))
        },
    )
}

/// `checkpoint()`: persist the current continuation chain through the
/// host's checkpoint callback, then carry on.
pub fn checkpoint_native() -> NativeFunction {
    NativeFunction::new("checkpoint", Vec::new(), Type::Def, true, |call| {
        let NativeInput::Args(_) = call.input else {
            return Err(RuntimeError::internal("checkpoint does not re-enter"));
        };
        Ok(NativeOutcome::Suspend(SuspendCause::Checkpoint))
    })
}

/// `nanoTime()`: nanoseconds since the Unix epoch, as a long.
pub fn nano_time_native() -> NativeFunction {
    NativeFunction::new("nanoTime", Vec::new(), Type::Long, false, |_call| {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| RuntimeError::general("system clock before epoch"))?
            .as_nanos();
        Ok(NativeOutcome::Return(Value::Long(nanos as i64)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_suspends_with_its_result() {
        let sleep = sleep_native();
        let outcome = (sleep.imp)(NativeCall::first(vec![Value::Int(0), Value::Int(7)])).unwrap();
        match outcome {
            NativeOutcome::Suspend(SuspendCause::Sleep { millis, result }) => {
                assert_eq!(millis, 0);
                assert!(result.loose_eq(&Value::Int(7)));
            }
            other => panic!("expected suspend, got {other:?}"),
        }
    }

    #[test]
    fn sleep_rejects_non_numeric_delay() {
        let sleep = sleep_native();
        let err = (sleep.imp)(NativeCall::first(vec![Value::string("x")])).unwrap_err();
        assert!(err.message.contains("must be numeric"));
    }
}
