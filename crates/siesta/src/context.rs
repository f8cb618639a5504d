//! The compilation/execution context: registration tables and options.
//!
//! All process-wide state (registered native functions, registered classes)
//! lives here and is threaded through compilation and execution explicitly.
//! Registration happens before scripts run; the tables are read-only during
//! execution.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    codegen::ClassUnit,
    error::RuntimeError,
    native::{checkpoint_native, nano_time_native, sleep_native, NativeFunction},
    value::Value,
};

/// A request to persist a checkpoint, handed to the host's callback.
///
/// The host stores `bytes` (with whatever retry policy it wants) and then
/// invokes `resumer` with the `result` value to continue the script — or
/// with a runtime error to surface a persistence failure into the script's
/// error channel.
pub struct CheckpointRequest {
    /// Stable id of the running script instance.
    pub uuid: Rc<str>,
    /// Monotonic checkpoint counter within this execution.
    pub checkpoint_id: u64,
    /// Self-contained serialised continuation chain.
    pub bytes: Vec<u8>,
    /// The script source, for host-side bookkeeping.
    pub source: Rc<str>,
    /// Source offset of the suspension point.
    pub offset: u32,
    /// The value execution resumes with once persistence completes.
    pub result: Value,
    /// Continues the suspended execution.
    pub resumer: Box<dyn FnOnce(Result<Value, RuntimeError>)>,
}

pub type Checkpointer = Rc<dyn Fn(CheckpointRequest)>;

/// Registration tables plus compilation options.
pub struct Context {
    /// Registered natives; `None` marks a deregistered slot (ids stay
    /// stable because compiled code references them by index).
    natives: Vec<Option<NativeFunction>>,
    native_index: AHashMap<Rc<str>, u32>,
    classes: AHashMap<Rc<str>, Rc<ClassUnit>>,
    /// Fold constant expressions during resolution.
    pub evaluate_const_exprs: bool,
    /// Top-level declarations become globals; undefined-variable
    /// diagnostics are deferred to run time.
    pub repl_mode: bool,
    /// Diagnostic verbosity; non-zero routes tracer events to stderr.
    pub debug: u8,
    pub(crate) checkpointer: Option<Checkpointer>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("natives", &self.natives.iter().flatten().map(|n| n.name.clone()).collect::<Vec<_>>())
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("repl_mode", &self.repl_mode)
            .finish_non_exhaustive()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A fresh context with the built-in natives (`sleep`, `checkpoint`,
    /// `nanoTime`) registered.
    #[must_use]
    pub fn new() -> Self {
        let mut ctx = Self {
            natives: Vec::new(),
            native_index: AHashMap::new(),
            classes: AHashMap::new(),
            evaluate_const_exprs: false,
            repl_mode: false,
            debug: 0,
            checkpointer: None,
        };
        ctx.register_function(sleep_native());
        ctx.register_function(checkpoint_native());
        ctx.register_function(nano_time_native());
        ctx
    }

    #[must_use]
    pub fn repl_mode(mut self, on: bool) -> Self {
        self.repl_mode = on;
        self
    }

    #[must_use]
    pub fn evaluate_const_exprs(mut self, on: bool) -> Self {
        self.evaluate_const_exprs = on;
        self
    }

    #[must_use]
    pub fn debug(mut self, level: u8) -> Self {
        self.debug = level;
        self
    }

    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Checkpointer) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    // ---- native functions --------------------------------------------------

    /// Registers (or replaces) a native function.
    pub fn register_function(&mut self, function: NativeFunction) {
        let name = function.name.clone();
        if let Some(&id) = self.native_index.get(&name) {
            self.natives[id as usize] = Some(function);
            return;
        }
        let id = self.natives.len() as u32;
        self.natives.push(Some(function));
        self.native_index.insert(name, id);
    }

    /// Removes a registration. Compiled scripts that still reference it
    /// fail at the call with a runtime error.
    pub fn deregister_function(&mut self, name: &str) {
        if let Some(&id) = self.native_index.get(name) {
            self.natives[id as usize] = None;
            self.native_index.remove(name);
        }
    }

    #[must_use]
    pub fn find_native(&self, name: &str) -> Option<(u32, &NativeFunction)> {
        let &id = self.native_index.get(name)?;
        self.natives[id as usize].as_ref().map(|f| (id, f))
    }

    pub(crate) fn native(&self, id: u32) -> Result<&NativeFunction, RuntimeError> {
        self.natives
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| RuntimeError::general("function has been deregistered"))
    }

    // ---- classes -----------------------------------------------------------

    /// Registers a compiled class under its full name.
    pub fn register_class(&mut self, class: Rc<ClassUnit>) {
        self.classes.insert(class.name.clone(), class);
    }

    #[must_use]
    pub fn find_class(&self, name: &str) -> Option<&Rc<ClassUnit>> {
        self.classes.get(name)
    }

    /// Whether `class` (full name) is `ancestor` or inherits from it,
    /// searching `extra` (a script's own classes) before the registry.
    #[must_use]
    pub fn class_is_a(&self, extra: &[Rc<ClassUnit>], class: &str, ancestor: &str) -> bool {
        let mut current = class.to_owned();
        loop {
            if current == ancestor {
                return true;
            }
            let unit = extra
                .iter()
                .find(|c| &*c.name == current.as_str())
                .or_else(|| self.find_class(&current));
            match unit.and_then(|u| u.superclass.clone()) {
                Some(superclass) => current = superclass.to_string(),
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeOutcome;
    use crate::types::Type;

    #[test]
    fn builtins_are_registered() {
        let ctx = Context::new();
        assert!(ctx.find_native("sleep").is_some());
        assert!(ctx.find_native("checkpoint").is_some());
    }

    #[test]
    fn deregistration_keeps_ids_stable() {
        let mut ctx = Context::new();
        ctx.register_function(NativeFunction::new("f", Vec::new(), Type::Def, false, |_| {
            Ok(NativeOutcome::Return(Value::Int(1)))
        }));
        let (id, _) = ctx.find_native("f").unwrap();
        ctx.deregister_function("f");
        assert!(ctx.find_native("f").is_none());
        assert!(ctx.native(id).is_err());
    }
}
