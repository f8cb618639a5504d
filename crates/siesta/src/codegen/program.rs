//! Compiled program units: functions, classes, and the whole script.

use std::rc::Rc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use super::code::Code;
use crate::{
    ast::{CaptureSource, SlotKind},
    types::Type,
    value::Value,
};

/// A compiled function body with its frame layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub name: Rc<str>,
    pub param_count: u16,
    /// Constant defaults for trailing parameters, aligned to the last
    /// `defaults.len()` parameters.
    pub defaults: Vec<Value>,
    /// Storage kind of every frame slot, in slot order. The snapshot layout
    /// of every suspension point derives from this.
    pub slot_kinds: Vec<SlotKind>,
    /// Cells to capture from the enclosing frame when a closure over this
    /// function is created.
    pub captures: Vec<CaptureSource>,
    /// Hidden slot holding regex match captures, if the body uses any.
    pub match_slot: Option<u16>,
    /// Whether this function contains suspension points. Sync functions
    /// have no resume table and never snapshot.
    pub is_async: bool,
    pub code: Code,
}

/// A field of a compiled class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: Rc<str>,
    pub ty: Type,
    /// Constant initialiser; fields without one are constructor
    /// parameters.
    pub default: Option<Value>,
}

/// A compiled class: fields in declaration order plus method bodies.
///
/// Classes registered through `compile_class` outlive the script that
/// declared them, so the unit owns its methods' code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassUnit {
    /// Full (package-qualified) name.
    pub name: Rc<str>,
    pub superclass: Option<Rc<str>>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<CompiledFunction>,
    /// Method name to index in `methods`.
    pub method_index: AHashMap<Rc<str>, u32>,
}

impl ClassUnit {
    #[must_use]
    pub fn find_method(&self, name: &str) -> Option<&CompiledFunction> {
        self.method_index.get(name).map(|&i| &self.methods[i as usize])
    }
}

/// A compiled script: the main body is function 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub script_name: Rc<str>,
    pub source: Rc<str>,
    pub functions: Vec<CompiledFunction>,
    /// Classes declared inside this script, also registered in the context
    /// at compile time.
    pub classes: Vec<Rc<ClassUnit>>,
}

impl CompiledProgram {
    pub const MAIN: u32 = 0;

    #[must_use]
    pub fn function(&self, id: u32) -> &CompiledFunction {
        &self.functions[id as usize]
    }

    #[must_use]
    pub fn find_class(&self, name: &str) -> Option<&Rc<ClassUnit>> {
        self.classes.iter().find(|c| &*c.name == name)
    }
}
