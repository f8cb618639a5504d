//! The stack-machine instruction set and constant pool entries.
//!
//! Instructions are an enum rather than packed bytes: the backend contract
//! only asks for a stack target with typed slots, guarded regions, and a
//! computed jump, and the enum keeps resume-point bookkeeping exact. Each
//! instruction's stack effect is derivable from its fields, which the
//! builder uses to track depth (and with it the synthesised-slot counts
//! snapshotted at suspension points).

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{
    types::Type,
    value::Value,
};

/// Sentinel for call sites that can never suspend.
pub const NO_SUSPEND: u32 = u32::MAX;

/// Normalised literal key used by switch dispatch tables and duplicate
/// detection. Numeric widths collapse: `1`, `1L`, `1.0` and `1.00` share
/// the `Int(1)` key; fractional values use their canonical decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LitKey {
    Null,
    Bool(bool),
    Int(i64),
    Dec(String),
    Str(Rc<str>),
}

impl LitKey {
    /// The key for a runtime value, if the value is a valid switch key.
    #[must_use]
    pub fn of_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Int(v) => Some(Self::Int(i64::from(*v))),
            Value::Long(v) => Some(Self::Int(*v)),
            Value::Double(v) => {
                if v.fract() == 0.0 && v.is_finite() && (*v >= -(2f64.powi(63))) && (*v < 2f64.powi(63)) {
                    Some(Self::Int(*v as i64))
                } else {
                    crate::decimal::Decimal::from_f64(*v).map(|d| Self::Dec(d.normalized().to_string()))
                }
            }
            Value::Decimal(d) => match d.to_i64() {
                Some(v) => Some(Self::Int(v)),
                None => Some(Self::Dec(d.normalized().to_string())),
            },
            Value::Str(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }
}

/// One piece of a substitution replacement template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplPart {
    Text(Rc<str>),
    /// `$n`: the n-th capture group of the current match.
    Capture(u8),
}

/// A constant pool entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Const {
    Value(Value),
    Type(Type),
    /// A regex compiled lazily per run and cached by the VM.
    Regex { pattern: Rc<str>, case_insensitive: bool },
    /// Replacement template for `s/…/…/`.
    Replacement(Vec<ReplPart>),
    /// Dispatch table for a table-lookup switch: key to target ip, plus the
    /// target when no key matches.
    JumpTable { entries: Vec<(LitKey, u32)>, default: u32 },
}

/// One stack-machine instruction. Jump targets are absolute instruction
/// indices, patched by the builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Instr {
    // ---- constants and slots ----
    /// Push constant pool entry (must be `Const::Value`).
    Const(u16),
    /// Push null.
    Null,
    /// Push the raw slot value.
    LoadLocal(u16),
    /// Pop into the slot.
    StoreLocal(u16),
    /// Slot holds a cell: push the cell's content.
    LoadCell(u16),
    /// Slot holds a cell: pop and write through it.
    StoreCell(u16),
    /// Box the slot's current value into a fresh cell (function entry, for
    /// captured parameters).
    NewCell(u16),
    /// Push the content of the function's n-th captured cell.
    LoadCapture(u16),
    /// Pop and write through the function's n-th captured cell.
    StoreCapture(u16),
    /// Push global by name (name is a string constant); error when the
    /// global does not exist.
    LoadGlobal(u16),
    /// Pop into an existing or new global.
    StoreGlobal(u16),

    // ---- stack ----
    Pop,
    Dup,

    // ---- operators ----
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Not,
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,

    // ---- control flow ----
    Jump(u32),
    /// Pop; jump when falsy.
    JumpIfFalse(u32),
    /// Pop; jump when truthy.
    JumpIfTrue(u32),
    /// Peek; jump when null, leaving the null in place (safe navigation
    /// regions resolve to it).
    JumpIfNull(u32),
    /// Pop the subject, normalise to a literal key, jump through the table
    /// constant (`Const::JumpTable`).
    LookupSwitch(u16),

    // ---- aggregates ----
    /// Pop n values (pushed left to right) into a new list.
    NewList(u16),
    /// Pop n key/value pairs (key under value) into a new ordered map.
    NewMap(u16),
    /// Pop n parts and concatenate their display strings.
    BuildString(u16),

    // ---- accessors ----
    /// Pop receiver, push the named field (instance field or map entry).
    GetField { name: u16, safe: bool },
    /// Pop value then receiver, set the named field, push the value back.
    SetField { name: u16 },
    /// Pop index then receiver, push the element.
    GetIndex,
    /// Pop value, index, receiver; set; push the value back.
    SetIndex,
    /// Pop a list/map/string, push its size.
    Size,

    // ---- types ----
    /// Pop, push whether the value inhabits the type (exact tag test).
    TypeTest(u16),
    /// Pop, push the `instanceof` answer (class-hierarchy aware).
    InstanceCheck { ty: u16, negated: bool },
    /// Pop, convert (numeric widening/narrowing, to-string), push.
    Cast(u16),
    /// Pop, verify the value inhabits the type, push unchanged; runtime
    /// error otherwise.
    CheckCast(u16),

    // ---- pattern helpers ----
    /// Pop a list, push element at the index; negative indexes from the
    /// end. Bounds were established by a preceding size test.
    ListGet(i16),
    /// Pop a map, push the value under the key constant (null if absent).
    MapGet(u16),
    /// Pop a map, push whether the key constant is present.
    MapHas(u16),
    /// Pop a string subject, run the regex constant, push whether it found
    /// a match; capture groups land in the frame's match slot.
    RegexFind(u16),
    /// Pop a pattern string then a subject string, match dynamically
    /// (pattern built at run time), push whether it found a match.
    RegexMatchDyn { case_insensitive: bool },
    /// Pop a string subject, replace matches of the regex constant using
    /// the replacement template constant, push the new string.
    RegexSubst { regex: u16, replacement: u16, global: bool },
    /// Push capture group n of the frame's match slot.
    LoadCaptureVar(u8),

    // ---- calls ----
    /// Pop argc args, invoke program function. `loc` is this site's
    /// suspension location, `NO_SUSPEND` in sync code.
    CallScript { func: u32, argc: u8, loc: u32 },
    /// Pop argc args, invoke native function.
    CallNative { native: u32, argc: u8, loc: u32 },
    /// Pop argc args then the callee value, invoke it.
    CallValue { argc: u8, loc: u32 },
    /// Pop argc args then the receiver, dispatch by name (instance method,
    /// built-in value method, or callable field).
    CallMethod { name: u16, argc: u8, safe: bool, loc: u32 },
    /// Pop argc args, allocate an instance of the named class and bind
    /// fields in declaration order.
    NewInstance { class: u16, argc: u8 },
    /// Create a closure over the current frame per the function's capture
    /// list.
    MakeClosure { func: u32 },
    /// Pop a source string, compile and run it against the current context
    /// and globals.
    EvalInstr { loc: u32 },

    // ---- statements ----
    /// Pop and write to the print writer.
    Print { newline: bool },
    /// Pop and abort the script with a die error.
    DieInstr,
    /// Return the top of stack from the current function.
    Return,
}

impl Instr {
    /// Net stack effect. Exact for every variant; operand counts come from
    /// the instruction fields.
    #[must_use]
    pub fn stack_effect(&self) -> i16 {
        match self {
            Self::Const(_)
            | Self::Null
            | Self::LoadLocal(_)
            | Self::LoadCell(_)
            | Self::LoadCapture(_)
            | Self::LoadGlobal(_)
            | Self::LoadCaptureVar(_)
            | Self::Dup
            | Self::MakeClosure { .. } => 1,
            Self::StoreLocal(_)
            | Self::StoreCell(_)
            | Self::StoreCapture(_)
            | Self::StoreGlobal(_)
            | Self::Pop
            | Self::JumpIfFalse(_)
            | Self::JumpIfTrue(_)
            | Self::LookupSwitch(_)
            | Self::Print { .. }
            | Self::DieInstr
            | Self::Return => -1,
            Self::NewCell(_) | Self::Jump(_) | Self::JumpIfNull(_) => 0,
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Rem
            | Self::CmpEq
            | Self::CmpNe
            | Self::CmpLt
            | Self::CmpLe
            | Self::CmpGt
            | Self::CmpGe => -1,
            Self::Neg | Self::Not => 0,
            Self::NewList(n) | Self::BuildString(n) => 1 - i16::try_from(*n).unwrap_or(i16::MAX),
            Self::NewMap(n) => 1 - 2 * i16::try_from(*n).unwrap_or(i16::MAX / 2),
            Self::GetField { .. } | Self::Size | Self::TypeTest(_) | Self::InstanceCheck { .. } => 0,
            Self::Cast(_) | Self::CheckCast(_) => 0,
            Self::SetField { .. } => -1,
            Self::GetIndex => -1,
            Self::SetIndex => -2,
            Self::ListGet(_) | Self::MapGet(_) | Self::MapHas(_) | Self::RegexFind(_) => 0,
            Self::RegexMatchDyn { .. } => -1,
            Self::RegexSubst { .. } => 0,
            Self::CallScript { argc, .. } | Self::CallNative { argc, .. } | Self::NewInstance { argc, .. } => {
                1 - i16::from(*argc)
            }
            Self::CallValue { argc, .. } | Self::CallMethod { argc, .. } => -i16::from(*argc),
            Self::EvalInstr { .. } => 0,
        }
    }

    /// Rewrites the jump target of a branch instruction. Panics on
    /// non-branch instructions; only the builder's patcher calls it.
    pub(crate) fn set_jump_target(&mut self, target: u32) {
        match self {
            Self::Jump(t) | Self::JumpIfFalse(t) | Self::JumpIfTrue(t) | Self::JumpIfNull(t) => {
                *t = target;
            }
            other => panic!("not a branch instruction: {other:?}"),
        }
    }
}
