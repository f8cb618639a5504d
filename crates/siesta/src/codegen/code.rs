//! Code objects and the builder that emits them.
//!
//! `CodeBuilder` tracks the operand-stack depth as it emits, handles
//! forward jumps with patching, and records source locations for runtime
//! error carets. Depth tracking is also what fixes the snapshot layout of
//! each suspension point: the values below an async call's arguments are
//! the synthesised slots a continuation must save.

use serde::{Deserialize, Serialize};

use super::instr::{Const, Instr, LitKey};
use crate::{
    error::CodeRange,
    types::Type,
    value::Value,
};

/// A resume point of an async function: where to continue and how many
/// operand-stack values were saved below the call's result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResumePoint {
    /// Instruction index immediately after the suspending call.
    pub ip: u32,
    /// Operand-stack values live across the call (excluding the result).
    pub saved_stack: u16,
}

/// Compiled code for one function body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Code {
    pub instrs: Vec<Instr>,
    pub consts: Vec<Const>,
    /// (instruction index, source range) pairs, ascending by index.
    pub locations: Vec<(u32, CodeRange)>,
    /// Indexed by suspension location; empty for sync functions.
    pub resume_points: Vec<ResumePoint>,
    pub max_stack: u16,
}

impl Code {
    /// The source range of the instruction at `ip`, from the nearest
    /// preceding location entry.
    #[must_use]
    pub fn location_at(&self, ip: u32) -> CodeRange {
        match self.locations.binary_search_by_key(&ip, |&(i, _)| i) {
            Ok(idx) => self.locations[idx].1,
            Err(0) => CodeRange::default(),
            Err(idx) => self.locations[idx - 1].1,
        }
    }
}

/// A pending forward jump returned by `emit_jump`.
#[derive(Debug, Clone, Copy)]
#[must_use = "forward jumps must be patched"]
pub struct JumpLabel {
    ip: u32,
}

/// Emits instructions for one function body.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    instrs: Vec<Instr>,
    consts: Vec<Const>,
    locations: Vec<(u32, CodeRange)>,
    resume_points: Vec<ResumePoint>,
    current_location: Option<CodeRange>,
    depth: u16,
    max_depth: u16,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source location recorded for subsequently emitted
    /// instructions.
    pub fn set_location(&mut self, range: CodeRange) {
        self.current_location = Some(range);
    }

    /// Current instruction index (the ip the next emit will get).
    #[must_use]
    pub fn ip(&self) -> u32 {
        self.instrs.len() as u32
    }

    /// Current tracked operand-stack depth.
    #[must_use]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Resets the tracked depth at a merge point. The compiler calls this
    /// after branches so each join continues from the depth the live path
    /// actually has.
    pub fn set_depth(&mut self, depth: u16) {
        self.depth = depth;
    }

    pub fn emit(&mut self, instr: Instr) -> u32 {
        let ip = self.ip();
        if let Some(range) = self.current_location.take() {
            self.locations.push((ip, range));
        }
        let effect = instr.stack_effect();
        self.instrs.push(instr);
        self.adjust(effect);
        ip
    }

    fn adjust(&mut self, effect: i16) {
        let depth = i32::from(self.depth) + i32::from(effect);
        self.depth = u16::try_from(depth.max(0)).unwrap_or(0);
        self.max_depth = self.max_depth.max(self.depth);
    }

    /// Emits a branch with a placeholder target, to be patched.
    pub fn emit_jump(&mut self, instr: Instr) -> JumpLabel {
        let ip = self.emit(instr);
        JumpLabel { ip }
    }

    /// Points the branch at the current ip.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.ip();
        self.instrs[label.ip as usize].set_jump_target(target);
    }

    /// Points the branch at an explicit ip.
    pub fn patch_jump_to(&mut self, label: JumpLabel, target: u32) {
        self.instrs[label.ip as usize].set_jump_target(target);
    }

    /// Registers the next suspension location. Must be called just before
    /// emitting the async call; `popped` is how many stack values the call
    /// consumes. Returns the dense location id.
    pub fn add_resume_point(&mut self, popped: u16) -> u32 {
        let loc = self.resume_points.len() as u32;
        let saved_stack = self.depth.saturating_sub(popped);
        // ip of the instruction after the call being emitted next
        self.resume_points.push(ResumePoint { ip: self.ip() + 1, saved_stack });
        loc
    }

    // ---- constant pool -----------------------------------------------------

    pub fn const_value(&mut self, value: Value) -> u16 {
        // dedup the common string/int cases; aggregates are never pooled
        for (i, c) in self.consts.iter().enumerate() {
            if let Const::Value(existing) = c {
                let same = match (existing, &value) {
                    (Value::Str(a), Value::Str(b)) => a == b,
                    (Value::Int(a), Value::Int(b)) => a == b,
                    (Value::Long(a), Value::Long(b)) => a == b,
                    (Value::Bool(a), Value::Bool(b)) => a == b,
                    (Value::Null, Value::Null) => true,
                    _ => false,
                };
                if same {
                    return i as u16;
                }
            }
        }
        self.push_const(Const::Value(value))
    }

    pub fn const_str(&mut self, text: &str) -> u16 {
        self.const_value(Value::string(text.to_owned()))
    }

    pub fn const_type(&mut self, ty: Type) -> u16 {
        for (i, c) in self.consts.iter().enumerate() {
            if let Const::Type(existing) = c {
                if *existing == ty {
                    return i as u16;
                }
            }
        }
        self.push_const(Const::Type(ty))
    }

    pub fn const_regex(&mut self, pattern: &str, case_insensitive: bool) -> u16 {
        self.push_const(Const::Regex { pattern: pattern.into(), case_insensitive })
    }

    pub fn const_replacement(&mut self, parts: Vec<super::instr::ReplPart>) -> u16 {
        self.push_const(Const::Replacement(parts))
    }

    pub fn const_jump_table(&mut self, entries: Vec<(LitKey, u32)>, default: u32) -> u16 {
        self.push_const(Const::JumpTable { entries, default })
    }

    /// Rewrites a jump table's targets after the case bodies are emitted.
    pub fn patch_jump_table(&mut self, id: u16, entries: Vec<(LitKey, u32)>, default: u32) {
        self.consts[id as usize] = Const::JumpTable { entries, default };
    }

    fn push_const(&mut self, c: Const) -> u16 {
        let id = self.consts.len();
        assert!(id <= usize::from(u16::MAX), "constant pool overflow");
        self.consts.push(c);
        id as u16
    }

    pub fn build(self) -> Code {
        Code {
            instrs: self.instrs,
            consts: self.consts,
            locations: self.locations,
            resume_points: self.resume_points,
            max_stack: self.max_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_patches_to_current_ip() {
        let mut b = CodeBuilder::new();
        b.emit(Instr::Null);
        let jump = b.emit_jump(Instr::JumpIfFalse(0));
        b.emit(Instr::Null);
        b.emit(Instr::Pop);
        b.patch_jump(jump);
        let code = b.build();
        assert!(matches!(code.instrs[1], Instr::JumpIfFalse(4)));
    }

    #[test]
    fn depth_tracking_follows_effects() {
        let mut b = CodeBuilder::new();
        b.emit(Instr::Null);
        b.emit(Instr::Null);
        assert_eq!(b.depth(), 2);
        b.emit(Instr::Add);
        assert_eq!(b.depth(), 1);
        assert_eq!(b.build().max_stack, 2);
    }

    #[test]
    fn resume_point_records_values_below_the_call() {
        let mut b = CodeBuilder::new();
        b.emit(Instr::Null); // a value live across the call
        b.emit(Instr::Null); // the argument
        let loc = b.add_resume_point(1);
        b.emit(Instr::CallScript { func: 0, argc: 1, loc });
        let code = b.build();
        assert_eq!(loc, 0);
        assert_eq!(code.resume_points[0].saved_stack, 1);
        assert_eq!(code.resume_points[0].ip, 3);
    }

    #[test]
    fn string_constants_dedup() {
        let mut b = CodeBuilder::new();
        let a = b.const_str("x");
        let c = b.const_str("x");
        assert_eq!(a, c);
    }

    #[test]
    fn location_lookup_uses_nearest_preceding_entry() {
        let mut b = CodeBuilder::new();
        b.set_location(CodeRange::new(0, 1, 1, 1));
        b.emit(Instr::Null);
        b.emit(Instr::Pop);
        b.set_location(CodeRange::new(5, 1, 2, 1));
        b.emit(Instr::Null);
        let code = b.build();
        assert_eq!(code.location_at(1).line, 1);
        assert_eq!(code.location_at(2).line, 2);
    }
}
