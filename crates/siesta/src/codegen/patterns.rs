//! Lowering of switch cases to decision sequences.
//!
//! The subject lands in a hidden slot; every test loads from a slot,
//! consumes what it pushes, and either falls through or jumps to the next
//! alternative, so the operand stack is at the same depth at every jump
//! site. Destructured sub-values go through per-depth scratch slots, which
//! also makes them part of the frame snapshot when a guard or case result
//! suspends mid-switch.
//!
//! Sequential switches chain the alternatives in source order with the
//! `default` case (wherever written) tried last. Table-lookup switches pop
//! the subject through a hash-dispatch constant keyed by normalised
//! literal.

use ahash::AHashSet;

use super::{
    compiler::FnCompiler,
    instr::{Instr, LitKey},
};
use crate::{
    ast::{Literal, Pattern, PatternKind, SwitchCase, SwitchStrategy, VarTarget},
    codegen::code::JumpLabel,
    error::{CodeRange, CompileError},
    types::Type,
    value::Value,
};

type CompileResult<T> = Result<T, CompileError>;

impl FnCompiler<'_> {
    pub(crate) fn compile_switch(
        &mut self,
        subject: &crate::ast::Expr,
        cases: &[SwitchCase],
        subject_slot: u16,
        strategy: SwitchStrategy,
    ) -> CompileResult<()> {
        self.compile_expr(subject)?;
        self.store_slot(subject_slot);
        match strategy {
            SwitchStrategy::TableLookup => self.compile_table_switch(cases, subject_slot),
            SwitchStrategy::Sequential => self.compile_sequential_switch(cases, subject_slot),
        }
    }

    fn compile_sequential_switch(&mut self, cases: &[SwitchCase], subject_slot: u16) -> CompileResult<()> {
        let base = self.b.depth();
        let mut end_jumps: Vec<JumpLabel> = Vec::new();

        // default runs only when everything else failed, wherever written
        let ordered: Vec<&SwitchCase> = cases
            .iter()
            .filter(|c| !c.is_default)
            .chain(cases.iter().filter(|c| c.is_default))
            .collect();

        for case in ordered {
            let mut body_jumps: Vec<JumpLabel> = Vec::new();
            if case.is_default {
                // no tests: fall straight into the body
            } else {
                for alt in &case.patterns {
                    let mut fail: Vec<JumpLabel> = Vec::new();
                    let mut seen: AHashSet<u16> = AHashSet::new();
                    self.compile_pattern(&alt.pattern, subject_slot, 0, &mut fail, &mut seen)?;
                    if let Some(guard) = &alt.guard {
                        self.compile_expr(guard)?;
                        fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));
                    }
                    body_jumps.push(self.b.emit_jump(Instr::Jump(0)));
                    for jump in fail {
                        self.b.patch_jump(jump);
                    }
                    self.b.set_depth(base);
                }
            }
            // all alternatives failed: go on to the next case
            let next_case = if case.is_default {
                None
            } else {
                Some(self.b.emit_jump(Instr::Jump(0)))
            };
            for jump in body_jumps {
                self.b.patch_jump(jump);
            }
            self.b.set_depth(base);
            self.compile_expr(&case.result)?;
            end_jumps.push(self.b.emit_jump(Instr::Jump(0)));
            if let Some(next_case) = next_case {
                self.b.patch_jump(next_case);
            }
            self.b.set_depth(base);
        }

        // nothing matched and no default: the switch's value is null
        self.b.emit(Instr::Null);
        for jump in end_jumps {
            self.b.patch_jump(jump);
        }
        self.b.set_depth(base + 1);
        Ok(())
    }

    fn compile_table_switch(&mut self, cases: &[SwitchCase], subject_slot: u16) -> CompileResult<()> {
        self.load_slot(subject_slot);
        let table = self.b.const_jump_table(Vec::new(), 0);
        self.b.emit(Instr::LookupSwitch(table));
        let base = self.b.depth();

        let mut end_jumps: Vec<JumpLabel> = Vec::new();
        let mut entries: Vec<(LitKey, u32)> = Vec::new();
        let mut default_target: Option<u32> = None;
        for case in cases {
            let body_ip = self.b.ip();
            if case.is_default {
                default_target = Some(body_ip);
            } else {
                for alt in &case.patterns {
                    let PatternKind::Literal(lit) = &alt.pattern.kind else {
                        return Err(CompileError::new(
                            "internal: non-literal case in table switch",
                            alt.pattern.range,
                        ));
                    };
                    if let Some(key) = LitKey::of_value(&lit.to_value()) {
                        entries.push((key, body_ip));
                    }
                }
            }
            self.b.set_depth(base);
            self.compile_expr(&case.result)?;
            end_jumps.push(self.b.emit_jump(Instr::Jump(0)));
        }

        // no key and no default: null
        let no_match = self.b.ip();
        self.b.set_depth(base);
        self.b.emit(Instr::Null);
        for jump in end_jumps {
            self.b.patch_jump(jump);
        }
        self.b.set_depth(base + 1);
        self.b.patch_jump_table(table, entries, default_target.unwrap_or(no_match));
        Ok(())
    }

    /// Emits the decision sequence for one pattern over the value in
    /// `src_slot`. On failure, jumps collected in `fail` are taken with the
    /// stack at its pre-pattern depth; on fallthrough the pattern matched
    /// and all its bindings are stored.
    fn compile_pattern(
        &mut self,
        pattern: &Pattern,
        src_slot: u16,
        depth: usize,
        fail: &mut Vec<JumpLabel>,
        seen: &mut AHashSet<u16>,
    ) -> CompileResult<()> {
        match &pattern.kind {
            PatternKind::Wildcard | PatternKind::Rest => {}

            PatternKind::Literal(lit) => {
                self.load_slot(src_slot);
                self.emit_literal(lit);
                self.b.emit(Instr::CmpEq);
                fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));
            }

            PatternKind::Binding(ident) => {
                let slot = binding_slot(ident, pattern.range)?;
                if seen.contains(&slot) {
                    // repeated name: equality against the captured value
                    self.load_slot(src_slot);
                    self.load_slot(slot);
                    self.b.emit(Instr::CmpEq);
                    fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));
                } else {
                    self.load_slot(src_slot);
                    self.store_slot(slot);
                    seen.insert(slot);
                }
            }

            PatternKind::Type { ty, binding } => {
                self.load_slot(src_slot);
                self.emit_type_test(ty);
                fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));
                if let Some(ident) = binding {
                    let slot = binding_slot(ident, pattern.range)?;
                    if seen.contains(&slot) {
                        self.load_slot(src_slot);
                        self.load_slot(slot);
                        self.b.emit(Instr::CmpEq);
                        fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));
                    } else {
                        self.load_slot(src_slot);
                        self.store_slot(slot);
                        seen.insert(slot);
                    }
                }
            }

            PatternKind::List(items) => {
                self.load_slot(src_slot);
                let list_ty = self.b.const_type(Type::List);
                self.b.emit(Instr::TypeTest(list_ty));
                fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));

                let rest_pos = items.iter().position(|p| matches!(p.kind, PatternKind::Rest));
                let fixed = items.len() - usize::from(rest_pos.is_some());
                self.load_slot(src_slot);
                self.b.emit(Instr::Size);
                let count = self.b.const_value(Value::Int(fixed as i32));
                self.b.emit(Instr::Const(count));
                self.b.emit(if rest_pos.is_some() { Instr::CmpGe } else { Instr::CmpEq });
                fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));

                for (i, item) in items.iter().enumerate() {
                    if matches!(item.kind, PatternKind::Wildcard | PatternKind::Rest) {
                        continue;
                    }
                    let index: i16 = match rest_pos {
                        Some(rest) if i > rest => {
                            // anchored from the end of the list
                            -((items.len() - i) as i16)
                        }
                        _ => i as i16,
                    };
                    let scratch = self.scratch_slot(depth);
                    self.load_slot(src_slot);
                    self.b.emit(Instr::ListGet(index));
                    self.store_slot(scratch);
                    self.compile_pattern(item, scratch, depth + 1, fail, seen)?;
                }
            }

            PatternKind::Map { entries, open } => {
                self.load_slot(src_slot);
                let map_ty = self.b.const_type(Type::Map);
                self.b.emit(Instr::TypeTest(map_ty));
                fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));

                if !open {
                    self.load_slot(src_slot);
                    self.b.emit(Instr::Size);
                    let count = self.b.const_value(Value::Int(entries.len() as i32));
                    self.b.emit(Instr::Const(count));
                    self.b.emit(Instr::CmpEq);
                    fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));
                }

                for (key, value) in entries {
                    let key_id = self.b.const_str(key);
                    self.load_slot(src_slot);
                    self.b.emit(Instr::MapHas(key_id));
                    fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));
                    if matches!(value.kind, PatternKind::Wildcard) {
                        continue;
                    }
                    let scratch = self.scratch_slot(depth);
                    self.load_slot(src_slot);
                    self.b.emit(Instr::MapGet(key_id));
                    self.store_slot(scratch);
                    self.compile_pattern(value, scratch, depth + 1, fail, seen)?;
                }
            }

            PatternKind::Regex { pattern: text, case_insensitive } => {
                self.load_slot(src_slot);
                let str_ty = self.b.const_type(Type::Str);
                self.b.emit(Instr::TypeTest(str_ty));
                fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));
                let regex = self.checked_regex(text, *case_insensitive, pattern.range)?;
                self.load_slot(src_slot);
                self.b.emit(Instr::RegexFind(regex));
                fail.push(self.b.emit_jump(Instr::JumpIfFalse(0)));
            }
        }
        Ok(())
    }

    fn emit_literal(&mut self, lit: &Literal) {
        if matches!(lit, Literal::Null) {
            self.b.emit(Instr::Null);
        } else {
            let id = self.b.const_value(lit.to_value());
            self.b.emit(Instr::Const(id));
        }
    }

    fn emit_type_test(&mut self, ty: &Type) {
        let id = self.b.const_type(ty.clone());
        if matches!(ty, Type::Instance(_)) {
            self.b.emit(Instr::InstanceCheck { ty: id, negated: false });
        } else {
            self.b.emit(Instr::TypeTest(id));
        }
    }
}

fn binding_slot(ident: &crate::ast::Ident, range: CodeRange) -> CompileResult<u16> {
    match ident.target {
        VarTarget::Local { slot } => Ok(slot),
        _ => Err(CompileError::new(
            format!("internal: unresolved binding '{}'", ident.name),
            range,
        )),
    }
}
