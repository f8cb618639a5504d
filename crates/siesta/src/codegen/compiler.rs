//! The compiler: annotated tree to stack-machine code.
//!
//! Compilation runs in two phases. The first walks the resolved tree and
//! assigns every function (main, named functions, closures, class methods)
//! a slot in its owning unit: the script program, or the class that
//! declares it. The second emits code per function. Suspension locations
//! are allocated densely in emission order, which is source order, so a
//! continuation's `method_location` indexes the function's resume table
//! directly.

use std::rc::Rc;

use ahash::AHashMap;

use super::{
    code::CodeBuilder,
    instr::{Instr, ReplPart, NO_SUSPEND},
    program::{ClassUnit, CompiledFunction, CompiledProgram, FieldInfo},
};
use crate::{
    ast::{
        Arg, BinOp, CallTarget, ClassDeclNode, Expr, ExprKind, FieldKey, FunctionDecl, Literal,
        SlotKind, StringPart, UnOp, VarTarget,
    },
    context::Context,
    error::{CodeRange, CompileError},
    resolve::{literal_value, ResolvedScript},
    types::Type,
    value::Value,
};

type CompileResult<T> = Result<T, CompileError>;

/// Where a function's compiled code lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnitKind {
    Program,
    Class(Rc<str>),
}

/// Phase-one facts about a function, keyed by its resolver-assigned global
/// id.
#[derive(Debug, Clone)]
struct FnMeta {
    unit: UnitKind,
    local_index: u32,
    has_captures: bool,
}

/// Compiles a fully resolved and analysed script.
pub fn compile(
    resolved: &ResolvedScript,
    context: &Context,
    script_name: &str,
    source: &str,
) -> CompileResult<CompiledProgram> {
    let mut meta: AHashMap<u32, FnMeta> = AHashMap::new();
    let mut program_fns: Vec<&FunctionDecl> = Vec::new();
    collect_functions(&resolved.main, UnitKind::Program, &mut program_fns, &mut meta);
    let mut class_fns: Vec<(Rc<str>, Vec<&FunctionDecl>)> = Vec::new();
    for class in &resolved.classes {
        let mut fns = Vec::new();
        let unit = UnitKind::Class(class.name.clone());
        for method in &class.methods {
            collect_functions(method, unit.clone(), &mut fns, &mut meta);
        }
        class_fns.push((class.name.clone(), fns));
    }

    let mut functions = Vec::with_capacity(program_fns.len());
    for func in &program_fns {
        functions.push(compile_function(func, context, &meta)?);
    }

    let mut classes = Vec::new();
    for (class_decl, (_, fns)) in resolved.classes.iter().zip(&class_fns) {
        classes.push(Rc::new(compile_class(class_decl, fns, context, &meta)?));
    }

    Ok(CompiledProgram {
        script_name: script_name.into(),
        source: source.into(),
        functions,
        classes,
    })
}

/// Registers `func` and every function nested inside it with the unit.
fn collect_functions<'a>(
    func: &'a FunctionDecl,
    unit: UnitKind,
    out: &mut Vec<&'a FunctionDecl>,
    meta: &mut AHashMap<u32, FnMeta>,
) {
    let local_index = out.len() as u32;
    out.push(func);
    meta.insert(
        func.id,
        FnMeta {
            unit: unit.clone(),
            local_index,
            has_captures: !func.captures.is_empty(),
        },
    );
    collect_nested(&func.body, unit, out, meta);
}

fn collect_nested<'a>(
    expr: &'a Expr,
    unit: UnitKind,
    out: &mut Vec<&'a FunctionDecl>,
    meta: &mut AHashMap<u32, FnMeta>,
) {
    crate::decorate::walk_exprs(expr, &mut |e| {
        if let ExprKind::Closure { func } | ExprKind::FunDecl { func } = &e.kind {
            // walk_exprs already descends into the body; register here
            let local_index = out.len() as u32;
            out.push(func);
            meta.insert(
                func.id,
                FnMeta {
                    unit: unit.clone(),
                    local_index,
                    has_captures: !func.captures.is_empty(),
                },
            );
        }
    });
}

fn compile_class(
    class: &ClassDeclNode,
    fns: &[&FunctionDecl],
    context: &Context,
    meta: &AHashMap<u32, FnMeta>,
) -> CompileResult<ClassUnit> {
    let mut methods = Vec::with_capacity(fns.len());
    for func in fns {
        methods.push(compile_function(func, context, meta)?);
    }
    let mut method_index = AHashMap::new();
    // only declared methods are dispatchable; nested closures follow them
    // in the unit but have no name entry
    for method in &class.methods {
        let idx = fns
            .iter()
            .position(|f| f.id == method.id)
            .expect("method registered in phase one") as u32;
        method_index.insert(method.name.clone(), idx);
    }
    Ok(ClassUnit {
        name: class.name.clone(),
        superclass: class.superclass.clone(),
        fields: class
            .fields
            .iter()
            .map(|f| FieldInfo {
                name: f.name.clone(),
                ty: f.ty.clone(),
                default: f.init.as_ref().and_then(literal_value),
            })
            .collect(),
        methods,
        method_index,
    })
}

fn compile_function(
    func: &FunctionDecl,
    context: &Context,
    meta: &AHashMap<u32, FnMeta>,
) -> CompileResult<CompiledFunction> {
    let mut slot_kinds = func.slot_kinds.clone();
    let mut compiler = FnCompiler {
        b: CodeBuilder::new(),
        func,
        context,
        meta,
        slot_kinds: &mut slot_kinds,
        scratch: Vec::new(),
    };
    compiler.compile_expr(&func.body)?;
    compiler.b.emit(Instr::Return);
    let code = compiler.b.build();

    let param_count = func.params.len() as u16 + u16::from(func.implicit_it);
    let defaults: Vec<Value> = func
        .params
        .iter()
        .skip_while(|p| p.default.is_none())
        .map(|p| {
            p.default
                .as_ref()
                .and_then(literal_value)
                .unwrap_or(Value::Null)
        })
        .collect();
    Ok(CompiledFunction {
        name: func.name.clone(),
        param_count,
        defaults,
        slot_kinds,
        captures: func.captures.clone(),
        match_slot: func.match_slot,
        is_async: func.is_async,
        code,
    })
}

/// Per-function emitter. The pattern-match lowering lives in
/// `patterns.rs` as further methods on this type.
pub(crate) struct FnCompiler<'a> {
    pub(crate) b: CodeBuilder,
    pub(crate) func: &'a FunctionDecl,
    pub(crate) context: &'a Context,
    meta: &'a AHashMap<u32, FnMeta>,
    /// Final storage layout; pattern scratch slots are appended here.
    pub(crate) slot_kinds: &'a mut Vec<SlotKind>,
    /// Reusable hidden slots for destructuring, one per nesting depth.
    pub(crate) scratch: Vec<u16>,
}

impl FnCompiler<'_> {
    fn error(&self, message: impl Into<String>, range: CodeRange) -> CompileError {
        CompileError::new(message, range)
    }

    /// A hidden object slot for destructure depth `depth`, allocated on
    /// first use and reused across patterns.
    pub(crate) fn scratch_slot(&mut self, depth: usize) -> u16 {
        while self.scratch.len() <= depth {
            let slot = self.slot_kinds.len() as u16;
            self.slot_kinds.push(SlotKind::Obj);
            self.scratch.push(slot);
        }
        self.scratch[depth]
    }

    /// Loads a slot, dereferencing through the cell when the slot is
    /// boxed.
    pub(crate) fn load_slot(&mut self, slot: u16) {
        if self.slot_kinds[slot as usize] == SlotKind::Cell {
            self.b.emit(Instr::LoadCell(slot));
        } else {
            self.b.emit(Instr::LoadLocal(slot));
        }
    }

    /// Stores through the cell when the slot is boxed.
    pub(crate) fn store_slot(&mut self, slot: u16) {
        if self.slot_kinds[slot as usize] == SlotKind::Cell {
            self.b.emit(Instr::StoreCell(slot));
        } else {
            self.b.emit(Instr::StoreLocal(slot));
        }
    }

    /// Suspension location for a call that pops `popped` operands, or
    /// `NO_SUSPEND` when the site cannot suspend.
    fn suspend_loc(&mut self, suspends: bool, popped: u16) -> u32 {
        if suspends && self.func.is_async {
            self.b.add_resume_point(popped)
        } else {
            NO_SUSPEND
        }
    }

    /// Emits `expr`, leaving exactly one value on the stack.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        self.b.set_location(expr.range);
        match &expr.kind {
            ExprKind::Literal(lit) => {
                let id = self.b.const_value(lit.to_value());
                self.b.emit(Instr::Const(id));
            }
            ExprKind::Noop | ExprKind::ClassDecl { .. } => {
                self.b.emit(Instr::Null);
            }
            ExprKind::TypeExpr(_) | ExprKind::ClassPath { .. } => {
                // type references have no runtime value of their own
                self.b.emit(Instr::Null);
            }

            ExprKind::ListLiteral(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.b.emit(Instr::NewList(items.len() as u16));
            }
            ExprKind::MapLiteral(entries) => {
                for entry in entries {
                    let key = self.b.const_str(&entry.key);
                    self.b.emit(Instr::Const(key));
                    self.compile_expr(&entry.value)?;
                }
                self.b.emit(Instr::NewMap(entries.len() as u16));
            }
            ExprKind::ExprString(parts) => {
                for part in parts {
                    match part {
                        StringPart::Text(text) => {
                            let id = self.b.const_str(text);
                            self.b.emit(Instr::Const(id));
                        }
                        StringPart::Interp(inner) => self.compile_expr(inner)?,
                    }
                }
                self.b.emit(Instr::BuildString(parts.len() as u16));
            }

            ExprKind::Identifier(ident) | ExprKind::ItVar(ident) => match &ident.target {
                VarTarget::Local { slot } => self.load_slot(*slot),
                VarTarget::Capture { index } => {
                    self.b.emit(Instr::LoadCapture(*index));
                }
                VarTarget::Global => {
                    let id = self.b.const_str(&ident.name);
                    self.b.emit(Instr::LoadGlobal(id));
                }
                VarTarget::Unresolved => {
                    return Err(self.error(
                        format!("internal: unresolved identifier '{}'", ident.name),
                        expr.range,
                    ));
                }
            },
            ExprKind::CaptureVar(n) => {
                self.b.emit(Instr::LoadCaptureVar(*n));
            }

            ExprKind::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs)?,
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                self.b.emit(match op {
                    UnOp::Neg => Instr::Neg,
                    UnOp::Not => Instr::Not,
                });
            }
            ExprKind::Ternary { cond, then_expr, else_expr } => {
                self.compile_expr(cond)?;
                let to_else = self.b.emit_jump(Instr::JumpIfFalse(0));
                let base = self.b.depth();
                self.compile_expr(then_expr)?;
                let to_end = self.b.emit_jump(Instr::Jump(0));
                self.b.patch_jump(to_else);
                self.b.set_depth(base);
                self.compile_expr(else_expr)?;
                self.b.patch_jump(to_end);
            }

            ExprKind::Cast { target, expr: inner } => {
                self.compile_expr(inner)?;
                let ty = self.b.const_type(target.clone());
                self.b.emit(Instr::Cast(ty));
            }
            ExprKind::CheckCast { target, expr: inner } => {
                self.compile_expr(inner)?;
                let ty = self.b.const_type(target.clone());
                self.b.emit(Instr::CheckCast(ty));
            }
            ExprKind::InstanceOf { expr: inner, target, negated } => {
                self.compile_expr(inner)?;
                let ty = self.b.const_type(target.clone());
                self.b.emit(Instr::InstanceCheck { ty, negated: *negated });
            }

            ExprKind::Field { receiver, name, safe } => {
                self.compile_expr(receiver)?;
                let name = self.b.const_str(name);
                if *safe {
                    let skip = self.b.emit_jump(Instr::JumpIfNull(0));
                    self.b.emit(Instr::GetField { name, safe: true });
                    self.b.patch_jump(skip);
                } else {
                    self.b.emit(Instr::GetField { name, safe: false });
                }
            }
            ExprKind::ArrayGet { receiver, index } => {
                self.compile_expr(receiver)?;
                self.compile_expr(index)?;
                self.b.emit(Instr::GetIndex);
            }
            ExprKind::ArrayLength { receiver } => {
                self.compile_expr(receiver)?;
                self.b.emit(Instr::Size);
            }

            ExprKind::Call { function, args, target, suspends } => {
                self.compile_call(expr.range, function, args, target, *suspends)?;
            }
            ExprKind::MethodCall { receiver, name, args, safe } => {
                self.compile_expr(receiver)?;
                // built-in size() lowers to the length primitive
                if &**name == "size" && args.is_empty() && !*safe {
                    self.b.emit(Instr::Size);
                } else {
                    let skip = if *safe {
                        Some(self.b.emit_jump(Instr::JumpIfNull(0)))
                    } else {
                        None
                    };
                    for arg in args {
                        self.compile_expr(&arg.expr)?;
                    }
                    let name = self.b.const_str(name);
                    let loc = self.suspend_loc(true, args.len() as u16 + 1);
                    self.b.emit(Instr::CallMethod {
                        name,
                        argc: args.len() as u8,
                        safe: *safe,
                        loc,
                    });
                    if let Some(skip) = skip {
                        self.b.patch_jump(skip);
                    }
                }
            }
            ExprKind::InvokeNew { .. } => {
                return Err(self.error("internal: unresolved constructor call", expr.range));
            }
            ExprKind::InvokeInit { class, args } => {
                for arg in args {
                    self.compile_expr(&arg.expr)?;
                }
                let class = self.b.const_str(class);
                self.b.emit(Instr::NewInstance { class, argc: args.len() as u8 });
            }

            ExprKind::VarDecl { declared_ty, init, target, .. } => {
                match init {
                    Some(init) => {
                        self.compile_expr(init)?;
                        if needs_conversion(declared_ty, &init.ty) {
                            let ty = self.b.const_type(declared_ty.clone());
                            self.b.emit(Instr::Cast(ty));
                        }
                    }
                    None => self.emit_default(declared_ty),
                }
                self.b.emit(Instr::Dup);
                self.store_target(target, expr)?;
            }
            ExprKind::VarAssign { ident, value } => {
                self.compile_expr(value)?;
                // a primitive slot must hold exactly its declared width
                if let VarTarget::Local { slot } = ident.target {
                    if let Some(ty) = prim_slot_type(self.slot_kinds[slot as usize]) {
                        if value.ty != ty {
                            let ty = self.b.const_type(ty);
                            self.b.emit(Instr::Cast(ty));
                        }
                    }
                }
                self.b.emit(Instr::Dup);
                self.store_target(&ident.target, expr)?;
            }
            ExprKind::FieldAssign { receiver, field, value } => {
                self.compile_expr(receiver)?;
                match field {
                    FieldKey::Name(name) => {
                        self.compile_expr(value)?;
                        let name = self.b.const_str(name);
                        self.b.emit(Instr::SetField { name });
                    }
                    FieldKey::Index(index) => {
                        self.compile_expr(index)?;
                        self.compile_expr(value)?;
                        self.b.emit(Instr::SetIndex);
                    }
                }
            }

            ExprKind::Block(block) => {
                if block.stmts.is_empty() {
                    self.b.emit(Instr::Null);
                } else {
                    let last = block.stmts.len() - 1;
                    for (i, stmt) in block.stmts.iter().enumerate() {
                        self.compile_expr(stmt)?;
                        if i != last {
                            self.b.emit(Instr::Pop);
                        }
                    }
                }
            }
            ExprKind::If { cond, then_branch, else_branch } => {
                self.compile_expr(cond)?;
                let to_else = self.b.emit_jump(Instr::JumpIfFalse(0));
                let base = self.b.depth();
                self.compile_expr(then_branch)?;
                let to_end = self.b.emit_jump(Instr::Jump(0));
                self.b.patch_jump(to_else);
                self.b.set_depth(base);
                match else_branch {
                    Some(else_branch) => self.compile_expr(else_branch)?,
                    None => {
                        self.b.emit(Instr::Null);
                    }
                }
                self.b.patch_jump(to_end);
            }
            ExprKind::While { cond, body } => {
                let start = self.b.ip();
                self.compile_expr(cond)?;
                let to_end = self.b.emit_jump(Instr::JumpIfFalse(0));
                self.compile_expr(body)?;
                self.b.emit(Instr::Pop);
                self.b.emit(Instr::Jump(start));
                self.b.patch_jump(to_end);
                self.b.emit(Instr::Null);
            }
            ExprKind::Return { value } => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => {
                        self.b.emit(Instr::Null);
                    }
                }
                self.b.emit(Instr::Return);
                // dead push keeps the expression stack shape uniform
                self.b.emit(Instr::Null);
            }

            ExprKind::Closure { func } => {
                self.emit_closure(func, expr.range)?;
            }
            ExprKind::FunDecl { func } => {
                self.emit_closure(func, expr.range)?;
                let slot = func
                    .decl_slot
                    .ok_or_else(|| self.error("internal: function without a slot", expr.range))?;
                self.b.emit(Instr::Dup);
                self.store_slot(slot);
            }

            ExprKind::Switch { subject, cases, subject_slot, strategy } => {
                let subject = subject
                    .as_ref()
                    .ok_or_else(|| self.error("internal: switch without subject", expr.range))?;
                self.compile_switch(subject, cases, *subject_slot, *strategy)?;
            }

            ExprKind::RegexMatch { target, pattern, case_insensitive, negated } => {
                let target = target
                    .as_ref()
                    .ok_or_else(|| self.error("internal: unresolved regex target", expr.range))?;
                self.compile_expr(target)?;
                if let Some(text) = const_pattern(pattern) {
                    let regex = self.checked_regex(&text, *case_insensitive, expr.range)?;
                    self.b.emit(Instr::RegexFind(regex));
                } else {
                    self.compile_string_parts(pattern)?;
                    self.b.emit(Instr::RegexMatchDyn { case_insensitive: *case_insensitive });
                }
                if *negated {
                    self.b.emit(Instr::Not);
                }
            }
            ExprKind::RegexSubst { target, pattern, replacement, case_insensitive, global } => {
                self.compile_expr(target)?;
                let Some(text) = const_pattern(pattern) else {
                    return Err(self.error(
                        "substitution pattern must not contain interpolation",
                        expr.range,
                    ));
                };
                let regex = self.checked_regex(&text, *case_insensitive, expr.range)?;
                let template = self.replacement_template(replacement, expr.range)?;
                let replacement = self.b.const_replacement(template);
                self.b.emit(Instr::RegexSubst { regex, replacement, global: *global });
            }

            ExprKind::Print { value, newline } => {
                self.compile_expr(value)?;
                self.b.emit(Instr::Print { newline: *newline });
                self.b.emit(Instr::Null);
            }
            ExprKind::Die { value } => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => {
                        self.b.emit(Instr::Null);
                    }
                }
                self.b.emit(Instr::DieInstr);
                self.b.emit(Instr::Null);
            }
            ExprKind::Eval { source } => {
                self.compile_expr(source)?;
                let loc = self.suspend_loc(true, 1);
                self.b.emit(Instr::EvalInstr { loc });
            }
        }
        Ok(())
    }

    fn store_target(&mut self, target: &VarTarget, expr: &Expr) -> CompileResult<()> {
        match target {
            VarTarget::Local { slot } => self.store_slot(*slot),
            VarTarget::Capture { index } => {
                self.b.emit(Instr::StoreCapture(*index));
            }
            VarTarget::Global => {
                let name = match &expr.kind {
                    ExprKind::VarDecl { name, .. } => name.clone(),
                    ExprKind::VarAssign { ident, .. } => ident.name.clone(),
                    _ => return Err(self.error("internal: bad store target", expr.range)),
                };
                let id = self.b.const_str(&name);
                self.b.emit(Instr::StoreGlobal(id));
            }
            VarTarget::Unresolved => {
                return Err(self.error("internal: unresolved store target", expr.range));
            }
        }
        Ok(())
    }

    fn emit_default(&mut self, ty: &Type) {
        match ty {
            Type::Int => {
                let id = self.b.const_value(Value::Int(0));
                self.b.emit(Instr::Const(id));
            }
            Type::Long => {
                let id = self.b.const_value(Value::Long(0));
                self.b.emit(Instr::Const(id));
            }
            Type::Double => {
                let id = self.b.const_value(Value::Double(0.0));
                self.b.emit(Instr::Const(id));
            }
            Type::Bool => {
                let id = self.b.const_value(Value::Bool(false));
                self.b.emit(Instr::Const(id));
            }
            _ => {
                self.b.emit(Instr::Null);
            }
        }
    }

    fn emit_closure(&mut self, func: &FunctionDecl, range: CodeRange) -> CompileResult<()> {
        let meta = self
            .meta
            .get(&func.id)
            .ok_or_else(|| self.error("internal: unregistered function", range))?;
        self.b.emit(Instr::MakeClosure { func: meta.local_index });
        Ok(())
    }

    fn compile_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> CompileResult<()> {
        match op {
            BinOp::And => {
                self.compile_expr(lhs)?;
                let to_false = self.b.emit_jump(Instr::JumpIfFalse(0));
                let base = self.b.depth();
                self.compile_expr(rhs)?;
                let to_false2 = self.b.emit_jump(Instr::JumpIfFalse(0));
                let t = self.b.const_value(Value::Bool(true));
                self.b.emit(Instr::Const(t));
                let to_end = self.b.emit_jump(Instr::Jump(0));
                self.b.patch_jump(to_false);
                self.b.patch_jump(to_false2);
                self.b.set_depth(base);
                let f = self.b.const_value(Value::Bool(false));
                self.b.emit(Instr::Const(f));
                self.b.patch_jump(to_end);
                Ok(())
            }
            BinOp::Or => {
                self.compile_expr(lhs)?;
                let to_true = self.b.emit_jump(Instr::JumpIfTrue(0));
                let base = self.b.depth();
                self.compile_expr(rhs)?;
                let to_true2 = self.b.emit_jump(Instr::JumpIfTrue(0));
                let f = self.b.const_value(Value::Bool(false));
                self.b.emit(Instr::Const(f));
                let to_end = self.b.emit_jump(Instr::Jump(0));
                self.b.patch_jump(to_true);
                self.b.patch_jump(to_true2);
                self.b.set_depth(base);
                let t = self.b.const_value(Value::Bool(true));
                self.b.emit(Instr::Const(t));
                self.b.patch_jump(to_end);
                Ok(())
            }
            BinOp::Elvis => {
                self.compile_expr(lhs)?;
                self.b.emit(Instr::Dup);
                let to_end = self.b.emit_jump(Instr::JumpIfTrue(0));
                self.b.emit(Instr::Pop);
                self.compile_expr(rhs)?;
                self.b.patch_jump(to_end);
                Ok(())
            }
            _ => {
                self.compile_expr(lhs)?;
                self.compile_expr(rhs)?;
                self.b.emit(match op {
                    BinOp::Add => Instr::Add,
                    BinOp::Sub => Instr::Sub,
                    BinOp::Mul => Instr::Mul,
                    BinOp::Div => Instr::Div,
                    BinOp::Rem => Instr::Rem,
                    BinOp::Eq => Instr::CmpEq,
                    BinOp::Ne => Instr::CmpNe,
                    BinOp::Lt => Instr::CmpLt,
                    BinOp::LtEq => Instr::CmpLe,
                    BinOp::Gt => Instr::CmpGt,
                    BinOp::GtEq => Instr::CmpGe,
                    BinOp::And | BinOp::Or | BinOp::Elvis => unreachable!("handled above"),
                });
                Ok(())
            }
        }
    }

    fn compile_call(
        &mut self,
        range: CodeRange,
        function: &Expr,
        args: &[Arg],
        target: &CallTarget,
        suspends: bool,
    ) -> CompileResult<()> {
        match target {
            CallTarget::Script(id) => {
                let callee = self
                    .meta
                    .get(id)
                    .ok_or_else(|| self.error("internal: unknown call target", range))?
                    .clone();
                if callee.has_captures {
                    // call through the closure value so captured cells are
                    // bound
                    self.compile_expr(function)?;
                    for arg in args {
                        self.compile_expr(&arg.expr)?;
                    }
                    let loc = self.suspend_loc(suspends, args.len() as u16 + 1);
                    self.b.emit(Instr::CallValue { argc: args.len() as u8, loc });
                } else {
                    for arg in args {
                        self.compile_expr(&arg.expr)?;
                    }
                    let loc = self.suspend_loc(suspends, args.len() as u16);
                    self.b.emit(Instr::CallScript {
                        func: callee.local_index,
                        argc: args.len() as u8,
                        loc,
                    });
                }
            }
            CallTarget::Native(id) => {
                // the registration must still be present between resolve
                // and code generation
                self.context
                    .native(*id)
                    .map_err(|_| self.error("function has been deregistered", range))?;
                for arg in args {
                    self.compile_expr(&arg.expr)?;
                }
                let loc = self.suspend_loc(suspends, args.len() as u16);
                self.b.emit(Instr::CallNative { native: *id, argc: args.len() as u8, loc });
            }
            CallTarget::Dynamic => {
                self.compile_expr(function)?;
                for arg in args {
                    self.compile_expr(&arg.expr)?;
                }
                let loc = self.suspend_loc(suspends, args.len() as u16 + 1);
                self.b.emit(Instr::CallValue { argc: args.len() as u8, loc });
            }
            CallTarget::Unresolved => {
                return Err(self.error("internal: unresolved call", range));
            }
        }
        Ok(())
    }

    pub(crate) fn compile_string_parts(&mut self, parts: &[StringPart]) -> CompileResult<()> {
        for part in parts {
            match part {
                StringPart::Text(text) => {
                    let id = self.b.const_str(text);
                    self.b.emit(Instr::Const(id));
                }
                StringPart::Interp(inner) => self.compile_expr(inner)?,
            }
        }
        self.b.emit(Instr::BuildString(parts.len() as u16));
        Ok(())
    }

    /// Validates a regex at compile time and interns it.
    pub(crate) fn checked_regex(
        &mut self,
        pattern: &str,
        case_insensitive: bool,
        range: CodeRange,
    ) -> CompileResult<u16> {
        regex::RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| self.error(format!("invalid regex: {e}"), range))?;
        Ok(self.b.const_regex(pattern, case_insensitive))
    }

    fn replacement_template(
        &mut self,
        parts: &[StringPart],
        range: CodeRange,
    ) -> CompileResult<Vec<ReplPart>> {
        parts
            .iter()
            .map(|part| match part {
                StringPart::Text(text) => Ok(ReplPart::Text(text.clone())),
                StringPart::Interp(inner) => match &inner.kind {
                    ExprKind::CaptureVar(n) => Ok(ReplPart::Capture(*n)),
                    ExprKind::Literal(Literal::Str(s)) => Ok(ReplPart::Text(s.clone())),
                    _ => Err(self.error(
                        "substitution replacement may only interpolate capture variables",
                        range,
                    )),
                },
            })
            .collect()
    }
}

/// The exact type a primitive slot stores, if the slot is primitive.
fn prim_slot_type(kind: SlotKind) -> Option<Type> {
    match kind {
        SlotKind::PrimBool => Some(Type::Bool),
        SlotKind::PrimInt => Some(Type::Int),
        SlotKind::PrimLong => Some(Type::Long),
        SlotKind::PrimDouble => Some(Type::Double),
        SlotKind::Obj | SlotKind::Cell => None,
    }
}

/// Whether a store into a `declared`-typed slot needs a converting cast.
fn needs_conversion(declared: &Type, value: &Type) -> bool {
    if matches!(declared, Type::Def) || declared == value {
        return false;
    }
    declared.is_primitive() || matches!(declared, Type::Decimal | Type::Str)
}

/// The constant text of an uninterpolated pattern, if it has no holes.
fn const_pattern(parts: &[StringPart]) -> Option<String> {
    let mut text = String::new();
    for part in parts {
        match part {
            StringPart::Text(t) => text.push_str(t),
            StringPart::Interp(_) => return None,
        }
    }
    Some(text)
}
