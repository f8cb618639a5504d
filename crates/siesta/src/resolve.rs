//! The resolver: binds names, assigns static types, lays out frames.
//!
//! Walks the parsed tree once, mutating it in place. Declarations go into
//! per-scope declaration vectors; identifier nodes record (slot / capture
//! index / global) targets rather than back-pointers. Function declarations
//! are hoisted per block so forward calls resolve. Locals referenced from
//! nested closures are promoted to cell slots, and the capture chain is
//! threaded through every intermediate function.
//!
//! Asyncness is only seeded here (calls to unconditionally-async natives,
//! dynamic calls, `eval`); the transitive closure over the script call
//! graph runs in the analyser.

use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

use crate::{
    ast::{
        Arg, BinOp, Block, CaptureSource, ClassDeclNode, Expr, ExprKind, FieldKey, FunctionDecl,
        Ident, Literal, MapEntry, Param, ParsedScript, Pattern, PatternKind, SlotKind, StringPart,
        SwitchCase, UnOp, VarTarget,
    },
    context::Context,
    error::{CodeRange, CompileError},
    types::Type,
    value::Value,
};

type ResolveResult<T> = Result<T, CompileError>;

/// Signature facts for a script-declared function, available before its
/// body is resolved (hoisting).
#[derive(Debug, Clone)]
pub struct FuncSig {
    pub name: Rc<str>,
    pub params: Vec<(Rc<str>, Type)>,
    pub mandatory: usize,
    pub return_ty: Type,
}

/// Class facts collected before bodies are resolved.
#[derive(Debug, Clone)]
struct ClassMeta {
    full_name: Rc<str>,
    superclass: Option<Rc<str>>,
    /// Field name, type, whether it has an initialiser.
    fields: Vec<(Rc<str>, Type, bool)>,
    methods: Vec<Rc<str>>,
}

/// The resolved compilation unit handed to the analyser and compiler.
#[derive(Debug)]
pub struct ResolvedScript {
    pub main: FunctionDecl,
    /// Classes hoisted out of the statement stream, methods resolved.
    pub classes: Vec<ClassDeclNode>,
    /// Total number of program functions (main, named, closures).
    pub func_count: u32,
    /// Signatures by function id, for diagnostics and the analyser.
    pub signatures: Vec<FuncSig>,
}

/// Resolves a parsed script against a context and the host's global
/// binding names.
pub fn resolve(
    script: ParsedScript,
    context: &Context,
    global_names: &[Rc<str>],
) -> ResolveResult<ResolvedScript> {
    let mut resolver = Resolver::new(context, global_names);
    resolver.run(script)
}

#[derive(Debug)]
struct LocalInfo {
    ty: Type,
    captured: bool,
}

#[derive(Debug)]
struct FuncScope {
    locals: Vec<LocalInfo>,
    /// Declaration vectors, one per open block: (name, slot).
    blocks: Vec<Vec<(Rc<str>, u16)>>,
    captures: Vec<(Rc<str>, CaptureSource)>,
    /// Stack of `it` slots; the top is what `it` means here.
    it_slots: Vec<u16>,
    /// Set when resolving a class method body: the class full name.
    method_of: Option<Rc<str>>,
    uses_regex: bool,
}

impl FuncScope {
    fn new() -> Self {
        Self {
            locals: Vec::new(),
            blocks: vec![Vec::new()],
            captures: Vec::new(),
            it_slots: Vec::new(),
            method_of: None,
            uses_regex: false,
        }
    }

    fn declare(&mut self, name: Rc<str>, ty: Type) -> u16 {
        let slot = self.locals.len() as u16;
        self.locals.push(LocalInfo { ty, captured: false });
        self.blocks.last_mut().expect("a block is open").push((name, slot));
        slot
    }

    fn find(&self, name: &str) -> Option<u16> {
        self.blocks
            .iter()
            .rev()
            .find_map(|block| block.iter().rev().find(|(n, _)| &**n == name).map(|&(_, s)| s))
    }

    fn slot_kinds(&self) -> Vec<SlotKind> {
        self.locals
            .iter()
            .map(|l| {
                if l.captured {
                    SlotKind::Cell
                } else {
                    SlotKind::for_type(&l.ty)
                }
            })
            .collect()
    }
}

enum Found {
    Local(u16),
    Capture(u16),
    Global,
}

struct Resolver<'a> {
    context: &'a Context,
    globals: AHashSet<Rc<str>>,
    imports: AHashMap<Rc<str>, Rc<str>>,
    package: Option<Rc<str>>,
    classes: AHashMap<Rc<str>, ClassMeta>,
    /// Named script functions in scope: name -> func id (per block, flat
    /// with shadowing by later entries; simple because functions hoist per
    /// block and blocks nest strictly).
    func_names: Vec<(Rc<str>, u32)>,
    signatures: Vec<FuncSig>,
    scopes: Vec<FuncScope>,
    next_func_id: u32,
}

impl<'a> Resolver<'a> {
    fn new(context: &'a Context, global_names: &[Rc<str>]) -> Self {
        Self {
            context,
            globals: global_names.iter().cloned().collect(),
            imports: AHashMap::new(),
            package: None,
            classes: AHashMap::new(),
            func_names: Vec::new(),
            signatures: Vec::new(),
            scopes: Vec::new(),
            next_func_id: 0,
        }
    }

    fn run(&mut self, script: ParsedScript) -> ResolveResult<ResolvedScript> {
        self.package = script.package.clone();
        for (simple, full) in &script.imports {
            self.imports.insert(simple.clone(), full.clone());
        }

        let mut body = script.body;

        // hoist classes: collect their shape, pull the declarations out
        let mut class_nodes = Vec::new();
        for stmt in &mut body.stmts {
            if let ExprKind::ClassDecl { .. } = stmt.kind {
                let ExprKind::ClassDecl { class } = std::mem::replace(&mut stmt.kind, ExprKind::Noop)
                else {
                    unreachable!()
                };
                self.collect_class(&class, stmt.range)?;
                class_nodes.push(*class);
            }
        }

        // main is function 0
        let main_id = self.alloc_func_id(FuncSig {
            name: "<script>".into(),
            params: Vec::new(),
            mandatory: 0,
            return_ty: Type::Def,
        });
        debug_assert_eq!(main_id, 0);

        let range = body.range;
        let mut main = FunctionDecl::new(
            "<script>".into(),
            Vec::new(),
            Type::Def,
            Box::new(Expr::new(range, ExprKind::Block(body))),
            false,
        );
        main.id = main_id;
        self.resolve_function(&mut main, None, true)?;

        // class methods resolve with `this` as slot 0 and field fallback
        let mut classes = class_nodes;
        for class in &mut classes {
            let full_name = self.full_class_name(&class.name);
            class.name = full_name.clone();
            if let Some(superclass) = &class.superclass {
                class.superclass = Some(self.resolve_class_name(superclass, range)?);
            }
            for field in &mut class.fields {
                if let Some(init) = &mut field.init {
                    self.check_const_init(init)?;
                }
            }
            for method in &mut class.methods {
                method.params.insert(
                    0,
                    Param {
                        name: "this".into(),
                        ty: Type::Instance(full_name.clone()),
                        default: None,
                    },
                );
                let id = self.alloc_func_id(FuncSig {
                    name: method.name.clone(),
                    params: method.params.iter().map(|p| (p.name.clone(), p.ty.clone())).collect(),
                    mandatory: method.params.iter().filter(|p| p.default.is_none()).count(),
                    return_ty: method.return_ty.clone(),
                });
                method.id = id;
                self.resolve_function_in_class(method, full_name.clone())?;
            }
        }

        Ok(ResolvedScript {
            main,
            classes,
            func_count: self.next_func_id,
            signatures: self.signatures.clone(),
        })
    }

    fn alloc_func_id(&mut self, sig: FuncSig) -> u32 {
        let id = self.next_func_id;
        self.next_func_id += 1;
        self.signatures.push(sig);
        id
    }

    // ---- classes -----------------------------------------------------------

    fn full_class_name(&self, simple: &str) -> Rc<str> {
        match &self.package {
            Some(pkg) => format!("{pkg}.{simple}").into(),
            None => simple.into(),
        }
    }

    fn collect_class(&mut self, class: &ClassDeclNode, range: CodeRange) -> ResolveResult<()> {
        let full_name = self.full_class_name(&class.name);
        if self.classes.contains_key(&class.name) {
            return Err(CompileError::new(
                format!("class '{}' already declared", class.name),
                range,
            ));
        }
        let meta = ClassMeta {
            full_name,
            superclass: class.superclass.clone(),
            fields: class
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.ty.clone(), f.init.is_some()))
                .collect(),
            methods: class.methods.iter().map(|m| m.name.clone()).collect(),
        };
        self.classes.insert(class.name.clone(), meta);
        Ok(())
    }

    /// Resolves the written name of a class to its full name, preferring
    /// script classes, then imports, then the context registry.
    fn resolve_class_name(&self, written: &str, range: CodeRange) -> ResolveResult<Rc<str>> {
        if let Some(meta) = self.classes.get(written) {
            return Ok(meta.full_name.clone());
        }
        if let Some(full) = self.imports.get(written) {
            return Ok(full.clone());
        }
        if self.context.find_class(written).is_some() {
            return Ok(written.into());
        }
        Err(CompileError::new(format!("unknown class '{written}'"), range))
    }

    fn class_exists(&self, written: &str) -> bool {
        self.classes.contains_key(written)
            || self.imports.contains_key(written)
            || self.context.find_class(written).is_some()
    }

    /// Field lookup across the script-class hierarchy and registered
    /// superclasses.
    fn class_has_field(&self, class_full: &str, field: &str) -> bool {
        let mut current = class_full.to_owned();
        loop {
            let meta = self.classes.values().find(|m| &*m.full_name == current.as_str());
            if let Some(meta) = meta {
                if meta.fields.iter().any(|(n, _, _)| &**n == field) {
                    return true;
                }
                match &meta.superclass {
                    Some(s) => {
                        current = match self.classes.get(s.as_ref()) {
                            Some(m) => m.full_name.to_string(),
                            None => s.to_string(),
                        };
                    }
                    None => return false,
                }
            } else if let Some(unit) = self.context.find_class(&current) {
                if unit.fields.iter().any(|f| &*f.name == field) {
                    return true;
                }
                match &unit.superclass {
                    Some(s) => current = s.to_string(),
                    None => return false,
                }
            } else {
                return false;
            }
        }
    }

    fn class_has_method(&self, class_full: &str, method: &str) -> bool {
        let mut current = class_full.to_owned();
        loop {
            let meta = self.classes.values().find(|m| &*m.full_name == current.as_str());
            if let Some(meta) = meta {
                if meta.methods.iter().any(|n| &**n == method) {
                    return true;
                }
                match &meta.superclass {
                    Some(s) => {
                        current = match self.classes.get(s.as_ref()) {
                            Some(m) => m.full_name.to_string(),
                            None => s.to_string(),
                        };
                    }
                    None => return false,
                }
            } else if let Some(unit) = self.context.find_class(&current) {
                if unit.method_index.contains_key(method) {
                    return true;
                }
                match &unit.superclass {
                    Some(s) => current = s.to_string(),
                    None => return false,
                }
            } else {
                return false;
            }
        }
    }

    fn check_const_init(&mut self, init: &mut Expr) -> ResolveResult<()> {
        if literal_value(init).is_none() {
            return Err(CompileError::new(
                "field initialiser must be a constant",
                init.range,
            ));
        }
        Ok(())
    }

    // ---- functions ---------------------------------------------------------

    fn resolve_function_in_class(&mut self, func: &mut FunctionDecl, class: Rc<str>) -> ResolveResult<()> {
        self.resolve_function_inner(func, Some(class), false)
    }

    fn resolve_function(
        &mut self,
        func: &mut FunctionDecl,
        method_of: Option<Rc<str>>,
        is_main: bool,
    ) -> ResolveResult<()> {
        self.resolve_function_inner(func, method_of, is_main)
    }

    fn resolve_function_inner(
        &mut self,
        func: &mut FunctionDecl,
        method_of: Option<Rc<str>>,
        is_main: bool,
    ) -> ResolveResult<()> {
        let mut scope = FuncScope::new();
        scope.method_of = method_of;

        // parameters occupy the first slots, in declaration order
        for param in &mut func.params {
            if let Some(default) = &param.default {
                if literal_value(default).is_none() {
                    return Err(CompileError::new(
                        "parameter default must be a constant",
                        default.range,
                    ));
                }
            }
            scope.declare(param.name.clone(), param.ty.clone());
        }
        // a closure without declared parameters takes implicit `it`
        if func.implicit_it {
            let slot = scope.declare("it".into(), Type::Def);
            scope.it_slots.push(slot);
        }
        self.scopes.push(scope);

        let func_name_mark = self.func_names.len();
        self.resolve_expr(&mut func.body, true, is_main)?;
        self.func_names.truncate(func_name_mark);

        let scope = self.scopes.pop().expect("scope pushed above");
        func.slot_kinds = scope.slot_kinds();
        func.captures = scope.captures.iter().map(|(_, src)| src.clone()).collect();
        if scope.uses_regex {
            // hidden object slot for the latest match's capture groups
            func.match_slot = Some(func.slot_kinds.len() as u16);
            func.slot_kinds.push(SlotKind::Obj);
        }
        Ok(())
    }

    fn scope(&mut self) -> &mut FuncScope {
        self.scopes.last_mut().expect("inside a function")
    }

    // ---- name lookup -------------------------------------------------------

    /// Finds a variable, threading captures through intermediate functions
    /// when it lives in an enclosing frame.
    fn find_var(&mut self, name: &str) -> Option<Found> {
        let depth = self.scopes.len();
        for level in (0..depth).rev() {
            let Some(slot) = self.scopes[level].find(name) else {
                continue;
            };
            if level == depth - 1 {
                return Some(Found::Local(slot));
            }
            // referenced from a nested closure: box the defining slot
            self.scopes[level].locals[slot as usize].captured = true;
            let mut source = CaptureSource::EnclosingLocal(slot);
            let mut index = 0;
            for inner in level + 1..depth {
                index = self.add_capture(inner, name, source);
                source = CaptureSource::EnclosingCapture(index);
            }
            return Some(Found::Capture(index));
        }
        if self.globals.contains(name) {
            return Some(Found::Global);
        }
        None
    }

    fn add_capture(&mut self, scope_idx: usize, name: &str, source: CaptureSource) -> u16 {
        let captures = &mut self.scopes[scope_idx].captures;
        if let Some(pos) = captures.iter().position(|(n, _)| &**n == name) {
            return pos as u16;
        }
        captures.push((name.into(), source));
        (captures.len() - 1) as u16
    }

    fn find_script_func(&self, name: &str) -> Option<u32> {
        self.func_names
            .iter()
            .rev()
            .find(|(n, _)| &**n == name)
            .map(|&(_, id)| id)
    }

    /// True when any visible variable (any enclosing scope) has this name.
    /// Used for the binding-variable shadow check, so it must not create
    /// captures.
    fn is_name_visible(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.find(name).is_some()) || self.globals.contains(name)
    }

    // ---- blocks and statements ----------------------------------------------

    fn resolve_block(&mut self, block: &mut Block, result_used: bool, top_level: bool) -> ResolveResult<Type> {
        self.scope().blocks.push(Vec::new());
        let func_name_mark = self.func_names.len();
        // hoist named functions so forward calls resolve
        for stmt in &mut block.stmts {
            if let ExprKind::FunDecl { func } = &mut stmt.kind {
                let sig = FuncSig {
                    name: func.name.clone(),
                    params: func.params.iter().map(|p| (p.name.clone(), p.ty.clone())).collect(),
                    mandatory: func.params.iter().filter(|p| p.default.is_none()).count(),
                    return_ty: func.return_ty.clone(),
                };
                let id = self.alloc_func_id(sig);
                func.id = id;
                self.func_names.push((func.name.clone(), id));
                // the function is also a local holding its closure value
                func.decl_slot = Some(self.scope().declare(func.name.clone(), Type::Function));
            }
        }

        let mut ty = Type::Null;
        let count = block.stmts.len();
        for (i, stmt) in block.stmts.iter_mut().enumerate() {
            let last = i + 1 == count;
            let used = result_used && last;
            ty = self.resolve_expr(stmt, used, top_level)?;
        }
        self.func_names.truncate(func_name_mark);
        self.scope().blocks.pop();
        Ok(if result_used { ty } else { Type::Null })
    }

    // ---- expressions -------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn resolve_expr(&mut self, expr: &mut Expr, result_used: bool, top_level: bool) -> ResolveResult<Type> {
        expr.is_result_used = result_used;
        let range = expr.range;
        let ty = match &mut expr.kind {
            ExprKind::Literal(lit) => lit.type_of(),
            ExprKind::Noop | ExprKind::ClassDecl { .. } => Type::Null,
            ExprKind::TypeExpr(ty) => ty.clone(),
            ExprKind::ClassPath { .. } => Type::Def,

            ExprKind::ListLiteral(items) => {
                for item in items {
                    self.resolve_expr(item, true, false)?;
                }
                Type::List
            }
            ExprKind::MapLiteral(entries) => {
                for MapEntry { value, .. } in entries {
                    self.resolve_expr(value, true, false)?;
                }
                Type::Map
            }
            ExprKind::ExprString(parts) => {
                for part in parts {
                    if let StringPart::Interp(inner) = part {
                        self.resolve_expr(inner, true, false)?;
                    }
                }
                Type::Str
            }

            ExprKind::Identifier(ident) => {
                let name = ident.name.clone();
                // an upper-case name that names a class resolves as the
                // class, even when a binding of the same name is visible
                if name.chars().next().is_some_and(char::is_uppercase) && self.class_exists(&name) {
                    let full = self.resolve_class_name(&name, range)?;
                    expr.kind = ExprKind::ClassPath { name: full };
                    expr.ty = Type::Def;
                    return Ok(Type::Def);
                }
                match self.find_var(&name) {
                    Some(Found::Local(slot)) => {
                        ident.target = VarTarget::Local { slot };
                        let depth = self.scopes.len();
                        self.scopes[depth - 1].locals[slot as usize].ty.clone()
                    }
                    Some(Found::Capture(index)) => {
                        ident.target = VarTarget::Capture { index };
                        Type::Def
                    }
                    Some(Found::Global) => {
                        ident.target = VarTarget::Global;
                        Type::Def
                    }
                    None => {
                        // inside a method body, a bare name may be a field
                        let method_class = self.scopes.iter().rev().find_map(|s| s.method_of.clone());
                        if let Some(class) = method_class {
                            if self.class_has_field(&class, &name) {
                                let mut receiver = Expr::new(range, ExprKind::Identifier(Ident::new("this".into())));
                                self.resolve_expr(&mut receiver, true, false)?;
                                expr.kind = ExprKind::Field {
                                    receiver: Box::new(receiver),
                                    name,
                                    safe: false,
                                };
                                expr.ty = Type::Def;
                                expr.is_async = false;
                                return Ok(Type::Def);
                            }
                        }
                        if self.context.repl_mode {
                            self.globals.insert(name.clone());
                            ident.target = VarTarget::Global;
                            Type::Def
                        } else {
                            return Err(CompileError::new(
                                format!("variable '{name}' is not defined"),
                                range,
                            ));
                        }
                    }
                }
            }

            ExprKind::ItVar(ident) => {
                let Some(&slot) = self.scope().it_slots.last() else {
                    return Err(CompileError::new("'it' is not defined here", range));
                };
                ident.target = VarTarget::Local { slot };
                self.scope().locals[slot as usize].ty.clone()
            }

            ExprKind::CaptureVar(_) => {
                self.scope().uses_regex = true;
                Type::Str
            }

            ExprKind::Binary { op, lhs, rhs } => {
                let lt = self.resolve_expr(lhs, true, false)?;
                let rt = self.resolve_expr(rhs, true, false)?;
                let op = *op;
                let ty = binary_type(op, &lt, &rt, range)?;
                if self.context.evaluate_const_exprs {
                    if let Some(folded) = fold_binary(op, lhs, rhs) {
                        expr.kind = ExprKind::Literal(folded);
                        let ExprKind::Literal(lit) = &expr.kind else { unreachable!() };
                        expr.ty = lit.type_of();
                        expr.is_async = false;
                        return Ok(expr.ty.clone());
                    }
                }
                ty
            }
            ExprKind::Unary { op, operand } => {
                let inner = self.resolve_expr(operand, true, false)?;
                match op {
                    UnOp::Not => Type::Bool,
                    UnOp::Neg => {
                        if !matches!(inner, Type::Def) && !inner.is_numeric() {
                            return Err(CompileError::new(
                                format!("cannot negate {inner}"),
                                range,
                            ));
                        }
                        inner
                    }
                }
            }
            ExprKind::Ternary { cond, then_expr, else_expr } => {
                self.resolve_expr(cond, true, false)?;
                let t = self.resolve_expr(then_expr, result_used, false)?;
                let e = self.resolve_expr(else_expr, result_used, false)?;
                t.join(&e)
            }

            ExprKind::Cast { target, expr: inner } => {
                self.resolve_expr(inner, true, false)?;
                if let Type::Instance(name) = target {
                    let full = self.resolve_class_name(name, range)?;
                    *target = Type::Instance(full);
                }
                target.clone()
            }
            ExprKind::CheckCast { target, expr: inner } => {
                self.resolve_expr(inner, true, false)?;
                target.clone()
            }
            ExprKind::InstanceOf { expr: inner, target, .. } => {
                self.resolve_expr(inner, true, false)?;
                if let Type::Instance(name) = target {
                    let full = self.resolve_class_name(name, range)?;
                    *target = Type::Instance(full);
                }
                Type::Bool
            }

            ExprKind::Field { receiver, .. } => {
                self.resolve_expr(receiver, true, false)?;
                Type::Def
            }
            ExprKind::ArrayGet { receiver, index } => {
                self.resolve_expr(receiver, true, false)?;
                self.resolve_expr(index, true, false)?;
                Type::Def
            }
            ExprKind::ArrayLength { receiver } => {
                self.resolve_expr(receiver, true, false)?;
                Type::Int
            }

            ExprKind::Call { function, args, target, suspends } => {
                // `f()` inside a method body where `f` is a method and no
                // local shadows it is really `this.f()`
                if let ExprKind::Identifier(ident) = &function.kind {
                    let name = ident.name.clone();
                    let method_class = self.scopes.iter().rev().find_map(|s| s.method_of.clone());
                    let shadowed = self.scope().find(&name).is_some()
                        || self.find_script_func(&name).is_some()
                        || self.context.find_native(&name).is_some();
                    if let Some(class) = method_class {
                        if !shadowed && self.class_has_method(&class, &name) {
                            let args = std::mem::take(args);
                            let mut receiver =
                                Expr::new(range, ExprKind::Identifier(Ident::new("this".into())));
                            self.resolve_expr(&mut receiver, true, false)?;
                            expr.kind = ExprKind::MethodCall {
                                receiver: Box::new(receiver),
                                name,
                                args,
                                safe: false,
                            };
                            return self.resolve_expr(expr, result_used, top_level);
                        }
                    }
                }
                let ty = self.resolve_call(range, function, args, target, suspends)?;
                for arg in args.iter_mut() {
                    self.resolve_expr(&mut arg.expr, true, false)?;
                }
                // a native parameter marked async-if-arg-async makes the
                // call a suspension point when handed an async closure
                if let crate::ast::CallTarget::Native(id) = target {
                    if let Ok(native) = self.context.native(*id) {
                        for (param, arg) in native.params.iter().zip(args.iter()) {
                            if param.async_if_arg_async && arg_is_async_closure(&arg.expr) {
                                *suspends = true;
                            }
                        }
                    }
                }
                if *suspends {
                    expr.is_async = true;
                }
                ty
            }
            ExprKind::MethodCall { receiver, args, .. } => {
                self.resolve_expr(receiver, true, false)?;
                for arg in args.iter_mut() {
                    self.resolve_expr(&mut arg.expr, true, false)?;
                }
                // dynamic dispatch may reach an async method or closure
                expr.is_async = true;
                Type::Def
            }
            ExprKind::InvokeNew { class, args } => {
                let full = self.resolve_class_name(class, range)?;
                for arg in args.iter_mut() {
                    if arg.name.is_some() {
                        return Err(CompileError::new(
                            "constructor calls take positional arguments",
                            arg.expr.range,
                        ));
                    }
                    self.resolve_expr(&mut arg.expr, true, false)?;
                }
                let args = std::mem::take(args);
                let ty = Type::Instance(full.clone());
                expr.kind = ExprKind::InvokeInit { class: full, args };
                expr.ty = ty.clone();
                return Ok(ty);
            }
            ExprKind::InvokeInit { class, args } => {
                for arg in args.iter_mut() {
                    self.resolve_expr(&mut arg.expr, true, false)?;
                }
                Type::Instance(class.clone())
            }

            ExprKind::VarDecl { name, declared_ty, init, target } => {
                if let Type::Instance(written) = declared_ty {
                    let full = self.resolve_class_name(written, range)?;
                    *declared_ty = Type::Instance(full);
                }
                if let Some(init) = init {
                    let init_ty = self.resolve_expr(init, true, false)?;
                    check_assignable(declared_ty, &init_ty, range)?;
                    // a dynamic value flowing into a class-typed variable
                    // gets a checked downcast
                    if matches!(declared_ty, Type::Instance(_)) && matches!(init_ty, Type::Def) {
                        let target = declared_ty.clone();
                        let inner = std::mem::replace(&mut **init, Expr::noop(range));
                        let mut checked = Expr::new(inner.range, ExprKind::CheckCast {
                            target: target.clone(),
                            expr: Box::new(inner),
                        });
                        checked.ty = target;
                        checked.is_result_used = true;
                        **init = checked;
                    }
                }
                let is_repl_global = self.context.repl_mode && top_level;
                if is_repl_global {
                    self.globals.insert(name.clone());
                    *target = VarTarget::Global;
                } else {
                    if self
                        .scope()
                        .blocks
                        .last()
                        .expect("block open")
                        .iter()
                        .any(|(n, _)| n == name)
                    {
                        return Err(CompileError::new(
                            format!("variable '{name}' already declared in this scope"),
                            range,
                        ));
                    }
                    let slot = self.scope().declare(name.clone(), declared_ty.clone());
                    *target = VarTarget::Local { slot };
                }
                declared_ty.clone()
            }

            ExprKind::VarAssign { ident, value } => {
                let value_ty = self.resolve_expr(value, true, false)?;
                let name = ident.name.clone();
                match self.find_var(&name) {
                    Some(Found::Local(slot)) => {
                        ident.target = VarTarget::Local { slot };
                        let depth = self.scopes.len();
                        let declared = self.scopes[depth - 1].locals[slot as usize].ty.clone();
                        check_assignable(&declared, &value_ty, range)?;
                        declared
                    }
                    Some(Found::Capture(index)) => {
                        ident.target = VarTarget::Capture { index };
                        Type::Def
                    }
                    Some(Found::Global) => {
                        ident.target = VarTarget::Global;
                        Type::Def
                    }
                    None => {
                        let method_class = self.scopes.iter().rev().find_map(|s| s.method_of.clone());
                        if let Some(class) = method_class {
                            if self.class_has_field(&class, &name) {
                                let mut receiver =
                                    Expr::new(range, ExprKind::Identifier(Ident::new("this".into())));
                                self.resolve_expr(&mut receiver, true, false)?;
                                let value = std::mem::replace(
                                    value,
                                    Box::new(Expr::noop(range)),
                                );
                                expr.kind = ExprKind::FieldAssign {
                                    receiver: Box::new(receiver),
                                    field: FieldKey::Name(name),
                                    value,
                                };
                                expr.ty = Type::Def;
                                return Ok(Type::Def);
                            }
                        }
                        if self.context.repl_mode {
                            self.globals.insert(name.clone());
                            ident.target = VarTarget::Global;
                            Type::Def
                        } else {
                            return Err(CompileError::new(
                                format!("variable '{name}' is not defined"),
                                range,
                            ));
                        }
                    }
                }
            }

            ExprKind::FieldAssign { receiver, field, value } => {
                self.resolve_expr(receiver, true, false)?;
                if let FieldKey::Index(index) = field {
                    self.resolve_expr(index, true, false)?;
                }
                self.resolve_expr(value, true, false)?
            }

            ExprKind::Block(block) => self.resolve_block(block, result_used, top_level)?,

            ExprKind::If { cond, then_branch, else_branch } => {
                self.resolve_expr(cond, true, false)?;
                let t = self.resolve_expr(then_branch, result_used, top_level)?;
                match else_branch {
                    Some(else_branch) => {
                        let e = self.resolve_expr(else_branch, result_used, top_level)?;
                        t.join(&e)
                    }
                    None => Type::Def,
                }
            }
            ExprKind::While { cond, body } => {
                self.resolve_expr(cond, true, false)?;
                self.resolve_expr(body, false, false)?;
                Type::Null
            }
            ExprKind::Return { value } => {
                if let Some(value) = value {
                    self.resolve_expr(value, true, false)?;
                }
                Type::Def
            }

            ExprKind::Closure { func } => {
                let id = self.alloc_func_id(FuncSig {
                    name: func.name.clone(),
                    params: func.params.iter().map(|p| (p.name.clone(), p.ty.clone())).collect(),
                    mandatory: func.params.iter().filter(|p| p.default.is_none()).count(),
                    return_ty: func.return_ty.clone(),
                });
                func.id = id;
                self.resolve_function(func, None, false)?;
                Type::Function
            }
            ExprKind::FunDecl { func } => {
                // id assigned by block hoisting; body resolved here
                self.resolve_function(func, None, false)?;
                Type::Function
            }

            ExprKind::Switch { subject, cases, subject_slot, .. } => {
                let subject_ty = match subject {
                    Some(subject) => self.resolve_expr(subject, true, false)?,
                    None => {
                        // subjectless switch matches on `it`
                        let Some(&slot) = self.scope().it_slots.last() else {
                            return Err(CompileError::new(
                                "switch without a subject requires 'it'",
                                range,
                            ));
                        };
                        let mut it = Expr::new(range, ExprKind::ItVar(Ident::new("it".into())));
                        let ty = self.resolve_expr(&mut it, true, false)?;
                        *subject = Some(Box::new(it));
                        let _ = slot;
                        ty
                    }
                };
                // hidden slot so guards/results can reference `it`
                self.scope().blocks.push(Vec::new());
                let slot = self.scope().declare("it".into(), subject_ty.clone());
                *subject_slot = slot;
                self.scope().it_slots.push(slot);

                let mut result_ty: Option<Type> = None;
                for case in cases.iter_mut() {
                    self.resolve_case(case, &subject_ty)?;
                    let t = case.result.ty.clone();
                    result_ty = Some(match result_ty {
                        Some(prev) => prev.join(&t),
                        None => t,
                    });
                }
                self.scope().it_slots.pop();
                self.scope().blocks.pop();
                result_ty.unwrap_or(Type::Def)
            }

            ExprKind::RegexMatch { target, pattern, .. } => {
                self.scope().uses_regex = true;
                match target {
                    Some(target) => {
                        self.resolve_expr(target, true, false)?;
                    }
                    None => {
                        // bare regex matches against `it`
                        let mut it = Expr::new(range, ExprKind::ItVar(Ident::new("it".into())));
                        self.resolve_expr(&mut it, true, false)?;
                        *target = Some(Box::new(it));
                    }
                }
                for part in pattern.iter_mut() {
                    if let StringPart::Interp(inner) = part {
                        self.resolve_expr(inner, true, false)?;
                    }
                }
                Type::Bool
            }
            ExprKind::RegexSubst { target, pattern, replacement, .. } => {
                self.scope().uses_regex = true;
                self.resolve_expr(target, true, false)?;
                for part in pattern.iter_mut().chain(replacement.iter_mut()) {
                    if let StringPart::Interp(inner) = part {
                        self.resolve_expr(inner, true, false)?;
                    }
                }
                Type::Str
            }

            ExprKind::Print { value, .. } => {
                self.resolve_expr(value, true, false)?;
                Type::Null
            }
            ExprKind::Die { value } => {
                if let Some(value) = value {
                    self.resolve_expr(value, true, false)?;
                }
                Type::Null
            }
            ExprKind::Eval { source } => {
                self.resolve_expr(source, true, false)?;
                // the evaluated source is unknown; treat as a suspension point
                expr.is_async = true;
                Type::Def
            }
        };
        expr.ty = ty.clone();
        Ok(ty)
    }

    fn resolve_call(
        &mut self,
        range: CodeRange,
        function: &mut Expr,
        args: &mut Vec<Arg>,
        target: &mut crate::ast::CallTarget,
        suspends: &mut bool,
    ) -> ResolveResult<Type> {
        use crate::ast::CallTarget;
        let ExprKind::Identifier(ident) = &function.kind else {
            // calling an arbitrary expression value
            self.resolve_expr(function, true, false)?;
            *target = CallTarget::Dynamic;
            *suspends = true;
            return Ok(Type::Def);
        };
        let name = ident.name.clone();

        // a hoisted script function, unless a local variable shadows it
        if self.scope().find(&name).is_none() {
            if let Some(func_id) = self.find_script_func(&name) {
                let sig = self.signatures[func_id as usize].clone();
                self.normalise_args(&sig, args, range)?;
                *target = CallTarget::Script(func_id);
                // resolve the name as a value too: when the callee turns
                // out to capture enclosing state, the compiler calls
                // through the closure stored in this variable
                self.resolve_expr(function, true, false)?;
                return Ok(sig.return_ty);
            }
            if let Some((native_id, native)) = self.context.find_native(&name) {
                if args.len() > native.params.len() {
                    return Err(CompileError::new(
                        format!("too many arguments for '{name}'"),
                        range,
                    ));
                }
                if args.iter().any(|a| a.name.is_some()) {
                    let sig = FuncSig {
                        name: native.name.clone(),
                        params: native.params.iter().map(|p| (p.name.clone(), p.ty.clone())).collect(),
                        mandatory: 0,
                        return_ty: native.return_ty.clone(),
                    };
                    self.normalise_args(&sig, args, range)?;
                }
                let ty = native.return_ty.clone();
                if native.is_async {
                    *suspends = true;
                }
                *target = CallTarget::Native(native_id);
                return Ok(ty);
            }
        }

        // otherwise the callee is a value in a variable
        self.resolve_expr(function, true, false)?;
        *target = CallTarget::Dynamic;
        *suspends = true;
        Ok(Type::Def)
    }

    /// Checks arity and rewrites named arguments into positional order.
    /// After this, missing parameters form a suffix covered by defaults.
    fn normalise_args(&self, sig: &FuncSig, args: &mut Vec<Arg>, range: CodeRange) -> ResolveResult<()> {
        if args.len() > sig.params.len() {
            return Err(CompileError::new(
                format!("too many arguments for '{}'", sig.name),
                range,
            ));
        }
        let named = args.iter().any(|a| a.name.is_some());
        if !named {
            if args.len() < sig.mandatory {
                return Err(CompileError::new(
                    format!("missing mandatory argument for '{}'", sig.name),
                    range,
                ));
            }
            return Ok(());
        }
        let mut slots: Vec<Option<Arg>> = (0..sig.params.len()).map(|_| None).collect();
        let mut next_positional = 0usize;
        for arg in args.drain(..) {
            let index = match &arg.name {
                Some(name) => sig
                    .params
                    .iter()
                    .position(|(p, _)| p == name)
                    .ok_or_else(|| {
                        CompileError::new(
                            format!("no such parameter '{name}' for '{}'", sig.name),
                            arg.expr.range,
                        )
                    })?,
                None => {
                    while next_positional < slots.len() && slots[next_positional].is_some() {
                        next_positional += 1;
                    }
                    next_positional
                }
            };
            if index >= slots.len() || slots[index].is_some() {
                return Err(CompileError::new(
                    format!("duplicate argument for '{}'", sig.name),
                    arg.expr.range,
                ));
            }
            slots[index] = Some(arg);
        }
        // arguments must cover a prefix; defaults fill the rest
        let filled = slots.iter().take_while(|s| s.is_some()).count();
        if slots.iter().skip(filled).any(Option::is_some) {
            return Err(CompileError::new(
                format!("missing argument in the middle of call to '{}'", sig.name),
                range,
            ));
        }
        if filled < sig.mandatory {
            return Err(CompileError::new(
                format!("missing mandatory argument for '{}'", sig.name),
                range,
            ));
        }
        args.extend(slots.into_iter().take(filled).map(|s| s.expect("prefix is filled")));
        Ok(())
    }

    // ---- switch cases ------------------------------------------------------

    fn resolve_case(&mut self, case: &mut SwitchCase, subject_ty: &Type) -> ResolveResult<()> {
        let _ = subject_ty;
        self.scope().blocks.push(Vec::new());

        // collect binding names across all alternatives; one slot per name
        let mut patterns = std::mem::take(&mut case.patterns);
        let mut bindings = std::mem::take(&mut case.bindings);
        for alt in &mut patterns {
            self.resolve_pattern_bindings(&mut alt.pattern, &mut bindings)?;
        }
        // now that slots exist, resolve pattern identifiers
        for alt in &mut patterns {
            Self::assign_pattern_slots(&mut alt.pattern, &bindings);
        }
        case.bindings = bindings;
        case.patterns = patterns;

        for alt in &mut case.patterns {
            if let Some(guard) = &mut alt.guard {
                self.resolve_expr(guard, true, false)?;
            }
        }
        self.resolve_expr(&mut case.result, true, false)?;
        self.scope().blocks.pop();
        Ok(())
    }

    fn resolve_pattern_bindings(
        &mut self,
        pattern: &mut Pattern,
        bindings: &mut smallvec::SmallVec<[crate::ast::BindingSlot; 2]>,
    ) -> ResolveResult<()> {
        let range = pattern.range;
        match &mut pattern.kind {
            PatternKind::Binding(ident) => {
                let name = ident.name.clone();
                self.declare_binding(&name, Type::Def, range, bindings)?;
            }
            PatternKind::Type { ty, binding } => {
                if let Type::Instance(written) = ty {
                    let full = self.resolve_class_name(written, range)?;
                    *ty = Type::Instance(full);
                }
                if let Some(ident) = binding {
                    let name = ident.name.clone();
                    let ty = ty.clone();
                    self.declare_binding(&name, ty, range, bindings)?;
                }
            }
            PatternKind::List(items) => {
                for item in items {
                    self.resolve_pattern_bindings(item, bindings)?;
                }
            }
            PatternKind::Map { entries, .. } => {
                for (_, value) in entries {
                    self.resolve_pattern_bindings(value, bindings)?;
                }
            }
            PatternKind::Regex { .. } => {
                self.scope().uses_regex = true;
            }
            PatternKind::Literal(_) | PatternKind::Wildcard | PatternKind::Rest => {}
        }
        Ok(())
    }

    fn declare_binding(
        &mut self,
        name: &Rc<str>,
        ty: Type,
        range: CodeRange,
        bindings: &mut smallvec::SmallVec<[crate::ast::BindingSlot; 2]>,
    ) -> ResolveResult<()> {
        if bindings.iter().any(|b| b.name == *name) {
            // same name again in this case: same slot, equality at run time
            return Ok(());
        }
        if self.is_name_visible(name) {
            return Err(CompileError::new(
                format!("binding variable '{name}' shadows another variable"),
                range,
            ));
        }
        let slot = self.scope().declare(name.clone(), ty.clone());
        bindings.push(crate::ast::BindingSlot { name: name.clone(), slot, ty });
        Ok(())
    }

    fn assign_pattern_slots(pattern: &mut Pattern, bindings: &smallvec::SmallVec<[crate::ast::BindingSlot; 2]>) {
        match &mut pattern.kind {
            PatternKind::Binding(ident) => {
                if let Some(b) = bindings.iter().find(|b| b.name == ident.name) {
                    ident.target = VarTarget::Local { slot: b.slot };
                }
            }
            PatternKind::Type { binding: Some(ident), .. } => {
                if let Some(b) = bindings.iter().find(|b| b.name == ident.name) {
                    ident.target = VarTarget::Local { slot: b.slot };
                }
            }
            PatternKind::List(items) => {
                for item in items {
                    Self::assign_pattern_slots(item, bindings);
                }
            }
            PatternKind::Map { entries, .. } => {
                for (_, value) in entries {
                    Self::assign_pattern_slots(value, bindings);
                }
            }
            _ => {}
        }
    }
}

/// The value of a constant expression, if it is one.
pub fn literal_value(expr: &Expr) -> Option<Value> {
    match &expr.kind {
        ExprKind::Literal(lit) => Some(lit.to_value()),
        _ => None,
    }
}

fn arg_is_async_closure(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Closure { func } => func.is_async || body_mentions_async(&func.body),
        // a non-literal callable could be anything
        ExprKind::Identifier(_) | ExprKind::Field { .. } => true,
        _ => false,
    }
}

/// Cheap syntactic check used before the analyser's transitive pass: does
/// the body contain an obviously-async construct?
fn body_mentions_async(expr: &Expr) -> bool {
    let mut found = false;
    crate::decorate::walk_exprs(expr, &mut |e| {
        if e.is_async {
            found = true;
        }
        if let ExprKind::Call { function, .. } = &e.kind {
            if let ExprKind::Identifier(ident) = &function.kind {
                if matches!(&*ident.name, "sleep" | "checkpoint") {
                    found = true;
                }
            }
        }
    });
    found
}

fn binary_type(op: BinOp, lhs: &Type, rhs: &Type, range: CodeRange) -> ResolveResult<Type> {
    match op {
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq | BinOp::And | BinOp::Or => {
            Ok(Type::Bool)
        }
        BinOp::Elvis => Ok(lhs.join(rhs)),
        BinOp::Add => {
            if matches!(lhs, Type::Str) || matches!(rhs, Type::Str) {
                return Ok(Type::Str);
            }
            if matches!(lhs, Type::List) {
                return Ok(Type::List);
            }
            if matches!(lhs, Type::Map) && matches!(rhs, Type::Map) {
                return Ok(Type::Map);
            }
            numeric_result(op, lhs, rhs, range)
        }
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => numeric_result(op, lhs, rhs, range),
    }
}

fn numeric_result(op: BinOp, lhs: &Type, rhs: &Type, range: CodeRange) -> ResolveResult<Type> {
    if matches!(lhs, Type::Def) || matches!(rhs, Type::Def) {
        return Ok(Type::Def);
    }
    if lhs.is_numeric() && rhs.is_numeric() {
        return Ok(lhs.join(rhs));
    }
    Err(CompileError::new(
        format!("operator '{}' cannot be applied to {lhs} and {rhs}", op_symbol(op)),
        range,
    ))
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::LtEq => "<=",
        BinOp::Gt => ">",
        BinOp::GtEq => ">=",
        BinOp::And => "&&",
        BinOp::Or => "||",
        BinOp::Elvis => "?:",
    }
}

/// Assignability: same type, widening numeric, anything into `def`, null
/// into references.
fn check_assignable(declared: &Type, value: &Type, range: CodeRange) -> ResolveResult<()> {
    if matches!(declared, Type::Def) || matches!(value, Type::Def) || declared == value {
        return Ok(());
    }
    if declared.is_numeric() && value.is_numeric() {
        return Ok(());
    }
    if matches!(value, Type::Null) && !declared.is_primitive() {
        return Ok(());
    }
    if matches!(declared, Type::List) && matches!(value, Type::Array(_) | Type::List) {
        return Ok(());
    }
    // class-to-class assignment is checked against the hierarchy at run
    // time (the value may be a subclass instance)
    if matches!(declared, Type::Instance(_)) && matches!(value, Type::Instance(_)) {
        return Ok(());
    }
    Err(CompileError::new(
        format!("cannot convert from {value} to {declared}"),
        range,
    ))
}

fn fold_binary(op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<Literal> {
    let (a, b) = (literal_value(lhs)?, literal_value(rhs)?);
    let result = match op {
        BinOp::Add => a.add(&b).ok()?,
        BinOp::Sub => a.sub(&b).ok()?,
        BinOp::Mul => a.mul(&b).ok()?,
        BinOp::Div => a.div(&b).ok()?,
        BinOp::Rem => a.rem(&b).ok()?,
        _ => return None,
    };
    Some(match result {
        Value::Int(v) => Literal::Int(v),
        Value::Long(v) => Literal::Long(v),
        Value::Double(v) => Literal::Double(v),
        Value::Decimal(d) => Literal::Decimal(d),
        Value::Str(s) => Literal::Str(s),
        _ => return None,
    })
}
