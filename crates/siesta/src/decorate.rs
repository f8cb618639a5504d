//! A generic bottom-up expression rewriter.
//!
//! `decorate_script` applies a caller-supplied rewrite to every eligible
//! expression in a parsed tree, children first. The forced-suspension test
//! harness uses it with `sleep_wrap` to prove the continuation transform
//! complete: a program must produce the same value with every eligible
//! subexpression suspended.
//!
//! Exempt from rewriting, because they are not values or wrapping them
//! would change meaning: variable declarations, type expressions,
//! named-argument values, regex-substitution replacements, constructor
//! invocations, assignment targets, class-path references, no-ops — and
//! statement forms (blocks, if/while, return, print, die, declarations),
//! which are not expression values in the rewriter's sense. Children of
//! exempt nodes are still rewritten.

use crate::{
    ast::{
        Arg, Expr, ExprKind, FieldKey, Ident, Literal, MapEntry, ParsedScript, StringPart,
    },
    error::CodeRange,
};

/// Applies `rewrite` to every eligible expression, bottom-up.
pub fn decorate_script(script: &mut ParsedScript, rewrite: &mut impl FnMut(Expr) -> Expr) {
    for stmt in &mut script.body.stmts {
        decorate_expr(stmt, rewrite);
    }
}

/// Wraps an expression in `sleep(0, expr)`: identical value, but the
/// evaluation now crosses a suspension point.
#[must_use]
pub fn sleep_wrap(expr: Expr) -> Expr {
    let range = expr.range;
    let sleep = Expr::new(range, ExprKind::Identifier(Ident::new("sleep".into())));
    Expr::new(
        range,
        ExprKind::Call {
            function: Box::new(sleep),
            args: vec![
                Arg { name: None, expr: Expr::new(range, ExprKind::Literal(Literal::Int(0))) },
                Arg { name: None, expr },
            ],
            target: Default::default(),
            suspends: false,
        },
    )
}

fn decorate_expr(expr: &mut Expr, rewrite: &mut impl FnMut(Expr) -> Expr) {
    visit_children_mut(expr, &mut |child| decorate_expr(child, rewrite));
    if !eligible(expr) {
        return;
    }
    let saved_result_used = expr.is_result_used;
    let mut original = std::mem::replace(expr, Expr::noop(CodeRange::default()));
    // the inner expression's value is always consumed by the wrapper
    original.is_result_used = true;
    let mut wrapped = rewrite(original);
    wrapped.is_result_used = saved_result_used;
    *expr = wrapped;
}

/// Whether the rewrite applies to this node.
fn eligible(expr: &Expr) -> bool {
    !matches!(
        expr.kind,
        // the exempt variants
        ExprKind::VarDecl { .. }
            | ExprKind::TypeExpr(_)
            | ExprKind::ClassPath { .. }
            | ExprKind::InvokeNew { .. }
            | ExprKind::InvokeInit { .. }
            | ExprKind::Noop
            // statement forms
            | ExprKind::Block(_)
            | ExprKind::If { .. }
            | ExprKind::While { .. }
            | ExprKind::Return { .. }
            | ExprKind::Print { .. }
            | ExprKind::Die { .. }
            | ExprKind::FunDecl { .. }
            | ExprKind::ClassDecl { .. }
    )
}

/// Calls `f` on every direct child expression of `expr`.
///
/// This is the single place that knows every variant's children; the
/// resolver's helpers and the decorator both walk through it. Named
/// argument values and regex-substitution replacement parts are skipped by
/// the decorator via `visit_children_for_decorate` rules below.
pub fn visit_children_mut(expr: &mut Expr, f: &mut impl FnMut(&mut Expr)) {
    match &mut expr.kind {
        ExprKind::Literal(_)
        | ExprKind::Identifier(_)
        | ExprKind::ItVar(_)
        | ExprKind::CaptureVar(_)
        | ExprKind::TypeExpr(_)
        | ExprKind::ClassPath { .. }
        | ExprKind::Noop => {}
        ExprKind::ListLiteral(items) => items.iter_mut().for_each(f),
        ExprKind::MapLiteral(entries) => {
            for MapEntry { value, .. } in entries {
                f(value);
            }
        }
        ExprKind::ExprString(parts) => visit_parts(parts, f),
        ExprKind::Binary { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        ExprKind::Unary { operand, .. } => f(operand),
        ExprKind::Ternary { cond, then_expr, else_expr } => {
            f(cond);
            f(then_expr);
            f(else_expr);
        }
        ExprKind::Cast { expr: inner, .. }
        | ExprKind::CheckCast { expr: inner, .. }
        | ExprKind::InstanceOf { expr: inner, .. } => f(inner),
        ExprKind::Field { receiver, .. } | ExprKind::ArrayLength { receiver } => f(receiver),
        ExprKind::ArrayGet { receiver, index } => {
            f(receiver);
            f(index);
        }
        ExprKind::Call { function, args, .. } => {
            // a bare identifier callee is a name reference, not a value;
            // computed callees are ordinary expressions
            if !matches!(function.kind, ExprKind::Identifier(_)) {
                f(function);
            }
            for arg in args {
                // named-argument values stay undecorated
                if arg.name.is_none() {
                    f(&mut arg.expr);
                }
            }
        }
        ExprKind::MethodCall { receiver, args, .. } => {
            f(receiver);
            for arg in args {
                if arg.name.is_none() {
                    f(&mut arg.expr);
                }
            }
        }
        ExprKind::InvokeNew { args, .. } | ExprKind::InvokeInit { args, .. } => {
            for arg in args {
                f(&mut arg.expr);
            }
        }
        ExprKind::VarDecl { init, .. } => {
            if let Some(init) = init {
                f(init);
            }
        }
        ExprKind::VarAssign { value, .. } => f(value),
        ExprKind::FieldAssign { receiver, field, value } => {
            f(receiver);
            if let FieldKey::Index(index) = field {
                f(index);
            }
            f(value);
        }
        ExprKind::Block(block) => block.stmts.iter_mut().for_each(f),
        ExprKind::If { cond, then_branch, else_branch } => {
            f(cond);
            f(then_branch);
            if let Some(else_branch) = else_branch {
                f(else_branch);
            }
        }
        ExprKind::While { cond, body } => {
            f(cond);
            f(body);
        }
        ExprKind::Return { value } => {
            if let Some(value) = value {
                f(value);
            }
        }
        ExprKind::Closure { func } | ExprKind::FunDecl { func } => f(&mut func.body),
        ExprKind::ClassDecl { class } => {
            // field initialisers are constant declarations, not evaluated
            // expressions; only method bodies are walked
            for method in &mut class.methods {
                f(&mut method.body);
            }
        }
        ExprKind::Switch { subject, cases, .. } => {
            if let Some(subject) = subject {
                f(subject);
            }
            for case in cases {
                for alt in &mut case.patterns {
                    if let Some(guard) = &mut alt.guard {
                        f(guard);
                    }
                }
                f(&mut case.result);
            }
        }
        ExprKind::RegexMatch { target, pattern, .. } => {
            if let Some(target) = target {
                f(target);
            }
            visit_parts(pattern, f);
        }
        ExprKind::RegexSubst { target, pattern, .. } => {
            f(target);
            visit_parts(pattern, f);
            // replacement parts are re-evaluated per match and stay
            // undecorated
        }
        ExprKind::Print { value, .. } => f(value),
        ExprKind::Die { value } => {
            if let Some(value) = value {
                f(value);
            }
        }
        ExprKind::Eval { source } => f(source),
    }
}

fn visit_parts(parts: &mut [StringPart], f: &mut impl FnMut(&mut Expr)) {
    for part in parts {
        if let StringPart::Interp(inner) = part {
            f(inner);
        }
    }
}

/// Immutable pre-order walk over `expr` and every descendant.
pub fn walk_exprs<'a>(expr: &'a Expr, f: &mut impl FnMut(&'a Expr)) {
    f(expr);
    // mirror of visit_children_mut, immutably
    match &expr.kind {
        ExprKind::Literal(_)
        | ExprKind::Identifier(_)
        | ExprKind::ItVar(_)
        | ExprKind::CaptureVar(_)
        | ExprKind::TypeExpr(_)
        | ExprKind::ClassPath { .. }
        | ExprKind::Noop => {}
        ExprKind::ListLiteral(items) => items.iter().for_each(|e| walk_exprs(e, f)),
        ExprKind::MapLiteral(entries) => {
            for MapEntry { value, .. } in entries {
                walk_exprs(value, f);
            }
        }
        ExprKind::ExprString(parts) => walk_parts(parts, f),
        ExprKind::Binary { lhs, rhs, .. } => {
            walk_exprs(lhs, f);
            walk_exprs(rhs, f);
        }
        ExprKind::Unary { operand, .. } => walk_exprs(operand, f),
        ExprKind::Ternary { cond, then_expr, else_expr } => {
            walk_exprs(cond, f);
            walk_exprs(then_expr, f);
            walk_exprs(else_expr, f);
        }
        ExprKind::Cast { expr: inner, .. }
        | ExprKind::CheckCast { expr: inner, .. }
        | ExprKind::InstanceOf { expr: inner, .. } => walk_exprs(inner, f),
        ExprKind::Field { receiver, .. } | ExprKind::ArrayLength { receiver } => walk_exprs(receiver, f),
        ExprKind::ArrayGet { receiver, index } => {
            walk_exprs(receiver, f);
            walk_exprs(index, f);
        }
        ExprKind::Call { function, args, .. } => {
            walk_exprs(function, f);
            for arg in args {
                walk_exprs(&arg.expr, f);
            }
        }
        ExprKind::MethodCall { receiver, args, .. } => {
            walk_exprs(receiver, f);
            for arg in args {
                walk_exprs(&arg.expr, f);
            }
        }
        ExprKind::InvokeNew { args, .. } | ExprKind::InvokeInit { args, .. } => {
            for arg in args {
                walk_exprs(&arg.expr, f);
            }
        }
        ExprKind::VarDecl { init, .. } => {
            if let Some(init) = init {
                walk_exprs(init, f);
            }
        }
        ExprKind::VarAssign { value, .. } => walk_exprs(value, f),
        ExprKind::FieldAssign { receiver, field, value } => {
            walk_exprs(receiver, f);
            if let FieldKey::Index(index) = field {
                walk_exprs(index, f);
            }
            walk_exprs(value, f);
        }
        ExprKind::Block(block) => block.stmts.iter().for_each(|e| walk_exprs(e, f)),
        ExprKind::If { cond, then_branch, else_branch } => {
            walk_exprs(cond, f);
            walk_exprs(then_branch, f);
            if let Some(else_branch) = else_branch {
                walk_exprs(else_branch, f);
            }
        }
        ExprKind::While { cond, body } => {
            walk_exprs(cond, f);
            walk_exprs(body, f);
        }
        ExprKind::Return { value } => {
            if let Some(value) = value {
                walk_exprs(value, f);
            }
        }
        ExprKind::Closure { func } | ExprKind::FunDecl { func } => walk_exprs(&func.body, f),
        ExprKind::ClassDecl { class } => {
            for method in &class.methods {
                walk_exprs(&method.body, f);
            }
        }
        ExprKind::Switch { subject, cases, .. } => {
            if let Some(subject) = subject {
                walk_exprs(subject, f);
            }
            for case in cases {
                for alt in &case.patterns {
                    if let Some(guard) = &alt.guard {
                        walk_exprs(guard, f);
                    }
                }
                walk_exprs(&case.result, f);
            }
        }
        ExprKind::RegexMatch { target, pattern, .. } => {
            if let Some(target) = target {
                walk_exprs(target, f);
            }
            walk_parts(pattern, f);
        }
        ExprKind::RegexSubst { target, pattern, replacement, .. } => {
            walk_exprs(target, f);
            walk_parts(pattern, f);
            walk_parts(replacement, f);
        }
        ExprKind::Print { value, .. } => walk_exprs(value, f),
        ExprKind::Die { value } => {
            if let Some(value) = value {
                walk_exprs(value, f);
            }
        }
        ExprKind::Eval { source } => walk_exprs(source, f),
    }
}

fn walk_parts<'a>(parts: &'a [StringPart], f: &mut impl FnMut(&'a Expr)) {
    for part in parts {
        if let StringPart::Interp(inner) = part {
            walk_exprs(inner, f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;

    fn count_sleeps(script: &ParsedScript) -> usize {
        let mut count = 0;
        for stmt in &script.body.stmts {
            walk_exprs(stmt, &mut |e| {
                if let ExprKind::Call { function, .. } = &e.kind {
                    if let ExprKind::Identifier(ident) = &function.kind {
                        if &*ident.name == "sleep" {
                            count += 1;
                        }
                    }
                }
            });
        }
        count
    }

    #[test]
    fn wraps_operands_and_whole_expressions() {
        let mut script = parse("1 + 2").unwrap();
        decorate_script(&mut script, &mut sleep_wrap);
        // 1, 2, and the addition itself
        assert_eq!(count_sleeps(&script), 3);
    }

    #[test]
    fn declarations_are_exempt_but_initialisers_are_not() {
        let mut script = parse("def x = 1").unwrap();
        decorate_script(&mut script, &mut sleep_wrap);
        assert_eq!(count_sleeps(&script), 1);
        assert!(matches!(&script.body.stmts[0].kind, ExprKind::VarDecl { .. }));
    }

    #[test]
    fn constructor_invocations_are_exempt() {
        let mut script = parse("class A { int v }\nnew A(3)").unwrap();
        decorate_script(&mut script, &mut sleep_wrap);
        // only the argument 3 gets wrapped
        assert_eq!(count_sleeps(&script), 1);
        assert!(matches!(&script.body.stmts[1].kind, ExprKind::InvokeNew { .. }));
    }

    #[test]
    fn substitution_replacement_is_exempt() {
        let mut script = parse("def s = 'ab'\ns =~ s/a/${1 + 2}/").unwrap();
        let before = count_sleeps(&script);
        decorate_script(&mut script, &mut sleep_wrap);
        let after = count_sleeps(&script);
        // the replacement interpolation contributed nothing
        let mut replacement_wrapped = false;
        for stmt in &script.body.stmts {
            walk_exprs(stmt, &mut |e| {
                if let ExprKind::RegexSubst { replacement, .. } = &e.kind {
                    for part in replacement {
                        if let StringPart::Interp(inner) = part {
                            if let ExprKind::Call { .. } = inner.kind {
                                replacement_wrapped = true;
                            }
                        }
                    }
                }
            });
        }
        assert!(!replacement_wrapped);
        assert!(after > before);
    }

    #[test]
    fn wrapper_takes_over_result_used_flag() {
        let mut expr = Expr::new(CodeRange::default(), ExprKind::Literal(Literal::Int(1)));
        expr.is_result_used = false;
        decorate_expr(&mut expr, &mut sleep_wrap);
        assert!(!expr.is_result_used);
        let ExprKind::Call { args, .. } = &expr.kind else {
            panic!("expected wrapper call");
        };
        assert!(args[1].expr.is_result_used);
    }
}
