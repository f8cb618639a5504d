//! The analyser: switch exhaustiveness/reachability and the final
//! asyncness pass.
//!
//! Switch checks run per `Switch` node: pattern/subject type compatibility,
//! duplicate literal detection across numeric widenings, top-to-bottom
//! reachability over an abstract shape domain, binding-variable typing, and
//! the table-vs-sequential lowering hint.
//!
//! The asyncness pass closes `is_async` transitively over the script call
//! graph (mutual recursion needs a fixpoint) and finalises each call site's
//! `suspends` flag, which is what the code generator turns into suspension
//! locations and snapshot layouts.

use ahash::AHashMap;

use crate::{
    ast::{
        CallTarget, Expr, ExprKind, FunctionDecl, Literal, Pattern, PatternKind, SwitchStrategy,
    },
    codegen::LitKey,
    context::Context,
    decorate::visit_children_mut,
    error::{CodeRange, CompileError},
    resolve::ResolvedScript,
    types::{Type, TypeTags},
};

type AnalyseResult<T> = Result<T, CompileError>;

/// Runs both analyses over a resolved script.
pub fn analyse(resolved: &mut ResolvedScript, context: &Context) -> AnalyseResult<()> {
    finalise_async(resolved, context);
    check_function(&mut resolved.main)?;
    for class in &mut resolved.classes {
        for method in &mut class.methods {
            check_function(method)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// asyncness
// ---------------------------------------------------------------------------

/// Transitive closure of `is_async` over the call graph. Each pass walks
/// every function body bottom-up, reading the table built by the previous
/// pass; iteration stops at a fixpoint (flags only ever turn on, so this
/// terminates within `func_count` passes).
fn finalise_async(resolved: &mut ResolvedScript, context: &Context) {
    let mut table = vec![false; resolved.func_count as usize];
    loop {
        let mut changed = false;
        mark_function(&mut resolved.main, &mut table, context, &mut changed);
        for class in &mut resolved.classes {
            for method in &mut class.methods {
                mark_function(method, &mut table, context, &mut changed);
            }
        }
        if !changed {
            break;
        }
    }
}

fn mark_function(func: &mut FunctionDecl, table: &mut Vec<bool>, context: &Context, changed: &mut bool) {
    let body_async = mark_expr(&mut func.body, table, context, changed);
    let is_async = body_async || table[func.id as usize];
    if is_async != table[func.id as usize] {
        table[func.id as usize] = is_async;
        *changed = true;
    }
    func.is_async = is_async;
}

/// Bottom-up: an expression is async when it is itself a suspension point
/// or any child is.
fn mark_expr(expr: &mut Expr, table: &mut Vec<bool>, context: &Context, changed: &mut bool) -> bool {
    // nested functions are their own async domain: their bodies do not
    // make the enclosing expression async, but their flags must be kept
    // current for closure-argument checks
    match &mut expr.kind {
        ExprKind::Closure { func } | ExprKind::FunDecl { func } => {
            mark_function(func, table, context, changed);
            expr.is_async = false;
            return false;
        }
        ExprKind::ClassDecl { .. } => {
            expr.is_async = false;
            return false;
        }
        _ => {}
    }

    let mut any_child = false;
    visit_children_mut(expr, &mut |child| {
        if mark_expr(child, table, context, changed) {
            any_child = true;
        }
    });
    // named-argument values and substitution replacements are not visited
    // by the generic walker's decorator rules, but they are for asyncness
    if let ExprKind::Call { args, .. } | ExprKind::MethodCall { args, .. } = &mut expr.kind {
        for arg in args.iter_mut().filter(|a| a.name.is_some()) {
            if mark_expr(&mut arg.expr, table, context, changed) {
                any_child = true;
            }
        }
    }

    let own = match &mut expr.kind {
        ExprKind::Call { args, target, suspends, .. } => {
            let site_suspends = match target {
                CallTarget::Script(id) => table[*id as usize],
                CallTarget::Native(id) => match context.native(*id) {
                    Ok(native) => {
                        let mut s = native.is_async;
                        for (param, arg) in native.params.iter().zip(args.iter()) {
                            if param.async_if_arg_async && closure_arg_is_async(&arg.expr, table) {
                                s = true;
                            }
                        }
                        s
                    }
                    Err(_) => true,
                },
                CallTarget::Dynamic | CallTarget::Unresolved => true,
            };
            *suspends = site_suspends;
            site_suspends
        }
        ExprKind::MethodCall { .. } | ExprKind::Eval { .. } => true,
        _ => false,
    };
    expr.is_async = own || any_child;
    expr.is_async
}

/// Whether a closure argument may suspend when invoked: a closure literal
/// consults its (current) flag, anything else is conservatively async.
fn closure_arg_is_async(expr: &Expr, table: &[bool]) -> bool {
    match &expr.kind {
        ExprKind::Closure { func } => table[func.id as usize],
        ExprKind::Literal(_) | ExprKind::ListLiteral(_) | ExprKind::MapLiteral(_) => false,
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// switch analysis
// ---------------------------------------------------------------------------

fn check_function(func: &mut FunctionDecl) -> AnalyseResult<()> {
    check_expr(&mut func.body)
}

fn check_expr(expr: &mut Expr) -> AnalyseResult<()> {
    let mut result = Ok(());
    let subject_ty = if let ExprKind::Switch { subject, .. } = &expr.kind {
        subject.as_ref().map(|s| s.ty.clone())
    } else {
        None
    };
    visit_children_mut(expr, &mut |child| {
        if result.is_ok() {
            result = check_expr(child);
        }
    });
    result?;
    if let ExprKind::Switch { cases, strategy, .. } = &mut expr.kind {
        let subject_ty = subject_ty.unwrap_or(Type::Def);
        check_switch(&subject_ty, cases, strategy)?;
    }
    Ok(())
}

fn check_switch(
    subject_ty: &Type,
    cases: &mut [crate::ast::SwitchCase],
    strategy: &mut SwitchStrategy,
) -> AnalyseResult<()> {
    let subject_tags = subject_ty.tags();

    // one default at most
    let mut default_seen = false;
    for case in cases.iter() {
        if case.is_default {
            if default_seen {
                return Err(CompileError::new("cannot have multiple 'default'", case.range));
            }
            default_seen = true;
        }
    }

    // pattern/subject compatibility and binding typing
    for case in cases.iter() {
        for alt in &case.patterns {
            if !case.is_default {
                check_compat(&alt.pattern, subject_ty, subject_tags)?;
            }
        }
    }

    // duplicate literals, normalised across numeric widths
    let mut seen: AHashMap<LitKey, CodeRange> = AHashMap::new();
    for case in cases.iter() {
        for alt in &case.patterns {
            if alt.guard.is_some() {
                continue;
            }
            if let PatternKind::Literal(lit) = &alt.pattern.kind {
                if let Some(key) = LitKey::of_value(&lit.to_value()) {
                    if seen.insert(key, alt.pattern.range).is_some() {
                        return Err(CompileError::new(
                            "literal match occurs multiple times",
                            alt.pattern.range,
                        ));
                    }
                }
            }
        }
    }

    // reachability: walk alternatives top to bottom, tracking the shapes
    // already absorbed by unguarded alternatives. A default runs only
    // after every other case fails, wherever it is written (the code
    // generator reorders it last), so it is checked against the unguarded
    // shapes of ALL non-default cases, not just the textually preceding
    // ones.
    let all_shapes: Vec<Shape> = cases
        .iter()
        .filter(|case| !case.is_default)
        .flat_map(|case| {
            case.patterns
                .iter()
                .filter(|alt| alt.guard.is_none())
                .map(|alt| Shape::of(&alt.pattern))
        })
        .collect();
    let mut priors: Vec<Shape> = Vec::new();
    for case in cases.iter() {
        if case.is_default {
            if all_shapes.iter().any(|p| p.covers_all_of(subject_tags)) {
                return Err(CompileError::new(
                    "default case is never applicable",
                    case.range,
                ));
            }
            continue;
        }
        for alt in &case.patterns {
            let shape = Shape::of(&alt.pattern);
            if priors.iter().any(|p| p.covers(&shape, subject_tags)) {
                return Err(CompileError::new(
                    "unreachable switch case: covered by previous",
                    alt.pattern.range,
                ));
            }
            if alt.guard.is_none() {
                priors.push(shape);
            }
        }
    }

    // lowering hint: primitive subject, all plain unguarded literals
    let table_eligible = subject_ty.is_primitive()
        && cases.iter().all(|case| {
            case.is_default
                || case.patterns.iter().all(|alt| {
                    alt.guard.is_none() && matches!(alt.pattern.kind, PatternKind::Literal(_))
                })
        });
    *strategy = if table_eligible {
        SwitchStrategy::TableLookup
    } else {
        SwitchStrategy::Sequential
    };
    Ok(())
}

/// The runtime tags a pattern can possibly match.
fn pattern_tags(pattern: &Pattern) -> TypeTags {
    match &pattern.kind {
        PatternKind::Literal(lit) => match lit {
            // numeric literals compare across widths
            Literal::Int(_) | Literal::Long(_) | Literal::Double(_) | Literal::Decimal(_) => {
                TypeTags::NUMERIC
            }
            Literal::Bool(_) => TypeTags::BOOL,
            Literal::Str(_) => TypeTags::STR,
            Literal::Null => TypeTags::NULL,
        },
        PatternKind::Wildcard | PatternKind::Rest | PatternKind::Binding(_) => TypeTags::ALL,
        // a type test never matches null
        PatternKind::Type { ty, .. } => ty.tags().intersect(TypeTags(!TypeTags::NULL.0)),
        PatternKind::List(_) => TypeTags::LIST,
        PatternKind::Map { .. } => TypeTags::MAP,
        PatternKind::Regex { .. } => TypeTags::STR,
    }
}

/// Compatibility of a pattern against the type of the position it tests.
fn check_compat(pattern: &Pattern, position_ty: &Type, position_tags: TypeTags) -> AnalyseResult<()> {
    let tags = pattern_tags(pattern);
    match &pattern.kind {
        PatternKind::Type { ty, binding } => {
            if !tags.intersects(position_tags) {
                return Err(match binding {
                    Some(ident) => CompileError::new(
                        format!(
                            "type of binding variable '{}' not compatible: can never be {ty}",
                            ident.name
                        ),
                        pattern.range,
                    ),
                    None => CompileError::new(format!("can never be {ty}"), pattern.range),
                });
            }
        }
        PatternKind::Literal(lit) => {
            if !tags.intersects(position_tags) {
                return Err(CompileError::new(
                    format!("cannot compare type {} to {position_ty}", lit.type_of()),
                    pattern.range,
                ));
            }
        }
        PatternKind::Regex { .. } => {
            if !position_tags.intersects(TypeTags::STR) {
                return Err(CompileError::new(
                    "regex pattern requires a String subject",
                    pattern.range,
                ));
            }
        }
        PatternKind::List(items) => {
            if !position_tags.intersects(TypeTags::LIST) {
                return Err(CompileError::new("can never be List", pattern.range));
            }
            for item in items {
                check_compat(item, &Type::Def, TypeTags::ALL)?;
            }
        }
        PatternKind::Map { entries, .. } => {
            if !position_tags.intersects(TypeTags::MAP) {
                return Err(CompileError::new("can never be Map", pattern.range));
            }
            for (_, value) in entries {
                check_compat(value, &Type::Def, TypeTags::ALL)?;
            }
        }
        PatternKind::Wildcard | PatternKind::Rest | PatternKind::Binding(_) => {}
    }
    Ok(())
}

/// Abstract shape of a pattern, used for absorption checks. Guards are not
/// part of the shape; guarded alternatives are never added to the prior
/// set.
#[derive(Debug, Clone)]
enum Shape {
    /// Matches any value.
    Any,
    /// Matches every value carrying one of these tags (type patterns).
    Tags(TypeTags),
    /// Matches exactly one normalised literal.
    Lit(LitKey),
    /// List of element shapes; `exact` unless a `*` made the tail open.
    List { head: Vec<Shape>, tail: Vec<Shape>, exact: bool },
    /// Map entries by key; `open` when residual keys are allowed.
    Map { entries: Vec<(String, Shape)>, open: bool },
    /// Matches an unknown subset; absorbs nothing and is only absorbed by
    /// `Any` and string-covering `Tags`.
    Opaque(TypeTags),
}

impl Shape {
    fn of(pattern: &Pattern) -> Self {
        match &pattern.kind {
            PatternKind::Wildcard | PatternKind::Binding(_) => Self::Any,
            PatternKind::Rest => Self::Any,
            PatternKind::Type { ty, .. } => Self::Tags(ty.tags().intersect(TypeTags(!TypeTags::NULL.0))),
            PatternKind::Literal(lit) => match LitKey::of_value(&lit.to_value()) {
                Some(key) => Self::Lit(key),
                None => Self::Opaque(pattern_tags(pattern)),
            },
            PatternKind::List(items) => {
                let rest_pos = items.iter().position(|p| matches!(p.kind, PatternKind::Rest));
                match rest_pos {
                    None => Self::List {
                        head: items.iter().map(Self::of).collect(),
                        tail: Vec::new(),
                        exact: true,
                    },
                    Some(pos) => Self::List {
                        head: items[..pos].iter().map(Self::of).collect(),
                        tail: items[pos + 1..].iter().map(Self::of).collect(),
                        exact: false,
                    },
                }
            }
            PatternKind::Map { entries, open } => Self::Map {
                entries: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), Self::of(v)))
                    .collect(),
                open: *open,
            },
            PatternKind::Regex { .. } => Self::Opaque(TypeTags::STR),
        }
    }

    /// The tags of values this shape can match.
    fn tags(&self) -> TypeTags {
        match self {
            Self::Any => TypeTags::ALL,
            Self::Tags(tags) | Self::Opaque(tags) => *tags,
            Self::Lit(key) => match key {
                LitKey::Null => TypeTags::NULL,
                LitKey::Bool(_) => TypeTags::BOOL,
                LitKey::Int(_) | LitKey::Dec(_) => TypeTags::NUMERIC,
                LitKey::Str(_) => TypeTags::STR,
            },
            Self::List { .. } => TypeTags::LIST,
            Self::Map { .. } => TypeTags::MAP,
        }
    }

    /// Whether this (unguarded, earlier) shape matches every value the
    /// later shape can match, within the subject's possible tags.
    /// Conservative: unknown means "not covered".
    fn covers(&self, other: &Self, subject_tags: TypeTags) -> bool {
        match (self, other) {
            (Self::Any, _) => true,
            (Self::Tags(tags), other) => {
                let effective = other.tags().intersect(subject_tags);
                !effective.is_empty() && effective.intersect(*tags) == effective
            }
            (Self::Lit(a), Self::Lit(b)) => a == b,
            (
                Self::List { head: ah, tail: at, exact: ae },
                Self::List { head: bh, tail: bt, exact: be },
            ) => Self::list_covers(ah, at, *ae, bh, bt, *be, subject_tags),
            (Self::Map { entries: ae, open: ao }, Self::Map { entries: be, open: bo }) => {
                Self::map_covers(ae, *ao, be, *bo, subject_tags)
            }
            _ => false,
        }
    }

    /// Whether this shape absorbs the whole residual of the subject (what
    /// a later `default` would need).
    fn covers_all_of(&self, subject_tags: TypeTags) -> bool {
        match self {
            Self::Any => true,
            Self::Tags(tags) => subject_tags.intersect(*tags) == subject_tags,
            _ => false,
        }
    }

    fn list_covers(
        a_head: &[Self],
        a_tail: &[Self],
        a_exact: bool,
        b_head: &[Self],
        b_tail: &[Self],
        b_exact: bool,
        subject_tags: TypeTags,
    ) -> bool {
        if a_exact {
            // fixed arity covers only the same fixed arity, element-wise
            return b_exact
                && b_tail.is_empty()
                && a_tail.is_empty()
                && a_head.len() == b_head.len()
                && a_head
                    .iter()
                    .zip(b_head)
                    .all(|(x, y)| x.covers(y, subject_tags));
        }
        if b_exact {
            // open vs fixed: the fixed list must be long enough and the
            // anchored head/tail elements must be covered
            let b_items: Vec<&Self> = b_head.iter().chain(b_tail).collect();
            if b_items.len() < a_head.len() + a_tail.len() {
                return false;
            }
            let head_ok = a_head
                .iter()
                .zip(b_items.iter())
                .all(|(x, y)| x.covers(y, subject_tags));
            let tail_ok = a_tail
                .iter()
                .rev()
                .zip(b_items.iter().rev())
                .all(|(x, y)| x.covers(y, subject_tags));
            return head_ok && tail_ok;
        }
        // open vs open: anchored prefixes/suffixes must cover and the
        // minimum length must not exceed the other's
        a_head.len() <= b_head.len()
            && a_tail.len() <= b_tail.len()
            && a_head
                .iter()
                .zip(b_head)
                .all(|(x, y)| x.covers(y, subject_tags))
            && a_tail
                .iter()
                .rev()
                .zip(b_tail.iter().rev())
                .all(|(x, y)| x.covers(y, subject_tags))
    }

    fn map_covers(
        a_entries: &[(String, Self)],
        a_open: bool,
        b_entries: &[(String, Self)],
        b_open: bool,
        subject_tags: TypeTags,
    ) -> bool {
        // every key the earlier pattern constrains must be present in the
        // later pattern and covered
        for (key, a_shape) in a_entries {
            let Some((_, b_shape)) = b_entries.iter().find(|(k, _)| k == key) else {
                return false;
            };
            if !a_shape.covers(b_shape, subject_tags) {
                return false;
            }
        }
        if a_open {
            return true;
        }
        // closed earlier pattern: the later one must constrain exactly the
        // same keys and also be closed
        !b_open && b_entries.len() == a_entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(i: i32) -> Shape {
        Shape::Lit(LitKey::Int(i64::from(i)))
    }

    #[test]
    fn any_covers_everything() {
        assert!(Shape::Any.covers(&lit(1), TypeTags::ALL));
        assert!(Shape::Any.covers(&Shape::Tags(TypeTags::STR), TypeTags::ALL));
    }

    #[test]
    fn type_shape_covers_relative_to_subject() {
        let int_shape = Shape::Tags(TypeTags::INT);
        // for an int subject, the literal 1 can only be an int
        assert!(int_shape.covers(&lit(1), TypeTags::INT));
        // for a def subject, 1 also matches longs and decimals
        assert!(!int_shape.covers(&lit(1), TypeTags::ALL));
    }

    #[test]
    fn exact_list_covers_same_arity_only() {
        let two_any = Shape::List { head: vec![Shape::Any, Shape::Any], tail: vec![], exact: true };
        let pair = Shape::List { head: vec![lit(1), Shape::Any], tail: vec![], exact: true };
        let triple = Shape::List {
            head: vec![Shape::Any, Shape::Any, Shape::Any],
            tail: vec![],
            exact: true,
        };
        assert!(two_any.covers(&pair, TypeTags::ALL));
        assert!(!two_any.covers(&triple, TypeTags::ALL));
        assert!(!pair.covers(&two_any, TypeTags::ALL));
    }

    #[test]
    fn open_list_covers_longer_fixed_lists() {
        let open = Shape::List { head: vec![lit(1)], tail: vec![], exact: false };
        let fixed = Shape::List { head: vec![lit(1), lit(2), lit(3)], tail: vec![], exact: true };
        assert!(open.covers(&fixed, TypeTags::ALL));
        let wrong_head = Shape::List { head: vec![lit(9), lit(2)], tail: vec![], exact: true };
        assert!(!open.covers(&wrong_head, TypeTags::ALL));
    }

    #[test]
    fn closed_map_requires_same_keys() {
        let a = Shape::Map { entries: vec![("a".into(), Shape::Any)], open: false };
        let same = Shape::Map { entries: vec![("a".into(), lit(1))], open: false };
        let extra = Shape::Map {
            entries: vec![("a".into(), lit(1)), ("b".into(), lit(2))],
            open: false,
        };
        assert!(a.covers(&same, TypeTags::ALL));
        assert!(!a.covers(&extra, TypeTags::ALL));
        let open = Shape::Map { entries: vec![("a".into(), Shape::Any)], open: true };
        assert!(open.covers(&extra, TypeTags::ALL));
    }
}
