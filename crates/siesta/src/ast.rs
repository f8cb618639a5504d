//! The expression tree.
//!
//! There is one node universe: statements are expressions whose results are
//! unused. Every node carries its source range plus three annotations the
//! resolver and analyser fill in: the static type, whether the expression
//! may suspend (`is_async`), and whether its result is consumed
//! (`is_result_used`).

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    decimal::Decimal,
    error::CodeRange,
    types::Type,
    value::Value,
};

/// A compile-time constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Decimal),
    Str(Rc<str>),
}

impl Literal {
    #[must_use]
    pub fn type_of(&self) -> Type {
        match self {
            Self::Null => Type::Null,
            Self::Bool(_) => Type::Bool,
            Self::Int(_) => Type::Int,
            Self::Long(_) => Type::Long,
            Self::Double(_) => Type::Double,
            Self::Decimal(_) => Type::Decimal,
            Self::Str(_) => Type::Str,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(v) => Value::Int(*v),
            Self::Long(v) => Value::Long(*v),
            Self::Double(v) => Value::Double(*v),
            Self::Decimal(d) => Value::Decimal(d.clone()),
            Self::Str(s) => Value::Str(s.clone()),
        }
    }
}

/// Where an identifier resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VarTarget {
    /// Not yet resolved.
    #[default]
    Unresolved,
    /// A slot in the enclosing function's frame. Whether the slot holds a
    /// heap cell is a property of the function (`slot_kinds`), not of the
    /// occurrence: capture sites later in the body retroactively box a
    /// slot, so the code generator consults the finished layout.
    Local { slot: u16 },
    /// An entry in the function's capture list (a cell).
    Capture { index: u16 },
    /// A global, looked up by name at run time.
    Global,
}

/// An identifier occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ident {
    pub name: Rc<str>,
    pub target: VarTarget,
}

impl Ident {
    #[must_use]
    pub fn new(name: Rc<str>) -> Self {
        Self { name, target: VarTarget::Unresolved }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    /// Elvis: left unless it is null/false-y, else right.
    Elvis,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

/// One piece of an interpolated string or regex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StringPart {
    Text(Rc<str>),
    Interp(Box<Expr>),
}

/// One argument at a call site. `name` is set for named arguments, which
/// the resolver maps onto parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arg {
    pub name: Option<Rc<str>>,
    pub expr: Expr,
}

/// A map-literal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapEntry {
    pub key: Rc<str>,
    pub value: Expr,
}

/// How the resolver classified a call's target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallTarget {
    #[default]
    Unresolved,
    /// A script-level function, by program function index.
    Script(u32),
    /// A host-registered native function, by context table index.
    Native(u32),
    /// Target is a runtime value (closure variable, method handle).
    Dynamic,
}

/// Storage classification of a frame slot. Primitive kinds live in the i64
/// bank of a continuation snapshot; `Obj` and `Cell` go in the object bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    PrimBool,
    PrimInt,
    PrimLong,
    PrimDouble,
    Obj,
    Cell,
}

impl SlotKind {
    #[must_use]
    pub fn for_type(ty: &Type) -> Self {
        match ty {
            Type::Bool => Self::PrimBool,
            Type::Int => Self::PrimInt,
            Type::Long => Self::PrimLong,
            Type::Double => Self::PrimDouble,
            _ => Self::Obj,
        }
    }

    #[must_use]
    pub fn is_primitive(self) -> bool {
        !matches!(self, Self::Obj | Self::Cell)
    }
}

/// What a nested function captures from its enclosing frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureSource {
    /// A cell slot of the directly enclosing frame.
    EnclosingLocal(u16),
    /// A cell the enclosing function itself captured (transitive capture).
    EnclosingCapture(u16),
}

/// A declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: Rc<str>,
    pub ty: Type,
    pub default: Option<Expr>,
}

/// A function or closure declaration.
///
/// Parsed with just name/params/body; the resolver fills in the frame
/// layout, capture list, and asyncness, and the code generator reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: Rc<str>,
    pub params: Vec<Param>,
    pub return_ty: Type,
    pub body: Box<Expr>,
    /// True for closures with no declared parameters, which receive `it`.
    pub implicit_it: bool,

    // ---- filled in by the resolver ----
    /// Program-wide function index.
    pub id: u32,
    /// For named declarations: the local slot holding the closure value.
    pub decl_slot: Option<u16>,
    /// Cells to capture from the enclosing frame at creation time.
    pub captures: Vec<CaptureSource>,
    /// Storage kind of every frame slot, in slot order.
    pub slot_kinds: Vec<SlotKind>,
    /// Hidden slot holding the latest regex match captures, if the body
    /// needs one.
    pub match_slot: Option<u16>,
    /// Whether any expression in the body may suspend.
    pub is_async: bool,
}

impl FunctionDecl {
    #[must_use]
    pub fn new(name: Rc<str>, params: Vec<Param>, return_ty: Type, body: Box<Expr>, implicit_it: bool) -> Self {
        Self {
            name,
            params,
            return_ty,
            body,
            implicit_it,
            id: 0,
            decl_slot: None,
            captures: Vec::new(),
            slot_kinds: Vec::new(),
            match_slot: None,
            is_async: false,
        }
    }
}

/// A field of a class declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: Rc<str>,
    pub ty: Type,
    pub init: Option<Expr>,
}

/// A class declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDeclNode {
    pub name: Rc<str>,
    /// Superclass as written; the resolver expands it to the full name.
    pub superclass: Option<Rc<str>>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<FunctionDecl>,
}

/// A pattern within a switch case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub range: CodeRange,
    pub kind: PatternKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PatternKind {
    /// A constant to compare against, with numeric widening.
    Literal(Literal),
    /// `_`: matches one value, binds nothing.
    Wildcard,
    /// `*`: matches any run of elements (lists) or any residual entries
    /// (maps). At most one per list pattern.
    Rest,
    /// A type test, optionally binding the matched value: `int x`, `Foo f`.
    Type { ty: Type, binding: Option<Ident> },
    /// A bare lowercase identifier: binds anything; a repeat of the same
    /// name within one case becomes an equality test.
    Binding(Ident),
    /// `[p, …]` — list or array destructure.
    List(Vec<Pattern>),
    /// `[k:p, …]` — map destructure. `open` when a `*` entry allows
    /// residual keys.
    Map { entries: Vec<(Rc<str>, Pattern)>, open: bool },
    /// `/…/r` — regex find over a string subject.
    Regex { pattern: Rc<str>, case_insensitive: bool },
}

/// A binding variable introduced by a case, resolved to a frame slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSlot {
    pub name: Rc<str>,
    pub slot: u16,
    pub ty: Type,
}

/// One alternative of a case: a pattern with its own optional guard.
///
/// `1 if it != 2, 2 if it == 2, 3 => r` is one case with three
/// alternatives, two of them guarded. All alternatives share the case's
/// binding slots and result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasePattern {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
}

/// One case of a switch: alternation of guarded patterns plus a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub range: CodeRange,
    pub patterns: Vec<CasePattern>,
    pub result: Expr,
    /// True for `default`. A bare unguarded `_` is normalised to this too.
    pub is_default: bool,
    /// Binding variables of this case, filled by the resolver.
    pub bindings: SmallVec<[BindingSlot; 2]>,
}

/// Lowering strategy the analyser selects for a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwitchStrategy {
    /// Test cases one after another.
    #[default]
    Sequential,
    /// All cases are primitive literals: dispatch through a hash table.
    TableLookup,
}

/// An expression node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub range: CodeRange,
    pub kind: ExprKind,
    /// Static type; `Type::Def` until the resolver narrows it.
    pub ty: Type,
    /// True when this expression may suspend execution.
    pub is_async: bool,
    /// True when the value of this expression is consumed.
    pub is_result_used: bool,
}

impl Expr {
    #[must_use]
    pub fn new(range: CodeRange, kind: ExprKind) -> Self {
        Self {
            range,
            kind,
            ty: Type::Def,
            is_async: false,
            is_result_used: true,
        }
    }

    /// A no-op expression used where a node is required but nothing runs.
    #[must_use]
    pub fn noop(range: CodeRange) -> Self {
        Self::new(range, ExprKind::Noop)
    }
}

/// The expression variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExprKind {
    Literal(Literal),
    ListLiteral(Vec<Expr>),
    MapLiteral(Vec<MapEntry>),
    /// Interpolated string: text and expression parts concatenated.
    ExprString(Vec<StringPart>),
    Identifier(Ident),
    /// `it` — the implicit parameter / switch subject.
    ItVar(Ident),
    /// `$1` … `$9` — regex capture reference.
    CaptureVar(u8),
    /// A type used in expression position (cast source, instanceof rhs).
    TypeExpr(Type),
    /// A package-qualified class reference such as `a.b.Foo`.
    ClassPath { name: Rc<str> },

    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// `expr as T` — converting cast (numeric conversion, to-string, …).
    Cast {
        target: Type,
        expr: Box<Expr>,
    },
    /// Runtime-checked downcast inserted by the resolver.
    CheckCast {
        target: Type,
        expr: Box<Expr>,
    },
    InstanceOf {
        expr: Box<Expr>,
        target: Type,
        negated: bool,
    },

    /// Field read: `x.name` / `x?.name`.
    Field {
        receiver: Box<Expr>,
        name: Rc<str>,
        safe: bool,
    },
    /// Indexed read: `x[i]`.
    ArrayGet {
        receiver: Box<Expr>,
        index: Box<Expr>,
    },
    /// `x.size()` on lists/arrays lowers to this.
    ArrayLength {
        receiver: Box<Expr>,
    },

    Call {
        function: Box<Expr>,
        args: Vec<Arg>,
        target: CallTarget,
        /// Whether this call site itself may suspend (callee is async, or a
        /// parameter marked async-when-async received an async argument).
        /// Finalised by the analyser; distinct from `is_async`, which is
        /// also true when only an argument suspends.
        suspends: bool,
    },
    MethodCall {
        receiver: Box<Expr>,
        name: Rc<str>,
        args: Vec<Arg>,
        safe: bool,
    },
    /// `new Foo(args)` as parsed.
    InvokeNew {
        class: Rc<str>,
        args: Vec<Arg>,
    },
    /// Resolved constructor invocation (class verified to exist).
    InvokeInit {
        class: Rc<str>,
        args: Vec<Arg>,
    },

    VarDecl {
        name: Rc<str>,
        declared_ty: Type,
        init: Option<Box<Expr>>,
        /// Resolved target (top-level REPL declarations become globals).
        target: VarTarget,
    },
    VarAssign {
        ident: Ident,
        value: Box<Expr>,
    },
    /// Assignment through a receiver: `x.f = v` or `x[i] = v`.
    FieldAssign {
        receiver: Box<Expr>,
        field: FieldKey,
        value: Box<Expr>,
    },

    Block(Block),
    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },
    While {
        cond: Box<Expr>,
        body: Box<Expr>,
    },
    Return {
        value: Option<Box<Expr>>,
    },

    Closure {
        func: Box<FunctionDecl>,
    },
    FunDecl {
        func: Box<FunctionDecl>,
    },
    ClassDecl {
        class: Box<ClassDeclNode>,
    },

    Switch {
        /// Omitted subject means `it`.
        subject: Option<Box<Expr>>,
        cases: Vec<SwitchCase>,
        /// Hidden slot the subject is stored into so `it` and guards can
        /// reach it; set by the resolver.
        subject_slot: u16,
        /// Lowering hint chosen by the analyser.
        strategy: SwitchStrategy,
    },

    /// `x =~ /…/` (or `!~`). A bare regex in condition position matches
    /// against `it`.
    RegexMatch {
        target: Option<Box<Expr>>,
        pattern: Vec<StringPart>,
        case_insensitive: bool,
        negated: bool,
    },
    /// `x =~ s/…/…/g`
    RegexSubst {
        target: Box<Expr>,
        pattern: Vec<StringPart>,
        replacement: Vec<StringPart>,
        case_insensitive: bool,
        global: bool,
    },

    Print {
        value: Box<Expr>,
        newline: bool,
    },
    Die {
        value: Option<Box<Expr>>,
    },
    /// `eval(str)` — compile and run source at run time.
    Eval {
        source: Box<Expr>,
    },
    Noop,
}

/// Assignment destination through a receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldKey {
    Name(Rc<str>),
    Index(Box<Expr>),
}

/// A statement sequence; its value is the last statement's value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub range: CodeRange,
    pub stmts: Vec<Expr>,
}

/// A parsed compilation unit before resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedScript {
    pub package: Option<Rc<str>>,
    /// `import a.b.Foo` entries: (simple name, full name).
    pub imports: Vec<(Rc<str>, Rc<str>)>,
    pub body: Block,
}
