//! The runtime value universe.
//!
//! Aggregates (lists, maps, instances) are shared mutable structures behind
//! `Rc<RefCell<…>>`; scalars are inline. Maps preserve insertion order.
//! Serde support exists so suspended executions can be checkpointed;
//! `Rc` sharing flattens on a round-trip, which is acceptable for
//! checkpoints (they only need self-contained restoration).

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt::{self, Display, Write};
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    decimal::Decimal,
    error::RuntimeError,
    types::Type,
};

/// Shared mutable list.
pub type ListRef = Rc<RefCell<Vec<Value>>>;
/// Shared mutable insertion-ordered map.
pub type MapRef = Rc<RefCell<IndexMap<Rc<str>, Value>>>;

/// Identifies the code a function value runs when invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuncTarget {
    /// A script-level function or closure, by index into the program.
    Script(u32),
    /// A method of a registered class, by class name and method index.
    Method { class: Rc<str>, index: u32 },
    /// A host-registered native function, by index into the context table.
    Native(u32),
}

/// A first-class function: target plus captured cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionValue {
    pub target: FuncTarget,
    /// Captured cells from enclosing scopes, in the order the function's
    /// capture list declares.
    pub captures: Vec<Value>,
    /// Bound receiver for method handles taken off an instance.
    pub receiver: Option<Value>,
}

/// A user-class instance: class name plus ordered fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub class: Rc<str>,
    pub fields: IndexMap<Rc<str>, Value>,
}

/// A runtime value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Decimal),
    Str(Rc<str>),
    Bytes(Rc<Vec<u8>>),
    List(ListRef),
    Map(MapRef),
    Instance(Rc<RefCell<Instance>>),
    Function(Rc<FunctionValue>),
    /// A heap box for a local captured by a closure. Never observable from
    /// script code; loads and stores through the slot dereference it.
    Cell(Rc<RefCell<Value>>),
}

impl Value {
    #[must_use]
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Self::Str(s.into())
    }

    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    #[must_use]
    pub fn map(entries: IndexMap<Rc<str>, Self>) -> Self {
        Self::Map(Rc::new(RefCell::new(entries)))
    }

    /// The runtime counterpart of `Type::tags`.
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
            Self::Bytes(_) => Type::Bytes,
            Self::List(_) => Type::List,
            Self::Map(_) => Type::Map,
            Self::Instance(inst) => Type::Instance(inst.borrow().class.clone()),
            Self::Function(_) => Type::Function,
            Self::Cell(cell) => cell.borrow().type_of(),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Truthiness: null and zero and empty aggregates are false.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(v) => *v != 0,
            Self::Long(v) => *v != 0,
            Self::Double(v) => *v != 0.0,
            Self::Decimal(d) => !d.is_zero(),
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::List(l) => !l.borrow().is_empty(),
            Self::Map(m) => !m.borrow().is_empty(),
            Self::Instance(_) | Self::Function(_) => true,
            Self::Cell(cell) => cell.borrow().truthy(),
        }
    }

    // ---- numeric promotion -------------------------------------------------

    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(f64::from(*v)),
            Self::Long(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Decimal(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Int(v) => Some(Decimal::from_i64(i64::from(*v))),
            Self::Long(v) => Some(Decimal::from_i64(*v)),
            Self::Double(v) => Decimal::from_f64(*v),
            Self::Decimal(d) => Some(d.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Long(_) | Self::Double(_) | Self::Decimal(_))
    }

    /// Numeric equality across widths: `1 == 1L == 1.0 == 1.00`.
    ///
    /// Non-numeric comparison is structural for lists/maps, textual for
    /// strings, identity-free otherwise.
    #[must_use]
    pub fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cell(a), b) => a.borrow().loose_eq(b),
            (a, Self::Cell(b)) => a.loose_eq(&b.borrow()),
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => match (a, b) {
                (Self::Decimal(_), _) | (_, Self::Decimal(_)) => {
                    match (a.as_decimal(), b.as_decimal()) {
                        (Some(x), Some(y)) => x == y,
                        _ => false,
                    }
                }
                (Self::Double(_), _) | (_, Self::Double(_)) => {
                    a.as_f64().expect("numeric") == b.as_f64().expect("numeric")
                }
                _ => a.as_i64().expect("numeric") == b.as_i64().expect("numeric"),
            },
            (Self::List(a), Self::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.loose_eq(y))
            }
            (Self::Map(a), Self::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.loose_eq(w)))
            }
            (Self::Instance(a), Self::Instance(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Ordering for `<`/`<=`/`>`/`>=`; numeric across widths, lexicographic
    /// for strings.
    pub fn loose_cmp(&self, other: &Self) -> Result<Ordering, RuntimeError> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Ok(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => match (a, b) {
                (Self::Decimal(_), _) | (_, Self::Decimal(_)) => {
                    let (x, y) = (a.as_decimal(), b.as_decimal());
                    match (x, y) {
                        (Some(x), Some(y)) => Ok(x.cmp(&y)),
                        _ => Err(RuntimeError::general("cannot compare non-finite double")),
                    }
                }
                (Self::Double(_), _) | (_, Self::Double(_)) => {
                    let (x, y) = (a.as_f64().expect("numeric"), b.as_f64().expect("numeric"));
                    x.partial_cmp(&y)
                        .ok_or_else(|| RuntimeError::general("cannot compare NaN"))
                }
                _ => Ok(a.as_i64().expect("numeric").cmp(&b.as_i64().expect("numeric"))),
            },
            (a, b) => Err(RuntimeError::general(format!(
                "cannot compare {} to {}",
                a.type_of(),
                b.type_of()
            ))),
        }
    }

    fn arith_error(op: &str, a: &Self, b: &Self) -> RuntimeError {
        RuntimeError::general(format!(
            "non-numeric operand for '{op}': {} and {}",
            a.type_of(),
            b.type_of()
        ))
    }

    /// Addition with string concatenation and list append semantics.
    pub fn add(&self, other: &Self) -> Result<Self, RuntimeError> {
        match (self, other) {
            (Self::Str(a), b) => Ok(Self::string(format!("{a}{}", b.display_string()))),
            (a, Self::Str(b)) => Ok(Self::string(format!("{}{b}", a.display_string()))),
            (Self::List(a), Self::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Self::list(items))
            }
            (Self::List(a), b) => {
                let mut items = a.borrow().clone();
                items.push(b.clone());
                Ok(Self::list(items))
            }
            (Self::Map(a), Self::Map(b)) => {
                let mut entries = a.borrow().clone();
                for (k, v) in b.borrow().iter() {
                    entries.insert(k.clone(), v.clone());
                }
                Ok(Self::map(entries))
            }
            _ => self.numeric_op("+", other, i32::wrapping_add, i64::wrapping_add, |a, b| a + b, |a, b| {
                Some(a.add(b))
            }),
        }
    }

    pub fn sub(&self, other: &Self) -> Result<Self, RuntimeError> {
        self.numeric_op("-", other, i32::wrapping_sub, i64::wrapping_sub, |a, b| a - b, |a, b| {
            Some(a.sub(b))
        })
    }

    pub fn mul(&self, other: &Self) -> Result<Self, RuntimeError> {
        self.numeric_op("*", other, i32::wrapping_mul, i64::wrapping_mul, |a, b| a * b, |a, b| {
            Some(a.mul(b))
        })
    }

    pub fn div(&self, other: &Self) -> Result<Self, RuntimeError> {
        if other.is_numeric() && !matches!(other, Self::Double(_)) {
            let zero = match other {
                Self::Int(v) => *v == 0,
                Self::Long(v) => *v == 0,
                Self::Decimal(d) => d.is_zero(),
                _ => false,
            };
            if zero {
                return Err(RuntimeError::general("divide by zero"));
            }
        }
        self.numeric_op("/", other, i32::wrapping_div, i64::wrapping_div, |a, b| a / b, |a, b| {
            a.div(b)
        })
    }

    pub fn rem(&self, other: &Self) -> Result<Self, RuntimeError> {
        if matches!(other, Self::Int(0) | Self::Long(0)) {
            return Err(RuntimeError::general("divide by zero"));
        }
        self.numeric_op("%", other, i32::wrapping_rem, i64::wrapping_rem, |a, b| a % b, |a, b| {
            a.rem(b)
        })
    }

    fn numeric_op(
        &self,
        op: &str,
        other: &Self,
        int_op: fn(i32, i32) -> i32,
        long_op: fn(i64, i64) -> i64,
        double_op: fn(f64, f64) -> f64,
        decimal_op: fn(&Decimal, &Decimal) -> Option<Decimal>,
    ) -> Result<Self, RuntimeError> {
        if !self.is_numeric() || !other.is_numeric() {
            return Err(Self::arith_error(op, self, other));
        }
        match (self, other) {
            (Self::Decimal(_), _) | (_, Self::Decimal(_)) => {
                let (a, b) = (self.as_decimal(), other.as_decimal());
                match (a, b) {
                    (Some(a), Some(b)) => decimal_op(&a, &b)
                        .map(Self::Decimal)
                        .ok_or_else(|| RuntimeError::general("divide by zero")),
                    _ => Err(Self::arith_error(op, self, other)),
                }
            }
            (Self::Double(_), _) | (_, Self::Double(_)) => Ok(Self::Double(double_op(
                self.as_f64().expect("numeric"),
                other.as_f64().expect("numeric"),
            ))),
            (Self::Long(_), _) | (_, Self::Long(_)) => Ok(Self::Long(long_op(
                self.as_i64().expect("numeric"),
                other.as_i64().expect("numeric"),
            ))),
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(int_op(*a, *b))),
            _ => Err(Self::arith_error(op, self, other)),
        }
    }

    pub fn negate(&self) -> Result<Self, RuntimeError> {
        match self {
            Self::Int(v) => Ok(Self::Int(v.wrapping_neg())),
            Self::Long(v) => Ok(Self::Long(v.wrapping_neg())),
            Self::Double(v) => Ok(Self::Double(-v)),
            Self::Decimal(d) => Ok(Self::Decimal(d.neg())),
            _ => Err(RuntimeError::general(format!(
                "cannot negate {}",
                self.type_of()
            ))),
        }
    }

    /// The string a value interpolates as: strings bare, everything else in
    /// its display form.
    #[must_use]
    pub fn display_string(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            other => other.to_string(),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "byte[{}]", b.len()),
            Self::List(items) => {
                f.write_char('[')?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_element(f, item)?;
                }
                f.write_char(']')
            }
            Self::Map(entries) => {
                let entries = entries.borrow();
                if entries.is_empty() {
                    return f.write_str("[:]");
                }
                f.write_char('[')?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}:")?;
                    write_element(f, v)?;
                }
                f.write_char(']')
            }
            Self::Instance(inst) => {
                let inst = inst.borrow();
                write!(f, "{}@{{", inst.class)?;
                for (i, (k, v)) in inst.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}:")?;
                    write_element(f, v)?;
                }
                f.write_char('}')
            }
            Self::Function(_) => write!(f, "<function>"),
            Self::Cell(cell) => write!(f, "{}", cell.borrow()),
        }
    }
}

/// Inside containers, strings render quoted.
fn write_element(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Str(s) => write!(f, "'{s}'"),
        other => write!(f, "{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_crosses_numeric_widths() {
        assert!(Value::Int(1).loose_eq(&Value::Long(1)));
        assert!(Value::Int(1).loose_eq(&Value::Double(1.0)));
        assert!(Value::Int(1).loose_eq(&Value::Decimal("1.00".parse().unwrap())));
        assert!(!Value::Int(1).loose_eq(&Value::Decimal("1.01".parse().unwrap())));
        assert!(!Value::Int(1).loose_eq(&Value::string("1")));
    }

    #[test]
    fn int_arithmetic_stays_int_until_widened() {
        assert!(matches!(Value::Int(2).add(&Value::Int(3)), Ok(Value::Int(5))));
        assert!(matches!(Value::Int(2).add(&Value::Long(3)), Ok(Value::Long(5))));
        assert!(matches!(
            Value::Int(1).add(&Value::Decimal("0.5".parse().unwrap())),
            Ok(Value::Decimal(_))
        ));
    }

    #[test]
    fn string_plus_anything_concatenates() {
        let v = Value::string("n=").add(&Value::Int(3)).unwrap();
        assert_eq!(v.display_string(), "n=3");
    }

    #[test]
    fn list_display_quotes_strings() {
        let v = Value::list(vec![Value::Int(1), Value::string("a")]);
        assert_eq!(v.to_string(), "[1, 'a']");
    }

    #[test]
    fn divide_by_zero_is_an_error() {
        assert!(Value::Int(1).div(&Value::Int(0)).is_err());
        assert!(Value::Int(1).rem(&Value::Long(0)).is_err());
    }

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::string("").truthy());
        assert!(Value::string("x").truthy());
        assert!(!Value::list(vec![]).truthy());
    }
}
