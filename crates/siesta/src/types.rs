//! Static types assigned by the resolver and consumed by the switch
//! analyser and the code generator.

use std::fmt::{self, Display};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// A static type tag.
///
/// `Def` is the dynamic type: the value is only known at run time. All other
/// tags correspond one-to-one with runtime value tags, except `Array` which
/// shares the list representation at run time and only differs statically
/// (it carries an element type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Bool,
    Int,
    Long,
    Double,
    Decimal,
    Str,
    Bytes,
    List,
    Array(Box<Type>),
    Map,
    Instance(Rc<str>),
    Function,
    Null,
    Def,
}

/// Bit set of runtime value tags, used for pattern/subject compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeTags(pub u16);

impl TypeTags {
    pub const BOOL: Self = Self(1 << 0);
    pub const INT: Self = Self(1 << 1);
    pub const LONG: Self = Self(1 << 2);
    pub const DOUBLE: Self = Self(1 << 3);
    pub const DECIMAL: Self = Self(1 << 4);
    pub const STR: Self = Self(1 << 5);
    pub const BYTES: Self = Self(1 << 6);
    pub const LIST: Self = Self(1 << 7);
    pub const MAP: Self = Self(1 << 8);
    pub const INSTANCE: Self = Self(1 << 9);
    pub const FUNCTION: Self = Self(1 << 10);
    pub const NULL: Self = Self(1 << 11);
    /// Every tag: the set for a `def` subject.
    pub const ALL: Self = Self((1 << 12) - 1);
    pub const NUMERIC: Self =
        Self(Self::INT.0 | Self::LONG.0 | Self::DOUBLE.0 | Self::DECIMAL.0);

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        !self.intersect(other).is_empty()
    }
}

impl Type {
    /// The runtime tags a value of this static type may carry.
    ///
    /// Reference types include `NULL` because their variables may hold null;
    /// primitives never do.
    #[must_use]
    pub fn tags(&self) -> TypeTags {
        match self {
            Self::Bool => TypeTags::BOOL,
            Self::Int => TypeTags::INT,
            Self::Long => TypeTags::LONG,
            Self::Double => TypeTags::DOUBLE,
            Self::Decimal => TypeTags::DECIMAL.union(TypeTags::NULL),
            Self::Str => TypeTags::STR.union(TypeTags::NULL),
            Self::Bytes => TypeTags::BYTES.union(TypeTags::NULL),
            Self::List | Self::Array(_) => TypeTags::LIST.union(TypeTags::NULL),
            Self::Map => TypeTags::MAP.union(TypeTags::NULL),
            Self::Instance(_) => TypeTags::INSTANCE.union(TypeTags::NULL),
            Self::Function => TypeTags::FUNCTION.union(TypeTags::NULL),
            Self::Null => TypeTags::NULL,
            Self::Def => TypeTags::ALL,
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::Long | Self::Double | Self::Decimal)
    }

    /// True for types stored in the primitive (i64) local bank.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::Bool | Self::Int | Self::Long | Self::Double)
    }

    /// The smallest type a value of either input type fits, used for the
    /// static type of a switch expression (join of all case results) and of
    /// ternaries. Falls back to `Def` when no single tag works.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        if self == other {
            return self.clone();
        }
        match (self, other) {
            (Self::Null, t) | (t, Self::Null) if !t.is_primitive() => t.clone(),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                if matches!(a, Self::Decimal) || matches!(b, Self::Decimal) {
                    Self::Decimal
                } else if matches!(a, Self::Double) || matches!(b, Self::Double) {
                    Self::Double
                } else if matches!(a, Self::Long) || matches!(b, Self::Long) {
                    Self::Long
                } else {
                    Self::Int
                }
            }
            (Self::List, Self::Array(_)) | (Self::Array(_), Self::List) => Self::List,
            _ => Self::Def,
        }
    }

    /// Parses a builtin type name as written in source. Class names are
    /// resolved separately by the resolver.
    #[must_use]
    pub fn from_builtin_name(name: &str) -> Option<Self> {
        let ty = match name {
            "String" => Self::Str,
            "Decimal" => Self::Decimal,
            "List" => Self::List,
            "Map" => Self::Map,
            _ => return None,
        };
        Some(ty)
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "boolean"),
            Self::Int => write!(f, "int"),
            Self::Long => write!(f, "long"),
            Self::Double => write!(f, "double"),
            Self::Decimal => write!(f, "Decimal"),
            Self::Str => write!(f, "String"),
            Self::Bytes => write!(f, "byte[]"),
            Self::List => write!(f, "List"),
            Self::Array(elem) => write!(f, "{elem}[]"),
            Self::Map => write!(f, "Map"),
            Self::Instance(name) => write!(f, "{name}"),
            Self::Function => write!(f, "Function"),
            Self::Null => write!(f, "null"),
            Self::Def => write!(f, "def"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_tags_do_not_include_null() {
        assert!(!Type::Int.tags().intersects(TypeTags::NULL));
        assert!(Type::Str.tags().intersects(TypeTags::NULL));
    }

    #[test]
    fn numeric_join_picks_the_wider_type() {
        assert_eq!(Type::Int.join(&Type::Long), Type::Long);
        assert_eq!(Type::Long.join(&Type::Decimal), Type::Decimal);
        assert_eq!(Type::Int.join(&Type::Str), Type::Def);
    }

    #[test]
    fn int_and_long_do_not_overlap() {
        assert!(!Type::Int.tags().intersects(Type::Long.tags()));
    }
}
