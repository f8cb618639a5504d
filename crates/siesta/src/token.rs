//! Token definitions for the lexer.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::CodeRange;

/// A raw piece of an interpolated literal (string or regex).
///
/// The lexer does not recurse into `$name` / `${expr}` holes; it records the
/// raw expression text together with its source position and the parser runs
/// a sub-parse over it. This keeps the lexer a single forward scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawStringPart {
    /// Literal text with escapes already processed.
    Text(String),
    /// An interpolation hole: the raw expression source and where it starts.
    Interp { source: String, range: CodeRange },
}

/// The kind of a lexed token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenKind {
    // literals
    IntLit(i32),
    LongLit(i64),
    DoubleLit(f64),
    /// Fractional literal without a width suffix; kept as text so the parser
    /// can build an exact decimal.
    DecimalLit(String),
    /// Single-quoted string: no interpolation.
    StringLit(Rc<str>),
    /// Double-quoted string with interpolation holes.
    ExprStringLit(Vec<RawStringPart>),
    /// Regex literal `/…/mods` with interpolation holes in the pattern.
    RegexLit { parts: Vec<RawStringPart>, modifiers: String },
    /// Substitution literal `s/…/…/mods`.
    RegexSubstLit {
        pattern: Vec<RawStringPart>,
        replacement: Vec<RawStringPart>,
        modifiers: String,
    },

    Identifier(Rc<str>),
    /// `$1` … `$9`: regex capture reference.
    CaptureVar(u8),

    // keywords
    Def,
    True,
    False,
    Null,
    If,
    Else,
    While,
    Return,
    Switch,
    Default,
    Instanceof,
    As,
    New,
    Class,
    Extends,
    Package,
    Import,
    Print,
    Println,
    Die,
    // primitive type keywords
    Int,
    Long,
    Double,
    Boolean,

    // punctuation and operators
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Semicolon,
    NewLine,
    Colon,
    Dot,
    QuestionDot,
    Question,
    QuestionColon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Equal,
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    AmpAmp,
    PipePipe,
    Bang,
    Arrow,
    FatArrow,
    MatchOp,
    NotMatchOp,
    Underscore,

    Eof,
}

impl TokenKind {
    /// Keyword lookup for an identifier-shaped word.
    #[must_use]
    pub fn keyword(word: &str) -> Option<Self> {
        let kind = match word {
            "def" => Self::Def,
            "true" => Self::True,
            "false" => Self::False,
            "null" => Self::Null,
            "if" => Self::If,
            "else" => Self::Else,
            "while" => Self::While,
            "return" => Self::Return,
            "switch" => Self::Switch,
            "default" => Self::Default,
            "instanceof" => Self::Instanceof,
            "as" => Self::As,
            "new" => Self::New,
            "class" => Self::Class,
            "extends" => Self::Extends,
            "package" => Self::Package,
            "import" => Self::Import,
            "print" => Self::Print,
            "println" => Self::Println,
            "die" => Self::Die,
            "int" => Self::Int,
            "long" => Self::Long,
            "double" => Self::Double,
            "boolean" => Self::Boolean,
            "_" => Self::Underscore,
            _ => return None,
        };
        Some(kind)
    }

    /// True when a `/` following this token should be read as division
    /// rather than the start of a regex literal.
    #[must_use]
    pub fn ends_value(&self) -> bool {
        matches!(
            self,
            Self::IntLit(_)
                | Self::LongLit(_)
                | Self::DoubleLit(_)
                | Self::DecimalLit(_)
                | Self::StringLit(_)
                | Self::ExprStringLit(_)
                | Self::Identifier(_)
                | Self::CaptureVar(_)
                | Self::True
                | Self::False
                | Self::Null
                | Self::RightParen
                | Self::RightBracket
        )
    }
}

/// A token with its source range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub range: CodeRange,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, range: CodeRange) -> Self {
        Self { kind, range }
    }
}
