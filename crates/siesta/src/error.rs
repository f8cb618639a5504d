//! Error types surfaced to embedders.
//!
//! Two error families cross the public boundary: `CompileError` for anything
//! the frontend rejects (lexing, parsing, resolution, switch analysis) and
//! `RuntimeError` for faults during execution. Suspension is not an error and
//! never travels through these types; see `vm::FrameExit`.

use std::fmt::{self, Display, Write};

use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString, IntoStaticStr};

/// A half-open source range with the line/column of its start.
///
/// Offsets are byte offsets into the original source. Lines and columns are
/// 1-based and refer to characters, which is what error carets want.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeRange {
    pub offset: u32,
    pub len: u32,
    pub line: u32,
    pub column: u32,
}

impl CodeRange {
    #[must_use]
    pub fn new(offset: u32, len: u32, line: u32, column: u32) -> Self {
        Self { offset, len, line, column }
    }

    /// Extends this range to cover `other` as well.
    #[must_use]
    pub fn to(self, other: Self) -> Self {
        let end = (other.offset + other.len).max(self.offset + self.len);
        Self {
            offset: self.offset,
            len: end - self.offset,
            line: self.line,
            column: self.column,
        }
    }
}

/// Renders the offending source line with a caret under the error column.
fn write_caret_line(f: &mut impl Write, source: &str, range: CodeRange) -> fmt::Result {
    let Some(line_text) = source.lines().nth(range.line.saturating_sub(1) as usize) else {
        return Ok(());
    };
    writeln!(f, "{line_text}")?;
    for _ in 1..range.column {
        f.write_char(' ')?;
    }
    writeln!(f, "^")
}

/// An error produced while turning source text into runnable code.
///
/// Compilation never recovers: the first error aborts the pipeline and is
/// returned to the embedder. The message always contains the diagnostic
/// text; `source`/`range` allow the classic line-plus-caret rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileError {
    pub message: String,
    pub script_name: String,
    pub source: String,
    pub range: CodeRange,
}

impl CompileError {
    pub fn new(message: impl Into<String>, range: CodeRange) -> Self {
        Self {
            message: message.into(),
            script_name: String::new(),
            source: String::new(),
            range,
        }
    }

    /// Attaches the script name and source text used for rendering.
    #[must_use]
    pub fn with_source(mut self, script_name: &str, source: &str) -> Self {
        self.script_name = script_name.to_owned();
        self.source = source.to_owned();
        self
    }
}

impl Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} @ line {},column {}",
            self.script_name, self.message, self.range.line, self.range.column
        )?;
        write_caret_line(f, &self.source, self.range)
    }
}

impl std::error::Error for CompileError {}

/// The kind of a runtime fault.
///
/// `Null` is kept distinct from `General` because safe-navigation regions
/// short-circuit null dereferences locally; the kind only becomes visible to
/// the host when nothing intercepted it. `Internal` marks interpreter
/// invariant violations such as a corrupted continuation location.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
pub enum RuntimeErrorKind {
    /// Value-domain violation: bad cast, bad index, division by zero.
    General,
    /// Null value where an object was required.
    Null,
    /// Script-initiated abort via `die`.
    Die,
    /// Interpreter invariant violation; indicates a bug, not user error.
    Internal,
}

/// A fault raised during script execution.
///
/// Carries the source range captured at the nearest statement so the host
/// can render a caret into the original script text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub script_name: String,
    pub source: String,
    pub range: CodeRange,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            script_name: String::new(),
            source: String::new(),
            range: CodeRange::default(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::General, message)
    }

    pub fn null(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Null, message)
    }

    pub fn die(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Die, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Internal, message)
    }

    /// Returns true for null-dereference faults, which safe-navigation
    /// regions intercept.
    #[must_use]
    pub fn is_null_error(&self) -> bool {
        self.kind == RuntimeErrorKind::Null
    }

    /// Fills in location metadata if the error does not have any yet.
    ///
    /// Errors keep the range closest to where they were raised; outer frames
    /// must not overwrite it.
    #[must_use]
    pub fn with_location(mut self, script_name: &str, source: &str, range: CodeRange) -> Self {
        if self.range == CodeRange::default() {
            self.script_name = script_name.to_owned();
            self.source = source.to_owned();
            self.range = range;
        }
        self
    }
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} @ line {},column {}",
            self.message, self.range.line, self.range.column
        )?;
        write_caret_line(f, &self.source, self.range)
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caret_points_at_error_column() {
        let source = "def x = 1\ndef y = z + 1\n";
        let err = CompileError::new(
            "variable 'z' is not defined",
            CodeRange::new(18, 1, 2, 9),
        )
        .with_source("test.siesta", source);
        let rendered = err.to_string();
        assert!(rendered.contains("def y = z + 1"));
        assert!(rendered.contains("        ^"));
        assert!(rendered.contains("line 2,column 9"));
    }

    #[test]
    fn runtime_error_keeps_first_location() {
        let inner = CodeRange::new(4, 1, 1, 5);
        let outer = CodeRange::new(0, 10, 1, 1);
        let err = RuntimeError::general("divide by zero")
            .with_location("a", "x = 1/0", inner)
            .with_location("a", "x = 1/0", outer);
        assert_eq!(err.range, inner);
    }
}
