//! The tokeniser: source text to a token stream with positions.
//!
//! A single forward scan over the characters. Newlines are significant
//! statement separators except inside parentheses or square brackets, so the
//! lexer tracks bracket depth and suppresses `NewLine` tokens there. Whether
//! `/` starts a regex literal or is the division operator is decided from
//! the previous token (`TokenKind::ends_value`).

use crate::{
    error::{CodeRange, CompileError},
    token::{RawStringPart, Token, TokenKind},
};

type LexResult<T> = Result<T, CompileError>;

/// Tokenises `source` completely, ending with an `Eof` token.
pub fn tokenise(source: &str) -> LexResult<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    source: &'a str,
    /// (byte offset, char) pairs; one scan position.
    chars: Vec<(usize, char)>,
    pos: usize,
    line: u32,
    column: u32,
    /// Depth of `(`/`[` nesting; newlines inside are insignificant.
    bracket_depth: u32,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
            line: 1,
            column: 1,
            bracket_depth: 0,
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> LexResult<Vec<Token>> {
        while let Some(ch) = self.peek() {
            let start = self.here(1);
            match ch {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    if self.bracket_depth == 0 {
                        self.push(TokenKind::NewLine, start);
                    }
                }
                '/' if self.peek_at(1) == Some('/') => self.skip_line_comment(),
                '/' if self.peek_at(1) == Some('*') => self.skip_block_comment()?,
                '/' if !self.prev_ends_value() => self.lex_regex()?,
                '\'' => self.lex_plain_string()?,
                '"' => self.lex_expr_string()?,
                '$' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                    self.lex_capture_var()?;
                }
                c if c.is_ascii_digit() => self.lex_number()?,
                c if c.is_alphabetic() || c == '_' => self.lex_word(),
                _ => self.lex_operator()?,
            }
        }
        let eof = self.here(0);
        self.push(TokenKind::Eof, eof);
        Ok(self.tokens)
    }

    // ---- character helpers -------------------------------------------------

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|&(_, c)| c)
    }

    fn advance(&mut self) -> Option<char> {
        let &(_, c) = self.chars.get(self.pos)?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn offset(&self) -> u32 {
        self.chars
            .get(self.pos)
            .map_or(self.source.len() as u32, |&(off, _)| off as u32)
    }

    /// The range starting at the current position.
    fn here(&self, len: u32) -> CodeRange {
        CodeRange::new(self.offset(), len, self.line, self.column)
    }

    fn range_from(&self, start: CodeRange) -> CodeRange {
        CodeRange::new(start.offset, self.offset() - start.offset, start.line, start.column)
    }

    fn push(&mut self, kind: TokenKind, range: CodeRange) {
        self.tokens.push(Token::new(kind, range));
    }

    fn prev_ends_value(&self) -> bool {
        self.tokens.last().is_some_and(|t| t.kind.ends_value())
    }

    fn error(&self, message: impl Into<String>, range: CodeRange) -> CompileError {
        CompileError::new(message, range)
    }

    // ---- comments ----------------------------------------------------------

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn skip_block_comment(&mut self) -> LexResult<()> {
        let start = self.here(2);
        self.advance();
        self.advance();
        loop {
            match self.peek() {
                Some('*') if self.peek_at(1) == Some('/') => {
                    self.advance();
                    self.advance();
                    return Ok(());
                }
                Some(_) => {
                    self.advance();
                }
                None => return Err(self.error("unterminated comment", start)),
            }
        }
    }

    // ---- literals ----------------------------------------------------------

    fn lex_number(&mut self) -> LexResult<()> {
        let start = self.here(1);
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let mut fractional = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            fractional = true;
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        let kind = match self.peek() {
            Some('L' | 'l') => {
                self.advance();
                if fractional {
                    return Err(self.error("long literal cannot have a fraction", self.range_from(start)));
                }
                let value: i64 = text
                    .parse()
                    .map_err(|_| self.error("number too large for long", self.range_from(start)))?;
                TokenKind::LongLit(value)
            }
            Some('D' | 'd') => {
                self.advance();
                let value: f64 = text
                    .parse()
                    .map_err(|_| self.error("invalid double literal", self.range_from(start)))?;
                TokenKind::DoubleLit(value)
            }
            _ if fractional => TokenKind::DecimalLit(text),
            _ => {
                let value: i32 = text
                    .parse()
                    .map_err(|_| self.error("number too large for int (use L suffix)", self.range_from(start)))?;
                TokenKind::IntLit(value)
            }
        };
        let range = self.range_from(start);
        self.push(kind, range);
        Ok(())
    }

    fn lex_word(&mut self) {
        let start = self.here(1);
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let range = self.range_from(start);
        let kind = TokenKind::keyword(&word).unwrap_or_else(|| TokenKind::Identifier(word.into()));
        self.push(kind, range);
    }

    fn lex_capture_var(&mut self) -> LexResult<()> {
        let start = self.here(2);
        self.advance(); // $
        let mut num = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                num.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let n: u8 = num
            .parse()
            .map_err(|_| self.error("capture variable out of range", self.range_from(start)))?;
        let range = self.range_from(start);
        self.push(TokenKind::CaptureVar(n), range);
        Ok(())
    }

    fn lex_plain_string(&mut self) -> LexResult<()> {
        let start = self.here(1);
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                Some('\'') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    text.push(self.escape_char()?);
                }
                Some(c) => {
                    text.push(c);
                    self.advance();
                }
                None => return Err(self.error("unterminated string", start)),
            }
        }
        let range = self.range_from(start);
        self.push(TokenKind::StringLit(text.into()), range);
        Ok(())
    }

    fn escape_char(&mut self) -> LexResult<char> {
        let range = self.here(1);
        let Some(c) = self.advance() else {
            return Err(self.error("unterminated escape", range));
        };
        Ok(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            other => other,
        })
    }

    fn lex_expr_string(&mut self) -> LexResult<()> {
        let start = self.here(1);
        self.advance(); // opening quote
        let parts = self.scan_interpolated('"', true, start)?;
        let range = self.range_from(start);
        self.push(TokenKind::ExprStringLit(parts), range);
        Ok(())
    }

    fn lex_regex(&mut self) -> LexResult<()> {
        let start = self.here(1);
        self.advance(); // opening slash
        let parts = self.scan_interpolated('/', false, start)?;
        let modifiers = self.scan_modifiers();
        let range = self.range_from(start);
        self.push(TokenKind::RegexLit { parts, modifiers }, range);
        Ok(())
    }

    /// Lexes `s/pattern/replacement/mods`. Called by the operator scanner
    /// immediately after `=~` / `!~`.
    fn lex_regex_subst(&mut self) -> LexResult<()> {
        let start = self.here(2);
        self.advance(); // s
        self.advance(); // opening slash
        let pattern = self.scan_interpolated('/', false, start)?;
        let replacement = self.scan_interpolated('/', true, start)?;
        let modifiers = self.scan_modifiers();
        let range = self.range_from(start);
        self.push(
            TokenKind::RegexSubstLit { pattern, replacement, modifiers },
            range,
        );
        Ok(())
    }

    fn scan_modifiers(&mut self) -> String {
        let mut mods = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_lowercase() {
                mods.push(c);
                self.advance();
            } else {
                break;
            }
        }
        mods
    }

    /// Scans literal text up to the unescaped `terminator`, collecting
    /// `$name` / `${expr}` / `$1` interpolation holes.
    ///
    /// `process_escapes` is true for strings (where `\n` becomes a newline)
    /// and false for regex bodies (where escapes belong to the regex engine
    /// and pass through untouched, `\<terminator>` excepted).
    fn scan_interpolated(
        &mut self,
        terminator: char,
        process_escapes: bool,
        start: CodeRange,
    ) -> LexResult<Vec<RawStringPart>> {
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                Some(c) if c == terminator => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    if process_escapes {
                        text.push(self.escape_char()?);
                    } else {
                        let range = self.here(1);
                        let Some(c) = self.advance() else {
                            return Err(self.error("unterminated escape", range));
                        };
                        if c != terminator {
                            text.push('\\');
                        }
                        text.push(c);
                    }
                }
                Some('$') if self.interp_follows() => {
                    if !text.is_empty() {
                        parts.push(RawStringPart::Text(std::mem::take(&mut text)));
                    }
                    parts.push(self.scan_interp_hole()?);
                }
                Some(c) => {
                    text.push(c);
                    self.advance();
                }
                None => return Err(self.error("unterminated string", start)),
            }
        }
        if !text.is_empty() {
            parts.push(RawStringPart::Text(text));
        }
        Ok(parts)
    }

    fn interp_follows(&self) -> bool {
        matches!(self.peek_at(1), Some(c) if c == '{' || c == '_' || c.is_alphanumeric())
    }

    fn scan_interp_hole(&mut self) -> LexResult<RawStringPart> {
        let dollar = self.here(1);
        self.advance(); // $
        if self.peek() == Some('{') {
            self.advance();
            let range = self.here(0);
            let mut depth = 1u32;
            let mut source = String::new();
            loop {
                match self.peek() {
                    Some('{') => {
                        depth += 1;
                        source.push('{');
                        self.advance();
                    }
                    Some('}') => {
                        depth -= 1;
                        self.advance();
                        if depth == 0 {
                            break;
                        }
                        source.push('}');
                    }
                    Some(c) => {
                        source.push(c);
                        self.advance();
                    }
                    None => return Err(self.error("unterminated interpolation", dollar)),
                }
            }
            return Ok(RawStringPart::Interp { source, range });
        }
        // $name or $1
        let range = self.here(0);
        let mut source = String::new();
        if self.peek().is_some_and(|c| c.is_ascii_digit()) {
            source.push('$');
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    source.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        } else {
            while let Some(c) = self.peek() {
                if c.is_alphanumeric() || c == '_' {
                    source.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if source.is_empty() {
            return Err(self.error("empty interpolation", dollar));
        }
        Ok(RawStringPart::Interp { source, range })
    }

    // ---- operators ---------------------------------------------------------

    fn lex_operator(&mut self) -> LexResult<()> {
        let start = self.here(1);
        let c = self.advance().expect("caller checked a char is present");
        let two = self.peek();
        let kind = match (c, two) {
            ('?', Some('.')) => self.two(TokenKind::QuestionDot),
            ('?', Some(':')) => self.two(TokenKind::QuestionColon),
            ('=', Some('=')) => self.two(TokenKind::EqualEqual),
            ('=', Some('~')) => self.two(TokenKind::MatchOp),
            ('=', Some('>')) => self.two(TokenKind::FatArrow),
            ('!', Some('=')) => self.two(TokenKind::BangEqual),
            ('!', Some('~')) => self.two(TokenKind::NotMatchOp),
            ('<', Some('=')) => self.two(TokenKind::LessEqual),
            ('>', Some('=')) => self.two(TokenKind::GreaterEqual),
            ('&', Some('&')) => self.two(TokenKind::AmpAmp),
            ('|', Some('|')) => self.two(TokenKind::PipePipe),
            ('-', Some('>')) => self.two(TokenKind::Arrow),
            ('(', _) => {
                self.bracket_depth += 1;
                TokenKind::LeftParen
            }
            (')', _) => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RightParen
            }
            ('[', _) => {
                self.bracket_depth += 1;
                TokenKind::LeftBracket
            }
            (']', _) => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RightBracket
            }
            ('{', _) => TokenKind::LeftBrace,
            ('}', _) => TokenKind::RightBrace,
            (',', _) => TokenKind::Comma,
            (';', _) => TokenKind::Semicolon,
            (':', _) => TokenKind::Colon,
            ('.', _) => TokenKind::Dot,
            ('?', _) => TokenKind::Question,
            ('+', _) => TokenKind::Plus,
            ('-', _) => TokenKind::Minus,
            ('*', _) => TokenKind::Star,
            ('/', _) => TokenKind::Slash,
            ('%', _) => TokenKind::Percent,
            ('=', _) => TokenKind::Equal,
            ('<', _) => TokenKind::Less,
            ('>', _) => TokenKind::Greater,
            ('!', _) => TokenKind::Bang,
            ('&' | '|', _) => {
                return Err(self.error(format!("unexpected character '{c}'"), start));
            }
            _ => return Err(self.error(format!("unexpected character '{c}'"), start)),
        };
        // `s/…/…/` substitution literal directly after a match operator
        let is_match_op = matches!(kind, TokenKind::MatchOp | TokenKind::NotMatchOp);
        let range = self.range_from(start);
        self.push(kind, range);
        if is_match_op {
            self.skip_inline_space();
            if self.peek() == Some('s') && self.peek_at(1) == Some('/') {
                self.lex_regex_subst()?;
            }
        }
        Ok(())
    }

    fn two(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    fn skip_inline_space(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenise(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn numbers_pick_their_width() {
        assert_eq!(
            kinds("1 2L 3.5D 1.00"),
            vec![
                TokenKind::IntLit(1),
                TokenKind::LongLit(2),
                TokenKind::DoubleLit(3.5),
                TokenKind::DecimalLit("1.00".to_owned()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn int_overflow_requires_suffix() {
        let err = tokenise("3000000000").unwrap_err();
        assert!(err.message.contains("too large for int"));
        assert!(tokenise("3000000000L").is_ok());
    }

    #[test]
    fn slash_is_division_after_value_and_regex_otherwise() {
        assert_eq!(
            kinds("a / b"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Slash,
                TokenKind::Identifier("b".into()),
                TokenKind::Eof,
            ]
        );
        let toks = kinds("x =~ /a(.)c/r");
        assert!(matches!(
            &toks[2],
            TokenKind::RegexLit { modifiers, .. } if modifiers == "r"
        ));
    }

    #[test]
    fn interpolated_string_splits_holes() {
        let toks = tokenise(r#""a$x ${y + 1}b""#).unwrap();
        let TokenKind::ExprStringLit(parts) = &toks[0].kind else {
            panic!("expected interpolated string, got {:?}", toks[0].kind);
        };
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], RawStringPart::Text("a".to_owned()));
        assert!(matches!(&parts[1], RawStringPart::Interp { source, .. } if source == "x"));
        assert_eq!(parts[2], RawStringPart::Text(" ".to_owned()));
        assert!(matches!(&parts[3], RawStringPart::Interp { source, .. } if source == "y + 1"));
    }

    #[test]
    fn substitution_literal_after_match_op() {
        let toks = tokenise("x =~ s/ab/cd/g").unwrap();
        assert!(matches!(
            &toks[2].kind,
            TokenKind::RegexSubstLit { modifiers, .. } if modifiers == "g"
        ));
    }

    #[test]
    fn newlines_suppressed_inside_brackets() {
        let toks = kinds("[1,\n2]");
        assert!(!toks.contains(&TokenKind::NewLine));
        let toks = kinds("a\nb");
        assert!(toks.contains(&TokenKind::NewLine));
    }

    #[test]
    fn capture_vars_lex_outside_strings() {
        assert_eq!(
            kinds("$1 + $2"),
            vec![
                TokenKind::CaptureVar(1),
                TokenKind::Plus,
                TokenKind::CaptureVar(2),
                TokenKind::Eof,
            ]
        );
    }
}
