//! The parser: token stream to expression tree.
//!
//! Recursive descent with precedence climbing for binary operators.
//! Statements are newline- or semicolon-separated; the lexer already
//! suppresses newlines inside parentheses and brackets. Interpolation holes
//! inside strings and regexes arrive as raw text and are sub-parsed here
//! with their positions shifted back into the enclosing source.

use std::rc::Rc;

use crate::{
    ast::{
        Arg, BinOp, Block, CasePattern, ClassDeclNode, Expr, ExprKind, FieldDecl, FieldKey,
        FunctionDecl, Ident, Literal, MapEntry, Param, ParsedScript, Pattern, PatternKind,
        StringPart, SwitchCase, UnOp, VarTarget,
    },
    decimal::Decimal,
    error::{CodeRange, CompileError},
    lex::tokenise,
    token::{RawStringPart, Token, TokenKind},
    types::Type,
};

type ParseResult<T> = Result<T, CompileError>;

/// Maximum nesting depth for expressions, to keep deeply nested input from
/// overflowing the stack.
const MAX_NESTING_DEPTH: u16 = 200;

/// Parses a complete script.
pub fn parse(source: &str) -> ParseResult<ParsedScript> {
    let tokens = tokenise(source)?;
    Parser::new(tokens).run()
}

/// Parses an expression fragment embedded in a string or regex literal,
/// shifting positions by `base` so diagnostics land in the enclosing
/// source.
pub fn parse_embedded(source: &str, base: CodeRange) -> ParseResult<Expr> {
    let mut tokens = tokenise(source)?;
    for token in &mut tokens {
        token.range.offset += base.offset;
        if token.range.line == 1 {
            token.range.column += base.column.saturating_sub(1);
        }
        token.range.line += base.line - 1;
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.expression()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: u16,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, depth: 0 }
    }

    fn run(mut self) -> ParseResult<ParsedScript> {
        self.skip_separators();
        let package = self.parse_package()?;
        let imports = self.parse_imports()?;
        let start = self.peek_range();
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::Eof) {
            stmts.push(self.statement()?);
            self.expect_separator()?;
        }
        let range = stmts
            .first()
            .map_or(start, |f| f.range.to(stmts.last().expect("nonempty").range));
        Ok(ParsedScript {
            package,
            imports,
            body: Block { range, stmts },
        })
    }

    // ---- token plumbing ----------------------------------------------------

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        let idx = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn peek_range(&self) -> CodeRange {
        self.tokens[self.pos.min(self.tokens.len() - 1)].range
    }

    fn prev_range(&self) -> CodeRange {
        self.tokens[self.pos.saturating_sub(1)].range
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {what}"), self.peek_range()))
        }
    }

    fn expect_eof(&mut self) -> ParseResult<()> {
        self.skip_separators();
        if self.check(&TokenKind::Eof) {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input", self.peek_range()))
        }
    }

    fn error(&self, message: impl Into<String>, range: CodeRange) -> CompileError {
        CompileError::new(message, range)
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), TokenKind::NewLine | TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// Skips newlines only: used where a construct may continue on the next
    /// line (after `else`, inside switch bodies, …).
    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::NewLine) {
            self.advance();
        }
    }

    fn expect_separator(&mut self) -> ParseResult<()> {
        match self.peek() {
            TokenKind::NewLine | TokenKind::Semicolon => {
                self.skip_separators();
                Ok(())
            }
            TokenKind::Eof | TokenKind::RightBrace => Ok(()),
            _ => Err(self.error("expected newline or ';'", self.peek_range())),
        }
    }

    fn enter(&mut self, range: CodeRange) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error("expression too deeply nested", range));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ---- header ------------------------------------------------------------

    fn parse_package(&mut self) -> ParseResult<Option<Rc<str>>> {
        if !self.matches(&TokenKind::Package) {
            return Ok(None);
        }
        let path = self.dotted_name()?;
        self.expect_separator()?;
        Ok(Some(path))
    }

    fn parse_imports(&mut self) -> ParseResult<Vec<(Rc<str>, Rc<str>)>> {
        let mut imports = Vec::new();
        while self.matches(&TokenKind::Import) {
            let full = self.dotted_name()?;
            let simple = full
                .rsplit('.')
                .next()
                .expect("dotted name is nonempty")
                .into();
            imports.push((simple, full));
            self.expect_separator()?;
        }
        Ok(imports)
    }

    fn dotted_name(&mut self) -> ParseResult<Rc<str>> {
        let mut path = String::new();
        loop {
            let TokenKind::Identifier(name) = self.peek().clone() else {
                return Err(self.error("expected identifier", self.peek_range()));
            };
            self.advance();
            path.push_str(&name);
            if self.matches(&TokenKind::Dot) {
                path.push('.');
            } else {
                return Ok(path.into());
            }
        }
    }

    // ---- statements --------------------------------------------------------

    fn statement(&mut self) -> ParseResult<Expr> {
        match self.peek() {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Print | TokenKind::Println => self.print_statement(),
            TokenKind::Die => self.die_statement(),
            TokenKind::Class => self.class_declaration(),
            _ if self.starts_declaration() => self.declaration(),
            _ => self.expression(),
        }
    }

    /// A declaration begins with a type followed by an identifier.
    fn starts_declaration(&self) -> bool {
        let type_start = match self.peek() {
            TokenKind::Def | TokenKind::Int | TokenKind::Long | TokenKind::Double | TokenKind::Boolean => true,
            TokenKind::Identifier(name) => name.chars().next().is_some_and(char::is_uppercase),
            _ => false,
        };
        type_start && matches!(self.peek_at(1), TokenKind::Identifier(_))
    }

    fn declaration(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        let ty = self.parse_type()?;
        let TokenKind::Identifier(name) = self.peek().clone() else {
            return Err(self.error("expected identifier after type", self.peek_range()));
        };
        self.advance();
        if self.check(&TokenKind::LeftParen) {
            return self.function_declaration(start, ty, name);
        }
        let init = if self.matches(&TokenKind::Equal) {
            Some(Box::new(self.expression()?))
        } else {
            None
        };
        let range = start.to(self.prev_range());
        Ok(Expr::new(
            range,
            ExprKind::VarDecl {
                name,
                declared_ty: ty,
                init,
                target: VarTarget::Unresolved,
            },
        ))
    }

    fn function_declaration(&mut self, start: CodeRange, return_ty: Type, name: Rc<str>) -> ParseResult<Expr> {
        let params = self.parse_params()?;
        self.skip_newlines();
        let body = self.block()?;
        let range = start.to(self.prev_range());
        let func = FunctionDecl::new(name, params, return_ty, Box::new(body), false);
        Ok(Expr::new(range, ExprKind::FunDecl { func: Box::new(func) }))
    }

    fn parse_params(&mut self) -> ParseResult<Vec<Param>> {
        self.expect(&TokenKind::LeftParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let ty = if self.param_has_type() {
                    self.parse_type()?
                } else {
                    Type::Def
                };
                let TokenKind::Identifier(name) = self.peek().clone() else {
                    return Err(self.error("expected parameter name", self.peek_range()));
                };
                self.advance();
                let default = if self.matches(&TokenKind::Equal) {
                    Some(self.expression()?)
                } else {
                    None
                };
                params.push(Param { name, ty, default });
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen, "')'")?;
        Ok(params)
    }

    fn param_has_type(&self) -> bool {
        match self.peek() {
            TokenKind::Def | TokenKind::Int | TokenKind::Long | TokenKind::Double | TokenKind::Boolean => true,
            TokenKind::Identifier(name) => {
                name.chars().next().is_some_and(char::is_uppercase)
                    && matches!(self.peek_at(1), TokenKind::Identifier(_))
            }
            _ => false,
        }
    }

    fn parse_type(&mut self) -> ParseResult<Type> {
        let range = self.peek_range();
        let ty = match self.peek().clone() {
            TokenKind::Def => Type::Def,
            TokenKind::Int => Type::Int,
            TokenKind::Long => Type::Long,
            TokenKind::Double => Type::Double,
            TokenKind::Boolean => Type::Bool,
            TokenKind::Identifier(name) => {
                Type::from_builtin_name(&name).unwrap_or(Type::Instance(name))
            }
            _ => return Err(self.error("expected type", range)),
        };
        self.advance();
        Ok(ty)
    }

    fn if_statement(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        self.advance();
        self.expect(&TokenKind::LeftParen, "'(' after 'if'")?;
        let cond = self.expression()?;
        self.expect(&TokenKind::RightParen, "')'")?;
        self.skip_newlines();
        let then_branch = self.block_or_statement()?;
        let saved = self.pos;
        self.skip_newlines();
        let else_branch = if self.matches(&TokenKind::Else) {
            self.skip_newlines();
            Some(Box::new(self.block_or_statement()?))
        } else {
            self.pos = saved;
            None
        };
        let range = start.to(self.prev_range());
        Ok(Expr::new(
            range,
            ExprKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch,
            },
        ))
    }

    fn while_statement(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        self.advance();
        self.expect(&TokenKind::LeftParen, "'(' after 'while'")?;
        let cond = self.expression()?;
        self.expect(&TokenKind::RightParen, "')'")?;
        self.skip_newlines();
        let body = self.block_or_statement()?;
        let range = start.to(self.prev_range());
        Ok(Expr::new(
            range,
            ExprKind::While { cond: Box::new(cond), body: Box::new(body) },
        ))
    }

    fn return_statement(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        self.advance();
        let value = if matches!(
            self.peek(),
            TokenKind::NewLine | TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::Eof
        ) {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        let range = start.to(self.prev_range());
        Ok(Expr::new(range, ExprKind::Return { value }))
    }

    fn print_statement(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        let newline = matches!(self.peek(), TokenKind::Println);
        self.advance();
        let value = if matches!(
            self.peek(),
            TokenKind::NewLine | TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::Eof
        ) {
            Expr::new(start, ExprKind::Literal(Literal::Str("".into())))
        } else {
            self.expression()?
        };
        let range = start.to(self.prev_range());
        Ok(Expr::new(
            range,
            ExprKind::Print { value: Box::new(value), newline },
        ))
    }

    fn die_statement(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        self.advance();
        let value = if matches!(
            self.peek(),
            TokenKind::NewLine | TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::Eof
        ) {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        let range = start.to(self.prev_range());
        Ok(Expr::new(range, ExprKind::Die { value }))
    }

    fn class_declaration(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        self.advance();
        let TokenKind::Identifier(name) = self.peek().clone() else {
            return Err(self.error("expected class name", self.peek_range()));
        };
        self.advance();
        let superclass = if self.matches(&TokenKind::Extends) {
            Some(self.dotted_name()?)
        } else {
            None
        };
        self.skip_newlines();
        self.expect(&TokenKind::LeftBrace, "'{'")?;
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::RightBrace) {
            let member_start = self.peek_range();
            let ty = self.parse_type()?;
            let TokenKind::Identifier(member) = self.peek().clone() else {
                return Err(self.error("expected member name", self.peek_range()));
            };
            self.advance();
            if self.check(&TokenKind::LeftParen) {
                let params = self.parse_params()?;
                self.skip_newlines();
                let body = self.block()?;
                methods.push(FunctionDecl::new(member, params, ty, Box::new(body), false));
            } else {
                let init = if self.matches(&TokenKind::Equal) {
                    Some(self.expression()?)
                } else {
                    None
                };
                fields.push(FieldDecl { name: member, ty, init });
            }
            let _ = member_start;
            self.expect_separator()?;
        }
        self.expect(&TokenKind::RightBrace, "'}'")?;
        let range = start.to(self.prev_range());
        Ok(Expr::new(
            range,
            ExprKind::ClassDecl {
                class: Box::new(ClassDeclNode { name, superclass, fields, methods }),
            },
        ))
    }

    fn block_or_statement(&mut self) -> ParseResult<Expr> {
        if self.check(&TokenKind::LeftBrace) {
            self.block()
        } else {
            self.statement()
        }
    }

    fn block(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        self.expect(&TokenKind::LeftBrace, "'{'")?;
        let mut stmts = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::RightBrace) {
            stmts.push(self.statement()?);
            self.expect_separator()?;
        }
        self.expect(&TokenKind::RightBrace, "'}'")?;
        let range = start.to(self.prev_range());
        Ok(Expr::new(range, ExprKind::Block(Block { range, stmts })))
    }

    // ---- expressions -------------------------------------------------------

    pub(crate) fn expression(&mut self) -> ParseResult<Expr> {
        let range = self.peek_range();
        self.enter(range)?;
        let result = self.assignment();
        self.leave();
        result
    }

    fn assignment(&mut self) -> ParseResult<Expr> {
        let target = self.ternary()?;
        if !self.check(&TokenKind::Equal) {
            return Ok(target);
        }
        let eq_range = self.peek_range();
        self.advance();
        let value = Box::new(self.assignment()?);
        let range = target.range.to(value.range);
        match target.kind {
            ExprKind::Identifier(ident) => {
                Ok(Expr::new(range, ExprKind::VarAssign { ident, value }))
            }
            ExprKind::Field { receiver, name, safe: false } => Ok(Expr::new(
                range,
                ExprKind::FieldAssign {
                    receiver,
                    field: FieldKey::Name(name),
                    value,
                },
            )),
            ExprKind::ArrayGet { receiver, index } => Ok(Expr::new(
                range,
                ExprKind::FieldAssign {
                    receiver,
                    field: FieldKey::Index(index),
                    value,
                },
            )),
            _ => Err(self.error("invalid assignment target", eq_range)),
        }
    }

    fn ternary(&mut self) -> ParseResult<Expr> {
        let cond = self.or_expr()?;
        if self.matches(&TokenKind::Question) {
            let then_expr = self.expression()?;
            self.expect(&TokenKind::Colon, "':' in ternary")?;
            let else_expr = self.expression()?;
            let range = cond.range.to(else_expr.range);
            return Ok(Expr::new(
                range,
                ExprKind::Ternary {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
            ));
        }
        if self.matches(&TokenKind::QuestionColon) {
            let rhs = self.expression()?;
            let range = cond.range.to(rhs.range);
            return Ok(Expr::new(
                range,
                ExprKind::Binary {
                    op: BinOp::Elvis,
                    lhs: Box::new(cond),
                    rhs: Box::new(rhs),
                },
            ));
        }
        Ok(cond)
    }

    fn or_expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.and_expr()?;
        while self.matches(&TokenKind::PipePipe) {
            let rhs = self.and_expr()?;
            let range = lhs.range.to(rhs.range);
            lhs = Expr::new(
                range,
                ExprKind::Binary { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.equality()?;
        while self.matches(&TokenKind::AmpAmp) {
            let rhs = self.equality()?;
            let range = lhs.range.to(rhs.range);
            lhs = Expr::new(
                range,
                ExprKind::Binary { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek() {
                TokenKind::EqualEqual => BinOp::Eq,
                TokenKind::BangEqual => BinOp::Ne,
                TokenKind::MatchOp | TokenKind::NotMatchOp => {
                    let negated = matches!(self.peek(), TokenKind::NotMatchOp);
                    self.advance();
                    lhs = self.regex_rhs(lhs, negated)?;
                    continue;
                }
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.relational()?;
            let range = lhs.range.to(rhs.range);
            lhs = Expr::new(
                range,
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
    }

    /// Parses the right-hand side of `=~` / `!~`.
    fn regex_rhs(&mut self, target: Expr, negated: bool) -> ParseResult<Expr> {
        let rhs_range = self.peek_range();
        match self.peek().clone() {
            TokenKind::RegexLit { parts, modifiers } => {
                self.advance();
                let pattern = self.string_parts(parts)?;
                let range = target.range.to(rhs_range);
                Ok(Expr::new(
                    range,
                    ExprKind::RegexMatch {
                        target: Some(Box::new(target)),
                        pattern,
                        case_insensitive: modifiers.contains('i'),
                        negated,
                    },
                ))
            }
            TokenKind::RegexSubstLit { pattern, replacement, modifiers } => {
                if negated {
                    return Err(self.error("'!~' cannot be used with substitution", rhs_range));
                }
                self.advance();
                let pattern = self.string_parts(pattern)?;
                let replacement = self.string_parts(replacement)?;
                let range = target.range.to(rhs_range);
                Ok(Expr::new(
                    range,
                    ExprKind::RegexSubst {
                        target: Box::new(target),
                        pattern,
                        replacement,
                        case_insensitive: modifiers.contains('i'),
                        global: modifiers.contains('g'),
                    },
                ))
            }
            _ => {
                // dynamic pattern: any string-valued expression
                let pattern_expr = self.relational()?;
                let range = target.range.to(pattern_expr.range);
                Ok(Expr::new(
                    range,
                    ExprKind::RegexMatch {
                        target: Some(Box::new(target)),
                        pattern: vec![StringPart::Interp(Box::new(pattern_expr))],
                        case_insensitive: false,
                        negated,
                    },
                ))
            }
        }
    }

    fn relational(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::Less => BinOp::Lt,
                TokenKind::LessEqual => BinOp::LtEq,
                TokenKind::Greater => BinOp::Gt,
                TokenKind::GreaterEqual => BinOp::GtEq,
                TokenKind::Instanceof => {
                    self.advance();
                    let ty = self.parse_type()?;
                    let range = lhs.range.to(self.prev_range());
                    lhs = Expr::new(
                        range,
                        ExprKind::InstanceOf { expr: Box::new(lhs), target: ty, negated: false },
                    );
                    continue;
                }
                TokenKind::Bang if matches!(self.peek_at(1), TokenKind::Instanceof) => {
                    self.advance();
                    self.advance();
                    let ty = self.parse_type()?;
                    let range = lhs.range.to(self.prev_range());
                    lhs = Expr::new(
                        range,
                        ExprKind::InstanceOf { expr: Box::new(lhs), target: ty, negated: true },
                    );
                    continue;
                }
                TokenKind::As => {
                    self.advance();
                    let ty = self.parse_type()?;
                    let range = lhs.range.to(self.prev_range());
                    lhs = Expr::new(range, ExprKind::Cast { target: ty, expr: Box::new(lhs) });
                    continue;
                }
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.additive()?;
            let range = lhs.range.to(rhs.range);
            lhs = Expr::new(
                range,
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative()?;
            let range = lhs.range.to(rhs.range);
            lhs = Expr::new(
                range,
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            let range = lhs.range.to(rhs.range);
            lhs = Expr::new(
                range,
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        let op = match self.peek() {
            TokenKind::Minus => UnOp::Neg,
            TokenKind::Bang => UnOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        // fold a negated numeric literal into the literal itself
        if op == UnOp::Neg {
            if let ExprKind::Literal(lit) = &operand.kind {
                if let Some(neg) = negate_literal(lit) {
                    return Ok(Expr::new(start.to(operand.range), ExprKind::Literal(neg)));
                }
            }
        }
        let range = start.to(operand.range);
        Ok(Expr::new(range, ExprKind::Unary { op, operand: Box::new(operand) }))
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                TokenKind::Dot | TokenKind::QuestionDot => {
                    let safe = matches!(self.peek(), TokenKind::QuestionDot);
                    self.advance();
                    let TokenKind::Identifier(name) = self.peek().clone() else {
                        return Err(self.error("expected member name after '.'", self.peek_range()));
                    };
                    self.advance();
                    if self.check(&TokenKind::LeftParen) || self.check(&TokenKind::LeftBrace) {
                        let args = self.call_args()?;
                        let range = expr.range.to(self.prev_range());
                        expr = Expr::new(
                            range,
                            ExprKind::MethodCall { receiver: Box::new(expr), name, args, safe },
                        );
                    } else {
                        let range = expr.range.to(self.prev_range());
                        expr = Expr::new(
                            range,
                            ExprKind::Field { receiver: Box::new(expr), name, safe },
                        );
                    }
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&TokenKind::RightBracket, "']'")?;
                    let range = expr.range.to(self.prev_range());
                    expr = Expr::new(
                        range,
                        ExprKind::ArrayGet { receiver: Box::new(expr), index: Box::new(index) },
                    );
                }
                TokenKind::LeftParen | TokenKind::LeftBrace
                    if matches!(expr.kind, ExprKind::Identifier(_) | ExprKind::ItVar(_)) =>
                {
                    let args = self.call_args()?;
                    let range = expr.range.to(self.prev_range());
                    expr = self.make_call(range, expr, args)?;
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Parses `(args)`, `(args){ closure }`, or a bare trailing `{ closure }`.
    fn call_args(&mut self) -> ParseResult<Vec<Arg>> {
        let mut args = Vec::new();
        if self.matches(&TokenKind::LeftParen) {
            if !self.check(&TokenKind::RightParen) {
                loop {
                    let name = match (self.peek().clone(), self.peek_at(1)) {
                        (TokenKind::Identifier(n), TokenKind::Colon) => {
                            self.advance();
                            self.advance();
                            Some(n)
                        }
                        _ => None,
                    };
                    let expr = self.expression()?;
                    args.push(Arg { name, expr });
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(&TokenKind::RightParen, "')'")?;
        }
        if self.check(&TokenKind::LeftBrace) {
            let closure = self.closure()?;
            args.push(Arg { name: None, expr: closure });
        }
        Ok(args)
    }

    fn make_call(&mut self, range: CodeRange, function: Expr, args: Vec<Arg>) -> ParseResult<Expr> {
        // `eval` compiles to its own node so the resolver can treat the
        // evaluated source as a suspension point
        if let ExprKind::Identifier(ident) = &function.kind {
            if &*ident.name == "eval" {
                let mut args = args;
                if args.len() != 1 || args[0].name.is_some() {
                    return Err(self.error("eval expects a single argument", range));
                }
                let source = args.remove(0).expr;
                return Ok(Expr::new(range, ExprKind::Eval { source: Box::new(source) }));
            }
        }
        Ok(Expr::new(
            range,
            ExprKind::Call {
                function: Box::new(function),
                args,
                target: Default::default(),
                suspends: false,
            },
        ))
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let range = self.peek_range();
        let kind = self.peek().clone();
        match kind {
            TokenKind::IntLit(v) => {
                self.advance();
                Ok(Expr::new(range, ExprKind::Literal(Literal::Int(v))))
            }
            TokenKind::LongLit(v) => {
                self.advance();
                Ok(Expr::new(range, ExprKind::Literal(Literal::Long(v))))
            }
            TokenKind::DoubleLit(v) => {
                self.advance();
                Ok(Expr::new(range, ExprKind::Literal(Literal::Double(v))))
            }
            TokenKind::DecimalLit(text) => {
                self.advance();
                let dec: Decimal = text
                    .parse()
                    .map_err(|()| self.error("invalid decimal literal", range))?;
                Ok(Expr::new(range, ExprKind::Literal(Literal::Decimal(dec))))
            }
            TokenKind::StringLit(s) => {
                self.advance();
                Ok(Expr::new(range, ExprKind::Literal(Literal::Str(s))))
            }
            TokenKind::ExprStringLit(parts) => {
                self.advance();
                let parts = self.string_parts(parts)?;
                // a string with no holes is a plain literal
                if let [StringPart::Text(text)] = parts.as_slice() {
                    return Ok(Expr::new(range, ExprKind::Literal(Literal::Str(text.clone()))));
                }
                if parts.is_empty() {
                    return Ok(Expr::new(range, ExprKind::Literal(Literal::Str("".into()))));
                }
                Ok(Expr::new(range, ExprKind::ExprString(parts)))
            }
            TokenKind::RegexLit { parts, modifiers } => {
                self.advance();
                let pattern = self.string_parts(parts)?;
                Ok(Expr::new(
                    range,
                    ExprKind::RegexMatch {
                        target: None,
                        pattern,
                        case_insensitive: modifiers.contains('i'),
                        negated: false,
                    },
                ))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(range, ExprKind::Literal(Literal::Bool(true))))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(range, ExprKind::Literal(Literal::Bool(false))))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::new(range, ExprKind::Literal(Literal::Null)))
            }
            TokenKind::CaptureVar(n) => {
                self.advance();
                Ok(Expr::new(range, ExprKind::CaptureVar(n)))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if &*name == "it" {
                    Ok(Expr::new(range, ExprKind::ItVar(Ident::new(name))))
                } else {
                    Ok(Expr::new(range, ExprKind::Identifier(Ident::new(name))))
                }
            }
            TokenKind::Int | TokenKind::Long | TokenKind::Double | TokenKind::Boolean | TokenKind::Def => {
                let ty = self.parse_type()?;
                Ok(Expr::new(range, ExprKind::TypeExpr(ty)))
            }
            TokenKind::New => {
                self.advance();
                let class = self.dotted_name()?;
                let args = self.call_args()?;
                let full = range.to(self.prev_range());
                Ok(Expr::new(full, ExprKind::InvokeNew { class, args }))
            }
            TokenKind::Switch => self.switch_expression(),
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&TokenKind::RightParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => self.list_or_map_literal(),
            TokenKind::LeftBrace => self.closure(),
            _ => Err(self.error(format!("unexpected token in expression: {kind:?}"), range)),
        }
    }

    fn list_or_map_literal(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        self.advance(); // [
        // `[:]` is the empty map
        if self.check(&TokenKind::Colon) && self.peek_at(1) == &TokenKind::RightBracket {
            self.advance();
            self.advance();
            let range = start.to(self.prev_range());
            return Ok(Expr::new(range, ExprKind::MapLiteral(Vec::new())));
        }
        // map when the first entry is `key:`
        let is_map = match (self.peek(), self.peek_at(1)) {
            (TokenKind::Identifier(_) | TokenKind::StringLit(_), TokenKind::Colon) => true,
            _ => false,
        };
        if is_map {
            let mut entries = Vec::new();
            loop {
                let key: Rc<str> = match self.peek().clone() {
                    TokenKind::Identifier(name) => name,
                    TokenKind::StringLit(s) => s,
                    _ => return Err(self.error("expected map key", self.peek_range())),
                };
                self.advance();
                self.expect(&TokenKind::Colon, "':' after map key")?;
                let value = self.expression()?;
                entries.push(MapEntry { key, value });
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RightBracket, "']'")?;
            let range = start.to(self.prev_range());
            return Ok(Expr::new(range, ExprKind::MapLiteral(entries)));
        }
        let mut items = Vec::new();
        if !self.check(&TokenKind::RightBracket) {
            loop {
                items.push(self.expression()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightBracket, "']'")?;
        let range = start.to(self.prev_range());
        Ok(Expr::new(range, ExprKind::ListLiteral(items)))
    }

    fn closure(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        self.expect(&TokenKind::LeftBrace, "'{'")?;
        self.skip_separators();
        // look for a parameter list terminated by `->`
        let params = self.try_closure_params()?;
        let implicit_it = params.is_none();
        let params = params.unwrap_or_default();
        let mut stmts = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::RightBrace) {
            stmts.push(self.statement()?);
            self.expect_separator()?;
        }
        self.expect(&TokenKind::RightBrace, "'}'")?;
        let range = start.to(self.prev_range());
        let body = Expr::new(range, ExprKind::Block(Block { range, stmts }));
        let func = FunctionDecl::new("<closure>".into(), params, Type::Def, Box::new(body), implicit_it);
        Ok(Expr::new(range, ExprKind::Closure { func: Box::new(func) }))
    }

    /// Detects `a, int b ->` at the start of a closure body. Returns `None`
    /// when there is no parameter list (the closure takes implicit `it`).
    fn try_closure_params(&mut self) -> ParseResult<Option<Vec<Param>>> {
        let saved = self.pos;
        let mut params = Vec::new();
        loop {
            let ty = if self.param_has_type() {
                match self.parse_type() {
                    Ok(ty) => ty,
                    Err(_) => {
                        self.pos = saved;
                        return Ok(None);
                    }
                }
            } else {
                Type::Def
            };
            let TokenKind::Identifier(name) = self.peek().clone() else {
                self.pos = saved;
                return Ok(None);
            };
            self.advance();
            params.push(Param { name, ty, default: None });
            if self.matches(&TokenKind::Comma) {
                continue;
            }
            if self.matches(&TokenKind::Arrow) {
                return Ok(Some(params));
            }
            self.pos = saved;
            return Ok(None);
        }
    }

    // ---- switch ------------------------------------------------------------

    fn switch_expression(&mut self) -> ParseResult<Expr> {
        let start = self.peek_range();
        self.advance(); // switch
        let subject = if self.matches(&TokenKind::LeftParen) {
            let subject = self.expression()?;
            self.expect(&TokenKind::RightParen, "')'")?;
            Some(Box::new(subject))
        } else {
            None
        };
        self.skip_newlines();
        self.expect(&TokenKind::LeftBrace, "'{' after switch")?;
        let mut cases = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::RightBrace) {
            cases.push(self.switch_case()?);
            self.skip_separators();
        }
        self.expect(&TokenKind::RightBrace, "'}'")?;
        let range = start.to(self.prev_range());
        if cases.is_empty() {
            return Err(self.error("switch must have at least one case", range));
        }
        Ok(Expr::new(
            range,
            ExprKind::Switch {
                subject,
                cases,
                subject_slot: 0,
                strategy: Default::default(),
            },
        ))
    }

    fn switch_case(&mut self) -> ParseResult<SwitchCase> {
        let start = self.peek_range();
        if self.matches(&TokenKind::Default) {
            self.expect(&TokenKind::FatArrow, "'=>' after default")?;
            let result = self.expression()?;
            let range = start.to(self.prev_range());
            return Ok(SwitchCase {
                range,
                patterns: vec![CasePattern {
                    pattern: Pattern { range: start, kind: PatternKind::Wildcard },
                    guard: None,
                }],
                result,
                is_default: true,
                bindings: Default::default(),
            });
        }
        let mut patterns = Vec::new();
        loop {
            let pattern = self.pattern()?;
            let guard = if self.matches(&TokenKind::If) {
                Some(self.expression()?)
            } else {
                None
            };
            patterns.push(CasePattern { pattern, guard });
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::FatArrow, "'=>' after patterns")?;
        let result = self.expression()?;
        let range = start.to(self.prev_range());
        Ok(SwitchCase {
            range,
            patterns,
            result,
            is_default: false,
            bindings: Default::default(),
        })
    }

    fn pattern(&mut self) -> ParseResult<Pattern> {
        let range = self.peek_range();
        match self.peek().clone() {
            TokenKind::IntLit(v) => {
                self.advance();
                Ok(Pattern { range, kind: PatternKind::Literal(Literal::Int(v)) })
            }
            TokenKind::LongLit(v) => {
                self.advance();
                Ok(Pattern { range, kind: PatternKind::Literal(Literal::Long(v)) })
            }
            TokenKind::DoubleLit(v) => {
                self.advance();
                Ok(Pattern { range, kind: PatternKind::Literal(Literal::Double(v)) })
            }
            TokenKind::DecimalLit(text) => {
                self.advance();
                let dec: Decimal = text
                    .parse()
                    .map_err(|()| self.error("invalid decimal literal", range))?;
                Ok(Pattern { range, kind: PatternKind::Literal(Literal::Decimal(dec)) })
            }
            TokenKind::StringLit(s) => {
                self.advance();
                Ok(Pattern { range, kind: PatternKind::Literal(Literal::Str(s)) })
            }
            TokenKind::ExprStringLit(parts) => {
                self.advance();
                let parts = self.string_parts(parts)?;
                match parts.as_slice() {
                    [] => Ok(Pattern { range, kind: PatternKind::Literal(Literal::Str("".into())) }),
                    [StringPart::Text(text)] => Ok(Pattern {
                        range,
                        kind: PatternKind::Literal(Literal::Str(text.clone())),
                    }),
                    _ => Err(self.error("interpolation not allowed in patterns", range)),
                }
            }
            TokenKind::True => {
                self.advance();
                Ok(Pattern { range, kind: PatternKind::Literal(Literal::Bool(true)) })
            }
            TokenKind::False => {
                self.advance();
                Ok(Pattern { range, kind: PatternKind::Literal(Literal::Bool(false)) })
            }
            TokenKind::Null => {
                self.advance();
                Ok(Pattern { range, kind: PatternKind::Literal(Literal::Null) })
            }
            TokenKind::Minus => {
                self.advance();
                let inner = self.pattern()?;
                let PatternKind::Literal(lit) = &inner.kind else {
                    return Err(self.error("expected numeric literal after '-'", range));
                };
                let Some(neg) = negate_literal(lit) else {
                    return Err(self.error("expected numeric literal after '-'", range));
                };
                Ok(Pattern { range: range.to(inner.range), kind: PatternKind::Literal(neg) })
            }
            TokenKind::Underscore => {
                self.advance();
                Ok(Pattern { range, kind: PatternKind::Wildcard })
            }
            TokenKind::Star => {
                self.advance();
                Ok(Pattern { range, kind: PatternKind::Rest })
            }
            TokenKind::RegexLit { parts, modifiers } => {
                self.advance();
                if !modifiers.contains('r') {
                    return Err(self.error("regex pattern requires the 'r' modifier", range));
                }
                let parts = self.string_parts(parts)?;
                let [StringPart::Text(pattern)] = parts.as_slice() else {
                    return Err(self.error("interpolation not allowed in pattern regex", range));
                };
                Ok(Pattern {
                    range,
                    kind: PatternKind::Regex {
                        pattern: pattern.clone(),
                        case_insensitive: modifiers.contains('i'),
                    },
                })
            }
            TokenKind::Int | TokenKind::Long | TokenKind::Double | TokenKind::Boolean | TokenKind::Def => {
                let ty = self.parse_type()?;
                let binding = self.pattern_binding()?;
                if matches!(ty, Type::Def) {
                    // `def x` binds anything, same as a bare identifier
                    return match binding {
                        Some(ident) => Ok(Pattern { range, kind: PatternKind::Binding(ident) }),
                        None => Ok(Pattern { range, kind: PatternKind::Wildcard }),
                    };
                }
                Ok(Pattern { range: range.to(self.prev_range()), kind: PatternKind::Type { ty, binding } })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if name.chars().next().is_some_and(char::is_uppercase) {
                    let ty = Type::from_builtin_name(&name).unwrap_or(Type::Instance(name));
                    let binding = self.pattern_binding()?;
                    Ok(Pattern {
                        range: range.to(self.prev_range()),
                        kind: PatternKind::Type { ty, binding },
                    })
                } else {
                    Ok(Pattern { range, kind: PatternKind::Binding(Ident::new(name)) })
                }
            }
            TokenKind::LeftBracket => self.bracket_pattern(),
            other => Err(self.error(format!("unexpected token in pattern: {other:?}"), range)),
        }
    }

    fn pattern_binding(&mut self) -> ParseResult<Option<Ident>> {
        if let TokenKind::Identifier(name) = self.peek().clone() {
            if name.chars().next().is_some_and(char::is_lowercase) {
                self.advance();
                return Ok(Some(Ident::new(name)));
            }
        }
        Ok(None)
    }

    fn bracket_pattern(&mut self) -> ParseResult<Pattern> {
        let start = self.peek_range();
        self.advance(); // [
        // `[:]` empty map pattern
        if self.check(&TokenKind::Colon) && self.peek_at(1) == &TokenKind::RightBracket {
            self.advance();
            self.advance();
            return Ok(Pattern {
                range: start.to(self.prev_range()),
                kind: PatternKind::Map { entries: Vec::new(), open: false },
            });
        }
        let is_map = match (self.peek(), self.peek_at(1)) {
            (TokenKind::Identifier(_) | TokenKind::StringLit(_), TokenKind::Colon) => true,
            _ => false,
        };
        if is_map {
            let mut entries = Vec::new();
            let mut open = false;
            loop {
                if self.matches(&TokenKind::Star) {
                    open = true;
                } else {
                    let key: Rc<str> = match self.peek().clone() {
                        TokenKind::Identifier(name) => name,
                        TokenKind::StringLit(s) => s,
                        _ => return Err(self.error("expected map key in pattern", self.peek_range())),
                    };
                    self.advance();
                    self.expect(&TokenKind::Colon, "':' after map key")?;
                    let value = self.pattern()?;
                    entries.push((key, value));
                }
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RightBracket, "']'")?;
            return Ok(Pattern {
                range: start.to(self.prev_range()),
                kind: PatternKind::Map { entries, open },
            });
        }
        let mut items = Vec::new();
        if !self.check(&TokenKind::RightBracket) {
            loop {
                items.push(self.pattern()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightBracket, "']'")?;
        let rest_count = items.iter().filter(|p| matches!(p.kind, PatternKind::Rest)).count();
        if rest_count > 1 {
            return Err(self.error("only one '*' allowed in a list pattern", start));
        }
        Ok(Pattern {
            range: start.to(self.prev_range()),
            kind: PatternKind::List(items),
        })
    }

    // ---- interpolation -----------------------------------------------------

    fn string_parts(&mut self, raw: Vec<RawStringPart>) -> ParseResult<Vec<StringPart>> {
        raw.into_iter()
            .map(|part| match part {
                RawStringPart::Text(text) => Ok(StringPart::Text(text.into())),
                RawStringPart::Interp { source, range } => {
                    let expr = parse_embedded(&source, range)?;
                    Ok(StringPart::Interp(Box::new(expr)))
                }
            })
            .collect()
    }
}

fn negate_literal(lit: &Literal) -> Option<Literal> {
    Some(match lit {
        Literal::Int(v) => Literal::Int(v.wrapping_neg()),
        Literal::Long(v) => Literal::Long(v.wrapping_neg()),
        Literal::Double(v) => Literal::Double(-v),
        Literal::Decimal(d) => Literal::Decimal(d.neg()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> ParsedScript {
        parse(source).unwrap()
    }

    #[test]
    fn switch_with_alternation_and_guards() {
        let script = parse_ok("switch (a) { 1 if it != 2, 2 => it; default => 0 }");
        let ExprKind::Switch { cases, subject, .. } = &script.body.stmts[0].kind else {
            panic!("expected switch");
        };
        assert!(subject.is_some());
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].patterns.len(), 2);
        assert!(cases[0].patterns[0].guard.is_some());
        assert!(cases[0].patterns[1].guard.is_none());
        assert!(cases[1].is_default);
    }

    #[test]
    fn only_explicit_default_is_marked() {
        let script = parse_ok("switch (a) { 1 => 2; _ => 0 }");
        let ExprKind::Switch { cases, .. } = &script.body.stmts[0].kind else {
            panic!("expected switch");
        };
        assert!(!cases[1].is_default);
        assert!(matches!(cases[1].patterns[0].pattern.kind, PatternKind::Wildcard));
    }

    #[test]
    fn nested_destructure_pattern() {
        let script = parse_ok("switch (m) { [a:1, b:[int x, y], *] => x + y }");
        let ExprKind::Switch { cases, .. } = &script.body.stmts[0].kind else {
            panic!("expected switch");
        };
        let PatternKind::Map { entries, open } = &cases[0].patterns[0].pattern.kind else {
            panic!("expected map pattern");
        };
        assert!(*open);
        assert_eq!(entries.len(), 2);
        let PatternKind::List(items) = &entries[1].1.kind else {
            panic!("expected nested list pattern");
        };
        assert!(matches!(
            &items[0].kind,
            PatternKind::Type { ty: Type::Int, binding: Some(_) }
        ));
        assert!(matches!(&items[1].kind, PatternKind::Binding(_)));
    }

    #[test]
    fn trailing_closure_call() {
        let script = parse_ok("measure{ sleep(1000) }");
        let ExprKind::Call { args, .. } = &script.body.stmts[0].kind else {
            panic!("expected call, got {:?}", script.body.stmts[0].kind);
        };
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0].expr.kind, ExprKind::Closure { .. }));
    }

    #[test]
    fn regex_match_operator() {
        let script = parse_ok("x =~ /ab+c/i");
        assert!(matches!(
            &script.body.stmts[0].kind,
            ExprKind::RegexMatch { target: Some(_), case_insensitive: true, negated: false, .. }
        ));
    }

    #[test]
    fn substitution_operator() {
        let script = parse_ok("x =~ s/a/b/g");
        assert!(matches!(
            &script.body.stmts[0].kind,
            ExprKind::RegexSubst { global: true, .. }
        ));
    }

    #[test]
    fn class_with_fields_and_methods() {
        let script = parse_ok("class Point { int x; int y; def dist() { x * x + y * y } }");
        let ExprKind::ClassDecl { class } = &script.body.stmts[0].kind else {
            panic!("expected class decl");
        };
        assert_eq!(class.fields.len(), 2);
        assert_eq!(class.methods.len(), 1);
    }

    #[test]
    fn eval_becomes_its_own_node() {
        let script = parse_ok("eval('1 + 2')");
        assert!(matches!(&script.body.stmts[0].kind, ExprKind::Eval { .. }));
    }

    #[test]
    fn subjectless_switch_uses_it() {
        let script = parse_ok("switch { 1 => 2; default => 3 }");
        let ExprKind::Switch { subject, .. } = &script.body.stmts[0].kind else {
            panic!("expected switch");
        };
        assert!(subject.is_none());
    }

    #[test]
    fn package_and_imports() {
        let script = parse_ok("package a.b\nimport a.b.Foo\ndef x = 1");
        assert_eq!(script.package.as_deref(), Some("a.b"));
        assert_eq!(script.imports.len(), 1);
        assert_eq!(&*script.imports[0].0, "Foo");
        assert_eq!(&*script.imports[0].1, "a.b.Foo");
    }
}
