//! Recursive-descent parser for policy sources and query strings.
//!
//! A policy is a sequence of rules (`head(params) if body;`), rule types
//! (`type head(params);`) and inline queries (`?= goal;`). Operator precedence, loosest first:
//! `or`, `and`, `not`, comparisons (`= == != < <= > >= in matches :=`),
//! `+ -`, `* / mod rem`, unary minus, `.` lookup.

pub mod lexer;

use miette::NamedSource;

use crate::error::ParseError;
use crate::rules::{Parameter, Rule};
use crate::term::{
    Call, Dictionary, InstanceLiteral, List, Numeric, Operation, Operator, Pattern, SourceInfo,
    Symbol, Term, Value,
};
use lexer::{LexError, Span, Token, TokenKind, tokenize};

/// One top-level item of a policy source.
#[derive(Debug, Clone)]
pub enum Line {
    Rule(Rule),
    /// A declared shape that later rules of the same name must fit.
    RuleType(Rule),
    Query(Term),
}

/// Parse a whole policy source.
pub fn parse_lines(src: &str, filename: Option<&str>) -> Result<Vec<Line>, ParseError> {
    let mut parser = Parser::new(src, filename)?;
    let mut lines = Vec::new();
    while !parser.at(&TokenKind::Eof) {
        lines.push(parser.line()?);
    }
    Ok(lines)
}

/// Parse a single query expression, with or without a trailing `;`.
pub fn parse_query(src: &str) -> Result<Term, ParseError> {
    let mut parser = Parser::new(src, None)?;
    let term = parser.expr()?;
    if parser.at(&TokenKind::Semicolon) {
        parser.bump();
    }
    parser.expect(TokenKind::Eof)?;
    Ok(term)
}

struct Parser<'a> {
    src: &'a str,
    filename: Option<&'a str>,
    tokens: Vec<Token>,
    pos: usize,
    line_starts: Vec<usize>,
    anonymous: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, filename: Option<&'a str>) -> Result<Self, ParseError> {
        let line_starts = std::iter::once(0)
            .chain(src.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        let mut parser = Self {
            src,
            filename,
            tokens: Vec::new(),
            pos: 0,
            line_starts,
            anonymous: 0,
        };
        match tokenize(src) {
            Ok(tokens) => parser.tokens = tokens,
            Err(LexError { message, span }) => return Err(parser.error_at(message, span)),
        }
        Ok(parser)
    }

    // ── Diagnostics ────────────────────────────────────────────────────

    fn position(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let column = self.src[self.line_starts[line]..offset].chars().count() + 1;
        (line + 1, column)
    }

    fn error_at(&self, message: String, span: Span) -> ParseError {
        let (line, column) = self.position(span.start);
        ParseError {
            message,
            line,
            column,
            src: NamedSource::new(self.filename.unwrap_or("<query>"), self.src.to_string()),
            span: (span.start, span.end.saturating_sub(span.start)).into(),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let tok = self.peek();
        self.error_at(
            format!("expected {expected}, found {}", tok.kind.describe()),
            tok.span,
        )
    }

    fn source_at(&self, offset: usize) -> SourceInfo {
        let (line, column) = self.position(offset);
        SourceInfo {
            filename: self.filename.map(str::to_string),
            line,
            column,
        }
    }

    fn mk(&self, value: Value, start: usize) -> Term {
        Term::new(value).with_source(self.source_at(start))
    }

    // ── Token cursor ───────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.at(&kind) {
            Ok(self.bump())
        } else {
            Err(self.unexpected(&kind.describe()))
        }
    }

    fn ident(&mut self) -> Result<(String, Span), ParseError> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                let span = self.bump().span;
                Ok((name, span))
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    // ── Lines ──────────────────────────────────────────────────────────

    fn line(&mut self) -> Result<Line, ParseError> {
        if self.eat(&TokenKind::QueryMark) {
            let term = self.expr()?;
            self.expect(TokenKind::Semicolon)?;
            return Ok(Line::Query(term));
        }
        if self.at(&TokenKind::Type) {
            let keyword = self.bump().span;
            let rule = self.rule()?;
            if !rule.is_fact() {
                return Err(self.error_at("a rule type cannot have a body".to_string(), keyword));
            }
            return Ok(Line::RuleType(rule));
        }
        self.rule().map(Line::Rule)
    }

    fn rule(&mut self) -> Result<Rule, ParseError> {
        let (name, span) = self.ident()?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                params.push(self.parameter()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;

        let body = if self.eat(&TokenKind::If) {
            let body = self.expr()?;
            match body.value() {
                Value::Expression(op) if op.operator == Operator::And => body,
                _ => body.clone_with_value(Value::Expression(Operation {
                    operator: Operator::And,
                    args: vec![body.clone()],
                })),
            }
        } else {
            Term::op(Operator::And, vec![])
        };
        self.expect(TokenKind::Semicolon)?;

        Ok(Rule {
            name: Symbol(name),
            params,
            body,
            source: Some(self.source_at(span.start)),
        })
    }

    fn parameter(&mut self) -> Result<Parameter, ParseError> {
        let parameter = self.additive()?;
        let specializer = if self.eat(&TokenKind::Colon) {
            Some(self.pattern()?)
        } else {
            None
        };
        Ok(Parameter {
            parameter,
            specializer,
        })
    }

    /// `Class`, `Class{...}` or `{...}`.
    fn pattern(&mut self) -> Result<Term, ParseError> {
        let start = self.peek().span.start;
        match self.peek().kind.clone() {
            TokenKind::Ident(tag) => {
                self.bump();
                let fields = if self.at(&TokenKind::LBrace) {
                    self.fields()?
                } else {
                    Dictionary::new()
                };
                Ok(self.mk(
                    Value::Pattern(Pattern::Instance(InstanceLiteral {
                        tag: Symbol(tag),
                        fields,
                    })),
                    start,
                ))
            }
            TokenKind::LBrace => {
                let fields = self.fields()?;
                Ok(self.mk(Value::Pattern(Pattern::Dictionary(fields)), start))
            }
            _ => Err(self.unexpected("a class name or dictionary pattern")),
        }
    }

    // ── Expressions ────────────────────────────────────────────────────

    fn expr(&mut self) -> Result<Term, ParseError> {
        self.disjunction()
    }

    fn nary(
        &mut self,
        token: TokenKind,
        operator: Operator,
        next: fn(&mut Self) -> Result<Term, ParseError>,
    ) -> Result<Term, ParseError> {
        let start = self.peek().span.start;
        let first = next(self)?;
        if !self.at(&token) {
            return Ok(first);
        }
        let mut args = vec![first];
        while self.eat(&token) {
            args.push(next(self)?);
        }
        Ok(self.mk(Value::Expression(Operation { operator, args }), start))
    }

    fn disjunction(&mut self) -> Result<Term, ParseError> {
        self.nary(TokenKind::Or, Operator::Or, Self::conjunction)
    }

    fn conjunction(&mut self) -> Result<Term, ParseError> {
        self.nary(TokenKind::And, Operator::And, Self::negation)
    }

    fn negation(&mut self) -> Result<Term, ParseError> {
        let start = self.peek().span.start;
        if self.eat(&TokenKind::Not) {
            let inner = self.negation()?;
            return Ok(self.mk(
                Value::Expression(Operation {
                    operator: Operator::Not,
                    args: vec![inner],
                }),
                start,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Term, ParseError> {
        let start = self.peek().span.start;
        let left = self.additive()?;
        let operator = match self.peek().kind {
            TokenKind::Unify => Operator::Unify,
            TokenKind::EqEq => Operator::Eq,
            TokenKind::Neq => Operator::Neq,
            TokenKind::Lt => Operator::Lt,
            TokenKind::Leq => Operator::Leq,
            TokenKind::Gt => Operator::Gt,
            TokenKind::Geq => Operator::Geq,
            TokenKind::In => Operator::In,
            TokenKind::Matches => Operator::Isa,
            TokenKind::Assign => Operator::Assign,
            _ => return Ok(left),
        };
        self.bump();
        let right = if operator == Operator::Isa {
            self.pattern()?
        } else {
            self.additive()?
        };
        Ok(self.mk(
            Value::Expression(Operation {
                operator,
                args: vec![left, right],
            }),
            start,
        ))
    }

    fn binary_chain(
        &mut self,
        ops: &[(TokenKind, Operator)],
        next: fn(&mut Self) -> Result<Term, ParseError>,
    ) -> Result<Term, ParseError> {
        let start = self.peek().span.start;
        let mut left = next(self)?;
        'chain: loop {
            for (tok, operator) in ops {
                if self.eat(tok) {
                    let right = next(self)?;
                    left = self.mk(
                        Value::Expression(Operation {
                            operator: *operator,
                            args: vec![left, right],
                        }),
                        start,
                    );
                    continue 'chain;
                }
            }
            return Ok(left);
        }
    }

    fn additive(&mut self) -> Result<Term, ParseError> {
        self.binary_chain(
            &[(TokenKind::Plus, Operator::Add), (TokenKind::Minus, Operator::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Term, ParseError> {
        self.binary_chain(
            &[
                (TokenKind::Star, Operator::Mul),
                (TokenKind::Slash, Operator::Div),
                (TokenKind::Mod, Operator::Mod),
                (TokenKind::Rem, Operator::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Term, ParseError> {
        let start = self.peek().span.start;
        if !self.eat(&TokenKind::Minus) {
            return self.postfix();
        }
        match self.peek().kind {
            TokenKind::Integer(i) => {
                self.bump();
                let n = i.checked_neg().ok_or_else(|| {
                    self.error_at(format!("integer -{i} is out of range"), Span { start, end: start })
                })?;
                Ok(self.mk(Value::Number(Numeric::Integer(n)), start))
            }
            TokenKind::Float(f) => {
                self.bump();
                Ok(self.mk(Value::Number(Numeric::Float(-f)), start))
            }
            _ => {
                let operand = self.unary()?;
                Ok(self.mk(
                    Value::Expression(Operation {
                        operator: Operator::Sub,
                        args: vec![Term::int(0), operand],
                    }),
                    start,
                ))
            }
        }
    }

    fn postfix(&mut self) -> Result<Term, ParseError> {
        let start = self.peek().span.start;
        let mut term = self.primary()?;
        while self.eat(&TokenKind::Dot) {
            let (name, _) = self.ident()?;
            let field = if self.at(&TokenKind::LParen) {
                let args = self.arguments()?;
                Term::new(Value::Call(Call {
                    name: Symbol(name),
                    args,
                }))
            } else {
                Term::string(name)
            };
            term = self.mk(
                Value::Expression(Operation {
                    operator: Operator::Dot,
                    args: vec![term, field],
                }),
                start,
            );
        }
        Ok(term)
    }

    fn arguments(&mut self) -> Result<Vec<Term>, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                args.push(self.expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Term, ParseError> {
        let start = self.peek().span.start;
        match self.peek().kind.clone() {
            TokenKind::Integer(i) => {
                self.bump();
                Ok(self.mk(Value::Number(Numeric::Integer(i)), start))
            }
            TokenKind::Float(f) => {
                self.bump();
                Ok(self.mk(Value::Number(Numeric::Float(f)), start))
            }
            TokenKind::Str(s) => {
                self.bump();
                Ok(self.mk(Value::String(s), start))
            }
            TokenKind::True | TokenKind::False => {
                let b = self.bump().kind == TokenKind::True;
                Ok(self.mk(Value::Boolean(b), start))
            }
            TokenKind::Ident(name) => {
                self.bump();
                if self.at(&TokenKind::LParen) {
                    let args = self.arguments()?;
                    return Ok(self.mk(
                        Value::Call(Call {
                            name: Symbol(name),
                            args,
                        }),
                        start,
                    ));
                }
                if name == "cut" {
                    return Ok(self.mk(
                        Value::Call(Call {
                            name: Symbol(name),
                            args: vec![],
                        }),
                        start,
                    ));
                }
                let var = self.variable(name);
                Ok(self.mk(Value::Variable(var), start))
            }
            TokenKind::LParen => {
                self.bump();
                let inner = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => self.list(),
            TokenKind::LBrace => {
                let fields = self.fields()?;
                Ok(self.mk(Value::Dictionary(fields), start))
            }
            _ => Err(self.unexpected("a term")),
        }
    }

    fn variable(&mut self, name: String) -> Symbol {
        if name == "_" {
            self.anonymous += 1;
            Symbol(format!("_{}", self.anonymous))
        } else {
            Symbol(name)
        }
    }

    fn list(&mut self) -> Result<Term, ParseError> {
        let start = self.expect(TokenKind::LBracket)?.span.start;
        let mut elements = Vec::new();
        let mut rest_var = None;
        while !self.at(&TokenKind::RBracket) {
            if self.eat(&TokenKind::Star) {
                let (name, _) = self.ident()?;
                rest_var = Some(self.variable(name));
                break;
            }
            elements.push(self.expr()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBracket)?;
        Ok(self.mk(Value::List(List { elements, rest_var }), start))
    }

    fn fields(&mut self) -> Result<Dictionary, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut dict = Dictionary::new();
        while !self.at(&TokenKind::RBrace) {
            let key = match self.peek().kind.clone() {
                TokenKind::Ident(k) | TokenKind::Str(k) => {
                    self.bump();
                    k
                }
                _ => return Err(self.unexpected("a field name")),
            };
            self.expect(TokenKind::Colon)?;
            let value = self.expr()?;
            dict.fields.insert(Symbol(key), value);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(src: &str) -> String {
        parse_query(src).unwrap().to_string()
    }

    #[test]
    fn precedence_of_logical_operators() {
        assert_eq!(query("a or b and not c"), "a or b and not c");
        let t = parse_query("a or b and c").unwrap();
        let op = t.value().as_expression().unwrap();
        assert_eq!(op.operator, Operator::Or);
        assert_eq!(op.args.len(), 2);
    }

    #[test]
    fn lookups_and_method_calls() {
        assert_eq!(query("user.org.name = \"acme\""), "user.org.name = \"acme\"");
        assert_eq!(query("x.has_role(\"admin\", r)"), "x.has_role(\"admin\", r)");
    }

    #[test]
    fn arithmetic_is_left_associative() {
        let t = parse_query("1 - 2 - 3").unwrap();
        let op = t.value().as_expression().unwrap();
        assert_eq!(op.operator, Operator::Sub);
        assert_eq!(op.args[1], Term::int(3));
        assert_eq!(query("x = -4"), "x = -4");
    }

    #[test]
    fn lists_dicts_and_patterns() {
        assert_eq!(query("[1, *rest] = xs"), "[1, *rest] = xs");
        assert_eq!(query("d = {a: 1, \"b\": 2}"), "d = {a: 1, b: 2}");
        assert_eq!(query("u matches User{name: n}"), "u matches User{name: n}");
    }

    #[test]
    fn anonymous_variables_are_distinct() {
        let t = parse_query("f(_, _)").unwrap();
        assert_eq!(t.to_string(), "f(_1, _2)");
    }

    #[test]
    fn rules_and_inline_queries() {
        let lines = parse_lines(
            "allow(a, \"read\", r: Doc) if r.owner = a;\n?= allow(1, \"read\", 2);\nf();",
            Some("policy.polar"),
        )
        .unwrap();
        assert_eq!(lines.len(), 3);
        let Line::Rule(rule) = &lines[0] else {
            panic!("expected rule")
        };
        assert_eq!(rule.params.len(), 3);
        assert!(rule.params[2].specializer.is_some());
        let src = rule.source.as_ref().unwrap();
        assert_eq!((src.line, src.column), (1, 1));
        assert_eq!(src.filename.as_deref(), Some("policy.polar"));
        assert!(matches!(lines[1], Line::Query(_)));
        let Line::Rule(fact) = &lines[2] else {
            panic!("expected fact")
        };
        assert!(fact.is_fact());
    }

    #[test]
    fn rule_types_are_bodiless_declarations() {
        let lines = parse_lines("type allow(actor: User, action: String, resource);", None).unwrap();
        let Line::RuleType(declared) = &lines[0] else {
            panic!("expected a rule type")
        };
        assert_eq!(declared.name, Symbol::new("allow"));
        assert_eq!(declared.params.len(), 3);
        assert!(declared.params[2].specializer.is_none());

        let err = parse_lines("type f(x) if x = 1;", None).unwrap_err();
        assert!(err.message.contains("cannot have a body"));
        assert_eq!((err.line, err.column), (1, 1));
    }

    #[test]
    fn errors_carry_line_and_column() {
        let err = parse_lines("f(x);\ng(x) if ;", None).unwrap_err();
        assert_eq!((err.line, err.column), (2, 9));
        assert!(err.message.contains("expected a term"));
    }

    #[test]
    fn missing_semicolon_is_reported() {
        let err = parse_lines("f(x)", None).unwrap_err();
        assert!(err.message.contains("`;`"));
    }
}
