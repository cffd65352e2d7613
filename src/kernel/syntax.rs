//! Parser for the kernel's Datalog-style program text.
//!
//! Supported forms:
//!
//! ```text
//! # comment
//! verb_def(/fix, /mutation, "coder", 90).
//! wants_review(U) :- user_intent(U, /query, /review, _, _), !blocked(U).
//! ```
//!
//! Arguments are atoms (`/name`), strings, integers, floats, or variables
//! (upper-case or `_`). Bodies hold positive literals, negated literals
//! (`!p(..)`) and comparisons (`=`, `!=`, `<`, `<=`, `>`, `>=`).
//!
//! [`validate_rule`] is the grammar check applied to rule strings a model
//! emits in `mangle_updates`.

use std::collections::HashSet;

use crate::error::{PerceptionError, Result};
use crate::kernel::{Fact, Term};

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Var(String),
    Atom(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    Comma,
    Dot,
    Implies,
    Bang,
    Cmp(&'static str),
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

fn syntax_error(line: usize, msg: impl Into<String>) -> PerceptionError {
    PerceptionError::Kernel(format!("syntax error at line {}: {}", line, msg.into()))
}

impl Lexer {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn tokens(mut self) -> Result<Vec<(Tok, usize)>> {
        let mut out = Vec::new();
        while let Some(c) = self.peek() {
            let line = self.line;
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
                continue;
            }
            let tok = match c {
                '(' => {
                    self.bump();
                    Tok::LParen
                }
                ')' => {
                    self.bump();
                    Tok::RParen
                }
                ',' => {
                    self.bump();
                    Tok::Comma
                }
                '.' => {
                    self.bump();
                    Tok::Dot
                }
                ':' if self.peek_at(1) == Some('-') => {
                    self.pos += 2;
                    Tok::Implies
                }
                '!' if self.peek_at(1) == Some('=') => {
                    self.pos += 2;
                    Tok::Cmp("!=")
                }
                '!' => {
                    self.bump();
                    Tok::Bang
                }
                '=' => {
                    self.bump();
                    if self.peek() == Some('=') {
                        self.bump();
                    }
                    Tok::Cmp("=")
                }
                '<' | '>' => {
                    self.bump();
                    let eq = self.peek() == Some('=');
                    if eq {
                        self.bump();
                    }
                    match (c, eq) {
                        ('<', false) => Tok::Cmp("<"),
                        ('<', true) => Tok::Cmp("<="),
                        (_, false) => Tok::Cmp(">"),
                        (_, true) => Tok::Cmp(">="),
                    }
                }
                '"' => self.string()?,
                '/' if self.peek_at(1).map(is_name_char).unwrap_or(false) => {
                    self.bump();
                    let mut name = String::from("/");
                    while let Some(c) = self.peek() {
                        if is_name_char(c) || c == '/' || c == '-' {
                            name.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Tok::Atom(name)
                }
                c if c.is_ascii_digit()
                    || (c == '-' && self.peek_at(1).map(|d| d.is_ascii_digit()).unwrap_or(false)) =>
                {
                    self.number()?
                }
                c if c.is_ascii_lowercase() => {
                    let mut name = String::new();
                    while let Some(c) = self.peek() {
                        let namespaced = c == ':' && self.peek_at(1).map(|n| n.is_ascii_alphabetic()).unwrap_or(false);
                        if is_name_char(c) || namespaced {
                            name.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Tok::Ident(name)
                }
                c if c.is_ascii_uppercase() || c == '_' => {
                    let mut name = String::new();
                    while let Some(c) = self.peek() {
                        if is_name_char(c) {
                            name.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Tok::Var(name)
                }
                other => return Err(syntax_error(line, format!("unexpected character '{}'", other))),
            };
            out.push((tok, line));
        }
        Ok(out)
    }

    fn string(&mut self) -> Result<Tok> {
        let line = self.line;
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(syntax_error(line, "unterminated string")),
                Some('"') => return Ok(Tok::Str(value)),
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    None => return Err(syntax_error(line, "unterminated escape")),
                },
                Some(c) => value.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Tok> {
        let line = self.line;
        let mut text = String::new();
        if self.peek() == Some('-') {
            text.push('-');
            self.bump();
        }
        while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
            text.push(c);
            self.bump();
        }
        let fractional = self.peek() == Some('.') && self.peek_at(1).map(|d| d.is_ascii_digit()).unwrap_or(false);
        if fractional {
            text.push('.');
            self.bump();
            while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
                text.push(c);
                self.bump();
            }
            return text
                .parse::<f64>()
                .map(Tok::Float)
                .map_err(|e| syntax_error(line, e.to_string()));
        }
        text.parse::<i64>()
            .map(Tok::Int)
            .map_err(|e| syntax_error(line, e.to_string()))
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

// ---------------------------------------------------------------------------
// Clauses
// ---------------------------------------------------------------------------

/// An argument in a clause: a ground term or a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Term(Term),
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub predicate: String,
    pub args: Vec<Arg>,
}

impl Literal {
    fn vars(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(|a| match a {
            Arg::Var(v) if v != "_" => Some(v.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BodyItem {
    Positive(Literal),
    Negated(Literal),
    Compare { left: Arg, op: &'static str, right: Arg },
}

/// A fact (empty body) or a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub head: Literal,
    pub body: Vec<BodyItem>,
}

impl Clause {
    pub fn is_fact(&self) -> bool {
        self.body.is_empty() && self.head.args.iter().all(|a| matches!(a, Arg::Term(_)))
    }

    /// The ground fact, if this clause is one.
    pub fn into_fact(self) -> Option<Fact> {
        if !self.body.is_empty() {
            return None;
        }
        let args = self
            .head
            .args
            .into_iter()
            .map(|a| match a {
                Arg::Term(t) => Some(t),
                Arg::Var(_) => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Fact::new(self.head.predicate, args))
    }
}

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.toks
            .get(self.pos)
            .or_else(|| self.toks.last())
            .map(|(_, l)| *l)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Tok, what: &str) -> Result<()> {
        let line = self.line();
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(syntax_error(line, format!("expected {}, found {:?}", what, t))),
            None => Err(syntax_error(line, format!("expected {}, found end of input", what))),
        }
    }

    fn clause(&mut self) -> Result<Clause> {
        let head = self.literal()?;
        let mut body = Vec::new();
        if self.peek() == Some(&Tok::Implies) {
            self.pos += 1;
            loop {
                body.push(self.body_item()?);
                if self.peek() == Some(&Tok::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Tok::Dot, "'.'")?;
        Ok(Clause { head, body })
    }

    fn literal(&mut self) -> Result<Literal> {
        let line = self.line();
        let predicate = match self.next() {
            Some(Tok::Ident(name)) => name,
            Some(t) => return Err(syntax_error(line, format!("expected predicate name, found {:?}", t))),
            None => return Err(syntax_error(line, "expected predicate name")),
        };
        let mut args = Vec::new();
        if self.peek() == Some(&Tok::LParen) {
            self.pos += 1;
            if self.peek() != Some(&Tok::RParen) {
                loop {
                    args.push(self.arg()?);
                    if self.peek() == Some(&Tok::Comma) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            self.expect(Tok::RParen, "')'")?;
        }
        Ok(Literal { predicate, args })
    }

    fn arg(&mut self) -> Result<Arg> {
        let line = self.line();
        match self.next() {
            Some(Tok::Atom(a)) => Ok(Arg::Term(Term::Atom(a))),
            Some(Tok::Str(s)) => Ok(Arg::Term(Term::Str(s))),
            Some(Tok::Int(i)) => Ok(Arg::Term(Term::Int(i))),
            Some(Tok::Float(f)) => Ok(Arg::Term(Term::Float(f))),
            Some(Tok::Var(v)) => Ok(Arg::Var(v)),
            Some(t) => Err(syntax_error(line, format!("expected argument, found {:?}", t))),
            None => Err(syntax_error(line, "expected argument")),
        }
    }

    fn body_item(&mut self) -> Result<BodyItem> {
        match self.peek() {
            Some(Tok::Bang) => {
                self.pos += 1;
                Ok(BodyItem::Negated(self.literal()?))
            }
            Some(Tok::Ident(_)) => Ok(BodyItem::Positive(self.literal()?)),
            _ => {
                let left = self.arg()?;
                let line = self.line();
                let op = match self.next() {
                    Some(Tok::Cmp(op)) => op,
                    other => return Err(syntax_error(line, format!("expected comparison, found {:?}", other))),
                };
                let right = self.arg()?;
                Ok(BodyItem::Compare { left, op, right })
            }
        }
    }
}

/// Parse program text into clauses.
pub fn parse_program(source: &str) -> Result<Vec<Clause>> {
    let toks = Lexer::new(source).tokens()?;
    let mut parser = Parser { toks, pos: 0 };
    let mut clauses = Vec::new();
    while parser.peek().is_some() {
        clauses.push(parser.clause()?);
    }
    Ok(clauses)
}

/// Parse a single ground fact; the trailing period is optional.
pub fn parse_fact(text: &str) -> Result<Fact> {
    let text = text.trim();
    let source = if text.ends_with('.') {
        text.to_string()
    } else {
        format!("{}.", text)
    };
    let mut clauses = parse_program(&source)?;
    if clauses.len() != 1 {
        return Err(PerceptionError::Kernel(format!(
            "expected one fact, found {} clauses",
            clauses.len()
        )));
    }
    clauses
        .remove(0)
        .into_fact()
        .ok_or_else(|| PerceptionError::Kernel(format!("not a ground fact: {}", text)))
}

/// Validate one rule or fact string proposed by the model.
///
/// Beyond syntax, rules must be range-restricted: every head variable and
/// every variable in a negated literal or comparison must occur in a
/// positive body literal.
pub fn validate_rule(rule: &str) -> Result<()> {
    let invalid = |message: String| PerceptionError::validation("mangle_updates", message);
    let rule = rule.trim();
    if rule.is_empty() {
        return Err(invalid("empty rule".into()));
    }
    if !rule.ends_with('.') {
        return Err(invalid(format!("rule must end with '.': {}", rule)));
    }
    let clauses = parse_program(rule).map_err(|e| invalid(e.to_string()))?;
    let clause = match clauses.as_slice() {
        [one] => one,
        _ => return Err(invalid(format!("expected exactly one clause, found {}", clauses.len()))),
    };

    if clause.body.is_empty() {
        if !clause.is_fact() {
            return Err(invalid(format!("fact '{}' contains variables", clause.head.predicate)));
        }
        return Ok(());
    }

    let bound: HashSet<&str> = clause
        .body
        .iter()
        .filter_map(|item| match item {
            BodyItem::Positive(lit) => Some(lit.vars()),
            _ => None,
        })
        .flatten()
        .collect();

    for var in clause.head.vars() {
        if !bound.contains(var) {
            return Err(invalid(format!("head variable {} is not bound in the body", var)));
        }
    }
    for item in &clause.body {
        let vars: Vec<&str> = match item {
            BodyItem::Negated(lit) => lit.vars().collect(),
            BodyItem::Compare { left, right, .. } => [left, right]
                .into_iter()
                .filter_map(|a| match a {
                    Arg::Var(v) if v != "_" => Some(v.as_str()),
                    _ => None,
                })
                .collect(),
            BodyItem::Positive(_) => Vec::new(),
        };
        for var in vars {
            if !bound.contains(var) {
                return Err(invalid(format!("variable {} is only used in a negation or comparison", var)));
            }
        }
    }
    Ok(())
}
