//! Constrained-Code Parser
//!
//! Grammar of the action language accepted from the model:
//!
//! ```text
//! script   := (call | for | "pass")*
//! module   := funcdef*
//! funcdef  := "def" NAME "(" params ")" ["->" type] ":" block
//! for      := "for" NAME "in" (list | NAME | "range" "(" expr ["," expr] ")") ":" block
//! call     := NAME "(" [arg ("," arg)*] ")"
//! arg      := expr | NAME "=" expr
//! expr     := STRING | NUMBER | "-" NUMBER | True | False | None | list | NAME
//! ```
//!
//! Calls must name a known action, names must be in scope, and nothing else
//! (imports, attribute access, operators, assignment, nested calls) is
//! accepted. Lexing and parsing are single pass over the input.

use std::collections::HashSet;

use super::types::{Param, Value};

/// Maximum bracket / block nesting
const MAX_NESTING: usize = 32;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "return", "class", "with", "try", "except", "finally",
    "lambda", "global", "nonlocal", "del", "async", "await", "yield", "raise", "assert",
    "break", "continue", "exec", "eval",
];

/// Parse failure with the position of the offending token
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Names the parser accepts as call targets
pub trait ActionNames {
    fn is_action(&self, name: &str) -> bool;
}

impl ActionNames for HashSet<String> {
    fn is_action(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl ActionNames for Vec<String> {
    fn is_action(&self, name: &str) -> bool {
        self.iter().any(|n| n == name)
    }
}

impl<const N: usize> ActionNames for [&str; N] {
    fn is_action(&self, name: &str) -> bool {
        self.contains(&name)
    }
}

/// Source position (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: usize,
    pub column: usize,
}

/// Parsed action text
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub body: Vec<Stmt>,
}

impl Script {
    pub fn call_count(&self) -> usize {
        count_calls(&self.body)
    }
}

/// Parsed domain action source
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub functions: Vec<FunctionDef>,
}

impl Module {
    pub fn call_count(&self) -> usize {
        self.functions.iter().map(|f| count_calls(&f.body)).sum()
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub returns: Option<String>,
    pub docstring: Option<String>,
    pub body: Vec<Stmt>,
    /// Verbatim text of the definition
    pub source: String,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Call(Call),
    For(ForLoop),
    Pass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForLoop {
    pub var: String,
    pub iter: Iterable,
    pub body: Vec<Stmt>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Iterable {
    Items(Vec<Expr>),
    Var(String),
    Range { start: Expr, stop: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Var(String),
}

/// Count call statements, each loop body counted once
pub fn count_calls(stmts: &[Stmt]) -> usize {
    stmts
        .iter()
        .map(|s| match s {
            Stmt::Call(_) => 1,
            Stmt::For(f) => count_calls(&f.body),
            Stmt::Pass => 0,
        })
        .sum()
}

/// Validate action text without keeping the tree
pub fn validate(src: &str, known: &dyn ActionNames) -> Result<(), ParseError> {
    parse_script(src, known).map(|_| ())
}

/// Parse action text emitted by the agent
pub fn parse_script(src: &str, known: &dyn ActionNames) -> Result<Script, ParseError> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser::new(src, tokens, known, HashSet::new());
    parser.script()
}

/// Parse a module of action definitions
///
/// Functions defined in the module may call each other regardless of order.
pub fn parse_module(src: &str, known: &dyn ActionNames) -> Result<Module, ParseError> {
    let tokens = Lexer::new(src).tokenize()?;
    let local = tokens
        .windows(2)
        .filter_map(|w| match (&w[0].tok, &w[1].tok) {
            (Tok::Name(kw), Tok::Name(name)) if kw == "def" => Some(name.clone()),
            _ => None,
        })
        .collect();
    let mut parser = Parser::new(src, tokens, known, local);
    parser.module()
}

/// Extract fenced code pieces from model output
///
/// An unterminated fence runs to the end of the text.
pub fn extract_code_pieces(text: &str, start: &str, end: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find(start) {
        let body = &rest[idx + start.len()..];
        match body.find(end) {
            Some(end_idx) => {
                pieces.push(body[..end_idx].trim().to_string());
                rest = &body[end_idx + end.len()..];
            }
            None => {
                pieces.push(body.trim().to_string());
                break;
            }
        }
    }
    pieces
}

/// Remove the common leading whitespace of all non-blank lines
pub fn dedent(text: &str) -> String {
    let margin = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    text.lines()
        .map(|l| l.get(margin..).unwrap_or_else(|| l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Equals,
    Arrow,
    Minus,
    Star,
    Pipe,
    Dot,
    Op(char),
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Name(n) => format!("'{}'", n),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Int(_) | Tok::Float(_) => "number".to_string(),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::LBrace => "'{'".to_string(),
            Tok::RBrace => "'}'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Colon => "':'".to_string(),
            Tok::Equals => "'='".to_string(),
            Tok::Arrow => "'->'".to_string(),
            Tok::Minus => "'-'".to_string(),
            Tok::Star => "'*'".to_string(),
            Tok::Pipe => "'|'".to_string(),
            Tok::Dot => "'.'".to_string(),
            Tok::Op(c) => format!("'{}'", c),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
    start: usize,
    end: usize,
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    /// Column of `pos`, counted in chars from 1
    column: usize,
    depth: usize,
    indents: Vec<usize>,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            column: 1,
            depth: 0,
            indents: vec![0],
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn column(&self) -> usize {
        self.column
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            column: self.column(),
            message: message.into(),
        }
    }

    fn push(&mut self, tok: Tok, line: usize, column: usize, start: usize) {
        self.tokens.push(Token {
            tok,
            line,
            column,
            start,
            end: self.pos,
        });
    }

    fn push_structural(&mut self, tok: Tok) {
        let (line, column, start) = (self.line, self.column(), self.pos);
        self.tokens.push(Token {
            tok,
            line,
            column,
            start,
            end: start,
        });
    }

    fn last_is_line_break(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        loop {
            if self.at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    break;
                }
                continue;
            }

            let c = match self.peek() {
                Some(c) => c,
                None => break,
            };
            let (line, column, start) = (self.line, self.column(), self.pos);

            match c {
                ' ' | '\t' | '\x0c' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    if self.depth == 0 {
                        self.push_structural(Tok::Newline);
                        self.at_line_start = true;
                    }
                    self.bump();
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.bump();
                    match self.peek() {
                        Some('\n') => {
                            self.bump();
                        }
                        Some('\r') if self.peek_nth(1) == Some('\n') => {
                            self.bump();
                            self.bump();
                        }
                        _ => return Err(self.error("unexpected character after line continuation")),
                    }
                }
                '"' | '\'' => {
                    let s = self.string(false)?;
                    self.push(Tok::Str(s), line, column, start);
                }
                c if c.is_ascii_digit() => {
                    let tok = self.number()?;
                    self.push(tok, line, column, start);
                }
                '.' if self.peek_nth(1).map_or(false, |d| d.is_ascii_digit()) => {
                    let tok = self.number()?;
                    self.push(tok, line, column, start);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let name = self.name();
                    if matches!(self.peek(), Some('"') | Some('\'')) {
                        match name.to_ascii_lowercase().as_str() {
                            "r" | "u" => {
                                let s = self.string(name.eq_ignore_ascii_case("r"))?;
                                self.push(Tok::Str(s), line, column, start);
                                continue;
                            }
                            "f" | "b" | "rb" | "br" | "fr" | "rf" => {
                                return Err(ParseError {
                                    line,
                                    column,
                                    message: format!("'{}' string prefix is not allowed", name),
                                });
                            }
                            _ => {}
                        }
                    }
                    self.push(Tok::Name(name), line, column, start);
                }
                '(' | '[' | '{' => {
                    self.depth += 1;
                    if self.depth > MAX_NESTING {
                        return Err(self.error("nesting too deep"));
                    }
                    self.bump();
                    let tok = match c {
                        '(' => Tok::LParen,
                        '[' => Tok::LBracket,
                        _ => Tok::LBrace,
                    };
                    self.push(tok, line, column, start);
                }
                ')' | ']' | '}' => {
                    if self.depth == 0 {
                        return Err(self.error(format!("unmatched '{}'", c)));
                    }
                    self.depth -= 1;
                    self.bump();
                    let tok = match c {
                        ')' => Tok::RParen,
                        ']' => Tok::RBracket,
                        _ => Tok::RBrace,
                    };
                    self.push(tok, line, column, start);
                }
                '-' => {
                    self.bump();
                    let tok = if self.peek() == Some('>') {
                        self.bump();
                        Tok::Arrow
                    } else {
                        Tok::Minus
                    };
                    self.push(tok, line, column, start);
                }
                ',' | ':' | '=' | '*' | '|' | '.' => {
                    self.bump();
                    let tok = match c {
                        ',' => Tok::Comma,
                        ':' => Tok::Colon,
                        '=' if self.peek() == Some('=') => {
                            self.bump();
                            Tok::Op('=')
                        }
                        '=' => Tok::Equals,
                        '*' => Tok::Star,
                        '|' => Tok::Pipe,
                        _ => Tok::Dot,
                    };
                    self.push(tok, line, column, start);
                }
                other => {
                    self.bump();
                    self.push(Tok::Op(other), line, column, start);
                }
            }
        }

        if self.depth > 0 {
            return Err(self.error("unexpected end of input: unclosed bracket"));
        }
        if !self.last_is_line_break() {
            self.push_structural(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push_structural(Tok::Dedent);
        }
        self.push_structural(Tok::Eof);
        Ok(self.tokens)
    }

    /// Handle leading whitespace of a logical line; false at end of input
    fn indentation(&mut self) -> Result<bool, ParseError> {
        let mut width = 0;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width += 8 - width % 8,
                '\x0c' => width = 0,
                _ => break,
            }
            self.bump();
        }

        match self.peek() {
            None => return Ok(false),
            Some('\n') => {
                self.bump();
                return Ok(true);
            }
            Some('\r') => {
                self.bump();
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(true);
            }
            _ => {}
        }

        let top = self.indents.last().copied().unwrap_or(0);
        if width > top {
            self.indents.push(width);
            self.push_structural(Tok::Indent);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push_structural(Tok::Dedent);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        if self.indents.len() > MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        self.at_line_start = false;
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn name(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    fn number(&mut self) -> Result<Tok, ParseError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.bump();
            } else if c == '.' && !is_float {
                is_float = true;
                self.bump();
            } else if (c == 'e' || c == 'E')
                && self
                    .peek_nth(1)
                    .map_or(false, |d| d.is_ascii_digit() || d == '+' || d == '-')
            {
                is_float = true;
                self.bump();
                if matches!(self.peek(), Some('+') | Some('-')) {
                    self.bump();
                }
            } else {
                break;
            }
        }
        let text: String = self.src[start..self.pos].chars().filter(|c| *c != '_').collect();
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.error(format!("invalid number literal '{}'", text)))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.error(format!("invalid integer literal '{}'", text)))
        }
    }

    fn string(&mut self, raw: bool) -> Result<String, ParseError> {
        let quote = match self.bump() {
            Some(q) => q,
            None => return Err(self.error("unterminated string literal")),
        };
        let triple = self.peek() == Some(quote) && self.peek_nth(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut out = String::new();
        loop {
            let c = match self.peek() {
                Some(c) => c,
                None => return Err(self.error("unterminated string literal")),
            };
            if c == quote {
                if !triple {
                    self.bump();
                    break;
                }
                if self.peek_nth(1) == Some(quote) && self.peek_nth(2) == Some(quote) {
                    self.bump();
                    self.bump();
                    self.bump();
                    break;
                }
            }
            if c == '\n' && !triple {
                return Err(self.error("unterminated string literal"));
            }
            self.bump();
            if c != '\\' {
                out.push(c);
                continue;
            }

            let esc = match self.bump() {
                Some(e) => e,
                None => return Err(self.error("unterminated string literal")),
            };
            if raw {
                out.push('\\');
                out.push(esc);
                continue;
            }
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                '\n' => {}
                'x' => out.push(self.hex_escape(2)?),
                'u' => out.push(self.hex_escape(4)?),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
        }
        Ok(out)
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, ParseError> {
        let mut code = 0u32;
        for _ in 0..digits {
            let d = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("truncated escape sequence"))?;
            code = code * 16 + d;
        }
        char::from_u32(code).ok_or_else(|| self.error("invalid escape sequence"))
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    known: &'a dyn ActionNames,
    local: HashSet<String>,
    scope: Vec<String>,
    depth: usize,
    last_end: usize,
}

impl<'a> Parser<'a> {
    fn new(
        src: &'a str,
        tokens: Vec<Token>,
        known: &'a dyn ActionNames,
        local: HashSet<String>,
    ) -> Self {
        Self {
            src,
            tokens,
            pos: 0,
            known,
            local,
            scope: Vec::new(),
            depth: 0,
            last_end: 0,
        }
    }

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek_nth(&self, n: usize) -> &Tok {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].tok
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        if !matches!(token.tok, Tok::Newline | Tok::Indent | Tok::Dedent | Tok::Eof) {
            self.last_end = token.end;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let token = self.current();
        ParseError {
            line: token.line,
            column: token.column,
            message: message.into(),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        self.error(format!("expected {}, found {}", expected, self.peek().describe()))
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<Token, ParseError> {
        if *self.peek() == tok {
            Ok(self.advance())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_name(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek().clone() {
            Tok::Name(name) if !is_keyword(&name) => {
                self.check_identifier(&name)?;
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn check_identifier(&self, name: &str) -> Result<(), ParseError> {
        if name.starts_with("__") {
            return Err(self.error(format!("name '{}' is not allowed", name)));
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == Tok::Newline {
            self.advance();
        }
    }

    fn script(&mut self) -> Result<Script, ParseError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Eof => break,
                Tok::Indent => return Err(self.error("unexpected indent")),
                Tok::Name(n) if n == "def" => {
                    return Err(self.error("function definitions are not allowed in actions"))
                }
                _ => body.push(self.statement()?),
            }
        }
        Ok(Script { body })
    }

    fn module(&mut self) -> Result<Module, ParseError> {
        let mut functions: Vec<FunctionDef> = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Eof => break,
                Tok::Indent => return Err(self.error("unexpected indent")),
                Tok::Name(n) if n == "def" => {
                    let function = self.funcdef()?;
                    if functions.iter().any(|f| f.name == function.name) {
                        return Err(ParseError {
                            line: function.pos.line,
                            column: function.pos.column,
                            message: format!("function '{}' is defined twice", function.name),
                        });
                    }
                    functions.push(function);
                }
                Tok::Name(n) if n == "import" || n == "from" => {
                    return Err(self.error("import statements are not allowed"))
                }
                _ => {
                    return Err(
                        self.error("only function definitions are allowed in an action module")
                    )
                }
            }
        }
        Ok(Module { functions })
    }

    fn funcdef(&mut self) -> Result<FunctionDef, ParseError> {
        let def = self.advance();
        let pos = Pos {
            line: def.line,
            column: def.column,
        };
        let name = self.expect_name("function name")?;
        self.expect(Tok::LParen, "'('")?;
        let params = self.params()?;
        self.expect(Tok::RParen, "')'")?;

        let returns = if *self.peek() == Tok::Arrow {
            self.advance();
            Some(self.annotation(true)?)
        } else {
            None
        };
        self.expect(Tok::Colon, "':'")?;

        let outer = self.scope.len();
        self.scope.extend(params.iter().map(|p| p.name.clone()));
        let (docstring, body) = self.block(true)?;
        self.scope.truncate(outer);

        let end = self.src[self.last_end..]
            .find('\n')
            .map_or(self.src.len(), |i| self.last_end + i);
        let source = self.src[def.start..end].trim_end().to_string();

        Ok(FunctionDef {
            name,
            params,
            returns,
            docstring,
            body,
            source,
            pos,
        })
    }

    fn params(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params: Vec<Param> = Vec::new();
        while *self.peek() != Tok::RParen {
            let variadic = if *self.peek() == Tok::Star {
                self.advance();
                if *self.peek() == Tok::Star {
                    return Err(self.error("keyword variadic parameters are not allowed"));
                }
                true
            } else {
                false
            };
            let name = self.expect_name("parameter name")?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error(format!("duplicate parameter '{}'", name)));
            }

            let annotation = if *self.peek() == Tok::Colon {
                self.advance();
                Some(self.annotation(false)?)
            } else {
                None
            };

            let default = if *self.peek() == Tok::Equals {
                if variadic {
                    return Err(self.error("variadic parameter cannot have a default"));
                }
                self.advance();
                Some(self.literal()?)
            } else {
                None
            };

            if default.is_none()
                && !variadic
                && params.iter().any(|p| p.default.is_some() && !p.variadic)
            {
                return Err(self.error("non-default argument follows default argument"));
            }

            params.push(Param {
                name,
                annotation,
                default,
                variadic,
            });

            match self.peek() {
                Tok::Comma => {
                    self.advance();
                }
                Tok::RParen => {}
                _ => return Err(self.unexpected("',' or ')'")),
            }
        }
        Ok(params)
    }

    /// Type annotation kept as source text
    fn annotation(&mut self, is_return: bool) -> Result<String, ParseError> {
        let start = self.current().start;
        let mut end = start;
        let mut depth = 0usize;
        loop {
            match self.peek() {
                Tok::LBracket | Tok::LParen => depth += 1,
                Tok::RBracket => depth = depth.saturating_sub(1),
                Tok::RParen if depth > 0 => depth -= 1,
                Tok::RParen | Tok::Comma | Tok::Equals if depth == 0 && !is_return => break,
                Tok::Colon if depth == 0 && is_return => break,
                Tok::Newline | Tok::Eof | Tok::Indent | Tok::Dedent => break,
                Tok::Name(n) if n.starts_with("__") => {
                    return Err(self.error(format!("name '{}' is not allowed", n)))
                }
                _ => {}
            }
            end = self.advance().end;
        }
        if end == start {
            return Err(self.unexpected("type annotation"));
        }
        Ok(self.src[start..end].to_string())
    }

    /// Statements after a ':'; returns the leading docstring when allowed
    fn block(&mut self, allow_doc: bool) -> Result<(Option<String>, Vec<Stmt>), ParseError> {
        self.enter()?;
        let result = if *self.peek() != Tok::Newline {
            let stmt = self.statement()?;
            Ok((None, vec![stmt]))
        } else {
            self.skip_newlines();
            self.expect(Tok::Indent, "an indented block")?;

            let mut docstring = None;
            if allow_doc {
                if let Tok::Str(doc) = self.peek().clone() {
                    if *self.peek_nth(1) == Tok::Newline {
                        self.advance();
                        self.advance();
                        docstring = Some(doc);
                    }
                }
            }

            let mut body = Vec::new();
            loop {
                self.skip_newlines();
                match self.peek() {
                    Tok::Dedent => {
                        self.advance();
                        break;
                    }
                    Tok::Eof => break,
                    _ => body.push(self.statement()?),
                }
            }
            if body.is_empty() && docstring.is_none() {
                return Err(self.unexpected("an indented block"));
            }
            Ok((docstring, body))
        };
        self.leave();
        result
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        let name = match self.peek().clone() {
            Tok::Name(name) => name,
            Tok::Str(_) => return Err(self.error("bare expressions are not allowed")),
            _ => return Err(self.unexpected("a statement")),
        };

        match name.as_str() {
            "for" => return self.for_loop(),
            "pass" => {
                self.advance();
                self.end_of_statement()?;
                return Ok(Stmt::Pass);
            }
            "def" => return Err(self.error("nested function definitions are not allowed")),
            "import" | "from" => return Err(self.error("import statements are not allowed")),
            kw if FORBIDDEN_KEYWORDS.contains(&kw) => {
                return Err(self.error(format!("'{}' statements are not allowed", kw)))
            }
            _ => {}
        }

        let call = match self.peek_nth(1) {
            Tok::LParen => self.call()?,
            Tok::Equals => return Err(self.error("assignment is not allowed")),
            Tok::Dot => return Err(self.error("attribute access is not allowed")),
            _ => return Err(self.error(format!("expected a call to '{}'", name))),
        };
        self.end_of_statement()?;
        Ok(Stmt::Call(call))
    }

    fn end_of_statement(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            Tok::Dot => Err(self.error("attribute access is not allowed")),
            Tok::Op(';') => Err(self.error("';' is not allowed, put each action on its own line")),
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn call(&mut self) -> Result<Call, ParseError> {
        let token = self.current().clone();
        let pos = Pos {
            line: token.line,
            column: token.column,
        };
        let name = match token.tok {
            Tok::Name(ref n) => n.clone(),
            _ => return Err(self.unexpected("action name")),
        };
        self.check_identifier(&name)?;
        if !self.known.is_action(&name) && !self.local.contains(&name) {
            return Err(self.error(format!("unknown action '{}'", name)));
        }
        self.advance();
        self.expect(Tok::LParen, "'('")?;

        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while *self.peek() != Tok::RParen {
            let is_keyword_arg = matches!(self.peek(), Tok::Name(_)) && *self.peek_nth(1) == Tok::Equals;
            if is_keyword_arg {
                let key = self.expect_name("argument name")?;
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == key) {
                    return Err(self.error(format!("keyword argument '{}' repeated", key)));
                }
                let value = self.expr()?;
                kwargs.push((key, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                if *self.peek() == Tok::Star {
                    return Err(self.error("argument unpacking is not allowed"));
                }
                args.push(self.expr()?);
            }

            match self.peek() {
                Tok::Comma => {
                    self.advance();
                }
                Tok::RParen => {}
                _ => return Err(self.after_expr_error("',' or ')'")),
            }
        }
        self.advance();

        Ok(Call {
            name,
            args,
            kwargs,
            pos,
        })
    }

    fn for_loop(&mut self) -> Result<Stmt, ParseError> {
        let token = self.advance();
        let pos = Pos {
            line: token.line,
            column: token.column,
        };
        let var = self.expect_name("loop variable")?;
        match self.peek() {
            Tok::Name(n) if n == "in" => {
                self.advance();
            }
            Tok::Comma => return Err(self.error("tuple unpacking is not allowed")),
            _ => return Err(self.unexpected("'in'")),
        }

        let iter = match self.peek().clone() {
            Tok::LBracket | Tok::LParen => match self.primary()? {
                Expr::List(items) => Iterable::Items(items),
                _ => return Err(self.error("expected a list to iterate over")),
            },
            Tok::Name(n) if n == "range" && *self.peek_nth(1) == Tok::LParen => {
                self.advance();
                self.advance();
                let first = self.expr()?;
                let (start, stop) = if *self.peek() == Tok::Comma {
                    self.advance();
                    let stop = self.expr()?;
                    (first, stop)
                } else {
                    (Expr::Literal(Value::Int(0)), first)
                };
                if *self.peek() == Tok::Comma {
                    return Err(self.error("range step is not allowed"));
                }
                self.expect(Tok::RParen, "')'")?;
                Iterable::Range { start, stop }
            }
            Tok::Name(n) if *self.peek_nth(1) == Tok::LParen => {
                return Err(self.error(format!("cannot iterate over a call to '{}'", n)))
            }
            Tok::Name(_) => match self.primary()? {
                Expr::Var(name) => Iterable::Var(name),
                _ => return Err(self.error("expected a list to iterate over")),
            },
            _ => return Err(self.unexpected("a list to iterate over")),
        };
        if *self.peek() != Tok::Colon {
            return Err(self.after_expr_error("':'"));
        }
        self.advance();

        self.scope.push(var.clone());
        let body = self.block(false);
        self.scope.pop();
        let (_, body) = body?;

        Ok(Stmt::For(ForLoop {
            var,
            iter,
            body,
            pos,
        }))
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let expr = self.primary()?;
        match self.peek() {
            Tok::Op(_) | Tok::Star | Tok::Pipe | Tok::Minus => {
                Err(self.error("operators are not allowed in action arguments"))
            }
            Tok::Dot => Err(self.error("attribute access is not allowed")),
            Tok::LBracket => Err(self.error("subscripts are not allowed")),
            Tok::LParen => Err(self.error("nested calls are not allowed")),
            _ => Ok(expr),
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().clone() {
            Tok::Str(_) => {
                let mut s = String::new();
                while let Tok::Str(part) = self.peek().clone() {
                    s.push_str(&part);
                    self.advance();
                }
                Ok(Expr::Literal(Value::Str(s)))
            }
            Tok::Int(i) => {
                self.advance();
                Ok(Expr::Literal(Value::Int(i)))
            }
            Tok::Float(f) => {
                self.advance();
                Ok(Expr::Literal(Value::Float(f)))
            }
            Tok::Minus => {
                self.advance();
                match self.peek().clone() {
                    Tok::Int(i) => {
                        self.advance();
                        Ok(Expr::Literal(Value::Int(-i)))
                    }
                    Tok::Float(f) => {
                        self.advance();
                        Ok(Expr::Literal(Value::Float(-f)))
                    }
                    _ => Err(self.error("unary '-' only applies to number literals")),
                }
            }
            Tok::Name(n) => match n.as_str() {
                "True" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Bool(true)))
                }
                "False" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Bool(false)))
                }
                "None" => {
                    self.advance();
                    Ok(Expr::Literal(Value::None))
                }
                _ => {
                    self.check_identifier(&n)?;
                    match self.peek_nth(1) {
                        Tok::LParen => return Err(self.error("nested calls are not allowed")),
                        Tok::Dot => return Err(self.error("attribute access is not allowed")),
                        _ => {}
                    }
                    if is_keyword(&n) {
                        return Err(self.error(format!("'{}' is not allowed here", n)));
                    }
                    if !self.scope.iter().any(|s| *s == n) {
                        return Err(self.error(format!("name '{}' is not defined", n)));
                    }
                    self.advance();
                    Ok(Expr::Var(n))
                }
            },
            Tok::LBracket | Tok::LParen => {
                let close = if *self.peek() == Tok::LBracket {
                    Tok::RBracket
                } else {
                    Tok::RParen
                };
                self.enter()?;
                self.advance();
                let mut items = Vec::new();
                while *self.peek() != close {
                    items.push(self.expr()?);
                    match self.peek() {
                        Tok::Comma => {
                            self.advance();
                        }
                        t if *t == close => {}
                        _ => return Err(self.after_expr_error("',' or a closing bracket")),
                    }
                }
                self.advance();
                self.leave();
                Ok(Expr::List(items))
            }
            Tok::LBrace => Err(self.error("dict and set literals are not allowed")),
            _ => Err(self.unexpected("a literal")),
        }
    }

    /// Literal-only expression (parameter defaults)
    fn literal(&mut self) -> Result<Value, ParseError> {
        let expr = self.expr()?;
        to_literal(&expr).ok_or_else(|| self.error("default values must be literals"))
    }

    fn after_expr_error(&self, expected: &str) -> ParseError {
        match self.peek() {
            Tok::Op(_) | Tok::Star | Tok::Pipe | Tok::Minus => {
                self.error("operators are not allowed in action arguments")
            }
            Tok::Dot => self.error("attribute access is not allowed"),
            _ => self.unexpected(expected),
        }
    }
}

fn to_literal(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Literal(v) => Some(v.clone()),
        Expr::List(items) => items.iter().map(to_literal).collect::<Option<Vec<_>>>().map(Value::List),
        Expr::Var(_) => None,
    }
}

fn is_keyword(name: &str) -> bool {
    matches!(
        name,
        "def" | "for" | "in" | "pass" | "import" | "from" | "True" | "False" | "None" | "and"
            | "or" | "not" | "is"
    ) || FORBIDDEN_KEYWORDS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIONS: [&str; 6] = ["click", "fill", "scroll", "keyboard_press", "send_msg_to_user", "goto"];

    #[test]
    fn test_accepts_simple_calls() {
        let script = parse_script("click(\"12\")", &ACTIONS).unwrap();
        assert_eq!(script.body.len(), 1);

        let script = parse_script(
            "fill('237', 'white desk')\nscroll(0, -500)\nkeyboard_press(key='Enter')\n",
            &ACTIONS,
        )
        .unwrap();
        assert_eq!(script.call_count(), 3);
        match &script.body[1] {
            Stmt::Call(call) => {
                assert_eq!(call.args[1], Expr::Literal(Value::Int(-500)));
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_accepts_for_loop_over_list() {
        let src = "for bid in ['12', '13']:\n    click(bid)\nsend_msg_to_user('done')";
        let script = parse_script(src, &ACTIONS).unwrap();
        assert_eq!(script.body.len(), 2);
        assert!(matches!(script.body[0], Stmt::For(_)));

        let inline = parse_script("for bid in ['1', '2']: click(bid)", &ACTIONS).unwrap();
        assert_eq!(inline.call_count(), 1);
    }

    #[test]
    fn test_rejects_disallowed_constructs() {
        let cases = [
            "click(\"12\")\n__import__(\"os\")",
            "import os",
            "page.click('12')",
            "click('1' + '2')",
            "x = 5",
            "click(str(5))",
            "if True:\n    click('1')",
            "click(f'{x}')",
            "eval('1')",
            "click({'a': 1})",
            "click(bid)",
            "open_shell('ls')",
        ];
        for case in cases {
            assert!(parse_script(case, &ACTIONS).is_err(), "accepted: {}", case);
        }
    }

    #[test]
    fn test_error_position() {
        let err = parse_script("click('1')\nclick(a.b)", &ACTIONS).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("not defined") || err.message.contains("attribute"));

        let err = parse_script("click('1'", &ACTIONS).unwrap_err();
        assert!(err.message.contains("unclosed"));
    }

    #[test]
    fn test_long_line_is_linear() {
        let args = vec!["'1'"; 200_000].join(", ");
        let src = format!("click({})", args);
        let started = std::time::Instant::now();
        validate(&src, &ACTIONS).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        let bad = format!("click({}, x.y)", args);
        let err = parse_script(&bad, &ACTIONS).unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.column > args.len());
    }

    #[test]
    fn test_parse_module_with_docstrings() {
        let src = r#"
def search_product(search_bar_id: str, query: str):
    """Search for a product.

    Examples:
        search_product('567', 'switch case')
    """
    click(search_bar_id)
    fill(search_bar_id, query)
    keyboard_press('Enter')  # submit

def visit_pages(page_ids: list, order_id: str = '1'):
    """Visit pages then an order.

    Examples:
        visit_pages(['1816', '1824'], '1701')
    """
    for page_id in page_ids:
        click(page_id)
    search_product('1', order_id)
"#;
        let module = parse_module(src, &ACTIONS).unwrap();
        assert_eq!(module.names(), vec!["search_product", "visit_pages"]);
        assert_eq!(module.call_count(), 5);

        let first = &module.functions[0];
        assert_eq!(first.params[0].annotation.as_deref(), Some("str"));
        assert!(first.docstring.as_deref().unwrap().contains("Examples:"));
        assert!(first.source.starts_with("def search_product("));
        assert!(first.source.ends_with("keyboard_press('Enter')  # submit"));

        let second = &module.functions[1];
        assert_eq!(second.params[1].default, Some(Value::Str("1".into())));
    }

    #[test]
    fn test_annotation_text_preserved() {
        let src = "def click(bid: str, button: Literal['left', 'right'] = 'left', modifiers: list[str] = []):\n    pass\n";
        let module = parse_module(src, &ACTIONS).unwrap();
        let params = &module.functions[0].params;
        assert_eq!(params[1].annotation.as_deref(), Some("Literal['left', 'right']"));
        assert_eq!(params[2].default, Some(Value::List(vec![])));
    }

    #[test]
    fn test_module_rejects_top_level_code() {
        assert!(parse_module("click('1')", &ACTIONS).is_err());
        assert!(parse_module("from actions import *", &ACTIONS).is_err());
        let twice = "def a():\n    click('1')\ndef a():\n    click('2')\n";
        assert!(parse_module(twice, &ACTIONS).is_err());
    }

    #[test]
    fn test_extract_code_pieces() {
        let text = "thought\n```python\ndef a():\n    pass\n```\nmore\n```click('1')```\n```tail";
        let pieces = extract_code_pieces(text, "```", "```");
        assert_eq!(pieces, vec!["python\ndef a():\n    pass", "click('1')", "tail"]);

        let python = extract_code_pieces(text, "```python", "```");
        assert_eq!(python, vec!["def a():\n    pass"]);
    }
}
