//! Module transformer.
//!
//! Rewrites statement-level `import`/`export` syntax into the call-based
//! protocol the execution engine understands: an injected [`EXPORTS_RECORD`]
//! map with an `exports` field, and an injected `require(name)` resolver.
//!
//! Only statements at the top level of a unit are considered. A small
//! lexer skips strings, backtick strings (including `${...}` sections),
//! character literals and comments, so import/export-looking text inside
//! them is never touched. Anything outside the supported grammar is
//! rejected with a [`TransformError`] instead of being rewritten.
//!
//! Supported forms:
//!
//! ```text
//! import name from "src";                 let name = require("src");
//! import { a, b as c } from "src";        let _import_0 = require("src"); let a = _import_0.a; let c = _import_0.b;
//! import * as ns from "src";              let ns = require("src");
//! import "src" as ns;                     let ns = require("src");
//! import "src";                           require("src");
//! export default expr;                    unit.exports = expr;
//! export default fn name(..) {..}         fn name(..) {..}        + unit.exports = Fn("name");
//! export { a, b as c };                   unit.exports = #{ a: a, c: b };
//! export const X = ..;                    const X = ..;           + unit.exports.X = X;
//! export fn name(..) {..}                 fn name(..) {..}        + unit.exports.name = Fn("name");
//! export x as y;                          unit.exports.y = x;
//! ```
//!
//! Output keeps every original line at its original line number.

use std::collections::HashSet;

use thiserror::Error;

/// Name of the record injected into every unit; its `exports` field is the
/// unit's exported surface.
pub const EXPORTS_RECORD: &str = "unit";

/// Name of the injected module resolver.
pub const REQUIRE_FN: &str = "require";

/// A unit that cannot be rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct TransformError {
    /// 1-based line of the offending statement.
    pub line: usize,
    pub message: String,
}

/// Rewrite one unit of source text. Pure and deterministic.
pub fn transform(source: &str) -> Result<String, TransformError> {
    let scan = scan(source)?;
    let mut renderer = Renderer {
        src: source,
        fn_names: scan.fn_names,
        trailing: Vec::new(),
        temps: 0,
    };

    let mut out = String::with_capacity(source.len() + 64);
    let mut last = 0;
    for stmt in &scan.statements {
        out.push_str(&source[last..stmt.start]);
        let replacement = renderer.render(stmt)?;
        out.push_str(&replacement);
        let original = newlines(&source[stmt.start..stmt.end]);
        for _ in newlines(&replacement)..original {
            out.push('\n');
        }
        last = stmt.end;
    }
    out.push_str(&source[last..]);

    if !renderer.trailing.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        if scan.needs_separator {
            out.push_str("; ");
        }
        out.push_str(&renderer.trailing.join(" "));
        out.push('\n');
    }

    Ok(out)
}

fn newlines(text: &str) -> usize {
    text.bytes().filter(|b| *b == b'\n').count()
}

fn line_at(src: &str, offset: usize) -> usize {
    newlines(&src[..offset.min(src.len())]) + 1
}

// ==================== Lexer ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    Str,
    Template,
    Char,
    Number,
    Punct(u8),
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, at: usize, message: impl Into<String>) -> TransformError {
        TransformError {
            line: line_at(self.src, at),
            message: message.into(),
        }
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn skip_trivia(&mut self) -> Result<(), TransformError> {
        loop {
            match (self.peek_at(0), self.peek_at(1)) {
                (Some(b), _) if b.is_ascii_whitespace() => self.pos += 1,
                (Some(b'/'), Some(b'/')) => {
                    while let Some(b) = self.peek_at(0) {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let start = self.pos;
                    self.pos += 2;
                    let mut depth = 1;
                    while depth > 0 {
                        match (self.peek_at(0), self.peek_at(1)) {
                            (None, _) => return Err(self.error(start, "unterminated block comment")),
                            (Some(b'/'), Some(b'*')) => {
                                depth += 1;
                                self.pos += 2;
                            }
                            (Some(b'*'), Some(b'/')) => {
                                depth -= 1;
                                self.pos += 2;
                            }
                            _ => self.pos += 1,
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next(&mut self) -> Result<Option<Token>, TransformError> {
        self.skip_trivia()?;
        let start = self.pos;
        let Some(b) = self.peek_at(0) else {
            return Ok(None);
        };

        let kind = match b {
            b'"' => {
                self.quoted(start, b'"', "unterminated string literal")?;
                TokenKind::Str
            }
            b'\'' => {
                self.quoted(start, b'\'', "unterminated character literal")?;
                TokenKind::Char
            }
            b'`' => {
                self.template(start)?;
                TokenKind::Template
            }
            b if is_ident_start(b) => {
                while self.peek_at(0).is_some_and(is_ident_continue) {
                    self.pos += 1;
                }
                TokenKind::Word
            }
            b if b.is_ascii_digit() => {
                while self.peek_at(0).is_some_and(is_ident_continue) {
                    self.pos += 1;
                }
                TokenKind::Number
            }
            _ => {
                self.pos += 1;
                while self.pos < self.bytes.len() && !self.src.is_char_boundary(self.pos) {
                    self.pos += 1;
                }
                TokenKind::Punct(b)
            }
        };

        Ok(Some(Token {
            kind,
            start,
            end: self.pos,
        }))
    }

    fn quoted(&mut self, start: usize, close: u8, message: &str) -> Result<(), TransformError> {
        self.pos += 1;
        loop {
            match self.peek_at(0) {
                None => return Err(self.error(start, message)),
                Some(b'\n') if close == b'\'' => return Err(self.error(start, message)),
                Some(b'\\') => self.pos += 2,
                Some(b) if b == close => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn template(&mut self, start: usize) -> Result<(), TransformError> {
        self.pos += 1;
        loop {
            match (self.peek_at(0), self.peek_at(1)) {
                (None, _) => return Err(self.error(start, "unterminated backtick string")),
                (Some(b'\\'), _) => self.pos += 2,
                (Some(b'`'), _) => {
                    self.pos += 1;
                    return Ok(());
                }
                (Some(b'$'), Some(b'{')) => {
                    self.pos += 2;
                    self.interpolation(start)?;
                }
                _ => self.pos += 1,
            }
        }
    }

    fn interpolation(&mut self, start: usize) -> Result<(), TransformError> {
        let mut depth = 1;
        loop {
            let Some(token) = self.next()? else {
                return Err(self.error(start, "unterminated backtick string"));
            };
            match token.kind {
                TokenKind::Punct(b'{') => depth += 1,
                TokenKind::Punct(b'}') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }
}

// ==================== Statement scan ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StmtKind {
    Import,
    Export,
}

#[derive(Debug)]
struct Stmt {
    kind: StmtKind,
    start: usize,
    /// Exclusive; includes the terminating `;` when there is one.
    end: usize,
    /// Tokens of the statement without the terminating `;`.
    tokens: Vec<Token>,
}

struct Scan {
    statements: Vec<Stmt>,
    fn_names: HashSet<String>,
    /// The unit's last token cannot be followed by another statement as is.
    needs_separator: bool,
}

fn word<'s>(src: &'s str, token: &Token) -> Option<&'s str> {
    (token.kind == TokenKind::Word).then(|| &src[token.start..token.end])
}

fn scan(src: &str) -> Result<Scan, TransformError> {
    let mut lexer = Lexer::new(src);
    let mut statements = Vec::new();
    let mut fn_names = HashSet::new();
    let mut depth = 0usize;
    let mut at_start = true;
    let mut last_kind = None;

    while let Some(token) = lexer.next()? {
        last_kind = Some(token.kind);

        if depth == 0 && at_start {
            match word(src, &token) {
                Some(keyword @ ("import" | "export")) => {
                    let kind = if keyword == "import" {
                        StmtKind::Import
                    } else {
                        StmtKind::Export
                    };
                    let stmt = collect_statement(&mut lexer, kind, token)?;
                    if let Some(name) = exported_fn_name(src, &stmt) {
                        fn_names.insert(name.to_string());
                    }
                    last_kind = Some(TokenKind::Punct(b';'));
                    statements.push(stmt);
                    continue;
                }
                Some("fn") | Some("private") => {
                    if let Some(name) = peek_fn_name(&mut lexer, src, &token)? {
                        fn_names.insert(name.to_string());
                    }
                }
                _ => {}
            }
        }

        at_start = false;
        match token.kind {
            TokenKind::Punct(b'{' | b'(' | b'[') => depth += 1,
            TokenKind::Punct(close @ (b'}' | b')' | b']')) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| lexer.error(token.start, format!("unbalanced '{}'", close as char)))?;
                at_start = depth == 0 && close == b'}';
            }
            TokenKind::Punct(b';') => at_start = depth == 0,
            _ => {}
        }
    }

    let needs_separator = !matches!(last_kind, None | Some(TokenKind::Punct(b';' | b'}')));
    Ok(Scan {
        statements,
        fn_names,
        needs_separator,
    })
}

/// Name declared by `fn name` or `private fn name`, without consuming input.
fn peek_fn_name<'s>(
    lexer: &mut Lexer<'s>,
    src: &'s str,
    first: &Token,
) -> Result<Option<&'s str>, TransformError> {
    let saved = lexer.pos;
    let mut next = lexer.next()?;
    if word(src, first) == Some("private") {
        if next.as_ref().and_then(|t| word(src, t)) != Some("fn") {
            lexer.pos = saved;
            return Ok(None);
        }
        next = lexer.next()?;
    }
    let name = next.as_ref().and_then(|t| word(src, t));
    lexer.pos = saved;
    Ok(name)
}

fn exported_fn_name<'s>(src: &'s str, stmt: &Stmt) -> Option<&'s str> {
    if stmt.kind != StmtKind::Export {
        return None;
    }
    let words: Vec<_> = stmt.tokens.iter().take(4).map(|t| word(src, t)).collect();
    match words.as_slice() {
        [_, Some("fn"), Some(name), ..] => Some(*name),
        [_, Some("default"), Some("fn"), Some(name)] => Some(*name),
        _ => None,
    }
}

fn collect_statement(lexer: &mut Lexer<'_>, kind: StmtKind, first: Token) -> Result<Stmt, TransformError> {
    let src = lexer.src;
    let mut tokens = vec![first];
    let mut depth = 0usize;

    loop {
        let Some(token) = lexer.next()? else {
            let end = src.len();
            return Ok(Stmt {
                kind,
                start: first.start,
                end,
                tokens,
            });
        };

        match token.kind {
            TokenKind::Punct(b';') if depth == 0 => {
                return Ok(Stmt {
                    kind,
                    start: first.start,
                    end: token.end,
                    tokens,
                });
            }
            TokenKind::Punct(b'{' | b'(' | b'[') => depth += 1,
            TokenKind::Punct(close @ (b'}' | b')' | b']')) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| lexer.error(token.start, format!("unbalanced '{}'", close as char)))?;
                tokens.push(token);
                let fn_body_closed = depth == 0 && close == b'}' && is_fn_export(src, &tokens);
                if fn_body_closed {
                    return Ok(Stmt {
                        kind,
                        start: first.start,
                        end: token.end,
                        tokens,
                    });
                }
                continue;
            }
            _ => {}
        }
        tokens.push(token);
    }
}

fn is_fn_export(src: &str, tokens: &[Token]) -> bool {
    let mut words = tokens.iter().skip(1).take(2).map(|t| word(src, t));
    match words.next() {
        Some(Some("fn")) => true,
        Some(Some("default")) => words.next() == Some(Some("fn")),
        _ => false,
    }
}

// ==================== Rendering ====================

struct Cursor<'s, 't> {
    src: &'s str,
    tokens: &'t [Token],
    idx: usize,
}

impl<'s> Cursor<'s, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.idx)
    }

    fn error(&self, message: impl Into<String>) -> TransformError {
        let at = self
            .peek()
            .or_else(|| self.tokens.last())
            .map_or(0, |t| t.start);
        TransformError {
            line: line_at(self.src, at),
            message: message.into(),
        }
    }

    fn peek_word(&self) -> Option<&'s str> {
        self.peek().and_then(|t| word(self.src, t))
    }

    fn eat_word(&mut self, expected: &str) -> bool {
        if self.peek_word() == Some(expected) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn peek_punct(&self, expected: u8) -> bool {
        self.peek().is_some_and(|t| t.kind == TokenKind::Punct(expected))
    }

    fn eat_punct(&mut self, expected: u8) -> bool {
        let found = self.peek_punct(expected);
        if found {
            self.idx += 1;
        }
        found
    }

    fn ident(&mut self, what: &str) -> Result<&'s str, TransformError> {
        match self.peek_word() {
            Some(name) => {
                self.idx += 1;
                Ok(name)
            }
            None => Err(self.error(format!("expected {what}"))),
        }
    }

    fn string(&mut self) -> Result<&'s str, TransformError> {
        match self.peek().copied() {
            Some(t) if t.kind == TokenKind::Str => {
                self.idx += 1;
                Ok(&self.src[t.start..t.end])
            }
            Some(t) if t.kind == TokenKind::Template => {
                Err(self.error("module source must be a plain string literal"))
            }
            _ => Err(self.error("expected a module source string")),
        }
    }

    fn try_string(&mut self) -> Option<&'s str> {
        match self.peek().copied() {
            Some(t) if t.kind == TokenKind::Str => {
                self.idx += 1;
                Some(&self.src[t.start..t.end])
            }
            _ => None,
        }
    }

    fn finish(&self) -> Result<(), TransformError> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(self.error(format!(
                "unexpected '{}' in import/export statement",
                &self.src[t.start..t.end]
            ))),
        }
    }

    /// Text from the current token to the end of the statement.
    fn rest(&self) -> Option<&'s str> {
        let first = self.peek()?;
        let last = self.tokens.last()?;
        Some(&self.src[first.start..last.end])
    }

    /// `{ a, b as c, }` as `(name, alias)` pairs.
    fn specifiers(&mut self) -> Result<Vec<(&'s str, &'s str)>, TransformError> {
        if !self.eat_punct(b'{') {
            return Err(self.error("expected '{'"));
        }
        let mut specs = Vec::new();
        loop {
            if self.eat_punct(b'}') {
                return Ok(specs);
            }
            let name = self.ident("a name")?;
            let alias = if self.eat_word("as") {
                self.ident("an alias after 'as'")?
            } else {
                name
            };
            specs.push((name, alias));
            if !self.eat_punct(b',') && !self.peek_punct(b'}') {
                return Err(self.error("expected ',' or '}'"));
            }
        }
    }
}

struct Renderer<'s> {
    src: &'s str,
    fn_names: HashSet<String>,
    trailing: Vec<String>,
    temps: usize,
}

impl<'s> Renderer<'s> {
    fn render(&mut self, stmt: &Stmt) -> Result<String, TransformError> {
        let mut cursor = Cursor {
            src: self.src,
            tokens: &stmt.tokens,
            idx: 1,
        };
        match stmt.kind {
            StmtKind::Import => self.import(&mut cursor),
            StmtKind::Export => self.export(&mut cursor),
        }
    }

    fn value_of(&self, name: &str) -> String {
        if self.fn_names.contains(name) {
            format!("Fn(\"{name}\")")
        } else {
            name.to_string()
        }
    }

    fn import(&mut self, c: &mut Cursor<'s, '_>) -> Result<String, TransformError> {
        if let Some(source) = c.try_string() {
            if c.eat_word("as") {
                let ns = c.ident("a namespace name after 'as'")?;
                c.finish()?;
                return Ok(format!("let {ns} = {REQUIRE_FN}({source});"));
            }
            c.finish()?;
            return Ok(format!("{REQUIRE_FN}({source});"));
        }

        let mut default = None;
        let mut namespace = None;
        let mut named = Vec::new();

        if c.eat_punct(b'*') {
            if !c.eat_word("as") {
                return Err(c.error("expected 'as' after '*'"));
            }
            namespace = Some(c.ident("a namespace name")?);
        } else if c.peek_punct(b'{') {
            named = c.specifiers()?;
        } else {
            default = Some(c.ident("an import name")?);
            if c.eat_punct(b',') {
                if c.eat_punct(b'*') {
                    if !c.eat_word("as") {
                        return Err(c.error("expected 'as' after '*'"));
                    }
                    namespace = Some(c.ident("a namespace name")?);
                } else {
                    named = c.specifiers()?;
                }
            }
        }

        if !c.eat_word("from") {
            return Err(c.error("expected 'from'"));
        }
        let source = c.string()?;
        c.finish()?;

        let target = match default.or(namespace) {
            Some(name) => name.to_string(),
            None => {
                let temp = format!("_import_{}", self.temps);
                self.temps += 1;
                temp
            }
        };

        let mut parts = vec![format!("let {target} = {REQUIRE_FN}({source});")];
        if let (Some(_), Some(ns)) = (default, namespace) {
            parts.push(format!("let {ns} = {target};"));
        }
        for (name, alias) in named {
            parts.push(format!("let {alias} = {target}.{name};"));
        }
        Ok(parts.join(" "))
    }

    fn export(&mut self, c: &mut Cursor<'s, '_>) -> Result<String, TransformError> {
        match c.peek_word() {
            Some("default") => {
                c.idx += 1;
                if c.peek_word() == Some("fn") {
                    let body = c.rest().unwrap_or_default();
                    c.idx += 1;
                    let name = c.ident("a function name")?;
                    self.trailing
                        .push(format!("{EXPORTS_RECORD}.exports = Fn(\"{name}\");"));
                    return Ok(body.to_string());
                }
                let expr = c.rest().ok_or_else(|| c.error("expected an expression after 'export default'"))?;
                Ok(format!("{EXPORTS_RECORD}.exports = {expr};"))
            }
            Some(keyword @ ("const" | "let")) => {
                let declaration = c.rest().unwrap_or_default();
                c.idx += 1;
                let name = c.ident(&format!("a name after '{keyword}'"))?;
                if !c.peek_punct(b'=') {
                    return Err(c.error(format!("expected '=' after '{name}'")));
                }
                self.trailing
                    .push(format!("{EXPORTS_RECORD}.exports.{name} = {name};"));
                Ok(format!("{declaration};"))
            }
            Some("fn") => {
                let declaration = c.rest().unwrap_or_default();
                c.idx += 1;
                let name = c.ident("a function name")?;
                self.trailing
                    .push(format!("{EXPORTS_RECORD}.exports.{name} = Fn(\"{name}\");"));
                Ok(declaration.to_string())
            }
            Some("class") => Err(c.error("'export class' is not supported; export a map or a fn instead")),
            Some("function") => Err(c.error("'export function' is not supported; use 'export fn'")),
            Some("async") => Err(c.error("async exports are not supported")),
            Some(name) => {
                c.idx += 1;
                let alias = if c.eat_word("as") {
                    c.ident("an alias after 'as'")?
                } else {
                    name
                };
                c.finish()?;
                Ok(format!("{EXPORTS_RECORD}.exports.{alias} = {};", self.value_of(name)))
            }
            None if c.peek_punct(b'*') => Err(c.error("'export * from' is not supported")),
            None if c.peek_punct(b'{') => {
                let specs = c.specifiers()?;
                if c.peek_word() == Some("from") {
                    return Err(c.error("re-exports ('export { ... } from') are not supported"));
                }
                c.finish()?;
                let fields: Vec<String> = specs
                    .iter()
                    .map(|(name, alias)| format!("{alias}: {}", self.value_of(name)))
                    .collect();
                if fields.is_empty() {
                    Ok(format!("{EXPORTS_RECORD}.exports = #{{}};"))
                } else {
                    Ok(format!("{EXPORTS_RECORD}.exports = #{{ {} }};", fields.join(", ")))
                }
            }
            None => Err(c.error("unsupported export form")),
        }
    }
}
