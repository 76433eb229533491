//! The expression evaluator: spec.md §6 treats this as an external
//! collaborator ("the expression evaluator that computes scalar values and
//! parses macro calls"). This module defines the trait the VM depends on
//! plus a small default implementation, kept deliberately modest — general
//! expression-language design is explicitly out of scope (spec.md §1).

use thiserror::Error;

use crate::context::Context;
use crate::macro_table::MacroTable;
use crate::value::Value;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("unknown variable \"{0}\"")]
    UnknownVariable(String),
    #[error("unexpected token in expression \"{0}\"")]
    UnexpectedToken(String),
    #[error("unterminated string literal in \"{0}\"")]
    UnterminatedString(String),
    #[error("unknown function \"{0}\"")]
    UnknownFunction(String),
    #[error("wrong number of arguments to \"{0}\"")]
    ArityMismatch(String),
    #[error("empty expression")]
    Empty,
}

/// A recognized macro invocation: `name(arg, arg, ...)` with each argument
/// already evaluated to a scalar.
#[derive(Debug, Clone)]
pub struct MacroCall {
    pub name: String,
    pub args: Vec<Value>,
}

/// The `{name, args}` pair parsed out of a `@macro` declaration line.
#[derive(Debug, Clone)]
pub struct MacroDecl {
    pub name: String,
    pub args: Vec<String>,
}

/// External collaborator contract (spec.md §6): evaluate expression text,
/// recognize macro-call syntax, and parse macro declarations.
pub trait ExpressionEvaluator {
    fn evaluate(&self, expr: &str, context: &Context) -> Result<Value, ExprError>;

    /// Returns `Some` if `expr` parses as `name(args...)` where `name` is
    /// declared in `macros`; otherwise `None` (not an error — the VM falls
    /// back to treating `expr` as an ordinary expression).
    fn parse_macro_call(
        &self,
        expr: &str,
        context: &Context,
        macros: &MacroTable,
    ) -> Result<Option<MacroCall>, ExprError>;

    fn parse_macro_declaration(&self, declaration: &str) -> Result<MacroDecl, ExprError>;
}

/// Default evaluator: variables, string/number/bool literals, `+`
/// concatenation/addition, comparisons, and `name(args)` call syntax used
/// both for macro recognition and a handful of builtin functions.
#[derive(Debug, Default)]
pub struct DefaultEvaluator;

impl DefaultEvaluator {
    pub fn new() -> Self {
        DefaultEvaluator
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Plus,
    Eq,
    Ne,
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                let mut value = String::new();
                let mut closed = false;
                while j < chars.len() {
                    if chars[j] == quote {
                        closed = true;
                        break;
                    }
                    if chars[j] == '\\' && j + 1 < chars.len() {
                        value.push(chars[j + 1]);
                        j += 2;
                        continue;
                    }
                    value.push(chars[j]);
                    j += 1;
                }
                if !closed {
                    return Err(ExprError::UnterminatedString(input.to_string()));
                }
                tokens.push(Token::Str(value));
                i = j + 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| ExprError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(text));
            }
            other => {
                return Err(ExprError::UnexpectedToken(other.to_string()));
            }
        }
    }
    Ok(tokens)
}

struct TokenParser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> TokenParser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        TokenParser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    /// Parses a full `name(arg, arg, ...)` call with each argument being a
    /// comma-free subexpression, returning the raw argument text so the
    /// caller can re-evaluate each one independently (arguments may
    /// themselves be arbitrary expressions).
    fn try_parse_call<'b>(&mut self, original: &'b str) -> Option<(String, Vec<String>)> {
        let start = self.pos;
        let name = match self.peek() {
            Some(Token::Ident(n)) => n.clone(),
            _ => return None,
        };
        self.pos += 1;
        if self.peek() != Some(&Token::LParen) {
            self.pos = start;
            return None;
        }
        self.pos += 1;

        // Re-scan raw text between the matching parens so argument
        // expressions aren't limited to single tokens.
        let args_text = slice_call_args(original, &name);
        args_text.map(|args| (name, args))
    }
}

/// Finds `name(...)` in `original` (must start, ignoring leading
/// whitespace) and splits the parenthesized contents on top-level commas.
fn slice_call_args(original: &str, name: &str) -> Option<Vec<String>> {
    let trimmed = original.trim_start();
    if !trimmed.starts_with(name) {
        return None;
    }
    let rest = trimmed[name.len()..].trim_start();
    if !rest.starts_with('(') {
        return None;
    }
    let inner_start = 1;
    let mut depth = 1;
    let bytes: Vec<char> = rest.chars().collect();
    let mut end = None;
    for (idx, ch) in bytes.iter().enumerate().skip(inner_start) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(idx);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;
    let inner: String = bytes[inner_start..end].iter().collect();
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    let mut args = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for ch in inner.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                args.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    args.push(current.trim().to_string());
    Some(args)
}

impl DefaultEvaluator {
    fn eval_tokens(&self, original: &str, context: &Context) -> Result<Value, ExprError> {
        let tokens = lex(original)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }

        let mut parser = TokenParser::new(&tokens);
        if let Some((name, arg_texts)) = parser.try_parse_call(original) {
            if parser.pos == tokens.len() {
                return self.call_builtin(&name, &arg_texts, context);
            }
        }

        self.eval_additive(&tokens, original, context)
    }

    fn call_builtin(
        &self,
        name: &str,
        arg_texts: &[String],
        context: &Context,
    ) -> Result<Value, ExprError> {
        let mut args = Vec::with_capacity(arg_texts.len());
        for a in arg_texts {
            args.push(self.evaluate(a, context)?);
        }
        match name {
            "len" => {
                if args.len() != 1 {
                    return Err(ExprError::ArityMismatch(name.to_string()));
                }
                Ok(Value::Number(args[0].to_string().chars().count() as f64))
            }
            "upper" => {
                if args.len() != 1 {
                    return Err(ExprError::ArityMismatch(name.to_string()));
                }
                Ok(Value::String(args[0].to_string().to_uppercase()))
            }
            "lower" => {
                if args.len() != 1 {
                    return Err(ExprError::ArityMismatch(name.to_string()));
                }
                Ok(Value::String(args[0].to_string().to_lowercase()))
            }
            other => Err(ExprError::UnknownFunction(other.to_string())),
        }
    }

    fn eval_additive(
        &self,
        tokens: &[Token],
        original: &str,
        context: &Context,
    ) -> Result<Value, ExprError> {
        let parts: Vec<&[Token]> = split_on(tokens, &Token::Plus);
        if parts.len() == 1 {
            return self.eval_comparison(parts[0], context);
        }
        let mut acc: Option<Value> = None;
        for part in parts {
            let v = self.eval_comparison(part, context)?;
            acc = Some(match acc {
                None => v,
                Some(prev) => match (&prev, &v) {
                    (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                    _ => Value::String(format!("{}{}", prev, v)),
                },
            });
        }
        acc.ok_or_else(|| ExprError::UnexpectedToken(original.to_string()))
    }

    fn eval_comparison(&self, tokens: &[Token], context: &Context) -> Result<Value, ExprError> {
        if let Some(pos) = tokens.iter().position(|t| *t == Token::Eq) {
            let lhs = self.eval_atom(&tokens[..pos], context)?;
            let rhs = self.eval_atom(&tokens[pos + 1..], context)?;
            return Ok(Value::Bool(values_equal(&lhs, &rhs)));
        }
        if let Some(pos) = tokens.iter().position(|t| *t == Token::Ne) {
            let lhs = self.eval_atom(&tokens[..pos], context)?;
            let rhs = self.eval_atom(&tokens[pos + 1..], context)?;
            return Ok(Value::Bool(!values_equal(&lhs, &rhs)));
        }
        self.eval_atom(tokens, context)
    }

    fn eval_atom(&self, tokens: &[Token], context: &Context) -> Result<Value, ExprError> {
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        if tokens.len() == 1 {
            return match &tokens[0] {
                Token::Number(n) => Ok(Value::Number(*n)),
                Token::Str(s) => Ok(Value::String(s.clone())),
                Token::Ident(name) => match name.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => context
                        .get(name)
                        .cloned()
                        .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
                },
                other => Err(ExprError::UnexpectedToken(format!("{:?}", other))),
            };
        }

        if let Token::Ident(name) = &tokens[0] {
            if tokens[1] == Token::LParen {
                let rebuilt: String = name.clone()
                    + "("
                    + &tokens[2..tokens.len().saturating_sub(1)]
                        .iter()
                        .map(token_text)
                        .collect::<Vec<_>>()
                        .join(",")
                    + ")";
                if let Some(arg_texts) = slice_call_args(&rebuilt, name) {
                    return self.call_builtin(name, &arg_texts, context);
                }
            }
        }

        Err(ExprError::UnexpectedToken(
            tokens.iter().map(token_text).collect::<Vec<_>>().join(" "),
        ))
    }
}

fn token_text(t: &Token) -> String {
    match t {
        Token::Ident(s) => s.clone(),
        Token::Number(n) => n.to_string(),
        Token::Str(s) => format!("\"{}\"", s),
        Token::Plus => "+".to_string(),
        Token::Eq => "==".to_string(),
        Token::Ne => "!=".to_string(),
        Token::LParen => "(".to_string(),
        Token::RParen => ")".to_string(),
        Token::Comma => ",".to_string(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => a.to_string() == b.to_string(),
    }
}

fn split_on<'a>(tokens: &'a [Token], sep: &Token) -> Vec<&'a [Token]> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut depth = 0;
    for (i, t) in tokens.iter().enumerate() {
        match t {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            t if depth == 0 && t == sep => {
                parts.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts
}

impl ExpressionEvaluator for DefaultEvaluator {
    fn evaluate(&self, expr: &str, context: &Context) -> Result<Value, ExprError> {
        self.eval_tokens(expr, context)
    }

    fn parse_macro_call(
        &self,
        expr: &str,
        context: &Context,
        macros: &MacroTable,
    ) -> Result<Option<MacroCall>, ExprError> {
        let trimmed = expr.trim();
        let name_end = trimmed
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(trimmed.len());
        if name_end == 0 {
            return Ok(None);
        }
        let name = &trimmed[..name_end];
        if !macros.contains(name) {
            return Ok(None);
        }
        let Some(arg_texts) = slice_call_args(trimmed, name) else {
            return Ok(None);
        };
        let mut args = Vec::with_capacity(arg_texts.len());
        for a in &arg_texts {
            if a.is_empty() {
                continue;
            }
            args.push(self.evaluate(a, context)?);
        }
        Ok(Some(MacroCall {
            name: name.to_string(),
            args,
        }))
    }

    fn parse_macro_declaration(&self, declaration: &str) -> Result<MacroDecl, ExprError> {
        let trimmed = declaration.trim();
        let name_end = trimmed
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(trimmed.len());
        if name_end == 0 {
            return Err(ExprError::UnexpectedToken(declaration.to_string()));
        }
        let name = trimmed[..name_end].to_string();
        let rest = trimmed[name_end..].trim();
        let args = if rest.is_empty() {
            Vec::new()
        } else {
            let args_text = slice_call_args(&format!("{}{}", name, rest), &name)
                .ok_or_else(|| ExprError::UnexpectedToken(declaration.to_string()))?;
            args_text.into_iter().filter(|a| !a.is_empty()).collect()
        };
        Ok(MacroDecl { name, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(pairs: &[(&str, Value)]) -> Context {
        let mut ctx = Context::new();
        for (k, v) in pairs {
            ctx.insert(*k, v.clone());
        }
        ctx
    }

    #[test]
    fn evaluates_string_literal() {
        let eval = DefaultEvaluator::new();
        let ctx = Context::new();
        assert_eq!(
            eval.evaluate("\"hello\"", &ctx).unwrap(),
            Value::String("hello".to_string())
        );
    }

    #[test]
    fn evaluates_variable_lookup() {
        let eval = DefaultEvaluator::new();
        let ctx = ctx_with(&[("x", Value::Number(42.0))]);
        assert_eq!(eval.evaluate("x", &ctx).unwrap(), Value::Number(42.0));
    }

    #[test]
    fn unknown_variable_errors() {
        let eval = DefaultEvaluator::new();
        let ctx = Context::new();
        assert!(matches!(
            eval.evaluate("nope", &ctx),
            Err(ExprError::UnknownVariable(_))
        ));
    }

    #[test]
    fn string_concatenation() {
        let eval = DefaultEvaluator::new();
        let ctx = ctx_with(&[("name", Value::String("world".into()))]);
        assert_eq!(
            eval.evaluate("\"hello \" + name", &ctx).unwrap().to_string(),
            "hello world"
        );
    }

    #[test]
    fn numeric_addition() {
        let eval = DefaultEvaluator::new();
        let ctx = Context::new();
        assert_eq!(eval.evaluate("1 + 2", &ctx).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn builtin_len() {
        let eval = DefaultEvaluator::new();
        let ctx = Context::new();
        assert_eq!(
            eval.evaluate("len(\"abcd\")", &ctx).unwrap(),
            Value::Number(4.0)
        );
    }

    #[test]
    fn parses_macro_call_when_declared() {
        let eval = DefaultEvaluator::new();
        let ctx = Context::new();
        let mut macros = MacroTable::new();
        macros.declare(
            "GREET".to_string(),
            MacroDef {
                args: vec!["name".to_string()],
                body: Vec::new(),
                file: "f".to_string(),
                path: "".to_string(),
                line: 1,
            },
        );
        let call = eval
            .parse_macro_call("GREET(\"world\")", &ctx, &macros)
            .unwrap()
            .unwrap();
        assert_eq!(call.name, "GREET");
        assert_eq!(call.args, vec![Value::String("world".to_string())]);
    }

    #[test]
    fn non_macro_expr_parses_as_none() {
        let eval = DefaultEvaluator::new();
        let ctx = Context::new();
        let macros = MacroTable::new();
        assert!(eval
            .parse_macro_call("1 + 2", &ctx, &macros)
            .unwrap()
            .is_none());
    }

    #[test]
    fn parses_macro_declaration_with_args() {
        let eval = DefaultEvaluator::new();
        let decl = eval.parse_macro_declaration("GREET(name, title)").unwrap();
        assert_eq!(decl.name, "GREET");
        assert_eq!(decl.args, vec!["name".to_string(), "title".to_string()]);
    }

    #[test]
    fn parses_macro_declaration_without_args() {
        let eval = DefaultEvaluator::new();
        let decl = eval.parse_macro_declaration("VERSION").unwrap();
        assert_eq!(decl.name, "VERSION");
        assert!(decl.args.is_empty());
    }
}
