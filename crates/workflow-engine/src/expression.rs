//! Component A — the `{{ expr }}` template evaluator.
//!
//! Pure and deterministic: no I/O, no clock reads, no randomness. Two entry
//! points matter to callers: [`resolve_value`] walks an arbitrary JSON shape
//! and expands every template string it finds; [`evaluate`] evaluates a
//! single expression string against a context and returns a native
//! [`JsonValue`] (numbers/bools/lists/maps stay typed, never stringified).

use common::error::ExpressionError;
use common::types::{ExecutionContext, JsonValue};
use once_cell::sync::Lazy;
use regex::Regex;

/// Depth limit for `resolve_value`'s recursive descent into the data shape.
const MAX_RESOLVE_DEPTH: u32 = 64;

/// Matches a string that is *exactly* one `{{ expr }}` template, nothing else.
static FULL_TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{\{\s*(.*?)\s*\}\}$").unwrap());

/// Matches every `{{ expr }}` occurrence inside a larger string.
static EMBEDDED_TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").unwrap());

/// Walk `value`, expanding every template string found at any depth.
///
/// Maps and arrays recurse structurally; any other JSON leaf is returned
/// unchanged except for strings, which go through [`evaluate_string`].
pub fn resolve_value(value: &JsonValue, ctx: &ExecutionContext) -> Result<JsonValue, ExpressionError> {
    resolve_value_depth(value, ctx, 0)
}

fn resolve_value_depth(
    value: &JsonValue,
    ctx: &ExecutionContext,
    depth: u32,
) -> Result<JsonValue, ExpressionError> {
    if depth > MAX_RESOLVE_DEPTH {
        return Err(ExpressionError::MaxDepthExceeded(MAX_RESOLVE_DEPTH));
    }
    match value {
        JsonValue::String(s) => evaluate_string(s, ctx),
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value_depth(item, ctx, depth + 1)?);
            }
            Ok(JsonValue::Array(out))
        }
        JsonValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value_depth(v, ctx, depth + 1)?);
            }
            Ok(JsonValue::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Expand templates inside one string, per spec.md §4.A:
///
/// - exact `{{ expr }}` ⇒ the native evaluated value (type preserved)
/// - embedded occurrences ⇒ string interpolation (stringified)
/// - no `{{ }}` at all ⇒ returned unchanged
pub fn evaluate_string(s: &str, ctx: &ExecutionContext) -> Result<JsonValue, ExpressionError> {
    if let Some(caps) = FULL_TEMPLATE.captures(s) {
        let expr = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        return evaluate(expr, ctx);
    }
    if !EMBEDDED_TEMPLATE.is_match(s) {
        return Ok(JsonValue::String(s.to_string()));
    }
    let mut err = None;
    let replaced = EMBEDDED_TEMPLATE.replace_all(s, |caps: &regex::Captures| {
        let expr = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        match evaluate(expr, ctx) {
            Ok(v) => stringify(&v),
            Err(e) => {
                err = Some(e);
                String::new()
            }
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    Ok(JsonValue::String(replaced.into_owned()))
}

fn stringify(v: &JsonValue) -> String {
    match v {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Evaluate one expression (the inner text of a `{{ }}` block) against `ctx`.
///
/// Lookup order per spec.md §4.A: try a dotted-path lookup against the
/// context first; if that resolves, return it verbatim. Otherwise fall back
/// to the general expression grammar (arithmetic, comparisons, indexing).
pub fn evaluate(expr: &str, ctx: &ExecutionContext) -> Result<JsonValue, ExpressionError> {
    let trimmed = expr.trim();
    if is_plain_path(trimmed) {
        if let Some(v) = ctx.get_path(trimmed) {
            return Ok(v.clone());
        }
    }
    let tokens = lex(trimmed)?;
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let ast = parser.parse_expr(0)?;
    if parser.pos != tokens.len() {
        return Err(ExpressionError::Syntax(
            trimmed.to_string(),
            "trailing tokens after expression".to_string(),
        ));
    }
    eval_ast(&ast, ctx)
}

/// A "plain path" is dots/identifiers/array indices only — no operators.
/// Used to decide whether the fast dotted-path lookup even applies.
fn is_plain_path(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let mut chars = s.chars().peekable();
    match chars.peek() {
        Some(c) if c.is_alphabetic() || *c == '_' => {}
        _ => return false,
    }
    s.chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '[' || c == ']')
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Not,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
}

fn lex(s: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
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
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Lte);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Gte);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut out = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    out.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err(ExpressionError::Syntax(s.to_string(), "unterminated string".to_string()));
                }
                tokens.push(Token::Str(out));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let num = num_str
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::Syntax(s.to_string(), format!("invalid number `{num_str}`")))?;
                tokens.push(Token::Number(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(ExpressionError::Syntax(s.to_string(), format!("unexpected character `{other}`")));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser — small precedence-climbing expression grammar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Ast {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Path(Vec<PathSegment>),
    Unary(UnOp, Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone)]
enum PathSegment {
    Field(String),
    Index(Box<Ast>),
}

#[derive(Debug, Clone, Copy)]
enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn binding_power(op: &Token) -> Option<(u8, BinOp)> {
        Some(match op {
            Token::Or => (1, BinOp::Or),
            Token::And => (2, BinOp::And),
            Token::Eq => (3, BinOp::Eq),
            Token::NotEq => (3, BinOp::NotEq),
            Token::Lt => (4, BinOp::Lt),
            Token::Lte => (4, BinOp::Lte),
            Token::Gt => (4, BinOp::Gt),
            Token::Gte => (4, BinOp::Gte),
            Token::Plus => (5, BinOp::Add),
            Token::Minus => (5, BinOp::Sub),
            Token::Star => (6, BinOp::Mul),
            Token::Slash => (6, BinOp::Div),
            Token::Percent => (6, BinOp::Mod),
            _ => return None,
        })
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Ast, ExpressionError> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.peek() {
            let Some((bp, bin_op)) = Self::binding_power(op) else {
                break;
            };
            if bp < min_bp {
                break;
            }
            self.bump();
            let rhs = self.parse_expr(bp + 1)?;
            lhs = Ast::Binary(bin_op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Ast, ExpressionError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.bump();
                Ok(Ast::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(Token::Not) => {
                self.bump();
                Ok(Ast::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Ast, ExpressionError> {
        let mut primary = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.bump();
                    let Some(Token::Ident(name)) = self.bump().cloned() else {
                        return Err(ExpressionError::Syntax(String::new(), "expected identifier after `.`".to_string()));
                    };
                    primary = match primary {
                        Ast::Path(mut segs) => {
                            segs.push(PathSegment::Field(name));
                            Ast::Path(segs)
                        }
                        other => Ast::Path(vec![PathSegment::Field(name)]).merge_base(other),
                    };
                }
                Some(Token::LBracket) => {
                    self.bump();
                    let index_expr = self.parse_expr(0)?;
                    match self.bump() {
                        Some(Token::RBracket) => {}
                        _ => return Err(ExpressionError::Syntax(String::new(), "expected `]`".to_string())),
                    }
                    primary = match primary {
                        Ast::Path(mut segs) => {
                            segs.push(PathSegment::Index(Box::new(index_expr)));
                            Ast::Path(segs)
                        }
                        other => Ast::Path(vec![PathSegment::Index(Box::new(index_expr))]).merge_base(other),
                    };
                }
                _ => break,
            }
        }
        Ok(primary)
    }

    fn parse_primary(&mut self) -> Result<Ast, ExpressionError> {
        match self.bump().cloned() {
            Some(Token::Number(n)) => Ok(Ast::Number(n)),
            Some(Token::Str(s)) => Ok(Ast::Str(s)),
            Some(Token::True) => Ok(Ast::Bool(true)),
            Some(Token::False) => Ok(Ast::Bool(false)),
            Some(Token::Null) => Ok(Ast::Null),
            Some(Token::Ident(name)) => Ok(Ast::Path(vec![PathSegment::Field(name)])),
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExpressionError::Syntax(String::new(), "expected `)`".to_string())),
                }
            }
            other => Err(ExpressionError::Syntax(
                String::new(),
                format!("unexpected token: {other:?}"),
            )),
        }
    }
}

impl Ast {
    /// `a[0]` parses base `a` first, then an index postfix with no existing
    /// path to attach to — this glues a fresh path segment list onto the
    /// already-parsed base identifier.
    fn merge_base(self, base: Ast) -> Ast {
        match base {
            Ast::Path(mut base_segs) => {
                if let Ast::Path(segs) = self {
                    base_segs.extend(segs);
                }
                Ast::Path(base_segs)
            }
            _ => self,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn eval_ast(ast: &Ast, ctx: &ExecutionContext) -> Result<JsonValue, ExpressionError> {
    match ast {
        Ast::Number(n) => Ok(serde_json::json!(n)),
        Ast::Str(s) => Ok(JsonValue::String(s.clone())),
        Ast::Bool(b) => Ok(JsonValue::Bool(*b)),
        Ast::Null => Ok(JsonValue::Null),
        Ast::Path(segs) => eval_path(segs, ctx),
        Ast::Unary(op, inner) => {
            let v = eval_ast(inner, ctx)?;
            match op {
                UnOp::Neg => as_number(&v).map(|n| serde_json::json!(-n)),
                UnOp::Not => Ok(JsonValue::Bool(!as_bool(&v))),
            }
        }
        Ast::Binary(op, lhs, rhs) => {
            // Short-circuit boolean operators evaluate the rhs lazily.
            if matches!(op, BinOp::And) {
                let l = eval_ast(lhs, ctx)?;
                if !as_bool(&l) {
                    return Ok(JsonValue::Bool(false));
                }
                let r = eval_ast(rhs, ctx)?;
                return Ok(JsonValue::Bool(as_bool(&r)));
            }
            if matches!(op, BinOp::Or) {
                let l = eval_ast(lhs, ctx)?;
                if as_bool(&l) {
                    return Ok(JsonValue::Bool(true));
                }
                let r = eval_ast(rhs, ctx)?;
                return Ok(JsonValue::Bool(as_bool(&r)));
            }
            let l = eval_ast(lhs, ctx)?;
            let r = eval_ast(rhs, ctx)?;
            eval_binary(*op, &l, &r)
        }
    }
}

fn eval_path(segs: &[PathSegment], ctx: &ExecutionContext) -> Result<JsonValue, ExpressionError> {
    let Some(PathSegment::Field(first)) = segs.first() else {
        return Err(ExpressionError::TypeError("path must start with an identifier".to_string()));
    };
    let mut current = ctx
        .get_path(first)
        .cloned()
        .ok_or_else(|| ExpressionError::UnknownIdentifier(first.clone()))?;
    for seg in &segs[1..] {
        current = match seg {
            PathSegment::Field(name) => match &current {
                JsonValue::Object(map) => map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ExpressionError::UnknownIdentifier(name.clone()))?,
                _ => return Err(ExpressionError::TypeError(format!("cannot access field `{name}` on non-object"))),
            },
            PathSegment::Index(idx_ast) => {
                let idx_val = eval_ast(idx_ast, ctx)?;
                let idx = as_number(&idx_val)? as i64;
                match &current {
                    JsonValue::Array(items) => {
                        let i = if idx < 0 { items.len() as i64 + idx } else { idx };
                        if i < 0 {
                            return Err(ExpressionError::TypeError("index out of bounds".to_string()));
                        }
                        items
                            .get(i as usize)
                            .cloned()
                            .ok_or_else(|| ExpressionError::TypeError("index out of bounds".to_string()))?
                    }
                    _ => return Err(ExpressionError::TypeError("indexing a non-array value".to_string())),
                }
            }
        };
    }
    Ok(current)
}

fn eval_binary(op: BinOp, l: &JsonValue, r: &JsonValue) -> Result<JsonValue, ExpressionError> {
    use BinOp::*;
    match op {
        Add => {
            if let (JsonValue::String(a), JsonValue::String(b)) = (l, r) {
                return Ok(JsonValue::String(format!("{a}{b}")));
            }
            Ok(serde_json::json!(as_number(l)? + as_number(r)?))
        }
        Sub => Ok(serde_json::json!(as_number(l)? - as_number(r)?)),
        Mul => Ok(serde_json::json!(as_number(l)? * as_number(r)?)),
        Div => {
            let denom = as_number(r)?;
            if denom == 0.0 {
                return Err(ExpressionError::TypeError("division by zero".to_string()));
            }
            Ok(serde_json::json!(as_number(l)? / denom))
        }
        Mod => Ok(serde_json::json!(as_number(l)? % as_number(r)?)),
        Eq => Ok(JsonValue::Bool(l == r)),
        NotEq => Ok(JsonValue::Bool(l != r)),
        Lt => Ok(JsonValue::Bool(as_number(l)? < as_number(r)?)),
        Lte => Ok(JsonValue::Bool(as_number(l)? <= as_number(r)?)),
        Gt => Ok(JsonValue::Bool(as_number(l)? > as_number(r)?)),
        Gte => Ok(JsonValue::Bool(as_number(l)? >= as_number(r)?)),
        And | Or => unreachable!("handled with short-circuit above"),
    }
}

fn as_number(v: &JsonValue) -> Result<f64, ExpressionError> {
    v.as_f64()
        .ok_or_else(|| ExpressionError::TypeError(format!("expected a number, got {v}")))
}

fn as_bool(v: &JsonValue) -> bool {
    match v {
        JsonValue::Bool(b) => *b,
        JsonValue::Null => false,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(json: serde_json::Value) -> ExecutionContext {
        ExecutionContext::from_json(json)
    }

    #[test]
    fn exact_template_preserves_native_type() {
        let ctx = ctx_with(serde_json::json!({"a": {"b": 42}}));
        let v = evaluate_string("{{ a.b }}", &ctx).unwrap();
        assert_eq!(v, serde_json::json!(42));
    }

    #[test]
    fn exact_template_preserves_list_and_bool() {
        let ctx = ctx_with(serde_json::json!({"items": [1,2,3], "ok": true}));
        assert_eq!(evaluate_string("{{ items }}", &ctx).unwrap(), serde_json::json!([1,2,3]));
        assert_eq!(evaluate_string("{{ ok }}", &ctx).unwrap(), serde_json::json!(true));
    }

    #[test]
    fn embedded_template_interpolates_as_string() {
        let ctx = ctx_with(serde_json::json!({"name": "Ada", "count": 3}));
        let v = evaluate_string("hello {{ name }}, you have {{ count }} items", &ctx).unwrap();
        assert_eq!(v, JsonValue::String("hello Ada, you have 3 items".to_string()));
    }

    #[test]
    fn plain_string_without_braces_is_unchanged() {
        let ctx = ctx_with(serde_json::json!({}));
        let v = evaluate_string("just text", &ctx).unwrap();
        assert_eq!(v, JsonValue::String("just text".to_string()));
    }

    #[test]
    fn unknown_identifier_fails() {
        let ctx = ctx_with(serde_json::json!({}));
        let err = evaluate("missing.field", &ctx).unwrap_err();
        assert!(matches!(err, ExpressionError::UnknownIdentifier(_)));
    }

    #[test]
    fn arithmetic_and_comparison() {
        let ctx = ctx_with(serde_json::json!({"a": 5, "b": 2}));
        assert_eq!(evaluate("a + b", &ctx).unwrap(), serde_json::json!(7.0));
        assert_eq!(evaluate("a > b", &ctx).unwrap(), serde_json::json!(true));
        assert_eq!(evaluate("a == 5", &ctx).unwrap(), serde_json::json!(true));
    }

    #[test]
    fn list_indexing_and_map_access() {
        let ctx = ctx_with(serde_json::json!({"items": [{"name": "x"}, {"name": "y"}]}));
        assert_eq!(evaluate("items[1].name", &ctx).unwrap(), serde_json::json!("y"));
    }

    #[test]
    fn resolve_value_walks_nested_structures() {
        let ctx = ctx_with(serde_json::json!({"a": 1}));
        let shape = serde_json::json!({"x": "{{ a }}", "y": ["{{ a }}", "plain"]});
        let resolved = resolve_value(&shape, &ctx).unwrap();
        assert_eq!(resolved, serde_json::json!({"x": 1, "y": [1, "plain"]}));
    }
}
