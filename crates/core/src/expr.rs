//! Condition and mapping expressions evaluated against a run's context.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or      := and ( ("||" | "or") and )*
//! and     := unary ( ("&&" | "and") unary )*
//! unary   := ("!" | "not") unary | compare
//! compare := operand ( ("==" | "!=" | ">" | "<" | ">=" | "<=") operand )?
//! operand := path | number | 'string' | "string" | true | false | null | "(" or ")"
//! ```
//!
//! Paths are dotted lookups into the scope object (`input.text`, `state.summary`,
//! `branch.item.name`, `result.score`); numeric segments index arrays. A path
//! that does not resolve evaluates to `null`.

use crate::error::{EngineError, EngineResult};
use crate::types::Mapping;
use serde_json::{Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> EngineResult<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(EngineError::expression(source, "unexpected trailing input"));
        }
        Ok(expr)
    }

    pub fn evaluate(&self, scope: &Value) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Path(path) => get_path(scope, path).cloned().unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!truthy(&inner.evaluate(scope))),
            Expr::And(left, right) => {
                Value::Bool(truthy(&left.evaluate(scope)) && truthy(&right.evaluate(scope)))
            }
            Expr::Or(left, right) => {
                Value::Bool(truthy(&left.evaluate(scope)) || truthy(&right.evaluate(scope)))
            }
            Expr::Compare(left, op, right) => {
                Value::Bool(compare(&left.evaluate(scope), *op, &right.evaluate(scope)))
            }
        }
    }

    pub fn is_true(&self, scope: &Value) -> bool {
        truthy(&self.evaluate(scope))
    }
}

/// Compiled `target path -> source expression` mapping
#[derive(Debug, Clone, Default)]
pub struct CompiledMapping {
    entries: Vec<(String, Expr)>,
}

impl CompiledMapping {
    pub fn compile(mapping: &Mapping) -> EngineResult<Self> {
        let entries = mapping
            .iter()
            .map(|(target, source)| {
                if target.trim().is_empty() {
                    return Err(EngineError::path(target, "empty mapping target"));
                }
                Ok((target.clone(), Expr::parse(source)?))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every entry against the scope, in target order
    pub fn evaluate(&self, scope: &Value) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .map(|(target, expr)| (target.clone(), expr.evaluate(scope)))
            .collect()
    }

    /// Resolve the mapping into a fresh object
    pub fn build(&self, scope: &Value) -> EngineResult<Value> {
        let mut out = Value::Object(Map::new());
        for (target, value) in self.evaluate(scope) {
            set_path(&mut out, &target, value)?;
        }
        Ok(out)
    }
}

/// JSON truthiness: null, false, 0, and empty strings/collections are false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Reserved state keys start with an underscore
pub fn is_reserved(key: &str) -> bool {
    key.starts_with('_')
}

/// Mapping targets may be written `state.x` or `x`
pub fn strip_state_prefix(path: &str) -> &str {
    path.strip_prefix("state.").unwrap_or(path)
}

pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `value` at a dotted path, creating intermediate objects
pub fn set_path(root: &mut Value, path: &str, value: Value) -> EngineResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(EngineError::path(path, "empty path segment"));
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(EngineError::path(path, "empty path"));
    };

    let mut current = root;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => {
                return Err(EngineError::path(
                    path,
                    format!("segment '{}' is not an object", segment),
                ))
            }
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        _ => Err(EngineError::path(path, "parent is not an object")),
    }
}

/// Recursively overlay `overlay` onto `base`; non-object values replace
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        _ => match ordering(left, right) {
            Some(ord) => match op {
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Ge => ord != Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Eq | CmpOp::Ne => false,
            },
            None => false,
        },
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Path(String),
    Literal(Value),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> EngineResult<Vec<Tok>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Tok::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Tok::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Tok::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Tok::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Tok::Not);
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next == Some('=')) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    (_, true) => CmpOp::Le,
                    (_, false) => CmpOp::Lt,
                };
                tokens.push(Tok::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(EngineError::expression(source, "unterminated string")),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Tok::Literal(Value::String(text)));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Tok::Literal(parse_number(source, &text)?));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Tok::Literal(Value::Bool(true)),
                    "false" => Tok::Literal(Value::Bool(false)),
                    "null" => Tok::Literal(Value::Null),
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    _ => Tok::Path(word),
                });
            }
            other => {
                return Err(EngineError::expression(
                    source,
                    format!("unexpected character '{}'", other),
                ))
            }
        }
    }

    if tokens.is_empty() {
        return Err(EngineError::expression(source, "empty expression"));
    }
    Ok(tokens)
}

fn parse_number(source: &str, text: &str) -> EngineResult<Value> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| EngineError::expression(source, format!("invalid number '{}'", text)))
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Tok::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Tok::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> EngineResult<Expr> {
        if self.peek() == Some(&Tok::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> EngineResult<Expr> {
        let left = self.parse_operand()?;
        if let Some(Tok::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> EngineResult<Expr> {
        match self.next() {
            Some(Tok::Path(path)) => Ok(Expr::Path(path)),
            Some(Tok::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Tok::RParen) => Ok(inner),
                    _ => Err(EngineError::expression(self.source, "expected ')'")),
                }
            }
            Some(other) => Err(EngineError::expression(
                self.source,
                format!("unexpected token {:?}", other),
            )),
            None => Err(EngineError::expression(self.source, "unexpected end of input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(source: &str, scope: &Value) -> bool {
        Expr::parse(source).unwrap().is_true(scope)
    }

    #[test]
    fn test_condition_equality() {
        let scope = json!({"state": {"status": "complete"}});

        assert!(eval("state.status == 'complete'", &scope));
        assert!(!eval("state.status == \"pending\"", &scope));
        assert!(eval("state.status != 'pending'", &scope));
    }

    #[test]
    fn test_condition_numeric() {
        let scope = json!({"state": {"count": 5, "ratio": 0.5}});

        assert!(eval("state.count > 3", &scope));
        assert!(eval("state.count >= 5", &scope));
        assert!(eval("state.count < 10", &scope));
        assert!(eval("state.count <= 5", &scope));
        assert!(eval("state.count == 5.0", &scope));
        assert!(eval("state.ratio < 1", &scope));
        assert!(eval("state.count > -1", &scope));
    }

    #[test]
    fn test_condition_boolean_logic() {
        let scope = json!({"state": {"a": true, "b": false}, "input": {"n": 2}});

        assert!(eval("state.a && !state.b", &scope));
        assert!(eval("state.b || input.n == 2", &scope));
        assert!(!eval("state.a and (state.b or input.n > 5)", &scope));
        assert!(eval("not state.b", &scope));
    }

    #[test]
    fn test_missing_path_is_falsy() {
        let scope = json!({"state": {}});

        assert!(!eval("state.missing", &scope));
        assert!(eval("state.missing == null", &scope));
        assert!(!eval("state.missing > 1", &scope));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("state.a ==").is_err());
        assert!(Expr::parse("(state.a").is_err());
        assert!(Expr::parse("'open").is_err());
        assert!(Expr::parse("state.a # 1").is_err());
    }

    #[test]
    fn test_path_lookup_indexes_arrays() {
        let scope = json!({"input": {"docs": [{"title": "a"}, {"title": "b"}]}});
        assert_eq!(get_path(&scope, "input.docs.1.title"), Some(&json!("b")));
        assert_eq!(get_path(&scope, "input.docs.9"), None);
    }

    #[test]
    fn test_set_path_creates_objects() {
        let mut root = json!({});
        set_path(&mut root, "a.b.c", json!(1)).unwrap();
        set_path(&mut root, "a.d", json!("x")).unwrap();
        assert_eq!(root, json!({"a": {"b": {"c": 1}, "d": "x"}}));

        let mut scalar = json!({"a": 3});
        assert!(set_path(&mut scalar, "a.b", json!(1)).is_err());
        assert!(set_path(&mut scalar, "a..b", json!(1)).is_err());
    }

    #[test]
    fn test_deep_merge_overlays_nested_objects() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": [1]});
        deep_merge(&mut base, &json!({"a": {"c": 3}, "d": [2]}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 3}, "d": [2]}));
    }

    #[test]
    fn test_mapping_build() {
        let mut mapping = Mapping::new();
        mapping.insert("summary".to_string(), "result.summary".to_string());
        mapping.insert("meta.source".to_string(), "'llm'".to_string());

        let compiled = CompiledMapping::compile(&mapping).unwrap();
        let built = compiled
            .build(&json!({"result": {"summary": "hi"}}))
            .unwrap();
        assert_eq!(built, json!({"summary": "hi", "meta": {"source": "llm"}}));
    }
}
