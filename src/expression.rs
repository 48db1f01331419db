//! Restricted expression evaluation.
//!
//! Distribution strings and function-block code run through this small
//! evaluator instead of a scripting runtime. The accepted surface is JSON
//! literals plus arithmetic, comparison, boolean logic, and string
//! concatenation over already-resolved values. References are substituted
//! before evaluation by the input resolver, so no name lookup happens here.
//!
//! Function blocks treat evaluation failure as a block error. Distribution
//! evaluation degrades to `None` instead (a malformed distribution stalls
//! its region, it does not crash the run).

use serde_json::Value;

use crate::error::{BlockError, BlockResult};

/// Evaluated fan-out collection.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluatedCollection {
    List(Vec<Value>),
    /// Entries of a keyed object, in key order.
    Keyed(Vec<(String, Value)>),
}

impl EvaluatedCollection {
    pub fn len(&self) -> usize {
        match self {
            EvaluatedCollection::List(items) => items.len(),
            EvaluatedCollection::Keyed(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn collection_from_value(value: Value) -> Option<EvaluatedCollection> {
    match value {
        Value::Array(items) => Some(EvaluatedCollection::List(items)),
        Value::Object(map) => Some(EvaluatedCollection::Keyed(map.into_iter().collect())),
        _ => None,
    }
}

/// Evaluate a loop/parallel distribution into a collection.
///
/// Accepts a JSON array/object directly, a `<block.path>` reference
/// resolved through `resolve`, or a string holding a JSON literal. Any
/// other shape or failed resolution returns `None`.
pub fn evaluate_collection(
    raw: &Value,
    resolve: &dyn Fn(&str) -> Option<Value>,
) -> Option<EvaluatedCollection> {
    match raw {
        Value::Array(_) | Value::Object(_) => collection_from_value(raw.clone()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Some(inner) = trimmed
                .strip_prefix('<')
                .and_then(|rest| rest.strip_suffix('>'))
            {
                if !inner.contains('<') && !inner.contains('>') {
                    return resolve(inner).and_then(collection_from_value);
                }
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => collection_from_value(value),
                Err(err) => {
                    tracing::warn!(
                        distribution = trimmed,
                        error = %err,
                        "distribution expression did not evaluate; leaving region inactive"
                    );
                    None
                }
            }
        }
        _ => None,
    }
}

/// Evaluate a restricted expression over already-resolved values.
pub fn evaluate(expr: &str) -> BlockResult<Value> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(BlockError::Expression("empty expression".to_string()));
    }
    // Whole-string JSON literals (numbers, quoted strings, arrays,
    // objects, booleans, null) need no parsing of our own.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    let tokens = tokenize(trimmed)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.parse_expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(BlockError::Expression(format!(
            "unexpected trailing input in expression: {trimmed}"
        )));
    }
    Ok(value)
}

/// Evaluate an expression and coerce the result to a boolean.
///
/// Mirrors truthiness of the surrounding product: `false`, `null`, `0`,
/// and `""` are false, everything else is true.
pub fn evaluate_bool(expr: &str) -> BlockResult<bool> {
    Ok(truthy(&evaluate(expr)?))
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ============================================================
// Tokenizer
// ============================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> BlockResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
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
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(BlockError::Expression(
                        "single '=' is not a valid operator".to_string(),
                    ));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::LtEq);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::GtEq);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(BlockError::Expression(
                        "single '&' is not a valid operator".to_string(),
                    ));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(BlockError::Expression(
                        "single '|' is not a valid operator".to_string(),
                    ));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&'\\') => {
                            match chars.get(i + 1) {
                                Some(&next) => literal.push(next),
                                None => {
                                    return Err(BlockError::Expression(
                                        "unterminated escape in string literal".to_string(),
                                    ))
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(BlockError::Expression(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| {
                    BlockError::Expression(format!("invalid number literal: {text}"))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    other => {
                        return Err(BlockError::Expression(format!(
                            "unknown identifier '{other}' (references must be resolved before evaluation)"
                        )))
                    }
                }
            }
            other => {
                return Err(BlockError::Expression(format!(
                    "unexpected character '{other}' in expression"
                )))
            }
        }
    }
    Ok(tokens)
}

// ============================================================
// Parser (precedence climbing)
// ============================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn binding_power(token: &Token) -> Option<u8> {
    match token {
        Token::Or => Some(1),
        Token::And => Some(2),
        Token::Eq | Token::NotEq => Some(3),
        Token::Lt | Token::LtEq | Token::Gt | Token::GtEq => Some(4),
        Token::Plus | Token::Minus => Some(5),
        Token::Star | Token::Slash | Token::Percent => Some(6),
        _ => None,
    }
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self, min_bp: u8) -> BlockResult<Value> {
        let mut lhs = self.parse_prefix()?;
        while let Some(op) = self.peek().cloned() {
            let Some(bp) = binding_power(&op) else {
                break;
            };
            if bp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.parse_expr(bp + 1)?;
            lhs = apply_binary(&op, &lhs, &rhs)?;
        }
        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> BlockResult<Value> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(number_value(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Minus) => {
                let operand = self.parse_prefix()?;
                let n = as_number(&operand)?;
                Ok(number_value(-n))
            }
            Some(Token::Not) => {
                let operand = self.parse_prefix()?;
                Ok(Value::Bool(!truthy(&operand)))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(BlockError::Expression(
                        "missing closing parenthesis".to_string(),
                    )),
                }
            }
            Some(other) => Err(BlockError::Expression(format!(
                "unexpected token {other:?}"
            ))),
            None => Err(BlockError::Expression(
                "unexpected end of expression".to_string(),
            )),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn as_number(value: &Value) -> BlockResult<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| BlockError::Expression("number out of range".to_string())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| BlockError::Expression(format!("'{s}' is not numeric"))),
        other => Err(BlockError::Expression(format!(
            "expected a number, got {other}"
        ))),
    }
}

fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_binary(op: &Token, lhs: &Value, rhs: &Value) -> BlockResult<Value> {
    match op {
        Token::Plus => {
            if lhs.is_string() || rhs.is_string() {
                Ok(Value::String(format!(
                    "{}{}",
                    display_string(lhs),
                    display_string(rhs)
                )))
            } else {
                Ok(number_value(as_number(lhs)? + as_number(rhs)?))
            }
        }
        Token::Minus => Ok(number_value(as_number(lhs)? - as_number(rhs)?)),
        Token::Star => Ok(number_value(as_number(lhs)? * as_number(rhs)?)),
        Token::Slash => {
            let divisor = as_number(rhs)?;
            if divisor == 0.0 {
                return Err(BlockError::Expression("division by zero".to_string()));
            }
            Ok(number_value(as_number(lhs)? / divisor))
        }
        Token::Percent => {
            let divisor = as_number(rhs)?;
            if divisor == 0.0 {
                return Err(BlockError::Expression("division by zero".to_string()));
            }
            Ok(number_value(as_number(lhs)? % divisor))
        }
        Token::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
        Token::NotEq => Ok(Value::Bool(!values_equal(lhs, rhs))),
        Token::Lt => compare(lhs, rhs).map(|ord| Value::Bool(ord == std::cmp::Ordering::Less)),
        Token::LtEq => {
            compare(lhs, rhs).map(|ord| Value::Bool(ord != std::cmp::Ordering::Greater))
        }
        Token::Gt => compare(lhs, rhs).map(|ord| Value::Bool(ord == std::cmp::Ordering::Greater)),
        Token::GtEq => compare(lhs, rhs).map(|ord| Value::Bool(ord != std::cmp::Ordering::Less)),
        Token::And => Ok(Value::Bool(truthy(lhs) && truthy(rhs))),
        Token::Or => Ok(Value::Bool(truthy(lhs) || truthy(rhs))),
        other => Err(BlockError::Expression(format!(
            "{other:?} is not a binary operator"
        ))),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return a == b;
    }
    lhs == rhs
}

fn compare(lhs: &Value, rhs: &Value) -> BlockResult<std::cmp::Ordering> {
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        return Ok(a.cmp(b));
    }
    let a = as_number(lhs)?;
    let b = as_number(rhs)?;
    a.partial_cmp(&b)
        .ok_or_else(|| BlockError::Expression("values are not comparable".to_string()))
}
