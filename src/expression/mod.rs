//! # Expression and Context Processing
//!
//! Evaluates the `stageEnabled` gate and performs `${...}` parameter
//! substitution over stage context before a stage starts. The grammar
//! is deliberately small: literals, dotted context references, unary
//! not, comparisons, and boolean connectives. Lookups resolve against
//! the stage context first, then the execution context.

use serde_json::{Number, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::models::Stage;

/// Expression processing failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Expression syntax error: {message}")]
    Syntax { message: String },

    #[error("Expression evaluation error: {message}")]
    Evaluation { message: String },
}

impl ExpressionError {
    fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
        }
    }
}

/// Lookup scope for expression evaluation
pub struct EvaluationContext<'a> {
    stage: &'a HashMap<String, Value>,
    execution: &'a HashMap<String, Value>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(stage: &'a HashMap<String, Value>, execution: &'a HashMap<String, Value>) -> Self {
        Self { stage, execution }
    }

    /// Evaluation scope of a stage: its own context over the execution's
    pub fn for_stage(stage: &'a Stage, execution_context: &'a HashMap<String, Value>) -> Self {
        Self::new(&stage.context, execution_context)
    }

    fn resolve(&self, path: &[String]) -> Value {
        let root = path.first().map(String::as_str).unwrap_or_default();
        let base = self
            .stage
            .get(root)
            .or_else(|| self.execution.get(root))
            .cloned()
            .unwrap_or(Value::Null);
        path[1..].iter().fold(base, |value, segment| match value {
            Value::Object(map) => map.get(segment).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Bool(bool),
    Number(f64),
    Str(String),
    Path(Vec<String>),
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '=' => {
                chars.next();
                if chars.next() == Some('=') {
                    tokens.push(Token::Eq);
                } else {
                    return Err(ExpressionError::syntax("expected '==' after '='"));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next() == Some('&') {
                    tokens.push(Token::And);
                } else {
                    return Err(ExpressionError::syntax("expected '&&'"));
                }
            }
            '|' => {
                chars.next();
                if chars.next() == Some('|') {
                    tokens.push(Token::Or);
                } else {
                    return Err(ExpressionError::syntax("expected '||'"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err(ExpressionError::syntax("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut literal = String::new();
                literal.push(c);
                chars.next();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        literal.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number: f64 = literal
                    .parse()
                    .map_err(|_| ExpressionError::syntax(format!("bad number literal '{literal}'")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut path = Vec::new();
                let mut segment = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        segment.push(ch);
                        chars.next();
                    } else if ch == '.' {
                        chars.next();
                        path.push(std::mem::take(&mut segment));
                    } else {
                        break;
                    }
                }
                path.push(segment);
                match (path.len(), path[0].as_str()) {
                    (1, "true") => tokens.push(Token::Bool(true)),
                    (1, "false") => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Path(path)),
                }
            }
            other => {
                return Err(ExpressionError::syntax(format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::And => "&&",
            Self::Or => "||",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Bool(bool),
    Number(f64),
    Str(String),
    Path(Vec<String>),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn parse(mut self) -> Result<Expr, ExpressionError> {
        let expr = self.or_expr()?;
        if self.position != self.tokens.len() {
            return Err(ExpressionError::syntax("trailing tokens after expression"));
        }
        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.comparison()?;
        while self.eat(&Token::And) {
            let rhs = self.comparison()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let lhs = self.unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.position += 1;
        let rhs = self.unary()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Bool(b)) => Ok(Expr::Bool(b)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Path(path)) => Ok(Expr::Path(path)),
            Some(Token::LParen) => {
                let expr = self.or_expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(ExpressionError::syntax("missing closing parenthesis"));
                }
                Ok(expr)
            }
            other => Err(ExpressionError::syntax(format!("unexpected token {other:?}"))),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Falsy: null, false, 0, "", "false". Everything else is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn eval(expr: &Expr, ctx: &EvaluationContext<'_>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Path(path) => Ok(ctx.resolve(path)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, ctx)?))),
        Expr::Binary { op, lhs, rhs } => {
            let left = eval(lhs, ctx)?;
            match op {
                BinaryOp::And => {
                    if !truthy(&left) {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(truthy(&eval(rhs, ctx)?)))
                }
                BinaryOp::Or => {
                    if truthy(&left) {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(truthy(&eval(rhs, ctx)?)))
                }
                BinaryOp::Eq | BinaryOp::Ne => {
                    let right = eval(rhs, ctx)?;
                    let equal = match (as_number(&left), as_number(&right)) {
                        (Some(a), Some(b)) => a == b,
                        _ => left == right,
                    };
                    Ok(Value::Bool(if *op == BinaryOp::Eq { equal } else { !equal }))
                }
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    let right = eval(rhs, ctx)?;
                    let (a, b) = match (as_number(&left), as_number(&right)) {
                        (Some(a), Some(b)) => (a, b),
                        _ => {
                            return Err(ExpressionError::Evaluation {
                                message: format!("'{op}' requires numeric operands"),
                            })
                        }
                    };
                    let result = match op {
                        BinaryOp::Lt => a < b,
                        BinaryOp::Le => a <= b,
                        BinaryOp::Gt => a > b,
                        BinaryOp::Ge => a >= b,
                        _ => unreachable!(),
                    };
                    Ok(Value::Bool(result))
                }
            }
        }
    }
}

/// Evaluate an expression to a value
pub fn evaluate(expression: &str, ctx: &EvaluationContext<'_>) -> Result<Value, ExpressionError> {
    let tokens = tokenize(expression)?;
    let expr = Parser::new(tokens).parse()?;
    eval(&expr, ctx)
}

/// Evaluate an expression to its truthiness
pub fn evaluate_truthy(expression: &str, ctx: &EvaluationContext<'_>) -> Result<bool, ExpressionError> {
    Ok(truthy(&evaluate(expression, ctx)?))
}

/// Evaluate a `stageEnabled` directive. Only `type == "expression"`
/// directives gate the stage; any other type leaves it enabled.
pub fn stage_enabled(directive: &Value, ctx: &EvaluationContext<'_>) -> Result<bool, ExpressionError> {
    let Value::Object(map) = directive else {
        return Ok(true);
    };
    if map.get("type").and_then(Value::as_str) != Some("expression") {
        return Ok(true);
    }
    let Some(expression) = map.get("expression").and_then(Value::as_str) else {
        return Ok(true);
    };
    evaluate_truthy(expression, ctx)
}

fn substitute_string(input: &str, ctx: &EvaluationContext<'_>) -> Result<Value, ExpressionError> {
    if !input.contains("${") {
        return Ok(Value::String(input.to_string()));
    }

    // a string that is exactly one placeholder keeps the value's type
    if input.starts_with("${") && input.ends_with('}') && input.matches("${").count() == 1 {
        let inner = &input[2..input.len() - 1];
        return evaluate(inner, ctx);
    }

    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ExpressionError::syntax("unterminated '${' placeholder"));
        };
        let value = evaluate(&after[..end], ctx)?;
        match value {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn substitute_value(value: &Value, ctx: &EvaluationContext<'_>) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => substitute_string(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), substitute_value(item, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Substitute `${...}` placeholders through every string in a context
/// map. Lookups resolve against the unsubstituted source context.
pub fn substitute_context(
    context: &HashMap<String, Value>,
    ctx: &EvaluationContext<'_>,
) -> Result<HashMap<String, Value>, ExpressionError> {
    context
        .iter()
        .map(|(key, value)| substitute_value(value, ctx).map(|v| (key.clone(), v)))
        .collect()
}
