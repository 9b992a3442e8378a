//! Expression lexer, parser and evaluator

use super::path::Path;
use super::EvalError;
use serde_json::{Number, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Built-in functions; the full set, there is no way to call anything else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// `exists($.path)` - true when the path resolves
    Exists,
    /// `len(value)` - length of a string, array or object
    Len,
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Path),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Ident(String),
    Path(Path),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    End,
}

const OPERATORS: [&str; 16] = [
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!", "=", "&",
];

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < input.len() {
        let rest = &input[i..];
        let Some(c) = rest.chars().next() else { break };

        if c.is_whitespace() {
            i += c.len_utf8();
            continue;
        }

        match c {
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '$' => {
                let len = Path::scan(rest);
                let path = Path::parse(&rest[..len]).map_err(|e| EvalError::Syntax {
                    offset: i,
                    message: e.to_string(),
                })?;
                tokens.push((i, Token::Path(path)));
                i += len;
            }
            '"' | '\'' => {
                let (value, len) = lex_string(rest, c).ok_or(EvalError::Syntax {
                    offset: i,
                    message: "unterminated string literal".to_string(),
                })?;
                tokens.push((i, Token::Literal(Value::String(value))));
                i += len;
            }
            c if c.is_ascii_digit() => {
                let len = rest
                    .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
                    .unwrap_or(rest.len());
                let text = &rest[..len];
                let value = if text.contains('.') {
                    text.parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .map(Value::Number)
                } else {
                    // Integers past i64 keep their magnitude as floats
                    text.parse::<i64>().ok().map(Value::from).or_else(|| {
                        text.parse::<f64>()
                            .ok()
                            .and_then(Number::from_f64)
                            .map(Value::Number)
                    })
                };
                let value = value.ok_or_else(|| EvalError::Syntax {
                    offset: i,
                    message: format!("invalid number '{}'", text),
                })?;
                tokens.push((i, Token::Literal(value)));
                i += len;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let len = rest
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .unwrap_or(rest.len());
                let word = &rest[..len];
                let token = match word {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((i, token));
                i += len;
            }
            _ => {
                let op = OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(**op))
                    .ok_or_else(|| EvalError::Syntax {
                        offset: i,
                        message: format!("unexpected character '{}'", c),
                    })?;
                if *op == "=" || *op == "&" {
                    return Err(EvalError::Syntax {
                        offset: i,
                        message: format!("unknown operator '{}'", op),
                    });
                }
                tokens.push((i, Token::Op(op)));
                i += op.len();
            }
        }
    }

    tokens.push((input.len(), Token::End));
    Ok(tokens)
}

/// Returns the unescaped string and the number of bytes consumed, quotes included
fn lex_string(input: &str, quote: char) -> Option<(String, usize)> {
    let mut out = String::new();
    let mut escaped = false;
    for (offset, c) in input.char_indices().skip(1) {
        if escaped {
            out.push(match c {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some((out, offset + c.len_utf8()));
        } else {
            out.push(c);
        }
    }
    None
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Token::Op(op) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), EvalError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.eat_op(&["||"]).is_some() {
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_comparison()?;
        while self.eat_op(&["&&"]).is_some() {
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_sum()?;
        let Some(op) = self.eat_op(&["==", "!=", "<=", ">=", "<", ">"]) else {
            return Ok(left);
        };
        let op = match op {
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<=" => BinaryOp::Le,
            ">=" => BinaryOp::Ge,
            "<" => BinaryOp::Lt,
            _ => BinaryOp::Gt,
        };
        let right = self.parse_sum()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_sum(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_term()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let op = match op {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        match self.eat_op(&["-", "!"]) {
            Some("-") => Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?))),
            Some(_) => Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?))),
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.advance() {
            Token::Literal(value) => Ok(Expr::Literal(value)),
            Token::Path(path) => Ok(Expr::Path(path)),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                let function = match name.as_str() {
                    "exists" => Function::Exists,
                    "len" => Function::Len,
                    other => return Err(self.error(format!("unknown function '{}'", other))),
                };
                self.expect(Token::LParen, "'(' after function name")?;
                let mut args = Vec::new();
                if *self.peek() != Token::RParen {
                    loop {
                        args.push(self.parse_or()?);
                        if *self.peek() == Token::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen, "')'")?;
                if args.len() != 1 {
                    return Err(self.error(format!("{:?} takes exactly one argument", function)));
                }
                if function == Function::Exists && !matches!(args[0], Expr::Path(_)) {
                    return Err(self.error("exists() takes a path argument"));
                }
                Ok(Expr::Call(function, args))
            }
            Token::End => Err(self.error("unexpected end of expression")),
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }
}

impl Expr {
    /// Parse an expression string
    pub fn parse(input: &str) -> Result<Self, EvalError> {
        let mut parser = Parser {
            tokens: tokenize(input)?,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if *parser.peek() != Token::End {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Evaluate against a document
    pub fn evaluate(&self, document: &Value) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(path) => path.get(document).cloned(),
            Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!as_bool(&inner.evaluate(document)?)?)),
            Expr::Unary(UnaryOp::Neg, inner) => match inner.evaluate(document)? {
                Value::Number(n) => arithmetic(BinaryOp::Sub, &Number::from(0), &n),
                other => Err(mismatch("number", &other)),
            },
            Expr::Binary(BinaryOp::And, left, right) => {
                if !as_bool(&left.evaluate(document)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool(&right.evaluate(document)?)?))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                if as_bool(&left.evaluate(document)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool(&right.evaluate(document)?)?))
            }
            Expr::Binary(op, left, right) => {
                let left = left.evaluate(document)?;
                let right = right.evaluate(document)?;
                binary(*op, &left, &right)
            }
            Expr::Call(Function::Exists, args) => match args.first() {
                Some(Expr::Path(path)) => Ok(Value::Bool(path.get(document).is_ok())),
                _ => Err(EvalError::TypeMismatch("exists() takes a path argument".to_string())),
            },
            Expr::Call(Function::Len, args) => {
                let value = match args.first() {
                    Some(arg) => arg.evaluate(document)?,
                    None => Value::Null,
                };
                let len = match &value {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    other => return Err(mismatch("string, array or object", other)),
                };
                Ok(Value::from(len as u64))
            }
        }
    }

    /// Evaluate a predicate; anything but a boolean result is an error
    pub fn evaluate_bool(&self, document: &Value) -> Result<bool, EvalError> {
        as_bool(&self.evaluate(document)?)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(expected: &str, found: &Value) -> EvalError {
    EvalError::TypeMismatch(format!("expected {}, found {}", expected, type_name(found)))
}

fn as_bool(value: &Value) -> Result<bool, EvalError> {
    value.as_bool().ok_or_else(|| mismatch("boolean", value))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, EvalError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| EvalError::TypeMismatch("numbers are not comparable".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(EvalError::TypeMismatch(format!(
            "cannot order {} and {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(left, right)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(compare(left, right)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(left, right)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(compare(left, right)? != Ordering::Less)),
        BinaryOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b),
            _ => Err(EvalError::TypeMismatch(format!(
                "cannot add {} and {}",
                type_name(left),
                type_name(right)
            ))),
        },
        _ => match (left, right) {
            (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b),
            (Value::Number(_), other) | (other, _) => Err(mismatch("number", other)),
        },
    }
}

fn arithmetic(op: BinaryOp, left: &Number, right: &Number) -> Result<Value, EvalError> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(EvalError::DivisionByZero),
            BinaryOp::Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Value::from(result));
        }
    }

    let a = left.as_f64().unwrap_or(f64::NAN);
    let b = right.as_f64().unwrap_or(f64::NAN);
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(EvalError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(EvalError::TypeMismatch("not an arithmetic operator".to_string())),
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| EvalError::TypeMismatch("arithmetic produced a non-finite number".to_string()))
}
