//! Expression language for template placeholders.
//!
//! Supports names, numeric/string/boolean/null literals, unary minus,
//! `+ - * / // %`, parentheses, indexing (`a[0]`, `a['key']`) and field access
//! (`a.key`). Arithmetic follows the usual dynamic-language conventions: `/`
//! always yields a float, `//` floors, `%` takes the sign of the divisor.

use serde_json::Value as JsonValue;

use crate::error::EvalError;
use crate::types::RowValues;

use super::scope::{Binding, Layered};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(RowValues),
    Name(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(BinOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut idx = 0;

    while idx < chars.len() {
        let c = chars[idx];
        match c {
            _ if c.is_whitespace() => idx += 1,
            '(' => {
                tokens.push(Token::LParen);
                idx += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                idx += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                idx += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                idx += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                idx += 1;
            }
            '+' => {
                tokens.push(Token::Op(BinOp::Add));
                idx += 1;
            }
            '-' => {
                tokens.push(Token::Op(BinOp::Sub));
                idx += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinOp::Mul));
                idx += 1;
            }
            '%' => {
                tokens.push(Token::Op(BinOp::Rem));
                idx += 1;
            }
            '/' => {
                if chars.get(idx + 1) == Some(&'/') {
                    tokens.push(Token::Op(BinOp::FloorDiv));
                    idx += 2;
                } else {
                    tokens.push(Token::Op(BinOp::Div));
                    idx += 1;
                }
            }
            '\'' | '"' => {
                let (text, next) = scan_string(&chars, idx)?;
                tokens.push(Token::Str(text));
                idx = next;
            }
            _ if c.is_ascii_digit() => {
                let (token, next) = scan_number(&chars, idx)?;
                tokens.push(token);
                idx = next;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = idx;
                while idx < chars.len() && (chars[idx].is_alphanumeric() || chars[idx] == '_') {
                    idx += 1;
                }
                tokens.push(Token::Ident(chars[start..idx].iter().collect()));
            }
            other => {
                return Err(EvalError::Syntax(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

fn scan_string(chars: &[char], start: usize) -> Result<(String, usize), EvalError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut idx = start + 1;
    while idx < chars.len() {
        match chars[idx] {
            '\\' => {
                let escaped = chars
                    .get(idx + 1)
                    .ok_or_else(|| EvalError::Syntax("unterminated string literal".into()))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                idx += 2;
            }
            c if c == quote => return Ok((out, idx + 1)),
            c => {
                out.push(c);
                idx += 1;
            }
        }
    }
    Err(EvalError::Syntax("unterminated string literal".into()))
}

fn scan_number(chars: &[char], start: usize) -> Result<(Token, usize), EvalError> {
    let mut idx = start;
    let mut is_float = false;
    while idx < chars.len() && chars[idx].is_ascii_digit() {
        idx += 1;
    }
    if chars.get(idx) == Some(&'.') && chars.get(idx + 1).is_some_and(char::is_ascii_digit) {
        is_float = true;
        idx += 1;
        while idx < chars.len() && chars[idx].is_ascii_digit() {
            idx += 1;
        }
    }
    if matches!(chars.get(idx), Some('e' | 'E')) {
        let mut exp_end = idx + 1;
        if matches!(chars.get(exp_end), Some('+' | '-')) {
            exp_end += 1;
        }
        if chars.get(exp_end).is_some_and(char::is_ascii_digit) {
            is_float = true;
            idx = exp_end;
            while idx < chars.len() && chars[idx].is_ascii_digit() {
                idx += 1;
            }
        }
    }

    let literal: String = chars[start..idx].iter().collect();
    let token = if is_float {
        Token::Float(
            literal
                .parse()
                .map_err(|e| EvalError::Syntax(format!("bad float literal {literal}: {e}")))?,
        )
    } else {
        Token::Int(
            literal
                .parse()
                .map_err(|e| EvalError::Syntax(format!("bad integer literal {literal}: {e}")))?,
        )
    };
    Ok((token, idx))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), EvalError> {
        match self.bump() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(EvalError::Syntax(format!("expected {what}, found {token:?}"))),
            None => Err(EvalError::Syntax(format!("expected {what}, found end of input"))),
        }
    }

    // sum := product (('+' | '-') product)*
    fn sum(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.product()?;
        while let Some(Token::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // product := unary (('*' | '/' | '//' | '%') unary)*
    fn product(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::FloorDiv | BinOp::Rem))) =
            self.peek()
        {
            let op = *op;
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Some(Token::Op(BinOp::Sub)) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op(BinOp::Add)) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.sum()?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.bump() {
                        Some(Token::Ident(name)) => expr = Expr::Field(Box::new(expr), name),
                        _ => return Err(EvalError::Syntax("expected field name after '.'".into())),
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        match self.bump() {
            Some(Token::Int(i)) => Ok(Expr::Literal(RowValues::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(RowValues::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(RowValues::Text(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" | "True" => Expr::Literal(RowValues::Bool(true)),
                "false" | "False" => Expr::Literal(RowValues::Bool(false)),
                "null" | "None" => Expr::Literal(RowValues::Null),
                _ => Expr::Name(name),
            }),
            Some(Token::LParen) => {
                let inner = self.sum()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(token) => Err(EvalError::Syntax(format!("unexpected token {token:?}"))),
            None => Err(EvalError::Syntax("empty expression".into())),
        }
    }
}

/// Parse a placeholder expression.
pub(crate) fn parse(src: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(EvalError::Syntax("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.sum()?;
    if let Some(token) = parser.peek() {
        return Err(EvalError::Syntax(format!("unexpected trailing token {token:?}")));
    }
    Ok(expr)
}

impl Expr {
    /// Evaluate against a (possibly layered) scope.
    pub(crate) fn eval(&self, env: Layered<'_>) -> Result<Binding, EvalError> {
        match self {
            Expr::Name(name) => env
                .lookup(name)
                .cloned()
                .ok_or_else(|| EvalError::UnresolvedName(name.clone())),
            other => other.eval_value(env).map(Binding::Value),
        }
    }

    fn eval_value(&self, env: Layered<'_>) -> Result<RowValues, EvalError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(_) => match self.eval(env)? {
                Binding::Value(value) => Ok(value),
                Binding::Fragment(_) => Err(EvalError::FragmentAsValue),
            },
            Expr::Neg(inner) => negate(inner.eval_value(env)?),
            Expr::Binary(op, lhs, rhs) => binary(*op, lhs.eval_value(env)?, rhs.eval_value(env)?),
            Expr::Index(base, index) => subscript(base.eval_value(env)?, index.eval_value(env)?),
            Expr::Field(base, name) => field(base.eval_value(env)?, name),
        }
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(value: &RowValues) -> Option<Num> {
    match value {
        RowValues::Int(i) => Some(Num::Int(*i)),
        RowValues::Float(f) => Some(Num::Float(*f)),
        RowValues::Bool(b) => Some(Num::Int(i64::from(*b))),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(num: Num) -> f64 {
    match num {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

fn negate(value: RowValues) -> Result<RowValues, EvalError> {
    match as_num(&value) {
        Some(Num::Int(i)) => i.checked_neg().map(RowValues::Int).ok_or(EvalError::Overflow),
        Some(Num::Float(f)) => Ok(RowValues::Float(-f)),
        None => Err(EvalError::TypeMismatch(format!(
            "bad operand type for unary -: '{}'",
            value.type_name()
        ))),
    }
}

fn binary(op: BinOp, lhs: RowValues, rhs: RowValues) -> Result<RowValues, EvalError> {
    match (as_num(&lhs), as_num(&rhs)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => int_op(op, a, b),
        (Some(a), Some(b)) => float_op(op, to_f64(a), to_f64(b)),
        _ => match (op, lhs, rhs) {
            (BinOp::Add, RowValues::Text(a), RowValues::Text(b)) => Ok(RowValues::Text(a + &b)),
            (BinOp::Mul, RowValues::Text(s), RowValues::Int(n))
            | (BinOp::Mul, RowValues::Int(n), RowValues::Text(s)) => repeat_text(&s, n),
            (op, lhs, rhs) => Err(EvalError::TypeMismatch(format!(
                "'{}' {} '{}'",
                lhs.type_name(),
                op.symbol(),
                rhs.type_name()
            ))),
        },
    }
}

/// `text * n`; a non-positive count yields an empty string.
fn repeat_text(s: &str, n: i64) -> Result<RowValues, EvalError> {
    let count = usize::try_from(n).unwrap_or(0);
    if s.is_empty() || count == 0 {
        return Ok(RowValues::Text(String::new()));
    }
    let len = s.len().checked_mul(count).ok_or(EvalError::Overflow)?;
    let mut out = String::new();
    out.try_reserve_exact(len).map_err(|_| EvalError::Overflow)?;
    for _ in 0..count {
        out.push_str(s);
    }
    Ok(RowValues::Text(out))
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<RowValues, EvalError> {
    let value = match op {
        BinOp::Add => a.checked_add(b).ok_or(EvalError::Overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or(EvalError::Overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or(EvalError::Overflow)?,
        #[allow(clippy::cast_precision_loss)]
        BinOp::Div => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            return Ok(RowValues::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            let q = a.checked_div(b).ok_or(EvalError::Overflow)?;
            if a % b != 0 && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Rem => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            let r = a.checked_rem(b).ok_or(EvalError::Overflow)?;
            if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }
        }
    };
    Ok(RowValues::Int(value))
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<RowValues, EvalError> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::FloorDiv | BinOp::Rem if b == 0.0 => {
            return Err(EvalError::DivisionByZero);
        }
        BinOp::Div => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Rem => a - b * (a / b).floor(),
    };
    Ok(RowValues::Float(value))
}

fn resolve_position(index: i64, len: usize) -> Result<usize, EvalError> {
    let len_i = i64::try_from(len).map_err(|_| EvalError::Overflow)?;
    let pos = if index < 0 { len_i + index } else { index };
    if (0..len_i).contains(&pos) {
        usize::try_from(pos).map_err(|_| EvalError::IndexOutOfRange(index))
    } else {
        Err(EvalError::IndexOutOfRange(index))
    }
}

fn subscript(base: RowValues, index: RowValues) -> Result<RowValues, EvalError> {
    match (base, index) {
        (RowValues::JSON(JsonValue::Array(items)), RowValues::Int(i)) => {
            let pos = resolve_position(i, items.len())?;
            Ok(RowValues::from_json(items[pos].clone()))
        }
        (RowValues::JSON(JsonValue::Object(map)), RowValues::Text(key)) => map
            .get(&key)
            .cloned()
            .map(RowValues::from_json)
            .ok_or(EvalError::MissingField(key)),
        (RowValues::Text(text), RowValues::Int(i)) => {
            let chars: Vec<char> = text.chars().collect();
            let pos = resolve_position(i, chars.len())?;
            Ok(RowValues::Text(chars[pos].to_string()))
        }
        (RowValues::Blob(bytes), RowValues::Int(i)) => {
            let pos = resolve_position(i, bytes.len())?;
            Ok(RowValues::Int(i64::from(bytes[pos])))
        }
        (base, index) => Err(EvalError::TypeMismatch(format!(
            "'{}' is not subscriptable by '{}'",
            base.type_name(),
            index.type_name()
        ))),
    }
}

fn field(base: RowValues, name: &str) -> Result<RowValues, EvalError> {
    match base {
        RowValues::JSON(JsonValue::Object(map)) => map
            .get(name)
            .cloned()
            .map(RowValues::from_json)
            .ok_or_else(|| EvalError::MissingField(name.to_string())),
        other => Err(EvalError::TypeMismatch(format!(
            "'{}' has no field '{name}'",
            other.type_name()
        ))),
    }
}
