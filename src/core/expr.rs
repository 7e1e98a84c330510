//! Formula language.
//!
//! A small Python-flavoured expression language. Formulas are parsed once into
//! an [`Expr`] tree and evaluated against a [`Lookup`] that resolves series
//! references for one evaluation window. Only the functions listed in
//! [`Function`] can be called.

use crate::store::{SeriesId, StoreError, TimeSeriesPoint};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Maximum nesting depth accepted by the parser.
pub const MAX_DEPTH: usize = 64;

/// Name bound to the main result inside a post expression.
pub const DEVICE_VALUE: &str = "device_value";

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("syntax error at {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("expression nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("unknown name: {0}")]
    UnknownName(String),
    #[error("{function}() takes {expected} argument(s), {found} given")]
    Arity {
        function: &'static str,
        expected: &'static str,
        found: usize,
    },
    #[error("no value for series {0} in window")]
    MissingValue(SeriesId),
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NonFinite,
    #[error("bad argument to {function}(): {message}")]
    BadArgument {
        function: &'static str,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves series references during one evaluation.
pub trait Lookup {
    /// Latest sample of `series` visible to the evaluation.
    fn latest(&self, series: SeriesId) -> Result<Option<TimeSeriesPoint>, StoreError>;

    /// Result of the main expression, bound while a post expression runs.
    fn device_value(&self) -> Option<f64> {
        None
    }
}

/// Whitelisted callable functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Min,
    Max,
    Round,
    Int,
    Float,
    Sqrt,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Function::Abs),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "round" => Some(Function::Round),
            "int" => Some(Function::Int),
            "float" => Some(Function::Float),
            "sqrt" => Some(Function::Sqrt),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Min => "min",
            Function::Max => "max",
            Function::Round => "round",
            Function::Int => "int",
            Function::Float => "float",
            Function::Sqrt => "sqrt",
        }
    }

    fn check_arity(self, found: usize) -> Result<(), EvalError> {
        let (ok, expected) = match self {
            Function::Min | Function::Max => (found >= 2, "at least 2"),
            Function::Round => ((1..=2).contains(&found), "1 or 2"),
            _ => (found == 1, "1"),
        };
        if ok {
            Ok(())
        } else {
            Err(EvalError::Arity {
                function: self.name(),
                expected,
                found,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed formula tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    /// Latest value of a series
    Variable(SeriesId),
    /// Timestamp, in seconds, of the latest sample of a series
    Timestamp(SeriesId),
    /// `device_value`, the result of the main expression
    DeviceValue,
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `a < b <= c`: every adjacent pair must hold
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call(Function, Vec<Expr>),
}

/// Runtime value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    pub fn as_number(self) -> f64 {
        match self {
            Value::Number(n) => n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
        }
    }

    pub fn truthy(self) -> bool {
        match self {
            Value::Number(n) => n != 0.0,
            Value::Bool(b) => b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
        }
    }
}

/// A parsed formula with its source text.
#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    root: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_expr()?;
        if let Some(token) = parser.peek() {
            return Err(parser.error_at(token.position, "unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Evaluate to a finite number.
    pub fn evaluate(&self, lookup: &dyn Lookup) -> Result<f64, EvalError> {
        let value = eval(&self.root, lookup)?.as_number();
        if value.is_finite() {
            Ok(value)
        } else {
            Err(EvalError::NonFinite)
        }
    }

    /// Whether the formula reads `device_value`.
    pub fn uses_device_value(&self) -> bool {
        uses_device_value(&self.root)
    }

    /// Series read by `variable()` or `timestamp()`, ascending.
    pub fn referenced_series(&self) -> Vec<SeriesId> {
        let mut ids = BTreeSet::new();
        collect_series(&self.root, &mut ids);
        ids.into_iter().collect()
    }
}

fn collect_series(expr: &Expr, ids: &mut BTreeSet<SeriesId>) {
    match expr {
        Expr::Variable(id) | Expr::Timestamp(id) => {
            ids.insert(*id);
        }
        Expr::Number(_) | Expr::Bool(_) | Expr::DeviceValue => {}
        Expr::Unary(_, inner) => collect_series(inner, ids),
        Expr::Binary(_, lhs, rhs) | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
            collect_series(lhs, ids);
            collect_series(rhs, ids);
        }
        Expr::Compare(first, rest) => {
            collect_series(first, ids);
            for (_, operand) in rest {
                collect_series(operand, ids);
            }
        }
        Expr::Conditional {
            condition,
            then,
            otherwise,
        } => {
            collect_series(condition, ids);
            collect_series(then, ids);
            collect_series(otherwise, ids);
        }
        Expr::Call(_, args) => {
            for arg in args {
                collect_series(arg, ids);
            }
        }
    }
}

fn uses_device_value(expr: &Expr) -> bool {
    match expr {
        Expr::DeviceValue => true,
        Expr::Number(_) | Expr::Bool(_) | Expr::Variable(_) | Expr::Timestamp(_) => false,
        Expr::Unary(_, inner) => uses_device_value(inner),
        Expr::Binary(_, lhs, rhs) | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
            uses_device_value(lhs) || uses_device_value(rhs)
        }
        Expr::Compare(first, rest) => {
            uses_device_value(first) || rest.iter().any(|(_, operand)| uses_device_value(operand))
        }
        Expr::Conditional {
            condition,
            then,
            otherwise,
        } => uses_device_value(condition) || uses_device_value(then) || uses_device_value(otherwise),
        Expr::Call(_, args) => args.iter().any(uses_device_value),
    }
}

fn eval(expr: &Expr, lookup: &dyn Lookup) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Variable(id) => {
            let point = lookup.latest(*id)?.ok_or(EvalError::MissingValue(*id))?;
            Ok(Value::Number(point.value))
        }
        Expr::Timestamp(id) => {
            let point = lookup.latest(*id)?.ok_or(EvalError::MissingValue(*id))?;
            Ok(Value::Number(
                point.timestamp.timestamp_millis() as f64 / 1000.0,
            ))
        }
        Expr::DeviceValue => lookup
            .device_value()
            .map(Value::Number)
            .ok_or_else(|| EvalError::UnknownName(DEVICE_VALUE.to_string())),
        Expr::Unary(op, inner) => {
            let value = eval(inner, lookup)?;
            Ok(match op {
                UnaryOp::Neg => Value::Number(-value.as_number()),
                UnaryOp::Pos => Value::Number(value.as_number()),
                UnaryOp::Not => Value::Bool(!value.truthy()),
            })
        }
        Expr::Binary(op, lhs, rhs) => {
            let a = eval(lhs, lookup)?.as_number();
            let b = eval(rhs, lookup)?.as_number();
            binary(*op, a, b).map(Value::Number)
        }
        Expr::Compare(first, rest) => {
            let mut left = eval(first, lookup)?.as_number();
            for (op, operand) in rest {
                let right = eval(operand, lookup)?.as_number();
                let holds = match op {
                    CmpOp::Eq => left == right,
                    CmpOp::Ne => left != right,
                    CmpOp::Lt => left < right,
                    CmpOp::Le => left <= right,
                    CmpOp::Gt => left > right,
                    CmpOp::Ge => left >= right,
                };
                if !holds {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::And(lhs, rhs) => {
            let left = eval(lhs, lookup)?;
            if left.truthy() {
                eval(rhs, lookup)
            } else {
                Ok(left)
            }
        }
        Expr::Or(lhs, rhs) => {
            let left = eval(lhs, lookup)?;
            if left.truthy() {
                Ok(left)
            } else {
                eval(rhs, lookup)
            }
        }
        Expr::Conditional {
            condition,
            then,
            otherwise,
        } => {
            if eval(condition, lookup)?.truthy() {
                eval(then, lookup)
            } else {
                eval(otherwise, lookup)
            }
        }
        Expr::Call(function, args) => {
            let values = args
                .iter()
                .map(|arg| eval(arg, lookup).map(Value::as_number))
                .collect::<Result<Vec<f64>, EvalError>>()?;
            call(*function, &values).map(Value::Number)
        }
    }
}

fn binary(op: BinaryOp, a: f64, b: f64) -> Result<f64, EvalError> {
    match op {
        BinaryOp::Add => Ok(a + b),
        BinaryOp::Sub => Ok(a - b),
        BinaryOp::Mul => Ok(a * b),
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok(a / b)
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok((a / b).floor())
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            // Result takes the sign of the divisor.
            Ok(a - b * (a / b).floor())
        }
        BinaryOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok(a.powf(b))
        }
    }
}

fn call(function: Function, args: &[f64]) -> Result<f64, EvalError> {
    function.check_arity(args.len())?;
    match function {
        Function::Abs => Ok(args[0].abs()),
        Function::Min => Ok(args.iter().copied().fold(f64::INFINITY, f64::min)),
        Function::Max => Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        Function::Round => {
            let digits = match args.get(1) {
                Some(&n) if n.fract() != 0.0 => {
                    return Err(EvalError::BadArgument {
                        function: function.name(),
                        message: format!("digits must be an integer, got {n}"),
                    })
                }
                Some(&n) => n as i32,
                None => 0,
            };
            Ok(round_half_even(args[0], digits))
        }
        Function::Int => Ok(args[0].trunc()),
        Function::Float => Ok(args[0]),
        Function::Sqrt => {
            if args[0] < 0.0 {
                return Err(EvalError::BadArgument {
                    function: function.name(),
                    message: format!("negative input {}", args[0]),
                });
            }
            Ok(args[0].sqrt())
        }
    }
}

/// Round to `digits` decimals, ties to even.
fn round_half_even(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    let scaled = value * scale;
    let rounded = scaled.round();
    let result = if (scaled - scaled.trunc()).abs() == 0.5 {
        2.0 * (scaled / 2.0).round()
    } else {
        rounded
    };
    result / scale
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    LParen,
    RParen,
    Comma,
    Cmp(CmpOp),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let next_is = |i: usize, expected: char| chars.get(i + 1).map(|&(_, c)| c) == Some(expected);

    while i < chars.len() {
        let (position, c) = chars[i];
        let (kind, width) = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '0'..='9' | '.' => {
                let end = scan_number(&chars, i);
                let text: String = chars[i..end].iter().map(|&(_, c)| c).collect();
                let value = text.parse::<f64>().map_err(|_| EvalError::Parse {
                    position,
                    message: format!("invalid number {text:?}"),
                })?;
                (TokenKind::Number(value), end - i)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = i;
                while end < chars.len() && (chars[end].1.is_alphanumeric() || chars[end].1 == '_')
                {
                    end += 1;
                }
                let text: String = chars[i..end].iter().map(|&(_, c)| c).collect();
                (TokenKind::Ident(text), end - i)
            }
            '+' => (TokenKind::Plus, 1),
            '-' => (TokenKind::Minus, 1),
            '*' if next_is(i, '*') => (TokenKind::DoubleStar, 2),
            '*' => (TokenKind::Star, 1),
            '/' if next_is(i, '/') => (TokenKind::DoubleSlash, 2),
            '/' => (TokenKind::Slash, 1),
            '%' => (TokenKind::Percent, 1),
            '(' => (TokenKind::LParen, 1),
            ')' => (TokenKind::RParen, 1),
            ',' => (TokenKind::Comma, 1),
            '=' if next_is(i, '=') => (TokenKind::Cmp(CmpOp::Eq), 2),
            '!' if next_is(i, '=') => (TokenKind::Cmp(CmpOp::Ne), 2),
            '<' if next_is(i, '=') => (TokenKind::Cmp(CmpOp::Le), 2),
            '<' => (TokenKind::Cmp(CmpOp::Lt), 1),
            '>' if next_is(i, '=') => (TokenKind::Cmp(CmpOp::Ge), 2),
            '>' => (TokenKind::Cmp(CmpOp::Gt), 1),
            other => {
                return Err(EvalError::Parse {
                    position,
                    message: format!("unexpected character {other:?}"),
                })
            }
        };
        tokens.push(Token { kind, position });
        i += width;
    }

    Ok(tokens)
}

/// End index of the numeric literal starting at `start`.
fn scan_number(chars: &[(usize, char)], start: usize) -> usize {
    let digit_at = |i: usize| chars.get(i).is_some_and(|&(_, c)| c.is_ascii_digit());
    let mut end = start;
    while digit_at(end) {
        end += 1;
    }
    if chars.get(end).map(|&(_, c)| c) == Some('.') {
        end += 1;
        while digit_at(end) {
            end += 1;
        }
    }
    if matches!(chars.get(end).map(|&(_, c)| c), Some('e' | 'E')) {
        let mut exp = end + 1;
        if matches!(chars.get(exp).map(|&(_, c)| c), Some('+' | '-')) {
            exp += 1;
        }
        if digit_at(exp) {
            end = exp;
            while digit_at(end) {
                end += 1;
            }
        }
    }
    end
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Ident(name)) if name == keyword)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn end_position(&self) -> usize {
        self.tokens
            .last()
            .map(|t| t.position + 1)
            .unwrap_or_default()
    }

    fn error_at(&self, position: usize, message: impl Into<String>) -> EvalError {
        EvalError::Parse {
            position,
            message: message.into(),
        }
    }

    fn error_here(&self, message: impl Into<String>) -> EvalError {
        let position = self
            .peek()
            .map(|t| t.position)
            .unwrap_or_else(|| self.end_position());
        self.error_at(position, message)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), EvalError> {
        if self.peek_kind() == Some(&kind) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error_here(format!("expected {what}")))
        }
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EvalError>,
    ) -> Result<T, EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError::TooDeep);
        }
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse_expr(&mut self) -> Result<Expr, EvalError> {
        self.nested(|p| {
            let value = p.parse_or()?;
            if !p.peek_keyword("if") {
                return Ok(value);
            }
            p.advance();
            let condition = p.parse_or()?;
            if !p.peek_keyword("else") {
                return Err(p.error_here("expected 'else'"));
            }
            p.advance();
            let otherwise = p.parse_expr()?;
            Ok(Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            })
        })
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_and()?;
        while self.peek_keyword("or") {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_not()?;
        while self.peek_keyword("and") {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if self.peek_keyword("not") {
            self.advance();
            let inner = self.nested(Self::parse_not)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let first = self.parse_additive()?;
        let mut rest = Vec::new();
        while let Some(TokenKind::Cmp(op)) = self.peek_kind() {
            let op = *op;
            self.advance();
            rest.push((op, self.parse_additive()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_term(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::DoubleSlash) => BinaryOp::FloorDiv,
                Some(TokenKind::Percent) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => UnaryOp::Neg,
            Some(TokenKind::Plus) => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        self.advance();
        let inner = self.nested(Self::parse_unary)?;
        Ok(Expr::Unary(op, Box::new(inner)))
    }

    /// `**` binds tighter than a unary operator on its left and is
    /// right-associative.
    fn parse_power(&mut self) -> Result<Expr, EvalError> {
        let base = self.parse_primary()?;
        if self.peek_kind() != Some(&TokenKind::DoubleStar) {
            return Ok(base);
        }
        self.advance();
        let exponent = self.nested(Self::parse_unary)?;
        Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)))
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        let Some(token) = self.advance() else {
            return Err(self.error_here("unexpected end of formula"));
        };
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(name) => self.parse_name(name),
            _ => Err(self.error_at(token.position, "expected a value")),
        }
    }

    fn parse_name(&mut self, name: String) -> Result<Expr, EvalError> {
        if self.peek_kind() != Some(&TokenKind::LParen) {
            return match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "pi" => Ok(Expr::Number(std::f64::consts::PI)),
                "e" => Ok(Expr::Number(std::f64::consts::E)),
                DEVICE_VALUE => Ok(Expr::DeviceValue),
                _ => Err(EvalError::UnknownName(name)),
            };
        }
        self.advance();

        match name.as_str() {
            "variable" | "timestamp" => {
                let id = self.parse_series_id()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(if name == "variable" {
                    Expr::Variable(id)
                } else {
                    Expr::Timestamp(id)
                })
            }
            _ => {
                let function = Function::lookup(&name)
                    .ok_or_else(|| EvalError::UnknownFunction(name.clone()))?;
                let args = self.parse_arguments()?;
                function.check_arity(args.len())?;
                Ok(Expr::Call(function, args))
            }
        }
    }

    fn parse_series_id(&mut self) -> Result<SeriesId, EvalError> {
        match self.advance() {
            Some(Token {
                kind: TokenKind::Number(n),
                position,
            }) => {
                if n.fract() != 0.0 || n < 0.0 || n > f64::from(SeriesId::MAX) {
                    return Err(self.error_at(position, format!("invalid series id {n}")));
                }
                Ok(n as SeriesId)
            }
            Some(token) => Err(self.error_at(token.position, "expected a series id")),
            None => Err(self.error_here("expected a series id")),
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, EvalError> {
        let mut args = Vec::new();
        if self.peek_kind() == Some(&TokenKind::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.advance() {
                Some(Token {
                    kind: TokenKind::Comma,
                    ..
                }) => continue,
                Some(Token {
                    kind: TokenKind::RParen,
                    ..
                }) => return Ok(args),
                Some(token) => return Err(self.error_at(token.position, "expected ',' or ')'")),
                None => return Err(self.error_here("expected ')'")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;

    struct Values(HashMap<SeriesId, TimeSeriesPoint>);

    impl Lookup for Values {
        fn latest(&self, series: SeriesId) -> Result<Option<TimeSeriesPoint>, StoreError> {
            Ok(self.0.get(&series).copied())
        }
    }

    fn values(pairs: &[(SeriesId, i64, f64)]) -> Values {
        Values(
            pairs
                .iter()
                .map(|&(id, ts, v)| {
                    (
                        id,
                        TimeSeriesPoint::new(DateTime::<Utc>::from_timestamp(ts, 0).unwrap(), v),
                    )
                })
                .collect(),
        )
    }

    fn eval_str(source: &str) -> Result<f64, EvalError> {
        Formula::parse(source)?.evaluate(&values(&[]))
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval_str("1 + 2 * 3").unwrap(), 7.0);
        assert_eq!(eval_str("(1 + 2) * 3").unwrap(), 9.0);
        assert_eq!(eval_str("7 // 2").unwrap(), 3.0);
        assert_eq!(eval_str("-7 // 2").unwrap(), -4.0);
        assert_eq!(eval_str("-7 % 3").unwrap(), 2.0);
        assert_eq!(eval_str("1.5e2 / 3").unwrap(), 50.0);
    }

    #[test]
    fn test_power_binds_tighter_than_negation() {
        assert_eq!(eval_str("-2 ** 2").unwrap(), -4.0);
        assert_eq!(eval_str("2 ** 3 ** 2").unwrap(), 512.0);
        assert_eq!(eval_str("2 ** -1").unwrap(), 0.5);
    }

    #[test]
    fn test_logic_and_comparisons() {
        assert_eq!(eval_str("1 < 2 < 3").unwrap(), 1.0);
        assert_eq!(eval_str("1 < 3 < 2").unwrap(), 0.0);
        assert_eq!(eval_str("not 0 and 5").unwrap(), 5.0);
        assert_eq!(eval_str("0 or 4").unwrap(), 4.0);
        assert_eq!(eval_str("10 if 2 >= 3 else 20").unwrap(), 20.0);
        assert_eq!(eval_str("True + True").unwrap(), 2.0);
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval_str("abs(-3)").unwrap(), 3.0);
        assert_eq!(eval_str("min(4, 2, 8)").unwrap(), 2.0);
        assert_eq!(eval_str("max(4, 2, 8)").unwrap(), 8.0);
        assert_eq!(eval_str("round(2.5)").unwrap(), 2.0);
        assert_eq!(eval_str("round(3.5)").unwrap(), 4.0);
        assert_eq!(eval_str("round(1.25, 1)").unwrap(), 1.2);
        assert_eq!(eval_str("int(-2.7)").unwrap(), -2.0);
        assert_eq!(eval_str("sqrt(16)").unwrap(), 4.0);
        assert!((eval_str("pi").unwrap() - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn test_variable_lookup() {
        let lookup = values(&[(3, 1_700_000_000, 2.5), (4, 1_700_000_060, 4.0)]);
        let formula =
            Formula::parse("variable(3) * variable(4) + timestamp(4) - timestamp(3)").unwrap();
        assert_eq!(formula.evaluate(&lookup).unwrap(), 70.0);
        assert_eq!(formula.referenced_series(), vec![3, 4]);
    }

    #[test]
    fn test_runtime_errors() {
        assert!(matches!(eval_str("1 / 0"), Err(EvalError::DivisionByZero)));
        assert!(matches!(eval_str("5 % 0"), Err(EvalError::DivisionByZero)));
        assert!(matches!(eval_str("variable(9)"), Err(EvalError::MissingValue(9))));
        assert!(matches!(eval_str("sqrt(-1)"), Err(EvalError::BadArgument { .. })));
        assert!(matches!(eval_str("10 ** 400"), Err(EvalError::NonFinite)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Formula::parse("1 +"), Err(EvalError::Parse { .. })));
        assert!(matches!(Formula::parse("(1"), Err(EvalError::Parse { .. })));
        assert!(matches!(Formula::parse("1 2"), Err(EvalError::Parse { .. })));
        assert!(matches!(Formula::parse("1 $ 2"), Err(EvalError::Parse { .. })));
        assert!(matches!(Formula::parse("open(1)"), Err(EvalError::UnknownFunction(_))));
        assert!(matches!(Formula::parse("x + 1"), Err(EvalError::UnknownName(_))));
        assert!(matches!(Formula::parse("variable(1.5)"), Err(EvalError::Parse { .. })));
        assert!(matches!(Formula::parse("abs(1, 2)"), Err(EvalError::Arity { .. })));
        assert!(matches!(Formula::parse("1 if 2"), Err(EvalError::Parse { .. })));
    }

    struct Bound(f64);

    impl Lookup for Bound {
        fn latest(&self, _series: SeriesId) -> Result<Option<TimeSeriesPoint>, StoreError> {
            Ok(None)
        }

        fn device_value(&self) -> Option<f64> {
            Some(self.0)
        }
    }

    #[test]
    fn test_device_value_binding() {
        let formula =
            Formula::parse("round(device_value / 10, 1) if device_value > 0 else 0").unwrap();
        assert!(formula.uses_device_value());
        assert!(formula.referenced_series().is_empty());
        assert_eq!(formula.evaluate(&Bound(123.0)).unwrap(), 12.3);
        assert_eq!(formula.evaluate(&Bound(-5.0)).unwrap(), 0.0);

        assert!(matches!(
            formula.evaluate(&values(&[])),
            Err(EvalError::UnknownName(name)) if name == DEVICE_VALUE
        ));
        assert!(!Formula::parse("variable(1) + 1").unwrap().uses_device_value());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert!(matches!(Formula::parse(&deep), Err(EvalError::TooDeep)));

        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(Formula::parse(&shallow).unwrap().evaluate(&values(&[])).unwrap(), 1.0);
    }
}
