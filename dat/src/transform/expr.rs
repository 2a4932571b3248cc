//! Row expression language for calculated columns, filters and predicates.
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := cmp ("&&" cmp)*
//! cmp     := sum (("==" | "!=" | "<" | "<=" | ">" | ">=") sum)?
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/") unary)*
//! unary   := ("!" | "-") unary | primary
//! primary := number | string | true | false | null | column
//!          | name "(" args ")" | "(" expr ")"
//! column  := identifier | "[" any text "]"
//! ```

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::errors::{DatError, Result};
use crate::frame::{value, DataFrame};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Column(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Abs,
    Round,
    Min,
    Max,
    Coalesce,
    IsNull,
    Len,
    Lower,
    Upper,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "abs" => Self::Abs,
            "round" => Self::Round,
            "min" => Self::Min,
            "max" => Self::Max,
            "coalesce" => Self::Coalesce,
            "is_null" | "isnull" => Self::IsNull,
            "len" | "length" => Self::Len,
            "lower" => Self::Lower,
            "upper" => Self::Upper,
            _ => return None,
        })
    }

    fn arity(self) -> (usize, usize) {
        match self {
            Self::Abs | Self::IsNull | Self::Len | Self::Lower | Self::Upper => (1, 1),
            Self::Round => (1, 2),
            Self::Min | Self::Max | Self::Coalesce => (1, usize::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Column(String),
    Not(Box<Node>),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

fn tokenize(source: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
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
            '[' => {
                let end = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .ok_or("unclosed '[' in column reference")?;
                tokens.push(Token::Column(chars[i + 1..i + end].iter().collect()));
                i += end + 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|ch| *ch == c)
                    .ok_or("unterminated string literal")?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    i += 1;
                    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                        i += 1;
                    }
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(
                    text.parse().map_err(|_| format!("invalid number '{text}'"))?,
                ));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    '<' => "<",
                    '>' => ">",
                    '!' => "!",
                    '=' => "==",
                    _ => return Err(format!("unexpected character '{c}'")),
                };
                tokens.push(Token::Op(op));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        let Some(Token::Op(op)) = self.peek() else {
            return None;
        };
        let op = *op;
        let found = ops.iter().copied().find(|o| *o == op)?;
        self.pos += 1;
        Some(found)
    }

    fn binary(
        &mut self,
        ops: &[&'static str],
        next: fn(&mut Self) -> std::result::Result<Node, String>,
    ) -> std::result::Result<Node, String> {
        let mut left = next(self)?;
        while let Some(op) = self.eat_op(ops) {
            let right = next(self)?;
            left = Node::Binary(bin_op(op), Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> std::result::Result<Node, String> {
        self.binary(&["||"], Self::and)
    }

    fn and(&mut self) -> std::result::Result<Node, String> {
        self.binary(&["&&"], Self::comparison)
    }

    fn comparison(&mut self) -> std::result::Result<Node, String> {
        let left = self.sum()?;
        if let Some(op) = self.eat_op(&["==", "!=", "<=", ">=", "<", ">"]) {
            let right = self.sum()?;
            return Ok(Node::Binary(bin_op(op), Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn sum(&mut self) -> std::result::Result<Node, String> {
        self.binary(&["+", "-"], Self::product)
    }

    fn product(&mut self) -> std::result::Result<Node, String> {
        self.binary(&["*", "/"], Self::unary)
    }

    fn unary(&mut self) -> std::result::Result<Node, String> {
        match self.eat_op(&["!", "-"]) {
            Some("!") => Ok(Node::Not(Box::new(self.unary()?))),
            Some(_) => Ok(Node::Neg(Box::new(self.unary()?))),
            None => self.primary(),
        }
    }

    fn primary(&mut self) -> std::result::Result<Node, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Literal(value::number(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Column(c)) => Ok(Node::Column(c)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let func = Func::from_name(&name).ok_or_else(|| format!("unknown function '{name}'"))?;
                    let mut args = Vec::new();
                    if self.peek() == Some(&Token::RParen) {
                        self.pos += 1;
                    } else {
                        loop {
                            args.push(self.or()?);
                            match self.next() {
                                Some(Token::Comma) => {}
                                Some(Token::RParen) => break,
                                _ => return Err(format!("expected ',' or ')' in call to '{name}'")),
                            }
                        }
                    }
                    let (min, max) = func.arity();
                    if args.len() < min || args.len() > max {
                        return Err(format!("wrong number of arguments to '{name}'"));
                    }
                    return Ok(Node::Call(func, args));
                }
                Ok(match name.as_str() {
                    "true" => Node::Literal(Value::Bool(true)),
                    "false" => Node::Literal(Value::Bool(false)),
                    "null" => Node::Literal(Value::Null),
                    _ => Node::Column(name),
                })
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn bin_op(op: &str) -> BinOp {
    match op {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "==" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        "&&" => BinOp::And,
        _ => BinOp::Or,
    }
}

/// Truthiness of a cell: null and empty strings are false, numbers are true
/// when non-zero.
#[must_use]
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => {
            let (x, y) = (value::as_f64(a)?, value::as_f64(b)?);
            x.partial_cmp(&y)
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => compare(a, b).map_or(a == b, |o| o == Ordering::Equal),
    }
}

impl Expression {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Expression`] on syntax errors.
    pub fn parse(source: &str) -> Result<Self> {
        let fail = |message: String| DatError::expression(source, message);
        let tokens = tokenize(source).map_err(fail)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.or().map_err(fail)?;
        if parser.pos < parser.tokens.len() {
            return Err(fail(format!(
                "unexpected trailing input at token {}",
                parser.pos + 1
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Returns the expression source.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns the column names the expression references.
    #[must_use]
    pub fn columns(&self) -> BTreeSet<String> {
        fn walk(node: &Node, out: &mut BTreeSet<String>) {
            match node {
                Node::Literal(_) => {}
                Node::Column(c) => {
                    out.insert(c.clone());
                }
                Node::Not(n) | Node::Neg(n) => walk(n, out),
                Node::Binary(_, l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
                Node::Call(_, args) => args.iter().for_each(|a| walk(a, out)),
            }
        }
        let mut out = BTreeSet::new();
        walk(&self.root, &mut out);
        out
    }

    /// Evaluates against one row, resolving columns through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Expression`] for unknown columns or type errors.
    pub fn evaluate<'a, F>(&self, lookup: &F) -> Result<Value>
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        self.eval_node(&self.root, lookup)
    }

    /// Evaluates for every row of a table.
    ///
    /// # Errors
    ///
    /// Returns the first row's evaluation error.
    pub fn evaluate_frame(&self, df: &DataFrame) -> Result<Vec<Value>> {
        df.rows()
            .iter()
            .map(|row| {
                let lookup = |name: &str| df.column_index(name).map(|i| &row[i]);
                self.evaluate(&lookup)
            })
            .collect()
    }

    /// Evaluates as a boolean mask over a table.
    ///
    /// # Errors
    ///
    /// Returns the first row's evaluation error.
    pub fn mask(&self, df: &DataFrame) -> Result<Vec<bool>> {
        Ok(self.evaluate_frame(df)?.iter().map(truthy).collect())
    }

    fn eval_node<'a, F>(&self, node: &Node, lookup: &F) -> Result<Value>
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        match node {
            Node::Literal(v) => Ok(v.clone()),
            Node::Column(name) => lookup(name)
                .cloned()
                .ok_or_else(|| DatError::expression(&self.source, format!("unknown column '{name}'"))),
            Node::Not(inner) => Ok(Value::Bool(!truthy(&self.eval_node(inner, lookup)?))),
            Node::Neg(inner) => {
                let v = self.eval_node(inner, lookup)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                let n = value::as_f64(&v).ok_or_else(|| {
                    DatError::expression(&self.source, format!("cannot negate {v}"))
                })?;
                Ok(value::number(-n))
            }
            Node::Binary(op, l, r) => {
                match op {
                    BinOp::And => {
                        let left = truthy(&self.eval_node(l, lookup)?);
                        return Ok(Value::Bool(left && truthy(&self.eval_node(r, lookup)?)));
                    }
                    BinOp::Or => {
                        let left = truthy(&self.eval_node(l, lookup)?);
                        return Ok(Value::Bool(left || truthy(&self.eval_node(r, lookup)?)));
                    }
                    _ => {}
                }
                let left = self.eval_node(l, lookup)?;
                let right = self.eval_node(r, lookup)?;
                self.apply_binary(*op, &left, &right)
            }
            Node::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|a| self.eval_node(a, lookup))
                    .collect::<Result<Vec<_>>>()?;
                self.apply_call(*func, &values)
            }
        }
    }

    fn apply_binary(&self, op: BinOp, left: &Value, right: &Value) -> Result<Value> {
        let ordering = || compare(left, right);
        let result = match op {
            BinOp::Eq => Value::Bool(values_equal(left, right)),
            BinOp::Ne => Value::Bool(!values_equal(left, right)),
            BinOp::Lt => Value::Bool(ordering() == Some(Ordering::Less)),
            BinOp::Le => Value::Bool(matches!(ordering(), Some(Ordering::Less | Ordering::Equal))),
            BinOp::Gt => Value::Bool(ordering() == Some(Ordering::Greater)),
            BinOp::Ge => Value::Bool(matches!(ordering(), Some(Ordering::Greater | Ordering::Equal))),
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                if left.is_null() || right.is_null() {
                    return Ok(Value::Null);
                }
                if let (BinOp::Add, Value::String(a), Value::String(b)) = (op, left, right) {
                    return Ok(Value::String(format!("{a}{b}")));
                }
                let (Some(a), Some(b)) = (value::as_f64(left), value::as_f64(right)) else {
                    return Err(DatError::expression(
                        &self.source,
                        format!("non-numeric operands {left} and {right}"),
                    ));
                };
                match op {
                    BinOp::Add => value::number(a + b),
                    BinOp::Sub => value::number(a - b),
                    BinOp::Mul => value::number(a * b),
                    _ if b == 0.0 => Value::Null,
                    _ => value::number(a / b),
                }
            }
            BinOp::And | BinOp::Or => Value::Bool(false),
        };
        Ok(result)
    }

    fn apply_call(&self, func: Func, args: &[Value]) -> Result<Value> {
        let numeric = |v: &Value| -> Result<Option<f64>> {
            if v.is_null() {
                return Ok(None);
            }
            value::as_f64(v)
                .map(Some)
                .ok_or_else(|| DatError::expression(&self.source, format!("expected a number, found {v}")))
        };
        let result = match func {
            Func::Abs => numeric(&args[0])?.map_or(Value::Null, |n| value::number(n.abs())),
            Func::Round => {
                let digits = match args.get(1) {
                    Some(d) => numeric(d)?.unwrap_or(0.0),
                    None => 0.0,
                };
                numeric(&args[0])?.map_or(Value::Null, |n| value::number(round_to(n, digits)))
            }
            Func::Min | Func::Max => {
                let mut best: Option<f64> = None;
                for arg in args {
                    if let Some(n) = numeric(arg)? {
                        best = Some(match (best, func) {
                            (None, _) => n,
                            (Some(b), Func::Min) => b.min(n),
                            (Some(b), _) => b.max(n),
                        });
                    }
                }
                best.map_or(Value::Null, value::number)
            }
            Func::Coalesce => args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null),
            Func::IsNull => Value::Bool(args[0].is_null()),
            Func::Len => match &args[0] {
                Value::Null => Value::Null,
                Value::String(s) => Value::from(s.chars().count()),
                Value::Array(a) => Value::from(a.len()),
                other => Value::from(value::to_text(other).chars().count()),
            },
            Func::Lower => match &args[0] {
                Value::Null => Value::Null,
                other => Value::String(value::to_text(other).to_lowercase()),
            },
            Func::Upper => match &args[0] {
                Value::Null => Value::Null,
                other => Value::String(value::to_text(other).to_uppercase()),
            },
        };
        Ok(result)
    }
}

/// Rounds half away from zero to `digits` decimal places.
#[must_use]
pub fn round_to(n: f64, digits: f64) -> f64 {
    let factor = 10f64.powf(digits);
    (n * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn eval(src: &str, row: &HashMap<&str, Value>) -> Result<Value> {
        Expression::parse(src)?.evaluate(&|name: &str| row.get(name))
    }

    fn row() -> HashMap<&'static str, Value> {
        HashMap::from([
            ("a", json!(4)),
            ("b", json!(2.5)),
            ("Wafer Id", json!("W1")),
            ("missing", Value::Null),
        ])
    }

    #[test]
    fn test_arithmetic_precedence() {
        let r = row();
        assert_eq!(eval("a + b * 2", &r).unwrap(), json!(9));
        assert_eq!(eval("(a + b) * 2", &r).unwrap(), json!(13));
        assert_eq!(eval("-a / 8", &r).unwrap(), json!(-0.5));
        assert_eq!(eval("a / 0", &r).unwrap(), Value::Null);
        assert_eq!(eval("missing + 1", &r).unwrap(), Value::Null);
    }

    #[test]
    fn test_comparisons_and_logic() {
        let r = row();
        assert_eq!(eval("a > 3 && b < 3", &r).unwrap(), json!(true));
        assert_eq!(eval("[Wafer Id] == 'W1'", &r).unwrap(), json!(true));
        assert_eq!(eval("!(a >= 5) || false", &r).unwrap(), json!(true));
        assert_eq!(eval("missing == null", &r).unwrap(), json!(true));
        assert_eq!(eval("missing > 0", &r).unwrap(), json!(false));
    }

    #[test]
    fn test_functions() {
        let r = row();
        assert_eq!(eval("round(b / 3, 2)", &r).unwrap(), json!(0.83));
        assert_eq!(eval("max(a, b, 1)", &r).unwrap(), json!(4));
        assert_eq!(eval("coalesce(missing, 'x')", &r).unwrap(), json!("x"));
        assert_eq!(eval("is_null(missing)", &r).unwrap(), json!(true));
        assert_eq!(eval("lower([Wafer Id])", &r).unwrap(), json!("w1"));
        assert_eq!(eval("len('abc')", &r).unwrap(), json!(3));
    }

    #[test]
    fn test_errors() {
        assert!(Expression::parse("a +").is_err());
        assert!(Expression::parse("nope(1)").is_err());
        assert!(Expression::parse("abs(1, 2)").is_err());
        assert!(Expression::parse("a b").is_err());
        let err = eval("unknown_col > 1", &row()).unwrap_err();
        assert_eq!(err.code(), "DAT-EXPRESSION");
    }

    #[test]
    fn test_columns_and_mask() {
        let expr = Expression::parse("a > 1 && [Wafer Id] != 'x'").unwrap();
        assert_eq!(
            expr.columns().into_iter().collect::<Vec<_>>(),
            vec!["Wafer Id".to_string(), "a".to_string()]
        );
        let df = DataFrame::from_rows(
            vec!["a".into(), "Wafer Id".into()],
            vec![vec![json!(0), json!("W")], vec![json!(2), json!("W")]],
        );
        assert_eq!(expr.mask(&df).unwrap(), vec![false, true]);
    }
}
