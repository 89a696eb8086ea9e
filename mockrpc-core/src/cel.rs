//! A bounded, hand-rolled evaluator for the CEL subset referenced by
//! message-level and custom field rules (spec §4.3: "parser supports a
//! conservative subset [...] unsupported expressions fail closed").
//!
//! This is deliberately not the `cel` crate: the supported grammar is a
//! small fragment (comparisons, boolean connectives, dotted field access via
//! `this`, and a handful of built-in functions/methods), enough to express
//! the kind of cross-field rules protovalidate documents commonly carry,
//! without pulling in a full CEL runtime.

use std::fmt;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum CelError {
    Syntax(String),
    Eval(String),
}

impl fmt::Display for CelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CelError::Syntax(s) => write!(f, "cel syntax error: {s}"),
            CelError::Eval(s) => write!(f, "cel evaluation error: {s}"),
        }
    }
}

impl std::error::Error for CelError {}

pub type CelResult<T> = std::result::Result<T, CelError>;

/// Evaluates `expr` with `this` bound to the whole message, for
/// message-level rules.
pub fn eval(expr: &str, message: &Value) -> CelResult<bool> {
    let ast = parse(expr)?;
    let v = ast.eval(message)?;
    as_bool(&v)
}

/// Evaluates `expr` with `this` bound to a single field's value, for
/// field-level CEL rules.
pub fn eval_on_field(expr: &str, field_value: &Value) -> CelResult<bool> {
    eval(expr, field_value)
}

fn as_bool(v: &EvalValue) -> CelResult<bool> {
    match v {
        EvalValue::Bool(b) => Ok(*b),
        other => Err(CelError::Eval(format!("expression did not evaluate to a bool: {other:?}"))),
    }
}

// ---------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    LParen,
    RParen,
    Dot,
    Comma,
    Minus,
    End,
}

fn tokenize(input: &str) -> CelResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(CelError::Syntax("bare '=' is not valid, did you mean '=='?".into()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        s.push(chars[i + 1]);
                        i += 2;
                    } else {
                        s.push(chars[i]);
                        i += 1;
                    }
                }
                if i >= chars.len() {
                    return Err(CelError::Syntax("unterminated string literal".into()));
                }
                i += 1; // closing quote
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| CelError::Syntax(format!("bad number literal: {text}")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    "&&" => Token::And,
                    "||" => Token::Or,
                    _ => Token::Ident(text),
                });
            }
            other => {
                return Err(CelError::Syntax(format!("unexpected character: {other:?}")));
            }
        }
    }
    tokens.push(Token::End);
    Ok(tokens)
}

// ---------------------------------------------------------------------
// AST + parser (precedence climbing)
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Lit(EvalValue),
    Path(Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    MethodCall(Box<Expr>, String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum EvalValue {
    Bool(bool),
    Number(f64),
    String(String),
    Null,
    List(Vec<EvalValue>),
    Value(Value),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, t: &Token) -> CelResult<()> {
        if self.peek() == t {
            self.advance();
            Ok(())
        } else {
            Err(CelError::Syntax(format!("expected {t:?}, found {:?}", self.peek())))
        }
    }

    fn parse_expr(&mut self) -> CelResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> CelResult<Expr> {
        let mut lhs = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> CelResult<Expr> {
        let mut lhs = self.parse_unary_not_then_cmp()?;
        while *self.peek() == Token::And {
            self.advance();
            let rhs = self.parse_unary_not_then_cmp()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary_not_then_cmp(&mut self) -> CelResult<Expr> {
        if *self.peek() == Token::Not {
            self.advance();
            let inner = self.parse_unary_not_then_cmp()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> CelResult<Expr> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Token::Eq => Some(CmpOp::Eq),
            Token::Ne => Some(CmpOp::Ne),
            Token::Lt => Some(CmpOp::Lt),
            Token::Le => Some(CmpOp::Le),
            Token::Gt => Some(CmpOp::Gt),
            Token::Ge => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_additive()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        if *self.peek() == Token::In {
            self.advance();
            let rhs = self.parse_additive()?;
            return Ok(Expr::In(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> CelResult<Expr> {
        self.parse_unary()
    }

    fn parse_unary(&mut self) -> CelResult<Expr> {
        if *self.peek() == Token::Minus {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        if *self.peek() == Token::Not {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> CelResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if *self.peek() == Token::Dot {
                self.advance();
                let name = match self.advance() {
                    Token::Ident(n) => n,
                    other => return Err(CelError::Syntax(format!("expected identifier after '.', found {other:?}"))),
                };
                if *self.peek() == Token::LParen {
                    self.advance();
                    let args = self.parse_arg_list()?;
                    expr = Expr::MethodCall(Box::new(expr), name, args);
                } else if let Expr::Path(mut segs) = expr {
                    segs.push(name);
                    expr = Expr::Path(segs);
                } else {
                    return Err(CelError::Syntax("field access on non-path expression".into()));
                }
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_arg_list(&mut self) -> CelResult<Vec<Expr>> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.peek() {
                Token::Comma => {
                    self.advance();
                }
                Token::RParen => {
                    self.advance();
                    break;
                }
                other => return Err(CelError::Syntax(format!("expected ',' or ')', found {other:?}"))),
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> CelResult<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Lit(EvalValue::Number(n))),
            Token::Str(s) => Ok(Expr::Lit(EvalValue::String(s))),
            Token::True => Ok(Expr::Lit(EvalValue::Bool(true))),
            Token::False => Ok(Expr::Lit(EvalValue::Bool(false))),
            Token::Null => Ok(Expr::Lit(EvalValue::Null)),
            Token::LParen => {
                let e = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Token::Ident(name) => {
                if *self.peek() == Token::LParen {
                    self.advance();
                    let args = self.parse_arg_list()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Path(vec![name]))
                }
            }
            other => Err(CelError::Syntax(format!("unexpected token: {other:?}"))),
        }
    }
}

fn parse(input: &str) -> CelResult<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if *parser.peek() != Token::End {
        return Err(CelError::Syntax(format!("trailing input near {:?}", parser.peek())));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------

impl Expr {
    fn eval(&self, this: &Value) -> CelResult<EvalValue> {
        match self {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Path(segments) => eval_path(segments, this),
            Expr::Not(inner) => {
                let v = inner.eval(this)?;
                Ok(EvalValue::Bool(!as_bool_loose(&v)?))
            }
            Expr::Neg(inner) => {
                let v = inner.eval(this)?;
                match v {
                    EvalValue::Number(n) => Ok(EvalValue::Number(-n)),
                    other => Err(CelError::Eval(format!("cannot negate {other:?}"))),
                }
            }
            Expr::Or(l, r) => {
                let lv = as_bool_loose(&l.eval(this)?)?;
                if lv {
                    return Ok(EvalValue::Bool(true));
                }
                Ok(EvalValue::Bool(as_bool_loose(&r.eval(this)?)?))
            }
            Expr::And(l, r) => {
                let lv = as_bool_loose(&l.eval(this)?)?;
                if !lv {
                    return Ok(EvalValue::Bool(false));
                }
                Ok(EvalValue::Bool(as_bool_loose(&r.eval(this)?)?))
            }
            Expr::Cmp(op, l, r) => {
                let lv = l.eval(this)?;
                let rv = r.eval(this)?;
                Ok(EvalValue::Bool(compare(*op, &lv, &rv)?))
            }
            Expr::In(needle, haystack) => {
                let n = needle.eval(this)?;
                let h = haystack.eval(this)?;
                Ok(EvalValue::Bool(contains(&n, &h)))
            }
            Expr::Call(name, args) => eval_call(name, args, this),
            Expr::MethodCall(recv, name, args) => {
                let rv = recv.eval(this)?;
                eval_method(&rv, name, args, this)
            }
        }
    }
}

fn eval_path(segments: &[String], this: &Value) -> CelResult<EvalValue> {
    if segments.is_empty() {
        return Ok(EvalValue::Value(this.clone()));
    }
    let (head, rest) = segments.split_first().unwrap();
    let mut current: &Value = if head == "this" {
        this
    } else {
        this.get_field(head)
            .ok_or_else(|| CelError::Eval(format!("undefined field: {head}")))?
    };
    for seg in rest {
        current = current
            .get_field(seg)
            .ok_or_else(|| CelError::Eval(format!("undefined field: {seg}")))?;
    }
    Ok(value_to_eval(current))
}

fn value_to_eval(v: &Value) -> EvalValue {
    match v {
        Value::Null => EvalValue::Null,
        Value::Bool(b) => EvalValue::Bool(*b),
        Value::Number(n) => EvalValue::Number(*n),
        Value::String(s) => EvalValue::String(s.clone()),
        other => EvalValue::Value(other.clone()),
    }
}

fn as_bool_loose(v: &EvalValue) -> CelResult<bool> {
    match v {
        EvalValue::Bool(b) => Ok(*b),
        other => Err(CelError::Eval(format!("expected bool, found {other:?}"))),
    }
}

fn compare(op: CmpOp, l: &EvalValue, r: &EvalValue) -> CelResult<bool> {
    use CmpOp::*;
    let ordering = match (l, r) {
        (EvalValue::Number(a), EvalValue::Number(b)) => a.partial_cmp(b),
        (EvalValue::String(a), EvalValue::String(b)) => Some(a.cmp(b)),
        (EvalValue::Null, EvalValue::Null) => Some(std::cmp::Ordering::Equal),
        (EvalValue::Bool(a), EvalValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        Eq => Ok(values_equal(l, r)),
        Ne => Ok(!values_equal(l, r)),
        Lt => Ok(matches!(ordering, Some(std::cmp::Ordering::Less))),
        Le => Ok(matches!(ordering, Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal))),
        Gt => Ok(matches!(ordering, Some(std::cmp::Ordering::Greater))),
        Ge => Ok(matches!(ordering, Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal))),
    }
}

fn values_equal(l: &EvalValue, r: &EvalValue) -> bool {
    match (l, r) {
        (EvalValue::Number(a), EvalValue::Number(b)) => a == b,
        (EvalValue::String(a), EvalValue::String(b)) => a == b,
        (EvalValue::Bool(a), EvalValue::Bool(b)) => a == b,
        (EvalValue::Null, EvalValue::Null) => true,
        _ => false,
    }
}

fn contains(needle: &EvalValue, haystack: &EvalValue) -> bool {
    match haystack {
        EvalValue::String(s) => {
            if let EvalValue::String(n) = needle {
                s.contains(n.as_str())
            } else {
                false
            }
        }
        EvalValue::Value(Value::List(items)) => items.iter().any(|item| values_equal(&value_to_eval(item), needle)),
        EvalValue::List(items) => items.iter().any(|item| values_equal(item, needle)),
        _ => false,
    }
}

fn eval_call(name: &str, args: &[Expr], this: &Value) -> CelResult<EvalValue> {
    match name {
        "has" => {
            let arg = args
                .first()
                .ok_or_else(|| CelError::Eval("has() requires one argument".into()))?;
            Ok(EvalValue::Bool(eval_path_opt(arg, this).is_some()))
        }
        "size" => {
            let v = args
                .first()
                .ok_or_else(|| CelError::Eval("size() requires one argument".into()))?
                .eval(this)?;
            Ok(EvalValue::Number(size_of(&v)? as f64))
        }
        other => Err(CelError::Eval(format!("unknown function: {other}"))),
    }
}

fn eval_path_opt(expr: &Expr, this: &Value) -> Option<EvalValue> {
    if let Expr::Path(segments) = expr {
        eval_path(segments, this).ok()
    } else {
        expr.eval(this).ok()
    }
}

fn size_of(v: &EvalValue) -> CelResult<usize> {
    match v {
        EvalValue::String(s) => Ok(s.chars().count()),
        EvalValue::List(items) => Ok(items.len()),
        EvalValue::Value(Value::List(items)) => Ok(items.len()),
        EvalValue::Value(Value::Map(m)) => Ok(m.len()),
        EvalValue::Value(Value::String(s)) => Ok(s.chars().count()),
        other => Err(CelError::Eval(format!("size() not supported on {other:?}"))),
    }
}

fn eval_method(recv: &EvalValue, name: &str, args: &[Expr], this: &Value) -> CelResult<EvalValue> {
    let recv_str = match recv {
        EvalValue::String(s) => s.clone(),
        EvalValue::Value(Value::String(s)) => s.clone(),
        other => return Err(CelError::Eval(format!("method {name} not supported on {other:?}"))),
    };
    match name {
        "contains" => {
            let needle = string_arg(args, this)?;
            Ok(EvalValue::Bool(recv_str.contains(&needle)))
        }
        "startsWith" => {
            let needle = string_arg(args, this)?;
            Ok(EvalValue::Bool(recv_str.starts_with(&needle)))
        }
        "endsWith" => {
            let needle = string_arg(args, this)?;
            Ok(EvalValue::Bool(recv_str.ends_with(&needle)))
        }
        "matches" => {
            let pattern = string_arg(args, this)?;
            let re = regex::Regex::new(&pattern).map_err(|e| CelError::Eval(format!("bad regex: {e}")))?;
            Ok(EvalValue::Bool(re.is_match(&recv_str)))
        }
        other => Err(CelError::Eval(format!("unknown method: {other}"))),
    }
}

fn string_arg(args: &[Expr], this: &Value) -> CelResult<String> {
    let v = args
        .first()
        .ok_or_else(|| CelError::Eval("method requires one argument".into()))?
        .eval(this)?;
    match v {
        EvalValue::String(s) => Ok(s),
        other => Err(CelError::Eval(format!("expected string argument, found {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn msg(fields: Vec<(&str, Value)>) -> Value {
        let mut m = BTreeMap::new();
        for (k, v) in fields {
            m.insert(k.to_string(), v);
        }
        Value::Map(m)
    }

    #[test]
    fn simple_comparison() {
        let m = msg(vec![("age", Value::Number(21.0))]);
        assert!(eval("this.age >= 18", &m).unwrap());
        assert!(!eval("this.age < 18", &m).unwrap());
    }

    #[test]
    fn boolean_connectives() {
        let m = msg(vec![("a", Value::Bool(true)), ("b", Value::Bool(false))]);
        assert!(eval("this.a && !this.b", &m).unwrap());
        assert!(eval("this.a || this.b", &m).unwrap());
        assert!(!eval("this.a && this.b", &m).unwrap());
    }

    #[test]
    fn string_methods() {
        let m = msg(vec![("email", Value::String("a@example.com".into()))]);
        assert!(eval(r#"this.email.contains("@")"#, &m).unwrap());
        assert!(eval(r#"this.email.endsWith(".com")"#, &m).unwrap());
    }

    #[test]
    fn has_and_size() {
        let m = msg(vec![("items", Value::List(vec![Value::Number(1.0), Value::Number(2.0)]))]);
        assert!(eval("has(this.items)", &m).unwrap());
        assert!(!eval("has(this.missing)", &m).unwrap());
        assert!(eval("size(this.items) == 2", &m).unwrap());
    }

    #[test]
    fn cross_field_rule() {
        let m = msg(vec![
            ("start", Value::Number(1.0)),
            ("end", Value::Number(5.0)),
        ]);
        assert!(eval("this.end > this.start", &m).unwrap());
    }

    #[test]
    fn unparseable_expression_is_a_syntax_error() {
        let m = msg(vec![]);
        let err = eval("this.a ===", &m).unwrap_err();
        assert!(matches!(err, CelError::Syntax(_)));
    }

    #[test]
    fn undefined_field_is_an_eval_error() {
        let m = msg(vec![]);
        let err = eval("this.missing == 1", &m).unwrap_err();
        assert!(matches!(err, CelError::Eval(_)));
    }
}
