//! Hand-written parser and evaluator for step conditionals.
//!
//! The grammar is deliberately tiny: comparisons over a whitelist of
//! identifiers, boolean connectives, and literals. No function calls, no
//! arithmetic, no assignment. Config files are data, so a general-purpose
//! evaluator is not pulled in.
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary := "!" primary | "(" expr ")" | literal | ident | ident "." prop
//! ```

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("type mismatch: cannot apply '{op}' to {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("expression did not evaluate to a boolean")]
    NotBoolean,
}

/// Value domain of the expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl ExprValue {
    fn type_name(&self) -> &'static str {
        match self {
            ExprValue::Str(_) => "string",
            ExprValue::Num(_) => "number",
            ExprValue::Bool(_) => "boolean",
        }
    }
}

/// Name resolution for evaluation. Returning `None` means the binding is
/// unknown, which surfaces as [`ExprError::UnknownIdentifier`].
pub trait Bindings {
    fn identifier(&self, name: &str) -> Option<ExprValue>;
    fn property(&self, step: &str, property: &str) -> Option<ExprValue>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(ExprValue),
    Identifier(String),
    Property(String, String),
    Not(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
}

/// A parsed conditional, retaining its source text for logging.
#[derive(Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    root: Node,
}

impl fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompiledExpr({})", self.source)
    }
}

impl CompiledExpr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            let (offset, _) = parser.tokens[parser.pos].clone();
            return Err(ExprError::Parse {
                offset,
                message: "unexpected trailing input".into(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Step names referenced as `<step>.<property>`, for load-time checks.
    pub fn referenced_steps(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_steps(&self.root, &mut out);
        out
    }

    /// Evaluate to a boolean. Any evaluation failure is returned to the
    /// caller, which treats the condition as false and logs it.
    pub fn eval(&self, bindings: &dyn Bindings) -> Result<bool, ExprError> {
        match eval_node(&self.root, bindings)? {
            ExprValue::Bool(b) => Ok(b),
            _ => Err(ExprError::NotBoolean),
        }
    }
}

fn collect_steps<'a>(node: &'a Node, out: &mut Vec<&'a str>) {
    match node {
        Node::Property(step, _) => out.push(step),
        Node::Not(inner) => collect_steps(inner, out),
        Node::Binary(_, lhs, rhs) => {
            collect_steps(lhs, out);
            collect_steps(rhs, out);
        }
        Node::Literal(_) | Node::Identifier(_) => {}
    }
}

fn eval_node(node: &Node, bindings: &dyn Bindings) -> Result<ExprValue, ExprError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Identifier(name) => bindings
            .identifier(name)
            .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
        Node::Property(step, property) => bindings
            .property(step, property)
            .ok_or_else(|| ExprError::UnknownIdentifier(format!("{step}.{property}"))),
        Node::Not(inner) => match eval_node(inner, bindings)? {
            ExprValue::Bool(b) => Ok(ExprValue::Bool(!b)),
            other => Err(ExprError::TypeMismatch {
                op: "!",
                lhs: other.type_name(),
                rhs: "boolean",
            }),
        },
        Node::Binary(op @ (BinOp::And | BinOp::Or), lhs, rhs) => {
            let left = expect_bool(*op, eval_node(lhs, bindings)?)?;
            // Short-circuit.
            match (*op, left) {
                (BinOp::And, false) => return Ok(ExprValue::Bool(false)),
                (BinOp::Or, true) => return Ok(ExprValue::Bool(true)),
                _ => {}
            }
            let right = expect_bool(*op, eval_node(rhs, bindings)?)?;
            Ok(ExprValue::Bool(right))
        }
        Node::Binary(op, lhs, rhs) => {
            let left = eval_node(lhs, bindings)?;
            let right = eval_node(rhs, bindings)?;
            compare(*op, left, right)
        }
    }
}

fn expect_bool(op: BinOp, value: ExprValue) -> Result<bool, ExprError> {
    match value {
        ExprValue::Bool(b) => Ok(b),
        other => Err(ExprError::TypeMismatch {
            op: op.symbol(),
            lhs: other.type_name(),
            rhs: "boolean",
        }),
    }
}

fn compare(op: BinOp, lhs: ExprValue, rhs: ExprValue) -> Result<ExprValue, ExprError> {
    let mismatch = |lhs: &ExprValue, rhs: &ExprValue| ExprError::TypeMismatch {
        op: op.symbol(),
        lhs: lhs.type_name(),
        rhs: rhs.type_name(),
    };
    let result = match op {
        BinOp::Eq | BinOp::Ne => {
            let equal = match (&lhs, &rhs) {
                (ExprValue::Str(a), ExprValue::Str(b)) => a == b,
                (ExprValue::Num(a), ExprValue::Num(b)) => a == b,
                (ExprValue::Bool(a), ExprValue::Bool(b)) => a == b,
                _ => return Err(mismatch(&lhs, &rhs)),
            };
            if op == BinOp::Eq { equal } else { !equal }
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let (a, b) = match (&lhs, &rhs) {
                (ExprValue::Num(a), ExprValue::Num(b)) => (*a, *b),
                _ => return Err(mismatch(&lhs, &rhs)),
            };
            match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                BinOp::Ge => a >= b,
                _ => unreachable!(),
            }
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    };
    Ok(ExprValue::Bool(result))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    Property(String, String),
    Str(String),
    Num(f64),
    Bool(bool),
    Op(BinOp),
    Bang,
    LParen,
    RParen,
}

type Spanned = (usize, Token);

fn lex(source: &str) -> Result<Vec<Spanned>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        match c {
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((start, Token::Op(BinOp::Ne)));
                    i += 2;
                } else {
                    tokens.push((start, Token::Bang));
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((start, Token::Op(BinOp::Eq)));
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        offset: start,
                        message: "single '=' is not an operator (use '==')".into(),
                    });
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((start, Token::Op(BinOp::Le)));
                    i += 2;
                } else {
                    tokens.push((start, Token::Op(BinOp::Lt)));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((start, Token::Op(BinOp::Ge)));
                    i += 2;
                } else {
                    tokens.push((start, Token::Op(BinOp::Gt)));
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push((start, Token::Op(BinOp::And)));
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        offset: start,
                        message: "single '&' is not an operator (use '&&')".into(),
                    });
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push((start, Token::Op(BinOp::Or)));
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        offset: start,
                        message: "single '|' is not an operator (use '||')".into(),
                    });
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' && i + 1 < chars.len() {
                        value.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    value.push(ch);
                    i += 1;
                }
                if !closed {
                    return Err(ExprError::Parse {
                        offset: start,
                        message: "unterminated string literal".into(),
                    });
                }
                tokens.push((start, Token::Str(value)));
            }
            _ if c.is_ascii_digit() => {
                let mut end = i;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                let text: String = chars[i..end].iter().collect();
                let num = text.parse::<f64>().map_err(|_| ExprError::Parse {
                    offset: start,
                    message: format!("invalid number literal '{text}'"),
                })?;
                tokens.push((start, Token::Num(num)));
                i = end;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let ident = read_ident(&chars, &mut i);
                if chars.get(i) == Some(&'.') {
                    i += 1;
                    if !matches!(chars.get(i), Some(ch) if ch.is_ascii_alphabetic() || *ch == '_') {
                        return Err(ExprError::Parse {
                            offset: i,
                            message: "expected property name after '.'".into(),
                        });
                    }
                    let property = read_ident(&chars, &mut i);
                    if property != "quality_score" && property != "status" {
                        return Err(ExprError::Parse {
                            offset: start,
                            message: format!(
                                "unsupported property '{property}' (allowed: quality_score, status)"
                            ),
                        });
                    }
                    tokens.push((start, Token::Property(ident, property)));
                } else {
                    match ident.as_str() {
                        "true" => tokens.push((start, Token::Bool(true))),
                        "false" => tokens.push((start, Token::Bool(false))),
                        _ => tokens.push((start, Token::Identifier(ident))),
                    }
                }
            }
            other => {
                return Err(ExprError::Parse {
                    offset: start,
                    message: format!("unexpected character '{other}'"),
                });
            }
        }
    }
    Ok(tokens)
}

fn read_ident(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && (chars[*i].is_ascii_alphanumeric() || chars[*i] == '_') {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<Spanned> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or_else(|| self.tokens.last().map(|(o, _)| o + 1).unwrap_or(0))
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Token::Op(BinOp::Or)) {
            self.bump();
            let rhs = self.parse_and()?;
            node = Node::Binary(BinOp::Or, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_cmp()?;
        while self.peek() == Some(&Token::Op(BinOp::And)) {
            self.bump();
            let rhs = self.parse_cmp()?;
            node = Node::Binary(BinOp::And, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_cmp(&mut self) -> Result<Node, ExprError> {
        let lhs = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if matches!(
                op,
                BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
            ) {
                self.bump();
                let rhs = self.parse_primary()?;
                return Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)));
            }
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        let offset = self.offset();
        match self.bump() {
            Some((_, Token::Bang)) => Ok(Node::Not(Box::new(self.parse_primary()?))),
            Some((_, Token::LParen)) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some((_, Token::RParen)) => Ok(inner),
                    _ => Err(ExprError::Parse {
                        offset: self.offset(),
                        message: "expected ')'".into(),
                    }),
                }
            }
            Some((_, Token::Str(s))) => Ok(Node::Literal(ExprValue::Str(s))),
            Some((_, Token::Num(n))) => Ok(Node::Literal(ExprValue::Num(n))),
            Some((_, Token::Bool(b))) => Ok(Node::Literal(ExprValue::Bool(b))),
            Some((_, Token::Identifier(name))) => Ok(Node::Identifier(name)),
            Some((_, Token::Property(step, property))) => Ok(Node::Property(step, property)),
            other => Err(ExprError::Parse {
                offset,
                message: match other {
                    Some((_, tok)) => format!("unexpected token {tok:?}"),
                    None => "unexpected end of expression".into(),
                },
            }),
        }
    }
}
