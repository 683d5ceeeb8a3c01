//! Compiled selection and weight expressions over named event columns.
//!
//! Cut predicates, weight products, and category definitions are plain
//! strings in the analysis configuration. They are compiled once at load
//! time into a small AST referencing event columns ("leaves") by index, and
//! evaluated per event or column-wise. Truth is `value > 0.0`.
//!
//! Supported: arithmetic (`+ - * /`), comparisons (`== != < <= > >=`),
//! boolean `&& || !`, unary minus, parentheses, numeric literals, and the
//! functions `abs sqrt log exp pow min max`.

use cf_core::{Error, Result};

/// A compiled expression ready for per-event or bulk evaluation.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    nodes: Vec<Node>,
    root: usize,
    /// Leaf (column) names referenced by the expression, in first-use order.
    pub required_leaves: Vec<String>,
}

/// Flattened AST node; child references are indices into `CompiledExpr::nodes`.
#[derive(Debug, Clone)]
enum Node {
    Num(f64),
    Leaf(usize),
    Neg(usize),
    Not(usize),
    Bin(Op, usize, usize),
    Fn1(Fn1, usize),
    Fn2(Fn2, usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
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

#[derive(Debug, Clone, Copy)]
enum Fn1 {
    Abs,
    Sqrt,
    Log,
    Exp,
}

#[derive(Debug, Clone, Copy)]
enum Fn2 {
    Pow,
    Min,
    Max,
}

impl Op {
    /// Left binding power; higher binds tighter.
    fn precedence(self) -> u8 {
        match self {
            Op::Or => 1,
            Op::And => 2,
            Op::Eq | Op::Ne => 3,
            Op::Lt | Op::Le | Op::Gt | Op::Ge => 4,
            Op::Add | Op::Sub => 5,
            Op::Mul | Op::Div => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(Op),
    Not,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
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
            '+' => {
                tokens.push(Token::Op(Op::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(Op::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(Op::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(Op::Div));
                i += 1;
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let next = bytes.get(i + 1).map(|&b| b as char);
                let (tok, len) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(Op::Eq), 2),
                    ('!', Some('=')) => (Token::Op(Op::Ne), 2),
                    ('<', Some('=')) => (Token::Op(Op::Le), 2),
                    ('>', Some('=')) => (Token::Op(Op::Ge), 2),
                    ('&', Some('&')) => (Token::Op(Op::And), 2),
                    ('|', Some('|')) => (Token::Op(Op::Or), 2),
                    ('<', _) => (Token::Op(Op::Lt), 1),
                    ('>', _) => (Token::Op(Op::Gt), 1),
                    ('!', _) => (Token::Not, 1),
                    _ => {
                        return Err(Error::Expression(format!(
                            "unexpected character '{}' at offset {}",
                            c, i
                        )))
                    }
                };
                tokens.push(tok);
                i += len;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len() {
                    let d = bytes[i] as char;
                    if d.is_ascii_digit() || d == '.' {
                        i += 1;
                    } else if (d == 'e' || d == 'E')
                        && i > start
                        && bytes
                            .get(i + 1)
                            .map(|&b| {
                                let n = b as char;
                                n.is_ascii_digit() || n == '+' || n == '-'
                            })
                            .unwrap_or(false)
                    {
                        i += 2;
                    } else {
                        break;
                    }
                }
                let text = &input[start..i];
                let value = text.parse::<f64>().map_err(|_| {
                    Error::Expression(format!("malformed number '{}'", text))
                })?;
                tokens.push(Token::Num(value));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let d = bytes[i] as char;
                    if d.is_ascii_alphanumeric() || d == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
            }
            _ => {
                return Err(Error::Expression(format!(
                    "unexpected character '{}' at offset {}",
                    c, i
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    nodes: Vec<Node>,
    leaves: Vec<String>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: &Token, context: &str) -> Result<()> {
        match self.bump() {
            Some(t) if t == want => Ok(()),
            other => Err(Error::Expression(format!(
                "expected {:?} {} but found {:?}",
                want, context, other
            ))),
        }
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn leaf_index(&mut self, name: &str) -> usize {
        match self.leaves.iter().position(|l| l == name) {
            Some(i) => i,
            None => {
                self.leaves.push(name.to_string());
                self.leaves.len() - 1
            }
        }
    }

    /// Pratt loop: parse a primary, then fold in operators of at least
    /// `min_prec` (all operators are left-associative).
    fn parse_expr(&mut self, min_prec: u8) -> Result<usize> {
        let mut lhs = self.parse_primary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if op.precedence() < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_expr(op.precedence() + 1)?;
            lhs = self.push(Node::Bin(op, lhs, rhs));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<usize> {
        let token = self
            .bump()
            .ok_or_else(|| Error::Expression("unexpected end of expression".into()))?
            .clone();
        match token {
            Token::Num(n) => Ok(self.push(Node::Num(n))),
            Token::Not => {
                let inner = self.parse_primary()?;
                Ok(self.push(Node::Not(inner)))
            }
            Token::Op(Op::Sub) => {
                let inner = self.parse_primary()?;
                Ok(self.push(Node::Neg(inner)))
            }
            Token::LParen => {
                let inner = self.parse_expr(1)?;
                self.expect(&Token::RParen, "to close group")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.parse_call(&name)
                } else {
                    match name.as_str() {
                        // Convenience constants used by synthetic cuts.
                        "true" => Ok(self.push(Node::Num(1.0))),
                        "false" => Ok(self.push(Node::Num(0.0))),
                        _ => {
                            let idx = self.leaf_index(&name);
                            Ok(self.push(Node::Leaf(idx)))
                        }
                    }
                }
            }
            other => Err(Error::Expression(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<usize> {
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_expr(1)?);
                match self.peek() {
                    Some(Token::Comma) => {
                        self.pos += 1;
                    }
                    _ => break,
                }
            }
        }
        self.expect(&Token::RParen, &format!("to close call to '{}'", name))?;

        let arity = args.len();
        let check = |want: usize| -> Result<()> {
            if arity == want {
                Ok(())
            } else {
                Err(Error::Expression(format!(
                    "'{}' takes {} argument(s), got {}",
                    name, want, arity
                )))
            }
        };
        let node = match name {
            "abs" => {
                check(1)?;
                Node::Fn1(Fn1::Abs, args[0])
            }
            "sqrt" => {
                check(1)?;
                Node::Fn1(Fn1::Sqrt, args[0])
            }
            "log" => {
                check(1)?;
                Node::Fn1(Fn1::Log, args[0])
            }
            "exp" => {
                check(1)?;
                Node::Fn1(Fn1::Exp, args[0])
            }
            "pow" => {
                check(2)?;
                Node::Fn2(Fn2::Pow, args[0], args[1])
            }
            "min" => {
                check(2)?;
                Node::Fn2(Fn2::Min, args[0], args[1])
            }
            "max" => {
                check(2)?;
                Node::Fn2(Fn2::Max, args[0], args[1])
            }
            _ => {
                return Err(Error::Expression(format!("unknown function '{}'", name)));
            }
        };
        Ok(self.push(node))
    }
}

fn truthy(v: f64) -> bool {
    v > 0.0
}

fn as_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl CompiledExpr {
    /// Parse and compile an expression string.
    ///
    /// Identifiers that are not function names resolve to event leaves.
    pub fn compile(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(Error::Expression("empty expression".into()));
        }
        let mut parser = Parser { tokens: &tokens, pos: 0, nodes: Vec::new(), leaves: Vec::new() };
        let root = parser.parse_expr(1)?;
        if parser.pos < tokens.len() {
            return Err(Error::Expression(format!(
                "trailing input after expression: {:?}",
                tokens[parser.pos]
            )));
        }
        Ok(CompiledExpr { nodes: parser.nodes, root, required_leaves: parser.leaves })
    }

    /// Evaluate for a single event.
    ///
    /// `leaves` must match `required_leaves` in length and order.
    pub fn eval_row(&self, leaves: &[f64]) -> f64 {
        self.eval_node(self.root, leaves)
    }

    /// Evaluate column-wise; `columns` must match `required_leaves` in order
    /// and all columns must have equal length.
    pub fn eval_bulk(&self, columns: &[&[f64]]) -> Vec<f64> {
        if columns.is_empty() {
            return vec![self.eval_row(&[])];
        }
        let n = columns[0].len();
        let mut row = vec![0.0; columns.len()];
        (0..n)
            .map(|i| {
                for (slot, col) in row.iter_mut().zip(columns) {
                    *slot = col[i];
                }
                self.eval_node(self.root, &row)
            })
            .collect()
    }

    /// Whether the expression holds (evaluates positive) for a single event.
    pub fn passes(&self, leaves: &[f64]) -> bool {
        truthy(self.eval_row(leaves))
    }

    fn eval_node(&self, idx: usize, leaves: &[f64]) -> f64 {
        match &self.nodes[idx] {
            Node::Num(n) => *n,
            Node::Leaf(i) => leaves[*i],
            Node::Neg(a) => -self.eval_node(*a, leaves),
            Node::Not(a) => as_f64(!truthy(self.eval_node(*a, leaves))),
            Node::Bin(op, a, b) => {
                let l = self.eval_node(*a, leaves);
                let r = self.eval_node(*b, leaves);
                match op {
                    Op::Add => l + r,
                    Op::Sub => l - r,
                    Op::Mul => l * r,
                    Op::Div => l / r,
                    Op::Eq => as_f64(l == r),
                    Op::Ne => as_f64(l != r),
                    Op::Lt => as_f64(l < r),
                    Op::Le => as_f64(l <= r),
                    Op::Gt => as_f64(l > r),
                    Op::Ge => as_f64(l >= r),
                    Op::And => as_f64(truthy(l) && truthy(r)),
                    Op::Or => as_f64(truthy(l) || truthy(r)),
                }
            }
            Node::Fn1(f, a) => {
                let v = self.eval_node(*a, leaves);
                match f {
                    Fn1::Abs => v.abs(),
                    Fn1::Sqrt => v.sqrt(),
                    Fn1::Log => v.ln(),
                    Fn1::Exp => v.exp(),
                }
            }
            Node::Fn2(f, a, b) => {
                let l = self.eval_node(*a, leaves);
                let r = self.eval_node(*b, leaves);
                match f {
                    Fn2::Pow => l.powf(r),
                    Fn2::Min => l.min(r),
                    Fn2::Max => l.max(r),
                }
            }
        }
    }
}
