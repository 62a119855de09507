use super::lexer::{Spanned, Token};
use super::SelectorError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// One element of a compiled LIKE pattern.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LikePart {
    Char(char),
    AnyOne,
    AnyMany,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Literal),
    Ident(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Literal>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Vec<LikePart>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
}

/// Deepest expression tree (and deepest parenthesis, NOT or sign nesting) a
/// selector may have. Evaluation and drop both recurse over the tree.
pub(crate) const MAX_DEPTH: usize = 128;

/// An expression with the height of its tree.
type Parsed = (Expr, usize);

/// Recursive-descent parser over the token stream.
pub(crate) struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
    nesting: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Spanned>, input_len: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            end: input_len,
            nesting: 0,
        }
    }

    pub(crate) fn parse(mut self) -> Result<Expr, SelectorError> {
        let (expr, _) = self.or()?;
        if let Some((token, at)) = self.tokens.get(self.pos) {
            return Err(SelectorError::syntax(*at, format!("unexpected token {token:?}")));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, at)| *at).unwrap_or(self.end)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), SelectorError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(SelectorError::syntax(self.offset(), format!("expected {token:?}")))
        }
    }

    fn descend(&mut self) -> Result<(), SelectorError> {
        self.nesting += 1;
        if self.nesting > MAX_DEPTH {
            return Err(SelectorError::syntax(self.offset(), "selector is nested too deeply"));
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.nesting -= 1;
    }

    /// Height of a node whose tallest child is `child` high.
    fn above(&self, child: usize) -> Result<usize, SelectorError> {
        let height = child + 1;
        if height > MAX_DEPTH {
            return Err(SelectorError::syntax(self.offset(), "selector expression is too deep"));
        }
        Ok(height)
    }

    fn or(&mut self) -> Result<Parsed, SelectorError> {
        let (mut left, mut height) = self.and()?;
        while self.eat(&Token::Or) {
            let (right, h) = self.and()?;
            height = self.above(height.max(h))?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok((left, height))
    }

    fn and(&mut self) -> Result<Parsed, SelectorError> {
        let (mut left, mut height) = self.not()?;
        while self.eat(&Token::And) {
            let (right, h) = self.not()?;
            height = self.above(height.max(h))?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok((left, height))
    }

    fn not(&mut self) -> Result<Parsed, SelectorError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let (inner, h) = self.not()?;
            self.ascend();
            return Ok((Expr::Not(Box::new(inner)), self.above(h)?));
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Parsed, SelectorError> {
        let (left, lh) = self.additive()?;

        let cmp = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = cmp {
            self.pos += 1;
            let (right, rh) = self.additive()?;
            let height = self.above(lh.max(rh))?;
            return Ok((Expr::Compare(op, Box::new(left), Box::new(right)), height));
        }

        if self.eat(&Token::Is) {
            let negated = self.eat(&Token::Not);
            self.expect(Token::Null)?;
            let expr = Expr::IsNull {
                expr: Box::new(left),
                negated,
            };
            return Ok((expr, self.above(lh)?));
        }

        let negated = self.eat(&Token::Not);
        match self.peek() {
            Some(Token::Between) => {
                self.pos += 1;
                let (low, low_h) = self.additive()?;
                self.expect(Token::And)?;
                let (high, high_h) = self.additive()?;
                let height = self.above(lh.max(low_h).max(high_h))?;
                let expr = Expr::Between {
                    expr: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                };
                Ok((expr, height))
            }
            Some(Token::In) => {
                self.pos += 1;
                self.expect(Token::LParen)?;
                let mut list = vec![self.literal()?];
                while self.eat(&Token::Comma) {
                    list.push(self.literal()?);
                }
                self.expect(Token::RParen)?;
                let expr = Expr::In {
                    expr: Box::new(left),
                    list,
                    negated,
                };
                Ok((expr, self.above(lh)?))
            }
            Some(Token::Like) => {
                self.pos += 1;
                let pattern = self.string()?;
                let escape = if self.eat(&Token::Escape) {
                    let at = self.offset();
                    let esc = self.string()?;
                    let mut chars = esc.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => Some(c),
                        _ => {
                            return Err(SelectorError::syntax(
                                at,
                                "ESCAPE must be a single character",
                            ))
                        }
                    }
                } else {
                    None
                };
                let expr = Expr::Like {
                    expr: Box::new(left),
                    pattern: compile_like(&pattern, escape),
                    negated,
                };
                Ok((expr, self.above(lh)?))
            }
            _ if negated => Err(SelectorError::syntax(
                self.offset(),
                "expected BETWEEN, IN or LIKE after NOT",
            )),
            _ => Ok((left, lh)),
        }
    }

    fn additive(&mut self) -> Result<Parsed, SelectorError> {
        let (mut left, mut height) = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => return Ok((left, height)),
            };
            self.pos += 1;
            let (right, h) = self.multiplicative()?;
            height = self.above(height.max(h))?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Parsed, SelectorError> {
        let (mut left, mut height) = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                _ => return Ok((left, height)),
            };
            self.pos += 1;
            let (right, h) = self.unary()?;
            height = self.above(height.max(h))?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Parsed, SelectorError> {
        if self.eat(&Token::Minus) {
            self.descend()?;
            let (inner, h) = self.unary()?;
            self.ascend();
            return Ok((Expr::Neg(Box::new(inner)), self.above(h)?));
        }
        if self.eat(&Token::Plus) {
            self.descend()?;
            let parsed = self.unary()?;
            self.ascend();
            return Ok(parsed);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Parsed, SelectorError> {
        let at = self.offset();
        let token = self
            .tokens
            .get(self.pos)
            .map(|(t, _)| t.clone())
            .ok_or_else(|| SelectorError::syntax(at, "unexpected end of selector"))?;
        self.pos += 1;
        let leaf = match token {
            Token::LParen => {
                self.descend()?;
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                self.ascend();
                return Ok(inner);
            }
            Token::Ident(name) => Expr::Ident(name),
            Token::Str(s) => Expr::Literal(Literal::Str(s)),
            Token::Num(n) => Expr::Literal(Literal::Num(n)),
            Token::True => Expr::Literal(Literal::Bool(true)),
            Token::False => Expr::Literal(Literal::Bool(false)),
            Token::Null => Expr::Literal(Literal::Null),
            other => return Err(SelectorError::syntax(at, format!("unexpected token {other:?}"))),
        };
        Ok((leaf, 1))
    }

    fn literal(&mut self) -> Result<Literal, SelectorError> {
        let at = self.offset();
        let negative = self.eat(&Token::Minus);
        match self.tokens.get(self.pos).map(|(t, _)| t.clone()) {
            Some(Token::Num(n)) => {
                self.pos += 1;
                Ok(Literal::Num(if negative { -n } else { n }))
            }
            Some(Token::Str(s)) if !negative => {
                self.pos += 1;
                Ok(Literal::Str(s))
            }
            Some(Token::True) if !negative => {
                self.pos += 1;
                Ok(Literal::Bool(true))
            }
            Some(Token::False) if !negative => {
                self.pos += 1;
                Ok(Literal::Bool(false))
            }
            _ => Err(SelectorError::syntax(at, "expected a literal")),
        }
    }

    fn string(&mut self) -> Result<String, SelectorError> {
        let at = self.offset();
        match self.tokens.get(self.pos).map(|(t, _)| t.clone()) {
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(s)
            }
            _ => Err(SelectorError::syntax(at, "expected a string literal")),
        }
    }
}

fn compile_like(pattern: &str, escape: Option<char>) -> Vec<LikePart> {
    let mut parts = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            if let Some(escaped) = chars.next() {
                parts.push(LikePart::Char(escaped));
            }
            continue;
        }
        parts.push(match c {
            '%' => LikePart::AnyMany,
            '_' => LikePart::AnyOne,
            c => LikePart::Char(c),
        });
    }
    parts
}
