//! JMS-style message selectors evaluated against message headers.
//!
//! A selector is compiled once when a subscription is added and then
//! evaluated for every candidate message. Evaluation follows SQL
//! three-valued logic: comparisons involving a missing property are
//! unknown, and only a definite `true` selects the message.

mod lexer;
mod parser;

use serde_json::Value;

use crate::error::BrokerError;
use crate::message::Message;

use parser::{ArithOp, CmpOp, Expr, LikePart, Literal, Parser};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectorError {
    #[error("selector syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("selector evaluation error: {0}")]
    Evaluation(String),
}

impl SelectorError {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            offset,
            message: message.into(),
        }
    }
}

impl From<SelectorError> for BrokerError {
    fn from(err: SelectorError) -> Self {
        BrokerError::routing(err.to_string())
    }
}

/// A compiled selector expression.
#[derive(Debug, Clone)]
pub struct Selector {
    source: String,
    expr: Expr,
}

impl Selector {
    pub fn compile(source: &str) -> Result<Self, SelectorError> {
        let tokens = lexer::tokenize(source)?;
        let expr = Parser::new(tokens, source.len()).parse()?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether `message` satisfies the selector.
    pub fn matches(&self, message: &Message) -> Result<bool, SelectorError> {
        Ok(truth(&self.expr, message)? == Some(true))
    }
}

/// Runtime value of a sub-expression.
#[derive(Debug, Clone, PartialEq)]
enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl From<&Literal> for Val {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Null => Val::Null,
            Literal::Bool(b) => Val::Bool(*b),
            Literal::Num(n) => Val::Num(*n),
            Literal::Str(s) => Val::Str(s.clone()),
        }
    }
}

fn from_json(value: Option<&Value>) -> Val {
    match value {
        Some(Value::Bool(b)) => Val::Bool(*b),
        Some(Value::Number(n)) => n.as_f64().map(Val::Num).unwrap_or(Val::Null),
        Some(Value::String(s)) => Val::Str(s.clone()),
        _ => Val::Null,
    }
}

/// Three-valued truth of a boolean expression; `None` is unknown.
fn truth(expr: &Expr, msg: &Message) -> Result<Option<bool>, SelectorError> {
    match expr {
        Expr::And(a, b) => {
            let left = truth(a, msg)?;
            if left == Some(false) {
                return Ok(Some(false));
            }
            Ok(match (left, truth(b, msg)?) {
                (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            })
        }
        Expr::Or(a, b) => {
            let left = truth(a, msg)?;
            if left == Some(true) {
                return Ok(Some(true));
            }
            Ok(match (left, truth(b, msg)?) {
                (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            })
        }
        Expr::Not(inner) => Ok(truth(inner, msg)?.map(|b| !b)),
        Expr::Compare(op, a, b) => Ok(compare(*op, &value(a, msg)?, &value(b, msg)?)),
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = value(expr, msg)?;
            let lo = compare(CmpOp::Ge, &v, &value(low, msg)?);
            let hi = compare(CmpOp::Le, &v, &value(high, msg)?);
            let within = match (lo, hi) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            };
            Ok(negate(within, *negated))
        }
        Expr::In {
            expr,
            list,
            negated,
        } => {
            let v = value(expr, msg)?;
            if v == Val::Null {
                return Ok(None);
            }
            let found = list
                .iter()
                .any(|lit| compare(CmpOp::Eq, &v, &Val::from(lit)) == Some(true));
            Ok(negate(Some(found), *negated))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => match value(expr, msg)? {
            Val::Null => Ok(None),
            Val::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(negate(Some(like(&chars, pattern)), *negated))
            }
            other => Err(SelectorError::Evaluation(format!(
                "LIKE requires a string operand, got {other:?}"
            ))),
        },
        Expr::IsNull { expr, negated } => {
            let is_null = value(expr, msg)? == Val::Null;
            Ok(Some(is_null != *negated))
        }
        Expr::Literal(_) | Expr::Ident(_) | Expr::Neg(_) | Expr::Arith(..) => {
            match value(expr, msg)? {
                Val::Bool(b) => Ok(Some(b)),
                Val::Null => Ok(None),
                other => Err(SelectorError::Evaluation(format!(
                    "expected a boolean, got {other:?}"
                ))),
            }
        }
    }
}

fn negate(v: Option<bool>, negated: bool) -> Option<bool> {
    if negated {
        v.map(|b| !b)
    } else {
        v
    }
}

fn value(expr: &Expr, msg: &Message) -> Result<Val, SelectorError> {
    match expr {
        Expr::Literal(lit) => Ok(Val::from(lit)),
        Expr::Ident(name) => Ok(from_json(msg.property(name))),
        Expr::Neg(inner) => match value(inner, msg)? {
            Val::Num(n) => Ok(Val::Num(-n)),
            Val::Null => Ok(Val::Null),
            other => Err(SelectorError::Evaluation(format!("cannot negate {other:?}"))),
        },
        Expr::Arith(op, a, b) => match (value(a, msg)?, value(b, msg)?) {
            (Val::Num(x), Val::Num(y)) => Ok(match op {
                ArithOp::Add => Val::Num(x + y),
                ArithOp::Sub => Val::Num(x - y),
                ArithOp::Mul => Val::Num(x * y),
                ArithOp::Div if y == 0.0 => Val::Null,
                ArithOp::Div => Val::Num(x / y),
            }),
            (Val::Null, _) | (_, Val::Null) => Ok(Val::Null),
            (x, y) => Err(SelectorError::Evaluation(format!(
                "arithmetic on non-numeric operands {x:?} and {y:?}"
            ))),
        },
        boolean => Ok(match truth(boolean, msg)? {
            Some(b) => Val::Bool(b),
            None => Val::Null,
        }),
    }
}

fn compare(op: CmpOp, a: &Val, b: &Val) -> Option<bool> {
    match (a, b) {
        (Val::Num(x), Val::Num(y)) => Some(match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        }),
        (Val::Str(x), Val::Str(y)) => match op {
            CmpOp::Eq => Some(x == y),
            CmpOp::Ne => Some(x != y),
            _ => None,
        },
        (Val::Bool(x), Val::Bool(y)) => match op {
            CmpOp::Eq => Some(x == y),
            CmpOp::Ne => Some(x != y),
            _ => None,
        },
        _ => None,
    }
}

/// Wildcard match without recursion. On a mismatch the last `%` absorbs one
/// more character and matching resumes after it.
fn like(text: &[char], pattern: &[LikePart]) -> bool {
    let (mut t, mut p) = (0, 0);
    // Pattern index after the last `%`, and the text position it has consumed up to.
    let mut resume: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(LikePart::AnyMany) => {
                p += 1;
                resume = Some((p, t));
            }
            Some(LikePart::AnyOne) => {
                t += 1;
                p += 1;
            }
            Some(LikePart::Char(c)) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match resume {
                Some((after_star, absorbed)) => {
                    p = after_star;
                    t = absorbed + 1;
                    resume = Some((after_star, t));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|part| *part == LikePart::AnyMany)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(headers: Value) -> Message {
        let mut m = Message::data("d", Value::Null);
        if let Value::Object(map) = headers {
            m.headers = map;
        }
        m
    }

    fn eval(selector: &str, headers: Value) -> bool {
        Selector::compile(selector).unwrap().matches(&msg(headers)).unwrap()
    }

    #[test]
    fn numeric_comparison() {
        assert!(eval("price > 100", json!({ "price": 120 })));
        assert!(!eval("price > 100", json!({ "price": 80 })));
        assert!(eval("price * 2 >= 200 AND qty <> 0", json!({ "price": 100, "qty": 1 })));
    }

    #[test]
    fn missing_property_is_unknown_not_true() {
        assert!(!eval("price > 100", json!({})));
        assert!(!eval("NOT (price > 100)", json!({})));
        assert!(eval("price > 100 OR region = 'eu'", json!({ "region": "eu" })));
    }

    #[test]
    fn string_predicates() {
        let h = json!({ "symbol": "ADBE", "region": "us" });
        assert!(eval("symbol LIKE 'AD%'", h.clone()));
        assert!(eval("symbol LIKE '_DBE'", h.clone()));
        assert!(!eval("symbol NOT LIKE 'AD%'", h.clone()));
        assert!(eval("region IN ('us', 'ca')", h.clone()));
        assert!(eval("region NOT IN ('eu')", h.clone()));
        assert!(!eval("region IN ('eu')", h));
    }

    #[test]
    fn like_wildcards_backtrack_across_percent() {
        let h = json!({ "s": "aXbXc" });
        assert!(eval("s LIKE '%b%'", h.clone()));
        assert!(eval("s LIKE 'a%X%c'", h.clone()));
        assert!(eval("s LIKE '%_c'", h.clone()));
        assert!(eval("s LIKE '%%%'", h.clone()));
        assert!(!eval("s LIKE '%b'", h.clone()));
        assert!(!eval("s LIKE 'a_c%'", h));
        assert!(eval("s LIKE ''", json!({ "s": "" })));
    }

    #[test]
    fn like_with_many_wildcards_stays_fast() {
        let h = json!({ "s": "a".repeat(10_000) });
        let started = std::time::Instant::now();
        assert!(!eval("s LIKE '%a%a%a%a%a%a%a%a%a%a%a%b'", h.clone()));
        assert!(eval("s LIKE '%a%a%a%a%a%a%a%a%a%a%a'", h));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn between_and_null_checks() {
        let h = json!({ "level": 3 });
        assert!(eval("level BETWEEN 1 AND 5", h.clone()));
        assert!(!eval("level NOT BETWEEN 1 AND 5", h.clone()));
        assert!(eval("other IS NULL", h.clone()));
        assert!(eval("level IS NOT NULL", h));
    }

    #[test]
    fn boolean_identifier_and_body_fallback() {
        let mut m = Message::data("d", json!({ "urgent": true }));
        m.set_header("x", 1);
        let sel = Selector::compile("urgent AND x = 1").unwrap();
        assert!(sel.matches(&m).unwrap());
    }

    #[test]
    fn type_errors_surface_as_evaluation_errors() {
        let sel = Selector::compile("name").unwrap();
        let err = sel.matches(&msg(json!({ "name": "x" }))).unwrap_err();
        assert!(matches!(err, SelectorError::Evaluation(_)));
    }

    #[test]
    fn compile_reports_syntax_errors() {
        assert!(matches!(
            Selector::compile("price >"),
            Err(SelectorError::Syntax { .. })
        ));
    }
}
