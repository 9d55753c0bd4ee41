//! Subscription expression parsing and evaluation.
//!
//! # Purpose
//! Turns subscription expression source into the wire-level `SubAst` tree and
//! evaluates trees against notifications on the dispatch path.
//!
//! # Supported subset
//! `exists(name)`, typed attribute references (`int32(n)`, `int64(n)`,
//! `real64(n)`, `string(n)`) and bare references, comparison against integer,
//! real, and quoted string literals, `&&`, `||`, `!`, and parentheses.
//! Evaluation of a missing attribute or a type mismatch is false; it never
//! fails.
use std::collections::BTreeSet;

use syrinx_wire::{CompareOp, Literal, NameValue, SubAst, TypeHint, Value};

#[derive(thiserror::Error, Debug)]
#[error("parse error at byte {position}: {message}")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

/// Parse an expression into its abstract tree.
pub fn parse(input: &str) -> Result<SubAst, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, index: 0 };
    let ast = parser.expression()?;
    match parser.peek() {
        None => Ok(ast),
        Some(token) => Err(ParseError {
            position: token.position,
            message: format!("unexpected {}", token.kind.describe()),
        }),
    }
}

/// Evaluate a tree against a notification.
pub fn evaluate(ast: &SubAst, nv: &NameValue) -> bool {
    match ast {
        SubAst::Exists(name) => nv.contains_key(name),
        SubAst::Compare {
            op,
            name,
            hint,
            literal,
        } => match nv.get(name) {
            Some(value) => compare(*op, value, *hint, literal),
            None => false,
        },
        SubAst::And(lhs, rhs) => evaluate(lhs, nv) && evaluate(rhs, nv),
        SubAst::Or(lhs, rhs) => evaluate(lhs, nv) || evaluate(rhs, nv),
        SubAst::Not(inner) => !evaluate(inner, nv),
    }
}

/// Attribute names referenced anywhere in a tree. Quench matching keys off
/// this set.
pub fn names(ast: &SubAst) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_names(ast, &mut out);
    out
}

fn collect_names(ast: &SubAst, out: &mut BTreeSet<String>) {
    match ast {
        SubAst::Exists(name) => {
            out.insert(name.clone());
        }
        SubAst::Compare { name, .. } => {
            out.insert(name.clone());
        }
        SubAst::And(lhs, rhs) | SubAst::Or(lhs, rhs) => {
            collect_names(lhs, out);
            collect_names(rhs, out);
        }
        SubAst::Not(inner) => collect_names(inner, out),
    }
}

fn compare(op: CompareOp, value: &Value, hint: TypeHint, literal: &Literal) -> bool {
    // The hint narrows which attribute types participate at all.
    let accepted = match (hint, value) {
        (TypeHint::Int32, Value::Int32(_)) => true,
        (TypeHint::Int64, Value::Int64(_)) => true,
        (TypeHint::Real64, Value::Float64(_)) => true,
        (TypeHint::String, Value::Str(_)) => true,
        (TypeHint::Any, _) => true,
        _ => false,
    };
    if !accepted {
        return false;
    }
    match (value, literal) {
        (Value::Int32(v), Literal::Int(lit)) => ordering_matches(op, i64::from(*v).cmp(lit)),
        (Value::Int64(v), Literal::Int(lit)) => ordering_matches(op, v.cmp(lit)),
        (Value::Float64(v), Literal::Real(lit)) => match v.partial_cmp(lit) {
            Some(ordering) => ordering_matches(op, ordering),
            None => false,
        },
        (Value::Str(v), Literal::Str(lit)) => ordering_matches(op, v.as_str().cmp(lit.as_str())),
        _ => false,
    }
}

fn ordering_matches(op: CompareOp, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CompareOp::Eq => ordering == Equal,
        CompareOp::Ne => ordering != Equal,
        CompareOp::Lt => ordering == Less,
        CompareOp::Le => ordering != Greater,
        CompareOp::Gt => ordering == Greater,
        CompareOp::Ge => ordering != Less,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Int(i64),
    Real(f64),
    Str(String),
    LParen,
    RParen,
    AndAnd,
    OrOr,
    Bang,
    Op(CompareOp),
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier `{name}`"),
            TokenKind::Int(v) => format!("integer {v}"),
            TokenKind::Real(v) => format!("real {v}"),
            TokenKind::Str(_) => "string literal".into(),
            TokenKind::LParen => "`(`".into(),
            TokenKind::RParen => "`)`".into(),
            TokenKind::AndAnd => "`&&`".into(),
            TokenKind::OrOr => "`||`".into(),
            TokenKind::Bang => "`!`".into(),
            TokenKind::Op(_) => "comparison operator".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
            }
            b'(' => {
                tokens.push(Token {
                    kind: TokenKind::LParen,
                    position: start,
                });
                i += 1;
            }
            b')' => {
                tokens.push(Token {
                    kind: TokenKind::RParen,
                    position: start,
                });
                i += 1;
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token {
                    kind: TokenKind::AndAnd,
                    position: start,
                });
                i += 2;
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Token {
                    kind: TokenKind::OrOr,
                    position: start,
                });
                i += 2;
            }
            b'=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token {
                    kind: TokenKind::Op(CompareOp::Eq),
                    position: start,
                });
                i += 2;
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token {
                    kind: TokenKind::Op(CompareOp::Ne),
                    position: start,
                });
                i += 2;
            }
            b'!' => {
                tokens.push(Token {
                    kind: TokenKind::Bang,
                    position: start,
                });
                i += 1;
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token {
                        kind: TokenKind::Op(CompareOp::Le),
                        position: start,
                    });
                    i += 2;
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Op(CompareOp::Lt),
                        position: start,
                    });
                    i += 1;
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token {
                        kind: TokenKind::Op(CompareOp::Ge),
                        position: start,
                    });
                    i += 2;
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Op(CompareOp::Gt),
                        position: start,
                    });
                    i += 1;
                }
            }
            b'"' => {
                i += 1;
                let mut value = String::new();
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(ParseError {
                                position: start,
                                message: "unterminated string literal".into(),
                            })
                        }
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            match bytes.get(i + 1) {
                                Some(b'"') => value.push('"'),
                                Some(b'\\') => value.push('\\'),
                                _ => {
                                    return Err(ParseError {
                                        position: i,
                                        message: "bad escape in string literal".into(),
                                    })
                                }
                            }
                            i += 2;
                        }
                        Some(&c) => {
                            value.push(c as char);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str(value),
                    position: start,
                });
            }
            b'0'..=b'9' | b'-' => {
                i += 1;
                let mut is_real = false;
                while let Some(&c) = bytes.get(i) {
                    if c.is_ascii_digit() {
                        i += 1;
                    } else if c == b'.' && !is_real {
                        is_real = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text = &input[start..i];
                let kind = if is_real {
                    TokenKind::Real(text.parse().map_err(|_| ParseError {
                        position: start,
                        message: format!("bad real literal `{text}`"),
                    })?)
                } else {
                    TokenKind::Int(text.parse().map_err(|_| ParseError {
                        position: start,
                        message: format!("bad integer literal `{text}`"),
                    })?)
                };
                tokens.push(Token {
                    kind,
                    position: start,
                });
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                i += 1;
                while let Some(&c) = bytes.get(i) {
                    if c == b'_' || c.is_ascii_alphanumeric() {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(input[start..i].to_string()),
                    position: start,
                });
            }
            other => {
                return Err(ParseError {
                    position: start,
                    message: format!("unexpected character `{}`", other as char),
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn eof_error(&self) -> ParseError {
        ParseError {
            position: self.tokens.last().map(|t| t.position).unwrap_or(0),
            message: "unexpected end of expression".into(),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        match self.next() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(ParseError {
                position: token.position,
                message: format!("expected {}, found {}", kind.describe(), token.kind.describe()),
            }),
            None => Err(self.eof_error()),
        }
    }

    fn expression(&mut self) -> Result<SubAst, ParseError> {
        let mut lhs = self.conjunction()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::OrOr)) {
            self.next();
            let rhs = self.conjunction()?;
            lhs = SubAst::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn conjunction(&mut self) -> Result<SubAst, ParseError> {
        let mut lhs = self.unary()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::AndAnd)) {
            self.next();
            let rhs = self.unary()?;
            lhs = SubAst::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<SubAst, ParseError> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Bang)) {
            self.next();
            return Ok(SubAst::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<SubAst, ParseError> {
        let token = self.next().ok_or_else(|| self.eof_error())?;
        match token.kind {
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Ident(ident) => self.reference(ident, token.position),
            other => Err(ParseError {
                position: token.position,
                message: format!("expected expression, found {}", other.describe()),
            }),
        }
    }

    // exists(name), a typed reference, or a bare attribute reference; the
    // latter two must be followed by a comparison.
    fn reference(&mut self, ident: String, position: usize) -> Result<SubAst, ParseError> {
        let hint = match ident.as_str() {
            "exists" => {
                self.expect(TokenKind::LParen)?;
                let name = self.attribute_name()?;
                self.expect(TokenKind::RParen)?;
                return Ok(SubAst::Exists(name));
            }
            "int32" => Some(TypeHint::Int32),
            "int64" => Some(TypeHint::Int64),
            "real64" => Some(TypeHint::Real64),
            "string" => Some(TypeHint::String),
            _ => None,
        };
        let (name, hint) = match hint {
            Some(hint) => {
                self.expect(TokenKind::LParen)?;
                let name = self.attribute_name()?;
                self.expect(TokenKind::RParen)?;
                (name, hint)
            }
            None => (ident, TypeHint::Any),
        };
        let op = match self.next() {
            Some(Token {
                kind: TokenKind::Op(op),
                ..
            }) => op,
            Some(token) => {
                return Err(ParseError {
                    position: token.position,
                    message: format!("expected comparison, found {}", token.kind.describe()),
                })
            }
            None => {
                return Err(ParseError {
                    position,
                    message: "attribute reference needs a comparison".into(),
                })
            }
        };
        let literal = match self.next() {
            Some(Token {
                kind: TokenKind::Int(v),
                ..
            }) => Literal::Int(v),
            Some(Token {
                kind: TokenKind::Real(v),
                ..
            }) => Literal::Real(v),
            Some(Token {
                kind: TokenKind::Str(v),
                ..
            }) => Literal::Str(v),
            Some(token) => {
                return Err(ParseError {
                    position: token.position,
                    message: format!("expected literal, found {}", token.kind.describe()),
                })
            }
            None => return Err(self.eof_error()),
        };
        Ok(SubAst::Compare {
            op,
            name,
            hint,
            literal,
        })
    }

    fn attribute_name(&mut self) -> Result<String, ParseError> {
        match self.next() {
            Some(Token {
                kind: TokenKind::Ident(name),
                ..
            }) => Ok(name),
            Some(token) => Err(ParseError {
                position: token.position,
                message: format!("expected attribute name, found {}", token.kind.describe()),
            }),
            None => Err(self.eof_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nv(pairs: &[(&str, Value)]) -> NameValue {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn exists_matches_presence() {
        let ast = parse("exists(foo)").expect("parse");
        assert!(evaluate(&ast, &nv(&[("foo", Value::Str("bar".into()))])));
        assert!(!evaluate(&ast, &nv(&[("baz", Value::Str("bar".into()))])));
    }

    #[test]
    fn typed_comparison() {
        let ast = parse("exists(foo) && int32(n) > 0").expect("parse");
        assert!(evaluate(
            &ast,
            &nv(&[("foo", Value::Str("bar".into())), ("n", Value::Int32(1))])
        ));
        assert!(!evaluate(
            &ast,
            &nv(&[("foo", Value::Str("bar".into())), ("n", Value::Int32(0))])
        ));
        // Wrong attribute type never matches the typed reference.
        assert!(!evaluate(
            &ast,
            &nv(&[("foo", Value::Str("bar".into())), ("n", Value::Int64(1))])
        ));
    }

    #[test]
    fn bare_reference_compares_by_value_type() {
        let ast = parse("size >= 10").expect("parse");
        assert!(evaluate(&ast, &nv(&[("size", Value::Int32(10))])));
        assert!(evaluate(&ast, &nv(&[("size", Value::Int64(11))])));
        assert!(!evaluate(&ast, &nv(&[("size", Value::Str("10".into()))])));
    }

    #[test]
    fn string_and_real_literals() {
        let ast = parse("string(who) == \"syrinx\" || real64(load) < 0.5").expect("parse");
        assert!(evaluate(&ast, &nv(&[("who", Value::Str("syrinx".into()))])));
        assert!(evaluate(&ast, &nv(&[("load", Value::Float64(0.25))])));
        assert!(!evaluate(&ast, &nv(&[("load", Value::Float64(0.75))])));
    }

    #[test]
    fn negation_and_parentheses() {
        let ast = parse("!(exists(a) || exists(b))").expect("parse");
        assert!(evaluate(&ast, &NameValue::new()));
        assert!(!evaluate(&ast, &nv(&[("a", Value::Int32(1))])));
    }

    #[test]
    fn missing_attribute_is_false_not_error() {
        let ast = parse("int32(n) != 5").expect("parse");
        assert!(!evaluate(&ast, &NameValue::new()));
    }

    #[test]
    fn referenced_names_are_collected() {
        let ast = parse("exists(foo) && (int32(n) > 0 || !exists(bar))").expect("parse");
        let collected = names(&ast);
        assert_eq!(
            collected.into_iter().collect::<Vec<_>>(),
            vec!["bar".to_string(), "foo".to_string(), "n".to_string()]
        );
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = parse("exists(").expect_err("eof");
        assert!(err.to_string().contains("parse error"));
        let err = parse("foo bar").expect_err("comparison");
        assert!(err.position > 0);
        let err = parse("\"unterminated").expect_err("string");
        assert!(err.to_string().contains("unterminated"));
        parse("int32(n) > ").expect_err("literal");
        parse("&& exists(a)").expect_err("lead");
    }

    #[test]
    fn negative_integer_literal() {
        let ast = parse("int32(delta) < -3").expect("parse");
        assert!(evaluate(&ast, &nv(&[("delta", Value::Int32(-4))])));
        assert!(!evaluate(&ast, &nv(&[("delta", Value::Int32(-3))])));
    }
}
