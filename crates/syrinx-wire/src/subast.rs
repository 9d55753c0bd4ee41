// Abstract view of a subscription expression as carried by the quench
// notification packets. Parsing and evaluation live with the router; this
// module only defines the tree and its wire encoding.
use bytes::{BufMut, Bytes, BytesMut};

use crate::value::{TYPE_FLOAT64, TYPE_INT64, TYPE_STRING};
use crate::xdr;
use crate::{Error, Result};

const AST_EXISTS: u32 = 1;
const AST_COMPARE: u32 = 2;
const AST_AND: u32 = 3;
const AST_OR: u32 = 4;
const AST_NOT: u32 = 5;

// Nesting cap for decoding untrusted trees.
const MAX_AST_DEPTH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn to_wire(self) -> u32 {
        match self {
            CompareOp::Eq => 1,
            CompareOp::Ne => 2,
            CompareOp::Lt => 3,
            CompareOp::Le => 4,
            CompareOp::Gt => 5,
            CompareOp::Ge => 6,
        }
    }

    fn from_wire(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(CompareOp::Eq),
            2 => Ok(CompareOp::Ne),
            3 => Ok(CompareOp::Lt),
            4 => Ok(CompareOp::Le),
            5 => Ok(CompareOp::Gt),
            6 => Ok(CompareOp::Ge),
            other => Err(Error::UnknownAstNode(other)),
        }
    }
}

/// Requested attribute type in a typed reference such as `int32(n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    Any,
    Int32,
    Int64,
    Real64,
    String,
}

impl TypeHint {
    fn to_wire(self) -> u32 {
        match self {
            TypeHint::Any => 0,
            TypeHint::Int32 => 1,
            TypeHint::Int64 => 2,
            TypeHint::Real64 => 3,
            TypeHint::String => 4,
        }
    }

    fn from_wire(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(TypeHint::Any),
            1 => Ok(TypeHint::Int32),
            2 => Ok(TypeHint::Int64),
            3 => Ok(TypeHint::Real64),
            4 => Ok(TypeHint::String),
            other => Err(Error::UnknownAstNode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Real(f64),
    Str(String),
}

/// Subscription expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SubAst {
    Exists(String),
    Compare {
        op: CompareOp,
        name: String,
        hint: TypeHint,
        literal: Literal,
    },
    And(Box<SubAst>, Box<SubAst>),
    Or(Box<SubAst>, Box<SubAst>),
    Not(Box<SubAst>),
}

impl SubAst {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        match self {
            SubAst::Exists(name) => {
                buf.put_u32(AST_EXISTS);
                xdr::put_string(buf, name);
            }
            SubAst::Compare {
                op,
                name,
                hint,
                literal,
            } => {
                buf.put_u32(AST_COMPARE);
                buf.put_u32(op.to_wire());
                xdr::put_string(buf, name);
                buf.put_u32(hint.to_wire());
                match literal {
                    Literal::Int(v) => {
                        buf.put_u32(TYPE_INT64);
                        buf.put_i64(*v);
                    }
                    Literal::Real(v) => {
                        buf.put_u32(TYPE_FLOAT64);
                        buf.put_f64(*v);
                    }
                    Literal::Str(v) => {
                        buf.put_u32(TYPE_STRING);
                        xdr::put_string(buf, v);
                    }
                }
            }
            SubAst::And(lhs, rhs) => {
                buf.put_u32(AST_AND);
                lhs.encode(buf);
                rhs.encode(buf);
            }
            SubAst::Or(lhs, rhs) => {
                buf.put_u32(AST_OR);
                lhs.encode(buf);
                rhs.encode(buf);
            }
            SubAst::Not(inner) => {
                buf.put_u32(AST_NOT);
                inner.encode(buf);
            }
        }
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self> {
        Self::decode_at(buf, 0)
    }

    fn decode_at(buf: &mut Bytes, depth: u32) -> Result<Self> {
        if depth >= MAX_AST_DEPTH {
            return Err(Error::AstTooDeep);
        }
        let tag = xdr::get_u32(buf)?;
        match tag {
            AST_EXISTS => Ok(SubAst::Exists(xdr::get_string(buf)?)),
            AST_COMPARE => {
                let op = CompareOp::from_wire(xdr::get_u32(buf)?)?;
                let name = xdr::get_string(buf)?;
                let hint = TypeHint::from_wire(xdr::get_u32(buf)?)?;
                let literal = match xdr::get_u32(buf)? {
                    TYPE_INT64 => Literal::Int(xdr::get_i64(buf)?),
                    TYPE_FLOAT64 => Literal::Real(xdr::get_f64(buf)?),
                    TYPE_STRING => Literal::Str(xdr::get_string(buf)?),
                    other => return Err(Error::UnknownValueTag(other)),
                };
                Ok(SubAst::Compare {
                    op,
                    name,
                    hint,
                    literal,
                })
            }
            AST_AND => Ok(SubAst::And(
                Box::new(Self::decode_at(buf, depth + 1)?),
                Box::new(Self::decode_at(buf, depth + 1)?),
            )),
            AST_OR => Ok(SubAst::Or(
                Box::new(Self::decode_at(buf, depth + 1)?),
                Box::new(Self::decode_at(buf, depth + 1)?),
            )),
            AST_NOT => Ok(SubAst::Not(Box::new(Self::decode_at(buf, depth + 1)?))),
            other => Err(Error::UnknownAstNode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(ast: &SubAst) -> SubAst {
        let mut buf = BytesMut::new();
        ast.encode(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = SubAst::decode(&mut bytes).expect("decode");
        assert!(bytes.is_empty());
        decoded
    }

    #[test]
    fn exists_round_trip() {
        let ast = SubAst::Exists("foo".into());
        assert_eq!(round_trip(&ast), ast);
    }

    #[test]
    fn compound_round_trip() {
        let ast = SubAst::And(
            Box::new(SubAst::Exists("foo".into())),
            Box::new(SubAst::Not(Box::new(SubAst::Compare {
                op: CompareOp::Gt,
                name: "n".into(),
                hint: TypeHint::Int32,
                literal: Literal::Int(0),
            }))),
        );
        assert_eq!(round_trip(&ast), ast);
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut buf = BytesMut::new();
        for _ in 0..70 {
            buf.put_u32(AST_NOT);
        }
        buf.put_u32(AST_EXISTS);
        xdr::put_string(&mut buf, "x");
        let err = SubAst::decode(&mut buf.freeze()).expect_err("depth");
        assert!(matches!(err, Error::AstTooDeep));
    }
}
