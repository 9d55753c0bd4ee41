// Wire model for the syrinx protocol: value types, the packet sum type,
// XDR-style bodies, and length-prefixed framing over a byte stream.
pub mod framing;
mod packet;
mod subast;
mod value;
mod xdr;

pub use framing::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
pub use packet::{disconn, nack, Packet, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
pub use subast::{CompareOp, Literal, SubAst, TypeHint};
pub use value::{keysets_match, merge_keysets, Keyset, NameValue, Value};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {len} bytes (cap {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("truncated packet body")]
    Truncated,
    #[error("trailing bytes after packet body")]
    TrailingBytes,
    #[error("unknown packet tag {0}")]
    UnknownPacket(u32),
    #[error("unknown value tag {0}")]
    UnknownValueTag(u32),
    #[error("unknown expression node tag {0}")]
    UnknownAstNode(u32),
    #[error("expression nested too deeply")]
    AstTooDeep,
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
}
