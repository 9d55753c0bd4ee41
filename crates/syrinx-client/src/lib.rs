//! Client library for the syrinx pub/sub router.
//!
//! # Purpose
//! Maintains one full-duplex TCP session to a router, multiplexes many
//! in-flight requests over it, and routes asynchronous deliveries to the
//! subscription and quench handles that own them.
//!
//! ```no_run
//! use syrinx_client::Client;
//! use syrinx_wire::{NameValue, Value};
//!
//! # async fn demo() -> Result<(), syrinx_client::ClientError> {
//! let client = Client::new("127.0.0.1:2917", NameValue::new(), vec![], vec![]);
//! client.connect().await?;
//! let mut sub = client.subscribe("exists(foo)", true, vec![]).await?;
//! let mut nv = NameValue::new();
//! nv.insert("foo".into(), Value::Str("bar".into()));
//! client.notify(nv, true, vec![]).await?;
//! let delivered = sub.next().await;
//! assert!(delivered.is_some());
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```
mod client;
mod config;
mod session;
mod subscription;

pub use client::{Client, DisconnEvent};
pub use config::ClientOptions;
pub use subscription::{Quench, QuenchNotification, Subscription};

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("client is not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("connection lost")]
    ConnectionLost,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("request refused by router: {message} (code {code})")]
    Nack { code: u32, message: String },
    #[error(transparent)]
    Wire(#[from] syrinx_wire::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
