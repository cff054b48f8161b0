//! # Sable resolver channel
//!
//! The boundary between the DNS manager and the stub-resolver library that
//! actually talks to name servers. The manager never opens a socket itself;
//! it drives an implementation of [`Channel`] and reacts to the completions
//! and socket-state notifications the channel pushes through a
//! [`ChannelSink`].
//!
//! ## Contract
//!
//! - One [`Query`] per submitted token; the channel owns retries, EDNS, and
//!   UDP/TCP fallback internally.
//! - Completions may be delivered synchronously from within `submit`, from
//!   `process`, or from `process_timeouts`.
//! - After `cancel(token)` no completion may be delivered for that token.
//! - Socket-state notifications describe which descriptors the channel
//!   wants watched, and for which directions; a notification with neither
//!   direction set means the descriptor is closed.

use thiserror::Error;

pub mod arpa;
pub mod channel;
pub mod query;

pub use channel::{Channel, ChannelSink, Outcome};
pub use query::{Answer, Failure, Payload, Query, QueryKind, RequestType, Token};

/// Channel error.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel initialization failed: {0}")]
    Init(String),

    #[error("malformed name or address: {0}")]
    BadName(String),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
