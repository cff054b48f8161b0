//! # Sable
//!
//! An asynchronous, caching DNS resolver manager for embedding in a
//! long-running, single-threaded host process. It fronts a stub-resolver
//! [`Channel`] and provides:
//!
//! - blocking forward/reverse/text lookups that pump an internal event
//!   loop until answered or out of budget,
//! - asynchronous lookups delivering results through caller-supplied
//!   [`LookupCallback`]s, with per-key request coalescing and a bounded
//!   admission queue,
//! - a persistent on-disk cache of resolved mappings that is compared
//!   against fresh answers to emit `dns_mapping_*` change events.
//!
//! The manager never spawns threads. It cooperates with the host's event
//! loop through [`SocketRegistrar`], [`DnsMgr::get_next_timeout`], and
//! [`DnsMgr::process`].

use thiserror::Error;

mod driver;
mod registry;

pub mod manager;
pub mod stats;

pub use manager::{DnsMgr, EventSink, LookupCallback, SocketRegistrar};
pub use stats::Stats;

pub use sable_cache::{canonical_name, CacheStore, EventKind, Mapping, MappingEvent};
pub use sable_config::{Config, Mode};
pub use sable_resolver::{
    Answer, Channel, ChannelError, ChannelSink, Failure, Outcome, Payload, Query, QueryKind,
    RequestType, Token,
};

/// Manager error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cache miss for {key} in FORCE mode")]
    ForceCacheMiss { key: String },

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for manager operations.
pub type Result<T> = std::result::Result<T, Error>;
