//! # Sable DNS cache
//!
//! The persistent knowledge of the DNS manager: three keyed maps of
//! immutable [`Mapping`] records with TTL aging, negative-answer
//! retention, change detection against prior answers, and an on-disk
//! snapshot that survives process restarts.
//!
//! ## Structure
//!
//! - **HostMap**: canonical name → (previous, current) mapping pair. The
//!   pair is what makes change events possible.
//! - **AddrMap**: address → most recent reverse mapping.
//! - **TextMap**: text-query key → most recent text mapping.
//!
//! Expired entries are evicted lazily: on lookup (when asked), during an
//! explicit [`CacheStore::expire`] pass, or wholesale via
//! [`CacheStore::flush`].

pub mod events;
pub mod mapping;
pub mod snapshot;
pub mod store;

pub use events::{EventKind, MappingEvent};
pub use mapping::{unix_now, Mapping, RecordError};
pub use store::{canonical_name, CacheStore, NAME_ERROR};
