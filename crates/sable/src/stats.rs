//! Manager statistics.

/// Point-in-time statistics for the manager. Counters cover every request
/// handed to the stub channel (blocking lookups create requests too);
/// gauges reflect the registries and caches at the moment of the call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Requests created.
    pub requests: u64,

    /// Requests that completed with an answer.
    pub successful: u64,

    /// Requests that failed or timed out.
    pub failed: u64,

    /// Live requests (queued or in flight).
    pub pending: u64,

    /// Cached forward entries.
    pub cached_hosts: u64,

    /// Cached reverse entries.
    pub cached_addresses: u64,

    /// Cached text entries.
    pub cached_texts: u64,
}
