//! Query and answer model shared by the channel, the caches, and the
//! manager.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

/// Opaque identifier for one in-flight query. Doubles as the completion
/// cookie handed back by the channel.
pub type Token = u64;

/// Wire record types the manager issues and persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestType {
    A,
    Aaaa,
    Ptr,
    Txt,
}

impl RequestType {
    /// Returns the canonical textual tag used in the cache file.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::A => "A",
            RequestType::Aaaa => "AAAA",
            RequestType::Ptr => "PTR",
            RequestType::Txt => "TXT",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized record-type tags.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown request type: {0}")]
pub struct UnknownRequestType(pub String);

impl FromStr for RequestType {
    type Err = UnknownRequestType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(RequestType::A),
            "AAAA" => Ok(RequestType::Aaaa),
            "PTR" => Ok(RequestType::Ptr),
            "TXT" => Ok(RequestType::Txt),
            other => Err(UnknownRequestType(other.to_string())),
        }
    }
}

/// What a lookup is about, keyed the way the dedup maps key it.
///
/// Host names carried here are expected in canonical form (lowercased,
/// trailing dot stripped).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Reverse lookup for an address.
    Addr(IpAddr),

    /// Forward lookup for a host name.
    Host(String),

    /// Text lookup keyed by the raw query string.
    Text(String),
}

impl QueryKind {
    /// Returns the cache-file key for this kind.
    pub fn key(&self) -> String {
        match self {
            QueryKind::Addr(addr) => addr.to_string(),
            QueryKind::Host(name) | QueryKind::Text(name) => name.clone(),
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::Addr(addr) => write!(f, "addr/{addr}"),
            QueryKind::Host(name) => write!(f, "host/{name}"),
            QueryKind::Text(name) => write!(f, "text/{name}"),
        }
    }
}

/// One query handed to the stub channel. For reverse lookups `name` is
/// already in arpa form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub rtype: RequestType,
}

impl Query {
    pub fn new(name: impl Into<String>, rtype: RequestType) -> Self {
        Self { name: name.into(), rtype }
    }
}

/// Payload of a resolved answer. An empty payload is only meaningful for
/// failed (negative) mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Addrs(Vec<IpAddr>),
    Host(String),
    Text(String),
}

impl Payload {
    /// Returns true if the payload carries no data.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Addrs(addrs) => addrs.is_empty(),
            Payload::Host(name) => name.is_empty(),
            Payload::Text(text) => text.is_empty(),
        }
    }

    /// Returns the empty payload of the same shape.
    pub fn empty_like(&self) -> Payload {
        match self {
            Payload::Addrs(_) => Payload::Addrs(Vec::new()),
            Payload::Host(_) => Payload::Host(String::new()),
            Payload::Text(_) => Payload::Text(String::new()),
        }
    }
}

/// A decoded successful answer from the stub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub payload: Payload,

    /// Minimum TTL across the returned records, when the response carried
    /// one at all.
    pub ttl: Option<u32>,
}

impl Answer {
    pub fn new(payload: Payload, ttl: Option<u32>) -> Self {
        Self { payload, ttl }
    }
}

/// Failure outcomes reported by the stub channel. All of these are
/// negative-cached by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The name does not exist.
    NxDomain,

    /// The server answered but could not complete the query.
    ServFail,

    /// The stub library gave up after its own retry schedule.
    Timeout,

    /// Transport-level error.
    Network,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Failure::NxDomain => "NXDOMAIN",
            Failure::ServFail => "SERVFAIL",
            Failure::Timeout => "timeout",
            Failure::Network => "network error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_roundtrip() {
        for rtype in [RequestType::A, RequestType::Aaaa, RequestType::Ptr, RequestType::Txt] {
            assert_eq!(rtype.as_str().parse::<RequestType>().unwrap(), rtype);
        }
        assert!("MX".parse::<RequestType>().is_err());
    }

    #[test]
    fn payload_emptiness() {
        assert!(Payload::Addrs(Vec::new()).is_empty());
        assert!(!Payload::Host("host.example".into()).is_empty());
        assert_eq!(
            Payload::Text("abc".into()).empty_like(),
            Payload::Text(String::new())
        );
    }

    #[test]
    fn kind_keys() {
        let kind = QueryKind::Addr("192.0.2.1".parse().unwrap());
        assert_eq!(kind.key(), "192.0.2.1");
        assert_eq!(QueryKind::Host("a.test".into()).key(), "a.test");
    }
}
