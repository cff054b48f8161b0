//! Immutable resolved-answer records and their cache-file line codec.

use std::net::{AddrParseError, IpAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use sable_resolver::{Payload, RequestType};
use sable_resolver::query::UnknownRequestType;
use thiserror::Error;

/// Returns the current wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One resolved answer: query key, payload, TTL, and whether the answer
/// was negative. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    created: u64,
    key: String,
    rtype: RequestType,
    payload: Payload,
    ttl: u32,
    failed: bool,
}

impl Mapping {
    /// Creates a mapping from a successful answer.
    pub fn new(
        key: impl Into<String>,
        rtype: RequestType,
        payload: Payload,
        ttl: u32,
        now: u64,
    ) -> Self {
        Self {
            created: now,
            key: key.into(),
            rtype,
            payload,
            ttl,
            failed: false,
        }
    }

    /// Creates a negative mapping. The payload is the empty shape for the
    /// request type.
    pub fn failed(key: impl Into<String>, rtype: RequestType, negative_ttl: u32, now: u64) -> Self {
        let payload = match rtype {
            RequestType::A | RequestType::Aaaa => Payload::Addrs(Vec::new()),
            RequestType::Ptr => Payload::Host(String::new()),
            RequestType::Txt => Payload::Text(String::new()),
        };
        Self {
            created: now,
            key: key.into(),
            rtype,
            payload,
            ttl: negative_ttl,
            failed: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn rtype(&self) -> RequestType {
        self.rtype
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Unix time at which the mapping stops being served.
    pub fn expires_at(&self) -> u64 {
        self.created.saturating_add(u64::from(self.ttl))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    /// Address list, empty for non-address mappings and negative entries.
    pub fn addrs(&self) -> &[IpAddr] {
        match &self.payload {
            Payload::Addrs(addrs) => addrs,
            _ => &[],
        }
    }

    /// Host name carried by a reverse mapping.
    pub fn host(&self) -> Option<&str> {
        match &self.payload {
            Payload::Host(name) if !name.is_empty() => Some(name),
            _ => None,
        }
    }

    /// Text carried by a text mapping.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) if !text.is_empty() => Some(text),
            _ => None,
        }
    }

    /// Serializes the mapping as one tab-separated cache-file record:
    /// `<creation_unix>\t<ttl>\t<req_type>\t<failed>\t<key>\t<payload>`.
    pub fn to_record(&self) -> String {
        let payload = match &self.payload {
            Payload::Addrs(addrs) => addrs
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(","),
            Payload::Host(name) => name.clone(),
            Payload::Text(text) => text.clone(),
        };
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.created,
            self.ttl,
            self.rtype,
            u8::from(self.failed),
            self.key,
            payload
        )
    }

    /// Parses one cache-file record.
    pub fn from_record(line: &str) -> Result<Self, RecordError> {
        let mut fields = line.splitn(6, '\t');
        let created = fields
            .next()
            .ok_or(RecordError::MissingFields)?
            .parse::<u64>()
            .map_err(|_| RecordError::BadTimestamp)?;
        let ttl = fields
            .next()
            .ok_or(RecordError::MissingFields)?
            .parse::<u32>()
            .map_err(|_| RecordError::BadTtl)?;
        let rtype: RequestType = fields.next().ok_or(RecordError::MissingFields)?.parse()?;
        let failed = match fields.next().ok_or(RecordError::MissingFields)? {
            "0" => false,
            "1" => true,
            _ => return Err(RecordError::BadFailedFlag),
        };
        let key = fields.next().ok_or(RecordError::MissingFields)?;
        if key.is_empty() {
            return Err(RecordError::EmptyKey);
        }
        let payload_text = fields.next().ok_or(RecordError::MissingFields)?;

        if failed {
            if !payload_text.is_empty() {
                return Err(RecordError::FailedWithPayload);
            }
            return Ok(Self {
                created,
                ..Self::failed(key, rtype, ttl, 0)
            });
        }

        if payload_text.is_empty() {
            return Err(RecordError::EmptyPayload);
        }
        let payload = match rtype {
            RequestType::A | RequestType::Aaaa => {
                let addrs = payload_text
                    .split(',')
                    .map(|a| a.parse::<IpAddr>())
                    .collect::<Result<Vec<_>, _>>()?;
                Payload::Addrs(addrs)
            }
            RequestType::Ptr => Payload::Host(payload_text.to_string()),
            RequestType::Txt => Payload::Text(payload_text.to_string()),
        };

        Ok(Self::new(key, rtype, payload, ttl, created))
    }
}

/// Cache-file record parse error.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("too few tab-separated fields")]
    MissingFields,

    #[error("unparseable creation timestamp")]
    BadTimestamp,

    #[error("unparseable ttl")]
    BadTtl,

    #[error(transparent)]
    BadType(#[from] UnknownRequestType),

    #[error("failed flag must be 0 or 1")]
    BadFailedFlag,

    #[error("empty query key")]
    EmptyKey,

    #[error("empty payload on a non-failed record")]
    EmptyPayload,

    #[error("non-empty payload on a failed record")]
    FailedWithPayload,

    #[error("unparseable address in payload: {0}")]
    BadAddress(#[from] AddrParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Payload {
        Payload::Addrs(list.iter().map(|a| a.parse().unwrap()).collect())
    }

    #[test]
    fn expiry_boundary() {
        let m = Mapping::new("a.test", RequestType::A, addrs(&["192.0.2.1"]), 300, 1_000);
        assert!(!m.is_expired(1_299));
        assert!(m.is_expired(1_300));
        assert_eq!(m.expires_at(), 1_300);
    }

    #[test]
    fn record_roundtrip() {
        let m = Mapping::new(
            "a.test",
            RequestType::A,
            addrs(&["192.0.2.1", "2001:db8::5"]),
            300,
            1_234,
        );
        let line = m.to_record();
        assert_eq!(line, "1234\t300\tA\t0\ta.test\t192.0.2.1,2001:db8::5");
        assert_eq!(Mapping::from_record(&line).unwrap(), m);
    }

    #[test]
    fn failed_record_roundtrip() {
        let m = Mapping::failed("b.test", RequestType::A, 60, 1_234);
        let line = m.to_record();
        assert_eq!(line, "1234\t60\tA\t1\tb.test\t");
        let parsed = Mapping::from_record(&line).unwrap();
        assert!(parsed.is_failed());
        assert_eq!(parsed, m);
    }

    #[test]
    fn ptr_record_roundtrip() {
        let m = Mapping::new(
            "192.0.2.1",
            RequestType::Ptr,
            Payload::Host("host.example".into()),
            3600,
            99,
        );
        assert_eq!(Mapping::from_record(&m.to_record()).unwrap(), m);
    }

    #[test]
    fn malformed_records_rejected() {
        for line in [
            "",
            "not-a-record",
            "x\t300\tA\t0\ta.test\t192.0.2.1",
            "1\tx\tA\t0\ta.test\t192.0.2.1",
            "1\t300\tMX\t0\ta.test\t192.0.2.1",
            "1\t300\tA\t2\ta.test\t192.0.2.1",
            "1\t300\tA\t0\t\t192.0.2.1",
            "1\t300\tA\t0\ta.test\t",
            "1\t300\tA\t1\ta.test\t192.0.2.1",
            "1\t300\tA\t0\ta.test\tnot-an-ip",
        ] {
            assert!(Mapping::from_record(line).is_err(), "accepted: {line:?}");
        }
    }

    #[test]
    fn text_payload_may_contain_tabs() {
        let line = "1\t300\tTXT\t0\tkey\tv=spf1\tinclude:example.com";
        let m = Mapping::from_record(line).unwrap();
        assert_eq!(m.text(), Some("v=spf1\tinclude:example.com"));
    }
}
