//! The three keyed mapping caches and their TTL/negative-answer policy.

use std::collections::HashMap;
use std::net::IpAddr;

use sable_resolver::{Payload, RequestType};
use tracing::trace;

use crate::events::{EventKind, MappingEvent};
use crate::mapping::Mapping;

/// Synthetic hostname returned for negative reverse mappings when the
/// caller asked to distinguish "cached failure" from "not cached".
pub const NAME_ERROR: &str = "<name-error>";

/// Canonical form of a host name: lowercased, trailing dot stripped.
pub fn canonical_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Default)]
struct HostEntry {
    prev: Option<Mapping>,
    current: Option<Mapping>,
}

/// The cache store. Change events produced by ingestion and cleanup
/// accumulate internally and are drained by the owner via
/// [`CacheStore::take_events`].
#[derive(Debug)]
pub struct CacheStore {
    hosts: HashMap<String, HostEntry>,
    addrs: HashMap<IpAddr, Mapping>,
    texts: HashMap<String, Mapping>,
    negative_ttl: u32,
    events: Vec<MappingEvent>,
}

impl CacheStore {
    pub fn new(negative_ttl: u32) -> Self {
        Self {
            hosts: HashMap::new(),
            addrs: HashMap::new(),
            texts: HashMap::new(),
            negative_ttl,
            events: Vec::new(),
        }
    }

    /// Looks up the cached address set for a name.
    ///
    /// A failed mapping yields `Some(empty)` when `check_failed` is set,
    /// `None` otherwise. With `cleanup_expired`, an expired entry is
    /// evicted in-line (emitting `dns_mapping_lost_name` if the evicted
    /// mapping had succeeded).
    pub fn lookup_name(
        &mut self,
        name: &str,
        now: u64,
        cleanup_expired: bool,
        check_failed: bool,
    ) -> Option<Vec<IpAddr>> {
        let key = canonical_name(name);
        let expired = {
            let current = self.hosts.get(&key)?.current.as_ref()?;
            current.is_expired(now)
        };
        if expired {
            if cleanup_expired {
                self.evict_host(&key);
            }
            return None;
        }
        let current = self.hosts.get(&key)?.current.as_ref()?;
        if current.is_failed() {
            return check_failed.then(Vec::new);
        }
        Some(current.addrs().to_vec())
    }

    /// Looks up the cached hostname for an address. A failed mapping
    /// yields the synthetic [`NAME_ERROR`] string when `check_failed` is
    /// set.
    pub fn lookup_addr(
        &mut self,
        addr: &IpAddr,
        now: u64,
        cleanup_expired: bool,
        check_failed: bool,
    ) -> Option<String> {
        let mapping = self.addrs.get(addr)?;
        if mapping.is_expired(now) {
            if cleanup_expired {
                self.addrs.remove(addr);
            }
            return None;
        }
        if mapping.is_failed() {
            return check_failed.then(|| NAME_ERROR.to_string());
        }
        mapping.host().map(str::to_string)
    }

    /// Looks up the cached text value for a query key. A failed mapping
    /// yields `Some(empty)` when `check_failed` is set.
    pub fn lookup_text(
        &mut self,
        key: &str,
        now: u64,
        cleanup_expired: bool,
        check_failed: bool,
    ) -> Option<String> {
        let mapping = self.texts.get(key)?;
        if mapping.is_expired(now) {
            if cleanup_expired {
                self.texts.remove(key);
            }
            return None;
        }
        if mapping.is_failed() {
            return check_failed.then(String::new);
        }
        mapping.text().map(str::to_string)
    }

    /// Installs a forward mapping, shifting the displaced mapping into the
    /// "previous" slot and running change detection when both slots are
    /// populated.
    ///
    /// `addrs = None` records a negative answer with the configured
    /// negative TTL. With `merge`, a successful answer is unioned into the
    /// existing successful mapping and the smaller TTL wins.
    pub fn ingest_host(
        &mut self,
        name: &str,
        rtype: RequestType,
        addrs: Option<Vec<IpAddr>>,
        ttl: u32,
        merge: bool,
        now: u64,
    ) {
        let key = canonical_name(name);
        let mut new = match addrs {
            Some(list) => Mapping::new(key.clone(), rtype, Payload::Addrs(list), ttl, now),
            None => Mapping::failed(key.clone(), rtype, self.negative_ttl, now),
        };

        let entry = self.hosts.entry(key).or_default();
        let displaced = entry.current.take();

        if merge && !new.is_failed() {
            if let Some(old) = displaced.as_ref().filter(|old| !old.is_failed()) {
                let mut union = old.addrs().to_vec();
                for addr in new.addrs() {
                    if !union.contains(addr) {
                        union.push(*addr);
                    }
                }
                new = Mapping::new(
                    new.key().to_string(),
                    old.rtype(),
                    Payload::Addrs(union),
                    old.ttl().min(new.ttl()),
                    now,
                );
            }
        }

        entry.prev = displaced;
        entry.current = Some(new);

        let (prev, current) = (entry.prev.clone(), entry.current.clone());
        if let (Some(prev), Some(current)) = (prev, current) {
            self.compare(&prev, &current);
        }
    }

    /// Installs a reverse mapping, displacing any prior one. Reverse
    /// entries emit no change events.
    pub fn ingest_addr(&mut self, addr: IpAddr, host: Option<String>, ttl: u32, now: u64) {
        let key = addr.to_string();
        let mapping = match host {
            Some(name) => Mapping::new(key, RequestType::Ptr, Payload::Host(name), ttl, now),
            None => Mapping::failed(key, RequestType::Ptr, self.negative_ttl, now),
        };
        self.addrs.insert(addr, mapping);
    }

    /// Installs a text mapping, displacing any prior one.
    pub fn ingest_text(&mut self, key: &str, text: Option<String>, ttl: u32, now: u64) {
        let mapping = match text {
            Some(value) => Mapping::new(key, RequestType::Txt, Payload::Text(value), ttl, now),
            None => Mapping::failed(key, RequestType::Txt, self.negative_ttl, now),
        };
        self.texts.insert(key.to_string(), mapping);
    }

    /// Change detection between the previous and the fresh mapping of one
    /// host entry. At most one event fires per comparison; failure
    /// transitions take precedence over address-set deltas.
    fn compare(&mut self, prev: &Mapping, new: &Mapping) {
        match (prev.is_failed(), new.is_failed()) {
            (false, true) => {
                self.events
                    .push(MappingEvent::plain(EventKind::Unverified, prev.clone()));
            }
            (true, false) => {
                self.events
                    .push(MappingEvent::plain(EventKind::NewName, new.clone()));
            }
            (true, true) => {}
            (false, false) => {
                let mut added: Vec<IpAddr> = new
                    .addrs()
                    .iter()
                    .filter(|a| !prev.addrs().contains(a))
                    .copied()
                    .collect();
                let mut removed: Vec<IpAddr> = prev
                    .addrs()
                    .iter()
                    .filter(|a| !new.addrs().contains(a))
                    .copied()
                    .collect();
                if added.is_empty() && removed.is_empty() {
                    self.events
                        .push(MappingEvent::plain(EventKind::Valid, new.clone()));
                } else {
                    added.sort();
                    removed.sort();
                    self.events
                        .push(MappingEvent::altered(new.clone(), added, removed));
                }
            }
        }
    }

    fn evict_host(&mut self, key: &str) {
        if let Some(entry) = self.hosts.remove(key) {
            if let Some(current) = entry.current {
                if !current.is_failed() {
                    trace!(name = %current.key(), "expired host mapping evicted");
                    self.events
                        .push(MappingEvent::plain(EventKind::LostName, current));
                }
            }
        }
    }

    /// Sweeps all maps, evicting every expired entry.
    pub fn expire(&mut self, now: u64) {
        let expired: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, e)| e.current.as_ref().is_some_and(|m| m.is_expired(now)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.evict_host(&key);
        }
        self.addrs.retain(|_, m| !m.is_expired(now));
        self.texts.retain(|_, m| !m.is_expired(now));
    }

    /// Drains the change events accumulated since the last drain.
    pub fn take_events(&mut self) -> Vec<MappingEvent> {
        std::mem::take(&mut self.events)
    }

    /// Drops every cached entry without persisting anything.
    pub fn flush(&mut self) {
        self.hosts.clear();
        self.addrs.clear();
        self.texts.clear();
        self.events.clear();
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn addr_count(&self) -> usize {
        self.addrs.len()
    }

    pub fn text_count(&self) -> usize {
        self.texts.len()
    }

    /// Current mapping for a name, if cached.
    pub fn host_mapping(&self, name: &str) -> Option<&Mapping> {
        self.hosts.get(&canonical_name(name))?.current.as_ref()
    }

    /// Reverse mapping for an address, if cached.
    pub fn addr_mapping(&self, addr: &IpAddr) -> Option<&Mapping> {
        self.addrs.get(addr)
    }

    /// Text mapping for a key, if cached.
    pub fn text_mapping(&self, key: &str) -> Option<&Mapping> {
        self.texts.get(key)
    }

    pub(crate) fn snapshot_records(&self) -> Vec<&Mapping> {
        self.addrs
            .values()
            .chain(self.hosts.values().filter_map(|e| e.current.as_ref()))
            .collect()
    }

    pub(crate) fn install_loaded(&mut self, mapping: Mapping) {
        match mapping.rtype() {
            RequestType::A | RequestType::Aaaa => {
                let key = canonical_name(mapping.key());
                self.hosts.insert(
                    key,
                    HostEntry {
                        prev: None,
                        current: Some(mapping),
                    },
                );
            }
            RequestType::Ptr => match mapping.key().parse::<IpAddr>() {
                Ok(addr) => {
                    self.addrs.insert(addr, mapping);
                }
                Err(_) => {
                    tracing::warn!(key = %mapping.key(), "reverse record key is not an address, skipping");
                }
            },
            RequestType::Txt => {
                self.texts.insert(mapping.key().to_string(), mapping);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn forward_hit_and_expiry() {
        let mut store = CacheStore::new(60);
        store.ingest_host("A.Test.", RequestType::A, Some(ips(&["192.0.2.1"])), 300, false, 1_000);

        assert_eq!(
            store.lookup_name("a.test", 1_100, true, false),
            Some(ips(&["192.0.2.1"]))
        );
        // expired: lazily retained without cleanup, evicted with it
        assert_eq!(store.lookup_name("a.test", 2_000, false, false), None);
        assert_eq!(store.host_count(), 1);
        assert_eq!(store.lookup_name("a.test", 2_000, true, false), None);
        assert_eq!(store.host_count(), 0);

        let events = store.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::LostName);
    }

    #[test]
    fn negative_entries_use_negative_ttl() {
        let mut store = CacheStore::new(60);
        store.ingest_host("gone.test", RequestType::A, None, 3_600, false, 1_000);

        let mapping = store.host_mapping("gone.test").unwrap();
        assert!(mapping.is_failed());
        assert_eq!(mapping.ttl(), 60);

        assert_eq!(store.lookup_name("gone.test", 1_030, false, false), None);
        assert_eq!(
            store.lookup_name("gone.test", 1_030, false, true),
            Some(Vec::new())
        );
    }

    #[test]
    fn reverse_failed_lookup_is_synthetic() {
        let mut store = CacheStore::new(60);
        let addr: IpAddr = "192.0.2.9".parse().unwrap();
        store.ingest_addr(addr, None, 0, 1_000);

        assert_eq!(store.lookup_addr(&addr, 1_010, false, false), None);
        assert_eq!(
            store.lookup_addr(&addr, 1_010, false, true),
            Some(NAME_ERROR.to_string())
        );
    }

    #[test]
    fn replacement_shifts_pair_and_detects_delta() {
        let mut store = CacheStore::new(60);
        store.ingest_host("d.test", RequestType::A, Some(ips(&["10.0.0.1"])), 300, false, 1_000);
        assert!(store.take_events().is_empty());

        store.ingest_host("d.test", RequestType::A, Some(ips(&["10.0.0.2"])), 300, false, 1_100);
        let events = store.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Altered);
        assert_eq!(events[0].added, ips(&["10.0.0.2"]));
        assert_eq!(events[0].removed, ips(&["10.0.0.1"]));
    }

    #[test]
    fn identical_answer_is_valid() {
        let mut store = CacheStore::new(60);
        store.ingest_host("d.test", RequestType::A, Some(ips(&["10.0.0.1"])), 300, false, 1_000);
        store.ingest_host("d.test", RequestType::A, Some(ips(&["10.0.0.1"])), 600, false, 1_100);

        let events = store.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Valid);
    }

    #[test]
    fn failure_transitions() {
        let mut store = CacheStore::new(60);
        store.ingest_host("f.test", RequestType::A, Some(ips(&["10.0.0.1"])), 300, false, 1_000);
        store.ingest_host("f.test", RequestType::A, None, 0, false, 1_100);
        store.ingest_host("f.test", RequestType::A, Some(ips(&["10.0.0.2"])), 300, false, 1_200);

        let kinds: Vec<EventKind> = store.take_events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Unverified, EventKind::NewName]);
    }

    #[test]
    fn merge_unions_payloads_and_keeps_smaller_ttl() {
        let mut store = CacheStore::new(60);
        store.ingest_host("m.test", RequestType::A, Some(ips(&["192.0.2.1"])), 300, false, 1_000);
        store.ingest_host(
            "m.test",
            RequestType::Aaaa,
            Some(ips(&["2001:db8::1"])),
            120,
            true,
            1_010,
        );

        let mapping = store.host_mapping("m.test").unwrap();
        assert_eq!(mapping.addrs(), &ips(&["192.0.2.1", "2001:db8::1"])[..]);
        assert_eq!(mapping.ttl(), 120);
        assert_eq!(mapping.rtype(), RequestType::A);

        // union grew the set relative to the previous mapping
        let events = store.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Altered);
        assert_eq!(events[0].added, ips(&["2001:db8::1"]));
        assert!(events[0].removed.is_empty());
    }

    #[test]
    fn merge_with_identical_payload_is_valid() {
        let mut store = CacheStore::new(60);
        store.ingest_host("m.test", RequestType::A, Some(ips(&["192.0.2.1"])), 300, false, 1_000);
        store.ingest_host("m.test", RequestType::A, Some(ips(&["192.0.2.1"])), 300, true, 1_010);

        let events = store.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Valid);
    }

    #[test]
    fn expire_sweeps_all_maps() {
        let mut store = CacheStore::new(60);
        store.ingest_host("a.test", RequestType::A, Some(ips(&["192.0.2.1"])), 100, false, 1_000);
        store.ingest_addr("192.0.2.1".parse().unwrap(), Some("a.test".into()), 100, 1_000);
        store.ingest_text("k", Some("v".into()), 100, 1_000);

        store.expire(1_050);
        assert_eq!(store.host_count(), 1);

        store.expire(1_100);
        assert_eq!(store.host_count(), 0);
        assert_eq!(store.addr_count(), 0);
        assert_eq!(store.text_count(), 0);

        let kinds: Vec<EventKind> = store.take_events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::LostName]);
    }

    #[test]
    fn flush_drops_everything() {
        let mut store = CacheStore::new(60);
        store.ingest_host("a.test", RequestType::A, Some(ips(&["192.0.2.1"])), 100, false, 1_000);
        store.ingest_text("k", Some("v".into()), 100, 1_000);
        store.flush();

        assert_eq!(store.host_count() + store.addr_count() + store.text_count(), 0);
        assert!(store.take_events().is_empty());
    }
}
