//! The manager facade: blocking and asynchronous lookups, mode handling,
//! change-event emission, and host event-loop integration.

use std::cell::Cell;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use sable_cache::{canonical_name, unix_now, CacheStore, MappingEvent, NAME_ERROR};
use sable_config::{Config, Mode};
use sable_resolver::{arpa, Channel, Failure, Outcome, Payload, QueryKind, RequestType, Token};

use crate::driver::{ChannelEvents, Driver};
use crate::registry::{Registry, RequestState};
use crate::stats::Stats;
use crate::{Error, Result};

/// Callback interface for asynchronous lookups.
///
/// Exactly one of the two methods is invoked, exactly once, after the
/// request has been retired from the registry. Callbacks receive the
/// manager back and may issue further lookups from inside either method.
pub trait LookupCallback {
    /// The lookup finished; `result` is the cached state for the key
    /// (empty payload for a negative answer).
    fn resolved(&mut self, mgr: &mut DnsMgr, result: &Payload);

    /// The lookup exceeded its deadline without an answer.
    fn timeout(&mut self, mgr: &mut DnsMgr);
}

/// Host-loop side of descriptor registration. The manager mirrors the
/// stub channel's socket interest through this, so the host knows which
/// descriptors to watch.
pub trait SocketRegistrar {
    fn register_socket(&mut self, fd: RawFd, active: bool);
}

/// Receives mapping-change events. Events for one answer fire before the
/// answer's callbacks, so observers see consistent cache state.
pub trait EventSink {
    fn emit(&mut self, event: &MappingEvent);
}

/// The DNS manager. Single-threaded; all suspension happens inside
/// [`DnsMgr::resolve`]-style pumping or in the host's own poll loop.
pub struct DnsMgr {
    config: Config,
    cache: CacheStore,
    registry: Registry,
    driver: Driver,
    registrar: Option<Box<dyn SocketRegistrar>>,
    events: Option<Box<dyn EventSink>>,
}

impl DnsMgr {
    /// Creates a manager around a stub channel and loads any existing
    /// cache snapshot. A snapshot that fails to read is logged and
    /// ignored; the manager starts cold.
    pub fn new(config: Config, channel: Box<dyn Channel>) -> Self {
        let mut cache = CacheStore::new(config.negative_ttl);
        let path = config.cache_file();
        if let Err(e) = cache.load(&path) {
            warn!(path = %path.display(), error = %e, "failed to load cache snapshot");
        }
        info!(
            mode = ?config.mode,
            cache = %path.display(),
            hosts = cache.host_count(),
            addresses = cache.addr_count(),
            "dns manager initialized"
        );
        Self {
            config,
            cache,
            registry: Registry::new(),
            driver: Driver::new(channel),
            registrar: None,
            events: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Installs the host-loop registrar and mirrors any descriptors the
    /// channel already watches.
    pub fn set_registrar(&mut self, registrar: Box<dyn SocketRegistrar>) {
        let fds = self.driver.watched();
        self.registrar = Some(registrar);
        if let Some(r) = self.registrar.as_mut() {
            for fd in fds {
                r.register_socket(fd, true);
            }
        }
    }

    /// Installs the change-event sink. PRIME mode never emits.
    pub fn set_event_sink(&mut self, sink: Box<dyn EventSink>) {
        self.events = Some(sink);
    }

    /// Redirects future snapshots to another directory.
    pub fn set_dir(&mut self, dir: impl Into<PathBuf>) {
        self.config.dir = dir.into();
    }

    /// Full path of the cache snapshot file.
    pub fn cache_file(&self) -> PathBuf {
        self.config.cache_file()
    }

    // ---- blocking lookups ------------------------------------------------

    /// Looks up the addresses of a host, blocking until answered or out
    /// of budget. Returns an empty set on failure or timeout.
    pub fn lookup_host(&mut self, name: &str) -> Result<Vec<IpAddr>> {
        let name = canonical_name(name);
        if self.config.mode == Mode::Fake {
            return Ok(fake_addrs(&name));
        }
        if let Some(addrs) = self.cache.lookup_name(&name, unix_now(), false, true) {
            return Ok(addrs);
        }
        self.blocking_miss(QueryKind::Host(name.clone()))?;
        Ok(self
            .cache
            .lookup_name(&name, unix_now(), false, true)
            .unwrap_or_default())
    }

    /// Looks up the hostname of an address, blocking until answered or
    /// out of budget. Returns the literal address representation on
    /// failure or timeout.
    pub fn lookup_addr(&mut self, addr: &IpAddr) -> Result<String> {
        if self.config.mode == Mode::Fake {
            return Ok(fake_host(addr));
        }
        if let Some(name) = self.cache.lookup_addr(addr, unix_now(), false, true) {
            return Ok(unfail_host(name, addr));
        }
        self.blocking_miss(QueryKind::Addr(*addr))?;
        match self.cache.lookup_addr(addr, unix_now(), false, true) {
            Some(name) => Ok(unfail_host(name, addr)),
            None => Ok(addr.to_string()),
        }
    }

    /// Generic blocking lookup. `PTR` keys may be given as address
    /// literals or in arpa form; anything else is recorded as a negative
    /// text entry and answered empty.
    pub fn lookup(&mut self, name: &str, rtype: RequestType) -> Result<Payload> {
        match rtype {
            RequestType::A | RequestType::Aaaa => self.lookup_host(name).map(Payload::Addrs),
            RequestType::Ptr => match arpa::parse_ptr_name(name) {
                Some(addr) => self.lookup_addr(&addr).map(Payload::Host),
                None => {
                    self.reject_reverse_key(name);
                    Ok(Payload::Host(String::new()))
                }
            },
            RequestType::Txt => self.lookup_text(name).map(Payload::Text),
        }
    }

    fn lookup_text(&mut self, key: &str) -> Result<String> {
        if self.config.mode == Mode::Fake {
            return Ok(fake_text(key));
        }
        if let Some(text) = self.cache.lookup_text(key, unix_now(), false, true) {
            return Ok(text);
        }
        self.blocking_miss(QueryKind::Text(key.to_string()))?;
        Ok(self
            .cache
            .lookup_text(key, unix_now(), false, true)
            .unwrap_or_default())
    }

    // ---- asynchronous lookups --------------------------------------------

    /// Asynchronous host lookup. A cache hit resolves the callback before
    /// returning; a miss registers it on a new or already-pending request.
    pub fn lookup_host_async(
        &mut self,
        name: &str,
        mut callback: Box<dyn LookupCallback>,
    ) -> Result<()> {
        let name = canonical_name(name);
        if self.config.mode == Mode::Fake {
            let payload = Payload::Addrs(fake_addrs(&name));
            callback.resolved(self, &payload);
            return Ok(());
        }
        let now = unix_now();
        if let Some(addrs) = self.cache.lookup_name(&name, now, false, true) {
            trace!(name = %name, "async lookup served from cache");
            callback.resolved(self, &Payload::Addrs(addrs));
            return Ok(());
        }
        match self.config.mode {
            Mode::Force => Err(Error::ForceCacheMiss { key: name }),
            Mode::Prime => {
                self.prime_negative(&QueryKind::Host(name));
                callback.resolved(self, &Payload::Addrs(Vec::new()));
                Ok(())
            }
            Mode::Default | Mode::Fake => {
                self.start_or_join(QueryKind::Host(name), callback);
                Ok(())
            }
        }
    }

    /// Asynchronous reverse lookup.
    pub fn lookup_addr_async(
        &mut self,
        addr: &IpAddr,
        mut callback: Box<dyn LookupCallback>,
    ) -> Result<()> {
        if self.config.mode == Mode::Fake {
            let payload = Payload::Host(fake_host(addr));
            callback.resolved(self, &payload);
            return Ok(());
        }
        let now = unix_now();
        if let Some(name) = self.cache.lookup_addr(addr, now, false, true) {
            let payload = Payload::Host(unfail_host(name, addr));
            callback.resolved(self, &payload);
            return Ok(());
        }
        match self.config.mode {
            Mode::Force => Err(Error::ForceCacheMiss {
                key: addr.to_string(),
            }),
            Mode::Prime => {
                self.prime_negative(&QueryKind::Addr(*addr));
                callback.resolved(self, &Payload::Host(addr.to_string()));
                Ok(())
            }
            Mode::Default | Mode::Fake => {
                self.start_or_join(QueryKind::Addr(*addr), callback);
                Ok(())
            }
        }
    }

    /// Generic asynchronous lookup; see [`DnsMgr::lookup`] for key
    /// handling.
    pub fn lookup_async(
        &mut self,
        name: &str,
        rtype: RequestType,
        mut callback: Box<dyn LookupCallback>,
    ) -> Result<()> {
        match rtype {
            RequestType::A | RequestType::Aaaa => self.lookup_host_async(name, callback),
            RequestType::Ptr => match arpa::parse_ptr_name(name) {
                Some(addr) => self.lookup_addr_async(&addr, callback),
                None => {
                    self.reject_reverse_key(name);
                    callback.resolved(self, &Payload::Host(String::new()));
                    Ok(())
                }
            },
            RequestType::Txt => self.lookup_text_async(name, callback),
        }
    }

    fn lookup_text_async(&mut self, key: &str, mut callback: Box<dyn LookupCallback>) -> Result<()> {
        if self.config.mode == Mode::Fake {
            let payload = Payload::Text(fake_text(key));
            callback.resolved(self, &payload);
            return Ok(());
        }
        let now = unix_now();
        if let Some(text) = self.cache.lookup_text(key, now, false, true) {
            callback.resolved(self, &Payload::Text(text));
            return Ok(());
        }
        match self.config.mode {
            Mode::Force => Err(Error::ForceCacheMiss {
                key: key.to_string(),
            }),
            Mode::Prime => {
                self.prime_negative(&QueryKind::Text(key.to_string()));
                callback.resolved(self, &Payload::Text(String::new()));
                Ok(())
            }
            Mode::Default | Mode::Fake => {
                self.start_or_join(QueryKind::Text(key.to_string()), callback);
                Ok(())
            }
        }
    }

    // ---- event-loop integration ------------------------------------------

    /// Pumps one iteration of the stub channel with a bounded timeout,
    /// handling any ready sockets and all expired deadlines.
    pub fn resolve(&mut self) -> Result<()> {
        self.pump(Duration::from_secs(self.config.sync_timeout))
    }

    /// Host-loop entry point, to be invoked whenever a registered
    /// descriptor is ready or the reported timeout elapses.
    pub fn process(&mut self) {
        let events = self.driver.pump();
        self.handle_channel_events(events);
        self.expire_deadlines();
        self.issue_queued();
    }

    /// Time until the manager next needs [`DnsMgr::process`]: the minimum
    /// of the channel's own timeout and the earliest request deadline.
    /// `None` means no urgent work.
    pub fn get_next_timeout(&mut self) -> Option<Duration> {
        let mut next = self.driver.next_timeout();
        if let Some(deadline) = self.registry.next_deadline() {
            let until = deadline.saturating_duration_since(Instant::now());
            next = Some(match next {
                Some(t) => t.min(until),
                None => until,
            });
        }
        next
    }

    // ---- snapshot management ---------------------------------------------

    /// Saves the cache snapshot. Failure is logged; cached state is
    /// unaffected either way.
    pub fn save(&self) -> bool {
        let path = self.cache_file();
        match self.cache.save(&path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to save cache snapshot");
                false
            }
        }
    }

    /// Processes one more round of completions, then drops every cached
    /// mapping.
    pub fn flush(&mut self) {
        self.process();
        self.cache.flush();
        debug!("mapping caches flushed");
    }

    /// Point-in-time counters and cache sizes.
    pub fn stats(&self) -> Stats {
        Stats {
            requests: self.registry.requests_issued,
            successful: self.registry.successful,
            failed: self.registry.failed,
            pending: self.registry.pending() as u64,
            cached_hosts: self.cache.host_count() as u64,
            cached_addresses: self.cache.addr_count() as u64,
            cached_texts: self.cache.text_count() as u64,
        }
    }

    // ---- request plumbing ------------------------------------------------

    /// Blocks on a cache miss according to the mode: an error in FORCE,
    /// a negative mapping without querying in PRIME, a nested pump until
    /// completion or budget exhaustion otherwise.
    fn blocking_miss(&mut self, kind: QueryKind) -> Result<()> {
        match self.config.mode {
            Mode::Force => return Err(Error::ForceCacheMiss { key: kind.key() }),
            Mode::Prime => {
                self.prime_negative(&kind);
                return Ok(());
            }
            Mode::Default | Mode::Fake => {}
        }

        let done = Rc::new(Cell::new(false));
        self.start_or_join(
            kind,
            Box::new(WaitFlag {
                done: Rc::clone(&done),
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(self.config.sync_timeout);
        while !done.get() {
            let now = Instant::now();
            if now >= deadline {
                debug!("blocking lookup budget exhausted");
                break;
            }
            self.pump(deadline - now)?;
        }
        Ok(())
    }

    /// Coalesces onto a pending request for the key, or starts a new one.
    fn start_or_join(&mut self, kind: QueryKind, callback: Box<dyn LookupCallback>) {
        if let Some(token) = self.registry.find(&kind) {
            trace!(kind = %kind, token, "coalescing onto pending request");
            self.registry.attach(token, callback);
            return;
        }
        self.start_request(kind, vec![callback]);
    }

    fn start_request(&mut self, kind: QueryKind, callbacks: Vec<Box<dyn LookupCallback>>) {
        let token = self.registry.create(
            kind.clone(),
            Instant::now(),
            Duration::from_secs(self.config.async_timeout),
            callbacks,
        );
        if self.registry.in_flight() < self.config.max_async_in_flight {
            self.submit(token, kind);
        } else {
            trace!(kind = %kind, token, "admission ceiling reached, queueing");
            self.registry.enqueue(token);
        }
    }

    fn submit(&mut self, token: Token, kind: QueryKind) {
        self.registry.mark_in_flight(token);
        match self.driver.submit(&kind, token) {
            Ok(events) => self.handle_channel_events(events),
            Err(e) => {
                warn!(kind = %kind, error = %e, "query submission failed");
                self.finish(token, Some(Outcome::Failed(Failure::Network)));
            }
        }
    }

    /// Drains the admission queue up to the in-flight ceiling, oldest
    /// first.
    fn issue_queued(&mut self) {
        while self.registry.in_flight() < self.config.max_async_in_flight {
            let Some(token) = self.registry.pop_queued() else {
                break;
            };
            let Some(kind) = self.registry.kind_of(token) else {
                continue;
            };
            self.submit(token, kind);
        }
    }

    /// One bounded pump of the internal loop: expire deadlines, drain the
    /// admission queue, wait for socket readiness, process it.
    fn pump(&mut self, budget: Duration) -> Result<()> {
        self.expire_deadlines();
        self.issue_queued();

        let channel_timeout = self.driver.next_timeout();
        let next_deadline = self.registry.next_deadline();

        let mut wait = budget;
        if let Some(t) = channel_timeout {
            wait = wait.min(t);
        }
        if let Some(deadline) = next_deadline {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }
        if channel_timeout.is_none() && next_deadline.is_none() {
            // idle: no request deadline and a quiet channel, so nothing
            // can complete no matter how long we wait
            wait = Duration::ZERO;
        }

        let ready = self.driver.wait(wait)?;
        let events = self.driver.process_ready(&ready);
        self.handle_channel_events(events);
        self.expire_deadlines();
        Ok(())
    }

    fn handle_channel_events(&mut self, events: ChannelEvents) {
        for (fd, active) in events.sockets {
            debug!(fd, active, "mirroring socket registration to host loop");
            if let Some(r) = self.registrar.as_mut() {
                r.register_socket(fd, active);
            }
        }
        for (token, outcome) in events.completions {
            self.finish(token, Some(outcome));
        }
    }

    fn expire_deadlines(&mut self) {
        for token in self.registry.expired(Instant::now()) {
            self.finish(token, None);
        }
    }

    /// Terminal handling for one request: ingest the outcome (`None`
    /// means the deadline passed), emit change events, then fire the
    /// callbacks in registration order. Late completions for already
    /// retired tokens are discarded.
    fn finish(&mut self, token: Token, outcome: Option<Outcome>) {
        let Some(mut req) = self.registry.retire(token) else {
            trace!(token, "discarding completion for retired request");
            return;
        };

        let now = unix_now();
        let result = match outcome {
            Some(outcome) => {
                req.state = RequestState::Completed;
                match &outcome {
                    Outcome::Answered(_) => self.registry.successful += 1,
                    Outcome::Failed(_) => self.registry.failed += 1,
                }
                self.ingest(&req.kind, &outcome, now);
                Some(self.cached_result(&req.kind, now))
            }
            None => {
                req.state = RequestState::TimedOut;
                self.registry.failed += 1;
                let events = self.driver.cancel(token);
                self.handle_channel_events(events);
                None
            }
        };

        debug!(
            token,
            kind = %req.kind,
            state = ?req.state,
            elapsed_ms = req.created.elapsed().as_millis() as u64,
            "request retired"
        );

        // change events first, so observers see consistent cache state
        self.dispatch_events();

        for mut callback in req.callbacks.drain(..) {
            match &result {
                Some(payload) => callback.resolved(self, payload),
                None => callback.timeout(self),
            }
        }

        self.issue_queued();
    }

    /// Installs a completed outcome into the appropriate cache. An
    /// answer with an empty payload is recorded as a negative entry.
    fn ingest(&mut self, kind: &QueryKind, outcome: &Outcome, now: u64) {
        let answer = match outcome {
            Outcome::Answered(answer) if !answer.payload.is_empty() => Some(answer),
            Outcome::Answered(_) => None,
            Outcome::Failed(failure) => {
                debug!(kind = %kind, failure = %failure, "caching negative answer");
                None
            }
        };
        let ttl = answer
            .and_then(|a| a.ttl)
            .unwrap_or(self.config.default_ttl);

        match kind {
            QueryKind::Host(name) => {
                let addrs = answer.map(|a| match &a.payload {
                    Payload::Addrs(addrs) => addrs.clone(),
                    _ => Vec::new(),
                });
                let addrs = addrs.filter(|a| !a.is_empty());
                self.cache
                    .ingest_host(name, RequestType::A, addrs, ttl, false, now);
            }
            QueryKind::Addr(addr) => {
                let host = answer.and_then(|a| match &a.payload {
                    Payload::Host(name) if !name.is_empty() => Some(name.clone()),
                    _ => None,
                });
                self.cache.ingest_addr(*addr, host, ttl, now);
            }
            QueryKind::Text(key) => {
                let text = answer.and_then(|a| match &a.payload {
                    Payload::Text(text) if !text.is_empty() => Some(text.clone()),
                    _ => None,
                });
                self.cache.ingest_text(key, text, ttl, now);
            }
        }
    }

    /// The callback payload for a finished request: the merged cached
    /// state for its key.
    fn cached_result(&mut self, kind: &QueryKind, now: u64) -> Payload {
        match kind {
            QueryKind::Host(name) => Payload::Addrs(
                self.cache
                    .lookup_name(name, now, false, true)
                    .unwrap_or_default(),
            ),
            QueryKind::Addr(addr) => match self.cache.lookup_addr(addr, now, false, true) {
                Some(name) => Payload::Host(unfail_host(name, addr)),
                None => Payload::Host(addr.to_string()),
            },
            QueryKind::Text(key) => Payload::Text(
                self.cache
                    .lookup_text(key, now, false, true)
                    .unwrap_or_default(),
            ),
        }
    }

    /// PRIME never queries: the key is recorded as a failed mapping so a
    /// later FORCE run hits it.
    fn prime_negative(&mut self, kind: &QueryKind) {
        let now = unix_now();
        match kind {
            QueryKind::Host(name) => {
                self.cache
                    .ingest_host(name, RequestType::A, None, 0, false, now);
            }
            QueryKind::Addr(addr) => self.cache.ingest_addr(*addr, None, 0, now),
            QueryKind::Text(key) => self.cache.ingest_text(key, None, 0, now),
        }
        self.dispatch_events();
    }

    /// Records a negative text entry for an unusable reverse-lookup key.
    fn reject_reverse_key(&mut self, name: &str) {
        warn!(key = name, "reverse-lookup key is neither an address nor arpa form");
        if self.config.mode != Mode::Fake {
            self.cache.ingest_text(name, None, 0, unix_now());
        }
    }

    fn dispatch_events(&mut self) {
        let events = self.cache.take_events();
        if self.config.mode == Mode::Prime || events.is_empty() {
            return;
        }
        for event in &events {
            debug!(event = event.kind.name(), key = %event.mapping.key(), "mapping change");
            if let Some(sink) = self.events.as_mut() {
                sink.emit(event);
            }
        }
    }
}

impl Drop for DnsMgr {
    fn drop(&mut self) {
        let fds = self.driver.watched();
        if let Some(r) = self.registrar.as_mut() {
            for fd in fds {
                r.register_socket(fd, false);
            }
        }
    }
}

/// Completion flag for nested blocking pumps.
struct WaitFlag {
    done: Rc<Cell<bool>>,
}

impl LookupCallback for WaitFlag {
    fn resolved(&mut self, _mgr: &mut DnsMgr, _result: &Payload) {
        self.done.set(true);
    }

    fn timeout(&mut self, _mgr: &mut DnsMgr) {
        self.done.set(true);
    }
}

/// Translates the cache's synthetic failed-reverse marker into the
/// literal address representation callers expect.
fn unfail_host(name: String, addr: &IpAddr) -> String {
    if name == NAME_ERROR {
        addr.to_string()
    } else {
        name
    }
}

/// Deterministic loopback answer for FAKE mode, derived from the name.
fn fake_addrs(name: &str) -> Vec<IpAddr> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let h = hasher.finish();
    vec![IpAddr::V4(Ipv4Addr::new(
        127,
        (h >> 16) as u8,
        (h >> 8) as u8,
        h as u8 | 1,
    ))]
}

fn fake_host(addr: &IpAddr) -> String {
    format!("fake-host-{addr}")
}

fn fake_text(key: &str) -> String {
    format!("fake-text-{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_answers_are_deterministic() {
        assert_eq!(fake_addrs("a.test"), fake_addrs("a.test"));
        assert_ne!(fake_addrs("a.test"), fake_addrs("b.test"));
        match fake_addrs("a.test")[0] {
            IpAddr::V4(v4) => assert_eq!(v4.octets()[0], 127),
            IpAddr::V6(_) => unreachable!(),
        }
    }

    #[test]
    fn synthetic_marker_translates_to_literal() {
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(unfail_host(NAME_ERROR.to_string(), &addr), "192.0.2.1");
        assert_eq!(unfail_host("host.example".into(), &addr), "host.example");
    }
}
