//! The asynchronous request registry: dedup maps, admission queue, and
//! the deadline heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use sable_resolver::{QueryKind, Token};

use crate::manager::LookupCallback;

/// Lifecycle of one request. A request leaves the registry (is retired)
/// when it reaches a terminal state; callbacks run after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    Created,
    Queued,
    InFlight,
    Completed,
    TimedOut,
}

/// One outstanding stub-resolver operation, fanning out to any number of
/// callbacks.
pub(crate) struct Request {
    pub kind: QueryKind,
    pub created: Instant,
    pub deadline: Instant,
    pub state: RequestState,
    pub callbacks: Vec<Box<dyn LookupCallback>>,
}

/// Registry of live requests. For any (kind, key) at most one request is
/// live; later lookups for the same key coalesce onto it.
pub(crate) struct Registry {
    requests: HashMap<Token, Request>,
    by_addr: HashMap<IpAddr, Token>,
    by_name: HashMap<String, Token>,
    by_text: HashMap<String, Token>,
    queued: VecDeque<Token>,
    deadlines: BinaryHeap<Reverse<(Instant, Token)>>,
    next_token: Token,
    in_flight: usize,

    pub requests_issued: u64,
    pub successful: u64,
    pub failed: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
            by_addr: HashMap::new(),
            by_name: HashMap::new(),
            by_text: HashMap::new(),
            queued: VecDeque::new(),
            deadlines: BinaryHeap::new(),
            next_token: 1,
            in_flight: 0,
            requests_issued: 0,
            successful: 0,
            failed: 0,
        }
    }

    /// The live request for a key, if any.
    pub fn find(&self, kind: &QueryKind) -> Option<Token> {
        match kind {
            QueryKind::Addr(addr) => self.by_addr.get(addr).copied(),
            QueryKind::Host(name) => self.by_name.get(name).copied(),
            QueryKind::Text(key) => self.by_text.get(key).copied(),
        }
    }

    /// Creates a request and registers it in the dedup map and the
    /// deadline heap.
    pub fn create(
        &mut self,
        kind: QueryKind,
        now: Instant,
        timeout: Duration,
        callbacks: Vec<Box<dyn LookupCallback>>,
    ) -> Token {
        let token = self.next_token;
        self.next_token += 1;

        match &kind {
            QueryKind::Addr(addr) => {
                self.by_addr.insert(*addr, token);
            }
            QueryKind::Host(name) => {
                self.by_name.insert(name.clone(), token);
            }
            QueryKind::Text(key) => {
                self.by_text.insert(key.clone(), token);
            }
        }

        let deadline = now + timeout;
        self.deadlines.push(Reverse((deadline, token)));
        self.requests.insert(
            token,
            Request {
                kind,
                created: now,
                deadline,
                state: RequestState::Created,
                callbacks,
            },
        );
        self.requests_issued += 1;
        token
    }

    /// Attaches another callback to a live request.
    pub fn attach(&mut self, token: Token, callback: Box<dyn LookupCallback>) {
        if let Some(req) = self.requests.get_mut(&token) {
            req.callbacks.push(callback);
        }
    }

    pub fn kind_of(&self, token: Token) -> Option<QueryKind> {
        self.requests.get(&token).map(|r| r.kind.clone())
    }

    /// Appends a request to the admission queue.
    pub fn enqueue(&mut self, token: Token) {
        if let Some(req) = self.requests.get_mut(&token) {
            req.state = RequestState::Queued;
            self.queued.push_back(token);
        }
    }

    /// Pops the oldest queued request that is still live.
    pub fn pop_queued(&mut self) -> Option<Token> {
        while let Some(token) = self.queued.pop_front() {
            if self.requests.contains_key(&token) {
                return Some(token);
            }
        }
        None
    }

    pub fn mark_in_flight(&mut self, token: Token) {
        if let Some(req) = self.requests.get_mut(&token) {
            req.state = RequestState::InFlight;
            self.in_flight += 1;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Removes a request from the registry and its dedup map. Callbacks
    /// must be invoked only after this returns, so that re-entrant
    /// lookups for the same key see no live request.
    pub fn retire(&mut self, token: Token) -> Option<Request> {
        let req = self.requests.remove(&token)?;
        if req.state == RequestState::InFlight {
            self.in_flight -= 1;
        }
        match &req.kind {
            QueryKind::Addr(addr) => {
                if self.by_addr.get(addr) == Some(&token) {
                    self.by_addr.remove(addr);
                }
            }
            QueryKind::Host(name) => {
                if self.by_name.get(name) == Some(&token) {
                    self.by_name.remove(name);
                }
            }
            QueryKind::Text(key) => {
                if self.by_text.get(key) == Some(&token) {
                    self.by_text.remove(key);
                }
            }
        }
        Some(req)
    }

    /// Drains every request whose deadline has passed. Heap entries for
    /// already-retired requests are discarded along the way.
    pub fn expired(&mut self, now: Instant) -> Vec<Token> {
        let mut out = Vec::new();
        while let Some(Reverse((deadline, token))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if self.requests.contains_key(&token) {
                out.push(token);
            }
        }
        out
    }

    /// Earliest live deadline, pruning stale heap entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, token))) = self.deadlines.peek().copied() {
            if self.requests.contains_key(&token) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Live requests, queued or in flight.
    pub fn pending(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> QueryKind {
        QueryKind::Host(name.to_string())
    }

    #[test]
    fn dedup_by_key() {
        let mut reg = Registry::new();
        let now = Instant::now();
        let t = reg.create(host("a.test"), now, Duration::from_secs(5), Vec::new());

        assert_eq!(reg.find(&host("a.test")), Some(t));
        assert_eq!(reg.find(&host("b.test")), None);
        assert_eq!(reg.pending(), 1);
        assert_eq!(reg.requests_issued, 1);
    }

    #[test]
    fn retire_clears_dedup_and_counts() {
        let mut reg = Registry::new();
        let now = Instant::now();
        let t = reg.create(host("a.test"), now, Duration::from_secs(5), Vec::new());
        reg.mark_in_flight(t);
        assert_eq!(reg.in_flight(), 1);

        let req = reg.retire(t).unwrap();
        assert_eq!(req.kind, host("a.test"));
        assert_eq!(reg.in_flight(), 0);
        assert_eq!(reg.find(&host("a.test")), None);
        assert!(reg.retire(t).is_none());
    }

    #[test]
    fn admission_queue_is_fifo() {
        let mut reg = Registry::new();
        let now = Instant::now();
        let t1 = reg.create(host("a.test"), now, Duration::from_secs(5), Vec::new());
        let t2 = reg.create(host("b.test"), now, Duration::from_secs(5), Vec::new());
        let t3 = reg.create(host("c.test"), now, Duration::from_secs(5), Vec::new());
        reg.enqueue(t1);
        reg.enqueue(t2);
        reg.enqueue(t3);

        reg.retire(t2);
        assert_eq!(reg.pop_queued(), Some(t1));
        assert_eq!(reg.pop_queued(), Some(t3));
        assert_eq!(reg.pop_queued(), None);
    }

    #[test]
    fn deadline_heap_orders_by_time() {
        let mut reg = Registry::new();
        let now = Instant::now();
        let slow = reg.create(host("slow.test"), now, Duration::from_secs(10), Vec::new());
        let fast = reg.create(host("fast.test"), now, Duration::from_secs(1), Vec::new());

        assert_eq!(reg.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(reg.expired(now + Duration::from_secs(1)), vec![fast]);
        assert_eq!(reg.expired(now + Duration::from_secs(20)), vec![slow]);
        assert_eq!(reg.next_deadline(), None);
    }

    #[test]
    fn expired_skips_retired_requests() {
        let mut reg = Registry::new();
        let now = Instant::now();
        let t = reg.create(host("a.test"), now, Duration::ZERO, Vec::new());
        reg.retire(t);
        assert!(reg.expired(now + Duration::from_secs(1)).is_empty());
    }
}
