//! The resolver driver: owns the stub channel, tracks which descriptors
//! it wants watched, and pumps readiness into it.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, trace};

use sable_resolver::{arpa, Channel, ChannelSink, Outcome, Query, QueryKind, RequestType, Token};

/// Notifications gathered from one round of channel calls.
#[derive(Default)]
pub(crate) struct ChannelEvents {
    pub completions: Vec<(Token, Outcome)>,

    /// (fd, active) transitions to mirror into the host loop.
    pub sockets: Vec<(RawFd, bool)>,
}

#[derive(Default)]
struct Collector {
    completions: Vec<(Token, Outcome)>,
    sockets: Vec<(RawFd, bool, bool)>,
}

impl ChannelSink for Collector {
    fn on_complete(&mut self, token: Token, outcome: Outcome) {
        self.completions.push((token, outcome));
    }

    fn on_socket_state(&mut self, fd: RawFd, readable: bool, writable: bool) {
        self.sockets.push((fd, readable, writable));
    }
}

#[derive(Debug, Clone, Copy)]
struct Interest {
    readable: bool,
    writable: bool,
}

/// Wraps the stub channel with socket bookkeeping and a poll(2) pump.
pub(crate) struct Driver {
    channel: Box<dyn Channel>,
    interests: BTreeMap<RawFd, Interest>,
}

impl Driver {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            channel,
            interests: BTreeMap::new(),
        }
    }

    /// The wire query for a request kind. Reverse lookups are converted
    /// to arpa form here.
    pub fn query_for(kind: &QueryKind) -> Query {
        match kind {
            QueryKind::Host(name) => Query::new(name.clone(), RequestType::A),
            QueryKind::Addr(addr) => Query::new(arpa::ptr_name(addr), RequestType::Ptr),
            QueryKind::Text(key) => Query::new(key.clone(), RequestType::Txt),
        }
    }

    pub fn submit(
        &mut self,
        kind: &QueryKind,
        token: Token,
    ) -> sable_resolver::Result<ChannelEvents> {
        let query = Self::query_for(kind);
        debug!(token, name = %query.name, rtype = %query.rtype, "submitting query");
        let mut sink = Collector::default();
        self.channel.submit(&query, token, &mut sink)?;
        Ok(self.absorb(sink))
    }

    pub fn cancel(&mut self, token: Token) -> ChannelEvents {
        trace!(token, "cancelling query");
        let mut sink = Collector::default();
        self.channel.cancel(token, &mut sink);
        self.absorb(sink)
    }

    /// Processes every watched descriptor plus the channel's internal
    /// timeouts. Used from the host-loop entry point, which is not told
    /// which descriptor became ready.
    pub fn pump(&mut self) -> ChannelEvents {
        let fds: Vec<(RawFd, Interest)> = self.interests.iter().map(|(fd, i)| (*fd, *i)).collect();
        let mut sink = Collector::default();
        for (fd, interest) in fds {
            self.channel
                .process(fd, interest.readable, interest.writable, &mut sink);
        }
        self.channel.process_timeouts(&mut sink);
        self.absorb(sink)
    }

    /// Processes the descriptors a poll reported ready, plus the
    /// channel's internal timeouts.
    pub fn process_ready(&mut self, ready: &[(RawFd, bool, bool)]) -> ChannelEvents {
        let mut sink = Collector::default();
        for &(fd, readable, writable) in ready {
            self.channel.process(fd, readable, writable, &mut sink);
        }
        self.channel.process_timeouts(&mut sink);
        self.absorb(sink)
    }

    /// Blocks until a watched descriptor is ready or the timeout elapses.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<(RawFd, bool, bool)>> {
        let entries: Vec<(RawFd, Interest)> =
            self.interests.iter().map(|(fd, i)| (*fd, *i)).collect();
        let mut poll_fds: Vec<PollFd> = entries
            .iter()
            .map(|(fd, interest)| {
                let mut flags = PollFlags::empty();
                if interest.readable {
                    flags |= PollFlags::POLLIN;
                }
                if interest.writable {
                    flags |= PollFlags::POLLOUT;
                }
                PollFd::new(*fd, flags)
            })
            .collect();

        let millis = timeout.as_millis().try_into().unwrap_or(i32::MAX);
        let n = match poll(&mut poll_fds, millis) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut ready = Vec::new();
        for (idx, poll_fd) in poll_fds.iter().enumerate() {
            let revents = poll_fd.revents().unwrap_or_else(PollFlags::empty);
            let readable = revents.intersects(
                PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL,
            );
            let writable = revents.contains(PollFlags::POLLOUT);
            if readable || writable {
                ready.push((entries[idx].0, readable, writable));
            }
        }
        Ok(ready)
    }

    pub fn next_timeout(&self) -> Option<Duration> {
        self.channel.next_timeout()
    }

    /// Descriptors currently watched on the channel's behalf.
    pub fn watched(&self) -> Vec<RawFd> {
        self.interests.keys().copied().collect()
    }

    /// Applies socket-state notifications to the interest table and turns
    /// them into watch/unwatch transitions for the host loop.
    fn absorb(&mut self, sink: Collector) -> ChannelEvents {
        let mut events = ChannelEvents {
            completions: sink.completions,
            sockets: Vec::new(),
        };
        for (fd, readable, writable) in sink.sockets {
            if readable || writable {
                let newly_watched = self
                    .interests
                    .insert(fd, Interest { readable, writable })
                    .is_none();
                if newly_watched {
                    events.sockets.push((fd, true));
                }
            } else if self.interests.remove(&fd).is_some() {
                events.sockets.push((fd, false));
            }
        }
        events
    }
}
