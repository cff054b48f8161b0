//! The stub-resolver channel trait.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::query::{Answer, Failure, Query, Token};
use crate::Result;

/// Completion status for one submitted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The query resolved with data.
    Answered(Answer),

    /// The stub library reported a definitive failure.
    Failed(Failure),
}

/// Receives notifications pushed by the channel while it is being driven.
///
/// The driver supplies a sink to every channel call; implementations must
/// not assume any particular call site, since a completion may surface
/// during `submit`, `process`, or `process_timeouts`.
pub trait ChannelSink {
    /// One submitted query finished, successfully or not.
    fn on_complete(&mut self, token: Token, outcome: Outcome);

    /// The channel's interest in a descriptor changed. Both flags false
    /// means the descriptor is being closed and must be unwatched.
    fn on_socket_state(&mut self, fd: RawFd, readable: bool, writable: bool);
}

/// A nonblocking stub-resolver transport (multiplexed UDP/TCP sockets,
/// internal retries and timeouts).
///
/// Address queries ([`crate::RequestType::A`]) resolve both address
/// families, getaddrinfo-style; the answer's payload may mix IPv4 and IPv6
/// addresses.
pub trait Channel {
    /// Submits a query. The token is echoed back on completion.
    fn submit(&mut self, query: &Query, token: Token, sink: &mut dyn ChannelSink) -> Result<()>;

    /// Cancels an in-flight query. No completion may be delivered for the
    /// token afterward.
    fn cancel(&mut self, token: Token, sink: &mut dyn ChannelSink);

    /// Handles readiness on one watched descriptor.
    fn process(&mut self, fd: RawFd, readable: bool, writable: bool, sink: &mut dyn ChannelSink);

    /// Drives the channel's internal retransmit and timeout machinery.
    /// Called on every pump, whether or not a descriptor was ready.
    fn process_timeouts(&mut self, sink: &mut dyn ChannelSink);

    /// How long until the channel next needs `process_timeouts`, or `None`
    /// when it has no pending work.
    fn next_timeout(&self) -> Option<Duration>;
}
