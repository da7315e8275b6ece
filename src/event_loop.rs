//! Single-threaded cooperative event multiplexer.
//!
//! The loop is the crate's only concurrency substrate for stream supervision:
//! it interleaves strictly by dispatch and never preempts a handler, so a
//! handler that blocks stalls everything — handlers must only take what is
//! already buffered and return.
//!
//! Targets are anything implementing [`Pollable`]: a non-blocking readiness
//! probe plus a payload queue. Two adapters cover the system's needs:
//! [`ChannelTarget`] for message-channel endpoints and [`StreamTarget`] for
//! raw byte streams (participant stdout/stderr). Byte streams are probed with
//! single-poll reads so one slow descriptor never stalls the loop.
//!
//! Registration is keyed by [`Token`]: registering with an empty interest
//! mask unregisters, and re-registering a live token replaces its handler —
//! at most one handler per target, no duplicate dispatch. Handlers return an
//! [`Action`] so a handler can retire its own target without re-entrant
//! access to the loop.

use futures::FutureExt;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::trace;

/// Identifies one registered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

/// Interest/readiness bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    /// No interest; registering with this mask unregisters the target.
    pub const NONE: Interest = Interest(0);
    /// Interest in readable payloads (data, messages, end-of-stream).
    pub const READABLE: Interest = Interest(0b01);

    /// True if no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits present in both masks.
    pub fn intersect(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

/// What a handler does with its registration after one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep the target registered.
    Continue,
    /// Remove the target from the loop.
    Deregister,
}

/// One unit of ready input taken from a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A message-channel line.
    Line(String),
    /// A chunk of raw bytes from a byte stream.
    Data(Vec<u8>),
    /// End of stream; delivered exactly once per target.
    Eof,
}

/// A multiplexable target: probe readiness without blocking, then surrender
/// buffered payloads one at a time.
pub trait Pollable {
    /// Advances internal buffering without blocking and reports which of the
    /// requested bits are ready.
    fn poll_ready(&mut self, interest: Interest) -> Interest;

    /// Takes the next buffered payload, if any.
    fn take_payload(&mut self) -> Option<Payload>;
}

/// Handler invoked once per ready target per poll.
pub type Handler = Box<dyn FnMut(Token, &mut dyn Pollable, Interest) -> Action>;

struct Registration {
    target: Box<dyn Pollable>,
    interest: Interest,
    handler: Handler,
}

/// The cooperative multiplexer.
#[derive(Default)]
pub struct EventLoop {
    targets: BTreeMap<Token, Registration>,
    next_token: usize,
}

/// Granularity of the readiness re-probe while waiting out a poll timeout.
const POLL_TICK: Duration = Duration::from_millis(5);

impl EventLoop {
    /// Creates an empty loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh token.
    pub fn token(&mut self) -> Token {
        self.next_token += 1;
        Token(self.next_token)
    }

    /// Registers (or replaces) a target under `token`. An empty interest mask
    /// is equivalent to unregistering.
    pub fn register(
        &mut self,
        token: Token,
        target: Box<dyn Pollable>,
        interest: Interest,
        handler: Handler,
    ) {
        if interest.is_empty() {
            self.unregister(token);
            return;
        }
        self.targets.insert(
            token,
            Registration {
                target,
                interest,
                handler,
            },
        );
    }

    /// Removes a target; unknown tokens are ignored.
    pub fn unregister(&mut self, token: Token) {
        self.targets.remove(&token);
    }

    /// True if `token` is currently registered.
    pub fn is_registered(&self, token: Token) -> bool {
        self.targets.contains_key(&token)
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn dispatch_pass(&mut self) -> usize {
        let mut dispatched = 0;
        let mut retired = Vec::new();
        for (token, registration) in self.targets.iter_mut() {
            let Registration {
                target,
                interest,
                handler,
            } = registration;
            let ready = target.poll_ready(*interest).intersect(*interest);
            if ready.is_empty() {
                continue;
            }
            trace!(token = token.0, "dispatching ready target");
            dispatched += 1;
            if (handler)(*token, target.as_mut(), ready) == Action::Deregister {
                retired.push(*token);
            }
        }
        for token in retired {
            self.targets.remove(&token);
        }
        dispatched
    }

    /// Blocks up to `timeout` waiting for any registered target to become
    /// ready for its registered interest; invokes each ready target's handler
    /// exactly once with only the requested-and-ready bits. Returns the number
    /// of handlers dispatched (0 on timeout).
    pub async fn poll(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let dispatched = self.dispatch_pass();
            if dispatched > 0 {
                return dispatched;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            tokio::time::sleep(POLL_TICK.min(deadline - now)).await;
        }
    }

    /// Polls with a fixed interval, invoking `idle` between polls —
    /// unconditionally, not only when nothing was dispatched. Returns when
    /// `idle` returns false.
    pub async fn poll_forever<F>(&mut self, interval: Duration, mut idle: F)
    where
        F: FnMut(&mut EventLoop) -> bool,
    {
        loop {
            self.poll(interval).await;
            if !idle(self) {
                return;
            }
        }
    }
}

// =============================================================================
// Target adapters
// =============================================================================

/// Message-channel endpoint target. Each queued message is one payload line;
/// a closed channel surfaces a single `Eof`.
pub struct ChannelTarget {
    rx: mpsc::UnboundedReceiver<String>,
    pending: std::collections::VecDeque<Payload>,
    eof_queued: bool,
}

impl ChannelTarget {
    /// Wraps a receiving endpoint.
    pub fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            rx,
            pending: Default::default(),
            eof_queued: false,
        }
    }
}

impl Pollable for ChannelTarget {
    fn poll_ready(&mut self, _interest: Interest) -> Interest {
        loop {
            match self.rx.try_recv() {
                Ok(line) => self.pending.push_back(Payload::Line(line)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.eof_queued {
                        self.eof_queued = true;
                        self.pending.push_back(Payload::Eof);
                    }
                    break;
                }
            }
        }
        if self.pending.is_empty() {
            Interest::NONE
        } else {
            Interest::READABLE
        }
    }

    fn take_payload(&mut self) -> Option<Payload> {
        self.pending.pop_front()
    }
}

/// Raw byte-stream target (e.g. a supervised process's stdout or stderr).
///
/// Readiness probing performs at most one poll of the underlying read per
/// pass, buffering whatever arrived; the loop never parks on one descriptor.
pub struct StreamTarget {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    pending: std::collections::VecDeque<Payload>,
    eof_queued: bool,
}

impl StreamTarget {
    /// Wraps an async byte stream.
    pub fn new(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            reader,
            pending: Default::default(),
            eof_queued: false,
        }
    }
}

impl Pollable for StreamTarget {
    fn poll_ready(&mut self, _interest: Interest) -> Interest {
        if !self.eof_queued {
            let mut buf = [0u8; 4096];
            // Single poll of the read future; pending reads lose nothing when
            // the future is dropped.
            match self.reader.read(&mut buf).now_or_never() {
                Some(Ok(0)) => {
                    self.eof_queued = true;
                    self.pending.push_back(Payload::Eof);
                }
                Some(Ok(n)) => self.pending.push_back(Payload::Data(buf[..n].to_vec())),
                Some(Err(_)) => {
                    // A broken stream reads as end-of-stream; the supervisor
                    // decides what that means.
                    self.eof_queued = true;
                    self.pending.push_back(Payload::Eof);
                }
                None => {}
            }
        }
        if self.pending.is_empty() {
            Interest::NONE
        } else {
            Interest::READABLE
        }
    }

    fn take_payload(&mut self) -> Option<Payload> {
        self.pending.pop_front()
    }
}
