//! Generic state-machine dispatcher, the in-process transition authority.
//!
//! The dispatcher owns the canonical state plus the run metadata and serves
//! the request channel. It is generic over the transition table, not tied to
//! the run lifecycle, so alternative machines plug in unchanged.
//!
//! While waiting for requests it heartbeats the full snapshot (`STATE`,
//! `RUN`, `TITLE`, `RECORD`) over the publication channel once per interval,
//! so late subscribers converge without a query side channel.

use crate::error::RcResult;
use crate::protocol::{Publication, Reply, Request};
use crate::transition::TransitionTable;
use crate::transport::{Publisher, RequestServer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The dispatcher's whole context; no piece of its state lives outside this
/// struct.
pub struct Dispatcher {
    state: String,
    table: Arc<TransitionTable>,
    title: String,
    run: u32,
    recording: bool,
    heartbeat: Duration,
    server: RequestServer,
    publisher: Publisher,
}

impl Dispatcher {
    /// Builds a dispatcher starting in `initial`, which must belong to
    /// `table`'s state domain.
    pub fn new(
        table: Arc<TransitionTable>,
        initial: &str,
        heartbeat: Duration,
        server: RequestServer,
        publisher: Publisher,
    ) -> RcResult<Self> {
        if !table.contains(initial) {
            return Err(crate::error::RcError::UnknownState(initial.to_string()));
        }
        Ok(Self {
            state: initial.to_string(),
            table,
            title: String::new(),
            run: 0,
            recording: false,
            heartbeat,
            server,
            publisher,
        })
    }

    /// Current canonical state.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Current run number.
    pub fn run_number(&self) -> u32 {
        self.run
    }

    /// Current run title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Current recording flag.
    pub fn recording(&self) -> bool {
        self.recording
    }

    fn heartbeat(&self) {
        self.publisher.publish(Publication::State(self.state.clone()));
        self.publisher.publish(Publication::Run(self.run));
        self.publisher.publish(Publication::Title(self.title.clone()));
        self.publisher.publish(Publication::Record(self.recording));
    }

    /// Serves requests until a legal transition is accepted, returning the
    /// state entered. Metadata requests and illegal transitions are handled
    /// in place and the wait continues; the heartbeat fires once per
    /// interval throughout.
    pub async fn serve_state(&mut self) -> Option<String> {
        loop {
            self.heartbeat();
            let Some((request, responder)) = self.server.recv_timeout(self.heartbeat).await else {
                if self.server.is_closed() {
                    return None;
                }
                continue;
            };
            match request {
                Request::Transition(next) => {
                    if self.table.is_legal(&self.state, &next) {
                        info!(from = %self.state, to = %next, "transition accepted");
                        responder.send(Reply::Ok);
                        self.publisher.publish(Publication::Transition(next.clone()));
                        self.state = next.clone();
                        return Some(next);
                    }
                    warn!(from = %self.state, to = %next, "transition refused");
                    responder.send(Reply::Fail(format!(
                        "Valid transitions requests are {}",
                        self.table.allowed_from_joined(&self.state)
                    )));
                }
                Request::Run(n) => {
                    debug!(run = n, "run number set");
                    self.run = n;
                    responder.send(Reply::Ok);
                    self.publisher.publish(Publication::Run(n));
                }
                Request::Title(text) => {
                    debug!(title = %text, "title set");
                    self.title = text.clone();
                    responder.send(Reply::Ok);
                    self.publisher.publish(Publication::Title(text));
                }
                Request::Record(flag) => {
                    debug!(recording = flag, "recording flag set");
                    self.recording = flag;
                    responder.send(Reply::Ok);
                    self.publisher.publish(Publication::Record(flag));
                }
            }
        }
    }

    /// Runs the dispatcher until every request client is gone.
    pub async fn run(&mut self) {
        while self.serve_state().await.is_some() {}
        info!("all request clients gone, dispatcher stopping");
    }
}
