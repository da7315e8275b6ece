//! Client-side state monitor for participants.
//!
//! The monitor mirrors the authority's broadcasts into a local view and
//! dispatches per-state callbacks. The first `STATE` publication marks the
//! moment the client joins mid-stream; it fires the target state's callback
//! with no predecessor. Later `STATE` heartbeats are bookkeeping only, and
//! `TRANSITION` publications fire the entered state's callback with the
//! previous state attached.

use crate::error::{RcError, RcResult};
use crate::protocol::{Publication, Reply, Request};
use crate::transport::{RequestTransport, SubscribeTransport};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Callback invoked when the monitored machine enters a state. The first
/// argument is the predecessor state, absent when the client joined
/// mid-stream.
pub type StateCallback = Box<dyn FnMut(Option<&str>, &str) + Send>;

/// Local mirror of the authority plus the request path back to it.
pub struct Monitor {
    subscription: Box<dyn SubscribeTransport>,
    requests: Box<dyn RequestTransport>,
    state: Option<String>,
    run: Option<u32>,
    title: Option<String>,
    recording: Option<bool>,
    handlers: HashMap<String, StateCallback>,
}

impl Monitor {
    /// Wraps a subscription and a request path into a monitor with an empty
    /// view; the view fills in as publications arrive.
    pub fn new(
        subscription: Box<dyn SubscribeTransport>,
        requests: Box<dyn RequestTransport>,
    ) -> Self {
        Self {
            subscription,
            requests,
            state: None,
            run: None,
            title: None,
            recording: None,
            handlers: HashMap::new(),
        }
    }

    /// Registers (or replaces) the callback fired on entry to `state`.
    pub fn on_enter(&mut self, state: impl Into<String>, callback: StateCallback) {
        self.handlers.insert(state.into(), callback);
    }

    /// Last known authority state, if any publication has arrived yet.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// Last known run number.
    pub fn run(&self) -> Option<u32> {
        self.run
    }

    /// Last known title.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Last known recording flag.
    pub fn recording(&self) -> Option<bool> {
        self.recording
    }

    fn apply(&mut self, message: Publication) {
        match message {
            Publication::State(name) => {
                if self.state.is_some() {
                    // Heartbeat; the view already tracks transitions.
                    self.state = Some(name);
                    return;
                }
                debug!(state = %name, "joined mid-stream");
                if let Some(callback) = self.handlers.get_mut(&name) {
                    callback(None, &name);
                }
                self.state = Some(name);
            }
            Publication::Transition(next) => {
                let previous = self.state.take();
                if let Some(callback) = self.handlers.get_mut(&next) {
                    callback(previous.as_deref(), &next);
                }
                self.state = Some(next);
            }
            Publication::Run(n) => self.run = Some(n),
            Publication::Title(text) => self.title = Some(text),
            Publication::Record(flag) => self.recording = Some(flag),
        }
    }

    /// Waits for one publication and applies it. `false` once the
    /// subscription is closed.
    pub async fn process_one(&mut self) -> bool {
        match self.subscription.recv().await {
            Some(message) => {
                self.apply(message);
                true
            }
            None => {
                warn!("subscription closed");
                false
            }
        }
    }

    /// Applies publications until the subscription closes.
    pub async fn pump(&mut self) {
        while self.process_one().await {}
    }

    async fn request(&self, request: Request) -> RcResult<()> {
        match self.requests.request(request).await? {
            Reply::Ok => Ok(()),
            Reply::Fail(reason) => Err(RcError::Refused(reason)),
        }
    }

    /// Asks the authority to enter `state`. A FAIL reply surfaces as
    /// [`RcError::Refused`] carrying the authority's reason.
    pub async fn request_transition(&self, state: &str) -> RcResult<()> {
        self.request(Request::Transition(state.to_string())).await
    }

    /// Sets the run number on the authority.
    pub async fn set_run(&self, run: u32) -> RcResult<()> {
        self.request(Request::Run(run)).await
    }

    /// Sets the run title on the authority.
    pub async fn set_title(&self, title: &str) -> RcResult<()> {
        self.request(Request::Title(title.to_string())).await
    }

    /// Sets the recording flag on the authority.
    pub async fn set_recording(&self, recording: bool) -> RcResult<()> {
        self.request(Request::Record(recording)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{request_channel, Publisher};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn monitor_over(publisher: &Publisher) -> Monitor {
        let (client, _server) = request_channel(Duration::from_millis(50));
        Monitor::new(
            Box::new(publisher.subscribe()),
            Box::new(client),
        )
    }

    #[tokio::test]
    async fn test_first_state_fires_with_no_predecessor() {
        let publisher = Publisher::new(16);
        let mut monitor = monitor_over(&publisher);
        let seen: Arc<Mutex<Vec<(Option<String>, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.on_enter(
            "NotReady",
            Box::new(move |from, to| {
                sink.lock()
                    .unwrap()
                    .push((from.map(String::from), to.to_string()));
            }),
        );

        publisher.publish(Publication::State("NotReady".into()));
        assert!(monitor.process_one().await);
        assert_eq!(monitor.state(), Some("NotReady"));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(None, "NotReady".to_string())]
        );
    }

    #[tokio::test]
    async fn test_heartbeats_do_not_refire_callbacks() {
        let publisher = Publisher::new(16);
        let mut monitor = monitor_over(&publisher);
        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        monitor.on_enter(
            "Ready",
            Box::new(move |_, _| *sink.lock().unwrap() += 1),
        );

        publisher.publish(Publication::State("Ready".into()));
        publisher.publish(Publication::State("Ready".into()));
        publisher.publish(Publication::State("Ready".into()));
        for _ in 0..3 {
            assert!(monitor.process_one().await);
        }
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transition_carries_predecessor() {
        let publisher = Publisher::new(16);
        let mut monitor = monitor_over(&publisher);
        let seen: Arc<Mutex<Vec<(Option<String>, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.on_enter(
            "Readying",
            Box::new(move |from, to| {
                sink.lock()
                    .unwrap()
                    .push((from.map(String::from), to.to_string()));
            }),
        );

        publisher.publish(Publication::State("NotReady".into()));
        publisher.publish(Publication::Transition("Readying".into()));
        assert!(monitor.process_one().await);
        assert!(monitor.process_one().await);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(Some("NotReady".to_string()), "Readying".to_string())]
        );
        assert_eq!(monitor.state(), Some("Readying"));
    }

    #[tokio::test]
    async fn test_metadata_mirrored() {
        let publisher = Publisher::new(16);
        let mut monitor = monitor_over(&publisher);
        publisher.publish(Publication::Run(9));
        publisher.publish(Publication::Title("calibration".into()));
        publisher.publish(Publication::Record(false));
        for _ in 0..3 {
            assert!(monitor.process_one().await);
        }
        assert_eq!(monitor.run(), Some(9));
        assert_eq!(monitor.title(), Some("calibration"));
        assert_eq!(monitor.recording(), Some(false));
    }

    #[tokio::test]
    async fn test_fail_reply_surfaces_as_refused() {
        let publisher = Publisher::new(16);
        let (client, mut server) = request_channel(Duration::from_secs(1));
        let monitor = Monitor::new(Box::new(publisher.subscribe()), Box::new(client));
        tokio::spawn(async move {
            let (_request, responder) = server
                .recv_timeout(Duration::from_secs(1))
                .await
                .expect("a request");
            responder.send(Reply::Fail("Valid transitions requests are NotReady".into()));
        });
        let err = monitor.request_transition("Ready").await.unwrap_err();
        assert!(matches!(err, RcError::Refused(reason)
            if reason == "Valid transitions requests are NotReady"));
    }
}
