//! Orchestration engine: starting, stopping, and supervising participants.
//!
//! The engine reacts to global-state notifications. Entering `Readying`
//! spawns every active program over the remote-shell capability and wires
//! both of its output streams into the event loop; entering `NotReady` winds
//! every live process down through the same path used for normal stop.
//!
//! An unsolicited end-of-stream — one that arrives while `expecting_exit` is
//! false — is a participant failure: the owning program is marked `NotReady`
//! (tolerating "already NotReady" as success) and the global state is forced
//! to `NotReady`, cascading shutdown to every other participant on the next
//! cycle. The failure is never surfaced through an API result; it is an
//! autonomous transition plus operator logging.
//!
//! Intentional termination is best-effort but *classified*: delivery of the
//! interrupt and exit commands distinguishes `Delivered`, `AlreadyGone` (the
//! process closed its input first — not an error) and genuine transport
//! failure (logged for operators).

use crate::control::{Notification, ProgramDefinition, RunControl};
use crate::error::RcResult;
use crate::event_loop::{Action, EventLoop, Interest, Payload, StreamTarget, Token};
use crate::transition::{NOT_READY, READYING};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the request endpoint to participants.
pub const ENV_REQUEST: &str = "RUNCTL_REQUEST_ENDPOINT";
/// Environment variable carrying the subscription endpoint to participants.
pub const ENV_SUBSCRIBE: &str = "RUNCTL_SUBSCRIBE_ENDPOINT";
/// Environment variable carrying the participant's own program name.
pub const ENV_PROGRAM: &str = "RUNCTL_PROGRAM";

/// ASCII ETX, the interrupt byte sent down a participant's input.
const INTERRUPT: u8 = 0x03;

/// A process spawned through a remote shell: its input plus both output
/// streams.
pub struct ShellChild {
    /// Write half of the remote shell's standard input.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// The participant's standard output.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// The participant's standard error.
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    /// Underlying OS child when there is one; kept so the transport dies
    /// with the supervisor.
    pub child: Option<tokio::process::Child>,
}

/// Capability to start an interactive shell on a remote host and obtain its
/// streams.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Spawns `command` on `host` with the given extra environment.
    async fn spawn(
        &self,
        host: &str,
        command: &str,
        env: &[(String, String)],
    ) -> RcResult<ShellChild>;
}

/// [`RemoteShell`] over an ssh client binary.
pub struct SshShell {
    binary: String,
}

impl SshShell {
    /// Uses `binary` (normally just `ssh`) as the transport.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn spawn(
        &self,
        host: &str,
        command: &str,
        env: &[(String, String)],
    ) -> RcResult<ShellChild> {
        let assignments: Vec<String> = env
            .iter()
            .map(|(key, value)| format!("{key}='{value}'"))
            .collect();
        let remote = format!("{} exec {command}", assignments.join(" "));
        debug!(%host, %remote, "spawning participant");
        let mut child = Command::new(&self.binary)
            .arg(host)
            .arg(remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| crate::error::RcError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| crate::error::RcError::Transport("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| crate::error::RcError::Transport("child stderr unavailable".into()))?;
        Ok(ShellChild {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            child: Some(child),
        })
    }
}

/// Outcome of delivering a termination command to a participant.
#[derive(Debug)]
pub enum StopOutcome {
    /// The bytes reached the participant's input.
    Delivered,
    /// The participant had already closed its input; not an error.
    AlreadyGone,
    /// A genuine transport failure worth an operator's attention.
    Failed(String),
}

impl StopOutcome {
    /// Combines two delivery outcomes, keeping the more severe one.
    fn worse(a: StopOutcome, b: StopOutcome) -> StopOutcome {
        match (a, b) {
            (StopOutcome::Failed(reason), _) | (_, StopOutcome::Failed(reason)) => {
                StopOutcome::Failed(reason)
            }
            (StopOutcome::AlreadyGone, _) | (_, StopOutcome::AlreadyGone) => {
                StopOutcome::AlreadyGone
            }
            _ => StopOutcome::Delivered,
        }
    }
}

/// One spawned participant instance under supervision.
pub struct SupervisedProcess {
    program: String,
    host: String,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    expecting_exit: Arc<AtomicBool>,
    tokens: Vec<Token>,
    _child: Option<tokio::process::Child>,
}

impl SupervisedProcess {
    async fn deliver(&mut self, bytes: &[u8]) -> StopOutcome {
        let result = async {
            self.stdin.write_all(bytes).await?;
            self.stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => StopOutcome::Delivered,
            Err(err) => match err.kind() {
                std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::UnexpectedEof => StopOutcome::AlreadyGone,
                _ => StopOutcome::Failed(err.to_string()),
            },
        }
    }

    /// Interrupt followed by an exit command. Both deliveries are always
    /// attempted; the worse of the two outcomes is reported.
    async fn interrupt_and_exit(&mut self) -> StopOutcome {
        let interrupt = self.deliver(&[INTERRUPT]).await;
        let exit = self.deliver(b"exit\n").await;
        StopOutcome::worse(interrupt, exit)
    }
}

/// The orchestration engine.
pub struct Orchestrator {
    control: RunControl,
    shell: Arc<dyn RemoteShell>,
    event_loop: EventLoop,
    processes: BTreeMap<String, SupervisedProcess>,
    request_endpoint: String,
    subscribe_endpoint: String,
    failed: Arc<Mutex<Vec<String>>>,
}

impl Orchestrator {
    /// Creates an engine coordinating `control`'s programs over `shell`.
    /// The endpoints are handed to every spawned participant.
    pub fn new(
        control: RunControl,
        shell: Arc<dyn RemoteShell>,
        request_endpoint: impl Into<String>,
        subscribe_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            control,
            shell,
            event_loop: EventLoop::new(),
            processes: BTreeMap::new(),
            request_endpoint: request_endpoint.into(),
            subscribe_endpoint: subscribe_endpoint.into(),
            failed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Programs currently under supervision, alphabetically.
    pub fn supervised(&self) -> Vec<String> {
        self.processes.keys().cloned().collect()
    }

    /// Reacts to one classified notification. Only global state changes
    /// matter to the engine.
    pub async fn handle_notification(&mut self, notification: &Notification) -> RcResult<()> {
        if let Notification::GlobalStateChange { state } = notification {
            self.handle_global_state(state).await?;
        }
        Ok(())
    }

    /// Drives the engine for one global state value. Handler selection is an
    /// explicit match over the well-known lifecycle states.
    pub async fn handle_global_state(&mut self, state: &str) -> RcResult<()> {
        match state {
            READYING => {
                if let Err(err) = self.start_all().await {
                    error!(%err, "startup failed; unwinding through the stop path");
                    self.stop_all().await;
                    self.control.force_global_state(NOT_READY)?;
                }
            }
            NOT_READY => self.stop_all().await,
            _ => {}
        }
        Ok(())
    }

    async fn start_all(&mut self) -> RcResult<()> {
        for name in self.control.list_active_programs()? {
            if self.processes.contains_key(&name) {
                continue;
            }
            let def = self.control.program_definition(&name)?;
            self.start_program(&name, &def).await?;
        }
        Ok(())
    }

    async fn start_program(&mut self, name: &str, def: &ProgramDefinition) -> RcResult<()> {
        let env = vec![
            (ENV_REQUEST.to_string(), self.request_endpoint.clone()),
            (ENV_SUBSCRIBE.to_string(), self.subscribe_endpoint.clone()),
            (ENV_PROGRAM.to_string(), name.to_string()),
        ];
        let child = self.shell.spawn(&def.host, &def.path, &env).await?;
        info!(program = %name, host = %def.host, path = %def.path, "participant started");

        let expecting_exit = Arc::new(AtomicBool::new(false));
        let mut tokens = Vec::new();
        for (label, stream) in [("stdout", child.stdout), ("stderr", child.stderr)] {
            let token = self.event_loop.token();
            tokens.push(token);
            self.event_loop.register(
                token,
                Box::new(StreamTarget::new(stream)),
                Interest::READABLE,
                output_handler(
                    name.to_string(),
                    label,
                    expecting_exit.clone(),
                    self.control.clone(),
                    self.failed.clone(),
                ),
            );
        }
        self.control.mark_program_state(name, READYING)?;
        self.processes.insert(
            name.to_string(),
            SupervisedProcess {
                program: name.to_string(),
                host: def.host.clone(),
                stdin: child.stdin,
                expecting_exit,
                tokens,
                _child: child.child,
            },
        );
        Ok(())
    }

    /// Stops every live participant; stopping an already-stopped engine is a
    /// no-op.
    pub async fn stop_all(&mut self) {
        if self.processes.is_empty() {
            return;
        }
        for (name, mut process) in std::mem::take(&mut self.processes) {
            process.expecting_exit.store(true, Ordering::SeqCst);
            match process.interrupt_and_exit().await {
                StopOutcome::Delivered => {
                    info!(program = %name, host = %process.host, "participant stopped")
                }
                StopOutcome::AlreadyGone => {
                    debug!(program = %name, "participant was already gone")
                }
                StopOutcome::Failed(reason) => {
                    warn!(program = %name, %reason, "could not deliver stop commands")
                }
            }
            for token in &process.tokens {
                self.event_loop.unregister(*token);
            }
        }
    }

    /// One supervision cycle: multiplex participant output for up to
    /// `interval`, then discard processes whose unsolicited death was
    /// recorded by the output handlers.
    pub async fn tick(&mut self, interval: Duration) {
        self.event_loop.poll(interval).await;
        let failed: Vec<String> = {
            let mut failed = self
                .failed
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *failed)
        };
        for name in failed {
            if let Some(process) = self.processes.remove(&name) {
                warn!(program = %process.program, host = %process.host, "discarding dead participant");
            }
        }
    }

    /// Event-driven main loop over the run-control change feed: classify
    /// pending notifications, react, multiplex. Runs until the feed's store
    /// goes away.
    pub async fn run_from_feed(&mut self, interval: Duration) -> RcResult<()> {
        loop {
            let mut pending = Vec::new();
            self.control
                .process_messages(|_, notification| pending.push(notification.clone()))?;
            for notification in &pending {
                self.handle_notification(notification).await?;
            }
            self.tick(interval).await;
        }
    }
}


/// Builds the unsolicited-output handler for one stream of one participant.
///
/// Non-EOF data is relayed to the log and not otherwise interpreted. EOF
/// retires the stream; if the exit was not expected it marks the program
/// `NotReady` and forces the global state `NotReady`, which cascades shutdown
/// to the remaining participants on the next cycle.
fn output_handler(
    program: String,
    label: &'static str,
    expecting_exit: Arc<AtomicBool>,
    control: RunControl,
    failed: Arc<Mutex<Vec<String>>>,
) -> Box<dyn FnMut(Token, &mut dyn crate::event_loop::Pollable, Interest) -> Action> {
    Box::new(move |_token, target, _ready| {
        let mut action = Action::Continue;
        while let Some(payload) = target.take_payload() {
            match payload {
                Payload::Data(bytes) => {
                    for line in String::from_utf8_lossy(&bytes).lines() {
                        info!(program = %program, stream = label, "{line}");
                    }
                }
                Payload::Eof => {
                    action = Action::Deregister;
                    if expecting_exit.load(Ordering::SeqCst) {
                        debug!(program = %program, stream = label, "stream closed on request");
                        continue;
                    }
                    warn!(program = %program, stream = label, "unsolicited exit detected");
                    if let Err(err) = control.mark_program_state(&program, NOT_READY) {
                        error!(program = %program, %err, "could not mark program NotReady");
                    }
                    if let Err(err) = control.force_global_state(NOT_READY) {
                        error!(%err, "could not force global NotReady");
                    }
                    failed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(program.clone());
                }
                Payload::Line(_) => {}
            }
        }
        action
    })
}
