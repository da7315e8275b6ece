//! `runctl`: the orchestration daemon.
//!
//! Follows a dispatcher's broadcasts over TCP, mirrors the global state into
//! a store-backed run-control authority, and supervises the participant
//! programs that authority describes: `Readying` starts them all over the
//! remote shell, `NotReady` stops them, and an unexpected participant exit
//! forces the whole system back to `NotReady`.

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use runctl::config::Settings;
use runctl::control::RunControl;
use runctl::monitor::Monitor;
use runctl::store::MemoryStore;
use runctl::supervise::{Orchestrator, SshShell};
use runctl::transition::{INITIAL, NOT_READY, READY, READYING};
use runctl::transport::{TcpRequestClient, TcpSubscriber};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Orchestration daemon for run-control participants.
#[derive(Parser, Debug)]
#[command(name = "runctl", version, about)]
struct Args {
    /// Dispatcher request endpoint, host:port.
    request_endpoint: String,
    /// Dispatcher publication endpoint, host:port.
    subscribe_endpoint: String,
    /// Settings file.
    #[arg(long, default_value = "runctl.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load_from(&args.config).context("loading settings")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(&settings.application.log_level)
            }),
        )
        .init();

    let store = Arc::new(MemoryStore::new());
    let control = RunControl::with_base(store, &settings.run_control.base_path)
        .context("creating the run-control schema")?;
    control.set_timeout(settings.run_control.timeout)?;
    for entry in &settings.programs {
        control
            .add_program(&entry.name, &entry.definition)
            .with_context(|| format!("seeding program '{}'", entry.name))?;
        info!(program = %entry.name, host = %entry.definition.host, "program seeded");
    }

    let subscriber = TcpSubscriber::connect(&args.subscribe_endpoint)
        .await
        .context("connecting to the publication endpoint")?;
    let requests = TcpRequestClient::new(&args.request_endpoint, settings.run_control.timeout);
    let mut monitor = Monitor::new(Box::new(subscriber), Box::new(requests));

    // Entered states funnel through a channel so the supervision loop stays
    // single-threaded.
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel::<String>();
    for state in [INITIAL, NOT_READY, READYING, READY] {
        let tx = entered_tx.clone();
        monitor.on_enter(
            state,
            Box::new(move |_from, to| {
                let _ = tx.send(to.to_string());
            }),
        );
    }

    let shell = Arc::new(SshShell::new(&settings.orchestrator.ssh_binary));
    let mut orchestrator = Orchestrator::new(
        control.clone(),
        shell,
        args.request_endpoint.clone(),
        args.subscribe_endpoint.clone(),
    );

    info!(
        request = %args.request_endpoint,
        subscribe = %args.subscribe_endpoint,
        "orchestrator running"
    );
    let poll = settings.run_control.poll_interval;
    loop {
        // One bounded pull from the dispatcher, then a supervision cycle.
        match tokio::time::timeout(poll, monitor.process_one()).await {
            Ok(false) => {
                warn!("dispatcher connection lost, stopping participants");
                orchestrator.stop_all().await;
                return Ok(());
            }
            Ok(true) | Err(_) => {}
        }
        while let Ok(state) = entered_rx.try_recv() {
            control.force_global_state(&state)?;
        }
        let mut pending = Vec::new();
        control.process_messages(|_, notification| pending.push(notification.clone()))?;
        for notification in &pending {
            orchestrator.handle_notification(notification).await?;
        }
        orchestrator.tick(poll).await;
    }
}
