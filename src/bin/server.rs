//! `runctl-server`: the transition authority.
//!
//! Runs the generic dispatcher over the standard run lifecycle and bridges
//! it to TCP: a request port (one reply line per request line) and a
//! publication port (broadcast lines, heartbeat included).

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use runctl::config::Settings;
use runctl::dispatcher::Dispatcher;
use runctl::transition::{run_state_table, INITIAL};
use runctl::transport::{request_channel, serve_pub_port, serve_request_port, Publisher};
use tokio::net::TcpListener;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Transition authority for run-control participants.
#[derive(Parser, Debug)]
#[command(name = "runctl-server", version, about)]
struct Args {
    /// Request port bind address, host:port.
    #[arg(long, default_value = "0.0.0.0:29000")]
    request: String,
    /// Publication port bind address, host:port.
    #[arg(long, default_value = "0.0.0.0:29001")]
    publish: String,
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

    let publisher = Publisher::new(256);
    let (client, server) = request_channel(settings.run_control.timeout);
    let mut dispatcher = Dispatcher::new(
        run_state_table(),
        INITIAL,
        settings.orchestrator.heartbeat,
        server,
        publisher.clone(),
    )
    .context("building the dispatcher")?;

    let request_listener = TcpListener::bind(&args.request)
        .await
        .with_context(|| format!("binding request port {}", args.request))?;
    let publish_listener = TcpListener::bind(&args.publish)
        .await
        .with_context(|| format!("binding publication port {}", args.publish))?;
    info!(request = %args.request, publish = %args.publish, "authority listening");

    tokio::spawn(serve_request_port(request_listener, client));
    tokio::spawn(serve_pub_port(publish_listener, publisher));

    dispatcher.run().await;
    Ok(())
}
