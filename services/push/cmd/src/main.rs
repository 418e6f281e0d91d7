//! Push gateway sender binary.
//!
//! Opens a managed mTLS connection to the push gateway and sends
//! pre-serialized notification payloads, one per file argument.

use anyhow::Context;
use clap::Parser;
use push_session::{ConnectionManager, GatewayEvent, GatewayEventNotifier, PushMessage};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::PushConfig;
use logging::PushLogFormatter;

/// Push gateway sender
#[derive(Parser, Debug)]
#[command(name = "redb-push", version, about = "Send push notifications over a persistent mTLS gateway connection")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "push.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Use the sandbox gateway
    #[arg(long)]
    sandbox: bool,

    /// Keep the connection open until Ctrl-C after sending
    #[arg(long)]
    hold: bool,

    /// Files holding one serialized notification each
    payloads: Vec<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("redb_push={}", args.log_level).parse()?)
        .add_directive(format!("push_session={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .event_format(PushLogFormatter::new("push".to_string()))
        .init();

    info!("Starting reDB Push Service v{}", env!("CARGO_PKG_VERSION"));

    let mut push_config = PushConfig::load_from_file(&args.config)?;
    if args.sandbox {
        push_config.gateway.sandbox = true;
        push_config.gateway.host = None;
    }
    let gateway_config = push_config.to_gateway_config()?;

    let payloads = args
        .payloads
        .iter()
        .map(|path| {
            std::fs::read(path)
                .map(PushMessage::from)
                .with_context(|| format!("Failed to read payload {:?}", path))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let (notifier, mut events) = GatewayEventNotifier::channel();
    let manager = ConnectionManager::connect(gateway_config, Some(Arc::new(notifier)))
        .await
        .context("Failed to connect to push gateway")?;

    if !payloads.is_empty() {
        let count = payloads.len();
        manager.send_bulk(payloads).await?;
        info!(component = "gateway", "Sent {} notification(s)", count);
    }

    if args.hold {
        info!("Holding connection open; press Ctrl-C to exit");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Some(event) => log_event(&event),
                    None => break,
                },
            }
        }
    } else {
        drain_events(&mut events);
    }

    manager.shutdown().await;
    info!("Push service stopped");
    Ok(())
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<GatewayEvent>) {
    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }
}

fn log_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::Connected { connection_id, address } => {
            info!(component = "gateway", connection = *connection_id, "Session open to {}", address);
        }
        GatewayEvent::Terminated(termination) => {
            warn!(
                component = "gateway",
                connection = termination.connection_id,
                "Session terminated: {} ({} message(s) dropped)",
                termination.reason,
                termination.dropped
            );
        }
        GatewayEvent::Reconnected { connection_id } => {
            info!(component = "gateway", connection = *connection_id, "Session re-established");
        }
        GatewayEvent::ReconnectFailed { reason } => {
            error!(component = "gateway", "Reconnect failed: {}", reason);
        }
    }
}
