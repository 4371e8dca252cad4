// Lanchat daemon: message/file transport listeners, network discovery,
// offline buffering.

mod config;
mod connection;
mod discovery;
mod listener;
mod offline;
mod service;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use service::{ChatService, Event};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("lanchat-daemon {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    info!(
        message_port = cfg.message_port,
        subscriber_port = cfg.subscriber_port,
        cache_dir = %cfg.cache_dir.display(),
        "starting lanchat daemon"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (service, mut events) = ChatService::new(cfg);
        service.start().await;
        tokio::select! {
            r = shutdown_signal() => r?,
            _ = drain_events(&mut events) => {}
        }
        service.stop().await;
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}

/// Log collaborator events; returns when the listener stack fails for good.
async fn drain_events(events: &mut mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Fatal(msg) => {
                error!(%msg, "fatal listener failure, shutting down");
                return;
            }
            Event::DiscoveryError(msg) => warn!(%msg, "discovery error"),
            Event::NetworkAvailable(available) => info!(available, "network availability"),
            Event::DeviceList(devices) => info!(count = devices.len(), "device list updated"),
            Event::FileProgress {
                path,
                received,
                size,
                ..
            } => debug!(path = %path.display(), received, size, "file progress"),
            Event::NewMessage => debug!("new message while app inactive"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
