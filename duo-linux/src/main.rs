// Duo Linux daemon: discovery, connection manager, file transfer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use duo_core::ChaChaAdapter;
use duo_linux::config::{self, Config};
use duo_linux::connection::{ConnectRequest, ConnectionManager, ConnectionSettings};
use duo_linux::discovery::{DiscoveryService, DiscoverySettings, SystemInterfaces};
use duo_linux::events::{ConnectionEvent, TransferEvent, EVENT_CAPACITY};
use duo_linux::router::{LoggingHandler, MessageRouter};
use duo_linux::store::{JsonFileStore, SessionStore};
use duo_linux::transfer::{FileReceiver, FileSender, TransferSettings};
use duo_linux::transport::{EnvelopeSink, WsDialer};
use duo_linux::LocalIdentity;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default)]
struct Args {
    connect: Option<Vec<String>>,
    send: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let mut parsed = Args::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("duo-linux {}", VERSION);
                return Ok(());
            }
            "--connect" => {
                let list = args.next().context("--connect needs <ip[,ip...]>")?;
                parsed.connect = Some(
                    list.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                );
            }
            "--send" => {
                let path = args.next().context("--send needs <path>")?;
                parsed.send = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(run(cfg, parsed))
}

async fn run(cfg: Config, args: Args) -> anyhow::Result<()> {
    let store = Arc::new(JsonFileStore::open(&cfg.state_file));
    let identity = LocalIdentity {
        id: store.device_id(),
        name: cfg.device_name.clone(),
        kind: cfg.device_kind,
    };
    info!(id = %identity.id, name = %identity.name, kind = %identity.kind, "Starting duo-linux {}", VERSION);

    let manager = ConnectionManager::new(
        WsDialer,
        Arc::new(ChaChaAdapter),
        store.clone(),
        identity.clone(),
        ConnectionSettings {
            expanded_networking: cfg.expanded_networking,
            auto_reconnect: cfg.auto_reconnect,
            default_key: cfg.key.clone(),
            ..ConnectionSettings::default()
        },
    );

    let mut discovery_settings =
        DiscoverySettings::new(cfg.discovery_port, cfg.transport_port, cfg.peer_kind());
    discovery_settings.enabled = cfg.discovery_enabled;
    discovery_settings.expanded_networking = cfg.expanded_networking;
    let discovery = DiscoveryService::new(identity, discovery_settings, SystemInterfaces);
    if let Some(last) = store.last_peer() {
        discovery.remember_peer_addresses(last.addresses);
    }
    discovery
        .start()
        .await
        .with_context(|| format!("failed to bind discovery port {}", cfg.discovery_port))?;
    manager.attach_discovery(discovery.peers());

    if let Some(mut wake_ups) = discovery.take_wake_ups() {
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Some(target) = wake_ups.recv().await {
                if let Err(e) = manager.handle_wake_up(target).await {
                    warn!(error = %e, "Wake-up reconnect failed");
                }
            }
        });
    }

    let (transfer_tx, transfer_rx) = broadcast::channel(EVENT_CAPACITY);
    let sink: Arc<dyn EnvelopeSink> = Arc::new(manager.clone());
    let transfer_settings = TransferSettings::new(&cfg.download_dir);
    let sender = Arc::new(FileSender::new(
        sink.clone(),
        transfer_settings.clone(),
        transfer_tx.clone(),
    ));
    let receiver = Arc::new(FileReceiver::new(sink, transfer_settings, transfer_tx));
    let router = MessageRouter::new(sender.clone(), receiver, Arc::new(LoggingHandler));
    tokio::spawn(router.run(manager.session_feed()));
    tokio::spawn(log_status(manager.subscribe()));
    tokio::spawn(log_transfers(transfer_rx));

    match args.connect {
        Some(addresses) => {
            let key = cfg
                .key
                .clone()
                .or_else(|| store.last_peer().and_then(|p| p.key));
            let request = ConnectRequest {
                addresses,
                port: cfg.transport_port,
                key,
                manual: true,
            };
            match manager.connect(request).await {
                Ok(()) => {
                    if let Some(path) = args.send {
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            match sender.send_file(&path, "application/octet-stream").await {
                                Ok(id) => info!(id = %id, path = %path.display(), "File sent"),
                                Err(e) => warn!(path = %path.display(), error = %e, "Send failed"),
                            }
                        });
                    }
                }
                Err(e) => warn!(error = %e, "Connect failed"),
            }
        }
        None => {
            if args.send.is_some() {
                warn!("--send requires --connect; ignoring");
            }
            manager.resume_auto_reconnect();
        }
    }

    shutdown_signal().await?;
    info!("Shutting down");
    manager.disconnect(false);
    discovery.stop().await;
    Ok(())
}

async fn log_status(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Status(status)) => match status.failure {
                Some(failure) => warn!(connected = status.connected, %failure, "Connection status"),
                None => info!(connected = status.connected, peer = ?status.peer, "Connection status"),
            },
            Ok(ConnectionEvent::Message(_)) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_transfers(mut events: broadcast::Receiver<TransferEvent>) {
    loop {
        match events.recv().await {
            Ok(TransferEvent::Progress { id, percent, .. }) => {
                tracing::debug!(id = %id, percent, "Transfer progress")
            }
            Ok(event) => info!(?event, "Transfer"),
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
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
