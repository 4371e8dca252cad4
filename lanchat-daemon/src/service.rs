//! Service facade: owns the listeners, discovery task, and offline buffer,
//! and exposes the narrow collaborator surface
//! (start/stop/app-active/identity/sinks).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lanchat_core::Device;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::discovery;
use crate::listener::ListenerManager;
use crate::offline::OfflineBuffer;

/// Events pushed to the external collaborator.
#[derive(Debug, Clone)]
pub enum Event {
    NetworkAvailable(bool),
    /// Whole-list replacement of the discovered devices.
    DeviceList(Vec<Device>),
    DiscoveryError(String),
    FileProgress {
        path: PathBuf,
        received: u64,
        size: u64,
        elapsed_ms: u64,
    },
    /// An inbound TEXT (not a sender echo) arrived while the app was
    /// inactive.
    NewMessage,
    /// Listener restart ceiling reached; the service will not retry.
    Fatal(String),
}

/// Device identity prepended to new connections (hostname + push token).
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub token: String,
}

/// State shared between the facade and per-connection tasks. Connection
/// tasks hold this through an `Arc`; nothing here points back at them.
pub struct Shared {
    pub config: Config,
    pub events: mpsc::UnboundedSender<Event>,
    pub message_sink: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pub offline: OfflineBuffer,
    /// Fan-out to subscriber-port connections.
    pub subscribers: broadcast::Sender<String>,
    pub app_active: AtomicBool,
    pub identity: Mutex<Option<DeviceIdentity>>,
    /// Last discovery result, replayed to late subscribers and sinks.
    pub devices: Mutex<Vec<Device>>,
    /// This device's hostname as learned from discovery (the is_local entry).
    pub local_hostname: Mutex<Option<String>>,
    pub network_available: AtomicBool,
}

impl Shared {
    pub fn new(config: Config, events: mpsc::UnboundedSender<Event>) -> Self {
        let offline = OfflineBuffer::new(config.buffer_path());
        let (subscribers, _) = broadcast::channel(256);
        Self {
            config,
            events,
            message_sink: Mutex::new(None),
            offline,
            subscribers,
            app_active: AtomicBool::new(true),
            identity: Mutex::new(None),
            devices: Mutex::new(Vec::new()),
            local_hostname: Mutex::new(None),
            network_available: AtomicBool::new(false),
        }
    }

    /// Forward a line to the live consumer, or buffer it when none is
    /// attached. Subscribers always get a copy. `notify` lines raise a
    /// new-message event while the app is inactive.
    pub async fn deliver(&self, line: &str, notify: bool) {
        let _ = self.subscribers.send(line.to_string());
        let sent = {
            let sink = self.message_sink.lock().await;
            match sink.as_ref() {
                Some(tx) => tx.send(line.to_string()).is_ok(),
                None => false,
            }
        };
        if !sent {
            if let Err(e) = self.offline.append(line).await {
                error!(error = %e, "failed to buffer message");
            }
        }
        if notify && !self.app_active.load(Ordering::Relaxed) {
            let _ = self.events.send(Event::NewMessage);
        }
    }

    /// Current device list as the `NETWORK:<json>` greeting line, if any.
    pub async fn network_line(&self) -> Option<String> {
        let devices = self.devices.lock().await;
        if devices.is_empty() {
            return None;
        }
        serde_json::to_string(&*devices)
            .ok()
            .map(|json| format!("NETWORK:{json}"))
    }

    /// Identity line for fresh connections, when an identity is set. An
    /// empty identity hostname falls back to the discovery-learned one.
    pub async fn identity_line(&self) -> Option<String> {
        let identity = self.identity.lock().await.clone()?;
        let hostname = if identity.hostname.is_empty() {
            self.local_hostname.lock().await.clone().unwrap_or_default()
        } else {
            identity.hostname
        };
        Some(lanchat_core::protocol::identity_line(
            &hostname,
            &identity.token,
        ))
    }
}

pub struct ChatService {
    shared: Arc<Shared>,
    listeners: ListenerManager,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ChatService {
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(config, events_tx));
        let listeners = ListenerManager::new(shared.clone());
        (
            Self {
                shared,
                listeners,
                discovery_task: Mutex::new(None),
                running: AtomicBool::new(false),
            },
            events_rx,
        )
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn listeners(&self) -> &ListenerManager {
        &self.listeners
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("service already running, skipping start");
            return;
        }
        info!("starting service");
        self.listeners.start().await;
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = discovery::run(shared).await {
                warn!(error = %e, "discovery stopped");
            }
        });
        *self.discovery_task.lock().await = Some(handle);
    }

    /// Idempotent; force-closes listeners and all tracked connections.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping service");
        if let Some(handle) = self.discovery_task.lock().await.take() {
            handle.abort();
        }
        self.listeners.stop().await;
        info!("service stopped");
    }

    pub fn set_app_active(&self, active: bool) {
        self.shared.app_active.store(active, Ordering::Relaxed);
    }

    pub async fn set_identity(&self, hostname: String, token: String) {
        *self.shared.identity.lock().await = Some(DeviceIdentity { hostname, token });
    }

    /// Attach the message consumer. Buffered messages are replayed in file
    /// order, then current network state is re-emitted so a late consumer
    /// converges.
    pub async fn attach_message_sink(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.message_sink.lock().await = Some(tx.clone());
        match self
            .shared
            .offline
            .drain(|line| tx.send(line.to_string()).is_ok())
            .await
        {
            Ok(n) if n > 0 => info!(replayed = n, "offline buffer drained"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to drain offline buffer"),
        }
        let _ = self.shared.events.send(Event::NetworkAvailable(
            self.shared.network_available.load(Ordering::Relaxed),
        ));
        let devices = self.shared.devices.lock().await.clone();
        if !devices.is_empty() {
            let _ = self.shared.events.send(Event::DeviceList(devices));
        }
        rx
    }

    pub async fn detach_message_sink(&self) {
        *self.shared.message_sink.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared(dir: &tempfile::TempDir) -> (Arc<Shared>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        (Arc::new(Shared::new(config, tx)), rx)
    }

    #[tokio::test]
    async fn deliver_buffers_without_sink_then_goes_live() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _events) = test_shared(&dir);

        shared.deliver("TEXT:1:hello", true).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        *shared.message_sink.lock().await = Some(tx.clone());
        let n = shared
            .offline
            .drain(|line| tx.send(line.to_string()).is_ok())
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(rx.recv().await.unwrap(), "TEXT:1:hello");

        shared.deliver("TEXT:2:again", true).await;
        assert_eq!(rx.recv().await.unwrap(), "TEXT:2:again");
    }

    #[tokio::test]
    async fn notify_only_while_app_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, mut events) = test_shared(&dir);

        shared.deliver("TEXT:1:hi", true).await;
        assert!(events.try_recv().is_err());

        shared.app_active.store(false, Ordering::Relaxed);
        shared.deliver("TEXT:2:hi", true).await;
        assert!(matches!(events.try_recv(), Ok(Event::NewMessage)));

        // Quiet lines never notify.
        shared.deliver("CTRL:3:typing", false).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribers_receive_copies() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _events) = test_shared(&dir);
        let mut sub = shared.subscribers.subscribe();
        shared.deliver("TEXT:1:hi", false).await;
        assert_eq!(sub.recv().await.unwrap(), "TEXT:1:hi");
    }

    #[tokio::test]
    async fn facade_attach_replays_buffer_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let (service, mut events) = ChatService::new(config);
        assert_eq!(
            *service.listeners().state().borrow(),
            crate::listener::ListenerState::Stopped
        );

        service.shared().deliver("TEXT:1:early", true).await;
        let mut sink = service.attach_message_sink().await;
        assert_eq!(sink.recv().await.unwrap(), "TEXT:1:early");
        // Attach re-emits the availability snapshot for late consumers.
        assert!(matches!(
            events.recv().await,
            Some(Event::NetworkAvailable(false))
        ));

        // Live delivery while attached; nothing rebuffered.
        service.shared().deliver("TEXT:2:live", true).await;
        assert_eq!(sink.recv().await.unwrap(), "TEXT:2:live");
        assert!(!service.shared().config.buffer_path().exists());

        // Detached again: back to buffering.
        service.detach_message_sink().await;
        service.shared().deliver("TEXT:3:late", true).await;
        assert!(service.shared().config.buffer_path().exists());

        service.set_app_active(false);
        service.set_identity(String::new(), "tok-9".into()).await;
        *service.shared().local_hostname.lock().await = Some("alpha.lan".into());
        assert_eq!(
            service.shared().identity_line().await.unwrap(),
            "TEXT:NULL_ID:PN_INFO:alpha.lan tok-9\n"
        );

        // Stop without start is a no-op.
        service.stop().await;
    }

    #[tokio::test]
    async fn network_line_reflects_device_list() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _events) = test_shared(&dir);
        assert!(shared.network_line().await.is_none());
        shared.devices.lock().await.push(Device {
            address: "100.64.0.9".into(),
            hostname: Some("mypc.lan".into()),
            interface: None,
            is_local: true,
        });
        let line = shared.network_line().await.unwrap();
        assert!(line.starts_with("NETWORK:["));
        assert!(line.contains("100.64.0.9"));
    }
}
