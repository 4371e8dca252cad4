//! Dual-listener lifecycle: bind the message and subscriber ports, accept,
//! restart on failure with a bounded attempt ceiling, and force-close
//! everything on stop.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection;
use crate::service::{Event, Shared};

/// Listener lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Ready,
    Failed,
    Restarting,
    /// Restart ceiling reached; no further attempts.
    FatallyStopped,
}

/// How long `stop()` waits for the supervisor to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

type ConnFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

enum RegistryCmd {
    /// Spawn and track a connection task; rejected once shutdown began.
    Add(ConnFuture, oneshot::Sender<bool>),
    Remove(u64),
    /// Abort every tracked task and reject adds until reopened.
    Shutdown(oneshot::Sender<usize>),
    Reopen,
}

/// Owns the connection set. Spawning, tracking, and aborting all happen
/// inside one task, so an add can never race a shutdown.
#[derive(Clone)]
pub struct Registry {
    tx: mpsc::UnboundedSender<RegistryCmd>,
}

impl Registry {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self { tx };
        tokio::spawn(run_registry(rx, registry.clone()));
        registry
    }

    /// Track `fut` as a connection task. Returns false when shutting down;
    /// the future is dropped unspawned, closing its socket.
    pub async fn add(&self, fut: ConnFuture) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(RegistryCmd::Add(fut, reply_tx)).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    fn remove(&self, id: u64) {
        let _ = self.tx.send(RegistryCmd::Remove(id));
    }

    /// Abort all tracked connections; returns how many were open.
    pub async fn shutdown(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(RegistryCmd::Shutdown(reply_tx)).is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    fn reopen(&self) {
        let _ = self.tx.send(RegistryCmd::Reopen);
    }
}

async fn run_registry(mut rx: mpsc::UnboundedReceiver<RegistryCmd>, handle: Registry) {
    let mut conns: HashMap<u64, tokio::task::AbortHandle> = HashMap::new();
    let mut next_id = 0u64;
    let mut closed = false;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RegistryCmd::Add(fut, reply) => {
                if closed {
                    let _ = reply.send(false);
                    continue;
                }
                next_id += 1;
                let id = next_id;
                let registry = handle.clone();
                let task = tokio::spawn(async move {
                    fut.await;
                    registry.remove(id);
                });
                conns.insert(id, task.abort_handle());
                let _ = reply.send(true);
            }
            RegistryCmd::Remove(id) => {
                conns.remove(&id);
            }
            RegistryCmd::Shutdown(reply) => {
                closed = true;
                let open = conns.len();
                for (_, task) in conns.drain() {
                    task.abort();
                }
                let _ = reply.send(open);
            }
            RegistryCmd::Reopen => {
                closed = false;
            }
        }
    }
}

pub struct ListenerManager {
    shared: Arc<Shared>,
    registry: Registry,
    state_tx: Arc<watch::Sender<ListenerState>>,
    stop_tx: Arc<watch::Sender<bool>>,
    bound_tx: Arc<watch::Sender<Option<(SocketAddr, SocketAddr)>>>,
    restart_attempts: Arc<AtomicU32>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerManager {
    pub fn new(shared: Arc<Shared>) -> Self {
        let (state_tx, _) = watch::channel(ListenerState::Stopped);
        let (stop_tx, _) = watch::channel(false);
        let (bound_tx, _) = watch::channel(None);
        Self {
            shared,
            registry: Registry::spawn(),
            state_tx: Arc::new(state_tx),
            stop_tx: Arc::new(stop_tx),
            bound_tx: Arc::new(bound_tx),
            restart_attempts: Arc::new(AtomicU32::new(0)),
            supervisor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    /// Locally bound (message, subscriber) addresses while Ready.
    pub fn bound_addrs(&self) -> watch::Receiver<Option<(SocketAddr, SocketAddr)>> {
        self.bound_tx.subscribe()
    }

    /// Restarts performed since the last successful start.
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::SeqCst)
    }

    pub async fn start(&self) {
        let mut guard = self.supervisor.lock().await;
        if guard.is_some() {
            warn!("listener manager already started");
            return;
        }
        let _ = self.stop_tx.send(false);
        self.restart_attempts.store(0, Ordering::SeqCst);
        let shared = self.shared.clone();
        let registry = self.registry.clone();
        let state_tx = self.state_tx.clone();
        let bound_tx = self.bound_tx.clone();
        let attempts = self.restart_attempts.clone();
        let stop_rx = self.stop_tx.subscribe();
        *guard = Some(tokio::spawn(supervise(
            shared, registry, state_tx, bound_tx, attempts, stop_rx,
        )));
    }

    /// Idempotent. Force-closes all tracked connections and both listeners,
    /// then waits (bounded) for the supervisor to observe cancellation.
    pub async fn stop(&self) {
        let mut guard = self.supervisor.lock().await;
        let mut handle = match guard.take() {
            Some(h) => h,
            None => {
                debug!("listener manager already stopped");
                return;
            }
        };
        info!("stopping listeners");
        let _ = self.stop_tx.send(true);
        let closed = self.registry.shutdown().await;
        if closed > 0 {
            info!(closed, "force-closed connections");
        }
        if timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            error!("timed out waiting for listeners to stop");
            handle.abort();
        }
        let _ = self.bound_tx.send(None);
        let _ = self.state_tx.send(ListenerState::Stopped);
        info!("listeners stopped");
    }
}

enum AcceptOutcome {
    Stopped,
    Failed(std::io::Error),
}

async fn supervise(
    shared: Arc<Shared>,
    registry: Registry,
    state_tx: Arc<watch::Sender<ListenerState>>,
    bound_tx: Arc<watch::Sender<Option<(SocketAddr, SocketAddr)>>>,
    attempts: Arc<AtomicU32>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let _ = state_tx.send(ListenerState::Starting);
        // A start attempt that has not produced two bound sockets within the
        // liveness delay counts as failed.
        let bind = timeout(shared.config.liveness_delay(), bind_both(&shared.config)).await;
        match bind {
            Ok(Ok((main_listener, sub_listener))) => {
                registry.reopen();
                let addrs = main_listener
                    .local_addr()
                    .and_then(|m| sub_listener.local_addr().map(|s| (m, s)));
                match addrs {
                    Ok((main_addr, sub_addr)) => {
                        info!(%main_addr, %sub_addr, "listeners ready");
                        let _ = bound_tx.send(Some((main_addr, sub_addr)));
                        let _ = state_tx.send(ListenerState::Ready);
                        attempts.store(0, Ordering::SeqCst);
                        match accept_loop(
                            main_listener,
                            sub_listener,
                            &shared,
                            &registry,
                            &mut stop_rx,
                        )
                        .await
                        {
                            AcceptOutcome::Stopped => {
                                let _ = bound_tx.send(None);
                                let _ = state_tx.send(ListenerState::Stopped);
                                return;
                            }
                            AcceptOutcome::Failed(e) => {
                                error!(error = %e, "listener failed");
                                let _ = state_tx.send(ListenerState::Failed);
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "failed to read listener addresses");
                        let _ = state_tx.send(ListenerState::Failed);
                    }
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "failed to bind listeners");
                let _ = state_tx.send(ListenerState::Failed);
            }
            Err(_) => {
                error!("listeners did not become ready in time");
                let _ = state_tx.send(ListenerState::Failed);
            }
        }
        let _ = bound_tx.send(None);

        let next = attempts.load(Ordering::SeqCst) + 1;
        if next > shared.config.max_restart_attempts {
            error!(
                attempts = shared.config.max_restart_attempts,
                "restart ceiling reached, stopping for good"
            );
            let _ = state_tx.send(ListenerState::FatallyStopped);
            let _ = shared
                .events
                .send(Event::Fatal("listener restart ceiling reached".into()));
            return;
        }
        attempts.store(next, Ordering::SeqCst);
        warn!(
            attempt = next,
            max = shared.config.max_restart_attempts,
            "restarting listeners"
        );
        let _ = state_tx.send(ListenerState::Restarting);
        // Connections from the failed cycle do not survive the restart.
        registry.shutdown().await;
        tokio::select! {
            _ = sleep(shared.config.restart_delay()) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    let _ = state_tx.send(ListenerState::Stopped);
                    return;
                }
            }
        }
    }
}

async fn bind_both(config: &Config) -> std::io::Result<(TcpListener, TcpListener)> {
    let main_listener = TcpListener::bind(("0.0.0.0", config.message_port)).await?;
    let sub_listener = TcpListener::bind(("0.0.0.0", config.subscriber_port)).await?;
    Ok((main_listener, sub_listener))
}

async fn accept_loop(
    main_listener: TcpListener,
    sub_listener: TcpListener,
    shared: &Arc<Shared>,
    registry: &Registry,
    stop_rx: &mut watch::Receiver<bool>,
) -> AcceptOutcome {
    loop {
        tokio::select! {
            r = main_listener.accept() => match r {
                Ok((stream, peer)) => spawn_connection(shared, registry, stream, peer, false).await,
                Err(e) => return AcceptOutcome::Failed(e),
            },
            r = sub_listener.accept() => match r {
                Ok((stream, peer)) => spawn_connection(shared, registry, stream, peer, true).await,
                Err(e) => return AcceptOutcome::Failed(e),
            },
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return AcceptOutcome::Stopped;
                }
            }
        }
    }
}

async fn spawn_connection(
    shared: &Arc<Shared>,
    registry: &Registry,
    stream: TcpStream,
    peer: SocketAddr,
    subscriber: bool,
) {
    let shared = shared.clone();
    let fut: ConnFuture = Box::pin(async move {
        let result = if subscriber {
            connection::run_subscriber(stream, shared).await
        } else {
            connection::run_connection(stream, shared).await
        };
        if let Err(e) = result {
            warn!(%peer, error = %e, "connection closed with error");
        }
    });
    if !registry.add(fut).await {
        debug!(%peer, "rejecting connection during shutdown");
    }
}
