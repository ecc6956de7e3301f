//! Discovery controller: runs the backend, pumps its notifications through [`DiscoveryState`]
//! and performs the resulting resolutions.

use std::sync::Arc;
use std::time::Duration;

use lanmsg_core::{
    DiscoveryAction, DiscoveryEvent, DiscoveryState, Peer, PeerRegistry, PlatformNotification,
    ServiceInfo,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionInfo, DiscoveryBackend, DiscoveryError, NotificationSink};
use crate::config::Config;

/// The peer wait ended before any peer showed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer wait cancelled")]
pub struct WaitCancelled;

struct Pump {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DiscoveryController {
    backend: Arc<dyn DiscoveryBackend>,
    registry: Arc<PeerRegistry>,
    name_prefix: String,
    peer_wait_interval: Duration,
    state: Arc<Mutex<DiscoveryState>>,
    pump: Mutex<Option<Pump>>,
}

impl DiscoveryController {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        registry: Arc<PeerRegistry>,
        service_type: &str,
        name_prefix: &str,
        peer_wait_interval: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            name_prefix: name_prefix.to_string(),
            peer_wait_interval,
            state: Arc::new(Mutex::new(DiscoveryState::new(service_type, name_prefix))),
            pump: Mutex::new(None),
        }
    }

    pub fn from_config(
        backend: Arc<dyn DiscoveryBackend>,
        registry: Arc<PeerRegistry>,
        cfg: &Config,
    ) -> Self {
        Self::new(
            backend,
            registry,
            &cfg.service_type,
            &cfg.service_name,
            cfg.peer_wait_interval(),
        )
    }

    pub fn is_running(&self) -> bool {
        self.pump.lock().is_some()
    }

    /// Name this device registered under, once registered.
    pub fn local_name(&self) -> Option<String> {
        self.state.lock().local_name().map(str::to_string)
    }

    /// Register the local service on `local_port`, start discovery and return the event stream.
    /// The stream ends when [`stop_work`](Self::stop_work) is called.
    pub async fn start_work(
        &self,
        local_port: u16,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, DiscoveryError> {
        if self.is_running() {
            return Err(DiscoveryError::AlreadyRunning);
        }
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let wanted = format!("{}-{}", self.name_prefix, &suffix[..8]);
        let name = self
            .backend
            .register_local_service(&wanted, local_port)
            .await?;
        info!(%name, port = local_port, "local service registered");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registered = self.state.lock().on_notification(
            PlatformNotification::LocalServiceRegistered { name },
            &self.registry,
        );
        for action in registered {
            if let DiscoveryAction::Emit(event) = action {
                let _ = events_tx.send(event);
            }
        }

        let (sink, notifications) = mpsc::unbounded_channel();
        if let Err(e) = self.backend.start_discovery(sink.clone()).await {
            self.backend.unregister_local_service().await;
            self.state.lock().clear(&self.registry);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(
            notifications,
            sink,
            self.state.clone(),
            self.registry.clone(),
            self.backend.clone(),
            events_tx,
            cancel.clone(),
        ));
        *self.pump.lock() = Some(Pump { cancel, task });
        Ok(events_rx)
    }

    /// Stop discovery, unregister, and forget every discovered peer. Idempotent.
    pub async fn stop_work(&self) {
        let Some(Pump { cancel, task }) = self.pump.lock().take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = task.await {
            warn!(error = %e, "discovery pump ended abnormally");
        }
        self.backend.stop_discovery().await;
        self.backend.unregister_local_service().await;
        self.state.lock().clear(&self.registry);
        info!("discovery stopped");
    }

    /// Trigger discovery passes and poll the registry until it has a peer.
    /// Ends early when `cancel` fires or discovery is stopped.
    pub async fn wait_for_peers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>, WaitCancelled> {
        let running = self
            .pump
            .lock()
            .as_ref()
            .map(|p| p.cancel.clone())
            .ok_or(WaitCancelled)?;
        loop {
            let peers = self.registry.all();
            if !peers.is_empty() {
                return Ok(peers);
            }
            if let Err(e) = self.backend.request_peers().await {
                debug!(error = %e, "discovery pass request failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitCancelled),
                _ = running.cancelled() => return Err(WaitCancelled),
                _ = tokio::time::sleep(self.peer_wait_interval) => {}
            }
        }
    }

    pub async fn connection_info(&self) -> ConnectionInfo {
        self.backend.connection_info().await
    }
}

async fn pump(
    mut notifications: mpsc::UnboundedReceiver<PlatformNotification>,
    sink: NotificationSink,
    state: Arc<Mutex<DiscoveryState>>,
    registry: Arc<PeerRegistry>,
    backend: Arc<dyn DiscoveryBackend>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    let mut resolutions = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = resolutions.join_next(), if !resolutions.is_empty() => {}
            n = notifications.recv() => {
                let Some(notification) = n else { break };
                debug!(?notification, "discovery notification");
                let actions = state.lock().on_notification(notification, &registry);
                for action in actions {
                    match action {
                        DiscoveryAction::Emit(event) => {
                            let _ = events.send(event);
                        }
                        DiscoveryAction::Resolve(service) => {
                            resolutions.spawn(resolve(service, backend.clone(), sink.clone()));
                        }
                    }
                }
            }
        }
    }
    resolutions.shutdown().await;
}

async fn resolve(service: ServiceInfo, backend: Arc<dyn DiscoveryBackend>, sink: NotificationSink) {
    let notification = match backend.resolve(&service).await {
        Ok(addr) => {
            debug!(name = %service.name, %addr, "service resolved");
            PlatformNotification::ServiceResolved { service, addr }
        }
        Err(e) => {
            warn!(name = %service.name, error = %e, "resolve failed");
            PlatformNotification::ResolveFailed {
                service,
                reason: e.to_string(),
            }
        }
    };
    let _ = sink.send(notification);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBackend;
    use std::net::SocketAddr;

    const TYPE: &str = "_lanmsg._tcp";

    fn controller(backend: Arc<FakeBackend>) -> (DiscoveryController, Arc<PeerRegistry>) {
        let registry = Arc::new(PeerRegistry::new());
        let c = DiscoveryController::new(
            backend,
            registry.clone(),
            TYPE,
            "lanmsg",
            Duration::from_millis(10),
        );
        (c, registry)
    }

    fn found(name: &str) -> PlatformNotification {
        PlatformNotification::ServiceFound(ServiceInfo {
            name: name.into(),
            service_type: format!("{TYPE}."),
        })
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 8080))
    }

    #[tokio::test]
    async fn found_service_is_resolved_and_reported() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_resolution("lanmsg-a", addr(2));
        let (c, registry) = controller(backend.clone());
        let mut events = c.start_work(8080).await.unwrap();
        let (name, port) = backend.registered().unwrap();
        assert!(name.starts_with("lanmsg-"));
        assert_eq!(port, 8080);
        assert_eq!(c.local_name(), Some(name));

        backend.push(found("lanmsg-a"));
        backend.push(found("lanmsg-a"));
        assert_eq!(
            events.recv().await.unwrap(),
            DiscoveryEvent::PeerFound(Peer::new("lanmsg-a", addr(2)))
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(backend.resolve_calls(), 1);
        c.stop_work().await;
    }

    #[tokio::test]
    async fn own_service_is_never_reported() {
        let backend = Arc::new(FakeBackend::default());
        let (c, registry) = controller(backend.clone());
        let mut events = c.start_work(8080).await.unwrap();
        let own = c.local_name().unwrap();
        backend.set_resolution(&own, addr(1));
        backend.push(found(&own));
        backend.push(PlatformNotification::DiscoveryFinished);
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::DiscoveryFinished);
        assert!(registry.is_empty());
        assert_eq!(backend.resolve_calls(), 0);
        c.stop_work().await;
    }

    #[tokio::test]
    async fn failed_resolution_is_dropped() {
        let backend = Arc::new(FakeBackend::default());
        let (c, registry) = controller(backend.clone());
        let mut events = c.start_work(8080).await.unwrap();
        backend.push(found("lanmsg-ghost"));
        backend.push(PlatformNotification::DiscoveryFinished);
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::DiscoveryFinished);
        // The failure notification comes back through the pump; a later event proves it was handled.
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.push(PlatformNotification::DiscoveryFinished);
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::DiscoveryFinished);
        assert!(registry.is_empty());
        c.stop_work().await;
    }

    #[tokio::test]
    async fn stop_work_clears_peers_and_ends_stream() {
        let backend = Arc::new(FakeBackend::default());
        let (c, registry) = controller(backend.clone());
        let mut events = c.start_work(8080).await.unwrap();
        backend.set_resolution("lanmsg-a", addr(2));
        backend.push(found("lanmsg-a"));
        assert!(matches!(events.recv().await, Some(DiscoveryEvent::PeerFound(_))));
        c.stop_work().await;
        c.stop_work().await;
        assert!(registry.is_empty());
        assert!(events.recv().await.is_none());
        assert!(backend.registered().is_none());
        assert!(!backend.is_discovering());
        assert!(!c.is_running());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let backend = Arc::new(FakeBackend::default());
        let (c, _) = controller(backend);
        let _events = c.start_work(8080).await.unwrap();
        assert!(matches!(
            c.start_work(8080).await,
            Err(DiscoveryError::AlreadyRunning)
        ));
        c.stop_work().await;
    }

    #[tokio::test]
    async fn wait_for_peers_polls_until_a_peer_appears() {
        let backend = Arc::new(FakeBackend::default());
        let (c, registry) = controller(backend.clone());
        let _events = c.start_work(8080).await.unwrap();
        let cancel = CancellationToken::new();
        let later = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                registry.upsert(Peer::new("lanmsg-a", addr(2)));
            })
        };
        let peers = c.wait_for_peers(&cancel).await.unwrap();
        later.await.unwrap();
        assert_eq!(peers.len(), 1);
        assert!(backend.request_calls() >= 2);
        c.stop_work().await;
    }

    #[tokio::test]
    async fn wait_for_peers_cancelled_by_token_or_stop() {
        let backend = Arc::new(FakeBackend::default());
        let (c, _) = controller(backend);
        let cancel = CancellationToken::new();
        assert_eq!(c.wait_for_peers(&cancel).await, Err(WaitCancelled));

        let _events = c.start_work(8080).await.unwrap();
        cancel.cancel();
        assert_eq!(c.wait_for_peers(&cancel).await, Err(WaitCancelled));

        let c = Arc::new(c);
        let waiting = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_for_peers(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        c.stop_work().await;
        assert_eq!(waiting.await.unwrap(), Err(WaitCancelled));
    }
}
