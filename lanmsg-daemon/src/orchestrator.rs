//! Communicator: owns the host listener, discovery controller and sender for one device.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use lanmsg_core::{DiscoveryEvent, Peer, PeerRegistry, TransferEnvelope};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{
    ConnectionInfo, DiscoveryBackend, DiscoveryController, MulticastBackend,
};
use crate::error::CommError;
use crate::host::HostListener;
use crate::sender::{ClientSender, SendError};
use crate::transport::{TcpTransport, Transport};

const EVENT_BUFFER: usize = 64;

/// Which side of the group this device is on, inferred from connection info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Undetermined,
    /// Group owner; peers send to it.
    Host,
    Sender,
}

impl Role {
    fn infer(info: &ConnectionInfo) -> Self {
        match (info.group_formed, info.is_group_owner) {
            (false, _) => Role::Undetermined,
            (true, true) => Role::Host,
            (true, false) => Role::Sender,
        }
    }
}

/// Result of [`Communicator::send_to_all`].
#[derive(Debug)]
pub enum SendOutcome {
    NotStarted,
    NoPeers,
    Sent {
        /// Identities that received the envelope.
        delivered: Vec<String>,
        failed: Vec<SendError>,
    },
}

struct Session {
    cancel: CancellationToken,
    consumer: JoinHandle<()>,
}

pub struct Communicator {
    config: Config,
    registry: Arc<PeerRegistry>,
    host: HostListener,
    discovery: Arc<DiscoveryController>,
    sender: ClientSender,
    incoming_tx: mpsc::UnboundedSender<TransferEnvelope>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<TransferEnvelope>>>,
    events: broadcast::Sender<DiscoveryEvent>,
    peer_count: Arc<watch::Sender<usize>>,
    role: Arc<watch::Sender<Role>>,
    /// Serializes start/stop.
    session: tokio::sync::Mutex<Option<Session>>,
    run_token: Mutex<Option<CancellationToken>>,
}

impl Communicator {
    pub fn new(
        config: Config,
        backend: Arc<dyn DiscoveryBackend>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let registry = Arc::new(PeerRegistry::new());
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            host: HostListener::from_config(transport.clone(), &config),
            discovery: Arc::new(DiscoveryController::from_config(
                backend,
                registry.clone(),
                &config,
            )),
            sender: ClientSender::from_config(transport, &config),
            registry,
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            events,
            peer_count: Arc::new(watch::channel(0).0),
            role: Arc::new(watch::channel(Role::Undetermined).0),
            session: tokio::sync::Mutex::new(None),
            run_token: Mutex::new(None),
            config,
        }
    }

    /// Multicast discovery over real TCP.
    pub fn from_config(config: Config) -> Self {
        let backend = Arc::new(MulticastBackend::from_config(&config));
        Self::new(config, backend, Arc::new(TcpTransport))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the host listener, then discovery. A bind failure aborts startup. Idempotent.
    pub async fn start(&self) -> Result<(), CommError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }
        let local = self
            .host
            .start(self.config.host_addr(), self.incoming_tx.clone())
            .await?;
        let events = match self.discovery.start_work(local.port()).await {
            Ok(rx) => rx,
            Err(e) => {
                self.host.stop().await;
                return Err(e.into());
            }
        };
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume_events(
            events,
            self.registry.clone(),
            self.discovery.clone(),
            self.events.clone(),
            self.peer_count.clone(),
            self.role.clone(),
            cancel.clone(),
        ));
        *self.run_token.lock() = Some(cancel.clone());
        *session = Some(Session { cancel, consumer });
        info!(%local, name = ?self.discovery.local_name(), "communicator started");
        Ok(())
    }

    /// Tear everything down; every socket is closed on return. Idempotent.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        let Some(Session { cancel, consumer }) = session.take() else {
            return;
        };
        self.run_token.lock().take();
        cancel.cancel();
        if let Err(e) = consumer.await {
            warn!(error = %e, "event consumer ended abnormally");
        }
        self.host.stop().await;
        self.discovery.stop_work().await;
        self.registry.clear();
        self.peer_count.send_replace(0);
        self.role.send_replace(Role::Undetermined);
        info!("communicator stopped");
    }

    pub fn is_started(&self) -> bool {
        self.run_token.lock().is_some()
    }

    /// Send one envelope to every known peer concurrently. Per-peer failures are isolated.
    pub async fn send_to_all(&self, code: i32, payload: Option<String>) -> SendOutcome {
        if !self.is_started() {
            warn!("send requested before start");
            return SendOutcome::NotStarted;
        }
        let peers = self.registry.all();
        if peers.is_empty() {
            warn!("no peers to send to");
            return SendOutcome::NoPeers;
        }
        let mut envelope = TransferEnvelope::new(code, payload);
        if self.config.stamp_sender {
            if let Some(name) = self.discovery.local_name() {
                envelope = envelope.stamped(&name);
            }
        }
        let results = join_all(peers.iter().map(|p| self.sender.send(p, &envelope))).await;
        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (peer, res) in peers.iter().zip(results) {
            match res {
                Ok(()) => delivered.push(peer.identity.clone()),
                Err(e) => {
                    warn!(peer = %e.peer, error = %e.reason, "send failed");
                    failed.push(e);
                }
            }
        }
        info!(code, delivered = delivered.len(), failed = failed.len(), "broadcast done");
        SendOutcome::Sent { delivered, failed }
    }

    /// The incoming envelope stream. Only the first call gets it.
    pub fn incoming(&self) -> Option<mpsc::UnboundedReceiver<TransferEnvelope>> {
        self.incoming_rx.lock().take()
    }

    /// Block until discovery knows at least one peer.
    pub async fn wait_for_peers(&self) -> Result<Vec<Peer>, CommError> {
        let token = self.run_token.lock().clone().ok_or(CommError::NotStarted)?;
        Ok(self.discovery.wait_for_peers(&token).await?)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registry.all()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn watch_peer_count(&self) -> watch::Receiver<usize> {
        self.peer_count.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.host.local_addr()
    }

    pub fn local_name(&self) -> Option<String> {
        self.discovery.local_name()
    }
}

async fn consume_events(
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    registry: Arc<PeerRegistry>,
    discovery: Arc<DiscoveryController>,
    subscribers: broadcast::Sender<DiscoveryEvent>,
    peer_count: Arc<watch::Sender<usize>>,
    role: Arc<watch::Sender<Role>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            e = events.recv() => match e {
                Some(e) => e,
                None => break,
            },
        };
        match &event {
            DiscoveryEvent::PeerFound(peer) => {
                info!(peer = %peer.identity, addr = %peer.addr(), "peer found")
            }
            DiscoveryEvent::PeerLost(identity) => info!(peer = %identity, "peer lost"),
            DiscoveryEvent::ConnectionStateChanged(identity, connected) => {
                info!(peer = %identity, connected, "connection changed");
                let inferred = Role::infer(&discovery.connection_info().await);
                if role.send_replace(inferred) != inferred {
                    info!(role = ?inferred, "role changed");
                }
            }
            DiscoveryEvent::DiscoveryFinished => debug!("discovery finished"),
        }
        peer_count.send_replace(registry.len());
        let _ = subscribers.send(event);
    }
}
