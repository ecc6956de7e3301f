//! LAN discovery backend: UDP multicast beacons, query/reply, liveness timeout.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lanmsg_core::wire::{decode_datagram, encode_datagram, MAX_DATAGRAM_LEN};
use lanmsg_core::{DiscoveryMessage, PlatformNotification, ServiceInfo, PROTOCOL_VERSION};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ConnectionInfo, DiscoveryBackend, DiscoveryError, NotificationSink};
use crate::config::Config;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

struct Seen {
    addr: SocketAddr,
    last_seen: Instant,
    /// A Reply from this service reached us.
    connected: bool,
}

/// What one inbound datagram produced.
#[derive(Debug, Default, PartialEq)]
struct Inbound {
    notifications: Vec<PlatformNotification>,
    /// Unicast back to the sender.
    reply: Option<DiscoveryMessage>,
}

/// Socket-free bookkeeping for services seen on the group.
struct Tracker {
    service_type: String,
    local: Option<(String, u16)>,
    seen: HashMap<String, Seen>,
}

impl Tracker {
    fn new(service_type: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            local: None,
            seen: HashMap::new(),
        }
    }

    fn service(&self, name: &str) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            service_type: self.service_type.clone(),
        }
    }

    fn announce(&self) -> Option<DiscoveryMessage> {
        self.local.as_ref().map(|(name, port)| DiscoveryMessage::Announce {
            protocol_version: PROTOCOL_VERSION,
            service_type: self.service_type.clone(),
            name: name.clone(),
            port: *port,
        })
    }

    fn reply(&self) -> Option<DiscoveryMessage> {
        self.local.as_ref().map(|(name, port)| DiscoveryMessage::Reply {
            protocol_version: PROTOCOL_VERSION,
            service_type: self.service_type.clone(),
            name: name.clone(),
            port: *port,
        })
    }

    fn query(&self) -> DiscoveryMessage {
        DiscoveryMessage::Query {
            protocol_version: PROTOCOL_VERSION,
            service_type: self.service_type.clone(),
            name: self
                .local
                .as_ref()
                .map(|(name, _)| name.clone())
                .unwrap_or_default(),
        }
    }

    fn on_message(&mut self, msg: DiscoveryMessage, from: SocketAddr, now: Instant) -> Inbound {
        let mut out = Inbound::default();
        if msg.protocol_version() != PROTOCOL_VERSION || msg.service_type() != self.service_type {
            return out;
        }
        if self.local.as_ref().map(|(n, _)| n.as_str()) == Some(msg.name()) {
            return out;
        }
        match msg {
            DiscoveryMessage::Announce { name, port, .. } => {
                let addr = SocketAddr::new(from.ip(), port);
                match self.seen.get_mut(&name) {
                    Some(s) => {
                        s.last_seen = now;
                        if s.addr != addr {
                            s.addr = addr;
                            out.notifications.push(PlatformNotification::ServiceResolved {
                                service: self.service(&name),
                                addr,
                            });
                        }
                    }
                    None => {
                        self.seen.insert(
                            name.clone(),
                            Seen {
                                addr,
                                last_seen: now,
                                connected: false,
                            },
                        );
                        out.notifications
                            .push(PlatformNotification::ServiceFound(self.service(&name)));
                        // New neighbour: answer so it learns about us without waiting a beacon.
                        out.reply = self.reply();
                    }
                }
            }
            DiscoveryMessage::Query { .. } => {
                out.reply = self.reply();
            }
            DiscoveryMessage::Reply { name, port, .. } => {
                let addr = SocketAddr::new(from.ip(), port);
                let service = self.service(&name);
                let entry = self.seen.entry(name.clone()).or_insert(Seen {
                    addr,
                    last_seen: now,
                    connected: false,
                });
                let moved = entry.addr != addr;
                entry.addr = addr;
                entry.last_seen = now;
                let newly_connected = !entry.connected;
                entry.connected = true;
                if newly_connected {
                    // Unsolicited: report the service before its address.
                    out.notifications
                        .push(PlatformNotification::ServiceFound(service.clone()));
                }
                if newly_connected || moved {
                    out.notifications
                        .push(PlatformNotification::ServiceResolved { service, addr });
                }
                if newly_connected {
                    out.notifications.push(PlatformNotification::ConnectionChanged {
                        identity: name,
                        connected: true,
                    });
                }
            }
        }
        out
    }

    /// Drop services silent for longer than `timeout`.
    fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<PlatformNotification> {
        let expired: Vec<String> = self
            .seen
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= timeout)
            .map(|(name, _)| name.clone())
            .collect();
        let mut out = Vec::new();
        for name in expired {
            if let Some(s) = self.seen.remove(&name) {
                if s.connected {
                    out.push(PlatformNotification::ConnectionChanged {
                        identity: name.clone(),
                        connected: false,
                    });
                }
                out.push(PlatformNotification::ServiceLost { name });
            }
        }
        out
    }

    fn resolve(&self, name: &str) -> Option<SocketAddr> {
        self.seen.get(name).map(|s| s.addr)
    }

    /// Owner is the smallest live name, self included.
    fn connection_info(&self) -> ConnectionInfo {
        let local = self.local.as_ref().map(|(n, _)| n.as_str());
        let owner = self
            .seen
            .keys()
            .map(String::as_str)
            .chain(local)
            .min();
        let Some(owner) = owner else {
            return ConnectionInfo::default();
        };
        ConnectionInfo {
            group_formed: !self.seen.is_empty(),
            is_group_owner: Some(owner) == local,
            group_owner_address: self.seen.get(owner).map(|s| s.addr.ip()),
        }
    }
}

struct Running {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

/// Discovery over UDP multicast on group 239.255.60.60.
pub struct MulticastBackend {
    discovery_port: u16,
    beacon_interval: Duration,
    peer_timeout: Duration,
    tracker: Arc<Mutex<Tracker>>,
    running: Mutex<Option<Running>>,
}

impl MulticastBackend {
    pub fn new(discovery_port: u16, service_type: &str) -> Self {
        Self::with_timing(discovery_port, service_type, BEACON_INTERVAL, PEER_TIMEOUT)
    }

    pub fn with_timing(
        discovery_port: u16,
        service_type: &str,
        beacon_interval: Duration,
        peer_timeout: Duration,
    ) -> Self {
        Self {
            discovery_port,
            beacon_interval,
            peer_timeout,
            tracker: Arc::new(Mutex::new(Tracker::new(service_type))),
            running: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.discovery_port, &cfg.service_type)
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::from((MULTICAST_GROUP, self.discovery_port))
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.running.lock().as_ref().map(|r| r.socket.clone())
    }
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port)).await?;
    socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

#[async_trait]
impl DiscoveryBackend for MulticastBackend {
    async fn register_local_service(&self, name: &str, port: u16) -> Result<String, DiscoveryError> {
        if name.is_empty() {
            return Err(DiscoveryError::Registration {
                name: name.to_string(),
                reason: "empty name".to_string(),
            });
        }
        self.tracker.lock().local = Some((name.to_string(), port));
        Ok(name.to_string())
    }

    async fn unregister_local_service(&self) {
        self.tracker.lock().local = None;
    }

    async fn start_discovery(&self, sink: NotificationSink) -> Result<(), DiscoveryError> {
        if self.running.lock().is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }
        let socket = Arc::new(make_multicast_socket(self.discovery_port).await?);
        info!(port = self.discovery_port, group = %MULTICAST_GROUP, "multicast discovery started");
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(beacon_loop(
            socket.clone(),
            self.tracker.clone(),
            self.group_addr(),
            self.beacon_interval,
            cancel.clone(),
        ));
        tasks.spawn(recv_loop(
            socket.clone(),
            self.tracker.clone(),
            sink.clone(),
            cancel.clone(),
        ));
        tasks.spawn(peer_timeout_loop(
            self.tracker.clone(),
            sink,
            self.beacon_interval,
            self.peer_timeout,
            cancel.clone(),
        ));
        *self.running.lock() = Some(Running {
            socket,
            cancel,
            tasks,
        });
        Ok(())
    }

    async fn stop_discovery(&self) {
        let Some(Running {
            cancel, mut tasks, ..
        }) = self.running.lock().take()
        else {
            return;
        };
        cancel.cancel();
        while tasks.join_next().await.is_some() {}
        self.tracker.lock().seen.clear();
        info!("multicast discovery stopped");
    }

    async fn request_peers(&self) -> Result<(), DiscoveryError> {
        let socket = self.socket().ok_or(DiscoveryError::NotRunning)?;
        let query = encode_datagram(&self.tracker.lock().query())?;
        socket.send_to(&query, self.group_addr()).await?;
        trace!("discovery query sent");
        Ok(())
    }

    async fn resolve(&self, service: &ServiceInfo) -> Result<SocketAddr, DiscoveryError> {
        self.tracker
            .lock()
            .resolve(&service.name)
            .ok_or_else(|| DiscoveryError::Resolution {
                service: service.name.clone(),
                reason: "service no longer announced".to_string(),
            })
    }

    async fn connection_info(&self) -> ConnectionInfo {
        self.tracker.lock().connection_info()
    }
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    tracker: Arc<Mutex<Tracker>>,
    dest: SocketAddr,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let beacon = tracker.lock().announce();
        if let Some(beacon) = beacon {
            match encode_datagram(&beacon) {
                Ok(frame) => {
                    if let Err(e) = socket.send_to(&frame, dest).await {
                        debug!(error = %e, "beacon send failed");
                    }
                }
                Err(e) => warn!(error = %e, "beacon encode failed"),
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    tracker: Arc<Mutex<Tracker>>,
    sink: NotificationSink,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN as usize];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "discovery recv error");
                    continue;
                }
            },
        };
        let msg = match decode_datagram(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(%from, error = %e, "ignoring datagram");
                continue;
            }
        };
        let inbound = tracker.lock().on_message(msg, from, Instant::now());
        for notification in inbound.notifications {
            if sink.send(notification).is_err() {
                return;
            }
        }
        if let Some(reply) = inbound.reply {
            match encode_datagram(&reply) {
                Ok(frame) => {
                    if let Err(e) = socket.send_to(&frame, from).await {
                        debug!(%from, error = %e, "reply send failed");
                    }
                }
                Err(e) => warn!(error = %e, "reply encode failed"),
            }
        }
    }
}

async fn peer_timeout_loop(
    tracker: Arc<Mutex<Tracker>>,
    sink: NotificationSink,
    every: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        let expired = tracker.lock().sweep(Instant::now(), timeout);
        for notification in expired {
            debug!(?notification, "service timed out");
            if sink.send(notification).is_err() {
                return;
            }
        }
    }
}
