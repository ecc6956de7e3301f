//! Peer discovery: the platform capability seam and the controller that normalizes it.

mod controller;
mod multicast;

pub use controller::{DiscoveryController, WaitCancelled};
pub use multicast::{MulticastBackend, MULTICAST_GROUP};

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use lanmsg_core::wire::EncodeError;
use lanmsg_core::{PlatformNotification, ServiceInfo};
use tokio::sync::mpsc;

/// Where a backend pushes raw notifications. Send errors mean discovery was stopped.
pub type NotificationSink = mpsc::UnboundedSender<PlatformNotification>;

/// Group topology reported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub group_formed: bool,
    pub is_group_owner: bool,
    /// None when unknown or when this device is the owner.
    pub group_owner_address: Option<IpAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("register service {name}: {reason}")]
    Registration { name: String, reason: String },
    #[error("resolve {service}: {reason}")]
    Resolution { service: String, reason: String },
    #[error("discovery not running")]
    NotRunning,
    #[error("discovery already running")]
    AlreadyRunning,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Platform discovery capability (mDNS/NSD, Wi-Fi Direct, UDP multicast...).
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Advertise this device. Returns the name actually registered.
    async fn register_local_service(&self, name: &str, port: u16) -> Result<String, DiscoveryError>;

    async fn unregister_local_service(&self);

    async fn start_discovery(&self, sink: NotificationSink) -> Result<(), DiscoveryError>;

    async fn stop_discovery(&self);

    /// Trigger one discovery pass.
    async fn request_peers(&self) -> Result<(), DiscoveryError>;

    async fn resolve(&self, service: &ServiceInfo) -> Result<SocketAddr, DiscoveryError>;

    async fn connection_info(&self) -> ConnectionInfo;
}
