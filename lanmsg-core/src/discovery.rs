//! Discovery normalization: platform notifications in, registry updates and events out.
//! No I/O; the host runs resolutions and forwards their results back as notifications.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::peer::{Peer, PeerRegistry, Upsert};

/// A service advertised on the network, not yet resolved to an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInfo {
    pub name: String,
    pub service_type: String,
}

/// One entry of a full peer list (Wi-Fi Direct style). `addr` is None until resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub identity: String,
    pub addr: Option<SocketAddr>,
}

/// Raw notification from the platform discovery capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformNotification {
    LocalServiceRegistered { name: String },
    PeersChanged(Vec<PeerCandidate>),
    ServiceFound(ServiceInfo),
    ServiceResolved { service: ServiceInfo, addr: SocketAddr },
    ResolveFailed { service: ServiceInfo, reason: String },
    ServiceLost { name: String },
    ConnectionChanged { identity: String, connected: bool },
    DiscoveryFinished,
}

/// Normalized discovery event consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerFound(Peer),
    PeerLost(String),
    ConnectionStateChanged(String, bool),
    DiscoveryFinished,
}

/// What the host must do after a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryAction {
    Emit(DiscoveryEvent),
    /// Fetch address/port, then report `ServiceResolved` or `ResolveFailed`.
    Resolve(ServiceInfo),
}

/// Deduplicating discovery state. The registry is the source of truth for known peers;
/// this keeps the local identity, in-flight resolutions and the identities it discovered.
#[derive(Debug)]
pub struct DiscoveryState {
    service_type: String,
    name_prefix: String,
    local_name: Option<String>,
    pending: HashSet<String>,
    discovered: HashSet<String>,
    listed: HashSet<String>,
}

impl DiscoveryState {
    pub fn new(service_type: impl Into<String>, name_prefix: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            name_prefix: name_prefix.into(),
            local_name: None,
            pending: HashSet::new(),
            discovered: HashSet::new(),
            listed: HashSet::new(),
        }
    }

    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Identities discovered since the last [`clear`](Self::clear).
    pub fn discovered(&self) -> impl Iterator<Item = &str> {
        self.discovered.iter().map(String::as_str)
    }

    pub fn pending_resolutions(&self) -> usize {
        self.pending.len()
    }

    fn is_self(&self, identity: &str) -> bool {
        self.local_name.as_deref() == Some(identity)
    }

    /// DNS-SD reports the type with a trailing dot.
    fn type_matches(&self, service_type: &str) -> bool {
        service_type.trim_end_matches('.') == self.service_type.trim_end_matches('.')
    }

    /// A resolution result is taken only for a resolution still in flight or a peer we
    /// already hold; anything else was lost in the meantime or never asked for.
    fn expects(&self, service: &ServiceInfo, registry: &PeerRegistry) -> bool {
        if self.is_self(&service.name) {
            return false;
        }
        let listed = self.listed.contains(&service.name);
        if !listed
            && (!self.type_matches(&service.service_type)
                || !service.name.starts_with(&self.name_prefix))
        {
            return false;
        }
        self.pending.contains(&service.name) || registry.contains(&service.name)
    }

    fn found(&mut self, peer: Peer, registry: &PeerRegistry) -> Option<DiscoveryAction> {
        self.pending.remove(&peer.identity);
        self.discovered.insert(peer.identity.clone());
        match registry.upsert(peer.clone()) {
            Upsert::Inserted => Some(DiscoveryAction::Emit(DiscoveryEvent::PeerFound(peer))),
            Upsert::Updated | Upsert::Unchanged => None,
        }
    }

    fn lost(&mut self, identity: &str, registry: &PeerRegistry) -> Option<DiscoveryAction> {
        self.discovered.remove(identity);
        self.pending.remove(identity);
        registry
            .remove(identity)
            .map(|_| DiscoveryAction::Emit(DiscoveryEvent::PeerLost(identity.to_string())))
    }

    pub fn on_notification(
        &mut self,
        notification: PlatformNotification,
        registry: &PeerRegistry,
    ) -> Vec<DiscoveryAction> {
        let mut actions = Vec::new();
        match notification {
            PlatformNotification::LocalServiceRegistered { name } => {
                // We may have seen our own service before registration completed.
                self.listed.remove(&name);
                actions.extend(self.lost(&name, registry));
                self.local_name = Some(name);
            }
            PlatformNotification::ServiceFound(service) => {
                if !self.type_matches(&service.service_type)
                    || self.is_self(&service.name)
                    || !service.name.starts_with(&self.name_prefix)
                {
                    return actions;
                }
                if registry.contains(&service.name) || !self.pending.insert(service.name.clone()) {
                    return actions;
                }
                actions.push(DiscoveryAction::Resolve(service));
            }
            PlatformNotification::ServiceResolved { service, addr } => {
                if !self.expects(&service, registry) {
                    return actions;
                }
                actions.extend(self.found(Peer::new(service.name, addr), registry));
            }
            PlatformNotification::ResolveFailed { service, .. } => {
                self.pending.remove(&service.name);
            }
            PlatformNotification::ServiceLost { name } => {
                self.listed.remove(&name);
                actions.extend(self.lost(&name, registry));
            }
            PlatformNotification::PeersChanged(candidates) => {
                let mut current = HashSet::new();
                for candidate in candidates {
                    if self.is_self(&candidate.identity) {
                        continue;
                    }
                    current.insert(candidate.identity.clone());
                    match candidate.addr {
                        Some(addr) => {
                            actions.extend(self.found(Peer::new(candidate.identity, addr), registry))
                        }
                        None => {
                            if !registry.contains(&candidate.identity)
                                && self.pending.insert(candidate.identity.clone())
                            {
                                actions.push(DiscoveryAction::Resolve(ServiceInfo {
                                    name: candidate.identity,
                                    service_type: self.service_type.clone(),
                                }));
                            }
                        }
                    }
                }
                let gone: Vec<String> = self.listed.difference(&current).cloned().collect();
                for identity in gone {
                    actions.extend(self.lost(&identity, registry));
                }
                self.listed = current;
            }
            PlatformNotification::ConnectionChanged {
                identity,
                connected,
            } => {
                if registry.mark_connected(&identity, connected) {
                    actions.push(DiscoveryAction::Emit(
                        DiscoveryEvent::ConnectionStateChanged(identity, connected),
                    ));
                }
            }
            PlatformNotification::DiscoveryFinished => {
                actions.push(DiscoveryAction::Emit(DiscoveryEvent::DiscoveryFinished));
            }
        }
        actions
    }

    /// Forget everything discovered: drop those peers from the registry and reset local state.
    pub fn clear(&mut self, registry: &PeerRegistry) {
        for identity in self.discovered.drain() {
            registry.remove(&identity);
        }
        self.pending.clear();
        self.listed.clear();
        self.local_name = None;
    }
}
