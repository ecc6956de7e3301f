//! LAN discovery datagrams exchanged by the multicast discovery backend.

use serde::{Deserialize, Serialize};

/// Current discovery protocol version. Datagrams with another version are ignored.
pub const PROTOCOL_VERSION: u8 = 1;

/// All discovery datagram types. Encoding is bincode (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    /// Periodic multicast presence: service type, instance name and host port.
    Announce {
        protocol_version: u8,
        service_type: String,
        name: String,
        port: u16,
    },
    /// Ask every live instance of `service_type` to reply immediately.
    Query {
        protocol_version: u8,
        service_type: String,
        name: String,
    },
    /// Unicast answer to a Query.
    Reply {
        protocol_version: u8,
        service_type: String,
        name: String,
        port: u16,
    },
}

impl DiscoveryMessage {
    pub fn protocol_version(&self) -> u8 {
        match self {
            Self::Announce {
                protocol_version, ..
            }
            | Self::Query {
                protocol_version, ..
            }
            | Self::Reply {
                protocol_version, ..
            } => *protocol_version,
        }
    }

    pub fn service_type(&self) -> &str {
        match self {
            Self::Announce { service_type, .. }
            | Self::Query { service_type, .. }
            | Self::Reply { service_type, .. } => service_type,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Announce { name, .. } | Self::Query { name, .. } | Self::Reply { name, .. } => {
                name
            }
        }
    }
}
