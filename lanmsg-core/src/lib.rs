//! LanMsg core: envelope, wire codec, peer registry and discovery normalization.
//! Host-driven: no I/O; the daemon feeds platform notifications and performs the returned actions.

pub mod discovery;
pub mod envelope;
pub mod peer;
pub mod protocol;
pub mod wire;

pub use discovery::{
    DiscoveryAction, DiscoveryEvent, DiscoveryState, PeerCandidate, PlatformNotification,
    ServiceInfo,
};
pub use envelope::{RemoteError, TransferEnvelope, FAILURE_CODE};
pub use peer::{Peer, PeerRegistry, Upsert};
pub use protocol::{DiscoveryMessage, PROTOCOL_VERSION};
pub use wire::{
    decode_datagram, decode_envelope, encode_datagram, encode_envelope, DecodeError, EncodeError,
    MAX_DATAGRAM_LEN, MAX_ENVELOPE_LEN,
};
