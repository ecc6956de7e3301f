//! LanMsg daemon: LAN peer discovery, host listener and one-shot envelope transfer over TCP.

pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod orchestrator;
pub mod sender;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::CommError;
pub use orchestrator::{Communicator, Role, SendOutcome};
