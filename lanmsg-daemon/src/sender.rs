//! Client sender: push one envelope to one peer over a fresh connection.

use std::sync::Arc;
use std::time::Duration;

use lanmsg_core::wire::{encode_envelope, EncodeError};
use lanmsg_core::{Peer, TransferEnvelope};
use tracing::debug;

use crate::config::Config;
use crate::transport::{ConnectError, ConnectOptions, ConnectionError, Transport};

/// Why a send failed.
#[derive(Debug, thiserror::Error)]
pub enum SendFailure {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Write(ConnectionError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

impl From<ConnectionError> for SendFailure {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Timeout(d) => SendFailure::Timeout(d),
            ConnectionError::Encode(e) => SendFailure::Encode(e),
            other => SendFailure::Write(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("send to {peer}: {reason}")]
pub struct SendError {
    /// Identity of the peer.
    pub peer: String,
    #[source]
    pub reason: SendFailure,
}

#[derive(Clone)]
pub struct ClientSender {
    transport: Arc<dyn Transport>,
    opts: ConnectOptions,
    io_timeout: Duration,
}

impl ClientSender {
    pub fn new(transport: Arc<dyn Transport>, opts: ConnectOptions, io_timeout: Duration) -> Self {
        Self {
            transport,
            opts,
            io_timeout,
        }
    }

    pub fn from_config(transport: Arc<dyn Transport>, cfg: &Config) -> Self {
        Self::new(transport, ConnectOptions::from_config(cfg), cfg.io_timeout())
    }

    /// Connect, write the envelope, close. The connection is closed on every path.
    pub async fn send(&self, peer: &Peer, envelope: &TransferEnvelope) -> Result<(), SendError> {
        let fail = |reason: SendFailure| SendError {
            peer: peer.identity.clone(),
            reason,
        };
        let bytes = encode_envelope(envelope).map_err(|e| fail(e.into()))?;
        let mut conn = self
            .transport
            .connect(peer.addr(), &self.opts)
            .await
            .map_err(|e| fail(e.into()))?;
        let res = conn.write_encoded(&bytes, self.io_timeout).await;
        conn.close().await;
        res.map_err(|e| fail(e.into()))?;
        debug!(peer = %peer.identity, addr = %peer.addr(), code = envelope.code, "envelope sent");
        Ok(())
    }
}
