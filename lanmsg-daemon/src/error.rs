//! Communicator error types.

use crate::discovery::{DiscoveryError, WaitCancelled};
use crate::transport::BindError;

/// Errors surfaced by [`Communicator`](crate::Communicator) calls.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// The operation needs a started communicator.
    #[error("communicator not started")]
    NotStarted,

    /// The host port could not be bound. Fatal for `start`.
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Cancelled(#[from] WaitCancelled),
}
