//! Encoding: bincode with a size limit and trailing-byte rejection.
//! One envelope per TCP connection and one discovery message per datagram, so no length prefix.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::TransferEnvelope;
use crate::protocol::DiscoveryMessage;

/// Largest encoded envelope accepted on either side.
pub const MAX_ENVELOPE_LEN: u64 = 1024 * 1024; // 1 MiB
/// Largest discovery datagram.
pub const MAX_DATAGRAM_LEN: u64 = 1024;

fn codec(limit: u64) -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .reject_trailing_bytes()
}

fn encode<T: Serialize>(value: &T, limit: u64) -> Result<Vec<u8>, EncodeError> {
    codec(limit).serialize(value).map_err(|e| {
        if matches!(*e, bincode::ErrorKind::SizeLimit) {
            EncodeError::TooLarge
        } else {
            EncodeError::Encode(e)
        }
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8], limit: u64) -> Result<T, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Truncated);
    }
    if bytes.len() as u64 > limit {
        return Err(DecodeError::TooLarge);
    }
    codec(limit).deserialize(bytes).map_err(|e| {
        let truncated = matches!(
            &*e,
            bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
        );
        if truncated {
            DecodeError::Truncated
        } else if matches!(*e, bincode::ErrorKind::SizeLimit) {
            DecodeError::TooLarge
        } else {
            DecodeError::Malformed(e)
        }
    })
}

/// Encode an envelope for a single write on a fresh connection.
pub fn encode_envelope(envelope: &TransferEnvelope) -> Result<Vec<u8>, EncodeError> {
    encode(envelope, MAX_ENVELOPE_LEN)
}

/// Decode exactly one envelope; the whole buffer must be consumed.
pub fn decode_envelope(bytes: &[u8]) -> Result<TransferEnvelope, DecodeError> {
    decode(bytes, MAX_ENVELOPE_LEN)
}

pub fn encode_datagram(msg: &DiscoveryMessage) -> Result<Vec<u8>, EncodeError> {
    encode(msg, MAX_DATAGRAM_LEN)
}

pub fn decode_datagram(bytes: &[u8]) -> Result<DiscoveryMessage, DecodeError> {
    decode(bytes, MAX_DATAGRAM_LEN)
}

/// Error encoding an envelope or datagram (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("message too large")]
    TooLarge,
}

/// Error decoding an envelope or datagram (truncated, too large, or malformed input).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("input truncated")]
    Truncated,
    #[error("message too large")]
    TooLarge,
    #[error("malformed message: {0}")]
    Malformed(#[source] bincode::Error),
}
