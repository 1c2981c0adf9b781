use thiserror::Error;

use crate::transfer::TransferId;

/// Every failure a party can hit while running a transfer attempt.
///
/// All variants are recoverable at transfer granularity: they end the attempt they
/// belong to and leave the keypair and any other transfer untouched.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid public key: {0}")]
    KeyImport(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Deliberately carries nothing: wrong key, wrong passphrase and corrupted
    /// ciphertext must look identical to the caller.
    #[error("decryption failed")]
    Decryption,

    #[error("Not ready: {0}")]
    NotReady(&'static str),

    #[error("Transfer {transfer} cannot accept {event} while {state}")]
    OutOfOrder {
        transfer: TransferId,
        event: &'static str,
        state: String,
    },

    #[error("Unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("Peer not ready: {0}")]
    PeerNotReady(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: usize },

    /// A relay error that ended one of our transfers, already phrased for the user.
    #[error("{0}")]
    Relay(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransferError {
    /// Short status line suitable for showing to a user.
    pub fn status_message(&self) -> String {
        match self {
            TransferError::KeyGeneration(_) => "Error generating encryption keys".to_string(),
            TransferError::KeyImport(_) => "The peer sent an unusable public key".to_string(),
            TransferError::Encryption(_) => "Error encrypting file".to_string(),
            TransferError::Decryption => "Error decrypting file".to_string(),
            TransferError::NotReady(_) => "Encryption keys not ready. Please wait...".to_string(),
            TransferError::OutOfOrder { .. } | TransferError::UnknownTransfer(_) => {
                "Ignored an unexpected message from the relay".to_string()
            }
            TransferError::TargetUnavailable(reason) | TransferError::PeerNotReady(reason) => {
                format!("Error: {}", reason)
            }
            TransferError::Protocol(_) | TransferError::Serialization(_) => {
                "Received a malformed message from the relay".to_string()
            }
            TransferError::PayloadTooLarge { size, limit } => {
                format!("File is too large to send ({} bytes, at most {} bytes)", size, limit)
            }
            TransferError::Relay(message) => message.clone(),
            TransferError::Io(e) => format!("Connection error: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
