//! Messages exchanged with the relay.
//!
//! Both directions are JSON objects tagged by `event`, with camelCase fields. The
//! relay treats `encryptedData` as opaque text and never sees a private key or a
//! passphrase.

use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::transfer::TransferId;
use crate::utils::{FileMetadata, PartyId};

/// Party → relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    RegisterPublicKey { public_key: String },

    #[serde(rename_all = "camelCase")]
    RequestTransfer {
        transfer_id: TransferId,
        target_party: PartyId,
        file_name: String,
    },

    #[serde(rename_all = "camelCase")]
    AcceptTransfer {
        transfer_id: TransferId,
        source_party: PartyId,
    },

    #[serde(rename_all = "camelCase")]
    RejectTransfer {
        transfer_id: TransferId,
        source_party: PartyId,
    },

    #[serde(rename_all = "camelCase")]
    EncryptedData {
        transfer_id: TransferId,
        target_party: PartyId,
        encrypted_data: String,
        original_name: String,
        file_type: String,
        file_extension: String,
    },

    #[serde(rename_all = "camelCase")]
    ConfirmDelivery {
        transfer_id: TransferId,
        source_party: PartyId,
    },
}

/// Relay → party.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected { party_id: PartyId },

    KeyRegistered { success: bool },

    #[serde(rename_all = "camelCase")]
    TransferRequest {
        transfer_id: TransferId,
        source_party: PartyId,
        file_name: String,
        sender_public_key: String,
    },

    #[serde(rename_all = "camelCase")]
    TransferAccepted {
        transfer_id: TransferId,
        target_party: PartyId,
        recipient_public_key: String,
    },

    #[serde(rename_all = "camelCase")]
    TransferRejected {
        transfer_id: TransferId,
        target_party: PartyId,
    },

    #[serde(rename_all = "camelCase")]
    ReceiveData {
        transfer_id: TransferId,
        source_party: PartyId,
        encrypted_data: String,
        original_name: String,
        file_type: String,
        file_extension: String,
    },

    #[serde(rename_all = "camelCase")]
    DeliveryConfirmed {
        transfer_id: TransferId,
        target_party: PartyId,
    },

    #[serde(rename_all = "camelCase")]
    Error {
        kind: RelayErrorKind,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<TransferId>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RelayErrorKind {
    TargetUnavailable,
    PeerNotReady,
    Other,
}

impl RelayErrorKind {
    pub fn into_error(self, reason: String) -> TransferError {
        match self {
            RelayErrorKind::TargetUnavailable => TransferError::TargetUnavailable(reason),
            RelayErrorKind::PeerNotReady => TransferError::PeerNotReady(reason),
            RelayErrorKind::Other => TransferError::Protocol(reason),
        }
    }
}

impl ServerMessage {
    pub fn error(kind: RelayErrorKind, reason: &str, transfer_id: Option<TransferId>) -> Self {
        ServerMessage::Error {
            kind,
            reason: reason.to_string(),
            transfer_id,
        }
    }

    /// File metadata carried next to a `receive-data` envelope.
    pub fn file_metadata(&self) -> Option<FileMetadata> {
        match self {
            ServerMessage::ReceiveData {
                original_name,
                file_type,
                file_extension,
                ..
            } => Some(FileMetadata {
                original_name: original_name.clone(),
                mime_type: file_type.clone(),
                extension: file_extension.clone(),
            }),
            _ => None,
        }
    }
}
