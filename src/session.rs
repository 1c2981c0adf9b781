//! One party's view of the relay: its keypair plus a table of live transfers.
//!
//! [`PartySession`] turns inbound [`ServerMessage`]s into state machine transitions
//! and hands back the [`ClientMessage`]s to send. It does no I/O, so the same logic
//! runs behind the CLI and in tests.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::keyring::KeyPair;
use crate::protocol::ClientMessage;
use crate::protocol::ServerMessage;
use crate::transfer::{IncomingTransfer, OutgoingTransfer, TransferId};
use crate::utils::{FileMetadata, PartyId};

/// What an inbound message meant for this party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(PartyId),
    KeyRegistered,
    IncomingRequest {
        transfer_id: TransferId,
        source: PartyId,
        file_name: String,
        sender_fingerprint: String,
    },
    Accepted(TransferId),
    Rejected(TransferId),
    DataReady {
        transfer_id: TransferId,
        needs_passphrase: bool,
    },
    Delivered(TransferId),
    RelayError {
        transfer_id: Option<TransferId>,
        message: String,
    },
}

pub struct PartySession {
    keypair: KeyPair,
    party_id: Option<PartyId>,
    registered: bool,
    outgoing: HashMap<TransferId, OutgoingTransfer>,
    incoming: HashMap<TransferId, IncomingTransfer>,
}

impl PartySession {
    pub fn new(keypair: KeyPair) -> Self {
        PartySession {
            keypair,
            party_id: None,
            registered: false,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    pub fn party_id(&self) -> Option<&PartyId> {
        self.party_id.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.registered && self.party_id.is_some()
    }

    pub fn outgoing(&self, id: TransferId) -> Option<&OutgoingTransfer> {
        self.outgoing.get(&id)
    }

    pub fn incoming(&self, id: TransferId) -> Option<&IncomingTransfer> {
        self.incoming.get(&id)
    }

    /// Forget every attempt that reached a terminal state.
    ///
    /// Runs whenever a new attempt starts, so a finished transfer stays visible
    /// until the next one begins and the tables never outgrow the live attempts.
    pub fn prune_finished(&mut self) -> usize {
        let before = self.outgoing.len() + self.incoming.len();
        self.outgoing.retain(|_, t| !t.state().is_terminal());
        self.incoming.retain(|_, t| !t.state().is_terminal());

        let pruned = before - self.outgoing.len() - self.incoming.len();
        if pruned > 0 {
            debug!("Pruned {} finished transfers", pruned);
        }
        pruned
    }

    /// `register-public-key` for our exported public key.
    pub fn register(&self) -> Result<ClientMessage> {
        Ok(ClientMessage::RegisterPublicKey {
            public_key: self.keypair.export_public()?,
        })
    }

    /// Start a new outgoing attempt. Fails with `NotReady` until the relay has
    /// assigned us an id and confirmed our key.
    pub fn request_transfer(&mut self, target: PartyId, metadata: FileMetadata) -> Result<(TransferId, ClientMessage)> {
        if self.party_id.is_none() {
            return Err(TransferError::NotReady("not connected to the relay"));
        }

        let mut transfer = OutgoingTransfer::new(target, metadata);
        let message = transfer.request(self.registered)?;
        let id = transfer.id();
        self.prune_finished();
        self.outgoing.insert(id, transfer);

        Ok((id, message))
    }

    pub fn accept(&mut self, id: TransferId) -> Result<ClientMessage> {
        let transfer = self.incoming.get_mut(&id).ok_or(TransferError::UnknownTransfer(id))?;
        let message = transfer.accept()?;
        transfer.await_data()?;
        Ok(message)
    }

    pub fn reject(&mut self, id: TransferId) -> Result<ClientMessage> {
        let transfer = self.incoming.get_mut(&id).ok_or(TransferError::UnknownTransfer(id))?;
        transfer.reject()
    }

    /// Encrypt `payload` for an accepted outgoing transfer.
    pub fn seal(&mut self, id: TransferId, payload: &[u8], passphrase: Option<&str>) -> Result<ClientMessage> {
        let transfer = self.outgoing.get_mut(&id).ok_or(TransferError::UnknownTransfer(id))?;
        transfer.seal(payload, passphrase)
    }

    /// Decrypt a received envelope. On success also returns the delivery receipt
    /// to send back to the sender.
    pub fn open(&mut self, id: TransferId, passphrase: Option<&str>) -> Result<(FileMetadata, Vec<u8>, ClientMessage)> {
        let transfer = self.incoming.get_mut(&id).ok_or(TransferError::UnknownTransfer(id))?;
        let (metadata, plaintext) = transfer.decrypt(&self.keypair, passphrase)?;
        let receipt = transfer.delivery_receipt()?;
        info!("Transfer {}: decrypted {} bytes", id, plaintext.len());
        Ok((metadata, plaintext, receipt))
    }

    /// Locally give up on an incoming transfer.
    pub fn abandon(&mut self, id: TransferId) {
        if let Some(transfer) = self.incoming.get_mut(&id) {
            transfer.abandon();
        }
    }

    /// Apply one message from the relay.
    ///
    /// An error here concerns a single transfer attempt (or a stray message) and
    /// never invalidates the session itself.
    pub fn handle(&mut self, message: ServerMessage) -> Result<SessionEvent> {
        let metadata = message.file_metadata();

        match message {
            ServerMessage::Connected { party_id } => {
                debug!("Relay assigned party id {}", party_id);
                self.party_id = Some(party_id.clone());
                Ok(SessionEvent::Connected(party_id))
            }

            ServerMessage::KeyRegistered { success } => {
                if !success {
                    return Err(TransferError::NotReady("relay refused our public key"));
                }
                self.registered = true;
                Ok(SessionEvent::KeyRegistered)
            }

            ServerMessage::TransferRequest {
                transfer_id,
                source_party,
                file_name,
                sender_public_key,
            } => {
                if self.incoming.contains_key(&transfer_id) {
                    return Err(TransferError::Protocol(format!(
                        "duplicate transfer request {}",
                        transfer_id
                    )));
                }
                let transfer = IncomingTransfer::new(transfer_id, source_party.clone(), file_name.clone(), sender_public_key);
                let sender_fingerprint = transfer.sender_fingerprint();
                self.prune_finished();
                self.incoming.insert(transfer_id, transfer);

                Ok(SessionEvent::IncomingRequest {
                    transfer_id,
                    source: source_party,
                    file_name,
                    sender_fingerprint,
                })
            }

            ServerMessage::TransferAccepted {
                transfer_id,
                target_party,
                recipient_public_key,
            } => {
                let transfer = self.outgoing_from(transfer_id, &target_party)?;
                transfer.on_accepted(&recipient_public_key)?;
                Ok(SessionEvent::Accepted(transfer_id))
            }

            ServerMessage::TransferRejected { transfer_id, target_party } => {
                let transfer = self.outgoing_from(transfer_id, &target_party)?;
                transfer.on_rejected()?;
                Ok(SessionEvent::Rejected(transfer_id))
            }

            ServerMessage::ReceiveData {
                transfer_id,
                source_party,
                encrypted_data,
                ..
            } => {
                // Unknown id and wrong source both mean the envelope belongs to no
                // attempt of ours.
                let transfer = match self.incoming.get_mut(&transfer_id) {
                    Some(transfer) if transfer.source() == &source_party => transfer,
                    _ => {
                        warn!("Dropping envelope for unknown transfer {}", transfer_id);
                        return Err(TransferError::OutOfOrder {
                            transfer: transfer_id,
                            event: "receive-data",
                            state: "unknown".to_string(),
                        });
                    }
                };

                let metadata = metadata.ok_or_else(|| TransferError::Protocol("missing file metadata".to_string()))?;
                transfer.receive_envelope(&encrypted_data, metadata)?;
                Ok(SessionEvent::DataReady {
                    transfer_id,
                    needs_passphrase: transfer.needs_passphrase(),
                })
            }

            ServerMessage::DeliveryConfirmed { transfer_id, target_party } => {
                let transfer = self.outgoing_from(transfer_id, &target_party)?;
                transfer.on_delivery_confirmed()?;
                Ok(SessionEvent::Delivered(transfer_id))
            }

            ServerMessage::Error { kind, reason, transfer_id } => {
                warn!("Relay error ({:?}): {}", kind, reason);
                if let Some(id) = transfer_id {
                    if let Some(transfer) = self.outgoing.get_mut(&id) {
                        transfer.on_relay_error();
                    }
                    if let Some(transfer) = self.incoming.get_mut(&id) {
                        transfer.abandon();
                    }
                }
                let message = kind.into_error(reason).status_message();
                Ok(SessionEvent::RelayError { transfer_id, message })
            }
        }
    }

    fn outgoing_from(&mut self, id: TransferId, peer: &PartyId) -> Result<&mut OutgoingTransfer> {
        match self.outgoing.get_mut(&id) {
            Some(transfer) if transfer.target() == peer => Ok(transfer),
            _ => Err(TransferError::UnknownTransfer(id)),
        }
    }
}
