//! Per-transfer state machines for both ends of a transfer attempt.
//!
//! Sender:   Idle → RequestSent → {Accepted, Rejected, Errored}
//!           Accepted → Encrypting → Sent → Complete
//! Receiver: RequestReceived → {AcceptSent, RejectSent}
//!           AcceptSent → AwaitingData → Decrypting → {Complete, Failed}
//!
//! Every transition checks the current state first. A message that arrives in the
//! wrong state is refused with [`TransferError::OutOfOrder`] and leaves the transfer
//! exactly as it was. Terminal states accept nothing further.

use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cryptography;
use crate::envelope::EncryptionEnvelope;
use crate::error::{Result, TransferError};
use crate::keyring::{KeyPair, PublicKeyHandle};
use crate::protocol::ClientMessage;
use crate::utils::{FileMetadata, PartyId};
use crate::{MAX_PASSPHRASE_ATTEMPTS, MAX_PAYLOAD_SIZE};

/// Identifies one transfer attempt across every message that belongs to it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        TransferId(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    RequestSent,
    Accepted,
    Rejected,
    Errored,
    Encrypting,
    Sent,
    Complete,
}

impl SenderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SenderState::Rejected | SenderState::Errored | SenderState::Complete)
    }
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    RequestReceived,
    AcceptSent,
    RejectSent,
    AwaitingData,
    Decrypting,
    Complete,
    Failed,
}

impl ReceiverState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReceiverState::RejectSent | ReceiverState::Complete | ReceiverState::Failed
        )
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Short SHA-256 fingerprint of a PEM public key, for out-of-band comparison.
pub fn key_fingerprint(public_key_pem: &str) -> String {
    let digest = Sha256::digest(public_key_pem.trim().as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Sending side of one transfer attempt.
#[derive(Debug)]
pub struct OutgoingTransfer {
    id: TransferId,
    target: PartyId,
    metadata: FileMetadata,
    state: SenderState,
    recipient_key: Option<PublicKeyHandle>,
}

impl OutgoingTransfer {
    pub fn new(target: PartyId, metadata: FileMetadata) -> Self {
        OutgoingTransfer {
            id: TransferId::new(),
            target,
            metadata,
            state: SenderState::Idle,
            recipient_key: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn target(&self) -> &PartyId {
        &self.target
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    fn expect(&self, event: &'static str, allowed: SenderState) -> Result<()> {
        if self.state == allowed {
            return Ok(());
        }
        warn!("Transfer {}: {} refused in state {}", self.id, event, self.state);
        Err(TransferError::OutOfOrder {
            transfer: self.id,
            event,
            state: self.state.to_string(),
        })
    }

    /// Idle → RequestSent. `key_registered` says whether the relay already holds our
    /// public key; without it the peer could never be answered.
    pub fn request(&mut self, key_registered: bool) -> Result<ClientMessage> {
        self.expect("request-transfer", SenderState::Idle)?;
        if !key_registered {
            return Err(TransferError::NotReady("public key not registered with the relay"));
        }

        self.state = SenderState::RequestSent;
        debug!("Transfer {}: requesting {} -> {}", self.id, self.metadata.original_name, self.target);

        Ok(ClientMessage::RequestTransfer {
            transfer_id: self.id,
            target_party: self.target.clone(),
            file_name: self.metadata.original_name.clone(),
        })
    }

    /// RequestSent → Accepted, keeping the recipient's key for [`seal`](Self::seal).
    pub fn on_accepted(&mut self, recipient_public_key: &str) -> Result<()> {
        self.expect("transfer-accepted", SenderState::RequestSent)?;

        match PublicKeyHandle::import(recipient_public_key) {
            Ok(key) => {
                debug!(
                    "Transfer {}: accepted, recipient key {}",
                    self.id,
                    key_fingerprint(recipient_public_key)
                );
                self.recipient_key = Some(key);
                self.state = SenderState::Accepted;
                Ok(())
            }
            Err(e) => {
                self.state = SenderState::Errored;
                Err(e)
            }
        }
    }

    /// RequestSent → Rejected. No cipher work ever happens for this attempt.
    pub fn on_rejected(&mut self) -> Result<()> {
        self.expect("transfer-rejected", SenderState::RequestSent)?;
        self.state = SenderState::Rejected;
        Ok(())
    }

    /// Accepted → Encrypting → Sent. Returns the `encrypted-data` message only once
    /// the envelope is completely built.
    pub fn seal(&mut self, payload: &[u8], passphrase: Option<&str>) -> Result<ClientMessage> {
        self.expect("seal", SenderState::Accepted)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            self.recipient_key = None;
            self.state = SenderState::Errored;
            return Err(TransferError::PayloadTooLarge {
                size: payload.len() as u64,
                limit: MAX_PAYLOAD_SIZE,
            });
        }
        let recipient = self
            .recipient_key
            .take()
            .ok_or(TransferError::NotReady("recipient public key missing"))?;

        self.state = SenderState::Encrypting;
        let sealed = cryptography::encrypt(payload, &recipient, passphrase)
            .and_then(|envelope| Ok((envelope.kind(), envelope.to_json()?)));

        let (kind, encrypted_data) = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                self.state = SenderState::Errored;
                return Err(e);
            }
        };

        self.state = SenderState::Sent;
        debug!("Transfer {}: sealed {} bytes as {} envelope", self.id, payload.len(), kind);

        Ok(ClientMessage::EncryptedData {
            transfer_id: self.id,
            target_party: self.target.clone(),
            encrypted_data,
            original_name: self.metadata.original_name.clone(),
            file_type: self.metadata.mime_type.clone(),
            file_extension: self.metadata.extension.clone(),
        })
    }

    /// Sent → Complete.
    pub fn on_delivery_confirmed(&mut self) -> Result<()> {
        self.expect("delivery-confirmed", SenderState::Sent)?;
        self.state = SenderState::Complete;
        Ok(())
    }

    /// The relay reported a failure for this attempt; any live state becomes Errored.
    pub fn on_relay_error(&mut self) {
        if !self.state.is_terminal() {
            self.state = SenderState::Errored;
        }
    }
}

/// Receiving side of one transfer attempt.
#[derive(Debug)]
pub struct IncomingTransfer {
    id: TransferId,
    source: PartyId,
    file_name: String,
    sender_public_key: String,
    state: ReceiverState,
    pending: Option<(EncryptionEnvelope, FileMetadata)>,
    failed_attempts: u32,
}

impl IncomingTransfer {
    /// A `transfer-request` arrived: the attempt starts in RequestReceived.
    pub fn new(id: TransferId, source: PartyId, file_name: String, sender_public_key: String) -> Self {
        IncomingTransfer {
            id,
            source,
            file_name,
            sender_public_key,
            state: ReceiverState::RequestReceived,
            pending: None,
            failed_attempts: 0,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn source(&self) -> &PartyId {
        &self.source
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn sender_fingerprint(&self) -> String {
        key_fingerprint(&self.sender_public_key)
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Whether the received envelope needs a passphrase to open.
    pub fn needs_passphrase(&self) -> bool {
        self.pending
            .as_ref()
            .map(|(envelope, _)| envelope.has_passphrase_layer())
            .unwrap_or(false)
    }

    fn expect(&self, event: &'static str, allowed: ReceiverState) -> Result<()> {
        if self.state == allowed {
            return Ok(());
        }
        warn!("Transfer {}: {} refused in state {}", self.id, event, self.state);
        Err(TransferError::OutOfOrder {
            transfer: self.id,
            event,
            state: self.state.to_string(),
        })
    }

    /// RequestReceived → AcceptSent. The relay attaches our registered public key
    /// when it forwards the acceptance.
    pub fn accept(&mut self) -> Result<ClientMessage> {
        self.expect("accept-transfer", ReceiverState::RequestReceived)?;
        self.state = ReceiverState::AcceptSent;
        Ok(ClientMessage::AcceptTransfer {
            transfer_id: self.id,
            source_party: self.source.clone(),
        })
    }

    /// AcceptSent → AwaitingData, once the acceptance has been handed to the relay.
    pub fn await_data(&mut self) -> Result<()> {
        self.expect("await-data", ReceiverState::AcceptSent)?;
        self.state = ReceiverState::AwaitingData;
        Ok(())
    }

    /// RequestReceived → RejectSent.
    pub fn reject(&mut self) -> Result<ClientMessage> {
        self.expect("reject-transfer", ReceiverState::RequestReceived)?;
        self.state = ReceiverState::RejectSent;
        Ok(ClientMessage::RejectTransfer {
            transfer_id: self.id,
            source_party: self.source.clone(),
        })
    }

    /// AwaitingData → Decrypting. Envelopes arriving in any other state are refused
    /// without touching the transfer.
    pub fn receive_envelope(&mut self, encrypted_data: &str, metadata: FileMetadata) -> Result<()> {
        self.expect("receive-data", ReceiverState::AwaitingData)?;

        match EncryptionEnvelope::from_json(encrypted_data) {
            Ok(envelope) => {
                debug!("Transfer {}: received {} envelope", self.id, envelope.kind());
                self.pending = Some((envelope, metadata));
                self.state = ReceiverState::Decrypting;
                Ok(())
            }
            Err(e) => {
                debug!("Transfer {}: unreadable envelope: {}", self.id, e);
                self.state = ReceiverState::Failed;
                Err(TransferError::Decryption)
            }
        }
    }

    /// Decrypting → Complete on success.
    ///
    /// A failed attempt on a passphrase-protected envelope stays in Decrypting so the
    /// user can try another passphrase, up to `MAX_PASSPHRASE_ATTEMPTS`; any other
    /// failure moves to Failed.
    pub fn decrypt(&mut self, keypair: &KeyPair, passphrase: Option<&str>) -> Result<(FileMetadata, Vec<u8>)> {
        self.expect("decrypt", ReceiverState::Decrypting)?;
        let (envelope, _) = self
            .pending
            .as_ref()
            .ok_or(TransferError::NotReady("no envelope received"))?;

        match cryptography::decrypt(envelope, keypair, passphrase) {
            Ok(plaintext) => {
                let (_, metadata) = self
                    .pending
                    .take()
                    .ok_or(TransferError::NotReady("no envelope received"))?;
                self.state = ReceiverState::Complete;
                Ok((metadata, plaintext))
            }
            Err(e) => {
                self.failed_attempts += 1;
                let retryable = envelope.has_passphrase_layer()
                    && self.failed_attempts < MAX_PASSPHRASE_ATTEMPTS;
                if !retryable {
                    self.pending = None;
                    self.state = ReceiverState::Failed;
                }
                Err(e)
            }
        }
    }

    /// Receipt for the sender, only once the payload was recovered.
    pub fn delivery_receipt(&self) -> Result<ClientMessage> {
        self.expect("confirm-delivery", ReceiverState::Complete)?;
        Ok(ClientMessage::ConfirmDelivery {
            transfer_id: self.id,
            source_party: self.source.clone(),
        })
    }

    /// Drop the attempt locally. The sender is not told.
    pub fn abandon(&mut self) {
        if !self.state.is_terminal() {
            self.pending = None;
            self.state = ReceiverState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::tests::shared_keypair;

    fn outgoing() -> OutgoingTransfer {
        OutgoingTransfer::new(PartyId::new("111111"), FileMetadata::from_name("report.pdf"))
    }

    fn incoming() -> IncomingTransfer {
        IncomingTransfer::new(
            TransferId::new(),
            PartyId::new("222222"),
            "report.pdf".to_string(),
            shared_keypair().export_public().unwrap(),
        )
    }

    fn sealed_for_us(payload: &[u8], passphrase: Option<&str>) -> String {
        let envelope = cryptography::encrypt(payload, &shared_keypair().public_handle(), passphrase).unwrap();
        envelope.to_json().unwrap()
    }

    #[test]
    fn test_transfer_ids_are_unique() {
        assert_ne!(TransferId::new(), TransferId::new());
    }

    #[test]
    fn test_request_requires_registered_key() {
        let mut transfer = outgoing();
        let result = transfer.request(false);

        assert!(matches!(result, Err(TransferError::NotReady(_))));
        assert_eq!(transfer.state(), SenderState::Idle);
    }

    #[test]
    fn test_sender_happy_path() {
        let mut transfer = outgoing();
        let pem = shared_keypair().export_public().unwrap();

        match transfer.request(true).unwrap() {
            ClientMessage::RequestTransfer { transfer_id, file_name, .. } => {
                assert_eq!(transfer_id, transfer.id());
                assert_eq!(file_name, "report.pdf");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(transfer.state(), SenderState::RequestSent);

        transfer.on_accepted(&pem).unwrap();
        assert_eq!(transfer.state(), SenderState::Accepted);

        match transfer.seal(b"fifty bytes or so", None).unwrap() {
            ClientMessage::EncryptedData { encrypted_data, file_type, .. } => {
                assert_eq!(file_type, "application/pdf");
                assert_eq!(EncryptionEnvelope::from_json(&encrypted_data).unwrap().kind(), "rsa");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(transfer.state(), SenderState::Sent);

        transfer.on_delivery_confirmed().unwrap();
        assert_eq!(transfer.state(), SenderState::Complete);
    }

    #[test]
    fn test_seal_before_acceptance_is_refused() {
        let mut transfer = outgoing();
        transfer.request(true).unwrap();

        let result = transfer.seal(b"data", None);
        assert!(matches!(result, Err(TransferError::OutOfOrder { .. })));
        assert_eq!(transfer.state(), SenderState::RequestSent);
    }

    #[test]
    fn test_oversized_payload_is_never_sent() {
        let mut transfer = outgoing();
        transfer.request(true).unwrap();
        transfer.on_accepted(&shared_keypair().export_public().unwrap()).unwrap();

        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let result = transfer.seal(&payload, None);
        assert!(matches!(result, Err(TransferError::PayloadTooLarge { .. })));
        assert_eq!(transfer.state(), SenderState::Errored);
    }

    #[test]
    fn test_rejection_is_terminal() {
        let mut transfer = outgoing();
        transfer.request(true).unwrap();
        transfer.on_rejected().unwrap();
        assert_eq!(transfer.state(), SenderState::Rejected);

        let pem = shared_keypair().export_public().unwrap();
        assert!(matches!(transfer.on_accepted(&pem), Err(TransferError::OutOfOrder { .. })));
        assert!(matches!(transfer.seal(b"x", None), Err(TransferError::OutOfOrder { .. })));
        assert_eq!(transfer.state(), SenderState::Rejected);
    }

    #[test]
    fn test_bad_recipient_key_errors_the_attempt() {
        let mut transfer = outgoing();
        transfer.request(true).unwrap();

        let result = transfer.on_accepted("-----BEGIN PUBLIC KEY-----\ngarbage\n-----END PUBLIC KEY-----");
        assert!(matches!(result, Err(TransferError::KeyImport(_))));
        assert_eq!(transfer.state(), SenderState::Errored);
    }

    #[test]
    fn test_relay_error_only_affects_live_attempts() {
        let mut transfer = outgoing();
        transfer.request(true).unwrap();
        transfer.on_relay_error();
        assert_eq!(transfer.state(), SenderState::Errored);

        let mut done = outgoing();
        done.request(true).unwrap();
        done.on_rejected().unwrap();
        done.on_relay_error();
        assert_eq!(done.state(), SenderState::Rejected);
    }

    #[test]
    fn test_receiver_happy_path() {
        let mut transfer = incoming();
        assert_eq!(transfer.state(), ReceiverState::RequestReceived);

        transfer.accept().unwrap();
        assert_eq!(transfer.state(), ReceiverState::AcceptSent);
        transfer.await_data().unwrap();

        let payload = vec![0x5A; 50];
        transfer
            .receive_envelope(&sealed_for_us(&payload, None), FileMetadata::from_name("report.pdf"))
            .unwrap();
        assert_eq!(transfer.state(), ReceiverState::Decrypting);
        assert!(!transfer.needs_passphrase());

        let (metadata, plaintext) = transfer.decrypt(shared_keypair(), None).unwrap();
        assert_eq!(plaintext, payload);
        assert_eq!(metadata.original_name, "report.pdf");
        assert_eq!(transfer.state(), ReceiverState::Complete);

        assert!(matches!(transfer.delivery_receipt().unwrap(), ClientMessage::ConfirmDelivery { .. }));
    }

    #[test]
    fn test_envelope_before_acceptance_is_out_of_order() {
        let mut transfer = incoming();
        let envelope = sealed_for_us(b"stray", None);

        let result = transfer.receive_envelope(&envelope, FileMetadata::from_name("x.txt"));
        assert!(matches!(result, Err(TransferError::OutOfOrder { .. })));
        assert_eq!(transfer.state(), ReceiverState::RequestReceived);
        assert!(!transfer.needs_passphrase());

        transfer.accept().unwrap();
        let result = transfer.receive_envelope(&envelope, FileMetadata::from_name("x.txt"));
        assert!(matches!(result, Err(TransferError::OutOfOrder { .. })));
        assert_eq!(transfer.state(), ReceiverState::AcceptSent);
    }

    #[test]
    fn test_second_envelope_is_out_of_order() {
        let mut transfer = incoming();
        transfer.accept().unwrap();
        transfer.await_data().unwrap();
        transfer
            .receive_envelope(&sealed_for_us(b"first", None), FileMetadata::from_name("a.txt"))
            .unwrap();

        let result = transfer.receive_envelope(&sealed_for_us(b"second", None), FileMetadata::from_name("b.txt"));
        assert!(matches!(result, Err(TransferError::OutOfOrder { .. })));

        let (metadata, plaintext) = transfer.decrypt(shared_keypair(), None).unwrap();
        assert_eq!(plaintext, b"first");
        assert_eq!(metadata.original_name, "a.txt");
    }

    #[test]
    fn test_reject_is_terminal() {
        let mut transfer = incoming();
        assert!(matches!(transfer.reject().unwrap(), ClientMessage::RejectTransfer { .. }));
        assert_eq!(transfer.state(), ReceiverState::RejectSent);
        assert!(transfer.accept().is_err());
        assert_eq!(transfer.state(), ReceiverState::RejectSent);
    }

    #[test]
    fn test_garbled_envelope_fails_attempt() {
        let mut transfer = incoming();
        transfer.accept().unwrap();
        transfer.await_data().unwrap();

        let result = transfer.receive_envelope("{not json", FileMetadata::from_name("a.txt"));
        assert!(matches!(result, Err(TransferError::Decryption)));
        assert_eq!(transfer.state(), ReceiverState::Failed);
    }

    #[test]
    fn test_wrong_passphrase_can_be_retried() {
        let mut transfer = incoming();
        transfer.accept().unwrap();
        transfer.await_data().unwrap();
        transfer
            .receive_envelope(&sealed_for_us(b"secret", Some("correct-horse")), FileMetadata::from_name("s.txt"))
            .unwrap();
        assert!(transfer.needs_passphrase());

        let result = transfer.decrypt(shared_keypair(), Some("wrong-horse"));
        assert!(matches!(result, Err(TransferError::Decryption)));
        assert_eq!(transfer.state(), ReceiverState::Decrypting);

        let (_, plaintext) = transfer.decrypt(shared_keypair(), Some("correct-horse")).unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[test]
    fn test_passphrase_attempts_are_bounded() {
        let mut transfer = incoming();
        transfer.accept().unwrap();
        transfer.await_data().unwrap();
        transfer
            .receive_envelope(&sealed_for_us(b"secret", Some("right")), FileMetadata::from_name("s.txt"))
            .unwrap();

        for _ in 0..MAX_PASSPHRASE_ATTEMPTS {
            assert!(transfer.decrypt(shared_keypair(), Some("wrong")).is_err());
        }
        assert_eq!(transfer.state(), ReceiverState::Failed);
        assert!(matches!(
            transfer.decrypt(shared_keypair(), Some("right")),
            Err(TransferError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_failure_without_passphrase_is_final() {
        let mut transfer = incoming();
        transfer.accept().unwrap();
        transfer.await_data().unwrap();

        let mut envelope = cryptography::encrypt(&[1u8; 500], &shared_keypair().public_handle(), None).unwrap();
        if let EncryptionEnvelope::Hybrid { encrypted_data, .. } = &mut envelope {
            encrypted_data[3] ^= 0x10;
        }
        transfer
            .receive_envelope(&envelope.to_json().unwrap(), FileMetadata::from_name("t.bin"))
            .unwrap();

        assert!(matches!(transfer.decrypt(shared_keypair(), None), Err(TransferError::Decryption)));
        assert_eq!(transfer.state(), ReceiverState::Failed);
        assert!(transfer.delivery_receipt().is_err());
    }

    #[test]
    fn test_abandon() {
        let mut transfer = incoming();
        transfer.accept().unwrap();
        transfer.abandon();
        assert_eq!(transfer.state(), ReceiverState::Failed);
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = key_fingerprint("any key text");
        assert_eq!(fingerprint.len(), 8 * 2 + 7);
        assert_eq!(fingerprint, key_fingerprint("  any key text\n"));
    }
}
