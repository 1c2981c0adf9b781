use std::path::Path;
use std::time::Duration;

use indicatif::ProgressBar;
use log::{debug, info, warn};

use crate::bytes::read_payload;
use crate::commands::open_session;
use crate::error::{Result, TransferError};
use crate::session::SessionEvent;
use crate::utils::PartyId;

/// Function handler to kickoff sender logic:
///     - Read the file to send, fully, before touching the network
///     - Generate a keypair, connect to the relay and register the public key
///     - Ask the target party for permission
///     - Once accepted, encrypt for the recipient's key and send the envelope
///     - Wait for the recipient to confirm delivery
pub async fn run(file_path: &Path, target: PartyId, relay_addr: &str, passphrase: Option<String>) -> Result<()> {
    let (metadata, payload) = read_payload(file_path)?;
    debug!("Payload size: {} bytes", payload.len());

    let (mut connection, mut session) = open_session(relay_addr).await?;
    if let Some(party_id) = session.party_id() {
        info!("Connected to relay as party {}", party_id);
    }

    let (transfer_id, request) = session.request_transfer(target.clone(), metadata)?;
    connection.send(&request).await?;

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Waiting for {} to accept", target));

    loop {
        let message = connection.recv().await?;
        let event = match session.handle(message) {
            Ok(event) => event,
            Err(e) => {
                // Only errors that ended our own attempt matter here.
                let ended = session
                    .outgoing(transfer_id)
                    .map_or(false, |t| t.state().is_terminal());
                if ended {
                    spinner.abandon_with_message(e.status_message());
                    return Err(e);
                }
                warn!("{}", e);
                continue;
            }
        };

        match event {
            SessionEvent::Accepted(id) if id == transfer_id => {
                spinner.set_message("Encrypting file");
                let sealed = tokio::task::block_in_place(|| {
                    session.seal(transfer_id, &payload, passphrase.as_deref())
                })?;

                spinner.set_message("Sending encrypted file");
                connection.send(&sealed).await?;
                spinner.set_message(format!("Waiting for {} to confirm delivery", target));
            }
            SessionEvent::Rejected(id) if id == transfer_id => {
                spinner.finish_with_message("Transfer rejected");
                return Ok(());
            }
            SessionEvent::Delivered(id) if id == transfer_id => {
                spinner.finish_with_message("File sent successfully");
                return Ok(());
            }
            SessionEvent::RelayError { transfer_id: id, message } if id.map_or(true, |id| id == transfer_id) => {
                spinner.abandon_with_message(message.clone());
                return Err(TransferError::Relay(message));
            }
            SessionEvent::IncomingRequest { transfer_id: id, source, .. } => {
                debug!("Refusing transfer {} from {} while sending", id, source);
                connection.send(&session.reject(id)?).await?;
            }
            other => debug!("Ignoring {:?}", other),
        }
    }
}
