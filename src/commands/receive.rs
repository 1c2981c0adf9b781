use std::path::Path;
use std::time::Duration;

use indicatif::ProgressBar;
use log::{debug, info, warn};

use crate::bytes::{copy_to_clipboard, prompt_passphrase, prompt_yes_no, write_received_file};
use crate::commands::open_session;
use crate::error::{Result, TransferError};
use crate::networking::RelayConnection;
use crate::session::{PartySession, SessionEvent};
use crate::transfer::TransferId;

/// Function handler to kickoff receiver logic:
///     - Generate a keypair, connect to the relay and register the public key
///     - Print (and copy) the party id the sender needs
///     - Accept or reject incoming requests after showing the sender's key fingerprint
///     - Decrypt the first delivered file, retrying the passphrase if it was wrong
///     - Save it under `output_dir` and confirm delivery to the sender
pub async fn run(relay_addr: &str, passphrase: Option<String>, output_dir: &Path, auto_accept: bool) -> Result<()> {
    let (mut connection, mut session) = open_session(relay_addr).await?;

    if let Some(party_id) = session.party_id() {
        let copied = copy_to_clipboard(party_id.as_str());
        println!(
            "Your id{}: \x1b[4m\x1b[1m{}\x1b[0m",
            if copied { " (copied to clipboard)" } else { "" },
            party_id
        );
    }

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Waiting for a transfer request");

    // Only one transfer is accepted at a time.
    let mut active: Option<TransferId> = None;

    loop {
        let message = connection.recv().await?;
        let event = match session.handle(message) {
            Ok(event) => event,
            Err(e) => {
                let ended = active
                    .and_then(|id| session.incoming(id))
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
            SessionEvent::IncomingRequest {
                transfer_id,
                source,
                file_name,
                sender_fingerprint,
            } => {
                if active.is_some() {
                    debug!("Busy, rejecting transfer {} from {}", transfer_id, source);
                    connection.send(&session.reject(transfer_id)?).await?;
                    continue;
                }

                spinner.suspend(|| {
                    println!("Party {} wants to send you \"{}\"", source, file_name);
                    println!("Sender key fingerprint: {}", sender_fingerprint);
                });
                let accepted = auto_accept
                    || tokio::task::block_in_place(|| spinner.suspend(|| prompt_yes_no("Accept this file?")))?;

                if accepted {
                    connection.send(&session.accept(transfer_id)?).await?;
                    active = Some(transfer_id);
                    spinner.set_message(format!("Waiting for {} to send the file", source));
                } else {
                    connection.send(&session.reject(transfer_id)?).await?;
                    info!("Rejected transfer {}", transfer_id);
                    spinner.set_message("Waiting for a transfer request");
                }
            }

            SessionEvent::DataReady { transfer_id, needs_passphrase } => {
                spinner.set_message("Decrypting file");
                let saved = open_and_save(
                    &mut connection,
                    &mut session,
                    &spinner,
                    transfer_id,
                    needs_passphrase,
                    passphrase.clone(),
                    output_dir,
                )
                .await;

                return match saved {
                    Ok(path) => {
                        spinner.finish_with_message(format!("File saved: {}", path.display()));
                        Ok(())
                    }
                    Err(e) => {
                        spinner.abandon_with_message(e.status_message());
                        Err(e)
                    }
                };
            }

            SessionEvent::RelayError { transfer_id, message } => {
                if transfer_id.is_some() && transfer_id == active {
                    spinner.abandon_with_message(message.clone());
                    return Err(TransferError::Relay(message));
                }
                warn!("{}", message);
            }

            other => debug!("Ignoring {:?}", other),
        }
    }
}

/// Decrypt, write and acknowledge one delivered envelope.
async fn open_and_save(
    connection: &mut RelayConnection,
    session: &mut PartySession,
    spinner: &ProgressBar,
    transfer_id: TransferId,
    needs_passphrase: bool,
    mut passphrase: Option<String>,
    output_dir: &Path,
) -> Result<std::path::PathBuf> {
    if needs_passphrase && passphrase.is_none() {
        passphrase = tokio::task::block_in_place(|| {
            spinner.suspend(|| prompt_passphrase("This file is passphrase protected. Passphrase: "))
        })?;
    }

    loop {
        let opened = tokio::task::block_in_place(|| session.open(transfer_id, passphrase.as_deref()));
        match opened {
            Ok((metadata, plaintext, receipt)) => {
                let path = write_received_file(output_dir, &metadata, &plaintext)?;
                connection.send(&receipt).await?;
                return Ok(path);
            }
            Err(TransferError::Decryption) if may_retry(session, transfer_id) => {
                passphrase = tokio::task::block_in_place(|| {
                    spinner.suspend(|| {
                        println!("{}", TransferError::Decryption.status_message());
                        prompt_passphrase("Try another passphrase: ")
                    })
                })?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn may_retry(session: &PartySession, transfer_id: TransferId) -> bool {
    session
        .incoming(transfer_id)
        .map_or(false, |t| !t.state().is_terminal())
}
