//! # Commands Module
//!
//! The three entry points of the `sealdrop` binary:
//!
//! ## `send`
//! Encrypts one file for a party the user names by id and pushes it through the
//! relay once that party accepts.
//!
//! ## `receive`
//! Connects, prints the id to share with the sender, and decrypts the first file it
//! accepts into the output directory.
//!
//! ## `relay`
//! Runs the forwarding server both parties connect to.

pub mod receive;
pub mod relay;
pub mod send;

use std::time::Duration;

use indicatif::ProgressBar;
use log::{debug, warn};

use crate::error::{Result, TransferError};
use crate::keyring::KeyPair;
use crate::networking::RelayConnection;
use crate::session::{PartySession, SessionEvent};

/// RSA generation blocks for a noticeable moment, so it runs off the async workers.
async fn generate_keypair() -> Result<KeyPair> {
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Generating encryption keys");

    let keypair = tokio::task::spawn_blocking(KeyPair::generate)
        .await
        .map_err(|e| TransferError::KeyGeneration(e.to_string()))??;

    spinner.finish_and_clear();
    Ok(keypair)
}

/// Generate keys, connect to the relay and wait until it has both assigned us an
/// id and stored our public key.
async fn open_session(relay_addr: &str) -> Result<(RelayConnection, PartySession)> {
    let keypair = generate_keypair().await?;

    debug!("Connecting to relay server at {}", relay_addr);
    let mut connection = RelayConnection::connect(relay_addr).await?;
    let mut session = PartySession::new(keypair);

    while !session.is_ready() {
        let message = connection.recv().await?;
        match session.handle(message)? {
            SessionEvent::Connected(party_id) => {
                debug!("Registering public key as party {}", party_id);
                connection.send(&session.register()?).await?;
            }
            SessionEvent::KeyRegistered => debug!("Public key registered"),
            other => warn!("Ignoring {:?} before registration finished", other),
        }
    }

    Ok((connection, session))
}
