use std::collections::HashMap;
use std::net::SocketAddr;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::oneshot;

use crate::error::Result;
use crate::networking::{read_frame, write_frame};
use crate::protocol::{ClientMessage, RelayErrorKind, ServerMessage};
use crate::transfer::TransferId;
use crate::utils::PartyId;

const TARGET_NOT_FOUND: &str = "Target user not found";
const REGISTER_FIRST: &str = "Please register your public key first";
const UNABLE_TO_ACCEPT: &str = "Unable to accept transfer";

/// Outbound queue depth per connection. A party that lets this fill up is
/// disconnected rather than waited on.
const OUTBOUND_CAPACITY: usize = 32;

/// Resolves once the relay drops the party's session, either on a normal
/// disconnect or because the party stopped draining its queue.
pub type Evicted = oneshot::Receiver<()>;

/// A connected party as the relay sees it.
struct Session {
    outbound: Sender<ServerMessage>,
    public_key: Option<String>,
    // dropped with the session, which wakes the connection task
    _evict: oneshot::Sender<()>,
}

/// Every live connection, keyed by the party id the relay handed out.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<PartyId, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, party: &PartyId) -> bool {
        self.sessions.contains_key(party)
    }

    pub fn public_key(&self, party: &PartyId) -> Option<&str> {
        self.sessions.get(party).and_then(|s| s.public_key.as_deref())
    }

    /// Admit a connection under a fresh id that no live session uses.
    pub fn connect(&mut self, outbound: Sender<ServerMessage>) -> (PartyId, Evicted) {
        let party = loop {
            let candidate = PartyId::generate();
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let (evict, evicted) = oneshot::channel();
        self.sessions.insert(
            party.clone(),
            Session {
                outbound,
                public_key: None,
                _evict: evict,
            },
        );
        (party, evicted)
    }

    /// Forget a party along with its registered key.
    pub fn disconnect(&mut self, party: &PartyId) -> bool {
        self.sessions.remove(party).is_some()
    }

    /// Decide who gets what in response to one message from `from`.
    ///
    /// The encrypted payload is forwarded as an opaque string.
    pub fn route(&mut self, from: &PartyId, message: ClientMessage) -> Vec<(PartyId, ServerMessage)> {
        match message {
            ClientMessage::RegisterPublicKey { public_key } => match self.sessions.get_mut(from) {
                Some(session) => {
                    session.public_key = Some(public_key);
                    debug!("Public key registered for party {}", from);
                    vec![(from.clone(), ServerMessage::KeyRegistered { success: true })]
                }
                None => Vec::new(),
            },

            ClientMessage::RequestTransfer {
                transfer_id,
                target_party,
                file_name,
            } => {
                if !self.contains(&target_party) {
                    return reply_error(from, RelayErrorKind::TargetUnavailable, TARGET_NOT_FOUND, transfer_id);
                }
                let Some(sender_public_key) = self.public_key(from).map(str::to_string) else {
                    return reply_error(from, RelayErrorKind::PeerNotReady, REGISTER_FIRST, transfer_id);
                };

                info!("Transfer request {} sent from {} to {}", transfer_id, from, target_party);
                vec![(
                    target_party,
                    ServerMessage::TransferRequest {
                        transfer_id,
                        source_party: from.clone(),
                        file_name,
                        sender_public_key,
                    },
                )]
            }

            ClientMessage::AcceptTransfer { transfer_id, source_party } => {
                if !self.contains(&source_party) {
                    return reply_error(from, RelayErrorKind::TargetUnavailable, UNABLE_TO_ACCEPT, transfer_id);
                }
                let Some(recipient_public_key) = self.public_key(from).map(str::to_string) else {
                    return reply_error(from, RelayErrorKind::PeerNotReady, UNABLE_TO_ACCEPT, transfer_id);
                };

                vec![(
                    source_party,
                    ServerMessage::TransferAccepted {
                        transfer_id,
                        target_party: from.clone(),
                        recipient_public_key,
                    },
                )]
            }

            ClientMessage::RejectTransfer { transfer_id, source_party } => {
                if !self.contains(&source_party) {
                    return Vec::new();
                }
                vec![(
                    source_party,
                    ServerMessage::TransferRejected {
                        transfer_id,
                        target_party: from.clone(),
                    },
                )]
            }

            ClientMessage::EncryptedData {
                transfer_id,
                target_party,
                encrypted_data,
                original_name,
                file_type,
                file_extension,
            } => {
                if !self.contains(&target_party) {
                    return reply_error(from, RelayErrorKind::TargetUnavailable, TARGET_NOT_FOUND, transfer_id);
                }

                info!(
                    "Encrypted data for transfer {} forwarded to {} ({}, {})",
                    transfer_id, target_party, original_name, file_type
                );
                vec![(
                    target_party,
                    ServerMessage::ReceiveData {
                        transfer_id,
                        source_party: from.clone(),
                        encrypted_data,
                        original_name,
                        file_type,
                        file_extension,
                    },
                )]
            }

            ClientMessage::ConfirmDelivery { transfer_id, source_party } => {
                if !self.contains(&source_party) {
                    return Vec::new();
                }
                vec![(
                    source_party,
                    ServerMessage::DeliveryConfirmed {
                        transfer_id,
                        target_party: from.clone(),
                    },
                )]
            }
        }
    }

    /// Queue routed messages on their recipients' connections without waiting.
    ///
    /// A recipient whose queue is full is dropped from the table, so one stalled
    /// reader cannot hold up routing for everyone else.
    fn deliver(&mut self, routed: Vec<(PartyId, ServerMessage)>) {
        for (party, message) in routed {
            let Some(session) = self.sessions.get(&party) else {
                continue;
            };
            match session.outbound.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Party {} is not reading its messages, disconnecting", party);
                    self.sessions.remove(&party);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Connection for party {} already closed", party);
                }
            }
        }
    }
}

fn reply_error(
    to: &PartyId,
    kind: RelayErrorKind,
    reason: &str,
    transfer_id: TransferId,
) -> Vec<(PartyId, ServerMessage)> {
    vec![(to.clone(), ServerMessage::error(kind, reason, Some(transfer_id)))]
}

pub enum Message {
    NewConnection {
        addr: SocketAddr,
        outbound: Sender<ServerMessage>,
        assigned: oneshot::Sender<(PartyId, Evicted)>,
    },
    Inbound {
        from: PartyId,
        message: ClientMessage,
    },
    Disconnected(PartyId),
}

pub struct ConnectionManager {
    pub sessions: SessionTable,
    pub receiver_channel: Receiver<Message>,
}

impl ConnectionManager {
    pub fn new(receiver_channel: Receiver<Message>) -> Self {
        ConnectionManager {
            sessions: SessionTable::new(),
            receiver_channel,
        }
    }

    fn admit(&mut self, addr: SocketAddr, outbound: Sender<ServerMessage>, assigned: oneshot::Sender<(PartyId, Evicted)>) {
        let (party, evicted) = self.sessions.connect(outbound);
        info!("Party {} connected from {}", party, addr);

        self.sessions
            .deliver(vec![(party.clone(), ServerMessage::Connected { party_id: party.clone() })]);

        if assigned.send((party.clone(), evicted)).is_err() {
            // connection task already gone
            self.sessions.disconnect(&party);
        }
    }
}

/// Owns the session table; every routing decision happens on this one task.
pub async fn relay_manager(mut manager: ConnectionManager) {
    while let Some(message) = manager.receiver_channel.recv().await {
        match message {
            Message::NewConnection { addr, outbound, assigned } => {
                manager.admit(addr, outbound, assigned);
            }
            Message::Inbound { from, message } => {
                let routed = manager.sessions.route(&from, message);
                manager.sessions.deliver(routed);
            }
            Message::Disconnected(party) => {
                if manager.sessions.disconnect(&party) {
                    info!("Party {} disconnected ({} still connected)", party, manager.sessions.len());
                }
            }
        }
    }
    debug!("Relay manager channel closed");
}

/// Drive one client connection: a writer task drains the party's outbound queue
/// while this task decodes frames and hands them to the manager.
pub async fn relay_new_connection(stream: TcpStream, addr: SocketAddr, manager_channel: Sender<Message>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let (assigned_tx, assigned_rx) = oneshot::channel();

    let new_connection = Message::NewConnection {
        addr,
        outbound,
        assigned: assigned_tx,
    };
    if let Err(e) = manager_channel.send(new_connection).await {
        error!("Failed to send message to manager: {}", e);
        return;
    }
    let Ok((party, mut evicted)) = assigned_rx.await else {
        error!("Relay manager dropped connection from {}", addr);
        return;
    };

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &message).await {
                warn!("Error writing to {}: {}", addr, e);
                break;
            }
        }
    });

    let mut was_evicted = false;
    loop {
        let frame = tokio::select! {
            frame = read_frame::<_, ClientMessage>(&mut read_half) => frame,
            _ = &mut evicted => {
                was_evicted = true;
                break;
            }
        };

        match frame {
            Ok(Some(message)) => {
                debug!("Party {} sent {}", party, event_name(&message));
                let inbound = Message::Inbound { from: party.clone(), message };
                if manager_channel.send(inbound).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping connection from party {}: {}", party, e);
                break;
            }
        }
    }

    // an evicted id is already free and may have been handed to someone new
    if !was_evicted {
        let _ = manager_channel.send(Message::Disconnected(party)).await;
    }
    writer.abort();
}

fn event_name(message: &ClientMessage) -> &'static str {
    match message {
        ClientMessage::RegisterPublicKey { .. } => "register-public-key",
        ClientMessage::RequestTransfer { .. } => "request-transfer",
        ClientMessage::AcceptTransfer { .. } => "accept-transfer",
        ClientMessage::RejectTransfer { .. } => "reject-transfer",
        ClientMessage::EncryptedData { .. } => "encrypted-data",
        ClientMessage::ConfirmDelivery { .. } => "confirm-delivery",
    }
}

/// Accept connections on `listener` forever.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let (sender_channel, receiver_channel) = mpsc::channel::<Message>(100);
    debug!("Spawning relay manager task");
    tokio::spawn(relay_manager(ConnectionManager::new(receiver_channel)));

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("New client connection from: {}", addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", addr, e);
        }
        tokio::spawn(relay_new_connection(stream, addr, sender_channel.clone()));
    }
}
