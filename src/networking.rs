use std::io::ErrorKind;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Result, TransferError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::MAX_FRAME_SIZE;

/// Write one JSON message as a big-endian `u32` length followed by the bytes.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransferError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }

    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    // relay connections sit idle between messages, so nothing may linger in buffers
    writer.flush().await?;
    Ok(())
}

/// Read one framed JSON message. `Ok(None)` means the peer closed cleanly between
/// frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let length = match reader.read_u32().await {
        Ok(length) => length as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if length > MAX_FRAME_SIZE {
        return Err(TransferError::Protocol(format!(
            "incoming frame of {} bytes exceeds the {} byte limit",
            length, MAX_FRAME_SIZE
        )));
    }

    // grows with the bytes that actually arrive, not with the advertised length
    let mut buffer = Vec::new();
    AsyncReadExt::take(&mut *reader, length as u64)
        .read_to_end(&mut buffer)
        .await?;
    if buffer.len() < length {
        return Err(TransferError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("frame truncated after {} of {} bytes", buffer.len(), length),
        )));
    }

    Ok(Some(serde_json::from_slice(&buffer)?))
}

/// A party's connection to the relay.
pub struct RelayConnection {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
}

impl RelayConnection {
    pub async fn connect(relay_addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(relay_addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to relay server at {}", relay_addr);

        let (read_half, write_half) = stream.into_split();
        Ok(RelayConnection { read_half, write_half })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        write_frame(&mut self.write_half, message).await
    }

    /// Next message from the relay; a closed connection is an error here since a
    /// party always expects the relay to stay up for the whole session.
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        match read_frame(&mut self.read_half).await? {
            Some(message) => Ok(message),
            None => Err(TransferError::Io(std::io::Error::new(
                ErrorKind::ConnectionAborted,
                "relay server closed connection",
            ))),
        }
    }
}
