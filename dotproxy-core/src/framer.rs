// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Length-prefixed (2-byte big-endian) DNS-over-TCP codec, per
//! RFC 1035 §4.2.2, layered over a [`BoundedSocket`].

use crate::socket::{BoundedSocket, SocketError};
use crate::MAX_MESSAGE_LEN;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors raised by [`DnsFramer`].
#[derive(Debug, Error)]
pub enum FramerError {
    /// The message to send was empty or exceeded `MAX_MESSAGE_LEN`.
    #[error("message length {0} outside the representable 1..=65535 range")]
    MessageTooLarge(usize),
    /// Propagated verbatim from the underlying `BoundedSocket`.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

pub type Result<T> = std::result::Result<T, FramerError>;

/// Stateless length-prefix codec. Holds no buffering across calls; each
/// `send`/`recv` is a complete, independent framed exchange.
pub struct DnsFramer;

impl DnsFramer {
    /// Prepend a 2-byte big-endian length prefix and write the result via
    /// `socket.send`. `message.len()` must be in `1..=65535`.
    pub async fn send<S>(socket: &mut BoundedSocket<S>, message: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if message.is_empty() || message.len() > MAX_MESSAGE_LEN {
            return Err(FramerError::MessageTooLarge(message.len()));
        }
        let len = message.len() as u16;
        let mut framed = Vec::with_capacity(2 + message.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(message);
        socket.send(&framed).await?;
        Ok(())
    }

    /// Read a 2-byte big-endian length prefix, then exactly that many bytes.
    /// Any error from the underlying `BoundedSocket::recv` propagates as-is;
    /// there is no framing-level retry.
    pub async fn recv<S>(socket: &mut BoundedSocket<S>) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let len_bytes = socket.recv(2).await?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let message = socket.recv(len).await?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn send_then_recv_round_trips() {
        let (client, server) = duplex(1024);
        let mut client_sock = BoundedSocket::new(client, "client");
        let mut server_sock = BoundedSocket::new(server, "server");

        let payload = b"a well formed dns message".to_vec();
        let send_payload = payload.clone();
        let sender = tokio::spawn(async move { DnsFramer::send(&mut client_sock, &send_payload).await });

        let received = DnsFramer::recv(&mut server_sock).await.unwrap();
        sender.await.unwrap().unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn rejects_empty_message() {
        let (client, _server) = duplex(64);
        let mut sock = BoundedSocket::new(client, "client");
        let err = DnsFramer::send(&mut sock, b"").await.unwrap_err();
        assert!(matches!(err, FramerError::MessageTooLarge(0)));
    }

    #[tokio::test]
    async fn rejects_oversize_message() {
        let (client, _server) = duplex(64);
        let mut sock = BoundedSocket::new(client, "client");
        let oversize = vec![0u8; 65536];
        let err = DnsFramer::send(&mut sock, &oversize).await.unwrap_err();
        assert!(matches!(err, FramerError::MessageTooLarge(65536)));
    }

    #[tokio::test]
    async fn wire_format_has_big_endian_length_prefix() {
        let (client, mut server) = duplex(1024);
        let mut client_sock = BoundedSocket::new(client, "client");
        let message = vec![0xAB; 300];
        let send_message = message.clone();
        let sender = tokio::spawn(async move { DnsFramer::send(&mut client_sock, &send_message).await });

        let mut raw = [0u8; 2];
        server.read_exact(&mut raw).await.unwrap();
        sender.await.unwrap().unwrap();
        assert_eq!(raw, [0x01, 0x2C]);
    }
}
