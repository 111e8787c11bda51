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

//! The server-side TCP accept loop: one task per accepted connection, with a
//! capped exponential backoff on `accept()` errors so a transient EMFILE
//! doesn't spin the loop hot or bring the whole server down.

use crate::socket::SocketConnection;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use xpn_common::{XpnError, XpnResult};

/// Capped exponential backoff for the accept loop, grounded on the teacher's
/// `dbnet::NetBackoff`.
struct AcceptBackoff {
    current_secs: u8,
}

impl AcceptBackoff {
    const MAX_BACKOFF_SECS: u8 = 64;

    fn new() -> Self {
        Self { current_secs: 1 }
    }

    async fn spin(&mut self) {
        sleep(Duration::from_secs(self.current_secs as u64)).await;
        self.current_secs = self.current_secs.saturating_mul(2);
    }

    fn should_give_up(&self) -> bool {
        self.current_secs > Self::MAX_BACKOFF_SECS
    }
}

/// Bind `host:port` and accept connections until the listener itself fails
/// unrecoverably. Each accepted stream is handed to `on_connection` as a
/// [`SocketConnection`] plus its peer address; the caller spawns whatever
/// task drives the per-connection dispatcher loop.
pub async fn accept_loop<F>(host: &str, port: u16, mut on_connection: F) -> XpnResult<()>
where
    F: FnMut(SocketConnection, std::net::SocketAddr),
{
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| XpnError::Transport(format!("binding to {host}:{port}: {e}")))?;
    log::info!("xpn server listening on {host}:{port}");
    loop {
        let (stream, peer) = match accept_with_backoff(&listener).await {
            Ok(s) => s,
            Err(e) => return Err(e),
        };
        on_connection(SocketConnection::new(stream), peer);
    }
}

async fn accept_with_backoff(listener: &TcpListener) -> XpnResult<(TcpStream, std::net::SocketAddr)> {
    let mut backoff = AcceptBackoff::new();
    loop {
        match listener.accept().await {
            Ok(accepted) => return Ok(accepted),
            Err(e) => {
                if backoff.should_give_up() {
                    return Err(XpnError::Transport(format!("accept loop giving up: {e}")));
                }
                log::warn!("accept() failed, backing off: {e}");
                backoff.spin().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepts_a_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_clone = Arc::clone(&accepted);

        let server = tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
                accepted_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let _client = TcpStream::connect(addr).await.unwrap();
        server.await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
