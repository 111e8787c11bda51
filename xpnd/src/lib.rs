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

//! The `xpnd` server as a library: `main.rs` is a thin CLI shell over the
//! types exposed here. Split out mainly so `tests/` (and any future
//! `xpn-client` based end-to-end test) can bind a real listener on an
//! ephemeral port and drive the dispatcher in-process, the way the teacher
//! splits engine-vs-CLI between its library modules and `main.rs`.

pub mod backend;
pub mod dispatcher;
pub mod ops;
pub mod registry;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use xpn_common::{XpnError, XpnResult};
use xpn_transport::socket::SocketConnection;

pub use state::ServerState;

/// Bind `host:port` (use port 0 for an ephemeral port) and run the accept
/// loop until `shutdown` fires, handing each accepted connection to
/// [`dispatcher::run`]. Returns the bound address once listening so a caller
/// that requested an ephemeral port can discover what it got.
pub async fn serve(
    state: Arc<ServerState>,
    host: &str,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> XpnResult<()> {
    let (listener, _addr) = bind(host, port).await?;
    accept_until_shutdown(state, listener, &mut shutdown).await;
    Ok(())
}

/// Like [`serve`] but hands the bound address back to the caller immediately
/// (via the returned `SocketAddr`) while accepting in the background task
/// spawned for the caller. Used by tests that need the ephemeral port before
/// they can connect a client.
pub async fn bind(host: &str, port: u16) -> XpnResult<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| XpnError::Transport(format!("binding to {host}:{port}: {e}")))?;
    let addr = listener.local_addr().map_err(|e| XpnError::Transport(format!("local_addr: {e}")))?;
    Ok((listener, addr))
}

/// Drive an already-bound [`TcpListener`] until `shutdown` fires, spawning
/// one [`dispatcher::run`] task per accepted connection.
pub async fn accept_until_shutdown(
    state: Arc<ServerState>,
    listener: TcpListener,
    shutdown: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        let conn = SocketConnection::new(stream);
                        let conn_shutdown = subscribe_from(shutdown);
                        tokio::spawn(dispatcher::run(state, Box::new(conn), peer.to_string(), conn_shutdown));
                    }
                    Err(e) => {
                        log::warn!("accept() failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                log::info!("shutdown signal received, no longer accepting new connections");
                return;
            }
        }
    }
}

fn subscribe_from(shutdown: &broadcast::Receiver<()>) -> broadcast::Receiver<()> {
    shutdown.resubscribe()
}
