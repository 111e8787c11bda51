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

//! Per-server connection management (spec.md §5), grounded on
//! `xpn_partition`/`xpn_data_server`'s lazy `nfi_connect` + persistent
//! `m_error` flag: one connection is dialed per server on first use and kept
//! open; a server that fails is marked errored so the stripe calculator
//! routes around it instead of retrying it on every subsequent op.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use xpn_common::config::ServerUrl;
use xpn_common::wire::{Envelope, Opcode, Request, Response};
use xpn_common::{XpnError, XpnResult};
use xpn_transport::{Connection, Transport};

/// One partition member: its endpoint, a lazily-dialed connection, and the
/// sticky error flag the calculator consults before routing a block there.
pub struct ServerSlot {
    pub url: ServerUrl,
    conn: AsyncMutex<Option<Box<dyn Connection>>>,
    errored: AtomicBool,
    tag: AtomicU32,
}

impl ServerSlot {
    fn new(url: ServerUrl) -> Self {
        Self { url, conn: AsyncMutex::new(None), errored: AtomicBool::new(false), tag: AtomicU32::new(0) }
    }

    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Relaxed)
    }

    fn mark_errored(&self) {
        self.errored.store(true, Ordering::Relaxed);
    }

    fn next_tag(&self) -> u32 {
        self.tag.fetch_add(1, Ordering::Relaxed)
    }
}

/// The partition's live connections, one per server (spec.md §5
/// "client-initiated transport connect"). Shared by every open file handle.
pub struct ServerPool {
    pub slots: Vec<Arc<ServerSlot>>,
    transport: Arc<dyn Transport>,
}

impl ServerPool {
    pub fn new(servers: Vec<ServerUrl>, transport: Arc<dyn Transport>) -> Self {
        Self { slots: servers.into_iter().map(|u| Arc::new(ServerSlot::new(u))).collect(), transport }
    }

    pub fn num_servers(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_errored(&self, server: u32) -> bool {
        self.slots[server as usize].is_errored()
    }

    /// Send `req` to `server` and decode its reply as `reply_op`, dialing
    /// the connection on first use. A send/recv failure marks the server
    /// errored and is surfaced as [`XpnError::ServerErrored`].
    pub async fn request(&self, server: u32, req: Request, reply_op: Opcode) -> XpnResult<Response> {
        let slot = Arc::clone(&self.slots[server as usize]);
        if slot.is_errored() {
            return Err(XpnError::ServerErrored(server));
        }

        let mut guard = slot.conn.lock().await;
        if guard.is_none() {
            match self.transport.connect(&slot.url).await {
                Ok(conn) => *guard = Some(conn),
                Err(e) => {
                    slot.mark_errored();
                    log::warn!("server {server} ({}): connect failed: {e}", slot.url.host);
                    return Err(XpnError::ServerErrored(server));
                }
            }
        }
        let conn = guard.as_mut().expect("connection populated above");

        let tag = slot.next_tag();
        let body = req.encode_body();
        let op = req.opcode();
        let result = conn
            .write_operation(Envelope { op: op as u32, tag, msg_size: body.len() as u32 }, &body)
            .await;

        if let Err(e) = result {
            slot.mark_errored();
            *guard = None;
            log::warn!("server {server} ({}): send failed: {e}", slot.url.host);
            return Err(XpnError::ServerErrored(server));
        }

        match conn.read_operation().await {
            Ok((_, mut body)) => Response::decode_as(reply_op, &mut body)
                .ok_or_else(|| XpnError::Protocol(format!("malformed response from server {server}"))),
            Err(e) => {
                slot.mark_errored();
                *guard = None;
                log::warn!("server {server} ({}): recv failed: {e}", slot.url.host);
                Err(XpnError::ServerErrored(server))
            }
        }
    }

    /// Like [`request`](Self::request) but for `READ_FILE`/`WRITE_FILE`,
    /// which carry raw data outside the envelope body: hands back the locked
    /// connection itself so the caller can drive the chunk loop directly.
    pub async fn connection(&self, server: u32) -> XpnResult<tokio::sync::MutexGuard<'_, Option<Box<dyn Connection>>>> {
        let slot = &self.slots[server as usize];
        if slot.is_errored() {
            return Err(XpnError::ServerErrored(server));
        }
        let mut guard = slot.conn.lock().await;
        if guard.is_none() {
            match self.transport.connect(&slot.url).await {
                Ok(conn) => *guard = Some(conn),
                Err(e) => {
                    slot.mark_errored();
                    log::warn!("server {server} ({}): connect failed: {e}", slot.url.host);
                    return Err(XpnError::ServerErrored(server));
                }
            }
        }
        Ok(guard)
    }

    pub fn mark_errored(&self, server: u32) {
        self.slots[server as usize].mark_errored();
    }

    pub async fn clear_connection(&self, server: u32) {
        *self.slots[server as usize].conn.lock().await = None;
    }

    pub fn next_tag(&self, server: u32) -> u32 {
        self.slots[server as usize].next_tag()
    }
}
