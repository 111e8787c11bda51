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

//! The per-connection dispatcher (spec.md §4.4): `Listening -> Handshake ->
//! Serving -> Closing`. One task per accepted connection, grounded on the
//! teacher's `ConnectionHandler::run` loop in `dbnet/connection.rs` — a
//! `tokio::select!` between reading the next operation and a shutdown signal,
//! with a `Drop`-style cleanup (here, `registry.unregister`) on every exit
//! path.

use crate::ops;
use crate::registry::DispatcherState;
use crate::state::ServerState;
use std::sync::Arc;
use tokio::sync::broadcast;
use xpn_common::wire::{ControlCode, Opcode, Request};
use xpn_common::{XpnError, XpnResult};
use xpn_transport::Connection;

/// Drive one accepted connection from handshake to close.
///
/// The control side-channel codes (spec.md §4.4) are read off the same
/// envelope stream as operations: `ACCEPT` moves `Handshake -> Serving`,
/// `STATS`/`STATS_WINDOW`/`PING` are answered without changing state, and
/// `FINISH`/`FINISH_AWAIT` move to `Closing` and end the task.
pub async fn run(
    state: Arc<ServerState>,
    mut conn: Box<dyn Connection>,
    peer: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    let id = state.registry.register(peer.clone());
    log::debug!("connection {id} from {peer}: awaiting handshake");

    let outcome = tokio::select! {
        result = serve(&state, &mut *conn, id) => result,
        _ = shutdown.recv() => {
            log::debug!("connection {id}: shutdown signal, closing");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        log::warn!("connection {id} from {peer} ended with an error: {e}");
    }
    state.registry.set_state(id, DispatcherState::Closing);
    let _ = conn.disconnect().await;
    state.registry.unregister(id);
}

async fn serve(state: &Arc<ServerState>, conn: &mut dyn Connection, id: u64) -> XpnResult<()> {
    loop {
        let (envelope, body) = conn.read_operation().await?;

        if let Some(control) = ControlCode::from_u32(envelope.op) {
            if !handle_control(state, conn, id, control, envelope.tag).await? {
                return Ok(());
            }
            continue;
        }

        let opcode = Opcode::from_u32(envelope.op)
            .ok_or_else(|| XpnError::Protocol(format!("unknown opcode {}", envelope.op)))?;
        let req = Request::decode(opcode, &body)
            .ok_or_else(|| XpnError::Protocol(format!("malformed payload for opcode {}", envelope.op)))?;

        state.registry.record_op(id);
        let keep_going = ops::dispatch(state, conn, envelope.tag, req).await?;
        if !keep_going {
            return Ok(());
        }
    }
}

/// Returns `Ok(true)` to keep serving, `Ok(false)` when the control code ends
/// the connection (`FINISH`/`FINISH_AWAIT`).
async fn handle_control(
    state: &Arc<ServerState>,
    conn: &mut dyn Connection,
    id: u64,
    control: ControlCode,
    tag: u32,
) -> XpnResult<bool> {
    match control {
        ControlCode::Accept => {
            state.registry.set_state(id, DispatcherState::Serving);
            log::debug!("connection {id}: handshake complete, now serving");
            ack(conn, tag).await?;
            Ok(true)
        }
        ControlCode::Ping => {
            ack(conn, tag).await?;
            Ok(true)
        }
        ControlCode::Stats | ControlCode::StatsWindow => {
            let snapshot = state.registry.snapshot();
            let mut body = bytes::BytesMut::new();
            body.extend_from_slice(&(snapshot.connections as u64).to_le_bytes());
            body.extend_from_slice(&snapshot.ops_served.to_le_bytes());
            conn.write_operation(
                xpn_common::wire::Envelope { op: control as u32, tag, msg_size: body.len() as u32 },
                &body,
            )
            .await?;
            Ok(true)
        }
        ControlCode::Finish | ControlCode::FinishAwait => {
            ack(conn, tag).await?;
            Ok(false)
        }
    }
}

async fn ack(conn: &mut dyn Connection, tag: u32) -> XpnResult<()> {
    conn.write_operation(xpn_common::wire::Envelope { op: ControlCode::Ping as u32, tag, msg_size: 0 }, &[])
        .await
}
