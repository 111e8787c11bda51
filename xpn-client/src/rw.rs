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

//! The read/write engine (spec.md §3, §4.3), grounded on
//! `original_source/src/xpn_client/xpn/xpn_api/xpn_api_rw.cpp`'s
//! `pread`/`pwrite`: walk the stripe plan, fan one op out per
//! block(-replica) concurrently, then fold the per-op byte counts back into
//! a single result the way the original's `sum`/`rw_buff.size()` comparison
//! does.
//!
//! Every per-server op here is a network round trip, not CPU work, so unlike
//! the server side (which dispatches disk I/O through [`xpn_worker::Workpool`]
//! to keep the reactor free) the fan-out below just runs as concurrent async
//! tasks: there's no blocking call to shield the runtime from.

use crate::connect::ServerPool;
use crate::handle::FileHandle;
use crate::metadata;
use crate::stripe::{ReadWalker, StripeGeometry, StripeOp, WriteWalker};
use std::sync::Arc;
use xpn_common::flags::{access_mode, AccessMode};
use xpn_common::wire::{Opcode, ReadChunkHeader, Request, Response, Status};
use xpn_common::{XpnError, XpnResult, HEADER_SIZE, MAX_BUFFER_SIZE};

async fn ensure_open(servers: &Arc<ServerPool>, handle: &FileHandle, server: u32) -> XpnResult<i32> {
    if let Some(fd) = handle.remote_fd(server) {
        return Ok(fd);
    }
    let resp = servers
        .request(
            server,
            Request::OpenFile { path: handle.path.clone(), flags: handle.flags, mode: handle.mode },
            Opcode::OpenFile,
        )
        .await?;
    match resp {
        Response::OpenFile { status, fd } if status.is_ok() => {
            handle.set_remote_fd(server, fd);
            Ok(fd)
        }
        Response::OpenFile { status, .. } => Err(XpnError::Filesystem(std::io::Error::from_raw_os_error(status.server_errno))),
        _ => Err(XpnError::Protocol("unexpected response to OPEN_FILE".into())),
    }
}

/// Read one block-replica's worth of bytes from `server` into `out`.
async fn read_one(servers: &Arc<ServerPool>, handle: &Arc<FileHandle>, op: StripeOp, out: &mut [u8]) -> XpnResult<usize> {
    let fd = ensure_open(servers, handle, op.server).await?;
    let mut guard = servers.connection(op.server).await?;
    let conn = guard.as_mut().expect("connection populated by ServerPool::connection");

    let tag = servers.next_tag(op.server);
    let req = Request::ReadFile { fd, offset: op.server_offset + HEADER_SIZE as u64, size: op.len };
    let body = req.encode_body();
    conn.write_operation(
        xpn_common::wire::Envelope { op: Opcode::ReadFile as u32, tag, msg_size: body.len() as u32 },
        &body,
    )
    .await?;

    let mut received = 0usize;
    loop {
        if received >= op.len as usize {
            break;
        }
        let header_bytes = conn.read_data(ReadChunkHeader::WIRE_SIZE, tag).await?;
        let mut reader = &header_bytes[..];
        let header = ReadChunkHeader::decode(&mut reader)
            .ok_or_else(|| XpnError::Protocol("malformed read-chunk header".into()))?;
        if !header.status.is_ok() {
            return Err(XpnError::Filesystem(std::io::Error::from_raw_os_error(header.status.server_errno)));
        }
        if header.size <= 0 {
            break;
        }
        let n = header.size as usize;
        let chunk = conn.read_data(n, tag).await?;
        out[received..received + n].copy_from_slice(&chunk);
        received += n;
    }
    Ok(received)
}

/// Write one block-replica's worth of bytes to `server`.
async fn write_one(servers: &Arc<ServerPool>, handle: &Arc<FileHandle>, op: StripeOp, data: &[u8]) -> XpnResult<usize> {
    let fd = ensure_open(servers, handle, op.server).await?;
    let mut guard = servers.connection(op.server).await?;
    let conn = guard.as_mut().expect("connection populated by ServerPool::connection");

    let tag = servers.next_tag(op.server);
    let req = Request::WriteFile { fd, offset: op.server_offset + HEADER_SIZE as u64, size: op.len };
    let body = req.encode_body();
    conn.write_operation(
        xpn_common::wire::Envelope { op: Opcode::WriteFile as u32, tag, msg_size: body.len() as u32 },
        &body,
    )
    .await?;

    let mut sent = 0usize;
    while sent < data.len() {
        let chunk_len = (data.len() - sent).min(MAX_BUFFER_SIZE);
        conn.write_data(&data[sent..sent + chunk_len], tag).await?;
        sent += chunk_len;
    }

    let (_, mut reply_body) = conn.read_operation().await?;
    match Response::decode_as(Opcode::WriteFile, &mut reply_body) {
        Some(Response::WriteFile { status, written }) if status.is_ok() => Ok(written as usize),
        Some(Response::WriteFile { status, .. }) => {
            Err(XpnError::Filesystem(std::io::Error::from_raw_os_error(status.server_errno)))
        }
        _ => Err(XpnError::Protocol("unexpected response to WRITE_FILE".into())),
    }
}

fn geometry(handle: &FileHandle, num_servers: u32) -> StripeGeometry {
    let mdata = *handle.mdata.lock().unwrap();
    StripeGeometry {
        block_size: mdata.block_size,
        replication_level: mdata.replication_level,
        first_node: mdata.first_node,
        num_servers,
    }
}

/// `pread` (spec.md §4.3): one network round trip per block, reading a
/// single healthy replica of each.
pub async fn pread(
    servers: &Arc<ServerPool>,
    handle: &Arc<FileHandle>,
    buffer: &mut [u8],
    offset: i64,
    local_server: Option<u32>,
) -> XpnResult<i64> {
    if buffer.is_empty() {
        return Ok(0);
    }
    if access_mode(handle.flags) == AccessMode::WriteOnly {
        return Err(XpnError::BadFd);
    }

    let geo = geometry(handle, servers.num_servers());
    let errored = |s: u32| servers.is_errored(s);
    let ops: Vec<StripeOp> = ReadWalker::new(geo, offset as u64, buffer.len() as u64, local_server, &errored).collect();

    let mut handles = Vec::with_capacity(ops.len());
    for op in ops {
        let servers = Arc::clone(servers);
        let handle = Arc::clone(handle);
        handles.push(tokio::spawn(async move {
            let mut local_buf = vec![0u8; op.len as usize];
            let n = read_one(&servers, &handle, op, &mut local_buf).await;
            (op, local_buf, n)
        }));
    }

    let mut total = 0u64;
    for task in handles {
        let (op, local_buf, n) = task.await.map_err(|e| XpnError::Protocol(format!("read task panicked: {e}")))?;
        let n = n?;
        buffer[op.buffer_offset as usize..op.buffer_offset as usize + n].copy_from_slice(&local_buf[..n]);
        total += n as u64;
    }

    Ok(total as i64)
}

/// `pwrite` (spec.md §4.3): `replication_level + 1` ops per block,
/// concurrently. When every replica of every block lands in full, the
/// reported count is the caller's requested size; otherwise (spec.md §9
/// open question, resolved per the original) the reported count is the
/// summed bytes landed divided by `replication_level + 1` — an
/// approximation the original itself makes no stronger claim about.
pub async fn pwrite(servers: &Arc<ServerPool>, handle: &Arc<FileHandle>, buffer: &[u8], offset: i64) -> XpnResult<i64> {
    if buffer.is_empty() {
        return Ok(0);
    }
    if access_mode(handle.flags) == AccessMode::ReadOnly {
        return Err(XpnError::BadFd);
    }
    if handle.kind == crate::handle::FileKind::Dir {
        return Err(XpnError::IsDir);
    }

    let geo = geometry(handle, servers.num_servers());
    let ops: Vec<StripeOp> = WriteWalker::new(geo, offset as u64, buffer.len() as u64).collect();
    let replicas = geo.replication_level as u64 + 1;
    let expected_total: u64 = buffer.len() as u64 * replicas;

    let mut tasks = Vec::with_capacity(ops.len());
    for op in ops {
        let servers = Arc::clone(servers);
        let handle = Arc::clone(handle);
        let chunk = buffer[op.buffer_offset as usize..op.buffer_offset as usize + op.len as usize].to_vec();
        tasks.push(tokio::spawn(async move { write_one(&servers, &handle, op, &chunk).await }));
    }

    let mut sum = 0u64;
    for task in tasks {
        let n = task.await.map_err(|e| XpnError::Protocol(format!("write task panicked: {e}")))??;
        sum += n as u64;
    }

    if sum != expected_total {
        log::warn!(
            "{}: partial write at offset {offset}, {sum}/{expected_total} replica-bytes landed",
            handle.path
        );
        return Ok((sum / replicas) as i64);
    }

    let written = buffer.len() as i64;
    let new_size = offset as u64 + written as u64;
    if handle.bump_file_size(new_size) {
        let mdata = *handle.mdata.lock().unwrap();
        if let Err(e) = metadata::write_metadata_file_size(servers, &handle.path, mdata.replicas(), new_size).await {
            log::warn!("{}: failed to persist extended file_size: {e}", handle.path);
        }
    }

    Ok(written)
}

/// `STATVFS`/`GETATTR_FILE` style status round trip for a single wire
/// request that doesn't need stripe fan-out (used by `stat`, `statvfs`,
/// and the other single-server metadata calls).
pub fn status_to_errno(status: Status) -> Option<i32> {
    if status.is_ok() {
        None
    } else {
        Some(status.server_errno)
    }
}
