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

//! The XPN client library (spec.md §3, §4.3): a partition-aware stripe
//! calculator, a metadata manager, and a POSIX-shaped file API sitting on
//! top of [`xpn_transport`]'s connection abstraction, grounded throughout on
//! `original_source/src/xpn_client`.

mod api;
mod connect;
mod fdtable;
mod handle;
mod metadata;
mod rw;
mod stripe;

pub use api::XpnClient;
pub use connect::ServerPool;
pub use handle::{FileHandle, FileKind};
pub use stripe::{map_offset_mdata, ReadWalker, StripeGeometry, StripeOp, WriteWalker};

use fdtable::{DirTable, FdTable};
use std::sync::Arc;
use xpn_common::config::{EnvOverrides, Partition, ServerUrl};
use xpn_transport::Transport;

impl XpnClient {
    /// Bind a parsed partition to a transport, mirroring `xpn_api::init()`:
    /// a [`ServerPool`] is created eagerly (endpoints only, no dialing yet —
    /// see [`connect::ServerPool`]) and the locality hint is resolved once
    /// from the process hostname when `XPN_LOCALITY` is set.
    pub fn connect(partition: Partition, transport: Arc<dyn Transport>, overrides: &EnvOverrides) -> Self {
        let local_server = if overrides.locality {
            detect_local_server(&partition.servers)
        } else {
            None
        };
        Self {
            servers: Arc::new(ServerPool::new(partition.servers.clone(), transport)),
            partition,
            fds: FdTable::new(),
            dirs: DirTable::new(),
            local_server,
            mount_prefix: overrides.mount_point.clone(),
        }
    }

    pub fn num_servers(&self) -> u32 {
        self.servers.num_servers()
    }
}

/// Match the process hostname against each server's configured host,
/// mirroring the original's `m_local_serv` resolution in `xpn_partition`.
/// Returns `None` (no locality hint, not an error) when `gethostname` fails
/// or no configured server matches.
fn detect_local_server(servers: &[ServerUrl]) -> Option<u32> {
    let mut buf = [0u8; 256];
    let ok = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 };
    if !ok {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let hostname = String::from_utf8_lossy(&buf[..len]);
    servers.iter().position(|s| s.host == hostname).map(|i| i as u32)
}
