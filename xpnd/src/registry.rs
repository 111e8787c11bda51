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

//! The connection registry backing the `STATS`/`STATS_WINDOW` control codes
//! (spec.md §4.4, §6), grounded on the bookkeeping `xpn_server_db.cpp` keeps
//! per accepted connection. A plain `Mutex<HashMap<..>>` plays the role the
//! teacher reaches for a sharded concurrent map for at larger scale; one
//! server process here fields a connection count low enough that a single
//! lock never becomes the bottleneck a `Corestore`-style shard table exists
//! to avoid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Listening,
    Handshake,
    Serving,
    Closing,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: String,
    pub state: DispatcherState,
    pub accepted_at: Instant,
    pub ops_served: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub connections: usize,
    pub ops_served: u64,
}

pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), connections: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, peer: String) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = ConnectionInfo {
            peer,
            state: DispatcherState::Handshake,
            accepted_at: Instant::now(),
            ops_served: 0,
        };
        self.connections.lock().unwrap().insert(id, info);
        id
    }

    pub fn set_state(&self, id: u64, state: DispatcherState) {
        if let Some(info) = self.connections.lock().unwrap().get_mut(&id) {
            info.state = state;
        }
    }

    pub fn record_op(&self, id: u64) {
        if let Some(info) = self.connections.lock().unwrap().get_mut(&id) {
            info.ops_served += 1;
        }
    }

    pub fn unregister(&self, id: u64) {
        self.connections.lock().unwrap().remove(&id);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let connections = self.connections.lock().unwrap();
        StatsSnapshot {
            connections: connections.len(),
            ops_served: connections.values().map(|c| c.ops_served).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_record_and_unregister_round_trip() {
        let registry = ConnectionRegistry::new();
        let id = registry.register("127.0.0.1:9000".into());
        registry.set_state(id, DispatcherState::Serving);
        registry.record_op(id);
        registry.record_op(id);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.ops_served, 2);

        registry.unregister(id);
        assert_eq!(registry.snapshot().connections, 0);
    }
}
