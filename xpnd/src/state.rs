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

//! Process-wide server state shared by every connection's dispatcher task:
//! the backing [`Backend`], the worker pool, the connection registry used by
//! `STATS`/`STATS_WINDOW`, the open-fd table (spec.md §3 "Server open-file
//! state"), and the per-path size-metadata mutex (spec.md §3 "Per-file
//! write-metadata mutex").

use crate::backend::{Backend, Handle};
use crate::registry::ConnectionRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use xpn_worker::Workpool;

/// Whether an opened fd keeps its backend [`Handle`] alive between requests
/// (session mode) or is reopened per op against the stored path (sessionless
/// mode, spec.md GLOSSARY "Session mode").
pub struct FdEntry {
    pub path: String,
    pub flags: i32,
    pub mode: u32,
    pub handle: Option<Handle>,
}

/// fds handed back to clients are opaque small integers, not real OS fds;
/// starting the counter away from 0..2 just keeps them visually distinct
/// from stdio in logs.
const FIRST_FD: i32 = 3;

pub struct FdTable {
    next: AtomicI32,
    entries: Mutex<HashMap<i32, FdEntry>>,
}

impl FdTable {
    fn new() -> Self {
        Self { next: AtomicI32::new(FIRST_FD), entries: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, entry: FdEntry) -> i32 {
        let fd = self.next.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(fd, entry);
        fd
    }

    pub fn with<R>(&self, fd: i32, f: impl FnOnce(&mut FdEntry) -> R) -> Option<R> {
        self.entries.lock().unwrap().get_mut(&fd).map(f)
    }

    pub fn remove(&self, fd: i32) -> Option<FdEntry> {
        self.entries.lock().unwrap().remove(&fd)
    }
}

/// An open directory stream, normalized to an opaque cursor into a
/// pre-listed, stably-sorted entry vector regardless of session mode
/// (spec.md §9 "normalize ... to always ship an opaque cursor" — the
/// REDESIGN this spec calls for over the session-mode `DIR*`-on-the-wire
/// behavior the original source used).
pub struct DirEntry {
    pub entries: Vec<String>,
    pub cursor: usize,
}

pub struct DirTable {
    next: AtomicI32,
    entries: Mutex<HashMap<i32, DirEntry>>,
}

impl DirTable {
    fn new() -> Self {
        Self { next: AtomicI32::new(FIRST_FD), entries: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, entries: Vec<String>) -> i32 {
        let cursor_fd = self.next.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(cursor_fd, DirEntry { entries, cursor: 0 });
        cursor_fd
    }

    pub fn with<R>(&self, cursor_fd: i32, f: impl FnOnce(&mut DirEntry) -> R) -> Option<R> {
        self.entries.lock().unwrap().get_mut(&cursor_fd).map(f)
    }

    pub fn remove(&self, cursor_fd: i32) -> Option<DirEntry> {
        self.entries.lock().unwrap().remove(&cursor_fd)
    }
}

/// Sharded per-path mutex map guarding `WRITE_MDATA_FILE_SIZE`'s
/// compare-and-advance (spec.md §4.3, §3). The original source uses one
/// global `pthread_mutex_t`; spec.md's own data-model section calls this out
/// as a *per-file* mutex, so sharding by path here is a deliberate, documented
/// improvement over the literal original rather than a behavior change (see
/// DESIGN.md).
#[derive(Default)]
pub struct PathMutexes {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PathMutexes {
    fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(path.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Run `f` while holding the lock for `path`. The guard is dropped before
    /// returning, matching the "under a per-file mutex" wording rather than a
    /// long-lived held lock across request boundaries.
    pub fn with_path_locked<R>(&self, path: &str, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();
        f()
    }
}

pub struct ServerState {
    pub backend: Arc<dyn Backend>,
    pub workpool: Workpool,
    pub registry: ConnectionRegistry,
    pub fds: FdTable,
    pub dirs: DirTable,
    pub size_mutexes: PathMutexes,
    /// Session mode keeps the backend `Handle` open across requests;
    /// sessionless mode (`XPN_SESSION_FILE=0`) reopens per op.
    pub session_mode: bool,
}

impl ServerState {
    pub fn new(backend: Arc<dyn Backend>, workpool: Workpool, session_mode: bool) -> Self {
        Self {
            backend,
            workpool,
            registry: ConnectionRegistry::new(),
            fds: FdTable::new(),
            dirs: DirTable::new(),
            size_mutexes: PathMutexes::default(),
            session_mode,
        }
    }
}
