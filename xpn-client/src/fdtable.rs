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

//! The process-wide client fd table (`m_file_table` in the original),
//! grounded on the same shape as `xpnd::state::FdTable`: small integer
//! handles mapping to shared [`FileHandle`]s, plus `dup`/`dup2` aliasing two
//! fds onto the same underlying handle.

use crate::handle::FileHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

const FIRST_FD: i32 = 3;

#[derive(Default)]
pub struct FdTable {
    next: AtomicI32,
    entries: Mutex<HashMap<i32, Arc<FileHandle>>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self { next: AtomicI32::new(FIRST_FD), entries: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, handle: Arc<FileHandle>) -> i32 {
        let fd = self.next.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(fd, handle);
        fd
    }

    pub fn get(&self, fd: i32) -> Option<Arc<FileHandle>> {
        self.entries.lock().unwrap().get(&fd).cloned()
    }

    pub fn remove(&self, fd: i32) -> Option<Arc<FileHandle>> {
        self.entries.lock().unwrap().remove(&fd)
    }

    /// Alias `new_fd` onto the same handle `old_fd` points at, closing
    /// whatever `new_fd` previously referred to (`dup2` semantics).
    pub fn dup_onto(&self, old_fd: i32, new_fd: i32) -> Option<Arc<FileHandle>> {
        let handle = self.get(old_fd)?;
        self.entries.lock().unwrap().insert(new_fd, Arc::clone(&handle));
        Some(handle)
    }

    /// Allocate a fresh fd aliasing `old_fd`'s handle (`dup` semantics).
    pub fn dup(&self, old_fd: i32) -> Option<(i32, Arc<FileHandle>)> {
        let handle = self.get(old_fd)?;
        let fd = self.insert(Arc::clone(&handle));
        Some((fd, handle))
    }
}

/// One open `OPENDIR` stream: which server answered the `OPENDIR` (every
/// `READDIR`/`CLOSEDIR` against this cursor must go back to that same
/// server) and the cursor it handed back.
#[derive(Debug, Clone, Copy)]
pub struct DirStream {
    pub server: u32,
    pub cursor: u64,
}

#[derive(Default)]
pub struct DirTable {
    next: AtomicI32,
    entries: Mutex<HashMap<i32, DirStream>>,
}

impl DirTable {
    pub fn new() -> Self {
        Self { next: AtomicI32::new(FIRST_FD), entries: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, stream: DirStream) -> i32 {
        let fd = self.next.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(fd, stream);
        fd
    }

    pub fn get(&self, fd: i32) -> Option<DirStream> {
        self.entries.lock().unwrap().get(&fd).copied()
    }

    pub fn update_cursor(&self, fd: i32, cursor: u64) {
        if let Some(s) = self.entries.lock().unwrap().get_mut(&fd) {
            s.cursor = cursor;
        }
    }

    pub fn remove(&self, fd: i32) -> Option<DirStream> {
        self.entries.lock().unwrap().remove(&fd)
    }
}
