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

//! The client-side open-file handle (spec.md §3), grounded on
//! `xpn_file`/`xpn_metadata`: path, flags, the cached header, the current
//! byte offset for the non-`p`-prefixed read/write calls, and one remote fd
//! per server, opened lazily the first time an op touches that server
//! (`initialize_vfh`).

use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use xpn_common::metadata::MetadataHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
}

/// One server's remote file descriptor for this handle, opened on demand.
pub struct RemoteFd {
    pub fd: Mutex<Option<i32>>,
}

impl RemoteFd {
    fn new() -> Self {
        Self { fd: Mutex::new(None) }
    }
}

/// A client-side open file. Shared (`Arc`) between the fd table entry and
/// any in-flight ops against it.
pub struct FileHandle {
    pub path: String,
    pub flags: i32,
    pub mode: u32,
    pub kind: FileKind,
    pub offset: AsyncMutex<i64>,
    pub mdata: Mutex<MetadataHeader>,
    pub remote_fds: Vec<RemoteFd>,
}

impl FileHandle {
    pub fn new(path: String, flags: i32, mode: u32, kind: FileKind, mdata: MetadataHeader, num_servers: u32) -> Self {
        Self {
            path,
            flags,
            mode,
            kind,
            offset: AsyncMutex::new(0),
            mdata: Mutex::new(mdata),
            remote_fds: (0..num_servers).map(|_| RemoteFd::new()).collect(),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.mdata.lock().unwrap().file_size
    }

    pub fn bump_file_size(&self, new_size: u64) -> bool {
        let mut mdata = self.mdata.lock().unwrap();
        if mdata.file_size < new_size {
            mdata.file_size = new_size;
            true
        } else {
            false
        }
    }

    pub fn remote_fd(&self, server: u32) -> Option<i32> {
        *self.remote_fds[server as usize].fd.lock().unwrap()
    }

    pub fn set_remote_fd(&self, server: u32, fd: i32) {
        *self.remote_fds[server as usize].fd.lock().unwrap() = Some(fd);
    }
}
