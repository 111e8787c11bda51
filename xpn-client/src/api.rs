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

//! The POSIX-shaped surface (spec.md §4.3 "client API"), grounded on
//! `original_source/src/xpn_client/xpn/xpn_api/xpn_api_rw.cpp`'s
//! `open`/`read`/`write`/`lseek` and `xpn_api_xpn.cpp`'s
//! `mkdir`/`rmdir`/`unlink`/`rename`/`opendir`/`readdir`/`closedir`: one
//! method per syscall-shaped operation, wired onto [`FdTable`]/[`DirTable`]
//! for local fd bookkeeping and [`ServerPool`]/[`metadata`]/[`rw`] for the
//! actual wire traffic.

use crate::connect::ServerPool;
use crate::fdtable::{DirStream, DirTable, FdTable};
use crate::handle::{FileHandle, FileKind};
use crate::metadata;
use crate::rw;
use std::io;
use std::sync::Arc;
use xpn_common::config::Partition;
use xpn_common::metadata::MetadataHeader;
use xpn_common::path::master_file;
use xpn_common::wire::{FileAttr, Opcode, Request, Response};
use xpn_common::{XpnError, XpnResult};

/// A bound partition: one [`ServerPool`], the fd/dir tables for locally open
/// streams, and the partition-wide defaults new files are created with.
pub struct XpnClient {
    pub(crate) servers: Arc<ServerPool>,
    pub(crate) partition: Partition,
    pub(crate) fds: FdTable,
    pub(crate) dirs: DirTable,
    pub(crate) local_server: Option<u32>,
    pub(crate) mount_prefix: Option<String>,
}

impl XpnClient {
    fn normalize(&self, path: &str) -> String {
        xpn_common::path::normalize(path, self.mount_prefix.as_deref())
    }

    fn replicas(&self) -> u32 {
        self.partition.replication_level + 1
    }

    /// The underlying connection pool, exposed so an operator (or a test)
    /// can fence a server it has independently determined is unhealthy —
    /// e.g. offline maintenance on one replica — without waiting for the
    /// client to discover the failure itself on the next op (spec.md §4.2
    /// "the affected server is marked errored and skipped").
    pub fn servers(&self) -> &Arc<ServerPool> {
        &self.servers
    }

    pub async fn open(&self, path: &str, flags: i32, mode: u32) -> XpnResult<i32> {
        let normalized = self.normalize(path);
        let header = metadata::read_metadata(&self.servers, &normalized).await?;
        let header = if header.is_valid() {
            header
        } else if flags & libc::O_CREAT != 0 {
            let master = master_file(&normalized, self.servers.num_servers());
            let header = MetadataHeader::new(
                self.partition.block_size,
                self.partition.replication_level,
                master,
                self.servers.num_servers(),
            );
            metadata::write_metadata(&self.servers, &normalized, header, mode).await?;
            header
        } else {
            return Err(XpnError::NotFound);
        };
        let handle = Arc::new(FileHandle::new(normalized, flags, mode, FileKind::File, header, self.servers.num_servers()));
        Ok(self.fds.insert(handle))
    }

    /// `creat(path, mode)`: unconditionally installs a fresh, empty header
    /// at every replica, matching `O_CREAT|O_WRONLY|O_TRUNC`.
    pub async fn creat(&self, path: &str, mode: u32) -> XpnResult<i32> {
        let normalized = self.normalize(path);
        let master = master_file(&normalized, self.servers.num_servers());
        let header = MetadataHeader::new(
            self.partition.block_size,
            self.partition.replication_level,
            master,
            self.servers.num_servers(),
        );
        metadata::write_metadata(&self.servers, &normalized, header, mode).await?;
        let flags = libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC;
        let handle = Arc::new(FileHandle::new(normalized, flags, mode, FileKind::File, header, self.servers.num_servers()));
        Ok(self.fds.insert(handle))
    }

    /// Closes every remote fd this handle ever opened, concurrently.
    pub async fn close(&self, fd: i32) -> XpnResult<()> {
        let handle = self.fds.remove(fd).ok_or(XpnError::BadFd)?;
        let mut tasks = Vec::new();
        for server in 0..self.servers.num_servers() {
            if let Some(remote_fd) = handle.remote_fd(server) {
                let servers = Arc::clone(&self.servers);
                tasks.push(tokio::spawn(async move {
                    servers.request(server, Request::CloseFile { fd: remote_fd }, Opcode::CloseFile).await
                }));
            }
        }
        for task in tasks {
            match task.await {
                Ok(Err(e)) => log::warn!("close: {e}"),
                Err(e) => log::warn!("close task panicked: {e}"),
                Ok(Ok(_)) => {}
            }
        }
        Ok(())
    }

    /// `read(fd, buf)`: `pread` at the handle's current offset, then
    /// advances it by the bytes actually read.
    pub async fn read(&self, fd: i32, buf: &mut [u8]) -> XpnResult<i64> {
        let handle = self.fds.get(fd).ok_or(XpnError::BadFd)?;
        let mut offset = handle.offset.lock().await;
        let n = rw::pread(&self.servers, &handle, buf, *offset, self.local_server).await?;
        *offset += n;
        Ok(n)
    }

    pub async fn pread(&self, fd: i32, buf: &mut [u8], offset: i64) -> XpnResult<i64> {
        let handle = self.fds.get(fd).ok_or(XpnError::BadFd)?;
        rw::pread(&self.servers, &handle, buf, offset, self.local_server).await
    }

    /// `write(fd, buf)`: `pwrite` at the handle's current offset, then
    /// advances it by the reported size (spec.md §9 byte-count caveat).
    pub async fn write(&self, fd: i32, buf: &[u8]) -> XpnResult<i64> {
        let handle = self.fds.get(fd).ok_or(XpnError::BadFd)?;
        let mut offset = handle.offset.lock().await;
        let n = rw::pwrite(&self.servers, &handle, buf, *offset).await?;
        *offset += n;
        Ok(n)
    }

    pub async fn pwrite(&self, fd: i32, buf: &[u8], offset: i64) -> XpnResult<i64> {
        let handle = self.fds.get(fd).ok_or(XpnError::BadFd)?;
        rw::pwrite(&self.servers, &handle, buf, offset).await
    }

    /// `lseek(fd, offset, whence)`, ported 1:1 from `xpn_api_rw.cpp::lseek`:
    /// `SEEK_END` is resolved against the handle's cached file size rather
    /// than a fresh `stat`, since every write that extends a file already
    /// updates that cache (see `FileHandle::bump_file_size`).
    pub async fn lseek(&self, fd: i32, offset: i64, whence: i32) -> XpnResult<i64> {
        let handle = self.fds.get(fd).ok_or(XpnError::BadFd)?;
        let mut cur = handle.offset.lock().await;
        let base = match whence {
            libc::SEEK_SET => 0,
            libc::SEEK_CUR => *cur,
            libc::SEEK_END => handle.file_size() as i64,
            _ => return Err(XpnError::Filesystem(io::Error::from_raw_os_error(libc::EINVAL))),
        };
        let new_offset = base + offset;
        if new_offset < 0 {
            return Err(XpnError::Filesystem(io::Error::from_raw_os_error(libc::EINVAL)));
        }
        *cur = new_offset;
        Ok(new_offset)
    }

    /// Unlike metadata writes, a file's blocks are striped across every
    /// server in the partition (not just its `replicas()`-sized metadata
    /// window), so deletion, rename and directory ops fan out to all of
    /// `num_servers` — master-anchored, same as `fan_out`, just walking the
    /// whole ring instead of stopping after the metadata replica count.
    pub async fn unlink(&self, path: &str) -> XpnResult<()> {
        let normalized = self.normalize(path);
        let n = self.servers.num_servers();
        metadata::fan_out_best_effort(&self.servers, &normalized, n, |p| Request::RmFile { path: p }).await
    }

    /// Fire-and-forget `RM_FILE_ASYNC` (spec.md §4.5): returns as soon as
    /// the fan-out is dispatched, not once every replica has acknowledged it.
    pub async fn unlink_async(&self, path: &str) -> XpnResult<()> {
        let normalized = self.normalize(path);
        let servers = Arc::clone(&self.servers);
        let n = servers.num_servers();
        tokio::spawn(async move {
            if let Err(e) = metadata::fan_out_best_effort(&servers, &normalized, n, |p| Request::RmFileAsync { path: p }).await {
                log::warn!("async unlink of {normalized} failed: {e}");
            }
        });
        Ok(())
    }

    pub async fn rename(&self, old: &str, new: &str) -> XpnResult<()> {
        let old_n = self.normalize(old);
        let new_n = self.normalize(new);
        let n = self.servers.num_servers();
        metadata::fan_out_best_effort(&self.servers, &old_n, n, move |_| Request::RenameFile {
            old: old_n.clone(),
            new: new_n.clone(),
        })
        .await
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> XpnResult<()> {
        let normalized = self.normalize(path);
        let n = self.servers.num_servers();
        metadata::fan_out(&self.servers, &normalized, n, move |p| Request::Mkdir { path: p, mode }).await
    }

    pub async fn rmdir(&self, path: &str) -> XpnResult<()> {
        let normalized = self.normalize(path);
        let n = self.servers.num_servers();
        metadata::fan_out_best_effort(&self.servers, &normalized, n, |p| Request::Rmdir { path: p }).await
    }

    pub async fn rmdir_async(&self, path: &str) -> XpnResult<()> {
        let normalized = self.normalize(path);
        let servers = Arc::clone(&self.servers);
        let n = servers.num_servers();
        tokio::spawn(async move {
            if let Err(e) = metadata::fan_out_best_effort(&servers, &normalized, n, |p| Request::RmdirAsync { path: p }).await {
                log::warn!("async rmdir of {normalized} failed: {e}");
            }
        });
        Ok(())
    }

    /// `opendir(path)`: only the elected master answers `OPENDIR`, and every
    /// subsequent `READDIR`/`CLOSEDIR` against the returned fd must go back
    /// to that same server (spec.md §9 "opaque cursor").
    pub async fn opendir(&self, path: &str) -> XpnResult<i32> {
        let normalized = self.normalize(path);
        let master = master_file(&normalized, self.servers.num_servers());
        let resp = self.servers.request(master, Request::Opendir { path: normalized }, Opcode::Opendir).await?;
        match resp {
            Response::Opendir { status, cursor } if status.is_ok() => {
                Ok(self.dirs.insert(DirStream { server: master, cursor }))
            }
            Response::Opendir { status, .. } => Err(XpnError::Filesystem(io::Error::from_raw_os_error(status.server_errno))),
            _ => Err(XpnError::Protocol("unexpected response to OPENDIR".into())),
        }
    }

    /// Returns `Ok(None)` once the stream is exhausted, leaving the cursor
    /// in place so a second call after exhaustion is harmless.
    pub async fn readdir(&self, dirfd: i32) -> XpnResult<Option<String>> {
        let stream = self.dirs.get(dirfd).ok_or(XpnError::BadFd)?;
        let resp = self
            .servers
            .request(stream.server, Request::Readdir { cursor: stream.cursor }, Opcode::Readdir)
            .await?;
        match resp {
            Response::Readdir { status, name, cursor, .. } if status.is_ok() => {
                self.dirs.update_cursor(dirfd, cursor);
                Ok(name)
            }
            Response::Readdir { status, .. } => Err(XpnError::Filesystem(io::Error::from_raw_os_error(status.server_errno))),
            _ => Err(XpnError::Protocol("unexpected response to READDIR".into())),
        }
    }

    pub async fn closedir(&self, dirfd: i32) -> XpnResult<()> {
        let stream = self.dirs.remove(dirfd).ok_or(XpnError::BadFd)?;
        let resp = self.servers.request(stream.server, Request::Closedir { cursor: stream.cursor }, Opcode::Closedir).await?;
        if resp.status().is_ok() {
            Ok(())
        } else {
            Err(XpnError::Filesystem(io::Error::from_raw_os_error(resp.status().server_errno)))
        }
    }

    /// `stat(path)`: `GETATTR_FILE` against the elected master for
    /// mode/mtime/is_dir, with `size` replaced by the metadata header's
    /// logical `file_size` for regular files. The master's on-disk file
    /// also carries the `HEADER_SIZE` metadata block (and, for N>1, only a
    /// fraction of the striped blocks), so its raw `stat()` size is neither
    /// the header-stripped size nor the whole file's logical size; the
    /// metadata header is the only place that number is kept directly.
    pub async fn stat(&self, path: &str) -> XpnResult<FileAttr> {
        let normalized = self.normalize(path);
        let master = master_file(&normalized, self.servers.num_servers());
        let resp = self
            .servers
            .request(master, Request::GetattrFile { path: normalized.clone() }, Opcode::GetattrFile)
            .await?;
        let mut attr = match resp {
            Response::Attr { status, attr } if status.is_ok() => attr,
            Response::Attr { status, .. } if status.server_errno == libc::ENOENT => return Err(XpnError::NotFound),
            Response::Attr { status, .. } => return Err(XpnError::Filesystem(io::Error::from_raw_os_error(status.server_errno))),
            _ => return Err(XpnError::Protocol("unexpected response to GETATTR_FILE".into())),
        };
        if !attr.is_dir {
            let header = metadata::read_metadata(&self.servers, &normalized).await?;
            attr.size = header.file_size;
        }
        Ok(attr)
    }

    pub async fn statvfs(&self, path: &str) -> XpnResult<FileAttr> {
        let normalized = self.normalize(path);
        let master = master_file(&normalized, self.servers.num_servers());
        let resp = self.servers.request(master, Request::Statvfs { path: normalized }, Opcode::Statvfs).await?;
        match resp {
            Response::Attr { status, attr } if status.is_ok() => Ok(attr),
            Response::Attr { status, .. } => Err(XpnError::Filesystem(io::Error::from_raw_os_error(status.server_errno))),
            _ => Err(XpnError::Protocol("unexpected response to STATVFS".into())),
        }
    }

    /// `dup(fd)`: a purely local fd-table operation. The new fd shares the
    /// same [`FileHandle`] — and therefore the same offset and remote fds —
    /// as `fd`, matching POSIX's shared open-file-description semantics.
    pub fn dup(&self, fd: i32) -> XpnResult<i32> {
        self.fds.dup(fd).map(|(new_fd, _)| new_fd).ok_or(XpnError::BadFd)
    }

    /// `dup2(old_fd, new_fd)`: aliases `new_fd` onto `old_fd`'s handle.
    pub fn dup2(&self, old_fd: i32, new_fd: i32) -> XpnResult<i32> {
        self.fds.dup_onto(old_fd, new_fd).map(|_| new_fd).ok_or(XpnError::BadFd)
    }
}
