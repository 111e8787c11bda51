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

//! The server-side storage driver (spec.md §4.5): the catalog of handlers in
//! `ops.rs` is implemented against this [`Backend`] trait rather than calling
//! `std::fs` directly, so the disk-backed and in-memory filesystems share one
//! handler implementation. Grounded 1:1 on the POSIX calls in
//! `original_source/src/xpn_server/xpn_server_ops.cpp`.

pub mod disk;
pub mod mem;

use xpn_common::XpnResult;

/// `stat`/`statvfs` result (mirrors `xpn_common::wire::FileAttr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttr {
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub is_dir: bool,
}

/// An open file on whichever backend produced it. Handlers never construct
/// these directly or inspect which variant they hold; they just round-trip
/// whatever `open` returned back into `read_at`/`write_at`/`close`.
pub enum Handle {
    Disk(disk::DiskHandle),
    Mem(mem::MemHandle),
}

pub trait Backend: Send + Sync {
    /// `open(path, flags, mode)`. `EISDIR` is surfaced as
    /// [`xpn_common::XpnError::IsDir`] by implementations, matching the
    /// "session mode returns IS_DIR" handling spec.md §4.5 describes for
    /// OPENDIR but that the original source applies uniformly to `open()`.
    fn open(&self, path: &str, flags: i32, mode: u32) -> XpnResult<Handle>;
    /// `creat(path, mode)`, i.e. `open(O_CREAT|O_WRONLY|O_TRUNC)`.
    fn create(&self, path: &str, mode: u32) -> XpnResult<()>;
    fn close(&self, handle: Handle) -> XpnResult<()>;
    fn read_at(&self, handle: &Handle, offset: u64, buf: &mut [u8]) -> XpnResult<usize>;
    fn write_at(&self, handle: &Handle, offset: u64, buf: &[u8]) -> XpnResult<usize>;
    fn fsync(&self, handle: &Handle) -> XpnResult<()>;
    fn unlink(&self, path: &str) -> XpnResult<()>;
    fn rename(&self, old: &str, new: &str) -> XpnResult<()>;
    fn stat(&self, path: &str) -> XpnResult<FileAttr>;
    fn mkdir(&self, path: &str, mode: u32) -> XpnResult<()>;
    fn rmdir(&self, path: &str) -> XpnResult<()>;
    /// Returns the full, stably-ordered entry list for `path`; `ops.rs`
    /// slices it by an opaque cursor (spec.md §9 "normalize ... to always
    /// ship an opaque cursor").
    fn readdir(&self, path: &str) -> XpnResult<Vec<String>>;
    fn statvfs(&self, path: &str) -> XpnResult<FileAttr>;
    /// Raw header bytes for `READ_MDATA`/`WRITE_MDATA`: read/write the first
    /// `HEADER_SIZE` bytes of `path`, creating it if absent on write.
    fn read_header(&self, path: &str) -> XpnResult<Option<[u8; xpn_common::HEADER_SIZE]>>;
    fn write_header(&self, path: &str, mode: u32, header: &[u8; xpn_common::HEADER_SIZE]) -> XpnResult<()>;
}
