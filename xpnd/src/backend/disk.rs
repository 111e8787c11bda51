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

//! The real-filesystem backend: every path is joined onto a configured root
//! directory and the POSIX calls are delegated to `std::fs`/`std::os::unix`,
//! matching `xpn_server_ops.cpp`'s direct `open`/`read`/`write`/`stat` calls.

use super::{Backend, FileAttr, Handle};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::PathBuf;
use xpn_common::{flags, XpnError, XpnResult, HEADER_SIZE};

pub struct DiskHandle {
    file: File,
}

pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> XpnResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// `path` is already partition-relative and `/`-rooted (spec.md §3); we
    /// strip the leading slash before joining onto the root so it can never
    /// escape it via `Path::join`'s absolute-path override.
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn io_err(e: io::Error) -> XpnError {
        XpnError::Filesystem(e)
    }
}

fn is_eisdir(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EISDIR)
}

impl Backend for DiskBackend {
    fn open(&self, path: &str, flags_bits: i32, mode: u32) -> XpnResult<Handle> {
        let full = self.resolve(path);
        let mut opts = flags::to_open_options(flags_bits);
        opts.mode(mode);
        let file = opts.open(&full).map_err(|e| {
            if is_eisdir(&e) {
                XpnError::IsDir
            } else {
                Self::io_err(e)
            }
        })?;
        Ok(Handle::Disk(DiskHandle { file }))
    }

    fn create(&self, path: &str, mode: u32) -> XpnResult<()> {
        let full = self.resolve(path);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&full)
            .map_err(Self::io_err)?;
        Ok(())
    }

    fn close(&self, _handle: Handle) -> XpnResult<()> {
        // dropping the std::fs::File closes the fd
        Ok(())
    }

    fn read_at(&self, handle: &Handle, offset: u64, buf: &mut [u8]) -> XpnResult<usize> {
        match handle {
            Handle::Disk(h) => h.file.read_at(buf, offset).map_err(Self::io_err),
            Handle::Mem(_) => Err(XpnError::Protocol("mismatched backend handle".into())),
        }
    }

    fn write_at(&self, handle: &Handle, offset: u64, buf: &[u8]) -> XpnResult<usize> {
        match handle {
            Handle::Disk(h) => h.file.write_at(buf, offset).map_err(Self::io_err),
            Handle::Mem(_) => Err(XpnError::Protocol("mismatched backend handle".into())),
        }
    }

    fn fsync(&self, handle: &Handle) -> XpnResult<()> {
        match handle {
            Handle::Disk(h) => h.file.sync_data().map_err(Self::io_err),
            Handle::Mem(_) => Err(XpnError::Protocol("mismatched backend handle".into())),
        }
    }

    fn unlink(&self, path: &str) -> XpnResult<()> {
        fs::remove_file(self.resolve(path)).map_err(Self::io_err)
    }

    fn rename(&self, old: &str, new: &str) -> XpnResult<()> {
        let new_full = self.resolve(new);
        if let Some(parent) = new_full.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::rename(self.resolve(old), new_full).map_err(Self::io_err)
    }

    fn stat(&self, path: &str) -> XpnResult<FileAttr> {
        let meta = fs::metadata(self.resolve(path)).map_err(Self::io_err)?;
        Ok(FileAttr {
            size: meta.len(),
            mode: meta.mode(),
            mtime: meta.mtime(),
            is_dir: meta.is_dir(),
        })
    }

    fn mkdir(&self, path: &str, mode: u32) -> XpnResult<()> {
        let full = self.resolve(path);
        std::os::unix::fs::DirBuilder::new()
            .mode(mode)
            .create(&full)
            .map_err(Self::io_err)
    }

    fn rmdir(&self, path: &str) -> XpnResult<()> {
        fs::remove_dir(self.resolve(path)).map_err(Self::io_err)
    }

    fn readdir(&self, path: &str) -> XpnResult<Vec<String>> {
        let mut entries: Vec<String> = fs::read_dir(self.resolve(path))
            .map_err(Self::io_err)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        Ok(entries)
    }

    fn statvfs(&self, path: &str) -> XpnResult<FileAttr> {
        self.stat(path)
    }

    fn read_header(&self, path: &str) -> XpnResult<Option<[u8; HEADER_SIZE]>> {
        let full = self.resolve(path);
        let file = match File::open(&full) {
            Ok(f) => f,
            Err(e) if is_eisdir(&e) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_err(e)),
        };
        let mut raw = [0u8; HEADER_SIZE];
        match file.read_at(&mut raw, 0) {
            Ok(n) if n == HEADER_SIZE => Ok(Some(raw)),
            _ => Ok(None),
        }
    }

    fn write_header(&self, path: &str, mode: u32, header: &[u8; HEADER_SIZE]) -> XpnResult<()> {
        let full = self.resolve(path);
        let file = match OpenOptions::new().write(true).create(true).mode(mode).open(&full) {
            Ok(f) => f,
            Err(e) if is_eisdir(&e) => return Ok(()),
            Err(e) => return Err(Self::io_err(e)),
        };
        file.write_at(header, 0).map_err(Self::io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpn_common::metadata::MetadataHeader;

    #[test]
    fn create_open_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        backend.create("/a/f", 0o644).unwrap();
        let handle = backend.open("/a/f", libc::O_WRONLY, 0o644).unwrap();
        assert_eq!(backend.write_at(&handle, 0, b"hello").unwrap(), 5);
        backend.close(handle).unwrap();

        let handle = backend.open("/a/f", libc::O_RDONLY, 0).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(backend.read_at(&handle, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn open_on_directory_reports_is_dir() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        backend.mkdir("/sub", 0o755).unwrap();
        let err = backend.open("/sub", libc::O_RDONLY, 0).unwrap_err();
        assert!(matches!(err, XpnError::IsDir));
    }

    #[test]
    fn header_roundtrip_and_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        assert!(backend.read_header("/nope").unwrap().is_none());

        let header = MetadataHeader::new(4096, 0, 0, 1).encode();
        backend.write_header("/f", 0o644, &header).unwrap();
        let back = backend.read_header("/f").unwrap().unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn readdir_lists_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        backend.create("/b", 0o644).unwrap();
        backend.create("/a", 0o644).unwrap();
        assert_eq!(backend.readdir("/").unwrap(), vec!["a", "b"]);
    }
}
