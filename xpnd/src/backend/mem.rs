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

//! The in-memory backing filesystem (spec.md §4.5, "the in-memory backing
//! filesystem implementation details" are out of scope but its *interface*
//! is in scope as an interchangeable `Backend`). Grounded on the node shape
//! of `original_source/src/xpn_server/filesystem/xpn_server_filesystem_memory.hpp`:
//! a tree of file/directory inodes, simplified here to a flat path-keyed map
//! since this backend exists for tests and small deployments, not to match
//! the C++ version's block-chunked storage.

use super::{Backend, FileAttr, Handle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use xpn_common::{XpnError, XpnResult, HEADER_SIZE};

enum Inode {
    File(Arc<Mutex<Vec<u8>>>),
    Dir,
}

pub struct MemHandle {
    data: Arc<Mutex<Vec<u8>>>,
}

pub struct MemBackend {
    nodes: RwLock<HashMap<String, Inode>>,
}

impl Default for MemBackend {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_owned(), Inode::Dir);
        Self { nodes: RwLock::new(nodes) }
    }
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn now() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }
}

impl Backend for MemBackend {
    fn open(&self, path: &str, flags: i32, mode: u32) -> XpnResult<Handle> {
        let nodes = self.nodes.read().unwrap();
        match nodes.get(path) {
            Some(Inode::File(data)) => Ok(Handle::Mem(MemHandle { data: Arc::clone(data) })),
            Some(Inode::Dir) => Err(XpnError::IsDir),
            None => {
                drop(nodes);
                if flags & libc::O_CREAT != 0 {
                    self.create(path, mode)?;
                    self.open(path, flags & !libc::O_CREAT, mode)
                } else {
                    Err(XpnError::NotFound)
                }
            }
        }
    }

    fn create(&self, path: &str, _mode: u32) -> XpnResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        nodes.entry(path.to_owned()).or_insert_with(|| Inode::File(Arc::new(Mutex::new(Vec::new()))));
        if let Some(Inode::File(data)) = nodes.get(path) {
            data.lock().unwrap().clear();
        }
        Ok(())
    }

    fn close(&self, _handle: Handle) -> XpnResult<()> {
        Ok(())
    }

    fn read_at(&self, handle: &Handle, offset: u64, buf: &mut [u8]) -> XpnResult<usize> {
        let data = match handle {
            Handle::Mem(h) => &h.data,
            Handle::Disk(_) => return Err(XpnError::Protocol("mismatched backend handle".into())),
        };
        let data = data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, handle: &Handle, offset: u64, buf: &[u8]) -> XpnResult<usize> {
        let data = match handle {
            Handle::Mem(h) => &h.data,
            Handle::Disk(_) => return Err(XpnError::Protocol("mismatched backend handle".into())),
        };
        let mut data = data.lock().unwrap();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn fsync(&self, _handle: &Handle) -> XpnResult<()> {
        Ok(())
    }

    fn unlink(&self, path: &str) -> XpnResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        match nodes.remove(path) {
            Some(Inode::File(_)) => Ok(()),
            Some(other) => {
                nodes.insert(path.to_owned(), other);
                Err(XpnError::IsDir)
            }
            None => Err(XpnError::NotFound),
        }
    }

    fn rename(&self, old: &str, new: &str) -> XpnResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes.remove(old).ok_or(XpnError::NotFound)?;
        nodes.insert(new.to_owned(), node);
        Ok(())
    }

    fn stat(&self, path: &str) -> XpnResult<FileAttr> {
        let nodes = self.nodes.read().unwrap();
        match nodes.get(path) {
            Some(Inode::File(data)) => Ok(FileAttr {
                size: data.lock().unwrap().len() as u64,
                mode: 0o644,
                mtime: Self::now(),
                is_dir: false,
            }),
            Some(Inode::Dir) => Ok(FileAttr { size: 0, mode: 0o755, mtime: Self::now(), is_dir: true }),
            None => Err(XpnError::NotFound),
        }
    }

    fn mkdir(&self, path: &str, _mode: u32) -> XpnResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(path) {
            return Err(XpnError::Filesystem(std::io::Error::from_raw_os_error(libc::EEXIST)));
        }
        nodes.insert(path.to_owned(), Inode::Dir);
        Ok(())
    }

    fn rmdir(&self, path: &str) -> XpnResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get(path) {
            Some(Inode::Dir) => {
                nodes.remove(path);
                Ok(())
            }
            Some(Inode::File(_)) => Err(XpnError::Filesystem(std::io::Error::from_raw_os_error(libc::ENOTDIR))),
            None => Err(XpnError::NotFound),
        }
    }

    fn readdir(&self, path: &str) -> XpnResult<Vec<String>> {
        let nodes = self.nodes.read().unwrap();
        if !matches!(nodes.get(path), Some(Inode::Dir)) {
            return Err(XpnError::NotFound);
        }
        let prefix = if path == "/" { "/".to_owned() } else { format!("{path}/") };
        let mut entries: Vec<String> = nodes
            .keys()
            .filter_map(|k| {
                k.strip_prefix(&prefix).filter(|rest| !rest.is_empty() && !rest.contains('/')).map(String::from)
            })
            .collect();
        entries.sort();
        Ok(entries)
    }

    fn statvfs(&self, path: &str) -> XpnResult<FileAttr> {
        self.stat(path)
    }

    fn read_header(&self, path: &str) -> XpnResult<Option<[u8; HEADER_SIZE]>> {
        let nodes = self.nodes.read().unwrap();
        match nodes.get(path) {
            Some(Inode::File(data)) => {
                let data = data.lock().unwrap();
                if data.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_SIZE];
                raw.copy_from_slice(&data[..HEADER_SIZE]);
                Ok(Some(raw))
            }
            _ => Ok(None),
        }
    }

    fn write_header(&self, path: &str, mode: u32, header: &[u8; HEADER_SIZE]) -> XpnResult<()> {
        {
            let nodes = self.nodes.read().unwrap();
            if matches!(nodes.get(path), Some(Inode::Dir)) {
                return Ok(());
            }
        }
        let mut nodes = self.nodes.write().unwrap();
        let data = match nodes.entry(path.to_owned()).or_insert_with(|| Inode::File(Arc::new(Mutex::new(Vec::new())))) {
            Inode::File(data) => Arc::clone(data),
            Inode::Dir => return Ok(()),
        };
        drop(nodes);
        let _ = mode;
        let mut data = data.lock().unwrap();
        if data.len() < HEADER_SIZE {
            data.resize(HEADER_SIZE, 0);
        }
        data[..HEADER_SIZE].copy_from_slice(header);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpn_common::metadata::MetadataHeader;

    #[test]
    fn create_write_read_roundtrip() {
        let backend = MemBackend::new();
        backend.create("/f", 0o644).unwrap();
        let handle = backend.open("/f", libc::O_WRONLY, 0o644).unwrap();
        assert_eq!(backend.write_at(&handle, 0, b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(backend.read_at(&handle, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn open_missing_without_creat_is_not_found() {
        let backend = MemBackend::new();
        assert!(matches!(backend.open("/nope", libc::O_RDONLY, 0).unwrap_err(), XpnError::NotFound));
    }

    #[test]
    fn open_on_dir_is_is_dir() {
        let backend = MemBackend::new();
        backend.mkdir("/d", 0o755).unwrap();
        assert!(matches!(backend.open("/d", libc::O_RDONLY, 0).unwrap_err(), XpnError::IsDir));
    }

    #[test]
    fn header_roundtrip() {
        let backend = MemBackend::new();
        let header = MetadataHeader::new(4096, 1, 0, 3).encode();
        backend.write_header("/f", 0o644, &header).unwrap();
        assert_eq!(backend.read_header("/f").unwrap().unwrap(), header);
        assert!(backend.read_header("/g").unwrap().is_none());
    }

    #[test]
    fn readdir_lists_direct_children_only() {
        let backend = MemBackend::new();
        backend.mkdir("/a", 0o755).unwrap();
        backend.create("/a/x", 0o644).unwrap();
        backend.create("/a/y", 0o644).unwrap();
        backend.mkdir("/a/sub", 0o755).unwrap();
        backend.create("/a/sub/z", 0o644).unwrap();
        assert_eq!(backend.readdir("/a").unwrap(), vec!["sub", "x", "y"]);
    }
}
