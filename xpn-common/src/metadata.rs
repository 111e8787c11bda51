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

//! The per-file metadata header (spec.md §3). Written as the first
//! [`HEADER_SIZE`] bytes of every replica that holds any block of a file.

/// Fixed pattern used to detect an initialized file.
pub const MAGIC: [u8; 3] = *b"XPN";
/// Format version of the header layout below.
pub const VERSION: u32 = 1;
/// Bytes reserved for the header on every replica holding data. User block 0
/// begins at this offset on the owning server.
pub const HEADER_SIZE: usize = 64;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 3;
const OFF_BLOCK_SIZE: usize = 7;
const OFF_REPLICATION: usize = 15;
const OFF_FIRST_NODE: usize = 19;
const OFF_NUM_SERVERS: usize = 23;
const OFF_FILE_SIZE: usize = 27;
const ENCODED_LEN: usize = OFF_FILE_SIZE + 8;

/// The striping parameters and monotone size bound for one file, as laid out
/// on disk by [`MetadataHeader::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    pub version: u32,
    pub block_size: u64,
    pub replication_level: u32,
    pub first_node: u32,
    pub num_servers: u32,
    pub file_size: u64,
}

impl MetadataHeader {
    /// An all-zero header: "file exists but has no user data yet" per the
    /// consistency-errors rule in spec.md §7.
    pub const fn zeroed() -> Self {
        Self {
            version: 0,
            block_size: 0,
            replication_level: 0,
            first_node: 0,
            num_servers: 0,
            file_size: 0,
        }
    }

    pub const fn new(block_size: u64, replication_level: u32, first_node: u32, num_servers: u32) -> Self {
        Self {
            version: VERSION,
            block_size,
            replication_level,
            first_node,
            num_servers,
            file_size: 0,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.num_servers > 0 && self.block_size > 0
    }

    /// Serialize in host byte order, zero-padded to [`HEADER_SIZE`] (spec.md §6).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 3].copy_from_slice(&MAGIC);
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_ne_bytes());
        buf[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 8].copy_from_slice(&self.block_size.to_ne_bytes());
        buf[OFF_REPLICATION..OFF_REPLICATION + 4]
            .copy_from_slice(&self.replication_level.to_ne_bytes());
        buf[OFF_FIRST_NODE..OFF_FIRST_NODE + 4].copy_from_slice(&self.first_node.to_ne_bytes());
        buf[OFF_NUM_SERVERS..OFF_NUM_SERVERS + 4].copy_from_slice(&self.num_servers.to_ne_bytes());
        buf[OFF_FILE_SIZE..OFF_FILE_SIZE + 8].copy_from_slice(&self.file_size.to_ne_bytes());
        buf
    }

    /// Decode a header previously written by [`encode`](Self::encode). Returns
    /// `None` when the magic is absent: the caller should then treat the file
    /// as having zeroed metadata (spec.md §3 invariants), not as an error.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < ENCODED_LEN || raw[OFF_MAGIC..OFF_MAGIC + 3] != MAGIC {
            return None;
        }
        let u32_at = |off: usize| u32::from_ne_bytes(raw[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_ne_bytes(raw[off..off + 8].try_into().unwrap());
        Some(Self {
            version: u32_at(OFF_VERSION),
            block_size: u64_at(OFF_BLOCK_SIZE),
            replication_level: u32_at(OFF_REPLICATION),
            first_node: u32_at(OFF_FIRST_NODE),
            num_servers: u32_at(OFF_NUM_SERVERS),
            file_size: u64_at(OFF_FILE_SIZE),
        })
    }

    /// Number of distinct servers holding a copy of any given block.
    pub const fn replicas(&self) -> u32 {
        self.replication_level + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let h = MetadataHeader::new(1024, 1, 2, 3);
        let raw = h.encode();
        assert_eq!(raw.len(), HEADER_SIZE);
        let back = MetadataHeader::decode(&raw).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn absent_magic_is_none() {
        let zeros = [0u8; HEADER_SIZE];
        assert!(MetadataHeader::decode(&zeros).is_none());
    }

    #[test]
    fn file_size_is_the_only_field_a_size_update_touches() {
        let mut h = MetadataHeader::new(4096, 0, 0, 1);
        h.file_size = 9000;
        let raw = h.encode();
        let back = MetadataHeader::decode(&raw).unwrap();
        assert_eq!(back.file_size, 9000);
        assert_eq!(back.block_size, 4096);
    }
}
