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

//! Path normalization and the master-file election hash (spec.md §3, §9
//! "Master-file election by path hash"). `std`'s `DefaultHasher` is seeded
//! per-process and would disagree between a client and a server, so this
//! uses a fixed-table CRC32 instead: any stable hash works per spec.md, and
//! `crc` is already part of this workspace's dependency stack.

use crc::{Crc, CRC_32_ISO_HDLC};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Normalize a user-supplied path: strip the partition mount prefix if
/// present, collapse to a `/`-rooted, prefix-free path with no trailing
/// slash (except the root itself).
pub fn normalize(path: &str, mount_prefix: Option<&str>) -> String {
    let stripped = match mount_prefix {
        Some(prefix) if path.starts_with(prefix) => &path[prefix.len()..],
        _ => path,
    };
    let mut normalized = String::with_capacity(stripped.len() + 1);
    if !stripped.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(stripped);
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// `master_file(path) = hash(path) mod num_servers` (spec.md §3). Identical
/// on the client and every server: both sides only need the normalized path
/// and the partition size.
pub fn master_file(normalized_path: &str, num_servers: u32) -> u32 {
    assert!(num_servers > 0, "a partition must have at least one server");
    let digest = CASTAGNOLI.checksum(normalized_path.as_bytes());
    digest % num_servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_mount_prefix() {
        assert_eq!(normalize("/xpn/a/b", Some("/xpn")), "/a/b");
        assert_eq!(normalize("a/b", None), "/a/b");
        assert_eq!(normalize("/a/b/", None), "/a/b");
        assert_eq!(normalize("/", None), "/");
    }

    #[test]
    fn master_file_is_stable_and_deterministic() {
        let a = master_file("/some/file", 7);
        let b = master_file("/some/file", 7);
        assert_eq!(a, b);
        assert!(a < 7);
    }

    #[test]
    fn master_file_distributes_across_the_partition() {
        let n = 5;
        let hits: Vec<u32> = (0..50)
            .map(|i| master_file(&format!("/file-{i}"), n))
            .collect();
        assert!(hits.iter().any(|&h| h != hits[0]), "expected more than one master to be hit");
    }
}
