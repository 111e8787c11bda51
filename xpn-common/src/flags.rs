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

//! POSIX `open(2)` flag translation, shared by the client (building the
//! flags it passes to `OPEN_FILE`) and the server (turning them into a
//! [`std::fs::OpenOptions`]). Kept here rather than duplicated in both
//! `xpnd` and `xpn-client`.

/// The access-mode bits of a POSIX `open(2)` flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

pub fn access_mode(flags: i32) -> AccessMode {
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => AccessMode::WriteOnly,
        libc::O_RDWR => AccessMode::ReadWrite,
        _ => AccessMode::ReadOnly,
    }
}

pub fn to_open_options(flags: i32) -> std::fs::OpenOptions {
    let mut opts = std::fs::OpenOptions::new();
    match access_mode(flags) {
        AccessMode::ReadOnly => {
            opts.read(true);
        }
        AccessMode::WriteOnly => {
            opts.write(true);
        }
        AccessMode::ReadWrite => {
            opts.read(true).write(true);
        }
    }
    if flags & libc::O_CREAT != 0 {
        opts.create(true);
    }
    if flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_access_mode() {
        assert_eq!(access_mode(libc::O_RDONLY), AccessMode::ReadOnly);
        assert_eq!(access_mode(libc::O_WRONLY), AccessMode::WriteOnly);
        assert_eq!(access_mode(libc::O_RDWR), AccessMode::ReadWrite);
        assert_eq!(access_mode(libc::O_WRONLY | libc::O_CREAT), AccessMode::WriteOnly);
    }
}
