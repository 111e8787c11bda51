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

//! The §7 error taxonomy: transport, filesystem, policy and consistency
//! errors, all carried as a single enum so callers can match on `errno()`
//! the way the wire `status` struct expects.

use std::{fmt, io};

pub type XpnResult<T> = Result<T, XpnError>;

#[derive(Debug)]
pub enum XpnError {
    /// A transport-level failure: connect refused, peer closed, send failed.
    Transport(String),
    /// A backing-filesystem error, mapped 1:1 from the server's `errno`.
    Filesystem(io::Error),
    /// `buf == NULL`
    BadAddress,
    /// read on a write-only fd, or an unknown fd
    BadFd,
    /// read/write attempted on a directory handle
    IsDir,
    /// path falls outside every mounted partition
    NotFound,
    /// a server was previously marked errored and is being skipped
    ServerErrored(u32),
    /// all R+1 replicas of a block failed
    AllReplicasFailed,
    /// malformed envelope, payload or configuration
    Protocol(String),
}

impl XpnError {
    /// The numeric code carried in the wire `status` struct (`server_errno`).
    /// Policy and consistency errors use negative sentinels below `-(libc::EHWPOISON)`-range
    /// so they never collide with a real `errno`.
    pub fn as_errno(&self) -> i32 {
        match self {
            XpnError::Filesystem(e) => e.raw_os_error().unwrap_or(-1),
            XpnError::BadAddress => -1001,
            XpnError::BadFd => -1002,
            XpnError::IsDir => -1003,
            XpnError::NotFound => -1004,
            XpnError::ServerErrored(_) => -1005,
            XpnError::AllReplicasFailed => -1006,
            XpnError::Transport(_) => -1007,
            XpnError::Protocol(_) => -1008,
        }
    }
}

impl fmt::Display for XpnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XpnError::Transport(s) => write!(f, "transport error: {s}"),
            XpnError::Filesystem(e) => write!(f, "filesystem error: {e}"),
            XpnError::BadAddress => write!(f, "bad address"),
            XpnError::BadFd => write!(f, "bad file descriptor"),
            XpnError::IsDir => write!(f, "is a directory"),
            XpnError::NotFound => write!(f, "not found"),
            XpnError::ServerErrored(id) => write!(f, "server {id} is marked errored"),
            XpnError::AllReplicasFailed => write!(f, "all replicas failed"),
            XpnError::Protocol(s) => write!(f, "protocol error: {s}"),
        }
    }
}

impl std::error::Error for XpnError {}

impl From<io::Error> for XpnError {
    fn from(e: io::Error) -> Self {
        XpnError::Filesystem(e)
    }
}
