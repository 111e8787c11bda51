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

//! Types shared by the XPN client library and the XPN server: the wire
//! envelope and per-opcode payloads, the on-disk metadata header, the
//! partition configuration grammar and the error taxonomy.

pub mod config;
pub mod error;
pub mod flags;
pub mod metadata;
pub mod path;
pub mod wire;

pub use error::{XpnError, XpnResult};
pub use metadata::{MetadataHeader, HEADER_SIZE, MAGIC};

/// Largest single chunk moved in one READ_FILE/WRITE_FILE wire round trip
/// (see spec.md §4.5 "Server op handlers").
pub const MAX_BUFFER_SIZE: usize = 512 * 1024;
