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

//! The operation envelope (spec.md §4.4, §6) and its typed payloads.
//!
//! On the wire this is opcode + tag-selected bytes; in the implementation we
//! decode straight into a tagged union ([`Request`]) as soon as the opcode is
//! known, rather than carrying an opaque buffer around and casting out of it
//! later (spec.md §9 "Variant-dispatched op payloads").

use crate::metadata::MetadataHeader;
use bytes::{Buf, BufMut, BytesMut};

/// Fixed header preceding every typed request payload.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub op: u32,
    pub tag: u32,
    pub msg_size: u32,
}

impl Envelope {
    pub const WIRE_SIZE: usize = 12;

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.op);
        out.put_u32_le(self.tag);
        out.put_u32_le(self.msg_size);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            op: buf.get_u32_le(),
            tag: buf.get_u32_le(),
            msg_size: buf.get_u32_le(),
        })
    }
}

/// Control side-channel codes (spec.md §4.4), always carried on the TCP
/// control connection regardless of which transport the data connection uses.
///
/// Numbered from a high base disjoint from [`Opcode`]'s range: both are read
/// off the same envelope `op` field, and the dispatcher tries `ControlCode`
/// before `Opcode` (`xpnd/src/dispatcher.rs`), so any overlap would alias a
/// real file operation onto a control code and swallow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlCode {
    Accept = 1000,
    Stats = 1001,
    StatsWindow = 1002,
    Finish = 1003,
    FinishAwait = 1004,
    Ping = 1005,
}

impl ControlCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1000 => Self::Accept,
            1001 => Self::Stats,
            1002 => Self::StatsWindow,
            1003 => Self::Finish,
            1004 => Self::FinishAwait,
            1005 => Self::Ping,
            _ => return None,
        })
    }
}

/// Operation codes dispatched once a connection has reached `Serving`
/// (spec.md §4.5), plus the two that drive the connection out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    OpenFile = 1,
    CreatFile = 2,
    ReadFile = 3,
    WriteFile = 4,
    CloseFile = 5,
    RmFile = 6,
    RmFileAsync = 7,
    RenameFile = 8,
    GetattrFile = 9,
    Mkdir = 10,
    Rmdir = 11,
    RmdirAsync = 12,
    Opendir = 13,
    Readdir = 14,
    Closedir = 15,
    Statvfs = 16,
    ReadMdata = 17,
    WriteMdata = 18,
    WriteMdataFileSize = 19,
    Disconnect = 20,
    Finalize = 21,
}

impl Opcode {
    pub fn from_u32(v: u32) -> Option<Self> {
        use Opcode::*;
        Some(match v {
            1 => OpenFile,
            2 => CreatFile,
            3 => ReadFile,
            4 => WriteFile,
            5 => CloseFile,
            6 => RmFile,
            7 => RmFileAsync,
            8 => RenameFile,
            9 => GetattrFile,
            10 => Mkdir,
            11 => Rmdir,
            12 => RmdirAsync,
            13 => Opendir,
            14 => Readdir,
            15 => Closedir,
            16 => Statvfs,
            17 => ReadMdata,
            18 => WriteMdata,
            19 => WriteMdataFileSize,
            20 => Disconnect,
            21 => Finalize,
            _ => return None,
        })
    }
}

/// `{ret, server_errno}` carried alongside most responses (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub ret: i32,
    pub server_errno: i32,
}

impl Status {
    pub const OK: Status = Status { ret: 0, server_errno: 0 };

    pub fn err(errno: i32) -> Self {
        Status { ret: -1, server_errno: errno }
    }

    pub fn is_ok(&self) -> bool {
        self.ret >= 0
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_i32_le(self.ret);
        out.put_i32_le(self.server_errno);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }
        Some(Self { ret: buf.get_i32_le(), server_errno: buf.get_i32_le() })
    }
}

/// Header sent ahead of each chunk in the READ_FILE reply loop (spec.md §4.5):
/// the server seeks to `off+cont`, reads up to `MAX_BUFFER_SIZE` bytes, sends
/// this header, then the raw chunk bytes when `size > 0`, and repeats until
/// the requested range is exhausted or a short read is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadChunkHeader {
    pub size: i32,
    pub status: Status,
}

impl ReadChunkHeader {
    pub const WIRE_SIZE: usize = 4 + 8;

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_i32_le(self.size);
        self.status.encode(out);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::WIRE_SIZE {
            return None;
        }
        let size = buf.get_i32_le();
        let status = Status::decode(buf)?;
        Some(Self { size, status })
    }
}

/// `stat`/`statvfs` result (spec.md §4.5 GETATTR_FILE/STATVFS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttr {
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub is_dir: bool,
}

fn put_str(out: &mut BytesMut, s: &str) {
    out.put_u32_le(s.len() as u32);
    out.put_slice(s.as_bytes());
}

fn get_str(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).ok()
}

/// A decoded request payload, selected by [`Opcode`].
#[derive(Debug, Clone)]
pub enum Request {
    OpenFile { path: String, flags: i32, mode: u32 },
    CreatFile { path: String, mode: u32 },
    ReadFile { fd: i32, offset: u64, size: u64 },
    WriteFile { fd: i32, offset: u64, size: u64 },
    CloseFile { fd: i32 },
    RmFile { path: String },
    RmFileAsync { path: String },
    RenameFile { old: String, new: String },
    GetattrFile { path: String },
    Mkdir { path: String, mode: u32 },
    Rmdir { path: String },
    RmdirAsync { path: String },
    Opendir { path: String },
    Readdir { cursor: u64 },
    Closedir { cursor: u64 },
    Statvfs { path: String },
    ReadMdata { path: String },
    WriteMdata { path: String, header: MetadataHeader, mode: u32 },
    WriteMdataFileSize { path: String, new_size: u64 },
    Disconnect,
    Finalize,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::OpenFile { .. } => Opcode::OpenFile,
            Request::CreatFile { .. } => Opcode::CreatFile,
            Request::ReadFile { .. } => Opcode::ReadFile,
            Request::WriteFile { .. } => Opcode::WriteFile,
            Request::CloseFile { .. } => Opcode::CloseFile,
            Request::RmFile { .. } => Opcode::RmFile,
            Request::RmFileAsync { .. } => Opcode::RmFileAsync,
            Request::RenameFile { .. } => Opcode::RenameFile,
            Request::GetattrFile { .. } => Opcode::GetattrFile,
            Request::Mkdir { .. } => Opcode::Mkdir,
            Request::Rmdir { .. } => Opcode::Rmdir,
            Request::RmdirAsync { .. } => Opcode::RmdirAsync,
            Request::Opendir { .. } => Opcode::Opendir,
            Request::Readdir { .. } => Opcode::Readdir,
            Request::Closedir { .. } => Opcode::Closedir,
            Request::Statvfs { .. } => Opcode::Statvfs,
            Request::ReadMdata { .. } => Opcode::ReadMdata,
            Request::WriteMdata { .. } => Opcode::WriteMdata,
            Request::WriteMdataFileSize { .. } => Opcode::WriteMdataFileSize,
            Request::Disconnect => Opcode::Disconnect,
            Request::Finalize => Opcode::Finalize,
        }
    }

    /// Encode the payload body (without the envelope header).
    pub fn encode_body(&self) -> BytesMut {
        let mut out = BytesMut::new();
        match self {
            Request::OpenFile { path, flags, mode } => {
                put_str(&mut out, path);
                out.put_i32_le(*flags);
                out.put_u32_le(*mode);
            }
            Request::CreatFile { path, mode } => {
                put_str(&mut out, path);
                out.put_u32_le(*mode);
            }
            Request::ReadFile { fd, offset, size } | Request::WriteFile { fd, offset, size } => {
                out.put_i32_le(*fd);
                out.put_u64_le(*offset);
                out.put_u64_le(*size);
            }
            Request::CloseFile { fd } => out.put_i32_le(*fd),
            Request::RmFile { path } | Request::RmFileAsync { path } => put_str(&mut out, path),
            Request::RenameFile { old, new } => {
                put_str(&mut out, old);
                put_str(&mut out, new);
            }
            Request::GetattrFile { path }
            | Request::Rmdir { path }
            | Request::RmdirAsync { path }
            | Request::Opendir { path }
            | Request::Statvfs { path }
            | Request::ReadMdata { path } => put_str(&mut out, path),
            Request::Mkdir { path, mode } => {
                put_str(&mut out, path);
                out.put_u32_le(*mode);
            }
            Request::Readdir { cursor } | Request::Closedir { cursor } => out.put_u64_le(*cursor),
            Request::WriteMdata { path, header, mode } => {
                put_str(&mut out, path);
                out.put_slice(&header.encode());
                out.put_u32_le(*mode);
            }
            Request::WriteMdataFileSize { path, new_size } => {
                put_str(&mut out, path);
                out.put_u64_le(*new_size);
            }
            Request::Disconnect | Request::Finalize => {}
        }
        out
    }

    pub fn decode(op: Opcode, mut body: &[u8]) -> Option<Self> {
        let buf = &mut body;
        Some(match op {
            Opcode::OpenFile => Request::OpenFile {
                path: get_str(buf)?,
                flags: buf.get_i32_le(),
                mode: buf.get_u32_le(),
            },
            Opcode::CreatFile => Request::CreatFile { path: get_str(buf)?, mode: buf.get_u32_le() },
            Opcode::ReadFile => Request::ReadFile {
                fd: buf.get_i32_le(),
                offset: buf.get_u64_le(),
                size: buf.get_u64_le(),
            },
            Opcode::WriteFile => Request::WriteFile {
                fd: buf.get_i32_le(),
                offset: buf.get_u64_le(),
                size: buf.get_u64_le(),
            },
            Opcode::CloseFile => Request::CloseFile { fd: buf.get_i32_le() },
            Opcode::RmFile => Request::RmFile { path: get_str(buf)? },
            Opcode::RmFileAsync => Request::RmFileAsync { path: get_str(buf)? },
            Opcode::RenameFile => Request::RenameFile { old: get_str(buf)?, new: get_str(buf)? },
            Opcode::GetattrFile => Request::GetattrFile { path: get_str(buf)? },
            Opcode::Mkdir => Request::Mkdir { path: get_str(buf)?, mode: buf.get_u32_le() },
            Opcode::Rmdir => Request::Rmdir { path: get_str(buf)? },
            Opcode::RmdirAsync => Request::RmdirAsync { path: get_str(buf)? },
            Opcode::Opendir => Request::Opendir { path: get_str(buf)? },
            Opcode::Readdir => Request::Readdir { cursor: buf.get_u64_le() },
            Opcode::Closedir => Request::Closedir { cursor: buf.get_u64_le() },
            Opcode::Statvfs => Request::Statvfs { path: get_str(buf)? },
            Opcode::ReadMdata => Request::ReadMdata { path: get_str(buf)? },
            Opcode::WriteMdata => {
                let path = get_str(buf)?;
                if buf.remaining() < crate::metadata::HEADER_SIZE + 4 {
                    return None;
                }
                let mut raw = [0u8; crate::metadata::HEADER_SIZE];
                buf.copy_to_slice(&mut raw);
                let header = MetadataHeader::decode(&raw).unwrap_or(MetadataHeader::zeroed());
                Request::WriteMdata { path, header, mode: buf.get_u32_le() }
            }
            Opcode::WriteMdataFileSize => {
                Request::WriteMdataFileSize { path: get_str(buf)?, new_size: buf.get_u64_le() }
            }
            Opcode::Disconnect => Request::Disconnect,
            Opcode::Finalize => Request::Finalize,
        })
    }
}

/// A decoded response payload. `ReadFile` responses are chunked on the wire
/// (a `{size, status}` header per chunk followed by raw bytes) and are
/// therefore not modeled here; see `xpn-transport` for the chunk loop.
#[derive(Debug, Clone)]
pub enum Response {
    Status(Status),
    OpenFile { status: Status, fd: i32 },
    WriteFile { status: Status, written: u64 },
    Attr { status: Status, attr: FileAttr },
    Opendir { status: Status, cursor: u64 },
    Readdir { status: Status, name: Option<String>, cursor: u64, end: bool },
    Mdata { status: Status, header: MetadataHeader },
}

impl Response {
    pub fn status(&self) -> Status {
        match self {
            Response::Status(s)
            | Response::OpenFile { status: s, .. }
            | Response::WriteFile { status: s, .. }
            | Response::Attr { status: s, .. }
            | Response::Opendir { status: s, .. }
            | Response::Readdir { status: s, .. }
            | Response::Mdata { status: s, .. } => *s,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Response::Status(s) => s.encode(out),
            Response::OpenFile { status, fd } => {
                status.encode(out);
                out.put_i32_le(*fd);
            }
            Response::WriteFile { status, written } => {
                status.encode(out);
                out.put_u64_le(*written);
            }
            Response::Attr { status, attr } => {
                status.encode(out);
                out.put_u64_le(attr.size);
                out.put_u32_le(attr.mode);
                out.put_i64_le(attr.mtime);
                out.put_u8(attr.is_dir as u8);
            }
            Response::Opendir { status, cursor } => {
                status.encode(out);
                out.put_u64_le(*cursor);
            }
            Response::Readdir { status, name, cursor, end } => {
                status.encode(out);
                out.put_u8(name.is_some() as u8);
                if let Some(name) = name {
                    put_str(out, name);
                }
                out.put_u64_le(*cursor);
                out.put_u8(*end as u8);
            }
            Response::Mdata { status, header } => {
                status.encode(out);
                out.put_slice(&header.encode());
            }
        }
    }

    /// Decode a response body. The caller must already know the shape
    /// (it issued the matching [`Request`] and tracks it by `tag`).
    pub fn decode_as(op: Opcode, buf: &mut impl Buf) -> Option<Self> {
        Some(match op {
            Opcode::OpenFile | Opcode::CreatFile => {
                let status = Status::decode(buf)?;
                let fd = if buf.remaining() >= 4 { buf.get_i32_le() } else { -1 };
                Response::OpenFile { status, fd }
            }
            Opcode::WriteFile => {
                let status = Status::decode(buf)?;
                let written = if buf.remaining() >= 8 { buf.get_u64_le() } else { 0 };
                Response::WriteFile { status, written }
            }
            Opcode::GetattrFile | Opcode::Statvfs => {
                let status = Status::decode(buf)?;
                let attr = FileAttr {
                    size: buf.get_u64_le(),
                    mode: buf.get_u32_le(),
                    mtime: buf.get_i64_le(),
                    is_dir: buf.get_u8() != 0,
                };
                Response::Attr { status, attr }
            }
            Opcode::Opendir => {
                let status = Status::decode(buf)?;
                let cursor = buf.get_u64_le();
                Response::Opendir { status, cursor }
            }
            Opcode::Readdir => {
                let status = Status::decode(buf)?;
                let has_name = buf.get_u8() != 0;
                let name = if has_name { get_str(buf) } else { None };
                let cursor = buf.get_u64_le();
                let end = buf.get_u8() != 0;
                Response::Readdir { status, name, cursor, end }
            }
            Opcode::ReadMdata => {
                let status = Status::decode(buf)?;
                let mut raw = [0u8; crate::metadata::HEADER_SIZE];
                if buf.remaining() < raw.len() {
                    return None;
                }
                buf.copy_to_slice(&mut raw);
                let header = MetadataHeader::decode(&raw).unwrap_or(MetadataHeader::zeroed());
                Response::Mdata { status, header }
            }
            _ => Response::Status(Status::decode(buf)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let e = Envelope { op: 4, tag: 0xdead_beef, msg_size: 128 };
        let mut buf = BytesMut::new();
        e.encode(&mut buf);
        let mut reader = &buf[..];
        let back = Envelope::decode(&mut reader).unwrap();
        assert_eq!(back.op, e.op);
        assert_eq!(back.tag, e.tag);
        assert_eq!(back.msg_size, e.msg_size);
    }

    #[test]
    fn open_file_request_roundtrip() {
        let req = Request::OpenFile { path: "/a/b".into(), flags: 0o1, mode: 0o644 };
        let body = req.encode_body();
        let decoded = Request::decode(Opcode::OpenFile, &body).unwrap();
        match decoded {
            Request::OpenFile { path, flags, mode } => {
                assert_eq!(path, "/a/b");
                assert_eq!(flags, 0o1);
                assert_eq!(mode, 0o644);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn write_mdata_carries_header_and_mode() {
        let header = MetadataHeader::new(1024, 1, 0, 3);
        let req = Request::WriteMdata { path: "/f".into(), header, mode: 0o600 };
        let body = req.encode_body();
        let decoded = Request::decode(Opcode::WriteMdata, &body).unwrap();
        match decoded {
            Request::WriteMdata { path, header: h, mode } => {
                assert_eq!(path, "/f");
                assert_eq!(h, header);
                assert_eq!(mode, 0o600);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn read_chunk_header_roundtrip() {
        let h = ReadChunkHeader { size: 4096, status: Status::OK };
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        let mut reader = &buf[..];
        let back = ReadChunkHeader::decode(&mut reader).unwrap();
        assert_eq!(back, h);
    }
}
