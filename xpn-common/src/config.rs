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

//! The `XPN_CONF` partition file grammar and `XPN_*` environment overlay
//! (spec.md §6). Layering mirrors the teacher's file-then-env-then-cli
//! config stack: [`Partition::from_file_str`] parses the base config, then
//! [`EnvOverrides::apply`] overlays environment variables exactly like the
//! teacher's `cfgenv` layer sits on top of `cfgfile`.

use crate::error::{XpnError, XpnResult};
use std::{env, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Mpi,
    Sck,
    Fabric,
    File,
}

impl FromStr for Protocol {
    type Err = XpnError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "mpi_server" => Protocol::Mpi,
            "sck_server" => Protocol::Sck,
            "fabric_server" => Protocol::Fabric,
            "file" => Protocol::File,
            other => return Err(XpnError::Protocol(format!("unknown protocol '{other}'"))),
        })
    }
}

/// One `server_url = <protocol>://<host>[:<port>]/<path>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl FromStr for ServerUrl {
    type Err = XpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| XpnError::Protocol(format!("malformed server_url '{s}'")))?;
        let protocol = scheme.parse()?;
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => (
                h.to_owned(),
                Some(p.parse::<u16>().map_err(|_| {
                    XpnError::Protocol(format!("bad port in server_url '{s}'"))
                })?),
            ),
            None => (authority.to_owned(), None),
        };
        Ok(ServerUrl { protocol, host, port, path: format!("/{path}") })
    }
}

/// Parse a `bsize` value: an integer with an optional `K|M|G|B` suffix.
pub fn parse_size(s: &str) -> XpnResult<u64> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some('B') | Some('b') => (&s[..s.len() - 1], 1),
        _ => (s, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * mult)
        .map_err(|_| XpnError::Protocol(format!("bad bsize '{s}'")))
}

/// The parsed `[partition]` section of an `XPN_CONF` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub controller_url: Option<String>,
    pub block_size: u64,
    pub replication_level: u32,
    pub servers: Vec<ServerUrl>,
}

impl Default for Partition {
    fn default() -> Self {
        Self {
            name: String::new(),
            controller_url: None,
            block_size: 512 * 1024,
            replication_level: 0,
            servers: Vec::new(),
        }
    }
}

impl Partition {
    /// Parse the newline-delimited, `[partition]`-sectioned grammar from
    /// spec.md §6. Blank lines and `#`-prefixed comments are ignored.
    pub fn from_file_str(text: &str) -> XpnResult<Self> {
        let mut partition = Partition::default();
        let mut in_partition_section = false;
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                in_partition_section = line.eq_ignore_ascii_case("[partition]");
                continue;
            }
            if !in_partition_section {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| XpnError::Protocol(format!("malformed config line '{line}'")))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "partition_name" => partition.name = value.to_owned(),
                "controller_url" => partition.controller_url = Some(value.to_owned()),
                "bsize" => partition.block_size = parse_size(value)?,
                "replication_level" => {
                    partition.replication_level = value
                        .parse()
                        .map_err(|_| XpnError::Protocol(format!("bad replication_level '{value}'")))?;
                }
                "server_url" => partition.servers.push(value.parse()?),
                other => {
                    log::warn!("ignoring unrecognized config key '{other}'");
                }
            }
        }
        if partition.servers.is_empty() {
            return Err(XpnError::Protocol("partition has no server_url entries".into()));
        }
        Ok(partition)
    }

    /// Load from the path named by `XPN_CONF`.
    pub fn from_env() -> XpnResult<Self> {
        let path = env::var("XPN_CONF")
            .map_err(|_| XpnError::Protocol("XPN_CONF is not set".into()))?;
        let text = std::fs::read_to_string(&path)
            .map_err(|e| XpnError::Protocol(format!("reading XPN_CONF '{path}': {e}")))?;
        Self::from_file_str(&text)
    }

    pub fn num_servers(&self) -> u32 {
        self.servers.len() as u32
    }
}

/// `XPN_*` environment overrides layered on top of a parsed [`Partition`]
/// (spec.md §6). Applied after the file so that an operator can tweak a
/// single knob without editing the config file, matching the teacher's
/// env-over-file precedence.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub sck_port: Option<u16>,
    pub connect_timeout_ms: Option<u64>,
    pub locality: bool,
    pub session_file: bool,
    pub session_dir: bool,
    pub thread_mode: Option<String>,
    pub stats: bool,
    pub group_reads_writes: bool,
    pub debug: bool,
    pub mount_point: Option<String>,
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|v| v == "1").unwrap_or(false)
}

impl EnvOverrides {
    pub fn from_process_env() -> Self {
        Self {
            sck_port: env::var("XPN_SCK_PORT").ok().and_then(|v| v.parse().ok()),
            connect_timeout_ms: env::var("XPN_CONNECT_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()),
            locality: env_flag("XPN_LOCALITY"),
            session_file: env_flag("XPN_SESSION_FILE"),
            session_dir: env_flag("XPN_SESSION_DIR"),
            thread_mode: env::var("XPN_THREAD").ok(),
            stats: env_flag("XPN_STATS"),
            group_reads_writes: env_flag("XPN_GROUP_READS_WRITES"),
            debug: env_flag("XPN_DEBUG"),
            mount_point: env::var("XPN_MOUNT_POINT").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_partition() {
        let text = "\
[partition]
partition_name = demo
bsize = 1M
replication_level = 1
server_url = sck_server://node0:6020/data
server_url = sck_server://node1:6020/data
";
        let p = Partition::from_file_str(text).unwrap();
        assert_eq!(p.name, "demo");
        assert_eq!(p.block_size, 1024 * 1024);
        assert_eq!(p.replication_level, 1);
        assert_eq!(p.servers.len(), 2);
        assert_eq!(p.servers[0].protocol, Protocol::Sck);
        assert_eq!(p.servers[0].host, "node0");
        assert_eq!(p.servers[0].port, Some(6020));
        assert_eq!(p.servers[0].path, "/data");
    }

    #[test]
    fn rejects_partition_without_servers() {
        let text = "[partition]\npartition_name = empty\n";
        assert!(Partition::from_file_str(text).is_err());
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
    }
}
