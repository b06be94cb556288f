//! Core type definitions for tfsproxy
//!
//! This module defines the identifiers, addresses and request descriptors
//! shared by the codec and the protocol engine.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::error::Error;

/// Block identifier inside one cluster
pub type BlockId = u32;

/// File identifier inside one block
pub type FileId = u64;

/// Application identifier assigned by the routing service
pub type AppId = u64;

/// Backend server address in the packed wire form.
///
/// The low 32 bits hold the IPv4 address in network byte order, the high
/// 32 bits hold the port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, From, Into)]
pub struct ServerAddr(u64);

impl ServerAddr {
    /// Create from the packed wire value
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Create from an IPv4 address and port
    #[must_use]
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        let ip = u64::from(u32::from_le_bytes(ip.octets()));
        Self(ip | (u64::from(port) << 32))
    }

    /// Get the packed wire value
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn ip(&self) -> Ipv4Addr {
        #[allow(clippy::cast_possible_truncation)]
        let ip = self.0 as u32;
        Ipv4Addr::from(ip.to_le_bytes())
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        #[allow(clippy::cast_possible_truncation)]
        let port = (self.0 >> 32) as u16;
        port
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip(), self.port()))
    }

    #[must_use]
    pub const fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl From<SocketAddrV4> for ServerAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl FromStr for ServerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddrV4 = s
            .trim()
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid server address {s}: {e}")))?;
        Ok(addr.into())
    }
}

impl fmt::Debug for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerAddr({}:{})", self.ip(), self.port())
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port())
    }
}

impl Serialize for ServerAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServerAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// File-system flavour of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsVersion {
    /// Raw block/file names (`T...`/`L...`)
    Raw,
    /// Hierarchical names served through the meta service
    Custom,
}

/// Action requested by the front end
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReadFile,
    WriteFile,
    StatFile,
    RemoveFile,
    CreateDir,
    CreateFile,
    RemoveDir,
    MoveDir,
    MoveFile,
    ListDir,
    ListFile,
    GetAppId,
    KeepAlive,
}

impl ActionKind {
    /// Actions that only talk to the meta service
    #[must_use]
    pub const fn is_meta_only(self) -> bool {
        matches!(
            self,
            Self::CreateDir
                | Self::CreateFile
                | Self::RemoveDir
                | Self::MoveDir
                | Self::MoveFile
                | Self::ListDir
                | Self::ListFile
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::StatFile => "stat_file",
            Self::RemoveFile => "remove_file",
            Self::CreateDir => "create_dir",
            Self::CreateFile => "create_file",
            Self::RemoveDir => "remove_dir",
            Self::MoveDir => "move_dir",
            Self::MoveFile => "move_file",
            Self::ListDir => "ls_dir",
            Self::ListFile => "ls_file",
            Self::GetAppId => "get_appid",
            Self::KeepAlive => "keepalive",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unlink flavour for raw file removal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlinkType {
    #[default]
    Delete,
    Undelete,
    Conceal,
    Reveal,
}

impl UnlinkType {
    /// Wire value of the unlink mode
    #[must_use]
    pub const fn wire_value(self) -> u32 {
        match self {
            Self::Delete => 0,
            Self::Undelete => 2,
            Self::Conceal => 4,
            Self::Reveal => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_addr_packing() {
        let addr = ServerAddr::new(Ipv4Addr::new(10, 0, 0, 1), 3100);
        assert_eq!(addr.raw() & 0xff, 10);
        assert_eq!(addr.raw() >> 32, 3100);
        assert_eq!(addr.ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(addr.port(), 3100);
        assert_eq!(addr.to_string(), "10.0.0.1:3100");
    }

    #[test]
    fn test_server_addr_parse() {
        let addr: ServerAddr = "192.168.1.20:8108".parse().unwrap();
        assert_eq!(addr.socket_addr().to_string(), "192.168.1.20:8108");
        assert!("not-an-address".parse::<ServerAddr>().is_err());
        assert!(ServerAddr::default().is_unset());
    }

    #[test]
    fn test_action_kind() {
        assert!(ActionKind::ListDir.is_meta_only());
        assert!(!ActionKind::ReadFile.is_meta_only());
        assert_eq!(ActionKind::RemoveFile.to_string(), "remove_file");
    }

    #[test]
    fn test_unlink_wire_value() {
        assert_eq!(UnlinkType::Delete.wire_value(), 0);
        assert_eq!(UnlinkType::Reveal.wire_value(), 6);
    }
}
