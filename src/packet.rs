use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

/// Header metadata of one reassembled UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Capture time of the frame that completed the datagram.
    pub timestamp: Duration,
    /// UDP payload size in bytes.
    pub payload_size: usize,
    pub ip_version: IpVersion,
    /// Number of IP fragments the datagram arrived in; 1 if unfragmented.
    pub fragments: usize,
}

/// A whole UDP datagram: metadata plus payload.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub info: PacketInfo,
    pub payload: Vec<u8>,
}

/// Recorded port to replay port. Unmapped ports pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap(HashMap<u16, u16>);

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: u16, to: u16) -> Option<u16> {
        self.0.insert(from, to)
    }

    pub fn map(&self, port: u16) -> u16 {
        self.0.get(&port).copied().unwrap_or(port)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<u16, u16>> for PortMap {
    fn from(map: HashMap<u16, u16>) -> Self {
        Self(map)
    }
}

impl FromIterator<(u16, u16)> for PortMap {
    fn from_iter<I: IntoIterator<Item = (u16, u16)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
