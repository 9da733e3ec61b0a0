use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::packet::{IpVersion, PacketInfo};

/// Running statistics over a capture pass.
///
/// Port-keyed maps use the UDP destination port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Raw frames read from the capture.
    pub packets_processed: u64,
    /// Whole UDP datagrams produced, fragmented or not.
    pub packets_reassembled: u64,
    pub ipv4_packets: u64,
    pub ipv6_packets: u64,
    /// Frames that are not IP, are malformed, or carry something other than
    /// UDP. Reassembled fragment sets that fail UDP parsing land here too.
    pub non_udp_packets: u64,
    pub port_to_packet_sizes: BTreeMap<u16, BTreeSet<usize>>,
    pub port_to_packet_count: BTreeMap<u16, u64>,
    /// Payload size to the last port seen carrying it.
    pub packet_size_to_port: BTreeMap<usize, u16>,
    /// Incomplete datagrams dropped by the reassembly bound.
    pub datagrams_evicted: u64,
    pub first_timestamp: Option<Duration>,
    pub last_timestamp: Option<Duration>,
}

impl StreamInfo {
    pub(crate) fn record_frame(&mut self, timestamp: Duration, ip_version: Option<IpVersion>) {
        self.packets_processed += 1;
        match ip_version {
            Some(IpVersion::V4) => self.ipv4_packets += 1,
            Some(IpVersion::V6) => self.ipv6_packets += 1,
            None => {}
        }
        self.first_timestamp = Some(self.first_timestamp.map_or(timestamp, |t| t.min(timestamp)));
        self.last_timestamp = Some(self.last_timestamp.map_or(timestamp, |t| t.max(timestamp)));
    }

    pub(crate) fn record_non_udp(&mut self) {
        self.non_udp_packets += 1;
    }

    pub(crate) fn record_datagram(&mut self, info: &PacketInfo) {
        self.packets_reassembled += 1;
        self.port_to_packet_sizes
            .entry(info.dst_port)
            .or_default()
            .insert(info.payload_size);
        *self.port_to_packet_count.entry(info.dst_port).or_default() += 1;
        self.packet_size_to_port
            .insert(info.payload_size, info.dst_port);
    }
}
