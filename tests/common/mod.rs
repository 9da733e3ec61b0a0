#![allow(dead_code)]

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use etherparse::{EtherType, Ethernet2Header, IpFragOffset, IpNumber, Ipv4Header, PacketBuilder};
use pcap_file::pcap::{PcapPacket, PcapWriter};

/// Write an Ethernet capture holding `frames` in order.
pub fn write_capture(path: &Path, frames: &[(Duration, Vec<u8>)]) {
    let file = BufWriter::new(File::create(path).unwrap());
    let mut writer = PcapWriter::new(file).unwrap();
    for (timestamp, data) in frames {
        let packet = PcapPacket::new(*timestamp, data.len() as u32, data);
        writer.write_packet(&packet).unwrap();
    }
}

pub fn udp_v4(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([192, 168, 1, 10], [192, 168, 1, 20], 64)
        .udp(src_port, dst_port);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

pub fn udp_v6(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut src = [0u8; 16];
    src[0] = 0xfd;
    src[15] = 1;
    let mut dst = src;
    dst[15] = 2;
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv6(src, dst, 64)
        .udp(src_port, dst_port);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

/// One IPv4 fragment of a UDP datagram. `offset` is in bytes and must be a
/// multiple of 8; `data` is the slice of the UDP datagram (header included)
/// this fragment carries.
pub fn ipv4_fragment(id: u16, offset: usize, more_fragments: bool, data: &[u8]) -> Vec<u8> {
    let mut ip = Ipv4Header::new(data.len() as u16, 64, IpNumber::UDP, [192, 168, 1, 10], [192, 168, 1, 20])
        .unwrap();
    ip.identification = id;
    ip.more_fragments = more_fragments;
    ip.fragment_offset = IpFragOffset::try_new((offset / 8) as u16).unwrap();
    ip.header_checksum = ip.calc_header_checksum();

    let mut frame = Ethernet2Header {
        source: [2, 0, 0, 0, 0, 1],
        destination: [2, 0, 0, 0, 0, 2],
        ether_type: EtherType::IPV4,
    }
    .to_bytes()
    .to_vec();
    ip.write(&mut frame).unwrap();
    frame.extend_from_slice(data);
    frame
}

/// Ethernet frame claiming IPv4 but cut off inside the IP header.
pub fn truncated_ipv4() -> Vec<u8> {
    let mut frame = udp_v4(1, 2, b"x");
    frame.truncate(14 + 10);
    frame
}

pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

pub fn ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
