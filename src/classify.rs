//! Packet classification: IP version, transport, and whether the frame is a
//! whole UDP datagram or one fragment of one.

use std::net::IpAddr;
use std::time::Duration;

use etherparse::{
    IpNumber, Ipv4HeaderSlice, Ipv6ExtensionSlice, Ipv6ExtensionsSlice, Ipv6HeaderSlice,
    UdpHeaderSlice,
};

use crate::capture::Frame;
use crate::packet::{Datagram, IpVersion, PacketInfo};

const UDP_HEADER_LEN: usize = 8;

/// Identifies the datagram a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub id: u32,
}

/// One IP fragment carrying part of a UDP datagram.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub key: FragmentKey,
    pub ip_version: IpVersion,
    /// Byte offset of `data` within the reassembled UDP datagram.
    pub offset: usize,
    pub more_fragments: bool,
    pub data: Vec<u8>,
    pub timestamp: Duration,
}

impl Fragment {
    pub fn end(&self) -> usize {
        self.offset + self.data.len()
    }
}

#[derive(Debug)]
pub enum Classified {
    /// Not IP, malformed, or not UDP. `ip_version` is set when the IP header
    /// itself parsed.
    NonUdp { ip_version: Option<IpVersion> },
    Datagram(Datagram),
    Fragment(Fragment),
}

impl Classified {
    pub fn ip_version(&self) -> Option<IpVersion> {
        match self {
            Classified::NonUdp { ip_version } => *ip_version,
            Classified::Datagram(d) => Some(d.info.ip_version),
            Classified::Fragment(f) => Some(f.ip_version),
        }
    }
}

pub fn classify(frame: &Frame) -> Classified {
    let Some(network) = frame.network() else {
        return Classified::NonUdp { ip_version: None };
    };
    match network.first().map(|b| b >> 4) {
        Some(4) => classify_ipv4(network, frame.timestamp),
        Some(6) => classify_ipv6(network, frame.timestamp),
        _ => Classified::NonUdp { ip_version: None },
    }
}

fn classify_ipv4(data: &[u8], timestamp: Duration) -> Classified {
    let Ok(header) = Ipv4HeaderSlice::from_slice(data) else {
        return Classified::NonUdp { ip_version: None };
    };
    let non_udp = Classified::NonUdp {
        ip_version: Some(IpVersion::V4),
    };

    let header_len = header.slice().len();
    let total_len = usize::from(header.total_len());
    if total_len < header_len || total_len > data.len() {
        return non_udp;
    }
    if header.protocol() != IpNumber::UDP {
        return non_udp;
    }

    let src = IpAddr::V4(header.source_addr());
    let dst = IpAddr::V4(header.destination_addr());
    let payload = &data[header_len..total_len];
    let offset = usize::from(header.fragments_offset().value()) * 8;
    let more_fragments = header.more_fragments();

    if offset == 0 && !more_fragments {
        return match parse_udp(src, dst, payload, timestamp, IpVersion::V4, 1) {
            Some(datagram) => Classified::Datagram(datagram),
            None => non_udp,
        };
    }

    Classified::Fragment(Fragment {
        key: FragmentKey {
            src,
            dst,
            id: u32::from(header.identification()),
        },
        ip_version: IpVersion::V4,
        offset,
        more_fragments,
        data: payload.to_vec(),
        timestamp,
    })
}

fn classify_ipv6(data: &[u8], timestamp: Duration) -> Classified {
    let Ok(header) = Ipv6HeaderSlice::from_slice(data) else {
        return Classified::NonUdp { ip_version: None };
    };
    let non_udp = Classified::NonUdp {
        ip_version: Some(IpVersion::V6),
    };

    let header_len = header.slice().len();
    let end = header_len + usize::from(header.payload_length());
    let Some(rest) = data.get(header_len..end) else {
        return non_udp;
    };
    let parsed = Ipv6ExtensionsSlice::from_slice(header.next_header(), rest);
    let Ok((extensions, next, payload)) = parsed else {
        return non_udp;
    };
    if next != IpNumber::UDP {
        return non_udp;
    }

    let src = IpAddr::V6(header.source_addr());
    let dst = IpAddr::V6(header.destination_addr());
    let fragment = extensions.into_iter().find_map(|ext| match ext {
        Ipv6ExtensionSlice::Fragment(frag) => Some(frag),
        _ => None,
    });

    match fragment {
        Some(frag) if frag.is_fragmenting_payload() => {
            // Only UDP directly behind the fragment header is reassembled.
            if frag.next_header() != IpNumber::UDP {
                return non_udp;
            }
            Classified::Fragment(Fragment {
                key: FragmentKey {
                    src,
                    dst,
                    id: frag.identification(),
                },
                ip_version: IpVersion::V6,
                offset: usize::from(frag.fragment_offset().value()) * 8,
                more_fragments: frag.more_fragments(),
                data: payload.to_vec(),
                timestamp,
            })
        }
        _ => match parse_udp(src, dst, payload, timestamp, IpVersion::V6, 1) {
            Some(datagram) => Classified::Datagram(datagram),
            None => non_udp,
        },
    }
}

/// Parse a complete UDP datagram (header included) into a [`Datagram`].
/// Returns `None` when the UDP header is short or its length field does not
/// fit the bytes on hand.
pub(crate) fn parse_udp(
    src_ip: IpAddr,
    dst_ip: IpAddr,
    udp: &[u8],
    timestamp: Duration,
    ip_version: IpVersion,
    fragments: usize,
) -> Option<Datagram> {
    let header = UdpHeaderSlice::from_slice(udp).ok()?;
    let length = usize::from(header.length());
    if length < UDP_HEADER_LEN || length > udp.len() {
        return None;
    }
    let payload = udp[UDP_HEADER_LEN..length].to_vec();
    Some(Datagram {
        info: PacketInfo {
            src_ip,
            dst_ip,
            src_port: header.source_port(),
            dst_port: header.destination_port(),
            timestamp,
            payload_size: payload.len(),
            ip_version,
            fragments,
        },
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::LinkType;
    use etherparse::{IpFragOffset, Ipv6FragmentHeader, Ipv6Header, PacketBuilder, UdpHeader};

    fn frame(bytes: Vec<u8>) -> Frame {
        Frame::new(Duration::from_secs(1), bytes, LinkType::Ethernet)
    }

    #[test]
    fn ipv4_udp_is_a_datagram() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(7502, 7503);
        let mut bytes = Vec::new();
        builder.write(&mut bytes, b"hello").unwrap();

        let Classified::Datagram(d) = classify(&frame(bytes)) else {
            panic!("expected datagram");
        };
        assert_eq!(d.payload, b"hello");
        assert_eq!(d.info.src_port, 7502);
        assert_eq!(d.info.dst_port, 7503);
        assert_eq!(d.info.ip_version, IpVersion::V4);
        assert_eq!(d.info.src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn ipv6_udp_is_a_datagram() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv6([1; 16], [2; 16], 64)
            .udp(1, 200);
        let mut bytes = Vec::new();
        builder.write(&mut bytes, &[9; 32]).unwrap();

        let classified = classify(&frame(bytes));
        assert_eq!(classified.ip_version(), Some(IpVersion::V6));
        let Classified::Datagram(d) = classified else {
            panic!("expected datagram");
        };
        assert_eq!(d.info.payload_size, 32);
    }

    #[test]
    fn tcp_counts_as_ip_but_not_udp() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(1, 2, 0, 1024);
        let mut bytes = Vec::new();
        builder.write(&mut bytes, b"x").unwrap();

        assert!(matches!(
            classify(&frame(bytes)),
            Classified::NonUdp {
                ip_version: Some(IpVersion::V4)
            }
        ));
    }

    #[test]
    fn garbage_is_not_ip() {
        let mut bytes = vec![0u8; 12];
        bytes.extend_from_slice(&[0x08, 0x00, 0x45, 0x00]);
        assert!(matches!(
            classify(&frame(bytes)),
            Classified::NonUdp { ip_version: None }
        ));
    }

    fn ipv6_frame(next_header: IpNumber, extensions: &[u8], payload: &[u8]) -> Frame {
        let ip = Ipv6Header {
            payload_length: (extensions.len() + payload.len()) as u16,
            next_header,
            hop_limit: 64,
            source: [1; 16],
            destination: [2; 16],
            ..Default::default()
        };
        let mut bytes = Vec::new();
        ip.write(&mut bytes).unwrap();
        bytes.extend_from_slice(extensions);
        bytes.extend_from_slice(payload);
        Frame::new(Duration::from_secs(1), bytes, LinkType::RawIp)
    }

    fn udp_bytes(dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut udp = Vec::new();
        UdpHeader {
            source_port: 1,
            destination_port: dst_port,
            length: (8 + payload.len()) as u16,
            checksum: 0,
        }
        .write(&mut udp)
        .unwrap();
        udp.extend_from_slice(payload);
        udp
    }

    #[test]
    fn ipv6_destination_options_are_skipped() {
        // next header UDP, length 0, PadN covering the remaining 6 bytes
        let options = [17, 0, 1, 4, 0, 0, 0, 0];
        let classified = classify(&ipv6_frame(
            IpNumber::IPV6_DESTINATION_OPTIONS,
            &options,
            &udp_bytes(300, b"opts"),
        ));
        let Classified::Datagram(d) = classified else {
            panic!("expected datagram, got {classified:?}");
        };
        assert_eq!(d.info.dst_port, 300);
        assert_eq!(d.payload, b"opts");
    }

    #[test]
    fn ipv6_fragment_header_marks_a_fragment() {
        let frag = Ipv6FragmentHeader::new(IpNumber::UDP, IpFragOffset::try_new(2).unwrap(), true, 0xabcd);
        let classified = classify(&ipv6_frame(
            IpNumber::IPV6_FRAGMENTATION_HEADER,
            &frag.to_bytes(),
            &[7; 16],
        ));
        let Classified::Fragment(f) = classified else {
            panic!("expected fragment, got {classified:?}");
        };
        assert_eq!(f.key.id, 0xabcd);
        assert_eq!(f.offset, 16);
        assert!(f.more_fragments);
        assert_eq!(f.data, [7; 16]);
    }

    #[test]
    fn ipv6_atomic_fragment_is_a_datagram() {
        let frag = Ipv6FragmentHeader::new(IpNumber::UDP, IpFragOffset::ZERO, false, 1);
        let classified = classify(&ipv6_frame(
            IpNumber::IPV6_FRAGMENTATION_HEADER,
            &frag.to_bytes(),
            &udp_bytes(9, b"whole"),
        ));
        let Classified::Datagram(d) = classified else {
            panic!("expected datagram, got {classified:?}");
        };
        assert_eq!(d.info.fragments, 1);
        assert_eq!(d.payload, b"whole");
    }

    #[test]
    fn udp_length_past_end_is_malformed() {
        let mut udp = vec![0, 1, 0, 2, 0, 100, 0, 0];
        udp.extend_from_slice(&[0; 4]);
        let ip = IpAddr::from([127, 0, 0, 1]);
        assert!(parse_udp(ip, ip, &udp, Duration::ZERO, IpVersion::V4, 1).is_none());
        udp[5] = 12;
        let d = parse_udp(ip, ip, &udp, Duration::ZERO, IpVersion::V4, 1).unwrap();
        assert_eq!(d.info.payload_size, 4);
    }
}
