//! Writing UDP datagrams to a capture file.
//!
//! Each datagram is framed as link header + IP + UDP. Datagrams that do not
//! fit in `frag_size` bytes of IP packet are split into IP fragments, so the
//! resulting file replays through the same reassembly path as live traffic.

use std::fs::File;
use std::io::BufWriter;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use etherparse::{
    ArpHardwareId, EtherType, Ethernet2Header, IpFragOffset, IpNumber, Ipv4Header,
    Ipv6FragmentHeader, Ipv6Header, LinuxSllHeader, LinuxSllPacketType, LinuxSllProtocolType,
    UdpHeader,
};
use tracing::{debug, info};

use crate::capture::{CaptureWriter, LinkType};
use crate::error::{Error, Result};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const IPV6_FRAGMENT_HEADER_LEN: usize = 8;
const UDP_HEADER_LEN: usize = 8;
const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - UDP_HEADER_LEN;
const TTL: u8 = 64;

const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

#[derive(Debug, Clone)]
pub struct RecordConfig {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Largest IP packet written; bigger datagrams are fragmented.
    pub frag_size: usize,
    /// Linux cooked capture framing instead of Ethernet.
    pub use_sll_encapsulation: bool,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            src_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dst_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            frag_size: 1500,
            use_sll_encapsulation: false,
        }
    }
}

impl RecordConfig {
    fn validate(&self) -> Result<()> {
        let ip_overhead = match (self.src_ip, self.dst_ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) => IPV4_HEADER_LEN,
            (IpAddr::V6(_), IpAddr::V6(_)) => IPV6_HEADER_LEN + IPV6_FRAGMENT_HEADER_LEN,
            _ => {
                return Err(Error::InvalidArgument(
                    "source and destination must be the same IP version".into(),
                ))
            }
        };
        if self.frag_size < ip_overhead + 8 {
            return Err(Error::InvalidArgument(format!(
                "frag_size {} leaves no room for fragment data",
                self.frag_size
            )));
        }
        Ok(())
    }

    fn link_type(&self) -> LinkType {
        if self.use_sll_encapsulation {
            LinkType::LinuxSll
        } else {
            LinkType::Ethernet
        }
    }
}

/// An open capture being appended to. Single writer.
pub struct RecordHandle {
    writer: CaptureWriter<BufWriter<File>>,
    config: RecordConfig,
    next_id: u32,
    wall_start: Duration,
    clock_start: Instant,
    packets: u64,
}

impl RecordHandle {
    /// Start a new capture at `path`. An existing file there is replaced;
    /// records are then only ever appended until [`RecordHandle::finish`].
    pub fn create(path: impl AsRef<Path>, config: RecordConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let writer = CaptureWriter::create(path, config.link_type())?;
        let wall_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        info!(path = %path.display(), src = %config.src_ip, dst = %config.dst_ip, "recording");
        Ok(Self {
            writer,
            config,
            next_id: 1,
            wall_start,
            clock_start: Instant::now(),
            packets: 0,
        })
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Record with a timestamp from the handle's clock: wall time at creation
    /// plus monotonic time since, so timestamps never go backwards.
    pub fn record_packet(&mut self, src_port: u16, dst_port: u16, payload: &[u8]) -> Result<()> {
        let timestamp = self.wall_start + self.clock_start.elapsed();
        self.record_packet_at(src_port, dst_port, payload, timestamp)
    }

    /// Record with an explicit timestamp (since the UNIX epoch). Every frame
    /// of the datagram is built before any is written.
    pub fn record_packet_at(
        &mut self,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
        timestamp: Duration,
    ) -> Result<()> {
        if payload.len() > MAX_UDP_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes does not fit in a UDP datagram",
                payload.len()
            )));
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let frames = build_frames(&self.config, id, src_port, dst_port, payload)?;
        for frame in &frames {
            self.writer.write_frame(timestamp, frame)?;
        }
        self.packets += 1;
        debug!(src_port, dst_port, size = payload.len(), frames = frames.len(), "recorded");
        Ok(())
    }

    /// Flush buffered frames and sync the file to disk.
    pub fn finish(self) -> Result<()> {
        let buffered = self.writer.finish()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        info!(packets = self.packets, "recording closed");
        Ok(())
    }
}

pub fn record_initialize(path: impl AsRef<Path>, config: RecordConfig) -> Result<RecordHandle> {
    RecordHandle::create(path, config)
}

pub fn record_packet(handle: &mut RecordHandle, src_port: u16, dst_port: u16, payload: &[u8]) -> Result<()> {
    handle.record_packet(src_port, dst_port, payload)
}

pub fn record_packet_at(
    handle: &mut RecordHandle,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
    timestamp: Duration,
) -> Result<()> {
    handle.record_packet_at(src_port, dst_port, payload, timestamp)
}

pub fn record_uninitialize(handle: RecordHandle) -> Result<()> {
    handle.finish()
}

fn build_frames(
    config: &RecordConfig,
    id: u32,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<Vec<Vec<u8>>> {
    let udp = UdpHeader {
        source_port: src_port,
        destination_port: dst_port,
        length: (UDP_HEADER_LEN + payload.len()) as u16,
        checksum: 0,
    };
    let mut datagram = Vec::with_capacity(UDP_HEADER_LEN + payload.len());
    datagram.extend_from_slice(&udp.to_bytes());
    datagram.extend_from_slice(payload);

    match (config.src_ip, config.dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            ipv4_frames(config, id as u16, src.octets(), dst.octets(), &datagram)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            ipv6_frames(config, id, src.octets(), dst.octets(), &datagram)
        }
        _ => Err(Error::InvalidArgument(
            "source and destination must be the same IP version".into(),
        )),
    }
}

fn ipv4_frames(
    config: &RecordConfig,
    id: u16,
    src: [u8; 4],
    dst: [u8; 4],
    datagram: &[u8],
) -> Result<Vec<Vec<u8>>> {
    let chunk = (config.frag_size - IPV4_HEADER_LEN) / 8 * 8;
    let fragmented = IPV4_HEADER_LEN + datagram.len() > config.frag_size;
    let chunk = if fragmented { chunk } else { datagram.len().max(1) };

    let mut frames = Vec::new();
    for (i, data) in datagram.chunks(chunk).enumerate() {
        let offset = i * chunk;
        let mut ip = Ipv4Header::new(data.len() as u16, TTL, IpNumber::UDP, src, dst)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        ip.identification = id;
        ip.more_fragments = offset + data.len() < datagram.len();
        ip.fragment_offset = IpFragOffset::try_new((offset / 8) as u16)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        ip.header_checksum = ip.calc_header_checksum();

        let mut frame = link_header(config, EtherType::IPV4);
        ip.write(&mut frame)?;
        frame.extend_from_slice(data);
        frames.push(frame);
    }
    Ok(frames)
}

fn ipv6_frames(
    config: &RecordConfig,
    id: u32,
    src: [u8; 16],
    dst: [u8; 16],
    datagram: &[u8],
) -> Result<Vec<Vec<u8>>> {
    if IPV6_HEADER_LEN + datagram.len() <= config.frag_size {
        let ip = Ipv6Header {
            payload_length: datagram.len() as u16,
            next_header: IpNumber::UDP,
            hop_limit: TTL,
            source: src,
            destination: dst,
            ..Default::default()
        };
        let mut frame = link_header(config, EtherType::IPV6);
        ip.write(&mut frame)?;
        frame.extend_from_slice(datagram);
        return Ok(vec![frame]);
    }

    let chunk = (config.frag_size - IPV6_HEADER_LEN - IPV6_FRAGMENT_HEADER_LEN) / 8 * 8;
    let mut frames = Vec::new();
    for (i, data) in datagram.chunks(chunk).enumerate() {
        let offset = i * chunk;
        let ip = Ipv6Header {
            payload_length: (IPV6_FRAGMENT_HEADER_LEN + data.len()) as u16,
            next_header: IpNumber::IPV6_FRAGMENTATION_HEADER,
            hop_limit: TTL,
            source: src,
            destination: dst,
            ..Default::default()
        };
        let fragment_offset = IpFragOffset::try_new((offset / 8) as u16)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let frag = Ipv6FragmentHeader::new(
            IpNumber::UDP,
            fragment_offset,
            offset + data.len() < datagram.len(),
            id,
        );

        let mut frame = link_header(config, EtherType::IPV6);
        ip.write(&mut frame)?;
        frag.write(&mut frame)?;
        frame.extend_from_slice(data);
        frames.push(frame);
    }
    Ok(frames)
}

fn link_header(config: &RecordConfig, ether_type: EtherType) -> Vec<u8> {
    if config.use_sll_encapsulation {
        let mut sender_address = [0u8; 8];
        sender_address[..SRC_MAC.len()].copy_from_slice(&SRC_MAC);
        LinuxSllHeader {
            packet_type: LinuxSllPacketType::HOST,
            arp_hrd_type: ArpHardwareId::ETHER,
            sender_address_valid_length: SRC_MAC.len() as u16,
            sender_address,
            protocol_type: LinuxSllProtocolType::EtherType(ether_type),
        }
        .to_bytes()
        .to_vec()
    } else {
        Ethernet2Header {
            source: SRC_MAC,
            destination: DST_MAC,
            ether_type,
        }
        .to_bytes()
        .to_vec()
    }
}
