//! Reading and writing the classic pcap capture format.
//!
//! [`CaptureReader`] yields frames in file order with the link layer located,
//! [`CaptureWriter`] appends whole frames. Both sit on top of `pcap-file` so
//! the files stay byte-compatible with third-party capture tools.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use etherparse::err::linux_sll::{HeaderError as SllHeaderError, HeaderSliceError as SllSliceError};
use etherparse::{
    EtherType, Ethernet2HeaderSlice, LinuxSllHeader, LinuxSllHeaderSlice, LinuxSllProtocolType,
    SingleVlanHeaderSlice,
};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapReader, PcapWriter};
use pcap_file::{DataLink, PcapError};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const VLAN_ETHER_TYPES: [EtherType; 3] = [
    EtherType::VLAN_TAGGED_FRAME,
    EtherType::PROVIDER_BRIDGING,
    EtherType::VLAN_DOUBLE_TAGGED_FRAME,
];
const MAX_VLAN_TAGS: usize = 2;

const NULL_HEADER_LEN: usize = 4;

/// Link-layer encapsulation of every frame in a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Linux cooked capture (v1).
    LinuxSll,
    /// Frames start directly with an IPv4 or IPv6 header.
    RawIp,
    /// BSD loopback: 4-byte address family, then IP.
    Null,
}

impl LinkType {
    fn from_datalink(datalink: DataLink) -> Result<Self> {
        match u32::from(datalink) {
            1 => Ok(LinkType::Ethernet),
            113 => Ok(LinkType::LinuxSll),
            101 | 228 | 229 => Ok(LinkType::RawIp),
            0 | 108 => Ok(LinkType::Null),
            other => Err(Error::Format(format!("unsupported link type {other}"))),
        }
    }

    fn datalink(self) -> DataLink {
        let code: u32 = match self {
            LinkType::Ethernet => 1,
            LinkType::LinuxSll => 113,
            LinkType::RawIp => 101,
            LinkType::Null => 0,
        };
        DataLink::from(code)
    }

    /// Offset of the IP header inside `frame`, or `None` when the link header
    /// is truncated or does not carry IPv4/IPv6.
    pub fn network_offset(self, frame: &[u8]) -> Option<usize> {
        match self {
            LinkType::Ethernet => ethernet_network_offset(frame),
            LinkType::LinuxSll => sll_network_offset(frame),
            LinkType::RawIp => ip_version_at(frame, 0),
            LinkType::Null => ip_version_at(frame, NULL_HEADER_LEN),
        }
    }
}

fn ethernet_network_offset(frame: &[u8]) -> Option<usize> {
    let eth = Ethernet2HeaderSlice::from_slice(frame).ok()?;
    let mut ether_type = eth.ether_type();
    let mut offset = eth.slice().len();

    for _ in 0..MAX_VLAN_TAGS {
        if !VLAN_ETHER_TYPES.contains(&ether_type) {
            break;
        }
        let vlan = SingleVlanHeaderSlice::from_slice(frame.get(offset..)?).ok()?;
        ether_type = vlan.ether_type();
        offset += vlan.slice().len();
    }

    is_ip(ether_type).then_some(offset)
}

fn sll_network_offset(frame: &[u8]) -> Option<usize> {
    let ether_type = match LinuxSllHeaderSlice::from_slice(frame) {
        Ok(sll) => match sll.protocol_type() {
            LinuxSllProtocolType::EtherType(ether_type) => ether_type,
            _ => return None,
        },
        // Loopback and tunnel devices still put an ethertype in the protocol
        // field; etherparse only maps it for the hardware types it knows.
        Err(SllSliceError::Content(SllHeaderError::UnsupportedArpHardwareId { .. })) => {
            let proto = frame.get(LinuxSllHeader::LEN - 2..LinuxSllHeader::LEN)?;
            EtherType(u16::from_be_bytes([proto[0], proto[1]]))
        }
        Err(_) => return None,
    };
    is_ip(ether_type).then_some(LinuxSllHeader::LEN)
}

fn is_ip(ether_type: EtherType) -> bool {
    ether_type == EtherType::IPV4 || ether_type == EtherType::IPV6
}

fn ip_version_at(frame: &[u8], offset: usize) -> Option<usize> {
    match frame.get(offset)? >> 4 {
        4 | 6 => Some(offset),
        _ => None,
    }
}

/// One capture record.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture timestamp, relative to the UNIX epoch.
    pub timestamp: Duration,
    pub data: Vec<u8>,
    network_offset: Option<usize>,
}

impl Frame {
    pub fn new(timestamp: Duration, data: Vec<u8>, link: LinkType) -> Self {
        let network_offset = link.network_offset(&data);
        Self {
            timestamp,
            data,
            network_offset,
        }
    }

    /// The frame with its link-layer header stripped.
    pub fn network(&self) -> Option<&[u8]> {
        self.network_offset.and_then(|offset| self.data.get(offset..))
    }
}

/// Sequential reader over a capture source.
pub struct CaptureReader<R: Read + Seek = BufReader<File>> {
    // Only `None` transiently while rewinding.
    reader: Option<PcapReader<R>>,
    link: LinkType,
    exhausted: bool,
}

impl CaptureReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::open(path, e))?;
        let reader = Self::new(BufReader::new(file))?;
        debug!(path = %path.display(), link = ?reader.link, "opened capture");
        Ok(reader)
    }
}

impl<R: Read + Seek> CaptureReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        let reader = PcapReader::new(inner)?;
        let link = LinkType::from_datalink(reader.header().datalink)?;
        Ok(Self {
            reader: Some(reader),
            link,
            exhausted: false,
        })
    }

    pub fn link_type(&self) -> LinkType {
        self.link
    }

    /// Next frame in file order, or `None` once the capture is exhausted. A
    /// truncated final record counts as the end of the capture.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.exhausted {
            return Ok(None);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        match reader.next_packet() {
            None => {
                self.exhausted = true;
                Ok(None)
            }
            Some(Ok(packet)) => {
                let timestamp = packet.timestamp;
                Ok(Some(Frame::new(timestamp, packet.data.into_owned(), self.link)))
            }
            Some(Err(err)) if is_truncation(&err) => {
                warn!("capture ends with a truncated record, stopping");
                self.exhausted = true;
                Ok(None)
            }
            // Not an end of stream; the caller may retry.
            Some(Err(err)) => Err(err.into()),
        }
    }

    /// Seek back to the first record without reopening the source.
    pub fn rewind(&mut self) -> Result<()> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| Error::Format("capture reader lost during rewind".into()))?;
        let mut inner = reader.into_reader();
        inner.seek(SeekFrom::Start(0))?;
        let reader = PcapReader::new(inner)?;
        self.link = LinkType::from_datalink(reader.header().datalink)?;
        self.reader = Some(reader);
        self.exhausted = false;
        Ok(())
    }
}

fn is_truncation(err: &PcapError) -> bool {
    match err {
        PcapError::IncompleteBuffer => true,
        PcapError::IoError(e) => e.kind() == io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}

/// Append-only capture sink.
pub struct CaptureWriter<W: Write = BufWriter<File>> {
    writer: PcapWriter<W>,
}

impl CaptureWriter {
    /// Start a new capture at `path`, replacing any file already there.
    pub fn create(path: impl AsRef<Path>, link: LinkType) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| Error::open(path, e))?;
        debug!(path = %path.display(), ?link, "created capture");
        Self::new(BufWriter::new(file), link)
    }
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(inner: W, link: LinkType) -> Result<Self> {
        let header = PcapHeader {
            datalink: link.datalink(),
            ..Default::default()
        };
        let writer = PcapWriter::with_header(inner, header)?;
        Ok(Self { writer })
    }

    /// Write one complete record. `frame` must include the link header.
    pub fn write_frame(&mut self, timestamp: Duration, frame: &[u8]) -> Result<()> {
        let orig_len = u32::try_from(frame.len())
            .map_err(|_| Error::InvalidArgument(format!("frame of {} bytes", frame.len())))?;
        let packet = PcapPacket::new(timestamp, orig_len, frame);
        self.writer.write_packet(&packet)?;
        Ok(())
    }

    /// Flush everything written so far and hand back the sink.
    pub fn finish(self) -> Result<W> {
        let mut inner = self.writer.into_writer();
        inner.flush()?;
        Ok(inner)
    }
}
