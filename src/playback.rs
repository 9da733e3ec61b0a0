//! Pull-model playback of a capture, one reassembled datagram at a time.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::packet::{Datagram, PacketInfo, PortMap};
use crate::pipeline::Pipeline;
use crate::reassembly::ReassemblyLimits;
use crate::replay::{PacketSink, UdpSink};
use crate::stream_info::StreamInfo;

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Local address the replay socket binds to.
    pub src_ip: IpAddr,
    /// Where replayed datagrams are sent.
    pub dst_ip: IpAddr,
    pub port_map: PortMap,
    pub reassembly: ReassemblyLimits,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_map: PortMap::default(),
            reassembly: ReassemblyLimits::default(),
        }
    }
}

/// An open capture positioned somewhere in its datagram sequence.
///
/// Owned by one reader at a time; nothing inside is shared.
pub struct PlaybackHandle {
    path: PathBuf,
    pipeline: Pipeline,
    current: Option<Datagram>,
    config: PlaybackConfig,
    sink: Option<UdpSink>,
}

impl PlaybackHandle {
    pub fn open(path: impl AsRef<Path>, config: PlaybackConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pipeline = Pipeline::open(&path, config.reassembly)?;
        info!(path = %path.display(), dst = %config.dst_ip, "playback initialized");
        Ok(Self {
            path,
            pipeline,
            current: None,
            config,
            sink: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn port_map(&self) -> &PortMap {
        &self.config.port_map
    }

    /// Statistics for the frames consumed since open or the last reset.
    pub fn stream_info(&self) -> &StreamInfo {
        self.pipeline.stats()
    }

    /// Advance to the next datagram and describe it. `None` marks the end of
    /// the stream and leaves no current packet.
    pub fn next_packet_info(&mut self) -> Result<Option<PacketInfo>> {
        self.current = self.pipeline.next_datagram()?;
        Ok(self.current.as_ref().map(|d| d.info.clone()))
    }

    pub fn current(&self) -> Option<&Datagram> {
        self.current.as_ref()
    }

    /// Copy the current payload into `buf`, returning its length.
    ///
    /// `buf` must be strictly larger than the payload; the spare byte lets
    /// callers detect datagrams longer than they expected.
    pub fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let datagram = self.current.as_ref().ok_or(Error::NoCurrentPacket)?;
        let size = datagram.payload.len();
        if buf.len() <= size {
            return Err(Error::BufferTooSmall {
                needed: size + 1,
                capacity: buf.len(),
            });
        }
        buf[..size].copy_from_slice(&datagram.payload);
        Ok(size)
    }

    /// Rewind to the first frame, dropping reassembly state, statistics and
    /// the current packet. The file stays open.
    pub fn reset(&mut self) -> Result<()> {
        self.pipeline.reset()?;
        self.current = None;
        debug!(path = %self.path.display(), "playback reset");
        Ok(())
    }

    /// Send the current datagram to `sink` with its destination port mapped.
    /// Returns false when there is no current packet.
    pub fn emit_to(&self, sink: &mut dyn PacketSink) -> Result<bool> {
        let Some(datagram) = self.current.as_ref() else {
            return Ok(false);
        };
        let dst_port = self.config.port_map.map(datagram.info.dst_port);
        sink.emit(&datagram.info, dst_port, &datagram.payload)?;
        Ok(true)
    }

    /// Send the current datagram over UDP to the configured destination.
    pub fn replay_packet(&mut self) -> Result<bool> {
        if self.current.is_none() {
            return Ok(false);
        }
        let mut sink = match self.sink.take() {
            Some(sink) => sink,
            None => UdpSink::bind(self.config.src_ip, self.config.dst_ip)?,
        };
        let sent = self.emit_to(&mut sink);
        self.sink = Some(sink);
        sent
    }
}

pub fn replay_initialize(
    path: impl AsRef<Path>,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    port_map: PortMap,
) -> Result<PlaybackHandle> {
    PlaybackHandle::open(
        path,
        PlaybackConfig {
            src_ip,
            dst_ip,
            port_map,
            ..Default::default()
        },
    )
}

/// Close the capture and release the replay socket.
pub fn replay_uninitialize(handle: PlaybackHandle) {
    debug!(path = %handle.path.display(), "playback closed");
    drop(handle);
}

pub fn replay_reset(handle: &mut PlaybackHandle) -> Result<()> {
    handle.reset()
}

pub fn next_packet_info(handle: &mut PlaybackHandle) -> Result<Option<PacketInfo>> {
    handle.next_packet_info()
}

pub fn read_packet(handle: &PlaybackHandle, buf: &mut [u8]) -> Result<usize> {
    handle.read_packet(buf)
}

pub fn replay_packet(handle: &mut PlaybackHandle) -> Result<bool> {
    handle.replay_packet()
}

/// Run the whole capture (or its first `max_packets` frames) through the
/// pipeline and return the statistics.
pub fn replay_get_pcap_info(path: impl AsRef<Path>, max_packets: Option<u64>) -> Result<StreamInfo> {
    let path = path.as_ref();
    let mut pipeline = Pipeline::open(path, ReassemblyLimits::default())?;
    pipeline.run(max_packets)?;
    let stats = pipeline.stats().clone();
    info!(
        path = %path.display(),
        processed = stats.packets_processed,
        reassembled = stats.packets_reassembled,
        "capture scanned"
    );
    Ok(stats)
}
