//! Capture, reassemble and replay UDP sensor traffic stored in pcap files.
//!
//! Playback is a pull pipeline: [`capture::CaptureReader`] →
//! [`classify::classify`] → [`reassembly::Reassembler`], with
//! [`StreamInfo`] accumulated along the way. [`PlaybackHandle`] yields one
//! datagram at a time, [`replay()`] paces them out on the wire, and
//! [`RecordHandle`] writes datagrams to a new capture.

pub mod capture;
pub mod classify;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod playback;
pub mod reassembly;
pub mod record;
pub mod replay;
pub mod stream_info;

pub use error::{Error, Result};
pub use packet::{Datagram, IpVersion, PacketInfo, PortMap};
pub use playback::{
    next_packet_info, read_packet, replay_get_pcap_info, replay_initialize, replay_packet,
    replay_reset, replay_uninitialize, PlaybackConfig, PlaybackHandle,
};
pub use reassembly::ReassemblyLimits;
pub use record::{
    record_initialize, record_packet, record_packet_at, record_uninitialize, RecordConfig,
    RecordHandle,
};
pub use replay::{
    replay, replay_with_sink, spawn_replay, CancelToken, PacketSink, ReplayOutcome, UdpSink,
};
pub use stream_info::StreamInfo;
