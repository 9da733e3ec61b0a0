//! Timed re-emission of a capture's datagrams.
//!
//! Datagrams are sent when `(timestamp - first timestamp) / rate` has elapsed
//! since the replay started. Sleeps are cut into slices of at most
//! [`POLL_INTERVAL`] so a [`CancelToken`] is observed promptly.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::packet::PacketInfo;
use crate::playback::PlaybackHandle;

/// Upper bound on how long a cancellation request can go unnoticed.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Set-once flag shared between a replay and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed { packets: u64 },
    Cancelled { packets: u64 },
}

impl ReplayOutcome {
    pub fn packets(self) -> u64 {
        match self {
            ReplayOutcome::Completed { packets } | ReplayOutcome::Cancelled { packets } => packets,
        }
    }

    pub fn is_cancelled(self) -> bool {
        matches!(self, ReplayOutcome::Cancelled { .. })
    }
}

/// Destination for replayed datagrams.
pub trait PacketSink {
    /// `dst_port` is the recorded destination port after port mapping.
    fn emit(&mut self, info: &PacketInfo, dst_port: u16, payload: &[u8]) -> Result<()>;
}

/// Sends each datagram from a local UDP socket to a fixed destination address.
pub struct UdpSink {
    socket: UdpSocket,
    dst_ip: IpAddr,
}

impl UdpSink {
    pub fn bind(src_ip: IpAddr, dst_ip: IpAddr) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(src_ip, 0))?;
        debug!(local = ?socket.local_addr().ok(), %dst_ip, "replay socket bound");
        Ok(Self { socket, dst_ip })
    }
}

impl PacketSink for UdpSink {
    fn emit(&mut self, _info: &PacketInfo, dst_port: u16, payload: &[u8]) -> Result<()> {
        self.socket
            .send_to(payload, SocketAddr::new(self.dst_ip, dst_port))?;
        Ok(())
    }
}

/// Replay from the handle's current position over UDP, blocking until the
/// capture is drained or `cancel` fires.
pub fn replay(handle: &mut PlaybackHandle, rate: f64, cancel: &CancelToken) -> Result<ReplayOutcome> {
    drive(handle, rate, cancel, |h| h.replay_packet())
}

/// Same as [`replay`] but emitting into `sink`.
pub fn replay_with_sink(
    handle: &mut PlaybackHandle,
    rate: f64,
    cancel: &CancelToken,
    sink: &mut dyn PacketSink,
) -> Result<ReplayOutcome> {
    drive(handle, rate, cancel, |h| h.emit_to(&mut *sink))
}

/// Run [`replay`] on its own thread. The handle comes back with the result so
/// it can be reset or closed afterwards.
pub fn spawn_replay(
    mut handle: PlaybackHandle,
    rate: f64,
    cancel: CancelToken,
) -> Result<JoinHandle<(PlaybackHandle, Result<ReplayOutcome>)>> {
    let join = thread::Builder::new()
        .name("replay".into())
        .spawn(move || {
            let result = replay(&mut handle, rate, &cancel);
            (handle, result)
        })?;
    Ok(join)
}

fn drive<F>(handle: &mut PlaybackHandle, rate: f64, cancel: &CancelToken, mut emit: F) -> Result<ReplayOutcome>
where
    F: FnMut(&mut PlaybackHandle) -> Result<bool>,
{
    if !(rate.is_finite() && rate > 0.0) {
        return Err(Error::InvalidArgument(format!("replay rate must be positive, got {rate}")));
    }

    let start = Instant::now();
    let mut first_timestamp = None;
    let mut packets = 0;

    loop {
        if cancel.is_cancelled() {
            return Ok(cancelled(packets, start));
        }
        let Some(info) = handle.next_packet_info()? else {
            break;
        };
        let first = *first_timestamp.get_or_insert(info.timestamp);
        let offset = scaled_offset(info.timestamp.saturating_sub(first), rate)?;

        if !sleep_until(start + offset, cancel) {
            return Ok(cancelled(packets, start));
        }
        if emit(handle)? {
            packets += 1;
        }
    }

    info!(packets, elapsed = ?start.elapsed(), "replay complete");
    Ok(ReplayOutcome::Completed { packets })
}

fn cancelled(packets: u64, start: Instant) -> ReplayOutcome {
    info!(packets, elapsed = ?start.elapsed(), "replay cancelled");
    ReplayOutcome::Cancelled { packets }
}

fn scaled_offset(offset: Duration, rate: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(offset.as_secs_f64() / rate)
        .map_err(|_| Error::InvalidArgument(format!("replay rate {rate} is too small")))
}

/// Sleep until `deadline` in slices of [`POLL_INTERVAL`]. Returns false if
/// cancelled first.
fn sleep_until(deadline: Instant, cancel: &CancelToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(POLL_INTERVAL));
    }
}
