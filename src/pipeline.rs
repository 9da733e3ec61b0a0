//! Reader → classifier → reassembler, with statistics kept on the way.
//!
//! Playback pulls datagrams out one at a time; the offline statistics pass
//! drives the same pipeline to the end and keeps only the [`StreamInfo`].

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use crate::capture::CaptureReader;
use crate::classify::{classify, Classified};
use crate::error::Result;
use crate::packet::Datagram;
use crate::reassembly::{Progress, ReassemblyLimits, Reassembler};
use crate::stream_info::StreamInfo;

/// Outcome of feeding one frame through the pipeline.
pub(crate) enum Step {
    Exhausted,
    /// Frame consumed without completing a datagram.
    Consumed,
    Datagram(Datagram),
}

pub struct Pipeline<R: Read + Seek = BufReader<File>> {
    reader: CaptureReader<R>,
    reassembler: Reassembler,
    stats: StreamInfo,
}

impl Pipeline {
    pub fn open(path: impl AsRef<Path>, limits: ReassemblyLimits) -> Result<Self> {
        Ok(Self::new(CaptureReader::open(path)?, limits))
    }
}

impl<R: Read + Seek> Pipeline<R> {
    pub fn new(reader: CaptureReader<R>, limits: ReassemblyLimits) -> Self {
        Self {
            reader,
            reassembler: Reassembler::new(limits),
            stats: StreamInfo::default(),
        }
    }

    pub fn stats(&self) -> &StreamInfo {
        &self.stats
    }

    /// Next whole UDP datagram, or `None` at end of capture.
    pub fn next_datagram(&mut self) -> Result<Option<Datagram>> {
        loop {
            match self.step()? {
                Step::Exhausted => return Ok(None),
                Step::Consumed => continue,
                Step::Datagram(datagram) => return Ok(Some(datagram)),
            }
        }
    }

    /// Consume frames until the capture ends or `max_frames` have been
    /// processed in total.
    pub fn run(&mut self, max_frames: Option<u64>) -> Result<()> {
        loop {
            if max_frames.is_some_and(|max| self.stats.packets_processed >= max) {
                return Ok(());
            }
            if let Step::Exhausted = self.step()? {
                return Ok(());
            }
        }
    }

    /// Back to the first frame with empty reassembly state and statistics.
    pub fn reset(&mut self) -> Result<()> {
        self.reader.rewind()?;
        self.reassembler.clear();
        self.stats = StreamInfo::default();
        Ok(())
    }

    pub(crate) fn step(&mut self) -> Result<Step> {
        let Some(frame) = self.reader.next_frame()? else {
            return Ok(Step::Exhausted);
        };

        let classified = classify(&frame);
        self.stats.record_frame(frame.timestamp, classified.ip_version());

        let step = match classified {
            Classified::NonUdp { .. } => {
                self.stats.record_non_udp();
                Step::Consumed
            }
            Classified::Datagram(datagram) => Step::Datagram(datagram),
            Classified::Fragment(fragment) => {
                let progress = self.reassembler.push(fragment);
                self.stats.datagrams_evicted = self.reassembler.evicted();
                match progress {
                    Progress::Pending => Step::Consumed,
                    Progress::Complete(datagram) => Step::Datagram(datagram),
                    Progress::Malformed => {
                        self.stats.record_non_udp();
                        Step::Consumed
                    }
                }
            }
        };

        if let Step::Datagram(datagram) = &step {
            self.stats.record_datagram(&datagram.info);
        }
        Ok(step)
    }
}
