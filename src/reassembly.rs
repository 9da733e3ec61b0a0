//! IP fragment reassembly with a bounded amount of in-flight state.
//!
//! Fragments are keyed on (source, destination, identification). Each entry
//! keeps a sparse buffer and the set of byte ranges received so far; the
//! datagram is complete once the terminal fragment has fixed the total length
//! and the ranges cover `[0, total)` without gaps.
//!
//! Memory is bounded two ways, see [`ReassemblyLimits`]. When either bound is
//! hit the entry whose last progress is oldest goes first.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::debug;

use crate::classify::{parse_udp, Fragment, FragmentKey};
use crate::packet::{Datagram, IpVersion};

/// Largest datagram an IP fragment set can describe.
pub const MAX_DATAGRAM_LEN: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Datagrams being reassembled at once. Starting a new one beyond this
    /// evicts the stalest.
    pub max_in_flight: usize,
    /// Total bytes buffered across all in-flight datagrams.
    pub max_buffered_bytes: usize,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            max_buffered_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
pub enum Progress {
    /// Fragment stored (or dropped); the datagram is not complete yet.
    Pending,
    Complete(Datagram),
    /// All bytes arrived but they do not hold a valid UDP datagram.
    Malformed,
}

struct Entry {
    ip_version: IpVersion,
    buffer: Vec<u8>,
    /// start -> end, disjoint and non-adjacent.
    ranges: BTreeMap<usize, usize>,
    total_len: Option<usize>,
    fragments: usize,
    last_progress: u64,
}

impl Entry {
    fn new(ip_version: IpVersion) -> Self {
        Self {
            ip_version,
            buffer: Vec::new(),
            ranges: BTreeMap::new(),
            total_len: None,
            fragments: 0,
            last_progress: 0,
        }
    }

    fn is_complete(&self) -> bool {
        match self.total_len {
            Some(total) => self.ranges.len() == 1 && self.ranges.get(&0) == Some(&total),
            None => false,
        }
    }

    fn insert_range(&mut self, mut start: usize, mut end: usize) {
        if start == end {
            return;
        }
        let touching: Vec<usize> = self
            .ranges
            .range(..=end)
            .filter(|&(_, &e)| e >= start)
            .map(|(&s, _)| s)
            .collect();
        for s in touching {
            if let Some(e) = self.ranges.remove(&s) {
                start = start.min(s);
                end = end.max(e);
            }
        }
        self.ranges.insert(start, end);
    }
}

pub struct Reassembler {
    limits: ReassemblyLimits,
    entries: HashMap<FragmentKey, Entry>,
    buffered: usize,
    clock: u64,
    evicted: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(ReassemblyLimits::default())
    }
}

impl Reassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
            buffered: 0,
            clock: 0,
            evicted: 0,
        }
    }

    pub fn limits(&self) -> ReassemblyLimits {
        self.limits
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Incomplete datagrams dropped to stay within the limits.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Forget all in-flight state and counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.buffered = 0;
        self.clock = 0;
        self.evicted = 0;
    }

    pub fn push(&mut self, fragment: Fragment) -> Progress {
        let key = fragment.key;
        let end = fragment.end();
        if end > MAX_DATAGRAM_LEN {
            debug!(?key, end, "fragment extends past maximum datagram size, dropped");
            return Progress::Pending;
        }

        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.limits.max_in_flight.max(1) {
                if !self.evict_stalest(None) {
                    break;
                }
            }
        }

        self.clock += 1;
        let clock = self.clock;
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| Entry::new(fragment.ip_version));

        if let Some(total) = entry.total_len {
            if end > total || (!fragment.more_fragments && end != total) {
                debug!(?key, end, total, "fragment disagrees with datagram length, dropped");
                return Progress::Pending;
            }
        } else if !fragment.more_fragments {
            if entry.buffer.len() > end {
                debug!(?key, end, "terminal fragment shorter than data received, dropped");
                return Progress::Pending;
            }
            entry.total_len = Some(end);
        }

        if entry.buffer.len() < end {
            self.buffered += end - entry.buffer.len();
            entry.buffer.resize(end, 0);
        }
        entry.buffer[fragment.offset..end].copy_from_slice(&fragment.data);
        entry.insert_range(fragment.offset, end);
        entry.fragments += 1;
        entry.last_progress = clock;

        if entry.is_complete() {
            return self.finish(key, fragment.timestamp);
        }

        while self.buffered > self.limits.max_buffered_bytes {
            if !self.evict_stalest(Some(key)) {
                self.evict(key);
                break;
            }
        }
        Progress::Pending
    }

    fn finish(&mut self, key: FragmentKey, timestamp: Duration) -> Progress {
        let Some(entry) = self.entries.remove(&key) else {
            return Progress::Pending;
        };
        self.buffered -= entry.buffer.len();
        match parse_udp(
            key.src,
            key.dst,
            &entry.buffer,
            timestamp,
            entry.ip_version,
            entry.fragments,
        ) {
            Some(datagram) => Progress::Complete(datagram),
            None => {
                debug!(?key, "reassembled datagram is not valid UDP");
                Progress::Malformed
            }
        }
    }

    /// Evict the entry with the oldest progress, skipping `keep`. Returns
    /// false when there was nothing to evict.
    fn evict_stalest(&mut self, keep: Option<FragmentKey>) -> bool {
        let stalest = self
            .entries
            .iter()
            .filter(|(k, _)| Some(**k) != keep)
            .min_by_key(|(_, e)| e.last_progress)
            .map(|(k, _)| *k);
        match stalest {
            Some(key) => {
                self.evict(key);
                true
            }
            None => false,
        }
    }

    fn evict(&mut self, key: FragmentKey) {
        if let Some(entry) = self.entries.remove(&key) {
            self.buffered -= entry.buffer.len();
            self.evicted += 1;
            debug!(?key, fragments = entry.fragments, "evicted incomplete datagram");
        }
    }
}
