//! Bounded RTP reordering buffer
//!
//! Packets are keyed by an extended (wraparound-aware) sequence number and
//! released strictly in order. A missing packet holds back everything after
//! it until the buffer reaches capacity; then the hole is declared lost and
//! release resumes at the next buffered packet. The consumer sees the hole as
//! a sequence gap.
//!
//! The first packet of a stream has no predecessor to compare against, so it
//! is held until a second packet arrives unless it closes a frame on its own.

use std::collections::BTreeMap;

/// Default capacity in packets
pub const DEFAULT_CAPACITY: usize = 200;

/// Statistics about jitter buffer behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Packets currently held
    pub current_packets: usize,
    /// Peak number of packets ever held
    pub peak_packets: usize,
    /// Packets that arrived after their slot was released or skipped
    pub late_packets: u64,
    /// Packets received twice
    pub duplicate_packets: u64,
    /// Sequence numbers given up on when the buffer filled
    pub lost_packets: u64,
}

/// Anything carrying an RTP sequence number
pub trait Sequenced {
    fn sequence_number(&self) -> u16;

    /// Whether this packet completes a frame (the RTP marker bit)
    fn closes_frame(&self) -> bool {
        false
    }
}

pub struct JitterBuffer<T: Sequenced> {
    packets: BTreeMap<u32, T>,
    capacity: usize,
    /// Extended sequence of the last released packet
    last_released: Option<u32>,
    /// Extended sequence of the highest packet seen, the wraparound reference
    highest: Option<u32>,
    stats: BufferStats,
}

impl<T: Sequenced> JitterBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: BTreeMap::new(),
            capacity: capacity.max(1),
            last_released: None,
            highest: None,
            stats: BufferStats::default(),
        }
    }

    /// Insert a packet. Returns `false` if it was dropped as late or duplicate.
    pub fn insert(&mut self, packet: T) -> bool {
        let ext = self.extend_sequence(packet.sequence_number());

        if self.last_released.is_some_and(|last| ext <= last) {
            self.stats.late_packets += 1;
            return false;
        }
        if self.packets.contains_key(&ext) {
            self.stats.duplicate_packets += 1;
            return false;
        }

        self.packets.insert(ext, packet);
        if self.highest.map_or(true, |h| ext > h) {
            self.highest = Some(ext);
        }

        self.stats.current_packets = self.packets.len();
        self.stats.peak_packets = self.stats.peak_packets.max(self.packets.len());
        true
    }

    /// Release the next packet if it is in order, or if the buffer is full
    pub fn pop(&mut self) -> Option<T> {
        let (&ext, first) = self.packets.iter().next()?;

        let in_order = match self.last_released {
            Some(last) => ext == last + 1,
            None => self.packets.len() > 1 || first.closes_frame(),
        };
        if !in_order {
            if self.packets.len() < self.capacity {
                return None;
            }
            if let Some(last) = self.last_released {
                self.stats.lost_packets += (ext - last - 1) as u64;
            }
        }

        let packet = self.packets.remove(&ext)?;
        self.last_released = Some(ext);
        self.stats.current_packets = self.packets.len();
        Some(packet)
    }

    /// Release everything still buffered, holes included
    pub fn drain(&mut self) -> Vec<T> {
        let packets = std::mem::take(&mut self.packets);
        if let Some((&ext, _)) = packets.iter().next_back() {
            self.last_released = Some(ext);
        }
        self.stats.current_packets = 0;
        packets.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Extend a 16-bit sequence to 32 bits relative to the highest seen
    ///
    /// Signed 16-bit distance handles wraparound in both directions. Extended
    /// values start at 1 << 16 so a packet slightly older than the first one
    /// does not underflow.
    fn extend_sequence(&self, seq: u16) -> u32 {
        match self.highest {
            Some(reference) => {
                let ref_seq = (reference & 0xFFFF) as u16;
                let diff = seq.wrapping_sub(ref_seq) as i16 as i64;
                (reference as i64 + diff).max(0) as u32
            }
            None => (1 << 16) + seq as u32,
        }
    }
}
