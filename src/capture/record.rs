//! Samples, buffers and the byte-exact buffer record.
//!
//! A buffer record is what a reader of the capture device receives per read:
//! a 12-byte header (`core`, `count`, reserved) followed by [`BUFFER_ENTRIES`]
//! fixed 40-byte sample slots. Every field is little-endian. Slots past
//! `count` are zeroed on encode and ignored on parse.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Number of event counters carried by every sample.
pub const NUM_COUNTERS: usize = 6;

/// Page-sized budget a single buffer record must fit in.
pub const BUFFER_SIZE: usize = 4096;

/// Record header size: core u32, count u32, reserved u32.
pub const RECORD_HEADER_SIZE: usize = 12;

/// One sample slot: u64 cycles, u32 pid, u32 pad, six u32 counters.
pub const SAMPLE_SIZE: usize = 40;

/// Samples held by one buffer.
pub const BUFFER_ENTRIES: usize = (BUFFER_SIZE - RECORD_HEADER_SIZE) / SAMPLE_SIZE;

/// Exact size of one encoded buffer record.
pub const RECORD_SIZE: usize = RECORD_HEADER_SIZE + BUFFER_ENTRIES * SAMPLE_SIZE;

/// Errors produced when moving buffer records across the capture boundary.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("destination holds {len} bytes, a buffer record needs {RECORD_SIZE}")]
    ShortRead { len: usize },

    #[error("record too short: {len} bytes")]
    Truncated { len: usize },

    #[error("record declares {count} samples, capacity is {BUFFER_ENTRIES}")]
    InvalidCount { count: u32 },
}

/// One counter snapshot taken at an overflow interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    /// Cycle counter value at capture time, including the pending period.
    pub cycles: u64,
    /// Process that was running on the core.
    pub pid: u32,
    /// Event counter values.
    pub counters: [u32; NUM_COUNTERS],
}

impl Sample {
    const EMPTY: Sample = Sample {
        cycles: 0,
        pid: 0,
        counters: [0; NUM_COUNTERS],
    };
}

/// Fixed-capacity sample buffer owned by one core while it fills.
///
/// Buffers are allocated once by the pool and recycled; nothing here
/// allocates after construction.
#[derive(Debug, Clone)]
pub struct Buffer {
    core: u32,
    count: u32,
    samples: [Sample; BUFFER_ENTRIES],
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            core: 0,
            count: 0,
            samples: [Sample::EMPTY; BUFFER_ENTRIES],
        }
    }

    /// Clears the buffer and assigns it to `core`.
    pub fn reset(&mut self, core: u32) {
        self.core = core;
        self.count = 0;
    }

    pub fn core(&self) -> u32 {
        self.core
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= BUFFER_ENTRIES
    }

    /// Appends a sample, returning true when the buffer is now full.
    ///
    /// A push into an already full buffer is dropped.
    pub fn push(&mut self, sample: Sample) -> bool {
        if let Some(slot) = self.samples.get_mut(self.count as usize) {
            *slot = sample;
            self.count += 1;
        }
        self.is_full()
    }

    /// The recorded samples, oldest first.
    pub fn samples(&self) -> &[Sample] {
        self.samples.get(..self.len()).unwrap_or_default()
    }

    /// Writes the record image into `out`, returning the bytes written.
    pub fn encode_record(&self, out: &mut [u8]) -> Result<usize, RecordError> {
        let Some(mut dst) = out.get_mut(..RECORD_SIZE) else {
            return Err(RecordError::ShortRead { len: out.len() });
        };

        dst.put_u32_le(self.core);
        dst.put_u32_le(self.count);
        dst.put_u32_le(0);

        for (i, sample) in self.samples.iter().enumerate() {
            if i < self.len() {
                dst.put_u64_le(sample.cycles);
                dst.put_u32_le(sample.pid);
                dst.put_u32_le(0);
                for counter in sample.counters {
                    dst.put_u32_le(counter);
                }
            } else {
                dst.put_bytes(0, SAMPLE_SIZE);
            }
        }

        Ok(RECORD_SIZE)
    }

    /// Replaces the contents of this buffer with a parsed record image.
    pub fn decode_record(&mut self, data: &[u8]) -> Result<(), RecordError> {
        let Some(mut src) = data.get(..RECORD_SIZE) else {
            return Err(RecordError::Truncated { len: data.len() });
        };

        let core = src.get_u32_le();
        let count = src.get_u32_le();
        src.advance(4);

        if count as usize > BUFFER_ENTRIES {
            return Err(RecordError::InvalidCount { count });
        }

        for slot in self.samples.iter_mut().take(count as usize) {
            let cycles = src.get_u64_le();
            let pid = src.get_u32_le();
            src.advance(4);
            let mut counters = [0u32; NUM_COUNTERS];
            for counter in counters.iter_mut() {
                *counter = src.get_u32_le();
            }
            *slot = Sample {
                cycles,
                pid,
                counters,
            };
        }

        self.core = core;
        self.count = count;

        Ok(())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn sample(pid: u32, cycles: u64) -> Sample {
        Sample {
            cycles,
            pid,
            counters: [1, 2, 3, 4, 5, 6],
        }
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(BUFFER_ENTRIES, 102);
        assert_eq!(RECORD_SIZE, 4092);
        assert!(RECORD_SIZE <= BUFFER_SIZE);
    }

    #[test]
    fn test_push_until_full() {
        let mut buf = Buffer::new();
        buf.reset(3);

        for i in 0..BUFFER_ENTRIES - 1 {
            assert!(!buf.push(sample(10, i as u64)));
        }
        assert!(buf.push(sample(10, 999)));
        assert!(buf.is_full());

        // Overflowing push is dropped.
        assert!(buf.push(sample(11, 1000)));
        assert_eq!(buf.len(), BUFFER_ENTRIES);
        assert_eq!(buf.samples().last().unwrap().cycles, 999);
    }

    #[test]
    fn test_reset_clears_count() {
        let mut buf = Buffer::new();
        buf.push(sample(1, 1));
        buf.reset(7);
        assert!(buf.is_empty());
        assert_eq!(buf.core(), 7);
        assert!(buf.samples().is_empty());
    }

    #[test]
    fn test_record_layout() {
        let mut buf = Buffer::new();
        buf.reset(2);
        buf.push(Sample {
            cycles: 0x0102_0304_0506_0708,
            pid: 42,
            counters: [10, 20, 30, 40, 50, 60],
        });

        let mut out = vec![0xFFu8; RECORD_SIZE];
        assert_eq!(buf.encode_record(&mut out).unwrap(), RECORD_SIZE);

        assert_eq!(&out[0..4], &2u32.to_le_bytes());
        assert_eq!(&out[4..8], &1u32.to_le_bytes());
        assert_eq!(&out[8..12], &[0, 0, 0, 0]);
        assert_eq!(&out[12..20], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&out[20..24], &42u32.to_le_bytes());
        assert_eq!(&out[28..32], &10u32.to_le_bytes());
        assert_eq!(&out[48..52], &60u32.to_le_bytes());
        // Unused slots are zeroed.
        assert!(out[52..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_record() {
        let mut src = Buffer::new();
        src.reset(5);
        src.push(sample(100, 1));
        src.push(sample(200, 2));

        let mut out = vec![0u8; RECORD_SIZE];
        src.encode_record(&mut out).unwrap();

        let mut dst = Buffer::new();
        dst.push(sample(9, 9));
        dst.push(sample(9, 9));
        dst.push(sample(9, 9));
        dst.decode_record(&out).unwrap();

        assert_eq!(dst.core(), 5);
        assert_eq!(dst.samples(), src.samples());
    }

    #[test]
    fn test_short_destination_rejected() {
        let buf = Buffer::new();
        let mut out = vec![0u8; RECORD_SIZE - 1];
        assert_eq!(
            buf.encode_record(&mut out),
            Err(RecordError::ShortRead {
                len: RECORD_SIZE - 1
            })
        );
    }

    #[test]
    fn test_truncated_record() {
        let mut buf = Buffer::new();
        assert_eq!(
            buf.decode_record(&[0u8; 16]),
            Err(RecordError::Truncated { len: 16 })
        );
    }

    #[test]
    fn test_invalid_count() {
        let mut data = vec![0u8; RECORD_SIZE];
        data[4..8].copy_from_slice(&500u32.to_le_bytes());

        let mut buf = Buffer::new();
        assert_eq!(
            buf.decode_record(&data),
            Err(RecordError::InvalidCount { count: 500 })
        );
    }
}
