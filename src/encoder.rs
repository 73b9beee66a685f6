//! Run-coalescing packet encoder.
//!
//! Walks a drained buffer's samples in order and groups consecutive samples
//! that share core, pid and mode into one [`Packet`] of up to 255 samples.
//! Each buffer is its own batch: no packet spans two buffers.

use thiserror::Error;
use tracing::trace;

use crate::capture::record::{Buffer, Sample, NUM_COUNTERS};
use crate::identity::{MetadataLoader, ProcessIdentity, ProcessIdentityCache};
use crate::wire::{Packet, PacketHeader, MAX_QUANTITY};

/// Errors from appending to an in-progress packet.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("sample for pid {pid} on core {core} must start a new packet")]
    NeedsFlush { core: u32, pid: u32 },
}

/// Builds packets for one sender session.
#[derive(Debug)]
pub struct PacketEncoder {
    pending: Packet,
    batch: u32,
    index: u32,
}

impl PacketEncoder {
    pub fn new() -> Self {
        Self {
            pending: Packet {
                samples: Vec::with_capacity(usize::from(MAX_QUANTITY)),
                ..Packet::default()
            },
            batch: 0,
            index: 0,
        }
    }

    /// True when no sample is waiting to be flushed.
    pub fn is_empty(&self) -> bool {
        self.pending.samples.is_empty()
    }

    /// Current batch number.
    pub fn batch(&self) -> u32 {
        self.batch
    }

    /// Whether `sample` must start a new packet.
    ///
    /// A kernel packet is closed by any non-kernel identity, but a user packet
    /// is not closed by a kernel identity on the same pid and core.
    pub fn should_flush(&self, core: u32, sample: &Sample, identity: &ProcessIdentity) -> bool {
        if self.is_empty() {
            return false;
        }
        let header = &self.pending.header;
        self.pending.samples.len() >= usize::from(MAX_QUANTITY)
            || (header.kernel && !identity.is_kernel())
            || header.core != wire_core(core)
            || header.pid != sample.pid
    }

    /// Appends a sample, stamping the header first if the packet is empty.
    pub fn append(
        &mut self,
        core: u32,
        sample: Sample,
        identity: &ProcessIdentity,
        missed: u32,
    ) -> Result<(), EncodeError> {
        if self.should_flush(core, &sample, identity) {
            return Err(EncodeError::NeedsFlush {
                core,
                pid: sample.pid,
            });
        }
        self.push(core, sample, identity, missed);
        Ok(())
    }

    fn push(&mut self, core: u32, sample: Sample, identity: &ProcessIdentity, missed: u32) {
        if self.is_empty() {
            self.pending.header = PacketHeader {
                kernel: identity.is_kernel(),
                counter_count: NUM_COUNTERS as u8,
                core: wire_core(core),
                quantity: 0,
                batch: self.batch,
                missed,
                first_index: self.index,
                pid: sample.pid,
            };
            self.pending.cmdline.clear();
            self.pending.cmdline.push_str(identity.cmdline());
            self.pending.executable.clear();
            self.pending.executable.push_str(identity.executable());
        }
        self.pending.samples.push(sample);
        self.pending.header.quantity = self.pending.samples.len() as u8;
        self.index += 1;
    }

    /// Takes the pending packet. Returns `None` if it holds no samples.
    pub fn flush(&mut self) -> Option<Packet> {
        if self.is_empty() {
            return None;
        }
        let mut packet = Packet {
            samples: Vec::with_capacity(usize::from(MAX_QUANTITY)),
            ..Packet::default()
        };
        std::mem::swap(&mut packet, &mut self.pending);
        trace!(
            pid = packet.header.pid,
            core = packet.header.core,
            quantity = packet.header.quantity,
            batch = packet.header.batch,
            "packet ready",
        );
        Some(packet)
    }

    /// Begins a new batch, discarding anything pending.
    pub fn start_batch(&mut self) {
        self.batch = self.batch.wrapping_add(1);
        self.index = 0;
        self.pending.samples.clear();
        self.pending.header = PacketHeader::default();
    }

    /// Encodes one drained buffer as a batch, handing each packet to `emit`.
    ///
    /// Identities may only be re-validated between packets, so the cache is
    /// told whether a packet is in progress on every lookup.
    pub fn encode_buffer<L, F>(
        &mut self,
        buffer: &Buffer,
        identities: &mut ProcessIdentityCache<L>,
        missed: u32,
        mut emit: F,
    ) where
        L: MetadataLoader,
        F: FnMut(Packet),
    {
        self.start_batch();
        let core = buffer.core();

        for sample in buffer.samples() {
            let identity = identities.resolve(sample.pid, self.is_empty());
            if self.should_flush(core, sample, identity) {
                if let Some(packet) = self.flush() {
                    emit(packet);
                }
            }
            self.push(core, *sample, identity, missed);
        }

        if let Some(packet) = self.flush() {
            emit(packet);
        }
    }
}

impl Default for PacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Core ids travel as one byte.
fn wire_core(core: u32) -> u8 {
    u8::try_from(core).unwrap_or(u8::MAX)
}
