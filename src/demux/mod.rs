//! Receiving side: splits a decoded session stream into one sample stream
//! per (core, pid).

pub mod directory;
pub mod dump;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::capture::record::Sample;
use crate::export::health::HealthMetrics;
use crate::wire::{DecodeError, Frame, Packet, PacketCodec, SessionDescription};

pub use directory::DirectoryWriter;

/// Identifies one output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    pub core: u8,
    pub pid: u32,
}

/// Metadata recorded for every stream opened during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: StreamKey,
    pub cmdline: String,
    pub executable: String,
    /// Where the writer put the stream (a file path for [`DirectoryWriter`]).
    pub location: String,
    pub samples: u64,
}

/// Destination for demultiplexed streams.
pub trait TraceWriter {
    type Stream;

    /// Stores the session description.
    fn describe(&mut self, description: &SessionDescription) -> Result<()>;

    /// Opens a new stream, returning it and its location.
    fn open(
        &mut self,
        key: StreamKey,
        cmdline: &str,
        executable: &str,
    ) -> Result<(Self::Stream, String)>;

    fn write_samples(&mut self, stream: &mut Self::Stream, samples: &[Sample]) -> Result<()>;

    /// Marks the point where a core switched away from this stream's pid.
    fn write_boundary(&mut self, stream: &mut Self::Stream) -> Result<()>;

    fn close(&mut self, stream: Self::Stream) -> Result<()>;

    /// Writes the session index, ordered by (core, pid).
    fn write_index(&mut self, entries: &[IndexEntry]) -> Result<()>;
}

/// Counters for one demultiplexing session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub packets: u64,
    pub samples: u64,
    pub boundaries: u64,
    pub dropped: u64,
}

/// Routes packets to per-(core, pid) streams.
///
/// Streams are opened on first use and stay open until [`finish`]. When a
/// core moves to a different pid the stream it was feeding gets a boundary
/// marker.
///
/// [`finish`]: Demultiplexer::finish
pub struct Demultiplexer<W: TraceWriter> {
    writer: W,
    current: Vec<Option<StreamKey>>,
    streams: HashMap<StreamKey, W::Stream>,
    index: BTreeMap<StreamKey, IndexEntry>,
    stats: DemuxStats,
}

impl<W: TraceWriter> Demultiplexer<W> {
    pub fn new(writer: W, max_cores: usize) -> Self {
        Self {
            writer,
            current: vec![None; max_cores],
            streams: HashMap::new(),
            index: BTreeMap::new(),
            stats: DemuxStats::default(),
        }
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Number of streams opened so far.
    pub fn streams(&self) -> usize {
        self.index.len()
    }

    pub fn process(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Description(description) => {
                debug!(bytes = description.as_str().len(), "session description");
                self.writer.describe(&description)
            }
            Frame::Packet(packet) => self.process_packet(packet),
        }
    }

    pub fn process_packet(&mut self, packet: Packet) -> Result<()> {
        let header = packet.header;
        let key = StreamKey {
            core: header.core,
            pid: header.pid,
        };

        let Some(slot) = self.current.get_mut(usize::from(key.core)) else {
            warn!(
                core = key.core,
                max_cores = self.current.len(),
                "possible data corruption, skipping packet",
            );
            self.stats.dropped += 1;
            return Ok(());
        };

        if *slot != Some(key) {
            if let Some(previous) = slot.replace(key) {
                if let Some(stream) = self.streams.get_mut(&previous) {
                    self.writer.write_boundary(stream)?;
                    self.stats.boundaries += 1;
                }
            }
        }

        let stream = match self.streams.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let (stream, location) =
                    self.writer
                        .open(key, &packet.cmdline, &packet.executable)?;
                info!(
                    core = key.core,
                    pid = key.pid,
                    location = %location,
                    "opened stream",
                );
                self.index.insert(
                    key,
                    IndexEntry {
                        key,
                        cmdline: String::new(),
                        executable: String::new(),
                        location,
                        samples: 0,
                    },
                );
                e.insert(stream)
            }
        };

        self.writer.write_samples(stream, &packet.samples)?;

        // The latest metadata seen for a pid wins.
        if let Some(entry) = self.index.get_mut(&key) {
            entry.cmdline = packet.cmdline;
            entry.executable = packet.executable;
            entry.samples += packet.samples.len() as u64;
        }

        self.stats.packets += 1;
        self.stats.samples += packet.samples.len() as u64;
        Ok(())
    }

    /// Closes every stream, writes the index and hands the writer back.
    pub fn finish(mut self) -> Result<W> {
        for (_, stream) in self.streams.drain() {
            self.writer.close(stream)?;
        }

        let entries: Vec<IndexEntry> = self.index.into_values().collect();
        self.writer.write_index(&entries)?;

        info!(
            streams = entries.len(),
            packets = self.stats.packets,
            samples = self.stats.samples,
            boundaries = self.stats.boundaries,
            dropped = self.stats.dropped,
            "demultiplexing finished",
        );

        Ok(self.writer)
    }
}

/// Frames a session byte stream.
pub fn frames<R: AsyncRead>(reader: R, max_cores: usize) -> FramedRead<R, PacketCodec> {
    FramedRead::new(reader, PacketCodec::new(max_cores))
}

/// Decodes a whole session from `reader` into `demux`.
///
/// A stream that ends inside a packet is logged and treated as the end of
/// the session; everything decoded before it is kept.
pub async fn receive<R, W>(
    reader: R,
    mut demux: Demultiplexer<W>,
    metrics: Option<Arc<HealthMetrics>>,
) -> Result<W>
where
    R: AsyncRead + Unpin,
    W: TraceWriter,
{
    let max_cores = demux.current.len();
    let mut framed = frames(reader, max_cores);

    while let Some(item) = framed.next().await {
        match item {
            Ok(frame) => {
                if matches!(frame, Frame::Packet(_)) {
                    if let Some(m) = &metrics {
                        m.packets_received.inc();
                    }
                }
                demux.process(frame)?;
            }
            Err(e @ DecodeError::TruncatedStream { .. }) => {
                warn!(error = %e, "session stream truncated");
                break;
            }
            Err(e) => return Err(e).context("decoding session stream"),
        }
    }

    let codec = framed.decoder();
    if codec.dropped() > 0 {
        warn!(dropped = codec.dropped(), "malformed packets skipped");
    }
    if let Some(m) = &metrics {
        for (kind, count) in codec.dropped_by_kind() {
            m.packets_dropped
                .with_label_values(&[kind])
                .inc_by(count as f64);
        }
    }

    demux.stats.dropped += codec.dropped();
    demux.finish()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
pub(crate) mod tests {
    use super::*;
    use crate::wire::PacketHeader;

    /// Keeps everything in memory.
    #[derive(Default)]
    pub(crate) struct MemoryWriter {
        pub description: Option<String>,
        pub streams: BTreeMap<StreamKey, Vec<Option<u64>>>,
        pub closed: usize,
        pub index: Vec<IndexEntry>,
    }

    impl TraceWriter for MemoryWriter {
        type Stream = StreamKey;

        fn describe(&mut self, description: &SessionDescription) -> Result<()> {
            self.description = Some(description.as_str().to_string());
            Ok(())
        }

        fn open(&mut self, key: StreamKey, _: &str, _: &str) -> Result<(StreamKey, String)> {
            self.streams.insert(key, Vec::new());
            Ok((key, format!("{}-core{}", key.pid, key.core)))
        }

        fn write_samples(&mut self, stream: &mut StreamKey, samples: &[Sample]) -> Result<()> {
            let rows = self.streams.entry(*stream).or_default();
            rows.extend(samples.iter().map(|s| Some(s.cycles)));
            Ok(())
        }

        fn write_boundary(&mut self, stream: &mut StreamKey) -> Result<()> {
            self.streams.entry(*stream).or_default().push(None);
            Ok(())
        }

        fn close(&mut self, _: StreamKey) -> Result<()> {
            self.closed += 1;
            Ok(())
        }

        fn write_index(&mut self, entries: &[IndexEntry]) -> Result<()> {
            self.index = entries.to_vec();
            Ok(())
        }
    }

    pub(crate) fn packet(core: u8, pid: u32, cycles: &[u64]) -> Packet {
        Packet {
            header: PacketHeader {
                counter_count: 6,
                core,
                quantity: cycles.len() as u8,
                pid,
                ..PacketHeader::default()
            },
            samples: cycles
                .iter()
                .map(|c| Sample {
                    cycles: *c,
                    pid,
                    counters: [0; 6],
                })
                .collect(),
            cmdline: format!("proc{pid}"),
            executable: format!("/bin/proc{pid}"),
        }
    }

    fn key(core: u8, pid: u32) -> StreamKey {
        StreamKey { core, pid }
    }

    #[test]
    fn test_boundary_on_pid_switch() {
        let mut demux = Demultiplexer::new(MemoryWriter::default(), 4);
        demux.process_packet(packet(1, 100, &[1, 2])).unwrap();
        demux.process_packet(packet(1, 100, &[3])).unwrap();
        demux.process_packet(packet(1, 200, &[4])).unwrap();
        demux.process_packet(packet(1, 100, &[5])).unwrap();

        let stats = demux.stats();
        assert_eq!(stats.packets, 4);
        assert_eq!(stats.samples, 5);
        assert_eq!(stats.boundaries, 2);

        let writer = demux.finish().unwrap();
        assert_eq!(
            writer.streams[&key(1, 100)],
            vec![Some(1), Some(2), Some(3), None, Some(5)]
        );
        assert_eq!(writer.streams[&key(1, 200)], vec![Some(4), None]);
        assert_eq!(writer.closed, 2);
    }

    #[test]
    fn test_streams_are_per_core() {
        let mut demux = Demultiplexer::new(MemoryWriter::default(), 4);
        demux.process_packet(packet(0, 7, &[1])).unwrap();
        demux.process_packet(packet(3, 7, &[2])).unwrap();
        demux.process_packet(packet(0, 7, &[3])).unwrap();

        assert_eq!(demux.stats().boundaries, 0);
        let writer = demux.finish().unwrap();
        assert_eq!(writer.streams.len(), 2);
        assert_eq!(
            writer.index.iter().map(|e| e.key).collect::<Vec<_>>(),
            vec![key(0, 7), key(3, 7)]
        );
        assert_eq!(writer.index[0].samples, 2);
    }

    #[test]
    fn test_index_keeps_latest_metadata() {
        let mut demux = Demultiplexer::new(MemoryWriter::default(), 2);
        let mut first = packet(0, 5, &[1]);
        first.cmdline = "zygote".to_string();
        demux.process_packet(first).unwrap();
        demux.process_packet(packet(0, 5, &[2])).unwrap();

        let writer = demux.finish().unwrap();
        assert_eq!(writer.index[0].cmdline, "proc5");
        assert_eq!(writer.index[0].location, "5-core0");
    }

    #[test]
    fn test_core_outside_table_dropped() {
        let mut demux = Demultiplexer::new(MemoryWriter::default(), 2);
        demux.process_packet(packet(5, 1, &[1])).unwrap();
        assert_eq!(demux.stats().dropped, 1);
        assert_eq!(demux.streams(), 0);
    }

    #[tokio::test]
    async fn test_receive_truncated_session() {
        use bytes::BytesMut;
        use tokio_util::codec::Encoder;

        let mut codec = PacketCodec::new(4);
        let mut wire = BytesMut::new();
        codec
            .encode(
                Frame::Description(SessionDescription::from_settings(10_000, &[8])),
                &mut wire,
            )
            .unwrap();
        codec
            .encode(Frame::Packet(packet(0, 1, &[1, 2])), &mut wire)
            .unwrap();
        codec
            .encode(Frame::Packet(packet(9, 1, &[1])), &mut wire)
            .unwrap();
        codec
            .encode(Frame::Packet(packet(1, 2, &[3])), &mut wire)
            .unwrap();
        let cut = wire.len() - 4;

        let metrics = Arc::new(HealthMetrics::new("").unwrap());
        let demux = Demultiplexer::new(MemoryWriter::default(), 4);
        let writer = receive(&wire[..cut], demux, Some(metrics.clone()))
            .await
            .unwrap();

        assert!(writer.description.unwrap().starts_with("period:  10000\n"));
        assert_eq!(writer.streams.len(), 1);
        assert_eq!(writer.streams[&key(0, 1)], vec![Some(1), Some(2)]);

        let text = metrics.render().unwrap();
        assert!(text.contains("pmusync_packets_received_total 1"));
        assert!(text.contains("pmusync_packets_dropped_total{reason=\"core_out_of_range\"} 1"));
    }
}
