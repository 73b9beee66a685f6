use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::{Frame, Packet, PacketHeader, SessionDescription, PACKET_HEADER_SIZE};
use crate::capture::record::{Sample, NUM_COUNTERS};

/// Errors that can occur while decoding a session stream.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("packet declares {count} counters, at most {NUM_COUNTERS} supported")]
    TooManyCounters { count: u8, consumed: usize },

    #[error("packet core {core} outside configured range 0..{max_cores}")]
    CoreOutOfRange {
        core: u8,
        max_cores: usize,
        consumed: usize,
    },

    #[error("packet carries no samples")]
    EmptyPacket { consumed: usize },

    #[error("stream ended inside a packet ({remaining} bytes left over)")]
    TruncatedStream { remaining: usize },

    #[error("reading stream: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Bytes to skip to reach the next packet, for errors confined to one
    /// well-framed packet.
    pub fn consumed(&self) -> Option<usize> {
        match self {
            Self::TooManyCounters { consumed, .. }
            | Self::CoreOutOfRange { consumed, .. }
            | Self::EmptyPacket { consumed } => Some(*consumed),
            Self::TruncatedStream { .. } | Self::Io(_) => None,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TooManyCounters { .. } => "too_many_counters",
            Self::CoreOutOfRange { .. } => "core_out_of_range",
            Self::EmptyPacket { .. } => "empty_packet",
            Self::TruncatedStream { .. } => "truncated_stream",
            Self::Io(_) => "io",
        }
    }
}

/// Appends the wire form of `packet` to `dst`.
///
/// Cycle counts are written as their low 32 bits. At most 255 samples and
/// [`NUM_COUNTERS`] counters per sample are written; the header reflects
/// what was actually written.
pub fn encode_packet(packet: &Packet, dst: &mut BytesMut) {
    let header = &packet.header;
    let quantity = packet.samples.len().min(usize::from(u8::MAX));
    let counter_count = usize::from(header.counter_count).min(NUM_COUNTERS);

    dst.reserve(packet.encoded_len());
    dst.put_u8(u8::from(header.kernel));
    dst.put_u8(counter_count as u8);
    dst.put_u8(header.core);
    dst.put_u8(quantity as u8);
    dst.put_u32(header.batch);
    dst.put_u32(header.missed);
    dst.put_u32(header.first_index);
    dst.put_u32(header.pid);

    for sample in packet.samples.iter().take(quantity) {
        dst.put_u32(sample.cycles as u32);
        for counter in sample.counters.iter().take(counter_count) {
            dst.put_u32(*counter);
        }
    }

    put_wire_str(dst, &packet.cmdline);
    put_wire_str(dst, &packet.executable);
}

fn put_wire_str(dst: &mut BytesMut, s: &str) {
    for b in s.bytes().filter(|b| *b != 0) {
        dst.put_u8(b);
    }
    dst.put_u8(0);
}

/// Decodes one packet from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a whole packet; nothing is
/// consumed in that case. On success returns the packet and its wire length.
/// Packets that are complete but invalid are reported with the number of
/// bytes to skip (see [`DecodeError::consumed`]).
pub fn decode_packet(
    src: &[u8],
    max_cores: usize,
) -> Result<Option<(Packet, usize)>, DecodeError> {
    let Some(mut head) = src.get(..PACKET_HEADER_SIZE) else {
        return Ok(None);
    };

    let kernel = head.get_u8() != 0;
    let counter_count = head.get_u8();
    let core = head.get_u8();
    let quantity = head.get_u8();
    let header = PacketHeader {
        kernel,
        counter_count,
        core,
        quantity,
        batch: head.get_u32(),
        missed: head.get_u32(),
        first_index: head.get_u32(),
        pid: head.get_u32(),
    };

    let group = (1 + usize::from(counter_count)) * 4;
    let samples_end = PACKET_HEADER_SIZE + usize::from(quantity) * group;

    let Some(strings) = src.get(samples_end..) else {
        return Ok(None);
    };
    let Some(cmdline_len) = strings.iter().position(|b| *b == 0) else {
        return Ok(None);
    };
    let Some(exe_len) = strings
        .get(cmdline_len + 1..)
        .and_then(|rest| rest.iter().position(|b| *b == 0))
    else {
        return Ok(None);
    };
    let consumed = samples_end + cmdline_len + 1 + exe_len + 1;

    if usize::from(counter_count) > NUM_COUNTERS {
        return Err(DecodeError::TooManyCounters {
            count: counter_count,
            consumed,
        });
    }
    if usize::from(core) >= max_cores {
        return Err(DecodeError::CoreOutOfRange {
            core,
            max_cores,
            consumed,
        });
    }
    if quantity == 0 {
        return Err(DecodeError::EmptyPacket { consumed });
    }

    let mut body = src.get(PACKET_HEADER_SIZE..samples_end).unwrap_or_default();
    let mut samples = Vec::with_capacity(usize::from(quantity));
    for _ in 0..quantity {
        let cycles = u64::from(body.get_u32());
        let mut counters = [0u32; NUM_COUNTERS];
        for counter in counters.iter_mut().take(usize::from(counter_count)) {
            *counter = body.get_u32();
        }
        samples.push(Sample {
            cycles,
            pid: header.pid,
            counters,
        });
    }

    let cmdline = strings.get(..cmdline_len).unwrap_or_default();
    let executable = strings
        .get(cmdline_len + 1..cmdline_len + 1 + exe_len)
        .unwrap_or_default();

    let packet = Packet {
        header,
        samples,
        cmdline: String::from_utf8_lossy(cmdline).into_owned(),
        executable: String::from_utf8_lossy(executable).into_owned(),
    };

    Ok(Some((packet, consumed)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Description,
    Packets,
}

/// Stream codec for a session: one description frame then packets.
///
/// Malformed but well-framed packets are skipped with a warning and counted;
/// decoding resumes at the next packet boundary.
#[derive(Debug)]
pub struct PacketCodec {
    state: State,
    max_cores: usize,
    dropped: BTreeMap<&'static str, u64>,
}

impl PacketCodec {
    /// Codec for a full session stream starting with its description.
    pub fn new(max_cores: usize) -> Self {
        Self {
            state: State::Description,
            max_cores,
            dropped: BTreeMap::new(),
        }
    }

    /// Codec for a stream that carries packets only.
    pub fn packets_only(max_cores: usize) -> Self {
        Self {
            state: State::Packets,
            ..Self::new(max_cores)
        }
    }

    /// Packets skipped as malformed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.values().sum()
    }

    /// Skipped packets keyed by [`DecodeError::kind`].
    pub fn dropped_by_kind(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.dropped.iter().map(|(k, v)| (*k, *v))
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        if self.state == State::Description {
            let Some(end) = src.iter().position(|b| *b == 0) else {
                return Ok(None);
            };
            let text = src.split_to(end + 1);
            self.state = State::Packets;
            let text = text.get(..end).unwrap_or_default();
            return Ok(Some(Frame::Description(SessionDescription::from_text(
                String::from_utf8_lossy(text),
            ))));
        }

        loop {
            match decode_packet(&src[..], self.max_cores) {
                Ok(None) => return Ok(None),
                Ok(Some((packet, consumed))) => {
                    src.advance(consumed);
                    trace!(
                        pid = packet.header.pid,
                        core = packet.header.core,
                        quantity = packet.header.quantity,
                        "decoded packet",
                    );
                    return Ok(Some(Frame::Packet(packet)));
                }
                Err(e) => match e.consumed() {
                    Some(consumed) => {
                        warn!(error = %e, "dropping malformed packet");
                        *self.dropped.entry(e.kind()).or_default() += 1;
                        src.advance(consumed);
                    }
                    None => return Err(e),
                },
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(DecodeError::TruncatedStream {
                remaining: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        match frame {
            Frame::Description(description) => put_wire_str(dst, description.as_str()),
            Frame::Packet(packet) => encode_packet(&packet, dst),
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const MAX_CORES: usize = 16;

    fn packet(core: u8, pid: u32, cycles: &[u64]) -> Packet {
        Packet {
            header: PacketHeader {
                kernel: false,
                counter_count: NUM_COUNTERS as u8,
                core,
                quantity: cycles.len() as u8,
                batch: 3,
                missed: 1,
                first_index: 10,
                pid,
            },
            samples: cycles
                .iter()
                .map(|c| Sample {
                    cycles: *c,
                    pid,
                    counters: [1, 2, 3, 4, 5, 6],
                })
                .collect(),
            cmdline: "app --run".to_string(),
            executable: "/bin/app".to_string(),
        }
    }

    fn encoded(p: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_packet(p, &mut buf);
        buf
    }

    #[test]
    fn test_header_is_big_endian() {
        let buf = encoded(&packet(2, 0x0A0B_0C0D, &[0x1122_3344]));
        assert_eq!(&buf[..4], &[0, 6, 2, 1]);
        assert_eq!(&buf[4..8], &3u32.to_be_bytes());
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        assert_eq!(&buf[12..16], &10u32.to_be_bytes());
        assert_eq!(&buf[16..20], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&buf[20..24], &[0x11, 0x22, 0x33, 0x44]);
        assert!(buf.ends_with(b"app --run\0/bin/app\0"));
        assert_eq!(buf.len(), packet(2, 1, &[1]).encoded_len());
    }

    #[test]
    fn test_decode_restores_packet() {
        let p = packet(4, 77, &[100, 200, 300]);
        let buf = encoded(&p);
        let (decoded, consumed) = decode_packet(&buf, MAX_CORES).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, p);
    }

    #[test]
    fn test_cycles_truncated_to_32_bits() {
        let p = packet(0, 1, &[0x1_0000_0005]);
        let (decoded, _) = decode_packet(&encoded(&p), MAX_CORES).unwrap().unwrap();
        assert_eq!(decoded.samples[0].cycles, 5);
    }

    #[test]
    fn test_truncated_needs_more_data() {
        let buf = encoded(&packet(1, 5, &[1, 2]));
        for cut in [0, 5, PACKET_HEADER_SIZE, buf.len() - 10, buf.len() - 1] {
            assert!(decode_packet(&buf[..cut], MAX_CORES).unwrap().is_none());
        }
    }

    #[test]
    fn test_fewer_counters_zero_filled() {
        let mut p = packet(0, 9, &[7]);
        p.header.counter_count = 2;
        let buf = encoded(&p);
        assert_eq!(buf.len(), PACKET_HEADER_SIZE + 3 * 4 + 10 + 9);

        let (decoded, _) = decode_packet(&buf, MAX_CORES).unwrap().unwrap();
        assert_eq!(decoded.samples[0].counters, [1, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_core_out_of_range_is_skippable() {
        let buf = encoded(&packet(20, 1, &[1]));
        let err = decode_packet(&buf, MAX_CORES).unwrap_err();
        assert!(matches!(err, DecodeError::CoreOutOfRange { core: 20, .. }));
        assert_eq!(err.consumed(), Some(buf.len()));
    }

    #[test]
    fn test_codec_stream() {
        let mut codec = PacketCodec::new(MAX_CORES);
        let mut wire = BytesMut::new();
        let description = SessionDescription::from_settings(1_000_000, &[8, 0, 0, 0]);
        codec
            .encode(Frame::Description(description.clone()), &mut wire)
            .unwrap();
        codec
            .encode(Frame::Packet(packet(30, 1, &[1])), &mut wire)
            .unwrap();
        codec
            .encode(Frame::Packet(packet(1, 2, &[5, 6])), &mut wire)
            .unwrap();

        // Feed one byte at a time.
        let mut src = BytesMut::new();
        let mut frames = Vec::new();
        for b in wire.iter() {
            src.put_u8(*b);
            while let Some(frame) = codec.decode(&mut src).unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::Description(description));
        match &frames[1] {
            Frame::Packet(p) => assert_eq!(p.header.pid, 2),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(codec.dropped(), 1);
        assert_eq!(
            codec.dropped_by_kind().collect::<Vec<_>>(),
            vec![("core_out_of_range", 1)]
        );
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_eof_with_leftover() {
        let mut codec = PacketCodec::packets_only(MAX_CORES);
        let buf = encoded(&packet(0, 1, &[1]));
        let mut src = BytesMut::from(&buf[..buf.len() - 3]);
        assert!(matches!(
            codec.decode_eof(&mut src),
            Err(DecodeError::TruncatedStream { .. })
        ));
    }

    #[test]
    fn test_interior_nul_dropped() {
        let mut p = packet(0, 1, &[1]);
        p.cmdline = "a\0b".to_string();
        let (decoded, _) = decode_packet(&encoded(&p), MAX_CORES).unwrap().unwrap();
        assert_eq!(decoded.cmdline, "ab");
        assert_eq!(decoded.executable, "/bin/app");
    }
}
