//! Human-readable listing of a session stream.

use std::io::{self, Write};

use anyhow::{Context, Result};
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tracing::warn;

use super::frames;
use crate::wire::{DecodeError, Frame, Packet, SessionDescription};

fn write_description<W: Write>(out: &mut W, description: &SessionDescription) -> io::Result<()> {
    writeln!(out, "-- Description --\n{}\n-----------", description.as_str())
}

fn write_packet<W: Write>(out: &mut W, packet: &Packet) -> io::Result<()> {
    let h = &packet.header;
    writeln!(
        out,
        "== Krnl {}, #Ctrs {}, Core {}, Qty {}, Batch {}, Miss {}, 1st Idx {}, PID {} ==",
        u8::from(h.kernel),
        h.counter_count,
        h.core,
        h.quantity,
        h.batch,
        h.missed,
        h.first_index,
        h.pid,
    )?;
    writeln!(out, "<< cmd:  {}; exe:  {} >>", packet.cmdline, packet.executable)?;
    for s in &packet.samples {
        let [c0, c1, c2, c3, c4, c5] = s.counters;
        writeln!(out, "\t({}): {c0},{c1},{c2},{c3},{c4},{c5}", s.cycles)?;
    }
    writeln!(out)
}

pub fn write_frame<W: Write>(out: &mut W, frame: &Frame) -> io::Result<()> {
    match frame {
        Frame::Description(d) => write_description(out, d),
        Frame::Packet(p) => write_packet(out, p),
    }
}

/// Prints every frame of a session. Returns the number of packets printed.
pub async fn dump<R, W>(reader: R, out: &mut W, max_cores: usize) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let mut framed = frames(reader, max_cores);
    let mut packets = 0;

    while let Some(item) = framed.next().await {
        match item {
            Ok(frame) => {
                write_frame(out, &frame).context("writing dump")?;
                if matches!(frame, Frame::Packet(_)) {
                    packets += 1;
                }
            }
            Err(e @ DecodeError::TruncatedStream { .. }) => {
                warn!(error = %e, "session stream truncated");
                break;
            }
            Err(e) => return Err(e).context("decoding session stream"),
        }
    }

    out.flush().context("writing dump")?;
    Ok(packets)
}
