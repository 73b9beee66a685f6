//! Byte-stream output for a sender session.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio_util::codec::Encoder;
use tracing::info;

use crate::wire::{Frame, Packet, PacketCodec, SessionDescription};

/// Where a session stream is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port` of a collector.
    Tcp(String),
    /// Local capture file.
    File(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

type Sink = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Encodes frames onto an output stream, optionally mirroring every byte to
/// a debug file.
pub struct Transport {
    out: Sink,
    mirror: Option<BufWriter<File>>,
    codec: PacketCodec,
    scratch: BytesMut,
    bytes_sent: u64,
}

impl Transport {
    /// Opens the endpoint and the optional mirror file.
    pub async fn connect(endpoint: &Endpoint, mirror: Option<&Path>) -> Result<Self> {
        let out: Box<dyn AsyncWrite + Send + Unpin> = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("connecting to {addr}"))?;
                stream.set_nodelay(true).context("setting TCP_NODELAY")?;
                Box::new(stream)
            }
            Endpoint::File(path) => Box::new(
                File::create(path)
                    .await
                    .with_context(|| format!("creating {}", path.display()))?,
            ),
        };

        let mirror = match mirror {
            Some(path) => Some(BufWriter::new(
                File::create(path)
                    .await
                    .with_context(|| format!("creating debug mirror {}", path.display()))?,
            )),
            None => None,
        };

        info!(%endpoint, mirror = mirror.is_some(), "transport connected");

        Ok(Self::from_writer(out, mirror))
    }

    /// Wraps an arbitrary writer.
    pub fn from_writer(out: Box<dyn AsyncWrite + Send + Unpin>, mirror: Option<BufWriter<File>>) -> Self {
        Self {
            out: BufWriter::new(out),
            mirror,
            codec: PacketCodec::packets_only(usize::from(u8::MAX) + 1),
            scratch: BytesMut::with_capacity(4096),
            bytes_sent: 0,
        }
    }

    /// Total bytes written to the endpoint.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub async fn send_description(&mut self, description: &SessionDescription) -> Result<usize> {
        self.send(Frame::Description(description.clone())).await
    }

    pub async fn send_packet(&mut self, packet: Packet) -> Result<usize> {
        self.send(Frame::Packet(packet)).await
    }

    async fn send(&mut self, frame: Frame) -> Result<usize> {
        self.scratch.clear();
        self.codec
            .encode(frame, &mut self.scratch)
            .context("encoding frame")?;

        self.out
            .write_all(&self.scratch)
            .await
            .context("writing to endpoint")?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror
                .write_all(&self.scratch)
                .await
                .context("writing debug mirror")?;
        }

        let n = self.scratch.len();
        self.bytes_sent += n as u64;
        Ok(n)
    }

    /// Pushes buffered bytes out.
    pub async fn flush(&mut self) -> Result<()> {
        self.out.flush().await.context("flushing endpoint")?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.flush().await.context("flushing debug mirror")?;
        }
        Ok(())
    }

    /// Flushes and closes the stream.
    pub async fn finish(&mut self) -> Result<()> {
        self.flush().await?;
        self.out.shutdown().await.context("closing endpoint")?;
        Ok(())
    }
}
