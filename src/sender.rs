//! Sender session: drain buffers, encode packets, write them out.
//!
//! Buffer reads block, so they run on a dedicated reader thread that hands
//! each buffer, with the missed count sampled right after it was read, to
//! the async session loop over a bounded channel. The loop owns the encoder
//! and the identity cache and is the only writer to the transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::control::{parse_knob_value, Control, NUM_EVENT_SELECTS};
use crate::capture::record::Buffer;
use crate::capture::stream::BufferSource;
use crate::encoder::PacketEncoder;
use crate::export::health::HealthMetrics;
use crate::identity::{MetadataLoader, ProcessIdentityCache};
use crate::transport::Transport;
use crate::wire::{Packet, SessionDescription};

/// Default directory of the capture driver's control files.
pub const DEFAULT_CONTROL_DIR: &str = "/sys/sync_pmu";

/// Default location of the capture driver's missed-sample counter.
pub const DEFAULT_MISSED_PATH: &str = "/sys/sync_pmu/missed";

/// Default capture device.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/pmu_samples";

/// Buffers read and discarded before the missed baseline is taken.
pub const DEFAULT_WARMUP_BUFFERS: usize = 2;

/// Source of the running missed-sample count.
pub trait MissedCounter: Send + 'static {
    fn read(&mut self) -> Result<u32>;
}

impl MissedCounter for Arc<Control> {
    fn read(&mut self) -> Result<u32> {
        Ok(self.missed())
    }
}

/// Reads the missed count from a control file on every call.
pub struct MissedFile {
    path: PathBuf,
}

impl MissedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MissedCounter for MissedFile {
    fn read(&mut self) -> Result<u32> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_knob_value(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }
}

fn read_knob(dir: &Path, name: &str) -> Result<u32> {
    let path = dir.join(name);
    let raw =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    parse_knob_value(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Builds the session description from the period and event selects the
/// driver is running with, read from its control directory.
pub fn read_session_description(dir: &Path) -> Result<SessionDescription> {
    let period = read_knob(dir, "period")?;
    let events = (0..NUM_EVENT_SELECTS)
        .map(|i| read_knob(dir, &i.to_string()))
        .collect::<Result<Vec<_>>>()?;
    debug!(dir = %dir.display(), period, ?events, "read capture settings");
    Ok(SessionDescription::from_settings(period, &events))
}

/// True once `bytes` has gone past a budget of `kbytes` kilobytes of 1000
/// bytes each. A zero budget never runs out.
pub fn kbytes_exceeded(bytes: u64, kbytes: u64) -> bool {
    kbytes > 0 && bytes / 1000 > kbytes
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Buffers discarded before the missed baseline is taken.
    pub warmup_buffers: usize,
    /// Stop once more than this many kilobytes (1000 bytes) have been sent.
    /// Zero is unlimited.
    pub kbytes_limit: u64,
    /// Drained buffers queued between the reader thread and the encoder.
    pub queue_depth: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            warmup_buffers: DEFAULT_WARMUP_BUFFERS,
            kbytes_limit: 0,
            queue_depth: 4,
        }
    }
}

/// Totals reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub buffers: u64,
    pub samples: u64,
    pub packets: u64,
    pub bytes: u64,
    pub missed: u32,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    ByteLimit,
    Cancelled,
}

struct Batch<T> {
    buffer: T,
    missed: u32,
}

/// Encoder state owned by one sender session.
pub struct SessionContext<L> {
    encoder: PacketEncoder,
    identities: ProcessIdentityCache<L>,
    metrics: Option<Arc<HealthMetrics>>,
    options: SessionOptions,
    pending: Vec<Packet>,
    stats: SessionStats,
    loads_reported: u64,
}

impl<L> SessionContext<L>
where
    L: MetadataLoader + Send + 'static,
{
    pub fn new(identities: ProcessIdentityCache<L>, options: SessionOptions) -> Self {
        Self {
            encoder: PacketEncoder::new(),
            identities,
            metrics: None,
            options,
            pending: Vec::new(),
            stats: SessionStats::default(),
            loads_reported: 0,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn identities(&self) -> &ProcessIdentityCache<L> {
        &self.identities
    }

    /// Runs the session until the source ends, the byte limit is reached, or
    /// `cancel` fires. Transport errors end the session with an error.
    pub async fn run<S, M>(
        &mut self,
        source: S,
        missed: M,
        description: &SessionDescription,
        transport: &mut Transport,
        cancel: CancellationToken,
    ) -> Result<StopReason>
    where
        S: BufferSource,
        M: MissedCounter,
    {
        let (tx, mut rx) = mpsc::channel(self.options.queue_depth.max(1));
        let warmup = self.options.warmup_buffers;
        thread::Builder::new()
            .name("buffer-reader".to_string())
            .spawn(move || read_buffers(source, missed, warmup, tx))
            .context("spawning buffer reader thread")?;

        transport
            .send_description(description)
            .await
            .context("sending session description")?;

        let reason = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                next = rx.recv() => next,
            };
            let Some(batch) = next else {
                break StopReason::EndOfStream;
            };
            let Batch { buffer, missed } = batch?;

            self.send_batch(&*buffer, missed, transport)
                .await
                .with_context(|| format!("sending batch {}", self.encoder.batch()))?;
            drop(buffer);

            if kbytes_exceeded(self.stats.bytes, self.options.kbytes_limit) {
                info!(
                    kbytes = self.options.kbytes_limit,
                    bytes = self.stats.bytes,
                    "byte limit reached",
                );
                break StopReason::ByteLimit;
            }
        };

        transport.finish().await.context("closing transport")?;

        info!(
            ?reason,
            buffers = self.stats.buffers,
            packets = self.stats.packets,
            bytes = self.stats.bytes,
            missed = self.stats.missed,
            "sender session finished",
        );

        Ok(reason)
    }

    /// Encodes one buffer as a batch and writes its packets.
    pub async fn send_batch(
        &mut self,
        buffer: &Buffer,
        missed: u32,
        transport: &mut Transport,
    ) -> Result<()> {
        let started = Instant::now();

        let pending = &mut self.pending;
        self.encoder
            .encode_buffer(buffer, &mut self.identities, missed, |p| pending.push(p));

        let packets = self.pending.len() as u64;
        let mut bytes = 0u64;
        for packet in self.pending.drain(..) {
            bytes += transport.send_packet(packet).await? as u64;
        }
        transport.flush().await?;

        self.stats.buffers += 1;
        self.stats.samples += buffer.len() as u64;
        self.stats.packets += packets;
        self.stats.bytes += bytes;
        self.stats.missed = missed;

        debug!(
            batch = self.encoder.batch(),
            core = buffer.core(),
            samples = buffer.len(),
            packets,
            bytes,
            missed,
            "batch sent",
        );

        if let Some(metrics) = &self.metrics {
            let loads = self.identities.loads();
            metrics.buffers_drained.inc();
            metrics.samples_encoded.inc_by(buffer.len() as f64);
            metrics.packets_sent.inc_by(packets as f64);
            metrics.bytes_sent.inc_by(bytes as f64);
            metrics.samples_missed.set(f64::from(missed));
            metrics
                .identity_loads
                .inc_by(loads.saturating_sub(self.loads_reported) as f64);
            metrics.identities_tracked.set(self.identities.len() as f64);
            metrics
                .batch_duration
                .observe(started.elapsed().as_secs_f64());
            self.loads_reported = loads;
        }

        Ok(())
    }
}

/// Reader thread body: warm up, take the missed baseline, then forward
/// buffers until the source ends or the session goes away.
fn read_buffers<S, M>(
    mut source: S,
    mut missed: M,
    warmup: usize,
    tx: mpsc::Sender<Result<Batch<S::Item>>>,
) where
    S: BufferSource,
    M: MissedCounter,
{
    let forward = |item: Result<Batch<S::Item>>| tx.blocking_send(item).is_ok();

    for i in 0..warmup {
        match source.next_buffer() {
            Ok(Some(_)) => debug!(buffer = i, "discarded warm-up buffer"),
            Ok(None) => {
                warn!("source ended during warm-up");
                return;
            }
            Err(e) => {
                forward(Err(e.context("reading warm-up buffer")));
                return;
            }
        }
    }

    let baseline = match missed.read() {
        Ok(v) => v,
        Err(e) => {
            forward(Err(e.context("reading missed baseline")));
            return;
        }
    };
    debug!(baseline, "missed baseline taken");

    loop {
        let item = match source.next_buffer() {
            Ok(Some(buffer)) => missed.read().map(|m| Batch {
                buffer,
                missed: m.saturating_sub(baseline),
            }),
            Ok(None) => break,
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if !forward(item) || failed {
            break;
        }
    }
}

/// Checks that exactly one output was configured.
pub fn single_output<'a>(endpoint: &'a str, output: &'a str) -> Result<&'a str> {
    match (endpoint.is_empty(), output.is_empty()) {
        (false, true) => Ok(endpoint),
        (true, false) => Ok(output),
        (true, true) => bail!("no output configured: set an endpoint or an output file"),
        (false, false) => bail!("endpoint and output are mutually exclusive"),
    }
}
