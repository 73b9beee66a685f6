use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pmusync::capture::{
    BufferSource, CaptureTrigger, ConsumerStream, Control, Knob, RecordReader, SampleBufferPool,
    Sampler, SoftwareCounters,
};
use pmusync::config::{Config, OutputFormat};
use pmusync::demux::{self, Demultiplexer, DirectoryWriter};
use pmusync::export::health::HealthMetrics;
use pmusync::identity::{ProcLoader, ProcessIdentityCache};
use pmusync::sender::{
    self, read_session_description, MissedCounter, MissedFile, SessionContext, SessionOptions,
};
use pmusync::transport::{Endpoint, Transport};
use pmusync::wire::SessionDescription;

/// Performance-counter sample capture and per-process trace transport.
#[derive(Parser)]
#[command(name = "pmusync", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream buffer records from the capture device to a collector or file.
    Send {
        /// Capture device to read records from.
        #[arg(long)]
        device: Option<PathBuf>,

        /// Driver control directory holding `period` and the event selects.
        #[arg(long)]
        control_dir: Option<PathBuf>,

        /// Control file holding the missed-sample counter.
        #[arg(long)]
        missed: Option<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Run the capture pipeline against software counters.
    Simulate {
        /// Stop after this many seconds. Runs until interrupted otherwise.
        #[arg(long)]
        duration: Option<u64>,

        /// Simulated cores.
        #[arg(long)]
        cores: Option<usize>,

        /// Pids the simulated cores rotate through (comma separated).
        #[arg(long, value_delimiter = ',')]
        pids: Vec<u32>,

        /// Control knob assignment applied before capture starts, e.g.
        /// `period=20000` or `ctr1=0x10`. May be repeated.
        #[arg(long = "knob", value_name = "NAME=VALUE")]
        knobs: Vec<String>,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Split a session into per-process trace files.
    Split {
        /// Captured session file.
        #[arg(required_unless_present = "listen")]
        input: Option<PathBuf>,

        /// Accept one session over TCP instead of reading a file.
        #[arg(long, conflicts_with = "input")]
        listen: Option<String>,

        /// Directory to create for the output.
        #[arg(short = 'd', long)]
        dir: Option<PathBuf>,

        /// Trace file format.
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Print a captured session as text.
    Dump {
        /// Captured session file.
        input: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

/// Where a sender session writes.
#[derive(Args)]
struct OutputArgs {
    /// Collector address as host:port.
    #[arg(long, conflicts_with = "output")]
    endpoint: Option<String>,

    /// Capture file to write instead of a collector.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Mirror every byte sent into this file.
    #[arg(long)]
    mirror: Option<PathBuf>,

    /// Stop once more than this many kilobytes (1000 bytes) were sent.
    #[arg(long)]
    kbytes: Option<u64>,
}

impl OutputArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            cfg.sender.endpoint = endpoint.clone();
            cfg.sender.output.clear();
        }
        if let Some(output) = &self.output {
            cfg.sender.output = output.display().to_string();
            cfg.sender.endpoint.clear();
        }
        if let Some(mirror) = &self.mirror {
            cfg.sender.debug_mirror = mirror.display().to_string();
        }
        if let Some(kbytes) = self.kbytes {
            cfg.sender.kbytes_limit = kbytes;
        }
    }
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("pmusync {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // An explicit --log-level wins over the config file.
    let log_level = if cli.log_level != "info" || cli.config.is_none() {
        cli.log_level.clone()
    } else {
        cfg.log_level.clone()
    };
    let filter = EnvFilter::try_new(&log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    apply_overrides(&mut cfg, &cli.command);
    cfg.validate().context("invalid configuration")?;

    debug!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting pmusync",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, cli.command).await })
}

fn apply_overrides(cfg: &mut Config, command: &Command) {
    match command {
        Command::Send {
            device,
            control_dir,
            missed,
            output,
        } => {
            output.apply(cfg);
            if let Some(device) = device {
                cfg.sender.device = device.clone();
            }
            if let Some(dir) = control_dir {
                cfg.sender.control_dir = dir.clone();
            }
            if let Some(missed) = missed {
                cfg.sender.missed_path = missed.clone();
            }
        }
        Command::Simulate {
            cores,
            pids,
            output,
            ..
        } => {
            output.apply(cfg);
            if let Some(cores) = cores {
                cfg.capture.cores = *cores;
            }
            if !pids.is_empty() {
                cfg.capture.simulated_pids = pids.clone();
            }
        }
        Command::Split { dir, format, .. } => {
            if let Some(dir) = dir {
                cfg.reader.output_dir = dir.display().to_string();
            }
            if let Some(format) = format {
                cfg.reader.format = *format;
            }
        }
        Command::Dump { .. } | Command::Version => {}
    }
}

async fn run(cfg: Config, command: Command) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let metrics = if cfg.health.addr.is_empty() {
        None
    } else {
        let metrics = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
        metrics.start().await.context("starting health server")?;
        Some(metrics)
    };

    let result = match command {
        Command::Send { .. } => run_send(&cfg, metrics.clone(), cancel.clone()).await,
        Command::Simulate {
            duration, knobs, ..
        } => {
            let duration = duration.map(Duration::from_secs);
            run_simulate(&cfg, &knobs, duration, metrics.clone(), cancel.clone()).await
        }
        Command::Split { input, listen, .. } => {
            run_split(&cfg, input.as_deref(), listen.as_deref(), metrics.clone()).await
        }
        Command::Dump { input } => run_dump(&cfg, &input).await,
        Command::Version => Ok(()),
    };

    cancel.cancel();
    if let Some(metrics) = &metrics {
        metrics.stop().await?;
    }

    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "pmusync failed");
    }
    result
}

/// Cancels `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to register SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });
}

fn endpoint(cfg: &Config) -> Result<Endpoint> {
    let target = sender::single_output(&cfg.sender.endpoint, &cfg.sender.output)?;
    Ok(if cfg.sender.endpoint.is_empty() {
        Endpoint::File(PathBuf::from(target))
    } else {
        Endpoint::Tcp(target.to_string())
    })
}

async fn send_session<S, M>(
    cfg: &Config,
    source: S,
    missed: M,
    description: &SessionDescription,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: BufferSource,
    M: MissedCounter,
{
    let endpoint = endpoint(cfg)?;
    let mirror = (!cfg.sender.debug_mirror.is_empty())
        .then(|| PathBuf::from(&cfg.sender.debug_mirror));
    let mut transport = Transport::connect(&endpoint, mirror.as_deref()).await?;

    let identities = ProcessIdentityCache::with_policy(
        ProcLoader::new(&cfg.identity.proc_root),
        &cfg.identity.template_name,
        cfg.identity.checks,
    );
    let options = SessionOptions {
        warmup_buffers: cfg.sender.warmup_buffers,
        kbytes_limit: cfg.sender.kbytes_limit,
        queue_depth: cfg.sender.queue_depth,
    };
    let mut session = SessionContext::new(identities, options);
    if let Some(metrics) = metrics {
        session = session.with_metrics(metrics);
    }

    let reason = session
        .run(source, missed, description, &mut transport, cancel)
        .await
        .with_context(|| format!("sending to {endpoint}"))?;

    let stats = session.stats();
    info!(
        ?reason,
        buffers = stats.buffers,
        samples = stats.samples,
        bytes = stats.bytes,
        processes = session.identities().len(),
        "session complete",
    );

    Ok(())
}

async fn run_send(
    cfg: &Config,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) -> Result<()> {
    let source = RecordReader::open(&cfg.sender.device)?;
    let missed = MissedFile::new(&cfg.sender.missed_path);
    let description = read_session_description(&cfg.sender.control_dir)?;

    info!(device = %cfg.sender.device.display(), "reading capture device");
    send_session(cfg, source, missed, &description, metrics, cancel).await
}

async fn run_simulate(
    cfg: &Config,
    knobs: &[String],
    duration: Option<Duration>,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) -> Result<()> {
    let pool = Arc::new(SampleBufferPool::new(cfg.capture.pool_size));
    let control = Arc::new(Control::new(
        cfg.effective_period(),
        &cfg.capture.counter_events,
    ));
    let pids = if cfg.capture.simulated_pids.is_empty() {
        vec![std::process::id()]
    } else {
        cfg.capture.simulated_pids.clone()
    };
    let trigger = Arc::new(CaptureTrigger::new(
        Arc::clone(&pool),
        Arc::clone(&control),
        SoftwareCounters::new(cfg.capture.cores, pids),
        cfg.capture.cores,
    ));

    for assignment in knobs {
        let (name, value) = assignment
            .split_once('=')
            .with_context(|| format!("knob {assignment:?} is not NAME=VALUE"))?;
        let Some(knob) = Knob::from_name(name) else {
            bail!("unknown knob {name:?}");
        };
        trigger
            .apply(knob, value)
            .with_context(|| format!("applying knob {name}"))?;
    }

    trigger.start();
    let description =
        SessionDescription::from_settings(control.active_period(), &control.event_selects());
    let sampler = Sampler::spawn(Arc::clone(&trigger), cfg.capture.tick)?;

    // Stopping capture lets the session drain what is left and end cleanly.
    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        let cancel = cancel.clone();
        let trigger = Arc::clone(&trigger);
        tokio::spawn(async move {
            match duration {
                Some(d) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = stop.cancelled() => {}
                        _ = tokio::time::sleep(d) => info!(seconds = d.as_secs(), "simulation time elapsed"),
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = stop.cancelled() => {}
                    }
                }
            }

            let overflows = tokio::task::spawn_blocking(move || sampler.stop())
                .await
                .unwrap_or_default();
            trigger.stop();
            debug!(overflows, "sampler stopped");
        });
    }

    if let Some(metrics) = &metrics {
        spawn_pool_reporter(
            Arc::clone(metrics),
            Arc::clone(&pool),
            Arc::clone(&control),
            stop.clone(),
        );
    }

    let missed = Arc::clone(&control);
    let result = send_session(
        cfg,
        ConsumerStream::new(Arc::clone(&pool)),
        missed,
        &description,
        metrics,
        CancellationToken::new(),
    )
    .await;

    stop.cancel();
    info!(
        overflows = control.overflows(),
        missed = control.missed(),
        "simulation finished",
    );
    result
}

/// Publishes pool occupancy and capture counts once a second.
fn spawn_pool_reporter(
    metrics: Arc<HealthMetrics>,
    pool: Arc<SampleBufferPool>,
    control: Arc<Control>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reported = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    metrics.observe_pool(pool.stats());
                    let overflows = control.overflows();
                    metrics
                        .overflows
                        .inc_by(overflows.saturating_sub(reported) as f64);
                    reported = overflows;
                }
            }
        }
    });
}

async fn run_split(
    cfg: &Config,
    input: Option<&Path>,
    listen: Option<&str>,
    metrics: Option<Arc<HealthMetrics>>,
) -> Result<()> {
    if cfg.reader.output_dir.is_empty() {
        bail!("no output directory: pass --dir or set reader.output_dir");
    }
    let dir = PathBuf::from(&cfg.reader.output_dir);
    let writer = DirectoryWriter::create(&dir, cfg.reader.format)?;
    let demux = Demultiplexer::new(writer, cfg.reader.max_cores);

    let writer = match (input, listen) {
        (_, Some(addr)) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("listening on {addr}"))?;
            info!(addr = %listener.local_addr()?, "waiting for sender");
            let (socket, peer) = listener.accept().await.context("accepting sender")?;
            info!(%peer, "sender connected");
            demux::receive(socket, demux, metrics).await?
        }
        (Some(path), None) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            demux::receive(file, demux, metrics).await?
        }
        (None, None) => bail!("no input: pass a session file or --listen"),
    };

    info!(dir = %writer.dir().display(), "split complete");
    Ok(())
}

async fn run_dump(cfg: &Config, input: &Path) -> Result<()> {
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    let packets = demux::dump::dump(file, &mut out, cfg.reader.max_cores).await?;
    out.flush().context("writing dump")?;

    debug!(packets, "dump complete");
    Ok(())
}
