use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{IndexEntry, StreamKey, TraceWriter};
use crate::capture::record::{Sample, NUM_COUNTERS};
use crate::config::OutputFormat;
use crate::wire::SessionDescription;

/// Leading bytes of every binary trace file.
pub const BINARY_MAGIC: &[u8] = b"Trace binary file\n\0";

const TEXT_BOUNDARY: &str = ",,,,,,\n";
const BINARY_BOUNDARY: [u8; (1 + NUM_COUNTERS) * 4] = [0; (1 + NUM_COUNTERS) * 4];

/// Writes a session into a directory: `setup.txt`, `index.csv` and one
/// trace file per (core, pid).
pub struct DirectoryWriter {
    dir: PathBuf,
    format: OutputFormat,
}

impl DirectoryWriter {
    /// Creates `dir`, which must not exist yet.
    pub fn create(dir: &Path, format: OutputFormat) -> Result<Self> {
        std::fs::create_dir(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            format,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(&self, key: StreamKey) -> String {
        let ext = match self.format {
            OutputFormat::Text => "csv",
            OutputFormat::Binary => "trace",
        };
        format!("{}-core{}.{ext}", key.pid, key.core)
    }
}

impl TraceWriter for DirectoryWriter {
    type Stream = BufWriter<File>;

    fn describe(&mut self, description: &SessionDescription) -> Result<()> {
        let path = self.dir.join("setup.txt");
        std::fs::write(&path, description.as_str())
            .with_context(|| format!("writing {}", path.display()))
    }

    fn open(
        &mut self,
        key: StreamKey,
        cmdline: &str,
        executable: &str,
    ) -> Result<(Self::Stream, String)> {
        let path = self.dir.join(self.file_name(key));
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut out = BufWriter::new(file);

        match self.format {
            OutputFormat::Text => writeln!(out, "{cmdline}, {executable}")?,
            OutputFormat::Binary => {
                out.write_all(BINARY_MAGIC)?;
                out.write_all(cmdline.as_bytes())?;
                out.write_all(&[0])?;
                out.write_all(executable.as_bytes())?;
                out.write_all(&[0])?;
            }
        }

        let location = std::fs::canonicalize(&path).unwrap_or(path);
        Ok((out, location.display().to_string()))
    }

    fn write_samples(&mut self, stream: &mut Self::Stream, samples: &[Sample]) -> Result<()> {
        for s in samples {
            match self.format {
                OutputFormat::Text => {
                    write!(stream, "{}", s.cycles)?;
                    for c in &s.counters {
                        write!(stream, ",{c}")?;
                    }
                    stream.write_all(b"\n")?;
                }
                OutputFormat::Binary => {
                    stream.write_all(&(s.cycles as u32).to_le_bytes())?;
                    for c in &s.counters {
                        stream.write_all(&c.to_le_bytes())?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_boundary(&mut self, stream: &mut Self::Stream) -> Result<()> {
        match self.format {
            OutputFormat::Text => stream.write_all(TEXT_BOUNDARY.as_bytes())?,
            OutputFormat::Binary => stream.write_all(&BINARY_BOUNDARY)?,
        }
        Ok(())
    }

    fn close(&mut self, mut stream: Self::Stream) -> Result<()> {
        stream.flush().context("flushing trace file")
    }

    fn write_index(&mut self, entries: &[IndexEntry]) -> Result<()> {
        let path = self.dir.join("index.csv");
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut out = BufWriter::new(file);

        writeln!(out, "pid,core,cmdline,exe,path")?;
        for e in entries {
            writeln!(
                out,
                "{},{},{},{},{}",
                e.key.pid,
                e.key.core,
                csv_field(&e.cmdline),
                csv_field(&e.executable),
                csv_field(&e.location),
            )?;
        }
        out.flush()
            .with_context(|| format!("writing {}", path.display()))
    }
}

/// Quotes a field when it contains a separator, quote or line break.
fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
