use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::trace;

use super::{MetadataLoader, ProcessMetadata};

/// Default procfs mount point.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Loads process metadata from a procfs tree.
#[derive(Debug, Clone)]
pub struct ProcLoader {
    root: PathBuf,
}

impl ProcLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for ProcLoader {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl MetadataLoader for ProcLoader {
    fn load(&self, pid: u32) -> ProcessMetadata {
        let dir = self.root.join(pid.to_string());
        let mut complete = true;

        let cmdline = read_cmdline(&dir).unwrap_or_else(|e| {
            trace!(pid, error = %e, "cmdline unavailable");
            complete = false;
            String::new()
        });
        let executable = read_exe(&dir).unwrap_or_else(|e| {
            trace!(pid, error = %e, "executable unavailable");
            complete = false;
            String::new()
        });

        ProcessMetadata {
            cmdline,
            executable,
            complete,
        }
    }
}

/// Read `<dir>/cmdline`, joining NUL-separated args with spaces.
fn read_cmdline(dir: &Path) -> Result<String> {
    let path = dir.join("cmdline");
    let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(String::from_utf8_lossy(&data)
        .split('\0')
        .filter(|arg| !arg.is_empty())
        .collect::<Vec<_>>()
        .join(" "))
}

/// Resolve the `<dir>/exe` link.
fn read_exe(dir: &Path) -> Result<String> {
    let path = dir.join("exe");
    let target = std::fs::read_link(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(target.to_string_lossy().into_owned())
}
