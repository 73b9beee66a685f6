//! Process identity cache.
//!
//! Maps a pid to its command line, executable path and kernel/user mode.
//! Metadata is loaded on first sight and re-validated lazily, within a fixed
//! budget, in two situations:
//!
//! - the last load failed (the process may have been mid-exec or gone), and
//! - the process looked like the template process that forks application
//!   processes. Children of the template briefly carry its identity before
//!   they replace their program image, so any "template" pid newer than the
//!   earliest template seen is re-checked on every lookup.
//!
//! Entries are never evicted.

mod proc;

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

pub use proc::{ProcLoader, DEFAULT_PROC_ROOT};

/// Re-validation budget per entry.
pub const DEFAULT_CHECKS: u32 = 10;

/// Command line of the process that forks application processes.
pub const DEFAULT_TEMPLATE_NAME: &str = "zygote";

/// Whether a pid runs in kernel or user context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unknown,
    Kernel,
    User,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Kernel => "kernel",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one metadata load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessMetadata {
    pub cmdline: String,
    pub executable: String,
    /// False when either field could not be read.
    pub complete: bool,
}

/// Source of process metadata.
pub trait MetadataLoader {
    fn load(&self, pid: u32) -> ProcessMetadata;
}

/// Cached identity of one pid.
#[derive(Debug, Clone)]
pub struct ProcessIdentity {
    pid: u32,
    cmdline: String,
    executable: String,
    mode: Mode,
    cmdexe_checks: u32,
    template_checks: u32,
    cmdexe_error: bool,
    is_template: bool,
}

impl ProcessIdentity {
    fn new(pid: u32, checks: u32) -> Self {
        Self {
            pid,
            cmdline: String::new(),
            executable: String::new(),
            mode: Mode::Unknown,
            cmdexe_checks: checks,
            template_checks: checks,
            cmdexe_error: false,
            is_template: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_kernel(&self) -> bool {
        self.mode == Mode::Kernel
    }

    pub fn load_failed(&self) -> bool {
        self.cmdexe_error
    }

    pub fn is_template(&self) -> bool {
        self.is_template
    }

    pub fn remaining_load_checks(&self) -> u32 {
        self.cmdexe_checks
    }

    pub fn remaining_template_checks(&self) -> u32 {
        self.template_checks
    }

    fn pending(&self, earliest_template: Option<u32>) -> Revalidation {
        if self.cmdexe_error && self.cmdexe_checks > 0 {
            Revalidation::Retry
        } else if self.is_template
            && (earliest_template.is_some_and(|e| self.pid > e) || self.template_checks > 0)
        {
            Revalidation::Template
        } else {
            Revalidation::None
        }
    }

    fn apply(&mut self, meta: ProcessMetadata) {
        if self.mode == Mode::Unknown {
            self.mode = if meta.cmdline.is_empty() && meta.executable.is_empty() {
                Mode::Kernel
            } else {
                Mode::User
            };
        }
        self.cmdline = meta.cmdline;
        self.executable = meta.executable;
    }

    /// Records a full load. Returns true if the pid is now a template.
    fn settle_load(&mut self, meta: ProcessMetadata, template_name: &str) -> bool {
        let complete = meta.complete;
        self.apply(meta);
        self.cmdexe_error = !complete;
        if !complete {
            return false;
        }
        self.cmdexe_checks = 0;
        self.classify(template_name)
    }

    /// Records a template re-check. Returns true if the pid is still a template.
    fn settle_template_check(&mut self, meta: ProcessMetadata, template_name: &str) -> bool {
        let complete = meta.complete;
        self.template_checks = self.template_checks.saturating_sub(1);
        self.apply(meta);
        if !complete {
            self.template_checks = 0;
            return false;
        }
        self.classify(template_name)
    }

    fn classify(&mut self, template_name: &str) -> bool {
        self.is_template = program_name(&self.cmdline) == template_name;
        if !self.is_template {
            self.template_checks = 0;
        }
        self.is_template
    }
}

/// First argument of a space-joined cmdline.
fn program_name(cmdline: &str) -> &str {
    cmdline.split(' ').next().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Revalidation {
    None,
    Initial,
    Retry,
    Template,
}

/// pid → identity map with bounded lazy re-validation.
pub struct ProcessIdentityCache<L = ProcLoader> {
    loader: L,
    entries: HashMap<u32, ProcessIdentity>,
    earliest_template: Option<u32>,
    template_name: String,
    checks: u32,
    loads: u64,
}

impl<L: MetadataLoader> ProcessIdentityCache<L> {
    pub fn new(loader: L) -> Self {
        Self::with_policy(loader, DEFAULT_TEMPLATE_NAME, DEFAULT_CHECKS)
    }

    pub fn with_policy(loader: L, template_name: &str, checks: u32) -> Self {
        Self {
            loader,
            entries: HashMap::new(),
            earliest_template: None,
            template_name: template_name.to_string(),
            checks,
            loads: 0,
        }
    }

    /// Resolves `pid`, loading or re-validating its metadata as needed.
    ///
    /// `allow_revalidate` gates every reload of a known pid; callers pass
    /// false while a packet for that pid is being assembled so the identity
    /// cannot change under it.
    pub fn resolve(&mut self, pid: u32, allow_revalidate: bool) -> &ProcessIdentity {
        let action = match self.entries.get(&pid) {
            None => Revalidation::Initial,
            Some(entry) if allow_revalidate => entry.pending(self.earliest_template),
            Some(_) => Revalidation::None,
        };

        let meta = match action {
            Revalidation::None => None,
            _ => Some(self.load(pid)),
        };

        let checks = self.checks;
        let entry = self
            .entries
            .entry(pid)
            .or_insert_with(|| ProcessIdentity::new(pid, checks));

        if let Some(meta) = meta {
            match action {
                Revalidation::Initial | Revalidation::Retry => {
                    if action == Revalidation::Retry {
                        entry.cmdexe_checks = entry.cmdexe_checks.saturating_sub(1);
                    }
                    if entry.settle_load(meta, &self.template_name) {
                        let earliest = self.earliest_template.map_or(pid, |e| e.min(pid));
                        self.earliest_template = Some(earliest);
                    }
                    debug!(
                        pid,
                        mode = %entry.mode,
                        failed = entry.cmdexe_error,
                        template = entry.is_template,
                        "process identity loaded",
                    );
                }
                Revalidation::Template => {
                    if !entry.settle_template_check(meta, &self.template_name) {
                        debug!(pid, cmdline = %entry.cmdline, "template child re-identified");
                    }
                }
                Revalidation::None => {}
            }
        }

        entry
    }

    fn load(&mut self, pid: u32) -> ProcessMetadata {
        self.loads += 1;
        self.loader.load(pid)
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessIdentity> {
        self.entries.get(&pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lowest pid ever classified as a template process.
    pub fn earliest_template(&self) -> Option<u32> {
        self.earliest_template
    }

    /// Total metadata loads performed.
    pub fn loads(&self) -> u64 {
        self.loads
    }
}
