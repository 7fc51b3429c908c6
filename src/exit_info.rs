// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Termination bookkeeping: why the policy was deactivated, recorded once
//! by the Exit hook and read by userspace after teardown.

use std::sync::OnceLock;

use anyhow::bail;
use anyhow::Result;

/// Exit code bit asking userspace to restart the scheduler.
pub const SCX_ECODE_ACT_RESTART: u64 = 1u64 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScxExitKind {
    None = 0,
    Done = 1,
    Unreg = 64,
    UnregBPF = 65,
    UnregKern = 66,
    SysRq = 67,
    Error = 1024,
    ErrorBPF = 1025,
    ErrorStall = 1026,
}

impl ScxExitKind {
    /// Human-readable reason, as the kernel's scx_exit_reason().
    pub fn reason(self) -> &'static str {
        match self {
            ScxExitKind::None => "",
            ScxExitKind::Done => "normal",
            ScxExitKind::Unreg => "unregistered from user space",
            ScxExitKind::UnregBPF => "unregistered from BPF",
            ScxExitKind::UnregKern => "unregistered from the main kernel",
            ScxExitKind::SysRq => "disabled by sysrq-S",
            ScxExitKind::Error => "runtime error",
            ScxExitKind::ErrorBPF => "scx_bpf_error",
            ScxExitKind::ErrorStall => "runnable task stall",
        }
    }
}

/// What the host passes to the Exit hook (struct scx_exit_info).
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub kind: ScxExitKind,
    pub exit_code: u64,
    pub reason: String,
    pub msg: String,
    pub dump: String,
}

impl ExitInfo {
    pub fn new(kind: ScxExitKind, msg: impl Into<String>) -> Self {
        ExitInfo {
            kind,
            exit_code: 0,
            reason: kind.reason().to_string(),
            msg: msg.into(),
            dump: String::new(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: u64) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// Userspace view of the exit record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserExitInfo {
    /// ScxExitKind value. Non-zero means the scheduler has exited.
    kind: i32,
    exit_code: u64,
    reason: Option<String>,
    msg: Option<String>,
    dump: Option<String>,
}

impl UserExitInfo {
    pub fn from_exit_info(ei: &ExitInfo) -> Self {
        let non_empty = |s: &str| Some(s.to_string()).filter(|s| !s.is_empty());
        Self {
            kind: ei.kind as i32,
            exit_code: ei.exit_code,
            reason: non_empty(&ei.reason),
            msg: non_empty(&ei.msg),
            dump: non_empty(&ei.dump),
        }
    }

    pub fn kind(&self) -> i32 {
        self.kind
    }

    pub fn exit_code(&self) -> u64 {
        self.exit_code
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn msg(&self) -> Option<&str> {
        self.msg.as_deref()
    }

    /// Print out the exit message to stderr if the exit was normal. After
    /// an error exit, it throws an error containing the exit message
    /// instead. If debug dump exists, it's always printed to stderr.
    pub fn report(&self) -> Result<()> {
        if self.kind == 0 {
            return Ok(());
        }

        if let Some(dump) = &self.dump {
            eprintln!("\nDEBUG DUMP");
            eprintln!("================================================================================\n");
            eprintln!("{}", dump);
            eprintln!("================================================================================\n");
        }

        let why = match (&self.reason, &self.msg) {
            (Some(reason), None) => format!("EXIT: {}", reason),
            (Some(reason), Some(msg)) => format!("EXIT: {} ({})", reason, msg),
            _ => "<UNKNOWN>".into(),
        };

        if self.kind <= ScxExitKind::UnregKern as i32 {
            eprintln!("{}", why);
            Ok(())
        } else {
            bail!("{}", why)
        }
    }

    /// Whether the exit asked userspace to bring the scheduler back up.
    pub fn should_restart(&self) -> bool {
        self.exit_code & SCX_ECODE_ACT_RESTART != 0
    }
}

/// Write-once exit record (UEI_DEFINE/UEI_RECORD).
#[derive(Debug, Default)]
pub struct ExitRecord {
    uei: OnceLock<UserExitInfo>,
}

impl ExitRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `ei`. Returns false if a record was already present, in
    /// which case the first one is kept.
    pub fn record(&self, ei: &ExitInfo) -> bool {
        self.uei.set(UserExitInfo::from_exit_info(ei)).is_ok()
    }

    pub fn exited(&self) -> bool {
        self.uei.get().is_some()
    }

    /// The recorded exit, valid only after the Exit hook has run.
    pub fn read(&self) -> Option<&UserExitInfo> {
        self.uei.get()
    }

    /// Read the record, or an empty one if the policy is still active.
    pub fn read_or_default(&self) -> UserExitInfo {
        self.uei.get().cloned().unwrap_or_default()
    }
}
