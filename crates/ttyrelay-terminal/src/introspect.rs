//! OS-level session introspection.
//!
//! One [`Introspector`] implementation per platform family, chosen once via
//! [`native_introspector`]. Linux reads procfs directly; macOS asks `lsof`
//! and `ps`; everything else rejects every query immediately.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IntrospectionError;

type QueryResult<T> = std::result::Result<T, IntrospectionError>;

/// Answers "where is this shell" and "what is running in its foreground".
#[async_trait]
pub trait Introspector: Send + Sync + std::fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Current working directory of process `pid`.
    async fn cwd(&self, pid: u32) -> QueryResult<PathBuf>;

    /// Name of the foreground process on the terminal controlled by `pid`.
    async fn foreground_process(&self, pid: u32) -> QueryResult<String>;
}

/// The strategy for the platform this binary was built for.
pub fn native_introspector() -> Arc<dyn Introspector> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsIntrospector)
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(PsIntrospector)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Arc::new(UnsupportedIntrospector::new(std::env::consts::OS))
    }
}

// ---------------------------------------------------------------------------
// Linux
// ---------------------------------------------------------------------------

/// Linux: `/proc/<pid>/cwd` link and `/proc/<pid>/stat` foreground group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsIntrospector;

#[async_trait]
impl Introspector for ProcfsIntrospector {
    fn name(&self) -> &'static str {
        "procfs"
    }

    async fn cwd(&self, pid: u32) -> QueryResult<PathBuf> {
        Ok(tokio::fs::read_link(format!("/proc/{pid}/cwd")).await?)
    }

    async fn foreground_process(&self, pid: u32) -> QueryResult<String> {
        let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await?;
        let tpgid = parse_tpgid(&stat)?;
        // No controlling terminal: report the shell itself.
        let target = if tpgid > 0 { tpgid as u32 } else { pid };
        let comm = tokio::fs::read_to_string(format!("/proc/{target}/comm")).await?;
        Ok(comm.trim().to_string())
    }
}

/// Extract `tpgid` (field 8) from a `/proc/<pid>/stat` line.
///
/// The command name (field 2) is parenthesised and may itself contain spaces
/// or parentheses, so fields are counted from the last `)`.
pub(crate) fn parse_tpgid(stat: &str) -> QueryResult<i64> {
    let rest = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .ok_or_else(|| IntrospectionError::Parse("stat line without comm".to_string()))?;
    // state ppid pgrp session tty_nr tpgid
    rest.split_whitespace()
        .nth(5)
        .ok_or_else(|| IntrospectionError::Parse("stat line too short".to_string()))?
        .parse::<i64>()
        .map_err(|e| IntrospectionError::Parse(format!("tpgid: {e}")))
}

// ---------------------------------------------------------------------------
// macOS
// ---------------------------------------------------------------------------

/// macOS: `lsof` for the cwd, `ps` for the foreground process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct PsIntrospector;

#[async_trait]
impl Introspector for PsIntrospector {
    fn name(&self) -> &'static str {
        "lsof+ps"
    }

    async fn cwd(&self, pid: u32) -> QueryResult<PathBuf> {
        let pid = pid.to_string();
        let out = run("lsof", &["-a", "-d", "cwd", "-p", &pid, "-Fn"]).await?;
        parse_lsof_cwd(&out)
    }

    async fn foreground_process(&self, pid: u32) -> QueryResult<String> {
        let pid = pid.to_string();
        let tpgid = run("ps", &["-o", "tpgid=", "-p", &pid]).await?;
        let tpgid = tpgid.trim();
        let target = match tpgid.parse::<i64>() {
            Ok(n) if n > 0 => tpgid,
            _ => pid.as_str(),
        };
        let comm = run("ps", &["-o", "comm=", "-p", target]).await?;
        let comm = comm.trim();
        if comm.is_empty() {
            return Err(IntrospectionError::Parse("empty ps output".to_string()));
        }
        // BSD ps reports the full executable path.
        Ok(comm.rsplit('/').next().unwrap_or(comm).to_string())
    }
}

/// Pull the `n<path>` record out of `lsof -F n` output.
pub(crate) fn parse_lsof_cwd(out: &str) -> QueryResult<PathBuf> {
    out.lines()
        .filter_map(|line| line.strip_prefix('n'))
        .find(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| IntrospectionError::Parse("no cwd record in lsof output".to_string()))
}

async fn run(program: &str, args: &[&str]) -> QueryResult<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        return Err(IntrospectionError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ---------------------------------------------------------------------------
// Everything else
// ---------------------------------------------------------------------------

/// Platforms without a known introspection method.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedIntrospector {
    os: &'static str,
}

impl UnsupportedIntrospector {
    pub fn new(os: &'static str) -> Self {
        Self { os }
    }
}

#[async_trait]
impl Introspector for UnsupportedIntrospector {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn cwd(&self, _pid: u32) -> QueryResult<PathBuf> {
        Err(IntrospectionError::Unsupported(self.os))
    }

    async fn foreground_process(&self, _pid: u32) -> QueryResult<String> {
        Err(IntrospectionError::Unsupported(self.os))
    }
}
