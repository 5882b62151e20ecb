//! Capability-scoped runner for the external commands probes shell out to.
//!
//! Every command runs under a bounded timeout; a child that outlives it is
//! killed. Spawn failures and timeouts come back as `ProbeError`, which the
//! ladder folds into a `Failure` outcome.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::probe::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalCapability {
    /// Local version-control queries.
    VcsRead,
    /// Hosted forge CLI reads.
    ForgeRead,
    /// Plain HTTP reads.
    HttpRead,
}

impl ExternalCapability {
    pub fn as_str(self) -> &'static str {
        match self {
            ExternalCapability::VcsRead => "vcs_read",
            ExternalCapability::ForgeRead => "forge_read",
            ExternalCapability::HttpRead => "http_read",
        }
    }

    fn allowed_bins(self) -> &'static [&'static str] {
        match self {
            ExternalCapability::VcsRead => &["git"],
            ExternalCapability::ForgeRead => &["gh"],
            ExternalCapability::HttpRead => &["curl"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// First line of stdout, trimmed.
    pub fn first_line(&self) -> String {
        self.stdout.lines().next().unwrap_or("").trim().to_string()
    }
}

fn command_bin(command: &str) -> String {
    Path::new(command)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| command.to_string())
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = reader {
            let _ = r.read_to_end(&mut buf);
        }
        buf
    })
}

/// Run `command args..` in `cwd`, killing it after `timeout`.
///
/// A non-zero exit status is not an error here; callers decide what it means.
pub fn execute(
    capability: ExternalCapability,
    command: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, ProbeError> {
    execute_with_input(capability, command, args, cwd, None, timeout)
}

/// `execute`, feeding `input` to the child's stdin. Secrets go here rather
/// than on argv, which other local users can read from the process table.
pub fn execute_with_input(
    capability: ExternalCapability,
    command: &str,
    args: &[&str],
    cwd: &Path,
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, ProbeError> {
    let bin = command_bin(command);
    if !capability.allowed_bins().iter().any(|b| *b == bin) {
        return Err(ProbeError::Permission(format!(
            "capability '{}' does not allow binary '{}'",
            capability.as_str(),
            bin
        )));
    }

    let start = Instant::now();
    let mut child = Command::new(command)
        .args(args)
        .current_dir(cwd)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ProbeError::Connectivity(format!("'{}' is not installed or not on PATH", bin))
            }
            std::io::ErrorKind::PermissionDenied => {
                ProbeError::Permission(format!("not allowed to execute '{}': {}", bin, e))
            }
            _ => ProbeError::Connectivity(format!("failed to start '{}': {}", bin, e)),
        })?;

    let feeder = match (input, child.stdin.take()) {
        (Some(bytes), Some(mut stdin)) => {
            let bytes = bytes.to_vec();
            // Dropping `stdin` at the end closes the pipe so the child sees EOF.
            Some(thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            }))
        }
        _ => None,
    };
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProbeError::Connectivity(format!("waiting on '{}': {}", bin, e)));
            }
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            tracing::warn!(command = %bin, timeout_secs = timeout.as_secs(), "external command timed out");
            return Err(ProbeError::Timeout(timeout.as_secs()));
        }
        thread::sleep(Duration::from_millis(25));
    };

    if let Some(feeder) = feeder {
        let _ = feeder.join();
    }
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    tracing::debug!(
        command = %bin,
        capability = capability.as_str(),
        exit_code = ?status.code(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "external command finished"
    );

    Ok(CommandOutput {
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}
