//! Host command and filesystem seam
//!
//! Every interaction with the host (running `multipath`, `blkid`, `mount`,
//! writing sysfs control files, creating mount points) goes through the
//! [`Executor`] trait. [`SystemExecutor`] is the real implementation; tests
//! substitute a scripted one.

use std::fs;
use std::io::Read;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};
use wait_timeout::ChildExt;

use crate::error::{MounterError, Result};

/// Captured result of a finished host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Describe how the process ended.
    pub fn explain_exit(&self) -> String {
        match self.code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    /// Return stdout if the command succeeded, otherwise a `CommandFailed`
    /// error carrying the tool name, exit status and stderr.
    pub fn check(self, tool: &str) -> Result<String> {
        if self.success() {
            return Ok(self.stdout);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(MounterError::command_failed(
            tool,
            format!("{}: {}", self.explain_exit(), detail),
        ))
    }
}

/// Host capabilities consumed by the device primitives.
///
/// Callers must check [`Executor::is_executable`] before running a tool when
/// they need to distinguish a missing tool from a failing one.
pub trait Executor: Send + Sync {
    /// Run a command to completion.
    fn execute(&self, command: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a command, killing it if it does not finish within `timeout`.
    fn execute_with_timeout(
        &self,
        timeout: Duration,
        command: &str,
        args: &[&str],
    ) -> Result<CommandOutput>;

    /// Whether `name` resolves to an executable on `PATH`.
    fn is_executable(&self, name: &str) -> bool;

    fn path_exists(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path, mode: u32) -> std::io::Result<()>;

    fn remove_dir(&self, path: &Path) -> std::io::Result<()>;

    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()>;

    /// File names of the entries of a directory.
    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>>;
}

/// Render a command line for logs.
pub fn render_command(command: &str, args: &[&str]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// [`Executor`] backed by the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }

    fn spawn_error(command: &str, err: std::io::Error) -> MounterError {
        if err.kind() == std::io::ErrorKind::NotFound {
            MounterError::ToolNotFound(command.to_string())
        } else {
            MounterError::command_failed(command, format!("failed to execute: {}", err))
        }
    }
}

fn read_to_string_lossy(mut reader: impl Read) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf) {
        debug!(error = %e, "Failed to read command output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

impl Executor for SystemExecutor {
    fn execute(&self, command: &str, args: &[&str]) -> Result<CommandOutput> {
        let rendered = render_command(command, args);
        trace!(command = %rendered, "Executing");

        let output = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Self::spawn_error(command, e))?;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(
            command = %rendered,
            status = %result.explain_exit(),
            stdout = %result.stdout,
            stderr = %result.stderr,
            "Executed"
        );
        Ok(result)
    }

    fn execute_with_timeout(
        &self,
        timeout: Duration,
        command: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        let rendered = render_command(command, args);
        trace!(command = %rendered, timeout = ?timeout, "Executing with timeout");

        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(command, e))?;

        // Drain both pipes while waiting so a chatty tool cannot block on a full pipe
        let stdout = child
            .stdout
            .take()
            .map(|out| thread::spawn(move || read_to_string_lossy(out)));
        let stderr = child
            .stderr
            .take()
            .map(|err| thread::spawn(move || read_to_string_lossy(err)));

        let status = match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                if let Err(e) = child.kill() {
                    debug!(command = %rendered, error = %e, "Failed to kill timed out command");
                }
                if let Err(e) = child.wait() {
                    debug!(command = %rendered, error = %e, "Failed to reap timed out command");
                }
                return Err(MounterError::CommandTimeout {
                    tool: command.to_string(),
                    timeout,
                });
            }
        };

        let collect = |handle: Option<thread::JoinHandle<String>>| {
            handle
                .and_then(|h| h.join().ok())
                .unwrap_or_default()
        };
        let result = CommandOutput {
            code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };
        trace!(
            command = %rendered,
            status = %result.explain_exit(),
            stdout = %result.stdout,
            stderr = %result.stderr,
            "Executed"
        );
        Ok(result)
    }

    fn is_executable(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        fs::DirBuilder::new().recursive(true).mode(mode).create(path)
    }

    fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
        fs::remove_dir(path)
    }

    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        fs::write(path, contents)
    }

    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}
