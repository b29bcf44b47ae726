//! Scripted [`Executor`] for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{MounterError, Result};
use crate::exec::{CommandOutput, Executor, render_command};

/// Records every command and filesystem mutation; unscripted commands
/// succeed with empty output.
#[derive(Default)]
pub(crate) struct FakeExecutor {
    responses: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    missing_tools: HashSet<String>,
    paths: Mutex<HashSet<PathBuf>>,
    dirs: HashMap<PathBuf, Vec<String>>,
    failing_writes: HashSet<PathBuf>,
    timeouts: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the result of a rendered command line. Repeated calls for the
    /// same line queue up; the last response is sticky.
    pub fn respond(self, command_line: &str, code: i32, stdout: &str, stderr: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(command_line.to_string())
            .or_default()
            .push_back(CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
        self
    }

    pub fn without_tool(mut self, tool: &str) -> Self {
        self.missing_tools.insert(tool.to_string());
        self
    }

    pub fn with_path(self, path: &str) -> Self {
        self.paths.lock().unwrap().insert(PathBuf::from(path));
        self
    }

    pub fn with_dir(mut self, path: &str, entries: &[&str]) -> Self {
        self.dirs.insert(
            PathBuf::from(path),
            entries.iter().map(|e| e.to_string()).collect(),
        );
        self
    }

    /// Make a rendered command line fail with `CommandTimeout`.
    pub fn timing_out(mut self, command_line: &str) -> Self {
        self.timeouts.insert(command_line.to_string());
        self
    }

    pub fn failing_write(mut self, path: &str) -> Self {
        self.failing_writes.insert(PathBuf::from(path));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.paths.lock().unwrap().contains(Path::new(path))
    }

    fn run(&self, command: &str, args: &[&str]) -> Result<CommandOutput> {
        if self.missing_tools.contains(command) {
            return Err(MounterError::ToolNotFound(command.to_string()));
        }
        let line = render_command(command, args);
        self.calls.lock().unwrap().push(line.clone());
        if self.timeouts.contains(&line) {
            return Err(MounterError::CommandTimeout {
                tool: command.to_string(),
                timeout: Duration::from_secs(20),
            });
        }
        let mut responses = self.responses.lock().unwrap();
        let output = match responses.get_mut(&line) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => CommandOutput {
                code: Some(0),
                ..Default::default()
            },
        };
        Ok(output)
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, command: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run(command, args)
    }

    fn execute_with_timeout(
        &self,
        _timeout: Duration,
        command: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        self.run(command, args)
    }

    fn is_executable(&self, name: &str) -> bool {
        !self.missing_tools.contains(name)
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.paths.lock().unwrap().contains(path)
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("mkdir {} {:o}", path.display(), mode));
        self.paths.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("rmdir {}", path.display()));
        if self.paths.lock().unwrap().remove(path) {
            Ok(())
        } else {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))
        }
    }

    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("write {} {}", path.display(), contents));
        if self.failing_writes.contains(path) {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        }
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>> {
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
    }
}
