//! Subprocess execution helper: a small builder around
//! [`std::process::Command`] that logs what it runs and gives callers a
//! uniform way to get either success/failure or captured output.

use std::process::{Command, Output, Stdio};

/// A named external command, built up fluently before running.
pub struct Task {
    description: String,
    cmd: Command,
}

/// The outcome of running a [`Task`] with captured output.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    /// Process exit code, if the process terminated normally.
    pub code: i32,
    /// Captured, UTF-8-lossy-decoded, trimmed stdout.
    pub stdout: String,
    /// Captured, UTF-8-lossy-decoded, trimmed stderr.
    pub stderr: String,
}

impl TaskOutput {
    fn from_output(o: Output) -> Self {
        Self {
            code: o.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&o.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&o.stderr).trim().to_string(),
        }
    }

    /// Whether the process exited successfully.
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

impl Task {
    /// Start building a task that runs `exe`.
    pub fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        cmd.stdin(Stdio::null());
        Self {
            description: description.as_ref().to_string(),
            cmd,
        }
    }

    /// Append arguments.
    pub fn args<S: AsRef<std::ffi::OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Set the working directory.
    pub fn current_dir(mut self, dir: impl AsRef<std::path::Path>) -> Self {
        self.cmd.current_dir(dir);
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl AsRef<std::ffi::OsStr>, value: impl AsRef<std::ffi::OsStr>) -> Self {
        self.cmd.env(key, value);
        self
    }

    /// Run to completion, capturing stdout/stderr rather than inheriting
    /// them. Never fails on a non-zero exit; the caller inspects
    /// [`TaskOutput::success`].
    pub fn run_captured(mut self) -> anyhow::Result<TaskOutput> {
        tracing::debug!(description = %self.description, cmd = ?self.cmd, "exec");
        self.cmd.stdout(Stdio::piped());
        self.cmd.stderr(Stdio::piped());
        let output = self.cmd.output()?;
        Ok(TaskOutput::from_output(output))
    }

    /// Run to completion, returning an error if the exit code is non-zero.
    /// Used for steps whose failure should abort the whole pipeline (e.g.
    /// mounting), as opposed to steps whose failure is reported back to the
    /// caller verbatim (e.g. the activation script).
    pub fn run(self) -> anyhow::Result<()> {
        let description = self.description.clone();
        let out = self.run_captured()?;
        if !out.success() {
            anyhow::bail!("{description} failed ({}): {}", out.code, out.stderr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = Task::new("echo", "echo").args(["hello"]).run_captured().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
    }

    #[test]
    fn reports_nonzero_exit() {
        let out = Task::new("false", "false").run_captured().unwrap();
        assert!(!out.success());
    }
}
