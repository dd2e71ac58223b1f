//! Worker child process control.
//!
//! A worker talks over its stdin/stdout; stderr is inherited so its logs land
//! next to the host's.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
	pub program: PathBuf,
	pub args: Vec<OsString>,
	/// Extra variables set in the child.
	pub env: Vec<(String, String)>,
	/// Variables removed from the inherited environment.
	pub env_remove: Vec<String>,
}

impl LaunchSpec {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			env: Vec::new(),
			env_remove: Vec::new(),
		}
	}

	pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.env.push((key.into(), value.into()));
		self
	}

	pub fn env_remove(mut self, key: impl Into<String>) -> Self {
		self.env_remove.push(key.into());
		self
	}
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
	/// Exit status 0.
	Clean,
	/// Nonzero exit status.
	Code(i32),
	/// Killed by a signal (abort, kill -9, ...).
	Signal(i32),
	/// Status could not be determined.
	Unknown,
}

impl WorkerExit {
	pub fn from_status(status: ExitStatus) -> Self {
		if let Some(code) = status.code() {
			return if code == 0 { WorkerExit::Clean } else { WorkerExit::Code(code) };
		}
		#[cfg(unix)]
		{
			use std::os::unix::process::ExitStatusExt;
			if let Some(signal) = status.signal() {
				return WorkerExit::Signal(signal);
			}
		}
		WorkerExit::Unknown
	}

	pub fn is_clean(self) -> bool {
		self == WorkerExit::Clean
	}
}

impl std::fmt::Display for WorkerExit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			WorkerExit::Clean => f.write_str("exit 0"),
			WorkerExit::Code(code) => write!(f, "exit {code}"),
			WorkerExit::Signal(signal) => write!(f, "signal {signal}"),
			WorkerExit::Unknown => f.write_str("unknown exit"),
		}
	}
}

/// A running worker subprocess.
#[derive(Debug)]
pub struct WorkerProcess {
	child: Child,
	pid: Option<u32>,
}

impl WorkerProcess {
	/// Spawns the worker and hands back its command pipes.
	///
	/// # Errors
	///
	/// Returns [`Error::LaunchFailed`] if the process cannot be started.
	/// A worker that exits right away is detected by the handshake instead.
	pub fn launch(spec: &LaunchSpec) -> Result<(Self, ChildStdin, ChildStdout)> {
		let mut cmd = Command::new(&spec.program);
		cmd.args(&spec.args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::inherit())
			.kill_on_drop(true);
		for key in &spec.env_remove {
			cmd.env_remove(key);
		}
		for (key, value) in &spec.env {
			cmd.env(key, value);
		}

		let mut child = cmd
			.spawn()
			.map_err(|e| Error::LaunchFailed(format!("spawning {}: {e}", spec.program.display())))?;

		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| Error::LaunchFailed("child stdin not captured".into()))?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| Error::LaunchFailed("child stdout not captured".into()))?;
		let pid = child.id();
		debug!(target = "rxproxy.supervisor", pid, program = %spec.program.display(), "worker spawned");

		Ok((Self { child, pid }, stdin, stdout))
	}

	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	/// Non-blocking exit check.
	pub fn try_exit(&mut self) -> Option<WorkerExit> {
		match self.child.try_wait() {
			Ok(Some(status)) => Some(WorkerExit::from_status(status)),
			Ok(None) => None,
			Err(_) => Some(WorkerExit::Unknown),
		}
	}

	/// Waits for the process to exit.
	pub async fn wait(&mut self) -> WorkerExit {
		match self.child.wait().await {
			Ok(status) => WorkerExit::from_status(status),
			Err(e) => {
				warn!(target = "rxproxy.supervisor", pid = self.pid, error = %e, "wait on worker failed");
				WorkerExit::Unknown
			}
		}
	}

	/// Gives the worker `grace` to exit by itself, then kills it.
	pub async fn terminate(&mut self, grace: Duration) -> WorkerExit {
		if let Ok(exit) = tokio::time::timeout(grace, self.wait()).await {
			return exit;
		}
		warn!(target = "rxproxy.supervisor", pid = self.pid, "worker ignored shutdown; killing");
		self.kill().await
	}

	/// Kills the process and reaps it.
	pub async fn kill(&mut self) -> WorkerExit {
		if let Err(e) = self.child.start_kill() {
			debug!(target = "rxproxy.supervisor", pid = self.pid, error = %e, "kill failed (already exited?)");
		}
		match tokio::time::timeout(Duration::from_millis(500), self.wait()).await {
			Ok(exit) => exit,
			Err(_) => WorkerExit::Unknown,
		}
	}
}
