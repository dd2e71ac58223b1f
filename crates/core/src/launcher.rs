//! Starting workers.
//!
//! A [`WorkerLauncher`] turns a [`WorkerInvocation`] into a running worker
//! and a [`Connection`] to it. [`SubprocessLauncher`] runs the `rxproxy`
//! binary once per invocation; [`InProcessLauncher`] runs the same worker
//! loop as a task over in-memory pipes, which shares this process's single
//! native claim but needs no executable.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rxproxy_protocol::{Event, WireError};
use rxproxy_runtime::{
	Connection, Endpoint, Error as RuntimeError, LaunchSpec, PipeTransport, Result as RuntimeResult, WorkerExit,
	WorkerProcess, find_worker_executable,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::config::{MULTIDEV_ENV, ProxyConfig};
use crate::native::DriverRegistry;
use crate::worker::{self, WorkerInvocation, WorkerOutcome};

/// Buffer of the in-memory pipe between host and in-process worker.
const IN_PROCESS_PIPE: usize = 1 << 20;

/// Exit a task-hosted worker reports when it faulted (SIGABRT).
const FAULT_SIGNAL: i32 = 6;
/// Exit a task-hosted worker reports when it was killed (SIGKILL).
pub(crate) const KILL_SIGNAL: i32 = 9;

/// Kill switch and exit status of one launched worker.
///
/// Dropping every clone of the control kills the worker.
#[derive(Clone)]
pub struct WorkerControl {
	inner: Arc<ControlInner>,
}

struct ControlInner {
	pid: Option<u32>,
	kill_tx: Mutex<Option<oneshot::Sender<()>>>,
	exit_rx: watch::Receiver<Option<WorkerExit>>,
}

/// The other half of a [`WorkerControl`], owned by the task that reaps the
/// worker.
pub(crate) struct Reaper {
	kill_rx: oneshot::Receiver<()>,
	exit_tx: watch::Sender<Option<WorkerExit>>,
}

impl WorkerControl {
	pub(crate) fn new(pid: Option<u32>) -> (Self, Reaper) {
		let (kill_tx, kill_rx) = oneshot::channel();
		let (exit_tx, exit_rx) = watch::channel(None);
		let control = Self {
			inner: Arc::new(ControlInner {
				pid,
				kill_tx: Mutex::new(Some(kill_tx)),
				exit_rx,
			}),
		};
		(control, Reaper { kill_rx, exit_tx })
	}

	pub fn pid(&self) -> Option<u32> {
		self.inner.pid
	}

	/// Requests a hard kill. Idempotent.
	pub fn kill(&self) {
		if let Some(tx) = self.inner.kill_tx.lock().take() {
			let _ = tx.send(());
		}
	}

	/// Waits until the worker has been reaped.
	pub async fn wait(&self) -> WorkerExit {
		let mut rx = self.inner.exit_rx.clone();
		match rx.wait_for(Option::is_some).await {
			Ok(exit) => (*exit).unwrap_or(WorkerExit::Unknown),
			Err(_) => WorkerExit::Unknown,
		}
	}

	/// Waits up to `grace`, then kills.
	pub async fn wait_or_kill(&self, grace: Duration) -> WorkerExit {
		if let Ok(exit) = tokio::time::timeout(grace, self.wait()).await {
			return exit;
		}
		debug!(target = "rxproxy.supervisor", pid = self.pid(), "worker still running after grace; killing");
		self.kill();
		self.wait().await
	}
}

/// A freshly started worker, before its handshake.
pub struct LaunchedWorker {
	pub connection: Arc<Connection>,
	pub events: mpsc::UnboundedReceiver<Event>,
	pub control: WorkerControl,
}

/// How a worker's startup handshake ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Handshake {
	Ready { pid: u32 },
	Failed(WireError),
	/// The worker went away without a handshake event.
	Exited(WorkerExit),
	TimedOut,
}

impl LaunchedWorker {
	fn start(connection: Connection, control: WorkerControl) -> RuntimeResult<Self> {
		let connection = Arc::new(connection);
		let events = connection
			.take_events()
			.ok_or_else(|| RuntimeError::LaunchFailed("worker events already taken".into()))?;
		let runner = Arc::clone(&connection);
		tokio::spawn(async move { runner.run().await });
		Ok(Self {
			connection,
			events,
			control,
		})
	}

	/// Waits for `Ready` or `Failed`, at most `timeout`.
	///
	/// A worker that closes its pipe without either is reaped (waiting up to
	/// `grace`) so its exit status can be reported.
	pub async fn handshake(&mut self, timeout: Duration, grace: Duration) -> Handshake {
		let Self {
			connection,
			events,
			control,
		} = self;
		let wait = async {
			loop {
				tokio::select! {
					biased;
					event = events.recv() => match event {
						Some(Event::Ready { pid, .. }) => return Handshake::Ready { pid },
						Some(Event::Failed { error }) => return Handshake::Failed(error),
						Some(Event::State { .. }) => continue,
						None => return Handshake::Exited(WorkerExit::Unknown),
					},
					_ = connection.closed() => {
						return Handshake::Exited(control.wait_or_kill(grace).await);
					}
				}
			}
		};
		tokio::time::timeout(timeout, wait).await.unwrap_or(Handshake::TimedOut)
	}
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
	async fn launch(&self, invocation: &WorkerInvocation) -> RuntimeResult<LaunchedWorker>;

	/// True when workers live in their own OS processes.
	fn is_subprocess(&self) -> bool;
}

/// Runs each worker as an `rxproxy worker` child process.
pub struct SubprocessLauncher {
	executable: Option<PathBuf>,
	env: BTreeMap<String, String>,
}

impl SubprocessLauncher {
	pub fn new(config: &ProxyConfig) -> Self {
		Self {
			executable: config.worker_executable.clone(),
			env: config.worker_env.clone(),
		}
	}
}

#[async_trait]
impl WorkerLauncher for SubprocessLauncher {
	async fn launch(&self, invocation: &WorkerInvocation) -> RuntimeResult<LaunchedWorker> {
		let program = find_worker_executable(self.executable.as_deref())?;
		// a worker must never start proxy mode itself
		let mut spec = LaunchSpec::new(program).env_remove(MULTIDEV_ENV);
		for arg in invocation.to_args() {
			spec = spec.arg(arg);
		}
		for (key, value) in &self.env {
			spec = spec.env(key.clone(), value.clone());
		}

		let (mut process, stdin, stdout) = WorkerProcess::launch(&spec)?;
		let (control, reaper) = WorkerControl::new(process.pid());
		info!(
			target = "rxproxy.supervisor",
			pid = process.pid(),
			driver = %invocation.driver,
			serial = invocation.serial.as_deref().unwrap_or("-"),
			probe = invocation.probe,
			"worker subprocess started"
		);

		tokio::spawn(async move {
			let Reaper { kill_rx, exit_tx } = reaper;
			let exit = tokio::select! {
				exit = process.wait() => exit,
				_ = kill_rx => process.kill().await,
			};
			let _ = exit_tx.send(Some(exit));
		});

		let (transport, message_rx) = PipeTransport::new(stdin, stdout);
		LaunchedWorker::start(Connection::new(transport.into_transport_parts(message_rx)), control)
	}

	fn is_subprocess(&self) -> bool {
		true
	}
}

/// Runs each worker as a task in this process.
pub struct InProcessLauncher {
	drivers: DriverRegistry,
}

impl InProcessLauncher {
	pub fn new(drivers: DriverRegistry) -> Self {
		Self { drivers }
	}
}

/// Exit status a task-hosted worker reports for `outcome`, mirroring what the
/// binary would exit with.
pub fn exit_for(outcome: &WorkerOutcome) -> WorkerExit {
	match outcome.exit_code() {
		Some(0) => WorkerExit::Clean,
		Some(code) => WorkerExit::Code(code),
		None => WorkerExit::Signal(FAULT_SIGNAL),
	}
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
	async fn launch(&self, invocation: &WorkerInvocation) -> RuntimeResult<LaunchedWorker> {
		let drivers = Arc::clone(&self.drivers);
		let invocation = invocation.clone();
		spawn_task_worker(move |endpoint| async move { exit_for(&worker::run(invocation, &drivers, endpoint).await) })
	}

	fn is_subprocess(&self) -> bool {
		false
	}
}

/// Runs `body` as a task-hosted worker behind an in-memory pipe. Its result
/// becomes the worker's exit status.
///
/// The pipe runs through a relay task. A kill aborts the worker task and the
/// relay, so the host sees the pipe close and the worker's remaining tasks
/// see EOF, as with a killed process.
pub(crate) fn spawn_task_worker<B, F>(body: B) -> RuntimeResult<LaunchedWorker>
where
	B: FnOnce(Endpoint) -> F,
	F: Future<Output = WorkerExit> + Send + 'static,
{
	let (host, mut host_link) = tokio::io::duplex(IN_PROCESS_PIPE);
	let (worker, mut worker_link) = tokio::io::duplex(IN_PROCESS_PIPE);
	let relay = tokio::spawn(async move {
		if let Err(err) = tokio::io::copy_bidirectional(&mut host_link, &mut worker_link).await {
			debug!(target = "rxproxy.transport", error = %err, "in-process pipe closed");
		}
	});

	let (host_r, host_w) = tokio::io::split(host);
	let (worker_r, worker_w) = tokio::io::split(worker);
	let mut task = tokio::spawn(body(Endpoint::connect(worker_w, worker_r)));

	let (control, reaper) = WorkerControl::new(None);
	tokio::spawn(async move {
		let Reaper { kill_rx, exit_tx } = reaper;
		let exit = tokio::select! {
			joined = &mut task => joined.unwrap_or(WorkerExit::Signal(FAULT_SIGNAL)),
			_ = kill_rx => {
				task.abort();
				relay.abort();
				WorkerExit::Signal(KILL_SIGNAL)
			}
		};
		let _ = exit_tx.send(Some(exit));
	});

	let (transport, message_rx) = PipeTransport::new(host_w, host_r);
	LaunchedWorker::start(Connection::new(transport.into_transport_parts(message_rx)), control)
}
