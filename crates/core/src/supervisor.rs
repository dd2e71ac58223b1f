//! Worker lifecycle: one worker per serial, spawned on demand, watched by
//! heartbeats, reaped on exit.
//!
//! The registry maps each serial to either a worker that is still starting
//! or a live [`WorkerHandle`]. Its lock only guards map updates; launching,
//! the handshake and every command run with the lock released. A second
//! `acquire` for a serial that is starting waits for the first attempt and
//! shares its result.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rxproxy_protocol::{Command, DeviceArgs, DeviceDescriptor, Event, Reply, WorkerState};
use rxproxy_runtime::{Connection, WorkerExit};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::launcher::{Handshake, LaunchedWorker, WorkerControl, WorkerLauncher};
use crate::worker::{self, WorkerInvocation};

/// Snapshot of one worker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRecord {
	pub serial: String,
	pub driver: String,
	/// OS process id; `None` for task-hosted workers.
	pub pid: Option<u32>,
	/// How the manager reaches the worker.
	pub endpoint: String,
	pub generation: u64,
	pub state: WorkerState,
	pub open_handles: u32,
	pub last_heartbeat: Option<SystemTime>,
}

/// Manager-side view of one running worker.
pub struct WorkerHandle {
	serial: String,
	driver: String,
	generation: u64,
	endpoint: String,
	connection: Arc<Connection>,
	control: WorkerControl,
	command_timeout: Duration,
	/// Upper bound on waiting for a lost worker to be classified.
	reap_timeout: Duration,
	state: Mutex<WorkerState>,
	crash: Mutex<Option<String>>,
	open_handles: AtomicU32,
	last_heartbeat: Mutex<Option<SystemTime>>,
	descriptor: Mutex<Option<DeviceDescriptor>>,
	/// Serializes open/close bookkeeping against drain.
	ops: tokio::sync::Mutex<()>,
	dead: watch::Sender<bool>,
}

impl WorkerHandle {
	pub fn serial(&self) -> &str {
		&self.serial
	}

	pub fn driver(&self) -> &str {
		&self.driver
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn pid(&self) -> Option<u32> {
		self.control.pid()
	}

	pub fn state(&self) -> WorkerState {
		*self.state.lock()
	}

	/// Why the worker was declared crashed, if it was.
	pub fn crash_reason(&self) -> Option<String> {
		self.crash.lock().clone()
	}

	/// Ready or active, with its pipe open.
	pub fn accepts_work(&self) -> bool {
		matches!(self.state(), WorkerState::Ready | WorkerState::Active) && !self.connection.is_closed()
	}

	pub fn descriptor(&self) -> Option<DeviceDescriptor> {
		self.descriptor.lock().clone()
	}

	pub fn set_descriptor(&self, descriptor: DeviceDescriptor) {
		*self.descriptor.lock() = Some(descriptor);
	}

	/// Holds off drain decisions while the caller opens or closes a handle.
	pub async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
		self.ops.lock().await
	}

	pub fn note_opened(&self) {
		self.open_handles.fetch_add(1, Ordering::SeqCst);
		self.transition(WorkerState::Active);
	}

	pub fn note_closed(&self, remaining: u32) {
		self.open_handles.store(remaining, Ordering::SeqCst);
		if remaining == 0 {
			self.transition(WorkerState::Draining);
		}
	}

	/// Resolves once the worker has been reaped and classified.
	pub async fn dead(&self) {
		let mut rx = self.dead.subscribe();
		let _ = rx.wait_for(|dead| *dead).await;
	}

	pub fn is_dead(&self) -> bool {
		*self.dead.borrow()
	}

	pub(crate) fn control(&self) -> &WorkerControl {
		&self.control
	}

	/// Sends `command` and waits for the reply.
	///
	/// A closed pipe is reported as [`Error::WorkerCrash`] once the worker
	/// has been classified as crashed, else as [`Error::TransportClosed`].
	pub async fn call(&self, command: Command) -> Result<Reply> {
		match self.connection.request(command, self.command_timeout).await {
			Ok(reply) => Ok(reply),
			Err(err) if err.is_closed() => Err(self.lost().await),
			Err(err) => Err(Error::from_runtime(&self.serial, err)),
		}
	}

	async fn lost(&self) -> Error {
		let _ = tokio::time::timeout(self.reap_timeout, self.dead()).await;
		match self.crash_reason() {
			Some(reason) => Error::WorkerCrash {
				serial: self.serial.clone(),
				reason,
			},
			None => Error::TransportClosed {
				serial: self.serial.clone(),
			},
		}
	}

	pub fn record(&self) -> WorkerRecord {
		WorkerRecord {
			serial: self.serial.clone(),
			driver: self.driver.clone(),
			pid: self.control.pid(),
			endpoint: self.endpoint.clone(),
			generation: self.generation,
			state: self.state(),
			open_handles: self.open_handles.load(Ordering::SeqCst),
			last_heartbeat: *self.last_heartbeat.lock(),
		}
	}

	/// Moves to `next` unless the worker already reached a final state.
	fn transition(&self, next: WorkerState) {
		let mut state = self.state.lock();
		if !state.is_final() && *state != next {
			debug!(target = "rxproxy.supervisor", serial = %self.serial, from = %*state, to = %next, "worker state");
			*state = next;
		}
	}

	fn mark_crashed(&self, reason: String) {
		{
			let mut crash = self.crash.lock();
			if crash.is_none() {
				*crash = Some(reason);
			}
		}
		*self.state.lock() = WorkerState::Crashed;
	}
}

impl fmt::Debug for WorkerHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WorkerHandle")
			.field("serial", &self.serial)
			.field("generation", &self.generation)
			.field("pid", &self.control.pid())
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

enum Slot {
	Starting {
		driver: String,
		result: watch::Receiver<Option<Result<Arc<WorkerHandle>>>>,
	},
	Live(Arc<WorkerHandle>),
}

type Registry = Arc<Mutex<HashMap<String, Slot>>>;

/// Clears a `Starting` slot whose spawning caller went away.
struct StartGuard {
	registry: Registry,
	serial: String,
	armed: bool,
}

impl Drop for StartGuard {
	fn drop(&mut self) {
		if self.armed {
			let mut registry = self.registry.lock();
			if matches!(registry.get(&self.serial), Some(Slot::Starting { .. })) {
				registry.remove(&self.serial);
			}
		}
	}
}

enum Next {
	WaitStart(watch::Receiver<Option<Result<Arc<WorkerHandle>>>>),
	WaitDeath(Arc<WorkerHandle>),
	Spawn(watch::Sender<Option<Result<Arc<WorkerHandle>>>>),
}

pub struct Supervisor {
	launcher: Arc<dyn WorkerLauncher>,
	config: ProxyConfig,
	registry: Registry,
	generation: AtomicU64,
	closing: AtomicBool,
}

impl Supervisor {
	pub fn new(launcher: Arc<dyn WorkerLauncher>, config: ProxyConfig) -> Self {
		Self {
			launcher,
			config,
			registry: Arc::new(Mutex::new(HashMap::new())),
			generation: AtomicU64::new(1),
			closing: AtomicBool::new(false),
		}
	}

	/// The worker for `serial`, spawning one if none is running.
	///
	/// `hints` apply only when this call spawns the worker.
	pub async fn acquire(&self, driver: &str, serial: &str, hints: &DeviceArgs) -> Result<Arc<WorkerHandle>> {
		loop {
			if self.closing.load(Ordering::SeqCst) {
				return Err(Error::SpawnFailure {
					serial: serial.to_string(),
					reason: "proxy manager is shutting down".into(),
				});
			}

			let next = {
				let mut registry = self.registry.lock();
				match registry.get(serial) {
					Some(Slot::Live(handle)) if handle.accepts_work() => return Ok(Arc::clone(handle)),
					Some(Slot::Live(handle)) => Next::WaitDeath(Arc::clone(handle)),
					Some(Slot::Starting { result, .. }) => Next::WaitStart(result.clone()),
					None => {
						let (tx, rx) = watch::channel(None);
						registry.insert(
							serial.to_string(),
							Slot::Starting {
								driver: driver.to_string(),
								result: rx,
							},
						);
						Next::Spawn(tx)
					}
				}
			};

			match next {
				Next::WaitStart(mut rx) => {
					debug!(target = "rxproxy.supervisor", serial, "waiting for worker already starting");
					let shared = rx.wait_for(Option::is_some).await.ok().and_then(|result| result.clone());
					if let Some(result) = shared {
						return result;
					}
				}
				Next::WaitDeath(handle) => {
					debug!(target = "rxproxy.supervisor", serial, state = %handle.state(), "waiting for previous worker to exit");
					handle.dead().await;
				}
				Next::Spawn(tx) => {
					let mut guard = StartGuard {
						registry: Arc::clone(&self.registry),
						serial: serial.to_string(),
						armed: true,
					};
					let result = self.spawn(driver, serial, hints).await;
					{
						let mut registry = self.registry.lock();
						match &result {
							Ok(handle) if !handle.is_dead() => {
								registry.insert(serial.to_string(), Slot::Live(Arc::clone(handle)));
							}
							_ => {
								registry.remove(serial);
							}
						}
					}
					guard.armed = false;
					tx.send_replace(Some(result.clone()));
					return result;
				}
			}
		}
	}

	async fn spawn(&self, driver: &str, serial: &str, hints: &DeviceArgs) -> Result<Arc<WorkerHandle>> {
		let generation = self.generation.fetch_add(1, Ordering::SeqCst);
		let invocation =
			WorkerInvocation::device(driver, serial, hints.clone()).with_claim_lock(self.config.claim_lock(driver));
		let LaunchedWorker {
			connection,
			events,
			control,
		} = {
			let mut launched = self
				.launcher
				.launch(&invocation)
				.await
				.map_err(|e| Error::from_runtime(serial, e))?;
			let timeout = self.config.handshake_timeout();
			match launched.handshake(timeout, self.config.shutdown_grace()).await {
				Handshake::Ready { pid } => {
					debug!(target = "rxproxy.supervisor", serial, worker_pid = pid, "handshake complete");
					launched
				}
				failed => {
					launched.control.kill();
					let err = handshake_error(serial, failed, timeout);
					warn!(target = "rxproxy.supervisor", serial, error = %err, "worker failed to start");
					return Err(err);
				}
			}
		};

		let endpoint = match control.pid() {
			Some(pid) => format!("pipe:{pid}"),
			None => "in-process".to_string(),
		};
		let (dead, _) = watch::channel(false);
		let handle = Arc::new(WorkerHandle {
			serial: serial.to_string(),
			driver: driver.to_string(),
			generation,
			endpoint,
			connection,
			control,
			command_timeout: self.config.command_timeout(),
			reap_timeout: self.config.heartbeat_interval() + self.config.shutdown_grace(),
			state: Mutex::new(WorkerState::Ready),
			crash: Mutex::new(None),
			open_handles: AtomicU32::new(0),
			last_heartbeat: Mutex::new(None),
			descriptor: Mutex::new(None),
			ops: tokio::sync::Mutex::new(()),
			dead,
		});
		info!(
			target = "rxproxy.supervisor",
			serial,
			generation,
			pid = handle.pid(),
			endpoint = %handle.endpoint,
			"worker ready"
		);

		tokio::spawn(monitor(
			Arc::clone(&handle),
			events,
			Arc::clone(&self.registry),
			self.config.heartbeat_interval(),
			self.config.missed_heartbeats,
			self.config.shutdown_grace(),
		));
		Ok(handle)
	}

	/// The live worker for `serial`, if any.
	pub fn get(&self, serial: &str) -> Option<Arc<WorkerHandle>> {
		match self.registry.lock().get(serial) {
			Some(Slot::Live(handle)) => Some(Arc::clone(handle)),
			_ => None,
		}
	}

	pub fn live(&self) -> Vec<Arc<WorkerHandle>> {
		self.registry
			.lock()
			.values()
			.filter_map(|slot| match slot {
				Slot::Live(handle) => Some(Arc::clone(handle)),
				Slot::Starting { .. } => None,
			})
			.collect()
	}

	pub fn records(&self) -> Vec<WorkerRecord> {
		let mut records: Vec<WorkerRecord> = self
			.registry
			.lock()
			.iter()
			.map(|(serial, slot)| match slot {
				Slot::Live(handle) => handle.record(),
				Slot::Starting { driver, .. } => WorkerRecord {
					serial: serial.clone(),
					driver: driver.clone(),
					pid: None,
					endpoint: String::new(),
					generation: 0,
					state: WorkerState::Starting,
					open_handles: 0,
					last_heartbeat: None,
				},
			})
			.collect();
		records.sort_by(|a, b| a.serial.cmp(&b.serial));
		records
	}

	/// Asks every worker to stop; kills those still running after the grace
	/// period. New `acquire` calls fail from here on.
	pub async fn shutdown(&self) {
		self.closing.store(true, Ordering::SeqCst);
		let workers = self.live();
		if workers.is_empty() {
			return;
		}
		info!(target = "rxproxy.supervisor", count = workers.len(), "stopping workers");

		let grace = self.config.shutdown_grace();
		let mut stops = JoinSet::new();
		for handle in workers {
			stops.spawn(async move {
				if !handle.connection.is_closed() {
					let request = handle.connection.request(Command::Shutdown, grace);
					if let Err(err) = request.await {
						debug!(target = "rxproxy.supervisor", serial = %handle.serial, error = %err, "shutdown request failed");
					}
				}
				if tokio::time::timeout(grace, handle.dead()).await.is_err() {
					warn!(target = "rxproxy.supervisor", serial = %handle.serial, "worker ignored shutdown; killing");
					handle.control.kill();
					handle.dead().await;
				}
			});
		}
		while stops.join_next().await.is_some() {}
	}
}

fn handshake_error(serial: &str, handshake: Handshake, timeout: Duration) -> Error {
	let serial = serial.to_string();
	match handshake {
		Handshake::Ready { .. } => Error::Protocol("handshake succeeded".into()),
		Handshake::Failed(error) => Error::from_wire(&serial, error),
		Handshake::TimedOut => Error::HandshakeTimeout {
			serial,
			timeout_ms: timeout.as_millis() as u64,
		},
		Handshake::Exited(exit) => match exit {
			WorkerExit::Code(worker::EXIT_NOT_FOUND) => Error::DeviceNotFound {
				serial,
				detail: format!("worker subprocess exited ({exit})"),
			},
			WorkerExit::Code(worker::EXIT_BUSY) => Error::DeviceBusy {
				serial,
				detail: format!("worker subprocess exited ({exit})"),
			},
			WorkerExit::Signal(_) => Error::WorkerCrash {
				serial,
				reason: format!("{exit} before ready"),
			},
			_ => Error::SpawnFailure {
				serial,
				reason: format!("worker exited ({exit}) before ready"),
			},
		},
	}
}

/// Heartbeats a worker until its pipe closes, then reaps and classifies it.
async fn monitor(
	handle: Arc<WorkerHandle>,
	mut events: mpsc::UnboundedReceiver<Event>,
	registry: Registry,
	interval: Duration,
	missed_limit: u32,
	grace: Duration,
) {
	let serial = handle.serial.clone();
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	ticker.tick().await;
	let mut missed = 0u32;

	loop {
		tokio::select! {
			_ = handle.connection.closed() => break,
			Some(event) = events.recv() => match event {
				Event::State { state } => handle.transition(state),
				other => debug!(target = "rxproxy.supervisor", %serial, ?other, "worker event"),
			},
			_ = ticker.tick() => {
				match handle.connection.request_unordered(Command::Heartbeat, interval).await {
					Ok(Reply::Heartbeat { state, open_handles }) => {
						missed = 0;
						*handle.last_heartbeat.lock() = Some(SystemTime::now());
						handle.open_handles.store(open_handles, Ordering::SeqCst);
						if state == WorkerState::Draining {
							handle.transition(state);
						}
					}
					Ok(other) => warn!(target = "rxproxy.supervisor", %serial, ?other, "unexpected heartbeat reply"),
					Err(err) if err.is_closed() => break,
					Err(err) => {
						missed += 1;
						warn!(target = "rxproxy.supervisor", %serial, missed, error = %err, "heartbeat missed");
						if missed > missed_limit {
							error!(target = "rxproxy.supervisor", %serial, missed, "worker unresponsive; killing");
							handle.mark_crashed(format!("{missed} heartbeats missed"));
							handle.control.kill();
							break;
						}
					}
				}
			}
		}
	}

	let exit = handle.control.wait_or_kill(grace).await;
	if exit.is_clean() && handle.crash_reason().is_none() {
		handle.transition(WorkerState::Terminated);
		info!(target = "rxproxy.supervisor", %serial, generation = handle.generation, "worker terminated");
	} else {
		handle.mark_crashed(exit.to_string());
		error!(
			target = "rxproxy.supervisor",
			%serial,
			generation = handle.generation,
			reason = handle.crash_reason().as_deref().unwrap_or("unknown"),
			"worker crashed"
		);
	}

	{
		let mut registry = registry.lock();
		if let Some(Slot::Live(current)) = registry.get(&serial) {
			if current.generation == handle.generation {
				registry.remove(&serial);
			}
		}
	}
	handle.dead.send_replace(true);
}

#[cfg(test)]
mod tests;
