//! The worker side: one process (or task) owning one claimed device.
//!
//! Lifecycle: `starting` (claim the device) → `ready` (handshake sent) →
//! `active` (first `Open`) → `draining` (last `Close`, `Shutdown`, or host
//! EOF) → `terminated`. A native fault ends the worker immediately with
//! [`WorkerOutcome::Faulted`]; the binary turns that into an abort.
//!
//! Requests are read by a dispatcher that answers heartbeats itself and hands
//! everything else to a sequential executor, so a slow native call never
//! delays a heartbeat.

mod executor;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rxproxy_protocol::{
	Command, DeviceArgs, Event, Message, Reply, Request, Response, WireError, WireErrorKind, WorkerState,
};
use rxproxy_runtime::{Endpoint, EndpointSender};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::claim::{ClaimLock, ClaimLockError};
use crate::native::{DriverRegistry, NativeDriver, NativeError};
use executor::Executor;

pub const EXIT_DRAINED: i32 = 0;
pub const EXIT_STARTUP_FAILED: i32 = 1;
pub const EXIT_NOT_FOUND: i32 = 2;
pub const EXIT_BUSY: i32 = 3;
pub const EXIT_INVALID: i32 = 4;

/// How long a native stream read may wait for samples before replying with
/// a short (possibly empty) chunk.
pub const DEFAULT_READ_WAIT: Duration = Duration::from_millis(20);

/// Command-line shape of a worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
	pub driver: String,
	pub serial: Option<String>,
	pub hints: DeviceArgs,
	/// Run a transient enumeration instead of claiming a device.
	pub probe: bool,
	/// Claim lock to use instead of the driver's default.
	pub claim_lock: Option<ClaimLock>,
}

impl WorkerInvocation {
	pub fn device(driver: impl Into<String>, serial: impl Into<String>, hints: DeviceArgs) -> Self {
		Self {
			driver: driver.into(),
			serial: Some(serial.into()),
			hints,
			probe: false,
			claim_lock: None,
		}
	}

	pub fn probe(driver: impl Into<String>) -> Self {
		Self {
			driver: driver.into(),
			serial: None,
			hints: DeviceArgs::new(),
			probe: true,
			claim_lock: None,
		}
	}

	pub fn with_claim_lock(mut self, lock: ClaimLock) -> Self {
		self.claim_lock = Some(lock);
		self
	}

	/// Arguments for the `rxproxy` binary.
	pub fn to_args(&self) -> Vec<String> {
		let mut args = vec!["worker".to_string(), "--driver".to_string(), self.driver.clone()];
		if self.probe {
			args.push("--probe".into());
		}
		if let Some(serial) = &self.serial {
			args.push("--serial".into());
			args.push(serial.clone());
		}
		for (key, value) in self.hints.hints() {
			args.push("--hint".into());
			args.push(format!("{key}={value}"));
		}
		if let Some(lock) = &self.claim_lock {
			args.push("--claim-lock".into());
			args.push(lock.path().display().to_string());
			args.push("--claim-timeout-ms".into());
			args.push(lock.timeout().as_millis().to_string());
			args.push("--claim-cooldown-ms".into());
			args.push(lock.cooldown().as_millis().to_string());
		}
		args
	}
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
	Drained,
	DeviceNotFound(String),
	DeviceBusy(String),
	InvalidInvocation(String),
	StartupFailed(String),
	/// The process must abort.
	Faulted(String),
}

impl WorkerOutcome {
	/// `None` means abort rather than exit.
	pub fn exit_code(&self) -> Option<i32> {
		match self {
			WorkerOutcome::Drained => Some(EXIT_DRAINED),
			WorkerOutcome::StartupFailed(_) => Some(EXIT_STARTUP_FAILED),
			WorkerOutcome::DeviceNotFound(_) => Some(EXIT_NOT_FOUND),
			WorkerOutcome::DeviceBusy(_) => Some(EXIT_BUSY),
			WorkerOutcome::InvalidInvocation(_) => Some(EXIT_INVALID),
			WorkerOutcome::Faulted(_) => None,
		}
	}
}

/// State visible to both the dispatcher and the executor.
pub(crate) struct Shared {
	state: Mutex<WorkerState>,
	open_handles: AtomicU32,
}

impl Shared {
	fn new() -> Self {
		Self {
			state: Mutex::new(WorkerState::Starting),
			open_handles: AtomicU32::new(0),
		}
	}

	pub(crate) fn state(&self) -> WorkerState {
		*self.state.lock()
	}

	pub(crate) fn set_state(&self, state: WorkerState) {
		*self.state.lock() = state;
	}

	pub(crate) fn set_open_handles(&self, n: u32) {
		self.open_handles.store(n, Ordering::SeqCst);
	}

	fn heartbeat(&self) -> Reply {
		Reply::Heartbeat {
			state: self.state(),
			open_handles: self.open_handles.load(Ordering::SeqCst),
		}
	}
}

pub(crate) fn wire_error(err: &NativeError) -> WireError {
	match err {
		NativeError::Busy(msg) => WireError::new(WireErrorKind::DeviceBusy, msg.clone()),
		NativeError::NotFound(msg) => WireError::new(WireErrorKind::DeviceNotFound, msg.clone()),
		NativeError::DiscoveryUnavailable(msg) => WireError::new(WireErrorKind::DiscoveryUnavailable, msg.clone()),
		NativeError::Call { code, message } => WireError::native(*code, message.clone()),
		NativeError::Fault(msg) => WireError::new(WireErrorKind::Native, msg.clone()),
	}
}

fn respond(out: &EndpointSender, seq: u64, command: &Command, result: Result<Reply, WireError>) {
	if out.send(Response { seq, opcode: command.opcode(), result }).is_err() {
		debug!(target = "rxproxy.worker", seq, "host gone; response dropped");
	}
}

/// Runs a worker invocation over `endpoint` until it drains or fails.
pub async fn run(invocation: WorkerInvocation, drivers: &DriverRegistry, endpoint: Endpoint) -> WorkerOutcome {
	let Some(driver) = drivers(&invocation.driver) else {
		let msg = format!("worker has no driver named '{}'", invocation.driver);
		let error = WireError::new(WireErrorKind::UnknownDriver, msg.clone());
		return fail_startup(endpoint, error, WorkerOutcome::InvalidInvocation(msg)).await;
	};

	if invocation.probe {
		return probe(endpoint, driver).await;
	}

	let Some(serial) = invocation.serial else {
		let msg = "worker needs --serial unless --probe is given".to_string();
		let error = WireError::new(WireErrorKind::InvalidRequest, msg.clone());
		return fail_startup(endpoint, error, WorkerOutcome::InvalidInvocation(msg)).await;
	};

	let claim_lock = invocation
		.claim_lock
		.unwrap_or_else(|| ClaimLock::for_driver(&invocation.driver));
	serve(
		endpoint,
		WorkerOptions {
			driver,
			serial,
			hints: invocation.hints,
			read_wait: DEFAULT_READ_WAIT,
			claim_lock,
		},
	)
	.await
}

pub struct WorkerOptions {
	pub driver: Arc<dyn NativeDriver>,
	pub serial: String,
	pub hints: DeviceArgs,
	pub read_wait: Duration,
	/// Held around claiming and releasing the device.
	pub claim_lock: ClaimLock,
}

async fn fail_startup(endpoint: Endpoint, error: WireError, outcome: WorkerOutcome) -> WorkerOutcome {
	warn!(target = "rxproxy.worker", kind = ?error.kind, message = %error.message, "worker startup failed");
	let _ = endpoint.send(Event::Failed { error });
	let _ = endpoint.close().await;
	outcome
}

/// Claims the device, performs the handshake and serves commands.
pub async fn serve(mut endpoint: Endpoint, options: WorkerOptions) -> WorkerOutcome {
	let WorkerOptions {
		driver,
		serial,
		hints,
		read_wait,
		claim_lock,
	} = options;
	let shared = Arc::new(Shared::new());
	info!(target = "rxproxy.worker", %serial, driver = driver.name(), "worker starting");

	let claim = {
		let driver = Arc::clone(&driver);
		let serial = serial.clone();
		let lock = claim_lock.clone();
		tokio::task::spawn_blocking(move || lock.hold(|| driver.open(&serial, &hints))).await
	};
	let device = match claim {
		Ok(Ok(Ok(device))) => device,
		Ok(Err(err)) => {
			let msg = err.to_string();
			let (error, outcome) = match err {
				ClaimLockError::TimedOut { .. } => (
					WireError::new(WireErrorKind::DeviceBusy, msg.clone()),
					WorkerOutcome::DeviceBusy(msg),
				),
				ClaimLockError::Io { .. } => (
					WireError::new(WireErrorKind::StartupFailed, msg.clone()),
					WorkerOutcome::StartupFailed(msg),
				),
			};
			return fail_startup(endpoint, error, outcome).await;
		}
		Ok(Ok(Err(err))) => {
			let outcome = match &err {
				NativeError::NotFound(msg) => WorkerOutcome::DeviceNotFound(msg.clone()),
				NativeError::Busy(msg) => WorkerOutcome::DeviceBusy(msg.clone()),
				NativeError::Fault(msg) => {
					error!(target = "rxproxy.worker", %serial, %msg, "native fault while claiming device");
					return WorkerOutcome::Faulted(msg.clone());
				}
				other => WorkerOutcome::StartupFailed(other.to_string()),
			};
			return fail_startup(endpoint, wire_error(&err), outcome).await;
		}
		Err(join) => return WorkerOutcome::Faulted(format!("claim panicked: {join}")),
	};

	shared.set_state(WorkerState::Ready);
	if endpoint
		.send(Event::Ready {
			driver: driver.name().to_string(),
			serial: serial.clone(),
			pid: std::process::id(),
		})
		.is_err()
	{
		debug!(target = "rxproxy.worker", "host gone before handshake");
		return WorkerOutcome::Drained;
	}
	info!(target = "rxproxy.worker", %serial, "worker ready");

	let (tx, rx) = mpsc::unbounded_channel::<Request>();
	let executor = Executor::new(
		device,
		serial.clone(),
		Arc::clone(&shared),
		endpoint.sender(),
		read_wait,
		claim_lock,
	);
	let mut executor = tokio::spawn(executor.run(rx));
	let mut tx = Some(tx);

	let outcome = loop {
		tokio::select! {
			biased;
			finished = &mut executor => {
				break finished.unwrap_or_else(|e| WorkerOutcome::Faulted(format!("executor panicked: {e}")));
			}
			message = endpoint.receive(None), if tx.is_some() => match message {
				Ok(Message::Request(req)) => {
					if req.command == Command::Heartbeat {
						respond_now(&endpoint, &req, Ok(shared.heartbeat()));
						continue;
					}
					let Some(queue) = tx.as_ref() else { continue };
					if let Err(mpsc::error::SendError(req)) = queue.send(req) {
						let busy = WireError::new(WireErrorKind::Draining, "worker is draining");
						respond_now(&endpoint, &req, Err(busy));
					}
				}
				Ok(other) => debug!(target = "rxproxy.worker", ?other, "ignoring non-request message"),
				Err(err) => {
					if err.is_closed() {
						info!(target = "rxproxy.worker", %serial, "host closed the command pipe; draining");
					} else {
						warn!(target = "rxproxy.worker", %serial, error = %err, "command pipe failed; draining");
					}
					tx = None;
				}
			},
		}
	};

	drop(tx);
	if let Err(err) = endpoint.close().await {
		debug!(target = "rxproxy.worker", error = %err, "closing command pipe");
	}
	info!(target = "rxproxy.worker", %serial, ?outcome, "worker stopped");
	outcome
}

fn respond_now(endpoint: &Endpoint, req: &Request, result: Result<Reply, WireError>) {
	let response = Response {
		seq: req.seq,
		opcode: req.command.opcode(),
		result,
	};
	if endpoint.send(response).is_err() {
		debug!(target = "rxproxy.worker", seq = req.seq, "host gone; response dropped");
	}
}

/// Transient enumeration: answers `Enumerate` until shut down or EOF.
pub async fn probe(mut endpoint: Endpoint, driver: Arc<dyn NativeDriver>) -> WorkerOutcome {
	let ready = Event::Ready {
		driver: driver.name().to_string(),
		serial: String::new(),
		pid: std::process::id(),
	};
	if endpoint.send(ready).is_err() {
		return WorkerOutcome::Drained;
	}

	loop {
		let req = match endpoint.receive(None).await {
			Ok(Message::Request(req)) => req,
			Ok(_) => continue,
			Err(_) => break,
		};
		let out = endpoint.sender();
		match &req.command {
			Command::Enumerate { filter } => {
				let driver = Arc::clone(&driver);
				let filter = filter.clone();
				let result = match tokio::task::spawn_blocking(move || driver.enumerate(&filter)).await {
					Ok(Ok(devices)) => Ok(Reply::Devices { devices }),
					Ok(Err(err)) => {
						warn!(target = "rxproxy.worker", error = %err, "enumeration failed");
						Err(wire_error(&err))
					}
					Err(join) => Err(WireError::new(WireErrorKind::Native, format!("enumeration panicked: {join}"))),
				};
				respond(&out, req.seq, &req.command, result);
			}
			Command::Heartbeat => respond(
				&out,
				req.seq,
				&req.command,
				Ok(Reply::Heartbeat {
					state: WorkerState::Ready,
					open_handles: 0,
				}),
			),
			Command::Shutdown => {
				respond(&out, req.seq, &req.command, Ok(Reply::Ack));
				break;
			}
			other => respond(
				&out,
				req.seq,
				other,
				Err(WireError::new(WireErrorKind::InvalidRequest, "probe worker only enumerates")),
			),
		}
	}

	let _ = endpoint.close().await;
	WorkerOutcome::Drained
}

#[cfg(test)]
mod tests;
