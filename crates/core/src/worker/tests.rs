use std::sync::Arc;
use std::time::{Duration, Instant};

use rxproxy_protocol::{
	Command, DeviceArgs, Event, Message, ParamValue, Reply, Request, StreamFormat, WireError, WireErrorKind,
};
use rxproxy_runtime::Endpoint;
use tokio::task::JoinHandle;

use super::*;
use crate::claim::ClaimLock;
use crate::native::{DriverRegistry, NativeDriver, SimDriver};

const WAIT: Duration = Duration::from_secs(5);

fn pipe_pair() -> (Endpoint, Endpoint) {
	let (host, worker) = tokio::io::duplex(1 << 20);
	let (host_r, host_w) = tokio::io::split(host);
	let (worker_r, worker_w) = tokio::io::split(worker);
	(Endpoint::connect(host_w, host_r), Endpoint::connect(worker_w, worker_r))
}

fn registry(driver: Arc<SimDriver>) -> DriverRegistry {
	Arc::new(move |name: &str| (name == "sim").then(|| Arc::clone(&driver) as Arc<dyn NativeDriver>))
}

fn sim() -> Arc<SimDriver> {
	Arc::new(SimDriver::new(["SIM0001", "SIM0002"], true))
}

fn spawn_worker(driver: Arc<SimDriver>, invocation: WorkerInvocation) -> (Endpoint, JoinHandle<WorkerOutcome>) {
	let (host, worker) = pipe_pair();
	let drivers = registry(driver);
	let task = tokio::spawn(async move { run(invocation, &drivers, worker).await });
	(host, task)
}

async fn next_event(host: &mut Endpoint) -> Event {
	match host.receive(Some(WAIT)).await.expect("worker message") {
		Message::Event(event) => event,
		other => panic!("expected an event, got {other:?}"),
	}
}

async fn call(host: &mut Endpoint, seq: u64, command: Command) -> Result<Reply, WireError> {
	host.send(Request { seq, command }).expect("send request");
	loop {
		match host.receive(Some(WAIT)).await.expect("worker response") {
			Message::Response(resp) if resp.seq == seq => return resp.result,
			Message::Event(_) => continue,
			other => panic!("unexpected message {other:?}"),
		}
	}
}

async fn open_device(host: &mut Endpoint, seq: u64, serial: &str) -> u32 {
	let reply = call(
		host,
		seq,
		Command::Open {
			serial: serial.into(),
			args: DeviceArgs::for_driver("sim").with_serial(serial),
		},
	)
	.await
	.expect("open");
	match reply {
		Reply::Opened { device_id } => device_id,
		other => panic!("expected Opened, got {other:?}"),
	}
}

async fn outcome(task: JoinHandle<WorkerOutcome>) -> WorkerOutcome {
	tokio::time::timeout(WAIT, task).await.expect("worker stops").expect("worker task")
}

#[test]
fn invocation_args_round_out_the_command_line() {
	let hints = DeviceArgs::for_driver("sim").with_serial("SIM0001").with("sim_channels", "2");
	let args = WorkerInvocation::device("sim", "SIM0001", hints).to_args();
	assert_eq!(
		args,
		["worker", "--driver", "sim", "--serial", "SIM0001", "--hint", "sim_channels=2"]
	);
	assert_eq!(WorkerInvocation::probe("sim").to_args(), ["worker", "--driver", "sim", "--probe"]);

	let lock = ClaimLock::new("/tmp/sim.lock")
		.with_timeout(Duration::from_millis(750))
		.with_cooldown(Duration::from_secs(2));
	let args = WorkerInvocation::device("sim", "SIM0001", DeviceArgs::new())
		.with_claim_lock(lock)
		.to_args();
	assert_eq!(
		args[5..],
		["--claim-lock", "/tmp/sim.lock", "--claim-timeout-ms", "750", "--claim-cooldown-ms", "2000"]
	);
}

#[test]
fn only_faults_abort() {
	assert_eq!(WorkerOutcome::Drained.exit_code(), Some(EXIT_DRAINED));
	assert_eq!(WorkerOutcome::DeviceBusy(String::new()).exit_code(), Some(EXIT_BUSY));
	assert_eq!(WorkerOutcome::Faulted(String::new()).exit_code(), None);
}

#[tokio::test]
async fn handshake_then_last_close_drains() {
	let driver = sim();
	let invocation = WorkerInvocation::device("sim", "SIM0001", DeviceArgs::new());
	let (mut host, task) = spawn_worker(Arc::clone(&driver), invocation);

	match next_event(&mut host).await {
		Event::Ready { driver, serial, pid } => {
			assert_eq!(driver, "sim");
			assert_eq!(serial, "SIM0001");
			assert_eq!(pid, std::process::id());
		}
		other => panic!("expected Ready, got {other:?}"),
	}
	assert_eq!(driver.claimed().as_deref(), Some("SIM0001"));

	let first = open_device(&mut host, 1, "SIM0001").await;
	let second = open_device(&mut host, 2, "SIM0001").await;
	assert_ne!(first, second);

	let reply = call(&mut host, 3, Command::Close { device_id: first }).await;
	assert_eq!(reply, Ok(Reply::Closed { remaining: 1 }));
	let reply = call(&mut host, 4, Command::Close { device_id: second }).await;
	assert_eq!(reply, Ok(Reply::Closed { remaining: 0 }));

	assert_eq!(outcome(task).await, WorkerOutcome::Drained);
	assert_eq!(driver.claimed(), None);
}

#[tokio::test]
async fn heartbeat_overtakes_slow_native_call() {
	let hints = DeviceArgs::new().with("sim_delay_ms", "400");
	let invocation = WorkerInvocation::device("sim", "SIM0001", hints);
	let (mut host, task) = spawn_worker(sim(), invocation);
	next_event(&mut host).await;
	let device_id = open_device(&mut host, 1, "SIM0001").await;

	let started = Instant::now();
	host.send(Request {
		seq: 2,
		command: Command::SetParam {
			device_id,
			key: "gain".into(),
			value: ParamValue::Float(20.0),
		},
	})
	.expect("send set");
	let reply = call(&mut host, 3, Command::Heartbeat).await.expect("heartbeat");
	assert!(started.elapsed() < Duration::from_millis(300), "heartbeat waited for the native call");
	match reply {
		Reply::Heartbeat { state, open_handles } => {
			assert_eq!(state, WorkerState::Active);
			assert_eq!(open_handles, 1);
		}
		other => panic!("expected Heartbeat, got {other:?}"),
	}

	match host.receive(Some(WAIT)).await.expect("set reply") {
		Message::Response(resp) => {
			assert_eq!(resp.seq, 2);
			assert_eq!(resp.result, Ok(Reply::Param { value: ParamValue::Float(20.0) }));
		}
		other => panic!("unexpected {other:?}"),
	}

	let _ = call(&mut host, 4, Command::Shutdown).await;
	assert_eq!(outcome(task).await, WorkerOutcome::Drained);
}

#[tokio::test]
async fn unknown_serial_reports_failure_and_exits() {
	let invocation = WorkerInvocation::device("sim", "NOPE", DeviceArgs::new());
	let (mut host, task) = spawn_worker(sim(), invocation);

	match next_event(&mut host).await {
		Event::Failed { error } => assert_eq!(error.kind, WireErrorKind::DeviceNotFound),
		other => panic!("expected Failed, got {other:?}"),
	}
	assert!(matches!(outcome(task).await, WorkerOutcome::DeviceNotFound(_)));
}

#[tokio::test]
async fn second_claim_in_one_scope_is_busy() {
	let driver = sim();
	let _held = driver.open("SIM0002", &DeviceArgs::new()).expect("direct claim");

	let invocation = WorkerInvocation::device("sim", "SIM0001", DeviceArgs::new());
	let (mut host, task) = spawn_worker(driver, invocation);
	match next_event(&mut host).await {
		Event::Failed { error } => assert_eq!(error.kind, WireErrorKind::DeviceBusy),
		other => panic!("expected Failed, got {other:?}"),
	}
	assert!(matches!(outcome(task).await, WorkerOutcome::DeviceBusy(_)));
}

#[tokio::test]
async fn unknown_driver_is_an_invalid_invocation() {
	let invocation = WorkerInvocation::device("airspy", "X", DeviceArgs::new());
	let (mut host, task) = spawn_worker(sim(), invocation);
	match next_event(&mut host).await {
		Event::Failed { error } => assert_eq!(error.kind, WireErrorKind::UnknownDriver),
		other => panic!("expected Failed, got {other:?}"),
	}
	assert!(matches!(outcome(task).await, WorkerOutcome::InvalidInvocation(_)));
}

#[tokio::test]
async fn stream_chunks_carry_increasing_sequence() {
	let invocation = WorkerInvocation::device("sim", "SIM0001", DeviceArgs::new());
	let (mut host, task) = spawn_worker(sim(), invocation);
	next_event(&mut host).await;
	let device_id = open_device(&mut host, 1, "SIM0001").await;

	let start = Command::StartStream {
		device_id,
		channel: 0,
		format: StreamFormat::Cf32,
	};
	let session_id = match call(&mut host, 2, start.clone()).await {
		Ok(Reply::StreamStarted { session_id }) => session_id,
		other => panic!("expected StreamStarted, got {other:?}"),
	};
	let again = call(&mut host, 3, start).await.expect_err("channel busy");
	assert_eq!(again.kind, WireErrorKind::StreamActive);
	let beyond = Command::StartStream {
		device_id,
		channel: 9,
		format: StreamFormat::Cf32,
	};
	let beyond = call(&mut host, 30, beyond).await.expect_err("no such channel");
	assert_eq!(beyond.kind, WireErrorKind::InvalidRequest);

	tokio::time::sleep(Duration::from_millis(20)).await;
	let mut delivered = 0u64;
	for (seq, expected) in [(4u64, 0u64), (5, 1)] {
		let read = Command::ReadStream {
			session_id,
			max_samples: 1024,
		};
		match call(&mut host, seq, read).await {
			Ok(Reply::StreamChunk(chunk)) => {
				assert_eq!(chunk.session_id, session_id);
				assert_eq!(chunk.sequence, expected);
				assert_eq!(chunk.offset, delivered);
				delivered += chunk.sample_count() as u64;
				assert!(!chunk.end);
				assert_eq!(chunk.data.len() % 8, 0);
				assert!(chunk.sample_count() <= 1024);
			}
			other => panic!("expected a chunk, got {other:?}"),
		}
	}

	assert_eq!(call(&mut host, 6, Command::StopStream { session_id }).await, Ok(Reply::Ack));
	let gone = call(&mut host, 7, Command::StopStream { session_id }).await.expect_err("stopped");
	assert_eq!(gone.kind, WireErrorKind::UnknownSession);

	let _ = call(&mut host, 8, Command::Close { device_id }).await;
	assert_eq!(outcome(task).await, WorkerOutcome::Drained);
}

#[tokio::test]
async fn host_eof_drains_and_releases() {
	let driver = sim();
	let invocation = WorkerInvocation::device("sim", "SIM0001", DeviceArgs::new());
	let (mut host, task) = spawn_worker(Arc::clone(&driver), invocation);
	next_event(&mut host).await;
	let device_id = open_device(&mut host, 1, "SIM0001").await;
	let stale = call(&mut host, 2, Command::GetInfo { device_id: device_id + 1 }).await.expect_err("never opened");
	assert_eq!(stale.kind, WireErrorKind::InvalidHandle);

	host.close().await.expect("close host side");
	assert_eq!(outcome(task).await, WorkerOutcome::Drained);
	assert_eq!(driver.claimed(), None);
}

/// Holds the lock at `path` on a plain thread until the returned sender
/// fires or is dropped.
fn hold_claim(path: std::path::PathBuf) -> (std::sync::mpsc::Sender<()>, std::thread::JoinHandle<()>) {
	let (held_tx, held_rx) = std::sync::mpsc::channel();
	let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
	let owner = std::thread::spawn(move || {
		ClaimLock::new(path)
			.hold(|| {
				held_tx.send(()).unwrap();
				let _ = release_rx.recv_timeout(WAIT);
			})
			.unwrap()
	});
	held_rx.recv().unwrap();
	(release_tx, owner)
}

#[tokio::test]
async fn held_claim_lock_reports_busy() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("claim.lock");
	let (release, owner) = hold_claim(path.clone());

	let lock = ClaimLock::new(&path).with_timeout(Duration::from_millis(50));
	let driver = sim();
	let invocation = WorkerInvocation::device("sim", "SIM0001", DeviceArgs::new()).with_claim_lock(lock);
	let (mut host, task) = spawn_worker(Arc::clone(&driver), invocation);
	match next_event(&mut host).await {
		Event::Failed { error } => {
			assert_eq!(error.kind, WireErrorKind::DeviceBusy);
			assert!(error.message.contains("claim lock"), "{}", error.message);
		}
		other => panic!("expected Failed, got {other:?}"),
	}
	assert!(matches!(outcome(task).await, WorkerOutcome::DeviceBusy(_)));
	assert_eq!(driver.claimed(), None);

	release.send(()).unwrap();
	owner.join().unwrap();
}

#[tokio::test]
async fn release_waits_for_the_claim_lock() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("claim.lock");
	let driver = sim();
	let invocation =
		WorkerInvocation::device("sim", "SIM0001", DeviceArgs::new()).with_claim_lock(ClaimLock::new(&path));
	let (mut host, task) = spawn_worker(Arc::clone(&driver), invocation);
	next_event(&mut host).await;
	open_device(&mut host, 1, "SIM0001").await;

	let (release, owner) = hold_claim(path);
	host.close().await.expect("close host side");
	tokio::time::sleep(Duration::from_millis(150)).await;
	assert_eq!(driver.claimed().as_deref(), Some("SIM0001"), "released without the lock");

	release.send(()).unwrap();
	assert_eq!(outcome(task).await, WorkerOutcome::Drained);
	assert_eq!(driver.claimed(), None);
	owner.join().unwrap();
}

#[tokio::test]
async fn native_fault_ends_worker_without_reply() {
	let hints = DeviceArgs::new().with("sim_fault", "set");
	let invocation = WorkerInvocation::device("sim", "SIM0001", hints);
	let (mut host, task) = spawn_worker(sim(), invocation);
	next_event(&mut host).await;
	let device_id = open_device(&mut host, 1, "SIM0001").await;

	host.send(Request {
		seq: 2,
		command: Command::SetParam {
			device_id,
			key: "frequency".into(),
			value: ParamValue::Float(1e8),
		},
	})
	.expect("send set");
	assert!(matches!(outcome(task).await, WorkerOutcome::Faulted(_)));
	let err = host.receive(Some(WAIT)).await.expect_err("no reply after a fault");
	assert!(err.is_closed());
}

#[tokio::test]
async fn probe_lists_devices_then_shuts_down() {
	let (mut host, task) = spawn_worker(sim(), WorkerInvocation::probe("sim"));
	match next_event(&mut host).await {
		Event::Ready { serial, .. } => assert!(serial.is_empty()),
		other => panic!("expected Ready, got {other:?}"),
	}

	let filter = DeviceArgs::for_driver("sim");
	match call(&mut host, 1, Command::Enumerate { filter }).await {
		Ok(Reply::Devices { devices }) => {
			let serials: Vec<_> = devices.iter().map(|d| d.serial.as_str()).collect();
			assert_eq!(serials, ["SIM0001", "SIM0002"]);
		}
		other => panic!("expected Devices, got {other:?}"),
	}
	let refused = call(&mut host, 2, Command::GetInfo { device_id: 1 }).await.expect_err("probe only enumerates");
	assert_eq!(refused.kind, WireErrorKind::InvalidRequest);

	assert_eq!(call(&mut host, 3, Command::Shutdown).await, Ok(Reply::Ack));
	assert_eq!(outcome(task).await, WorkerOutcome::Drained);
}

#[tokio::test]
async fn probe_reports_discovery_outage() {
	let driver = Arc::new(SimDriver::new(["SIM0001"], false));
	let (mut host, task) = spawn_worker(driver, WorkerInvocation::probe("sim"));
	next_event(&mut host).await;

	let err = call(
		&mut host,
		1,
		Command::Enumerate {
			filter: DeviceArgs::new(),
		},
	)
	.await
	.expect_err("discovery down");
	assert_eq!(err.kind, WireErrorKind::DiscoveryUnavailable);

	host.close().await.expect("close host side");
	assert_eq!(outcome(task).await, WorkerOutcome::Drained);
}
