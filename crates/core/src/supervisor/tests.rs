use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rxproxy_protocol::{Command, DeviceArgs, Event, Reply, WorkerState};
use rxproxy_runtime::{Endpoint, Result as RuntimeResult, WorkerExit};

use super::*;
use crate::launcher::{InProcessLauncher, LaunchedWorker, WorkerLauncher, spawn_task_worker};
use crate::native::{NativeDriver, SimDriver};
use crate::worker::WorkerInvocation;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> ProxyConfig {
	ProxyConfig {
		handshake_timeout_ms: 2_000,
		command_timeout_ms: 2_000,
		heartbeat_interval_ms: 50,
		missed_heartbeats: 2,
		shutdown_grace_ms: 500,
		..ProxyConfig::default()
	}
}

/// Every worker gets its own claim scope, as separate processes would.
fn isolated_sims() -> Arc<dyn WorkerLauncher> {
	Arc::new(InProcessLauncher::new(Arc::new(|name: &str| {
		(name == "sim").then(|| Arc::new(SimDriver::new(["SIM0001", "SIM0002"], true)) as Arc<dyn NativeDriver>)
	})))
}

struct Scripted<F>(F);

#[async_trait]
impl<F, Fut> WorkerLauncher for Scripted<F>
where
	F: Fn(Endpoint) -> Fut + Send + Sync,
	Fut: Future<Output = WorkerExit> + Send + 'static,
{
	async fn launch(&self, _invocation: &WorkerInvocation) -> RuntimeResult<LaunchedWorker> {
		spawn_task_worker(|endpoint| (self.0)(endpoint))
	}

	fn is_subprocess(&self) -> bool {
		false
	}
}

async fn open(handle: &WorkerHandle) -> u32 {
	let reply = handle
		.call(Command::Open {
			serial: handle.serial().to_string(),
			args: DeviceArgs::new(),
		})
		.await
		.unwrap();
	handle.note_opened();
	match reply {
		Reply::Opened { device_id } => device_id,
		other => panic!("expected Opened, got {other:?}"),
	}
}

#[tokio::test]
async fn concurrent_acquires_share_one_worker() {
	let supervisor = Supervisor::new(isolated_sims(), config());
	let none = DeviceArgs::new();
	let (a, b) = tokio::join!(
		supervisor.acquire("sim", "SIM0001", &none),
		supervisor.acquire("sim", "SIM0001", &none)
	);
	let (a, b) = (a.unwrap(), b.unwrap());
	assert!(Arc::ptr_eq(&a, &b));
	assert_eq!(supervisor.records().len(), 1);
	supervisor.shutdown().await;
}

#[tokio::test]
async fn two_serials_get_two_workers() {
	let supervisor = Supervisor::new(isolated_sims(), config());
	let none = DeviceArgs::new();
	let a = supervisor.acquire("sim", "SIM0001", &none).await.unwrap();
	let b = supervisor.acquire("sim", "SIM0002", &none).await.unwrap();
	assert_ne!(a.generation(), b.generation());

	let records = supervisor.records();
	let serials: Vec<_> = records.iter().map(|r| r.serial.as_str()).collect();
	assert_eq!(serials, ["SIM0001", "SIM0002"]);
	assert!(records.iter().all(|r| r.state == WorkerState::Ready && r.endpoint == "in-process"));

	supervisor.shutdown().await;
	assert!(a.is_dead() && b.is_dead());
	assert!(supervisor.records().is_empty());
}

#[tokio::test]
async fn unknown_serial_fails_with_a_proxy_error() {
	let supervisor = Supervisor::new(isolated_sims(), config());
	let err = supervisor.acquire("sim", "TESTSERIAL", &DeviceArgs::new()).await.unwrap_err();
	assert!(matches!(err, Error::DeviceNotFound { ref serial, .. } if serial == "TESTSERIAL"));
	assert!(err.to_string().contains("proxy"));
	assert!(supervisor.records().is_empty());
}

#[tokio::test]
async fn last_close_terminates_and_next_acquire_respawns() {
	let supervisor = Supervisor::new(isolated_sims(), config());
	let worker = supervisor.acquire("sim", "SIM0001", &DeviceArgs::new()).await.unwrap();
	let device_id = open(&worker).await;
	assert_eq!(worker.state(), WorkerState::Active);

	let reply = worker.call(Command::Close { device_id }).await.unwrap();
	assert_eq!(reply, Reply::Closed { remaining: 0 });
	worker.note_closed(0);
	assert!(!worker.accepts_work());

	let again = supervisor.acquire("sim", "SIM0001", &DeviceArgs::new()).await.unwrap();
	assert!(worker.is_dead());
	assert_eq!(worker.state(), WorkerState::Terminated);
	assert!(again.generation() > worker.generation());
	supervisor.shutdown().await;
}

#[tokio::test]
async fn killed_worker_is_classified_crashed() {
	let supervisor = Supervisor::new(isolated_sims(), config());
	let worker = supervisor.acquire("sim", "SIM0001", &DeviceArgs::new()).await.unwrap();
	let device_id = open(&worker).await;

	worker.control.kill();
	tokio::time::timeout(WAIT, worker.dead()).await.unwrap();
	assert_eq!(worker.state(), WorkerState::Crashed);
	assert!(supervisor.get("SIM0001").is_none());

	let err = worker.call(Command::GetInfo { device_id }).await.unwrap_err();
	assert!(matches!(err, Error::WorkerCrash { .. }), "{err}");
}

#[tokio::test]
async fn silent_worker_times_out_the_handshake() {
	let launcher = Scripted(|mut endpoint: Endpoint| async move {
		while endpoint.receive(None).await.is_ok() {}
		WorkerExit::Clean
	});
	let config = ProxyConfig {
		handshake_timeout_ms: 100,
		..config()
	};
	let supervisor = Supervisor::new(Arc::new(launcher), config);

	let started = Instant::now();
	let err = supervisor.acquire("sim", "SLOW", &DeviceArgs::new()).await.unwrap_err();
	assert_eq!(
		err,
		Error::HandshakeTimeout {
			serial: "SLOW".into(),
			timeout_ms: 100
		}
	);
	assert!(started.elapsed() < WAIT);
	assert!(supervisor.records().is_empty());
}

#[tokio::test]
async fn unresponsive_worker_releases_blocked_callers() {
	let launcher = Scripted(|mut endpoint: Endpoint| async move {
		let _ = endpoint.send(Event::Ready {
			driver: "sim".into(),
			serial: "MUTE".into(),
			pid: 1,
		});
		while endpoint.receive(None).await.is_ok() {}
		WorkerExit::Clean
	});
	let supervisor = Supervisor::new(Arc::new(launcher), config());
	let worker = supervisor.acquire("sim", "MUTE", &DeviceArgs::new()).await.unwrap();

	let started = Instant::now();
	let err = worker.call(Command::GetInfo { device_id: 1 }).await.unwrap_err();
	assert!(matches!(err, Error::WorkerCrash { ref reason, .. } if reason.contains("heartbeats")), "{err}");
	assert!(started.elapsed() < Duration::from_secs(2));
	assert_eq!(worker.state(), WorkerState::Crashed);
}

#[tokio::test]
async fn shutdown_refuses_new_workers() {
	let supervisor = Supervisor::new(isolated_sims(), config());
	supervisor.acquire("sim", "SIM0001", &DeviceArgs::new()).await.unwrap();
	supervisor.shutdown().await;

	let err = supervisor.acquire("sim", "SIM0002", &DeviceArgs::new()).await.unwrap_err();
	assert!(matches!(err, Error::SpawnFailure { .. }));
}
