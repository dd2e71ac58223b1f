use std::time::Instant;

use super::*;
use crate::native::{NativeDriver, SimDriver};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> ProxyConfig {
	ProxyConfig {
		command_timeout_ms: 2_000,
		heartbeat_interval_ms: 50,
		missed_heartbeats: 2,
		shutdown_grace_ms: 500,
		ring_capacity: 1 << 14,
		read_chunk_samples: 1_024,
		..ProxyConfig::default()
	}
}

/// In-process workers with one claim scope each, like separate processes.
fn manager() -> ProxyManager {
	let launcher = InProcessLauncher::new(Arc::new(|name: &str| {
		(name == "sim").then(|| Arc::new(SimDriver::new(["SIM0001", "SIM0002"], true)) as Arc<dyn NativeDriver>)
	}));
	ProxyManager::with_launcher(config(), Arc::new(launcher))
}

fn sim(serial: &str) -> DeviceArgs {
	DeviceArgs::for_driver("sim").with_serial(serial)
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
	let deadline = Instant::now() + WAIT;
	while !done() {
		assert!(Instant::now() < deadline, "timed out waiting for {what}");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

#[tokio::test]
async fn settings_come_back_as_applied() {
	let manager = manager();
	let dev = manager.open(&sim("SIM0001")).await.unwrap();

	assert_eq!(manager.set_sample_rate(&dev, 2.1e6).await.unwrap(), 2e6);
	assert_eq!(manager.sample_rate(&dev).await.unwrap(), 2e6);
	assert_eq!(manager.set_gain(&dev, 72.0).await.unwrap(), 59.0);
	assert_eq!(manager.set_frequency(&dev, 433.92e6).await.unwrap(), 433.92e6);
	assert!(manager.set_agc(&dev, true).await.unwrap());
	assert_eq!(manager.set_antenna(&dev, "Hi-Z").await.unwrap(), "Hi-Z");
	assert_eq!(manager.set_bandwidth(&dev, 1.5e6).await.unwrap(), 1_536_000.0);

	let err = manager.set_antenna(&dev, "Dish").await.unwrap_err();
	assert!(matches!(err, Error::NativeDriverError { code: -2, .. }), "{err}");
	assert!(!err.is_proxy_originated());

	manager.shutdown().await;
}

#[tokio::test]
async fn info_reports_the_device_without_worker_pid_in_process() {
	let manager = manager();
	let dev = manager.open(&sim("SIM0002")).await.unwrap();
	let info = manager.info(&dev).await.unwrap();
	assert_eq!(info.get("serial").map(String::as_str), Some("SIM0002"));
	assert!(!info.contains_key("worker_pid"));
	assert!(!info.contains_key("proxy"));
	manager.shutdown().await;
}

#[tokio::test]
async fn closing_one_device_leaves_the_other_running() {
	let manager = manager();
	let a = manager.open(&sim("SIM0001")).await.unwrap();
	let b = manager.open(&sim("SIM0002")).await.unwrap();
	assert_eq!(manager.status().len(), 2);

	manager.close(&a).await.unwrap();
	assert_eq!(manager.frequency(&b).await.unwrap(), 100e6);
	wait_until("the closed worker to be reaped", || manager.status().len() == 1).await;
	assert_eq!(manager.status()[0].serial, "SIM0002");

	assert!(matches!(manager.frequency(&a).await, Err(Error::InvalidHandle)));
	assert!(matches!(manager.close(&a).await, Err(Error::InvalidHandle)));
	manager.shutdown().await;
}

#[tokio::test]
async fn two_handles_share_a_worker_until_the_last_close() {
	let manager = manager();
	let first = manager.open(&sim("SIM0001")).await.unwrap();
	let second = manager.open(&sim("SIM0001")).await.unwrap();
	assert_eq!(manager.status().len(), 1);
	assert_eq!(manager.status()[0].open_handles, 2);

	manager.close(&first).await.unwrap();
	assert_eq!(manager.gain(&second).await.unwrap(), 40.0);
	manager.close(&second).await.unwrap();
	wait_until("the worker to drain", || manager.status().is_empty()).await;

	let again = manager.open(&sim("SIM0001")).await.unwrap();
	assert_eq!(manager.status()[0].generation, 2);
	manager.close(&again).await.unwrap();
	manager.shutdown().await;
}

#[tokio::test]
async fn stream_delivers_samples_until_stopped() {
	let manager = manager();
	let dev = manager.open(&sim("SIM0001")).await.unwrap();
	let stream = manager.start_stream(&dev, 0, StreamFormat::Cs16).await.unwrap();
	assert_eq!(stream.channel(), 0);

	let err = manager.start_stream(&dev, 0, StreamFormat::Cf32).await.unwrap_err();
	assert!(matches!(err, Error::StreamActive { channel: 0, .. }), "{err}");

	let mut out = Vec::new();
	let read = manager
		.read_stream(&stream, &mut out, 512, Some(Duration::from_secs(2)))
		.await
		.unwrap();
	assert!(read.count > 0 && read.count <= 512);
	assert_eq!(out.len(), read.count);
	assert!(out.iter().all(|s| (s.norm() - 0.5).abs() < 0.01));

	manager.stop_stream(&stream).await.unwrap();
	let err = manager.read_stream(&stream, &mut out, 512, None).await.unwrap_err();
	assert!(matches!(err, Error::StreamClosed));

	// the channel is free again
	let restarted = manager.start_stream(&dev, 0, StreamFormat::Cf32).await.unwrap();
	manager.close(&dev).await.unwrap();
	let err = manager.read_stream(&restarted, &mut out, 512, None).await.unwrap_err();
	assert!(matches!(err, Error::StreamClosed));
	manager.shutdown().await;
}

#[tokio::test]
async fn killed_worker_invalidates_only_its_handles() {
	let manager = manager();
	let doomed = manager.open(&sim("SIM0001")).await.unwrap();
	let survivor = manager.open(&sim("SIM0002")).await.unwrap();
	let stream = manager.start_stream(&doomed, 0, StreamFormat::Cf32).await.unwrap();

	let worker = manager.supervisor.get("SIM0001").unwrap();
	worker.control().kill();
	tokio::time::timeout(WAIT, worker.dead()).await.unwrap();

	let err = manager.frequency(&doomed).await.unwrap_err();
	assert!(matches!(err, Error::WorkerCrash { ref serial, .. } if serial == "SIM0001"), "{err}");

	let mut out = Vec::new();
	let deadline = Instant::now() + WAIT;
	let err = loop {
		match manager.read_stream(&stream, &mut out, 1_024, Some(Duration::from_millis(100))).await {
			Err(err) => break err,
			Ok(_) => assert!(Instant::now() < deadline, "stream never reported the crash"),
		}
	};
	assert!(matches!(err, Error::WorkerCrash { .. }), "{err}");

	assert_eq!(manager.frequency(&survivor).await.unwrap(), 100e6);
	manager.close(&doomed).await.unwrap();

	let reopened = manager.open(&sim("SIM0001")).await.unwrap();
	assert_eq!(manager.frequency(&reopened).await.unwrap(), 100e6);
	manager.shutdown().await;
}

#[tokio::test]
async fn respawned_worker_streams_without_closing_dead_handle() {
	let manager = manager();
	let doomed = manager.open(&sim("SIM0001")).await.unwrap();
	let old_stream = manager.start_stream(&doomed, 0, StreamFormat::Cf32).await.unwrap();

	let worker = manager.supervisor.get("SIM0001").unwrap();
	worker.control().kill();
	tokio::time::timeout(WAIT, worker.dead()).await.unwrap();

	let reopened = manager.open(&sim("SIM0001")).await.unwrap();
	let stream = manager.start_stream(&reopened, 0, StreamFormat::Cf32).await.unwrap();
	let mut out = Vec::new();
	let deadline = Instant::now() + WAIT;
	while out.is_empty() {
		assert!(Instant::now() < deadline, "respawned worker never streamed");
		manager.read_stream(&stream, &mut out, 1_024, Some(Duration::from_millis(100))).await.unwrap();
	}

	wait_until("dead handles dropped", || manager.tables.devices.lock().len() == 1).await;
	assert!(manager.tables.sessions.lock().values().all(|s| s.worker.generation() != worker.generation()));
	let err = manager.read_stream(&old_stream, &mut out, 16, Some(Duration::ZERO)).await.unwrap_err();
	assert!(matches!(err, Error::WorkerCrash { .. }), "{err}");
	let err = manager.gain(&doomed).await.unwrap_err();
	assert!(matches!(err, Error::WorkerCrash { .. }), "{err}");

	manager.stop_stream(&old_stream).await.unwrap();
	manager.close(&doomed).await.unwrap();
	assert_eq!(manager.close(&doomed).await, Err(Error::InvalidHandle));
	assert!(manager.tables.lost.lock().is_empty());
	manager.shutdown().await;
}

#[tokio::test]
async fn open_without_serial_needs_a_single_match() {
	let manager = manager();
	let err = manager.open(&DeviceArgs::for_driver("sim")).await.unwrap_err();
	assert!(matches!(err, Error::AmbiguousSerial { count: 2, .. }), "{err}");

	let dev = manager
		.open(&DeviceArgs::for_driver("sim").with("label", "Sim RX SIM0002"))
		.await
		.unwrap();
	assert_eq!(dev.serial(), "SIM0002");

	let err = manager.open(&DeviceArgs::new()).await.unwrap_err();
	assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
	manager.shutdown().await;
}

#[tokio::test]
async fn enumerate_includes_devices_this_manager_holds() {
	let manager = manager();
	let _dev = manager.open(&sim("SIM0001")).await.unwrap();
	let devices = manager.enumerate(&DeviceArgs::for_driver("sim")).await;
	let serials: Vec<_> = devices.iter().map(|d| d.serial.as_str()).collect();
	assert_eq!(serials, ["SIM0001", "SIM0002"]);
	assert_eq!(manager.last_enumerate_failure(), None);
	manager.shutdown().await;
}

#[tokio::test]
async fn unknown_serial_is_not_found() {
	let manager = manager();
	let err = manager.open(&sim("TESTSERIAL")).await.unwrap_err();
	assert!(matches!(err, Error::DeviceNotFound { .. }), "{err}");
	assert!(err.is_proxy_originated());
	assert!(manager.status().is_empty());
	manager.shutdown().await;
}
