//! Device discovery through a transient probe worker.
//!
//! A probe never claims a device, so it cannot see devices already claimed
//! by this manager's own workers; those are merged in from the live
//! workers' descriptors. Discovery failures never propagate: the result is
//! empty and the reason is kept in [`Enumerator::last_failure`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rxproxy_protocol::{Command, DeviceArgs, DeviceDescriptor, Reply};
use tracing::{debug, warn};

use crate::launcher::{Handshake, LaunchedWorker, WorkerLauncher};
use crate::native::sim;
use crate::worker::WorkerInvocation;

pub struct Enumerator {
	launcher: Arc<dyn WorkerLauncher>,
	timeout: Duration,
	grace: Duration,
	last_failure: Mutex<Option<String>>,
}

impl Enumerator {
	pub fn new(launcher: Arc<dyn WorkerLauncher>, timeout: Duration, grace: Duration) -> Self {
		Self {
			launcher,
			timeout,
			grace,
			last_failure: Mutex::new(None),
		}
	}

	/// Why the most recent enumeration came back empty, if it failed.
	pub fn last_failure(&self) -> Option<String> {
		self.last_failure.lock().clone()
	}

	/// Devices matching `filter`, deduplicated by serial. `live` are the
	/// descriptors of devices this manager already holds.
	///
	/// Without a `driver` in the filter the built-in `sim` driver is probed.
	pub async fn enumerate(&self, filter: &DeviceArgs, live: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
		let driver = filter.driver().unwrap_or(sim::DRIVER_NAME).to_string();
		let probed = match tokio::time::timeout(self.timeout, self.probe(&driver, filter)).await {
			Ok(Ok(devices)) => {
				*self.last_failure.lock() = None;
				devices
			}
			Ok(Err(reason)) => self.failed(&driver, reason),
			Err(_) => self.failed(
				&driver,
				format!("probe worker did not finish within {}ms", self.timeout.as_millis()),
			),
		};

		let mut seen = HashSet::new();
		let devices: Vec<DeviceDescriptor> = live
			.into_iter()
			.filter(|desc| desc.driver == driver && filter.matches(desc))
			.chain(probed)
			.filter(|desc| seen.insert(desc.serial.clone()))
			.collect();
		debug!(target = "rxproxy.manager", %driver, count = devices.len(), "enumerated");
		devices
	}

	fn failed(&self, driver: &str, reason: String) -> Vec<DeviceDescriptor> {
		warn!(target = "rxproxy.manager", driver, %reason, "enumeration unavailable; returning no devices");
		*self.last_failure.lock() = Some(reason);
		Vec::new()
	}

	async fn probe(&self, driver: &str, filter: &DeviceArgs) -> Result<Vec<DeviceDescriptor>, String> {
		let mut worker = self
			.launcher
			.launch(&WorkerInvocation::probe(driver))
			.await
			.map_err(|e| format!("probe worker subprocess failed to start: {e}"))?;

		let result = self.query(&mut worker, filter).await;

		if !worker.connection.is_closed() {
			let _ = worker.connection.request(Command::Shutdown, self.grace).await;
		}
		let exit = worker.control.wait_or_kill(self.grace).await;
		debug!(target = "rxproxy.manager", %exit, "probe worker exited");
		result
	}

	async fn query(&self, worker: &mut LaunchedWorker, filter: &DeviceArgs) -> Result<Vec<DeviceDescriptor>, String> {
		match worker.handshake(self.timeout, self.grace).await {
			Handshake::Ready { .. } => {}
			Handshake::Failed(error) => return Err(format!("probe worker failed: {}", error.message)),
			Handshake::Exited(exit) => return Err(format!("probe worker exited ({exit}) before ready")),
			Handshake::TimedOut => return Err("probe worker did not report ready".into()),
		}

		let command = Command::Enumerate { filter: filter.clone() };
		match worker.connection.request(command, self.timeout).await {
			Ok(Reply::Devices { devices }) => Ok(devices),
			Ok(other) => Err(format!("probe worker sent unexpected reply {other:?}")),
			Err(err) => Err(match err.remote() {
				Some(wire) => wire.message.clone(),
				None => format!("probe worker: {err}"),
			}),
		}
	}
}
