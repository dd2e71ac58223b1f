//! The front door: device handles, settings and streams routed to workers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use num_complex::Complex32;
use parking_lot::Mutex;
use rxproxy_protocol::{Command, DeviceArgs, DeviceDescriptor, ParamValue, Reply, StreamFormat};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::enumerate::Enumerator;
use crate::error::{Error, Result};
use crate::launcher::{InProcessLauncher, SubprocessLauncher, WorkerLauncher};
use crate::native::{builtin_drivers, keys};
use crate::stream::{SampleRing, StreamHandle, StreamRead, pump};
use crate::supervisor::{Supervisor, WorkerHandle, WorkerRecord};

/// An open device. Only meaningful to the manager that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
	id: u64,
	serial: String,
	/// Generation of the worker the handle is bound to.
	generation: u64,
	native_id: u32,
}

impl DeviceHandle {
	pub fn serial(&self) -> &str {
		&self.serial
	}
}

struct OpenDevice {
	worker: Arc<WorkerHandle>,
	native_id: u32,
}

struct Session {
	device: u64,
	serial: String,
	channel: u32,
	worker: Arc<WorkerHandle>,
	session_id: u32,
	ring: Arc<SampleRing>,
	pump: JoinHandle<()>,
}

/// Handle and session tables, shared with the tasks that watch for worker
/// death.
#[derive(Default)]
struct Tables {
	devices: Mutex<HashMap<u64, OpenDevice>>,
	sessions: Mutex<HashMap<u64, Session>>,
	/// Stream id owning each (serial, channel), while starting or running.
	channels: Mutex<HashMap<(String, u32), u64>>,
	/// Handles and streams of dead workers: owning device id and the error
	/// they report until closed.
	lost: Mutex<HashMap<u64, (u64, Error)>>,
	/// Worker generations with a watcher attached.
	watched: Mutex<HashSet<u64>>,
}

impl Tables {
	/// Drops everything bound to `worker`, leaving error tombstones behind.
	fn forget_worker(&self, worker: &WorkerHandle) {
		let error = match worker.crash_reason() {
			Some(reason) => Error::WorkerCrash {
				serial: worker.serial().to_string(),
				reason,
			},
			None => Error::TransportClosed {
				serial: worker.serial().to_string(),
			},
		};
		let generation = worker.generation();

		let devices: Vec<u64> = {
			let mut devices = self.devices.lock();
			let ids: Vec<u64> = devices
				.iter()
				.filter(|(_, d)| d.worker.generation() == generation)
				.map(|(id, _)| *id)
				.collect();
			for id in &ids {
				devices.remove(id);
			}
			ids
		};
		let sessions: Vec<(u64, Session)> = {
			let mut sessions = self.sessions.lock();
			let ids: Vec<u64> = sessions
				.iter()
				.filter(|(_, s)| s.worker.generation() == generation)
				.map(|(id, _)| *id)
				.collect();
			ids.into_iter()
				.filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
				.collect()
		};
		if devices.is_empty() && sessions.is_empty() {
			return;
		}

		let mut lost = self.lost.lock();
		for id in &devices {
			lost.insert(*id, (*id, error.clone()));
		}
		for (id, session) in sessions {
			self.release_channel(&session, id);
			// readers still blocked see the first failure the ring recorded
			session.ring.fail(error.clone());
			session.pump.abort();
			lost.insert(id, (session.device, error.clone()));
		}
		info!(
			target = "rxproxy.manager",
			serial = worker.serial(),
			generation,
			handles = devices.len(),
			"dropped handles of dead worker"
		);
	}

	fn release_channel(&self, session: &Session, id: u64) {
		let mut channels = self.channels.lock();
		let key = (session.serial.clone(), session.channel);
		if channels.get(&key) == Some(&id) {
			channels.remove(&key);
		}
	}

	/// Removes the tombstones of a closed device and its streams.
	fn bury(&self, device: u64) -> bool {
		let mut lost = self.lost.lock();
		let before = lost.len();
		lost.retain(|_, (owner, _)| *owner != device);
		lost.len() != before
	}
}

pub struct ProxyManager {
	config: ProxyConfig,
	subprocess: bool,
	supervisor: Supervisor,
	enumerator: Enumerator,
	tables: Arc<Tables>,
	next_id: AtomicU64,
}

impl ProxyManager {
	/// Subprocess workers when `config.proxy_mode` is set, otherwise
	/// in-process workers using the built-in drivers.
	pub fn new(config: ProxyConfig) -> Self {
		let launcher: Arc<dyn WorkerLauncher> = if config.proxy_mode {
			Arc::new(SubprocessLauncher::new(&config))
		} else {
			Arc::new(InProcessLauncher::new(builtin_drivers()))
		};
		Self::with_launcher(config, launcher)
	}

	pub fn with_launcher(config: ProxyConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
		info!(
			target = "rxproxy.manager",
			subprocess = launcher.is_subprocess(),
			"proxy manager created"
		);
		Self {
			subprocess: launcher.is_subprocess(),
			supervisor: Supervisor::new(Arc::clone(&launcher), config.clone()),
			enumerator: Enumerator::new(launcher, config.enumerate_timeout(), config.shutdown_grace()),
			config,
			tables: Arc::new(Tables::default()),
			next_id: AtomicU64::new(1),
		}
	}

	pub fn config(&self) -> &ProxyConfig {
		&self.config
	}

	pub fn is_subprocess(&self) -> bool {
		self.subprocess
	}

	/// Devices matching `filter`. Never fails; see [`last_enumerate_failure`](Self::last_enumerate_failure).
	pub async fn enumerate(&self, filter: &DeviceArgs) -> Vec<DeviceDescriptor> {
		let live = self
			.supervisor
			.live()
			.iter()
			.filter_map(|worker| worker.descriptor())
			.collect();
		self.enumerator.enumerate(filter, live).await
	}

	pub fn last_enumerate_failure(&self) -> Option<String> {
		self.enumerator.last_failure()
	}

	/// Opens the device described by `args`.
	///
	/// Without a `serial` the device is picked by enumeration, which must find
	/// exactly one device of the driver.
	pub async fn open(&self, args: &DeviceArgs) -> Result<DeviceHandle> {
		let driver = args
			.driver()
			.ok_or_else(|| Error::InvalidArgument("device arguments need driver=<name>".into()))?
			.to_string();
		let serial = match args.serial() {
			Some(serial) => serial.to_string(),
			None => self.resolve_serial(&driver, args).await?,
		};
		let hints: DeviceArgs = args.hints().map(|(k, v)| (k.to_string(), v.to_string())).collect();

		loop {
			let worker = self.supervisor.acquire(&driver, &serial, &hints).await?;
			let turn = worker.lock_ops().await;
			if !worker.accepts_work() {
				drop(turn);
				worker.dead().await;
				continue;
			}

			let reply = worker
				.call(Command::Open {
					serial: serial.clone(),
					args: args.clone(),
				})
				.await?;
			let Reply::Opened { device_id } = reply else {
				return Err(unexpected("Open", &reply));
			};
			worker.note_opened();
			drop(turn);

			if worker.descriptor().is_none() {
				self.learn_descriptor(&worker, device_id).await;
			}

			let id = self.next_id.fetch_add(1, Ordering::SeqCst);
			self.tables.devices.lock().insert(
				id,
				OpenDevice {
					worker: Arc::clone(&worker),
					native_id: device_id,
				},
			);
			self.watch(&worker);
			info!(target = "rxproxy.manager", %serial, handle = id, generation = worker.generation(), "device opened");
			return Ok(DeviceHandle {
				id,
				serial,
				generation: worker.generation(),
				native_id: device_id,
			});
		}
	}

	async fn resolve_serial(&self, driver: &str, args: &DeviceArgs) -> Result<String> {
		let devices = self.enumerate(args).await;
		match devices.as_slice() {
			[only] => Ok(only.serial.clone()),
			[] => Err(Error::DeviceNotFound {
				serial: String::new(),
				detail: format!("no '{driver}' device found by the probe worker"),
			}),
			many => Err(Error::AmbiguousSerial {
				driver: driver.to_string(),
				count: many.len(),
			}),
		}
	}

	async fn learn_descriptor(&self, worker: &WorkerHandle, device_id: u32) {
		match worker.call(Command::GetInfo { device_id }).await {
			Ok(Reply::Info { info }) => {
				let label = info.get("label").cloned().unwrap_or_else(|| worker.serial().to_string());
				let mut descriptor = DeviceDescriptor::new(worker.driver(), worker.serial(), label);
				for (key, value) in info {
					if !matches!(key.as_str(), "driver" | "serial" | "label" | "worker_pid") {
						descriptor = descriptor.with_attribute(key, value);
					}
				}
				worker.set_descriptor(descriptor);
			}
			Ok(other) => debug!(target = "rxproxy.manager", ?other, "unexpected info reply"),
			Err(err) => debug!(target = "rxproxy.manager", error = %err, "could not read device info"),
		}
	}

	/// Forgets the worker's handles and streams once it is reaped.
	fn watch(&self, worker: &Arc<WorkerHandle>) {
		if !self.tables.watched.lock().insert(worker.generation()) {
			return;
		}
		let tables = Arc::clone(&self.tables);
		let worker = Arc::clone(worker);
		tokio::spawn(async move {
			worker.dead().await;
			tables.watched.lock().remove(&worker.generation());
			tables.forget_worker(&worker);
		});
	}

	/// Resolves a handle to its worker, failing if that worker is gone.
	fn route(&self, handle: &DeviceHandle) -> Result<(Arc<WorkerHandle>, u32)> {
		let devices = self.tables.devices.lock();
		let Some(device) = devices.get(&handle.id) else {
			return Err(self.lost_error(handle.id).unwrap_or(Error::InvalidHandle));
		};
		let worker = Arc::clone(&device.worker);
		if worker.generation() != handle.generation || device.native_id != handle.native_id {
			return Err(Error::InvalidHandle);
		}
		if let Some(reason) = worker.crash_reason() {
			return Err(Error::WorkerCrash {
				serial: handle.serial.clone(),
				reason,
			});
		}
		Ok((worker, device.native_id))
	}

	/// Closes the handle. The worker drains once its last handle is closed.
	///
	/// Closing a handle whose worker already died succeeds.
	pub async fn close(&self, handle: &DeviceHandle) -> Result<()> {
		let Some(device) = self.tables.devices.lock().remove(&handle.id) else {
			if self.tables.bury(handle.id) {
				debug!(target = "rxproxy.manager", serial = %handle.serial, "closed handle of a reaped worker");
				return Ok(());
			}
			return Err(Error::InvalidHandle);
		};
		self.stop_sessions(|session| session.device == handle.id).await;

		let worker = device.worker;
		if worker.crash_reason().is_some() || worker.is_dead() {
			debug!(target = "rxproxy.manager", serial = %handle.serial, "closing handle of a dead worker");
			return Ok(());
		}

		let _turn = worker.lock_ops().await;
		match worker.call(Command::Close { device_id: device.native_id }).await {
			Ok(Reply::Closed { remaining }) => {
				worker.note_closed(remaining);
				info!(target = "rxproxy.manager", serial = %handle.serial, handle = handle.id, remaining, "device closed");
				Ok(())
			}
			Ok(other) => Err(unexpected("Close", &other)),
			Err(err) if err.is_worker_lost() => Ok(()),
			Err(err) => Err(err),
		}
	}

	/// Hardware information, with `proxy=true` and `worker_pid` when the
	/// device is served by a worker subprocess.
	pub async fn info(&self, handle: &DeviceHandle) -> Result<BTreeMap<String, String>> {
		let (worker, device_id) = self.route(handle)?;
		let reply = worker.call(Command::GetInfo { device_id }).await?;
		let Reply::Info { mut info } = reply else {
			return Err(unexpected("GetInfo", &reply));
		};
		if self.subprocess {
			info.insert("proxy".into(), "true".into());
		} else {
			info.remove("worker_pid");
		}
		Ok(info)
	}

	/// Applies a setting; returns the value the driver actually applied.
	pub async fn set_param(&self, handle: &DeviceHandle, key: &str, value: impl Into<ParamValue>) -> Result<ParamValue> {
		let (worker, device_id) = self.route(handle)?;
		let command = Command::SetParam {
			device_id,
			key: key.to_string(),
			value: value.into(),
		};
		match worker.call(command).await? {
			Reply::Param { value } => Ok(value),
			other => Err(unexpected("SetParam", &other)),
		}
	}

	pub async fn get_param(&self, handle: &DeviceHandle, key: &str) -> Result<ParamValue> {
		let (worker, device_id) = self.route(handle)?;
		let command = Command::GetParam {
			device_id,
			key: key.to_string(),
		};
		match worker.call(command).await? {
			Reply::Param { value } => Ok(value),
			other => Err(unexpected("GetParam", &other)),
		}
	}

	pub async fn frequency(&self, handle: &DeviceHandle) -> Result<f64> {
		number(keys::FREQUENCY, self.get_param(handle, keys::FREQUENCY).await?)
	}

	pub async fn set_frequency(&self, handle: &DeviceHandle, hz: f64) -> Result<f64> {
		number(keys::FREQUENCY, self.set_param(handle, keys::FREQUENCY, hz).await?)
	}

	pub async fn sample_rate(&self, handle: &DeviceHandle) -> Result<f64> {
		number(keys::SAMPLE_RATE, self.get_param(handle, keys::SAMPLE_RATE).await?)
	}

	pub async fn set_sample_rate(&self, handle: &DeviceHandle, rate: f64) -> Result<f64> {
		number(keys::SAMPLE_RATE, self.set_param(handle, keys::SAMPLE_RATE, rate).await?)
	}

	pub async fn gain(&self, handle: &DeviceHandle) -> Result<f64> {
		number(keys::GAIN, self.get_param(handle, keys::GAIN).await?)
	}

	pub async fn set_gain(&self, handle: &DeviceHandle, db: f64) -> Result<f64> {
		number(keys::GAIN, self.set_param(handle, keys::GAIN, db).await?)
	}

	pub async fn agc(&self, handle: &DeviceHandle) -> Result<bool> {
		flag(keys::AGC, self.get_param(handle, keys::AGC).await?)
	}

	pub async fn set_agc(&self, handle: &DeviceHandle, on: bool) -> Result<bool> {
		flag(keys::AGC, self.set_param(handle, keys::AGC, on).await?)
	}

	pub async fn antenna(&self, handle: &DeviceHandle) -> Result<String> {
		Ok(self.get_param(handle, keys::ANTENNA).await?.to_string())
	}

	pub async fn set_antenna(&self, handle: &DeviceHandle, name: &str) -> Result<String> {
		Ok(self.set_param(handle, keys::ANTENNA, name).await?.to_string())
	}

	pub async fn bandwidth(&self, handle: &DeviceHandle) -> Result<f64> {
		number(keys::BANDWIDTH, self.get_param(handle, keys::BANDWIDTH).await?)
	}

	pub async fn set_bandwidth(&self, handle: &DeviceHandle, hz: f64) -> Result<f64> {
		number(keys::BANDWIDTH, self.set_param(handle, keys::BANDWIDTH, hz).await?)
	}

	/// Starts streaming `channel` of the device. One session per device and
	/// channel.
	pub async fn start_stream(&self, handle: &DeviceHandle, channel: u32, format: StreamFormat) -> Result<StreamHandle> {
		let (worker, device_id) = self.route(handle)?;
		let key = (handle.serial.clone(), channel);
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		self.reserve_channel(&key, id)?;

		let started = worker
			.call(Command::StartStream {
				device_id,
				channel,
				format,
			})
			.await;
		let session_id = match started {
			Ok(Reply::StreamStarted { session_id }) => session_id,
			Ok(other) => {
				self.tables.channels.lock().remove(&key);
				return Err(unexpected("StartStream", &other));
			}
			Err(err) => {
				self.tables.channels.lock().remove(&key);
				return Err(err);
			}
		};

		let ring = Arc::new(SampleRing::new(
			self.config.ring_capacity,
			self.config.overrun_policy,
			self.config.overrun_is_error,
		));
		let pump = tokio::spawn(pump(
			Arc::clone(&worker),
			session_id,
			format,
			Arc::clone(&ring),
			self.config.read_chunk_samples.max(1),
			self.config.overrun_policy,
		));
		self.tables.sessions.lock().insert(
			id,
			Session {
				device: handle.id,
				serial: handle.serial.clone(),
				channel,
				worker,
				session_id,
				ring,
				pump,
			},
		);
		info!(target = "rxproxy.manager", serial = %handle.serial, channel, %format, stream = id, "stream started");
		Ok(StreamHandle {
			id,
			serial: handle.serial.clone(),
			channel,
			format,
		})
	}

	/// Reads up to `max` samples into `out`.
	///
	/// Returns as soon as samples are buffered, otherwise waits up to
	/// `timeout` (the configured read timeout when `None`) and may return
	/// none. Worker failures surface here as errors.
	pub async fn read_stream(
		&self,
		stream: &StreamHandle,
		out: &mut Vec<Complex32>,
		max: usize,
		timeout: Option<Duration>,
	) -> Result<StreamRead> {
		let ring = self.tables.sessions.lock().get(&stream.id).map(|session| Arc::clone(&session.ring));
		let Some(ring) = ring else {
			return Err(self.lost_error(stream.id).unwrap_or(Error::StreamClosed));
		};
		ring.read(out, max, timeout.unwrap_or_else(|| self.config.read_timeout())).await
	}

	/// Stops a stream. Blocked readers are woken with [`Error::StreamClosed`].
	pub async fn stop_stream(&self, stream: &StreamHandle) -> Result<()> {
		let Some(session) = self.tables.sessions.lock().remove(&stream.id) else {
			return match self.tables.lost.lock().remove(&stream.id) {
				Some(_) => Ok(()),
				None => Err(Error::StreamClosed),
			};
		};
		self.tables.release_channel(&session, stream.id);
		finish_session(session).await
	}

	/// Claims `key` for stream `id`. A claim held by a session of a dead
	/// worker is taken over.
	fn reserve_channel(&self, key: &(String, u32), id: u64) -> Result<()> {
		let stale = {
			let mut channels = self.tables.channels.lock();
			let Some(owner) = channels.get(key).copied() else {
				channels.insert(key.clone(), id);
				return Ok(());
			};
			self.tables
				.sessions
				.lock()
				.get(&owner)
				.map(|session| Arc::clone(&session.worker))
				.filter(|worker| worker.is_dead() || worker.crash_reason().is_some())
		};
		let busy = || Error::StreamActive {
			serial: key.0.clone(),
			channel: key.1,
		};
		let worker = stale.ok_or_else(busy)?;
		self.tables.forget_worker(&worker);

		let mut channels = self.tables.channels.lock();
		if channels.contains_key(key) {
			return Err(busy());
		}
		channels.insert(key.clone(), id);
		Ok(())
	}

	fn lost_error(&self, id: u64) -> Option<Error> {
		self.tables.lost.lock().get(&id).map(|(_, err)| err.clone())
	}

	async fn stop_sessions(&self, select: impl Fn(&Session) -> bool) {
		let stopped: Vec<(u64, Session)> = {
			let mut sessions = self.tables.sessions.lock();
			let ids: Vec<u64> = sessions.iter().filter(|(_, s)| select(s)).map(|(id, _)| *id).collect();
			ids.into_iter()
				.filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
				.collect()
		};
		for (id, session) in stopped {
			self.tables.release_channel(&session, id);
			if let Err(err) = finish_session(session).await {
				debug!(target = "rxproxy.manager", stream = id, error = %err, "stopping stream");
			}
		}
	}

	/// Snapshot of all workers.
	pub fn status(&self) -> Vec<WorkerRecord> {
		self.supervisor.records()
	}

	/// Stops every stream and worker.
	pub async fn shutdown(&self) {
		self.stop_sessions(|_| true).await;
		self.tables.devices.lock().clear();
		self.tables.lost.lock().clear();
		self.supervisor.shutdown().await;
		info!(target = "rxproxy.manager", "proxy manager shut down");
	}
}

async fn finish_session(session: Session) -> Result<()> {
	let Session {
		worker,
		session_id,
		ring,
		pump,
		..
	} = session;
	ring.fail(Error::StreamClosed);
	let result = if worker.accepts_work() {
		match worker.call(Command::StopStream { session_id }).await {
			Ok(_) | Err(Error::StreamClosed) => Ok(()),
			Err(err) if err.is_worker_lost() => Ok(()),
			Err(err) => Err(err),
		}
	} else {
		Ok(())
	};
	if tokio::time::timeout(Duration::from_secs(1), pump).await.is_err() {
		warn!(target = "rxproxy.manager", session_id, "stream pump did not stop");
	}
	result
}

fn unexpected(request: &str, reply: &Reply) -> Error {
	Error::Protocol(format!("worker sent unexpected reply to {request}: {reply:?}"))
}

fn number(key: &str, value: ParamValue) -> Result<f64> {
	value
		.as_f64()
		.ok_or_else(|| Error::Protocol(format!("worker returned non-numeric {key} '{value}'")))
}

fn flag(key: &str, value: ParamValue) -> Result<bool> {
	value
		.as_bool()
		.ok_or_else(|| Error::Protocol(format!("worker returned non-boolean {key} '{value}'")))
}

#[cfg(test)]
mod tests;
