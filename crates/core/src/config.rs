//! Proxy configuration.
//!
//! Read once, then passed by value to [`ProxyManager::new`](crate::ProxyManager::new).
//! Nothing else in the crate looks at the environment for proxy settings.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::claim::ClaimLock;

/// Environment variable that turns proxy mode on.
pub const MULTIDEV_ENV: &str = "RXPROXY_MULTIDEV";

/// What a stream ring does when the reader falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverrunPolicy {
	/// Discard the oldest buffered samples and count them as dropped.
	#[default]
	DropOldest,
	/// Stop pulling from the worker until the reader makes room; the worker
	/// then drops at the native layer and reports the count.
	BlockProducer,
}

impl FromStr for OverrunPolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"drop-oldest" => Ok(OverrunPolicy::DropOldest),
			"block-producer" => Ok(OverrunPolicy::BlockProducer),
			other => Err(format!("unknown overrun policy '{other}' (expected drop-oldest or block-producer)")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
	/// Run one worker subprocess per serial. Off means in-process workers
	/// sharing this process's single native claim.
	pub proxy_mode: bool,
	/// Worker executable; looked up when unset.
	pub worker_executable: Option<PathBuf>,
	pub handshake_timeout_ms: u64,
	pub command_timeout_ms: u64,
	pub heartbeat_interval_ms: u64,
	/// Consecutive unanswered heartbeats tolerated before a worker is
	/// declared crashed.
	pub missed_heartbeats: u32,
	/// Default wait for `read_stream` when the caller passes none.
	pub read_timeout_ms: u64,
	/// Upper bound on a whole enumeration probe.
	pub enumerate_timeout_ms: u64,
	/// Time a worker gets to exit after `Shutdown` before it is killed.
	pub shutdown_grace_ms: u64,
	/// Ring buffer capacity per stream session, in samples.
	pub ring_capacity: usize,
	/// Samples requested per `ReadStream`.
	pub read_chunk_samples: u32,
	pub overrun_policy: OverrunPolicy,
	/// Report ring drops as a `StreamOverrun` error instead of a count.
	pub overrun_is_error: bool,
	/// Extra environment for worker processes.
	pub worker_env: BTreeMap<String, String>,
	/// Lock file serializing native claims across workers; a per-driver
	/// file in the temp directory when unset.
	pub claim_lock_path: Option<PathBuf>,
	pub claim_lock_timeout_ms: u64,
	/// Minimum time between one worker releasing the claim lock and the
	/// next one using the native open/close path.
	pub claim_cooldown_ms: u64,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			proxy_mode: false,
			worker_executable: None,
			handshake_timeout_ms: 10_000,
			command_timeout_ms: 5_000,
			heartbeat_interval_ms: 500,
			missed_heartbeats: 3,
			read_timeout_ms: 1_000,
			enumerate_timeout_ms: 5_000,
			shutdown_grace_ms: 1_000,
			ring_capacity: 1 << 18,
			read_chunk_samples: 16_384,
			overrun_policy: OverrunPolicy::DropOldest,
			overrun_is_error: false,
			worker_env: BTreeMap::new(),
			claim_lock_path: None,
			claim_lock_timeout_ms: 10_000,
			claim_cooldown_ms: 0,
		}
	}
}

impl ProxyConfig {
	/// Defaults plus `RXPROXY_MULTIDEV` and `RXPROXY_WORKER`.
	pub fn from_env() -> Self {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Same as [`from_env`](Self::from_env) with an explicit variable source.
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
		let mut config = Self::default();
		if let Some(value) = lookup(MULTIDEV_ENV) {
			config.proxy_mode = parse_flag(&value);
		}
		if let Some(path) = lookup(rxproxy_runtime::WORKER_ENV).filter(|p| !p.is_empty()) {
			config.worker_executable = Some(PathBuf::from(path));
		}
		config
	}

	pub fn with_proxy_mode(mut self, on: bool) -> Self {
		self.proxy_mode = on;
		self
	}

	pub fn with_worker_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.worker_env.insert(key.into(), value.into());
		self
	}

	pub fn handshake_timeout(&self) -> Duration {
		Duration::from_millis(self.handshake_timeout_ms)
	}

	pub fn command_timeout(&self) -> Duration {
		Duration::from_millis(self.command_timeout_ms)
	}

	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.heartbeat_interval_ms.max(1))
	}

	pub fn read_timeout(&self) -> Duration {
		Duration::from_millis(self.read_timeout_ms)
	}

	pub fn enumerate_timeout(&self) -> Duration {
		Duration::from_millis(self.enumerate_timeout_ms)
	}

	pub fn shutdown_grace(&self) -> Duration {
		Duration::from_millis(self.shutdown_grace_ms)
	}

	/// Claim lock handed to workers of `driver`.
	pub fn claim_lock(&self, driver: &str) -> ClaimLock {
		let lock = match &self.claim_lock_path {
			Some(path) => ClaimLock::new(path.clone()),
			None => ClaimLock::for_driver(driver),
		};
		lock.with_timeout(Duration::from_millis(self.claim_lock_timeout_ms))
			.with_cooldown(Duration::from_millis(self.claim_cooldown_ms))
	}
}

/// `1`, `true`, `yes` and `on` (any case) are true; everything else is false.
pub fn parse_flag(value: &str) -> bool {
	matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
