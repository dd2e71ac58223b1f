//! Cross-process serialization of native claims.
//!
//! Every worker holds an advisory lock on a shared file while it claims or
//! releases its device, so no two processes talk to the vendor service's
//! open/close path at once. The file records when the last holder finished;
//! a holder waits until `cooldown` has passed since then before proceeding.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fd_lock::{RwLock, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ClaimLockError {
	#[error("worker waited {waited_ms}ms for claim lock {}", path.display())]
	TimedOut { path: PathBuf, waited_ms: u64 },

	#[error("worker cannot use claim lock {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

/// Advisory lock file shared by every worker of a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimLock {
	path: PathBuf,
	timeout: Duration,
	cooldown: Duration,
}

impl ClaimLock {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			timeout: DEFAULT_CLAIM_TIMEOUT,
			cooldown: Duration::ZERO,
		}
	}

	/// `rxproxy-<driver>.lock` in the system temp directory.
	pub fn for_driver(driver: &str) -> Self {
		Self::new(std::env::temp_dir().join(format!("rxproxy-{driver}.lock")))
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
		self.cooldown = cooldown;
		self
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	pub fn cooldown(&self) -> Duration {
		self.cooldown
	}

	/// Runs `f` while holding the lock. Blocks the calling thread.
	pub fn hold<T>(&self, f: impl FnOnce() -> T) -> Result<T, ClaimLockError> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(false)
			.open(&self.path)
			.map_err(|e| self.io(e))?;
		let mut lock = RwLock::new(file);
		let started = Instant::now();
		loop {
			match lock.try_write() {
				Ok(guard) => return Ok(self.locked(guard, started, f)),
				Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
					if started.elapsed() >= self.timeout {
						return Err(ClaimLockError::TimedOut {
							path: self.path.clone(),
							waited_ms: started.elapsed().as_millis() as u64,
						});
					}
					thread::sleep(RETRY);
				}
				Err(err) => return Err(self.io(err)),
			}
		}
	}

	fn locked<T>(&self, mut guard: RwLockWriteGuard<'_, File>, started: Instant, f: impl FnOnce() -> T) -> T {
		let wait = self.cooldown_left(&mut guard);
		if !wait.is_zero() {
			debug!(target = "rxproxy.worker", wait_ms = wait.as_millis() as u64, "claim cooldown");
			thread::sleep(wait);
		}
		trace!(
			target = "rxproxy.worker",
			path = %self.path.display(),
			waited_ms = started.elapsed().as_millis() as u64,
			"claim lock held"
		);

		let out = f();
		if let Err(err) = stamp(&mut guard) {
			warn!(target = "rxproxy.worker", path = %self.path.display(), error = %err, "claim release time not recorded");
		}
		out
	}

	fn cooldown_left(&self, file: &mut File) -> Duration {
		if self.cooldown.is_zero() {
			return Duration::ZERO;
		}
		let mut text = String::new();
		if file.seek(SeekFrom::Start(0)).and_then(|_| file.read_to_string(&mut text)).is_err() {
			return Duration::ZERO;
		}
		let Ok(released_ms) = text.trim().parse::<u64>() else {
			return Duration::ZERO;
		};
		let released = UNIX_EPOCH + Duration::from_millis(released_ms);
		let since = SystemTime::now().duration_since(released).unwrap_or(Duration::ZERO);
		self.cooldown.saturating_sub(since)
	}

	fn io(&self, source: io::Error) -> ClaimLockError {
		ClaimLockError::Io {
			path: self.path.clone(),
			source,
		}
	}
}

/// Records now as the last release time.
fn stamp(file: &mut File) -> io::Result<()> {
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
	file.set_len(0)?;
	file.seek(SeekFrom::Start(0))?;
	write!(file, "{}", now.as_millis())?;
	file.flush()
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Barrier};

	use super::*;

	fn lock_in(dir: &tempfile::TempDir) -> ClaimLock {
		ClaimLock::new(dir.path().join("claim.lock"))
	}

	#[test]
	fn concurrent_holders_never_overlap() {
		let dir = tempfile::tempdir().unwrap();
		let lock = lock_in(&dir);
		let start = Arc::new(Barrier::new(2));

		let spans: Vec<(Instant, Instant)> = (0..2)
			.map(|_| {
				let lock = lock.clone();
				let start = Arc::clone(&start);
				thread::spawn(move || {
					start.wait();
					lock.hold(|| {
						let entered = Instant::now();
						thread::sleep(Duration::from_millis(150));
						(entered, Instant::now())
					})
					.unwrap()
				})
			})
			.collect::<Vec<_>>()
			.into_iter()
			.map(|t| t.join().unwrap())
			.collect();

		let (first, second) = if spans[0].0 <= spans[1].0 {
			(spans[0], spans[1])
		} else {
			(spans[1], spans[0])
		};
		assert!(second.0 >= first.1, "claims overlapped: {spans:?}");
	}

	#[test]
	fn busy_lock_times_out() {
		let dir = tempfile::tempdir().unwrap();
		let holder = lock_in(&dir);
		let (held_tx, held_rx) = std::sync::mpsc::channel();
		let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
		let owner = thread::spawn(move || {
			holder
				.hold(|| {
					held_tx.send(()).unwrap();
					let _ = done_rx.recv_timeout(Duration::from_secs(5));
				})
				.unwrap()
		});
		held_rx.recv().unwrap();

		let err = lock_in(&dir).with_timeout(Duration::from_millis(60)).hold(|| ()).unwrap_err();
		assert!(matches!(err, ClaimLockError::TimedOut { waited_ms, .. } if waited_ms >= 60));
		assert!(err.to_string().contains("worker"));

		done_tx.send(()).unwrap();
		owner.join().unwrap();
		lock_in(&dir).hold(|| ()).unwrap();
	}

	#[test]
	fn cooldown_spaces_out_holders() {
		let dir = tempfile::tempdir().unwrap();
		let lock = lock_in(&dir).with_cooldown(Duration::from_millis(200));

		let started = Instant::now();
		lock.hold(|| ()).unwrap();
		assert!(started.elapsed() < Duration::from_millis(150), "first holder has nothing to wait for");

		let started = Instant::now();
		lock.hold(|| ()).unwrap();
		assert!(started.elapsed() >= Duration::from_millis(150));
	}
}
