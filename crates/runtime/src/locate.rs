//! Worker executable lookup.

use std::env::consts::EXE_SUFFIX;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Environment variable naming the worker executable.
pub const WORKER_ENV: &str = "RXPROXY_WORKER";

/// File stem of the binary that hosts the worker entry point.
pub const WORKER_BINARY: &str = "rxproxy";

/// Locates the executable to spawn workers from.
///
/// Candidates, first usable wins:
/// 1. `explicit` (configuration)
/// 2. the `RXPROXY_WORKER` environment variable
/// 3. the current executable, when it is `rxproxy` itself
/// 4. an `rxproxy` binary next to the current executable (or one directory
///    up when running from a cargo `deps/` directory)
/// 5. `rxproxy` on `PATH`
///
/// # Errors
///
/// Returns [`Error::WorkerNotFound`] when no candidate is an existing file.
pub fn find_worker_executable(explicit: Option<&Path>) -> Result<PathBuf> {
	let env_value = std::env::var_os(WORKER_ENV).map(PathBuf::from);
	let current = std::env::current_exe().ok();
	resolve(explicit, env_value.as_deref(), current.as_deref(), || which::which(WORKER_BINARY).ok())
}

fn resolve<F>(explicit: Option<&Path>, env_value: Option<&Path>, current_exe: Option<&Path>, on_path: F) -> Result<PathBuf>
where
	F: FnOnce() -> Option<PathBuf>,
{
	if let Some(path) = explicit {
		if let Some(found) = usable("config", path) {
			return Ok(found);
		}
	}

	if let Some(path) = env_value.filter(|p| !p.as_os_str().is_empty()) {
		if let Some(found) = usable(WORKER_ENV, path) {
			return Ok(found);
		}
	}

	if let Some(current) = current_exe {
		if current.file_stem() == Some(OsStr::new(WORKER_BINARY)) {
			if let Some(found) = usable("current executable", current) {
				return Ok(found);
			}
		}
		for dir in sibling_dirs(current) {
			let candidate = dir.join(format!("{WORKER_BINARY}{EXE_SUFFIX}"));
			if let Some(found) = usable("sibling", &candidate) {
				return Ok(found);
			}
		}
	}

	if let Some(path) = on_path() {
		if let Some(found) = usable("PATH", &path) {
			return Ok(found);
		}
	}

	Err(Error::WorkerNotFound(format!(
		"set {WORKER_ENV} or put '{WORKER_BINARY}' on PATH"
	)))
}

/// Directory of `exe`, plus its parent when `exe` lives in `deps/`.
fn sibling_dirs(exe: &Path) -> Vec<PathBuf> {
	let mut dirs = Vec::new();
	if let Some(dir) = exe.parent() {
		dirs.push(dir.to_path_buf());
		if dir.file_name() == Some(OsStr::new("deps")) {
			if let Some(parent) = dir.parent() {
				dirs.push(parent.to_path_buf());
			}
		}
	}
	dirs
}

fn usable(source: &str, path: &Path) -> Option<PathBuf> {
	let ok = path.is_file();
	debug!(target = "rxproxy.supervisor", source, path = %path.display(), usable = ok, "worker executable candidate");
	if ok {
		Some(path.to_path_buf())
	} else {
		if source == "config" || source == WORKER_ENV {
			warn!(
				target = "rxproxy.supervisor",
				source,
				path = %path.display(),
				"configured worker executable does not exist; trying fallbacks"
			);
		}
		None
	}
}
