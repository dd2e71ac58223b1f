use std::time::Duration;

use rxproxy::builtin_drivers;
use rxproxy::claim::ClaimLock;
use rxproxy::worker::{self, WorkerInvocation};
use rxproxy_protocol::DeviceArgs;
use rxproxy_runtime::Endpoint;
use tracing::{debug, error};

use crate::cli::{ProxyArgs, WorkerArgs};

/// Serves one worker invocation over stdin/stdout and returns its exit
/// status. Aborts the process after a native fault.
pub async fn execute(args: WorkerArgs, proxy: &ProxyArgs) -> i32 {
	// Ctrl-C in a terminal reaches the whole process group; the manager
	// decides when workers stop.
	tokio::spawn(async {
		while tokio::signal::ctrl_c().await.is_ok() {
			debug!(target = "rxproxy.worker", "ignoring interrupt");
		}
	});

	let claim_lock = claim_lock(&args, proxy);
	let invocation = WorkerInvocation {
		driver: args.driver,
		serial: args.serial,
		hints: args.hints.into_iter().collect::<DeviceArgs>(),
		probe: args.probe,
		claim_lock: Some(claim_lock),
	};
	let endpoint = Endpoint::connect(tokio::io::stdout(), tokio::io::stdin());
	let outcome = worker::run(invocation, &builtin_drivers(), endpoint).await;

	match outcome.exit_code() {
		Some(code) => code,
		None => {
			error!(target = "rxproxy.worker", ?outcome, "aborting after native fault");
			std::process::abort();
		}
	}
}

fn claim_lock(args: &WorkerArgs, proxy: &ProxyArgs) -> ClaimLock {
	let mut lock = match &proxy.claim_lock {
		Some(path) => ClaimLock::new(path.clone()),
		None => ClaimLock::for_driver(&args.driver),
	};
	if let Some(ms) = args.claim_timeout_ms {
		lock = lock.with_timeout(Duration::from_millis(ms));
	}
	if let Some(ms) = args.claim_cooldown_ms {
		lock = lock.with_cooldown(Duration::from_millis(ms));
	}
	lock
}
