use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Installs the stderr subscriber. Stdout stays clean: in a worker it is the
/// transport, elsewhere it carries command output.
pub fn init_logging(verbosity: u8) {
	// 0 = warnings only
	// 1 (-v) = info for rxproxy, warn elsewhere
	// 2+ (-vv) = debug for everything
	let filter = match verbosity {
		0 => "warn",
		1 => "warn,rxproxy=info",
		_ => "debug",
	};

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(true)
		.with_level(true)
		.compact()
		.init();
}
