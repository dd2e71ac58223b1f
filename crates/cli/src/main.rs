use clap::Parser;
use rxproxy_cli::{cli::Cli, commands, error::CliError, logging};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	match commands::dispatch(cli).await {
		Ok(code) => std::process::exit(code),
		Err(err) => {
			report(&err);
			std::process::exit(err.exit_code());
		}
	}
}

fn report(err: &CliError) {
	eprintln!("error: {err}");
	let mut source = std::error::Error::source(err);
	while let Some(cause) = source {
		eprintln!("  caused by: {cause}");
		source = cause.source();
	}
}
