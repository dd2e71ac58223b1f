use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	#[error(transparent)]
	Proxy(#[from] rxproxy::Error),

	#[error("no devices to open; pass device arguments such as driver=sim,serial=SIM0001")]
	NoDevices,

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

impl CliError {
	/// Process exit status for this failure.
	pub fn exit_code(&self) -> i32 {
		use rxproxy::Error as E;
		match self {
			CliError::Proxy(err) => match err {
				E::DeviceNotFound { .. } => 2,
				E::DeviceBusy { .. } => 3,
				E::AmbiguousSerial { .. } | E::InvalidArgument(_) => 4,
				E::WorkerCrash { .. } | E::TransportClosed { .. } | E::SpawnFailure { .. } => 5,
				E::HandshakeTimeout { .. } | E::Timeout { .. } => 6,
				E::NativeDriverError { .. } => 7,
				_ => 1,
			},
			CliError::NoDevices => 4,
			_ => 1,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exit_codes_follow_the_failure() {
		let not_found = CliError::from(rxproxy::Error::DeviceNotFound {
			serial: "TESTSERIAL".into(),
			detail: "no sim device".into(),
		});
		assert_eq!(not_found.exit_code(), 2);
		assert!(not_found.to_string().contains("proxy"));

		let native = CliError::from(rxproxy::Error::NativeDriverError {
			code: -2,
			message: "invalid antenna".into(),
		});
		assert_eq!(native.exit_code(), 7);
		assert_eq!(CliError::NoDevices.exit_code(), 4);
		assert_eq!(CliError::from(anyhow::anyhow!("boom")).exit_code(), 1);
	}
}
