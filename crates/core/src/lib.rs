//! rxproxy: open several receivers at once through drivers that allow only
//! one device per process.
//!
//! Each opened serial is served by its own worker process that owns the
//! native claim. The [`ProxyManager`] routes handles, settings and sample
//! streams to the right worker, restarts workers on demand and reports a
//! dead worker as [`Error::WorkerCrash`] on the handles bound to it.
//!
//! ```ignore
//! use rxproxy::{DeviceArgs, ProxyConfig, ProxyManager, StreamFormat};
//!
//! let manager = ProxyManager::new(ProxyConfig::from_env());
//! let a = manager.open(&DeviceArgs::for_driver("sim").with_serial("SIM0001")).await?;
//! let b = manager.open(&DeviceArgs::for_driver("sim").with_serial("SIM0002")).await?;
//! manager.set_frequency(&a, 100.1e6).await?;
//! let stream = manager.start_stream(&b, 0, StreamFormat::Cf32).await?;
//! let mut samples = Vec::new();
//! manager.read_stream(&stream, &mut samples, 4096, None).await?;
//! ```
//!
//! With proxy mode off ([`MULTIDEV_ENV`] unset) workers run as tasks in this
//! process and share its single native claim.

pub mod claim;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod native;
pub mod samples;
pub mod stream;
pub mod supervisor;
pub mod worker;

pub use claim::ClaimLock;
pub use config::{MULTIDEV_ENV, OverrunPolicy, ProxyConfig};
pub use error::{Error, Origin, Result};
pub use launcher::{InProcessLauncher, SubprocessLauncher, WorkerLauncher};
pub use manager::{DeviceHandle, ProxyManager};
pub use native::{DriverRegistry, NativeDevice, NativeDriver, NativeError, builtin_drivers};
pub use num_complex::Complex32;
pub use rxproxy_protocol::{DeviceArgs, DeviceDescriptor, ParamValue, StreamFormat, WorkerState};
pub use stream::{StreamHandle, StreamRead};
pub use supervisor::WorkerRecord;
