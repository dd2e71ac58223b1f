//! rxproxy runtime: the plumbing between a manager and its workers.
//!
//! - **Transport**: length-prefixed frames over stdio pipes, with buffering for
//!   partial reads and a distinguished closed condition
//! - **Connection**: sequence-number correlation, cancellation cleanup and
//!   per-worker command serialization on the manager side
//! - **Locate**: finding the executable that hosts the worker entry point
//! - **Process**: spawning, reaping and killing worker subprocesses
//!
//! ```text
//! manager ── Connection ── PipeTransport ══ pipes ══ Endpoint ── worker
//! ```

pub mod connection;
pub mod error;
pub mod locate;
pub mod process;
pub mod transport;

pub use connection::Connection;
pub use error::{Error, Result};
pub use locate::{WORKER_BINARY, WORKER_ENV, find_worker_executable};
pub use process::{LaunchSpec, WorkerExit, WorkerProcess};
pub use transport::{
	BoxedReader, BoxedWriter, Endpoint, EndpointSender, PipeTransport, PipeTransportReceiver, PipeTransportSender,
	TransportParts,
};
