//! isoworker: run untrusted scripts in a separately spawned runtime process
//! behind a Web-Worker-like API.
//!
//! The host binds a loopback WebSocket listener, spawns the runtime with a
//! bootstrap script and the connect address, and exchanges structured
//! values with it over the single connection.
//!
//! # Example
//!
//! ```no_run
//! use isoworker::{Script, Worker, WorkerOptions};
//! use isoworker_structure::Value;
//!
//! # async fn run() -> isoworker::Result<()> {
//! let worker = Worker::new(
//!     Script::inline("self.onmessage = (e) => self.postMessage(e.data);"),
//!     WorkerOptions::default(),
//! );
//! worker.on_message(|event| println!("got {:?}", event.data));
//! worker.start();
//!
//! worker.post_message(Value::from("hello"), vec![])?;
//! worker.exited().await;
//! # Ok(())
//! # }
//! ```

mod args;
mod error;
mod options;
mod process;
mod supervisor;

pub use args::{connect_url, runtime_args, Script};
pub use error::{Result, WorkerError};
pub use options::{Grant, Permissions, WorkerOptions};
pub use process::kill_process;
pub use supervisor::{Worker, WorkerExit, WorkerId, WorkerState, STARTUP_FAILURE_CODE};
