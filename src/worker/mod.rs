//! Worker communication module.
//!
//! Multiplexes many concurrent requests over the stdin/stdout pipes of a
//! single long-lived worker process, and keeps that process alive.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Relay (Rust + Tokio)                       │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │  Correlator: request IDs -> pending completions            │  │
//! │  │  Supervisor: launch, readiness, exit, restart w/ backoff   │  │
//! │  │  FallbackInvoker: one process per request when not ready   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │               stdin (NDJSON) │ stdout (NDJSON)                  │
//! │                              ▼                                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                Worker (Long-Running Child Process)              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Wire format
//!
//! Requests: `{"requestId":"r1","payload":"hi","timestamp":1700000000000}`.
//! Replies: `{"requestId":"r1","result":"hello"}` or
//! `{"requestId":"r1","error":"..."}`, optionally with extra metadata keys.
//! The worker announces readiness with `{"type":"ready"}` (or, for older
//! workers, a sentinel line on stderr).
//!
//! # Example
//!
//! ```ignore
//! use tether::config::Settings;
//! use tether::worker::{Relay, ShutdownTrigger};
//!
//! let relay = Relay::from_settings(&Settings::load()?)?;
//! relay.wait_ready(Duration::from_secs(30)).await;
//!
//! let answer = relay.ask("What are the opening hours?").await?;
//! println!("{}", answer.text);
//!
//! relay.shutdown(ShutdownTrigger::Requested).await;
//! ```

mod correlator;
mod decoder;
mod error;
#[cfg(test)]
mod fake;
mod fallback;
mod process;
pub mod protocol;
mod relay;
mod shutdown;
mod supervisor;

pub use correlator::{BoxedWriter, Correlator, WorkerLink};
pub use decoder::{DecodeEvent, FrameDecoder};
pub use error::{CloseReason, WorkerError, WorkerResult};
pub use fallback::FallbackInvoker;
pub use process::{
    stop_process, BoxedReader, ChildProcess, CommandSpec, ProcessLauncher, WorkerIo,
    WorkerLauncher, WorkerProcess,
};
pub use protocol::{Answer, Frame, RequestEnvelope, ResponseEnvelope};
pub use relay::{Health, Relay, RelayConfig, DEFAULT_FALLBACK_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
pub use shutdown::{
    wait_for_signal, ShutdownCoordinator, ShutdownOptions, ShutdownReport, ShutdownTrigger,
};
pub use supervisor::{Supervisor, SupervisorOptions, WorkerState};
