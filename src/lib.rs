//! # Tether
//!
//! Turns one long-running worker process into a concurrent, fault-tolerant
//! request/response service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            Callers (CLI `serve`, `ask`, library)         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [Relay]
//! ┌──────────────────────────────┐   not ready / write failed
//! │   Correlator (pending map)   │ ───────────────────────────┐
//! └──────────────────────────────┘                            ▼
//!          │ stdin (NDJSON)  ▲ stdout (NDJSON)     ┌───────────────────┐
//!          ▼                 │ [decoder]           │ Fallback process  │
//! ┌──────────────────────────────┐                 │ (one per request) │
//! │ Worker process (Supervisor:  │                 └───────────────────┘
//! │ Starting → Ready → Closed)   │
//! └──────────────────────────────┘
//! ```
//!
//! A crash fails every in-flight request with `WorkerClosed` and the worker
//! is relaunched after a backoff; shutdown fails them with `ShuttingDown`
//! and stops the worker with an escalating terminate/kill.

pub mod config;
pub mod logging;
pub mod worker;

pub use config::{Settings, SettingsError};
pub use worker::{Answer, Relay, RelayConfig, WorkerError, WorkerResult};
