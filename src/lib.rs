//! # Rust VNA Core Library
//!
//! Command/response protocol engine for the HP 8751A vector network analyzer behind a
//! Prologix GPIB-Ethernet bridge. The library keeps a single-outstanding-command queue
//! over an unframed byte stream, reassembles ASCII and `#6` binary replies, enforces
//! response timeouts and sequences complete measurement sweeps with cancellation at
//! every step.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: The sans-IO core. `command` builds command text and instrument
//!   settings, `framer` cuts replies out of the byte stream, `decoder` turns them into
//!   typed values and `dispatcher` owns the FIFO queue and the response deadline.
//! - **`sweep`**: The sweep and initialization sequencer, a `(state, event)` transition
//!   table on top of the dispatcher.
//! - **`bridge`**: Prologix addressing, bridge set-up and the TCP connection.
//! - **`instrument`**: The tokio task that owns transport and protocol state, and the
//!   `Hp8751a` handle callers talk to.
//! - **`config`**: Figment-backed configuration (`config/vna.toml` + `RUST_VNA_*`).
//! - **`error`**: The `VnaError` taxonomy shared by every module.
//! - **`tracing_init`**: Subscriber set-up for structured logging.

pub mod bridge;
pub mod config;
pub mod error;
pub mod instrument;
pub mod protocol;
pub mod sweep;
pub mod tracing_init;

pub use error::{AppResult, VnaError};
pub use instrument::{Hp8751a, Hp8751aBuilder, InstrumentEvent};
