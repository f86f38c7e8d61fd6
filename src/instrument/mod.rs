//! HP 8751A instrument driver.
//!
//! The driver is split into a task that owns all protocol state and a cheap,
//! cloneable handle used by callers:
//!
//! ```text
//! Hp8751a (handle) ──mpsc──> InstrumentActor ──bytes──> Prologix bridge
//!        ▲                     │ Dispatcher
//!        │                     │ SweepMachine
//!        └──broadcast/watch────┘
//! ```
//!
//! Requests get a direct reply through a oneshot channel. Everything that happens
//! asynchronously (sweep results, timeouts, state changes) is published as an
//! [`InstrumentEvent`] on a broadcast channel; the current sweep and connection
//! states are also available through `watch` receivers.
//!
//! # Example
//!
//! ```no_run
//! use rust_vna::config::VnaConfig;
//! use rust_vna::instrument::{Hp8751a, InstrumentEvent};
//! use rust_vna::sweep::SweepMode;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VnaConfig::load()?;
//! let vna = Hp8751a::connect(&config).await?;
//! let mut events = vna.subscribe();
//!
//! println!("{}", vna.identify().await?);
//! vna.start_sweep(SweepMode::Single).await?;
//! while let Ok(event) = events.recv().await {
//!     if let InstrumentEvent::SweepComplete(result) = event {
//!         println!("{} points", result.len());
//!         break;
//!     }
//! }
//! vna.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod actor;
mod handle;
pub mod messages;

use std::sync::Arc;

use crate::bridge::ConnectionState;
use crate::error::VnaError;
use crate::protocol::command::{Channel, CommandKind};
use crate::sweep::machine::SweepResult;
use crate::sweep::state::SweepState;

pub use handle::{Hp8751a, Hp8751aBuilder};
pub use messages::InstrumentRequest;

/// Notifications published by the instrument task.
#[derive(Debug, Clone)]
pub enum InstrumentEvent {
    /// The link to the bridge changed state
    ConnectionStateChanged(ConnectionState),
    /// The sweep sequencer entered a new state
    StateChanged(SweepState),
    /// A sweep finished
    SweepComplete(Arc<SweepResult>),
    /// A cancellation was acknowledged; no result was published
    SweepCancelled,
    /// A sweep or initialization was abandoned and the sequencer is idle
    SweepAborted {
        /// State the failure occurred in
        state: SweepState,
        /// Cause
        error: VnaError,
    },
    /// The initialization sequence was acknowledged
    Initialized,
    /// A command received no response in time and was dropped
    Timeout {
        /// Kind of the dropped command
        kind: CommandKind,
        /// Channel tag of the dropped command
        channel: Channel,
    },
    /// A reply violated the framing rule of its command and was dropped
    FramingError {
        /// Kind of the dropped command
        kind: CommandKind,
        /// What was wrong
        reason: String,
    },
    /// A reply was framed but its content could not be decoded
    DecodeError {
        /// Kind of the command
        kind: CommandKind,
        /// What was wrong
        reason: String,
    },
}
