//! Requests sent from [`Hp8751a`](super::Hp8751a) handles to the instrument task.
//!
//! Each variant carries a `oneshot::Sender` for its reply, so every caller gets a
//! receiver to await. The helper constructors return the request together with
//! that receiver:
//!
//! ```text
//! Caller                           Instrument task
//! ------                           ---------------
//! 1. InstrumentRequest::execute(Command::identify())
//! 2. send via mpsc          ------>
//!                                  3. enqueue *IDN? on the dispatcher
//!                                  4. ... response framed and decoded
//! 5. await oneshot          <------ 6. reply
//! ```

use tokio::sync::oneshot;

use crate::error::AppResult;
use crate::protocol::command::{Command, InstrumentParameters, MeasurementSetup};
use crate::protocol::decoder::Response;
use crate::sweep::state::SweepMode;

/// Requests handled by the instrument task.
#[derive(Debug)]
pub enum InstrumentRequest {
    /// Enqueue a single command outside the sweep sequence and reply with its response.
    Execute {
        /// Command to enqueue
        command: Command,
        /// Decoded response, timeout, framing or decode error
        response: oneshot::Sender<AppResult<Response>>,
    },

    /// Store the parameter snapshot for the next sweep.
    Configure {
        /// New parameters
        parameters: InstrumentParameters,
        /// Validation result
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Run the initialization sequence.
    ///
    /// The reply only confirms the sequence was accepted; completion is reported by
    /// an [`InstrumentEvent::Initialized`](super::InstrumentEvent::Initialized).
    Initialize {
        /// Measurement function to apply
        setup: MeasurementSetup,
        /// `Err(Busy)` if another sequence is running
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Start a sweep with the stored parameters.
    StartSweep {
        /// Single or continuous
        mode: SweepMode,
        /// `Err(Busy)` if another sequence is running
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Cancel the running sequence; a no-op when idle.
    CancelSweep {
        /// Acknowledges the request, not the instrument's HOLD
        response: oneshot::Sender<()>,
    },

    /// Let a continuous sweep stop after the current pass.
    FinishContinuous {
        /// Acknowledges the request
        response: oneshot::Sender<()>,
    },

    /// Stop the task. Pending commands fail with `ActorGone`.
    Shutdown {
        /// Sent once the task has released the transport
        response: oneshot::Sender<()>,
    },
}

impl InstrumentRequest {
    /// Execute `command` directly.
    pub fn execute(command: Command) -> (Self, oneshot::Receiver<AppResult<Response>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Execute {
                command,
                response: tx,
            },
            rx,
        )
    }

    /// Store sweep parameters.
    pub fn configure(
        parameters: InstrumentParameters,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Configure {
                parameters,
                response: tx,
            },
            rx,
        )
    }

    /// Initialize the instrument.
    pub fn initialize(setup: MeasurementSetup) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Initialize { setup, response: tx }, rx)
    }

    /// Start a sweep.
    pub fn start_sweep(mode: SweepMode) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartSweep { mode, response: tx }, rx)
    }

    /// Cancel the running sequence.
    pub fn cancel_sweep() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::CancelSweep { response: tx }, rx)
    }

    /// Finish continuous sweeping.
    pub fn finish_continuous() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::FinishContinuous { response: tx }, rx)
    }

    /// Stop the task.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
