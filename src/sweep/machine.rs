//! Sweep sequencer.
//!
//! [`SweepMachine`] drives a full measurement sweep, and separately instrument
//! initialization, by issuing the next command whenever the previous one resolves.
//! It is a plain `(state, event)` transition table: it owns no I/O and no timers.
//! Every entry point returns the [`SweepAction`]s its owner must carry out:
//!
//! - [`SweepAction::Send`]: enqueue the command on the dispatcher, then report the
//!   assigned id back through [`SweepMachine::bind`]
//! - [`SweepAction::SchedulePoll`] / [`SweepAction::CancelPoll`]: arm or disarm the
//!   poll-hold timer, which fires [`SweepMachine::on_poll_timer`]
//! - [`SweepAction::Notify`]: forward a [`SweepNotification`] to the caller
//!
//! Only the command the machine last sent is tracked. Resolutions of any other
//! command (direct API calls, or a command that was in flight when a cancellation
//! arrived) are ignored here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::{AppResult, VnaError};
use crate::protocol::command::{
    Channel, Command, CommandKind, InstrumentParameters, MeasurementSetup,
};
use crate::protocol::decoder::{Response, ScaleReference};
use crate::protocol::dispatcher::CommandId;
use crate::sweep::state::{SweepMode, SweepState};

/// Delay between completion polls while the instrument sweeps.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Data of one completed sweep.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SweepResult {
    /// Stimulus frequencies in Hz
    pub stimulus: Vec<f32>,
    /// Channel 1 trace, one value per stimulus point
    pub channel1: Vec<f32>,
    /// Channel 2 trace, one value per stimulus point
    pub channel2: Vec<f32>,
    /// Autoscale result of channel 1
    pub channel1_scale: ScaleReference,
    /// Autoscale result of channel 2
    pub channel2_scale: ScaleReference,
    /// When the result was published
    pub completed_at: Option<DateTime<Utc>>,
}

impl SweepResult {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.stimulus.len()
    }

    /// Whether the result holds no points.
    pub fn is_empty(&self) -> bool {
        self.stimulus.is_empty()
    }

    /// `(frequency, channel 1, channel 2)` per point.
    pub fn rows(&self) -> impl Iterator<Item = (f32, f32, f32)> + '_ {
        self.stimulus
            .iter()
            .zip(&self.channel1)
            .zip(&self.channel2)
            .map(|((f, c1), c2)| (*f, *c1, *c2))
    }

    fn clear(&mut self) {
        self.stimulus.clear();
        self.channel1.clear();
        self.channel2.clear();
        self.channel1_scale = ScaleReference::default();
        self.channel2_scale = ScaleReference::default();
        self.completed_at = None;
    }
}

/// Notification for the caller.
#[derive(Debug, Clone)]
pub enum SweepNotification {
    /// The sequencer entered a new state
    StateChanged(SweepState),
    /// A sweep finished; the result is a snapshot owned by the receiver
    Completed(SweepResult),
    /// A cancellation was acknowledged by the instrument
    Cancelled,
    /// Initialization was acknowledged by the instrument
    Initialized,
    /// The sequence was abandoned; the machine is back in Idle
    Aborted {
        /// State the failure occurred in
        state: SweepState,
        /// Cause
        error: VnaError,
    },
}

/// Effect requested from the owner of the machine.
#[derive(Debug, Clone)]
pub enum SweepAction {
    /// Enqueue the command and [`SweepMachine::bind`] its id
    Send(Command),
    /// Call [`SweepMachine::on_poll_timer`] after the delay
    SchedulePoll(Duration),
    /// Disarm a scheduled poll
    CancelPoll,
    /// Forward to the caller
    Notify(SweepNotification),
}

/// Sweep and initialization sequencer.
#[derive(Debug)]
pub struct SweepMachine {
    state: SweepState,
    mode: SweepMode,
    parameters: InstrumentParameters,
    /// Dispatcher id of the command the current state is waiting on.
    awaiting: Option<CommandId>,
    poll_pending: bool,
    poll_interval: Duration,
    polls: u32,
    result: SweepResult,
}

impl Default for SweepMachine {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl SweepMachine {
    /// Create an idle machine with default parameters.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: SweepState::Idle,
            mode: SweepMode::Single,
            parameters: InstrumentParameters::default(),
            awaiting: None,
            poll_pending: false,
            poll_interval,
            polls: 0,
            result: SweepResult::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Current sweep mode.
    pub fn mode(&self) -> SweepMode {
        self.mode
    }

    /// Parameters the next sweep will apply.
    pub fn parameters(&self) -> &InstrumentParameters {
        &self.parameters
    }

    /// Dispatcher id the machine is waiting on.
    pub fn awaiting(&self) -> Option<CommandId> {
        self.awaiting
    }

    /// Whether a poll-hold timer is armed.
    pub fn poll_pending(&self) -> bool {
        self.poll_pending
    }

    /// Store the parameter snapshot for the next sweep.
    ///
    /// A sweep in progress keeps the snapshot it started with.
    pub fn configure(&mut self, parameters: InstrumentParameters) -> AppResult<()> {
        parameters.validate()?;
        debug!(?parameters, "Parameters updated");
        self.parameters = parameters;
        Ok(())
    }

    /// Record the dispatcher id of the command requested by the last [`SweepAction::Send`].
    pub fn bind(&mut self, id: CommandId) {
        trace!(id, state = %self.state, "Tracking command");
        self.awaiting = Some(id);
    }

    /// Apply a measurement function: `Idle -> Initialize -> Idle`.
    pub fn initialize(&mut self, setup: &MeasurementSetup) -> AppResult<Vec<SweepAction>> {
        if !self.state.can_begin() {
            return Err(VnaError::Busy(self.state));
        }
        let mut actions = Vec::new();
        self.transition(SweepState::Initialize, &mut actions);
        self.send(Command::initialize(setup), &mut actions);
        Ok(actions)
    }

    /// Begin a sweep with the stored parameters.
    pub fn start(&mut self, mode: SweepMode) -> AppResult<Vec<SweepAction>> {
        if !self.state.can_begin() {
            return Err(VnaError::Busy(self.state));
        }
        self.mode = mode;
        info!(?mode, "Sweep requested");
        let mut actions = Vec::new();
        self.enter(SweepState::UpdateParameters, &mut actions);
        Ok(actions)
    }

    /// Request cancellation; ignored in Idle, Stop and Hold.
    pub fn cancel(&mut self) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        if !self.state.can_cancel() {
            debug!(state = %self.state, "Cancel ignored");
            return actions;
        }
        info!(state = %self.state, "Cancelling sweep");
        self.enter(SweepState::Hold, &mut actions);
        actions
    }

    /// Let the current continuous sweep complete, then stop.
    pub fn finish_continuous(&mut self) {
        if self.mode == SweepMode::Continuous {
            debug!("Continuous sweep will stop after the current pass");
        }
        self.mode = SweepMode::Single;
    }

    /// The command with `id` resolved with `response`.
    pub fn on_response(
        &mut self,
        id: CommandId,
        kind: CommandKind,
        response: AppResult<Response>,
    ) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        if self.awaiting != Some(id) {
            trace!(id, %kind, "Response not for the sequencer");
            return actions;
        }
        self.awaiting = None;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                self.abort(error, &mut actions);
                return actions;
            }
        };

        match (self.state, response) {
            (SweepState::Initialize, Response::Acknowledged) => {
                actions.push(SweepAction::Notify(SweepNotification::Initialized));
                self.enter(SweepState::Idle, &mut actions);
            }
            (SweepState::UpdateParameters, Response::Acknowledged) => {
                self.enter(SweepState::StartSweep, &mut actions);
            }
            (SweepState::StartSweep, Response::Acknowledged) => {
                self.enter(SweepState::PollHold, &mut actions);
            }
            (SweepState::PollHold, Response::SweepDone(false)) => {
                if self.poll_interval.is_zero() {
                    self.poll(&mut actions);
                } else {
                    self.poll_pending = true;
                    actions.push(SweepAction::SchedulePoll(self.poll_interval));
                }
            }
            (SweepState::PollHold, Response::SweepDone(true)) => {
                debug!(polls = self.polls, "Sweep finished on instrument");
                self.enter(SweepState::FitTrace, &mut actions);
            }
            (SweepState::FitTrace, Response::Autoscale { channel1, channel2 }) => {
                self.result.channel1_scale = channel1;
                self.result.channel2_scale = channel2;
                self.enter(SweepState::GetStimulus, &mut actions);
            }
            (SweepState::GetStimulus, Response::Stimulus(values)) => {
                self.result.stimulus.extend_from_slice(&values);
                self.enter(SweepState::GetChannel1, &mut actions);
            }
            (SweepState::GetChannel1, Response::Trace { values, .. }) => {
                self.result.channel1.extend_from_slice(&values);
                self.enter(SweepState::GetChannel2, &mut actions);
            }
            (SweepState::GetChannel2, Response::Trace { values, .. }) => {
                self.result.channel2.extend_from_slice(&values);
                let (stimulus, channel1, channel2) = (
                    self.result.stimulus.len(),
                    self.result.channel1.len(),
                    self.result.channel2.len(),
                );
                if stimulus != channel1 || stimulus != channel2 {
                    self.abort(
                        VnaError::LengthMismatch {
                            stimulus,
                            channel1,
                            channel2,
                        },
                        &mut actions,
                    );
                } else {
                    self.enter(SweepState::Stop, &mut actions);
                }
            }
            (SweepState::Hold, Response::Acknowledged) => {
                self.enter(SweepState::Idle, &mut actions);
                actions.push(SweepAction::Notify(SweepNotification::Cancelled));
            }
            (state, other) => {
                self.abort(
                    VnaError::Decode {
                        kind,
                        reason: format!("unexpected response {other:?} in state {state}"),
                    },
                    &mut actions,
                );
            }
        }
        actions
    }

    /// The command with `id` was dropped without a usable response.
    pub fn on_failure(&mut self, id: CommandId, error: VnaError) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        if self.awaiting != Some(id) {
            return actions;
        }
        self.awaiting = None;
        self.abort(error, &mut actions);
        actions
    }

    /// The poll-hold timer fired.
    pub fn on_poll_timer(&mut self) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        if self.state == SweepState::PollHold && self.poll_pending {
            self.poll_pending = false;
            self.poll(&mut actions);
        }
        actions
    }

    /// Abandon any sequence in progress, e.g. after the link dropped.
    pub fn reset(&mut self, error: VnaError) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        self.awaiting = None;
        if self.state != SweepState::Idle {
            self.abort(error, &mut actions);
        }
        actions
    }

    fn abort(&mut self, error: VnaError, actions: &mut Vec<SweepAction>) {
        let state = self.state;
        warn!(%state, %error, "Sweep sequence aborted");
        self.enter(SweepState::Idle, actions);
        actions.push(SweepAction::Notify(SweepNotification::Aborted { state, error }));
    }

    fn send(&mut self, command: Command, actions: &mut Vec<SweepAction>) {
        self.awaiting = None;
        actions.push(SweepAction::Send(command));
    }

    fn poll(&mut self, actions: &mut Vec<SweepAction>) {
        self.polls += 1;
        trace!(polls = self.polls, "Polling sweep completion");
        self.send(Command::poll_hold(), actions);
    }

    fn transition(&mut self, next: SweepState, actions: &mut Vec<SweepAction>) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Sweep state transition");
            self.state = next;
            actions.push(SweepAction::Notify(SweepNotification::StateChanged(next)));
        }
    }

    /// Transition to `next` and run its entry action.
    fn enter(&mut self, next: SweepState, actions: &mut Vec<SweepAction>) {
        if self.poll_pending {
            self.poll_pending = false;
            actions.push(SweepAction::CancelPoll);
        }
        self.transition(next, actions);

        match next {
            SweepState::Idle => {
                self.awaiting = None;
            }
            SweepState::Initialize => {}
            SweepState::UpdateParameters => {
                let command = Command::set_parameters(&self.parameters);
                self.send(command, actions);
            }
            SweepState::StartSweep => {
                self.result.clear();
                self.polls = 0;
                let command = Command::start_sweep(&self.parameters);
                self.send(command, actions);
            }
            SweepState::PollHold => self.poll(actions),
            SweepState::FitTrace => self.send(Command::fit_trace(), actions),
            SweepState::GetStimulus => self.send(Command::get_stimulus(), actions),
            SweepState::GetChannel1 => {
                self.send(Command::get_channel_data(Channel::One), actions)
            }
            SweepState::GetChannel2 => {
                self.send(Command::get_channel_data(Channel::Two), actions)
            }
            SweepState::Stop => {
                self.result.completed_at = Some(Utc::now());
                info!(points = self.result.len(), "Sweep complete");
                actions.push(SweepAction::Notify(SweepNotification::Completed(
                    self.result.clone(),
                )));
                match self.mode {
                    SweepMode::Continuous => self.enter(SweepState::StartSweep, actions),
                    SweepMode::Single => self.enter(SweepState::Idle, actions),
                }
            }
            SweepState::Hold => self.send(Command::cancel_sweep(), actions),
        }
    }
}
