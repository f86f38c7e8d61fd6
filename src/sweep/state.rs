//! Sweep sequencer states.

use serde::{Deserialize, Serialize};

/// Current step of the sweep sequencer.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> UpdateParameters ──> StartSweep ──> PollHold ──> FitTrace
///  ▲ ▲                                    ▲          │  ▲            │
///  │ │                                    │          └──┘ "0"        ▼
///  │ │                                    │                     GetStimulus
///  │ │                      (continuous)  │                          │
///  │ └────────────────────── Stop <── GetChannel2 <── GetChannel1 <──┘
///  │
///  ├── Hold <── cancel (any state except Idle/Stop)
///  └── Initialize <── init
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SweepState {
    /// Nothing in progress
    Idle,
    /// Applying the measurement function
    Initialize,
    /// Applying stimulus and receiver settings
    UpdateParameters,
    /// Triggering the sweep
    StartSweep,
    /// Waiting for the instrument to report the sweep finished
    PollHold,
    /// Autoscaling both channels
    FitTrace,
    /// Reading stimulus frequencies
    GetStimulus,
    /// Reading channel 1 trace
    GetChannel1,
    /// Reading channel 2 trace
    GetChannel2,
    /// Publishing the result
    Stop,
    /// Cancellation sent, waiting for the acknowledgement
    Hold,
}

impl std::fmt::Display for SweepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepState::Idle => write!(f, "Idle"),
            SweepState::Initialize => write!(f, "Initialize"),
            SweepState::UpdateParameters => write!(f, "UpdateParameters"),
            SweepState::StartSweep => write!(f, "StartSweep"),
            SweepState::PollHold => write!(f, "PollHold"),
            SweepState::FitTrace => write!(f, "FitTrace"),
            SweepState::GetStimulus => write!(f, "GetStimulus"),
            SweepState::GetChannel1 => write!(f, "GetChannel1"),
            SweepState::GetChannel2 => write!(f, "GetChannel2"),
            SweepState::Stop => write!(f, "Stop"),
            SweepState::Hold => write!(f, "Hold"),
        }
    }
}

impl SweepState {
    /// Check if a new sweep or initialization may begin.
    pub fn can_begin(&self) -> bool {
        matches!(self, SweepState::Idle)
    }

    /// Check if the state accepts a cancellation request.
    pub fn can_cancel(&self) -> bool {
        !matches!(self, SweepState::Idle | SweepState::Stop | SweepState::Hold)
    }

    /// Check if the state belongs to the sweep sequence proper.
    pub fn is_sweeping(&self) -> bool {
        matches!(
            self,
            SweepState::UpdateParameters
                | SweepState::StartSweep
                | SweepState::PollHold
                | SweepState::FitTrace
                | SweepState::GetStimulus
                | SweepState::GetChannel1
                | SweepState::GetChannel2
                | SweepState::Stop
        )
    }
}

/// Whether a finished sweep re-triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    /// One sweep, then Idle
    #[default]
    Single,
    /// Loop back to StartSweep after every result until finished by the caller
    Continuous,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idle_can_begin() {
        assert!(SweepState::Idle.can_begin());
        assert!(!SweepState::PollHold.can_begin());
        assert!(!SweepState::Hold.can_begin());
    }

    #[test]
    fn cancel_reachable_from_active_states() {
        for state in [
            SweepState::Initialize,
            SweepState::UpdateParameters,
            SweepState::StartSweep,
            SweepState::PollHold,
            SweepState::FitTrace,
            SweepState::GetStimulus,
            SweepState::GetChannel1,
            SweepState::GetChannel2,
        ] {
            assert!(state.can_cancel(), "{state}");
        }
        assert!(!SweepState::Idle.can_cancel());
        assert!(!SweepState::Stop.can_cancel());
        assert!(!SweepState::Hold.can_cancel());
    }

    #[test]
    fn initialize_is_not_a_sweep() {
        assert!(!SweepState::Initialize.is_sweeping());
        assert!(SweepState::GetChannel2.is_sweeping());
        assert_eq!(SweepState::GetChannel1.to_string(), "GetChannel1");
    }
}
