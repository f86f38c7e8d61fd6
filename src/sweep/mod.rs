//! Sweep sequencing on top of the command dispatcher.

pub mod machine;
pub mod state;

pub use machine::{SweepAction, SweepMachine, SweepNotification, SweepResult};
pub use state::{SweepMode, SweepState};
