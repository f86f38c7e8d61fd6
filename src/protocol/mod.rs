//! HP 8751A command/response protocol.
//!
//! - [`command`]: command kinds, command text and instrument settings
//! - [`framer`]: cutting complete replies out of the byte stream
//! - [`decoder`]: typed decoding of framed replies
//! - [`dispatcher`]: FIFO queue with a single outstanding command and a response deadline

pub mod command;
pub mod decoder;
pub mod dispatcher;
pub mod framer;

pub use command::{
    CalibrationStep, Channel, Command, CommandKind, InstrumentParameters, MeasurementSetup,
    ResponseMode,
};
pub use decoder::{Response, ScaleReference};
pub use dispatcher::{CommandId, DispatchEvent, Dispatcher};
pub use framer::{FramingRule, ResponseFramer};
