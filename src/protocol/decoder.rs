//! Typed decoding of framed payloads.
//!
//! Pure functions from `(kind, payload, channel)` to a [`Response`]. Binary blocks are
//! IEEE-754 single precision, big-endian (`FORM2`): stimulus blocks hold one float per
//! point, trace blocks hold a value/second-slot pair per point of which only the value
//! is kept.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, VnaError};
use crate::protocol::command::{Channel, CommandKind};

/// Bytes per stimulus point.
pub const STIMULUS_STRIDE: usize = 4;

/// Bytes per trace point; the second 4-byte slot is discarded.
pub const TRACE_STRIDE: usize = 8;

/// Vertical scale and reference level of one channel after autoscale.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScaleReference {
    /// Units per division
    pub scale: f32,
    /// Reference line value
    pub reference: f32,
}

/// Decoded reply of one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `*IDN?` reply
    Identity(String),
    /// `*OPC?` returned `1`
    Acknowledged,
    /// `HOLD?`; `true` once the sweep has finished
    SweepDone(bool),
    /// Autoscale results of channel 1 and channel 2
    Autoscale {
        /// Channel 1
        channel1: ScaleReference,
        /// Channel 2
        channel2: ScaleReference,
    },
    /// Stimulus frequencies
    Stimulus(Vec<f32>),
    /// Formatted trace data of one channel
    Trace {
        /// Channel the data belongs to
        channel: Channel,
        /// One value per point
        values: Vec<f32>,
    },
}

/// Decode `payload` according to the command it answers.
pub fn decode(kind: CommandKind, payload: &[u8], channel: Channel) -> AppResult<Response> {
    match kind {
        CommandKind::Identify => decode_identity(payload).map(Response::Identity),
        CommandKind::PollHold => decode_hold(payload).map(Response::SweepDone),
        CommandKind::FitTrace => {
            let (channel1, channel2) = decode_autoscale(payload)?;
            Ok(Response::Autoscale { channel1, channel2 })
        }
        CommandKind::GetStimulus => decode_stimulus(payload).map(Response::Stimulus),
        CommandKind::GetChannelData => decode_trace(payload).map(|values| Response::Trace {
            channel,
            values,
        }),
        CommandKind::Init
        | CommandKind::SetParameters
        | CommandKind::StartSweep
        | CommandKind::CancelSweep
        | CommandKind::SetPhaseFormat
        | CommandKind::Calibrate => decode_ack(kind, payload).map(|_| Response::Acknowledged),
    }
}

fn ascii(kind: CommandKind, payload: &[u8]) -> AppResult<&str> {
    std::str::from_utf8(payload)
        .map(str::trim)
        .map_err(|e| VnaError::Decode {
            kind,
            reason: format!("not valid UTF-8: {e}"),
        })
}

/// Identification string with surrounding whitespace removed.
pub fn decode_identity(payload: &[u8]) -> AppResult<String> {
    ascii(CommandKind::Identify, payload).map(str::to_string)
}

/// `"0"` means the instrument is still sweeping; anything else means done.
pub fn decode_hold(payload: &[u8]) -> AppResult<bool> {
    Ok(ascii(CommandKind::PollHold, payload)? != "0")
}

fn decode_ack(kind: CommandKind, payload: &[u8]) -> AppResult<()> {
    operation_complete(kind, ascii(kind, payload)?)
}

/// `*OPC?` answers `1` once every preceding clause has executed.
fn operation_complete(kind: CommandKind, text: &str) -> AppResult<()> {
    match text.trim().parse::<i32>() {
        Ok(1) => Ok(()),
        _ => Err(VnaError::Decode {
            kind,
            reason: format!("expected operation-complete '1', got {text:?}"),
        }),
    }
}

/// Scale/reference pairs of channel 1 and channel 2 from `s1;r1;s2;r2;1`.
pub fn decode_autoscale(payload: &[u8]) -> AppResult<(ScaleReference, ScaleReference)> {
    let kind = CommandKind::FitTrace;
    let text = ascii(kind, payload)?;
    let fields: Vec<&str> = text.split(';').map(str::trim).collect();
    let &[s1, r1, s2, r2, opc] = fields.as_slice() else {
        return Err(VnaError::Decode {
            kind,
            reason: format!(
                "expected 4 scale/reference fields and the operation-complete flag, got {} fields",
                fields.len()
            ),
        });
    };
    operation_complete(kind, opc)?;

    let mut values = [0f32; 4];
    for (slot, field) in values.iter_mut().zip([s1, r1, s2, r2]) {
        *slot = field.parse::<f32>().map_err(|e| VnaError::Decode {
            kind,
            reason: format!("field {field:?} is not a number: {e}"),
        })?;
    }

    Ok((
        ScaleReference {
            scale: values[0],
            reference: values[1],
        },
        ScaleReference {
            scale: values[2],
            reference: values[3],
        },
    ))
}

/// One big-endian float per 4 bytes.
pub fn decode_stimulus(payload: &[u8]) -> AppResult<Vec<f32>> {
    decode_floats(CommandKind::GetStimulus, payload, STIMULUS_STRIDE)
}

/// First big-endian float of every 8-byte slot pair.
pub fn decode_trace(payload: &[u8]) -> AppResult<Vec<f32>> {
    decode_floats(CommandKind::GetChannelData, payload, TRACE_STRIDE)
}

fn decode_floats(kind: CommandKind, payload: &[u8], stride: usize) -> AppResult<Vec<f32>> {
    if payload.len() % stride != 0 {
        return Err(VnaError::Decode {
            kind,
            reason: format!(
                "block of {} bytes is not a multiple of {stride}",
                payload.len()
            ),
        });
    }
    Ok(payload
        .chunks_exact(stride)
        .map(|point| f32::from_be_bytes([point[0], point[1], point[2], point[3]]))
        .collect())
}
