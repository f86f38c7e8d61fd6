//! Instrument commands and command-string construction.
//!
//! Every unit of work sent to the HP 8751A is a [`Command`]: the ASCII text written to
//! the bus, the [`CommandKind`] that selects framing and decoding of the reply, the
//! [`ResponseMode`] and an optional [`Channel`] tag that is carried through to the
//! decoded response.
//!
//! Commands are `;`-separated clause lists. Acknowledged commands get the
//! operation-complete query `*OPC?` appended, so every enqueued command produces
//! exactly one terminating response:
//!
//! ```text
//! STAR 10;STOP 1000000;POIN 201;POWE -20;*OPC?
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppResult, VnaError};
use crate::protocol::framer::FramingRule;

/// Operation-complete query appended to acknowledged commands.
pub const OPC_QUERY: &str = "*OPC?";

/// Highest stop frequency the analyzer accepts (500 MHz).
pub const MAX_FREQUENCY_HZ: u32 = 500_000_000;

/// Valid range of sweep points.
pub const POINTS_RANGE: std::ops::RangeInclusive<u16> = 3..=1601;

/// Closed set of command identifiers.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Identify,
    Init,
    SetParameters,
    StartSweep,
    CancelSweep,
    PollHold,
    FitTrace,
    GetStimulus,
    GetChannelData,
    SetPhaseFormat,
    Calibrate,
}

impl CommandKind {
    /// Framing rule the reply to this command follows.
    pub fn framing_rule(self) -> FramingRule {
        match self {
            CommandKind::GetStimulus | CommandKind::GetChannelData => FramingRule::Block,
            CommandKind::FitTrace => FramingRule::MultiPart,
            _ => FramingRule::Line,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Identify => "IDENTIFY",
            CommandKind::Init => "INIT",
            CommandKind::SetParameters => "SET_PARAMETERS",
            CommandKind::StartSweep => "START_SWEEP",
            CommandKind::CancelSweep => "CANCEL_SWEEP",
            CommandKind::PollHold => "POLL_HOLD",
            CommandKind::FitTrace => "FIT_TRACE",
            CommandKind::GetStimulus => "GET_STIMULUS",
            CommandKind::GetChannelData => "GET_CHANNEL_DATA",
            CommandKind::SetPhaseFormat => "SET_PHASE_FORMAT",
            CommandKind::Calibrate => "CALIBRATE",
        };
        f.write_str(name)
    }
}

/// How the instrument answers a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseMode {
    /// The command text itself is a query; its reply is the payload.
    Query,
    /// Fire-and-forget settings followed by `*OPC?`; the reply is the acknowledgement.
    Acknowledged,
}

/// Channel selector carried from a command to its response.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Channel {
    #[default]
    None,
    One,
    Two,
}

impl Channel {
    /// Zero-based index as used on the original wire API (0 or 1).
    pub fn index(self) -> Option<usize> {
        match self {
            Channel::None => None,
            Channel::One => Some(0),
            Channel::Two => Some(1),
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Channel::Two => "CHAN2",
            _ => "CHAN1",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::None => f.write_str("-"),
            Channel::One => f.write_str("1"),
            Channel::Two => f.write_str("2"),
        }
    }
}

/// A unit of work sent to the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Identifier that selects framing and decoding of the reply.
    pub kind: CommandKind,
    /// Full ASCII text written to the bus, including any `*OPC?` suffix.
    pub text: String,
    /// Whether the reply is a query payload or an acknowledgement.
    pub mode: ResponseMode,
    /// Channel the reply is attributed to.
    pub channel: Channel,
}

impl Command {
    /// Command whose text is itself a query.
    pub fn query(kind: CommandKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            mode: ResponseMode::Query,
            channel: Channel::None,
        }
    }

    /// Settings command acknowledged by a trailing operation-complete query.
    pub fn acknowledged(kind: CommandKind, text: impl AsRef<str>) -> Self {
        let text = text.as_ref();
        let text = if text.is_empty() {
            OPC_QUERY.to_string()
        } else {
            format!("{text};{OPC_QUERY}")
        };
        Self {
            kind,
            text,
            mode: ResponseMode::Acknowledged,
            channel: Channel::None,
        }
    }

    /// Attribute the reply to `channel`.
    pub fn on_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Framing rule for the reply.
    pub fn framing_rule(&self) -> FramingRule {
        self.kind.framing_rule()
    }

    /// `*IDN?`
    pub fn identify() -> Self {
        Self::query(CommandKind::Identify, "*IDN?")
    }

    /// Put the instrument into a known measurement configuration.
    pub fn initialize(setup: &MeasurementSetup) -> Self {
        let mut clauses = vec![
            "HOLD".to_string(),
            "DUACON".to_string(),
            "SPLDON".to_string(),
            "LOGFREQ".to_string(),
            "FORM2".to_string(),
        ];
        for (channel, cfg) in [(Channel::One, &setup.channel1), (Channel::Two, &setup.channel2)] {
            clauses.push(channel.mnemonic().to_string());
            clauses.push(cfg.input.mnemonic().to_string());
            clauses.push(cfg.conversion.mnemonic().to_string());
            clauses.push(cfg.format.mnemonic().to_string());
        }
        clauses.push(Channel::One.mnemonic().to_string());
        Self::acknowledged(CommandKind::Init, clauses.join(";"))
    }

    /// Stimulus, receiver and phase format settings in one acknowledged command.
    pub fn set_parameters(params: &InstrumentParameters) -> Self {
        let mut clauses = vec![
            format!("STAR {}", params.start_hz),
            format!("STOP {}", params.stop_hz),
            format!("POIN {}", params.points),
            format!("POWE {}", params.power_dbm),
        ];
        if params.clear_power_trip {
            clauses.push("CLEPTRIP".to_string());
        }
        clauses.push(attenuator_clause("ATTIR", params.attenuator_r));
        clauses.push(attenuator_clause("ATTIA", params.attenuator_a));
        clauses.push(params.if_bandwidth.clause().to_string());
        clauses.push(Channel::Two.mnemonic().to_string());
        clauses.push(phase_format_clause(params.unwrap_phase).to_string());
        clauses.push(Channel::One.mnemonic().to_string());
        Self::acknowledged(CommandKind::SetParameters, clauses.join(";"))
    }

    /// Trigger a sweep; with averaging enabled the instrument runs `averaging_factor` groups.
    pub fn start_sweep(params: &InstrumentParameters) -> Self {
        let text = if params.averaging {
            let n = params.averaging_factor;
            format!("CHAN1;AVERON;AVERFACT {n};CHAN2;AVERON;AVERFACT {n};NUMG {n}")
        } else {
            "CHAN1;AVEROFF;CHAN2;AVEROFF;SING".to_string()
        };
        Self::acknowledged(CommandKind::StartSweep, text)
    }

    /// `HOLD;*OPC?`
    pub fn cancel_sweep() -> Self {
        Self::acknowledged(CommandKind::CancelSweep, "HOLD")
    }

    /// `HOLD?`; `0` while the instrument is still sweeping.
    pub fn poll_hold() -> Self {
        Self::query(CommandKind::PollHold, "HOLD?")
    }

    /// Autoscale both channels and read back scale and reference value of each.
    pub fn fit_trace() -> Self {
        Self::acknowledged(
            CommandKind::FitTrace,
            "CHAN1;AUTO;SCAL?;REFV?;CHAN2;AUTO;SCAL?;REFV?;CHAN1",
        )
    }

    /// Stimulus frequencies as a `#6` float block.
    pub fn get_stimulus() -> Self {
        Self::query(CommandKind::GetStimulus, "OUTPSTIM?")
    }

    /// Formatted trace data of `channel` as a `#6` float block.
    pub fn get_channel_data(channel: Channel) -> Self {
        let channel = if channel == Channel::Two {
            Channel::Two
        } else {
            Channel::One
        };
        Self::query(
            CommandKind::GetChannelData,
            format!("{};OUTPFORM?", channel.mnemonic()),
        )
        .on_channel(channel)
    }

    /// Phase display format of `channel`.
    pub fn set_phase_format(channel: Channel, unwrap_phase: bool) -> Self {
        let channel = if channel == Channel::Two {
            Channel::Two
        } else {
            Channel::One
        };
        Self::acknowledged(
            CommandKind::SetPhaseFormat,
            format!("{};{}", channel.mnemonic(), phase_format_clause(unwrap_phase)),
        )
        .on_channel(channel)
    }

    /// One step of a one-port calibration.
    pub fn calibrate(step: CalibrationStep) -> Self {
        Self::acknowledged(CommandKind::Calibrate, step.mnemonic())
    }
}

fn attenuator_clause(prefix: &str, enabled: bool) -> String {
    if enabled {
        format!("{prefix}20DB")
    } else {
        format!("{prefix}0DB")
    }
}

fn phase_format_clause(unwrap_phase: bool) -> &'static str {
    if unwrap_phase {
        "FMT EXPP"
    } else {
        "FMT PHAS"
    }
}

/// Receiver IF bandwidth.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IfBandwidth {
    #[serde(rename = "2hz")]
    Hz2,
    #[default]
    #[serde(rename = "20hz")]
    Hz20,
    #[serde(rename = "200hz")]
    Hz200,
    #[serde(rename = "1khz")]
    KHz1,
    #[serde(rename = "4khz")]
    KHz4,
    #[serde(rename = "auto")]
    Auto,
}

impl IfBandwidth {
    fn clause(self) -> &'static str {
        match self {
            IfBandwidth::Hz2 => "IFBW 2",
            IfBandwidth::Hz20 => "IFBW 20",
            IfBandwidth::Hz200 => "IFBW 200",
            IfBandwidth::KHz1 => "IFBW 1000",
            IfBandwidth::KHz4 => "IFBW 4000",
            IfBandwidth::Auto => "IFBWAUTO",
        }
    }
}

/// Immutable snapshot of the sweep settings, set by the caller before a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentParameters {
    /// Start frequency in Hz
    pub start_hz: u32,
    /// Stop frequency in Hz
    pub stop_hz: u32,
    /// Number of points per sweep
    pub points: u16,
    /// Source power in dBm
    pub power_dbm: i16,
    /// Clear a tripped source power protection before sweeping
    pub clear_power_trip: bool,
    /// 20 dB attenuator on input R
    pub attenuator_r: bool,
    /// 20 dB attenuator on input A
    pub attenuator_a: bool,
    /// Receiver bandwidth
    pub if_bandwidth: IfBandwidth,
    /// Expanded (unwrapped) phase on channel 2
    pub unwrap_phase: bool,
    /// Sweep averaging
    pub averaging: bool,
    /// Averaging factor, also the number of sweep groups
    pub averaging_factor: u16,
}

impl Default for InstrumentParameters {
    fn default() -> Self {
        Self {
            start_hz: 10,
            stop_hz: 1_000_000,
            points: 201,
            power_dbm: -20,
            clear_power_trip: true,
            attenuator_r: true,
            attenuator_a: true,
            if_bandwidth: IfBandwidth::Hz20,
            unwrap_phase: false,
            averaging: false,
            averaging_factor: 1,
        }
    }
}

impl InstrumentParameters {
    /// Reject settings the instrument would refuse or silently clamp.
    pub fn validate(&self) -> AppResult<()> {
        if self.start_hz >= self.stop_hz {
            return Err(VnaError::InvalidParameter(format!(
                "start frequency {} Hz must be below stop frequency {} Hz",
                self.start_hz, self.stop_hz
            )));
        }
        if self.stop_hz > MAX_FREQUENCY_HZ {
            return Err(VnaError::InvalidParameter(format!(
                "stop frequency {} Hz exceeds {} Hz",
                self.stop_hz, MAX_FREQUENCY_HZ
            )));
        }
        if !POINTS_RANGE.contains(&self.points) {
            return Err(VnaError::InvalidParameter(format!(
                "{} points outside {}..={}",
                self.points,
                POINTS_RANGE.start(),
                POINTS_RANGE.end()
            )));
        }
        if self.averaging && self.averaging_factor == 0 {
            return Err(VnaError::InvalidParameter(
                "averaging factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Receiver input of a channel.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputPort {
    AR,
    BR,
    AB,
    A,
    B,
    R,
}

impl InputPort {
    fn mnemonic(self) -> &'static str {
        match self {
            InputPort::AR => "AR",
            InputPort::BR => "BR",
            InputPort::AB => "AB",
            InputPort::A => "MEASA",
            InputPort::B => "MEASB",
            InputPort::R => "MEASR",
        }
    }
}

/// Parameter conversion applied to a channel.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conversion {
    Off,
    ZReflection,
    ZTransmission,
    YReflection,
    YTransmission,
}

impl Conversion {
    fn mnemonic(self) -> &'static str {
        match self {
            Conversion::Off => "CONVOFF",
            Conversion::ZReflection => "CONVZREF",
            Conversion::ZTransmission => "CONVZTRA",
            Conversion::YReflection => "CONVYREF",
            Conversion::YTransmission => "CONVYTRA",
        }
    }
}

/// Display format of a channel.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayFormat {
    LogMagnitude,
    Phase,
    ExpandedPhase,
    LinearMagnitude,
    Real,
    Imaginary,
}

impl DisplayFormat {
    fn mnemonic(self) -> &'static str {
        match self {
            DisplayFormat::LogMagnitude => "FMT LOGM",
            DisplayFormat::Phase => "FMT PHAS",
            DisplayFormat::ExpandedPhase => "FMT EXPP",
            DisplayFormat::LinearMagnitude => "FMT LINM",
            DisplayFormat::Real => "FMT REAL",
            DisplayFormat::Imaginary => "FMT IMAG",
        }
    }
}

/// Measurement function of one channel.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSetup {
    pub input: InputPort,
    pub conversion: Conversion,
    pub format: DisplayFormat,
}

/// Measurement function of both channels, applied during initialization.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementSetup {
    pub channel1: ChannelSetup,
    pub channel2: ChannelSetup,
}

impl MeasurementSetup {
    /// Loop gain: A/R magnitude in dB on channel 1, A/R phase on channel 2.
    pub fn transfer_function() -> Self {
        Self {
            channel1: ChannelSetup {
                input: InputPort::AR,
                conversion: Conversion::Off,
                format: DisplayFormat::LogMagnitude,
            },
            channel2: ChannelSetup {
                input: InputPort::AR,
                conversion: Conversion::Off,
                format: DisplayFormat::Phase,
            },
        }
    }

    /// Impedance: A/R converted to reflection admittance on channel 1, A/R phase on channel 2.
    pub fn impedance() -> Self {
        Self {
            channel1: ChannelSetup {
                input: InputPort::AR,
                conversion: Conversion::YReflection,
                format: DisplayFormat::LogMagnitude,
            },
            channel2: ChannelSetup {
                input: InputPort::AR,
                conversion: Conversion::Off,
                format: DisplayFormat::Phase,
            },
        }
    }
}

impl Default for MeasurementSetup {
    fn default() -> Self {
        Self::transfer_function()
    }
}

/// Steps of a one-port (S11) calibration.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStep {
    Begin,
    Open,
    Short,
    Load,
    Save,
}

impl CalibrationStep {
    fn mnemonic(self) -> &'static str {
        match self {
            CalibrationStep::Begin => "CALIS111",
            CalibrationStep::Open => "CLASS11A",
            CalibrationStep::Short => "CLASS11B",
            CalibrationStep::Load => "CLASS11C",
            CalibrationStep::Save => "SAV1",
        }
    }
}
