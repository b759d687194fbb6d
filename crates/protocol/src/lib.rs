//! The serial protocol between the host and the plotter firmware.
//!
//! The protocol is line-oriented and strictly half-duplex: the host sends
//! one command per line, and the device answers each command with exactly
//! one response before reading the next line. A response is either a single
//! `OK` line (possibly followed by a payload on the same line), an optional
//! block of informational lines terminated by `OK`, or a single
//! `ERROR: <message>` line. The device never sends anything unsolicited.

#![cfg_attr(not(feature = "std"), no_std)]

use core::fmt;

use serde::{Deserialize, Serialize};

pub use rotoplot_geom::Position;

#[cfg(feature = "std")]
mod reply;

#[cfg(feature = "std")]
pub use reply::{Reply, ReplyError, ReplyReader};

/// The longest command line the firmware accepts, not counting the line
/// terminator.
pub const MAX_LINE_LEN: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cmd {
    /// Rotate to the home step count, then seek the home ADC value.
    Home,
    /// Rotate to an absolute stepper position, in microsteps.
    Rotate(i32),
    /// Move the linear actuator until the potentiometer reads the target.
    Linear(i32),
    /// Stop both axes.
    Stop,
    StopLinear,
    /// Drive the actuator outwards at full power, with no feedback.
    ExtendRaw,
    /// Drive the actuator inwards at full power, with no feedback.
    RetractRaw,
    GetPos,
    Status,
    DebugAdc,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    UnknownCommand,
    MissingArgument {
        cmd: &'static str,
        param: &'static str,
    },
}

impl Cmd {
    pub fn name(&self) -> &'static str {
        match self {
            Cmd::Home => "HOME",
            Cmd::Rotate(_) => "ROTATE",
            Cmd::Linear(_) => "LINEAR",
            Cmd::Stop => "STOP",
            Cmd::StopLinear => "STOP_LINEAR",
            Cmd::ExtendRaw => "EXTEND_RAW",
            Cmd::RetractRaw => "RETRACT_RAW",
            Cmd::GetPos => "GET_POS",
            Cmd::Status => "STATUS",
            Cmd::DebugAdc => "DEBUG_ADC",
        }
    }

    /// Does this command wait for the hardware to move?
    pub fn is_motion(&self) -> bool {
        matches!(self, Cmd::Home | Cmd::Rotate(_) | Cmd::Linear(_))
    }

    /// Parses one line of input. The command name is case-insensitive, and
    /// any arguments after the ones the command needs are ignored.
    pub fn parse(line: &str) -> Result<Cmd, ParseError> {
        let mut tokens = line.split_ascii_whitespace();
        let name = tokens.next().ok_or(ParseError::Empty)?;

        let mut int_arg = |cmd, param| {
            tokens
                .next()
                .and_then(|t| t.parse::<i32>().ok())
                .ok_or(ParseError::MissingArgument { cmd, param })
        };

        let is = |s: &str| name.eq_ignore_ascii_case(s);
        let cmd = if is("HOME") {
            Cmd::Home
        } else if is("ROTATE") {
            Cmd::Rotate(int_arg("ROTATE", "steps")?)
        } else if is("LINEAR") {
            Cmd::Linear(int_arg("LINEAR", "target")?)
        } else if is("STOP") {
            Cmd::Stop
        } else if is("STOP_LINEAR") {
            Cmd::StopLinear
        } else if is("EXTEND_RAW") {
            Cmd::ExtendRaw
        } else if is("RETRACT_RAW") {
            Cmd::RetractRaw
        } else if is("GET_POS") {
            Cmd::GetPos
        } else if is("STATUS") {
            Cmd::Status
        } else if is("DEBUG_ADC") {
            Cmd::DebugAdc
        } else {
            return Err(ParseError::UnknownCommand);
        };
        Ok(cmd)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cmd::Rotate(steps) => write!(f, "ROTATE {steps}"),
            Cmd::Linear(target) => write!(f, "LINEAR {target}"),
            other => f.write_str(other.name()),
        }
    }
}

/// What an axis controller is doing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisState {
    Idle,
    Moving,
    Reached,
    TimedOut,
}

impl fmt::Display for AxisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AxisState::Idle => "IDLE",
            AxisState::Moving => "MOVING",
            AxisState::Reached => "REACHED",
            AxisState::TimedOut => "TIMEOUT",
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisStatus {
    pub position: i32,
    pub target: i32,
    pub state: AxisState,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub stepper: AxisStatus,
    pub linear: AxisStatus,
    pub adc_min: u16,
    pub adc_max: u16,
    pub adc_home: u16,
    pub home_steps: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Position(Position),
    Adc([u16; 4]),
    Status(Status),
}

/// Everything that can go wrong on the device.
///
/// The `Display` impl gives the message that follows `ERROR: ` on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceError {
    UnknownCommand,
    MissingArgument {
        cmd: &'static str,
        param: &'static str,
    },
    OutOfRange {
        target: i32,
        min: u16,
        max: u16,
    },
    RotateTimeout,
    LinearTimeout {
        adc: u16,
    },
    HomeRotateTimeout,
    HomeLinearTimeout {
        adc: u16,
    },
}

impl DeviceError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DeviceError::RotateTimeout
                | DeviceError::LinearTimeout { .. }
                | DeviceError::HomeRotateTimeout
                | DeviceError::HomeLinearTimeout { .. }
        )
    }
}

impl From<ParseError> for DeviceError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Empty | ParseError::UnknownCommand => DeviceError::UnknownCommand,
            ParseError::MissingArgument { cmd, param } => {
                DeviceError::MissingArgument { cmd, param }
            }
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::UnknownCommand => f.write_str("Unknown command"),
            DeviceError::MissingArgument { cmd, param } => {
                write!(f, "{cmd} requires {param} parameter")
            }
            DeviceError::OutOfRange { target, min, max } => {
                write!(f, "Target {target} out of range [{min}, {max}]")
            }
            DeviceError::RotateTimeout => f.write_str("ROTATE timeout - position not reached"),
            DeviceError::LinearTimeout { adc } => write!(f, "LINEAR timeout at ADC {adc}"),
            DeviceError::HomeRotateTimeout => {
                f.write_str("HOME rotate timeout - position not reached")
            }
            DeviceError::HomeLinearTimeout { adc } => {
                write!(f, "HOME linear timeout at ADC {adc}")
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok(Option<Payload>),
    Error(DeviceError),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(None)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

impl From<DeviceError> for Response {
    fn from(e: DeviceError) -> Self {
        Response::Error(e)
    }
}

/// Formats the response exactly as it goes on the wire, including the
/// final line break.
impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(None) => f.write_str("OK\n"),
            Response::Ok(Some(Payload::Position(p))) => {
                writeln!(f, "OK {} {}", p.angle_steps, p.linear_adc)
            }
            Response::Ok(Some(Payload::Adc([a0, a1, a2, a3]))) => {
                writeln!(f, "OK {a0} {a1} {a2} {a3}")
            }
            Response::Ok(Some(Payload::Status(s))) => {
                writeln!(
                    f,
                    "STEPPER {} {} {}",
                    s.stepper.position, s.stepper.target, s.stepper.state
                )?;
                writeln!(
                    f,
                    "LINEAR {} {} {}",
                    s.linear.position, s.linear.target, s.linear.state
                )?;
                writeln!(
                    f,
                    "CALIB {} {} {} {}",
                    s.adc_min, s.adc_max, s.adc_home, s.home_steps
                )?;
                f.write_str("OK\n")
            }
            Response::Error(e) => writeln!(f, "ERROR: {e}"),
        }
    }
}

/// Parses the payload of a `GET_POS` response (the part after `OK`).
pub fn parse_position(payload: &str) -> Option<Position> {
    let mut tokens = payload.split_ascii_whitespace();
    let angle_steps = tokens.next()?.parse().ok()?;
    let linear_adc = tokens.next()?.parse().ok()?;
    if tokens.next().is_some() {
        return None;
    }
    Some(Position {
        angle_steps,
        linear_adc,
    })
}

/// Parses the payload of a `DEBUG_ADC` response.
pub fn parse_adc(payload: &str) -> Option<[u16; 4]> {
    let mut ret = [0u16; 4];
    let mut tokens = payload.split_ascii_whitespace();
    for slot in &mut ret {
        *slot = tokens.next()?.parse().ok()?;
    }
    tokens.next().is_none().then_some(ret)
}
