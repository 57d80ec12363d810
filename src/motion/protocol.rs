//! Text protocol of the motion controller.
//!
//! Commands are terminated by `;`. The controller answers every accepted
//! sub-command with a single `:`, preceded by the value for queries, and a `?`
//! for a rejected one. A caller therefore always knows how many colons to wait
//! for.

use super::MotorStatus;
use crate::error::{AppResult, BenchError};

/// Status bit: axis amplifier is off (inverted power flag).
pub const POWER_OFF_BIT: i64 = 0x10;
/// Status bit: axis is moving.
pub const IN_MOTION_BIT: i64 = 0x40;

/// Name of the controller-resident routine for trigger-synchronized moves.
pub const TRIGGERED_MOVE_ROUTINE: &str = "TRIGMV";

/// What a command's reply looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Exactly `n` colon bytes.
    Acks(usize),
    /// Values, ending when `acks` colons have been seen.
    Data {
        /// Colons that end the reply.
        acks: usize,
    },
}

impl ReplyShape {
    /// Colons that end the reply.
    pub fn acks(&self) -> usize {
        match *self {
            ReplyShape::Acks(n) => n,
            ReplyShape::Data { acks } => acks,
        }
    }
}

/// A command string together with the reply it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Wire text, `;`-terminated.
    pub text: String,
    /// Expected reply.
    pub reply: ReplyShape,
}

impl Command {
    /// Pair `text` with its reply shape.
    pub fn new(text: impl Into<String>, reply: ReplyShape) -> Self {
        Self {
            text: text.into(),
            reply,
        }
    }

    fn ack(text: impl Into<String>) -> Self {
        let text = text.into();
        let acks = text.matches(';').count();
        Self::new(text, ReplyShape::Acks(acks))
    }
}

/// Split a reply into value tokens.
pub fn tokenize(reply: &str) -> Vec<&str> {
    reply
        .split(|c: char| c == ':' || c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Fail if the controller rejected any sub-command.
pub fn check_rejected(command: &str, reply: &str) -> AppResult<()> {
    if reply.contains('?') {
        return Err(BenchError::Protocol(format!(
            "controller rejected '{}' (reply {:?})",
            command.trim(),
            reply
        )));
    }
    Ok(())
}

/// Parse exactly `expected` integer tokens.
pub fn parse_integers(reply: &str, expected: usize) -> AppResult<Vec<i64>> {
    let tokens = tokenize(reply);
    if tokens.len() != expected {
        return Err(BenchError::Protocol(format!(
            "expected {} values, got {} in {:?}",
            expected,
            tokens.len(),
            reply
        )));
    }
    tokens
        .into_iter()
        .map(|t| {
            // Position registers may come back as "1234.0000".
            t.parse::<i64>()
                .or_else(|_| t.parse::<f64>().map(|v| v.round() as i64))
                .map_err(|_| BenchError::Protocol(format!("not a number: {:?}", t)))
        })
        .collect()
}

/// Decode the three per-axis status words of a `TS` reply.
pub fn decode_status(words: &[i64]) -> AppResult<MotorStatus> {
    let [x, y, z] = words else {
        return Err(BenchError::Protocol(format!(
            "expected 3 status words, got {}",
            words.len()
        )));
    };
    let powered = |w: i64| w & POWER_OFF_BIT == 0;
    let moving = |w: i64| w & IN_MOTION_BIT != 0;
    Ok(MotorStatus {
        x_power: powered(*x),
        y_power: powered(*y),
        z_power: powered(*z),
        x_motion: moving(*x),
        y_motion: moving(*y),
        z_motion: moving(*z),
    })
}

/// `ST`: halt all axes.
pub fn stop() -> Command {
    Command::ack("ST;")
}

/// `XQ#`: run a stored routine.
pub fn execute(routine: &str) -> Command {
    Command::ack(format!("XQ#{};", routine))
}

/// `SP` for A and B, in steps/s.
pub fn xy_speed(steps: i64) -> Command {
    Command::ack(format!("SP {},{};", steps, steps))
}

/// `AC` for A and B.
pub fn xy_accel(steps: i64) -> Command {
    Command::ack(format!("AC {},{};", steps, steps))
}

/// `DC` for A and B.
pub fn xy_decel(steps: i64) -> Command {
    Command::ack(format!("DC {},{};", steps, steps))
}

/// `SPC=` for C.
pub fn z_speed(steps: i64) -> Command {
    Command::ack(format!("SPC={};", steps))
}

/// `ACC=` for C.
pub fn z_accel(steps: i64) -> Command {
    Command::ack(format!("ACC={};", steps))
}

/// `DCC=` for C.
pub fn z_decel(steps: i64) -> Command {
    Command::ack(format!("DCC={};", steps))
}

/// `HM` per axis, e.g. `HMA;HMB;`.
pub fn home(letters: &[char]) -> Command {
    Command::ack(letters.iter().map(|l| format!("HM{};", l)).collect::<String>())
}

/// `BG` with the axes run together, e.g. `BGAB;`.
pub fn begin(letters: &[char]) -> Command {
    Command::ack(format!("BG{};", letters.iter().collect::<String>()))
}

/// `DP` with a zero for each selected axis and an empty slot otherwise.
pub fn define_zero(x: bool, y: bool, z: bool) -> Command {
    let slot = |on: bool| if on { "0" } else { "" };
    let args = format!("{},{},{}", slot(x), slot(y), slot(z));
    Command::ack(format!("DP {};", args.trim_end_matches(',')))
}

/// `TS`: one status word per axis.
pub fn tell_status() -> Command {
    Command::new("TS;", ReplyShape::Data { acks: 1 })
}

/// Encoder counts for A and B, target position for C.
pub fn report_position() -> Command {
    Command::new("RPX;RPY;TPZ;", ReplyShape::Data { acks: 3 })
}

/// Absolute Z and relative XY in a single round-trip.
pub fn stage_move(z_abs: i64, dx: i64, dy: i64) -> Command {
    Command::ack(format!("PAC={};PR {},{};", z_abs, dx, dy))
}

/// `BGABC;`
pub fn begin_all() -> Command {
    begin(&['A', 'B', 'C'])
}
