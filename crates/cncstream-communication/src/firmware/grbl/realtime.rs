//! GRBL realtime command bytes
//!
//! Realtime commands are single bytes picked out of the serial stream by
//! the firmware as soon as they arrive. They never take receive buffer space
//! and are never acknowledged.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RealtimeCommand {
    Reset = 0x18,
    StatusReport = b'?',
    CycleStart = b'~',
    FeedHold = b'!',
    JogCancel = 0x85,
    FeedOverrideReset = 0x90,
    FeedOverridePlusTen = 0x91,
    FeedOverrideMinusTen = 0x92,
    FeedOverridePlusOne = 0x93,
    FeedOverrideMinusOne = 0x94,
    RapidOverrideReset = 0x95,
    RapidOverrideHalf = 0x96,
    RapidOverrideQuarter = 0x97,
    SpindleOverrideReset = 0x99,
    SpindleOverridePlusTen = 0x9A,
    SpindleOverrideMinusTen = 0x9B,
    SpindleOverridePlusOne = 0x9C,
    SpindleOverrideMinusOne = 0x9D,
    /// Only honoured in HOLD state
    ToggleSpindleStop = 0x9E,
}

const ALL: [RealtimeCommand; 19] = [
    RealtimeCommand::Reset,
    RealtimeCommand::StatusReport,
    RealtimeCommand::CycleStart,
    RealtimeCommand::FeedHold,
    RealtimeCommand::JogCancel,
    RealtimeCommand::FeedOverrideReset,
    RealtimeCommand::FeedOverridePlusTen,
    RealtimeCommand::FeedOverrideMinusTen,
    RealtimeCommand::FeedOverridePlusOne,
    RealtimeCommand::FeedOverrideMinusOne,
    RealtimeCommand::RapidOverrideReset,
    RealtimeCommand::RapidOverrideHalf,
    RealtimeCommand::RapidOverrideQuarter,
    RealtimeCommand::SpindleOverrideReset,
    RealtimeCommand::SpindleOverridePlusTen,
    RealtimeCommand::SpindleOverrideMinusTen,
    RealtimeCommand::SpindleOverridePlusOne,
    RealtimeCommand::SpindleOverrideMinusOne,
    RealtimeCommand::ToggleSpindleStop,
];

/// Lowest override percentage GRBL accepts
pub const MIN_OVERRIDE: u16 = 10;
/// Highest override percentage GRBL accepts
pub const MAX_OVERRIDE: u16 = 200;

impl RealtimeCommand {
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        ALL.iter().copied().find(|c| c.byte() == byte)
    }

    /// Rapid override command for a percentage (100, 50 or 25)
    pub fn rapid_override(percent: u16) -> Self {
        match percent {
            p if p >= 100 => Self::RapidOverrideReset,
            p if p >= 50 => Self::RapidOverrideHalf,
            _ => Self::RapidOverrideQuarter,
        }
    }
}

/// Feed or spindle override channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideChannel {
    Feed,
    Spindle,
}

impl OverrideChannel {
    fn commands(self) -> [RealtimeCommand; 5] {
        use RealtimeCommand::*;
        match self {
            OverrideChannel::Feed => [
                FeedOverrideReset,
                FeedOverridePlusTen,
                FeedOverrideMinusTen,
                FeedOverridePlusOne,
                FeedOverrideMinusOne,
            ],
            OverrideChannel::Spindle => [
                SpindleOverrideReset,
                SpindleOverridePlusTen,
                SpindleOverrideMinusTen,
                SpindleOverridePlusOne,
                SpindleOverrideMinusOne,
            ],
        }
    }
}

/// Coarse (10%) and fine (1%) step counts that reach `delta` in fewest bytes
fn steps(delta: i32) -> (i32, i32) {
    let low = delta.div_euclid(10);
    [low, low + 1]
        .into_iter()
        .map(|coarse| (coarse, delta - coarse * 10))
        .min_by_key(|(coarse, fine)| coarse.abs() + fine.abs())
        .unwrap_or((0, delta))
}

fn emit(channel: OverrideChannel, coarse: i32, fine: i32, out: &mut Vec<RealtimeCommand>) {
    let [_, plus_ten, minus_ten, plus_one, minus_one] = channel.commands();
    let coarse_cmd = if coarse >= 0 { plus_ten } else { minus_ten };
    let fine_cmd = if fine >= 0 { plus_one } else { minus_one };
    out.extend(std::iter::repeat(coarse_cmd).take(coarse.unsigned_abs() as usize));
    out.extend(std::iter::repeat(fine_cmd).take(fine.unsigned_abs() as usize));
}

/// Shortest byte sequence moving an override from `current` to `target`
///
/// The target is clamped to the firmware range. Starting with a reset to
/// 100% is used when that is shorter than stepping from the current value.
pub fn override_sequence(channel: OverrideChannel, current: u16, target: u16) -> Vec<RealtimeCommand> {
    let target = i32::from(target.clamp(MIN_OVERRIDE, MAX_OVERRIDE));
    let current = i32::from(current);

    let (dc, df) = steps(target - current);
    let (rc, rf) = steps(target - 100);
    let direct_cost = dc.abs() + df.abs();
    let reset_cost = 1 + rc.abs() + rf.abs();

    let mut out = Vec::new();
    if reset_cost < direct_cost {
        out.push(channel.commands()[0]);
        emit(channel, rc, rf, &mut out);
    } else {
        emit(channel, dc, df, &mut out);
    }
    out
}
