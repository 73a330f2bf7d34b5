//! GRBL Status Report Parsing
//!
//! Splits `<State|MPos:..|WPos:..|WCO:..|Bf:..|FS:..|Ov:..|Pn:..>` into its
//! fields. GRBL reports either `MPos` or `WPos` depending on `$10`, and
//! only sends `WCO` every few reports, so the missing coordinate space is
//! derived when the offset is known.

use cncstream_core::{BufferState, ControllerState, Overrides, Position, ProtocolError};
use serde::{Deserialize, Serialize};

/// One parsed status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// State word as sent, sub-state included (`Hold:0`)
    pub state_text: String,
    /// Parsed state, `None` for states this backend does not know
    pub state: Option<ControllerState>,
    /// Machine position
    pub mpos: Option<Position>,
    /// Work position
    pub wpos: Option<Position>,
    /// Work coordinate offset
    pub wco: Option<Position>,
    /// Planner blocks and receive bytes available
    pub buffer: Option<BufferState>,
    /// Override percentages
    pub overrides: Option<Overrides>,
    /// Feed rate
    pub feed_rate: Option<f64>,
    /// Spindle speed
    pub spindle_speed: Option<f64>,
    /// Input pins that are triggered (`Pn:XYZP`)
    pub pins: Option<String>,
}

/// Status report field parsing
pub struct StatusParser;

impl StatusParser {
    /// Parse the state word from `<Idle|...>` or `<Run|...>`
    pub fn parse_machine_state(status_line: &str) -> Option<String> {
        let body = Self::body(status_line)?;
        let state = body.split('|').next()?.trim();
        if state.is_empty() {
            None
        } else {
            Some(state.to_string())
        }
    }

    /// Parse a comma separated coordinate list (at least X, Y and Z)
    pub fn parse_position(pos_str: &str) -> Option<Position> {
        let coords: Option<Vec<f64>> = pos_str
            .split(',')
            .map(|s| s.trim().parse::<f64>().ok())
            .collect();
        let coords = coords?;
        if coords.len() < 3 {
            return None;
        }
        Some(Position::from_axes(&coords))
    }

    /// Parse `Bf:15,128` (GRBL 1.1) or `Buf:15:128`
    pub fn parse_buffer(buf_str: &str) -> Option<BufferState> {
        let mut parts = buf_str.split([',', ':']);
        let planner_blocks = parts.next()?.trim().parse::<u16>().ok()?;
        let rx_bytes = parts.next()?.trim().parse::<u16>().ok()?;
        Some(BufferState {
            planner_blocks,
            rx_bytes,
        })
    }

    /// Parse `Ov:feed,rapid,spindle`
    pub fn parse_overrides(ov_str: &str) -> Option<Overrides> {
        let parts: Vec<&str> = ov_str.split(',').collect();
        if parts.len() < 3 {
            return None;
        }
        Some(Overrides {
            feed: parts[0].trim().parse().ok()?,
            rapid: parts[1].trim().parse().ok()?,
            spindle: parts[2].trim().parse().ok()?,
        })
    }

    /// Value of a `Name:value` field
    pub fn extract_field<'a>(status_line: &'a str, field_prefix: &str) -> Option<&'a str> {
        Self::body(status_line)?
            .split('|')
            .skip(1)
            .find_map(|field| field.strip_prefix(field_prefix))
    }

    fn body(status_line: &str) -> Option<&str> {
        let line = status_line.trim();
        line.strip_prefix('<')?.strip_suffix('>')
    }

    /// Parse a complete status report
    ///
    /// Fails when the line is not a report or a known field is unreadable.
    pub fn parse_full(status_line: &str) -> Result<StatusReport, ProtocolError> {
        let malformed = |reason: &str| ProtocolError::MalformedResponse {
            line: status_line.to_string(),
            reason: reason.to_string(),
        };

        let state_text =
            Self::parse_machine_state(status_line).ok_or_else(|| malformed("missing state"))?;

        let position_field = |prefix: &str| -> Result<Option<Position>, ProtocolError> {
            match Self::extract_field(status_line, prefix) {
                Some(text) => Self::parse_position(text)
                    .map(Some)
                    .ok_or_else(|| malformed(&format!("bad {} field", prefix.trim_end_matches(':')))),
                None => Ok(None),
            }
        };

        let mut report = StatusReport {
            state: ControllerState::from_grbl(&state_text),
            state_text,
            mpos: position_field("MPos:")?,
            wpos: position_field("WPos:")?,
            wco: position_field("WCO:")?,
            buffer: Self::extract_field(status_line, "Bf:")
                .or_else(|| Self::extract_field(status_line, "Buf:"))
                .and_then(Self::parse_buffer),
            overrides: Self::extract_field(status_line, "Ov:").and_then(Self::parse_overrides),
            feed_rate: None,
            spindle_speed: None,
            pins: Self::extract_field(status_line, "Pn:").map(str::to_string),
        };

        if let Some(fs) = Self::extract_field(status_line, "FS:") {
            let mut parts = fs.split(',');
            report.feed_rate = parts.next().and_then(|s| s.trim().parse().ok());
            report.spindle_speed = parts.next().and_then(|s| s.trim().parse().ok());
        } else if let Some(f) = Self::extract_field(status_line, "F:") {
            report.feed_rate = f.trim().parse().ok();
        }

        if report.mpos.is_none() && report.wpos.is_none() {
            return Err(malformed("no position field"));
        }

        Ok(report)
    }

    /// WPos = MPos - WCO
    pub fn wpos_from_mpos_wco(mpos: &Position, wco: &Position) -> Position {
        mpos.subtract(wco)
    }

    /// MPos = WPos + WCO
    pub fn mpos_from_wpos_wco(wpos: &Position, wco: &Position) -> Position {
        wpos.add(wco)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grbl11_report() {
        let line = "<Run|MPos:10.000,5.000,-1.000|Bf:15,120|FS:500,12000|Ov:110,50,100|WCO:2.000,1.000,0.000>";
        let report = StatusParser::parse_full(line).unwrap();
        assert_eq!(report.state, Some(ControllerState::Run));
        assert_eq!(report.mpos, Some(Position::new(10.0, 5.0, -1.0)));
        assert_eq!(report.wco, Some(Position::new(2.0, 1.0, 0.0)));
        assert_eq!(report.feed_rate, Some(500.0));
        assert_eq!(report.spindle_speed, Some(12000.0));
        assert_eq!(
            report.buffer,
            Some(BufferState {
                planner_blocks: 15,
                rx_bytes: 120
            })
        );
        assert_eq!(report.overrides.unwrap().rapid, 50);
    }

    #[test]
    fn test_substate_and_pins() {
        let report = StatusParser::parse_full("<Hold:0|WPos:1.0,2.0,3.0|F:200|Pn:PZ>").unwrap();
        assert_eq!(report.state_text, "Hold:0");
        assert_eq!(report.state, Some(ControllerState::Hold));
        assert_eq!(report.wpos, Some(Position::new(1.0, 2.0, 3.0)));
        assert_eq!(report.feed_rate, Some(200.0));
        assert_eq!(report.pins.as_deref(), Some("PZ"));
    }

    #[test]
    fn test_malformed_reports() {
        assert!(StatusParser::parse_full("<|MPos:0,0,0>").is_err());
        assert!(StatusParser::parse_full("<Idle|MPos:0,abc,0>").is_err());
        assert!(StatusParser::parse_full("<Idle|FS:0,0>").is_err());
        assert!(StatusParser::parse_full("Idle|MPos:0,0,0").is_err());
    }

    #[test]
    fn test_six_axis_position() {
        let pos = StatusParser::parse_position("1,2,3,4,5,6").unwrap();
        assert_eq!(pos.c, 6.0);
        assert!(StatusParser::parse_position("1,2").is_none());
    }

    #[test]
    fn test_coordinate_derivation() {
        let mpos = Position::new(10.0, 10.0, 0.0);
        let wco = Position::new(4.0, -1.0, 2.0);
        let wpos = StatusParser::wpos_from_mpos_wco(&mpos, &wco);
        assert_eq!(wpos, Position::new(6.0, 11.0, -2.0));
        assert_eq!(StatusParser::mpos_from_wpos_wco(&wpos, &wco), mpos);
    }
}
