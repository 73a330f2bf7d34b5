//! GRBL Response Parser
//!
//! Classifies one line received from GRBL: acknowledgments, alarms, status
//! reports, bracketed feedback (`[PRB:..]`, `[GC:..]`, `[TLO:..]`, offsets,
//! `[MSG:..]`), setting echoes and the startup banner.

use cncstream_core::{ModalState, Position, ProtocolError, Units};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error_decoder::{format_alarm, format_error};
use super::status_parser::{StatusParser, StatusReport};

/// GRBL response types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GrblResponse {
    /// OK acknowledgment
    Ok,
    /// Error response with error code
    Error(u8),
    /// Alarm response with alarm code
    Alarm(u8),
    /// Status report
    Status(StatusReport),
    /// Probe cycle result in machine coordinates
    Probe { position: Position, success: bool },
    /// Parser modal state (`$G`)
    ParserState(ModalState),
    /// Tool length offset
    ToolOffset(f64),
    /// Coordinate offset (`G54`..`G59`, `G28`, `G30`, `G92`)
    Offset { name: String, position: Position },
    /// Feedback message
    Message(String),
    /// Other bracketed feedback (`[VER:..]`, `[OPT:..]`, `[echo:..]`)
    Feedback(String),
    /// Setting response ($n=value)
    Setting { number: u16, value: String },
    /// Startup banner, sent after power-up and every soft reset
    Banner(String),
    /// Any other text
    Text(String),
}

impl fmt::Display for GrblResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error(code) => write!(f, "{}", format_error(*code)),
            Self::Alarm(code) => write!(f, "{}", format_alarm(*code)),
            Self::Status(report) => write!(f, "status:{}", report.state_text),
            Self::Probe { position, success } => {
                write!(f, "probe:{} ({})", position, if *success { 1 } else { 0 })
            }
            Self::ParserState(modal) => {
                write!(f, "parser_state:{} {} {}", modal.motion, modal.wcs, modal.plane)
            }
            Self::ToolOffset(tlo) => write!(f, "tlo:{}", tlo),
            Self::Offset { name, position } => write!(f, "offset:{} {}", name, position),
            Self::Message(msg) => write!(f, "message:{}", msg),
            Self::Feedback(text) => write!(f, "feedback:{}", text),
            Self::Setting { number, value } => write!(f, "setting:${}={}", number, value),
            Self::Banner(banner) => write!(f, "banner:{}", banner),
            Self::Text(text) => write!(f, "{}", text),
        }
    }
}

/// GRBL response parser
#[derive(Debug, Default)]
pub struct GrblResponseParser;

const OFFSET_NAMES: [&str; 9] = [
    "G54", "G55", "G56", "G57", "G58", "G59", "G28", "G30", "G92",
];

impl GrblResponseParser {
    /// Create a new GRBL response parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a GRBL response line
    ///
    /// Returns `Ok(None)` for blank lines and an error for lines that look
    /// like a known response but cannot be read.
    pub fn parse(&self, line: &str) -> Result<Option<GrblResponse>, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let malformed = |reason: &str| ProtocolError::MalformedResponse {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        if line == "ok" {
            return Ok(Some(GrblResponse::Ok));
        }

        if let Some(code) = line.strip_prefix("error:") {
            return code
                .trim()
                .parse::<u8>()
                .map(|c| Some(GrblResponse::Error(c)))
                .map_err(|_| malformed("bad error code"));
        }

        if let Some(code) = line
            .strip_prefix("ALARM:")
            .or_else(|| line.strip_prefix("alarm:"))
        {
            return code
                .trim()
                .parse::<u8>()
                .map(|c| Some(GrblResponse::Alarm(c)))
                .map_err(|_| malformed("bad alarm code"));
        }

        if line.starts_with('<') && line.ends_with('>') {
            return StatusParser::parse_full(line).map(|r| Some(GrblResponse::Status(r)));
        }

        if line.starts_with('[') && line.ends_with(']') {
            return self.parse_feedback(&line[1..line.len() - 1], line).map(Some);
        }

        if line.starts_with('$') && line.contains('=') {
            return self.parse_setting(line).map(Some);
        }

        if line.starts_with("Grbl ") || line.starts_with("GrblHAL ") {
            return Ok(Some(GrblResponse::Banner(line.to_string())));
        }

        Ok(Some(GrblResponse::Text(line.to_string())))
    }

    fn parse_feedback(&self, body: &str, line: &str) -> Result<GrblResponse, ProtocolError> {
        let malformed = |reason: &str| ProtocolError::MalformedResponse {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let Some((tag, value)) = body.split_once(':') else {
            return Ok(GrblResponse::Feedback(body.to_string()));
        };

        match tag {
            "PRB" => {
                let (coords, flag) = value
                    .rsplit_once(':')
                    .ok_or_else(|| malformed("missing probe flag"))?;
                let position =
                    StatusParser::parse_position(coords).ok_or_else(|| malformed("bad probe position"))?;
                let success = match flag.trim() {
                    "1" => true,
                    "0" => false,
                    _ => return Err(malformed("bad probe flag")),
                };
                Ok(GrblResponse::Probe { position, success })
            }
            "GC" => Ok(GrblResponse::ParserState(Self::parse_modal(value))),
            "TLO" => value
                .trim()
                .parse::<f64>()
                .map(GrblResponse::ToolOffset)
                .map_err(|_| malformed("bad tool offset")),
            "MSG" => Ok(GrblResponse::Message(value.to_string())),
            name if OFFSET_NAMES.contains(&name) => {
                // G28/G30 carry only coordinates; a trailing `:flag` is not sent
                let coords = value.split(':').next().unwrap_or(value);
                let position =
                    StatusParser::parse_position(coords).ok_or_else(|| malformed("bad offset"))?;
                Ok(GrblResponse::Offset {
                    name: name.to_string(),
                    position,
                })
            }
            _ => Ok(GrblResponse::Feedback(body.to_string())),
        }
    }

    /// Parse the words of a `[GC:...]` report
    pub fn parse_modal(words: &str) -> ModalState {
        let mut modal = ModalState::default();
        let mut coolant: Vec<&str> = Vec::new();
        for word in words.split_whitespace() {
            let (Some(letter), Some(number)) = (word.get(..1), word.get(1..)) else {
                continue;
            };
            match letter {
                "G" => match number {
                    "0" | "1" | "2" | "3" | "38.2" | "38.3" | "38.4" | "38.5" | "80" => {
                        modal.motion = word.to_string()
                    }
                    "54" | "55" | "56" | "57" | "58" | "59" => modal.wcs = word.to_string(),
                    "17" | "18" | "19" => modal.plane = word.to_string(),
                    "20" => modal.units = Units::INCH,
                    "21" => modal.units = Units::MM,
                    "90" => modal.incremental = false,
                    "91" => modal.incremental = true,
                    "93" | "94" => modal.feed_mode = word.to_string(),
                    _ => {}
                },
                "M" => match number {
                    "3" | "4" | "5" => modal.spindle = word.to_string(),
                    "7" | "8" | "9" => coolant.push(word),
                    _ => {}
                },
                "T" => modal.tool = number.parse().unwrap_or(modal.tool),
                "F" => modal.feed = number.parse().unwrap_or(modal.feed),
                "S" => modal.spindle_speed = number.parse().unwrap_or(modal.spindle_speed),
                _ => {}
            }
        }
        if !coolant.is_empty() {
            modal.coolant = coolant.join(" ");
        }
        modal
    }

    fn parse_setting(&self, line: &str) -> Result<GrblResponse, ProtocolError> {
        let malformed = || ProtocolError::MalformedResponse {
            line: line.to_string(),
            reason: "bad setting".to_string(),
        };
        let (number, value) = line[1..].split_once('=').ok_or_else(malformed)?;
        let number = number.trim().parse::<u16>().map_err(|_| malformed())?;
        Ok(GrblResponse::Setting {
            number,
            value: value.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> GrblResponse {
        GrblResponseParser::new().parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_acknowledgments() {
        assert_eq!(parse("ok"), GrblResponse::Ok);
        assert_eq!(parse("error:20"), GrblResponse::Error(20));
        assert_eq!(parse("ALARM:5"), GrblResponse::Alarm(5));
        assert!(GrblResponseParser::new().parse("error:x").is_err());
        assert_eq!(GrblResponseParser::new().parse("  \r").unwrap(), None);
    }

    #[test]
    fn test_probe_feedback() {
        assert_eq!(
            parse("[PRB:1.000,2.000,-4.200:1]"),
            GrblResponse::Probe {
                position: Position::new(1.0, 2.0, -4.2),
                success: true
            }
        );
        assert!(matches!(
            parse("[PRB:0.000,0.000,-10.000:0]"),
            GrblResponse::Probe { success: false, .. }
        ));
        assert!(GrblResponseParser::new().parse("[PRB:0,0,0]").is_err());
    }

    #[test]
    fn test_parser_state() {
        let GrblResponse::ParserState(modal) = parse("[GC:G1 G55 G17 G20 G91 G94 M3 M8 T4 F250 S9000]")
        else {
            panic!("expected parser state");
        };
        assert_eq!(modal.motion, "G1");
        assert_eq!(modal.wcs, "G55");
        assert_eq!(modal.units, Units::INCH);
        assert!(modal.incremental);
        assert_eq!(modal.spindle, "M3");
        assert_eq!(modal.coolant, "M8");
        assert_eq!(modal.tool, 4);
        assert_eq!(modal.feed, 250.0);
        assert_eq!(modal.spindle_speed, 9000.0);
    }

    #[test]
    fn test_offsets_and_messages() {
        assert_eq!(parse("[TLO:1.500]"), GrblResponse::ToolOffset(1.5));
        assert_eq!(
            parse("[G54:10.000,0.000,-3.000]"),
            GrblResponse::Offset {
                name: "G54".into(),
                position: Position::new(10.0, 0.0, -3.0)
            }
        );
        assert_eq!(
            parse("[MSG:Caution: Unlocked]"),
            GrblResponse::Message("Caution: Unlocked".into())
        );
        assert_eq!(
            parse("[VER:1.1h.20190825:]"),
            GrblResponse::Feedback("VER:1.1h.20190825:".into())
        );
    }

    #[test]
    fn test_settings_and_banner() {
        assert_eq!(
            parse("$110=5000.000"),
            GrblResponse::Setting {
                number: 110,
                value: "5000.000".into()
            }
        );
        assert_eq!(
            parse("Grbl 1.1h ['$' for help]"),
            GrblResponse::Banner("Grbl 1.1h ['$' for help]".into())
        );
        assert_eq!(parse("hello"), GrblResponse::Text("hello".into()));
    }
}
