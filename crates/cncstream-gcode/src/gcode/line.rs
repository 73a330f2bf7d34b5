//! Word-level G-code line model
//!
//! A [`GcodeLine`] keeps the raw text it was loaded from and the words parsed
//! out of it. Editing a word marks the line modified; unmodified lines
//! re-export their original text byte for byte.

use cncstream_core::{format_number, GcodeError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One `letter value` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    /// Uppercase address letter
    pub letter: char,
    pub value: f64,
    /// Source text of the word, e.g. `X10.500`
    text: String,
}

impl Word {
    /// New word with canonical formatting
    pub fn new(letter: char, value: f64) -> Self {
        let letter = letter.to_ascii_uppercase();
        Self {
            letter,
            value,
            text: format!("{}{}", letter, format_number(value)),
        }
    }

    /// Text of the word as it will be exported
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Integer and fractional code, e.g. `G38.2` -> (38, Some(2))
    pub fn code(&self) -> (u32, Option<u32>) {
        let major = self.value.trunc().abs() as u32;
        let frac = ((self.value.abs() - f64::from(major)) * 10.0).round() as u32;
        (major, (frac > 0).then_some(frac))
    }
}

/// What a line contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineKind {
    /// Address words (possibly with a comment)
    Gcode,
    /// Comment only or blank
    Empty,
    /// `$` system command
    System,
    /// `%` run directive
    Directive,
    /// Bracketed substitutions; evaluated at send time, not interpreted here
    Template,
}

/// A single program line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcodeLine {
    raw: String,
    kind: LineKind,
    words: Vec<Word>,
    comment: Option<String>,
    modified: bool,
}

fn comment_regex() -> &'static Regex {
    static COMMENT_REGEX: OnceLock<Regex> = OnceLock::new();
    COMMENT_REGEX.get_or_init(|| Regex::new(r"\(([^)]*)\)|;(.*)$").expect("invalid regex pattern"))
}

fn word_regex() -> &'static Regex {
    static WORD_REGEX: OnceLock<Regex> = OnceLock::new();
    WORD_REGEX.get_or_init(|| {
        Regex::new(r"([A-Za-z])\s*([-+]?(?:\d+\.?\d*|\.\d+))").expect("invalid regex pattern")
    })
}

/// Remove `( )` and `;` comments from a line
pub fn strip_comments(line: &str) -> String {
    comment_regex().replace_all(line, "").trim().to_string()
}

impl GcodeLine {
    /// Parse a line
    ///
    /// `line_number` is only used in error messages.
    pub fn parse(raw: &str, line_number: u32) -> Result<Self, GcodeError> {
        let trimmed = raw.trim();
        let mut line = Self {
            raw: raw.trim_end_matches(['\r', '\n']).to_string(),
            kind: LineKind::Gcode,
            words: Vec::new(),
            comment: None,
            modified: false,
        };

        if trimmed.starts_with('$') {
            line.kind = LineKind::System;
            return Ok(line);
        }
        if trimmed.starts_with('%') {
            line.kind = LineKind::Directive;
            return Ok(line);
        }

        let mut comments = Vec::new();
        for caps in comment_regex().captures_iter(trimmed) {
            if let Some(text) = caps.get(1).or_else(|| caps.get(2)) {
                comments.push(text.as_str().trim().to_string());
            }
        }
        if !comments.is_empty() {
            line.comment = Some(comments.join(" "));
        }

        let code = strip_comments(trimmed);
        if code.is_empty() {
            line.kind = LineKind::Empty;
            return Ok(line);
        }
        if code.contains('[') {
            line.kind = LineKind::Template;
            return Ok(line);
        }

        let mut cursor = 0;
        for caps in word_regex().captures_iter(&code) {
            let whole = caps.get(0).ok_or_else(|| GcodeError::InvalidSyntax {
                line_number,
                reason: "empty match".to_string(),
            })?;
            let gap = &code[cursor..whole.start()];
            if !gap.trim().is_empty() {
                return Err(GcodeError::InvalidSyntax {
                    line_number,
                    reason: format!("unexpected '{}'", gap.trim()),
                });
            }
            cursor = whole.end();

            let letter = caps[1]
                .chars()
                .next()
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or('?');
            let value: f64 = caps[2]
                .parse()
                .map_err(|_| GcodeError::InvalidParameter {
                    line_number,
                    param: letter.to_string(),
                    reason: format!("bad number '{}'", &caps[2]),
                })?;
            line.words.push(Word {
                letter,
                value,
                text: whole.as_str().split_whitespace().collect::<String>(),
            });
        }
        let tail = &code[cursor..];
        if !tail.trim().is_empty() {
            return Err(GcodeError::InvalidSyntax {
                line_number,
                reason: format!("unexpected '{}'", tail.trim()),
            });
        }
        Ok(line)
    }

    /// A line that is kept verbatim and not interpreted
    pub fn raw(text: &str) -> Self {
        Self {
            raw: text.to_string(),
            kind: LineKind::Template,
            words: Vec::new(),
            comment: None,
            modified: false,
        }
    }

    /// Build a line from words
    pub fn from_words(words: Vec<Word>) -> Self {
        let mut line = Self {
            raw: String::new(),
            kind: LineKind::Gcode,
            words,
            comment: None,
            modified: true,
        };
        line.raw = line.render();
        line
    }

    pub fn kind(&self) -> LineKind {
        self.kind
    }

    pub fn words(&self) -> &[Word] {
        &self.words
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Original text as loaded
    pub fn raw_text(&self) -> &str {
        &self.raw
    }

    /// Last value of an address letter
    pub fn get(&self, letter: char) -> Option<f64> {
        let letter = letter.to_ascii_uppercase();
        self.words
            .iter()
            .rev()
            .find(|w| w.letter == letter)
            .map(|w| w.value)
    }

    pub fn has(&self, letter: char) -> bool {
        self.get(letter).is_some()
    }

    /// All values of an address letter in order (e.g. every G code)
    pub fn values(&self, letter: char) -> impl Iterator<Item = f64> + '_ {
        let letter = letter.to_ascii_uppercase();
        self.words
            .iter()
            .filter(move |w| w.letter == letter)
            .map(|w| w.value)
    }

    /// True if the line carries `G<major>[.<minor>]`
    pub fn has_g(&self, major: u32, minor: Option<u32>) -> bool {
        self.words
            .iter()
            .any(|w| w.letter == 'G' && w.code() == (major, minor))
    }

    /// True if the line carries `M<code>`
    pub fn has_m(&self, code: u32) -> bool {
        self.words
            .iter()
            .any(|w| w.letter == 'M' && w.code() == (code, None))
    }

    /// Replace the first occurrence of a letter, or append it
    pub fn set(&mut self, letter: char, value: f64) {
        let word = Word::new(letter, value);
        match self.words.iter_mut().find(|w| w.letter == word.letter) {
            Some(existing) => *existing = word,
            None => self.words.push(word),
        }
        self.modified = true;
    }

    /// Remove every occurrence of a letter
    pub fn remove(&mut self, letter: char) {
        let letter = letter.to_ascii_uppercase();
        let before = self.words.len();
        self.words.retain(|w| w.letter != letter);
        if self.words.len() != before {
            self.modified = true;
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    fn render(&self) -> String {
        let mut out = self
            .words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(comment) = &self.comment {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push('(');
            out.push_str(comment);
            out.push(')');
        }
        out
    }

    /// Text to export or transmit
    pub fn to_gcode(&self) -> String {
        if self.modified {
            self.render()
        } else {
            self.raw.clone()
        }
    }
}

impl std::fmt::Display for GcodeLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_gcode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_words_and_comment() {
        let line = GcodeLine::parse("G1 X10.500 y-2 F300 (cut)", 1).unwrap();
        assert_eq!(line.kind(), LineKind::Gcode);
        assert_eq!(line.get('x'), Some(10.5));
        assert_eq!(line.get('Y'), Some(-2.0));
        assert_eq!(line.comment(), Some("cut"));
        assert_eq!(line.words()[1].text(), "X10.500");
    }

    #[test]
    fn test_unmodified_line_round_trips() {
        let raw = "g0x1y2 ; rapid";
        let line = GcodeLine::parse(raw, 1).unwrap();
        assert_eq!(line.to_gcode(), raw);
        assert_eq!(line.get('X'), Some(1.0));
    }

    #[test]
    fn test_set_preserves_other_tokens() {
        let mut line = GcodeLine::parse("G1 X1.000 Y2 F150.0", 1).unwrap();
        line.set('Y', 3.25);
        line.set('Z', -1.0);
        assert_eq!(line.to_gcode(), "G1 X1.000 Y3.25 F150.0 Z-1");
    }

    #[test]
    fn test_kinds() {
        assert_eq!(GcodeLine::parse("$H", 1).unwrap().kind(), LineKind::System);
        assert_eq!(GcodeLine::parse("%wait", 1).unwrap().kind(), LineKind::Directive);
        assert_eq!(GcodeLine::parse("(only)", 1).unwrap().kind(), LineKind::Empty);
        assert_eq!(GcodeLine::parse("   ", 1).unwrap().kind(), LineKind::Empty);
        assert_eq!(
            GcodeLine::parse("G43.1 Z[TLO]", 1).unwrap().kind(),
            LineKind::Template
        );
    }

    #[test]
    fn test_codes() {
        let line = GcodeLine::parse("G38.2 Z-10 F50", 1).unwrap();
        assert!(line.has_g(38, Some(2)));
        assert!(!line.has_g(38, None));
        let line = GcodeLine::parse("M06 T2", 1).unwrap();
        assert!(line.has_m(6));
        assert_eq!(line.get('T'), Some(2.0));
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(
            GcodeLine::parse("G1 X1 #5", 7),
            Err(GcodeError::InvalidSyntax { line_number: 7, .. })
        ));
    }

    #[test]
    fn test_strip_comments() {
        assert_eq!(strip_comments("G0 X1 (move) Y2 ; tail"), "G0 X1  Y2");
    }
}
