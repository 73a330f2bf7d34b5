//! Tool change and tool height calibration sequences
//!
//! Sequences are plain program lines with directives, plus suspension
//! points where the operator has to act. Positions come from variables
//! seeded from configuration (`toolchangex`, `toolprobez`, ...), so they can
//! be changed between runs without rebuilding anything.

use cncstream_core::format_number;
use cncstream_settings::{ProbeSettings, ToolChangePolicy};

/// Element of an expanded sequence
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Line(String),
    /// Stop submitting until the operator acknowledges
    Suspend { tool: u32 },
}

fn line(text: impl Into<String>) -> Step {
    Step::Line(text.into())
}

/// Probing command moving the other way (`G38.2` <-> `G38.4`, `G38.3` <-> `G38.5`)
pub fn reverse_probe_command(command: &str) -> String {
    let upper = command.trim().to_ascii_uppercase();
    match upper.as_str() {
        "G38.2" => "G38.4".into(),
        "G38.3" => "G38.5".into(),
        "G38.4" => "G38.2".into(),
        "G38.5" => "G38.3".into(),
        _ => upper,
    }
}

/// `T` word and whether an `M6` is present, comments already stripped
pub fn tool_words(line: &str) -> (Option<u32>, bool) {
    let upper = line.to_ascii_uppercase();
    let mut tool = None;
    let mut m6 = false;
    let mut chars = upper.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != 'T' && c != 'M' {
            continue;
        }
        let rest = &upper[i + 1..];
        let digits: String = rest
            .chars()
            .skip_while(|c| c.is_whitespace())
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if digits.is_empty() {
            continue;
        }
        match c {
            'T' => tool = digits.parse::<f64>().ok().map(|t| t as u32),
            _ => m6 |= digits.parse::<f64>().is_ok_and(|m| m == 6.0),
        }
        while chars.peek().is_some_and(|(_, c)| c.is_ascii_digit() || *c == '.') {
            chars.next();
        }
    }
    (tool, m6)
}

/// Fast passes at decreasing feed, then the final slow probe
fn probe_passes(probe: &ProbeSettings, out: &mut Vec<Step>) {
    let command = probe.command.trim().to_ascii_uppercase();
    let reverse = reverse_probe_command(&command);
    let mut feed = probe.fast_feed;
    if feed > 0.0 {
        while feed > probe.feed {
            out.push(line("%wait"));
            out.push(line(format!(
                "G91 {} F{} Z[toolprobez-mz-tooldistance]",
                command,
                format_number(feed)
            )));
            out.push(line("%wait"));
            out.push(line(format!(
                "{} F{} Z[toolprobez-mz]",
                reverse,
                format_number(feed)
            )));
            feed /= 10.0;
        }
    }
    out.push(line("%wait"));
    out.push(line(format!(
        "G91 {} F[prbfeed] Z[toolprobez-mz-tooldistance]",
        command
    )));
}

fn to_change_position(out: &mut Vec<Step>) {
    out.push(line("G53 G0 Z[toolchangez]"));
    out.push(line("G53 G0 X[toolchangex] Y[toolchangey]"));
}

fn to_probe_position(out: &mut Vec<Step>) {
    out.push(line("G53 G0 X[toolprobex] Y[toolprobey]"));
    out.push(line("G53 G0 Z[toolprobez]"));
}

/// Steps replacing an `M6` line
///
/// `Pass` and `Ignore` never reach here from a run; called directly they
/// behave like `NoProbe`.
pub fn tool_change(
    tool: u32,
    policy: ToolChangePolicy,
    wait_after_probe: bool,
    probe: &ProbeSettings,
) -> Vec<Step> {
    let mut out = vec![
        line("M5"),
        line("%wait"),
        line("%global _x; _x=wx; _y=wy; _z=wz"),
    ];
    to_change_position(&mut out);
    out.push(line("%wait"));
    out.push(line(format!("%msg Tool change T{:02}", tool)));
    out.push(Step::Suspend { tool });

    if policy.probes() {
        to_probe_position(&mut out);
        probe_passes(probe, &mut out);
        out.push(line("G4 P1"));
        out.push(line("%wait"));
        match policy {
            ToolChangePolicy::Wcs => {
                out.push(line("G10 L20 P0 Z[toolheight]"));
                out.push(line("%wait"));
            }
            ToolChangePolicy::Tlo => {
                out.push(line("%global TLO; TLO=prbz-toolmz"));
                out.push(line("G43.1 Z[TLO]"));
                out.push(line("%update TLO"));
            }
            _ => {}
        }
        to_change_position(&mut out);
    }

    if wait_after_probe {
        out.push(line("%wait"));
        out.push(line("%msg Restart spindle"));
        out.push(Step::Suspend { tool });
    }

    out.push(line("G90"));
    out.push(line("G0 X[_x] Y[_y]"));
    out.push(line("G0 Z[_z]"));
    out
}

/// Measure the reference tool: stores `toolheight` and `toolmz`
pub fn calibrate(probe: &ProbeSettings) -> Vec<Step> {
    let mut out = Vec::new();
    to_change_position(&mut out);
    to_probe_position(&mut out);
    probe_passes(probe, &mut out);
    out.push(line("G4 P1"));
    out.push(line("%wait"));
    out.push(line("%global toolheight; toolheight=wz"));
    out.push(line("%global toolmz; toolmz=prbz"));
    out.push(line("%update toolheight"));
    to_change_position(&mut out);
    out.push(line("G90"));
    out
}
