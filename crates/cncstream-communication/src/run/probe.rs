//! Interactive probing sequences
//!
//! Probe results are kept in work coordinates, so moves back to a contact
//! point use `G90 G0` rather than `G53`.

use cncstream_core::{format_number, Position, RunError};

/// Smallest bore diameter [`center`] accepts
pub const MIN_CENTER_DIAMETER: f64 = 0.001;

/// Single probing move along the given axes
///
/// At least one axis is needed; `feed` is omitted when not positive.
pub fn single(
    command: &str,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    feed: f64,
) -> Result<String, RunError> {
    let mut line = command.trim().to_ascii_uppercase();
    let mut axes = 0;
    for (letter, value) in [('X', x), ('Y', y), ('Z', z)] {
        let Some(value) = value else { continue };
        if !value.is_finite() {
            return Err(RunError::InvalidProbe {
                reason: format!("{} target is not a number", letter),
            });
        }
        line.push_str(&format!(" {}{}", letter, format_number(value)));
        axes += 1;
    }
    if axes == 0 {
        return Err(RunError::InvalidProbe {
            reason: "at least one probe direction must be given".into(),
        });
    }
    if feed > 0.0 {
        line.push_str(&format!(" F{}", format_number(feed)));
    }
    Ok(line)
}

/// Rapid back to a recorded probe position
pub fn goto(position: &Position) -> String {
    format!(
        "G90 G0 X{} Y{} Z{}",
        format_number(position.x),
        format_number(position.y),
        format_number(position.z)
    )
}

/// Find the center of a bore by touching both walls in X, then in Y
///
/// Starts from a point inside the bore; ends at its center in `G90`.
pub fn center(command: &str, diameter: f64) -> Result<Vec<String>, RunError> {
    if !diameter.is_finite() || diameter < MIN_CENTER_DIAMETER {
        return Err(RunError::InvalidProbe {
            reason: format!("invalid diameter {}", diameter),
        });
    }
    let probe = format!("G91 {} F[prbfeed]", command.trim().to_ascii_uppercase());
    let d = format_number(diameter);
    let backoff = format_number(diameter / 10.0);

    let mut out = Vec::new();
    for axis in ['X', 'Y'] {
        let contact = format!("prb{}", axis.to_ascii_lowercase());
        out.push(format!("{} {}-{}", probe, axis, d));
        out.push("%wait".into());
        out.push(format!("%tmp={}", contact));
        out.push(format!("G90 G0 {}[{}+{}]", axis, contact, backoff));
        out.push("%wait".into());
        out.push(format!("{} {}{}", probe, axis, d));
        out.push("%wait".into());
        out.push(format!("G90 G0 {}[0.5*(tmp+{})]", axis, contact));
        out.push("%wait".into());
    }
    out.push("G90".into());
    Ok(out)
}
