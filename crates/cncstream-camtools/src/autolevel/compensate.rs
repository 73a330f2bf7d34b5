//! Height map compensation
//!
//! Every move with a known end point is split into pieces no longer than
//! the grid step and each piece end gets the surface height added to its Z.
//! Arcs are linearized first. Incremental moves are written as absolute
//! coordinates between `G90` and `G91`. Machine-coordinate lines and probe
//! moves are copied unchanged. The program is taken to start at the work
//! origin, as the orientation transform does.

use std::f64::consts::PI;

use cncstream_gcode::{Block, GcodeLine, ModalTracker, MotionMode, MotionProgram, Move, Word};

use super::height_map::{HeightMap, Surface};
use crate::error::AutolevelError;

/// Largest angle covered by one arc segment
const MAX_ARC_ANGLE: f64 = PI / 36.0;

/// What [`compensate`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Grid nodes without contact, their heights came from neighbors
    pub degraded_points: usize,
    /// Source moves that were compensated
    pub moves_compensated: usize,
    /// Motion lines written for them
    pub segments_emitted: usize,
    /// Moves copied unchanged (unknown position, probe, other planes)
    pub passed_through: usize,
}

fn motion_of(word: &Word) -> Option<Option<MotionMode>> {
    if word.letter != 'G' {
        return None;
    }
    match word.code() {
        (0, None) => Some(Some(MotionMode::Rapid)),
        (1, None) => Some(Some(MotionMode::Linear)),
        (2, None) => Some(Some(MotionMode::ArcCw)),
        (3, None) => Some(Some(MotionMode::ArcCcw)),
        (38, Some(minor)) => Some(Some(MotionMode::Probe(minor))),
        (80, None) => Some(None),
        _ => None,
    }
}

fn sets_motion(line: &GcodeLine) -> bool {
    line.words().iter().any(|w| motion_of(w).is_some())
}

/// Copy of `line` with an explicit motion word in front
fn with_motion(line: &GcodeLine, motion: MotionMode) -> Result<GcodeLine, AutolevelError> {
    let code = GcodeLine::parse(&motion.code(), 0)?;
    let mut words = code.words().to_vec();
    words.extend(line.words().iter().cloned());
    Ok(GcodeLine::from_words(words))
}

fn g(code: f64) -> GcodeLine {
    GcodeLine::from_words(vec![Word::new('G', code)])
}

/// Piece end points along a move, `None` when it cannot be compensated
fn pieces(mv: &Move, step: f64) -> Option<Vec<[f64; 3]>> {
    let [Some(ex), Some(ey), Some(ez)] = mv.end else {
        return None;
    };
    let end = [ex, ey, ez];
    let start = match mv.start {
        [Some(sx), Some(sy), sz] => Some([sx, sy, sz.unwrap_or(ez)]),
        _ => None,
    };

    match mv.motion {
        MotionMode::Probe(_) => None,
        MotionMode::Rapid | MotionMode::Linear => {
            let Some(s) = start else {
                return Some(vec![end]);
            };
            let length = (ex - s[0]).hypot(ey - s[1]);
            let n = ((length / step) - 1e-9).ceil().max(1.0) as usize;
            Some(
                (1..=n)
                    .map(|k| {
                        if k == n {
                            return end;
                        }
                        let t = k as f64 / n as f64;
                        [
                            s[0] + (ex - s[0]) * t,
                            s[1] + (ey - s[1]) * t,
                            s[2] + (ez - s[2]) * t,
                        ]
                    })
                    .collect(),
            )
        }
        MotionMode::ArcCw | MotionMode::ArcCcw => {
            let (s, [cx, cy]) = (start?, mv.center?);
            let a0 = (s[1] - cy).atan2(s[0] - cx);
            let a1 = (ey - cy).atan2(ex - cx);
            let r0 = (s[0] - cx).hypot(s[1] - cy);
            let r1 = (ex - cx).hypot(ey - cy);
            let mut sweep = a1 - a0;
            if mv.motion == MotionMode::ArcCw {
                if sweep >= -1e-12 {
                    sweep -= 2.0 * PI;
                }
            } else if sweep <= 1e-12 {
                sweep += 2.0 * PI;
            }
            let length = sweep.abs() * r0.max(r1);
            let n = ((length / step).ceil())
                .max((sweep.abs() / MAX_ARC_ANGLE).ceil())
                .max(1.0) as usize;
            Some(
                (1..=n)
                    .map(|k| {
                        if k == n {
                            return end;
                        }
                        let t = k as f64 / n as f64;
                        let angle = a0 + sweep * t;
                        let r = r0 + (r1 - r0) * t;
                        [
                            cx + r * angle.cos(),
                            cy + r * angle.sin(),
                            s[2] + (ez - s[2]) * t,
                        ]
                    })
                    .collect(),
            )
        }
    }
}

/// Words of the source line that survive into the first piece
fn carried_words(line: &GcodeLine) -> (Vec<Word>, Vec<Word>) {
    let mut modal = Vec::new();
    let mut other = Vec::new();
    for word in line.words() {
        match word.letter {
            'X' | 'Y' | 'Z' | 'I' | 'J' | 'K' | 'R' => {}
            'G' if motion_of(word).is_some() || word.code() == (91, None) => {}
            'G' => modal.push(word.clone()),
            _ => other.push(word.clone()),
        }
    }
    (modal, other)
}

struct Compensator<'a> {
    surface: &'a Surface,
    step: f64,
    report: CompensationReport,
    /// Motion mode the controller will be in after the last emitted line
    emitted: Option<MotionMode>,
}

impl Compensator<'_> {
    fn emit_move(&mut self, out: &mut Vec<GcodeLine>, line: &GcodeLine, mv: &Move, points: &[[f64; 3]]) {
        let motion = match mv.motion {
            MotionMode::Rapid => MotionMode::Rapid,
            _ => MotionMode::Linear,
        };
        let code = if motion == MotionMode::Rapid { 0.0 } else { 1.0 };
        let (modal, other) = carried_words(line);

        if mv.incremental {
            out.push(g(90.0));
        }
        for (k, [x, y, z]) in points.iter().enumerate() {
            let mut words = Vec::new();
            if k == 0 {
                words.extend(modal.iter().cloned());
            }
            words.push(Word::new('G', code));
            words.push(Word::new('X', *x));
            words.push(Word::new('Y', *y));
            words.push(Word::new('Z', z + self.surface.height(*x, *y)));
            if k == 0 {
                words.extend(other.iter().cloned());
            }
            out.push(GcodeLine::from_words(words));
        }
        if mv.incremental {
            out.push(g(91.0));
        }

        self.emitted = Some(motion);
        self.report.moves_compensated += 1;
        self.report.segments_emitted += points.len();
    }

    fn line(
        &mut self,
        tracker: &mut ModalTracker,
        out: &mut Vec<GcodeLine>,
        line: &GcodeLine,
        number: u32,
    ) -> Result<(), AutolevelError> {
        let machine_coords = line.has_g(53, None);
        let Some(mv) = tracker.apply(line, number)? else {
            if sets_motion(line) {
                self.emitted = tracker.motion;
            }
            out.push(line.clone());
            return Ok(());
        };

        match pieces(&mv, self.step).filter(|_| !machine_coords) {
            Some(points) => self.emit_move(out, line, &mv, &points),
            None => {
                self.report.passed_through += 1;
                if !sets_motion(line) && self.emitted != Some(mv.motion) {
                    out.push(with_motion(line, mv.motion)?);
                } else {
                    out.push(line.clone());
                }
                self.emitted = Some(mv.motion);
            }
        }
        Ok(())
    }
}

/// Apply a height map to a program
///
/// Returns a new program; the input is left untouched. Disabled blocks are
/// copied as they are and do not affect modal tracking.
pub fn compensate(
    program: &MotionProgram,
    map: &HeightMap,
) -> Result<(MotionProgram, CompensationReport), AutolevelError> {
    let surface = map.surface()?;
    let mut compensator = Compensator {
        surface: &surface,
        step: map.grid().min_step(),
        report: CompensationReport {
            degraded_points: map.degraded_points().len(),
            ..CompensationReport::default()
        },
        emitted: None,
    };

    let mut tracker = ModalTracker::at(0.0, 0.0, 0.0);
    let mut number = 0u32;
    let mut blocks = Vec::with_capacity(program.len());
    for block in program.blocks() {
        if !block.enabled {
            number += block.lines.len() as u32;
            blocks.push(block.clone());
            continue;
        }
        let mut lines = Vec::with_capacity(block.lines.len());
        for line in &block.lines {
            number += 1;
            compensator.line(&mut tracker, &mut lines, line, number)?;
        }
        blocks.push(Block {
            lines,
            ..block.clone()
        });
    }

    let report = compensator.report;
    tracing::debug!(
        "Compensated {} moves into {} segments, {} passed through",
        report.moves_compensated,
        report.segments_emitted,
        report.passed_through
    );
    Ok((MotionProgram::from_blocks(blocks), report))
}
