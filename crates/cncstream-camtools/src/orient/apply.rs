//! Apply an orientation to program blocks

use cncstream_gcode::{GcodeLine, LineKind, ModalTracker, MotionProgram};

use super::solve::OrientationSolution;
use crate::error::OrientError;

/// Lines that set or use positions outside the work frame
fn is_frame_line(line: &GcodeLine) -> bool {
    line.values('G').any(|g| {
        let major = g.trunc() as u32;
        matches!(major, 10 | 28 | 30 | 53 | 92)
    })
}

fn transform_line(
    line: &mut GcodeLine,
    tracker: &ModalTracker,
    before: &ModalTracker,
    solution: &OrientationSolution,
) {
    if line.kind() != LineKind::Gcode || is_frame_line(line) {
        return;
    }

    if line.has('I') || line.has('J') {
        let (i, j) = solution.rotate_vector(line.get('I').unwrap_or(0.0), line.get('J').unwrap_or(0.0));
        line.set('I', i);
        line.set('J', j);
    }

    if !(line.has('X') || line.has('Y')) {
        return;
    }
    if tracker.incremental {
        let (dx, dy) = solution.rotate_vector(line.get('X').unwrap_or(0.0), line.get('Y').unwrap_or(0.0));
        line.set('X', dx);
        line.set('Y', dy);
        return;
    }
    // Rotation mixes the axes, so both end coordinates are needed
    let (Some(x), Some(y)) = (tracker.position[0], tracker.position[1]) else {
        tracing::warn!(
            "Leaving '{}' untouched, XY position unknown (from {:?})",
            line,
            before.position
        );
        return;
    };
    let (mx, my) = solution.transform_point(x, y);
    line.set('X', mx);
    line.set('Y', my);
}

/// Rewrite X/Y of the selected blocks from design to machine coordinates
///
/// Modal state is tracked through the whole program from the origin so that
/// absolute and incremental lines are told apart; only lines in `blocks`
/// change. Returns a new program.
pub fn apply(
    program: &MotionProgram,
    blocks: &[usize],
    solution: &OrientationSolution,
) -> Result<MotionProgram, OrientError> {
    if let Some(&index) = blocks.iter().find(|&&b| b >= program.len()) {
        return Err(cncstream_core::GcodeError::BlockOutOfRange {
            index,
            len: program.len(),
        }
        .into());
    }

    let mut out = program.clone();
    let mut tracker = ModalTracker::at(0.0, 0.0, 0.0);
    let mut number = 0u32;
    for (b, block) in program.blocks().iter().enumerate() {
        let selected = blocks.contains(&b);
        // Disabled blocks see the modal state at their position without changing it
        let mut local = tracker.clone();
        let active = if block.enabled { &mut tracker } else { &mut local };

        for (l, line) in block.lines.iter().enumerate() {
            number += 1;
            let before = active.clone();
            active.apply(line, number)?;
            if !selected {
                continue;
            }
            if let Some(target) = out.block_mut(b).and_then(|blk| blk.lines.get_mut(l)) {
                transform_line(target, active, &before, solution);
            }
        }
    }
    tracing::info!(
        "Oriented {} blocks by {:.4} deg, offset {:.4},{:.4}",
        blocks.len(),
        solution.angle_degrees(),
        solution.offset.x,
        solution.offset.y
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orient::{solve, Marker};
    use cncstream_gcode::Block;

    fn quarter_turn() -> OrientationSolution {
        solve(&[Marker::new(0.0, 0.0, 0.0, 0.0), Marker::new(10.0, 0.0, 0.0, 10.0)]).unwrap()
    }

    fn shifted() -> OrientationSolution {
        solve(&[Marker::new(0.0, 0.0, 5.0, 1.0), Marker::new(10.0, 0.0, 15.0, 1.0)]).unwrap()
    }

    fn text(program: &MotionProgram, block: usize) -> Vec<String> {
        program.blocks()[block].lines.iter().map(|l| l.to_gcode()).collect()
    }

    #[test]
    fn test_absolute_lines_rotated() {
        let program = MotionProgram::from_blocks(vec![Block::from_text(
            "part",
            "G0 X10 Y0\nG1 Y5 F200\nM3 S1000",
        )]);
        let out = apply(&program, &[0], &quarter_turn()).unwrap();
        assert_eq!(text(&out, 0), vec!["G0 X0 Y10", "G1 Y10 F200 X-5", "M3 S1000"]);
        // Input left alone
        assert_eq!(text(&program, 0)[0], "G0 X10 Y0");
    }

    #[test]
    fn test_incremental_and_arc_offsets_rotated_only() {
        let program = MotionProgram::from_blocks(vec![Block::from_text(
            "part",
            "G91\nG1 X2\nG90\nG2 X0 Y0 I5 J0",
        )]);
        let out = apply(&program, &[0], &shifted()).unwrap();
        let lines = text(&out, 0);
        assert_eq!(lines[1], "G1 X2 Y0");
        assert_eq!(lines[3], "G2 X5 Y1 I5 J0");
    }

    #[test]
    fn test_frame_lines_and_other_blocks_untouched() {
        let program = MotionProgram::from_blocks(vec![
            Block::from_text("setup", "G0 X1 Y1"),
            Block::from_text("part", "G53 G0 X0 Y0\nG92 X0 Y0\nG28\nG10 L20 P1 X0"),
        ]);
        let out = apply(&program, &[1], &quarter_turn()).unwrap();
        assert_eq!(out, program);
    }

    #[test]
    fn test_block_out_of_range() {
        let program = MotionProgram::parse("G0 X1");
        assert!(matches!(
            apply(&program, &[3], &quarter_turn()),
            Err(OrientError::Program(_))
        ));
    }
}
