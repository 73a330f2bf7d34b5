//! Orientation alignment
//!
//! An [`Orientation`] session collects markers (a design point and the
//! position where it was found on the workpiece), solves the rigid transform
//! between the two frames and applies it to program blocks. Editing the
//! marker set drops the current solution.

pub mod apply;
pub mod solve;

pub use apply::apply;
pub use solve::{solve, ErrorStats, Marker, OrientationSolution};

use std::fs;
use std::path::Path;
use std::sync::Arc;

use cncstream_core::{AppEvent, EventBus, MachineStateBus, OrientEvent};
use cncstream_gcode::MotionProgram;
use nalgebra::Point2;

use crate::error::OrientError;

/// Marker being captured from the live machine position
#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingCapture {
    design: Point2<f64>,
    machine: Option<Point2<f64>>,
}

/// Marker set with its current solution
#[derive(Default)]
pub struct Orientation {
    markers: Vec<Marker>,
    solution: Option<OrientationSolution>,
    capture: Option<PendingCapture>,
    events: Option<Arc<EventBus>>,
}

impl Orientation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish marker and solution events on a bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn solution(&self) -> Option<&OrientationSolution> {
        self.solution.as_ref()
    }

    pub fn is_solved(&self) -> bool {
        self.solution.is_some()
    }

    fn publish(&self, event: OrientEvent) {
        if let Some(events) = &self.events {
            let _ = events.publish(AppEvent::Orient(event));
        }
    }

    fn changed(&mut self) {
        self.solution = None;
        self.publish(OrientEvent::MarkersChanged {
            count: self.markers.len(),
        });
    }

    fn check_index(&self, index: usize) -> Result<(), OrientError> {
        if index < self.markers.len() {
            Ok(())
        } else {
            Err(OrientError::MarkerOutOfRange {
                index,
                len: self.markers.len(),
            })
        }
    }

    /// Append a marker, returning its index
    pub fn add_marker(&mut self, marker: Marker) -> usize {
        self.markers.push(marker);
        self.changed();
        self.markers.len() - 1
    }

    pub fn edit_marker(&mut self, index: usize, marker: Marker) -> Result<(), OrientError> {
        self.check_index(index)?;
        self.markers[index] = marker;
        self.changed();
        Ok(())
    }

    pub fn delete_marker(&mut self, index: usize) -> Result<Marker, OrientError> {
        self.check_index(index)?;
        let marker = self.markers.remove(index);
        self.changed();
        Ok(marker)
    }

    pub fn clear(&mut self) {
        self.markers.clear();
        self.capture = None;
        self.changed();
    }

    /// Solve with the current markers
    ///
    /// On failure the session is left as it was.
    pub fn solve(&mut self) -> Result<&OrientationSolution, OrientError> {
        let solution = solve(&self.markers)?;
        let stats = solution.error();
        tracing::info!(
            "Orientation solved from {} markers: {:.4} deg, error min {:.4} avg {:.4} max {:.4}",
            self.markers.len(),
            solution.angle_degrees(),
            stats.min,
            stats.avg,
            stats.max
        );
        self.publish(OrientEvent::Solved {
            angle_deg: solution.angle_degrees(),
            dx: solution.offset.x,
            dy: solution.offset.y,
            max_error: stats.max,
        });
        Ok(self.solution.insert(solution))
    }

    /// Residual statistics of the current solution
    pub fn error(&self) -> Option<ErrorStats> {
        self.solution.as_ref().map(OrientationSolution::error)
    }

    /// Transform the selected blocks of a program
    pub fn apply(&self, program: &MotionProgram, blocks: &[usize]) -> Result<MotionProgram, OrientError> {
        let solution = self.solution.as_ref().ok_or(OrientError::NotSolved)?;
        apply(program, blocks, solution)
    }

    /// Open a marker capture for a design point
    pub fn begin_capture(&mut self, design_x: f64, design_y: f64) -> Result<(), OrientError> {
        if self.capture.is_some() {
            return Err(OrientError::CaptureInProgress);
        }
        self.capture = Some(PendingCapture {
            design: Point2::new(design_x, design_y),
            machine: None,
        });
        Ok(())
    }

    /// Record the live work position for the open capture; may be repeated
    pub fn capture(&mut self, state: &MachineStateBus) -> Result<(f64, f64), OrientError> {
        let pending = self.capture.as_mut().ok_or(OrientError::NoCapture)?;
        let (x, y) = state.read(|s| (s.work.x, s.work.y));
        pending.machine = Some(Point2::new(x, y));
        tracing::debug!("Captured marker position {:.4},{:.4}", x, y);
        Ok((x, y))
    }

    /// Add the captured marker to the set
    pub fn commit_capture(&mut self) -> Result<usize, OrientError> {
        let machine = self
            .capture
            .and_then(|c| c.machine)
            .ok_or(OrientError::NoCapture)?;
        let design = self.capture.take().map(|c| c.design).ok_or(OrientError::NoCapture)?;
        Ok(self.add_marker(Marker { design, machine }))
    }

    /// Drop the open capture; the marker set is unchanged
    pub fn abort_capture(&mut self) {
        self.capture = None;
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn to_json(&self) -> Result<String, OrientError> {
        Ok(serde_json::to_string_pretty(&self.markers)?)
    }

    /// Replace the markers with a saved set
    pub fn load_json(&mut self, text: &str) -> Result<(), OrientError> {
        self.markers = serde_json::from_str(text)?;
        self.changed();
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), OrientError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), OrientError> {
        self.load_json(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cncstream_core::{EventFilter, Position};
    use parking_lot::Mutex;

    fn session_with_bus() -> (Orientation, Arc<Mutex<Vec<OrientEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(EventFilter::All, move |event| {
            if let AppEvent::Orient(e) = event {
                sink.lock().push(e);
            }
        });
        (Orientation::new().with_events(bus), seen)
    }

    #[test]
    fn test_editing_invalidates_solution() {
        let (mut orient, events) = session_with_bus();
        orient.add_marker(Marker::new(0.0, 0.0, 0.0, 0.0));
        orient.add_marker(Marker::new(10.0, 0.0, 0.0, 10.0));
        assert!((orient.solve().unwrap().angle_degrees() - 90.0).abs() < 1e-9);
        assert!(orient.is_solved());

        orient.edit_marker(1, Marker::new(10.0, 0.0, 10.0, 0.0)).unwrap();
        assert!(!orient.is_solved());
        assert!(matches!(
            orient.delete_marker(5),
            Err(OrientError::MarkerOutOfRange { index: 5, len: 2 })
        ));

        let events = events.lock();
        assert!(matches!(events[2], OrientEvent::Solved { .. }));
        assert!(matches!(events.last(), Some(OrientEvent::MarkersChanged { count: 2 })));
    }

    #[test]
    fn test_failed_solve_keeps_state() {
        let mut orient = Orientation::new();
        orient.add_marker(Marker::new(0.0, 0.0, 1.0, 1.0));
        assert!(matches!(
            orient.solve(),
            Err(OrientError::InsufficientMarkers { count: 1 })
        ));
        assert!(orient.solution().is_none());
        assert_eq!(orient.markers().len(), 1);
        assert!(matches!(
            orient.apply(&MotionProgram::new(), &[]),
            Err(OrientError::NotSolved)
        ));
    }

    #[test]
    fn test_capture_transaction() {
        let state = MachineStateBus::new();
        state.update(|s| s.work = Position::new(4.0, 6.0, 0.0));
        let mut orient = Orientation::new();

        assert!(matches!(orient.capture(&state), Err(OrientError::NoCapture)));
        orient.begin_capture(1.0, 2.0).unwrap();
        assert!(matches!(orient.begin_capture(0.0, 0.0), Err(OrientError::CaptureInProgress)));
        assert!(matches!(orient.commit_capture(), Err(OrientError::NoCapture)));
        assert_eq!(orient.capture(&state).unwrap(), (4.0, 6.0));
        assert_eq!(orient.commit_capture().unwrap(), 0);
        assert_eq!(orient.markers()[0], Marker::new(1.0, 2.0, 4.0, 6.0));
        assert!(!orient.is_capturing());

        orient.begin_capture(3.0, 3.0).unwrap();
        orient.capture(&state).unwrap();
        orient.abort_capture();
        assert_eq!(orient.markers().len(), 1);
    }

    #[test]
    fn test_markers_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.json");
        let mut orient = Orientation::new();
        orient.add_marker(Marker::new(0.0, 0.0, 1.0, 1.0));
        orient.add_marker(Marker::new(5.0, 0.0, 6.0, 1.0));
        orient.save(&path).unwrap();

        let mut loaded = Orientation::new();
        loaded.load(&path).unwrap();
        assert_eq!(loaded.markers(), orient.markers());
        assert!(matches!(loaded.load_json("[1, 2]"), Err(OrientError::Json(_))));
    }
}
