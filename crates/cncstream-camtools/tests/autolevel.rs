//! Autolevel scanning and compensation

use std::sync::Arc;
use std::time::Duration;

use cncstream_camtools::{
    compensate, AbortHandle, Autolevel, AutolevelError, ControllerProber, HeightMap, ProbeGrid,
    Prober, ScanParams,
};
use cncstream_communication::{CncController, SimulatedGrbl};
use cncstream_core::{
    AppEvent, AutolevelEvent, ErrorEvent, EventBus, EventFilter, Position, ProbePoint,
};
use cncstream_gcode::{ModalTracker, MotionProgram};
use cncstream_settings::Config;
use parking_lot::Mutex;
use proptest::prelude::*;

/// Prober over a height function; `None` is a miss
struct SurfaceProber<F: FnMut(f64, f64) -> Option<f64>> {
    surface: F,
    probed: Vec<(f64, f64)>,
}

impl<F: FnMut(f64, f64) -> Option<f64>> SurfaceProber<F> {
    fn new(surface: F) -> Self {
        Self {
            surface,
            probed: Vec::new(),
        }
    }
}

impl<F: FnMut(f64, f64) -> Option<f64>> Prober for SurfaceProber<F> {
    fn probe(
        &mut self,
        x: f64,
        y: f64,
        z_min: f64,
        _z_max: f64,
        _feed: f64,
    ) -> Result<ProbePoint, AutolevelError> {
        self.probed.push((x, y));
        Ok(match (self.surface)(x, y) {
            Some(z) => ProbePoint {
                position: Position::new(x, y, z),
                target: Position::new(x, y, z_min),
                success: true,
            },
            None => ProbePoint::failed(Position::new(x, y, z_min)),
        })
    }
}

fn params() -> ScanParams {
    ScanParams {
        z_min: -5.0,
        z_max: 2.0,
        feed: 50.0,
    }
}

fn grid3() -> ProbeGrid {
    ProbeGrid::new(0.0, 2.0, 0.0, 2.0, 1.0, 1.0).unwrap()
}

fn recorded_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<AppEvent>>>) {
    let bus = Arc::new(EventBus::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    bus.subscribe(EventFilter::All, move |event| sink.lock().push(event));
    (bus, log)
}

fn end_points(program: &MotionProgram) -> Vec<[f64; 3]> {
    let mut tracker = ModalTracker::new();
    let mut points = Vec::new();
    for (n, line) in program.blocks().iter().flat_map(|b| b.lines.iter()).enumerate() {
        if let Ok(Some(mv)) = tracker.apply(line, n as u32 + 1) {
            if let [Some(x), Some(y), Some(z)] = mv.end {
                points.push([x, y, z]);
            }
        }
    }
    points
}

#[test]
fn test_grid_center_is_bilinear_of_straddling_nodes() {
    let heights = [0.0, 1.0, 2.0, 1.0, 2.0, 3.0, 2.0, 3.0, 4.0];
    let map = HeightMap::from_heights(grid3(), &heights).unwrap();

    // From the origin the move spans two cells and gets split once
    let program = MotionProgram::parse("G0 X1 Y1 Z0");
    let (out, _) = compensate(&program, &map).unwrap();
    assert_eq!(out.stream_lines(), vec!["G0 X0.5 Y0.5 Z1", "G0 X1 Y1 Z2"]);

    // Off-node point inside the upper right cell
    let (x, y) = (1.5, 1.25);
    let expected = {
        let (z00, z10, z01, z11) = (2.0, 3.0, 3.0, 4.0);
        let (tx, ty) = (0.5, 0.25);
        (z00 * (1.0 - tx) + z10 * tx) * (1.0 - ty) + (z01 * (1.0 - tx) + z11 * tx) * ty
    };
    assert!((map.interpolate(x, y).unwrap() - expected).abs() < 1e-12);
}

#[test]
fn test_scan_fills_map_and_reports_failures() {
    let (bus, log) = recorded_bus();
    let mut session = Autolevel::new(grid3()).with_events(bus);
    let mut prober = SurfaceProber::new(|x, y| {
        if x == 2.0 && y == 2.0 {
            None
        } else {
            Some(-0.1 * x + 0.05 * y)
        }
    });

    let progress: Vec<_> = session
        .scan(&mut prober, params())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(progress.len(), 9);
    assert_eq!(progress.last().map(|p| (p.completed, p.total)), Some((9, 9)));
    assert_eq!(prober.probed[..4], [(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (0.0, 1.0)]);

    let map = session.height_map();
    assert!(map.is_complete());
    assert_eq!(map.degraded_points(), vec![(2, 2)]);
    // Failed corner takes the first closest neighbor in scan order
    assert!((map.z_at(2, 2) - map.z_at(2, 1)).abs() < 1e-12);

    let log = log.lock();
    let failed = log
        .iter()
        .filter(|e| matches!(e, AppEvent::Autolevel(AutolevelEvent::PointFailed { .. })))
        .count();
    assert_eq!(failed, 1);
    assert!(log
        .iter()
        .any(|e| matches!(e, AppEvent::Autolevel(AutolevelEvent::ScanCompleted { failed: 1 }))));
    assert!(log
        .iter()
        .any(|e| matches!(e, AppEvent::Error(ErrorEvent::DegradedAccuracy { failed_points: 1 }))));
}

#[test]
fn test_abort_between_points_discards_grid() {
    let (bus, log) = recorded_bus();
    let mut session = Autolevel::new(grid3()).with_events(bus);
    let handle: AbortHandle = session.abort_handle();
    let mut count = 0;
    let mut prober = SurfaceProber::new(|_, _| {
        count += 1;
        if count == 3 {
            handle.abort();
        }
        Some(0.0)
    });

    let probed = session.scan(&mut prober, params()).count();
    assert_eq!(probed, 3);
    assert!(session.height_map().is_empty());
    assert!(log.lock().iter().any(|e| matches!(
        e,
        AppEvent::Autolevel(AutolevelEvent::ScanAborted {
            completed: 3,
            total: 9
        })
    )));

    // A new scan starts from a clean abort flag
    let mut flat = SurfaceProber::new(|_, _| Some(0.0));
    assert!(session.scan(&mut flat, params()).finish().unwrap());
    assert!(session.height_map().is_complete());
}

#[test]
fn test_aborted_rescan_keeps_previous_map() {
    let mut session = Autolevel::new(grid3());
    let mut first = SurfaceProber::new(|x, _| Some(-0.1 * x));
    assert!(session.scan(&mut first, params()).finish().unwrap());
    let kept = session.height_map().clone();

    let handle = session.abort_handle();
    let mut count = 0;
    let mut second = SurfaceProber::new(|_, _| {
        count += 1;
        if count == 5 {
            handle.abort();
        }
        Some(3.0)
    });
    assert!(!session.scan(&mut second, params()).finish().unwrap());
    assert_eq!(session.height_map(), &kept);
    assert!(session.compensate(&MotionProgram::parse("G0 X2 Y0 Z0")).is_ok());

    // Stopping early through the iterator keeps it too
    let mut third = SurfaceProber::new(|_, _| Some(3.0));
    assert_eq!(session.scan(&mut third, params()).take(2).count(), 2);
    assert_eq!(session.height_map(), &kept);
}

#[test]
fn test_stopped_scan_keeps_nothing() {
    let mut session = Autolevel::new(grid3());
    let mut prober = SurfaceProber::new(|_, _| Some(0.5));
    let taken = session.scan(&mut prober, params()).take(4).count();
    assert_eq!(taken, 4);
    assert!(session.height_map().is_empty());

    let program = MotionProgram::parse("G0 X0 Y0 Z0");
    assert!(matches!(
        session.compensate(&program),
        Err(AutolevelError::IncompleteHeightMap { expected: 9, got: 0 })
    ));
}

struct BrokenProber;

impl Prober for BrokenProber {
    fn probe(&mut self, x: f64, y: f64, _: f64, _: f64, _: f64) -> Result<ProbePoint, AutolevelError> {
        Err(AutolevelError::ProbeTimeout {
            x,
            y,
            timeout_ms: 10,
        })
    }
}

#[test]
fn test_prober_error_ends_scan() {
    let mut session = Autolevel::new(grid3());
    let mut prober = BrokenProber;
    let mut scan = session.scan(&mut prober, params());
    assert!(matches!(scan.next(), Some(Err(AutolevelError::ProbeTimeout { .. }))));
    assert!(scan.next().is_none());
    drop(scan);
    assert!(session.height_map().is_empty());
}

#[test]
fn test_height_map_survives_save_and_load() {
    let mut session = Autolevel::new(grid3());
    let mut prober = SurfaceProber::new(|x, y| Some(x * y * 0.1));
    session.scan(&mut prober, params()).finish().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("map.json");
    session.height_map().save(&path).unwrap();

    let mut restored = Autolevel::new(ProbeGrid::new(0.0, 1.0, 0.0, 1.0, 1.0, 1.0).unwrap());
    restored.set_height_map(HeightMap::load(&path).unwrap());
    assert_eq!(restored.grid(), session.grid());
    assert_eq!(restored.height_map(), session.height_map());
}

#[test]
fn test_controller_prober_scans_simulated_surface() {
    let mut config = Config::default();
    config.connection.status_poll_ms = 5;
    config.connection.read_timeout_ms = 2;
    config.autolevel.probe_timeout_ms = 10_000;
    let mut controller = CncController::new(config.clone());
    let sim = SimulatedGrbl::new().with_surface(|x, y| {
        if x > 1.5 && y > 1.5 {
            None
        } else {
            Some(-1.0 + 0.25 * x - 0.5 * y)
        }
    });
    controller.connect_simulated(sim.clone()).unwrap();
    assert!(controller.wait_for(Duration::from_secs(5), |s| s.controller_state.is_quiescent()));

    let grid = ProbeGrid::new(0.0, 2.0, 0.0, 2.0, 2.0, 2.0).unwrap();
    let mut session = Autolevel::new(grid);
    let mut prober = ControllerProber::from_controller(&controller, &config.autolevel);
    let params = ScanParams {
        z_min: -5.0,
        z_max: 2.0,
        feed: 100.0,
    };
    assert!(session.scan(&mut prober, params).finish().unwrap());

    let map = session.height_map();
    let z: Vec<f64> = map.points().iter().map(|p| p.position.z).collect();
    assert!((z[0] + 1.0).abs() < 1e-3);
    assert!((z[1] + 0.5).abs() < 1e-3);
    assert!((z[2] + 2.0).abs() < 1e-3);
    assert_eq!(map.degraded_points(), vec![(1, 1)]);
    // G38.3 misses without raising an alarm
    assert!(!sim.is_alarmed());
    controller.disconnect();
}

#[test]
fn test_margins_follow_loaded_program() {
    let mut config = Config::default();
    config.connection.status_poll_ms = 5;
    config.connection.read_timeout_ms = 2;
    let mut controller = CncController::new(config);
    let sim = SimulatedGrbl::new();
    controller.connect_simulated(sim.clone()).unwrap();
    assert!(controller.wait_for(Duration::from_secs(5), |s| s.controller_state.is_quiescent()));

    let program = MotionProgram::parse("G0 X1 Y2 Z3\nG1 X6 Y2 Z-0.5 F200\nG1 X6 Y4\nG0 Z3");
    controller.run().load_program(&program);
    let grid = ProbeGrid::from_margins(controller.state(), 2.5, 1.0).unwrap();
    assert_eq!((grid.xmin, grid.xmax, grid.ymin, grid.ymax), (1.0, 6.0, 2.0, 4.0));
    assert_eq!((grid.nx, grid.ny), (3, 3));

    let session = Autolevel::new(grid);
    session.scan_margins(controller.run(), params()).unwrap();
    assert!(controller.wait_for_run(Duration::from_secs(10)));
    assert_eq!(
        sim.received_lines()
            .into_iter()
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>(),
        vec!["G90", "G0 Z2", "G0 X1 Y2", "G0 X1 Y4", "G0 X6 Y4", "G0 X6 Y2", "G0 X1 Y2"]
    );
    let end = sim.machine_position();
    assert_eq!((end.x, end.y, end.z), (1.0, 2.0, 2.0));
    controller.disconnect();
}

#[test]
fn test_controller_prober_needs_connection() {
    let controller = CncController::new(Config::default());
    let mut prober = ControllerProber::from_controller(&controller, &Config::default().autolevel);
    assert!(matches!(
        prober.probe(0.0, 0.0, -1.0, 1.0, 10.0),
        Err(AutolevelError::Run(_))
    ));
}

fn program_strategy() -> impl Strategy<Value = Vec<(f64, f64, f64)>> {
    proptest::collection::vec((-5.0f64..15.0, -5.0f64..15.0, -2.0f64..1.0), 1..20)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_flat_map_keeps_geometry(moves in program_strategy()) {
        let grid = ProbeGrid::new(0.0, 10.0, 0.0, 10.0, 2.5, 2.5).unwrap();
        let map = HeightMap::from_heights(grid, &vec![0.0; grid.len()]).unwrap();
        let text: String = moves
            .iter()
            .map(|(x, y, z)| format!("G1 X{:.3} Y{:.3} Z{:.3} F500\n", x, y, z))
            .collect();
        let program = MotionProgram::parse(&text);

        let (out, report) = compensate(&program, &map).unwrap();
        prop_assert_eq!(report.moves_compensated, moves.len());

        let original = end_points(&program);
        let compensated = end_points(&out);
        // Every original end point appears, in order, unchanged
        let mut cursor = compensated.iter();
        for point in &original {
            prop_assert!(cursor.any(|p| p == point));
        }
        // Inserted points never leave the original segments' Z range,
        // the first segment starting at the origin
        let (lo, hi) = original
            .iter()
            .fold((0.0f64, 0.0f64), |(lo, hi), p| (lo.min(p[2]), hi.max(p[2])));
        prop_assert!(compensated.iter().all(|p| p[2] >= lo - 1e-9 && p[2] <= hi + 1e-9));
    }
}
