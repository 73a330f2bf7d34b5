//! Runs, directives and tool changes end to end

mod common;

use std::sync::Arc;
use std::time::Duration;

use cncstream_communication::{CncController, SimulatedGrbl};
use cncstream_core::{
    AppEvent, EventFilter, MachineEvent, RunError, RunEvent, RunOutcome, SerialEvent, Value,
};
use cncstream_settings::{Config, ToolChangePolicy};
use common::{connected, connected_with};
use parking_lot::Mutex;

fn outcomes(rig: &common::Rig) -> Vec<RunOutcome> {
    rig.events(|e| match e {
        AppEvent::Run(RunEvent::Ended { outcome, .. }) => Some(outcome.clone()),
        _ => None,
    })
}

#[test]
fn test_probe_recorded_before_next_line_is_sent() {
    let mut rig = connected(SimulatedGrbl::new().with_surface(|_, _| Some(-4.2)));

    // Probe Z as seen at the moment G90 goes out
    let seen: Arc<Mutex<Option<f64>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let state = rig.state.clone();
    rig.events.subscribe(EventFilter::All, move |event| {
        if let AppEvent::Serial(SerialEvent::Sent { line }) = event {
            if line == "G90" {
                *sink.lock() = state.read(|s| s.probe.map(|p| p.position.z));
            }
        }
    });

    assert!(rig.run.run_lines(&["G91", "G38.2 Z-10 F50", "%wait", "G90"]));
    rig.drive(|r| !r.run.is_running());

    let recorded = *seen.lock();
    let z = recorded.expect("probe recorded before G90");
    assert!((z + 4.2).abs() < 1e-9);
    assert_eq!(outcomes(&rig), vec![RunOutcome::Completed]);
    assert_eq!(rig.sent(), vec!["G91", "G38.2 Z-10 F50", "G90"]);
}

#[test]
fn test_run_progress_and_completion() {
    let mut rig = connected(SimulatedGrbl::new().with_jitter(5).with_motion_polls(2));
    let lines: Vec<String> = (0..30).map(|i| format!("G1 X{} F500", i)).collect();
    assert!(rig.run.run_lines(&lines));
    assert!(!rig.run.run_lines(&["G0 X0"]));
    rig.drive(|r| !r.run.is_running());

    let progress = rig.events(|e| match e {
        AppEvent::Run(RunEvent::Progress { completed, total }) => Some((*completed, *total)),
        _ => None,
    });
    assert_eq!(progress.len(), 30);
    assert_eq!(progress.last(), Some(&(30, 30)));
    let ended = rig.events(|e| match e {
        AppEvent::Run(RunEvent::Ended { lines, .. }) => Some(*lines),
        _ => None,
    });
    assert_eq!(ended, vec![30]);
    // Completion waits for the machine to come to rest
    assert!(rig.state.controller_state().is_quiescent());
}

#[test]
fn test_variables_substituted_at_dequeue() {
    let mut rig = connected(SimulatedGrbl::new());
    assert!(rig.run.run_lines(&[
        "G0 X7.5",
        "%wait",
        "%global home_x; home_x=wx*2",
        "G0 X[home_x] (doubled)",
        "%update home_x",
        "%msg done",
    ]));
    rig.drive(|r| !r.run.is_running());

    assert_eq!(rig.sent(), vec!["G0 X7.5", "G0 X15"]);
    let updates = rig.events(|e| match e {
        AppEvent::Machine(MachineEvent::GenericUpdate { key }) => Some(key.clone()),
        _ => None,
    });
    assert!(updates.contains(&"home_x".to_string()));
    let messages = rig.events(|e| match e {
        AppEvent::Run(RunEvent::Message { text }) => Some(text.clone()),
        _ => None,
    });
    assert_eq!(messages, vec!["done".to_string()]);
}

#[test]
fn test_tool_change_suspends_until_acknowledged() {
    let mut config = Config::default();
    config.tool_change.policy = ToolChangePolicy::NoProbe;
    config.tool_change.wait_after_probe = false;
    config.tool_change.change_z = -1.0;
    let mut rig = connected_with(SimulatedGrbl::new(), &config);

    assert!(rig.run.run_lines(&["G0 X5", "T2 M6", "G0 X1"]));
    rig.drive(|r| r.run.suspension().is_some());
    let suspension = rig.run.suspension().unwrap();
    assert_eq!(suspension.tool, 2);

    // Nothing past the change position goes out while suspended
    rig.spin(20);
    let sent = rig.sent();
    assert_eq!(sent.last().map(String::as_str), Some("G53 G0 X0 Y0"));
    assert!(!sent.contains(&"G0 X1".to_string()));
    assert!(rig.run.is_running());

    assert_eq!(
        rig.run.acknowledge_tool_change(suspension.token + 1),
        Err(RunError::StaleToolChangeToken {
            token: suspension.token + 1
        })
    );
    rig.run.acknowledge_tool_change(suspension.token).unwrap();
    rig.drive(|r| !r.run.is_running());

    let sent = rig.sent();
    assert_eq!(
        &sent[sent.len() - 4..],
        ["G90", "G0 X5 Y0", "G0 Z0", "G0 X1"]
    );
    let pending = rig.events(|e| match e {
        AppEvent::Run(RunEvent::ToolChangePending { tool, token }) => Some((*tool, *token)),
        _ => None,
    });
    assert_eq!(pending, vec![(2, suspension.token)]);
    assert_eq!(outcomes(&rig), vec![RunOutcome::Completed]);
}

#[test]
fn test_tlo_tool_change_probes_and_applies_offset() {
    let mut config = Config::default();
    config.tool_change.policy = ToolChangePolicy::Tlo;
    config.tool_change.wait_after_probe = false;
    config.tool_change.probe_z = -2.0;
    config.tool_change.distance = 10.0;
    config.tool_change.tool_mz = -6.0;
    let sim = SimulatedGrbl::new().with_surface(|_, _| Some(-7.5));
    let mut rig = connected_with(sim, &config);

    assert!(rig.run.run_lines(&["M6 T1"]));
    rig.drive(|r| r.run.suspension().is_some());
    let token = rig.run.suspension().unwrap().token;
    rig.run.acknowledge_tool_change(token).unwrap();
    rig.drive(|r| !r.run.is_running());

    assert!(rig.sent().contains(&"G43.1 Z-1.5".to_string()));
    assert!((rig.sim.tool_offset() + 1.5).abs() < 1e-9);
    assert_eq!(rig.state.read(|s| s.tlo), -1.5);
}

#[test]
fn test_tape_markers_are_ignored() {
    let mut rig = connected(SimulatedGrbl::new());
    assert!(rig.run.run_lines(&["%", "G0 X1", "%"]));
    rig.drive(|r| !r.run.is_running());
    assert_eq!(rig.sent(), vec!["G0 X1"]);
    assert_eq!(outcomes(&rig), vec![RunOutcome::Completed]);
}

#[test]
fn test_calibrate_tool_height_stores_reference() {
    let sim = SimulatedGrbl::new().with_surface(|_, _| Some(-7.5));
    let mut rig = connected(sim);
    rig.run.calibrate_tool_height().unwrap();
    rig.drive(|r| !r.run.is_running());

    assert_eq!(
        rig.sent(),
        vec![
            "G53 G0 Z-1",
            "G53 G0 X0 Y0",
            "G53 G0 X0 Y0",
            "G53 G0 Z-1",
            "G91 G38.2 F100 Z-10",
            "G38.4 F100 Z6.5",
            "G91 G38.2 F10 Z-3.5",
            "G4 P1",
            "G53 G0 Z-1",
            "G53 G0 X0 Y0",
            "G90",
        ]
    );
    assert_eq!(rig.state.get("toolheight"), Some(Value::Number(-7.5)));
    assert_eq!(rig.state.get("toolmz"), Some(Value::Number(-7.5)));
    assert_eq!(outcomes(&rig), vec![RunOutcome::Completed]);
}

#[test]
fn test_manual_tool_change_restores_position() {
    let mut config = Config::default();
    config.tool_change.wait_after_probe = false;
    let mut rig = connected_with(SimulatedGrbl::new(), &config);
    assert!(rig.run.run_lines(&["G0 X4 Y2 Z1"]));
    rig.drive(|r| !r.run.is_running());

    rig.run.change_tool(3).unwrap();
    rig.drive(|r| r.run.suspension().is_some());
    let suspension = rig.run.suspension().unwrap();
    assert_eq!(suspension.tool, 3);
    assert_eq!(rig.sent().last().map(String::as_str), Some("G53 G0 X0 Y0"));

    rig.run.acknowledge_tool_change(suspension.token).unwrap();
    rig.drive(|r| !r.run.is_running());
    assert_eq!(
        rig.sent(),
        vec![
            "G0 X4 Y2 Z1",
            "M5",
            "G53 G0 Z-1",
            "G53 G0 X0 Y0",
            "G90",
            "G0 X4 Y2",
            "G0 Z1",
        ]
    );
    let machine = rig.sim.machine_position();
    assert_eq!((machine.x, machine.y, machine.z), (4.0, 2.0, 1.0));
    let messages = rig.events(|e| match e {
        AppEvent::Run(RunEvent::Message { text }) => Some(text.clone()),
        _ => None,
    });
    assert_eq!(messages, vec!["Tool change T03".to_string()]);
}

#[test]
fn test_spindle_and_rapid_overrides_reach_controller() {
    let mut rig = connected(SimulatedGrbl::new());
    rig.drive(|r| r.state.read(|s| s.status_seq > 0));
    rig.run.set_spindle_override(120);
    rig.run.set_rapid_override(30);
    rig.drive(|r| r.state.read(|s| s.overrides.spindle == 120 && s.overrides.rapid == 25));

    let overrides: Vec<u8> = rig
        .sim
        .realtime_bytes()
        .into_iter()
        .filter(|b| *b >= 0x80)
        .collect();
    assert_eq!(overrides, vec![0x9A, 0x9A, 0x97]);
    assert_eq!(rig.state.read(|s| s.overrides.feed), 100);
}

#[test]
fn test_single_probe_and_return_to_contact() {
    let mut rig = connected(SimulatedGrbl::new().with_surface(|_, _| Some(-2.0)));
    assert_eq!(rig.run.goto_probe(), Err(RunError::NoProbeRecord));
    assert!(matches!(
        rig.run.probe(None, None, None, Some(50.0)),
        Err(RunError::InvalidProbe { .. })
    ));

    rig.run.probe(None, None, Some(-5.0), None).unwrap();
    rig.drive(|r| r.state.read(|s| s.probe.is_some()) && r.idle());
    rig.run.send_gcode("G0 Z3").unwrap();
    rig.drive(|r| r.idle());
    rig.run.goto_probe().unwrap();
    rig.drive(|r| r.idle());

    assert_eq!(rig.sent(), vec!["G38.2 Z-5 F10", "G0 Z3", "G90 G0 X0 Y0 Z-2"]);
    assert_eq!(rig.sim.work_position().z, -2.0);
}

#[test]
fn test_probe_center_touches_both_walls() {
    // Simulated walls sit at the end of each probing move
    let mut rig = connected(SimulatedGrbl::new().with_surface(|_, _| Some(0.0)));
    assert!(matches!(
        rig.run.probe_center(0.0),
        Err(RunError::InvalidProbe { .. })
    ));
    rig.run.probe_center(20.0).unwrap();
    rig.drive(|r| !r.run.is_running());

    assert_eq!(
        rig.sent(),
        vec![
            "G91 G38.2 F10 X-20",
            "G90 G0 X-18",
            "G91 G38.2 F10 X20",
            "G90 G0 X-9",
            "G91 G38.2 F10 Y-20",
            "G90 G0 Y-18",
            "G91 G38.2 F10 Y20",
            "G90 G0 Y-9",
            "G90",
        ]
    );
    let work = rig.sim.work_position();
    assert_eq!((work.x, work.y), (-9.0, -9.0));
    assert_eq!(outcomes(&rig), vec![RunOutcome::Completed]);
}

#[test]
fn test_stop_clears_run_and_resets() {
    let mut rig = connected(SimulatedGrbl::new().with_jitter(9));
    let lines: Vec<String> = (0..200).map(|i| format!("G1 X{} F100", i)).collect();
    assert!(rig.run.run_lines(&lines));
    rig.spin(5);
    rig.run.stop().unwrap();
    assert_eq!(rig.run.queue_len(), 0);
    assert!(!rig.run.is_running());
    assert_eq!(rig.run.stop(), Err(RunError::NotRunning));

    rig.drive(|r| r.engine.flow().is_empty() && r.state.controller_state().is_quiescent());
    assert!(rig.sim.realtime_bytes().contains(&0x18));
    assert_eq!(outcomes(&rig), vec![RunOutcome::Stopped]);
    assert!(rig.sent().len() < 200);
}

#[test]
fn test_transport_loss_fails_run() {
    let mut rig = connected(SimulatedGrbl::new().with_jitter(2));
    let lines: Vec<String> = (0..100).map(|i| format!("G1 X{} F100", i)).collect();
    assert!(rig.run.run_lines(&lines));
    rig.spin(3);
    rig.sim.fail_transport();
    let _ = (0..10).find_map(|_| rig.engine.poll().err());

    assert!(!rig.run.is_running());
    assert_eq!(rig.run.queue_len(), 0);
    assert!(matches!(outcomes(&rig).as_slice(), [RunOutcome::Failed(_)]));
}

#[test]
fn test_threaded_controller_streams_program() {
    let mut config = Config::default();
    config.connection.status_poll_ms = 5;
    config.connection.read_timeout_ms = 2;
    let mut controller = CncController::new(config);
    let sim = SimulatedGrbl::new().with_jitter(1);
    controller.connect_simulated(sim.clone()).unwrap();
    assert!(controller.wait_for(Duration::from_secs(5), |s| s.controller_state.is_quiescent()));

    let lines: Vec<String> = (0..50).map(|i| format!("G1 Y{} F800", i)).collect();
    assert!(controller.run().run_lines(&lines));
    assert!(controller.wait_for_run(Duration::from_secs(10)));
    assert_eq!(sim.machine_position().y, 49.0);

    controller.disconnect();
    assert!(!controller.is_connected());
    assert_eq!(
        controller.run().try_run_lines(&["G0 X0"]),
        Err(RunError::NotConnected)
    );
}
