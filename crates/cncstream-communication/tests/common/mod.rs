//! Shared fixtures: an engine over the simulator, driven by hand

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use cncstream_communication::{
    EngineConfig, ProtocolEngine, QueueHandles, RunController, SimulatedGrbl, TransportParams,
};
use cncstream_core::{AppEvent, EventBus, EventFilter, MachineStateBus};
use cncstream_settings::Config;
use parking_lot::Mutex;

pub struct Rig {
    pub sim: SimulatedGrbl,
    pub engine: ProtocolEngine,
    pub state: MachineStateBus,
    pub events: Arc<EventBus>,
    pub handles: QueueHandles,
    pub run: RunController,
    pub log: Arc<Mutex<Vec<AppEvent>>>,
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        rx_buffer_size: 128,
        status_poll: Duration::from_millis(2),
        handshake_timeout: Some(Duration::from_secs(2)),
        axis_count: 3,
    }
}

pub fn rig_with(sim: SimulatedGrbl, engine: EngineConfig, config: &Config) -> Rig {
    let state = MachineStateBus::new();
    let events = Arc::new(EventBus::new());
    let handles = QueueHandles::new();
    let log = record(&events);
    let params = TransportParams::new("sim", 115200).with_read_timeout(Duration::from_millis(1));
    let engine = ProtocolEngine::new(
        Box::new(sim.clone()),
        params,
        engine,
        state.clone(),
        events.clone(),
        handles.clone(),
    );
    let run = RunController::new(state.clone(), events.clone(), handles.clone(), config);
    Rig {
        sim,
        engine,
        state,
        events,
        handles,
        run,
        log,
    }
}

/// Connected rig over the given simulator
pub fn connected(sim: SimulatedGrbl) -> Rig {
    connected_with(sim, &Config::default())
}

pub fn connected_with(sim: SimulatedGrbl, config: &Config) -> Rig {
    let mut rig = rig_with(sim, engine_config(), config);
    rig.engine.connect().expect("simulator handshake");
    rig
}

pub fn record(events: &EventBus) -> Arc<Mutex<Vec<AppEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    events.subscribe(EventFilter::All, move |event| sink.lock().push(event));
    log
}

impl Rig {
    /// Poll until `done` holds; panics after ten seconds
    pub fn drive(&mut self, mut done: impl FnMut(&Rig) -> bool) {
        let start = Instant::now();
        while !done(self) {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "condition not reached"
            );
            self.engine.poll().expect("poll");
        }
    }

    /// Poll a fixed number of cycles
    pub fn spin(&mut self, cycles: usize) {
        for _ in 0..cycles {
            self.engine.poll().expect("poll");
        }
    }

    /// Lines the simulator received, wake-up blanks removed
    pub fn sent(&self) -> Vec<String> {
        self.sim
            .received_lines()
            .into_iter()
            .filter(|l| !l.is_empty())
            .collect()
    }

    pub fn events<T>(&self, pick: impl Fn(&AppEvent) -> Option<T>) -> Vec<T> {
        self.log.lock().iter().filter_map(pick).collect()
    }

    pub fn idle(&self) -> bool {
        self.handles.queue_len() == 0 && self.engine.flow().is_empty()
    }
}
