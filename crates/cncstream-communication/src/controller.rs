//! Threaded controller facade
//!
//! [`CncController`] owns the I/O thread that drives the
//! [`ProtocolEngine`], and hands out the state bus, the event bus and the
//! [`RunController`] to everything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cncstream_core::{ConnectionError, EventBus, MachineState, MachineStateBus};
use cncstream_settings::Config;

use crate::communication::{SerialTransport, SimulatedGrbl, Transport, TransportParams};
use crate::firmware::grbl::{EngineConfig, ProtocolEngine};
use crate::queue::QueueHandles;
use crate::run::RunController;

struct IoThread {
    handle: JoinHandle<ProtocolEngine>,
    shutdown: Arc<AtomicBool>,
}

/// One machine connection with its I/O thread
pub struct CncController {
    config: Config,
    state: MachineStateBus,
    events: Arc<EventBus>,
    handles: QueueHandles,
    run: RunController,
    io: Option<IoThread>,
}

impl CncController {
    pub fn new(config: Config) -> Self {
        Self::with_event_bus(config, Arc::new(EventBus::new()))
    }

    /// Controller publishing on an existing event bus
    pub fn with_event_bus(config: Config, events: Arc<EventBus>) -> Self {
        let state = MachineStateBus::new();
        let handles = QueueHandles::new();
        let run = RunController::new(state.clone(), events.clone(), handles.clone(), &config);
        Self {
            config,
            state,
            events,
            handles,
            run,
            io: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &MachineStateBus {
        &self.state
    }

    pub fn snapshot(&self) -> MachineState {
        self.state.snapshot()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn run(&self) -> &RunController {
        &self.run
    }

    /// I/O thread running and the engine still connected
    pub fn is_connected(&self) -> bool {
        self.io.as_ref().is_some_and(|io| !io.handle.is_finished())
            && self.state.controller_state().is_connected()
    }

    /// Open the configured serial port
    pub fn connect_serial(&mut self) -> Result<(), ConnectionError> {
        let params = TransportParams::from_settings(&self.config.connection);
        self.connect(Box::new(SerialTransport::new()), params)
    }

    /// Connect to an in-process simulator
    pub fn connect_simulated(&mut self, sim: SimulatedGrbl) -> Result<(), ConnectionError> {
        let params = TransportParams::from_settings(&self.config.connection);
        self.connect(Box::new(sim), params)
    }

    /// Connect over any transport and start the I/O thread
    pub fn connect(
        &mut self,
        transport: Box<dyn Transport>,
        params: TransportParams,
    ) -> Result<(), ConnectionError> {
        if let Some(io) = &self.io {
            if !io.handle.is_finished() {
                return Err(ConnectionError::AlreadyConnected);
            }
        }
        self.reap();

        let port = params.port.clone();
        let mut engine = ProtocolEngine::new(
            transport,
            params,
            EngineConfig::from_config(&self.config),
            self.state.clone(),
            self.events.clone(),
            self.handles.clone(),
        );
        engine.connect()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("cncstream-io".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Err(e) = engine.poll() {
                        if !engine.is_connected() {
                            tracing::debug!("I/O loop ending: {}", e);
                            break;
                        }
                    }
                }
                if stop.load(Ordering::Relaxed) {
                    engine.disconnect();
                }
                engine
            })
            .map_err(|e| ConnectionError::FailedToOpen {
                port,
                reason: e.to_string(),
            })?;

        self.io = Some(IoThread { handle, shutdown });
        Ok(())
    }

    /// Join a finished I/O thread
    fn reap(&mut self) {
        if let Some(io) = self.io.take() {
            io.shutdown.store(true, Ordering::Relaxed);
            if io.handle.join().is_err() {
                tracing::error!("I/O thread panicked");
            }
        }
    }

    /// Stop the I/O thread and close the transport
    pub fn disconnect(&mut self) {
        self.reap();
    }

    /// Block until the active run ends or `timeout` passes; true if it ended
    pub fn wait_for_run(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.run.is_running() {
            if start.elapsed() >= timeout || self.io.as_ref().map_or(true, |io| io.handle.is_finished())
            {
                return !self.run.is_running();
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Block until `condition` holds for the machine state or `timeout` passes
    pub fn wait_for(&self, timeout: Duration, condition: impl Fn(&MachineState) -> bool) -> bool {
        let start = Instant::now();
        loop {
            if self.state.read(&condition) {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for CncController {
    fn drop(&mut self) {
        self.reap();
    }
}
