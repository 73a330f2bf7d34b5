//! Probing through a connected controller

use std::time::{Duration, Instant};

use cncstream_communication::{CncController, RunController};
use cncstream_core::{MachineStateBus, Position, ProbePoint, RunError};
use cncstream_settings::AutolevelSettings;

use super::grid::probe_lines;
use super::scan::Prober;
use crate::error::AutolevelError;

const WAIT_INTERVAL: Duration = Duration::from_millis(5);

/// [`Prober`] that runs a short probing program per point
///
/// Needs the controller's I/O thread running: each call blocks until the
/// probe run has ended and a new `[PRB:...]` record is in the state bus.
pub struct ControllerProber {
    run: RunController,
    state: MachineStateBus,
    command: String,
    timeout: Duration,
}

impl ControllerProber {
    pub fn new(run: RunController, state: MachineStateBus) -> Self {
        Self {
            run,
            state,
            command: "G38.3".to_string(),
            timeout: Duration::from_millis(AutolevelSettings::default().probe_timeout_ms),
        }
    }

    pub fn from_controller(controller: &CncController, settings: &AutolevelSettings) -> Self {
        Self::new(controller.run().clone(), controller.state().clone())
            .with_timeout(Duration::from_millis(settings.probe_timeout_ms))
    }

    /// Probe command, `G38.3` unless changed; `G38.2` alarms on a miss
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Prober for ControllerProber {
    fn probe(
        &mut self,
        x: f64,
        y: f64,
        z_min: f64,
        z_max: f64,
        feed: f64,
    ) -> Result<ProbePoint, AutolevelError> {
        if self.run.is_running() {
            return Err(AutolevelError::MachineBusy);
        }
        let before = self.state.read(|s| s.probe_seq);
        self.run
            .try_run_lines(&probe_lines(x, y, z_min, z_max, feed, &self.command))?;

        let started = Instant::now();
        loop {
            let (seq, probe, connected) = self.state.read(|s| {
                (s.probe_seq, s.probe, s.controller_state.is_connected())
            });
            if !self.run.is_running() {
                if !connected {
                    return Err(RunError::NotConnected.into());
                }
                return match probe.filter(|_| seq > before) {
                    Some(point) => Ok(ProbePoint {
                        target: Position::new(x, y, z_min),
                        ..point
                    }),
                    None => Err(AutolevelError::NoProbeRecord { x, y }),
                };
            }
            if started.elapsed() >= self.timeout {
                if let Err(e) = self.run.stop() {
                    tracing::debug!("Stopping timed out probe run: {}", e);
                }
                return Err(AutolevelError::ProbeTimeout {
                    x,
                    y,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(WAIT_INTERVAL);
        }
    }
}
