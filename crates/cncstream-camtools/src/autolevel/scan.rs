//! Grid probing sequencer
//!
//! [`Autolevel::scan`] returns a [`Scan`], a lazy iterator that probes one
//! grid node per `next()` call. Points collect in a separate map that
//! replaces the session's map only once every node has been probed. Aborting,
//! dropping the iterator early or a prober error discard the partial grid and
//! leave the previous map in place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cncstream_communication::RunController;
use cncstream_core::{AppEvent, AutolevelEvent, ErrorEvent, EventBus, Position, ProbePoint};
use cncstream_gcode::MotionProgram;
use cncstream_settings::{AutolevelSettings, Config};

use super::compensate::{compensate, CompensationReport};
use super::grid::ProbeGrid;
use super::height_map::HeightMap;
use crate::error::AutolevelError;

/// Something that can probe the surface at one XY position
pub trait Prober {
    /// Probe from `z_max` down towards `z_min` at `(x, y)`
    ///
    /// A miss is `Ok` with `success == false`. `Err` means probing cannot
    /// continue and ends the scan.
    fn probe(
        &mut self,
        x: f64,
        y: f64,
        z_min: f64,
        z_max: f64,
        feed: f64,
    ) -> Result<ProbePoint, AutolevelError>;
}

/// Probe depth, travel height and feed of a scan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanParams {
    pub z_min: f64,
    pub z_max: f64,
    pub feed: f64,
}

impl ScanParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            z_min: config.autolevel.zmin,
            z_max: config.autolevel.zmax,
            feed: config.probe.feed,
        }
    }
}

/// Requests an abort between two probe points, from any thread
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Progress after one probed node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanProgress {
    pub point: ProbePoint,
    pub completed: usize,
    pub total: usize,
}

/// Autolevel session: the grid, the last complete height map and its events
pub struct Autolevel {
    grid: ProbeGrid,
    map: HeightMap,
    events: Option<Arc<EventBus>>,
    abort: AbortHandle,
}

impl Autolevel {
    pub fn new(grid: ProbeGrid) -> Self {
        Self {
            grid,
            map: HeightMap::new(grid),
            events: None,
            abort: AbortHandle::default(),
        }
    }

    pub fn from_settings(settings: &AutolevelSettings) -> Result<Self, AutolevelError> {
        Ok(Self::new(ProbeGrid::from_settings(settings)?))
    }

    /// Publish scan events on a bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn grid(&self) -> &ProbeGrid {
        &self.grid
    }

    /// Change the grid; the current height map is dropped
    pub fn set_grid(&mut self, grid: ProbeGrid) {
        self.grid = grid;
        self.map = HeightMap::new(grid);
    }

    pub fn height_map(&self) -> &HeightMap {
        &self.map
    }

    /// Install a loaded height map together with its grid
    pub fn set_height_map(&mut self, map: HeightMap) {
        self.grid = *map.grid();
        self.map = map;
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Start probing the grid; the current map stays until the scan completes
    pub fn scan<'a, P: Prober>(&'a mut self, prober: &'a mut P, params: ScanParams) -> Scan<'a, P> {
        self.abort.reset();
        let total = self.grid.len();
        tracing::info!(
            "Autolevel scan of {}x{} nodes, Z {} to {}",
            self.grid.nx,
            self.grid.ny,
            params.z_max,
            params.z_min
        );
        self.publish(AutolevelEvent::ScanStarted { total });
        Scan {
            partial: HeightMap::new(self.grid),
            session: self,
            prober,
            params,
            next: 0,
            state: ScanState::Running,
        }
    }

    /// Trace the grid outline at the scan's travel height as its own run
    pub fn scan_margins(
        &self,
        run: &RunController,
        params: ScanParams,
    ) -> Result<u64, AutolevelError> {
        tracing::info!(
            "Tracing autolevel margins X {} to {}, Y {} to {}",
            self.grid.xmin,
            self.grid.xmax,
            self.grid.ymin,
            self.grid.ymax
        );
        Ok(run.try_run_lines(&self.grid.margin_lines(params.z_max))?)
    }

    /// Compensate a program with the current height map
    pub fn compensate(
        &self,
        program: &MotionProgram,
    ) -> Result<(MotionProgram, CompensationReport), AutolevelError> {
        let (compensated, report) = compensate(program, &self.map)?;
        if report.degraded_points > 0 {
            tracing::warn!(
                "Compensation used {} interpolated probe points",
                report.degraded_points
            );
            self.publish_error(ErrorEvent::DegradedAccuracy {
                failed_points: report.degraded_points,
            });
        }
        Ok((compensated, report))
    }

    fn publish(&self, event: AutolevelEvent) {
        if let Some(events) = &self.events {
            let _ = events.publish(AppEvent::Autolevel(event));
        }
    }

    fn publish_error(&self, event: ErrorEvent) {
        if let Some(events) = &self.events {
            let _ = events.publish(AppEvent::Error(event));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Running,
    Completed,
    Discarded,
}

/// Lazy probe sequence over the grid, row-major
pub struct Scan<'a, P: Prober> {
    session: &'a mut Autolevel,
    partial: HeightMap,
    prober: &'a mut P,
    params: ScanParams,
    next: usize,
    state: ScanState,
}

impl<P: Prober> Scan<'_, P> {
    pub fn total(&self) -> usize {
        self.session.grid.len()
    }

    /// Points probed so far
    pub fn completed(&self) -> usize {
        self.next
    }

    pub fn is_complete(&self) -> bool {
        self.state == ScanState::Completed
    }

    /// Stop now and discard the partial grid
    pub fn abort(&mut self) {
        if self.state == ScanState::Running {
            self.discard();
        }
    }

    /// Probe the remaining points; true if the grid was completed
    pub fn finish(mut self) -> Result<bool, AutolevelError> {
        for step in self.by_ref() {
            step?;
        }
        Ok(self.is_complete())
    }

    fn discard(&mut self) {
        self.state = ScanState::Discarded;
        self.partial.clear();
        tracing::info!("Autolevel scan aborted at {}/{}", self.next, self.total());
        self.session.publish(AutolevelEvent::ScanAborted {
            completed: self.next,
            total: self.total(),
        });
    }
}

impl<P: Prober> Iterator for Scan<'_, P> {
    type Item = Result<ScanProgress, AutolevelError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != ScanState::Running {
            return None;
        }
        if self.session.abort.is_aborted() {
            self.discard();
            return None;
        }

        let total = self.total();
        let (i, j) = self.session.grid.coords(self.next);
        let (x, y) = self.session.grid.node(i, j);
        let ScanParams { z_min, z_max, feed } = self.params;

        let mut point = match self.prober.probe(x, y, z_min, z_max, feed) {
            Ok(point) => point,
            Err(e) => {
                tracing::error!("Probing {:.3},{:.3} failed: {}", x, y, e);
                self.discard();
                return Some(Err(e));
            }
        };
        point.target = Position::new(x, y, z_min);
        if !point.success {
            tracing::warn!("No contact at {:.3},{:.3}", x, y);
            self.session.publish(AutolevelEvent::PointFailed { x, y });
        }

        self.partial.push(point);
        self.next += 1;
        self.session.publish(AutolevelEvent::PointProbed {
            point,
            completed: self.next,
            total,
        });

        if self.next == total {
            self.state = ScanState::Completed;
            let fresh = HeightMap::new(self.session.grid);
            self.session.map = std::mem::replace(&mut self.partial, fresh);
            let failed = self.session.map.degraded_points().len();
            tracing::info!("Autolevel scan completed, {} failed points", failed);
            self.session.publish(AutolevelEvent::ScanCompleted { failed });
            if failed > 0 {
                self.session.publish_error(ErrorEvent::DegradedAccuracy {
                    failed_points: failed,
                });
            }
        }

        Some(Ok(ScanProgress {
            point,
            completed: self.next,
            total,
        }))
    }
}

impl<P: Prober> Drop for Scan<'_, P> {
    fn drop(&mut self) {
        if self.state == ScanState::Running {
            self.discard();
        }
    }
}
