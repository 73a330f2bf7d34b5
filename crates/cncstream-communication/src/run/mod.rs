//! Run controller
//!
//! Turns programs into queue items for the protocol engine and supervises
//! the active run: pause, resume, stop, reset, and the tool-change
//! suspension. Every operation only touches the shared queue, the run
//! tracker and the control mailbox, so none of them block on the transport.

pub mod directive;
pub mod probe;
pub mod tool_change;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use cncstream_core::{
    format_number, thread_safe_rw, AppEvent, Axis, EventBus, MachineEvent, MachineStateBus,
    RunError, RunEvent, RunOutcome, SerialEvent, StateKey, ThreadSafeRw, Value,
};
use cncstream_gcode::MotionProgram;
use cncstream_settings::{Config, ProbeSettings, ToolChangePolicy};

use crate::firmware::grbl::{override_sequence, OverrideChannel, RealtimeCommand};
use crate::queue::{ControlRequest, QueueHandles, QueueItem, QueueItemKind, Suspension};

pub use directive::{compile_line, parse_directive, strip_comments};
pub use tool_change::{calibrate, reverse_probe_command, tool_change, tool_words, Step};

/// Run settings taken from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub policy: ToolChangePolicy,
    pub wait_after_probe: bool,
    pub probe: ProbeSettings,
    /// Jog feed when none is given
    pub jog_feed: f64,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.tool_change.policy,
            wait_after_probe: config.tool_change.wait_after_probe,
            probe: config.probe.clone(),
            jog_feed: config.machine.jog_feed_rate,
        }
    }
}

/// Variables used by tool change and probing sequences
fn config_vars(config: &Config) -> Vec<(&'static str, Value)> {
    let tc = &config.tool_change;
    let probe = &config.probe;
    vec![
        ("prbfeed", probe.feed.into()),
        ("fastprbfeed", probe.fast_feed.into()),
        ("prbcmd", probe.command.as_str().into()),
        ("safe", probe.safe_z.into()),
        ("toolchangex", tc.change_x.into()),
        ("toolchangey", tc.change_y.into()),
        ("toolchangez", tc.change_z.into()),
        ("toolprobex", tc.probe_x.into()),
        ("toolprobey", tc.probe_y.into()),
        ("toolprobez", tc.probe_z.into()),
        ("tooldistance", tc.distance.into()),
        ("toolheight", tc.tool_height.into()),
        ("toolmz", tc.tool_mz.into()),
    ]
}

fn is_priority(line: &str) -> bool {
    let upper = line.to_ascii_uppercase();
    upper == "$X" || upper.starts_with("$H") || upper.starts_with("$J=")
}

/// Sequences programs and interactive commands onto the outbound queue
#[derive(Clone)]
pub struct RunController {
    state: MachineStateBus,
    events: Arc<EventBus>,
    handles: QueueHandles,
    settings: ThreadSafeRw<RunSettings>,
    next_run: Arc<AtomicU64>,
}

impl RunController {
    /// Controller seeded with the tool-change and probe variables of `config`
    pub fn new(
        state: MachineStateBus,
        events: Arc<EventBus>,
        handles: QueueHandles,
        config: &Config,
    ) -> Self {
        let controller = Self {
            state,
            events,
            handles,
            settings: thread_safe_rw(RunSettings::from_config(config)),
            next_run: Arc::new(AtomicU64::new(1)),
        };
        controller.apply_config(config);
        controller
    }

    /// Take new probe and tool-change settings
    pub fn apply_config(&self, config: &Config) {
        *self.settings.write() = RunSettings::from_config(config);
        for (name, value) in config_vars(config) {
            if let Err(e) = self.state.set(name, value) {
                tracing::warn!("Cannot seed variable {}: {}", name, e);
            }
        }
    }

    pub fn settings(&self) -> RunSettings {
        self.settings.read().clone()
    }

    pub fn set_tool_policy(&self, policy: ToolChangePolicy) {
        self.settings.write().policy = policy;
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.events.publish(event);
    }

    pub fn is_running(&self) -> bool {
        self.handles.tracker.lock().active
    }

    /// Pending tool change, if submission is suspended
    pub fn suspension(&self) -> Option<Suspension> {
        self.handles.tracker.lock().suspended
    }

    /// Acknowledged and total lines of the active run
    pub fn progress(&self) -> Option<(usize, usize)> {
        let tracker = self.handles.tracker.lock();
        tracker.active.then_some((tracker.acknowledged, tracker.total))
    }

    /// Items waiting in the outbound queue
    pub fn queue_len(&self) -> usize {
        self.handles.queue_len()
    }

    /// Compile program lines, expanding `M6` according to the tool policy
    pub fn compile(&self, lines: &[impl AsRef<str>], run: Option<u64>) -> Result<Vec<QueueItem>, RunError> {
        let settings = self.settings();
        let mut last_tool: Option<u32> = None;
        let mut items = Vec::new();
        for (index, raw) in lines.iter().enumerate() {
            let text = strip_comments(raw.as_ref());
            let text = text.trim();
            if !text.starts_with('%') {
                let (tool, m6) = tool_words(text);
                if tool.is_some() {
                    last_tool = tool;
                }
                if m6 && settings.policy != ToolChangePolicy::Pass {
                    if settings.policy == ToolChangePolicy::Ignore {
                        tracing::debug!("Dropping tool change at line {}", index);
                        continue;
                    }
                    let tool = tool
                        .or(last_tool)
                        .unwrap_or_else(|| self.state.read(|s| s.modal.tool));
                    let steps = tool_change(
                        tool,
                        settings.policy,
                        settings.wait_after_probe,
                        &settings.probe,
                    );
                    items.extend(Self::compile_steps(&steps, index, run)?);
                    continue;
                }
            }
            if let Some(item) = compile_line(text, index, run)? {
                items.push(item);
            }
        }
        Ok(items)
    }

    fn compile_steps(steps: &[Step], index: usize, run: Option<u64>) -> Result<Vec<QueueItem>, RunError> {
        let mut items = Vec::with_capacity(steps.len());
        for step in steps {
            match step {
                Step::Line(text) => {
                    if let Some(item) = compile_line(text, index, run)? {
                        items.push(item);
                    }
                }
                Step::Suspend { tool } => items.push(QueueItem::new(
                    QueueItemKind::Suspend { tool: *tool },
                    run,
                    Some(index),
                )),
            }
        }
        Ok(items)
    }

    /// Start a run; fails if not connected, already running, or a line does not compile
    pub fn try_run_lines(&self, lines: &[impl AsRef<str>]) -> Result<u64, RunError> {
        self.check_can_run()?;
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let items = self.compile(lines, Some(run))?;
        self.start(run, items)
    }

    /// Start a run from expanded steps
    pub fn try_run_steps(&self, steps: &[Step]) -> Result<u64, RunError> {
        self.check_can_run()?;
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let items = Self::compile_steps(steps, 0, Some(run))?;
        self.start(run, items)
    }

    /// Publish the bounding box of `program` as `xmin` .. `zmax`
    pub fn load_program(&self, program: &MotionProgram) {
        let bounds = program.bounds();
        match &bounds {
            Some(b) => tracing::debug!("Program bounds {:?} to {:?}", b.min, b.max),
            None => tracing::debug!("Program has no fully known moves"),
        }
        self.state.set_program_bounds(bounds);
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            for key in [StateKey::BoundsMin(axis), StateKey::BoundsMax(axis)] {
                self.emit(AppEvent::Machine(MachineEvent::GenericUpdate { key: key.name() }));
            }
        }
    }

    /// Publish the program bounds, then start streaming its enabled lines
    pub fn run_program(&self, program: &MotionProgram) -> Result<u64, RunError> {
        self.check_can_run()?;
        self.load_program(program);
        self.try_run_lines(&program.stream_lines())
    }

    /// Boolean form of [`try_run_lines`](Self::try_run_lines)
    pub fn run_lines(&self, lines: &[impl AsRef<str>]) -> bool {
        match self.try_run_lines(lines) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Run rejected: {}", e);
                false
            }
        }
    }

    fn check_can_run(&self) -> Result<(), RunError> {
        if !self.state.controller_state().is_connected() {
            return Err(RunError::NotConnected);
        }
        if self.is_running() {
            return Err(RunError::AlreadyRunning);
        }
        Ok(())
    }

    fn start(&self, run: u64, items: Vec<QueueItem>) -> Result<u64, RunError> {
        let total = items
            .iter()
            .filter(|i| matches!(i.kind, QueueItemKind::Line(_)))
            .count();
        {
            let mut tracker = self.handles.tracker.lock();
            if tracker.active {
                return Err(RunError::AlreadyRunning);
            }
            tracker.begin(run, total, items.len());
        }
        self.handles.queue.lock().extend(items);
        tracing::info!("Run {} started with {} lines", run, total);
        self.emit(AppEvent::Run(RunEvent::Started {
            total,
            at: Utc::now(),
        }));
        Ok(run)
    }

    /// Feed hold
    pub fn pause(&self) {
        self.handles
            .post(ControlRequest::Realtime(RealtimeCommand::FeedHold.byte()));
    }

    /// Cycle start
    pub fn resume(&self) {
        self.handles
            .post(ControlRequest::Realtime(RealtimeCommand::CycleStart.byte()));
    }

    fn remove_run_items(&self, run: u64) -> usize {
        let mut queue = self.handles.queue.lock();
        let before = queue.len();
        queue.retain(|item| item.run != Some(run));
        before - queue.len()
    }

    /// Soft reset and drop the rest of the active run
    pub fn stop(&self) -> Result<(), RunError> {
        let finished = {
            let mut tracker = self.handles.tracker.lock();
            if !tracker.active {
                return Err(RunError::NotRunning);
            }
            let elapsed = tracker.started.map(|t| t.elapsed()).unwrap_or_default();
            (tracker.run_id, tracker.finish(), elapsed)
        };
        let (run, lines, elapsed) = finished;
        let dropped = self.remove_run_items(run);
        self.handles.post(ControlRequest::SoftReset);

        tracing::info!("Run {} stopped after {} lines, {} dropped", run, lines, dropped);
        if dropped > 0 {
            self.emit(AppEvent::Serial(SerialEvent::QueueCleared { dropped }));
        }
        self.emit(AppEvent::Run(RunEvent::Ended {
            outcome: RunOutcome::Stopped,
            lines,
            elapsed,
        }));
        Ok(())
    }

    /// Soft reset; stops the active run and drops everything queued
    pub fn reset(&self) {
        if self.stop().is_err() {
            self.handles.post(ControlRequest::SoftReset);
        }
        self.handles.tracker.lock().suspended = None;
        let dropped = {
            let mut queue = self.handles.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            self.emit(AppEvent::Serial(SerialEvent::QueueCleared { dropped }));
        }
    }

    /// Resume after a tool change; the token must match the pending one
    pub fn acknowledge_tool_change(&self, token: u64) -> Result<(), RunError> {
        let tool = {
            let mut tracker = self.handles.tracker.lock();
            match tracker.suspended {
                Some(s) if s.token == token => {
                    tracker.suspended = None;
                    s.tool
                }
                _ => return Err(RunError::StaleToolChangeToken { token }),
            }
        };
        tracing::info!("Tool change T{:02} acknowledged", tool);
        self.emit(AppEvent::Run(RunEvent::ToolChangeAcknowledged { tool, token }));
        Ok(())
    }

    /// Queue an interactive line
    ///
    /// `$X`, `$H` and `$J=` go through the priority path.
    pub fn send_gcode(&self, line: &str) -> Result<(), RunError> {
        if !self.state.controller_state().is_connected() {
            return Err(RunError::NotConnected);
        }
        let line = line.trim();
        if is_priority(line) {
            self.handles.post(ControlRequest::Priority(line.to_string()));
            return Ok(());
        }
        if let Some(item) = compile_line(line, 0, None)? {
            self.handles.queue.lock().push_back(item);
        }
        Ok(())
    }

    /// Relative jog in millimetres, at the configured jog feed unless `feed` is given
    pub fn jog(&self, dx: f64, dy: f64, dz: f64, feed: Option<f64>) -> Result<(), RunError> {
        let feed = feed.unwrap_or_else(|| self.settings.read().jog_feed);
        let mut command = String::from("$J=G91 G21");
        for (letter, delta) in [('X', dx), ('Y', dy), ('Z', dz)] {
            if delta != 0.0 {
                command.push_str(&format!(" {}{}", letter, format_number(delta)));
            }
        }
        command.push_str(&format!(" F{}", format_number(feed)));
        self.send_gcode(&command)
    }

    pub fn jog_cancel(&self) {
        self.handles
            .post(ControlRequest::Realtime(RealtimeCommand::JogCancel.byte()));
    }

    pub fn home(&self) -> Result<(), RunError> {
        self.send_gcode("$H")
    }

    /// Clear an alarm with `$X`
    pub fn unlock(&self) -> Result<(), RunError> {
        self.send_gcode("$X")
    }

    fn post_sequence(&self, commands: Vec<RealtimeCommand>) {
        for command in commands {
            self.handles.post(ControlRequest::Realtime(command.byte()));
        }
    }

    pub fn set_feed_override(&self, percent: u16) {
        let current = self.state.read(|s| s.overrides.feed);
        self.post_sequence(override_sequence(OverrideChannel::Feed, current, percent));
    }

    pub fn set_spindle_override(&self, percent: u16) {
        let current = self.state.read(|s| s.overrides.spindle);
        self.post_sequence(override_sequence(OverrideChannel::Spindle, current, percent));
    }

    /// Rapid override snaps to 100, 50 or 25 percent
    pub fn set_rapid_override(&self, percent: u16) {
        self.post_sequence(vec![RealtimeCommand::rapid_override(percent)]);
    }

    /// Probe the reference tool and store `toolheight`/`toolmz`
    pub fn calibrate_tool_height(&self) -> Result<u64, RunError> {
        let probe = self.settings.read().probe.clone();
        self.try_run_steps(&calibrate(&probe))
    }

    /// Single probing move along the given axes at `feed` or the probe feed
    pub fn probe(
        &self,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        feed: Option<f64>,
    ) -> Result<(), RunError> {
        let settings = self.settings.read().probe.clone();
        let line = probe::single(&settings.command, x, y, z, feed.unwrap_or(settings.feed))?;
        self.send_gcode(&line)
    }

    /// Rapid to the last reported probe position
    pub fn goto_probe(&self) -> Result<(), RunError> {
        let point = self.state.read(|s| s.probe).ok_or(RunError::NoProbeRecord)?;
        self.send_gcode(&probe::goto(&point.position))
    }

    /// Center in a bore of about `diameter` as its own run
    pub fn probe_center(&self, diameter: f64) -> Result<u64, RunError> {
        let command = self.settings.read().probe.command.clone();
        let lines = probe::center(&command, diameter)?;
        self.try_run_lines(&lines)
    }

    /// Manual tool change as its own run
    pub fn change_tool(&self, tool: u32) -> Result<u64, RunError> {
        let settings = self.settings();
        let policy = match settings.policy {
            ToolChangePolicy::Pass | ToolChangePolicy::Ignore => ToolChangePolicy::NoProbe,
            other => other,
        };
        let steps = tool_change(tool, policy, settings.wait_after_probe, &settings.probe);
        self.try_run_steps(&steps)
    }
}
