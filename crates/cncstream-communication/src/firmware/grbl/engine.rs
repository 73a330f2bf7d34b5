//! GRBL protocol engine
//!
//! Owns the transport and runs the send/receive cycle: drains the control
//! mailbox, reads and parses responses into machine state and events, polls
//! status, and streams queued lines under character-counting flow control.
//! [`ProtocolEngine::poll`] is one non-blocking step; the controller thread
//! calls it in a loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cncstream_core::{
    AppEvent, Axis, CommandRejected, ConnectionError, ConnectionEvent, ControllerState,
    DisconnectReason, ErrorEvent, EventBus, MachineEvent, MachineStateBus, Position, ProbePoint,
    ProtocolError, RunEvent, RunOutcome, SerialEvent, Value,
};
use cncstream_settings::{Config, ConnectionSettings};

use crate::communication::{is_idle_error, FlowControl, Transport, TransportParams};
use crate::queue::{ControlRequest, QueueHandles, QueueItem, QueueItemKind};

use super::error_decoder::{decode_alarm, decode_error};
use super::realtime::RealtimeCommand;
use super::response_parser::{GrblResponse, GrblResponseParser};
use super::status_parser::StatusReport;

/// Wake-up sequence written on connect
const WAKE_UP: &[u8] = b"\r\n\r\n";
/// GRBL answers every empty line of the wake-up with `ok`
const WAKE_UP_OKS: usize = 4;
/// Time to wait for wake-up acknowledgments after the first response
const HANDSHAKE_SETTLE: Duration = Duration::from_millis(250);
const READ_CHUNK: usize = 1024;

/// Protocol engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Firmware receive buffer capacity in bytes
    pub rx_buffer_size: usize,
    /// Interval between status queries
    pub status_poll: Duration,
    /// How long to wait for the firmware on connect; `None` skips the handshake
    pub handshake_timeout: Option<Duration>,
    /// Axes the machine has; reported rotary axes past this stay at zero
    pub axis_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            rx_buffer_size: settings.rx_buffer_size,
            status_poll: Duration::from_millis(settings.status_poll_ms),
            handshake_timeout: (settings.timeout_ms > 0)
                .then(|| Duration::from_millis(settings.timeout_ms)),
            axis_count: Axis::ALL.len(),
        }
    }

    /// Connection settings plus the machine's axis count
    pub fn from_config(config: &Config) -> Self {
        Self {
            axis_count: usize::from(config.machine.axis_count),
            ..Self::from_settings(&config.connection)
        }
    }
}

/// `$X` and `$H` clear the alarm latch once acknowledged
fn is_unlock(line: &str) -> bool {
    let upper = line.trim().to_ascii_uppercase();
    upper == "$X" || upper.starts_with("$H")
}

/// Sender side of the GRBL protocol
pub struct ProtocolEngine {
    transport: Box<dyn Transport>,
    params: TransportParams,
    config: EngineConfig,
    state: MachineStateBus,
    events: Arc<EventBus>,
    handles: QueueHandles,
    parser: GrblResponseParser,
    flow: FlowControl,
    priority: VecDeque<String>,
    inbound: Vec<u8>,
    /// Status sequence a wait barrier needs to exceed
    barrier: Option<u64>,
    barrier_polled: bool,
    /// Status sequence run completion needs to exceed
    completion: Option<u64>,
    alarm: bool,
    stray_oks: usize,
    heard_firmware: bool,
    last_poll: Option<Instant>,
    force_poll: bool,
    connected: bool,
}

impl ProtocolEngine {
    pub fn new(
        transport: Box<dyn Transport>,
        params: TransportParams,
        config: EngineConfig,
        state: MachineStateBus,
        events: Arc<EventBus>,
        handles: QueueHandles,
    ) -> Self {
        let flow = FlowControl::new(config.rx_buffer_size);
        Self {
            transport,
            params,
            config,
            state,
            events,
            handles,
            parser: GrblResponseParser::new(),
            flow,
            priority: VecDeque::new(),
            inbound: Vec::new(),
            barrier: None,
            barrier_polled: false,
            completion: None,
            alarm: false,
            stray_oks: 0,
            heard_firmware: false,
            last_poll: None,
            force_poll: false,
            connected: false,
        }
    }

    fn emit(&self, event: AppEvent) {
        // No subscribers is not an error for the sender
        let _ = self.events.publish(event);
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Alarm latch: set by `ALARM:N` or an Alarm status, cleared by an
    /// acknowledged unlock/homing command or a firmware reset
    pub fn alarm_latched(&self) -> bool {
        self.alarm
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn params(&self) -> &TransportParams {
        &self.params
    }

    pub fn handles(&self) -> &QueueHandles {
        &self.handles
    }

    /// Queued items not yet transmitted
    pub fn queue_len(&self) -> usize {
        self.handles.queue_len()
    }

    /// Append a line to the outbound queue
    pub fn enqueue(&self, line: &str) {
        self.handles
            .queue
            .lock()
            .push_back(QueueItem::interactive(QueueItemKind::Line(
                crate::queue::LineTemplate::literal(line.trim()),
            )));
    }

    /// Open the transport and wait for the firmware to answer
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.connected {
            return Err(ConnectionError::AlreadyConnected);
        }
        let port = self.params.port.clone();
        self.emit(AppEvent::Connection(ConnectionEvent::Connecting { port: port.clone() }));

        if let Err(e) = self.transport.open(&self.params) {
            tracing::warn!("Connection to {} failed: {}", port, e);
            self.emit(AppEvent::Connection(ConnectionEvent::ConnectionFailed {
                port,
                error: e.to_string(),
            }));
            return Err(e);
        }

        self.reset_session();
        self.state.update(|s| {
            s.reset_telemetry();
            s.controller_state = ControllerState::Unknown;
            s.state_text = ControllerState::Unknown.to_string();
        });
        self.connected = true;

        if let Err(e) = self.handshake() {
            tracing::warn!("Handshake with {} failed: {}", port, e);
            self.transport.close();
            self.connected = false;
            self.state.update(|s| s.reset_telemetry());
            self.emit(AppEvent::Connection(ConnectionEvent::ConnectionFailed {
                port,
                error: e.to_string(),
            }));
            return Err(e);
        }

        let firmware = self
            .state
            .read(|s| s.firmware_version.clone())
            .unwrap_or_default();
        tracing::info!("Connected to {} ({})", self.transport.name(), firmware);
        self.emit(AppEvent::Connection(ConnectionEvent::Connected {
            port: self.transport.name(),
            firmware,
        }));
        Ok(())
    }

    fn reset_session(&mut self) {
        self.flow = FlowControl::new(self.config.rx_buffer_size);
        self.priority.clear();
        self.inbound.clear();
        self.barrier = None;
        self.barrier_polled = false;
        self.completion = None;
        self.alarm = false;
        self.stray_oks = 0;
        self.heard_firmware = false;
        self.last_poll = None;
        self.force_poll = false;
    }

    fn handshake(&mut self) -> Result<(), ConnectionError> {
        let Some(timeout) = self.config.handshake_timeout else {
            return Ok(());
        };
        self.write_bytes(WAKE_UP)?;
        self.stray_oks = WAKE_UP_OKS;
        self.query_status()?;

        let start = Instant::now();
        let mut answered: Option<Instant> = None;
        loop {
            self.read_available()?;
            if self.heard_firmware {
                let settled = answered.get_or_insert_with(Instant::now).elapsed() >= HANDSHAKE_SETTLE;
                if self.stray_oks == 0 || settled {
                    // Late wake-up acknowledgments would be mistaken for real ones
                    self.stray_oks = 0;
                    return Ok(());
                }
            } else if self
                .last_poll
                .is_some_and(|t| t.elapsed() >= self.config.status_poll)
            {
                self.query_status()?;
            }
            if start.elapsed() >= timeout {
                return Err(ConnectionError::HandshakeTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Flush best-effort, close the transport and reset machine state
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        if let Err(e) = self.transport.flush() {
            tracing::warn!("Flush before disconnect failed: {}", e);
        }
        let port = self.transport.name();
        self.transport.close();
        self.connected = false;
        self.reset_session();

        self.fail_run("disconnected");
        self.clear_queue();
        self.enter_disconnected();
        tracing::info!("Disconnected from {}", port);
        self.emit(AppEvent::Connection(ConnectionEvent::Disconnected {
            port,
            reason: DisconnectReason::UserRequested,
        }));
    }

    fn enter_disconnected(&mut self) {
        let old = self.state.update(|s| {
            let old = s.controller_state;
            s.reset_telemetry();
            old
        });
        if old != ControllerState::Disconnected {
            self.emit(AppEvent::Machine(MachineEvent::StateChanged {
                old,
                new: ControllerState::Disconnected,
            }));
        }
    }

    fn clear_queue(&mut self) {
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

    fn transport_lost(&mut self, reason: String) -> ConnectionError {
        tracing::error!("Transport to {} lost: {}", self.params.port, reason);
        let port = self.transport.name();
        self.transport.close();
        self.connected = false;
        self.reset_session();

        self.fail_run(&reason);
        self.enter_disconnected();
        self.emit(AppEvent::Connection(ConnectionEvent::Disconnected {
            port,
            reason: DisconnectReason::ConnectionLost(reason.clone()),
        }));
        ConnectionError::ConnectionLost { reason }
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        match self.transport.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.transport_lost(format!("write failed: {}", e))),
        }
    }

    /// Write a realtime byte immediately, bypassing the queue
    pub fn send_realtime(&mut self, byte: u8) -> Result<(), ConnectionError> {
        if !self.connected {
            return Err(ConnectionError::NotConnected);
        }
        self.write_bytes(&[byte])?;
        tracing::debug!("Realtime 0x{:02X}", byte);
        if byte == RealtimeCommand::StatusReport.byte() {
            self.last_poll = Some(Instant::now());
        }
        self.emit(AppEvent::Serial(SerialEvent::Realtime { byte }));
        Ok(())
    }

    fn soft_reset(&mut self) -> Result<(), ConnectionError> {
        self.send_realtime(RealtimeCommand::Reset.byte())?;
        let dropped = self.flow.clear();
        self.barrier = None;
        self.completion = None;
        tracing::info!("Soft reset, {} lines dropped in flight", dropped);
        Ok(())
    }

    fn query_status(&mut self) -> Result<(), ConnectionError> {
        self.write_bytes(&[RealtimeCommand::StatusReport.byte()])?;
        tracing::trace!("Status query");
        self.last_poll = Some(Instant::now());
        self.force_poll = false;
        Ok(())
    }

    /// One engine cycle; returns the number of response lines handled
    pub fn poll(&mut self) -> Result<usize, ConnectionError> {
        if !self.connected {
            return Err(ConnectionError::NotConnected);
        }
        self.drain_mailbox()?;
        let handled = self.read_available()?;
        self.dispatch()?;
        self.check_completion();

        let due = self
            .last_poll
            .map_or(true, |t| t.elapsed() >= self.config.status_poll);
        if self.force_poll || due {
            self.query_status()?;
        }
        Ok(handled)
    }

    fn drain_mailbox(&mut self) -> Result<(), ConnectionError> {
        let requests: Vec<ControlRequest> = self.handles.mailbox.lock().drain(..).collect();
        for request in requests {
            match request {
                ControlRequest::Realtime(byte) => self.send_realtime(byte)?,
                ControlRequest::SoftReset => self.soft_reset()?,
                ControlRequest::Priority(line) => self.priority.push_back(line),
            }
        }
        Ok(())
    }

    fn read_available(&mut self) -> Result<usize, ConnectionError> {
        let mut buf = [0u8; READ_CHUNK];
        let n = match self.transport.read(&mut buf) {
            Ok(n) => n,
            Err(e) if is_idle_error(&e) => 0,
            Err(e) => return Err(self.transport_lost(format!("read failed: {}", e))),
        };
        if n == 0 {
            return Ok(0);
        }
        self.inbound.extend_from_slice(&buf[..n]);

        let mut handled = 0;
        while let Some(end) = self.inbound.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.inbound.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            self.handle_line(&line);
            handled += 1;
        }
        Ok(handled)
    }

    fn handle_line(&mut self, line: &str) {
        match self.parser.parse(line) {
            Ok(Some(response)) => self.handle_response(line, response),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("{}", e);
                self.emit(AppEvent::Error(ErrorEvent::Protocol {
                    message: e.to_string(),
                }));
            }
        }
    }

    fn handle_response(&mut self, line: &str, response: GrblResponse) {
        match &response {
            GrblResponse::Ok | GrblResponse::Error(_) => {}
            GrblResponse::Status(_) => tracing::trace!("< {}", line),
            _ => {
                tracing::debug!("< {}", line);
                self.emit(AppEvent::Serial(SerialEvent::Received {
                    line: line.to_string(),
                }));
            }
        }

        match response {
            GrblResponse::Ok => self.on_acknowledgment(line, None),
            GrblResponse::Error(code) => self.on_acknowledgment(line, Some(code)),
            GrblResponse::Alarm(code) => {
                let message = decode_alarm(code);
                tracing::warn!("ALARM:{} {}", code, message);
                self.alarm = true;
                self.emit(AppEvent::Machine(MachineEvent::AlarmTriggered { code, message }));
            }
            GrblResponse::Status(report) => self.on_status(report),
            GrblResponse::Probe { position, success } => {
                let axes = self.config.axis_count;
                let point = self.state.update(|s| {
                    let work = position.limited_to(axes).subtract(&s.wco);
                    let point = ProbePoint {
                        position: work,
                        target: work,
                        success,
                    };
                    s.probe = Some(point);
                    s.probe_seq += 1;
                    point
                });
                tracing::info!("Probe {} (contact: {})", point.position, success);
                self.emit(AppEvent::Machine(MachineEvent::ProbeUpdated(point)));
            }
            GrblResponse::ParserState(modal) => {
                self.state.update(|s| s.modal = modal.clone());
                self.emit(AppEvent::Machine(MachineEvent::ParserStateUpdated(modal)));
            }
            GrblResponse::ToolOffset(tlo) => {
                self.state.update(|s| s.tlo = tlo);
                self.emit(AppEvent::Machine(MachineEvent::ToolOffsetUpdated { tlo }));
            }
            GrblResponse::Offset { name, position } => {
                self.state.update(|s| {
                    s.offsets.insert(name.clone(), position);
                });
                self.emit(AppEvent::Machine(MachineEvent::GenericUpdate { key: name }));
            }
            GrblResponse::Message(text) => {
                tracing::info!("MSG: {}", text);
                self.emit(AppEvent::Machine(MachineEvent::FirmwareMessage { text }));
            }
            GrblResponse::Setting { number, value } => {
                self.state.update(|s| {
                    s.settings.insert(number, value);
                });
            }
            GrblResponse::Banner(banner) => self.on_banner(banner),
            GrblResponse::Feedback(_) | GrblResponse::Text(_) => {}
        }
    }

    fn on_acknowledgment(&mut self, line: &str, code: Option<u8>) {
        let Some(entry) = self.flow.acknowledge() else {
            if self.stray_oks > 0 && code.is_none() {
                self.stray_oks -= 1;
                tracing::trace!("Wake-up acknowledged");
                return;
            }
            let err = ProtocolError::UnexpectedResponse {
                line: line.to_string(),
            };
            tracing::warn!("{}", err);
            self.emit(AppEvent::Error(ErrorEvent::Protocol {
                message: err.to_string(),
            }));
            return;
        };

        match code {
            None => {
                tracing::debug!("ok: {}", entry.line);
                if entry.unlocks && self.alarm {
                    self.alarm = false;
                    tracing::info!("Alarm cleared by {}", entry.line);
                    self.emit(AppEvent::Machine(MachineEvent::AlarmCleared));
                }
                self.emit(AppEvent::Serial(SerialEvent::Acknowledged {
                    line: entry.line.clone(),
                }));
            }
            Some(code) => {
                let rejected = CommandRejected {
                    line: entry.line.clone(),
                    code,
                    message: decode_error(code),
                };
                tracing::warn!("{}", rejected);
                self.emit(AppEvent::Serial(SerialEvent::Rejected {
                    line: rejected.line,
                    code,
                    message: rejected.message,
                }));
            }
        }
        self.emit_buffer_fill();

        let progress = {
            let mut tracker = self.handles.tracker.lock();
            if tracker.owns(entry.run) {
                tracker.acknowledged += 1;
                Some((tracker.acknowledged, tracker.total))
            } else {
                None
            }
        };
        if let Some((completed, total)) = progress {
            self.emit(AppEvent::Run(RunEvent::Progress { completed, total }));
        }
    }

    fn emit_buffer_fill(&self) {
        self.emit(AppEvent::Serial(SerialEvent::BufferFill {
            used: self.flow.used(),
            capacity: self.flow.capacity(),
            percent: self.flow.fill_percent(),
        }));
    }

    fn on_status(&mut self, report: StatusReport) {
        self.heard_firmware = true;
        if report.state.is_none() {
            tracing::warn!("Unknown controller state '{}'", report.state_text);
        }

        // One write lock for the whole report
        let axes = self.config.axis_count;
        let (old, new, old_pos, new_pos, old_ov, new_ov) = self.state.update(|s| {
            let old = s.controller_state;
            let old_pos = (s.machine, s.work);
            let old_ov = s.overrides;

            if let Some(wco) = report.wco {
                s.wco = wco.limited_to(axes);
            }
            let limit = |p: Option<Position>| p.map(|p| p.limited_to(axes));
            match (limit(report.mpos), limit(report.wpos)) {
                (Some(m), Some(w)) => {
                    s.machine = m;
                    s.work = w;
                }
                (Some(m), None) => {
                    s.machine = m;
                    s.work = m.subtract(&s.wco);
                }
                (None, Some(w)) => {
                    s.work = w;
                    s.machine = w.add(&s.wco);
                }
                (None, None) => {}
            }
            if let Some(feed) = report.feed_rate {
                s.feed = feed;
            }
            if let Some(spindle) = report.spindle_speed {
                s.spindle = spindle;
            }
            if let Some(ov) = report.overrides {
                s.overrides = ov;
            }
            if report.buffer.is_some() {
                s.buffer = report.buffer;
            }
            s.pins = report.pins.clone().unwrap_or_default();
            s.state_text = report.state_text.clone();
            if let Some(state) = report.state {
                s.controller_state = state;
            }
            s.status_seq += 1;
            (
                old,
                s.controller_state,
                old_pos,
                (s.machine, s.work),
                old_ov,
                s.overrides,
            )
        });

        if new == ControllerState::Alarm && !self.alarm {
            self.alarm = true;
            tracing::warn!("Controller reports Alarm");
        }
        if old != new {
            tracing::info!("State: {} -> {}", old, new);
            self.emit(AppEvent::Machine(MachineEvent::StateChanged { old, new }));
        }
        if old_pos != new_pos {
            self.emit(AppEvent::Machine(MachineEvent::PositionUpdated {
                machine: new_pos.0,
                work: new_pos.1,
            }));
        }
        if old_ov != new_ov {
            self.emit(AppEvent::Machine(MachineEvent::OverridesChanged(new_ov)));
        }
    }

    fn on_banner(&mut self, banner: String) {
        tracing::info!("Firmware reset: {}", banner);
        self.heard_firmware = true;
        let dropped = self.flow.clear();
        if dropped > 0 {
            tracing::warn!("{} in-flight lines lost to firmware reset", dropped);
        }
        self.barrier = None;
        self.completion = None;
        if self.alarm {
            self.alarm = false;
            self.emit(AppEvent::Machine(MachineEvent::AlarmCleared));
        }
        self.state
            .update(|s| s.firmware_version = Some(banner.clone()));
        self.emit(AppEvent::Connection(ConnectionEvent::FirmwareReset { banner }));
        self.fail_run("firmware reset");
    }

    /// End the active run as failed and drop its queued items
    fn fail_run(&mut self, reason: &str) {
        let ended = {
            let mut tracker = self.handles.tracker.lock();
            if !tracker.active {
                None
            } else {
                let run = tracker.run_id;
                let elapsed = tracker.started.map(|t| t.elapsed()).unwrap_or_default();
                Some((run, tracker.finish(), elapsed))
            }
        };
        let Some((run, lines, elapsed)) = ended else {
            return;
        };
        let dropped = {
            let mut queue = self.handles.queue.lock();
            let before = queue.len();
            queue.retain(|item| item.run != Some(run));
            before - queue.len()
        };
        if dropped > 0 {
            self.emit(AppEvent::Serial(SerialEvent::QueueCleared { dropped }));
        }
        tracing::error!("Run {} failed after {} lines: {}", run, lines, reason);
        self.emit(AppEvent::Run(RunEvent::Ended {
            outcome: RunOutcome::Failed(reason.to_string()),
            lines,
            elapsed,
        }));
    }

    fn send_line(&mut self, line: &str, run: Option<u64>) -> Result<(), ConnectionError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write_bytes(&bytes)?;
        self.flow.push(line, run, is_unlock(line));
        tracing::debug!("> {}", line);
        self.emit(AppEvent::Serial(SerialEvent::Sent {
            line: line.to_string(),
        }));
        self.emit_buffer_fill();
        Ok(())
    }

    fn reject_too_long(&self, line: &str) {
        let err = ProtocolError::LineTooLong {
            line: line.to_string(),
            length: FlowControl::cost(line),
            capacity: self.flow.capacity(),
        };
        tracing::warn!("{}", err);
        self.emit(AppEvent::Error(ErrorEvent::Protocol {
            message: err.to_string(),
        }));
    }

    /// Pop the front item if it is still `id`, keeping the run count in step
    fn take_front(&self, id: u64) -> bool {
        let taken = {
            let mut queue = self.handles.queue.lock();
            if queue.front().is_some_and(|item| item.id == id) {
                queue.pop_front()
            } else {
                None
            }
        };
        match taken {
            Some(item) => {
                let mut tracker = self.handles.tracker.lock();
                if tracker.owns(item.run) {
                    tracker.pending = tracker.pending.saturating_sub(1);
                }
                true
            }
            None => false,
        }
    }

    fn directive_failed(&self, source: &str, message: String) {
        tracing::warn!("Directive '{}' failed: {}", source, message);
        self.emit(AppEvent::Error(ErrorEvent::Directive {
            line: source.to_string(),
            message,
        }));
    }

    fn dispatch(&mut self) -> Result<(), ConnectionError> {
        // Priority lines bypass alarm and suspension but not flow control
        while let Some(line) = self.priority.front().cloned() {
            if !self.flow.can_ever_fit(&line) {
                self.priority.pop_front();
                self.reject_too_long(&line);
                continue;
            }
            if !self.flow.fits(&line) {
                return Ok(());
            }
            self.priority.pop_front();
            self.send_line(&line, None)?;
        }

        if self.alarm {
            return Ok(());
        }

        loop {
            if self.handles.tracker.lock().suspended.is_some() {
                return Ok(());
            }
            let Some(item) = self.handles.queue.lock().front().cloned() else {
                return Ok(());
            };

            match &item.kind {
                QueueItemKind::Wait => {
                    if !self.wait_released() {
                        return Ok(());
                    }
                    self.take_front(item.id);
                }
                QueueItemKind::Assign(statements) => {
                    if !self.take_front(item.id) {
                        continue;
                    }
                    for (name, expr) in statements {
                        let result = self
                            .state
                            .read(|s| expr.eval(s))
                            .map_err(|e| e.to_string())
                            .and_then(|value: Value| {
                                self.state.set(name, value).map_err(|e| e.to_string())
                            });
                        if let Err(message) = result {
                            self.directive_failed(&format!("%{}", name), message);
                        }
                    }
                }
                QueueItemKind::Update(key) => {
                    if !self.take_front(item.id) {
                        continue;
                    }
                    if key == "TLO" {
                        let tlo = self.state.read(|s| s.tlo);
                        self.emit(AppEvent::Machine(MachineEvent::ToolOffsetUpdated { tlo }));
                    }
                    self.emit(AppEvent::Machine(MachineEvent::GenericUpdate { key: key.clone() }));
                }
                QueueItemKind::Message(text) => {
                    if !self.take_front(item.id) {
                        continue;
                    }
                    tracing::info!("{}", text);
                    self.emit(AppEvent::Run(RunEvent::Message { text: text.clone() }));
                }
                QueueItemKind::Suspend { tool } => {
                    if !self.take_front(item.id) {
                        continue;
                    }
                    let suspension = self.handles.tracker.lock().suspend(*tool);
                    tracing::info!(
                        "Waiting for tool change T{:02} (token {})",
                        suspension.tool,
                        suspension.token
                    );
                    self.emit(AppEvent::Run(RunEvent::ToolChangePending {
                        tool: suspension.tool,
                        token: suspension.token,
                    }));
                    return Ok(());
                }
                QueueItemKind::Line(template) => {
                    let rendered = match self.state.read(|s| template.render(s)) {
                        Ok(line) => line,
                        Err(e) => {
                            if self.take_front(item.id) {
                                self.directive_failed(template.source(), e.to_string());
                            }
                            continue;
                        }
                    };
                    let rendered = rendered.trim();
                    if rendered.is_empty() {
                        self.take_front(item.id);
                        continue;
                    }
                    if !self.flow.can_ever_fit(rendered) {
                        if self.take_front(item.id) {
                            self.reject_too_long(rendered);
                        }
                        continue;
                    }
                    if !self.flow.fits(rendered) {
                        return Ok(());
                    }
                    if self.take_front(item.id) {
                        self.send_line(rendered, item.run)?;
                    }
                }
            }
        }
    }

    /// Wait barrier: everything acknowledged and a fresh quiescent status
    fn wait_released(&mut self) -> bool {
        let (seq, state) = self.state.read(|s| (s.status_seq, s.controller_state));
        if !self.flow.is_empty() {
            self.barrier = Some(seq);
            self.barrier_polled = false;
            return false;
        }
        let armed = *self.barrier.get_or_insert(seq);
        if seq > armed && state.is_quiescent() {
            self.barrier = None;
            self.barrier_polled = false;
            return true;
        }
        if !self.barrier_polled {
            self.force_poll = true;
            self.barrier_polled = true;
        }
        false
    }

    /// Finish the run once everything is acknowledged and the machine is idle
    fn check_completion(&mut self) {
        let (active, run_id, pending, suspended) = {
            let tracker = self.handles.tracker.lock();
            (
                tracker.active,
                tracker.run_id,
                tracker.pending,
                tracker.suspended.is_some(),
            )
        };
        if !active || pending > 0 || suspended || self.flow.in_flight_for(run_id) > 0 {
            self.completion = None;
            return;
        }

        let (seq, state) = self.state.read(|s| (s.status_seq, s.controller_state));
        let Some(armed) = self.completion else {
            self.completion = Some(seq);
            self.force_poll = true;
            return;
        };
        if seq <= armed || !state.is_quiescent() {
            return;
        }

        self.completion = None;
        let finished = {
            let mut tracker = self.handles.tracker.lock();
            if tracker.owns(Some(run_id)) {
                let elapsed = tracker.started.map(|t| t.elapsed()).unwrap_or_default();
                Some((tracker.finish(), elapsed))
            } else {
                None
            }
        };
        if let Some((lines, elapsed)) = finished {
            tracing::info!(
                "Run {} completed: {} lines in {:.1}s",
                run_id,
                lines,
                elapsed.as_secs_f64()
            );
            self.emit(AppEvent::Run(RunEvent::Ended {
                outcome: RunOutcome::Completed,
                lines,
                elapsed,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlock_detection() {
        assert!(is_unlock("$X"));
        assert!(is_unlock("$h"));
        assert!(is_unlock("$HX"));
        assert!(!is_unlock("$J=G91 X1 F100"));
        assert!(!is_unlock("G0 X0"));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = ConnectionSettings {
            timeout_ms: 0,
            rx_buffer_size: 256,
            status_poll_ms: 50,
            ..ConnectionSettings::default()
        };
        let config = EngineConfig::from_settings(&settings);
        assert_eq!(config.rx_buffer_size, 256);
        assert_eq!(config.status_poll, Duration::from_millis(50));
        assert_eq!(config.handshake_timeout, None);
        assert_eq!(
            EngineConfig::default().handshake_timeout,
            Some(Duration::from_millis(5000))
        );
        assert_eq!(EngineConfig::default().axis_count, 6);

        let mut full = Config::default();
        full.connection.rx_buffer_size = 64;
        full.machine.axis_count = 4;
        let config = EngineConfig::from_config(&full);
        assert_eq!(config.rx_buffer_size, 64);
        assert_eq!(config.axis_count, 4);
    }
}
