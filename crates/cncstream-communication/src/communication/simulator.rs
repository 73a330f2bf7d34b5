//! In-process GRBL simulator
//!
//! [`SimulatedGrbl`] implements [`Transport`] and answers like a GRBL 1.1
//! controller: character-counted receive buffer, `ok`/`error:N`
//! acknowledgments, status reports, probing against a configurable surface,
//! alarms and soft reset. Clones share one machine so a test can inspect
//! the simulator while the engine owns the transport.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use cncstream_core::{thread_safe, ConnectionError, Position, ThreadSafe};

use super::{Transport, TransportParams};
use crate::communication::flow_control::DEFAULT_RX_BUFFER_SIZE;

/// Work Z of the surface under a work XY, `None` where the probe finds nothing
pub type Surface = Arc<dyn Fn(f64, f64) -> Option<f64> + Send + Sync>;

const BANNER: &str = "Grbl 1.1h ['$' for help]";
const MAX_READ_WAIT: Duration = Duration::from_millis(5);

const SETTINGS: &[(u16, &str)] = &[
    (0, "10"),
    (1, "25"),
    (13, "0"),
    (22, "1"),
    (100, "250.000"),
    (101, "250.000"),
    (102, "250.000"),
    (110, "500.000"),
    (111, "500.000"),
    (112, "500.000"),
];

struct Machine {
    open: bool,
    silent: bool,
    broken: bool,
    read_timeout: Duration,

    rx: VecDeque<u8>,
    rx_capacity: usize,
    max_rx_used: usize,
    overflows: usize,
    output: VecDeque<u8>,
    received: Vec<String>,
    realtime: Vec<u8>,

    alarm: bool,
    hold: bool,
    motion_ticks: u32,
    motion_polls: u32,

    /// Machine coordinates
    position: [f64; 3],
    /// G54 offset, without tool length
    wco: [f64; 3],
    tlo: f64,
    incremental: bool,
    motion: u8,
    feed: f64,
    spindle: f64,
    tool: u32,
    overrides: [u16; 3],

    surface: Option<Surface>,
    /// LCG state for acknowledgment jitter; `None` processes every line at once
    jitter: Option<u64>,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            open: false,
            silent: false,
            broken: false,
            read_timeout: Duration::from_millis(20),
            rx: VecDeque::new(),
            rx_capacity: DEFAULT_RX_BUFFER_SIZE,
            max_rx_used: 0,
            overflows: 0,
            output: VecDeque::new(),
            received: Vec::new(),
            realtime: Vec::new(),
            alarm: false,
            hold: false,
            motion_ticks: 0,
            motion_polls: 1,
            position: [0.0; 3],
            wco: [0.0; 3],
            tlo: 0.0,
            incremental: false,
            motion: 0,
            feed: 0.0,
            spindle: 0.0,
            tool: 0,
            overrides: [100; 3],
            surface: None,
            jitter: None,
        }
    }
}

fn fmt3(v: [f64; 3]) -> String {
    format!("{:.3},{:.3},{:.3}", v[0], v[1], v[2])
}

/// Split a line into letter/number words
fn words(line: &str) -> Option<Vec<(char, f64)>> {
    let mut out = Vec::new();
    let mut chars = line.chars().filter(|c| !c.is_whitespace()).peekable();
    while let Some(letter) = chars.next() {
        if !letter.is_ascii_alphabetic() {
            return None;
        }
        let mut number = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() || c == '.' || c == '-' || c == '+' {
                number.push(c);
                chars.next();
            } else {
                break;
            }
        }
        out.push((letter.to_ascii_uppercase(), number.parse().ok()?));
    }
    Some(out)
}

impl Machine {
    fn wco_effective(&self) -> [f64; 3] {
        [self.wco[0], self.wco[1], self.wco[2] + self.tlo]
    }

    fn work(&self) -> [f64; 3] {
        let wco = self.wco_effective();
        [
            self.position[0] - wco[0],
            self.position[1] - wco[1],
            self.position[2] - wco[2],
        ]
    }

    fn reply(&mut self, text: &str) {
        if self.silent {
            return;
        }
        self.output.extend(text.as_bytes());
        self.output.extend(b"\r\n");
    }

    fn state_word(&self) -> &'static str {
        if self.alarm {
            "Alarm"
        } else if self.hold {
            "Hold:0"
        } else if self.motion_ticks > 0 {
            "Run"
        } else {
            "Idle"
        }
    }

    fn status(&mut self) {
        let word = self.state_word();
        if word == "Run" {
            self.motion_ticks -= 1;
        }
        let report = format!(
            "<{}|MPos:{}|FS:{:.0},{:.0}|WCO:{}|Ov:{},{},{}>",
            word,
            fmt3(self.position),
            self.feed,
            self.spindle,
            fmt3(self.wco_effective()),
            self.overrides[0],
            self.overrides[1],
            self.overrides[2],
        );
        self.reply(&report);
    }

    fn banner(&mut self) {
        self.reply("");
        self.reply(BANNER);
    }

    fn realtime_byte(&mut self, byte: u8) -> bool {
        let adjust = |value: &mut u16, delta: i32| {
            *value = (i32::from(*value) + delta).clamp(10, 200) as u16;
        };
        match byte {
            b'?' => self.status(),
            b'!' => self.hold = true,
            b'~' => self.hold = false,
            0x18 => {
                self.rx.clear();
                self.output.clear();
                self.hold = false;
                self.alarm = false;
                self.motion_ticks = 0;
                self.incremental = false;
                self.banner();
            }
            0x85 => self.motion_ticks = 0,
            0x90 => self.overrides[0] = 100,
            0x91 => adjust(&mut self.overrides[0], 10),
            0x92 => adjust(&mut self.overrides[0], -10),
            0x93 => adjust(&mut self.overrides[0], 1),
            0x94 => adjust(&mut self.overrides[0], -1),
            0x95 => self.overrides[1] = 100,
            0x96 => self.overrides[1] = 50,
            0x97 => self.overrides[1] = 25,
            0x99 => self.overrides[2] = 100,
            0x9A => adjust(&mut self.overrides[2], 10),
            0x9B => adjust(&mut self.overrides[2], -10),
            0x9C => adjust(&mut self.overrides[2], 1),
            0x9D => adjust(&mut self.overrides[2], -1),
            0x9E => {}
            _ => return false,
        }
        true
    }

    fn receive(&mut self, data: &[u8]) {
        for &byte in data {
            if self.realtime_byte(byte) {
                self.realtime.push(byte);
                continue;
            }
            if self.rx.len() >= self.rx_capacity {
                self.overflows += 1;
                continue;
            }
            self.rx.push_back(byte);
            self.max_rx_used = self.max_rx_used.max(self.rx.len());
        }
    }

    fn lines_this_read(&mut self) -> usize {
        match self.jitter.as_mut() {
            None => usize::MAX,
            Some(seed) => {
                *seed = seed
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((*seed >> 33) % 3) as usize
            }
        }
    }

    fn process(&mut self) {
        let budget = self.lines_this_read();
        for _ in 0..budget {
            let Some(end) = self.rx.iter().position(|&b| b == b'\n' || b == b'\r') else {
                return;
            };
            let raw: Vec<u8> = self.rx.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).trim().to_string();
            self.execute(&line);
        }
    }

    fn execute(&mut self, line: &str) {
        self.received.push(line.to_string());
        if line.is_empty() {
            self.reply("ok");
            return;
        }
        if let Some(system) = line.strip_prefix('$') {
            self.system(system);
            return;
        }
        if self.alarm {
            self.reply("error:9");
            return;
        }
        match self.gcode(line) {
            Ok(()) => self.reply("ok"),
            Err(code) => self.reply(&format!("error:{}", code)),
        }
    }

    fn system(&mut self, command: &str) {
        let upper = command.to_ascii_uppercase();
        match upper.as_str() {
            "X" => {
                self.alarm = false;
                self.reply("[MSG:Caution: Unlocked]");
            }
            h if h.starts_with('H') => {
                self.alarm = false;
                self.position = [0.0; 3];
                self.motion_ticks = self.motion_polls;
            }
            "G" => {
                let report = format!(
                    "[GC:G{} G54 G17 G21 G{} G94 M5 M9 T{} F{:.0} S{:.0}]",
                    self.motion,
                    if self.incremental { 91 } else { 90 },
                    self.tool,
                    self.feed,
                    self.spindle
                );
                self.reply(&report);
            }
            "#" => {
                let g54 = format!("[G54:{}]", fmt3(self.wco));
                self.reply(&g54);
                for name in ["G55", "G56", "G57", "G58", "G59", "G28", "G30", "G92"] {
                    self.reply(&format!("[{}:0.000,0.000,0.000]", name));
                }
                let tlo = format!("[TLO:{:.3}]", self.tlo);
                self.reply(&tlo);
                self.reply("[PRB:0.000,0.000,0.000:0]");
            }
            "$" => {
                for (n, v) in SETTINGS {
                    self.reply(&format!("${}={}", n, v));
                }
            }
            j if j.starts_with("J=") => {
                if self.alarm {
                    self.reply("error:9");
                    return;
                }
                let saved = self.incremental;
                let result = self.gcode(&command[2..]);
                self.incremental = saved;
                if let Err(code) = result {
                    self.reply(&format!("error:{}", code));
                    return;
                }
            }
            _ => {}
        }
        self.reply("ok");
    }

    fn gcode(&mut self, line: &str) -> Result<(), u8> {
        let words = words(line).ok_or(1u8)?;
        let codes: Vec<f64> = words
            .iter()
            .filter(|(l, _)| *l == 'G')
            .map(|(_, v)| *v)
            .collect();
        let has = |code: f64| codes.iter().any(|c| (c - code).abs() < 1e-6);
        let axis = |letter: char| words.iter().find(|(l, _)| *l == letter).map(|(_, v)| *v);
        let targets = [axis('X'), axis('Y'), axis('Z')];

        if has(90.0) {
            self.incremental = false;
        }
        if has(91.0) {
            self.incremental = true;
        }
        if let Some(f) = axis('F') {
            self.feed = f;
        }
        if let Some(s) = axis('S') {
            self.spindle = s;
        }
        if let Some(t) = axis('T') {
            self.tool = t as u32;
        }
        for (letter, value) in &words {
            if *letter == 'M' && (*value == 5.0) {
                self.spindle = 0.0;
            }
        }

        if has(10.0) {
            // G10 L20 P0: current position becomes the given work coordinate
            for (i, target) in targets.iter().enumerate() {
                if let Some(value) = target {
                    let tlo = if i == 2 { self.tlo } else { 0.0 };
                    self.wco[i] = self.position[i] - value - tlo;
                }
            }
            return Ok(());
        }
        if has(43.1) {
            self.tlo = targets[2].ok_or(26u8)?;
            return Ok(());
        }
        if has(4.0) || has(49.0) {
            if has(49.0) {
                self.tlo = 0.0;
            }
            return Ok(());
        }

        let machine_target = |position: [f64; 3], wco: [f64; 3], incremental: bool, g53: bool| {
            let mut out = position;
            for i in 0..3 {
                if let Some(value) = targets[i] {
                    out[i] = if g53 {
                        value
                    } else if incremental {
                        position[i] + value
                    } else {
                        value + wco[i]
                    };
                }
            }
            out
        };
        let target = machine_target(
            self.position,
            self.wco_effective(),
            self.incremental,
            has(53.0),
        );

        for code in [38.2, 38.3, 38.4, 38.5] {
            if has(code) {
                self.probe(code, target);
                return Ok(());
            }
        }
        for code in [0.0, 1.0, 2.0, 3.0] {
            if has(code) {
                self.motion = code as u8;
            }
        }
        if target != self.position {
            self.position = target;
            self.motion_ticks = self.motion_polls;
        }
        Ok(())
    }

    fn probe(&mut self, code: f64, target: [f64; 3]) {
        let wco = self.wco_effective();
        let start_work = self.work();
        let toward = code < 38.35;
        let contact = self
            .surface
            .as_ref()
            .and_then(|surface| surface(target[0] - wco[0], target[1] - wco[1]));
        let target_work_z = target[2] - wco[2];

        let hit = contact.filter(|z| {
            if toward {
                *z <= start_work[2] + 1e-9 && *z >= target_work_z - 1e-9
            } else {
                true
            }
        });
        let success = hit.is_some();
        self.position = match hit {
            Some(z) if toward => [target[0], target[1], z + wco[2]],
            Some(_) => self.position,
            None => target,
        };
        self.motion_ticks = self.motion_polls;

        let report = format!(
            "[PRB:{}:{}]",
            fmt3(self.position),
            if success { 1 } else { 0 }
        );
        self.reply(&report);
        let strict = (code - 38.2).abs() < 1e-6 || (code - 38.4).abs() < 1e-6;
        if !success && strict {
            self.alarm = true;
            self.reply("ALARM:5");
        }
    }
}

/// Simulated GRBL controller
#[derive(Clone, Default)]
pub struct SimulatedGrbl {
    inner: ThreadSafe<Machine>,
}

impl std::fmt::Debug for SimulatedGrbl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machine = self.inner.lock();
        f.debug_struct("SimulatedGrbl")
            .field("open", &machine.open)
            .field("state", &machine.state_word())
            .field("position", &machine.position)
            .finish()
    }
}

impl SimulatedGrbl {
    pub fn new() -> Self {
        Self {
            inner: thread_safe(Machine::default()),
        }
    }

    /// Probe contacts follow `surface(x, y)` in work coordinates
    pub fn with_surface(self, surface: impl Fn(f64, f64) -> Option<f64> + Send + Sync + 'static) -> Self {
        self.inner.lock().surface = Some(Arc::new(surface));
        self
    }

    /// Acknowledge 0 to 2 lines per read, in a sequence fixed by `seed`
    pub fn with_jitter(self, seed: u64) -> Self {
        self.inner.lock().jitter = Some(seed);
        self
    }

    /// Status polls that report `Run` after each motion
    pub fn with_motion_polls(self, polls: u32) -> Self {
        self.inner.lock().motion_polls = polls;
        self
    }

    pub fn with_rx_capacity(self, capacity: usize) -> Self {
        self.inner.lock().rx_capacity = capacity;
        self
    }

    /// Never answer anything
    pub fn silent(self) -> Self {
        self.inner.lock().silent = true;
        self
    }

    /// Raise an alarm as if a limit switch had tripped
    pub fn trigger_alarm(&self, code: u8) {
        let mut machine = self.inner.lock();
        machine.alarm = true;
        machine.motion_ticks = 0;
        machine.reply(&format!("ALARM:{}", code));
    }

    /// Make every further read and write fail as if the cable was pulled
    pub fn fail_transport(&self) {
        self.inner.lock().broken = true;
    }

    /// Every non-realtime line received, in order
    pub fn received_lines(&self) -> Vec<String> {
        self.inner.lock().received.clone()
    }

    pub fn realtime_bytes(&self) -> Vec<u8> {
        self.inner.lock().realtime.clone()
    }

    /// Bytes that arrived while the receive buffer was full
    pub fn overflows(&self) -> usize {
        self.inner.lock().overflows
    }

    /// Highest receive-buffer occupancy seen
    pub fn max_rx_used(&self) -> usize {
        self.inner.lock().max_rx_used
    }

    pub fn machine_position(&self) -> Position {
        Position::from_axes(&self.inner.lock().position)
    }

    pub fn work_position(&self) -> Position {
        Position::from_axes(&self.inner.lock().work())
    }

    pub fn tool_offset(&self) -> f64 {
        self.inner.lock().tlo
    }

    pub fn is_alarmed(&self) -> bool {
        self.inner.lock().alarm
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "simulated transport failure")
}

impl Transport for SimulatedGrbl {
    fn open(&mut self, params: &TransportParams) -> Result<(), ConnectionError> {
        let mut machine = self.inner.lock();
        if machine.open {
            return Err(ConnectionError::AlreadyConnected);
        }
        machine.open = true;
        machine.broken = false;
        machine.read_timeout = params.read_timeout;
        machine.rx.clear();
        machine.output.clear();
        machine.banner();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let wait = {
            let mut machine = self.inner.lock();
            if !machine.open {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            if machine.broken {
                return Err(broken_pipe());
            }
            machine.process();
            if !machine.output.is_empty() {
                let n = buf.len().min(machine.output.len());
                for (slot, byte) in buf.iter_mut().zip(machine.output.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            machine.read_timeout.min(MAX_READ_WAIT)
        };
        std::thread::sleep(wait);
        Err(io::Error::from(io::ErrorKind::TimedOut))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut machine = self.inner.lock();
        if !machine.open {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if machine.broken {
            return Err(broken_pipe());
        }
        machine.receive(data);
        Ok(())
    }

    fn close(&mut self) {
        let mut machine = self.inner.lock();
        machine.open = false;
        machine.rx.clear();
        machine.output.clear();
    }

    fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    fn name(&self) -> String {
        "simulator".to_string()
    }
}
