//! Character-counting flow control
//!
//! GRBL has a fixed serial receive buffer. The sender keeps the byte count
//! of every line that was written but not yet answered, and only writes the
//! next line when it fits. Each `ok` or `error:N` frees the oldest line.

use std::collections::VecDeque;

/// Default GRBL receive buffer size in bytes
pub const DEFAULT_RX_BUFFER_SIZE: usize = 128;

/// A line written to the controller and awaiting its acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct InFlight {
    /// Line text without terminator
    pub line: String,
    /// Bytes occupied in the receive buffer, terminator included
    pub bytes: usize,
    /// Run the line belongs to
    pub run: Option<u64>,
    /// Acknowledgment clears the alarm latch (`$X`, `$H`)
    pub unlocks: bool,
}

/// Receive buffer accounting
#[derive(Debug, Clone)]
pub struct FlowControl {
    capacity: usize,
    used: usize,
    in_flight: VecDeque<InFlight>,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_RX_BUFFER_SIZE)
    }
}

impl FlowControl {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            in_flight: VecDeque::new(),
        }
    }

    /// Bytes a line occupies once terminated
    pub fn cost(line: &str) -> usize {
        line.len() + 1
    }

    /// Check if a line fits in the remaining space
    pub fn fits(&self, line: &str) -> bool {
        self.used + Self::cost(line) <= self.capacity
    }

    /// Check if a line could ever fit, even with an empty buffer
    pub fn can_ever_fit(&self, line: &str) -> bool {
        Self::cost(line) <= self.capacity
    }

    /// Record a written line
    pub fn push(&mut self, line: impl Into<String>, run: Option<u64>, unlocks: bool) {
        let line = line.into();
        let bytes = Self::cost(&line);
        self.used += bytes;
        self.in_flight.push_back(InFlight {
            line,
            bytes,
            run,
            unlocks,
        });
    }

    /// Free the oldest line; acknowledgments arrive in send order
    pub fn acknowledge(&mut self) -> Option<InFlight> {
        let entry = self.in_flight.pop_front()?;
        self.used = self.used.saturating_sub(entry.bytes);
        Some(entry)
    }

    /// Forget everything in flight, returning how many lines were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.in_flight.len();
        self.in_flight.clear();
        self.used = 0;
        dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Buffer usage as a percentage
    pub fn fill_percent(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.used as f64 / self.capacity as f64) * 100.0
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of in-flight lines belonging to a run
    pub fn in_flight_for(&self, run: u64) -> usize {
        self.in_flight.iter().filter(|e| e.run == Some(run)).count()
    }

    /// Oldest unacknowledged line
    pub fn front(&self) -> Option<&InFlight> {
        self.in_flight.front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_counts_terminator() {
        let mut flow = FlowControl::new(10);
        assert!(flow.fits("123456789"));
        assert!(!flow.fits("1234567890"));
        flow.push("1234", None, false);
        assert_eq!(flow.used(), 5);
        assert!(flow.fits("1234"));
        assert!(!flow.fits("12345"));
    }

    #[test]
    fn test_fifo_acknowledgment() {
        let mut flow = FlowControl::new(128);
        flow.push("G0 X1", Some(1), false);
        flow.push("$X", None, true);
        let first = flow.acknowledge().unwrap();
        assert_eq!(first.line, "G0 X1");
        assert_eq!(first.run, Some(1));
        let second = flow.acknowledge().unwrap();
        assert!(second.unlocks);
        assert!(flow.acknowledge().is_none());
        assert_eq!(flow.used(), 0);
    }

    #[test]
    fn test_clear_and_fill() {
        let mut flow = FlowControl::new(100);
        flow.push("G1 X10 Y10 F100", Some(3), false);
        flow.push("G1 X0", Some(3), false);
        assert_eq!(flow.in_flight_for(3), 2);
        assert!((flow.fill_percent() - 22.0).abs() < 1e-9);
        assert_eq!(flow.clear(), 2);
        assert!(flow.is_empty());
        assert_eq!(flow.fill_percent(), 0.0);
    }

    #[test]
    fn test_can_ever_fit() {
        let flow = FlowControl::new(8);
        assert!(flow.can_ever_fit("1234567"));
        assert!(!flow.can_ever_fit("12345678"));
    }
}
