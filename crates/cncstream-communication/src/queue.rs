//! Outbound queue shared by the run controller and the protocol engine
//!
//! The run controller appends compiled [`QueueItem`]s and clears them on
//! stop; the protocol engine pops them from the front as flow control
//! allows. Realtime bytes and soft resets travel separately through the
//! control mailbox so they are never held behind queued lines.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use cncstream_core::{
    format_number, thread_safe, thread_safe_deque, Expr, ExprError, ThreadSafe, ThreadSafeDeque,
    Value, VarLookup,
};

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// Piece of a line template
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    /// `[expr]`, evaluated when the line is dequeued
    Expr(Expr),
}

/// A line with optional `[expr]` substitutions
#[derive(Debug, Clone, PartialEq)]
pub struct LineTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl LineTemplate {
    /// Split `G0 Z[toolprobez-mz]` into text and expression segments
    ///
    /// An unmatched `[` is kept as text.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find('[') {
            let Some(close) = rest[open..].find(']').map(|c| open + c) else {
                break;
            };
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            segments.push(Segment::Expr(Expr::parse(&rest[open + 1..close])?));
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Template without substitutions
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            segments: vec![Segment::Text(text.clone())],
            source: text,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }

    /// Substitute current values; numbers use at most 4 decimals
    pub fn render(&self, vars: &dyn VarLookup) -> Result<String, ExprError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) => match expr.eval(vars)? {
                    Value::Number(n) => out.push_str(&format_number(n)),
                    Value::Text(t) => out.push_str(&t),
                },
            }
        }
        Ok(out)
    }
}

impl fmt::Display for LineTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// What a queue entry does when it reaches the front
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItemKind {
    /// Line for the controller
    Line(LineTemplate),
    /// Hold until everything sent is acknowledged and the machine is idle
    Wait,
    /// Write expression results into machine state
    Assign(Vec<(String, Expr)>),
    /// Publish a generic update for a key
    Update(String),
    /// Publish an operator message
    Message(String),
    /// Suspend the run until the operator acknowledges a tool change
    Suspend { tool: u32 },
}

/// One queued command
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    /// Unique per item; the engine only pops the item it inspected
    pub id: u64,
    pub kind: QueueItemKind,
    /// Run the item belongs to, `None` for interactive commands
    pub run: Option<u64>,
    /// Index of the originating line in the submitted program
    pub index: Option<usize>,
}

impl QueueItem {
    pub fn new(kind: QueueItemKind, run: Option<u64>, index: Option<usize>) -> Self {
        Self {
            id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            run,
            index,
        }
    }

    /// Interactive item outside any run
    pub fn interactive(kind: QueueItemKind) -> Self {
        Self::new(kind, None, None)
    }
}

/// Out-of-band requests for the protocol engine
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Write one realtime byte immediately
    Realtime(u8),
    /// Soft reset: write 0x18 and drop every in-flight line
    SoftReset,
    /// System command sent ahead of the queue (`$X`, `$H`, `$J=`)
    Priority(String),
}

/// State shared between the run controller and the protocol engine
#[derive(Debug, Clone)]
pub struct QueueHandles {
    pub queue: ThreadSafeDeque<QueueItem>,
    pub tracker: ThreadSafe<RunTracker>,
    pub mailbox: ThreadSafeDeque<ControlRequest>,
}

impl Default for QueueHandles {
    fn default() -> Self {
        Self {
            queue: thread_safe_deque(),
            tracker: thread_safe(RunTracker::default()),
            mailbox: thread_safe_deque(),
        }
    }
}

impl QueueHandles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued items not yet taken by the engine
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Post a control request for the engine's next cycle
    pub fn post(&self, request: ControlRequest) {
        self.mailbox.lock().push_back(request);
    }
}

/// Pending tool change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suspension {
    pub tool: u32,
    /// Token the acknowledgment must present
    pub token: u64,
}

/// Progress of the active run
#[derive(Debug, Clone, Default)]
pub struct RunTracker {
    pub active: bool,
    pub run_id: u64,
    /// Lines submitted for transmission
    pub total: usize,
    /// Run lines acknowledged (ok or error)
    pub acknowledged: usize,
    /// Run items still in the queue
    pub pending: usize,
    pub started: Option<Instant>,
    pub suspended: Option<Suspension>,
    next_token: u64,
}

impl RunTracker {
    /// Start tracking a new run
    pub fn begin(&mut self, run_id: u64, total: usize, pending: usize) {
        self.active = true;
        self.run_id = run_id;
        self.total = total;
        self.acknowledged = 0;
        self.pending = pending;
        self.started = Some(Instant::now());
        self.suspended = None;
    }

    /// Stop tracking; returns the acknowledged line count
    pub fn finish(&mut self) -> usize {
        self.active = false;
        self.pending = 0;
        self.suspended = None;
        self.acknowledged
    }

    /// Check if an item or in-flight line belongs to the active run
    pub fn owns(&self, run: Option<u64>) -> bool {
        self.active && run == Some(self.run_id)
    }

    /// Enter the suspended state with a fresh token
    pub fn suspend(&mut self, tool: u32) -> Suspension {
        self.next_token += 1;
        let suspension = Suspension {
            tool,
            token: self.next_token,
        };
        self.suspended = Some(suspension);
        suspension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_substitutions() {
        let template = LineTemplate::parse("G53 G0 Z[toolprobez-mz-10] F[feed]").unwrap();
        assert!(!template.is_literal());
        let values = vars(&[
            ("toolprobez", Value::Number(-5.0)),
            ("mz", Value::Number(-1.25)),
            ("feed", Value::Number(100.0)),
        ]);
        assert_eq!(template.render(&values).unwrap(), "G53 G0 Z-13.75 F100");
    }

    #[test]
    fn test_text_values_verbatim() {
        let template = LineTemplate::parse("G91 [prbcmd] Z-5").unwrap();
        let values = vars(&[("prbcmd", Value::Text("G38.2".into()))]);
        assert_eq!(template.render(&values).unwrap(), "G91 G38.2 Z-5");
    }

    #[test]
    fn test_literal_and_unmatched_bracket() {
        let template = LineTemplate::parse("G0 X1 [").unwrap();
        assert!(template.is_literal());
        assert_eq!(template.render(&HashMap::new()).unwrap(), "G0 X1 [");
        assert!(LineTemplate::parse("G0 X[1+]").is_err());
    }

    #[test]
    fn test_unknown_variable_at_render() {
        let template = LineTemplate::parse("G0 X[nothere]").unwrap();
        assert_eq!(
            template.render(&HashMap::new()),
            Err(ExprError::UnknownVariable("nothere".into()))
        );
    }

    #[test]
    fn test_tracker_tokens() {
        let mut tracker = RunTracker::default();
        tracker.begin(7, 10, 12);
        assert!(tracker.owns(Some(7)));
        assert!(!tracker.owns(None));
        let first = tracker.suspend(3);
        let second = tracker.suspend(4);
        assert_ne!(first.token, second.token);
        assert_eq!(tracker.finish(), 0);
        assert!(!tracker.owns(Some(7)));
    }
}
