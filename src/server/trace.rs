//! Serve-Loop Tracing
//!
//! The serve loop reports its progress through a per-request stack of stage
//! events. A stage is pushed when it begins; when the request ends (well or
//! badly) the stack is drained last-in-first-out and each stage is reported
//! with the request's final outcome.
//!
//! Draining on completion, rather than reporting finishes inline, means a
//! stage that started always gets a finish record, even when the request
//! dies inside it, and stages that never started leave no record at all.
//! Stacks are pooled so steady-state tracing allocates nothing.

use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

/// Stages of serving a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A request exchange began.
    HttpStart,
    /// Reading and parsing the request head.
    ReadHeader,
    /// Reading the request body.
    ReadBody,
    /// The application handler is running.
    ServerHandle,
    /// Writing the response.
    Write,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::HttpStart => "http_start",
            EventKind::ReadHeader => "read_header",
            EventKind::ReadBody => "read_body",
            EventKind::ServerHandle => "server_handle",
            EventKind::Write => "write",
        }
    }
}

/// How the request that a stage belonged to ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Hijacked,
}

/// One finished stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub kind: EventKind,
    pub outcome: Outcome,
}

/// Receives stage records as requests finish.
pub trait Tracer: Send + Sync + 'static {
    fn record(&self, record: TraceRecord);
}

/// The per-request stage stack.
#[derive(Debug, Default)]
pub struct EventStack {
    events: Vec<EventKind>,
}

impl EventStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: EventKind) {
        self.events.push(kind);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drains the stack LIFO, reporting each started stage with the
    /// request's final outcome.
    pub fn finalize(&mut self, outcome: Outcome, tracer: Option<&dyn Tracer>) {
        match tracer {
            Some(tracer) => {
                while let Some(kind) = self.events.pop() {
                    tracer.record(TraceRecord { kind, outcome });
                }
            }
            None => self.events.clear(),
        }
    }
}

/// A lock-free pool of event stacks shared across connections.
pub struct EventStackPool {
    queue: ArrayQueue<EventStack>,
}

impl EventStackPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn get(&self) -> EventStack {
        self.queue.pop().unwrap_or_default()
    }

    /// Returns a drained stack. A stack that was never finalized is
    /// discarded rather than recycled.
    pub fn put(&self, stack: EventStack) {
        if stack.is_empty() {
            let _ = self.queue.push(stack);
        }
    }
}

impl Default for EventStackPool {
    fn default() -> Self {
        Self::new(128)
    }
}

/// A tracer that keeps every record, for inspection in tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    records: std::sync::Mutex<Vec<TraceRecord>>,
}

impl RecordingTracer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.records().iter().map(|r| r.kind).collect()
    }
}

impl Tracer for RecordingTracer {
    fn record(&self, record: TraceRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_drains_lifo() {
        let tracer = RecordingTracer::new();
        let mut stack = EventStack::new();
        stack.push(EventKind::HttpStart);
        stack.push(EventKind::ReadHeader);
        stack.push(EventKind::ServerHandle);

        stack.finalize(Outcome::Completed, Some(tracer.as_ref()));

        assert_eq!(
            tracer.kinds(),
            vec![
                EventKind::ServerHandle,
                EventKind::ReadHeader,
                EventKind::HttpStart
            ]
        );
        assert!(tracer.records().iter().all(|r| r.outcome == Outcome::Completed));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_unstarted_stages_leave_no_record() {
        let tracer = RecordingTracer::new();
        let mut stack = EventStack::new();
        stack.push(EventKind::HttpStart);
        stack.push(EventKind::ReadHeader);

        stack.finalize(Outcome::Failed, Some(tracer.as_ref()));

        let kinds = tracer.kinds();
        assert!(!kinds.contains(&EventKind::ReadBody));
        assert!(!kinds.contains(&EventKind::ServerHandle));
        assert!(!kinds.contains(&EventKind::Write));
    }

    #[test]
    fn test_pool_recycles_drained_stacks() {
        let pool = EventStackPool::new(4);
        let mut stack = pool.get();
        stack.push(EventKind::HttpStart);
        stack.finalize(Outcome::Completed, None);
        pool.put(stack);

        let recycled = pool.get();
        assert!(recycled.is_empty());
    }

    #[test]
    fn test_pool_discards_undrained_stacks() {
        let pool = EventStackPool::new(4);
        let mut stack = pool.get();
        stack.push(EventKind::HttpStart);
        pool.put(stack);

        assert!(pool.get().is_empty());
    }
}
