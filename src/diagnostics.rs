//! Bounded queue of diagnostics waiting to be displayed.
//!
//! Any component, including the connection worker thread, may push; a display
//! consumer (the CLI or the status server) pops. The queue keeps the most recent
//! `capacity` entries and silently drops the oldest on overflow.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, warn};

use crate::error::NetError;
use crate::exec::truncate;

pub const DEFAULT_CAPACITY: usize = 32;
pub const MAX_MESSAGE_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedDiagnostic {
    pub message: String,
    pub severity: Severity,
}

/// Thread-safe circular buffer of [`QueuedDiagnostic`]s.
///
/// Before [`init`](Self::init) and after [`shutdown`](Self::shutdown) every
/// operation is a no-op.
#[derive(Debug)]
pub struct DiagnosticQueue {
    capacity: usize,
    entries: Mutex<Option<VecDeque<QueuedDiagnostic>>>,
}

impl Default for DiagnosticQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DiagnosticQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(None),
        }
    }

    /// A queue that is already accepting messages.
    pub fn active(capacity: usize) -> Self {
        let queue = Self::new(capacity);
        queue.init();
        queue
    }

    pub fn init(&self) {
        let mut entries = self.lock();
        if entries.is_none() {
            *entries = Some(VecDeque::with_capacity(self.capacity));
        }
    }

    /// Stops accepting messages and discards pending ones.
    pub fn shutdown(&self) {
        *self.lock() = None;
    }

    pub fn push(&self, message: &str, is_error: bool) {
        let severity = if is_error { Severity::Error } else { Severity::Warning };
        match severity {
            Severity::Error => error!("{}", message),
            Severity::Warning => warn!("{}", message),
        }

        let mut entries = self.lock();
        let Some(queue) = entries.as_mut() else {
            return;
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(QueuedDiagnostic {
            message: truncate(message, MAX_MESSAGE_LEN).to_string(),
            severity,
        });
    }

    pub fn push_error(&self, message: &str) {
        self.push(message, true);
    }

    pub fn push_warning(&self, message: &str) {
        self.push(message, false);
    }

    /// Queues a failed operation as an error, with its kind and a hint.
    pub fn report(&self, context: &str, err: &NetError) {
        let kind = err.kind();
        self.push_error(&format!("{}: {} [{}] {}", context, err, kind, kind.suggestion()));
    }

    /// Removes and returns the oldest entry.
    pub fn pop(&self) -> Option<QueuedDiagnostic> {
        self.lock().as_mut().and_then(VecDeque::pop_front)
    }

    pub fn has_pending(&self) -> bool {
        self.lock().as_ref().is_some_and(|queue| !queue.is_empty())
    }

    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(queue) = self.lock().as_mut() {
            queue.clear();
        }
    }

    /// Pops every pending entry, oldest first.
    pub fn drain(&self) -> Vec<QueuedDiagnostic> {
        self.lock()
            .as_mut()
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<VecDeque<QueuedDiagnostic>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_noop_before_init_and_after_shutdown() {
        let queue = DiagnosticQueue::new(4);
        queue.push_error("lost");
        assert!(!queue.has_pending());
        assert_eq!(queue.pop(), None);

        queue.init();
        queue.push_error("kept");
        assert!(queue.has_pending());

        queue.shutdown();
        assert!(!queue.has_pending());
        queue.push_warning("after shutdown");
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let queue = DiagnosticQueue::active(DEFAULT_CAPACITY);
        for i in 0..(DEFAULT_CAPACITY + 8) {
            queue.push(&format!("message {}", i), i % 2 == 0);
        }
        assert_eq!(queue.len(), DEFAULT_CAPACITY);

        let first = queue.pop().unwrap();
        assert_eq!(first.message, "message 8");
        assert_eq!(first.severity, Severity::Error);

        let rest = queue.drain();
        assert_eq!(rest.len(), DEFAULT_CAPACITY - 1);
        assert_eq!(rest.last().unwrap().message, format!("message {}", DEFAULT_CAPACITY + 7));
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_messages_are_bounded() {
        let queue = DiagnosticQueue::active(2);
        queue.push_warning(&"x".repeat(MAX_MESSAGE_LEN * 2));
        assert_eq!(queue.pop().unwrap().message.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_report_carries_kind_and_hint() {
        let queue = DiagnosticQueue::active(2);
        queue.report("Cannot connect to 'Home'", &NetError::network("Error: Timeout expired"));
        let entry = queue.pop().unwrap();
        assert_eq!(entry.severity, Severity::Error);
        assert!(entry.message.starts_with("Cannot connect to 'Home': timed out: Error: Timeout expired"));
        assert!(entry.message.contains("[timed out]"));
        assert!(entry.message.ends_with(crate::error::ErrorKind::Timeout.suggestion()));
    }

    #[test]
    fn test_clear() {
        let queue = DiagnosticQueue::active(2);
        queue.push_warning("a");
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(DiagnosticQueue::active(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..50 {
                        queue.push_warning(&format!("{}-{}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.len(), 8);
    }
}
