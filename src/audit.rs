// =============================================================================
// Audit log — bounded ring buffer of structured trading events
// =============================================================================
//
// Each `SymbolContext` owns one `AuditLog` capturing the control-plane event
// kinds named by the external-interface spec (ORDER_PLACED, ORDER_FILLED,
// STOPLOSS_COOLDOWN_STARTED, ...). Events are always also emitted through
// `tracing`; the ring buffer is a bounded in-process retention window for
// introspection, not a second transport.
// =============================================================================

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default retention depth for a symbol's audit log.
const DEFAULT_CAPACITY: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: String,
    pub kind: String,
    pub message: String,
}

impl AuditEvent {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now().to_rfc3339(),
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Thread-safe bounded ring buffer; oldest entries are evicted first.
pub struct AuditLog {
    capacity: usize,
    events: RwLock<VecDeque<AuditEvent>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, kind: impl Into<String>, message: impl Into<String>) {
        let mut events = self.events.write();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(AuditEvent::new(kind, message));
    }

    /// Most recent `count` events, newest last.
    pub fn recent(&self, count: usize) -> Vec<AuditEvent> {
        let events = self.events.read();
        let len = events.len();
        let start = len.saturating_sub(count);
        events.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_log_evicts_oldest_over_capacity() {
        let log = AuditLog::new(3);
        log.record("A", "1");
        log.record("A", "2");
        log.record("A", "3");
        log.record("A", "4");
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "2");
        assert_eq!(recent[2].message, "4");
    }
}
