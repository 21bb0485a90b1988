// =============================================================================
// Metrics Registry — owned counters for filters, streaming and turbo
// =============================================================================
//
// Explicit service injected where needed (no process-wide singleton). One
// lock per registry; snapshots are plain copies suitable for logging.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

/// Cumulative turbo counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TurboCounters {
    pub entries: u64,
    pub exits: u64,
    pub miss: u64,
    pub filter_break: u64,
    pub errors: u64,
    pub skips: u64,
}

/// Kept/rejected result of one filter stage in the last refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStageResult {
    pub kept: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Inner {
    turbo: TurboCounters,
    filter_stages: HashMap<String, FilterStageResult>,
    ws_messages: u64,
    ws_connections: u64,
    ws_errors: u64,
}

/// Thread-safe counter registry shared across subsystems.
#[derive(Default)]
pub struct MetricsRegistry {
    inner: RwLock<Inner>,
}

/// Serialisable snapshot of every counter.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub turbo: TurboCounters,
    pub filter_stages: HashMap<String, FilterStageResult>,
    pub ws_messages: u64,
    pub ws_connections: u64,
    pub ws_errors: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Turbo ───────────────────────────────────────────────────────────

    pub fn record_turbo_entry(&self) {
        self.inner.write().turbo.entries += 1;
    }

    pub fn record_turbo_exit(&self) {
        self.inner.write().turbo.exits += 1;
    }

    pub fn record_turbo_miss(&self) {
        self.inner.write().turbo.miss += 1;
    }

    pub fn record_turbo_filter_break(&self) {
        self.inner.write().turbo.filter_break += 1;
    }

    pub fn record_turbo_error(&self) {
        self.inner.write().turbo.errors += 1;
    }

    pub fn record_turbo_skip(&self) {
        self.inner.write().turbo.skips += 1;
    }

    pub fn turbo(&self) -> TurboCounters {
        self.inner.read().turbo
    }

    // ── Filter stages ───────────────────────────────────────────────────

    /// Record the kept/rejected counts of one filter stage. Overwrites the
    /// previous cycle's result for the same stage.
    pub fn record_filter_result(&self, stage: &str, kept: usize, rejected: usize) {
        self.inner.write().filter_stages.insert(
            stage.to_string(),
            FilterStageResult {
                kept: kept as u64,
                rejected: rejected as u64,
            },
        );
    }

    pub fn filter_result(&self, stage: &str) -> Option<FilterStageResult> {
        self.inner.read().filter_stages.get(stage).copied()
    }

    // ── Streaming ───────────────────────────────────────────────────────

    pub fn record_ws_message(&self) {
        self.inner.write().ws_messages += 1;
    }

    pub fn record_ws_connection(&self) {
        self.inner.write().ws_connections += 1;
    }

    pub fn record_ws_error(&self) {
        self.inner.write().ws_errors += 1;
    }

    // ── Snapshot / summary ──────────────────────────────────────────────

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read();
        MetricsSnapshot {
            turbo: inner.turbo,
            filter_stages: inner.filter_stages.clone(),
            ws_messages: inner.ws_messages,
            ws_connections: inner.ws_connections,
            ws_errors: inner.ws_errors,
        }
    }

    /// Log a one-line turbo counter summary.
    pub fn log_turbo_summary(&self, active: usize, max_parallel: usize, cooldown: usize) {
        let t = self.turbo();
        info!(
            active,
            max_parallel,
            cooldown,
            entries = t.entries,
            exits = t.exits,
            miss = t.miss,
            filter_break = t.filter_break,
            errors = t.errors,
            skips = t.skips,
            "[Turbo Metrics]"
        );
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MetricsRegistry")
            .field("turbo", &inner.turbo)
            .field("ws_messages", &inner.ws_messages)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = MetricsRegistry::new();
        m.record_turbo_entry();
        m.record_turbo_entry();
        m.record_turbo_miss();
        m.record_turbo_skip();
        let t = m.turbo();
        assert_eq!(t.entries, 2);
        assert_eq!(t.miss, 1);
        assert_eq!(t.skips, 1);
        assert_eq!(t.exits, 0);
    }

    #[test]
    fn filter_results_overwrite_per_stage() {
        let m = MetricsRegistry::new();
        m.record_filter_result("spread", 10, 5);
        m.record_filter_result("spread", 7, 3);
        let r = m.filter_result("spread").unwrap();
        assert_eq!(r.kept, 7);
        assert_eq!(r.rejected, 3);
        assert!(m.filter_result("volatility").is_none());
    }

    #[test]
    fn snapshot_is_detached_copy() {
        let m = MetricsRegistry::new();
        m.record_ws_message();
        let snap = m.snapshot();
        m.record_ws_message();
        assert_eq!(snap.ws_messages, 1);
        assert_eq!(m.snapshot().ws_messages, 2);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        use std::sync::Arc;
        let m = Arc::new(MetricsRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_turbo_entry();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.turbo().entries, 8000);
    }
}
