//! Selection strategies (spec §4.5): given a snapshot of ready-or-not
//! servers, pick one. Modeled as a tagged enum rather than a trait object —
//! there are exactly two variants and round-robin is the only one that
//! carries state (spec design notes: "a tagged variant ... is sufficient;
//! no inheritance needed").

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::state::ConnectionState;

/// A point-in-time view of one server, as much as a strategy needs to pick
/// among candidates. Built by [`crate::pool::PoolManager`] from its entries;
/// strategies never see the manager's internals directly.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub id: String,
    pub state: ConnectionState,
    pub last_latency: Option<Duration>,
}

impl ServerSnapshot {
    fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }
}

/// Round-robin's cursor. An atomic counter incremented on every `select`
/// call regardless of outcome, so fairness holds even across calls that
/// find no ready candidate.
#[derive(Debug, Default)]
pub struct RoundRobinCursor {
    next: AtomicU64,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(0) }
    }

    /// Test hook: zero the cursor.
    pub fn reset(&self) {
        self.next.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub enum SelectionStrategy {
    /// Among ready candidates, the one with the lowest observed latency.
    /// Servers without a latency sort last; ties break by server id.
    HealthBased,
    /// A rotating cursor scans forward from `cursor mod n` for the first
    /// ready candidate.
    RoundRobin(RoundRobinCursor),
}

impl SelectionStrategy {
    pub fn round_robin() -> Self {
        SelectionStrategy::RoundRobin(RoundRobinCursor::new())
    }

    pub fn name(&self) -> &'static str {
        match self {
            SelectionStrategy::HealthBased => "health-based",
            SelectionStrategy::RoundRobin(_) => "round-robin",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SelectionStrategy::HealthBased => {
                "selects the ready server with the lowest observed request latency"
            }
            SelectionStrategy::RoundRobin(_) => {
                "cycles through ready servers in order, one per call"
            }
        }
    }

    /// Test hook: zero the round-robin cursor, a no-op for health-based.
    pub fn reset(&self) {
        if let SelectionStrategy::RoundRobin(cursor) = self {
            cursor.reset();
        }
    }

    pub fn select(&self, candidates: &[ServerSnapshot]) -> Option<String> {
        match self {
            SelectionStrategy::HealthBased => select_health_based(candidates),
            SelectionStrategy::RoundRobin(cursor) => select_round_robin(candidates, cursor),
        }
    }
}

fn select_health_based(candidates: &[ServerSnapshot]) -> Option<String> {
    candidates
        .iter()
        .filter(|c| c.is_ready())
        .min_by(|a, b| {
            let key = |c: &ServerSnapshot| (c.last_latency.unwrap_or(Duration::MAX), c.id.clone());
            key(a).cmp(&key(b))
        })
        .map(|c| c.id.clone())
}

fn select_round_robin(candidates: &[ServerSnapshot], cursor: &RoundRobinCursor) -> Option<String> {
    let n = candidates.len();
    if n == 0 {
        return None;
    }
    let k = cursor.next.fetch_add(1, Ordering::SeqCst) as usize;
    let start = k % n;
    (0..n)
        .map(|offset| &candidates[(start + offset) % n])
        .find(|c| c.is_ready())
        .map(|c| c.id.clone())
}
