//! Record model: the entities being synchronized and their edit-time metadata.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// Identity
// ============================================================================

/// Identity of a run record: the run's start instant in epoch milliseconds.
///
/// Assigned by the caller and unique per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(RunId)
    }
}

/// Opaque per-user token. Every record on every store is scoped by one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserToken(String);

impl UserToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Edit Time
// ============================================================================

/// Store-assigned timestamp (epoch milliseconds) used only for
/// last-writer-wins ordering.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EditTime(pub i64);

impl EditTime {
    /// Edit time reported for records that do not exist.
    pub const ABSENT: EditTime = EditTime(0);

    pub fn millis(self) -> i64 {
        self.0
    }

    pub fn is_absent(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EditTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Monotonic edit-time source.
///
/// Stamps follow the wall clock but never repeat or go backwards, even when
/// two writes land in the same millisecond or the clock is stepped back.
#[derive(Debug, Default)]
pub struct EditClock {
    last: AtomicI64,
}

impl EditClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock that will only issue stamps later than `floor`.
    pub fn seeded(floor: EditTime) -> Self {
        Self {
            last: AtomicI64::new(floor.0),
        }
    }

    /// Issue the next stamp: `max(now, last + 1)`.
    pub fn next(&self) -> EditTime {
        let now = chrono::Utc::now().timestamp_millis();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return EditTime(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    /// Make sure later stamps sort after `seen` (used when a record arrives
    /// with an edit time from another store).
    pub fn observe(&self, seen: EditTime) {
        self.last.fetch_max(seen.0, Ordering::SeqCst);
    }
}

// ============================================================================
// Run Records
// ============================================================================

/// A GPS sample along a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the start of the run
    pub elapsed_ms: u64,
}

impl RoutePoint {
    pub fn new(latitude: f64, longitude: f64, elapsed_ms: u64) -> Self {
        Self {
            latitude,
            longitude,
            elapsed_ms,
        }
    }
}

/// Telemetry captured for a run. Opaque to the synchronization layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTelemetry {
    /// Total duration in seconds
    pub duration_s: f64,
    /// Total distance in meters
    pub distance_m: f64,
    /// Estimated energy in kilocalories
    pub calories: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_heart_rate: Option<u32>,
    #[serde(default)]
    pub route: Vec<RoutePoint>,
    /// Run was stopped and thrown away by the user
    #[serde(default)]
    pub discarded: bool,
}

/// One completed (or discarded) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub telemetry: RunTelemetry,
}

impl RunRecord {
    pub fn new(id: RunId, telemetry: RunTelemetry) -> Self {
        Self { id, telemetry }
    }

    /// Start instant in epoch milliseconds.
    pub fn start_time_ms(&self) -> i64 {
        self.id.0
    }
}

// ============================================================================
// Aggregate Record
// ============================================================================

/// Per-user running totals. Exactly one per user; the zeroed default stands
/// in for "deleted" because consumers always expect one to exist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub number_of_runs: u32,
    pub total_distance_m: f64,
    pub total_duration_s: f64,
    pub total_calories: f64,
    pub longest_run_m: f64,
}

impl AggregateRecord {
    /// Fold a finished run into the totals. Discarded runs do not count.
    pub fn accumulate(&mut self, run: &RunRecord) {
        let t = &run.telemetry;
        if t.discarded {
            return;
        }
        self.number_of_runs += 1;
        self.total_distance_m += t.distance_m;
        self.total_duration_s += t.duration_s;
        self.total_calories += t.calories;
        self.longest_run_m = self.longest_run_m.max(t.distance_m);
    }

    pub fn is_empty(&self) -> bool {
        *self == AggregateRecord::default()
    }
}

// ============================================================================
// Presence
// ============================================================================

/// Presence of a run id on one store.
///
/// Real and ghost are mutually exclusive for the same id on the same store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Never seen, or already reconciled away
    Absent,
    /// A live record exists, last edited at the given time
    Real(EditTime),
    /// A tombstone exists: the id was deliberately deleted here
    Ghost,
}
