//! Whole-room position history for lag-compensated hit checks
//!
//! One snapshot per physics tick, so every rewound lookup sees all players
//! at the same physical instant.

use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

use crate::ws::protocol::Team;

use super::player::PlayerTable;

/// Default ring capacity, comfortably covering the rewind window
pub const HISTORY_CAPACITY: usize = 120;

/// Per-player entry inside one snapshot
#[derive(Debug, Clone, Copy)]
pub struct HistoricalPlayer {
    pub x: f32,
    pub z: f32,
    pub team: Team,
    pub is_dead: bool,
}

/// Whole-room snapshot at one wall-clock instant
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub timestamp_ms: u64,
    pub players: HashMap<Uuid, HistoricalPlayer>,
}

/// Fixed-capacity ring of snapshots, contiguous storage with a head index
#[derive(Debug)]
pub struct PositionHistory {
    entries: Vec<PositionSnapshot>,
    capacity: usize,
    /// Index the next snapshot will be written to once the ring is full
    head: usize,
}

impl PositionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a snapshot of all live players at `now_ms`.
    ///
    /// Timestamps must be strictly increasing in arrival order; a catch-up
    /// burst can land several ticks on the same millisecond, in which case
    /// only the first is kept (the others describe the same instant).
    pub fn record(&mut self, now_ms: u64, players: &PlayerTable) {
        if let Some(newest) = self.newest() {
            if now_ms <= newest.timestamp_ms {
                return;
            }
        }

        let snapshot = PositionSnapshot {
            timestamp_ms: now_ms,
            players: players
                .iter()
                .map(|(session, p)| {
                    (
                        *session,
                        HistoricalPlayer {
                            x: p.x,
                            z: p.z,
                            team: p.team,
                            is_dead: p.is_dead,
                        },
                    )
                })
                .collect(),
        };

        if self.entries.len() < self.capacity {
            self.entries.push(snapshot);
        } else {
            self.entries[self.head] = snapshot;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    /// The world as of `target_ms`, rounded down: the most recent snapshot
    /// whose timestamp is <= the target. A target older than the whole ring
    /// yields the oldest snapshot; an empty ring yields None.
    pub fn lookup(&self, target_ms: u64) -> Option<&PositionSnapshot> {
        if self.is_empty() {
            return None;
        }

        let mut best: Option<&PositionSnapshot> = None;
        for snapshot in &self.entries {
            if snapshot.timestamp_ms <= target_ms {
                match best {
                    Some(current) if current.timestamp_ms >= snapshot.timestamp_ms => {}
                    _ => best = Some(snapshot),
                }
            }
        }

        best.or_else(|| {
            let oldest = self.oldest();
            if let Some(snapshot) = oldest {
                warn!(
                    target_ms,
                    oldest_ms = snapshot.timestamp_ms,
                    "history lookup predates buffer, returning oldest snapshot"
                );
            }
            oldest
        })
    }

    fn newest(&self) -> Option<&PositionSnapshot> {
        self.entries.iter().max_by_key(|s| s.timestamp_ms)
    }

    fn oldest(&self) -> Option<&PositionSnapshot> {
        self.entries.iter().min_by_key(|s| s.timestamp_ms)
    }
}

impl Default for PositionHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}
