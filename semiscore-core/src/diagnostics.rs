//! Per-session scoring counters, readable while a session runs.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Per-session scoring counters. Shared through an `Arc` so a monitor can
/// read them while the session keeps scoring.
#[derive(Debug)]
pub struct ScoringDiagnostics {
    pub frames_scored: AtomicUsize,
    pub full_search_frames: AtomicUsize,
    pub pruned_search_frames: AtomicUsize,
    pub seed_only_frames: AtomicUsize,
    pub senones_scored: AtomicUsize,
    pub kd_candidates: AtomicUsize,
    pub stale_active_lists: AtomicUsize,
}

impl Default for ScoringDiagnostics {
    fn default() -> Self {
        Self {
            frames_scored: AtomicUsize::new(0),
            full_search_frames: AtomicUsize::new(0),
            pruned_search_frames: AtomicUsize::new(0),
            seed_only_frames: AtomicUsize::new(0),
            senones_scored: AtomicUsize::new(0),
            kd_candidates: AtomicUsize::new(0),
            stale_active_lists: AtomicUsize::new(0),
        }
    }
}

impl ScoringDiagnostics {
    pub fn reset(&self) {
        self.frames_scored.store(0, Ordering::Relaxed);
        self.full_search_frames.store(0, Ordering::Relaxed);
        self.pruned_search_frames.store(0, Ordering::Relaxed);
        self.seed_only_frames.store(0, Ordering::Relaxed);
        self.senones_scored.store(0, Ordering::Relaxed);
        self.kd_candidates.store(0, Ordering::Relaxed);
        self.stale_active_lists.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_scored: self.frames_scored.load(Ordering::Relaxed),
            full_search_frames: self.full_search_frames.load(Ordering::Relaxed),
            pruned_search_frames: self.pruned_search_frames.load(Ordering::Relaxed),
            seed_only_frames: self.seed_only_frames.load(Ordering::Relaxed),
            senones_scored: self.senones_scored.load(Ordering::Relaxed),
            kd_candidates: self.kd_candidates.load(Ordering::Relaxed),
            stale_active_lists: self.stale_active_lists.load(Ordering::Relaxed),
        }
    }
}

/// Search counters are per stream: a frame with two streams adds two to
/// the search totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_scored: usize,
    pub full_search_frames: usize,
    pub pruned_search_frames: usize,
    pub seed_only_frames: usize,
    pub senones_scored: usize,
    pub kd_candidates: usize,
    pub stale_active_lists: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_reset() {
        let d = ScoringDiagnostics::default();
        d.frames_scored.fetch_add(3, Ordering::Relaxed);
        d.kd_candidates.fetch_add(40, Ordering::Relaxed);
        let snap = d.snapshot();
        assert_eq!(snap.frames_scored, 3);
        assert_eq!(snap.kd_candidates, 40);

        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["framesScored"], 3);

        d.reset();
        assert_eq!(d.snapshot().frames_scored, 0);
    }
}
