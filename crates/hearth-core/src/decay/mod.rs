//! Prominence Decay
//!
//! Each latest memory's prominence drifts toward a floor set by the time
//! since it was last accessed (or created) and its importance:
//!
//! ```text
//! half_life = base_half_life * 2^((importance - 5) / 2.5)
//! floor     = 0.5^(days / half_life)
//! prominence = min(prominence, floor)
//! ```
//!
//! Importance 5 halves every 14 days; importance 8 every ~32 days; importance
//! 10 every ~56 days. Memories dropping below the archive threshold are
//! archived (superseded, not latest). Archived and superseded memories keep
//! fading on later passes; once below the prune threshold they become
//! eligible for physical deletion by a separate sweep.
//!
//! Reinforcement is the inverse: confidence and prominence move a fixed
//! fraction of the way toward 1.0.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DecayConfig;
use crate::memory::{MemoryEntry, MemoryType};

/// Fraction of the remaining distance to 1.0 gained by confidence
pub const CONFIDENCE_GAIN: f64 = 0.2;

/// Fraction of the remaining distance to 1.0 gained by prominence
pub const PROMINENCE_GAIN: f64 = 0.3;

/// Result of a decay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecayReport {
    /// Memories whose prominence dropped
    pub updated: usize,
    /// Memories archived by this pass
    pub archived: usize,
}

impl DecayReport {
    pub fn merge(&mut self, other: DecayReport) {
        self.updated += other.updated;
        self.archived += other.archived;
    }
}

/// Confidence and prominence after a re-statement, both bounded at 1.0
pub fn reinforcement(confidence: f64, prominence: f64) -> (f64, f64) {
    let c = confidence.clamp(0.0, 1.0);
    let p = prominence.clamp(0.0, 1.0);
    (
        (c + (1.0 - c) * CONFIDENCE_GAIN).min(1.0),
        (p + (1.0 - p) * PROMINENCE_GAIN).min(1.0),
    )
}

/// Decay engine
#[derive(Debug, Clone, Default)]
pub struct DecayEngine {
    config: DecayConfig,
}

impl DecayEngine {
    pub fn new(config: DecayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    /// Half-life in days for an importance level
    pub fn half_life_days(&self, importance: u8) -> f64 {
        let importance = importance.clamp(1, 10) as f64;
        self.config.base_half_life_days * 2f64.powf((importance - 5.0) / 2.5)
    }

    /// Prominence ceiling for `entry` at `now`
    pub fn floor(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> f64 {
        let days = (now - entry.decay_reference()).num_seconds() as f64 / 86_400.0;
        if days <= 0.0 {
            return 1.0;
        }
        0.5f64.powf(days / self.half_life_days(entry.importance))
    }

    /// Whether decay applies to `entry` at all
    pub fn is_subject_to_decay(&self, entry: &MemoryEntry) -> bool {
        entry.is_latest
            && !matches!(
                entry.memory_type,
                MemoryType::StaticProfile | MemoryType::Superseded
            )
    }

    /// Recompute prominence in place. Only latest, non-superseded,
    /// non-static memories are touched. `updated_at` is never modified.
    pub fn recompute_prominence(&self, entries: &mut [MemoryEntry], now: DateTime<Utc>) -> DecayReport {
        let mut report = DecayReport::default();

        for entry in entries.iter_mut() {
            if !self.is_subject_to_decay(entry) {
                continue;
            }

            let decayed = entry.prominence.min(self.floor(entry, now));
            if decayed < entry.prominence {
                entry.prominence = decayed;
                report.updated += 1;
            }

            if entry.prominence < self.config.archive_threshold {
                entry.is_latest = false;
                entry.memory_type = MemoryType::Superseded;
                report.archived += 1;
                tracing::debug!(
                    memory_id = %entry.id,
                    prominence = entry.prominence,
                    "Archiving decayed memory"
                );
            }
        }

        report
    }

    /// Keep fading memories that are no longer latest. Their state is left
    /// as is; only prominence drops. Returns how many changed.
    pub fn fade_archived(&self, entries: &mut [MemoryEntry], now: DateTime<Utc>) -> usize {
        let mut faded = 0;
        for entry in entries.iter_mut() {
            if !entry.is_superseded() || entry.memory_type == MemoryType::StaticProfile {
                continue;
            }
            let decayed = entry.prominence.min(self.floor(entry, now));
            if decayed < entry.prominence {
                entry.prominence = decayed;
                faded += 1;
            }
        }
        faded
    }

    /// Whether an archived memory may be physically deleted
    pub fn is_prunable(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
        entry.is_superseded()
            && entry.prominence < self.config.prune_threshold
            && entry.created_at < self.prune_cutoff(now)
    }

    /// Memories created after this instant are too young to prune
    pub fn prune_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.config.prune_min_age_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NewMemory;

    fn entry(importance: u8, age_days: i64, now: DateTime<Utc>) -> MemoryEntry {
        let input = NewMemory::new("u", "fact").with_importance(importance);
        let mut e = crate::memory::MemoryEntry::from_new(input, now - Duration::days(age_days));
        e.prominence = 1.0;
        e
    }

    #[test]
    fn test_half_life_scales_with_importance() {
        let engine = DecayEngine::default();
        assert!((engine.half_life_days(5) - 14.0).abs() < 1e-9);
        assert!(engine.half_life_days(8) > engine.half_life_days(5));
        assert!(engine.half_life_days(3) < engine.half_life_days(5));
    }

    #[test]
    fn test_fresh_memory_keeps_prominence() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        let mut entries = vec![entry(5, 0, now)];
        let report = engine.recompute_prominence(&mut entries, now);
        assert_eq!(report, DecayReport::default());
        assert_eq!(entries[0].prominence, 1.0);
    }

    #[test]
    fn test_one_half_life_halves_prominence() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        let mut entries = vec![entry(5, 14, now)];
        let report = engine.recompute_prominence(&mut entries, now);
        assert_eq!(report.updated, 1);
        assert!((entries[0].prominence - 0.5).abs() < 0.01);
        assert!(entries[0].is_latest);
    }

    #[test]
    fn test_importance_resists_decay() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        let mut entries = vec![entry(5, 30, now), entry(8, 30, now)];
        engine.recompute_prominence(&mut entries, now);
        assert!(entries[1].prominence > entries[0].prominence);
    }

    #[test]
    fn test_archive_below_threshold() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        // 0.5^(60/14) ~= 0.05, below 0.15
        let mut entries = vec![entry(5, 60, now)];
        let report = engine.recompute_prominence(&mut entries, now);
        assert_eq!(report.archived, 1);
        assert!(!entries[0].is_latest);
        assert_eq!(entries[0].memory_type, MemoryType::Superseded);
    }

    #[test]
    fn test_static_profile_never_decays() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        let mut e = entry(5, 365, now);
        e.memory_type = MemoryType::StaticProfile;
        let mut entries = vec![e];
        engine.recompute_prominence(&mut entries, now);
        assert_eq!(entries[0].prominence, 1.0);
        assert!(entries[0].is_latest);
    }

    #[test]
    fn test_decay_never_raises_prominence() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        let mut e = entry(5, 1, now);
        e.prominence = 0.4;
        let mut entries = vec![e];
        engine.recompute_prominence(&mut entries, now);
        assert_eq!(entries[0].prominence, 0.4);
    }

    #[test]
    fn test_decay_leaves_updated_at() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        let mut entries = vec![entry(5, 40, now)];
        let before = entries[0].updated_at;
        engine.recompute_prominence(&mut entries, now);
        assert_eq!(entries[0].updated_at, before);
    }

    #[test]
    fn test_archived_memory_keeps_fading() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        let mut entries = vec![entry(5, 40, now)];
        engine.recompute_prominence(&mut entries, now);
        assert!(!entries[0].is_latest);
        let archived_at = entries[0].prominence;

        // Archived rows are skipped by the latest-only pass
        let later = now + Duration::days(100);
        assert_eq!(engine.recompute_prominence(&mut entries, later), DecayReport::default());
        assert_eq!(engine.fade_archived(&mut entries, later), 1);
        assert!(entries[0].prominence < archived_at);
        assert!(engine.is_prunable(&entries[0], later));
        assert_eq!(entries[0].memory_type, MemoryType::Superseded);
    }

    #[test]
    fn test_fade_skips_latest_memories() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        let mut entries = vec![entry(5, 30, now)];
        assert_eq!(engine.fade_archived(&mut entries, now), 0);
        assert_eq!(entries[0].prominence, 1.0);
    }

    #[test]
    fn test_prunable_requires_archived_old_and_faded() {
        let engine = DecayEngine::default();
        let now = Utc::now();
        let mut e = entry(5, 200, now);
        e.prominence = 0.01;
        assert!(!engine.is_prunable(&e, now), "latest memories are never pruned");

        e.is_latest = false;
        e.memory_type = MemoryType::Superseded;
        assert!(engine.is_prunable(&e, now));

        let mut young = entry(5, 2, now);
        young.is_latest = false;
        young.prominence = 0.01;
        assert!(!engine.is_prunable(&young, now));
    }

    #[test]
    fn test_reinforcement_is_bounded_and_increasing() {
        let (c, p) = reinforcement(0.8, 0.5);
        assert!((c - 0.84).abs() < 1e-9);
        assert!((p - 0.65).abs() < 1e-9);

        let (c, p) = reinforcement(1.0, 1.0);
        assert_eq!((c, p), (1.0, 1.0));

        let mut c = 0.1;
        for _ in 0..100 {
            let (next, _) = reinforcement(c, 0.0);
            assert!(next >= c && next <= 1.0);
            c = next;
        }
    }
}
