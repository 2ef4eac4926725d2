//! Aggregation: detections in, one `CrowdSnapshot` out per processed frame.
//!
//! - count: person detections at or above the confidence threshold
//! - density bucket: `low < T1 <= medium < T2 <= high`
//! - trend: current count against the mean of the last N snapshots
//!
//! The history window only ever sees snapshots that were actually produced. Skipped
//! frames do not advance it, so the trend is over processed frames, not wall time.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::AggregateSettings;
use crate::detect::{Detection, ObjectClass};
use crate::frame::FrameMeta;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DensityBucket {
    Low,
    Medium,
    High,
}

impl DensityBucket {
    pub fn classify(count: u32, medium_at: u32, high_at: u32) -> Self {
        if count >= high_at {
            DensityBucket::High
        } else if count >= medium_at {
            DensityBucket::Medium
        } else {
            DensityBucket::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DensityBucket::Low => "low",
            DensityBucket::Medium => "medium",
            DensityBucket::High => "high",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

impl Trend {
    /// Compare `current` against `mean` with a relative dead band of `epsilon`.
    pub fn classify(current: u32, mean: f64, epsilon: f32) -> Self {
        let current = current as f64;
        let epsilon = epsilon as f64;
        if current > mean * (1.0 + epsilon) {
            Trend::Rising
        } else if current < mean * (1.0 - epsilon) {
            Trend::Falling
        } else {
            Trend::Stable
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Rising => "rising",
            Trend::Falling => "falling",
            Trend::Stable => "stable",
        }
    }
}

/// A counted person, in frame-relative coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
}

/// Crowd metadata for one processed frame. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrowdSnapshot {
    pub source_id: String,
    /// Sequence number of the frame this snapshot describes.
    pub seq: u64,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub count: u32,
    pub density: DensityBucket,
    /// `None` for the first snapshot, when there is no history to compare against.
    pub trend: Option<Trend>,
    pub anomaly: bool,
    pub processing_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detections: Vec<PersonBox>,
}

/// Fixed-size window of recent counts. Oldest evicted first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct History {
    counts: VecDeque<u32>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            counts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, count: u32) {
        if self.counts.len() == self.capacity {
            self.counts.pop_front();
        }
        self.counts.push_back(count);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.counts.is_empty() {
            return None;
        }
        let sum: u64 = self.counts.iter().map(|&c| c as u64).sum();
        Some(sum as f64 / self.counts.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn counts(&self) -> impl Iterator<Item = u32> + '_ {
        self.counts.iter().copied()
    }
}

/// Build a snapshot from detections, frame metadata and the history so far.
///
/// Pure: identical inputs always give an identical snapshot.
pub fn build_snapshot(
    settings: &AggregateSettings,
    source_id: &str,
    detections: &[Detection],
    meta: &FrameMeta,
    history: &History,
    processing: Duration,
) -> CrowdSnapshot {
    let people: Vec<&Detection> = detections
        .iter()
        .filter(|d| {
            d.class == ObjectClass::Person && d.confidence >= settings.person_confidence_threshold
        })
        .collect();
    let count = people.len() as u32;

    let boxes = if settings.include_detections {
        people
            .iter()
            .map(|d| PersonBox {
                x: d.bbox.x,
                y: d.bbox.y,
                w: d.bbox.w,
                h: d.bbox.h,
                confidence: d.confidence,
            })
            .collect()
    } else {
        Vec::new()
    };

    CrowdSnapshot {
        source_id: source_id.to_string(),
        seq: meta.seq,
        timestamp: meta.captured_at_ms,
        count,
        density: DensityBucket::classify(
            count,
            settings.density_medium_threshold,
            settings.density_high_threshold,
        ),
        trend: history
            .mean()
            .map(|mean| Trend::classify(count, mean, settings.trend_epsilon)),
        anomaly: count > settings.anomaly_threshold,
        processing_ms: processing.as_millis() as u64,
        detections: boxes,
    }
}

/// Owns the history window. Nothing else mutates it.
pub struct Aggregator {
    settings: AggregateSettings,
    source_id: String,
    history: History,
}

impl Aggregator {
    pub fn new(settings: AggregateSettings, source_id: impl Into<String>) -> Self {
        let history = History::new(settings.trend_window_size);
        Self {
            settings,
            source_id: source_id.into(),
            history,
        }
    }

    pub fn aggregate(
        &mut self,
        detections: &[Detection],
        meta: &FrameMeta,
        processing: Duration,
    ) -> CrowdSnapshot {
        let snapshot = build_snapshot(
            &self.settings,
            &self.source_id,
            detections,
            meta,
            &self.history,
            processing,
        );
        self.history.push(snapshot.count);
        snapshot
    }

    pub fn history(&self) -> &History {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EdgeConfig;
    use crate::detect::BoundingBox;

    fn settings() -> AggregateSettings {
        let mut settings = EdgeConfig::default().aggregate;
        settings.person_confidence_threshold = 0.5;
        settings.density_medium_threshold = 5;
        settings.density_high_threshold = 15;
        settings.trend_window_size = 3;
        settings.trend_epsilon = 0.1;
        settings.anomaly_threshold = 10;
        settings
    }

    fn meta(seq: u64) -> FrameMeta {
        FrameMeta {
            seq,
            captured_at_ms: 1_700_000_000_000 + seq * 100,
            width: 640,
            height: 480,
        }
    }

    fn people(n: usize, confidence: f32) -> Vec<Detection> {
        (0..n)
            .map(|i| {
                Detection::new(
                    ObjectClass::Person,
                    confidence,
                    BoundingBox {
                        x: 0.01 * i as f32,
                        y: 0.1,
                        w: 0.05,
                        h: 0.2,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn counts_only_confident_people() {
        let mut detections = people(4, 0.9);
        detections.extend(people(3, 0.2));
        detections.push(Detection::new(
            ObjectClass::Vehicle,
            0.99,
            BoundingBox {
                x: 0.5,
                y: 0.5,
                w: 0.3,
                h: 0.3,
            },
        ));
        let snapshot = build_snapshot(
            &settings(),
            "cam",
            &detections,
            &meta(0),
            &History::new(3),
            Duration::from_millis(12),
        );
        assert_eq!(snapshot.count, 4);
        assert_eq!(snapshot.detections.len(), 4);
        assert_eq!(snapshot.processing_ms, 12);
        assert_eq!(snapshot.trend, None);
    }

    #[test]
    fn threshold_is_inclusive() {
        let snapshot = build_snapshot(
            &settings(),
            "cam",
            &people(2, 0.5),
            &meta(0),
            &History::new(3),
            Duration::ZERO,
        );
        assert_eq!(snapshot.count, 2);
    }

    #[test]
    fn density_buckets_follow_thresholds() {
        assert_eq!(DensityBucket::classify(0, 5, 15), DensityBucket::Low);
        assert_eq!(DensityBucket::classify(4, 5, 15), DensityBucket::Low);
        assert_eq!(DensityBucket::classify(5, 5, 15), DensityBucket::Medium);
        assert_eq!(DensityBucket::classify(14, 5, 15), DensityBucket::Medium);
        assert_eq!(DensityBucket::classify(15, 5, 15), DensityBucket::High);
    }

    #[test]
    fn trend_uses_relative_dead_band() {
        assert_eq!(Trend::classify(11, 10.0, 0.1), Trend::Stable);
        assert_eq!(Trend::classify(12, 10.0, 0.1), Trend::Rising);
        assert_eq!(Trend::classify(8, 10.0, 0.1), Trend::Falling);
        assert_eq!(Trend::classify(0, 0.0, 0.1), Trend::Stable);
        assert_eq!(Trend::classify(1, 0.0, 0.1), Trend::Rising);
    }

    #[test]
    fn aggregate_is_deterministic() {
        let mut history = History::new(3);
        history.push(3);
        history.push(7);
        let detections = people(6, 0.8);
        let a = build_snapshot(
            &settings(),
            "cam",
            &detections,
            &meta(4),
            &history,
            Duration::from_millis(5),
        );
        let b = build_snapshot(
            &settings(),
            "cam",
            &detections,
            &meta(4),
            &history.clone(),
            Duration::from_millis(5),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn history_never_exceeds_window() {
        let mut aggregator = Aggregator::new(settings(), "cam");
        for (seq, n) in [1usize, 2, 3, 4].into_iter().enumerate() {
            aggregator.aggregate(&people(n, 0.9), &meta(seq as u64), Duration::ZERO);
            assert!(aggregator.history().len() <= 3);
        }
        // After N+1 snapshots the first count (1) has been evicted.
        assert_eq!(aggregator.history().counts().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn trend_reflects_recent_history() {
        let mut aggregator = Aggregator::new(settings(), "cam");
        let first = aggregator.aggregate(&people(4, 0.9), &meta(0), Duration::ZERO);
        let same = aggregator.aggregate(&people(4, 0.9), &meta(1), Duration::ZERO);
        let up = aggregator.aggregate(&people(9, 0.9), &meta(2), Duration::ZERO);
        let down = aggregator.aggregate(&people(1, 0.9), &meta(3), Duration::ZERO);
        assert_eq!(first.trend, None);
        assert_eq!(same.trend, Some(Trend::Stable));
        assert_eq!(up.trend, Some(Trend::Rising));
        assert_eq!(down.trend, Some(Trend::Falling));
    }

    #[test]
    fn anomaly_flags_counts_above_threshold() {
        let mut aggregator = Aggregator::new(settings(), "cam");
        let at = aggregator.aggregate(&people(10, 0.9), &meta(0), Duration::ZERO);
        let above = aggregator.aggregate(&people(11, 0.9), &meta(1), Duration::ZERO);
        assert!(!at.anomaly);
        assert!(above.anomaly);
    }

    #[test]
    fn detections_can_be_left_out() {
        let mut settings = settings();
        settings.include_detections = false;
        let snapshot = build_snapshot(
            &settings,
            "cam",
            &people(3, 0.9),
            &meta(0),
            &History::new(3),
            Duration::ZERO,
        );
        assert_eq!(snapshot.count, 3);
        assert!(snapshot.detections.is_empty());
    }
}
