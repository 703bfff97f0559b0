//! # Metrics
//!
//! The pod's counter and gauge set, exposed in line-oriented text format at
//! `GET /metrics`. The set is closed, so this is a fixed registry of atomics
//! rather than a dynamic one; per-room and per-label series use concurrent
//! maps.

use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can move both ways.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    /// Set to an absolute value.
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by one.
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A counter family keyed by one label value.
#[derive(Debug, Default)]
pub struct LabelledCounter {
    values: DashMap<String, u64>,
}

impl LabelledCounter {
    /// Increment the series for `label` by one.
    pub fn inc(&self, label: &str) {
        self.add(label, 1);
    }

    /// Increment the series for `label` by `n`.
    pub fn add(&self, label: &str, n: u64) {
        *self.values.entry(label.to_string()).or_insert(0) += n;
    }

    /// Current value for `label`.
    pub fn get(&self, label: &str) -> u64 {
        self.values.get(label).map(|v| *v).unwrap_or(0)
    }

    fn render(&self, out: &mut String, name: &str, label_name: &str) {
        let mut series: Vec<(String, u64)> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        series.sort();
        for (label, value) in series {
            let _ = writeln!(out, "{name}{{{label_name}=\"{label}\"}} {value}");
        }
    }
}

/// A gauge family keyed by one label value.
#[derive(Debug, Default)]
pub struct LabelledGauge {
    values: DashMap<String, i64>,
}

impl LabelledGauge {
    /// Set the series for `label`.
    pub fn set(&self, label: &str, value: i64) {
        self.values.insert(label.to_string(), value);
    }

    /// Add to the series for `label`.
    pub fn add(&self, label: &str, delta: i64) {
        *self.values.entry(label.to_string()).or_insert(0) += delta;
    }

    /// Drop the series for `label` (room destroyed).
    pub fn remove(&self, label: &str) {
        self.values.remove(label);
    }

    /// Current value for `label`.
    pub fn get(&self, label: &str) -> i64 {
        self.values.get(label).map(|v| *v).unwrap_or(0)
    }

    /// Maximum across all series, or zero when empty.
    pub fn max(&self) -> i64 {
        self.values.iter().map(|e| *e.value()).max().unwrap_or(0)
    }

    fn render(&self, out: &mut String, name: &str, label_name: &str) {
        let mut series: Vec<(String, i64)> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        series.sort();
        for (label, value) in series {
            let _ = writeln!(out, "{name}{{{label_name}=\"{label}\"}} {value}");
        }
    }
}

/// The pod's full metric set.
#[derive(Debug, Default)]
pub struct PodMetrics {
    /// Live rooms on this pod.
    pub active_rooms: Gauge,
    /// Live sessions per room.
    pub active_sessions: LabelledGauge,
    /// Frames received, by frame type.
    pub frames_in: LabelledCounter,
    /// Frames written out, by frame type.
    pub frames_out: LabelledCounter,
    /// Peer presence entries rejected as stale.
    pub presence_diffs_dedup_dropped: Counter,
    /// CRDT updates applied to in-memory documents.
    pub storage_ops_applied: Counter,
    /// CRDT updates durably appended to the op store.
    pub storage_ops_persisted: Counter,
    /// Consumer lag behind the stream head, per room.
    pub stream_lag_entries: LabelledGauge,
    /// Egress frames dropped, by reason.
    pub egress_drops: LabelledCounter,
    /// Session closes, by reason.
    pub session_closes: LabelledCounter,
    /// Malformed frames received.
    pub malformed_frames: Counter,
    /// Ingress frames dropped by rate limiting.
    pub rate_limited_frames: Counter,
    /// Full resyncs forced by stream gaps.
    pub stream_full_syncs: Counter,
}

impl PodMetrics {
    /// Fresh zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the full set in Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        let gauge = |out: &mut String, name: &str, help: &str, value: i64| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        };
        let counter_head = |out: &mut String, name: &str, help: &str| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
        };

        gauge(
            &mut out,
            "active_rooms",
            "Rooms currently live on this pod",
            self.active_rooms.get(),
        );

        let _ = writeln!(out, "# HELP active_sessions Live sessions per room");
        let _ = writeln!(out, "# TYPE active_sessions gauge");
        self.active_sessions.render(&mut out, "active_sessions", "room");

        counter_head(&mut out, "frames_in", "Frames received by type");
        self.frames_in.render(&mut out, "frames_in", "type");

        counter_head(&mut out, "frames_out", "Frames sent by type");
        self.frames_out.render(&mut out, "frames_out", "type");

        counter_head(
            &mut out,
            "presence_diffs_dedup_dropped",
            "Stale peer presence entries rejected",
        );
        let _ = writeln!(
            out,
            "presence_diffs_dedup_dropped {}",
            self.presence_diffs_dedup_dropped.get()
        );

        counter_head(&mut out, "storage_ops_applied", "CRDT updates applied");
        let _ = writeln!(out, "storage_ops_applied {}", self.storage_ops_applied.get());

        counter_head(
            &mut out,
            "storage_ops_persisted",
            "CRDT updates durably appended",
        );
        let _ = writeln!(
            out,
            "storage_ops_persisted {}",
            self.storage_ops_persisted.get()
        );

        let _ = writeln!(
            out,
            "# HELP stream_lag_entries Consumer lag behind the stream head"
        );
        let _ = writeln!(out, "# TYPE stream_lag_entries gauge");
        self.stream_lag_entries
            .render(&mut out, "stream_lag_entries", "room");

        counter_head(&mut out, "egress_drops", "Egress frames dropped by reason");
        self.egress_drops.render(&mut out, "egress_drops", "reason");

        counter_head(&mut out, "session_closes", "Session closes by reason");
        self.session_closes.render(&mut out, "session_closes", "reason");

        counter_head(&mut out, "malformed_frames", "Undecodable frames received");
        let _ = writeln!(out, "malformed_frames {}", self.malformed_frames.get());

        counter_head(
            &mut out,
            "rate_limited_frames",
            "Ingress frames dropped by rate limiting",
        );
        let _ = writeln!(out, "rate_limited_frames {}", self.rate_limited_frames.get());

        counter_head(
            &mut out,
            "stream_full_syncs",
            "Full resyncs forced by stream gaps",
        );
        let _ = writeln!(out, "stream_full_syncs {}", self.stream_full_syncs.get());

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let metrics = PodMetrics::new();
        metrics.storage_ops_applied.inc();
        metrics.storage_ops_applied.add(2);
        assert_eq!(metrics.storage_ops_applied.get(), 3);

        metrics.active_rooms.inc();
        metrics.active_rooms.inc();
        metrics.active_rooms.dec();
        assert_eq!(metrics.active_rooms.get(), 1);
    }

    #[test]
    fn test_labelled_series() {
        let metrics = PodMetrics::new();
        metrics.frames_in.inc("presence_diff");
        metrics.frames_in.inc("presence_diff");
        metrics.frames_in.inc("storage_update");
        assert_eq!(metrics.frames_in.get("presence_diff"), 2);
        assert_eq!(metrics.frames_in.get("storage_update"), 1);
        assert_eq!(metrics.frames_in.get("control"), 0);

        metrics.stream_lag_entries.set("room-a", 7);
        metrics.stream_lag_entries.set("room-b", 3);
        assert_eq!(metrics.stream_lag_entries.max(), 7);
        metrics.stream_lag_entries.remove("room-a");
        assert_eq!(metrics.stream_lag_entries.max(), 3);
    }

    #[test]
    fn test_render_contains_series() {
        let metrics = PodMetrics::new();
        metrics.active_rooms.set(2);
        metrics.frames_in.inc("storage_update");
        metrics.egress_drops.add("presence_coalesce", 999);
        metrics.active_sessions.add("room-a", 2);

        let text = metrics.render();
        assert!(text.contains("active_rooms 2"));
        assert!(text.contains("frames_in{type=\"storage_update\"} 1"));
        assert!(text.contains("egress_drops{reason=\"presence_coalesce\"} 999"));
        assert!(text.contains("active_sessions{room=\"room-a\"} 2"));
        assert!(text.contains("# TYPE frames_in counter"));
    }
}
