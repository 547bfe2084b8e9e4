// src/metrics.rs
//
// Per-run metric accumulators.
// - OnlineStats: running mean + min/max over finite samples
// - MetricsContext: named accumulators, flushed to a sink once per logged step
//
// A context is owned by the run and passed explicitly; `flush` writes one
// record and resets every accumulator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::logging::MetricsSink;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    min: f64,
    max: f64,
}

impl Default for OnlineStats {
    fn default() -> Self {
        Self {
            n: 0,
            mean: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl OnlineStats {
    /// Adds a sample if finite. Non-finite samples are ignored.
    pub fn add(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        self.n += 1;
        self.min = self.min.min(x);
        self.max = self.max.max(x);
        self.mean += (x - self.mean) / (self.n as f64);
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.mean
        }
    }

    pub fn min(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.max
        }
    }
}

/// How an accumulator is reduced at flush time.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Accumulator {
    Mean(OnlineStats),
    Max(OnlineStats),
    Sum(f64),
    Last(f64),
}

impl Accumulator {
    fn value(&self) -> f64 {
        match self {
            Accumulator::Mean(s) => s.mean(),
            Accumulator::Max(s) => s.max(),
            Accumulator::Sum(v) | Accumulator::Last(v) => *v,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Accumulator::Mean(_) => "mean",
            Accumulator::Max(_) => "max",
            Accumulator::Sum(_) => "sum",
            Accumulator::Last(_) => "last",
        }
    }
}

/// One logged step. Keys are sorted so serialised field order is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub step: u64,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

impl MetricsRecord {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsContext {
    accumulators: BTreeMap<String, Accumulator>,
}

impl MetricsContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    /// Accumulator for `name`, created from `fresh` on first use.
    ///
    /// A name keeps the reduction it was first recorded with. Recording it
    /// with another one is a bug: it fails debug builds and is dropped with
    /// a warning otherwise.
    fn accumulator(&mut self, name: &str, fresh: Accumulator) -> Option<&mut Accumulator> {
        let entry = self
            .accumulators
            .entry(name.to_string())
            .or_insert(fresh);
        let (have, want) = (entry.kind(), fresh.kind());
        debug_assert_eq!(have, want, "metric {name} reduced as {have}, recorded as {want}");
        if have != want {
            tracing::warn!(metric = name, have, want, "metric reduction mismatch, sample dropped");
            return None;
        }
        Some(entry)
    }

    /// Sample reduced by its mean at flush time.
    pub fn add(&mut self, name: &str, value: f64) {
        if let Some(Accumulator::Mean(s)) =
            self.accumulator(name, Accumulator::Mean(OnlineStats::default()))
        {
            s.add(value);
        }
    }

    /// Sample reduced by its maximum at flush time.
    pub fn max(&mut self, name: &str, value: f64) {
        if let Some(Accumulator::Max(s)) =
            self.accumulator(name, Accumulator::Max(OnlineStats::default()))
        {
            s.add(value);
        }
    }

    /// Counter summed until flush.
    pub fn sum(&mut self, name: &str, value: f64) {
        if let Some(Accumulator::Sum(v)) = self.accumulator(name, Accumulator::Sum(0.0)) {
            *v += value;
        }
    }

    /// Gauge: the last value wins.
    pub fn scalar(&mut self, name: &str, value: f64) {
        if let Some(a) = self.accumulator(name, Accumulator::Last(value)) {
            *a = Accumulator::Last(value);
        }
    }

    /// Add every counter of `other` whose name ends with `suffix` into this
    /// context.
    pub fn absorb_counters(&mut self, other: &MetricsContext, suffix: &str) {
        for (name, acc) in &other.accumulators {
            if let Accumulator::Sum(v) = acc {
                if name.ends_with(suffix) {
                    self.sum(name, *v);
                }
            }
        }
    }

    /// Current reduced value of `name`, without resetting.
    pub fn peek(&self, name: &str) -> Option<f64> {
        self.accumulators.get(name).map(Accumulator::value)
    }

    /// Reduce every accumulator into a record tagged with `step`.
    pub fn snapshot(&self, step: u64) -> MetricsRecord {
        MetricsRecord {
            step,
            values: self
                .accumulators
                .iter()
                .map(|(k, a)| (k.clone(), a.value()))
                .collect(),
        }
    }

    pub fn reset(&mut self) {
        self.accumulators.clear();
    }

    /// Write one record for `step` and reset. Nothing is written when no
    /// metric was recorded since the last flush.
    pub fn flush(&mut self, step: u64, sink: &mut dyn MetricsSink) -> Result<Option<MetricsRecord>> {
        if self.accumulators.is_empty() {
            return Ok(None);
        }
        let record = self.snapshot(step);
        sink.write(&record)?;
        self.reset();
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;

    #[test]
    fn test_online_stats_ignores_non_finite() {
        let mut s = OnlineStats::default();
        s.add(1.0);
        s.add(f64::NAN);
        s.add(3.0);
        assert_eq!(s.n(), 2);
        assert!((s.mean() - 2.0).abs() < 1e-12);
        assert_eq!(s.min(), 1.0);
        assert_eq!(s.max(), 3.0);
    }

    #[test]
    fn test_reductions() {
        let mut m = MetricsContext::new();
        m.add("a", 1.0);
        m.add("a", 2.0);
        m.max("b", 5.0);
        m.max("b", -1.0);
        m.sum("c", 2.0);
        m.sum("c", 3.0);
        m.scalar("d", 1.0);
        m.scalar("d", 7.0);
        let r = m.snapshot(4);
        assert_eq!(r.get("a"), Some(1.5));
        assert_eq!(r.get("b"), Some(5.0));
        assert_eq!(r.get("c"), Some(5.0));
        assert_eq!(r.get("d"), Some(7.0));
    }

    #[test]
    fn test_flush_writes_and_resets() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();
        let mut m = MetricsContext::new();
        m.add("subactor-0/reward", 0.25);
        let r = m.flush(30, &mut handle).unwrap().unwrap();
        assert_eq!(r.step, 30);
        assert!(m.is_empty());
        assert!(m.flush(31, &mut handle).unwrap().is_none());
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_record_field_order_is_stable() {
        let mut m = MetricsContext::new();
        m.scalar("zeta", 1.0);
        m.scalar("alpha", 2.0);
        let json = serde_json::to_string(&m.snapshot(1)).unwrap();
        assert_eq!(json, r#"{"step":1,"alpha":2.0,"zeta":1.0}"#);
    }

    #[test]
    fn test_absorb_counters_keeps_matching_sums() {
        let mut scratch = MetricsContext::new();
        scratch.sum("subactor-1/shape_mismatch", 1.0);
        scratch.sum("subactor-1/subgoal_updates", 4.0);
        scratch.add("subactor-0/policy_subgoal_reward", 0.5);
        let mut m = MetricsContext::new();
        m.sum("subactor-1/shape_mismatch", 2.0);
        m.absorb_counters(&scratch, "/shape_mismatch");
        assert_eq!(m.peek("subactor-1/shape_mismatch"), Some(3.0));
        assert_eq!(m.len(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "metric a reduced as mean, recorded as sum")]
    fn test_reduction_mismatch_fails_debug_builds() {
        let mut m = MetricsContext::new();
        m.add("a", 1.0);
        m.sum("a", 1.0);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_reduction_mismatch_keeps_first_kind() {
        let mut m = MetricsContext::new();
        m.add("a", 1.0);
        m.sum("a", 5.0);
        m.scalar("a", 9.0);
        assert_eq!(m.peek("a"), Some(1.0));
    }
}
