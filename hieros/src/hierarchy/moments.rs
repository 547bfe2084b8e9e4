// src/hierarchy/moments.rs
//
// Return-normalisation moments per subactor: EMA of the 5th and 95th
// reward percentiles. Updates are computed as values and committed by the
// caller, so a failed training step leaves every layer untouched.

use serde::{Deserialize, Serialize};

pub const MOMENTS_DECAY: f64 = 0.99;
pub const LOW_PERCENTILE: f64 = 0.05;
pub const HIGH_PERCENTILE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardMoments {
    pub low: f64,
    pub high: f64,
    pub decay: f64,
    pub updates: u64,
}

impl Default for RewardMoments {
    fn default() -> Self {
        Self {
            low: 0.0,
            high: 0.0,
            decay: MOMENTS_DECAY,
            updates: 0,
        }
    }
}

impl RewardMoments {
    /// Normaliser: `max(1, high - low)`.
    pub fn scale(&self) -> f64 {
        (self.high - self.low).max(1.0)
    }

    /// Moments after observing `values`. Non-finite values are dropped; an
    /// empty (or all non-finite) input returns `self` unchanged.
    pub fn staged(&self, values: impl IntoIterator<Item = f32>) -> RewardMoments {
        let mut v: Vec<f64> = values
            .into_iter()
            .map(f64::from)
            .filter(|x| x.is_finite())
            .collect();
        if v.is_empty() {
            return *self;
        }
        v.sort_by(|a, b| a.total_cmp(b));
        let low = percentile(&v, LOW_PERCENTILE);
        let high = percentile(&v, HIGH_PERCENTILE);
        RewardMoments {
            low: self.decay * self.low + (1.0 - self.decay) * low,
            high: self.decay * self.high + (1.0 - self.decay) * high,
            decay: self.decay,
            updates: self.updates + 1,
        }
    }
}

/// Linear-interpolated percentile of sorted, non-empty data.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let v: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        assert!((percentile(&v, 0.05) - 5.0).abs() < 1e-9);
        assert!((percentile(&v, 0.95) - 95.0).abs() < 1e-9);
        assert_eq!(percentile(&[3.0], 0.5), 3.0);
    }

    #[test]
    fn test_staged_does_not_mutate() {
        let m = RewardMoments::default();
        let next = m.staged((0..=100).map(|i| i as f32));
        assert_eq!(m.updates, 0);
        assert_eq!(next.updates, 1);
        assert!((next.low - 0.05).abs() < 1e-9);
        assert!((next.high - 0.95).abs() < 1e-9);
        assert_eq!(next.scale(), 1.0);
    }

    #[test]
    fn test_empty_and_non_finite_are_ignored() {
        let m = RewardMoments::default();
        assert_eq!(m.staged(Vec::<f32>::new()), m);
        assert_eq!(m.staged(vec![f32::NAN, f32::INFINITY]), m);
    }

    #[test]
    fn test_scale_grows_with_spread() {
        let mut m = RewardMoments::default();
        for _ in 0..1000 {
            m = m.staged((0..=100).map(|i| i as f32 * 10.0));
        }
        // EMA converges toward 50 / 950.
        assert!(m.scale() > 800.0);
    }
}
