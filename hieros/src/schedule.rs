// src/schedule.rs
//
// Deterministic step cadences for the training loop.
// - Every: periodic trigger (logging, evaluation)
// - Ratio: train steps owed per environment step
// - Until: gate that is open before a step threshold (exploration)

/// Fires on the first query and then once per `interval` steps.
/// An interval of 0 never fires.
#[derive(Debug, Clone)]
pub struct Every {
    interval: u64,
    next: Option<u64>,
}

impl Every {
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn due(&mut self, step: u64) -> bool {
        if self.interval == 0 {
            return false;
        }
        match self.next {
            None => {
                self.next = Some(step + self.interval);
                true
            }
            Some(next) if step >= next => {
                // Skip over missed periods so a large jump fires once.
                let missed = (step - next) / self.interval;
                self.next = Some(next + (missed + 1) * self.interval);
                true
            }
            Some(_) => false,
        }
    }
}

/// Converts environment steps into training steps at a fixed ratio,
/// carrying the fractional remainder between calls.
#[derive(Debug, Clone)]
pub struct Ratio {
    ratio: f64,
    prev: Option<u64>,
    carry: f64,
}

impl Ratio {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: ratio.max(0.0),
            prev: None,
            carry: 0.0,
        }
    }

    /// Number of training steps owed at env step `step`.
    pub fn owed(&mut self, step: u64) -> usize {
        if self.ratio == 0.0 {
            return 0;
        }
        let Some(prev) = self.prev else {
            self.prev = Some(step);
            return 1;
        };
        let exact = step.saturating_sub(prev) as f64 * self.ratio + self.carry;
        let repeats = exact.floor();
        self.carry = exact - repeats;
        self.prev = Some(step);
        repeats as usize
    }
}

/// Open strictly before `until`. An `until` of 0 is always open.
#[derive(Debug, Clone, Copy)]
pub struct Until {
    until: u64,
}

impl Until {
    pub fn new(until: u64) -> Self {
        Self { until }
    }

    pub fn active(&self, step: u64) -> bool {
        self.until == 0 || step < self.until
    }
}
