// src/subgoal/debug.rs
//
// Shape report for the subgoal -> reward path of one subactor.
//
// Built only when `debug` is on. Records every tensor shape along the path
// and the problems it can already see, then goes to `tracing::debug!` and
// into the dump attached to a ShapeMismatchError.

use std::fmt::Write as _;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubgoalShapeReport {
    pub subactor: usize,
    pub cached_subgoal: Option<Vec<usize>>,
    pub state_deter: Option<Vec<usize>>,
    pub state_stoch: Option<Vec<usize>>,
    pub decoded_subgoal: Option<Vec<usize>>,
    pub subgoal_with_time: Option<Vec<usize>>,
    pub state_with_time: Option<Vec<usize>>,
    pub errors: Vec<String>,
}

impl SubgoalShapeReport {
    pub fn new(subactor: usize) -> Self {
        Self {
            subactor,
            ..Self::default()
        }
    }

    pub fn cached_subgoal(mut self, shape: &[usize]) -> Self {
        self.cached_subgoal = Some(shape.to_vec());
        self
    }

    pub fn state(mut self, deter: &[usize], stoch: &[usize]) -> Self {
        self.state_deter = Some(deter.to_vec());
        self.state_stoch = Some(stoch.to_vec());
        self
    }

    pub fn decoded_subgoal(mut self, shape: &[usize]) -> Self {
        self.decoded_subgoal = Some(shape.to_vec());
        self
    }

    pub fn aligned(mut self, subgoal_with_time: &[usize], state_with_time: &[usize]) -> Self {
        self.subgoal_with_time = Some(subgoal_with_time.to_vec());
        self.state_with_time = Some(state_with_time.to_vec());
        self
    }

    /// Run every check on the recorded shapes and fill `errors`.
    pub fn check(mut self) -> Self {
        self.errors.clear();
        let state_batch = self
            .state_deter
            .as_ref()
            .and_then(|s| s.first().copied());

        let named = [
            ("cached_subgoal", &self.cached_subgoal),
            ("state_stoch", &self.state_stoch),
            ("decoded_subgoal", &self.decoded_subgoal),
            ("subgoal_with_time", &self.subgoal_with_time),
            ("state_with_time", &self.state_with_time),
        ];
        let mut errors = Vec::new();
        if let Some(batch) = state_batch {
            for (name, shape) in named {
                if let Some(b) = shape.as_ref().and_then(|s| s.first()) {
                    if *b != batch {
                        errors.push(format!(
                            "batch mismatch: {name} has batch {b}, state_deter has {batch}"
                        ));
                    }
                }
            }
        }

        for (name, shape) in [
            ("subgoal_with_time", &self.subgoal_with_time),
            ("state_with_time", &self.state_with_time),
        ] {
            if let Some(s) = shape {
                if s.len() != 3 {
                    errors.push(format!("{name} should have rank 3, got {}", s.len()));
                }
            }
        }

        if let Some(s) = &self.decoded_subgoal {
            if s.len() != 2 {
                errors.push(format!("decoded_subgoal should have rank 2, got {}", s.len()));
            }
        }

        if let (Some(g), Some(s)) = (&self.subgoal_with_time, &self.state_with_time) {
            if g.len() == 3 && s.len() == 3 {
                if g[1] != 1 && g[1] != s[1] {
                    errors.push(format!(
                        "time axis {} of subgoal cannot align with state time axis {}",
                        g[1], s[1]
                    ));
                }
                if g[2] > s[2] {
                    errors.push(format!(
                        "subgoal features {} exceed state features {}",
                        g[2], s[2]
                    ));
                }
            }
        }
        self.errors = errors;
        self
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Multi-line rendering used for the error dump.
    pub fn render(&self) -> String {
        let mut out = format!("subactor-{} shape report:", self.subactor);
        let rows = [
            ("cached_subgoal", &self.cached_subgoal),
            ("state.deter", &self.state_deter),
            ("state.stoch", &self.state_stoch),
            ("decoded_subgoal", &self.decoded_subgoal),
            ("subgoal_with_time", &self.subgoal_with_time),
            ("state_with_time", &self.state_with_time),
        ];
        for (name, shape) in rows {
            if let Some(s) = shape {
                let _ = write!(out, "\n  {name}: {s:?}");
            }
        }
        for e in &self.errors {
            let _ = write!(out, "\n  error: {e}");
        }
        out
    }

    pub fn emit(&self) {
        tracing::debug!(
            subactor = self.subactor,
            errors = self.errors.len(),
            "{}",
            self.render()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistent_shapes_have_no_errors() {
        let r = SubgoalShapeReport::new(0)
            .cached_subgoal(&[8, 8, 8])
            .state(&[8, 256], &[8, 1024])
            .decoded_subgoal(&[8, 1280])
            .aligned(&[8, 1, 1280], &[8, 1, 1280])
            .check();
        assert!(!r.has_errors(), "{:?}", r.errors);
    }

    #[test]
    fn test_batch_mismatch_detected() {
        let r = SubgoalShapeReport::new(0)
            .cached_subgoal(&[16, 8, 8])
            .state(&[8, 256], &[8, 1024])
            .decoded_subgoal(&[16, 1280])
            .aligned(&[16, 1, 1280], &[8, 1, 1280])
            .check();
        assert_eq!(r.errors.len(), 3);
        assert!(r.errors[0].contains("cached_subgoal"));
        let text = r.render();
        assert!(text.contains("cached_subgoal: [16, 8, 8]"));
        assert!(text.contains("error: batch mismatch"));
    }

    #[test]
    fn test_oversize_detected() {
        let r = SubgoalShapeReport::new(1)
            .aligned(&[4, 1, 1280], &[4, 1, 384])
            .check();
        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].contains("exceed"));
    }
}
