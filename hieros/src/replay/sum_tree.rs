// src/replay/sum_tree.rs
//
// Array-backed binary sum tree over non-negative weights.
// O(log n) point update and prefix-sum search; capacity doubles on growth.

#[derive(Debug, Clone)]
pub struct SumTree {
    capacity: usize,
    nodes: Vec<f64>,
    len: usize,
}

impl Default for SumTree {
    fn default() -> Self {
        Self::with_capacity(1)
    }
}

impl SumTree {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            capacity,
            nodes: vec![0.0; 2 * capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.nodes[1]
    }

    pub fn get(&self, i: usize) -> f64 {
        self.nodes[self.capacity + i]
    }

    pub fn push(&mut self, weight: f64) {
        if self.len == self.capacity {
            self.grow();
        }
        let i = self.len;
        self.len += 1;
        self.set(i, weight);
    }

    /// Remove the last leaf and return its weight.
    pub fn pop(&mut self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let i = self.len - 1;
        let w = self.get(i);
        self.set(i, 0.0);
        self.len = i;
        Some(w)
    }

    pub fn set(&mut self, i: usize, weight: f64) {
        debug_assert!(i < self.len, "sum tree index {i} out of range {}", self.len);
        let leaf = self.capacity + i;
        self.nodes[leaf] = weight.max(0.0);
        let mut idx = leaf / 2;
        while idx >= 1 {
            self.nodes[idx] = self.nodes[2 * idx] + self.nodes[2 * idx + 1];
            idx /= 2;
        }
    }

    /// Leaf whose cumulative weight range contains `mass` (`0 <= mass < total`).
    pub fn find(&self, mut mass: f64) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let mut idx = 1;
        while idx < self.capacity {
            let left = 2 * idx;
            if mass < self.nodes[left] {
                idx = left;
            } else {
                mass -= self.nodes[left];
                idx = left + 1;
            }
        }
        Some((idx - self.capacity).min(self.len - 1))
    }

    fn grow(&mut self) {
        let old_capacity = self.capacity;
        let leaves: Vec<f64> = self.nodes[old_capacity..old_capacity + self.len].to_vec();
        self.capacity = old_capacity * 2;
        self.nodes = vec![0.0; 2 * self.capacity];
        self.nodes[self.capacity..self.capacity + leaves.len()].copy_from_slice(&leaves);
        for idx in (1..self.capacity).rev() {
            self.nodes[idx] = self.nodes[2 * idx] + self.nodes[2 * idx + 1];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_tracks_pushes_and_growth() {
        let mut tree = SumTree::default();
        for w in [1.0, 2.0, 3.0, 4.0, 5.0] {
            tree.push(w);
        }
        assert_eq!(tree.len(), 5);
        assert!((tree.total() - 15.0).abs() < 1e-12);
        assert_eq!(tree.get(3), 4.0);
    }

    #[test]
    fn test_find_walks_cumulative_ranges() {
        let mut tree = SumTree::with_capacity(4);
        for w in [1.0, 0.0, 2.0, 1.0] {
            tree.push(w);
        }
        assert_eq!(tree.find(0.5), Some(0));
        assert_eq!(tree.find(1.0), Some(2));
        assert_eq!(tree.find(2.99), Some(2));
        assert_eq!(tree.find(3.5), Some(3));
    }

    #[test]
    fn test_pop_and_set() {
        let mut tree = SumTree::default();
        tree.push(1.0);
        tree.push(2.0);
        tree.push(3.0);
        assert_eq!(tree.pop(), Some(3.0));
        tree.set(0, 5.0);
        assert!((tree.total() - 7.0).abs() < 1e-12);
        assert_eq!(tree.find(6.0), Some(1));
    }

    #[test]
    fn test_empty_tree_has_no_leaf() {
        let tree = SumTree::default();
        assert_eq!(tree.find(0.0), None);
        assert_eq!(tree.total(), 0.0);
    }
}
