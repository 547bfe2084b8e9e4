// src/replay/mod.rs
//
// Episodic replay: trajectory storage, key selection and batching.

pub mod batcher;
pub mod selectors;
pub mod store;
pub mod sum_tree;
pub mod trajectory;

pub use batcher::{Batch, Batcher};
pub use selectors::{
    build_selector, EfficientTimeBalanced, KeyTable, Selector, SelectorKind, TimeBalanced,
    TimeBalancedNaive, TrajectoryKey, Uniform,
};
pub use store::{ReplayStats, ReplayStore, ReplayStoreConfig, TrajectoryWindow};
pub use trajectory::{
    load_trajectories, Trajectory, TrajectoryBuilder, TrajectoryMetadata, TrajectoryStep,
    TrajectoryWriter,
};
