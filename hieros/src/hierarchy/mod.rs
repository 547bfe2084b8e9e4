// src/hierarchy/mod.rs
//
// Stacked subactors and their per-layer configuration.

pub mod controller;
pub mod moments;
pub mod per_layer;
pub mod policy;
pub mod subactor;

pub use controller::{horizon, HierarchyController, SubgoalCache};
pub use moments::RewardMoments;
pub use per_layer::PerLayer;
pub use policy::{ActionPolicy, EpsilonSubgoalPolicy, SoftmaxActionPolicy, SubgoalPolicy};
pub use subactor::{LayerPolicy, LayerSettings, Subactor};
