//! Instance selection for `service://` targets.

pub mod strategies;

pub use strategies::{
    strategy_for, FirstInstance, RandomInstance, RoundRobin, SelectionStrategy, WeightedRandom,
};
