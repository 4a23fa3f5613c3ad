//! Resampling reductions over time bins
//!
//! # Organization
//!
//! - [`operations`]: the reduction kinds and the reduction trait
//! - [`parallel`]: rayon implementations of the per-bin reductions

pub mod operations;
pub mod parallel;

pub use operations::{BinnedReduction, StatOperation};
pub use parallel::{parallel_bin_mean, parallel_bin_sum};
