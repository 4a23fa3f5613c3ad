//! Dataset handle abstraction shared by the remote Zarr store and local NetCDF files
//!
//! The downloader only needs to list variables and pull a time window of one
//! variable; both backends implement [`DatasetSource`] so the pipeline can run
//! against a remote catalog or a local file alike.

use crate::calendar::TimeRange;
use crate::dataset::Dataset;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Arc;

/// Read-only handle to a time-indexed dataset
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Short description used in logs, e.g. the store location
    fn describe(&self) -> String;

    /// Data variables available for selection
    fn variables(&self) -> Vec<String>;

    /// First and last timestamp of the time coordinate
    fn time_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)>;

    /// Load one variable (with its coordinates) restricted to `range`.
    async fn select(&self, variable: &str, range: TimeRange) -> Result<Dataset>;

    fn has_variable(&self, variable: &str) -> bool {
        self.variables().iter().any(|v| v == variable)
    }
}

/// Handle shared across download workers
pub type SharedSource = Arc<dyn DatasetSource>;

/// Indices of `times` falling inside `range`, assuming `times` is sorted.
pub fn time_window(times: &[NaiveDateTime], range: &TimeRange) -> std::ops::Range<usize> {
    let lower = range.lower();
    let upper = range.upper_exclusive();
    let start = times.partition_point(|t| *t < lower);
    let end = times.partition_point(|t| *t < upper);
    start..end.max(start)
}
