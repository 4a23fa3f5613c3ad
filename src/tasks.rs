//! Download task enumeration

use std::fmt;
use std::path::{Path, PathBuf};

/// One (year, month, variable) unit of download work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    pub year: i32,
    pub month: u32,
    pub variable: String,
}

impl Task {
    pub fn new(year: i32, month: u32, variable: impl Into<String>) -> Self {
        Self {
            year,
            month,
            variable: variable.into(),
        }
    }

    /// `{root}/{year}/{month:02}`
    pub fn month_dir(&self, root: &Path) -> PathBuf {
        month_dir(root, self.year, self.month)
    }

    /// `{root}/{year}/{month:02}/{variable}.nc`
    pub fn output_path(&self, root: &Path) -> PathBuf {
        self.month_dir(root).join(format!("{}.nc", self.variable))
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}-{:02}", self.variable, self.year, self.month)
    }
}

pub fn month_dir(root: &Path, year: i32, month: u32) -> PathBuf {
    root.join(year.to_string()).join(format!("{month:02}"))
}

/// Every (year, month, variable) combination: year-major, then month, then variable.
pub fn enumerate_tasks(years: &[i32], variables: &[String]) -> Vec<Task> {
    years
        .iter()
        .flat_map(|&year| {
            (1..=12u32).flat_map(move |month| {
                variables
                    .iter()
                    .map(move |variable| Task::new(year, month, variable.clone()))
            })
        })
        .collect()
}
