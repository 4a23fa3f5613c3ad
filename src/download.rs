//! Concurrent per-task slice downloads
//!
//! Each task selects one month of one variable from the shared dataset handle
//! and writes it to its own NetCDF file. Tasks run on a bounded pool; a failed
//! or panicking task is reported as that task's outcome and never stops its
//! siblings.

use crate::calendar::month_bounds;
use crate::data_source::SharedSource;
use crate::errors::{FetchError, Result};
use crate::netcdf_io::write_dataset;
use crate::tasks::Task;
use futures::stream::{self, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tracing::{error, info};

/// Result of one task
#[derive(Debug)]
pub struct TaskOutcome {
    pub task: Task,
    pub result: Result<PathBuf>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Download one month of one variable to its output file.
pub async fn download_task(source: SharedSource, task: &Task, output_root: &Path) -> Result<PathBuf> {
    info!(year = task.year, month = task.month, variable = %task.variable, "downloading");

    if !source.has_variable(&task.variable) {
        return Err(FetchError::VariableNotFound {
            var: task.variable.clone(),
            available: source.variables(),
        });
    }

    let range = month_bounds(task.year, task.month)?;
    let selection = source.select(&task.variable, range).await?;
    if selection.is_empty() {
        return Err(FetchError::EmptySelection {
            var: task.variable.clone(),
            start: range.start.to_string(),
            end: range.end.to_string(),
        });
    }
    let selection = selection.subset(&[task.variable.as_str()]);

    fs::create_dir_all(task.month_dir(output_root)).await?;
    let path = task.output_path(output_root);
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_dataset(&selection, &target))
        .await
        .map_err(|e| FetchError::TaskPanicked(format!("writer for {task}: {e}")))??;

    info!(year = task.year, month = task.month, variable = %task.variable, path = %path.display(), "complete");
    Ok(path)
}

/// Bounded pool running download tasks against one shared handle
#[derive(Clone)]
pub struct Downloader {
    source: SharedSource,
    output_root: PathBuf,
    workers: usize,
}

impl Downloader {
    pub fn new(source: SharedSource, output_root: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            source,
            output_root: output_root.into(),
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Outcomes in completion order, at most `workers` tasks in flight.
    pub fn run(&self, tasks: Vec<Task>) -> Pin<Box<dyn Stream<Item = TaskOutcome> + Send + 'static>> {
        let this = self.clone();
        Box::pin(async_stream::stream! {
            let pending = stream::iter(tasks)
                .map(|task| {
                    let source = this.source.clone();
                    let root = this.output_root.clone();
                    let handle = tokio::spawn({
                        let task = task.clone();
                        async move { download_task(source, &task, &root).await }
                    });
                    async move {
                        let result = match handle.await {
                            Ok(result) => result,
                            Err(join_error) => Err(FetchError::TaskPanicked(join_error.to_string())),
                        };
                        TaskOutcome { task, result }
                    }
                })
                .buffer_unordered(this.workers);
            futures::pin_mut!(pending);

            while let Some(outcome) = pending.next().await {
                if let Err(e) = &outcome.result {
                    error!(
                        year = outcome.task.year,
                        month = outcome.task.month,
                        variable = %outcome.task.variable,
                        error = %e,
                        "ERROR: {} failed", outcome.task
                    );
                }
                yield outcome;
            }
        })
    }

    /// Run every task to completion and collect the outcomes.
    pub async fn run_all(&self, tasks: Vec<Task>) -> DownloadSummary {
        let mut summary = DownloadSummary::default();
        let mut outcomes = self.run(tasks);
        while let Some(outcome) = outcomes.next().await {
            summary.record(outcome);
        }
        summary
    }
}

/// Succeeded and failed tasks of a run
#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub succeeded: Vec<(Task, PathBuf)>,
    pub failed: Vec<(Task, FetchError)>,
}

impl DownloadSummary {
    pub fn record(&mut self, outcome: TaskOutcome) {
        match outcome.result {
            Ok(path) => self.succeeded.push((outcome.task, path)),
            Err(e) => self.failed.push((outcome.task, e)),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn print_summary(&self) {
        println!(
            "Downloaded {}/{} files ({} failed)",
            self.succeeded.len(),
            self.total(),
            self.failed.len()
        );
        for (task, e) in &self.failed {
            println!("   {task}: {e}");
        }
    }
}
