mod common;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime, Timelike};
use common::{hourly_times, write_hourly_source};
use ndarray::{ArrayD, IxDyn};
use reanalysis_fetch::aggregate::{combine_monthly, yearly_output_path};
use reanalysis_fetch::calendar::TimeRange;
use reanalysis_fetch::data_source::{DatasetSource, SharedSource};
use reanalysis_fetch::dataset::{Dataset, Variable};
use reanalysis_fetch::download::Downloader;
use reanalysis_fetch::errors::{FetchError, Result};
use reanalysis_fetch::netcdf_io::{read_dataset, write_dataset, NetcdfSource};
use reanalysis_fetch::tasks::{enumerate_tasks, Task};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn names(vars: &[&str]) -> Vec<String> {
    vars.iter().map(|v| v.to_string()).collect()
}

/// In-memory source with optional failure injection
struct FakeSource {
    data: Dataset,
    fail: Option<(u32, String)>,
    panic_on: Option<(u32, String)>,
}

impl FakeSource {
    fn new(year: i32, variables: &[&str]) -> Self {
        let times = hourly_times(year);
        let mut data = Dataset::new("time", times.clone());
        for name in variables {
            let var = Variable::new(
                vec!["time".to_string(), "cell".to_string()],
                ArrayD::from_shape_fn(IxDyn(&[times.len(), 1]), |idx| idx[0] as f32),
            )
            .expect("valid variable");
            data.insert_data_var(name, var).expect("insert");
        }
        Self {
            data,
            fail: None,
            panic_on: None,
        }
    }
}

#[async_trait]
impl DatasetSource for FakeSource {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn variables(&self) -> Vec<String> {
        self.data.variable_names()
    }

    fn time_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        Some((*self.data.times.first()?, *self.data.times.last()?))
    }

    async fn select(&self, variable: &str, range: TimeRange) -> Result<Dataset> {
        let month = range.start.month();
        if self.fail.as_ref() == Some(&(month, variable.to_string())) {
            return Err(FetchError::Generic("injected failure".to_string()));
        }
        if self.panic_on.as_ref() == Some(&(month, variable.to_string())) {
            panic!("injected panic");
        }
        Ok(self.data.subset(&[variable]).select_time(&range))
    }
}

#[tokio::test]
async fn end_to_end_one_year_two_variables() {
    let dir = tempdir().expect("Failed to create temp dir");
    let source_path = dir.path().join("hourly.nc");
    write_hourly_source(&source_path, 1988, &["T2", "Q2"]);
    let out = dir.path().join("conus404_data");

    let source: SharedSource = Arc::new(NetcdfSource::open(&source_path).expect("open source"));
    let variables = names(&["T2", "Q2"]);
    let tasks = enumerate_tasks(&[1988], &variables);
    assert_eq!(tasks.len(), 24);

    let summary = Downloader::new(source, &out, 4).run_all(tasks.clone()).await;
    assert!(summary.all_succeeded(), "failures: {:?}", summary.failed);
    assert_eq!(summary.succeeded.len(), 24);
    for task in &tasks {
        assert!(task.output_path(&out).exists(), "missing {task}");
    }

    let feb = read_dataset(&Task::new(1988, 2, "T2").output_path(&out)).expect("read february");
    assert_eq!(feb.len(), 29 * 24);
    assert!(feb.coords.contains_key("lat"));

    let yearly = combine_monthly(1988, &variables, &out)
        .expect("combine")
        .expect("yearly file written");
    assert_eq!(yearly, yearly_output_path(&out, 1988));

    let ds = read_dataset(&yearly).expect("read yearly");
    assert_eq!(ds.variable_names(), vec!["Q2".to_string(), "T2".to_string()]);
    assert_eq!(ds.times, hourly_times(1988));
    let months: Vec<u32> = ds.times.iter().map(|t| t.month()).collect();
    assert!(months.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(months.first(), Some(&1));
    assert_eq!(months.last(), Some(&12));

    let t2 = ds.data_var("T2").expect("T2");
    let q2 = ds.data_var("Q2").expect("Q2");
    assert_eq!(t2.data[[100, 1, 1]], 100.0);
    assert_eq!(q2.data[[100, 0, 0]], 100.0 + 10000.0 * 1.0);
}

#[tokio::test]
async fn downloads_are_idempotent() {
    let dir = tempdir().expect("Failed to create temp dir");
    let out = dir.path().join("out");
    let source: SharedSource = Arc::new(FakeSource::new(1988, &["T2"]));
    let tasks = enumerate_tasks(&[1988], &names(&["T2"]));
    let downloader = Downloader::new(source, &out, 3);

    let first = downloader.run_all(tasks.clone()).await;
    assert!(first.all_succeeded());
    let path = Task::new(1988, 6, "T2").output_path(&out);
    let before = read_dataset(&path).expect("read first run");

    let second = downloader.run_all(tasks).await;
    assert!(second.all_succeeded());
    let after = read_dataset(&path).expect("read second run");

    assert_eq!(before.times, after.times);
    assert_eq!(before.data_var("T2").map(|v| &v.data), after.data_var("T2").map(|v| &v.data));
    let files = std::fs::read_dir(path.parent().expect("month dir"))
        .expect("list month dir")
        .count();
    assert_eq!(files, 1);
}

#[tokio::test]
async fn one_failing_task_does_not_stop_the_others() {
    let dir = tempdir().expect("Failed to create temp dir");
    let mut fake = FakeSource::new(1988, &["T2", "Q2"]);
    fake.fail = Some((5, "Q2".to_string()));
    fake.panic_on = Some((9, "T2".to_string()));
    let source: SharedSource = Arc::new(fake);

    let tasks = enumerate_tasks(&[1988], &names(&["T2", "Q2"]));
    let summary = Downloader::new(source, dir.path(), 4).run_all(tasks).await;

    assert_eq!(summary.total(), 24);
    assert_eq!(summary.succeeded.len(), 22);
    let mut failed: Vec<&Task> = summary.failed.iter().map(|(t, _)| t).collect();
    failed.sort_by_key(|t| t.month);
    assert_eq!(failed, vec![&Task::new(1988, 5, "Q2"), &Task::new(1988, 9, "T2")]);
    assert!(summary
        .failed
        .iter()
        .any(|(_, e)| matches!(e, FetchError::TaskPanicked(_))));

    assert!(!Task::new(1988, 5, "Q2").output_path(dir.path()).exists());
    assert!(Task::new(1988, 5, "T2").output_path(dir.path()).exists());
}

#[tokio::test]
async fn unknown_variables_fail_per_task() {
    let dir = tempdir().expect("Failed to create temp dir");
    let source: SharedSource = Arc::new(FakeSource::new(1988, &["T2"]));
    let tasks = enumerate_tasks(&[1988], &names(&["T2", "PSFC"]));
    let summary = Downloader::new(source, dir.path(), 2).run_all(tasks).await;
    assert_eq!(summary.succeeded.len(), 12);
    assert_eq!(summary.failed.len(), 12);
    assert!(summary
        .failed
        .iter()
        .all(|(t, e)| t.variable == "PSFC" && matches!(e, FetchError::VariableNotFound { .. })));
}

#[tokio::test]
async fn months_outside_the_source_are_empty_selections() {
    let dir = tempdir().expect("Failed to create temp dir");
    let source: SharedSource = Arc::new(FakeSource::new(1988, &["T2"]));
    let summary = Downloader::new(source, dir.path(), 2)
        .run_all(vec![Task::new(1990, 1, "T2")])
        .await;
    assert!(matches!(summary.failed[0].1, FetchError::EmptySelection { .. }));
}

fn write_month(root: &Path, year: i32, month: u32, variable: &str, value: f32) {
    let times: Vec<NaiveDateTime> = hourly_times(year)
        .into_iter()
        .filter(|t| t.month() == month && t.hour() % 6 == 0)
        .collect();
    let mut ds = Dataset::new("time", times.clone());
    let var = Variable::new(
        vec!["time".to_string(), "cell".to_string()],
        ArrayD::from_elem(IxDyn(&[times.len(), 1]), value),
    )
    .expect("valid variable");
    ds.insert_data_var(variable, var).expect("insert");
    let path = Task::new(year, month, variable).output_path(root);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("create month dir");
    write_dataset(&ds, &path).expect("write month");
}

#[test]
fn aggregation_orders_months_by_calendar() {
    let dir = tempdir().expect("Failed to create temp dir");
    for month in (1..=12).rev() {
        write_month(dir.path(), 1988, month, "T2", month as f32);
    }

    let path = combine_monthly(1988, &names(&["T2"]), dir.path())
        .expect("combine")
        .expect("written");
    let ds = read_dataset(&path).expect("read yearly");
    assert!(ds.times.windows(2).all(|w| w[0] < w[1]));
    let t2 = ds.data_var("T2").expect("T2");
    for (row, t) in ds.times.iter().enumerate() {
        assert_eq!(t2.data[[row, 0]], t.month() as f32);
    }
}

#[test]
fn aggregation_tolerates_sparse_months() {
    let dir = tempdir().expect("Failed to create temp dir");
    write_month(dir.path(), 1988, 7, "T2", 7.0);
    write_month(dir.path(), 1988, 3, "T2", 3.0);
    write_month(dir.path(), 1988, 3, "Q2", 0.3);

    let path = combine_monthly(1988, &names(&["T2", "Q2"]), dir.path())
        .expect("combine")
        .expect("written");
    let ds = read_dataset(&path).expect("read yearly");

    let months: std::collections::BTreeSet<u32> = ds.times.iter().map(|t| t.month()).collect();
    assert_eq!(months.into_iter().collect::<Vec<_>>(), vec![3, 7]);
    assert_eq!(ds.len(), (31 + 31) * 4);

    // Q2 exists for March only
    let q2 = ds.data_var("Q2").expect("Q2");
    assert_eq!(q2.data[[0, 0]], 0.3);
    assert!(q2.data[[ds.len() - 1, 0]].is_nan());
}
