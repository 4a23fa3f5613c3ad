//! Monthly file aggregation into yearly datasets
//!
//! Month directories under `{root}/{year}` are discovered by listing, merged
//! per month (one file per variable), concatenated along time in calendar
//! order and clipped to the year. Missing months and missing variable files
//! are skipped with a diagnostic.

use crate::calendar::TimeRange;
use crate::dataset::Dataset;
use crate::errors::Result;
use crate::netcdf_io::{write_dataset, LazyDataset};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// `{root}/conus404_{year}_combined.nc`
pub fn yearly_output_path(root: &Path, year: i32) -> PathBuf {
    root.join(format!("conus404_{year}_combined.nc"))
}

/// Month directories of a year, keyed and ordered by month index.
///
/// Entries whose name is not a two-digit month (`01`..`12`) are ignored.
pub fn discover_months(root: &Path, year: i32) -> Result<BTreeMap<u32, PathBuf>> {
    let year_dir = root.join(year.to_string());
    let mut months = BTreeMap::new();
    if !year_dir.is_dir() {
        return Ok(months);
    }

    for entry in fs::read_dir(&year_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        match name.parse::<u32>() {
            Ok(month) if name.len() == 2 && (1..=12).contains(&month) => {
                months.insert(month, entry.path());
            }
            _ => debug!(entry = name, "ignoring non-month entry"),
        }
    }
    Ok(months)
}

/// Merge the variable files of one month directory; `None` when none exist.
fn load_month(month_dir: &Path, variables: &[String]) -> Result<Option<Dataset>> {
    let mut lazies = Vec::new();
    for variable in variables {
        let path = month_dir.join(format!("{variable}.nc"));
        if path.exists() {
            lazies.push(LazyDataset::open(&path)?);
        } else {
            warn!(variable = %variable, dir = %month_dir.display(), "variable file missing, skipping");
        }
    }

    let mut merged: Option<Dataset> = None;
    for lazy in lazies {
        let ds = lazy.into_dataset()?;
        merged = Some(match merged {
            Some(acc) => acc.merge(&ds)?,
            None => ds,
        });
    }
    Ok(merged)
}

/// Yearly dataset built from the monthly files, clipped to the year.
pub fn combine_monthly_dataset(year: i32, variables: &[String], root: &Path) -> Result<Option<Dataset>> {
    let months = discover_months(root, year)?;

    let mut monthly = Vec::new();
    for month in 1..=12u32 {
        let Some(dir) = months.get(&month) else {
            info!(year, month, "month directory missing, skipping");
            continue;
        };
        match load_month(dir, variables)? {
            Some(ds) => monthly.push(ds),
            None => info!(year, month, "no variable files for month, skipping"),
        }
    }

    if monthly.is_empty() {
        info!(year, "no monthly data found");
        return Ok(None);
    }

    let combined = Dataset::concat(&monthly)?.select_time(&TimeRange::year(year)?);
    if combined.is_empty() {
        warn!(year, "monthly files hold no timestamps inside the year");
        return Ok(None);
    }
    Ok(Some(combined))
}

/// Combine a year's monthly files into `conus404_{year}_combined.nc`.
///
/// Returns `None` (and writes nothing) when the year has no data.
pub fn combine_monthly(year: i32, variables: &[String], root: &Path) -> Result<Option<PathBuf>> {
    let Some(combined) = combine_monthly_dataset(year, variables, root)? else {
        return Ok(None);
    };
    let path = yearly_output_path(root, year);
    write_dataset(&combined, &path)?;
    info!(
        year,
        steps = combined.len(),
        variables = %combined.variable_names().join(","),
        path = %path.display(),
        "wrote yearly file"
    );
    Ok(Some(path))
}
