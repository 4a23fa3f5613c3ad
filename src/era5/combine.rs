//! Merge per-variable ERA5 files into one series

use super::era5_output_path;
use crate::dataset::Dataset;
use crate::errors::Result;
use crate::netcdf_io::{read_dataset, write_dataset};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `{dir}/era5_combined.nc`
pub fn era5_combined_path(dir: &Path) -> PathBuf {
    dir.join("era5_combined.nc")
}

fn load_year(year: i32, variables: &[String], dir: &Path) -> Result<Option<Dataset>> {
    let mut merged: Option<Dataset> = None;
    for variable in variables {
        let path = era5_output_path(dir, variable, year);
        if !path.exists() {
            debug!(year, variable = %variable, "no ERA5 file, skipping");
            continue;
        }
        let ds = read_dataset(&path)?;
        merged = Some(match merged {
            Some(acc) => acc.merge(&ds)?,
            None => ds,
        });
    }
    Ok(merged)
}

/// Merge each year's variable files and concatenate the years along time.
///
/// The time dimension is whatever the files carry (`valid_time` from the
/// current CDS, `time` from older files). Returns `None` when no file exists.
pub fn combine_era5(years: &[i32], variables: &[String], dir: &Path) -> Result<Option<PathBuf>> {
    let mut yearly = Vec::new();
    for &year in years {
        if let Some(ds) = load_year(year, variables, dir)? {
            yearly.push(ds);
        }
    }
    if yearly.is_empty() {
        info!(dir = %dir.display(), "no ERA5 files to combine");
        return Ok(None);
    }

    let combined = Dataset::concat(&yearly)?;
    let path = era5_combined_path(dir);
    write_dataset(&combined, &path)?;
    info!(
        years = yearly.len(),
        steps = combined.len(),
        time_dim = %combined.time_dim,
        path = %path.display(),
        "wrote combined ERA5 file"
    );
    Ok(Some(path))
}
