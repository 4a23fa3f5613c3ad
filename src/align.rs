//! Cross-source temporal alignment
//!
//! Series `b` (the downloaded data) is resampled to a target frequency, summing
//! extensive variables and averaging intensive ones, then inner-joined on time
//! with the reference series `a`. Both halves of an [`AlignedPair`] share the
//! same time index.

use crate::aggregate::yearly_output_path;
use crate::calendar::{Frequency, TimeRange};
use crate::config::AlignmentConfig;
use crate::dataset::{Dataset, Variable};
use crate::errors::{FetchError, Result};
use crate::netcdf_io::{read_dataset, write_dataset};
use crate::statistics::{BinnedReduction, StatOperation};
use chrono::{NaiveDateTime, NaiveTime};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One variable on a time index
#[derive(Debug, Clone)]
pub struct TimeSeries {
    pub times: Vec<NaiveDateTime>,
    pub variable: Variable,
}

/// A variable from both sources on their common timestamps
#[derive(Debug, Clone)]
pub struct AlignedPair {
    pub a: TimeSeries,
    pub b: TimeSeries,
}

/// Resample one variable of `ds` onto `frequency` bins.
///
/// Bins are contiguous from the bin of the first sample to the bin of the
/// last, anchored at midnight of the first sample's day.
pub fn resample(
    ds: &Dataset,
    variable: &str,
    frequency: Frequency,
    operation: StatOperation,
) -> Result<TimeSeries> {
    let ds = ds.sort_by_time();
    let var = ds.data_var(variable).ok_or_else(|| FetchError::VariableNotFound {
        var: variable.to_string(),
        available: ds.variable_names(),
    })?;

    let (Some(first), Some(last)) = (ds.times.first(), ds.times.last()) else {
        let mut shape = var.data.shape().to_vec();
        shape[0] = 0;
        return Ok(TimeSeries {
            times: Vec::new(),
            variable: Variable {
                dims: var.dims.clone(),
                data: ndarray::ArrayD::zeros(ndarray::IxDyn(&shape)),
                attrs: var.attrs.clone(),
            },
        });
    };

    let origin = first.date().and_time(NaiveTime::MIN);
    let last_label = frequency.bin_start(*last, origin);
    let mut labels = Vec::new();
    let mut label = frequency.bin_start(*first, origin);
    while label <= last_label {
        labels.push(label);
        label = frequency.next_bin(label);
    }

    let positions: HashMap<NaiveDateTime, usize> =
        labels.iter().enumerate().map(|(i, t)| (*t, i)).collect();
    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); labels.len()];
    for (row, t) in ds.times.iter().enumerate() {
        if let Some(&bin) = positions.get(&frequency.bin_start(*t, origin)) {
            bins[bin].push(row);
        }
    }

    let data = var.data.reduce_bins(&bins, operation)?;
    Ok(TimeSeries {
        times: labels,
        variable: Variable {
            dims: var.dims.clone(),
            data,
            attrs: var.attrs.clone(),
        },
    })
}

fn series_rows(times: &[NaiveDateTime], variable: &Variable, rows: &[usize]) -> TimeSeries {
    TimeSeries {
        times: rows.iter().map(|&i| times[i]).collect(),
        variable: Variable {
            dims: variable.dims.clone(),
            data: variable.data.select(ndarray::Axis(0), rows),
            attrs: variable.attrs.clone(),
        },
    }
}

/// Align every classified variable present in both sources.
///
/// `classification` maps a variable to whether it is extensive. Variables
/// missing from either source are skipped.
pub fn align(
    a: &Dataset,
    b: &Dataset,
    classification: &BTreeMap<String, bool>,
    frequency: Frequency,
) -> Result<BTreeMap<String, AlignedPair>> {
    let a = a.sort_by_time();
    let mut aligned = BTreeMap::new();

    for (name, &extensive) in classification {
        let (Some(a_var), Some(_)) = (a.data_var(name), b.data_var(name)) else {
            debug!(variable = %name, "not present in both sources, skipping");
            continue;
        };

        let operation = StatOperation::for_extensive(extensive);
        let resampled = resample(b, name, frequency, operation)?;

        let b_positions: HashMap<NaiveDateTime, usize> = resampled
            .times
            .iter()
            .enumerate()
            .map(|(i, t)| (*t, i))
            .collect();
        let (a_rows, b_rows): (Vec<usize>, Vec<usize>) = a
            .times
            .iter()
            .enumerate()
            .filter_map(|(i, t)| b_positions.get(t).map(|&j| (i, j)))
            .unzip();

        debug!(
            variable = %name,
            operation = operation.as_str(),
            common = a_rows.len(),
            "aligned"
        );
        aligned.insert(
            name.clone(),
            AlignedPair {
                a: series_rows(&a.times, a_var, &a_rows),
                b: series_rows(&resampled.times, &resampled.variable, &b_rows),
            },
        );
    }
    Ok(aligned)
}

/// Parsed alignment settings
#[derive(Debug, Clone)]
pub struct AlignmentSettings {
    pub frequency: Frequency,
    pub classification: BTreeMap<String, bool>,
    pub rename: BTreeMap<String, String>,
}

impl AlignmentSettings {
    pub fn from_config(config: &AlignmentConfig) -> Result<Self> {
        Ok(Self {
            frequency: config.target_frequency.parse()?,
            classification: config.variables.clone(),
            rename: config.rename.clone(),
        })
    }
}

/// `{root}/conus404_{year}_combined_{suffix}.nc`, e.g. `_daily` for `1D`
pub fn aligned_output_path(root: &Path, year: i32, frequency: Frequency) -> PathBuf {
    root.join(format!(
        "conus404_{year}_combined_{}.nc",
        frequency.file_suffix()
    ))
}

/// Dataset holding the `b` side of every aligned pair.
pub fn aligned_dataset(template: &Dataset, aligned: &BTreeMap<String, AlignedPair>) -> Result<Dataset> {
    let mut out: Option<Dataset> = None;
    for (name, pair) in aligned {
        let mut ds = Dataset::new(template.time_dim.clone(), pair.b.times.clone());
        ds.time_units = template.time_units.clone();
        ds.attrs = template.attrs.clone();
        for (coord_name, coord) in &template.coords {
            if coord.dims.iter().all(|d| pair.b.variable.dims.contains(d)) {
                ds.insert_coord(coord_name, coord.clone())?;
            }
        }
        ds.insert_data_var(name, pair.b.variable.clone())?;
        out = Some(match out {
            Some(acc) => acc.merge(&ds)?,
            None => ds,
        });
    }
    out.ok_or_else(|| FetchError::Generic("nothing aligned".to_string()))
}

/// Align a year's combined file against the reference file and write the result.
///
/// The reference is clipped to the year and the rename map is applied to
/// the combined data first. Returns `None` when nothing aligned.
pub fn align_year(
    year: i32,
    root: &Path,
    reference: &Path,
    settings: &AlignmentSettings,
) -> Result<Option<PathBuf>> {
    let mut b = read_dataset(&yearly_output_path(root, year))?;
    b.rename(&settings.rename)?;
    let a = read_dataset(reference)?
        .sort_by_time()
        .select_time(&TimeRange::year(year)?);

    let aligned = align(&a, &b, &settings.classification, settings.frequency)?;
    if aligned.is_empty() || aligned.values().all(|p| p.b.times.is_empty()) {
        info!(year, "no variables aligned, nothing written");
        return Ok(None);
    }

    let out = aligned_dataset(&b, &aligned)?;
    let path = aligned_output_path(root, year, settings.frequency);
    write_dataset(&out, &path)?;
    info!(
        year,
        variables = %out.variable_names().join(","),
        steps = out.len(),
        path = %path.display(),
        "wrote aligned file"
    );
    Ok(Some(path))
}
