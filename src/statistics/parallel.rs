//! Parallel per-bin reductions
//!
//! Bins are reduced independently on the rayon pool. Accumulation is done in
//! `f64`; `NaN` and infinite samples are skipped.

use crate::errors::{FetchError, Result};
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use tracing::debug;

struct BinAccumulator {
    sums: Vec<f64>,
    counts: Vec<u32>,
}

fn accumulate(values: &[f32], row_len: usize, bin: &[usize]) -> BinAccumulator {
    let mut acc = BinAccumulator {
        sums: vec![0.0; row_len],
        counts: vec![0; row_len],
    };
    for &row in bin {
        let start = row * row_len;
        for (j, &x) in values[start..start + row_len].iter().enumerate() {
            if x.is_finite() {
                acc.sums[j] += f64::from(x);
                acc.counts[j] += 1;
            }
        }
    }
    acc
}

fn reduce_with<F>(data: &ArrayD<f32>, bins: &[Vec<usize>], finish: F) -> Result<ArrayD<f32>>
where
    F: Fn(BinAccumulator) -> Vec<f32> + Sync,
{
    let standard = data.as_standard_layout();
    let values = standard
        .as_slice()
        .ok_or_else(|| FetchError::Generic("array is not contiguous".to_string()))?;
    let inner: Vec<usize> = data.shape()[1..].to_vec();
    let row_len: usize = inner.iter().product();

    debug!(
        bins = bins.len(),
        cells = row_len,
        threads = rayon::current_num_threads(),
        "reducing time bins"
    );

    let reduced: Vec<Vec<f32>> = bins
        .par_iter()
        .map(|bin| finish(accumulate(values, row_len, bin)))
        .collect();

    let mut shape = vec![bins.len()];
    shape.extend(inner);
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), reduced.concat())?)
}

/// Sum per bin; a bin without valid samples sums to `0`.
///
/// # Errors
///
/// Returns an error if the result cannot be shaped.
pub fn parallel_bin_sum(data: &ArrayD<f32>, bins: &[Vec<usize>]) -> Result<ArrayD<f32>> {
    reduce_with(data, bins, |acc| acc.sums.iter().map(|&s| s as f32).collect())
}

/// Mean per bin; a bin without valid samples is `NaN`.
///
/// # Errors
///
/// Returns an error if the result cannot be shaped.
pub fn parallel_bin_mean(data: &ArrayD<f32>, bins: &[Vec<usize>]) -> Result<ArrayD<f32>> {
    reduce_with(data, bins, |acc| {
        acc.sums
            .iter()
            .zip(&acc.counts)
            .map(|(&sum, &count)| {
                if count > 0 {
                    (sum / f64::from(count)) as f32
                } else {
                    f32::NAN
                }
            })
            .collect()
    })
}
