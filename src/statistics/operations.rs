//! Reduction kinds and the binned reduction trait

use crate::errors::{FetchError, Result};
use ndarray::ArrayD;

/// How the samples of one time bin are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatOperation {
    /// Sum of valid samples, `0` for a bin without any
    Sum,
    /// Mean of valid samples, `NaN` for a bin without any
    Mean,
}

impl StatOperation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
        }
    }

    /// Extensive quantities (accumulations) are summed, intensive ones averaged.
    #[must_use]
    pub const fn for_extensive(extensive: bool) -> Self {
        if extensive {
            Self::Sum
        } else {
            Self::Mean
        }
    }
}

/// Arrays that can be reduced over groups of rows along the leading axis
pub trait BinnedReduction {
    /// Reduce `data[bin[i], ...]` for every bin; the result has one row per bin.
    ///
    /// # Errors
    ///
    /// Returns an error if the array has no leading axis or a bin refers to a
    /// row outside it.
    fn reduce_bins(&self, bins: &[Vec<usize>], operation: StatOperation) -> Result<ArrayD<f32>>;
}

impl BinnedReduction for ArrayD<f32> {
    fn reduce_bins(&self, bins: &[Vec<usize>], operation: StatOperation) -> Result<ArrayD<f32>> {
        if self.ndim() == 0 {
            return Err(FetchError::Generic(
                "cannot resample a scalar array".to_string(),
            ));
        }
        let rows = self.shape()[0];
        if let Some(row) = bins.iter().flatten().find(|&&r| r >= rows) {
            return Err(FetchError::Generic(format!(
                "row {row} is out of bounds for {rows} time steps"
            )));
        }

        match operation {
            StatOperation::Sum => super::parallel::parallel_bin_sum(self, bins),
            StatOperation::Mean => super::parallel::parallel_bin_mean(self, bins),
        }
    }
}
