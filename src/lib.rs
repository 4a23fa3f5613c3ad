//! reanalysis_fetch: bulk retrieval of CONUS404 and ERA5 reanalysis data
//!
//! Downloads one NetCDF file per (year, month, variable) from a cloud Zarr
//! store discovered through a STAC catalog, combines the monthly files into
//! one file per year, and aligns the yearly series in time with an ERA5
//! reference.
//!
//! ## Key Features
//!
//! - **Catalog resolution**: STAC collection lookup with Planetary Computer SAS signing
//! - **Concurrent downloads**: bounded tokio pool, one independent task per output file
//! - **Aggregation**: monthly files merged and concatenated into yearly files
//! - **Alignment**: sum/mean resampling with rayon, inner join on timestamps
//! - **ERA5**: CDS API retrieval and combination of the per-variable files
//!
//! ## Module Organization
//!
//! - [`catalog`]: STAC client, auth strategies and dataset resolution
//! - [`zarr_io`]: remote Zarr stores opened as lazy datasets
//! - [`netcdf_io`]: NetCDF reading and writing, local sources
//! - [`dataset`]: in-memory time-indexed datasets
//! - [`calendar`]: month bounds, CF time units and resample frequencies
//! - [`tasks`] and [`download`]: task enumeration and the download pool
//! - [`aggregate`]: monthly to yearly combination
//! - [`align`] and [`statistics`]: resampling and temporal alignment
//! - [`era5`]: CDS retrieval and ERA5 combination
//! - [`config`], [`parallel`], [`errors`]: configuration, concurrency and errors
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use reanalysis_fetch::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> reanalysis_fetch::Result<()> {
//! let source: SharedSource = Arc::new(NetcdfSource::open("conus404_hourly.nc")?);
//! let tasks = enumerate_tasks(&[1988], &["T2".to_string(), "Q2".to_string()]);
//! let summary = Downloader::new(source, "conus404_data", 4).run_all(tasks).await;
//! summary.print_summary();
//!
//! combine_monthly(1988, &["T2".to_string(), "Q2".to_string()], "conus404_data".as_ref())?;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod align;
pub mod calendar;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod data_source;
pub mod dataset;
pub mod download;
pub mod era5;
pub mod errors;
pub mod metadata;
pub mod netcdf_io;
pub mod parallel;
pub mod statistics;
pub mod tasks;
pub mod zarr_io;

pub use errors::{FetchError, Result};

pub mod prelude {
    //! Commonly used imports for convenience
    pub use crate::aggregate::combine_monthly;
    pub use crate::align::{align, align_year, resample, AlignedPair, AlignmentSettings};
    pub use crate::calendar::{month_bounds, Frequency, TimeRange};
    pub use crate::catalog::{resolve_dataset, ResolvedDataset};
    pub use crate::config::PipelineConfig;
    pub use crate::data_source::{DatasetSource, SharedSource};
    pub use crate::dataset::{Dataset, Variable};
    pub use crate::download::{DownloadSummary, Downloader, TaskOutcome};
    pub use crate::era5::{combine_era5, download_era5};
    pub use crate::errors::{FetchError, Result};
    pub use crate::netcdf_io::{read_dataset, write_dataset, NetcdfSource};
    pub use crate::parallel::ParallelConfig;
    pub use crate::statistics::StatOperation;
    pub use crate::tasks::{enumerate_tasks, Task};
    pub use crate::zarr_io::ZarrDataset;
}
