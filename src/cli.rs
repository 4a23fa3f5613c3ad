//! Command-line interface and subcommand dispatch

use crate::aggregate::{combine_monthly, yearly_output_path};
use crate::align::{align_year, AlignmentSettings};
use crate::catalog::resolve_dataset;
use crate::config::{PipelineConfig, YearSpec};
use crate::data_source::SharedSource;
use crate::download::{DownloadSummary, Downloader};
use crate::era5::{combine_era5, download_era5, CdsClient, CdsCredentials};
use crate::errors::{FetchError, Result};
use crate::metadata::{inspect_file, print_resolved};
use crate::netcdf_io::NetcdfSource;
use crate::parallel::ParallelConfig;
use crate::tasks::enumerate_tasks;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fetch CONUS404 and ERA5 reanalysis data into NetCDF files
#[derive(Parser, Debug)]
#[command(name = "reanalysis-fetch", version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// JSON config file (defaults to ./reanalysis-fetch.json when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Years to process: 1988, 1988,1990 or 1988-1990
    #[arg(short, long, global = true, value_parser = parse_years)]
    pub years: Option<YearSpec>,

    /// Comma-separated variable names
    #[arg(long, global = true, value_delimiter = ',')]
    pub variables: Option<Vec<String>>,

    /// Root directory for downloaded and combined files
    #[arg(short, long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Concurrent download tasks
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Threads for resampling reductions. Defaults to number of CPU cores.
    #[arg(short = 't', long, global = true)]
    pub threads: Option<usize>,

    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
}

fn parse_years(s: &str) -> std::result::Result<YearSpec, String> {
    s.parse().map_err(|e: FetchError| e.to_string())
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one file per (year, month, variable)
    Download {
        /// Read from a local NetCDF file instead of the catalog
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Combine monthly files into one file per year
    Combine,
    /// Resample yearly files and align them with a reference series
    Align {
        /// Reference NetCDF file
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Target frequency, e.g. 1D, 6h, MS
        #[arg(long)]
        frequency: Option<String>,
    },
    /// Download, combine and, when a reference exists, align
    Run {
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Retrieve ERA5 files from the CDS
    Era5Download,
    /// Combine retrieved ERA5 files into era5_combined.nc
    Era5Combine,
    /// Show a local NetCDF file or the resolved remote dataset
    Inspect {
        file: Option<PathBuf>,
    },
}

/// How a completed command went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    PartialFailure,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::PartialFailure => 1,
        }
    }
}

/// Exit code for an error that ended a command
pub fn error_exit_code(error: &FetchError) -> i32 {
    if error.is_fatal() {
        2
    } else {
        1
    }
}

impl Args {
    /// Load the config file and apply command-line overrides.
    pub fn load_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load(self.config.as_deref())?;
        let era5_command = matches!(self.command, Command::Era5Download | Command::Era5Combine);

        if let Some(years) = &self.years {
            if era5_command {
                config.era5.years = years.clone();
            } else {
                config.years = years.clone();
            }
        }
        if let Some(variables) = &self.variables {
            if era5_command {
                config.era5.variables = variables.clone();
            } else {
                config.variables = variables.clone();
            }
        }
        if let Some(dir) = &self.output_dir {
            if era5_command {
                config.era5.output_dir = dir.clone();
            } else {
                config.output_dir = dir.clone();
            }
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(threads) = self.threads {
            config.compute_threads = Some(threads);
        }
        if let Command::Align {
            reference,
            frequency,
        } = &self.command
        {
            if let Some(reference) = reference {
                config.alignment.reference = Some(reference.clone());
            }
            if let Some(frequency) = frequency {
                config.alignment.target_frequency = frequency.clone();
            }
        }
        config.validate()?;
        Ok(config)
    }
}

/// Open the local or catalog source; any failure here is fatal.
async fn open_source(config: &PipelineConfig, source: Option<&Path>) -> Result<SharedSource> {
    match source {
        Some(path) => {
            info!(path = %path.display(), "using local source");
            let source = NetcdfSource::open(path).map_err(FetchError::setup)?;
            Ok(Arc::new(source))
        }
        None => {
            let resolved = resolve_dataset(&config.catalog).await?;
            info!(
                collection = %resolved.collection,
                backend = %resolved.backend,
                variables = resolved.variables.len(),
                "dataset opened"
            );
            Ok(resolved.handle)
        }
    }
}

/// Resolve the source and run every download task.
pub async fn download(config: &PipelineConfig, source: Option<&Path>) -> Result<DownloadSummary> {
    let source = open_source(config, source).await?;
    let tasks = enumerate_tasks(&config.years(), &config.variables);
    info!(tasks = tasks.len(), workers = config.workers, "starting downloads");
    let downloader = Downloader::new(source, &config.output_dir, config.workers);
    Ok(downloader.run_all(tasks).await)
}

/// Combine every configured year; returns the files written.
pub fn combine(config: &PipelineConfig) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for year in config.years() {
        if let Some(path) = combine_monthly(year, &config.variables, &config.output_dir)? {
            println!("Saved {}", path.display());
            written.push(path);
        }
    }
    Ok(written)
}

/// Align every configured year against the reference file.
pub fn align(config: &PipelineConfig) -> Result<Vec<PathBuf>> {
    let reference = config.alignment.reference.as_deref().ok_or_else(|| {
        FetchError::ConfigError("no alignment reference configured".to_string())
    })?;
    if !reference.exists() {
        return Err(FetchError::missing_file(reference));
    }
    let settings = AlignmentSettings::from_config(&config.alignment)?;

    let mut written = Vec::new();
    for year in config.years() {
        let yearly = yearly_output_path(&config.output_dir, year);
        if !yearly.exists() {
            warn!(year, path = %yearly.display(), "no combined file for year, skipping");
            continue;
        }
        if let Some(path) = align_year(year, &config.output_dir, reference, &settings)? {
            println!("Saved {}", path.display());
            written.push(path);
        }
    }
    Ok(written)
}

fn finish_downloads(summary: &DownloadSummary) -> Outcome {
    summary.print_summary();
    if summary.all_succeeded() {
        Outcome::Success
    } else {
        Outcome::PartialFailure
    }
}

/// Run the parsed command to completion.
pub fn execute(args: &Args) -> Result<Outcome> {
    let config = args.load_config()?;
    let parallel = ParallelConfig::from_config(&config);
    parallel.setup_global_pool()?;
    parallel.info().log();

    match &args.command {
        Command::Download { source } => {
            let runtime = parallel.build_runtime()?;
            let summary = runtime.block_on(download(&config, source.as_deref()))?;
            Ok(finish_downloads(&summary))
        }
        Command::Combine => {
            combine(&config)?;
            Ok(Outcome::Success)
        }
        Command::Align { .. } => {
            align(&config)?;
            Ok(Outcome::Success)
        }
        Command::Run { source } => {
            let runtime = parallel.build_runtime()?;
            let summary = runtime.block_on(download(&config, source.as_deref()))?;
            let outcome = finish_downloads(&summary);
            combine(&config)?;
            match &config.alignment.reference {
                Some(reference) if reference.exists() => {
                    align(&config)?;
                }
                Some(reference) => {
                    warn!(reference = %reference.display(), "reference file missing, skipping alignment")
                }
                None => info!("no alignment reference configured"),
            }
            Ok(outcome)
        }
        Command::Era5Download => {
            let runtime = parallel.build_runtime()?;
            let summary = runtime.block_on(async {
                let credentials = CdsCredentials::resolve(&config.era5)?;
                let client = CdsClient::new(
                    reqwest::Client::new(),
                    credentials,
                    Duration::from_secs(config.era5.poll_interval_secs),
                );
                download_era5(&client, &config.era5).await
            })?;
            summary.print_summary();
            Ok(if summary.failed.is_empty() {
                Outcome::Success
            } else {
                Outcome::PartialFailure
            })
        }
        Command::Era5Combine => {
            let era5 = &config.era5;
            match combine_era5(&era5.years.years(), &era5.variables, &era5.output_dir)? {
                Some(path) => println!("Saved {}", path.display()),
                None => println!("No ERA5 files found in {}", era5.output_dir.display()),
            }
            Ok(Outcome::Success)
        }
        Command::Inspect { file: Some(path) } => {
            inspect_file(path)?;
            Ok(Outcome::Success)
        }
        Command::Inspect { file: None } => {
            let runtime = parallel.build_runtime()?;
            let resolved = runtime.block_on(resolve_dataset(&config.catalog))?;
            print_resolved(&resolved);
            Ok(Outcome::Success)
        }
    }
}
