//! Pipeline configuration
//!
//! Everything the pipeline needs is read from a JSON file (every field is
//! optional) and then adjusted by command-line overrides. Defaults reproduce a
//! CONUS404 download of T2 and Q2 for 1988 with four workers.

use crate::calendar::Frequency;
use crate::catalog::auth::AuthMode;
use crate::errors::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Config file looked up in the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "reanalysis-fetch.json";

/// Years, either listed or as an inclusive range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YearSpec {
    List(Vec<i32>),
    Range { start: i32, end: i32 },
}

impl YearSpec {
    pub fn years(&self) -> Vec<i32> {
        match self {
            Self::List(years) => years.clone(),
            Self::Range { start, end } => (*start..=*end).collect(),
        }
    }
}

impl FromStr for YearSpec {
    type Err = FetchError;

    /// `1988`, `1988,1990` or `1988-1990`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FetchError::ConfigError(format!("invalid years '{s}'"));
        if let Some((start, end)) = s.split_once('-') {
            let start = start.trim().parse().map_err(|_| invalid())?;
            let end = end.trim().parse().map_err(|_| invalid())?;
            return Ok(Self::Range { start, end });
        }
        s.split(',')
            .map(|y| y.trim().parse::<i32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()
            .map(Self::List)
    }
}

/// Catalog and storage backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// STAC API root
    pub url: String,
    pub collection: String,
    /// Asset keys, most preferred first
    pub backends: Vec<String>,
    pub auth: AuthMode,
    /// SAS token service root
    pub sas_url: String,
    /// Planetary Computer subscription key; `PC_SDK_SUBSCRIPTION_KEY` when unset
    pub subscription_key: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: "https://planetarycomputer.microsoft.com/api/stac/v1".to_string(),
            collection: "conus404".to_string(),
            backends: vec!["zarr-abfs".to_string(), "zarr-https".to_string()],
            auth: AuthMode::Auto,
            sas_url: "https://planetarycomputer.microsoft.com/api/sas/v1".to_string(),
            subscription_key: None,
        }
    }
}

impl CatalogConfig {
    pub fn resolved_subscription_key(&self) -> Option<String> {
        self.subscription_key
            .clone()
            .or_else(|| std::env::var("PC_SDK_SUBSCRIPTION_KEY").ok())
            .filter(|k| !k.is_empty())
    }
}

/// Temporal alignment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Resample frequency, e.g. `1D`, `6h`, `MS`
    pub target_frequency: String,
    /// Reference series; alignment is skipped by `run` when absent
    pub reference: Option<PathBuf>,
    /// Variable name to extensive flag (`true` sums, `false` averages)
    pub variables: BTreeMap<String, bool>,
    /// Renames applied to the downloaded series before alignment
    pub rename: BTreeMap<String, String>,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            target_frequency: "1D".to_string(),
            reference: Some(PathBuf::from("era5_data/era5_combined.nc")),
            variables: BTreeMap::from([
                ("t".to_string(), false),
                ("specific_rain_water_content".to_string(), true),
            ]),
            rename: BTreeMap::from([("T2".to_string(), "t".to_string())]),
        }
    }
}

/// ERA5 retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Era5Config {
    pub output_dir: PathBuf,
    pub years: YearSpec,
    pub variables: Vec<String>,
    pub dataset: String,
    pub product_type: String,
    pub pressure_level: String,
    pub times: Vec<String>,
    /// North, West, South, East
    pub area: [f64; 4],
    /// CDS API root; `CDSAPI_URL` or `~/.cdsapirc` when unset
    pub api_url: Option<String>,
    /// CDS personal access token; `CDSAPI_KEY` or `~/.cdsapirc` when unset
    pub api_key: Option<String>,
    pub poll_interval_secs: u64,
}

impl Default for Era5Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("era5_data"),
            years: YearSpec::Range {
                start: 1988,
                end: 1989,
            },
            variables: vec![
                "specific_rain_water_content".to_string(),
                "temperature".to_string(),
            ],
            dataset: "reanalysis-era5-pressure-levels".to_string(),
            product_type: "reanalysis".to_string(),
            pressure_level: "1000".to_string(),
            times: ["00:00", "06:00", "12:00", "18:00"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            area: [50.0, -126.0, 24.0, -65.0],
            api_url: None,
            api_key: None,
            poll_interval_secs: 5,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub years: YearSpec,
    pub variables: Vec<String>,
    pub output_dir: PathBuf,
    /// Concurrent download tasks
    pub workers: usize,
    /// Threads for resampling reductions; all cores when unset
    pub compute_threads: Option<usize>,
    pub catalog: CatalogConfig,
    pub alignment: AlignmentConfig,
    pub era5: Era5Config,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            years: YearSpec::List(vec![1988]),
            variables: vec!["T2".to_string(), "Q2".to_string()],
            output_dir: PathBuf::from("conus404_data"),
            workers: 4,
            compute_threads: None,
            catalog: CatalogConfig::default(),
            alignment: AlignmentConfig::default(),
            era5: Era5Config::default(),
        }
    }
}

impl PipelineConfig {
    /// Read `path`, or the default config file if present, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) if !p.exists() => {
                return Err(FetchError::ConfigError(format!(
                    "config file {} does not exist",
                    p.display()
                )))
            }
            Some(p) => Some(p.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };

        let config = match path {
            Some(path) => {
                debug!(path = %path.display(), "loading configuration");
                Self::from_json(&fs::read_to_string(&path)?).map_err(|e| {
                    FetchError::ConfigError(format!("{}: {e}", path.display()))
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(FetchError::ConfigError("workers must be at least 1".into()));
        }
        if self.compute_threads == Some(0) {
            return Err(FetchError::ConfigError("compute_threads must be at least 1".into()));
        }
        if self.years.years().is_empty() {
            return Err(FetchError::ConfigError("no years configured".into()));
        }
        if self.variables.is_empty() {
            return Err(FetchError::ConfigError("no variables configured".into()));
        }
        if self.catalog.backends.is_empty() {
            return Err(FetchError::ConfigError("no storage backends configured".into()));
        }
        if self.era5.poll_interval_secs == 0 {
            return Err(FetchError::ConfigError("era5.poll_interval_secs must be at least 1".into()));
        }
        self.frequency()?;
        Ok(())
    }

    pub fn frequency(&self) -> Result<Frequency> {
        self.alignment.target_frequency.parse()
    }

    pub fn years(&self) -> Vec<i32> {
        self.years.years()
    }
}
