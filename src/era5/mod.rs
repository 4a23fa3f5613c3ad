//! ERA5 retrieval through the CDS API
//!
//! One request per (year, variable) covering every month and day at the
//! configured synoptic times. Jobs are submitted, polled until they settle and
//! their result asset is streamed to `{dir}/era5_{variable}_{year}.nc`.
//! Requests run one after another; a failure is logged and counted and the
//! loop moves on.

pub mod combine;

use crate::config::Era5Config;
use crate::errors::{FetchError, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

pub use combine::{combine_era5, era5_combined_path};

/// Default CDS API root
pub const DEFAULT_CDS_URL: &str = "https://cds.climate.copernicus.eu/api";

/// `{dir}/era5_{variable}_{year}.nc`
pub fn era5_output_path(dir: &Path, variable: &str, year: i32) -> PathBuf {
    dir.join(format!("era5_{variable}_{year}.nc"))
}

/// CDS request document for one variable and year
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Era5Request {
    pub data_format: String,
    pub product_type: String,
    pub variable: String,
    pub pressure_level: String,
    pub year: String,
    pub month: Vec<String>,
    pub day: Vec<String>,
    pub time: Vec<String>,
    pub area: [f64; 4],
}

impl Era5Request {
    pub fn new(config: &Era5Config, variable: &str, year: i32) -> Self {
        Self {
            data_format: "netcdf".to_string(),
            product_type: config.product_type.clone(),
            variable: variable.to_string(),
            pressure_level: config.pressure_level.clone(),
            year: year.to_string(),
            month: (1..=12).map(|m| format!("{m:02}")).collect(),
            day: (1..=31).map(|d| format!("{d:02}")).collect(),
            time: config.times.clone(),
            area: config.area,
        }
    }

    /// Body of a process execution request
    pub fn to_execution_body(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "inputs": serde_json::to_value(self)? }))
    }
}

/// API root and personal access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdsCredentials {
    pub url: String,
    pub key: String,
}

impl CdsCredentials {
    /// `url:` and `key:` lines of a `.cdsapirc` file
    pub fn parse_rc(text: &str) -> (Option<String>, Option<String>) {
        let mut url = None;
        let mut key = None;
        for line in text.lines() {
            let Some((name, value)) = line.split_once(':') else { continue };
            let value = value.trim().to_string();
            match name.trim() {
                "url" => url = Some(value),
                "key" => key = Some(value),
                _ => {}
            }
        }
        (url, key)
    }

    /// Config values, then `CDSAPI_URL`/`CDSAPI_KEY`, then `~/.cdsapirc`.
    pub fn resolve(config: &Era5Config) -> Result<Self> {
        let (rc_url, rc_key) = dirs::home_dir()
            .map(|home| home.join(".cdsapirc"))
            .filter(|path| path.exists())
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|text| Self::parse_rc(&text))
            .unwrap_or_default();

        let url = config
            .api_url
            .clone()
            .or_else(|| std::env::var("CDSAPI_URL").ok())
            .or(rc_url)
            .unwrap_or_else(|| DEFAULT_CDS_URL.to_string());
        let key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("CDSAPI_KEY").ok())
            .or(rc_key)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                FetchError::AuthError(
                    "no CDS API key (set era5.api_key, CDSAPI_KEY or ~/.cdsapirc)".to_string(),
                )
            })?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            key,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct JobStatus {
    #[serde(rename = "jobID")]
    job_id: String,
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobResults {
    asset: ResultAsset,
}

#[derive(Debug, Deserialize)]
struct ResultAsset {
    value: AssetValue,
}

#[derive(Debug, Deserialize)]
struct AssetValue {
    href: String,
}

/// Client for the CDS retrieval API
#[derive(Clone)]
pub struct CdsClient {
    http: reqwest::Client,
    credentials: CdsCredentials,
    poll_interval: Duration,
}

impl CdsClient {
    pub fn new(http: reqwest::Client, credentials: CdsCredentials, poll_interval: Duration) -> Self {
        Self {
            http,
            credentials,
            poll_interval,
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header("PRIVATE-TOKEN", &self.credentials.key)
    }

    async fn json<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::CdsError(format!("{what} answered {status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| FetchError::CdsError(format!("malformed {what} response: {e}")))
    }

    async fn submit(&self, dataset: &str, request: &Era5Request) -> Result<JobStatus> {
        let url = format!(
            "{}/retrieve/v1/processes/{dataset}/execution",
            self.credentials.url
        );
        let builder = self
            .http
            .post(&url)
            .header("PRIVATE-TOKEN", &self.credentials.key)
            .json(&request.to_execution_body()?);
        Self::json(builder, "job submission").await
    }

    async fn wait(&self, mut job: JobStatus) -> Result<String> {
        let url = format!("{}/retrieve/v1/jobs/{}", self.credentials.url, job.job_id);
        loop {
            match job.status.as_str() {
                "successful" => return Ok(job.job_id),
                "failed" | "rejected" | "dismissed" => {
                    return Err(FetchError::CdsError(format!(
                        "job {} {}: {}",
                        job.job_id,
                        job.status,
                        job.message.as_deref().unwrap_or("no message")
                    )))
                }
                status => debug!(job = %job.job_id, status, "waiting"),
            }
            tokio::time::sleep(self.poll_interval).await;
            job = Self::json(self.get(&url), "job status").await?;
        }
    }

    async fn result_href(&self, job_id: &str) -> Result<String> {
        let url = format!("{}/retrieve/v1/jobs/{job_id}/results", self.credentials.url);
        let results: JobResults = Self::json(self.get(&url), "job results").await?;
        Ok(results.asset.value.href)
    }

    async fn fetch_to(&self, href: &str, target: &Path) -> Result<u64> {
        let response = self.http.get(href).send().await?.error_for_status()?;
        let partial = target.with_extension("nc.part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, target).await?;
        Ok(written)
    }

    /// Submit, wait for and download one request into `target`.
    pub async fn retrieve(&self, dataset: &str, request: &Era5Request, target: &Path) -> Result<u64> {
        let job = self.submit(dataset, request).await?;
        info!(job = %job.job_id, variable = %request.variable, year = %request.year, "submitted");
        let job_id = self.wait(job).await?;
        let href = self.result_href(&job_id).await?;
        self.fetch_to(&href, target).await
    }
}

/// Files written, skipped and failed by an ERA5 run
#[derive(Debug, Default)]
pub struct Era5Summary {
    pub downloaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, FetchError)>,
}

impl Era5Summary {
    pub fn print_summary(&self) {
        println!(
            "ERA5: {} downloaded, {} already present, {} failed",
            self.downloaded.len(),
            self.skipped.len(),
            self.failed.len()
        );
        for (path, e) in &self.failed {
            println!("   {}: {e}", path.display());
        }
    }
}

/// Retrieve every configured (year, variable) file not already on disk.
pub async fn download_era5(client: &CdsClient, config: &Era5Config) -> Result<Era5Summary> {
    tokio::fs::create_dir_all(&config.output_dir).await?;
    let mut summary = Era5Summary::default();

    for year in config.years.years() {
        for variable in &config.variables {
            let target = era5_output_path(&config.output_dir, variable, year);
            if target.exists() {
                debug!(path = %target.display(), "already present, skipping");
                summary.skipped.push(target);
                continue;
            }

            let request = Era5Request::new(config, variable, year);
            match client.retrieve(&config.dataset, &request, &target).await {
                Ok(bytes) => {
                    info!(year, variable = %variable, bytes, path = %target.display(), "complete");
                    summary.downloaded.push(target);
                }
                Err(e) => {
                    error!(year, variable = %variable, error = %e, "ERA5 request failed");
                    summary.failed.push((target, e));
                }
            }
        }
    }
    Ok(summary)
}
