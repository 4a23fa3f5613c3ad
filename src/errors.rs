//! Centralized error handling for reanalysis_fetch
//!
//! One error enum covers setup, per-task and I/O failures. Setup failures are
//! fatal for the whole run (see [`FetchError::is_fatal`]); everything else is
//! reported against the task or file that produced it. Any error raised while
//! resolving or opening the data source is wrapped in [`FetchError::Setup`],
//! whatever its kind.

use std::path::Path;
use thiserror::Error;

/// Main error type for reanalysis_fetch operations
#[derive(Debug, Error)]
pub enum FetchError {
    /// NetCDF file operation errors
    #[error("NetCDF error: {0}")]
    NetCDFError(#[from] netcdf::Error),

    /// I/O operation errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Array shape or dimension error
    #[error("Array error: {0}")]
    ArrayError(#[from] ndarray::ShapeError),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON encoding or decoding errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Object store access errors
    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),

    /// Zarr metadata or chunk decoding errors
    #[error("Zarr error: {0}")]
    ZarrError(String),

    /// Variable not found in a dataset
    #[error("Variable '{var}' not found in dataset. Available: [{}]", available.join(", "))]
    VariableNotFound { var: String, available: Vec<String> },

    /// Dimension not found in a variable
    #[error("Dimension '{dim}' not found in variable '{var}'")]
    DimensionNotFound { var: String, dim: String },

    /// A time selection matched no timestamps
    #[error("No timestamps for '{var}' between {start} and {end}")]
    EmptySelection {
        var: String,
        start: String,
        end: String,
    },

    /// The STAC catalog could not be queried
    #[error("Catalog error: {0}")]
    CatalogError(String),

    /// The requested collection does not exist in the catalog
    #[error("Collection '{0}' not found in catalog")]
    CollectionNotFound(String),

    /// None of the preferred storage backends are offered by the collection
    #[error("No storage backend for collection '{collection}' (tried [{}], available [{}])", tried.join(", "), available.join(", "))]
    NoBackend {
        collection: String,
        tried: Vec<String>,
        available: Vec<String>,
    },

    /// Signing or token retrieval failed
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Unparseable resample frequency
    #[error("Invalid frequency '{0}' (expected e.g. 1D, 6h, 30min or MS)")]
    InvalidFrequency(String),

    /// CF time coordinate could not be decoded
    #[error("Time decoding error: {0}")]
    TimeError(String),

    /// Datasets could not be merged or concatenated
    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    /// A variable layout the dataset model cannot represent
    #[error("Unsupported layout for '{var}': {message}")]
    UnsupportedLayout { var: String, message: String },

    /// The CDS retrieval service rejected or failed a request
    #[error("CDS request failed: {0}")]
    CdsError(String),

    /// Thread pool or runtime configuration error
    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),

    /// A worker panicked or was aborted while running a task
    #[error("Worker failed: {0}")]
    TaskPanicked(String),

    /// Failure while resolving or opening the data source
    #[error("Setup failed: {0}")]
    Setup(#[source] Box<FetchError>),

    /// Catch-all for everything else
    #[error("{0}")]
    Generic(String),
}

impl FetchError {
    /// Whether this error aborts the whole run rather than a single task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::CatalogError(_)
                | FetchError::CollectionNotFound(_)
                | FetchError::NoBackend { .. }
                | FetchError::AuthError(_)
                | FetchError::ConfigError(_)
                | FetchError::InvalidFrequency(_)
                | FetchError::ThreadPoolError(_)
                | FetchError::Setup(_)
        )
    }

    /// Mark an error as raised before any task could run.
    pub fn setup(self) -> Self {
        match self {
            FetchError::Setup(_) => self,
            other => FetchError::Setup(Box::new(other)),
        }
    }

    pub(crate) fn zarr(error: impl std::fmt::Display) -> Self {
        FetchError::ZarrError(error.to_string())
    }

    pub(crate) fn missing_file(path: &Path) -> Self {
        FetchError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        ))
    }
}

impl From<String> for FetchError {
    fn from(error: String) -> Self {
        FetchError::Generic(error)
    }
}

impl From<&str> for FetchError {
    fn from(error: &str) -> Self {
        FetchError::Generic(error.to_string())
    }
}

/// Result type alias for reanalysis_fetch operations
pub type Result<T> = std::result::Result<T, FetchError>;
