//! Remote Zarr dataset access
//!
//! A [`ZarrDataset`] is a lazy handle on a consolidated Zarr (v2) store: only
//! the consolidated metadata and the time coordinate are read when it is
//! opened. Array chunks are fetched through `zarrs` when a variable is
//! selected. Stores are reached through `object_store`, so Azure Blob (with a
//! SAS token), plain HTTP and the local filesystem all look the same here.

use crate::calendar::{CfTimeUnits, TimeRange};
use crate::data_source::{time_window, DatasetSource};
use crate::dataset::{AttrValue, Attributes, CfPacking, Dataset, Variable};
use crate::errors::{FetchError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use ndarray::{ArrayD, IxDyn};
use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};
use object_store::http::HttpBuilder;
use object_store::local::LocalFileSystem;
use object_store::prefix::PrefixStore;
use object_store::{ClientOptions, ObjectStore};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use zarrs::array::{Array, DataType};
use zarrs::array_subset::ArraySubset;
use zarrs_object_store::AsyncObjectStore;

type ZarrStorage = AsyncObjectStore<Arc<dyn ObjectStore>>;

const BLOB_HOST_SUFFIX: &str = ".blob.core.windows.net";

/// Where a Zarr store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Azure Blob Storage container, optionally signed with a SAS token
    Azure {
        account: String,
        container: String,
        prefix: String,
        sas_token: Option<String>,
    },
    /// Any other HTTP(S) endpoint
    Http { url: String },
    /// A directory on the local filesystem
    Local { path: PathBuf },
}

fn option_str<'a>(options: &'a Map<String, JsonValue>, key: &str) -> Option<&'a str> {
    options.get(key).and_then(JsonValue::as_str).filter(|s| !s.is_empty())
}

impl StoreLocation {
    /// Interpret an asset href together with its `xarray:storage_options`.
    ///
    /// `abfs://container/prefix` and `az://container/prefix` take the account
    /// from `account_name` (or a `container@account.dfs...` authority); the
    /// SAS token comes from `credential` or `sas_token`, or from the query
    /// string of an `https://{account}.blob.core.windows.net/...` href.
    pub fn parse(href: &str, options: &Map<String, JsonValue>) -> Result<Self> {
        let option_token = option_str(options, "credential")
            .or_else(|| option_str(options, "sas_token"))
            .map(|t| t.trim_start_matches('?').to_string());

        if let Some(rest) = href
            .strip_prefix("abfs://")
            .or_else(|| href.strip_prefix("abfss://"))
            .or_else(|| href.strip_prefix("az://"))
        {
            let (authority, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            let (container, account) = match authority.split_once('@') {
                Some((container, host)) => (
                    container.to_string(),
                    host.split('.').next().map(str::to_string),
                ),
                None => (authority.to_string(), None),
            };
            let account = account
                .or_else(|| option_str(options, "account_name").map(str::to_string))
                .ok_or_else(|| {
                    FetchError::CatalogError(format!("no storage account for '{href}'"))
                })?;
            return Ok(Self::Azure {
                account,
                container,
                prefix: prefix.trim_matches('/').to_string(),
                sas_token: option_token,
            });
        }

        if href.starts_with("https://") || href.starts_with("http://") {
            let (base, query) = match href.split_once('?') {
                Some((base, query)) => (base, Some(query.to_string())),
                None => (href, None),
            };
            let without_scheme = base.split_once("://").map_or(base, |(_, rest)| rest);
            let (host, path) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
            if let Some(account) = host.strip_suffix(BLOB_HOST_SUFFIX) {
                let (container, prefix) = path.split_once('/').unwrap_or((path, ""));
                return Ok(Self::Azure {
                    account: account.to_string(),
                    container: container.to_string(),
                    prefix: prefix.trim_matches('/').to_string(),
                    sas_token: query.or(option_token),
                });
            }
            return Ok(Self::Http {
                url: href.to_string(),
            });
        }

        let path = href.strip_prefix("file://").unwrap_or(href);
        Ok(Self::Local {
            path: PathBuf::from(path),
        })
    }

    /// Storage account and container, for blob locations
    pub fn azure_container(&self) -> Option<(&str, &str)> {
        match self {
            Self::Azure {
                account, container, ..
            } => Some((account, container)),
            _ => None,
        }
    }

    /// Build an object store rooted at the Zarr store.
    pub fn build_store(&self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            Self::Azure {
                account,
                container,
                prefix,
                sas_token,
            } => {
                let mut builder = MicrosoftAzureBuilder::new()
                    .with_account(account)
                    .with_container_name(container);
                builder = match sas_token {
                    Some(token) => builder.with_config(AzureConfigKey::SasKey, token),
                    None => builder.with_config(AzureConfigKey::SkipSignature, "true"),
                };
                let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);
                Ok(if prefix.is_empty() {
                    store
                } else {
                    Arc::new(PrefixStore::new(store, prefix.as_str()))
                })
            }
            Self::Http { url } => {
                let options = ClientOptions::new().with_allow_http(url.starts_with("http://"));
                Ok(Arc::new(
                    HttpBuilder::new()
                        .with_url(url)
                        .with_client_options(options)
                        .build()?,
                ))
            }
            Self::Local { path } => {
                if !path.exists() {
                    return Err(FetchError::missing_file(path));
                }
                Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
            }
        }
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Azure {
                account,
                container,
                prefix,
                ..
            } => write!(f, "az://{container}/{prefix} (account {account})"),
            Self::Http { url } => write!(f, "{}", url.split('?').next().unwrap_or(url)),
            Self::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Metadata for one array of the store
#[derive(Debug, Clone)]
pub struct ArrayMetadata {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<u64>,
    pub dtype: String,
    pub attrs: Attributes,
    /// Store-level fill value, when numeric
    pub fill_value: Option<f64>,
}

fn json_to_attr(value: &JsonValue) -> Option<AttrValue> {
    match value {
        JsonValue::String(s) => Some(AttrValue::Str(s.clone())),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Some(AttrValue::Int(i)),
            None => n.as_f64().map(AttrValue::Float),
        },
        JsonValue::Array(items) if !items.is_empty() => {
            if items.iter().all(JsonValue::is_i64) {
                Some(AttrValue::Ints(items.iter().filter_map(JsonValue::as_i64).collect()))
            } else if items.iter().all(JsonValue::is_number) {
                Some(AttrValue::Floats(items.iter().filter_map(JsonValue::as_f64).collect()))
            } else if items.iter().all(JsonValue::is_string) {
                let parts: Vec<&str> = items.iter().filter_map(JsonValue::as_str).collect();
                Some(AttrValue::Str(parts.join(" ")))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn json_attrs(value: Option<&JsonValue>) -> Attributes {
    value
        .and_then(JsonValue::as_object)
        .map(|map| {
            map.iter()
                .filter(|(k, _)| k.as_str() != "_ARRAY_DIMENSIONS")
                .filter_map(|(k, v)| json_to_attr(v).map(|a| (k.clone(), a)))
                .collect()
        })
        .unwrap_or_default()
}

/// Consolidated metadata of a store
#[derive(Debug, Clone, Default)]
pub struct ConsolidatedMetadata {
    pub arrays: BTreeMap<String, ArrayMetadata>,
    pub attrs: Attributes,
}

impl ConsolidatedMetadata {
    /// Parse a `.zmetadata` document; only top-level arrays are kept.
    pub fn parse(document: &JsonValue) -> Result<Self> {
        let entries = document
            .get("metadata")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| FetchError::zarr("consolidated metadata has no 'metadata' object"))?;

        let mut arrays = BTreeMap::new();
        for (key, zarray) in entries {
            let Some(name) = key.strip_suffix("/.zarray") else {
                continue;
            };
            if name.contains('/') {
                continue;
            }
            let zattrs = entries.get(&format!("{name}/.zattrs"));
            let dims: Vec<String> = zattrs
                .and_then(|a| a.get("_ARRAY_DIMENSIONS"))
                .and_then(JsonValue::as_array)
                .map(|d| d.iter().filter_map(JsonValue::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            let shape: Vec<u64> = zarray
                .get("shape")
                .and_then(JsonValue::as_array)
                .map(|s| s.iter().filter_map(JsonValue::as_u64).collect())
                .ok_or_else(|| FetchError::zarr(format!("array '{name}' has no shape")))?;
            if dims.len() != shape.len() {
                debug!(array = name, "skipping array without _ARRAY_DIMENSIONS");
                continue;
            }

            arrays.insert(
                name.to_string(),
                ArrayMetadata {
                    name: name.to_string(),
                    dims,
                    shape,
                    dtype: zarray
                        .get("dtype")
                        .map(|d| d.to_string().trim_matches('"').to_string())
                        .unwrap_or_default(),
                    attrs: json_attrs(zattrs),
                    fill_value: zarray.get("fill_value").and_then(JsonValue::as_f64),
                },
            );
        }

        Ok(Self {
            arrays,
            attrs: json_attrs(entries.get(".zattrs")),
        })
    }

    /// The time coordinate: a 1-D array named after its dimension with CF time units.
    pub fn time_array(&self) -> Option<&ArrayMetadata> {
        let is_time = |meta: &&ArrayMetadata| {
            meta.dims.len() == 1
                && meta.dims[0] == meta.name
                && meta
                    .attrs
                    .get("units")
                    .and_then(AttrValue::as_str)
                    .map_or(false, |u| u.contains(" since "))
        };
        ["time", "valid_time", "Time"]
            .iter()
            .filter_map(|name| self.arrays.get(*name))
            .find(is_time)
            .or_else(|| self.arrays.values().find(is_time))
    }

    /// Non-time arrays attached to `var`: named in a `coordinates`
    /// attribute or named after a dimension, and spanning only dims of `var`.
    pub fn coordinates_for(&self, var: &ArrayMetadata, time_dim: &str) -> Vec<String> {
        let mut listed: Vec<String> = var
            .attrs
            .get("coordinates")
            .and_then(AttrValue::as_str)
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        listed.extend(var.dims.iter().cloned());

        let mut coords: Vec<String> = listed
            .into_iter()
            .filter(|name| name != time_dim)
            .filter(|name| {
                self.arrays.get(name).map_or(false, |c| {
                    !c.dims.iter().any(|d| d == time_dim) && c.dims.iter().all(|d| var.dims.contains(d))
                })
            })
            .collect();
        coords.sort();
        coords.dedup();
        coords
    }
}

macro_rules! retrieve_as_f64 {
    ($array:expr, $name:expr, $subset:expr, $($variant:ident => $ty:ty),+ $(,)?) => {
        match $array.data_type() {
            $(
                DataType::$variant => $array
                    .async_retrieve_array_subset_elements::<$ty>($subset)
                    .await
                    .map_err(FetchError::zarr)?
                    .into_iter()
                    .map(|v| v as f64)
                    .collect::<Vec<f64>>(),
            )+
            other => {
                return Err(FetchError::UnsupportedLayout {
                    var: $name.to_string(),
                    message: format!("data type {other:?} is not numeric"),
                })
            }
        }
    };
}

/// Read a subset of any numeric array widened to f64.
async fn read_subset(array: &Array<ZarrStorage>, name: &str, ranges: &[Range<u64>]) -> Result<Vec<f64>> {
    let subset = ArraySubset::new_with_ranges(ranges);
    Ok(retrieve_as_f64!(array, name, &subset,
        Float32 => f32,
        Float64 => f64,
        Int8 => i8,
        Int16 => i16,
        Int32 => i32,
        Int64 => i64,
        UInt8 => u8,
        UInt16 => u16,
        UInt32 => u32,
        UInt64 => u64,
    ))
}

/// Lazy handle on a consolidated Zarr store
pub struct ZarrDataset {
    location: String,
    storage: Arc<ZarrStorage>,
    metadata: ConsolidatedMetadata,
    time_dim: String,
    times: Vec<NaiveDateTime>,
    time_units: CfTimeUnits,
    coord_cache: RwLock<HashMap<String, Variable>>,
}

impl std::fmt::Debug for ZarrDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZarrDataset")
            .field("location", &self.location)
            .field("time_dim", &self.time_dim)
            .field("times", &self.times.len())
            .finish()
    }
}

impl ZarrDataset {
    /// Open a store: read `.zmetadata` and decode the time coordinate.
    pub async fn open(location: &StoreLocation) -> Result<Self> {
        let store = location.build_store()?;
        let document = store
            .get(&object_store::path::Path::from(".zmetadata"))
            .await?
            .bytes()
            .await?;
        let document: JsonValue = serde_json::from_slice(&document)?;
        let metadata = ConsolidatedMetadata::parse(&document)?;

        let time_meta = metadata.time_array().cloned().ok_or_else(|| {
            FetchError::DimensionNotFound {
                var: location.to_string(),
                dim: "time".to_string(),
            }
        })?;
        let units = time_meta
            .attrs
            .get("units")
            .and_then(AttrValue::as_str)
            .unwrap_or_default();
        let calendar = time_meta.attrs.get("calendar").and_then(AttrValue::as_str);
        let time_units = CfTimeUnits::parse(units, calendar)?;

        let storage = Arc::new(AsyncObjectStore::new(store));
        let array = Array::async_open(storage.clone(), &format!("/{}", time_meta.name))
            .await
            .map_err(FetchError::zarr)?;
        let raw = read_subset(&array, &time_meta.name, &[0..time_meta.shape[0]]).await?;
        let times = time_units.decode(&raw)?;
        if !times.windows(2).all(|w| w[0] <= w[1]) {
            return Err(FetchError::UnsupportedLayout {
                var: time_meta.name.clone(),
                message: "time coordinate is not sorted".to_string(),
            });
        }

        info!(
            store = %location,
            arrays = metadata.arrays.len(),
            steps = times.len(),
            "opened zarr store"
        );

        Ok(Self {
            location: location.to_string(),
            storage,
            time_dim: time_meta.name.clone(),
            metadata,
            times,
            time_units,
            coord_cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn metadata(&self) -> &ConsolidatedMetadata {
        &self.metadata
    }

    pub fn time_dim(&self) -> &str {
        &self.time_dim
    }

    async fn read_array(&self, meta: &ArrayMetadata, ranges: &[Range<u64>]) -> Result<Variable> {
        let array = Array::async_open(self.storage.clone(), &format!("/{}", meta.name))
            .await
            .map_err(FetchError::zarr)?;
        let mut packing = CfPacking::from_attrs(&meta.attrs);
        if let Some(fill) = meta.fill_value {
            packing = packing.with_fill(fill);
        }

        let values = match array.data_type() {
            DataType::Float32 => {
                let subset = ArraySubset::new_with_ranges(ranges);
                let mut values = array
                    .async_retrieve_array_subset_elements::<f32>(&subset)
                    .await
                    .map_err(FetchError::zarr)?;
                packing.decode_in_place(&mut values);
                values
            }
            _ => packing.decode(read_subset(&array, &meta.name, ranges).await?),
        };
        let shape: Vec<usize> = ranges.iter().map(|r| (r.end - r.start) as usize).collect();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values)?;

        let mut var = Variable::new(meta.dims.clone(), data)?;
        var.attrs = CfPacking::strip(meta.attrs.clone());
        Ok(var)
    }

    async fn coordinate(&self, name: &str) -> Result<Variable> {
        if let Some(var) = self.coord_cache.read().await.get(name) {
            return Ok(var.clone());
        }
        let meta = self
            .metadata
            .arrays
            .get(name)
            .ok_or_else(|| FetchError::zarr(format!("coordinate '{name}' vanished")))?;
        let ranges: Vec<Range<u64>> = meta.shape.iter().map(|&n| 0..n).collect();
        let var = self.read_array(meta, &ranges).await?;
        self.coord_cache
            .write()
            .await
            .insert(name.to_string(), var.clone());
        Ok(var)
    }

    fn data_var_meta(&self, variable: &str) -> Option<&ArrayMetadata> {
        self.metadata
            .arrays
            .get(variable)
            .filter(|m| m.name != self.time_dim && m.dims.first() == Some(&self.time_dim))
    }
}

#[async_trait]
impl DatasetSource for ZarrDataset {
    fn describe(&self) -> String {
        self.location.clone()
    }

    fn variables(&self) -> Vec<String> {
        self.metadata
            .arrays
            .values()
            .filter(|m| m.name != self.time_dim && m.dims.first() == Some(&self.time_dim))
            .map(|m| m.name.clone())
            .collect()
    }

    fn time_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        Some((*self.times.first()?, *self.times.last()?))
    }

    async fn select(&self, variable: &str, range: TimeRange) -> Result<Dataset> {
        let meta = self
            .data_var_meta(variable)
            .ok_or_else(|| FetchError::VariableNotFound {
                var: variable.to_string(),
                available: self.variables(),
            })?;

        let window = time_window(&self.times, &range);
        let mut ds = Dataset::new(self.time_dim.clone(), self.times[window.clone()].to_vec());
        ds.time_units = Some(self.time_units.clone());
        ds.attrs = self.metadata.attrs.clone();

        let var = if window.is_empty() {
            let mut shape: Vec<usize> = meta.shape.iter().map(|&n| n as usize).collect();
            shape[0] = 0;
            let mut var = Variable::new(meta.dims.clone(), ArrayD::zeros(IxDyn(&shape)))?;
            var.attrs = CfPacking::strip(meta.attrs.clone());
            var
        } else {
            let mut ranges: Vec<Range<u64>> = meta.shape.iter().map(|&n| 0..n).collect();
            ranges[0] = window.start as u64..window.end as u64;
            debug!(variable, steps = window.len(), "reading zarr subset");
            self.read_array(meta, &ranges).await?
        };
        ds.insert_data_var(variable, var)?;

        for name in self.metadata.coordinates_for(meta, &self.time_dim) {
            let coord = self.coordinate(&name).await?;
            ds.insert_coord(&name, coord)?;
        }
        Ok(ds)
    }
}
