//! STAC catalog access and remote dataset resolution
//!
//! Resolution is one-shot and happens before any download is scheduled:
//! fetch the collection (signed, see [`auth`]), pick the first storage backend
//! offered from an ordered preference list, and open a lazy Zarr handle on it.
//! Every failure here is fatal for the run.

pub mod auth;

use crate::config::CatalogConfig;
use crate::data_source::SharedSource;
use crate::errors::{FetchError, Result};
use crate::zarr_io::{StoreLocation, ZarrDataset};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use auth::{select_auth, CatalogAuth, SasSigner};

/// A STAC collection asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub href: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "xarray:storage_options", default)]
    pub storage_options: Map<String, JsonValue>,
    #[serde(rename = "xarray:open_kwargs", default)]
    pub open_kwargs: Map<String, JsonValue>,
}

/// The parts of a STAC collection the resolver uses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,
}

impl Collection {
    /// First asset key of `preference` the collection offers.
    pub fn choose_backend(&self, preference: &[String]) -> Result<(&str, &Asset)> {
        preference
            .iter()
            .find_map(|key| self.assets.get_key_value(key))
            .map(|(key, asset)| (key.as_str(), asset))
            .ok_or_else(|| FetchError::NoBackend {
                collection: self.id.clone(),
                tried: preference.to_vec(),
                available: self.assets.keys().cloned().collect(),
            })
    }
}

/// Hook run around catalog requests
#[async_trait]
pub trait CollectionModifier: Send + Sync {
    /// Adjust an outgoing request (headers, query)
    fn decorate(&self, request: RequestBuilder) -> RequestBuilder;

    /// Adjust a collection as it is decoded
    async fn modify(&self, collection: &mut Collection) -> Result<()>;
}

/// Minimal STAC API client
#[derive(Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    root: String,
    modifier: Option<Arc<dyn CollectionModifier>>,
}

impl CatalogClient {
    pub fn new(http: reqwest::Client, root: &str) -> Self {
        Self {
            http,
            root: root.trim_end_matches('/').to_string(),
            modifier: None,
        }
    }

    pub fn with_modifier(mut self, modifier: Arc<dyn CollectionModifier>) -> Self {
        self.modifier = Some(modifier);
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// `GET {root}/collections/{id}`
    pub async fn get_collection(&self, id: &str) -> Result<Collection> {
        let url = format!("{}/collections/{id}", self.root);
        let mut request = self.http.get(&url);
        if let Some(modifier) = &self.modifier {
            request = modifier.decorate(request);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::CatalogError(format!("{url}: {e}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(FetchError::CollectionNotFound(id.to_string())),
            status if !status.is_success() => {
                return Err(FetchError::CatalogError(format!("{url} answered {status}")))
            }
            _ => {}
        }

        let mut collection: Collection = response
            .json()
            .await
            .map_err(|e| FetchError::CatalogError(format!("malformed collection '{id}': {e}")))?;
        if let Some(modifier) = &self.modifier {
            modifier.modify(&mut collection).await?;
        }
        Ok(collection)
    }
}

/// An opened remote dataset
pub struct ResolvedDataset {
    pub handle: SharedSource,
    pub collection: String,
    pub backend: String,
    pub variables: Vec<String>,
    pub time_range: Option<(NaiveDateTime, NaiveDateTime)>,
}

/// Fetch a signed collection with `auth` and open its preferred backend.
pub async fn resolve(
    client: &CatalogClient,
    auth: &dyn CatalogAuth,
    collection_id: &str,
    backends: &[String],
) -> Result<ResolvedDataset> {
    let collection = auth.open_collection(client, collection_id).await?;
    let (backend, asset) = collection.choose_backend(backends)?;
    info!(
        collection = collection_id,
        backend,
        auth = auth.name(),
        "resolved storage backend"
    );

    let location = StoreLocation::parse(&asset.href, &asset.storage_options)?;
    let dataset = ZarrDataset::open(&location).await?;
    let handle: SharedSource = Arc::new(dataset);

    Ok(ResolvedDataset {
        variables: handle.variables(),
        time_range: handle.time_range(),
        handle,
        collection: collection.id.clone(),
        backend: backend.to_string(),
    })
}

/// Resolve the configured collection. Every failure is a setup error.
pub async fn resolve_dataset(config: &CatalogConfig) -> Result<ResolvedDataset> {
    resolve_configured(config).await.map_err(FetchError::setup)
}

async fn resolve_configured(config: &CatalogConfig) -> Result<ResolvedDataset> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("reanalysis-fetch/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let signer = Arc::new(SasSigner::new(
        http.clone(),
        &config.sas_url,
        config.resolved_subscription_key(),
    ));
    let auth = select_auth(config.auth, signer);
    let client = CatalogClient::new(http, &config.url);
    resolve(&client, auth.as_ref(), &config.collection, &config.backends).await
}
