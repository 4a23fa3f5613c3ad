//! Catalog authentication: SAS signing and the two ways of applying it
//!
//! Collections are signed by attaching a short-lived SAS token to every blob
//! asset. [`ModifierAuth`] signs as part of the catalog query, while
//! [`PostSignAuth`] queries anonymously and signs afterwards. Which one is used
//! is decided once, at startup, by [`select_auth`].

use super::{Asset, CatalogClient, Collection, CollectionModifier};
use crate::errors::{FetchError, Result};
use crate::zarr_io::StoreLocation;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Header carrying the Planetary Computer subscription key
pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Tokens this close to expiry are refreshed
const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// How catalog results get signed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Modifier when a subscription key is available, post-sign otherwise
    #[default]
    Auto,
    Modifier,
    PostSign,
}

/// SAS token as returned by the token service
#[derive(Debug, Clone, Deserialize)]
pub struct SasToken {
    pub token: String,
    #[serde(rename = "msft:expiry")]
    pub expiry: Option<DateTime<Utc>>,
}

impl SasToken {
    fn is_fresh(&self) -> bool {
        self.expiry
            .map_or(true, |e| e - Duration::minutes(EXPIRY_MARGIN_MINUTES) > Utc::now())
    }
}

/// Fetches and caches SAS tokens, and writes them into assets
pub struct SasSigner {
    http: reqwest::Client,
    sas_url: String,
    subscription_key: Option<String>,
    cache: Mutex<HashMap<(String, String), SasToken>>,
}

impl SasSigner {
    pub fn new(http: reqwest::Client, sas_url: &str, subscription_key: Option<String>) -> Self {
        Self {
            http,
            sas_url: sas_url.trim_end_matches('/').to_string(),
            subscription_key,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscription_key(&self) -> Option<&str> {
        self.subscription_key.as_deref()
    }

    fn with_key(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.subscription_key {
            Some(key) => request.header(SUBSCRIPTION_KEY_HEADER, key),
            None => request,
        }
    }

    /// Token for a storage container, from cache while still valid.
    pub async fn token(&self, account: &str, container: &str) -> Result<String> {
        let key = (account.to_string(), container.to_string());
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.get(&key).filter(|t| t.is_fresh()) {
            return Ok(token.token.clone());
        }

        let url = format!("{}/token/{account}/{container}", self.sas_url);
        debug!(%url, "requesting SAS token");
        let response = self
            .with_key(self.http.get(&url))
            .send()
            .await
            .map_err(|e| FetchError::AuthError(format!("token request for {account}/{container}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::AuthError(format!(
                "token service answered {status} for {account}/{container}"
            )));
        }
        let token: SasToken = response
            .json()
            .await
            .map_err(|e| FetchError::AuthError(format!("malformed token response: {e}")))?;
        let value = token.token.clone();
        cache.insert(key, token);
        Ok(value)
    }

    /// Attach a token to a blob asset; other assets are left untouched.
    pub async fn sign_asset(&self, asset: &mut Asset) -> Result<()> {
        let location = match StoreLocation::parse(&asset.href, &asset.storage_options) {
            Ok(location) => location,
            Err(e) => {
                debug!(href = %asset.href, error = %e, "not signing asset");
                return Ok(());
            }
        };
        let Some((account, container)) = location.azure_container() else {
            return Ok(());
        };
        let token = self.token(account, container).await?;

        if asset.href.starts_with("https://") {
            let separator = if asset.href.contains('?') { '&' } else { '?' };
            asset.href = format!("{}{separator}{token}", asset.href);
        } else {
            asset
                .storage_options
                .insert("credential".to_string(), token.into());
        }
        Ok(())
    }

    pub async fn sign_collection(&self, collection: &mut Collection) -> Result<()> {
        for asset in collection.assets.values_mut() {
            self.sign_asset(asset).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CollectionModifier for SasSigner {
    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        self.with_key(request)
    }

    async fn modify(&self, collection: &mut Collection) -> Result<()> {
        self.sign_collection(collection).await
    }
}

/// Produces signed collections
#[async_trait]
pub trait CatalogAuth: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open_collection(&self, client: &CatalogClient, id: &str) -> Result<Collection>;
}

/// Signs through a modifier installed on the catalog client
pub struct ModifierAuth {
    signer: Arc<SasSigner>,
}

impl ModifierAuth {
    pub fn new(signer: Arc<SasSigner>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl CatalogAuth for ModifierAuth {
    fn name(&self) -> &'static str {
        "modifier"
    }

    async fn open_collection(&self, client: &CatalogClient, id: &str) -> Result<Collection> {
        client
            .clone()
            .with_modifier(self.signer.clone())
            .get_collection(id)
            .await
    }
}

/// Queries anonymously, then signs the result
pub struct PostSignAuth {
    signer: Arc<SasSigner>,
}

impl PostSignAuth {
    pub fn new(signer: Arc<SasSigner>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl CatalogAuth for PostSignAuth {
    fn name(&self) -> &'static str {
        "post-sign"
    }

    async fn open_collection(&self, client: &CatalogClient, id: &str) -> Result<Collection> {
        let mut collection = client.get_collection(id).await?;
        self.signer.sign_collection(&mut collection).await?;
        Ok(collection)
    }
}

/// Pick the auth shape for this run.
pub fn select_auth(mode: AuthMode, signer: Arc<SasSigner>) -> Box<dyn CatalogAuth> {
    let use_modifier = match mode {
        AuthMode::Modifier => true,
        AuthMode::PostSign => false,
        AuthMode::Auto => signer.subscription_key().is_some(),
    };
    if use_modifier {
        Box::new(ModifierAuth::new(signer))
    } else {
        Box::new(PostSignAuth::new(signer))
    }
}
