mod common;

use common::{requests_matching, serve, write_zarr_store, zarr_times, Route};
use reanalysis_fetch::calendar::month_bounds;
use reanalysis_fetch::catalog::auth::{AuthMode, CatalogAuth, ModifierAuth, PostSignAuth, SasSigner};
use reanalysis_fetch::catalog::{resolve_dataset, Asset, CatalogClient};
use reanalysis_fetch::config::CatalogConfig;
use reanalysis_fetch::data_source::DatasetSource;
use reanalysis_fetch::errors::FetchError;
use serde_json::json;
use std::sync::Arc;

const TOKEN: &str = "st=2024-01-01&se=2099-01-01&sig=abc";

fn collection_document() -> serde_json::Value {
    json!({
        "id": "conus404",
        "title": "CONUS404",
        "assets": {
            "zarr-abfs": {
                "href": "abfs://hytest/conus404/conus404_hourly.zarr",
                "type": "application/vnd+zarr",
                "roles": ["data", "zarr", "abfs"],
                "xarray:storage_options": {"account_name": "hytestuswest"},
                "xarray:open_kwargs": {"consolidated": true}
            },
            "zarr-https": {
                "href": "https://hytestuswest.blob.core.windows.net/hytest/conus404/conus404_hourly.zarr",
                "type": "application/vnd+zarr",
                "roles": ["data", "zarr", "https"]
            },
            "thumbnail": {
                "href": "https://example.org/conus404.png",
                "type": "image/png"
            }
        }
    })
}

fn routes() -> Vec<Route> {
    vec![
        Route::json("GET", "/stac/collections/conus404", collection_document()),
        Route::json(
            "GET",
            "/sas/token/hytestuswest/hytest",
            json!({"token": TOKEN, "msft:expiry": "2099-01-01T00:00:00Z"}),
        ),
    ]
}

fn signer(base: &str, key: Option<&str>) -> Arc<SasSigner> {
    Arc::new(SasSigner::new(
        reqwest::Client::new(),
        &format!("{base}/sas"),
        key.map(str::to_string),
    ))
}

#[tokio::test]
async fn modifier_auth_signs_while_fetching() {
    let (base, log) = serve(|_| routes()).await;
    let client = CatalogClient::new(reqwest::Client::new(), &format!("{base}/stac"));
    let auth = ModifierAuth::new(signer(&base, Some("my-key")));

    let collection = auth
        .open_collection(&client, "conus404")
        .await
        .expect("signed collection");

    let abfs = &collection.assets["zarr-abfs"];
    assert_eq!(abfs.storage_options["credential"], TOKEN);
    assert_eq!(abfs.href, "abfs://hytest/conus404/conus404_hourly.zarr");
    let https = &collection.assets["zarr-https"];
    assert!(https.href.ends_with(&format!("conus404_hourly.zarr?{TOKEN}")));
    assert_eq!(collection.assets["thumbnail"].href, "https://example.org/conus404.png");

    // one token per container, reused from cache
    assert_eq!(requests_matching(&log, "/sas/token/").len(), 1);
    let fetch = requests_matching(&log, "/stac/collections/conus404");
    assert_eq!(fetch.len(), 1);
    assert!(fetch[0].to_lowercase().contains("ocp-apim-subscription-key: my-key"));
}

#[tokio::test]
async fn post_sign_auth_fetches_then_signs() {
    let (base, log) = serve(|_| routes()).await;
    let client = CatalogClient::new(reqwest::Client::new(), &format!("{base}/stac"));
    let auth = PostSignAuth::new(signer(&base, None));

    let collection = auth
        .open_collection(&client, "conus404")
        .await
        .expect("signed collection");
    assert_eq!(collection.assets["zarr-abfs"].storage_options["credential"], TOKEN);
    let preference = vec!["zarr-abfs".to_string(), "zarr-https".to_string()];
    let (backend, _) = collection.choose_backend(&preference).expect("backend");
    assert_eq!(backend, "zarr-abfs");
    assert_eq!(requests_matching(&log, "/sas/token/").len(), 1);
}

#[tokio::test]
async fn unknown_collection_is_reported() {
    let (base, _) = serve(|_| routes()).await;
    let client = CatalogClient::new(reqwest::Client::new(), &format!("{base}/stac"));
    match client.get_collection("missing").await {
        Err(e @ FetchError::CollectionNotFound(_)) => assert!(e.is_fatal()),
        other => panic!("unexpected result: {:?}", other.map(|c| c.id)),
    }
}

#[tokio::test]
async fn token_service_failure_is_an_auth_error() {
    let (base, _) = serve(|_| {
        vec![
            Route::json("GET", "/stac/collections/conus404", collection_document()),
            Route::new("GET", "/sas/token/hytestuswest/hytest", 401, "{}"),
        ]
    })
    .await;
    let client = CatalogClient::new(reqwest::Client::new(), &format!("{base}/stac"));
    let auth = PostSignAuth::new(signer(&base, None));
    assert!(matches!(
        auth.open_collection(&client, "conus404").await,
        Err(FetchError::AuthError(_))
    ));
}

#[tokio::test]
async fn blob_href_keeps_its_existing_query() {
    let (base, log) = serve(|_| routes()).await;
    let signer = signer(&base, None);
    let href = "https://hytestuswest.blob.core.windows.net/hytest/conus404/conus404_hourly.zarr?versionid=7";
    let mut asset: Asset = serde_json::from_value(json!({ "href": href })).expect("asset");

    signer.sign_asset(&mut asset).await.expect("signed asset");
    assert_eq!(asset.href, format!("{href}&{TOKEN}"));
    assert!(asset.storage_options.is_empty());
    assert_eq!(requests_matching(&log, "/sas/token/hytestuswest/hytest").len(), 1);
}

#[tokio::test]
async fn resolves_the_preferred_backend_into_a_dataset() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = dir.path().join("conus404_hourly.zarr");
    write_zarr_store(&store);
    let href = store.to_string_lossy().to_string();

    let (base, log) = serve(move |_| {
        let mut routes = routes();
        routes.insert(0, Route::json(
            "GET",
            "/stac/collections/conus404",
            json!({
                "id": "conus404",
                "assets": {
                    "zarr-local": {"href": href, "roles": ["data", "zarr"]},
                    "zarr-https": {
                        "href": "https://hytestuswest.blob.core.windows.net/hytest/conus404/conus404_hourly.zarr",
                        "roles": ["data", "zarr", "https"]
                    }
                }
            }),
        ));
        routes
    })
    .await;
    let config = CatalogConfig {
        url: format!("{base}/stac"),
        collection: "conus404".to_string(),
        backends: vec!["zarr-abfs".to_string(), "zarr-local".to_string()],
        auth: AuthMode::Modifier,
        sas_url: format!("{base}/sas"),
        subscription_key: Some("my-key".to_string()),
    };

    let resolved = resolve_dataset(&config).await.expect("resolved dataset");
    let times = zarr_times();
    assert_eq!(resolved.collection, "conus404");
    assert_eq!(resolved.backend, "zarr-local");
    assert_eq!(resolved.variables, vec!["Q2".to_string(), "T2".to_string()]);
    assert_eq!(resolved.time_range, Some((times[0], times[15])));

    let february = resolved
        .handle
        .select("T2", month_bounds(1988, 2).expect("month"))
        .await
        .expect("Failed to select February");
    assert_eq!(february.times.len(), 8);
    // the https asset was signed although the local one was chosen
    assert_eq!(requests_matching(&log, "/sas/token/hytestuswest/hytest").len(), 1);
}

#[tokio::test]
async fn resolution_failures_are_fatal() {
    let (base, _) = serve(|_| routes()).await;
    let config = CatalogConfig {
        url: format!("{base}/stac"),
        collection: "missing".to_string(),
        auth: AuthMode::PostSign,
        sas_url: format!("{base}/sas"),
        ..CatalogConfig::default()
    };
    match resolve_dataset(&config).await {
        Err(e @ FetchError::Setup(_)) => assert!(e.is_fatal()),
        Err(other) => panic!("unexpected error {other}"),
        Ok(resolved) => panic!("resolved {}", resolved.collection),
    }
}
