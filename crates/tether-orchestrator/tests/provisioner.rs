//! Binary provisioner integration tests
//!
//! Serves a release index from an axum mock and checks how the provisioner
//! picks releases and reuses cached binaries.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use tether_core::config::BinaryConfig;
use tether_core::error::ProvisionError;
use tether_orchestrator::binary::{executable_name, BinaryProvisioner};

const TARGET: &str = "x86_64-unknown-linux-gnu";

struct Mock {
    index: Value,
    index_hits: AtomicUsize,
}

async fn releases(State(mock): State<Arc<Mock>>) -> Json<Value> {
    mock.index_hits.fetch_add(1, Ordering::SeqCst);
    Json(mock.index.clone())
}

async fn serve(index: Value) -> (SocketAddr, Arc<Mock>) {
    let mock = Arc::new(Mock {
        index,
        index_hits: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/releases", get(releases))
        .route("/download/missing.zip", get(|| async { StatusCode::NOT_FOUND }))
        .with_state(Arc::clone(&mock));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, mock)
}

fn provisioner(cache_dir: &Path, addr: SocketAddr, ttl: Duration) -> BinaryProvisioner {
    let config = BinaryConfig {
        cache_dir: cache_dir.to_path_buf(),
        cache_ttl: ttl,
        release_index_url: format!("http://{}/releases", addr),
        ..BinaryConfig::default()
    };
    BinaryProvisioner::new(&config).unwrap().with_target(TARGET)
}

fn platform_asset(download_url: &str) -> Value {
    json!({
        "name": format!("convex-local-backend-{}.zip", TARGET),
        "browser_download_url": download_url,
    })
}

fn write_aged(path: &Path, age: Duration) {
    std::fs::write(path, b"binary").unwrap();
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - age)
        .unwrap();
}

fn age_of(path: &Path) -> Duration {
    SystemTime::now()
        .duration_since(std::fs::metadata(path).unwrap().modified().unwrap())
        .unwrap_or(Duration::ZERO)
}

#[tokio::test]
async fn test_fresh_cache_makes_no_requests() {
    let (addr, mock) = serve(json!([])).await;
    let cache = TempDir::new().unwrap();
    let provisioner = provisioner(cache.path(), addr, Duration::from_secs(7 * 24 * 3600));
    let cached = provisioner.versioned_path("precompiled-2024-06-01");
    write_aged(&cached, Duration::from_secs(3600));

    assert_eq!(provisioner.resolve().await.unwrap(), cached);
    assert_eq!(mock.index_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_asset_is_asset_not_found() {
    let index = json!([
        { "tag_name": "v2", "assets": [{ "name": "convex-local-backend-aarch64-apple-darwin.zip", "browser_download_url": "http://unused" }] },
        { "tag_name": "v1", "assets": [] },
    ]);
    let (addr, mock) = serve(index).await;
    let cache = TempDir::new().unwrap();

    let err = provisioner(cache.path(), addr, Duration::ZERO)
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::AssetNotFound(ref target) if target == TARGET));
    assert_eq!(mock.index_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_index_is_asset_not_found() {
    let (addr, _) = serve(json!([])).await;
    let cache = TempDir::new().unwrap();

    let err = provisioner(cache.path(), addr, Duration::ZERO)
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::AssetNotFound(_)));
}

#[tokio::test]
async fn test_stale_cache_with_current_release_is_touched() {
    let index = json!([
        { "tag_name": "precompiled-2024-06-01", "assets": [platform_asset("http://unused/backend.zip")] },
    ]);
    let (addr, mock) = serve(index).await;
    let cache = TempDir::new().unwrap();
    let provisioner = provisioner(cache.path(), addr, Duration::from_secs(24 * 3600));
    let cached = provisioner.versioned_path("precompiled-2024-06-01");
    write_aged(&cached, Duration::from_secs(30 * 24 * 3600));

    assert_eq!(provisioner.resolve().await.unwrap(), cached);
    assert_eq!(mock.index_hits.load(Ordering::SeqCst), 1);
    assert!(age_of(&cached) < Duration::from_secs(60));

    // Touched binary is fresh again
    assert_eq!(provisioner.resolve().await.unwrap(), cached);
    assert_eq!(mock.index_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_download_is_download_failed() {
    let (download_addr, _) = serve(json!([])).await;
    let download_url = format!("http://{}/download/missing.zip", download_addr);
    let (addr, _) = serve(json!([
        { "tag_name": "v9", "assets": [platform_asset(&download_url)] },
    ]))
    .await;
    let cache = TempDir::new().unwrap();

    let err = provisioner(cache.path(), addr, Duration::ZERO)
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::DownloadFailed(_)));
    assert!(!cache.path().join(executable_name("convex-local-backend-v9")).exists());
}
