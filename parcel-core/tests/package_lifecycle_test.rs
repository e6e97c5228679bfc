//! Package lifecycle integration tests
//!
//! Exercise the repository, cache and reconciler together against the
//! in-memory remote store and a file-backed SQLite cache.

use chrono::{Duration, Utc};
use parcel_core::model::collections::PACKAGES;
use parcel_core::{
    ClientConfig, LocalCache, MemoryRemoteStore, Package, PackageRepository, PackageStatus, Reconciler,
    RemoteError, RemoteOp, RepositoryError, StaticConnectivity,
};
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    remote: Arc<MemoryRemoteStore>,
    cache: Arc<LocalCache>,
    connectivity: Arc<StaticConnectivity>,
    packages: PackageRepository,
    reconciler: Reconciler,
}

fn harness(dir: &TempDir) -> Harness {
    let config = ClientConfig {
        cache_path: dir.path().join("cache.sqlite"),
        ..ClientConfig::default()
    };
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = Arc::new(LocalCache::open(&config.cache_path).unwrap());
    let connectivity = Arc::new(StaticConnectivity::online());
    Harness {
        packages: PackageRepository::new(remote.clone(), cache.clone(), connectivity.clone(), &config),
        reconciler: Reconciler::new(remote.clone(), cache.clone(), connectivity.clone(), &config),
        remote,
        cache,
        connectivity,
    }
}

fn parcel(user_id: &str) -> Package {
    Package::new(
        user_id,
        "Ada Sender",
        "Grace Recipient",
        "1 Harbour Road, Portsmouth",
        "+44 20 7946 0000",
        2.5,
        Utc::now() + Duration::days(3),
    )
}

#[tokio::test]
async fn test_full_lifecycle() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);

    let id = h.packages.create(parcel("u1")).await.unwrap();
    let created = h.packages.get_by_id(&id).await.unwrap();
    assert_eq!(created.status, PackageStatus::Pending);
    assert!(created.delivered_at.is_none());

    let moving = h.packages.update_status(&id, PackageStatus::InTransit).await.unwrap();
    assert_eq!(moving.status, PackageStatus::InTransit);

    let delivered = h.packages.mark_delivered(&id).await.unwrap();
    assert_eq!(delivered.status, PackageStatus::Delivered);
    assert!(delivered.delivered_at.is_some());

    let err = h.packages.update_status(&id, PackageStatus::Cancelled).await.unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidTransition { .. }));

    h.packages.delete(&id).await.unwrap();
    let err = h.packages.get_by_id(&id).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.remote.document_count(PACKAGES).await, 0);
}

#[tokio::test]
async fn test_failed_write_is_pushed_by_reconciler() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);

    let id = h.packages.create(parcel("u1")).await.unwrap();
    h.remote
        .fail_next(RemoteOp::Update, RemoteError::Transport("connection reset".to_string()));

    let err = h.packages.update_status(&id, PackageStatus::InTransit).await.unwrap_err();
    assert!(matches!(err, RepositoryError::RemoteFailure(_)));
    assert_eq!(h.cache.stats().unwrap().dirty_packages, 1);

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(report.is_clean());
    assert_eq!(h.cache.stats().unwrap().dirty_packages, 0);

    let stored = h.packages.get_by_id(&id).await.unwrap();
    assert_eq!(stored.status, PackageStatus::InTransit);
}

#[tokio::test]
async fn test_cached_copy_survives_restart_while_offline() {
    let dir = TempDir::new().unwrap();
    let tracking_number;
    let id;
    {
        let h = harness(&dir);
        let package = parcel("u1");
        tracking_number = package.tracking_number.clone();
        id = h.packages.create(package).await.unwrap();
    }

    let h = harness(&dir);
    h.connectivity.set_online(false);

    let by_number = h.packages.get_by_tracking_number(&tracking_number).await.unwrap();
    assert_eq!(by_number.id, id);

    let err = h.packages.get_all().await.unwrap_err();
    assert!(err.is_offline());
    let err = h.packages.create(parcel("u1")).await.unwrap_err();
    assert!(err.is_offline());
    assert_eq!(h.remote.call_count(RemoteOp::Create), 0);
}

#[tokio::test]
async fn test_listing_by_user_is_newest_first() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);

    let first = h.packages.create(parcel("u1")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = h.packages.create(parcel("u1")).await.unwrap();
    h.packages.create(parcel("u2")).await.unwrap();

    let mine = h.packages.get_by_user("u1").await.unwrap();
    let ids: Vec<_> = mine.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec![second.as_str(), first.as_str()]);

    assert_eq!(h.packages.get_all().await.unwrap().len(), 3);
}
