//! Package repository
//!
//! Reconciles the local cache with the remote store for packages and
//! enforces status transition rules before anything is written.
//!
//! Writes to existing packages are staged in the cache as dirty before the
//! remote call and marked clean once the remote store confirms them. A failed
//! remote write is reported to the caller and left dirty for the
//! [`Reconciler`](crate::sync::Reconciler) to push later.
//!
//! No locking is done across operations: two concurrent status updates on the
//! same package race at the remote store and the last write wins.

use crate::cache::{CacheResult, Cached, LocalCache};
use crate::config::ClientConfig;
use crate::connectivity::Connectivity;
use crate::error::{RepositoryError, Result};
use crate::model::collections::PACKAGES;
use crate::model::{Package, PackageStatus, fields};
use crate::remote::{Document, Fields, RemoteError, RemoteStore, decode, encode, with_timeout};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct PackageRepository {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    connectivity: Arc<dyn Connectivity>,
    timeout: Duration,
}

impl PackageRepository {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<LocalCache>,
        connectivity: Arc<dyn Connectivity>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            remote,
            cache,
            connectivity,
            timeout: config.request_timeout(),
        }
    }

    /// Create a package and return its remote-assigned id.
    ///
    /// The package always starts pending with `createdAt` set to now.
    pub async fn create(&self, mut package: Package) -> Result<String> {
        self.ensure_online("create package")?;

        package.status = PackageStatus::Pending;
        package.delivered_at = None;
        package.created_at = Utc::now();
        package.validate().map_err(RepositoryError::Validation)?;

        let taken = with_timeout(
            self.timeout,
            self.remote
                .query(PACKAGES, fields::TRACKING_NUMBER, &json!(package.tracking_number)),
        )
        .await?;
        if !taken.is_empty() {
            return Err(RepositoryError::Validation(format!(
                "tracking number {} is already in use",
                package.tracking_number
            )));
        }

        let id = with_timeout(self.timeout, self.remote.create(PACKAGES)).await?;
        package.id = id.clone();
        let body = encode(&package)?;

        if let Err(e) = with_timeout(self.timeout, self.remote.set(PACKAGES, &id, body)).await {
            if let Err(cleanup) = with_timeout(self.timeout, self.remote.delete(PACKAGES, &id)).await {
                warn!("Failed to remove placeholder package {}: {}", id, cleanup);
            }
            return Err(e.into());
        }

        if let Err(e) = self.cache.put(&package, false) {
            warn!("Created package {} but could not cache it: {}", id, e);
        }
        info!("Created package {} ({})", id, package.tracking_number);
        Ok(id)
    }

    /// Overwrite an existing package.
    ///
    /// `trackingNumber`, `priority` and `createdAt` are fixed at creation, and
    /// a status change must be a legal transition from the current status.
    pub async fn update(&self, package: Package) -> Result<()> {
        self.ensure_online("update package")?;
        if package.id.is_empty() {
            return Err(RepositoryError::Validation("package id is required".to_string()));
        }
        package.validate().map_err(RepositoryError::Validation)?;

        let current = self.fetch_by_id(&package.id).await?;
        if package.tracking_number != current.tracking_number {
            return Err(RepositoryError::Validation("tracking number cannot be changed".to_string()));
        }
        if package.priority != current.priority {
            return Err(RepositoryError::Validation("priority cannot be changed".to_string()));
        }
        if package.created_at != current.created_at {
            return Err(RepositoryError::Validation("creation time cannot be changed".to_string()));
        }
        if package.status != current.status && !current.status.can_transition_to(package.status) {
            return Err(RepositoryError::InvalidTransition {
                from: current.status,
                to: package.status,
            });
        }

        let body = encode(&package)?;
        self.write_through(&package, body).await?;
        info!("Updated package {}", package.id);
        Ok(())
    }

    /// Delete a package remotely and locally. Deleting a missing package succeeds.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.ensure_online("delete package")?;

        match with_timeout(self.timeout, self.remote.delete(PACKAGES, id)).await {
            Ok(()) | Err(RemoteError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.cache.remove::<Package>(id) {
            warn!("Deleted package {} but could not drop it from cache: {}", id, e);
        }
        info!("Deleted package {}", id);
        Ok(())
    }

    /// All packages, most recent first.
    pub async fn get_all(&self) -> Result<Vec<Package>> {
        self.ensure_online("list packages")?;
        let docs = with_timeout(self.timeout, self.remote.list(PACKAGES)).await?;
        self.collect(docs)
    }

    /// Packages owned by `user_id`, most recent first.
    pub async fn get_by_user(&self, user_id: &str) -> Result<Vec<Package>> {
        self.ensure_online("list user packages")?;
        let docs = with_timeout(
            self.timeout,
            self.remote.query(PACKAGES, fields::USER_ID, &json!(user_id)),
        )
        .await?;
        self.collect(docs)
    }

    /// Look a package up by id. Offline, the cached copy is served if there is one.
    pub async fn get_by_id(&self, id: &str) -> Result<Package> {
        if !self.connectivity.is_online() {
            return self.cached_while_offline(self.cache.get::<Package>(id));
        }
        self.fetch_by_id(id).await
    }

    /// Look a package up by tracking number. Offline, the cached copy is served if there is one.
    pub async fn get_by_tracking_number(&self, tracking_number: &str) -> Result<Package> {
        if !self.connectivity.is_online() {
            return self.cached_while_offline(self.cache.find::<Package>(tracking_number));
        }

        let docs = with_timeout(
            self.timeout,
            self.remote
                .query(PACKAGES, fields::TRACKING_NUMBER, &json!(tracking_number)),
        )
        .await?;
        if docs.len() > 1 {
            warn!("Tracking number {} matches {} packages", tracking_number, docs.len());
        }
        match docs.into_iter().next() {
            Some(doc) => Ok(self.mirror(decode(doc)?)),
            None => Err(RepositoryError::not_found("tracking number", tracking_number)),
        }
    }

    /// Move a package to `status` if the transition is legal.
    ///
    /// Moving to delivered also stamps `deliveredAt`, exactly like
    /// [`mark_delivered`](Self::mark_delivered).
    pub async fn update_status(&self, id: &str, status: PackageStatus) -> Result<Package> {
        self.ensure_online("update package status")?;

        let current = self.fetch_by_id(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(RepositoryError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }
        if status == PackageStatus::Delivered {
            return self.deliver(current).await;
        }

        let from = current.status;
        let mut updated = current;
        updated.status = status;

        let mut patch = Fields::new();
        patch.insert(fields::STATUS.to_string(), json!(status));
        self.write_through(&updated, patch).await?;

        info!("Package {} moved from {} to {}", id, from, status);
        Ok(updated)
    }

    /// Mark a package delivered, setting status and `deliveredAt` in one write.
    pub async fn mark_delivered(&self, id: &str) -> Result<Package> {
        self.ensure_online("mark package delivered")?;

        let current = self.fetch_by_id(id).await?;
        if !current.status.can_transition_to(PackageStatus::Delivered) {
            return Err(RepositoryError::InvalidTransition {
                from: current.status,
                to: PackageStatus::Delivered,
            });
        }
        self.deliver(current).await
    }

    async fn deliver(&self, current: Package) -> Result<Package> {
        let now = Utc::now();
        let mut updated = current;
        updated.status = PackageStatus::Delivered;
        updated.delivered_at = Some(now);

        let mut patch = Fields::new();
        patch.insert(fields::STATUS.to_string(), json!(PackageStatus::Delivered));
        patch.insert(fields::DELIVERED_AT.to_string(), json!(now));
        self.write_through(&updated, patch).await?;

        info!("Package {} delivered at {}", updated.id, now);
        Ok(updated)
    }

    /// Remote copy of `id` folded through the cache, so a pending local write
    /// shows through. Callers have already checked connectivity.
    async fn fetch_by_id(&self, id: &str) -> Result<Package> {
        let doc = with_timeout(self.timeout, self.remote.get(PACKAGES, id)).await?;
        match doc {
            Some(doc) => Ok(self.mirror(decode(doc)?)),
            None => {
                self.forget(id);
                Err(RepositoryError::not_found(PACKAGES, id))
            }
        }
    }

    /// Stage `updated` as dirty, push it in a single remote update and clear
    /// the dirty flag once the remote store confirms.
    ///
    /// `patch` is sent as is unless an older unconfirmed write is pending, in
    /// which case the full record goes out so that write is not lost.
    async fn write_through(&self, updated: &Package, patch: Fields) -> Result<()> {
        let id = updated.id.as_str();
        let pending = matches!(self.cache.get::<Package>(id), Ok(Some(ref entry)) if entry.dirty);
        let body = if pending { encode(updated)? } else { patch };

        let staged = match self.cache.put(updated, true) {
            Ok(entry) => Some(entry.updated_at_millis),
            Err(e) => {
                warn!("Could not stage package {} in cache: {}", id, e);
                None
            }
        };

        match with_timeout(self.timeout, self.remote.update(PACKAGES, id, body)).await {
            Ok(()) => {
                if let Some(written_at) = staged {
                    if let Err(e) = self.cache.mark_clean::<Package>(id, written_at) {
                        warn!("Could not mark package {} clean: {}", id, e);
                    }
                }
                Ok(())
            }
            Err(RemoteError::NotFound { .. }) => {
                self.forget(id);
                Err(RepositoryError::not_found(PACKAGES, id))
            }
            Err(e) => {
                warn!("Remote write of package {} failed, left dirty: {}", id, e);
                Err(e.into())
            }
        }
    }

    fn collect(&self, docs: Vec<Document>) -> Result<Vec<Package>> {
        let mut packages = docs
            .into_iter()
            .map(|doc| decode::<Package>(doc).map(|pkg| self.mirror(pkg)))
            .collect::<std::result::Result<Vec<_>, RemoteError>>()?;
        packages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(packages)
    }

    /// Fold a remote copy into the cache; a dirty local copy wins.
    fn mirror(&self, remote: Package) -> Package {
        match self.cache.merge_remote(remote.clone()) {
            Ok(view) => view,
            Err(e) => {
                warn!("Could not mirror package {} into cache: {}", remote.id, e);
                remote
            }
        }
    }

    fn forget(&self, id: &str) {
        if let Err(e) = self.cache.remove::<Package>(id) {
            warn!("Could not drop package {} from cache: {}", id, e);
        }
    }

    fn cached_while_offline(&self, lookup: CacheResult<Option<Cached<Package>>>) -> Result<Package> {
        match lookup {
            Ok(Some(entry)) => {
                debug!("Offline, serving cached package {}", entry.record.id);
                Ok(entry.record)
            }
            Ok(None) => Err(RepositoryError::Offline),
            Err(e) => {
                warn!("Offline and cache lookup failed: {}", e);
                Err(RepositoryError::Offline)
            }
        }
    }

    fn ensure_online(&self, operation: &str) -> Result<()> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            debug!("Cannot {} while offline", operation);
            Err(RepositoryError::Offline)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::StaticConnectivity;
    use crate::memory::{MemoryRemoteStore, RemoteOp};
    use crate::model::Priority;
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingConnectivity {
        checks: AtomicUsize,
    }

    impl Connectivity for CountingConnectivity {
        fn is_online(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct Fixture {
        repo: PackageRepository,
        remote: Arc<MemoryRemoteStore>,
        cache: Arc<LocalCache>,
        net: Arc<StaticConnectivity>,
    }

    fn fixture_with(config: ClientConfig) -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = Arc::new(LocalCache::in_memory().unwrap());
        let net = Arc::new(StaticConnectivity::online());
        let repo = PackageRepository::new(remote.clone(), cache.clone(), net.clone(), &config);
        Fixture { repo, remote, cache, net }
    }

    fn fixture() -> Fixture {
        fixture_with(ClientConfig::default())
    }

    fn sample(user_id: &str, tracking: &str) -> Package {
        let mut pkg = Package::new(
            user_id,
            "Ada Sender",
            "Bo Recipient",
            "12 Harbour Rd",
            "555-0199",
            2.5,
            Utc::now() + ChronoDuration::days(3),
        );
        pkg.tracking_number = tracking.to_string();
        pkg
    }

    #[tokio::test]
    async fn test_create_offline_fails() {
        let f = fixture();
        f.net.set_online(false);
        let err = f.repo.create(sample("u1", "T1")).await.unwrap_err();
        assert!(err.is_offline());
        assert_eq!(f.remote.call_count(RemoteOp::Create), 0);
    }

    #[tokio::test]
    async fn test_create_then_get_returns_input() {
        let f = fixture();
        let input = sample("u1", "T1");
        let id = f.repo.create(input.clone()).await.unwrap();
        assert!(!id.is_empty());

        let stored = f.repo.get_by_id(&id).await.unwrap();
        let expected = Package {
            id: id.clone(),
            created_at: stored.created_at,
            ..input
        };
        assert_eq!(stored, expected);
        assert!(!f.cache.get::<Package>(&id).unwrap().unwrap().dirty);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_package() {
        let f = fixture();
        let mut pkg = sample("u1", "T1");
        pkg.weight = -1.0;
        let err = f.repo.create(pkg).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Validation(_)));
        assert_eq!(f.remote.call_count(RemoteOp::Create), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_tracking_number() {
        let f = fixture();
        f.repo.create(sample("u1", "T1")).await.unwrap();
        let err = f.repo.create(sample("u2", "T1")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Validation(_)));
        assert_eq!(f.remote.document_count(PACKAGES).await, 1);
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_placeholder() {
        let f = fixture();
        f.remote.fail_next(RemoteOp::Set, RemoteError::PermissionDenied("rules".into()));
        let err = f.repo.create(sample("u1", "T1")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::RemoteFailure(RemoteError::PermissionDenied(_))));
        assert_eq!(f.remote.document_count(PACKAGES).await, 0);
    }

    #[tokio::test]
    async fn test_update_missing_package_is_not_found() {
        let f = fixture();
        let mut pkg = sample("u1", "T1");
        pkg.id = "ghost".to_string();
        let err = f.repo.update(pkg).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(f.cache.get::<Package>("ghost").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_overwrites_record() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        let mut pkg = f.repo.get_by_id(&id).await.unwrap();
        pkg.notes = Some("fragile".into());
        f.repo.update(pkg).await.unwrap();

        let raw = f.remote.raw(PACKAGES, &id).await.unwrap();
        assert_eq!(raw["notes"], "fragile");
        assert!(!f.cache.get::<Package>(&id).unwrap().unwrap().dirty);
    }

    #[tokio::test]
    async fn test_update_keeps_tracking_number_fixed() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        f.repo.create(sample("u1", "T2")).await.unwrap();

        let mut pkg = f.repo.get_by_id(&id).await.unwrap();
        pkg.tracking_number = "T2".into();
        let err = f.repo.update(pkg).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Validation(_)));
        assert_eq!(f.remote.raw(PACKAGES, &id).await.unwrap()[fields::TRACKING_NUMBER], "T1");
    }

    #[tokio::test]
    async fn test_update_keeps_priority_and_created_at_fixed() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        let before = f.remote.call_count(RemoteOp::Update);

        let mut pkg = f.repo.get_by_id(&id).await.unwrap();
        pkg.priority = Priority::Urgent;
        assert!(matches!(f.repo.update(pkg).await.unwrap_err(), RepositoryError::Validation(_)));

        let mut pkg = f.repo.get_by_id(&id).await.unwrap();
        pkg.created_at -= ChronoDuration::days(1);
        assert!(matches!(f.repo.update(pkg).await.unwrap_err(), RepositoryError::Validation(_)));

        assert_eq!(f.remote.call_count(RemoteOp::Update), before);
        assert_eq!(f.repo.get_by_id(&id).await.unwrap().priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_update_cannot_reopen_delivered_package() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        f.repo.mark_delivered(&id).await.unwrap();

        let mut pkg = f.repo.get_by_id(&id).await.unwrap();
        pkg.status = PackageStatus::Pending;
        pkg.delivered_at = None;
        let err = f.repo.update(pkg).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::InvalidTransition {
                from: PackageStatus::Delivered,
                to: PackageStatus::Pending
            }
        ));

        let raw = f.remote.raw(PACKAGES, &id).await.unwrap();
        assert_eq!(raw[fields::STATUS], "delivered");
        assert!(raw[fields::DELIVERED_AT].is_string());
    }

    #[tokio::test]
    async fn test_update_allows_legal_status_change_and_edits_after_delivery() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();

        let mut pkg = f.repo.get_by_id(&id).await.unwrap();
        pkg.status = PackageStatus::InTransit;
        f.repo.update(pkg).await.unwrap();
        f.repo.mark_delivered(&id).await.unwrap();

        let mut pkg = f.repo.get_by_id(&id).await.unwrap();
        pkg.notes = Some("left with neighbour".into());
        f.repo.update(pkg).await.unwrap();

        let stored = f.repo.get_by_id(&id).await.unwrap();
        assert_eq!(stored.status, PackageStatus::Delivered);
        assert_eq!(stored.notes.as_deref(), Some("left with neighbour"));
    }

    #[tokio::test]
    async fn test_concurrent_status_updates_last_write_wins() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        f.remote.set_latency(Some(Duration::from_millis(40)));

        // The cancel starts while the first write is still in flight and
        // reaches the store last.
        let (moved, cancelled) = tokio::join!(
            f.repo.update_status(&id, PackageStatus::InTransit),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                f.repo.update_status(&id, PackageStatus::Cancelled).await
            }
        );
        assert_eq!(moved.unwrap().status, PackageStatus::InTransit);
        assert_eq!(cancelled.unwrap().status, PackageStatus::Cancelled);

        f.remote.set_latency(None);
        assert_eq!(f.remote.raw(PACKAGES, &id).await.unwrap()[fields::STATUS], "cancelled");
        let cached = f.cache.get::<Package>(&id).unwrap().unwrap();
        assert_eq!(cached.record.status, PackageStatus::Cancelled);
        assert!(!cached.dirty);
    }

    #[tokio::test]
    async fn test_status_update_checks_connectivity_once() {
        let net = Arc::new(CountingConnectivity::default());
        let remote = Arc::new(MemoryRemoteStore::new());
        let repo = PackageRepository::new(
            remote.clone(),
            Arc::new(LocalCache::in_memory().unwrap()),
            net.clone(),
            &ClientConfig::default(),
        );
        let id = repo.create(sample("u1", "T1")).await.unwrap();

        let before = net.checks.load(Ordering::SeqCst);
        repo.update_status(&id, PackageStatus::InTransit).await.unwrap();
        assert_eq!(net.checks.load(Ordering::SeqCst), before + 1);

        let before = net.checks.load(Ordering::SeqCst);
        repo.mark_delivered(&id).await.unwrap();
        assert_eq!(net.checks.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        f.repo.delete(&id).await.unwrap();
        f.repo.delete(&id).await.unwrap();
        assert!(f.repo.get_by_id(&id).await.unwrap_err().is_not_found());
        assert!(f.cache.get::<Package>(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all_empty_and_ordered() {
        let f = fixture();
        assert!(f.repo.get_all().await.unwrap().is_empty());

        for tracking in ["T1", "T2", "T3"] {
            f.repo.create(sample("u1", tracking)).await.unwrap();
        }
        let all = f.repo.get_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_get_by_user_filters_owner() {
        let f = fixture();
        f.repo.create(sample("u1", "T1")).await.unwrap();
        f.repo.create(sample("u2", "T2")).await.unwrap();
        f.repo.create(sample("u1", "T3")).await.unwrap();

        let mine = f.repo.get_by_user("u1").await.unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|p| p.user_id == "u1"));
        assert!(f.repo.get_by_user("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_by_tracking_number() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "UCB1")).await.unwrap();
        assert_eq!(f.repo.get_by_tracking_number("UCB1").await.unwrap().id, id);
        assert!(f.repo.get_by_tracking_number("UCB2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_no_status_change_after_delivery() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        f.repo.mark_delivered(&id).await.unwrap();

        let err = f.repo.update_status(&id, PackageStatus::Pending).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::InvalidTransition {
                from: PackageStatus::Delivered,
                to: PackageStatus::Pending
            }
        ));
        assert_eq!(f.repo.get_by_id(&id).await.unwrap().status, PackageStatus::Delivered);
    }

    #[tokio::test]
    async fn test_no_status_change_after_cancel() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        f.repo.update_status(&id, PackageStatus::Cancelled).await.unwrap();

        assert!(f.repo.update_status(&id, PackageStatus::InTransit).await.is_err());
        assert!(f.repo.mark_delivered(&id).await.is_err());
        let pkg = f.repo.get_by_id(&id).await.unwrap();
        assert_eq!(pkg.status, PackageStatus::Cancelled);
        assert!(pkg.delivered_at.is_none());
    }

    #[tokio::test]
    async fn test_backward_transition_rejected() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        f.repo.update_status(&id, PackageStatus::InTransit).await.unwrap();
        let err = f.repo.update_status(&id, PackageStatus::Pending).await.unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_mark_delivered_is_a_single_write() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        let before = f.remote.call_count(RemoteOp::Update);

        let pkg = f.repo.mark_delivered(&id).await.unwrap();
        assert_eq!(pkg.status, PackageStatus::Delivered);
        assert!(pkg.delivered_at.is_some());
        assert_eq!(f.remote.call_count(RemoteOp::Update), before + 1);

        let raw = f.remote.raw(PACKAGES, &id).await.unwrap();
        assert_eq!(raw[fields::STATUS], "delivered");
        assert!(raw[fields::DELIVERED_AT].is_string());
    }

    #[tokio::test]
    async fn test_mark_delivered_failure_applies_nothing_remotely() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        f.repo.update_status(&id, PackageStatus::InTransit).await.unwrap();

        f.remote.fail_next(RemoteOp::Update, RemoteError::Transport("connection reset".into()));
        let err = f.repo.mark_delivered(&id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::RemoteFailure(_)));

        let raw = f.remote.raw(PACKAGES, &id).await.unwrap();
        assert_eq!(raw[fields::STATUS], "in_transit");
        assert_eq!(raw[fields::DELIVERED_AT], Value::Null);

        // The local copy holds both fields, queued for reconciliation.
        let cached = f.cache.get::<Package>(&id).unwrap().unwrap();
        assert!(cached.dirty);
        assert_eq!(cached.record.status, PackageStatus::Delivered);
        assert!(cached.record.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_write_is_pushed_with_next_update() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "T1")).await.unwrap();
        let mut pkg = f.repo.get_by_id(&id).await.unwrap();
        pkg.notes = Some("back door".into());

        f.remote.fail_next(RemoteOp::Update, RemoteError::Transport("timeout".into()));
        assert!(f.repo.update(pkg).await.is_err());
        assert!(f.cache.get::<Package>(&id).unwrap().unwrap().dirty);

        f.repo.update_status(&id, PackageStatus::InTransit).await.unwrap();
        let raw = f.remote.raw(PACKAGES, &id).await.unwrap();
        assert_eq!(raw["notes"], "back door");
        assert_eq!(raw[fields::STATUS], "in_transit");
        assert!(!f.cache.get::<Package>(&id).unwrap().unwrap().dirty);
    }

    #[tokio::test]
    async fn test_offline_point_lookups_use_cache() {
        let f = fixture();
        let id = f.repo.create(sample("u1", "UCB9")).await.unwrap();
        f.net.set_online(false);

        assert_eq!(f.repo.get_by_id(&id).await.unwrap().id, id);
        assert_eq!(f.repo.get_by_tracking_number("UCB9").await.unwrap().id, id);
        assert!(f.repo.get_by_id("unknown").await.unwrap_err().is_offline());
        assert!(f.repo.get_all().await.unwrap_err().is_offline());
        assert!(f.repo.update_status(&id, PackageStatus::InTransit).await.unwrap_err().is_offline());
    }

    #[tokio::test]
    async fn test_remote_timeout_is_a_failure() {
        let f = fixture_with(ClientConfig {
            request_timeout_ms: 50,
            ..ClientConfig::default()
        });
        f.remote.set_latency(Some(Duration::from_millis(300)));
        let err = f.repo.get_all().await.unwrap_err();
        assert!(matches!(err, RepositoryError::RemoteFailure(RemoteError::Timeout(_))));
    }
}
