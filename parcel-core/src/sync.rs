//! Reconciliation of dirty cache entries with the remote store.
//!
//! A pass walks the dirty packages and users (oldest write first) and pushes
//! each one as a full overwrite. Outcomes per record:
//!
//! - remote copy gone: the entry is purged, a remote delete wins
//! - remote package status cannot legally move to the local one: the local
//!   write is discarded and the remote copy cached instead
//! - push confirmed: the entry is marked clean, unless it was rewritten
//!   while the push was in flight
//! - push failed: the entry stays dirty for the next pass
//!
//! Passes are skipped while offline.

use crate::cache::{Cacheable, Cached, LocalCache};
use crate::config::ClientConfig;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::model::{Package, User};
use crate::remote::{RemoteError, RemoteStore, decode, encode, with_timeout};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Pass was skipped because the device is offline.
    pub skipped_offline: bool,
    /// Records pushed and marked clean.
    pub pushed: usize,
    /// Records dropped locally because the remote copy no longer exists.
    pub purged: usize,
    /// Local writes dropped in favour of the remote copy.
    pub discarded: usize,
    /// Records whose push failed; they remain dirty.
    pub failed: usize,
    /// Unix timestamp (seconds) when the pass finished.
    pub finished_at: i64,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

enum Outcome {
    Pushed,
    Purged,
    Discarded,
}

/// Pushes dirty cache entries to the remote store
pub struct Reconciler {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    connectivity: Arc<dyn Connectivity>,
    timeout: Duration,
    batch_size: usize,
}

impl Reconciler {
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
            batch_size: config.reconcile_batch_size,
        }
    }

    /// Run a single pass over dirty packages and users.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if !self.connectivity.is_online() {
            debug!("Offline, skipping reconciliation");
            report.skipped_offline = true;
            report.finished_at = chrono::Utc::now().timestamp();
            return Ok(report);
        }

        for entry in self.cache.dirty::<Package>(self.batch_size)? {
            let id = entry.record.id.clone();
            let outcome = self.push_package(entry).await;
            self.tally(&mut report, "package", &id, outcome);
        }
        for entry in self.cache.dirty::<User>(self.batch_size)? {
            let id = entry.record.id.clone();
            let outcome = self.push(entry).await;
            self.tally(&mut report, "user", &id, outcome);
        }

        report.finished_at = chrono::Utc::now().timestamp();
        if report.pushed + report.purged + report.discarded + report.failed > 0 {
            info!(
                "Reconciliation pass: {} pushed, {} purged, {} discarded, {} failed",
                report.pushed, report.purged, report.discarded, report.failed
            );
        }
        Ok(report)
    }

    /// Run passes every `interval` until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        if interval.is_zero() {
            warn!("Reconcile interval is zero, background reconciliation disabled");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!("Reconciliation pass failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Reconciler stopping");
                        break;
                    }
                }
            }
        }
    }

    fn tally(
        &self,
        report: &mut ReconcileReport,
        kind: &str,
        id: &str,
        outcome: std::result::Result<Outcome, RemoteError>,
    ) {
        match outcome {
            Ok(Outcome::Pushed) => report.pushed += 1,
            Ok(Outcome::Purged) => report.purged += 1,
            Ok(Outcome::Discarded) => report.discarded += 1,
            Err(e) => {
                warn!("Could not push {} {}: {}", kind, id, e);
                report.failed += 1;
            }
        }
    }

    async fn push_package(&self, entry: Cached<Package>) -> std::result::Result<Outcome, RemoteError> {
        let id = entry.record.id.as_str();
        let remote = match with_timeout(self.timeout, self.remote.get(Package::TABLE, id)).await? {
            Some(doc) => decode::<Package>(doc)?,
            None => return Ok(self.purge::<Package>(id)),
        };

        let local = entry.record.status;
        if remote.status != local && !remote.status.can_transition_to(local) {
            warn!(
                "Discarding local write of package {}: remote is {}, local is {}",
                id, remote.status, local
            );
            if let Err(e) = self.cache.put(&remote, false) {
                warn!("Could not cache remote copy of package {}: {}", id, e);
            }
            return Ok(Outcome::Discarded);
        }

        self.push(entry).await
    }

    async fn push<T: Cacheable>(&self, entry: Cached<T>) -> std::result::Result<Outcome, RemoteError> {
        let id = entry.record.cache_id().to_string();
        let body = encode(&entry.record)?;
        match with_timeout(self.timeout, self.remote.update(T::TABLE, &id, body)).await {
            Ok(()) => {
                match self.cache.mark_clean::<T>(&id, entry.updated_at_millis) {
                    Ok(true) => {}
                    Ok(false) => debug!("{} {} changed during push, left dirty", T::TABLE, id),
                    Err(e) => warn!("Could not mark {} {} clean: {}", T::TABLE, id, e),
                }
                Ok(Outcome::Pushed)
            }
            Err(RemoteError::NotFound { .. }) => Ok(self.purge::<T>(&id)),
            Err(e) => Err(e),
        }
    }

    fn purge<T: Cacheable>(&self, id: &str) -> Outcome {
        debug!("{} {} no longer exists remotely, dropping local copy", T::TABLE, id);
        if let Err(e) = self.cache.remove::<T>(id) {
            warn!("Could not drop {} {} from cache: {}", T::TABLE, id, e);
        }
        Outcome::Purged
    }
}
