//! Periodic diff between the store and the in-memory gallery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use visage_core::Gallery;

use crate::engine::EngineHandle;
use crate::store::Repository;

/// Store snapshot queries are cut off after this long; a hung query skips
/// the cycle rather than holding the non-reentrant gate indefinitely.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(60);

/// Non-reentrant: if a prior cycle is still running when the timer fires
/// again, the new tick is dropped, not queued.
pub struct Reconciler {
    store: Arc<dyn Repository>,
    engine: EngineHandle,
    busy: Mutex<()>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Repository>, engine: EngineHandle) -> Self {
        Self {
            store,
            engine,
            busy: Mutex::new(()),
        }
    }

    /// Spawn the periodic task. The returned handle is owned by the
    /// caller's shutdown bookkeeping, per the "fire-and-forget" fix noted
    /// in design notes — the daemon awaits it during shutdown rather than
    /// letting it vanish.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.run_cycle_if_idle().await;
            }
        })
    }

    async fn run_cycle_if_idle(&self) {
        let Ok(_guard) = self.busy.try_lock() else {
            tracing::debug!("reconciler: prior cycle still running, skipping tick");
            return;
        };

        if let Err(e) = self.run_cycle().await {
            tracing::error!(error = %e, "reconciler: cycle aborted");
        }
    }

    async fn run_cycle(&self) -> Result<(), crate::store::StoreError> {
        let snapshot = match timeout(SNAPSHOT_TIMEOUT, self.store.snapshot_active_face_users()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "reconciler: snapshot query failed, skipping cycle");
                return Ok(());
            }
            Err(_) => {
                tracing::debug!("reconciler: snapshot query timed out, skipping cycle");
                return Ok(());
            }
        };

        let gallery: &Gallery = self.engine.gallery();
        let existing_ids: std::collections::HashSet<i64> =
            gallery.embedded_ids().into_iter().collect();
        let snapshot_ids: std::collections::HashSet<i64> =
            snapshot.iter().map(|u| u.enroll_id).collect();

        // Additions: fetch the full row, re-embed, and upsert.
        for user in &snapshot {
            if existing_ids.contains(&user.enroll_id) {
                continue;
            }
            let Some(row) = self.store.fetch_face_row(user.enroll_id).await? else {
                continue;
            };
            match self.engine.embed(&row.image, false).await {
                Ok(embedding) => {
                    gallery.upsert(user.enroll_id, embedding, row.name.clone(), row.is_active);
                    tracing::info!(enroll_id = user.enroll_id, "reconciler: gallery addition");
                }
                Err(e) => {
                    tracing::debug!(enroll_id = user.enroll_id, error = %e, "reconciler: embed failed for addition");
                }
            }
        }

        // Active-flag updates.
        for user in &snapshot {
            if let Some(current) = gallery.user(user.enroll_id) {
                if current.is_active != user.is_active {
                    gallery.set_active(user.enroll_id, user.is_active);
                    tracing::info!(
                        enroll_id = user.enroll_id,
                        is_active = user.is_active,
                        "reconciler: active flag updated"
                    );
                }
            }
        }

        // Deletions: ids in the gallery no longer present in the store snapshot.
        for id in existing_ids.difference(&snapshot_ids) {
            gallery.remove(*id);
            tracing::info!(enroll_id = id, "reconciler: gallery eviction");
        }

        Ok(())
    }
}
