use crate::error::BrokerError;
use crate::store::{RECONNECT_PREFIX, SESSION_PREFIX, SessionStore, now_secs};
use crate::workloads::{TERMINATION_GRACE, WorkloadClient, WorkloadInfo};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Periodic reconciliation of sandbox workloads against the session store.
/// A workload old enough to have had its session established, yet
/// referenced by no `session:*` or `reconnect:*` key, gets terminated.
/// The reaper only ever acts through the workload client; live registry
/// entries are left for the disconnect path to resolve.
pub struct OrphanReaper {
    store: SessionStore,
    workloads: Arc<dyn WorkloadClient>,
    interval: Duration,
    min_age: Duration,
}

impl OrphanReaper {
    pub fn new(
        store: SessionStore,
        workloads: Arc<dyn WorkloadClient>,
        interval: Duration,
        min_age: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            workloads,
            interval,
            min_age,
        })
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        info!(
            "starting orphan reaper (every {}s, workload grace {}s)",
            self.interval.as_secs(),
            self.min_age.as_secs()
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // the interval fires immediately; a sweep right at boot would
            // race fresh deployments for no benefit
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep().await {
                            warn!("orphan sweep failed: {err}");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("orphan reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub async fn sweep(&self) -> Result<(), BrokerError> {
        let workloads = self.workloads.list_sandboxes().await?;
        if workloads.is_empty() {
            debug!("orphan sweep: no sandbox workloads");
            return Ok(());
        }

        let referenced = self.referenced_workloads().await?;
        let orphans = select_orphans(&workloads, &referenced, now_secs(), self.min_age);

        debug!(
            "orphan sweep: {} workloads, {} referenced, {} orphaned",
            workloads.len(),
            referenced.len(),
            orphans.len()
        );

        for name in orphans {
            info!("no session references workload {name}, terminating");
            if let Err(err) = self.workloads.terminate(&name, TERMINATION_GRACE).await {
                warn!("failed to terminate orphaned workload {name}: {err}");
            }
        }

        Ok(())
    }

    /// Workload names pinned by a session record or a reconnect marker.
    async fn referenced_workloads(&self) -> Result<HashSet<String>, BrokerError> {
        let mut referenced = HashSet::new();
        for prefix in [SESSION_PREFIX, RECONNECT_PREFIX] {
            for key in self.store.scan_keys(&format!("{prefix}*")).await? {
                if let Some(snapshot) = self.store.fetch_snapshot(&key).await? {
                    referenced.insert(snapshot.pod_name);
                }
            }
        }
        Ok(referenced)
    }
}

fn select_orphans(
    workloads: &[WorkloadInfo],
    referenced: &HashSet<String>,
    now: u64,
    min_age: Duration,
) -> Vec<String> {
    workloads
        .iter()
        .filter(|workload| {
            // a workload without a creation timestamp cannot be proven old
            // enough, so it is skipped until the next sweep
            let old_enough = workload
                .created_at
                .map(|created| now.saturating_sub(created) >= min_age.as_secs())
                .unwrap_or(false);
            old_enough && !referenced.contains(&workload.name)
        })
        .map(|workload| workload.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(name: &str, age_secs: Option<u64>, now: u64) -> WorkloadInfo {
        WorkloadInfo {
            name: name.to_string(),
            ip: None,
            created_at: age_secs.map(|age| now - age),
        }
    }

    #[test]
    fn unreferenced_old_workload_is_orphaned() {
        let now = 1_000_000;
        let workloads = vec![workload("sandbox-a", Some(600), now)];
        let referenced = HashSet::new();

        let orphans = select_orphans(&workloads, &referenced, now, Duration::from_secs(300));
        assert_eq!(orphans, vec!["sandbox-a".to_string()]);
    }

    #[test]
    fn young_workloads_are_skipped() {
        let now = 1_000_000;
        let workloads = vec![workload("sandbox-a", Some(60), now)];
        let referenced = HashSet::new();

        let orphans = select_orphans(&workloads, &referenced, now, Duration::from_secs(300));
        assert!(orphans.is_empty());
    }

    #[test]
    fn session_and_reconnect_references_protect_workloads() {
        let now = 1_000_000;
        let workloads = vec![
            workload("sandbox-live", Some(900), now),
            workload("sandbox-grace", Some(900), now),
            workload("sandbox-dead", Some(900), now),
        ];
        let referenced: HashSet<String> = ["sandbox-live", "sandbox-grace"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let orphans = select_orphans(&workloads, &referenced, now, Duration::from_secs(300));
        assert_eq!(orphans, vec!["sandbox-dead".to_string()]);
    }

    #[test]
    fn unknown_creation_time_is_not_reaped() {
        let now = 1_000_000;
        let workloads = vec![workload("sandbox-a", None, now)];
        let referenced = HashSet::new();

        let orphans = select_orphans(&workloads, &referenced, now, Duration::from_secs(300));
        assert!(orphans.is_empty());
    }

    #[test]
    fn boundary_age_counts_as_old() {
        let now = 1_000_000;
        let workloads = vec![workload("sandbox-a", Some(300), now)];
        let referenced = HashSet::new();

        let orphans = select_orphans(&workloads, &referenced, now, Duration::from_secs(300));
        assert_eq!(orphans.len(), 1);
    }
}
