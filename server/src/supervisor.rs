use crate::error::BrokerError;
use crate::registry::TunnelRegistry;
use crate::store::SessionStore;
use crate::workloads::{TERMINATION_GRACE, WorkloadClient};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Governs what happens after a browser websocket closes: the session gets
/// a reconnect marker with a bounded TTL, and a deferred task races that
/// marker. If the marker survives the grace window the workload is
/// reclaimed; if the connect path consumed it, nothing happens.
pub struct DisconnectSupervisor {
    store: SessionStore,
    registry: Arc<TunnelRegistry>,
    workloads: Arc<dyn WorkloadClient>,
    grace: Duration,
}

impl DisconnectSupervisor {
    pub fn new(
        store: SessionStore,
        registry: Arc<TunnelRegistry>,
        workloads: Arc<dyn WorkloadClient>,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            workloads,
            grace,
        })
    }

    /// Close callback installed by the websocket layer. `external_id` is
    /// the id from the browser URL, `tunnel_id` the gateway connection the
    /// socket was pumping (unset when the handshake never finished).
    pub async fn on_disconnect(self: &Arc<Self>, external_id: &str, tunnel_id: Option<&str>) {
        let mut session = match self.store.get(external_id).await {
            Ok(session) => session,
            Err(BrokerError::NotFound) => {
                // A viewer without its own session record (a share join, or
                // a session already stopped). Nothing to preserve; just
                // drop the tunnel so the registry does not accumulate.
                debug!("no session behind {external_id}, dropping tunnel state");
                if let Some(tunnel_id) = tunnel_id {
                    self.registry.delete(tunnel_id);
                    self.registry.delete_params(tunnel_id);
                }
                self.registry.delete_params(external_id);
                return;
            }
            Err(err) => {
                warn!("failed to load session {external_id} on disconnect: {err}");
                return;
            }
        };

        session.disconnection_count += 1;
        match self.store.put_preserving_ttl(external_id, &session).await {
            Ok(ttl) => info!(
                "session {external_id} disconnected {} times ({}s left)",
                session.disconnection_count,
                ttl.as_secs()
            ),
            Err(err) => warn!("failed to record disconnection for {external_id}: {err}"),
        }

        if let Err(err) = self
            .store
            .put_reconnect(external_id, &session, self.grace)
            .await
        {
            warn!("failed to open reconnection window for {external_id}: {err}");
        } else {
            info!(
                "opened {}s reconnection window for session {external_id}",
                self.grace.as_secs()
            );
        }

        let supervisor = self.clone();
        let external_id = external_id.to_string();
        let tunnel_id = tunnel_id.map(str::to_string);
        let pod_name = session.pod_name;
        tokio::spawn(async move {
            tokio::time::sleep(supervisor.grace).await;
            supervisor
                .reclaim_if_unclaimed(&external_id, tunnel_id.as_deref(), &pod_name)
                .await;
        });
    }

    /// The deferred half of the disconnect path. The reconnect marker still
    /// being present means nobody came back; its absence means the connect
    /// path consumed it and the workload must be left alone.
    async fn reclaim_if_unclaimed(
        &self,
        external_id: &str,
        tunnel_id: Option<&str>,
        pod_name: &str,
    ) {
        match self.store.reconnect_exists(external_id).await {
            Ok(true) => {
                info!(
                    "no reconnection for session {external_id} within the grace window, reclaiming workload {pod_name}"
                );

                if let Err(err) = self.workloads.terminate(pod_name, TERMINATION_GRACE).await {
                    warn!("failed to terminate workload {pod_name}: {err}");
                }

                if let Some(tunnel_id) = tunnel_id {
                    if let Some(tunnel) = self.registry.get(tunnel_id) {
                        tunnel.close();
                    }
                    self.registry.delete(tunnel_id);
                    self.registry.delete_params(tunnel_id);
                }
                self.registry.delete_params(external_id);

                if let Err(err) = self.store.delete_session(external_id).await {
                    warn!("failed to delete session key for {external_id}: {err}");
                }
                if let Err(err) = self.store.clear_reconnect(external_id).await {
                    warn!("failed to delete reconnect key for {external_id}: {err}");
                }
            }
            Ok(false) => {
                info!(
                    "session {external_id} reconnected within the grace window, workload {pod_name} preserved"
                );
            }
            Err(err) => {
                warn!("failed to check reconnection status for {external_id}: {err}");
            }
        }
    }
}
