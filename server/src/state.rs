use crate::env::Env;
use crate::registry::TunnelRegistry;
use crate::store::SessionStore;
use crate::supervisor::DisconnectSupervisor;
use crate::workloads::WorkloadClient;
use std::sync::Arc;

/// Process-wide singletons, constructed once at startup and handed to
/// every handler and background task as explicit dependencies.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) env: Arc<Env>,
    pub(crate) store: SessionStore,
    pub(crate) registry: Arc<TunnelRegistry>,
    pub(crate) supervisor: Arc<DisconnectSupervisor>,
    pub(crate) workloads: Arc<dyn WorkloadClient>,
}
