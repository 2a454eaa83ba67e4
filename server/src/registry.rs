use crate::tunnel::Tunnel;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

pub type ConnectionParams = HashMap<String, String>;

/// In-memory map of live tunnels keyed by the gateway-assigned tunnel id,
/// with a side-map of connection parameters keyed by the client-facing
/// external id.
///
/// Parameters are written at deploy time, before any tunnel exists, and
/// deliberately outlive `delete` so a client returning inside the grace
/// window can re-establish from the same snapshot. Only `delete_params`
/// (the explicit-stop path) drops them.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
    params: DashMap<String, ConnectionParams>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tunnel, silently replacing any previous holder of the id.
    pub fn add(&self, id: impl Into<String>, tunnel: Arc<Tunnel>) {
        self.tunnels.insert(id.into(), tunnel);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(id).map(|entry| entry.value().clone())
    }

    pub fn delete(&self, id: &str) {
        self.tunnels.remove(id);
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.tunnels.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn put_params(&self, id: impl Into<String>, params: ConnectionParams) {
        self.params.insert(id.into(), params);
    }

    pub fn params(&self, id: &str) -> Option<ConnectionParams> {
        self.params.get(id).map(|entry| entry.value().clone())
    }

    pub fn delete_params(&self, id: &str) {
        self.params.remove(id);
    }

    pub fn params_count(&self) -> usize {
        self.params.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_empty_store() {
        let registry = TunnelRegistry::new();
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn add_get_delete() {
        let registry = TunnelRegistry::new();
        let first = Tunnel::new("$1", "ext-1");
        registry.add("$1", first.clone());

        let found = registry.get("$1").expect("tunnel should be registered");
        assert_eq!(found.tunnel_id(), "$1");
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.all_ids(), vec!["$1".to_string()]);

        let second = Tunnel::new("$2", "ext-2");
        registry.add("$2", second);
        assert_eq!(registry.count(), 2);

        registry.delete("$1");
        assert!(registry.get("$1").is_none());
        assert_eq!(registry.count(), 1);

        registry.delete("$2");
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn delete_is_idempotent() {
        let registry = TunnelRegistry::new();
        registry.add("$1", Tunnel::new("$1", "ext-1"));
        registry.delete("$1");
        registry.delete("$1");
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn add_overwrites_existing_id() {
        let registry = TunnelRegistry::new();
        registry.add("$1", Tunnel::new("$1", "ext-a"));
        registry.add("$1", Tunnel::new("$1", "ext-b"));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("$1").unwrap().external_id(), "ext-b");
    }

    #[test]
    fn params_survive_tunnel_delete() {
        let registry = TunnelRegistry::new();
        let mut params = ConnectionParams::new();
        params.insert("scheme".to_string(), "rdp".to_string());

        registry.put_params("ext-1", params);
        registry.add("$1", Tunnel::new("$1", "ext-1"));
        registry.delete("$1");

        let kept = registry.params("ext-1").expect("params should survive");
        assert_eq!(kept.get("scheme").map(String::as_str), Some("rdp"));

        registry.delete_params("ext-1");
        assert!(registry.params("ext-1").is_none());
    }
}
