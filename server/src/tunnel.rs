use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Registry-visible handle for a live gateway connection.
///
/// The I/O halves of the TCP stream live inside the two pump tasks; this
/// handle carries the identifiers and the close-once switch that lets the
/// supervisor, the reaper or an explicit stop tear the pumps down.
pub struct Tunnel {
    tunnel_id: String,
    external_id: String,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Tunnel {
    pub fn new(tunnel_id: impl Into<String>, external_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id: tunnel_id.into(),
            external_id: external_id.into(),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// Flips the tunnel closed and wakes the pumps. Returns whether this
    /// call was the one that closed it.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.shutdown.notify_waiters();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the tunnel has been closed, however late the caller
    /// starts waiting.
    pub async fn wait_closed(&self) {
        let notified = self.shutdown.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn close_is_once() {
        let tunnel = Tunnel::new("$1", "ext-1");
        assert!(!tunnel.is_closed());
        assert!(tunnel.close());
        assert!(!tunnel.close());
        assert!(tunnel.is_closed());
    }

    #[tokio::test]
    async fn wait_resolves_for_late_waiters() {
        let tunnel = Tunnel::new("$1", "ext-1");
        tunnel.close();
        tokio::time::timeout(Duration::from_secs(1), tunnel.wait_closed())
            .await
            .expect("wait_closed should resolve after close");
    }

    #[tokio::test]
    async fn wait_wakes_on_close() {
        let tunnel = Tunnel::new("$1", "ext-1");
        let waiter = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.wait_closed().await })
        };
        tokio::task::yield_now().await;
        tunnel.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
