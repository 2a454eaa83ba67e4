use crate::store::ExtensionPolicy;
use envconfig::Envconfig;
use sandgate_common::env::Mode;
use std::time::Duration;

#[derive(Envconfig)]
pub(crate) struct Env {
    #[envconfig(from = "APP_MODE", default = "development")]
    pub mode: Mode,

    #[envconfig(from = "HTTP_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "HTTP_PORT", default = "4567")]
    pub port: u16,

    #[envconfig(from = "ACCESS_CONTROL_ALLOWED_ORIGIN")]
    pub access_control_allowed_origin: Option<String>,

    #[envconfig(from = "GUACD_ADDRESS", default = "0.0.0.0:4822")]
    pub guacd_address: String,

    #[envconfig(from = "REDIS_HOST", default = "localhost")]
    pub redis_host: String,

    #[envconfig(from = "REDIS_PORT", default = "6379")]
    pub redis_port: u16,

    /// Session lifetime in minutes.
    #[envconfig(from = "POD_SESSION_TIMEOUT", default = "10")]
    pub session_timeout_mins: u64,

    #[envconfig(from = "RECONNECT_GRACE_SECS", default = "120")]
    pub reconnect_grace_secs: u64,

    #[envconfig(from = "EXTENSION_WINDOW_MINS", default = "9")]
    pub extension_window_mins: u64,

    #[envconfig(from = "EXTENSION_MIN_MINS", default = "1")]
    pub extension_min_mins: u64,

    #[envconfig(from = "EXTENSION_MAX_MINS", default = "10")]
    pub extension_max_mins: u64,

    #[envconfig(from = "REAPER_INTERVAL_SECS", default = "300")]
    pub reaper_interval_secs: u64,

    #[envconfig(from = "REAPER_GRACE_SECS", default = "300")]
    pub reaper_grace_secs: u64,

    #[envconfig(from = "HANDSHAKE_TIMEOUT_SECS", default = "45")]
    pub handshake_timeout_secs: u64,

    #[envconfig(from = "DIAL_TIMEOUT_SECS", default = "60")]
    pub dial_timeout_secs: u64,

    #[envconfig(from = "SOCKET_TIMEOUT_SECS", default = "15")]
    pub socket_timeout_secs: u64,

    #[envconfig(from = "READINESS_TIMEOUT_SECS", default = "120")]
    pub readiness_timeout_secs: u64,

    #[envconfig(from = "READINESS_POLL_SECS", default = "2")]
    pub readiness_poll_secs: u64,

    #[envconfig(from = "KUBE_API_URL", default = "https://kubernetes.default.svc")]
    pub kube_api_url: String,

    #[envconfig(
        from = "KUBE_TOKEN_PATH",
        default = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    pub kube_token_path: String,

    #[envconfig(
        from = "KUBE_CA_PATH",
        default = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"
    )]
    pub kube_ca_path: String,

    #[envconfig(from = "KUBE_NAMESPACE", default = "browser-sandbox")]
    pub kube_namespace: String,

    #[envconfig(from = "SANDBOX_LABEL", default = "browser-sandbox")]
    pub sandbox_label: String,

    #[envconfig(
        from = "SANDBOX_IMAGE",
        default = "ghcr.io/sandgate/rdp-sandbox-lxde:latest"
    )]
    pub sandbox_image: String,

    #[envconfig(from = "SANDBOX_SUBDOMAIN", default = "sandbox-instances")]
    pub sandbox_subdomain: String,

    #[envconfig(from = "SANDBOX_RDP_USER", default = "rdpuser")]
    pub sandbox_rdp_user: String,

    #[envconfig(from = "SANDBOX_RDP_PASSWORD", default = "")]
    pub sandbox_rdp_password: String,
}

impl Env {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_mins * 60)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    pub fn extension_policy(&self) -> ExtensionPolicy {
        ExtensionPolicy {
            window: Duration::from_secs(self.extension_window_mins * 60),
            min: Duration::from_secs(self.extension_min_mins * 60),
            max: Duration::from_secs(self.extension_max_mins * 60),
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn reaper_grace(&self) -> Duration {
        Duration::from_secs(self.reaper_grace_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_secs)
    }

    /// Routable name of a sandbox workload inside the cluster.
    pub fn workload_fqdn(&self, name: &str) -> String {
        format!(
            "{}.{}.{}.svc.cluster.local",
            name, self.sandbox_subdomain, self.kube_namespace
        )
    }
}

pub fn init() -> anyhow::Result<Env> {
    let config = Env::init_from_env()?;
    Ok(config)
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_fqdn_includes_subdomain_and_namespace() {
        let mut env = Env::init_from_hashmap(&Default::default()).unwrap();
        env.sandbox_subdomain = "sandbox-instances".to_string();
        env.kube_namespace = "browser-sandbox".to_string();
        assert_eq!(
            env.workload_fqdn("sandbox-1a2b3c"),
            "sandbox-1a2b3c.sandbox-instances.browser-sandbox.svc.cluster.local"
        );
    }

    #[test]
    fn defaults_cover_every_knob() {
        let env = Env::init_from_hashmap(&Default::default()).unwrap();
        assert_eq!(env.session_timeout(), Duration::from_secs(600));
        assert_eq!(env.reconnect_grace(), Duration::from_secs(120));
        assert_eq!(env.extension_policy().window, Duration::from_secs(540));
        assert_eq!(env.handshake_timeout(), Duration::from_secs(45));
        assert_eq!(env.dial_timeout(), Duration::from_secs(60));
        assert_eq!(env.socket_timeout(), Duration::from_secs(15));
        assert_eq!(env.redis_url(), "redis://localhost:6379");
    }
}
