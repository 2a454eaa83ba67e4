use crate::error::BrokerError;
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::net::TcpStream;

pub const RDP_PORT: u16 = 3389;

/// Grace period handed to the orchestrator on every teardown.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkloadInfo {
    pub name: String,
    pub ip: Option<String>,
    /// Creation time, unix seconds. `None` when the orchestrator response
    /// omitted or mangled the timestamp.
    pub created_at: Option<u64>,
}

/// Seam to the container orchestrator. The broker only ever provisions,
/// lists and terminates sandbox workloads through this interface; all
/// deletion requests are idempotent (a missing workload is a no-op).
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    async fn create_sandbox(&self, name: &str) -> Result<WorkloadInfo, BrokerError>;
    async fn list_sandboxes(&self) -> Result<Vec<WorkloadInfo>, BrokerError>;
    async fn terminate(&self, name: &str, grace: Duration) -> Result<(), BrokerError>;
}

/// Thin client over the orchestrator's REST API, authenticated with the
/// mounted service-account token.
pub struct KubeApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    namespace: String,
    label: String,
    image: String,
    subdomain: String,
}

impl KubeApiClient {
    pub fn new(
        base_url: String,
        token_path: &str,
        ca_path: &str,
        namespace: String,
        label: String,
        image: String,
        subdomain: String,
    ) -> anyhow::Result<Self> {
        let token = std::fs::read_to_string(token_path)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
        if token.is_empty() {
            warn!("no service account token at {token_path}, api requests will be anonymous");
        }

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        match std::fs::read(ca_path) {
            Ok(pem) => match reqwest::Certificate::from_pem(&pem) {
                Ok(cert) => builder = builder.add_root_certificate(cert),
                Err(err) => warn!("ignoring unparseable cluster ca at {ca_path}: {err}"),
            },
            Err(err) => debug!("no cluster ca at {ca_path}: {err}"),
        }

        Ok(Self {
            http: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            namespace,
            label,
            image,
            subdomain,
        })
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, self.namespace)
    }

    fn pod_url(&self, name: &str) -> String {
        format!("{}/{}", self.pods_url(), name)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        }
    }
}

#[async_trait]
impl WorkloadClient for KubeApiClient {
    async fn create_sandbox(&self, name: &str) -> Result<WorkloadInfo, BrokerError> {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "labels": { "app": self.label },
            },
            "spec": {
                "hostname": name,
                "subdomain": self.subdomain,
                "containers": [{
                    "name": "rdp-sandbox",
                    "image": self.image,
                    "ports": [{ "name": "rdp", "containerPort": RDP_PORT }],
                }],
                "terminationGracePeriodSeconds": TERMINATION_GRACE.as_secs(),
            },
        });

        let response = self
            .authorized(self.http.post(self.pods_url()))
            .json(&manifest)
            .send()
            .await
            .map_err(|err| BrokerError::Workload(format!("create {name}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Workload(format!(
                "create {name}: orchestrator returned {status}: {body}"
            )));
        }

        let pod: Pod = response
            .json()
            .await
            .map_err(|err| BrokerError::Workload(format!("create {name}: bad response: {err}")))?;

        info!("created sandbox workload {}", pod.metadata.name);
        Ok(pod.into())
    }

    async fn list_sandboxes(&self) -> Result<Vec<WorkloadInfo>, BrokerError> {
        let response = self
            .authorized(self.http.get(self.pods_url()))
            .query(&[("labelSelector", format!("app={}", self.label))])
            .send()
            .await
            .map_err(|err| BrokerError::Workload(format!("list sandboxes: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Workload(format!(
                "list sandboxes: orchestrator returned {status}: {body}"
            )));
        }

        let list: PodList = response
            .json()
            .await
            .map_err(|err| BrokerError::Workload(format!("list sandboxes: bad response: {err}")))?;

        Ok(list
            .items
            .into_iter()
            .filter(|pod| {
                matches!(
                    pod.status.phase.as_deref(),
                    Some("Running") | Some("Pending")
                )
            })
            .map(WorkloadInfo::from)
            .collect())
    }

    async fn terminate(&self, name: &str, grace: Duration) -> Result<(), BrokerError> {
        let response = self
            .authorized(self.http.delete(self.pod_url(name)))
            .json(&json!({
                "apiVersion": "v1",
                "kind": "DeleteOptions",
                "gracePeriodSeconds": grace.as_secs(),
            }))
            .send()
            .await
            .map_err(|err| BrokerError::Workload(format!("terminate {name}: {err}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("workload {name} already gone");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Workload(format!(
                "terminate {name}: orchestrator returned {status}: {body}"
            )));
        }

        info!("requested termination of workload {name} ({}s grace)", grace.as_secs());
        Ok(())
    }
}

/// Polls the workload's remote-desktop port until it accepts a TCP
/// connection: one attempt per `per_poll`, giving up after `overall`.
pub async fn wait_for_rdp(
    host: &str,
    port: u16,
    overall: Duration,
    per_poll: Duration,
) -> Result<(), BrokerError> {
    let deadline = tokio::time::Instant::now() + overall;
    let mut ticker = tokio::time::interval(per_poll);

    loop {
        ticker.tick().await;

        if let Ok(Ok(_)) = tokio::time::timeout(per_poll, TcpStream::connect((host, port))).await {
            debug!("workload {host}:{port} is accepting connections");
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(BrokerError::Timeout(format!(
                "workload {host}:{port} not reachable within {}s",
                overall.as_secs()
            )));
        }
    }
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
    #[serde(default, rename = "creationTimestamp")]
    creation_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(default)]
    phase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

impl From<Pod> for WorkloadInfo {
    fn from(pod: Pod) -> Self {
        let created_at = pod
            .metadata
            .creation_timestamp
            .as_deref()
            .and_then(parse_rfc3339_secs);
        Self {
            name: pod.metadata.name,
            ip: pod.status.pod_ip,
            created_at,
        }
    }
}

fn parse_rfc3339_secs(value: &str) -> Option<u64> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|t| t.unix_timestamp().max(0) as u64)
}
