//! Token-authenticated client for the handful of Proxmox VE endpoints pvebot uses.
//!
//! Every response is expected inside a `{"data": ...}` envelope. The envelope is
//! strict; the payload fields are not: a field with an unexpected type decodes
//! to `None` instead of failing the whole response.

use crate::config::ProxmoxConfig;
use crate::metrics::Metrics;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProxmoxError {
    #[error("Proxmox rejected the API token (HTTP {status})")]
    AuthFailure { status: u16 },
    #[error("Proxmox has no resource at {path}")]
    NotFound { path: String },
    #[error("Proxmox is unavailable: {0}")]
    BackendUnavailable(String),
    #[error("unexpected Proxmox response: {0}")]
    MalformedResponse(String),
    #[error("failed to build Proxmox client: {0}")]
    Setup(String),
}

impl ProxmoxError {
    /// Short class name shown to chat users next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailure { .. } => "AuthFailure",
            Self::NotFound { .. } => "NotFound",
            Self::BackendUnavailable(_) => "BackendUnavailable",
            Self::MalformedResponse(_) => "MalformedResponse",
            Self::Setup(_) => "Setup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Stopped,
    Unknown,
}

impl PowerState {
    /// Case and surrounding whitespace are ignored.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("running") => Self::Running,
            Some("stopped") => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one container, built fresh from every query.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStatus {
    pub status: PowerState,
    pub name: Option<String>,
    pub cpu_fraction: Option<f64>,
    pub memory_used_bytes: Option<u64>,
    pub memory_max_bytes: Option<u64>,
    pub uptime_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerStatusRaw {
    #[serde(default, deserialize_with = "lenient")]
    status: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    cpu: Option<f64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    mem: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    maxmem: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    uptime: Option<u64>,
}

impl From<ContainerStatusRaw> for ContainerStatus {
    fn from(raw: ContainerStatusRaw) -> Self {
        Self {
            status: PowerState::parse(raw.status.as_deref()),
            name: raw.name,
            cpu_fraction: raw
                .cpu
                .filter(|c| c.is_finite() && *c >= 0.0)
                .map(|c| c.min(1.0)),
            memory_used_bytes: raw.mem,
            memory_max_bytes: raw.maxmem,
            uptime_seconds: raw.uptime,
        }
    }
}

/// One entry of `/nodes/{node}/lxc` or `/nodes/{node}/qemu`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GuestSummary {
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u64>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    pub maxmem: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    pub maxdisk: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
}

impl GuestSummary {
    pub fn power_state(&self) -> PowerState {
        PowerState::parse(self.status.as_deref())
    }

    pub fn is_running(&self) -> bool {
        self.power_state() == PowerState::Running
    }

    /// Proxmox lists containers by `name`; `hostname` wins when present.
    pub fn host_label(&self) -> Option<&str> {
        self.hostname.as_deref().or(self.name.as_deref())
    }
}

/// Node-level counters. Missing fields read as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    #[serde(rename = "uptime")]
    pub uptime_seconds: u64,
    #[serde(rename = "memory_used")]
    pub memory_used_bytes: u64,
    #[serde(rename = "memory_total")]
    pub memory_total_bytes: u64,
    #[serde(rename = "disk_used")]
    pub disk_used_bytes: u64,
    #[serde(rename = "disk_total")]
    pub disk_total_bytes: u64,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatusRaw {
    #[serde(default, deserialize_with = "lenient_u64")]
    uptime: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    memory: Option<UsageRaw>,
    #[serde(default, deserialize_with = "lenient")]
    disk: Option<UsageRaw>,
    #[serde(default, deserialize_with = "lenient")]
    rootfs: Option<UsageRaw>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageRaw {
    #[serde(default, deserialize_with = "lenient_u64")]
    used: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    total: Option<u64>,
}

impl From<NodeStatusRaw> for NodeStats {
    fn from(raw: NodeStatusRaw) -> Self {
        let memory = raw.memory.unwrap_or_default();
        let disk = raw.disk.or(raw.rootfs).unwrap_or_default();
        Self {
            uptime_seconds: raw.uptime.unwrap_or(0),
            memory_used_bytes: memory.used.unwrap_or(0),
            memory_total_bytes: memory.total.unwrap_or(0),
            disk_used_bytes: disk.used.unwrap_or(0),
            disk_total_bytes: disk.total.unwrap_or(0),
        }
    }
}

/// UPID of the task Proxmox queued for a start/stop request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TaskHandle(pub Option<String>);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_deref().unwrap_or("-"))
    }
}

#[derive(Clone)]
pub struct ProxmoxClient {
    http: Client,
    base_url: String,
    node: String,
    metrics: Option<Arc<Metrics>>,
}

impl ProxmoxClient {
    pub fn new(cfg: &ProxmoxConfig, token_secret: &str) -> Result<Self, ProxmoxError> {
        Self::with_base_url(cfg, token_secret, cfg.base_url())
    }

    pub fn with_base_url(
        cfg: &ProxmoxConfig,
        token_secret: &str,
        base_url: String,
    ) -> Result<Self, ProxmoxError> {
        let mut token = HeaderValue::from_str(&format!(
            "PVEAPIToken={}={}",
            cfg.token_id, token_secret
        ))
        .map_err(|_| ProxmoxError::Setup("API token contains invalid characters".to_string()))?;
        token.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, token);

        let http = Client::builder()
            .user_agent(concat!("pvebot/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|err| ProxmoxError::Setup(err.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            node: cfg.node.clone(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn container_status(&self, vmid: u32) -> Result<ContainerStatus, ProxmoxError> {
        let path = format!("nodes/{}/lxc/{vmid}/status/current", self.node);
        let raw: ContainerStatusRaw = self.request("container_status", Method::GET, &path).await?;
        Ok(raw.into())
    }

    pub async fn start_container(&self, vmid: u32) -> Result<TaskHandle, ProxmoxError> {
        let path = format!("nodes/{}/lxc/{vmid}/status/start", self.node);
        self.request("start_container", Method::POST, &path).await
    }

    /// Hard stop, not a guest shutdown.
    pub async fn stop_container(&self, vmid: u32) -> Result<TaskHandle, ProxmoxError> {
        let path = format!("nodes/{}/lxc/{vmid}/status/stop", self.node);
        self.request("stop_container", Method::POST, &path).await
    }

    pub async fn node_status(&self) -> Result<NodeStats, ProxmoxError> {
        let path = format!("nodes/{}/status", self.node);
        let raw: NodeStatusRaw = self.request("node_status", Method::GET, &path).await?;
        Ok(raw.into())
    }

    pub async fn list_containers(&self) -> Result<Vec<GuestSummary>, ProxmoxError> {
        let path = format!("nodes/{}/lxc", self.node);
        self.request("list_containers", Method::GET, &path).await
    }

    pub async fn list_vms(&self) -> Result<Vec<GuestSummary>, ProxmoxError> {
        let path = format!("nodes/{}/qemu", self.node);
        self.request("list_vms", Method::GET, &path).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
    ) -> Result<T, ProxmoxError> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_backend_request(op);
        }
        let result = self.execute(method, path).await;
        if let Err(err) = &result {
            warn!(op, path, error = %err, "Proxmox request failed");
            if let Some(metrics) = &self.metrics {
                metrics.inc_backend_error(op, err.kind());
            }
        }
        result
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
    ) -> Result<T, ProxmoxError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(%method, %url, "Proxmox request");

        let response = self
            .http
            .request(method, &url)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ProxmoxError::AuthFailure {
                    status: status.as_u16(),
                })
            }
            StatusCode::NOT_FOUND => {
                return Err(ProxmoxError::NotFound {
                    path: path.to_string(),
                })
            }
            s if !s.is_success() => {
                return Err(ProxmoxError::BackendUnavailable(format!(
                    "HTTP {s} for {path}"
                )))
            }
            _ => {}
        }

        let body = response.bytes().await.map_err(transport_error)?;
        decode_envelope(&body)
    }
}

fn transport_error(err: reqwest::Error) -> ProxmoxError {
    if err.is_timeout() {
        ProxmoxError::BackendUnavailable(format!("request timed out: {err}"))
    } else {
        ProxmoxError::BackendUnavailable(err.to_string())
    }
}

fn decode_envelope<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProxmoxError> {
    let mut value: Value = serde_json::from_slice(body)
        .map_err(|err| ProxmoxError::MalformedResponse(format!("body is not JSON: {err}")))?;
    let data = value
        .as_object_mut()
        .and_then(|obj| obj.remove("data"))
        .ok_or_else(|| ProxmoxError::MalformedResponse("missing `data` envelope".to_string()))?;
    serde_json::from_value(data).map_err(|err| ProxmoxError::MalformedResponse(err.to_string()))
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

// Some Proxmox versions send numeric ids and counters as strings.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        }),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
