//! Start/stop with a status pre-check.
//!
//! A container already in the target state gets no mutation request. Anything
//! else, including an undeterminable state, is sent to Proxmox. Completion is
//! not polled: the returned task handle is all we know.

use crate::proxmox::{PowerState, ProxmoxClient, ProxmoxError, TaskHandle};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    AlreadyRunning,
    AlreadyStopped,
    StartRequested(TaskHandle),
    StopRequested(TaskHandle),
}

/// Errors from either the pre-check or the mutation are returned as-is; an
/// unreachable backend is never treated as "stopped".
pub async fn apply(
    client: &ProxmoxClient,
    vmid: u32,
    action: ControlAction,
) -> Result<ControlOutcome, ProxmoxError> {
    let current = client.container_status(vmid).await?.status;

    match (action, current) {
        (ControlAction::Start, PowerState::Running) => Ok(ControlOutcome::AlreadyRunning),
        (ControlAction::Stop, PowerState::Stopped) => Ok(ControlOutcome::AlreadyStopped),
        (ControlAction::Start, _) => {
            let task = client.start_container(vmid).await?;
            info!(vmid, node = client.node(), from = %current, task = %task, "start requested");
            Ok(ControlOutcome::StartRequested(task))
        }
        (ControlAction::Stop, _) => {
            let task = client.stop_container(vmid).await?;
            info!(vmid, node = client.node(), from = %current, task = %task, "stop requested");
            Ok(ControlOutcome::StopRequested(task))
        }
    }
}
