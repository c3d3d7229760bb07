use crate::config::TelegramConfig;
use crate::control::{self, ControlAction, ControlOutcome};
use crate::format::{bytes_to_mib, format_cpu_fraction, format_uptime};
use crate::metrics::Metrics;
use crate::proxmox::{ContainerStatus, PowerState, ProxmoxClient, ProxmoxError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatAction, Message, ParseMode};
use teloxide::utils::html::escape;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),
}

/// The one container the bot reports on and controls.
#[derive(Clone)]
pub struct MonitoredContainer {
    pub client: ProxmoxClient,
    pub vmid: u32,
    pub label: String,
}

#[derive(Clone)]
struct BotRuntime {
    allowed_chats: HashSet<i64>,
    control_chats: HashSet<i64>,
    limiter: Arc<Mutex<RateLimiter>>,
    container: Option<MonitoredContainer>,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Help,
    Ping,
    Status,
    Start,
    Stop,
}

impl Action {
    fn from_command(text: &str) -> Option<Self> {
        let first = text.split_whitespace().next()?;
        let normalized = first.split('@').next()?.to_lowercase();
        match normalized.as_str() {
            // `/start` is what Telegram sends when a chat is opened, so it must
            // never touch the container.
            "/start" | "/help" => Some(Self::Help),
            "/ping" => Some(Self::Ping),
            "/status" => Some(Self::Status),
            "/ct_start" => Some(Self::Start),
            "/ct_stop" => Some(Self::Stop),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Ping => "ping",
            Self::Status => "status",
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }

    fn control(self) -> Option<ControlAction> {
        match self {
            Self::Start => Some(ControlAction::Start),
            Self::Stop => Some(ControlAction::Stop),
            _ => None,
        }
    }

    fn calls_backend(self) -> bool {
        matches!(self, Self::Status | Self::Start | Self::Stop)
    }
}

pub async fn run_bot(
    bot: Bot,
    cfg: TelegramConfig,
    container: Option<MonitoredContainer>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TelegramError> {
    bot.set_my_commands(command_list()).await?;

    let runtime = BotRuntime {
        allowed_chats: cfg.allowed_chat_ids.iter().copied().collect(),
        control_chats: cfg.control_chat_ids.iter().copied().collect(),
        limiter: Arc::new(Mutex::new(RateLimiter::new(cfg.rate_limit_per_minute))),
        container,
        metrics,
    };

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![runtime])
        .build();

    let mut dispatch_handle = tokio::spawn(async move {
        dispatcher.dispatch().await;
    });

    tokio::select! {
        _ = shutdown.changed() => {
            dispatch_handle.abort();
            let _ = (&mut dispatch_handle).await;
            info!("Telegram bot stopped");
            Ok(())
        }
        result = &mut dispatch_handle => {
            match result {
                Ok(()) => Ok(()),
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => {
                    warn!(error = %join_err, "Telegram dispatcher task failed");
                    Ok(())
                }
            }
        }
    }
}

fn command_list() -> Vec<BotCommand> {
    vec![
        BotCommand::new("ping", "check that the bot is alive"),
        BotCommand::new("status", "show the container status"),
        BotCommand::new("ct_start", "start the container"),
        BotCommand::new("ct_stop", "stop the container (hard stop)"),
        BotCommand::new("help", "list commands"),
    ]
}

/// Where a parsed command stands after the chat checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Ignore,
    RateLimited,
    Forbidden,
    Proceed,
}

// Unauthorized chats never reach the limiter. Forbidden control attempts do.
async fn admit(runtime: &BotRuntime, is_private: bool, chat_id: i64, action: Action) -> Admission {
    if !should_handle_message(is_private, chat_id, &runtime.allowed_chats) {
        return Admission::Ignore;
    }
    if !consume_rate_limit(runtime, chat_id).await {
        return Admission::RateLimited;
    }
    if action.control().is_some() && !may_control(chat_id, &runtime.control_chats) {
        return Admission::Forbidden;
    }
    Admission::Proceed
}

async fn handle_message(bot: Bot, msg: Message, runtime: BotRuntime) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(action) = msg.text().and_then(Action::from_command) else {
        return Ok(());
    };

    match admit(&runtime, msg.chat.is_private(), chat_id, action).await {
        Admission::Ignore => return Ok(()),
        Admission::RateLimited => {
            bot.send_message(msg.chat.id, "Too many requests. Try again in a minute.")
                .await?;
            return Ok(());
        }
        Admission::Forbidden => {
            runtime.metrics.inc_command(action.name());
            warn!(chat_id, command = action.name(), "control command from non-control chat");
            bot.send_message(
                msg.chat.id,
                "This chat is not allowed to start or stop the container.",
            )
            .await?;
            return Ok(());
        }
        Admission::Proceed => {}
    }

    runtime.metrics.inc_command(action.name());
    debug!(chat_id, command = action.name(), "handling command");

    // Acknowledge before a backend round trip so the user sees progress.
    if action.calls_backend() && runtime.container.is_some() {
        if let Err(err) = bot.send_chat_action(msg.chat.id, ChatAction::Typing).await {
            debug!(chat_id, error = %err, "failed to send typing action");
        }
    }

    let text = render_action(action, runtime.container.as_ref()).await;
    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

async fn render_action(action: Action, container: Option<&MonitoredContainer>) -> String {
    match action {
        Action::Help => help_text(),
        Action::Ping => ping_text(container),
        Action::Status => {
            let Some(target) = container else {
                return not_configured_text();
            };
            match target.client.container_status(target.vmid).await {
                Ok(status) => format_status(&status, target),
                Err(err) => {
                    error!(vmid = target.vmid, error = %err, "failed to fetch container status");
                    format_failure(&format!("Error talking to Proxmox about {}", target.label), &err)
                }
            }
        }
        Action::Start => run_control(ControlAction::Start, container).await,
        Action::Stop => run_control(ControlAction::Stop, container).await,
    }
}

async fn run_control(action: ControlAction, container: Option<&MonitoredContainer>) -> String {
    let Some(target) = container else {
        return not_configured_text();
    };
    match control::apply(&target.client, target.vmid, action).await {
        Ok(outcome) => format_outcome(&outcome, target),
        Err(err) => {
            error!(vmid = target.vmid, action = ?action, error = %err, "control command failed");
            let verb = match action {
                ControlAction::Start => "starting",
                ControlAction::Stop => "stopping",
            };
            format_failure(&format!("Error {verb} {}", target.label), &err)
        }
    }
}

fn help_text() -> String {
    [
        "<b>Commands</b>",
        "• /ping - check that the bot is alive",
        "• /status - container status",
        "• /ct_start - start the container",
        "• /ct_stop - stop the container (hard stop)",
    ]
    .join("\n")
}

fn ping_text(container: Option<&MonitoredContainer>) -> String {
    match container {
        Some(target) => format!(
            "pong ✅ pvebot is alive (node {}, CT {}).",
            escape(target.client.node()),
            target.vmid
        ),
        None => "pong ✅ pvebot is alive (Proxmox not configured).".to_string(),
    }
}

fn not_configured_text() -> String {
    "Proxmox is not configured yet; ask the admin to fill in the <code>proxmox</code> section of the config."
        .to_string()
}

fn format_status(status: &ContainerStatus, target: &MonitoredContainer) -> String {
    render_status(status, &target.label, target.client.node(), target.vmid)
}

fn render_status(status: &ContainerStatus, label: &str, node: &str, vmid: u32) -> String {
    let icon = match status.status {
        PowerState::Running => "🟢",
        PowerState::Stopped => "🔴",
        PowerState::Unknown => "⚪",
    };

    let mut lines = vec![
        format!("{icon} <b>{} CT {vmid}</b>", escape(label)),
        format!(
            "Status: <b>{}</b>",
            status.status.as_str().to_uppercase()
        ),
    ];

    if let Some(name) = status.name.as_deref().filter(|n| !n.trim().is_empty()) {
        lines.push(format!("Hostname: <code>{}</code>", escape(name)));
    }
    if let Some(cpu) = format_cpu_fraction(status.cpu_fraction) {
        lines.push(format!("CPU: <code>{cpu}</code>"));
    }
    if let (Some(used), Some(max)) = (status.memory_used_bytes, status.memory_max_bytes) {
        lines.push(format!(
            "RAM: <code>{:.0} / {:.0} MiB</code>",
            bytes_to_mib(used),
            bytes_to_mib(max)
        ));
    }
    if status.status == PowerState::Running {
        if let Some(uptime) = format_uptime(status.uptime_seconds) {
            lines.push(format!("Uptime: <code>{uptime}</code>"));
        }
    }
    lines.push(format!("Node: {} • CTID: {vmid}", escape(node)));
    lines.join("\n")
}

fn format_outcome(outcome: &ControlOutcome, target: &MonitoredContainer) -> String {
    render_outcome(outcome, &target.label, target.vmid)
}

fn render_outcome(outcome: &ControlOutcome, label: &str, vmid: u32) -> String {
    let label = escape(label);
    match outcome {
        ControlOutcome::AlreadyRunning => format!("{label} is already <b>running</b> ✅"),
        ControlOutcome::AlreadyStopped => format!("{label} is already <b>stopped</b> ✅"),
        ControlOutcome::StartRequested(task) => format!(
            "Start request sent to Proxmox for {label} (CT {vmid}). Give it a few seconds to boot.\nTask: <code>{}</code>",
            escape(&task.to_string())
        ),
        ControlOutcome::StopRequested(task) => format!(
            "Stop request sent to Proxmox for {label} (CT {vmid}).\nTask: <code>{}</code>",
            escape(&task.to_string())
        ),
    }
}

fn format_failure(prefix: &str, err: &ProxmoxError) -> String {
    format!(
        "{}: <code>{}: {}</code>",
        escape(prefix),
        err.kind(),
        escape(&err.to_string())
    )
}

pub fn should_handle_message(is_private: bool, chat_id: i64, allowed: &HashSet<i64>) -> bool {
    is_private && allowed.contains(&chat_id)
}

fn may_control(chat_id: i64, control_chats: &HashSet<i64>) -> bool {
    control_chats.is_empty() || control_chats.contains(&chat_id)
}

async fn consume_rate_limit(runtime: &BotRuntime, chat_id: i64) -> bool {
    let now = now_unix();
    let mut limiter = runtime.limiter.lock().await;
    limiter.allow(chat_id, now)
}

/// Sliding one-minute window per chat.
#[derive(Debug)]
struct RateLimiter {
    limit_per_minute: u32,
    timestamps_by_chat: HashMap<i64, VecDeque<i64>>,
}

impl RateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            timestamps_by_chat: HashMap::new(),
        }
    }

    fn allow(&mut self, chat_id: i64, now_unix: i64) -> bool {
        let queue = self.timestamps_by_chat.entry(chat_id).or_default();
        while queue.front().is_some_and(|ts| now_unix - ts >= 60) {
            queue.pop_front();
        }

        if queue.len() >= self.limit_per_minute as usize {
            return false;
        }

        queue.push_back(now_unix);
        true
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
