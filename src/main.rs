mod config;
mod control;
mod format;
mod http;
mod metrics;
mod proxmox;
mod stats;
mod telegram;
#[cfg(test)]
mod test_support;

use axum::serve;
use clap::Parser;
use config::{non_empty_env, Config, ProxmoxConfig};
use metrics::Metrics;
use proxmox::ProxmoxClient;
use stats::StatsService;
use std::net::SocketAddr;
use std::sync::Arc;
use telegram::MonitoredContainer;
use teloxide::Bot;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pvebot")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, conflicts_with = "telegram_off")]
    telegram_on: bool,
    #[arg(long, conflicts_with = "telegram_on")]
    telegram_off: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if cli.telegram_on {
        cfg.telegram.enabled = true;
    } else if cli.telegram_off {
        cfg.telegram.enabled = false;
    }

    let telegram_token = if cfg.telegram.enabled {
        match ensure_telegram_settings(&cfg) {
            Ok(token) => Some(token),
            Err(err) => {
                error!(error = %err, "invalid Telegram settings");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let container = connect_proxmox(cfg.proxmox.as_ref(), metrics.clone());

    info!(
        listen = %cfg.listen,
        proxmox = container.as_ref().map(|c| c.client.node()).unwrap_or("-"),
        telegram = cfg.telegram.enabled,
        "starting pvebot"
    );

    let stats = Arc::new(StatsService::new(
        container.as_ref().map(|c| c.client.clone()),
        cfg.stats.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let metrics = metrics.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, stats);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let telegram_task = telegram_token.map(|token| {
        let bot = Bot::new(token);
        let telegram_cfg = cfg.telegram.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) =
                telegram::run_bot(bot, telegram_cfg, container, metrics, shutdown).await
            {
                error!(error = %err, "Telegram task failed");
            }
        })
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    if let Some(task) = telegram_task {
        let _ = task.await;
    }
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `None` leaves every Proxmox-backed feature answering "not configured".
fn connect_proxmox(
    cfg: Option<&ProxmoxConfig>,
    metrics: Arc<Metrics>,
) -> Option<MonitoredContainer> {
    let Some(cfg) = cfg else {
        warn!("no proxmox section in config; status and control commands are disabled");
        return None;
    };
    match build_client(cfg, metrics) {
        Ok(container) => Some(container),
        Err(err) => {
            warn!(error = %err, "Proxmox backend disabled");
            None
        }
    }
}

fn build_client(
    cfg: &ProxmoxConfig,
    metrics: Arc<Metrics>,
) -> Result<MonitoredContainer, String> {
    let missing = cfg.missing_fields();
    let Some(vmid) = cfg.container_id.filter(|_| missing.is_empty()) else {
        return Err(format!(
            "proxmox section is incomplete, missing: {}",
            missing.join(", ")
        ));
    };
    let secret = cfg.resolve_token_secret().ok_or_else(|| {
        format!(
            "Proxmox token secret not found: set '{}' in the environment or proxmox.token_secret in config",
            cfg.token_secret_env
        )
    })?;
    let client = ProxmoxClient::new(cfg, &secret).map_err(|err| err.to_string())?;
    Ok(MonitoredContainer {
        client: client.with_metrics(metrics),
        vmid,
        label: cfg.display_name.clone(),
    })
}

fn ensure_telegram_settings(cfg: &Config) -> Result<String, String> {
    let env_name = &cfg.telegram.bot_token_env;
    let cfg_token = cfg
        .telegram
        .bot_token
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    if cfg.telegram.allowed_chat_ids.is_empty() {
        return Err(
            "telegram.allowed_chat_ids is empty: list at least one chat id in config".to_string(),
        );
    }

    if let Some(v) = non_empty_env(env_name) {
        return Ok(v);
    }
    if let Some(v) = cfg_token {
        return Ok(v);
    }

    Err(format!(
        "Telegram token not found: set '{env_name}' in the environment or telegram.bot_token in config"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatsConfig;
    use crate::stats::StatsError;
    use crate::test_support::proxmox_config;

    #[tokio::test]
    async fn incomplete_proxmox_section_ends_in_not_configured() {
        let metrics = Metrics::new().expect("metrics init");
        let mut cfg = proxmox_config();
        cfg.node = String::new();
        cfg.container_id = None;

        let err = build_client(&cfg, metrics.clone())
            .err()
            .expect("incomplete section has no client");
        assert!(err.contains("node, container_id"), "{err}");

        let container = connect_proxmox(Some(&cfg), metrics.clone());
        assert!(container.is_none());

        let stats = StatsService::new(
            container.map(|c| c.client),
            StatsConfig::default(),
        );
        assert!(matches!(
            stats.all_stats().await,
            Err(StatsError::NotConfigured)
        ));
    }

    #[test]
    fn complete_section_builds_the_monitored_container() {
        let metrics = Metrics::new().expect("metrics init");
        let container =
            connect_proxmox(Some(&proxmox_config()), metrics).expect("complete section");
        assert_eq!(container.vmid, 2000);
        assert_eq!(container.label, "Cartofia");
        assert_eq!(container.client.node(), "pve");
    }

    #[test]
    fn missing_section_is_not_configured() {
        let metrics = Metrics::new().expect("metrics init");
        assert!(connect_proxmox(None, metrics).is_none());
    }
}
