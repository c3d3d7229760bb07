use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub pvebot_uptime_seconds: Gauge,
    pub pvebot_backend_requests_total: CounterVec,
    pub pvebot_backend_errors_total: CounterVec,
    pub pvebot_commands_total: CounterVec,
    pub pvebot_api_requests_total: CounterVec,
    pub pvebot_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let pvebot_uptime_seconds = Gauge::with_opts(opts!(
            "pvebot_uptime_seconds",
            "Seconds since the pvebot process started"
        ))?;
        let pvebot_backend_requests_total = CounterVec::new(
            opts!(
                "pvebot_backend_requests_total",
                "Requests sent to the Proxmox API by operation"
            ),
            &["op"],
        )?;
        let pvebot_backend_errors_total = CounterVec::new(
            opts!(
                "pvebot_backend_errors_total",
                "Failed Proxmox API requests by operation and error kind"
            ),
            &["op", "kind"],
        )?;
        let pvebot_commands_total = CounterVec::new(
            opts!(
                "pvebot_commands_total",
                "Chat commands handled by command name"
            ),
            &["command"],
        )?;
        let pvebot_api_requests_total = CounterVec::new(
            opts!(
                "pvebot_api_requests_total",
                "HTTP status API requests by endpoint"
            ),
            &["endpoint"],
        )?;
        let pvebot_scrape_count_total = Counter::with_opts(opts!(
            "pvebot_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &pvebot_uptime_seconds)?;
        register(&registry, &pvebot_backend_requests_total)?;
        register(&registry, &pvebot_backend_errors_total)?;
        register(&registry, &pvebot_commands_total)?;
        register(&registry, &pvebot_api_requests_total)?;
        register(&registry, &pvebot_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            pvebot_uptime_seconds,
            pvebot_backend_requests_total,
            pvebot_backend_errors_total,
            pvebot_commands_total,
            pvebot_api_requests_total,
            pvebot_scrape_count_total,
        }))
    }

    pub fn inc_scrape_count(&self) {
        self.pvebot_scrape_count_total.inc();
    }

    pub fn inc_backend_request(&self, op: &str) {
        self.pvebot_backend_requests_total
            .with_label_values(&[op])
            .inc();
    }

    pub fn inc_backend_error(&self, op: &str, kind: &str) {
        self.pvebot_backend_errors_total
            .with_label_values(&[op, kind])
            .inc();
    }

    pub fn inc_command(&self, command: &str) {
        self.pvebot_commands_total
            .with_label_values(&[command])
            .inc();
    }

    pub fn inc_api_request(&self, endpoint: &str) {
        self.pvebot_api_requests_total
            .with_label_values(&[endpoint])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix).max(0);
        self.pvebot_uptime_seconds.set(uptime as f64);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_output() {
        let metrics = Metrics::new().expect("metrics init");
        metrics.inc_backend_request("container_status");
        metrics.inc_backend_error("container_status", "BackendUnavailable");
        metrics.inc_command("status");

        let text = String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8");
        assert!(text.contains("pvebot_uptime_seconds"));
        assert!(text.contains("pvebot_backend_requests_total{op=\"container_status\"} 1"));
        assert!(text.contains("kind=\"BackendUnavailable\""));
        assert!(text.contains("pvebot_commands_total{command=\"status\"} 1"));
    }
}
