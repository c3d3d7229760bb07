//! Display helpers shared by the chat replies and the JSON API.

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Renders seconds as `2d 3h 5m`, dropping zero units. Seconds are kept when
/// nothing else is left, so `0` becomes `0s`.
pub fn format_uptime(seconds: Option<u64>) -> Option<String> {
    let seconds = seconds?;
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::with_capacity(4);
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if mins > 0 {
        parts.push(format!("{mins}m"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs}s"));
    }
    Some(parts.join(" "))
}

pub fn bytes_to_mib(bytes: u64) -> f64 {
    bytes as f64 / MIB
}

/// GiB rounded to two decimals.
pub fn bytes_to_gib(bytes: u64) -> f64 {
    round2(bytes as f64 / GIB)
}

/// `0.1234` -> `12.34%`.
pub fn format_cpu_fraction(fraction: Option<f64>) -> Option<String> {
    fraction
        .filter(|f| f.is_finite())
        .map(|f| format!("{:.2}%", f * 100.0))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
