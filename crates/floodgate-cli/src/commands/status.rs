//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health report from the gateway.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    serving: bool,
    #[serde(default)]
    uptime_seconds: u64,
    components: BTreeMap<String, ComponentStatus>,
}

/// Component status from the gateway.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    reason: Option<String>,
}

/// Show health and metrics of a running gateway.
pub async fn run(url: &str) -> Result<()> {
    let base = url.trim_end_matches('/');
    println!("Checking health at {}...\n", base);

    let client = reqwest::Client::new();

    match client.get(format!("{base}/health")).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the floodgate gateway running?");
            println!("Start it with: floodgate serve --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = format!("{base}/metrics");
    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!(
        "Serving: {}   Uptime: {}s",
        if health.serving { "yes" } else { "no" },
        health.uptime_seconds
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let tag = status_tag(&status.status);
            match &status.reason {
                Some(reason) => println!("  {} {}: {} ({})", tag, name, status.status, reason),
                None => println!("  {} {}: {}", tag, name, status.status),
            }
        }
    }
}

/// Parse Prometheus text into `series -> value`, labels included in the key.
fn parse_metrics(metrics_text: &str) -> HashMap<&str, f64> {
    let mut values = HashMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        if let Some((series, value)) = line.rsplit_once(' ') {
            if let Ok(value) = value.parse::<f64>() {
                values.insert(series, value);
            }
        }
    }

    values
}

fn print_metrics(metrics_text: &str) {
    let values = parse_metrics(metrics_text);
    if values.is_empty() {
        println!("No metrics available yet.");
        return;
    }

    let count = |series: &str| values.get(series).map(|v| format_number(*v as u64));

    if let Some(v) = count("floodgate_cache_hits_total") {
        println!("Cache Hits:          {}", v);
    }
    if let Some(v) = count("floodgate_cache_misses_total") {
        println!("Cache Misses:        {}", v);
    }
    if let Some(v) = values.get("floodgate_cache_hit_ratio") {
        println!("Cache Hit Ratio:     {:.1}%", v * 100.0);
    }
    for limiter in ["global", "endpoint", "write"] {
        let denied = format!("floodgate_rate_limit_denied_total{{limiter=\"{limiter}\"}}");
        if let Some(v) = count(&denied) {
            println!("Denied ({:<8}):   {}", limiter, v);
        }
    }
    if let Some(v) = count("floodgate_writer_buffer_depth") {
        println!("Buffered Writes:     {}", v);
    }
    if let Some(v) = count("floodgate_writer_flushed_ops_total") {
        println!("Writes Committed:    {}", v);
    }
    if let Some(v) = count("floodgate_writer_failed_flushes_total") {
        println!("Failed Flushes:      {}", v);
    }
    if let Some(v) = count("floodgate_writer_dropped_ops_total") {
        println!("Dropped Writes:      {}", v);
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
        assert_eq!(format_number(3_000_000_000), "3.00B");
    }

    #[test]
    fn test_parse_metrics_keeps_labels() {
        let text = "# HELP x y\n\
                    floodgate_cache_hits_total 4\n\
                    floodgate_rate_limit_denied_total{limiter=\"endpoint\"} 2\n\
                    floodgate_cache_hit_ratio 0.5\n";
        let values = parse_metrics(text);
        assert_eq!(values["floodgate_cache_hits_total"], 4.0);
        assert_eq!(
            values["floodgate_rate_limit_denied_total{limiter=\"endpoint\"}"],
            2.0
        );
        assert_eq!(values["floodgate_cache_hit_ratio"], 0.5);
    }

    #[test]
    fn test_health_response_parses_report() {
        let json = r#"{
            "status": "degraded",
            "serving": true,
            "uptime_seconds": 12,
            "components": {
                "batch_writer": {"status": "degraded", "reason": "buffer at 85%"},
                "cache": {"status": "healthy"}
            }
        }"#;
        let health: HealthResponse = serde_json::from_str(json).unwrap();
        assert_eq!(health.status, "degraded");
        assert_eq!(
            health.components["batch_writer"].reason.as_deref(),
            Some("buffer at 85%")
        );
        assert!(health.components["cache"].reason.is_none());
    }
}
