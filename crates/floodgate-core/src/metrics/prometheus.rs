//! Prometheus text exposition.

use super::MetricsSnapshot;

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    out.push_str(&format!("# HELP {} {}\n", name, help));
    out.push_str(&format!("# TYPE {} {}\n", name, kind));
}

fn single<V: std::fmt::Display>(out: &mut String, name: &str, kind: &str, help: &str, value: V) {
    header(out, name, kind, help);
    out.push_str(&format!("{} {}\n\n", name, value));
}

impl MetricsSnapshot {
    /// Render in Prometheus text format with every metric named `{prefix}_*`.
    pub fn export_prometheus_text(&self, prefix: &str) -> String {
        let mut out = String::with_capacity(4096);
        let p = prefix;

        // === CACHE ===

        let cache = &self.cache;
        single(&mut out, &format!("{p}_cache_entries"), "gauge", "Entries in the hot cache", cache.size);
        single(&mut out, &format!("{p}_cache_capacity"), "gauge", "Hot cache capacity", cache.max_size);
        single(&mut out, &format!("{p}_cache_hits_total"), "counter", "Cache lookups that hit", cache.hits);
        single(&mut out, &format!("{p}_cache_misses_total"), "counter", "Cache lookups that missed", cache.misses);
        single(
            &mut out,
            &format!("{p}_cache_evictions_total"),
            "counter",
            "Entries evicted to make room",
            cache.evictions,
        );
        single(
            &mut out,
            &format!("{p}_cache_expirations_total"),
            "counter",
            "Entries removed after their TTL",
            cache.expirations,
        );
        single(&mut out, &format!("{p}_cache_hit_ratio"), "gauge", "Cache hit ratio", cache.hit_rate);

        // === RATE LIMITERS ===

        let labelled: [(&str, &str, &str, fn(&crate::rate_limit::RateLimiterStats) -> u64); 4] = [
            ("rate_limit_clients", "gauge", "Tracked clients", |s| s.clients as u64),
            ("rate_limit_allowed_total", "counter", "Requests admitted", |s| s.allowed),
            ("rate_limit_denied_total", "counter", "Requests denied", |s| s.denied),
            (
                "rate_limit_evicted_clients_total",
                "counter",
                "Client buckets evicted to admit new clients",
                |s| s.evicted_clients,
            ),
        ];
        for (name, kind, help, value) in labelled {
            let metric = format!("{p}_{name}");
            header(&mut out, &metric, kind, help);
            for limiter in &self.limiters {
                out.push_str(&format!(
                    "{}{{limiter=\"{}\"}} {}\n",
                    metric,
                    limiter.name,
                    value(limiter)
                ));
            }
            out.push('\n');
        }

        // === BATCH WRITER ===

        let w = &self.writer;
        single(&mut out, &format!("{p}_writer_buffer_depth"), "gauge", "Buffered operations", w.buffer_depth);
        single(&mut out, &format!("{p}_writer_buffer_capacity"), "gauge", "Buffer capacity", w.max_buffer_size);
        single(
            &mut out,
            &format!("{p}_writer_buffer_pressure"),
            "gauge",
            "Buffer depth over capacity",
            w.buffer_pressure,
        );
        single(&mut out, &format!("{p}_writer_ops_total"), "counter", "Operations accepted", w.total_ops);
        single(&mut out, &format!("{p}_writer_flushed_ops_total"), "counter", "Operations committed", w.flushed_ops);
        single(&mut out, &format!("{p}_writer_failed_flushes_total"), "counter", "Failed commits", w.failed_flushes);
        single(
            &mut out,
            &format!("{p}_writer_dropped_ops_total"),
            "counter",
            "Operations rejected or discarded",
            w.dropped_ops,
        );
        single(
            &mut out,
            &format!("{p}_writer_retried_ops_total"),
            "counter",
            "Operations returned to the buffer after a failed commit",
            w.retried_ops,
        );
        single(&mut out, &format!("{p}_writer_flushing"), "gauge", "1 while a flush runs", u8::from(w.flushing));

        // === CIRCUIT BREAKER ===

        let cb = &self.circuit_breaker;
        for (name, kind, help, value) in [
            ("circuit_breaker_state", "gauge", "0 closed, 1 half-open, 2 open", u64::from(cb.state.as_gauge())),
            ("circuit_breaker_rejected_total", "counter", "Calls refused while open", cb.rejected_calls),
            ("circuit_breaker_opened_total", "counter", "Times the circuit opened", cb.times_opened),
        ] {
            let metric = format!("{p}_{name}");
            header(&mut out, &metric, kind, help);
            out.push_str(&format!("{}{{name=\"{}\"}} {}\n\n", metric, cb.name, value));
        }

        // === HISTOGRAM ===

        let hist = &self.flush_duration;
        let metric = format!("{p}_flush_duration_seconds");
        header(&mut out, &metric, "histogram", "Duration of batch commits");
        for (le, count) in &hist.buckets {
            out.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", metric, le, count));
        }
        out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", metric, hist.count));
        out.push_str(&format!("{}_sum {}\n", metric, hist.sum_seconds));
        out.push_str(&format!("{}_count {}\n", metric, hist.count));

        out
    }
}
