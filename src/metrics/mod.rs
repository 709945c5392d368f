use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Encoder, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec, TextEncoder,
};

static FRONT_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "respgate_front_connections",
        "currently open client connections"
    ))
    .expect("front connections gauge registration must succeed")
});

static FRONT_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "respgate_front_connections_total",
        "client connections accepted since start"
    ))
    .expect("front connections counter registration must succeed")
});

static COMMANDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "respgate_commands_total",
            "client commands grouped by dispatch outcome"
        ),
        &["outcome"]
    )
    .expect("command counter registration must succeed")
});

static AUTH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("respgate_auth_total", "authentication attempts by result"),
        &["result"]
    )
    .expect("auth counter registration must succeed")
});

static FORWARD_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "respgate_forward_duration_seconds",
        "time spent binding a backend and enqueueing one request",
        vec![0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .expect("forward histogram registration must succeed")
});

static BACKEND_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "respgate_backend_errors_total",
            "backend errors grouped by address and kind"
        ),
        &["backend", "kind"]
    )
    .expect("backend error counter registration must succeed")
});

static BACKEND_CONNS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!(
            "respgate_backend_connections",
            "live pooled connections per backend"
        ),
        &["backend"]
    )
    .expect("backend connection gauge registration must succeed")
});

static POOL_IDLE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!(
            "respgate_pool_idle_connections",
            "idle pooled connections per backend"
        ),
        &["backend"]
    )
    .expect("pool idle gauge registration must succeed")
});

static POOL_ACQUISITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "respgate_pool_acquisitions_total",
            "pool slot acquisitions grouped by kind"
        ),
        &["backend", "kind"]
    )
    .expect("pool acquisition counter registration must succeed")
});

static POOL_STALE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "respgate_pool_stale_total",
            "pooled connections discarded as stale or unhealthy"
        ),
        &["backend"]
    )
    .expect("pool stale counter registration must succeed")
});

static GLOBAL_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "respgate_global_errors_total",
        "errors not attributable to one backend"
    ))
    .expect("global error counter registration must succeed")
});

pub fn front_conn_open() {
    FRONT_CONNECTIONS.inc();
    FRONT_CONNECTIONS_TOTAL.inc();
}

pub fn front_conn_close() {
    FRONT_CONNECTIONS.dec();
}

pub fn command(outcome: &str) {
    COMMANDS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn auth_result(result: &str) {
    AUTH_TOTAL.with_label_values(&[result]).inc();
}

pub fn forward_timer() -> prometheus::HistogramTimer {
    FORWARD_DURATION.start_timer()
}

pub fn backend_error(backend: &str, kind: &str) {
    BACKEND_ERRORS.with_label_values(&[backend, kind]).inc();
}

pub fn backend_conns(backend: &str, count: usize) {
    BACKEND_CONNS
        .with_label_values(&[backend])
        .set(count as i64);
}

pub fn pool_idle(backend: &str, count: usize) {
    POOL_IDLE.with_label_values(&[backend]).set(count as i64);
}

pub fn pool_acquisition(backend: &str, kind: &str) {
    POOL_ACQUISITIONS.with_label_values(&[backend, kind]).inc();
}

pub fn pool_stale(backend: &str) {
    POOL_STALE.with_label_values(&[backend]).inc();
}

pub fn global_error_incr() {
    GLOBAL_ERRORS.inc();
}

/// Prometheus text exposition of the default registry.
pub fn gather_text() -> String {
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// JSON snapshot for the in-memory sink: metric name to flat samples.
pub fn gather_json() -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for family in prometheus::gather() {
        let mut samples = Vec::new();
        for metric in family.get_metric() {
            let labels: serde_json::Map<String, serde_json::Value> = metric
                .get_label()
                .iter()
                .map(|pair| {
                    (
                        pair.get_name().to_string(),
                        serde_json::Value::String(pair.get_value().to_string()),
                    )
                })
                .collect();
            let value = if metric.has_counter() {
                metric.get_counter().get_value()
            } else if metric.has_gauge() {
                metric.get_gauge().get_value()
            } else if metric.has_histogram() {
                metric.get_histogram().get_sample_sum()
            } else {
                0.0
            };
            samples.push(serde_json::json!({ "labels": labels, "value": value }));
        }
        out.insert(
            family.get_name().to_string(),
            serde_json::Value::Array(samples),
        );
    }
    serde_json::Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_export() {
        front_conn_open();
        command("forwarded");
        auth_result("ok");
        backend_error("127.0.0.1:6379", "unavailable");
        pool_acquisition("127.0.0.1:6379", "immediate");
        front_conn_close();

        let text = gather_text();
        assert!(text.contains("respgate_commands_total"));
        assert!(text.contains("respgate_backend_errors_total"));

        let json = gather_json();
        assert!(json.get("respgate_auth_total").is_some());
    }
}
