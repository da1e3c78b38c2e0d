use super::MetricsStore;
use std::fmt::Write;

/// Render the latest value of every label set in Prometheus text exposition
/// format. Every series is exported as a gauge.
pub fn export_prometheus(store: &MetricsStore) -> String {
    let mut out = String::new();

    for name in store.names() {
        let metric_name = sanitize_name(&name);
        let help = store.help_for(&name).unwrap_or_else(|| name.clone());

        let _ = writeln!(out, "# HELP {} {}", metric_name, escape_help(&help));
        let _ = writeln!(out, "# TYPE {} gauge", metric_name);

        for metric in store.latest_by_labels(&name) {
            if metric.labels.is_empty() {
                let _ = writeln!(out, "{} {}", metric_name, format_value(metric.value));
            } else {
                let labels = metric
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{}=\"{}\"", sanitize_name(k), escape_label(v)))
                    .collect::<Vec<_>>()
                    .join(",");
                let _ = writeln!(
                    out,
                    "{}{{{}}} {}",
                    metric_name,
                    labels,
                    format_value(metric.value)
                );
            }
        }
    }

    out
}

fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}
