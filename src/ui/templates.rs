//! Embedded HTML templates for the dashboard pages.

use crate::proxy::ledger::{RequestRecord, StatsAggregate};

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title} - tollbooth</title>
<link rel="stylesheet" href="/ui/static/style.css">
</head>
<body>
<nav>
  <strong>tollbooth</strong>
  <a href="/ui/dashboard">Dashboard</a>
  <a href="/ui/logs">Logs</a>
  <a href="/ui/health">Health</a>
</nav>
{body}
</body>
</html>"#
    )
}

pub fn dashboard(stats: &StatsAggregate) -> String {
    let body = format!(
        r#"<h1>Dashboard</h1>
<div class="cards">
  <div class="card"><span class="value">{total}</span><span class="label">Total requests</span></div>
  <div class="card"><span class="value">{rate:.1}%</span><span class="label">Success rate</span></div>
  <div class="card"><span class="value">{avg:.0} ms</span><span class="label">Avg response time</span></div>
  <div class="card"><span class="value">{errors}</span><span class="label">Errors</span></div>
</div>"#,
        total = stats.total_requests,
        rate = stats.success_rate(),
        avg = stats.avg_response_time(),
        errors = stats.error_count,
    );
    page("Dashboard", &body)
}

pub fn logs(records: &[RequestRecord]) -> String {
    let mut rows = String::new();
    for record in records {
        let status = record
            .status_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());
        let error = record
            .error_kind
            .map(|kind| kind.to_string())
            .unwrap_or_default();
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{} ms</td><td>{}</td></tr>\n",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.method,
            record.path,
            status,
            if record.streaming { "stream" } else { "buffered" },
            record.upstream_latency_ms,
            error,
        ));
    }

    let body = format!(
        r#"<h1>Recent Requests</h1>
<table>
<thead><tr><th>Started</th><th>Method</th><th>Path</th><th>Status</th><th>Mode</th><th>Latency</th><th>Error</th></tr></thead>
<tbody>
{rows}</tbody>
</table>"#
    );
    page("Logs", &body)
}

pub fn health(stats: &StatsAggregate) -> String {
    let healthy = stats.total_requests == 0 || stats.success_rate() >= 50.0;
    let body = format!(
        r#"<h1>Health</h1>
<p class="{class}">{verdict}</p>
<p>{total} requests seen, {rate:.1}% successful.</p>"#,
        class = if healthy { "ok" } else { "bad" },
        verdict = if healthy { "Service healthy" } else { "Degraded" },
        total = stats.total_requests,
        rate = stats.success_rate(),
    );
    page("Health", &body)
}
