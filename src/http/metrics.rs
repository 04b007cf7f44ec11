//! `/metrics` text exposition (component G/I ambient surface).
//!
//! No metrics crate appears anywhere in the reference corpus for this
//! stack, so counters are plain `std::sync::atomic`/`DashMap` values living
//! on [`AppState`](crate::state::AppState) (incremented by the same refresh
//! orchestration that publishes events) and this module renders them in
//! Prometheus text-exposition format by hand, per `SPEC_FULL.md` §4.G.

use std::fmt::Write as _;

use crate::state::{AppState, DURATION_BUCKETS};

pub fn render(state: &AppState) -> String {
    let counters = &state.counters;
    let mut out = String::new();

    out.push_str("# HELP goblet_requests_total Total requests, by command and outcome.\n");
    out.push_str("# TYPE goblet_requests_total counter\n");
    for ((command, outcome), count) in counters.requests_iter() {
        let _ = writeln!(
            out,
            "goblet_requests_total{{command=\"{command}\",outcome=\"{outcome}\"}} {count}"
        );
    }

    out.push_str("# HELP goblet_bytes_out_total Total response bytes written to clients.\n");
    out.push_str("# TYPE goblet_bytes_out_total counter\n");
    let _ = writeln!(out, "goblet_bytes_out_total {}", counters.bytes_out_total());

    out.push_str("# HELP goblet_upstream_errors_total Upstream contact failures, by kind.\n");
    out.push_str("# TYPE goblet_upstream_errors_total counter\n");
    for (kind, count) in counters.upstream_errors_iter() {
        let _ = writeln!(out, "goblet_upstream_errors_total{{kind=\"{kind}\"}} {count}");
    }

    out.push_str("# HELP goblet_fallback_stale_total Requests served from a stale mirror after an upstream failure.\n");
    out.push_str("# TYPE goblet_fallback_stale_total counter\n");
    let _ = writeln!(out, "goblet_fallback_stale_total {}", counters.fallback_stale_total());

    out.push_str("# HELP goblet_request_duration_seconds Request latency up to the first response byte, by command.\n");
    out.push_str("# TYPE goblet_request_duration_seconds histogram\n");
    for (command, cumulative_counts, sum_seconds, count) in counters.duration_histograms() {
        for (bound, cumulative) in DURATION_BUCKETS.iter().zip(cumulative_counts.iter()) {
            let _ = writeln!(
                out,
                "goblet_request_duration_seconds_bucket{{command=\"{command}\",le=\"{bound}\"}} {cumulative}"
            );
        }
        let _ = writeln!(
            out,
            "goblet_request_duration_seconds_bucket{{command=\"{command}\",le=\"+Inf\"}} {count}"
        );
        let _ = writeln!(
            out,
            "goblet_request_duration_seconds_sum{{command=\"{command}\"}} {sum_seconds}"
        );
        let _ = writeln!(
            out,
            "goblet_request_duration_seconds_count{{command=\"{command}\"}} {count}"
        );
    }

    out.push_str("# HELP goblet_inflight_dedup Refreshes currently deduplicating concurrent callers.\n");
    out.push_str("# TYPE goblet_inflight_dedup gauge\n");
    let _ = writeln!(out, "goblet_inflight_dedup {}", state.refresh_flight.inflight_count());

    out.push_str("# HELP goblet_repos_total Mirrors currently open in this process.\n");
    out.push_str("# TYPE goblet_repos_total gauge\n");
    let _ = writeln!(out, "goblet_repos_total {}", state.mirrors.open_count());

    out.push_str("# HELP goblet_events_dropped_total Events dropped because the event queue was full.\n");
    out.push_str("# TYPE goblet_events_dropped_total counter\n");
    let _ = writeln!(out, "goblet_events_dropped_total {}", state.events.dropped_count());

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn render_includes_every_metric_name() {
        let (state, _rx) = AppState::new(
            tempfile::tempdir().unwrap().keep(),
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(1),
            16,
            std::time::Duration::from_secs(30),
        );
        state.counters.record_request("fetch", "hit");
        state.counters.add_bytes_out(42);
        state.counters.observe_duration("fetch", std::time::Duration::from_millis(5));
        let rendered = render(&state);

        assert!(rendered.contains("goblet_requests_total{command=\"fetch\",outcome=\"hit\"} 1"));
        assert!(rendered.contains("goblet_bytes_out_total 42"));
        assert!(rendered.contains("goblet_upstream_errors_total"));
        assert!(rendered.contains("goblet_fallback_stale_total 0"));
        assert!(rendered.contains("goblet_request_duration_seconds_bucket{command=\"fetch\""));
        assert!(rendered.contains("goblet_request_duration_seconds_sum{command=\"fetch\"}"));
        assert!(rendered.contains("goblet_request_duration_seconds_count{command=\"fetch\"} 1"));
        assert!(rendered.contains("goblet_inflight_dedup 0"));
        assert!(rendered.contains("goblet_repos_total 0"));
        assert!(rendered.contains("goblet_events_dropped_total 0"));
    }
}
