//! Process configuration (ambient stack): CLI flags via `clap`, with
//! environment variable fallback, following `bit-upload-pack`'s and
//! `git-server`'s use of `clap` (derive + env) in the reference corpus. The
//! duration-string parsing (`"5m"`, `"30s"`) follows the teacher's
//! `config.rs` convention of a small custom parser for a human-friendly
//! config shape rather than requiring callers to spell out nanoseconds.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "goblet", about = "Read-through cache for Git Smart-HTTP v2 origins")]
pub struct GobletConfig {
    /// TCP port to listen on.
    #[arg(long, env = "GOBLET_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory under which bare mirror repositories are stored.
    #[arg(long, env = "GOBLET_CACHE_ROOT", default_value = "./goblet-cache")]
    pub cache_root: PathBuf,

    /// Deadline for any single upstream git operation, e.g. "30s".
    #[arg(long, env = "GOBLET_UPSTREAM_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub upstream_timeout: Duration,

    /// Total deadline for a request up to its first response byte (spec:
    /// "on timeout before first byte: HTTP 504"), e.g. "60s".
    #[arg(long, env = "GOBLET_REQUEST_TIMEOUT", default_value = "60s", value_parser = parse_duration)]
    pub request_timeout: Duration,

    /// How long a mirror is considered fresh before a refresh is attempted,
    /// e.g. "5m".
    #[arg(long, env = "GOBLET_FRESHNESS_WINDOW", default_value = "5m", value_parser = parse_duration)]
    pub freshness_window: Duration,

    /// Bounded event queue capacity before events are dropped.
    #[arg(long, env = "GOBLET_EVENT_QUEUE_CAPACITY", default_value_t = 1024)]
    pub event_queue_capacity: usize,
}

/// Parses `"<number><unit>"` where unit is `s`, `m`, or `h`. Kept
/// deliberately small: Goblet's own config surface never needs sub-second
/// resolution or compound durations like `"1h30m"`.
fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (digits, unit) = text.split_at(
        text.find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration {text:?} is missing a unit (s/m/h)"))?,
    );
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration number in {text:?}"))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => return Err(format!("unknown duration unit {other:?}, expected s/m/h")),
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_minutes_hours() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn rejects_unknown_unit_and_missing_unit() {
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("10").is_err());
    }
}
