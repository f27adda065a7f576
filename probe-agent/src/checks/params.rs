//! Lenient accessors for task parameters and the time formats used in payloads.
//! Accessors never fail, anything unusable falls back to the given default.

use std::time::Duration;

use itertools::Itertools;
use queue_models::task::{Parameters, TIMEOUT_PARAM};
use serde_json::Value;

pub fn string_param(params: &Parameters, key: &str, fallback: &str) -> String {
    match params.get(key) {
        Some(Value::String(it)) if !it.is_empty() => it.clone(),
        Some(Value::Number(it)) => it.to_string(),
        Some(Value::Bool(it)) => it.to_string(),
        _ => fallback.to_string(),
    }
}

pub fn int_param(params: &Parameters, key: &str, fallback: i64) -> i64 {
    match params.get(key) {
        Some(Value::Number(it)) => it
            .as_i64()
            .or_else(|| it.as_f64().map(|float| float as i64))
            .unwrap_or(fallback),
        Some(Value::String(it)) => it.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

/// Positive integer parameter, e.g. a count. Zero or negative values mean "use the default".
pub fn positive_param(params: &Parameters, key: &str, fallback: u32) -> u32 {
    u32::try_from(int_param(params, key, i64::from(fallback)))
        .ok()
        .filter(|it| *it > 0)
        .unwrap_or(fallback)
}

/// The `timeout` parameter: seconds as number, or a string like `1500ms`, `2s` or `2.5`.
pub fn timeout_param(params: &Parameters, fallback: Duration) -> Duration {
    let secs = match params.get(TIMEOUT_PARAM) {
        Some(Value::Number(it)) => it.as_f64(),
        Some(Value::String(it)) => parse_duration_secs(it),
        _ => None,
    };
    secs.filter(|it| it.is_finite() && *it > 0.0)
        .and_then(|it| Duration::try_from_secs_f64(it).ok())
        .unwrap_or(fallback)
}

fn parse_duration_secs(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some(millis) = raw.strip_suffix("ms") {
        millis.trim().parse::<f64>().ok().map(|it| it / 1000.0)
    } else if let Some(secs) = raw.strip_suffix('s') {
        secs.trim().parse().ok()
    } else {
        raw.parse().ok()
    }
}

/// `0.231 s`
pub fn format_seconds(duration: Duration) -> String {
    format!("{:.3} s", duration.as_secs_f64())
}

/// `12.3 ms`
pub fn format_millis(duration: Duration) -> String {
    format!("{:.1} ms", duration.as_secs_f64() * 1000.0)
}

/// Remaining record validity, e.g. `1 hr 2 min 3 sec`. Zero means unknown.
pub fn format_ttl(remaining: Duration) -> String {
    if remaining.is_zero() {
        return "N/A".to_string();
    }
    let total_secs = remaining.as_secs_f64().round() as u64;
    if total_secs < 1 {
        return "<1 sec".to_string();
    }
    let (hours, minutes, seconds) = (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60);
    [(hours, "hr"), (minutes, "min"), (seconds, "sec")]
        .into_iter()
        .filter(|(amount, _)| *amount > 0)
        .map(|(amount, unit)| format!("{} {}", amount, unit))
        .join(" ")
}
