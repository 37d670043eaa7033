use std::time::Duration;

/// Longest accepted duration. Deadlines are added to clock readings, so
/// larger values are rejected instead of overflowing.
pub const MAX_DURATION: Duration = Duration::from_secs(366 * 24 * 3600);

/// Parse a duration string like "500ms", "15s", "5m", "1h".
///
/// A bare number is read as seconds. Values above [`MAX_DURATION`] are
/// rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let number = |n: &str| n.trim().parse::<u64>().ok();
    let parsed = if let Some(ms) = s.strip_suffix("ms") {
        number(ms).map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        number(secs).map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        number(mins)
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        number(hours)
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        number(s).map(Duration::from_secs)
    };
    parsed.filter(|d| *d <= MAX_DURATION)
}
