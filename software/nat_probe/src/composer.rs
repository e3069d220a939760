//! Delayed reply text.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// RFC 3339 UTC timestamp with millisecond precision and Z-suffix
pub fn fmt_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Hold the calling thread until `interval_secs` have passed since `received`,
/// then build the reply.
///
/// The wait is the point of the protocol: the device's NAT mapping
/// ages while the server sits on the reply.
pub fn compose_reply(
    interval_secs: u64,
    received: DateTime<Utc>,
    trace_id: Uuid,
    version: &str,
) -> String {
    let interval = Duration::from_secs(interval_secs);
    let elapsed = (Utc::now() - received).to_std().unwrap_or_default();
    thread::sleep(interval.saturating_sub(elapsed));

    format_reply(interval_secs, received, Utc::now(), version, trace_id)
}

/// Reply text, one `Name: value` line per field
pub fn format_reply(
    interval_secs: u64,
    received: DateTime<Utc>,
    returned: DateTime<Utc>,
    version: &str,
    trace_id: Uuid,
) -> String {
    format!(
        "Interval: {interval_secs}\nReceived: {}\nReturned: {}\nVersion: {version}\nTraceId: {trace_id}\n",
        fmt_time(received),
        fmt_time(returned),
    )
}
