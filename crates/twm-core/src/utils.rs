use chrono::{FixedOffset, Timelike, Utc};

/// RFC3339 timestamp in UTC (for persisted records and logs).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

/// Current hour (0-23) at a fixed UTC offset.
pub fn local_hour(offset_hours: i32) -> u32 {
    match FixedOffset::east_opt(offset_hours * 3600) {
        Some(offset) => Utc::now().with_timezone(&offset).hour(),
        None => Utc::now().hour(),
    }
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}
