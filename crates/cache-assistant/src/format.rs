//! Display helpers for storage snapshots and saved configs.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{Provenance, StorageData, is_source_key, source_key};

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Badge tone for a key's provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTone {
    Success,
    Warning,
    Info,
}

/// Number of real keys, excluding `_source` sidecars.
pub fn data_keys_count(data: &StorageData) -> usize {
    data.keys().filter(|key| !is_source_key(key)).count()
}

fn provenance(data: &StorageData, key: &str) -> Option<Provenance> {
    data.get(&source_key(key))
        .and_then(Value::as_str)
        .and_then(Provenance::parse)
}

pub fn source_label(data: &StorageData, key: &str) -> &'static str {
    match provenance(data, key) {
        Some(Provenance::Local) => "localStorage",
        Some(Provenance::Session) => "sessionStorage",
        Some(Provenance::NotFound) => "未找到",
        None => "未知",
    }
}

pub fn source_tone(data: &StorageData, key: &str) -> SourceTone {
    match provenance(data, key) {
        Some(Provenance::Local) => SourceTone::Success,
        Some(Provenance::Session) => SourceTone::Warning,
        _ => SourceTone::Info,
    }
}

/// Primitives render bare; arrays and objects render as JSON.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// zh-CN relative time ("几秒前", "5 分钟前", "3 天前"); dates a week or more
/// old render as `YYYY-MM-DD`.
pub fn format_relative(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(created_at);
    if elapsed.num_days() >= 7 {
        return created_at.format("%Y-%m-%d").to_string();
    }
    let millis = elapsed.num_milliseconds();
    let suffix = if millis < 0 { "内" } else { "前" };
    let millis = millis.unsigned_abs();

    let seconds = rounded(millis, SECOND_MS);
    let minutes = rounded(millis, MINUTE_MS);
    let hours = rounded(millis, HOUR_MS);
    let days = rounded(millis, DAY_MS);
    let phrase = if seconds <= 44 {
        "几秒".to_string()
    } else if seconds <= 89 {
        "1 分钟".to_string()
    } else if minutes <= 44 {
        format!("{minutes} 分钟")
    } else if minutes <= 89 {
        "1 小时".to_string()
    } else if hours <= 21 {
        format!("{hours} 小时")
    } else if hours <= 35 {
        "1 天".to_string()
    } else {
        format!("{days} 天")
    };
    format!("{phrase}{suffix}")
}

fn rounded(millis: u64, unit: u64) -> u64 {
    (millis + unit / 2) / unit
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;

    fn snapshot() -> StorageData {
        match json!({
            "token": "abc",
            "token_source": "localStorage",
            "cart": {"items": 2},
            "cart_source": "sessionStorage",
            "ghost": null,
            "ghost_source": "not_found",
            "manual": 1,
        }) {
            Value::Object(map) => map,
            _ => StorageData::new(),
        }
    }

    #[test]
    fn counts_and_labels() {
        let data = snapshot();
        assert_eq!(data_keys_count(&data), 4);
        assert_eq!(source_label(&data, "token"), "localStorage");
        assert_eq!(source_label(&data, "cart"), "sessionStorage");
        assert_eq!(source_label(&data, "ghost"), "未找到");
        assert_eq!(source_label(&data, "manual"), "未知");
        assert_eq!(source_tone(&data, "cart"), SourceTone::Warning);
        assert_eq!(source_tone(&data, "ghost"), SourceTone::Info);
    }

    #[test]
    fn values_render_for_display() {
        assert_eq!(format_value(&json!("plain")), "plain");
        assert_eq!(format_value(&json!(3.5)), "3.5");
        assert_eq!(format_value(&json!(false)), "false");
        assert_eq!(format_value(&Value::Null), "null");
        assert_eq!(format_value(&json!({"a": [1, 2]})), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn relative_dates() {
        let now = Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).single().expect("valid date");
        let ago = |duration: Duration| format_relative(now - duration, now);

        assert_eq!(ago(Duration::seconds(10)), "几秒前");
        assert_eq!(ago(Duration::seconds(60)), "1 分钟前");
        assert_eq!(ago(Duration::minutes(12)), "12 分钟前");
        assert_eq!(ago(Duration::minutes(60)), "1 小时前");
        assert_eq!(ago(Duration::hours(5)), "5 小时前");
        assert_eq!(ago(Duration::hours(30)), "1 天前");
        assert_eq!(ago(Duration::days(3)), "3 天前");
        assert_eq!(ago(Duration::days(8)), "2024-05-12");
        assert_eq!(format_relative(now + Duration::minutes(5), now), "5 分钟内");
    }
}
