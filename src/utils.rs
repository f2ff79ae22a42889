use crate::models::lighting::LockReason;
use serde::Serialize;

/// Serialize a serde-backed enum into its string name (e.g. SCREAMING_SNAKE_CASE).
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}

/// Label used for lock reasons in log lines.
pub fn lock_label(reason: LockReason) -> String {
    serde_enum_name(&reason).unwrap_or_else(|| format!("{:?}", reason))
}
