use chrono::Utc;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// Current unix time in seconds, always UTC.
pub(crate) fn unix_now() -> i64 {
    Utc::now().timestamp()
}
