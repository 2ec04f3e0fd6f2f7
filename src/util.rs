use log::warn;
use serde::{Deserialize, Deserializer};

pub(crate) const MAX_PERCENTAGE: u8 = 100;

/// Clamp an administratively supplied percentage into `[0, 100]`.
pub(crate) fn clamp_percentage(p: i64) -> u8 {
    p.clamp(0, MAX_PERCENTAGE as i64) as u8
}

/// Same as [clamp_percentage] for values that arrive as JSON numbers. NaN maps to 0.
pub(crate) fn clamp_percentage_f64(f: f64) -> u8 {
    if f.is_nan() {
        return 0;
    }
    f.round().clamp(0.0, MAX_PERCENTAGE as f64) as u8
}

/// Lenient decoder for a stored rollout percentage: any JSON number is accepted and clamped,
/// anything else decodes as 0.
pub(crate) fn deserialize_percentage<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value.as_f64() {
        Some(f) => Ok(clamp_percentage_f64(f)),
        None => {
            warn!("ignoring non-numeric rollout percentage {}", value);
            Ok(0)
        }
    }
}
