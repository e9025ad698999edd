use std::collections::HashMap;

use serde::Deserialize;

/// One tracked event as it arrives on the wire.
///
/// `Slices` may be absent entirely; the lowercase spelling is accepted for
/// clients that send the field un-capitalized.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    #[serde(rename = "Metric")]
    pub metric: String,
    #[serde(rename = "Value")]
    pub value: i32,
    #[serde(rename = "Time")]
    pub time: i64,
    #[serde(rename = "Slices", alias = "slices", default)]
    pub slices: HashMap<String, String>,
}
