//! Serde helper encoding [`Duration`] as integer milliseconds.
//!
//! Use with `#[serde(with = "steward_controller::duration_ms")]`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
	u64::deserialize(deserializer).map(Duration::from_millis)
}
