//! Opaque JSON payloads carried by specs and objects.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors converting between [`Any`] and typed values.
#[derive(Debug, thiserror::Error)]
pub enum AnyError {
	/// The payload does not match the requested type.
	#[error("decode failed: {0}")]
	Decode(#[source] serde_json::Error),
	/// The value could not be represented as JSON.
	#[error("encode failed: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Opaque document whose schema is owned by the plugin that reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Any(Value);

impl Any {
	/// Wraps a raw JSON value.
	pub fn from_value(value: Value) -> Self {
		Self(value)
	}

	/// Returns an empty JSON object.
	pub fn empty_object() -> Self {
		Self(Value::Object(serde_json::Map::new()))
	}

	/// Encodes a typed value.
	pub fn encode<T: Serialize>(value: &T) -> Result<Self, AnyError> {
		serde_json::to_value(value).map(Self).map_err(AnyError::Encode)
	}

	/// Decodes into a typed value.
	pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AnyError> {
		T::deserialize(&self.0).map_err(AnyError::Decode)
	}

	/// Borrows the raw JSON value.
	pub fn value(&self) -> &Value {
		&self.0
	}

	/// Consumes into the raw JSON value.
	pub fn into_value(self) -> Value {
		self.0
	}

	/// Returns true for JSON `null`.
	pub fn is_null(&self) -> bool {
		self.0.is_null()
	}
}

impl From<Value> for Any {
	fn from(value: Value) -> Self {
		Self(value)
	}
}
