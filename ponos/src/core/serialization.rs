use super::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Serializes a value to a JSON string, the format of every cache field.
///
/// # Errors
/// Returns `CoreError::Serialization` if the value cannot be serialized.
pub fn serialize_value<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(CoreError::Serialization)
}

/// Deserializes a JSON string read back from the cache.
///
/// # Errors
/// Returns `CoreError::Deserialization` if the text is not valid for `T`.
pub fn deserialize_value<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(CoreError::Deserialization)
}

/// Converts a value into a `serde_json::Value` (job payloads, step results).
pub fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(CoreError::Serialization)
}

/// Converts a `serde_json::Value` back into a typed value.
pub fn from_json<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(CoreError::Deserialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: String,
        total: u32,
    }

    #[test]
    fn test_serialization() {
        let order = Order {
            id: "x".to_string(),
            total: 12,
        };
        let text = serialize_value(&order).unwrap();
        assert_eq!(text, r#"{"id":"x","total":12}"#);
        let back: Order = deserialize_value(&text).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn test_deserialization_error_keeps_source() {
        let err = deserialize_value::<Order>("{not json").unwrap_err();
        assert!(matches!(err, CoreError::Deserialization(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
