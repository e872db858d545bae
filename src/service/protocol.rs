use crate::common::{AttendanceError, Result};
use serde_json::{Map, Value};

// Default ports and chunk sizes; both ends must agree on the chunk sizes
pub const DEFAULT_DATABASE_PORT: u16 = 5001;
pub const DEFAULT_ATTENDANCE_PORT: u16 = 5002;
pub const DEFAULT_DATABASE_CHUNK_SIZE: usize = 100_000;
pub const DEFAULT_ATTENDANCE_CHUNK_SIZE: usize = 1024;

// Channel names used in logs and errors
pub const DATABASE_CHANNEL: &str = "database";
pub const ATTENDANCE_CHANNEL: &str = "attendance";

/// Serializes ordered string pairs as a JSON object.
pub fn encode_string_map<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let object: Map<String, Value> = entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        .collect();

    serde_json::to_vec(&object)
        .map_err(|e| AttendanceError::Protocol(format!("Failed to serialize payload: {}", e)))
}

/// Parses a JSON object of strings, keeping the sender's key order.
pub fn decode_string_map(payload: &[u8]) -> Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| AttendanceError::Protocol(format!("Payload is not valid UTF-8: {}", e)))?;

    let object: Map<String, Value> = serde_json::from_str(text)
        .map_err(|e| AttendanceError::Protocol(format!("Payload is not a JSON object: {}", e)))?;

    object
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(value) => Ok((key, value)),
            other => Err(AttendanceError::Protocol(format!(
                "Value for {:?} is not a string: {}", key, other
            ))),
        })
        .collect()
}
