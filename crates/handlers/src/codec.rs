//! Payload codec.
//!
//! Message bodies and task state are opaque JSON values to the stores; this
//! codec is the single place where they turn into typed work items and back.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::JobError;

#[derive(Debug, Default, Copy, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize>(value: &T) -> Result<Value, serde_json::Error> {
        serde_json::to_value(value)
    }

    /// Decode a stored payload into a work item.
    ///
    /// A missing payload (e.g. a task that has never saved state) decodes as
    /// JSON `null`, so `Option<T>` and `()` work items accept it.
    pub fn decode<T: DeserializeOwned>(payload: Option<&Value>) -> Result<T, JobError> {
        let value = payload.cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(JobError::Decode)
    }
}
