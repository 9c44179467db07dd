use std::fmt;

use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::credentials::redact::redact;
use crate::error::ValidationError;

/// A validated job request. Connection strings stay in zeroizing buffers
/// until they are sealed.
pub struct JobSubmission {
    pub command: String,
    pub source_url: Zeroizing<String>,
    pub target_url: Zeroizing<String>,
    pub filter: Value,
    pub options: Value,
}

impl JobSubmission {
    /// Parses and validates a raw request body.
    pub fn from_json_bytes(body: &[u8]) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|_| ValidationError::InvalidJson)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut object) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let command = take_required_string(&mut object, "command")?;
        let source_url = Zeroizing::new(take_required_string(&mut object, "source_url")?);
        let target_url = Zeroizing::new(take_required_string(&mut object, "target_url")?);
        let filter = take_opaque(&mut object, "filter");
        let options = take_opaque(&mut object, "options");

        Ok(Self {
            command,
            source_url,
            target_url,
            filter,
            options,
        })
    }
}

impl fmt::Debug for JobSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSubmission")
            .field("command", &self.command)
            .field("source_url", &redact(&self.source_url))
            .field("target_url", &redact(&self.target_url))
            .field("filter", &self.filter)
            .field("options", &self.options)
            .finish()
    }
}

fn take_required_string(
    object: &mut Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    match object.remove(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ValidationError::InvalidField {
            field,
            expected: "a string",
        }),
    }
}

/// Opaque payloads are stored as submitted; absent means `{}`.
fn take_opaque(object: &mut Map<String, Value>, field: &str) -> Value {
    match object.remove(field) {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(value) => value,
    }
}
