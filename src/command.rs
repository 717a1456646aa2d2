//! Command envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An intent to change state, consumed once by a single dispatch.
///
/// `command_type` selects the command handler, `subjects` are the opaque
/// identifiers whose history is loaded before the handler runs, and
/// `data` is the handler-specific payload. The payload travels as
/// type-erased JSON (the handler's concrete payload type is deserialized
/// back out at dispatch time), so a `Command` can be built from any
/// serializable value or received off a wire as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Selects the command handler. Globally unique across contexts.
    #[serde(rename = "type")]
    pub command_type: String,
    /// Identifiers whose history is relevant to this command.
    pub subjects: Vec<String>,
    /// Handler-specific JSON payload.
    pub data: Value,
}

impl Command {
    /// Create a command addressed to `command_type` for the given subjects.
    pub fn new<I, S>(command_type: impl Into<String>, subjects: I, data: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command_type: command_type.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            data,
        }
    }
}
