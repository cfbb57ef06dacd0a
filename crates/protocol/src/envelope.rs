use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors from decoding relay frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Typed view of a relay message, as clients send and receive it.
///
/// `data` and unknown top-level fields are kept as-is. The hub itself
/// relays untyped frames (see [`Presence::from_value`]), so peers may see
/// frames this type rejects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Top-level fields outside the envelope (`instanceId`, `timestamp`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Identity fields a message announces about its sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    /// Sender id from `from`, falling back to `instanceId`.
    pub id: Option<String>,
    /// Agent list from `data.agents`, if the message carries one.
    pub agents: Option<Vec<String>>,
}

impl Presence {
    /// Reads the identity fields of an arbitrary decoded frame.
    ///
    /// `from` and `instanceId` count only when truthy (`null`, `false`,
    /// `0` and `""` do not). Non-string ids and agent entries are recorded
    /// by their JSON text. Anything that is not an object announces nothing.
    pub fn from_value(frame: &Value) -> Self {
        let id = ["from", "instanceId"]
            .iter()
            .filter_map(|key| frame.get(key))
            .find(|v| is_truthy(v))
            .map(value_text);

        let agents = frame
            .get("data")
            .and_then(|d| d.get("agents"))
            .and_then(Value::as_array)
            .map(|list| list.iter().map(value_text).collect());

        Self { id, agents }
    }

    /// Returns `true` if the message announced nothing.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.agents.is_none()
    }
}

/// JavaScript-style truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// A string value as-is, anything else as its JSON text.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl RelayMessage {
    /// Creates a message with the given type and no other fields.
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            from: None,
            to: None,
            data: None,
            extra: Map::new(),
        }
    }

    /// Sets the sender id.
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the recipient id.
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Sets the payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the message to a JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the sender id: `from`, or `instanceId` when `from` is absent.
    ///
    /// Empty strings are treated as absent.
    pub fn sender_id(&self) -> Option<&str> {
        self.from
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| {
                self.extra
                    .get("instanceId")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
            })
    }

    /// Extracts the identity fields this message announces.
    pub fn presence(&self) -> Presence {
        let agents = self
            .data
            .as_ref()
            .and_then(|d| d.get("agents"))
            .and_then(Value::as_array)
            .map(|list| list.iter().map(value_text).collect());

        Presence {
            id: self.sender_id().map(str::to_string),
            agents,
        }
    }
}
