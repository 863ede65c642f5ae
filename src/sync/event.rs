//! Push message decoding and tag derivation.

use serde::Deserialize;
use serde_json::Value;

use crate::cache::Tag;

#[derive(Debug, Deserialize)]
struct RawMessage {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default, alias = "project")]
  resource: Option<Value>,
}

/// A decoded server push message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
  /// A resource was created or updated; `id` is absent when the payload
  /// does not identify it
  Changed { id: Option<u64> },
  Hello,
  Heartbeat,
  /// Well-formed but of a type we do not act on
  Other(String),
}

impl PushEvent {
  /// Parse one message payload. Errors mean the message is malformed.
  pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
    let message: RawMessage = serde_json::from_str(raw)?;
    Ok(match message.kind.as_str() {
      "resource_updated" | "resource_created" | "project_updated" | "project_created" => {
        PushEvent::Changed {
          id: message
            .resource
            .as_ref()
            .and_then(|r| r.get("id"))
            .and_then(Value::as_u64),
        }
      }
      "hello" => PushEvent::Hello,
      "heartbeat" => PushEvent::Heartbeat,
      _ => PushEvent::Other(message.kind),
    })
  }

  /// Tags to invalidate for this event.
  pub fn tags(&self) -> Vec<Tag> {
    match self {
      PushEvent::Changed { id: Some(id) } => vec![
        Tag::project(*id),
        Tag::project_list(),
        Tag::project_deleted_list(),
      ],
      PushEvent::Changed { id: None } => vec![Tag::project_list()],
      _ => Vec::new(),
    }
  }
}
