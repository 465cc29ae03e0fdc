//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Properties the controller observes on every session.
pub const OBSERVED_PROPERTIES: &[&str] = &["pause", "path", "time-pos", "duration", "volume"];

/// Global request ID counter for unique command identification.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Generate a unique request ID for MPV commands.
pub fn next_request_id() -> i64 {
  REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Command sent to MPV via IPC.
#[derive(Debug, Clone, Serialize)]
pub struct MpvCommand {
  pub command: Vec<serde_json::Value>,
  pub request_id: i64,
}

impl MpvCommand {
  /// Create a new command with auto-generated request ID.
  pub fn new(args: Vec<serde_json::Value>) -> Self {
    Self {
      command: args,
      request_id: next_request_id(),
    }
  }

  /// Observe a property for changes.
  pub fn observe_property(id: i64, name: &str) -> Self {
    Self::new(vec!["observe_property".into(), id.into(), name.into()])
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  pub error: String,
  /// Response data (command-specific).
  #[serde(default)]
  pub data: Option<serde_json::Value>,
  /// Matching request ID.
  #[serde(default)]
  pub request_id: i64,
}

impl MpvResponse {
  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Event sent by MPV (property changes, playback events, etc.).
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  /// Event type (e.g., "property-change", "end-file").
  pub event: String,
  /// Property name for property-change events.
  pub name: Option<String>,
  /// Event data.
  pub data: Option<serde_json::Value>,
}

/// Message received from MPV IPC (either response or event).
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
}

impl MpvMessage {
  /// Parse a JSON line from MPV.
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("event").is_some() {
      Ok(MpvMessage::Event(serde_json::from_value(value)?))
    } else {
      Ok(MpvMessage::Response(serde_json::from_value(value)?))
    }
  }
}

/// Property changes the state machine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
  Pause(bool),
  Path(String),
  TimePos(f64),
  Duration(f64),
  Volume(f64),
  /// Anything else: other events, unknown properties, unexpected data shapes.
  Ignored,
}

impl From<&MpvEvent> for PlayerEvent {
  fn from(event: &MpvEvent) -> Self {
    if event.event != "property-change" {
      return PlayerEvent::Ignored;
    }
    let Some(data) = event.data.as_ref() else {
      return PlayerEvent::Ignored;
    };

    let decoded = match event.name.as_deref() {
      Some("pause") => data.as_bool().map(PlayerEvent::Pause),
      Some("path") => data
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| PlayerEvent::Path(s.to_string())),
      Some("time-pos") => data.as_f64().map(PlayerEvent::TimePos),
      Some("duration") => data.as_f64().map(PlayerEvent::Duration),
      Some("volume") => data.as_f64().map(PlayerEvent::Volume),
      _ => None,
    };
    decoded.unwrap_or(PlayerEvent::Ignored)
  }
}
