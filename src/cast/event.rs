//! asciinema v2 cast record types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The single header line that opens every `stream-out` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    /// Cast format version; always 2.
    pub version: u8,
    /// Terminal width in columns at recording start.
    pub width: u16,
    /// Terminal height in rows at recording start.
    pub height: u16,
    /// Unix timestamp the recording started.
    pub timestamp: i64,
    /// Command line, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Human title, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Environment snapshot, if captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// The event-type discriminant of a cast record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Output from the child process to the terminal.
    Output,
    /// Input echoed from a client.
    Input,
    /// A resize, payload is `"<cols>x<rows>"`.
    Resize,
    /// A marker/annotation.
    Marker,
}

impl EventType {
    /// The single-character tag used on the wire.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            EventType::Output => "o",
            EventType::Input => "i",
            EventType::Resize => "r",
            EventType::Marker => "m",
        }
    }

    /// Parses a wire tag, if recognized.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "o" => Some(EventType::Output),
            "i" => Some(EventType::Input),
            "r" => Some(EventType::Resize),
            "m" => Some(EventType::Marker),
            _ => None,
        }
    }
}

/// One parsed `[seconds, type, payload]` record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Seconds elapsed since the session started.
    pub time: f64,
    /// Record kind.
    pub kind: EventType,
    /// Record payload (raw bytes as UTF-8, or `"<cols>x<rows>"` for resize).
    pub payload: String,
}

impl Event {
    /// Serializes as the three-element JSON array the format expects.
    #[must_use]
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(&(self.time, self.kind.tag(), &self.payload))
            .unwrap_or_else(|_| "[]".to_string())
    }

    /// Parses a `[seconds, type, payload]` array, or `None` for a record
    /// this crate doesn't recognize (e.g. the custom `["exit", ...]` record,
    /// which callers should check for separately before calling this).
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let arr = value.as_array()?;
        if arr.len() != 3 {
            return None;
        }
        let time = arr[0].as_f64()?;
        let kind = EventType::from_tag(arr[1].as_str()?)?;
        let payload = arr[2].as_str()?.to_string();
        Some(Event { time, kind, payload })
    }
}

/// The custom exit record appended when a session terminates:
/// `["exit", exit_code, session_id]`.
#[must_use]
pub fn exit_record(exit_code: i32, session_id: &str) -> String {
    serde_json::to_string(&serde_json::json!(["exit", exit_code, session_id]))
        .unwrap_or_else(|_| "[]".to_string())
}

/// Parses an exit record previously produced by [`exit_record`].
#[must_use]
pub fn parse_exit_record(line: &str) -> Option<(i32, String)> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let arr = value.as_array()?;
    if arr.len() != 3 || arr[0].as_str() != Some("exit") {
        return None;
    }
    let code = arr[1].as_i64()? as i32;
    let id = arr[2].as_str()?.to_string();
    Some((code, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_through_json() {
        let event = Event {
            time: 1.25,
            kind: EventType::Output,
            payload: "hello".to_string(),
        };
        let line = event.to_json_line();
        assert_eq!(line, r#"[1.25,"o","hello"]"#);
        let parsed = Event::parse(&line).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn resize_payload_format() {
        let event = Event {
            time: 0.0,
            kind: EventType::Resize,
            payload: "100x30".to_string(),
        };
        assert_eq!(event.to_json_line(), r#"[0.0,"r","100x30"]"#);
    }

    #[test]
    fn exit_record_round_trips() {
        let line = exit_record(0, "0123456789abcdef");
        let (code, id) = parse_exit_record(&line).unwrap();
        assert_eq!(code, 0);
        assert_eq!(id, "0123456789abcdef");
    }

    #[test]
    fn parse_rejects_non_array() {
        assert!(Event::parse("{}").is_none());
        assert!(Event::parse("not json").is_none());
    }

    #[test]
    fn parse_rejects_exit_record_as_event() {
        let line = exit_record(1, "abc");
        assert!(Event::parse(&line).is_none());
    }
}
