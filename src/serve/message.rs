//! The typed frame set shared by every live-session transport.
//!
//! Binary transports (WebSocket, WebTransport) carry CBOR; the HTTP
//! long-poll endpoints carry the same shapes as JSON.

use serde::{Deserialize, Serialize};

use crate::prelude::*;
use crate::runtime::EvalError;

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create/bind the page instance for this session.
    Init { path: String },
    /// Invoke a handler; the server replies with `update` or `error_trace`.
    Event {
        handler: String,
        #[serde(default)]
        data: serde_json::Value,
        #[serde(default)]
        path: Option<String>,
    },
    /// Switch the session's page to the route matching `path`.
    Relocate { path: String },
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Replace the live page body.
    Update { html: String },
    /// Force a full client reload.
    Reload,
    /// Forward captured output lines.
    Console { lines: Vec<String>, level: String },
    /// Structured exception for the development UI.
    ErrorTrace {
        error: String,
        trace: Vec<TraceEntry>,
    },
}

impl ServerMessage {
    pub fn console(lines: Vec<String>) -> Self {
        ServerMessage::Console {
            lines,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub filename: String,
    pub lineno: u32,
    pub name: String,
    pub line: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_colno: Option<u32>,
}

/// Build an `error_trace` frame from a runtime failure. Each stack frame
/// resolves its source line from the page file for the development UI.
pub fn error_trace(error: &EvalError, file_path: &std::path::Path) -> ServerMessage {
    let source = std::fs::read_to_string(file_path).unwrap_or_default();
    let source_lines: Vec<&str> = source.lines().collect();
    let line_text = |lineno: u32| -> String {
        source_lines
            .get(lineno.saturating_sub(1) as usize)
            .map(|l| l.trim().to_string())
            .unwrap_or_default()
    };

    let filename = file_path.to_string_lossy().to_string();
    let mut trace: Vec<TraceEntry> = error
        .trace
        .iter()
        .map(|frame| TraceEntry {
            filename: filename.clone(),
            lineno: frame.line,
            name: frame.name.clone(),
            line: line_text(frame.line),
            colno: None,
            end_colno: None,
        })
        .collect();

    // The innermost frame points at the failing line itself.
    trace.push(TraceEntry {
        filename,
        lineno: error.line,
        name: error
            .trace
            .last()
            .map(|f| f.name.clone())
            .unwrap_or_else(|| "<render>".to_string()),
        line: line_text(error.line),
        colno: None,
        end_colno: None,
    });

    ServerMessage::ErrorTrace {
        error: error.message.clone(),
        trace,
    }
}

pub fn encode_cbor(message: &ServerMessage) -> Result<Vec<u8>> {
    serde_cbor::to_vec(message).wrap_err("could not encode frame")
}

pub fn decode_cbor(bytes: &[u8]) -> Result<ClientMessage> {
    serde_cbor::from_slice(bytes).wrap_err("could not decode frame")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_decode_from_json_shape() {
        let msg: ClientMessage =
            serde_json::from_value(serde_json::json!({"type": "init", "path": "/x"})).unwrap();
        assert!(matches!(msg, ClientMessage::Init { path } if path == "/x"));

        let msg: ClientMessage = serde_json::from_value(serde_json::json!({
            "type": "event",
            "handler": "increment",
            "data": {"args": {"arg-0": 1}},
        }))
        .unwrap();
        let ClientMessage::Event { handler, data, path } = msg else { panic!() };
        assert_eq!(handler, "increment");
        assert!(path.is_none());
        assert_eq!(data["args"]["arg-0"], 1);
    }

    #[test]
    fn server_frames_tag_their_type() {
        let json = serde_json::to_value(ServerMessage::Update {
            html: "<p>x</p>".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["html"], "<p>x</p>");

        let json = serde_json::to_value(ServerMessage::Reload).unwrap();
        assert_eq!(json["type"], "reload");
    }

    #[test]
    fn cbor_round_trip() {
        let bytes = encode_cbor(&ServerMessage::Update { html: "x".into() }).unwrap();
        let value: serde_cbor::Value = serde_cbor::from_slice(&bytes).unwrap();
        // A self-describing map with a `type` field.
        let serde_cbor::Value::Map(map) = value else { panic!() };
        assert!(map
            .values()
            .any(|v| matches!(v, serde_cbor::Value::Text(t) if t == "update")));

        let client = serde_cbor::to_vec(&ClientMessage::Relocate { path: "/y".into() }).unwrap();
        let decoded = decode_cbor(&client).unwrap();
        assert!(matches!(decoded, ClientMessage::Relocate { path } if path == "/y"));
    }

    #[test]
    fn error_trace_structure() {
        let error = EvalError {
            message: "name 'x' is not defined".into(),
            line: 3,
            trace: vec![crate::runtime::TraceFrame {
                name: "boom".into(),
                line: 2,
            }],
        };
        let ServerMessage::ErrorTrace { error, trace } =
            error_trace(&error, std::path::Path::new("/nonexistent.pw"))
        else {
            panic!()
        };
        assert!(error.contains("not defined"));
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].name, "boom");
        assert_eq!(trace[1].lineno, 3);
    }
}
