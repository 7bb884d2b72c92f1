//! §4.E Jupyter protocol codec: encodes/decodes v5.3 wire messages over the
//! WebSocket channel, generates `msg_id`s, and classifies incoming messages
//! for correlation against `parent_header`.
//!
//! Hand-rolled against the 5-tuple (`header`, `parent_header`, `metadata`,
//! `content`, `buffers`) shown in `ekzhang-jute`'s `wire_protocol.rs`,
//! rather than built on the `jupyter-protocol` crate: that crate's API is
//! shaped around ZeroMQ multipart framing (`runtimelib`'s transport), and
//! the Colab backend only speaks single-channel WebSocket JSON. The request/
//! reply/content field names below match the upstream Jupyter messaging
//! spec so a real kernel understands them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "5.3";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    pub session: String,
    #[serde(default)]
    pub username: String,
    pub date: DateTime<Utc>,
    pub version: String,
}

impl Header {
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>) -> Self {
        Header {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            session: session.into(),
            username: "colab-cli".to_string(),
            date: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// One v5.3 Jupyter WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: Header,
    #[serde(default)]
    pub parent_header: Option<Header>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    pub content: serde_json::Value,
    #[serde(default)]
    pub buffers: Vec<String>,
    pub channel: String,
}

fn empty_object() -> serde_json::Value {
    json!({})
}

impl WireMessage {
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<WireMessage, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Builds a fresh `execute_request` on the shell channel. `session` is the
/// `KernelSession`'s session id, echoed in every header this client sends.
pub fn execute_request(session: &str, code: &str, silent: bool) -> WireMessage {
    WireMessage {
        header: Header::new("execute_request", session),
        parent_header: None,
        metadata: empty_object(),
        content: json!({
            "code": code,
            "silent": silent,
            "store_history": !silent,
            "user_expressions": {},
            "allow_stdin": false,
            "stop_on_error": true,
        }),
        buffers: Vec::new(),
        channel: "shell".to_string(),
    }
}

/// Builds an `interrupt_request` on the control channel (spec §4.G step 5).
pub fn interrupt_request(session: &str) -> WireMessage {
    WireMessage {
        header: Header::new("interrupt_request", session),
        parent_header: None,
        metadata: empty_object(),
        content: json!({}),
        buffers: Vec::new(),
        channel: "control".to_string(),
    }
}

/// Output stream name from `content.name` on a `stream` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Terminal execution status carried by `execute_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecReplyStatus {
    Ok,
    Error,
    Abort,
}

/// A decoded, classified incoming message (spec §4.E bullet list).
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    ExecuteReply {
        parent_msg_id: Option<String>,
        status: ExecReplyStatus,
        execution_count: Option<i64>,
    },
    Stream {
        parent_msg_id: Option<String>,
        name: StreamName,
        text: String,
    },
    DisplayData {
        parent_msg_id: Option<String>,
        data: serde_json::Value,
    },
    ExecuteResult {
        parent_msg_id: Option<String>,
        data: serde_json::Value,
        execution_count: Option<i64>,
    },
    Error {
        parent_msg_id: Option<String>,
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Status {
        parent_msg_id: Option<String>,
        busy: bool,
    },
    /// Anything else: `kernel_info_reply`, `comm_*`, etc. Logged and
    /// dropped unless it prevents correlation (spec §7 `ProtocolError`).
    Other {
        msg_type: String,
    },
}

/// Classifies a decoded `WireMessage` by `msg_type` (spec §4.E).
pub fn classify(msg: &WireMessage) -> IncomingMessage {
    let parent_msg_id = msg.parent_msg_id().map(str::to_string);
    match msg.header.msg_type.as_str() {
        "execute_reply" => IncomingMessage::ExecuteReply {
            parent_msg_id,
            status: match msg.content.get("status").and_then(|v| v.as_str()) {
                Some("error") => ExecReplyStatus::Error,
                Some("abort") => ExecReplyStatus::Abort,
                _ => ExecReplyStatus::Ok,
            },
            execution_count: msg.content.get("execution_count").and_then(|v| v.as_i64()),
        },
        "stream" => IncomingMessage::Stream {
            parent_msg_id,
            name: match msg.content.get("name").and_then(|v| v.as_str()) {
                Some("stderr") => StreamName::Stderr,
                _ => StreamName::Stdout,
            },
            text: msg
                .content
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        },
        "display_data" | "update_display_data" => IncomingMessage::DisplayData {
            parent_msg_id,
            data: msg.content.get("data").cloned().unwrap_or(serde_json::Value::Null),
        },
        "execute_result" => IncomingMessage::ExecuteResult {
            parent_msg_id,
            data: msg.content.get("data").cloned().unwrap_or(serde_json::Value::Null),
            execution_count: msg.content.get("execution_count").and_then(|v| v.as_i64()),
        },
        "error" => IncomingMessage::Error {
            parent_msg_id,
            ename: msg
                .content
                .get("ename")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            evalue: msg
                .content
                .get("evalue")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            traceback: msg
                .content
                .get("traceback")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        },
        "status" => IncomingMessage::Status {
            parent_msg_id,
            busy: msg.content.get("execution_state").and_then(|v| v.as_str()) == Some("busy"),
        },
        other => IncomingMessage::Other {
            msg_type: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_request_round_trips_through_encode_decode() {
        let msg = execute_request("session-1", "print(1)", false);
        let encoded = msg.encode().unwrap();
        let decoded = WireMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn classifies_stream_stdout() {
        let msg = WireMessage {
            header: Header::new("stream", "s"),
            parent_header: Some(Header::new("execute_request", "s")),
            metadata: empty_object(),
            content: json!({"name": "stdout", "text": "hi\n"}),
            buffers: vec![],
            channel: "iopub".into(),
        };
        match classify(&msg) {
            IncomingMessage::Stream { name, text, parent_msg_id } => {
                assert_eq!(name, StreamName::Stdout);
                assert_eq!(text, "hi\n");
                assert!(parent_msg_id.is_some());
            }
            other => panic!("expected Stream, got {other:?}"),
        }
    }

    #[test]
    fn classifies_error_execute_reply() {
        let msg = WireMessage {
            header: Header::new("execute_reply", "s"),
            parent_header: Some(Header::new("execute_request", "s")),
            metadata: empty_object(),
            content: json!({"status": "error", "execution_count": 3}),
            buffers: vec![],
            channel: "shell".into(),
        };
        match classify(&msg) {
            IncomingMessage::ExecuteReply { status, execution_count, .. } => {
                assert_eq!(status, ExecReplyStatus::Error);
                assert_eq!(execution_count, Some(3));
            }
            other => panic!("expected ExecuteReply, got {other:?}"),
        }
    }

    #[test]
    fn unknown_msg_type_is_classified_as_other() {
        let msg = WireMessage {
            header: Header::new("comm_msg", "s"),
            parent_header: None,
            metadata: empty_object(),
            content: json!({}),
            buffers: vec![],
            channel: "iopub".into(),
        };
        assert!(matches!(classify(&msg), IncomingMessage::Other { .. }));
    }
}
