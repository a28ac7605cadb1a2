// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between peers.
//!
//! Every message on a connection is one [`Envelope`], CBOR-encoded and
//! length-prefixed by the codec. The `kind` tag discriminates the variants;
//! payload values are [`serde_json::Value`] so handlers stay schemaless.
//!
//! # Typical exchanges
//!
//! ```text
//! Caller                              Callee
//!    │── REQUEST {method, args, kwargs} ──►│
//!    │◄─ OK {data}  /  ERROR {msg} ────────│          (unary)
//!
//!    │── REQUEST {method, …} ─────────────►│
//!    │◄─ STREAM_START {task_id} ───────────│          (streaming)
//!    │◄─ PROGRESS {data} × N ──────────────│
//!    │◄─ STREAM_END  /  ERROR {msg} ───────│
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Version byte carried by every frame. Decoders reject anything else.
pub const PROTOCOL_VERSION: u8 = 1;

/// Reserved method: liveness probe. Always answered with [`Envelope::Pong`].
pub const PING_METHOD: &str = "__ping__";

/// Reserved method: cancel a streaming task on the server.
/// Takes the task id in the `task_id` keyword argument.
pub const CANCEL_METHOD: &str = "__cancel_task__";

/// Keyword argument carrying the task id of a [`CANCEL_METHOD`] request.
pub const TASK_ID_KWARG: &str = "task_id";

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    /// Invoke `method` on the receiving peer.
    Request {
        method: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },

    /// Successful unary reply.
    Ok { data: Value },

    /// The handler failed, the method is unknown, or the stream aborted.
    Error { msg: String },

    /// Reply to [`PING_METHOD`].
    Pong,

    /// A streaming handler started; `task_id` names it for cancellation.
    StreamStart { task_id: String },

    /// One item produced by a streaming handler.
    Progress { data: Value },

    /// Normal end of a stream.
    StreamEnd,
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(
        method: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Envelope::Request {
            method: method.into(),
            args,
            kwargs,
        }
    }

    /// Build an error envelope from anything displayable.
    pub fn error(msg: impl std::fmt::Display) -> Self {
        Envelope::Error {
            msg: msg.to_string(),
        }
    }

    /// The wire name of this envelope's kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Request { .. } => "REQUEST",
            Envelope::Ok { .. } => "OK",
            Envelope::Error { .. } => "ERROR",
            Envelope::Pong => "PONG",
            Envelope::StreamStart { .. } => "STREAM_START",
            Envelope::Progress { .. } => "PROGRESS",
            Envelope::StreamEnd => "STREAM_END",
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_tag_uses_wire_names() {
        let env = Envelope::StreamStart {
            task_id: "t1".into(),
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["kind"], "STREAM_START");
        assert_eq!(v["task_id"], "t1");
    }

    #[test]
    fn request_defaults_empty_args() {
        let v: Envelope =
            serde_json::from_value(json!({ "kind": "REQUEST", "method": "m" })).unwrap();
        match v {
            Envelope::Request { method, args, kwargs } => {
                assert_eq!(method, "m");
                assert!(args.is_empty());
                assert!(kwargs.is_empty());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unit_variants_carry_only_the_tag() {
        let v = serde_json::to_value(Envelope::Pong).unwrap();
        assert_eq!(v, json!({ "kind": "PONG" }));
        let v = serde_json::to_value(Envelope::StreamEnd).unwrap();
        assert_eq!(v, json!({ "kind": "STREAM_END" }));
    }

    #[test]
    fn kind_names_match_serialized_tags() {
        for env in [
            Envelope::request("m", vec![], Map::new()),
            Envelope::Ok { data: json!(1) },
            Envelope::error("boom"),
            Envelope::Pong,
            Envelope::StreamStart { task_id: "x".into() },
            Envelope::Progress { data: json!(null) },
            Envelope::StreamEnd,
        ] {
            let v = serde_json::to_value(&env).unwrap();
            assert_eq!(v["kind"], env.kind());
        }
    }
}
