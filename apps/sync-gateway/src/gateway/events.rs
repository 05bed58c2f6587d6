//! Wire-format messages exchanged over the gateway WebSocket.
//!
//! Frames are JSON; binary update payloads travel base64-encoded. Inbound
//! requests are a tagged enum so one `serde_json::from_str` both parses and
//! dispatches.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Client → Server requests
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    JoinSpace {
        space_type: String,
        space_id: String,
        client_version: String,
    },
    LeaveSpace {
        space_type: String,
        space_id: String,
    },
    LoadDoc {
        space_type: String,
        space_id: String,
        doc_id: String,
        #[serde(default)]
        state_vector: Option<String>,
    },
    DeleteDoc {
        space_type: String,
        space_id: String,
        doc_id: String,
    },
    PushDocUpdate {
        space_type: String,
        space_id: String,
        doc_id: String,
        update: String,
    },
    LoadDocTimestamps {
        space_type: String,
        space_id: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    JoinAwareness {
        space_type: String,
        space_id: String,
        doc_id: String,
    },
    LeaveAwareness {
        space_type: String,
        space_id: String,
        doc_id: String,
    },
    LoadAwarenesses {
        space_type: String,
        space_id: String,
        doc_id: String,
    },
    UpdateAwareness {
        space_type: String,
        space_id: String,
        doc_id: String,
        awareness_update: String,
    },
}

// ---------------------------------------------------------------------------
// Server → Client events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundEvent {
    /// Acknowledges a successful join-space.
    JoinAck {
        connection_id: String,
        success: bool,
    },
    /// Legacy protocol: one event per update.
    DocUpdate {
        space_type: String,
        space_id: String,
        doc_id: String,
        update: String,
        timestamp: i64,
        editor: String,
    },
    /// Current protocol: a batch, optionally merged into one compressed blob.
    DocUpdates {
        space_type: String,
        space_id: String,
        doc_id: String,
        updates: Vec<String>,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        editor: Option<String>,
        compressed: bool,
    },
    /// Reply to load-doc.
    DocState {
        doc_id: String,
        missing: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    DocDeleted {
        doc_id: String,
        success: bool,
    },
    /// Reply to push-doc-update.
    UpdateAck {
        doc_id: String,
        accepted: bool,
        timestamp: i64,
    },
    /// Reply to load-doc-timestamps.
    DocTimestamps {
        timestamps: HashMap<String, i64>,
    },
    /// Asks other awareness-room members to send their current state.
    AwarenessCollect {
        doc_id: String,
        collector: String,
    },
    /// Relayed awareness payload.
    AwarenessUpdate {
        doc_id: String,
        awareness_update: String,
    },
    /// Per-request error payload.
    Error {
        code: String,
        message: String,
    },
}

impl OutboundEvent {
    pub fn error(err: &SyncError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Binary payload encoding
// ---------------------------------------------------------------------------

pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, SyncError> {
    BASE64
        .decode(encoded)
        .map_err(|_| SyncError::bad_request("invalid base64 payload"))
}
