#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Wire types for the sluice dev-server push channel.
//!
//! The dev server pushes one JSON text frame per message over the
//! `/__hmr` WebSocket. Every message carries a `type` discriminator:
//!
//! ```json
//! {"type":"update","changedModuleIds":[3,7],"chunkHashes":{"main":"1f2e..."}}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire schema version. Bump when changing message format.
pub const HMR_SCHEMA_VERSION: u32 = 1;

/// Path of the WebSocket endpoint clients connect to.
pub const HMR_ENDPOINT: &str = "/__hmr";

/// A message pushed from the dev server to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HmrMessage {
    /// Sent once when a client connects.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Wire schema version of the server.
        schema_version: u32,
    },

    /// Incremental update after a rebuild.
    #[serde(rename_all = "camelCase")]
    Update {
        /// Emitted ids of the modules to re-execute, ascending.
        changed_module_ids: Vec<u64>,
        /// Chunk name to new content hash, only for chunks whose hash changed.
        chunk_hashes: BTreeMap<String, String>,
    },

    /// The client should reload the whole page.
    Reload,

    /// A rebuild failed. Clients show an overlay; the server keeps running.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Human-readable failure description.
        message: String,
        /// File that caused the failure, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
    },
}

impl HmrMessage {
    /// The greeting sent to a freshly connected client.
    #[must_use]
    pub fn connected() -> Self {
        Self::Connected {
            schema_version: HMR_SCHEMA_VERSION,
        }
    }

    /// Build an error message.
    #[must_use]
    pub fn error(message: impl Into<String>, file: Option<String>) -> Self {
        Self::Error {
            message: message.into(),
            file,
        }
    }

    /// Returns true if this update carries nothing for clients to apply.
    #[must_use]
    pub fn is_empty_update(&self) -> bool {
        matches!(
            self,
            Self::Update { changed_module_ids, chunk_hashes }
                if changed_module_ids.is_empty() && chunk_hashes.is_empty()
        )
    }

    /// Serialize to the JSON text sent over the socket.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a message received from the socket.
    ///
    /// # Errors
    /// Returns an error if the text is not a valid message.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_wire_shape() {
        let mut chunk_hashes = BTreeMap::new();
        chunk_hashes.insert("main".to_string(), "abc123".to_string());
        let msg = HmrMessage::Update {
            changed_module_ids: vec![3, 7],
            chunk_hashes,
        };

        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"update","changedModuleIds":[3,7],"chunkHashes":{"main":"abc123"}}"#
        );
    }

    #[test]
    fn test_connected_and_reload() {
        let json = HmrMessage::connected().to_json().unwrap();
        assert_eq!(json, r#"{"type":"connected","schemaVersion":1}"#);

        let json = HmrMessage::Reload.to_json().unwrap();
        assert_eq!(json, r#"{"type":"reload"}"#);
    }

    #[test]
    fn test_error_escapes_quotes() {
        let msg = HmrMessage::error(r#"cannot resolve "./missing""#, Some("src/a.js".into()));
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], r#"cannot resolve "./missing""#);
        assert_eq!(value["file"], "src/a.js");
    }

    #[test]
    fn test_error_without_file_omits_field() {
        let json = HmrMessage::error("boom", None).to_json().unwrap();
        assert!(!json.contains("file"));
    }

    #[test]
    fn test_parse_update() {
        let msg = HmrMessage::from_json(
            r#"{"type":"update","changedModuleIds":[1],"chunkHashes":{}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            HmrMessage::Update {
                changed_module_ids: vec![1],
                chunk_hashes: BTreeMap::new(),
            }
        );
    }

    #[test]
    fn test_is_empty_update() {
        let empty = HmrMessage::Update {
            changed_module_ids: vec![],
            chunk_hashes: BTreeMap::new(),
        };
        assert!(empty.is_empty_update());
        assert!(!HmrMessage::Reload.is_empty_update());
    }
}
