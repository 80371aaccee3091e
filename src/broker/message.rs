//! Push protocol
//!
//! `PushMessage` is what subscribers receive:
//! `{"TYPE": ..., "METHOD": ..., "ENTITY": ..., "DATA": "<json string>"}`.
//! `METHOD` and `ENTITY` are omitted when unset; `DATA` is itself a JSON
//! document encoded as a string.

use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

/// `TYPE` of change notifications produced by the change bridge.
pub const CHANGE: &str = "CHANGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Insert,
    Update,
    UpdateImage,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "TYPE")]
    pub kind: String,
    #[serde(rename = "METHOD", default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(rename = "ENTITY", default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(rename = "DATA")]
    pub data: String,
}

impl PushMessage {
    /// An event named `kind` carrying `data`.
    pub fn event<T: Serialize>(kind: &str, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_string(),
            method: None,
            entity: None,
            data: serde_json::to_string(data)?,
        })
    }

    /// A `CHANGE` notification about an `entity`.
    pub fn change<T: Serialize>(
        method: Method,
        entity: &str,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: CHANGE.to_string(),
            method: Some(method),
            entity: Some(entity.to_string()),
            data: serde_json::to_string(data)?,
        })
    }

    pub fn to_ws(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }

    /// Decode `DATA` back into a JSON value.
    pub fn data_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}
