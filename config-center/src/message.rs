//! Subscriber wire protocol.
//!
//! Clients send [`Heartbeat`] JSON text frames. The server pushes events as
//! JSON followed by a single [`EventKind`] byte.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Heartbeat {
    pub app_id: String,
    pub group: String,
    pub ip: String,
    pub port: u16,
    pub enable_svc: bool,
    pub enable_cfg: bool,
    pub meta: BTreeMap<String, String>,
    pub namespaces: Vec<String>,
    /// Milliseconds the registration stays alive without another heartbeat.
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Remove,
    Change,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub namespace: String,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: ChangeType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub before: String,
}

/// Kind byte appended to every pushed frame. Only configuration changes are
/// pushed; clients reserve 2 and 3 for instance and service events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    Config = 1,
}

impl EventKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Config),
            _ => None,
        }
    }
}

pub fn encode_event<T: Serialize>(kind: EventKind, payload: &T) -> serde_json::Result<String> {
    let mut text = serde_json::to_string(payload)?;
    text.push(char::from(kind as u8));
    Ok(text)
}

/// Splits a pushed frame into its kind and JSON payload.
pub fn decode_event(frame: &str) -> Option<(EventKind, &str)> {
    let (&last, _) = frame.as_bytes().split_last()?;
    let kind = EventKind::from_byte(last)?;
    Some((kind, &frame[..frame.len() - 1]))
}
