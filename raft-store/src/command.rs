use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A store mutation as carried in a log entry.
///
/// Expiries are absolute so every replica judges them against its own clock
/// at apply time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Set {
        key: String,
        value: String,
    },
    SetWithTtl {
        key: String,
        value: String,
        expires_at_ms: u64,
    },
    Delete {
        key: String,
    },
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. }
            | Command::SetWithTtl { key, .. }
            | Command::Delete { key } => key,
        }
    }
}
