//! Identifiers and the key layout they map to in the store.
//!
//! ```text
//! cfg.current.<app>.<group>.<namespace>
//! cfg.future.<app>.<group>.<namespace>
//! cfg.history.<app>.<group>.<namespace>.<release millis>
//! instance.info.<app>.<group>.<ip>:<port>
//! instance.meta.<app>.<group>.<ip>:<port>
//! ns.<app>.<group>.<namespace>.<ip>:<port>
//! app.access.<app>
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CURRENT: &str = "cfg.current";
const FUTURE: &str = "cfg.future";
const HISTORY: &str = "cfg.history";
const INSTANCE: &str = "instance.info";
const META: &str = "instance.meta";
const MARKER: &str = "ns";
const ACCESS: &str = "app.access";

/// Width of the zero-padded release timestamp so keys sort by time.
const HISTORY_STAMP_WIDTH: usize = 20;

fn is_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn validate_name(kind: &str, value: &str) -> Result<(), ConfigError> {
    if is_name(value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{kind} {value:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
    Props,
}

impl Format {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            "props" | "properties" => Some(Self::Props),
            _ => None,
        }
    }

    /// Format named by the suffix after the last dot of `namespace`.
    pub fn of(namespace: &str) -> Result<Self, ConfigError> {
        namespace
            .rsplit_once('.')
            .and_then(|(_, suffix)| Self::from_suffix(suffix))
            .ok_or_else(|| ConfigError::Invalid(format!("namespace {namespace:?}")))
    }
}

/// `<name>.<format>` with a name made of letters, digits, `-` and `_`.
pub fn validate_namespace(namespace: &str) -> Result<Format, ConfigError> {
    let (name, _) = namespace
        .rsplit_once('.')
        .ok_or_else(|| ConfigError::Invalid(format!("namespace {namespace:?}")))?;
    validate_name("namespace", name)?;
    Format::of(namespace)
}

/// A namespace document: (app, group, namespace name with format suffix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceId {
    pub app_id: String,
    pub group: String,
    pub namespace: String,
}

impl NamespaceId {
    pub fn new(app_id: &str, group: &str, namespace: &str) -> Result<Self, ConfigError> {
        let id = Self {
            app_id: app_id.to_string(),
            group: group.to_string(),
            namespace: namespace.to_string(),
        };
        id.validate()?;
        Ok(id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("appId", &self.app_id)?;
        validate_name("group", &self.group)?;
        validate_namespace(&self.namespace)?;
        Ok(())
    }

    pub fn format(&self) -> Result<Format, ConfigError> {
        Format::of(&self.namespace)
    }

    pub fn current_key(&self) -> String {
        format!("{CURRENT}.{}.{}.{}", self.app_id, self.group, self.namespace)
    }

    pub fn future_key(&self) -> String {
        format!("{FUTURE}.{}.{}.{}", self.app_id, self.group, self.namespace)
    }

    pub fn history_prefix(&self) -> String {
        format!("{HISTORY}.{}.{}.{}.", self.app_id, self.group, self.namespace)
    }

    pub fn history_key(&self, released_at_ms: u64) -> String {
        format!(
            "{}{:0width$}",
            self.history_prefix(),
            released_at_ms,
            width = HISTORY_STAMP_WIDTH
        )
    }

    pub fn subscriber_prefix(&self) -> String {
        format!("{MARKER}.{}.{}.{}.", self.app_id, self.group, self.namespace)
    }

    /// Parses a subscription entry. Four dot-separated segments name another
    /// application's namespace (`app.group.name.format`); anything else is a
    /// namespace of `own_app`/`own_group`.
    pub fn from_subscription(
        entry: &str,
        own_app: &str,
        own_group: &str,
    ) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = entry.split('.').collect();
        match parts.as_slice() {
            [app, group, name, format] => Self::new(app, group, &format!("{name}.{format}")),
            _ => Self::new(own_app, own_group, entry),
        }
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.app_id, self.group, self.namespace)
    }
}

pub fn current_prefix(app_id: &str, group: &str) -> String {
    format!("{CURRENT}.{app_id}.{group}.")
}

pub fn instance_prefix(app_id: &str, group: &str) -> String {
    format!("{INSTANCE}.{app_id}.{group}.")
}

pub fn instance_key(app_id: &str, group: &str, ip: &str, port: u16) -> String {
    format!("{}{ip}:{port}", instance_prefix(app_id, group))
}

pub fn meta_prefix(app_id: &str, group: &str) -> String {
    format!("{META}.{app_id}.{group}.")
}

pub fn meta_key(app_id: &str, group: &str, ip: &str, port: u16) -> String {
    format!("{}{ip}:{port}", meta_prefix(app_id, group))
}

pub fn marker_key(id: &NamespaceId, ip: &str, port: u16) -> String {
    format!("{}{ip}:{port}", id.subscriber_prefix())
}

pub fn access_key(app_id: &str) -> String {
    format!("{ACCESS}.{app_id}")
}

/// Splits the trailing `<ip>:<port>` of an instance or marker key.
pub fn parse_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let (ip, port) = endpoint.rsplit_once(':')?;
    let port = port.parse::<u16>().ok().filter(|port| *port > 0)?;
    if ip.is_empty() {
        return None;
    }
    Some((ip.to_string(), port))
}
