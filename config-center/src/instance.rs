//! Instance registration, heartbeats and subscription markers.
//!
//! Everything written here carries a TTL: an instance that stops sending
//! heartbeats simply lapses out of the store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use raft_store::{KvStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::connection_key;
use crate::error::ConfigError;
use crate::keys::{self, NamespaceId};
use crate::message::Heartbeat;

pub const STATE_UP: &str = "UP";
pub const STATE_DOWN: &str = "DOWN";
pub const STATE_DISABLED: &str = "DISABLED";

pub const META_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const REGISTRATION_TTL: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(10);
const MIN_HEARTBEAT_TIMEOUT_MS: u64 = 1_000;
const MIN_IP_LEN: usize = 7;

/// Registration TTL for a heartbeat timeout given in milliseconds.
pub fn heartbeat_ttl(timeout_ms: u64) -> Duration {
    if timeout_ms < MIN_HEARTBEAT_TIMEOUT_MS {
        DEFAULT_HEARTBEAT_TTL
    } else {
        Duration::from_millis(timeout_ms)
    }
}

/// App and group become dot-separated key segments, so they must be plain names.
fn validate_endpoint(app_id: &str, group: &str, ip: &str, port: u16) -> Result<(), ConfigError> {
    keys::validate_name("appId", app_id)?;
    keys::validate_name("group", group)?;
    if ip.len() < MIN_IP_LEN {
        return Err(ConfigError::Invalid(format!("ip {ip:?}")));
    }
    if port < 1 {
        return Err(ConfigError::Invalid("port".into()));
    }
    Ok(())
}

fn meta_string(meta: &BTreeMap<String, String>) -> String {
    if meta.is_empty() {
        return String::new();
    }
    serde_json::to_string(meta).unwrap_or_default()
}

/// Explicit registration of an instance, outside the heartbeat channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Registration {
    pub app_id: String,
    pub group: String,
    pub ip: String,
    pub port: u16,
    pub state: String,
    pub meta: BTreeMap<String, String>,
    pub namespaces: Vec<String>,
}

impl Registration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.app_id, &self.group, &self.ip, self.port)?;
        match self.state.as_str() {
            STATE_UP | STATE_DOWN | STATE_DISABLED => Ok(()),
            other => Err(ConfigError::Invalid(format!("state {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub app_id: String,
    pub group: String,
    pub ip: String,
    pub port: u16,
    pub state: String,
    pub meta: BTreeMap<String, String>,
}

/// An instance listening on a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// The subscriber's own app, which may differ from the namespace owner.
    pub app_id: String,
    pub ip: String,
    pub port: u16,
}

impl Subscriber {
    pub fn connection_key(&self) -> String {
        connection_key(&self.app_id, &self.ip, self.port)
    }
}

pub struct InstanceService {
    store: Arc<dyn KvStore>,
}

impl InstanceService {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Refreshes the instance state, its metadata and, when configuration is
    /// enabled, one marker per subscribed namespace.
    pub async fn heartbeat(&self, beat: &Heartbeat) -> Result<(), ConfigError> {
        validate_endpoint(&beat.app_id, &beat.group, &beat.ip, beat.port)?;
        let ttl = heartbeat_ttl(beat.timeout);

        let meta_key = keys::meta_key(&beat.app_id, &beat.group, &beat.ip, beat.port);
        let meta = match self.store.get(&meta_key) {
            Ok(existing) => existing,
            Err(StoreError::NotFound(_)) => meta_string(&beat.meta),
            Err(err) => return Err(err.into()),
        };
        self.store.set(&meta_key, &meta, Some(META_TTL)).await?;

        let instance_key = keys::instance_key(&beat.app_id, &beat.group, &beat.ip, beat.port);
        let state = if beat.enable_svc {
            match self.store.get(&instance_key) {
                Ok(existing) if !existing.is_empty() => existing,
                _ => STATE_UP.to_string(),
            }
        } else {
            STATE_DISABLED.to_string()
        };
        self.store.set(&instance_key, &state, Some(ttl)).await?;

        if beat.enable_cfg {
            for entry in &beat.namespaces {
                let id = match NamespaceId::from_subscription(entry, &beat.app_id, &beat.group) {
                    Ok(id) => id,
                    Err(err) => {
                        warn!(
                            app = %beat.app_id,
                            namespace = %entry,
                            error = %err,
                            "skipping subscription"
                        );
                        continue;
                    }
                };
                let marker = keys::marker_key(&id, &beat.ip, beat.port);
                self.store.set(&marker, &beat.app_id, Some(ttl)).await?;
            }
        }
        debug!(app = %beat.app_id, ip = %beat.ip, port = beat.port, "heartbeat");
        Ok(())
    }

    pub async fn register(&self, registration: &Registration) -> Result<(), ConfigError> {
        registration.validate()?;
        let Registration {
            app_id,
            group,
            ip,
            port,
            ..
        } = registration;

        let meta_key = keys::meta_key(app_id, group, ip, *port);
        self.store
            .set(&meta_key, &meta_string(&registration.meta), Some(META_TTL))
            .await?;
        for entry in &registration.namespaces {
            let marker = NamespaceId::from_subscription(entry, app_id, group)
                .map(|id| keys::marker_key(&id, ip, *port));
            let written = match marker {
                Ok(marker) => self
                    .store
                    .set(&marker, app_id, Some(REGISTRATION_TTL))
                    .await
                    .map_err(ConfigError::from),
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                warn!(
                    app = %app_id,
                    namespace = %entry,
                    error = %err,
                    "failed to register subscription"
                );
            }
        }
        let instance_key = keys::instance_key(app_id, group, ip, *port);
        self.store
            .set(&instance_key, &registration.state, Some(REGISTRATION_TTL))
            .await?;
        Ok(())
    }

    /// Live instances of `app_id`/`group` with their state and metadata.
    pub fn services(&self, app_id: &str, group: &str) -> Result<Vec<ServiceInstance>, ConfigError> {
        let states_prefix = keys::instance_prefix(app_id, group);
        let states = self.store.scan_prefix(&states_prefix)?;
        let metas = self.store.scan_prefix(&keys::meta_prefix(app_id, group))?;

        let mut services = Vec::with_capacity(states.len());
        for (key, state) in states {
            let Some((ip, port)) = keys::parse_endpoint(&key[states_prefix.len()..]) else {
                continue;
            };
            let meta = match metas.get(&keys::meta_key(app_id, group, &ip, port)) {
                Some(raw) if !raw.is_empty() => serde_json::from_str(raw).unwrap_or_else(|err| {
                    warn!(%key, error = %err, "unreadable instance meta");
                    BTreeMap::new()
                }),
                _ => BTreeMap::new(),
            };
            services.push(ServiceInstance {
                app_id: app_id.to_string(),
                group: group.to_string(),
                ip,
                port,
                state,
                meta,
            });
        }
        Ok(services)
    }

    pub fn subscribers(&self, id: &NamespaceId) -> Result<Vec<Subscriber>, ConfigError> {
        let prefix = id.subscriber_prefix();
        let markers = self.store.scan_prefix(&prefix)?;
        Ok(markers
            .into_iter()
            .filter_map(|(key, app)| {
                let (ip, port) = keys::parse_endpoint(&key[prefix.len()..])?;
                let app_id = if app.is_empty() || app == STATE_UP {
                    id.app_id.clone()
                } else {
                    app
                };
                Some(Subscriber { app_id, ip, port })
            })
            .collect())
    }

    pub fn has_subscribers(&self, id: &NamespaceId) -> Result<bool, ConfigError> {
        Ok(!self.store.scan_keys(&id.subscriber_prefix())?.is_empty())
    }
}
