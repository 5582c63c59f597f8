//! Namespace versioning: current, future (draft) and history generations.
//!
//! A namespace exists while its current key exists. Editing writes the
//! future key; releasing archives the current content, promotes the future
//! content, pushes the diff to subscribers and drops the future key, in that
//! order.

use std::collections::BTreeMap;
use std::sync::Arc;

use raft_store::{KvStore, StoreError, now_ms};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{FlatMap, flatten};
use crate::diff::{NamespaceDiff, diff};
use crate::error::ConfigError;
use crate::instance::InstanceService;
use crate::keys::{self, NamespaceId};
use crate::propagation::{ConfigChange, Propagator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Release time in unix milliseconds.
    pub time: u64,
    #[serde(default)]
    pub modified_by: String,
    /// Content that was current before the release.
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceContent {
    pub namespace: String,
    pub current: String,
    pub draft: Option<String>,
    pub diff: NamespaceDiff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSummary {
    pub namespace: String,
    pub has_draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(NamespaceDiff),
    /// The draft matched the current content; nothing was written.
    Unchanged,
}

pub struct ConfigService {
    store: Arc<dyn KvStore>,
    instances: Arc<InstanceService>,
    propagator: Propagator,
}

impl ConfigService {
    pub fn new(
        store: Arc<dyn KvStore>,
        instances: Arc<InstanceService>,
        propagator: Propagator,
    ) -> Self {
        Self {
            store,
            instances,
            propagator,
        }
    }

    fn optional(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.store.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn current(&self, id: &NamespaceId) -> Result<String, ConfigError> {
        self.optional(&id.current_key())?
            .ok_or_else(|| ConfigError::NotFound(format!("namespace {id}")))
    }

    pub async fn create(&self, id: &NamespaceId) -> Result<(), ConfigError> {
        id.validate()?;
        if self.optional(&id.current_key())?.is_some() {
            return Err(ConfigError::AlreadyExists(format!("namespace {id}")));
        }
        self.store.set(&id.current_key(), "", None).await?;
        info!(namespace = %id, "namespace created");
        Ok(())
    }

    /// Deletes every generation of a namespace nobody subscribes to. Only the
    /// current key must go; draft and history cleanup failures are logged.
    pub async fn remove(&self, id: &NamespaceId) -> Result<(), ConfigError> {
        id.validate()?;
        self.current(id)?;
        if self.instances.has_subscribers(id)? {
            return Err(ConfigError::PreconditionFailed(format!(
                "namespace {id} has live subscribers"
            )));
        }
        self.store.delete(&id.current_key()).await?;
        if let Err(err) = self.store.delete(&id.future_key()).await {
            warn!(namespace = %id, error = %err, "failed to delete draft");
        }
        match self.store.scan_keys(&id.history_prefix()) {
            Ok(history) => {
                for key in history {
                    if let Err(err) = self.store.delete(&key).await {
                        warn!(
                            namespace = %id,
                            %key,
                            error = %err,
                            "failed to delete history record"
                        );
                    }
                }
            }
            Err(err) => warn!(namespace = %id, error = %err, "failed to list history"),
        }
        info!(namespace = %id, "namespace removed");
        Ok(())
    }

    /// Stores `content` as the draft. The current content is untouched.
    pub async fn edit(&self, id: &NamespaceId, content: &str) -> Result<(), ConfigError> {
        id.validate()?;
        self.current(id)?;
        flatten(id.format()?, content)?;
        self.store.set(&id.future_key(), content, None).await?;
        debug!(namespace = %id, "draft saved");
        Ok(())
    }

    pub async fn discard(&self, id: &NamespaceId) -> Result<(), ConfigError> {
        id.validate()?;
        self.current(id)?;
        self.store.delete(&id.future_key()).await?;
        Ok(())
    }

    pub fn content(&self, id: &NamespaceId) -> Result<NamespaceContent, ConfigError> {
        id.validate()?;
        let current = self.current(id)?;
        let draft = self.optional(&id.future_key())?;
        let diff = diff(&id.namespace, &current, draft.as_deref().unwrap_or_default())?;
        Ok(NamespaceContent {
            namespace: id.namespace.clone(),
            current,
            draft,
            diff,
        })
    }

    pub fn list(&self, app_id: &str, group: &str) -> Result<Vec<NamespaceSummary>, ConfigError> {
        keys::validate_name("appId", app_id)?;
        keys::validate_name("group", group)?;
        let prefix = keys::current_prefix(app_id, group);
        let mut namespaces = Vec::new();
        for key in self.store.scan_keys(&prefix)? {
            let namespace = key[prefix.len()..].to_string();
            let id = NamespaceId {
                app_id: app_id.to_string(),
                group: group.to_string(),
                namespace: namespace.clone(),
            };
            let has_draft = self.optional(&id.future_key())?.is_some();
            namespaces.push(NamespaceSummary {
                namespace,
                has_draft,
            });
        }
        Ok(namespaces)
    }

    /// Release records, newest first.
    pub fn history(&self, id: &NamespaceId) -> Result<Vec<HistoryRecord>, ConfigError> {
        id.validate()?;
        let records = self.store.scan_prefix(&id.history_prefix())?;
        Ok(records
            .into_iter()
            .rev()
            .filter_map(|(key, raw)| match serde_json::from_str::<HistoryRecord>(&raw) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(%key, error = %err, "unreadable history record");
                    None
                }
            })
            .collect())
    }

    /// Promotes the draft to current.
    pub async fn release(
        &self,
        id: &NamespaceId,
        editor: &str,
    ) -> Result<ReleaseOutcome, ConfigError> {
        id.validate()?;
        let current = self.current(id)?;
        let future = self
            .optional(&id.future_key())?
            .ok_or_else(|| ConfigError::NotFound(format!("draft of {id}")))?;

        let diff = diff(&id.namespace, &current, &future)?;
        if diff.same {
            debug!(namespace = %id, "draft matches current, nothing to release");
            return Ok(ReleaseOutcome::Unchanged);
        }

        let released_at = self.free_history_slot(id)?;
        let record = HistoryRecord {
            time: released_at,
            modified_by: editor.to_string(),
            content: current,
        };
        let record = serde_json::to_string(&record)
            .map_err(|err| ConfigError::Invalid(format!("history record: {err}")))?;
        self.store.set(&id.history_key(released_at), &record, None).await?;
        self.store.set(&id.current_key(), &future, None).await?;

        self.propagator.on_release(ConfigChange {
            app_id: id.app_id.clone(),
            group: id.group.clone(),
            diff: diff.clone(),
        });

        self.store.delete(&id.future_key()).await?;
        info!(
            namespace = %id,
            editor,
            added = diff.added.len(),
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            "namespace released"
        );
        Ok(ReleaseOutcome::Released(diff))
    }

    /// Release time not yet used by a history record of `id`.
    fn free_history_slot(&self, id: &NamespaceId) -> Result<u64, ConfigError> {
        let mut at = now_ms();
        while self.optional(&id.history_key(at))?.is_some() {
            at += 1;
        }
        Ok(at)
    }

    /// Flattened current content of each subscribed namespace, keyed
    /// `<app>.<group>.<namespace>`. Missing namespaces are skipped.
    pub fn client_config(
        &self,
        app_id: &str,
        group: &str,
        namespaces: &[String],
    ) -> Result<BTreeMap<String, FlatMap>, ConfigError> {
        let mut out = BTreeMap::new();
        for entry in namespaces {
            let id = NamespaceId::from_subscription(entry, app_id, group)?;
            let Some(content) = self.optional(&id.current_key())? else {
                debug!(namespace = %id, "requested namespace does not exist");
                continue;
            };
            out.insert(id.to_string(), flatten(id.format()?, &content)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use raft_store::MemoryStore;
    use tokio::sync::watch;

    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::propagation::{PeerNotifier, PropagationSettings};

    struct NoPeers;

    #[async_trait::async_trait]
    impl PeerNotifier for NoPeers {
        async fn push(&self, _peer_addr: &str, _change: &ConfigChange) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn service() -> (Arc<MemoryStore>, ConfigService, watch::Sender<bool>) {
        let store = Arc::new(MemoryStore::new(1, "127.0.0.1:9001"));
        let instances = Arc::new(InstanceService::new(store.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let propagator = Propagator::new(
            store.clone(),
            instances.clone(),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(NoPeers),
            PropagationSettings::default(),
            stop_rx,
        );
        (store.clone(), ConfigService::new(store, instances, propagator), stop_tx)
    }

    fn id(namespace: &str) -> NamespaceId {
        NamespaceId {
            app_id: "demo".into(),
            group: "group".into(),
            namespace: namespace.into(),
        }
    }

    #[tokio::test]
    async fn create_refuses_duplicates() -> anyhow::Result<()> {
        let (store, configs, _stop) = service();
        configs.create(&id("app.yaml")).await?;
        assert_eq!(store.get("cfg.current.demo.group.app.yaml")?, "");
        assert!(matches!(
            configs.create(&id("app.yaml")).await,
            Err(ConfigError::AlreadyExists(_))
        ));
        assert!(matches!(configs.create(&id("app.txt")).await, Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[tokio::test]
    async fn release_archives_then_promotes_then_clears_the_draft() -> anyhow::Result<()> {
        let (store, configs, _stop) = service();
        let ns = id("app.props");
        configs.create(&ns).await?;
        configs.edit(&ns, "a=1").await?;
        configs.release(&ns, "alice").await?;

        configs.edit(&ns, "a=2\nb=3").await?;
        assert_eq!(store.get(&ns.current_key())?, "a=1");

        let ReleaseOutcome::Released(diff) = configs.release(&ns, "bob").await? else {
            anyhow::bail!("expected a release");
        };
        assert_eq!(diff.changed["a"].after, "2");
        assert_eq!(diff.added["b"], "3");
        assert_eq!(store.get(&ns.current_key())?, "a=2\nb=3");
        assert!(store.get(&ns.future_key()).is_err());

        let history = configs.history(&ns)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "a=1");
        assert_eq!(history[0].modified_by, "bob");
        assert_eq!(history[1].content, "");
        assert!(history[0].time > history[1].time);
        Ok(())
    }

    #[tokio::test]
    async fn release_without_a_real_change_writes_nothing() -> anyhow::Result<()> {
        let (store, configs, _stop) = service();
        let ns = id("app.props");
        configs.create(&ns).await?;
        assert!(matches!(configs.release(&ns, "alice").await, Err(ConfigError::NotFound(_))));

        configs.edit(&ns, "a=1").await?;
        configs.release(&ns, "alice").await?;
        configs.edit(&ns, "a=1").await?;
        assert_eq!(configs.release(&ns, "alice").await?, ReleaseOutcome::Unchanged);
        assert_eq!(store.get(&ns.future_key())?, "a=1");
        assert_eq!(configs.history(&ns)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn edits_are_validated_and_can_be_discarded() -> anyhow::Result<()> {
        let (_, configs, _stop) = service();
        let ns = id("db.json");
        assert!(matches!(configs.edit(&ns, "{}").await, Err(ConfigError::NotFound(_))));

        configs.create(&ns).await?;
        assert!(matches!(configs.edit(&ns, "[1, 2]").await, Err(ConfigError::Invalid(_))));

        configs.edit(&ns, r#"{"pool":{"size":4}}"#).await?;
        let view = configs.content(&ns)?;
        assert_eq!(view.draft.as_deref(), Some(r#"{"pool":{"size":4}}"#));
        assert_eq!(view.diff.added["pool.size"], "4");
        assert!(configs.list("demo", "group")?[0].has_draft);

        configs.discard(&ns).await?;
        configs.discard(&ns).await?;
        assert!(configs.content(&ns)?.draft.is_none());
        assert!(!configs.list("demo", "group")?[0].has_draft);
        Ok(())
    }

    #[tokio::test]
    async fn remove_requires_no_subscribers_and_clears_every_generation() -> anyhow::Result<()> {
        let (store, configs, _stop) = service();
        let ns = id("app.props");
        configs.create(&ns).await?;
        configs.edit(&ns, "a=1").await?;
        configs.release(&ns, "alice").await?;
        configs.edit(&ns, "a=2").await?;

        let marker = keys::marker_key(&ns, "10.0.0.5", 8080);
        store.set(&marker, "demo", None).await?;
        assert!(matches!(
            configs.remove(&ns).await,
            Err(ConfigError::PreconditionFailed(_))
        ));

        store.delete(&marker).await?;
        configs.remove(&ns).await?;
        assert!(store.scan_keys("cfg.")?.is_empty());
        assert!(matches!(configs.remove(&ns).await, Err(ConfigError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn client_config_flattens_own_and_shared_namespaces() -> anyhow::Result<()> {
        let (_, configs, _stop) = service();
        let own = id("app.yaml");
        configs.create(&own).await?;
        configs.edit(&own, "server:\n  port: 80\n").await?;
        configs.release(&own, "alice").await?;

        let shared = NamespaceId::new("common", "base", "db.props")?;
        configs.create(&shared).await?;
        configs.edit(&shared, "url=jdbc:x").await?;
        configs.release(&shared, "alice").await?;

        let config = configs.client_config(
            "demo",
            "group",
            &["app.yaml".into(), "common.base.db.props".into(), "missing.json".into()],
        )?;
        assert_eq!(config.len(), 2);
        assert_eq!(config["demo.group.app.yaml"]["server.port"], "80");
        assert_eq!(config["common.base.db.props"]["url"], "jdbc:x");
        Ok(())
    }
}
