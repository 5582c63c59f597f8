//! Role-based access to an application's namespaces.

use std::sync::Arc;

use raft_store::{KvStore, StoreError};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::keys;

/// Roles in increasing order of privilege; each includes the ones below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Developer,
    Owner,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Developer => "developer",
            Role::Owner => "owner",
        }
    }
}

/// Members of one application by role, stored under `app.access.<app>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppAccess {
    pub owners: Vec<String>,
    pub developers: Vec<String>,
    pub viewers: Vec<String>,
}

impl AppAccess {
    /// Highest role held by `subject`; names compare case-insensitively.
    pub fn role_of(&self, subject: &str) -> Option<Role> {
        let listed = |names: &[String]| names.iter().any(|name| name.eq_ignore_ascii_case(subject));
        if listed(&self.owners) {
            Some(Role::Owner)
        } else if listed(&self.developers) {
            Some(Role::Developer)
        } else if listed(&self.viewers) {
            Some(Role::Viewer)
        } else {
            None
        }
    }
}

fn is_admin(subject: &str, admins: &[String]) -> bool {
    admins.iter().any(|admin| admin.eq_ignore_ascii_case(subject))
}

/// Allows `subject` when it is an admin or holds at least `required` in `access`.
pub fn authorize(
    subject: &str,
    required: Role,
    access: &AppAccess,
    admins: &[String],
) -> Result<(), ConfigError> {
    if subject.is_empty() {
        return Err(ConfigError::Unauthorized);
    }
    if is_admin(subject, admins) {
        return Ok(());
    }
    match access.role_of(subject) {
        Some(role) if role >= required => Ok(()),
        _ => Err(ConfigError::Forbidden(required.as_str().to_string())),
    }
}

pub struct AccessControl {
    store: Arc<dyn KvStore>,
    admins: Vec<String>,
}

impl AccessControl {
    pub fn new(store: Arc<dyn KvStore>, admins: Vec<String>) -> Self {
        Self { store, admins }
    }

    pub fn is_admin(&self, subject: &str) -> bool {
        !subject.is_empty() && is_admin(subject, &self.admins)
    }

    /// Access lists of `app_id`; an app without any grants nobody but admins.
    pub fn load(&self, app_id: &str) -> Result<AppAccess, ConfigError> {
        match self.store.get(&keys::access_key(app_id)) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|err| ConfigError::Invalid(format!("access list of {app_id}: {err}"))),
            Err(StoreError::NotFound(_)) => Ok(AppAccess::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, app_id: &str, access: &AppAccess) -> Result<(), ConfigError> {
        keys::validate_name("appId", app_id)?;
        let raw = serde_json::to_string(access)
            .map_err(|err| ConfigError::Invalid(format!("access list: {err}")))?;
        self.store.set(&keys::access_key(app_id), &raw, None).await?;
        Ok(())
    }

    pub fn check(&self, subject: &str, required: Role, app_id: &str) -> Result<(), ConfigError> {
        if self.is_admin(subject) {
            return Ok(());
        }
        authorize(subject, required, &self.load(app_id)?, &self.admins)
    }
}
