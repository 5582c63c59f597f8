//! Internal HTTP contract between nodes.
//!
//! Writes and membership commands received by a follower are replayed against
//! the leader's HTTP API. Requests carry a token derived from the cluster
//! secret in the [`INNER_AUTH_HEADER`] header; replies are [`Reply`]
//! envelopes where code `"0"` means success.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::StoreError;
use crate::membership::api_addr;

pub const INNER_AUTH_HEADER: &str = "_inner_auth";
pub const WRITE_PATH: &str = "/api/store/key";
pub const CLUSTER_PATH: &str = "/api/raft/cluster";
pub const SUCCESS_CODE: &str = "0";

/// Token peers present to each other's internal endpoints.
pub fn inner_token(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    Set,
    Setex,
    Del,
}

/// A replicated write as sent to the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub cmd: WriteOp,
    pub key: String,
    #[serde(default)]
    pub value: String,
    /// TTL in milliseconds for `setex`; the leader turns it into an absolute expiry.
    #[serde(default)]
    pub exp: u64,
}

impl WriteRequest {
    pub fn set(key: &str, value: &str, ttl: Option<Duration>) -> Self {
        match ttl {
            Some(ttl) => Self {
                cmd: WriteOp::Setex,
                key: key.to_string(),
                value: value.to_string(),
                exp: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            },
            None => Self {
                cmd: WriteOp::Set,
                key: key.to_string(),
                value: value.to_string(),
                exp: 0,
            },
        }
    }

    pub fn delete(key: &str) -> Self {
        Self {
            cmd: WriteOp::Del,
            key: key.to_string(),
            value: String::new(),
            exp: 0,
        }
    }

    /// Every `setex` carries a TTL, zero included.
    pub fn ttl(&self) -> Option<Duration> {
        (self.cmd == WriteOp::Setex).then(|| Duration::from_millis(self.exp))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterOp {
    Join,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCommand {
    pub cmd: ClusterOp,
    #[serde(rename = "nodeId")]
    pub node_id: u64,
    pub addr: String,
}

/// Response envelope shared by every HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply<T = serde_json::Value> {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Reply<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: SUCCESS_CODE.to_string(),
            message: None,
            data: Some(data),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }
}

impl Reply<()> {
    pub fn done() -> Self {
        Self {
            code: SUCCESS_CODE.to_string(),
            message: None,
            data: None,
        }
    }
}

/// Client for the leader's internal endpoints.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    token: String,
}

impl Forwarder {
    pub fn new(token: String, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StoreError::Internal(err.into()))?;
        Ok(Self { client, token })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn write(
        &self,
        leader_raft_addr: &str,
        request: &WriteRequest,
    ) -> Result<(), StoreError> {
        self.post(leader_raft_addr, WRITE_PATH, request).await
    }

    pub async fn cluster(
        &self,
        leader_raft_addr: &str,
        command: &ClusterCommand,
    ) -> Result<(), StoreError> {
        self.post(leader_raft_addr, CLUSTER_PATH, command).await
    }

    /// Asks the node serving HTTP on `api_addr` to change membership.
    pub async fn cluster_via(
        &self,
        api_addr: &str,
        command: &ClusterCommand,
    ) -> Result<(), StoreError> {
        self.post_api(api_addr, CLUSTER_PATH, command).await
    }

    /// POSTs `body` to `path` on the node whose raft address is `raft_addr`.
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        raft_addr: &str,
        path: &str,
        body: &B,
    ) -> Result<(), StoreError> {
        self.post_api(&api_addr(raft_addr)?, path, body).await
    }

    pub async fn post_api<B: Serialize + ?Sized>(
        &self,
        api_addr: &str,
        path: &str,
        body: &B,
    ) -> Result<(), StoreError> {
        let url = format!("http://{api_addr}{path}");
        debug!(%url, "forwarding to peer");
        let response = self
            .client
            .post(&url)
            .header(INNER_AUTH_HEADER, &self.token)
            .json(body)
            .send()
            .await
            .map_err(|err| StoreError::remote("unreachable", err))?;
        let status = response.status();
        let reply: Reply = response
            .json()
            .await
            .map_err(|err| StoreError::remote(status.as_str(), err))?;
        if reply.is_success() {
            return Ok(());
        }
        Err(StoreError::Remote {
            code: reply.code,
            message: reply.message.unwrap_or_else(|| status.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_wire_shape() -> anyhow::Result<()> {
        let request = WriteRequest::set(
            "instance.info.demo.g.1.2.3.4:80",
            "UP",
            Some(Duration::from_secs(30)),
        );
        let json = serde_json::to_value(&request)?;
        assert_eq!(json["cmd"], "setex");
        assert_eq!(json["exp"], 30_000);
        assert_eq!(request.ttl(), Some(Duration::from_secs(30)));

        let delete: WriteRequest = serde_json::from_str(r#"{"cmd":"del","key":"k"}"#)?;
        assert_eq!(delete, WriteRequest::delete("k"));
        assert_eq!(delete.ttl(), None);
        Ok(())
    }

    #[test]
    fn sub_millisecond_ttl_stays_a_ttl() -> anyhow::Result<()> {
        let request = WriteRequest::set("k", "v", Some(Duration::from_micros(500)));
        assert_eq!((request.cmd, request.exp), (WriteOp::Setex, 0));
        assert_eq!(request.ttl(), Some(Duration::ZERO));

        let replayed: WriteRequest =
            serde_json::from_str(r#"{"cmd":"setex","key":"k","value":"v","exp":0}"#)?;
        assert_eq!(replayed.ttl(), Some(Duration::ZERO));
        Ok(())
    }

    #[test]
    fn cluster_command_uses_node_id_field() -> anyhow::Result<()> {
        let command: ClusterCommand =
            serde_json::from_str(r#"{"cmd":"join","nodeId":4,"addr":"10.0.0.4:9000"}"#)?;
        assert_eq!(command.cmd, ClusterOp::Join);
        assert_eq!(command.node_id, 4);
        Ok(())
    }

    #[test]
    fn reply_success_is_code_zero() -> anyhow::Result<()> {
        let ok: Reply = serde_json::from_str(r#"{"code":"0"}"#)?;
        assert!(ok.is_success());
        let failed: Reply = serde_json::from_str(r#"{"code":"503","message":"no leader"}"#)?;
        assert!(!failed.is_success());
        assert_eq!(serde_json::to_string(&Reply::done())?, r#"{"code":"0"}"#);
        Ok(())
    }

    #[test]
    fn token_is_stable_hex_digest() {
        let token = inner_token("cluster-secret");
        assert_eq!(token.len(), 64);
        assert_eq!(token, inner_token("cluster-secret"));
        assert_ne!(token, inner_token("other"));
    }

    #[tokio::test]
    async fn unreachable_leader_is_remote_error() -> anyhow::Result<()> {
        let forwarder = Forwarder::new("t".into(), Duration::from_millis(500))?;
        // Port 1001 maps to HTTP port 1 where nothing listens.
        let err = forwarder
            .write("127.0.0.1:1001", &WriteRequest::delete("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Remote { .. }));
        Ok(())
    }
}
