use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Raft transport ports sit this far above the HTTP port of the same node.
pub const RAFT_PORT_OFFSET: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Leader,
    Follower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub id: u64,
    /// Raft transport address.
    pub addr: String,
    pub role: PeerRole,
    pub state: Suffrage,
}

/// Membership as currently seen by one node's consensus layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    pub leader_id: Option<u64>,
    pub leader_addr: Option<String>,
    pub peers: Vec<PeerState>,
}

impl ClusterState {
    pub fn leader(&self) -> Option<&PeerState> {
        let id = self.leader_id?;
        self.peers.iter().find(|peer| peer.id == id)
    }

    pub fn is_leader(&self, id: u64) -> bool {
        self.leader_id == Some(id)
    }

    /// Every member except `id`.
    pub fn others(&self, id: u64) -> impl Iterator<Item = &PeerState> {
        self.peers.iter().filter(move |peer| peer.id != id)
    }

    pub fn contains(&self, id: u64, addr: &str) -> bool {
        self.peers.iter().any(|peer| peer.id == id && peer.addr == addr)
    }

    /// Ids of members matching either the id or the address.
    pub fn matching(&self, id: u64, addr: &str) -> Vec<u64> {
        self.peers
            .iter()
            .filter(|peer| peer.id == id || peer.addr == addr)
            .map(|peer| peer.id)
            .collect()
    }
}

fn split_host_port(addr: &str) -> Result<(&str, u16), StoreError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| StoreError::Invalid(format!("address {addr:?} is not host:port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| StoreError::Invalid(format!("address {addr:?} has an invalid port")))?;
    if host.is_empty() {
        return Err(StoreError::Invalid(format!("address {addr:?} has no host")));
    }
    Ok((host, port))
}

/// Maps a raft transport address to the HTTP address of the same node.
pub fn api_addr(raft_addr: &str) -> Result<String, StoreError> {
    let (host, port) = split_host_port(raft_addr)?;
    let port = port.checked_sub(RAFT_PORT_OFFSET).ok_or_else(|| {
        StoreError::Invalid(format!("raft port of {raft_addr:?} is below the port offset"))
    })?;
    Ok(format!("{host}:{port}"))
}

/// Maps an HTTP address to the raft transport address of the same node.
pub fn raft_addr(api_addr: &str) -> Result<String, StoreError> {
    let (host, port) = split_host_port(api_addr)?;
    let port = port.checked_add(RAFT_PORT_OFFSET).ok_or_else(|| {
        StoreError::Invalid(format!("port of {api_addr:?} leaves no room for the raft port"))
    })?;
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> ClusterState {
        let peer = |id, port, role| PeerState {
            id,
            addr: format!("10.0.0.{id}:{port}"),
            role,
            state: Suffrage::Voter,
        };
        ClusterState {
            leader_id: Some(2),
            leader_addr: Some("10.0.0.2:9002".into()),
            peers: vec![
                peer(1, 9001, PeerRole::Follower),
                peer(2, 9002, PeerRole::Leader),
                peer(3, 9003, PeerRole::Follower),
            ],
        }
    }

    #[test]
    fn port_offset_round_trips() -> Result<(), StoreError> {
        assert_eq!(api_addr("10.0.0.2:9002")?, "10.0.0.2:8002");
        assert_eq!(raft_addr("10.0.0.2:8002")?, "10.0.0.2:9002");
        Ok(())
    }

    #[test]
    fn malformed_addresses_are_invalid() {
        assert!(matches!(api_addr("10.0.0.2"), Err(StoreError::Invalid(_))));
        assert!(matches!(api_addr("10.0.0.2:80"), Err(StoreError::Invalid(_))));
        assert!(matches!(raft_addr(":8080"), Err(StoreError::Invalid(_))));
        assert!(matches!(raft_addr("host:65000"), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn leader_and_peer_queries() {
        let state = three_nodes();
        assert_eq!(state.leader().map(|p| p.id), Some(2));
        assert!(state.is_leader(2));
        assert_eq!(state.others(1).map(|p| p.id).collect::<Vec<_>>(), vec![2, 3]);
        assert!(state.contains(3, "10.0.0.3:9003"));
        assert!(!state.contains(3, "10.0.0.9:9003"));
        assert_eq!(state.matching(1, "10.0.0.3:9003"), vec![1, 3]);
    }

    #[test]
    fn serializes_camel_case() -> anyhow::Result<()> {
        let json = serde_json::to_value(three_nodes())?;
        assert_eq!(json["leaderId"], 2);
        assert_eq!(json["peers"][1]["role"], "leader");
        assert_eq!(json["peers"][0]["state"], "Voter");
        Ok(())
    }
}
