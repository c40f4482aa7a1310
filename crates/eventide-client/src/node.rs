//! Cluster member model shared by gossip discovery.
//!
//! Member lists are refreshed on every discovery attempt and treated as
//! immutable snapshots once produced; nothing here is persisted across
//! process restarts.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declared state of a cluster member in a gossip view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VNodeState {
    /// Cluster leader, accepts writes.
    #[serde(alias = "Master")]
    Leader,
    /// Replicating follower.
    #[serde(alias = "Slave")]
    Follower,
    /// Read-only replica outside the quorum.
    ReadOnlyReplica,
    /// Clone catching up outside the quorum.
    Clone,
    /// Member replaying history to rejoin.
    CatchingUp,
    /// Member negotiating its replica role.
    PreReplica,
    /// Member still starting up.
    Initializing,
    /// External cluster manager, never a data node.
    Manager,
    /// Member on its way down.
    ShuttingDown,
    /// Member fully stopped.
    Shutdown,
    /// State not recognized.
    Unknown,
}

impl VNodeState {
    /// Ranking for endpoint selection; lower is better, `None` is ineligible.
    pub fn rank(self) -> Option<u8> {
        match self {
            VNodeState::Leader => Some(0),
            VNodeState::Follower => Some(1),
            VNodeState::ReadOnlyReplica => Some(2),
            VNodeState::Clone => Some(3),
            VNodeState::CatchingUp => Some(4),
            VNodeState::PreReplica => Some(5),
            VNodeState::Initializing => Some(6),
            VNodeState::Manager
            | VNodeState::ShuttingDown
            | VNodeState::Shutdown
            | VNodeState::Unknown => None,
        }
    }
}

/// One member of a gossip view, as served by a node's HTTP gossip endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    /// Stable id of the server instance.
    pub instance_id: Uuid,
    /// When the owning node last updated this entry (ISO-8601).
    #[serde(default)]
    pub time_stamp: String,
    /// Declared state.
    pub state: VNodeState,
    /// Whether the owning node believes the member is up.
    pub is_alive: bool,
    /// External client TCP address.
    pub external_tcp_ip: String,
    /// External client TCP port.
    pub external_tcp_port: u16,
    /// External client TLS port; 0 when TLS is not offered.
    #[serde(default)]
    pub external_secure_tcp_port: u16,
    /// Operator-assigned selection priority; higher wins ties.
    #[serde(default)]
    pub node_priority: i32,
    /// Writer checkpoint at gossip time.
    #[serde(default)]
    pub writer_checkpoint: i64,
    /// Chaser checkpoint at gossip time.
    #[serde(default)]
    pub chaser_checkpoint: i64,
}

impl MemberInfo {
    /// The member's client TCP endpoint, if its address parses.
    pub fn tcp_endpoint(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.external_tcp_ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.external_tcp_port))
    }

    /// The member's client TLS endpoint, when offered.
    pub fn secure_tcp_endpoint(&self) -> Option<SocketAddr> {
        if self.external_secure_tcp_port == 0 {
            return None;
        }
        let ip: IpAddr = self.external_tcp_ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.external_secure_tcp_port))
    }
}

/// A gossip view: the member list one node serves over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    /// Members as seen by the serving node.
    pub members: Vec<MemberInfo>,
}

/// Endpoints of the node selected by discovery, consumed once per connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEndpoints {
    /// Plain TCP endpoint.
    pub tcp_endpoint: SocketAddr,
    /// TLS endpoint, when the node offers one.
    pub secure_tcp_endpoint: Option<SocketAddr>,
}

impl NodeEndpoints {
    /// Endpoints with no TLS option.
    pub fn plain(tcp_endpoint: SocketAddr) -> Self {
        Self {
            tcp_endpoint,
            secure_tcp_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(state: VNodeState, ip: &str, port: u16, alive: bool) -> MemberInfo {
        MemberInfo {
            instance_id: Uuid::new_v4(),
            time_stamp: String::new(),
            state,
            is_alive: alive,
            external_tcp_ip: ip.to_string(),
            external_tcp_port: port,
            external_secure_tcp_port: 0,
            node_priority: 0,
            writer_checkpoint: 0,
            chaser_checkpoint: 0,
        }
    }

    #[test]
    fn test_state_ranking() {
        assert_eq!(VNodeState::Leader.rank(), Some(0));
        assert_eq!(VNodeState::Follower.rank(), Some(1));
        assert!(VNodeState::Leader.rank() < VNodeState::Follower.rank());
        assert_eq!(VNodeState::Manager.rank(), None);
        assert_eq!(VNodeState::ShuttingDown.rank(), None);
        assert_eq!(VNodeState::Shutdown.rank(), None);
        assert_eq!(VNodeState::Unknown.rank(), None);
    }

    #[test]
    fn test_master_slave_aliases_parse() {
        let json = r#"{
            "instanceId": "6fa459ea-ee8a-3ca4-894e-db77e160355e",
            "state": "Master",
            "isAlive": true,
            "externalTcpIp": "10.0.0.1",
            "externalTcpPort": 1113
        }"#;
        let member: MemberInfo = serde_json::from_str(json).unwrap();
        assert_eq!(member.state, VNodeState::Leader);

        let json = json.replace("Master", "Slave");
        let member: MemberInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(member.state, VNodeState::Follower);
    }

    #[test]
    fn test_endpoints() {
        let mut m = member(VNodeState::Leader, "10.0.0.1", 1113, true);
        assert_eq!(m.tcp_endpoint(), Some("10.0.0.1:1113".parse().unwrap()));
        assert_eq!(m.secure_tcp_endpoint(), None);

        m.external_secure_tcp_port = 1115;
        assert_eq!(
            m.secure_tcp_endpoint(),
            Some("10.0.0.1:1115".parse().unwrap())
        );

        m.external_tcp_ip = "not an ip".to_string();
        assert_eq!(m.tcp_endpoint(), None);
    }

    #[test]
    fn test_cluster_info_parses_gossip_document() {
        let json = r#"{
            "members": [
                {
                    "instanceId": "6fa459ea-ee8a-3ca4-894e-db77e160355e",
                    "timeStamp": "2024-02-01T10:00:00Z",
                    "state": "Leader",
                    "isAlive": true,
                    "externalTcpIp": "10.0.0.1",
                    "externalTcpPort": 1113,
                    "externalSecureTcpPort": 1115,
                    "nodePriority": 3,
                    "writerCheckpoint": 12345,
                    "chaserCheckpoint": 12345
                },
                {
                    "instanceId": "7fa459ea-ee8a-3ca4-894e-db77e160355e",
                    "state": "Follower",
                    "isAlive": false,
                    "externalTcpIp": "10.0.0.2",
                    "externalTcpPort": 1113
                }
            ]
        }"#;
        let info: ClusterInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.members.len(), 2);
        assert_eq!(info.members[0].node_priority, 3);
        assert!(!info.members[1].is_alive);
        assert_eq!(info.members[1].external_secure_tcp_port, 0);
    }
}
