//! Gossip-based cluster endpoint discovery.
//!
//! Given seed addresses, a cluster DNS name, or a single static endpoint,
//! resolves the best node to connect a transport to. Discovery is re-run on
//! every reconnect rather than cached: cluster topology changes over the
//! lifetime of a connection.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::node::{ClusterInfo, MemberInfo, NodeEndpoints};
use crate::settings::{ClusterSettings, DiscoveryTarget, NodePreference};

/// Resolves the endpoint a transport connection should target.
///
/// The scheduler calls this at connect time and again on every reconnect,
/// passing the endpoint that just failed so an alternative can be preferred.
#[async_trait]
pub trait EndpointDiscoverer: Send + Sync {
    /// Produces the next endpoints to connect to.
    async fn discover(&self, failed: Option<SocketAddr>) -> Result<NodeEndpoints>;
}

/// Builds the discoverer matching a cluster configuration.
pub fn discoverer_for(settings: &ClusterSettings) -> Result<Arc<dyn EndpointDiscoverer>> {
    match &settings.target {
        DiscoveryTarget::Single(addr) => Ok(Arc::new(StaticEndpointDiscoverer {
            endpoints: NodeEndpoints::plain(*addr),
        })),
        _ => Ok(Arc::new(ClusterDiscoverer::new(settings.clone())?)),
    }
}

/// Discoverer for a single known node; no gossip involved.
pub struct StaticEndpointDiscoverer {
    endpoints: NodeEndpoints,
}

impl StaticEndpointDiscoverer {
    /// Creates a discoverer that always yields the given endpoints.
    pub fn new(endpoints: NodeEndpoints) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl EndpointDiscoverer for StaticEndpointDiscoverer {
    async fn discover(&self, _failed: Option<SocketAddr>) -> Result<NodeEndpoints> {
        Ok(self.endpoints)
    }
}

/// Discoverer that queries the HTTP gossip endpoint of candidate seeds.
pub struct ClusterDiscoverer {
    settings: ClusterSettings,
    http: reqwest::Client,
}

impl ClusterDiscoverer {
    /// Creates a gossip discoverer from cluster settings.
    pub fn new(settings: ClusterSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.gossip_timeout)
            .build()
            .map_err(|e| ClientError::ServerError {
                message: format!("failed to build gossip http client: {e}"),
            })?;
        Ok(Self { settings, http })
    }

    /// Resolves the current gossip seed candidates.
    async fn candidates(&self) -> Result<Vec<SocketAddr>> {
        match &self.settings.target {
            DiscoveryTarget::Single(addr) => Ok(vec![*addr]),
            DiscoveryTarget::GossipSeeds(seeds) => Ok(seeds.clone()),
            DiscoveryTarget::ClusterDns { name, gossip_port } => {
                let addrs: Vec<SocketAddr> =
                    tokio::net::lookup_host((name.as_str(), *gossip_port))
                        .await
                        .map_err(ClientError::Io)?
                        .collect();
                Ok(addrs)
            }
        }
    }

    /// Fetches one seed's gossip view.
    async fn fetch_gossip(&self, seed: SocketAddr) -> Result<ClusterInfo> {
        let url = format!("http://{seed}/gossip?format=json");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::ServerError {
                message: format!("gossip request to {seed} failed: {e}"),
            })?;
        response
            .json::<ClusterInfo>()
            .await
            .map_err(|e| ClientError::Serialization(format!("gossip body from {seed}: {e}")))
    }

    /// One discovery attempt: query every candidate, merge views, choose.
    async fn attempt(&self, failed: Option<SocketAddr>) -> Option<NodeEndpoints> {
        let mut candidates = match self.candidates().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to resolve gossip candidates");
                return None;
            }
        };
        candidates.shuffle(&mut rand::thread_rng());

        let mut views = Vec::new();
        for seed in candidates {
            match self.fetch_gossip(seed).await {
                Ok(info) => {
                    debug!(seed = %seed, members = info.members.len(), "gossip view");
                    views.push(info);
                }
                Err(e) => debug!(seed = %seed, error = %e, "gossip seed unreachable"),
            }
        }
        if views.is_empty() {
            return None;
        }

        let members = merge_views(views);
        rank_and_choose(
            &members,
            self.settings.node_preference,
            self.settings.prefer_random_node,
            failed,
        )
    }
}

#[async_trait]
impl EndpointDiscoverer for ClusterDiscoverer {
    async fn discover(&self, failed: Option<SocketAddr>) -> Result<NodeEndpoints> {
        let attempts = self.settings.max_discover_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.settings.discover_delay).await;
            }
            if let Some(endpoints) = self.attempt(failed).await {
                debug!(attempt, tcp = %endpoints.tcp_endpoint, "discovery succeeded");
                return Ok(endpoints);
            }
            debug!(attempt, "discovery attempt found no eligible member");
        }
        Err(ClientError::DiscoveryFailed { attempts })
    }
}

/// Merges gossip views from several seeds into one member list.
///
/// Members are deduplicated by instance id; the entry with the newest
/// timestamp wins (ISO-8601 timestamps compare lexicographically).
fn merge_views(views: Vec<ClusterInfo>) -> Vec<MemberInfo> {
    let mut merged: Vec<MemberInfo> = Vec::new();
    for view in views {
        for member in view.members {
            match merged
                .iter_mut()
                .find(|m| m.instance_id == member.instance_id)
            {
                Some(existing) => {
                    if member.time_stamp > existing.time_stamp {
                        *existing = member;
                    }
                }
                None => merged.push(member),
            }
        }
    }
    merged
}

/// Picks the best member of a merged view, or `None` when nothing is eligible.
///
/// Alive members in connectable states are ranked by state (leader first)
/// unless the preference admits any node; ties break by declared priority
/// then endpoint, or uniformly at random under `prefer_random`.
fn rank_and_choose(
    members: &[MemberInfo],
    preference: NodePreference,
    prefer_random: bool,
    failed: Option<SocketAddr>,
) -> Option<NodeEndpoints> {
    let mut eligible: Vec<&MemberInfo> = members
        .iter()
        .filter(|m| m.is_alive)
        .filter(|m| m.state.rank().is_some())
        .filter(|m| m.tcp_endpoint().is_some())
        .collect();
    if eligible.is_empty() {
        return None;
    }

    // steer away from the endpoint that just failed when there is a choice
    if let Some(failed) = failed {
        let alternatives: Vec<&MemberInfo> = eligible
            .iter()
            .copied()
            .filter(|m| m.tcp_endpoint() != Some(failed))
            .collect();
        if !alternatives.is_empty() {
            eligible = alternatives;
        }
    }

    let rank_of = |m: &MemberInfo| -> u8 {
        match preference {
            NodePreference::Leader => m.state.rank().unwrap_or(u8::MAX),
            NodePreference::Any => 0,
        }
    };

    let chosen: &MemberInfo = if prefer_random {
        let best_rank = eligible.iter().map(|m| rank_of(m)).min()?;
        let pool: Vec<&MemberInfo> = eligible
            .into_iter()
            .filter(|m| rank_of(m) == best_rank)
            .collect();
        pool.choose(&mut rand::thread_rng()).copied()?
    } else {
        eligible.sort_by(|a, b| {
            rank_of(a)
                .cmp(&rank_of(b))
                .then(b.node_priority.cmp(&a.node_priority))
                .then(a.external_tcp_ip.cmp(&b.external_tcp_ip))
                .then(a.external_tcp_port.cmp(&b.external_tcp_port))
        });
        eligible.first().copied()?
    };

    Some(NodeEndpoints {
        tcp_endpoint: chosen.tcp_endpoint()?,
        secure_tcp_endpoint: chosen.secure_tcp_endpoint(),
    })
}
