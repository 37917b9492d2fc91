//! Node address resolution for failover
//!
//! A provider maps a cluster to a partition count and the node address
//! that owns each partition. The executor only ever asks for one address
//! at a time and reports stale routing through `invalidate_master`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{code, DriverError};

/// Identity of the cluster a logical connection targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterInfo {
    /// Cluster name sent on LOGIN
    pub name: String,
    /// Database name, `None` for the public database
    pub database: Option<String>,
}

impl ClusterInfo {
    pub fn new(name: impl Into<String>, database: Option<String>) -> Self {
        Self {
            name: name.into(),
            database,
        }
    }
}

/// Source of candidate node addresses
pub trait TopologyProvider: Send + Sync {
    /// Number of partitions addressable in the cluster
    fn partition_count(&self, cluster: &ClusterInfo) -> Result<usize, DriverError>;

    /// Address of the node owning `partition_id`
    fn node_address(&self, cluster: &ClusterInfo, partition_id: usize) -> Result<SocketAddr, DriverError>;

    /// Forget cached routing so the next lookup re-resolves
    fn invalidate_master(&self, _cluster: &ClusterInfo) {}
}

/// Fixed member list; each address stands for one partition
#[derive(Debug, Clone)]
pub struct FixedListProvider {
    addresses: Vec<SocketAddr>,
}

impl FixedListProvider {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }

    /// Resolve `host:port` entries, keeping every address each one yields
    pub fn from_hosts<S: AsRef<str>>(hosts: &[S]) -> Result<Self, DriverError> {
        let mut addresses = Vec::new();
        for host in hosts {
            let host = host.as_ref();
            let resolved = host.to_socket_addrs().map_err(|e| {
                DriverError::config(
                    code::ILLEGAL_PARAMETER,
                    format!("Failed to resolve address (address={}, reason={})", host, e),
                )
            })?;
            addresses.extend(resolved);
        }
        Ok(Self::new(addresses))
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }
}

impl TopologyProvider for FixedListProvider {
    fn partition_count(&self, _cluster: &ClusterInfo) -> Result<usize, DriverError> {
        if self.addresses.is_empty() {
            return Err(DriverError::config(
                code::EMPTY_PARAMETER,
                "Empty node address list",
            ));
        }
        Ok(self.addresses.len())
    }

    fn node_address(&self, _cluster: &ClusterInfo, partition_id: usize) -> Result<SocketAddr, DriverError> {
        self.addresses.get(partition_id).copied().ok_or_else(|| {
            DriverError::config(
                code::INTERNAL_ERROR,
                format!(
                    "Internal error by partition out of range (partitionId={}, partitionCount={})",
                    partition_id,
                    self.addresses.len()
                ),
            )
        })
    }
}

/// Memoizing wrapper around a slower provider
///
/// Partition counts and addresses are cached per cluster until a wrong
/// node report invalidates the cluster's entries.
pub struct CachingProvider {
    inner: Arc<dyn TopologyProvider>,
    /// Partition count by cluster
    counts: DashMap<ClusterInfo, usize>,
    /// Owner address by (cluster, partition)
    addresses: DashMap<(ClusterInfo, usize), SocketAddr>,
    invalidations: AtomicU64,
}

impl CachingProvider {
    pub fn new(inner: Arc<dyn TopologyProvider>) -> Self {
        Self {
            inner,
            counts: DashMap::new(),
            addresses: DashMap::new(),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Number of invalidations seen so far
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn is_cached(&self, cluster: &ClusterInfo) -> bool {
        self.counts.contains_key(cluster)
    }
}

impl TopologyProvider for CachingProvider {
    fn partition_count(&self, cluster: &ClusterInfo) -> Result<usize, DriverError> {
        if let Some(count) = self.counts.get(cluster) {
            return Ok(*count);
        }
        let count = self.inner.partition_count(cluster)?;
        self.counts.insert(cluster.clone(), count);
        Ok(count)
    }

    fn node_address(&self, cluster: &ClusterInfo, partition_id: usize) -> Result<SocketAddr, DriverError> {
        let key = (cluster.clone(), partition_id);
        if let Some(address) = self.addresses.get(&key) {
            return Ok(*address);
        }
        let address = self.inner.node_address(cluster, partition_id)?;
        self.addresses.insert(key, address);
        Ok(address)
    }

    fn invalidate_master(&self, cluster: &ClusterInfo) {
        self.counts.remove(cluster);
        self.addresses.retain(|(c, _), _| c != cluster);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(cluster = %cluster.name, "Invalidated cached topology");
        self.inner.invalidate_master(cluster);
    }
}

impl std::fmt::Debug for CachingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingProvider")
            .field("clusters", &self.counts.len())
            .field("addresses", &self.addresses.len())
            .finish_non_exhaustive()
    }
}
