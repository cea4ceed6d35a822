//! Deterministic port and directory allocation.
//!
//! Every node in the cluster gets a base port computed purely from the
//! cluster-wide base port and the node's global ordinal, with one offset per
//! logical service. Identical specs therefore always produce identical
//! allocations, and no two nodes can ever share a port.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::spec::ClusterSpec;

/// Ports reserved per node; must exceed the number of distinct services.
pub const PORT_STRIDE: u16 = 10;

/// Default cluster base port.
pub const DEFAULT_BASE_PORT: u16 = 26650;

/// Logical services exposed by a node, one port each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    P2p,
    Rpc,
    Grpc,
    Api,
    GrpcWeb,
    Pprof,
}

impl Service {
    pub const ALL: [Service; 6] = [
        Service::P2p,
        Service::Rpc,
        Service::Grpc,
        Service::Api,
        Service::GrpcWeb,
        Service::Pprof,
    ];

    /// Offset from the node's base port.
    pub fn offset(self) -> u16 {
        match self {
            Service::P2p => 0,
            Service::Rpc => 1,
            Service::Grpc => 2,
            Service::Api => 3,
            Service::GrpcWeb => 4,
            Service::Pprof => 5,
        }
    }
}

/// A node with its concrete network and filesystem resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedNode {
    pub chain_id: String,
    /// Validator index within the chain, in declaration order.
    pub index: usize,
    /// Zero-based position in global declaration order.
    pub ordinal: usize,
    pub name: String,
    pub hostname: String,
    pub base_port: u16,
    pub home: PathBuf,
    pub log_file: PathBuf,
}

impl ResolvedNode {
    pub fn port(&self, service: Service) -> u16 {
        self.base_port + service.offset()
    }

    /// Supervisor program name, `<chain-id>-node<i>`.
    pub fn program(&self) -> String {
        format!("{}-node{}", self.chain_id, self.index)
    }

    pub fn rpc_laddr(&self) -> String {
        format!("tcp://{}:{}", self.hostname, self.port(Service::Rpc))
    }

    pub fn rpc_http(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port(Service::Rpc))
    }

    pub fn websocket_addr(&self) -> String {
        format!("ws://{}:{}/websocket", self.hostname, self.port(Service::Rpc))
    }

    pub fn p2p_laddr(&self) -> String {
        format!("tcp://{}:{}", self.hostname, self.port(Service::P2p))
    }

    pub fn grpc_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port(Service::Grpc))
    }

    pub fn api_laddr(&self) -> String {
        format!("tcp://{}:{}", self.hostname, self.port(Service::Api))
    }

    pub fn grpc_web_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port(Service::GrpcWeb))
    }

    pub fn pprof_laddr(&self) -> String {
        format!("{}:{}", self.hostname, self.port(Service::Pprof))
    }
}

/// Allocation failures; expansion already bounds everything else.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error(
        "port range exhausted: node ordinal {ordinal} needs ports up to {top}, beyond 65535"
    )]
    ExhaustedRange { ordinal: usize, top: u32 },
}

/// Assign ports and directories to every node of every chain.
///
/// Nodes are numbered by cumulative declaration order across chains; the
/// result is a pure function of the spec, `data_dir` and `base_port`.
pub fn allocate(
    spec: &ClusterSpec,
    data_dir: &Path,
    base_port: u16,
) -> Result<BTreeMap<String, Vec<ResolvedNode>>, AllocationError> {
    let mut nodes: BTreeMap<String, Vec<ResolvedNode>> = BTreeMap::new();
    let mut ordinal = 0usize;
    let max_offset = Service::ALL
        .iter()
        .map(|s| s.offset())
        .max()
        .unwrap_or(0) as u32;

    for chain in &spec.chains {
        let chain_dir = data_dir.join(&chain.id);
        let mut resolved = Vec::with_capacity(chain.validators.len());
        for (index, validator) in chain.validators.iter().enumerate() {
            let node_base = base_port as u32 + ordinal as u32 * PORT_STRIDE as u32;
            let top = node_base + max_offset;
            if top > u16::MAX as u32 {
                return Err(AllocationError::ExhaustedRange { ordinal, top });
            }
            resolved.push(ResolvedNode {
                chain_id: chain.id.clone(),
                index,
                ordinal,
                name: validator.name.clone(),
                hostname: "127.0.0.1".to_string(),
                base_port: node_base as u16,
                home: chain_dir.join(format!("node{index}")),
                log_file: chain_dir.join(format!("node{index}.log")),
            });
            ordinal += 1;
        }
        nodes.insert(chain.id.clone(), resolved);
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSettings;
    use crate::spec::{ChainSpec, ClusterSpec};
    use std::collections::BTreeSet;

    fn chain(id: &str, validators: usize) -> ChainSpec {
        let vals = (0..validators)
            .map(|i| format!("  - name: v{i}\n    staked: 100stake\n"))
            .collect::<String>();
        let mut chain: ChainSpec =
            serde_yaml::from_str(&format!("validators:\n{vals}")).unwrap();
        chain.id = id.to_string();
        chain
    }

    fn cluster(chains: Vec<ChainSpec>) -> ClusterSpec {
        ClusterSpec {
            chains,
            relayer: serde_json::Value::Null,
            lifecycle: LifecycleSettings::default(),
        }
    }

    #[test]
    fn test_ports_disjoint_across_cluster() {
        let spec = cluster(vec![chain("alpha-1", 3), chain("beta-1", 2)]);
        let nodes = allocate(&spec, Path::new("/tmp/data"), DEFAULT_BASE_PORT).unwrap();

        let mut seen = BTreeSet::new();
        for node in nodes.values().flatten() {
            for service in Service::ALL {
                assert!(
                    seen.insert(node.port(service)),
                    "duplicate port {} for {}",
                    node.port(service),
                    node.program()
                );
            }
        }
        assert_eq!(seen.len(), 5 * Service::ALL.len());
    }

    #[test]
    fn test_ordinals_follow_declaration_order() {
        let spec = cluster(vec![chain("alpha-1", 2), chain("beta-1", 1)]);
        let nodes = allocate(&spec, Path::new("/data"), 26650).unwrap();
        assert_eq!(nodes["alpha-1"][0].ordinal, 0);
        assert_eq!(nodes["alpha-1"][1].ordinal, 1);
        assert_eq!(nodes["beta-1"][0].ordinal, 2);
        assert_eq!(nodes["beta-1"][0].base_port, 26670);
        assert_eq!(nodes["alpha-1"][1].port(Service::Rpc), 26661);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let spec = cluster(vec![chain("alpha-1", 2), chain("beta-1", 2)]);
        let first = allocate(&spec, Path::new("/data"), 26650).unwrap();
        let second = allocate(&spec, Path::new("/data"), 26650).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_range_exhaustion() {
        let spec = cluster(vec![chain("big-1", 4)]);
        let err = allocate(&spec, Path::new("/data"), 65530).unwrap_err();
        assert!(matches!(err, AllocationError::ExhaustedRange { .. }));
    }

    #[test]
    fn test_home_directories_per_node() {
        let spec = cluster(vec![chain("alpha-1", 2)]);
        let nodes = allocate(&spec, Path::new("/data"), 26650).unwrap();
        assert_eq!(nodes["alpha-1"][1].home, Path::new("/data/alpha-1/node1"));
        assert_eq!(
            nodes["alpha-1"][1].log_file,
            Path::new("/data/alpha-1/node1.log")
        );
    }
}
