//! Relayer configuration generation.
//!
//! Runs only once every participating chain's nodes are up: builds one
//! implementation-neutral connection model from the finalized topology and
//! projects it into the formats the supported relayer binaries expect. The
//! neutral model is the invariant; each projection is a pure function of it.

use std::collections::{BTreeMap, BTreeSet};

use clap::ValueEnum;
use serde_json::{json, Value};

use crate::merge::merge_json;
use crate::ports::ResolvedNode;
use crate::spec::{ChainSpec, ClusterSpec};

/// Supported relayer implementation profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RelayerKind {
    Hermes,
    Rly,
}

/// One chain's connection endpoints, independent of any relayer flavor.
#[derive(Debug, Clone)]
pub struct RelayerEndpoint {
    pub chain_id: String,
    pub account_prefix: String,
    pub coin_type: u32,
    pub key_name: String,
    pub gas_denom: String,
    pub rpc_addr: String,
    pub grpc_addr: String,
    pub websocket_addr: String,
    /// Keyring location for relayers that read keys from disk.
    pub key_directory: String,
}

impl RelayerEndpoint {
    /// Endpoints always reference the chain's first node.
    pub fn from_chain(chain: &ChainSpec, node: &ResolvedNode) -> Self {
        RelayerEndpoint {
            chain_id: chain.id.clone(),
            account_prefix: chain.account_prefix.clone(),
            coin_type: chain.coin_type,
            key_name: chain.key_name.clone(),
            gas_denom: chain.bond_denom().to_string(),
            rpc_addr: node.rpc_http(),
            grpc_addr: format!("http://{}", node.grpc_addr()),
            websocket_addr: node.websocket_addr(),
            key_directory: node.home.display().to_string(),
        }
    }
}

/// The neutral connection model: endpoints plus every chain pair to relay.
#[derive(Debug, Clone)]
pub struct RelayerPlan {
    pub endpoints: Vec<RelayerEndpoint>,
    pub pairs: Vec<(String, String)>,
    /// User overlay from the spec's top-level `relayer` key.
    pub overlay: Value,
}

impl RelayerPlan {
    /// `None` unless at least two chains can be connected.
    pub fn new(endpoints: Vec<RelayerEndpoint>, overlay: Value) -> Option<Self> {
        if endpoints.len() < 2 {
            return None;
        }
        let mut pairs = Vec::new();
        for (i, a) in endpoints.iter().enumerate() {
            for b in &endpoints[i + 1..] {
                pairs.push((a.chain_id.clone(), b.chain_id.clone()));
            }
        }
        Some(RelayerPlan { endpoints, pairs, overlay })
    }
}

/// Build the plan for all relaying chains that came up healthy.
///
/// Chains whose nodes crashed are excluded, which also drops every pair
/// they would have participated in.
pub fn plan(
    spec: &ClusterSpec,
    nodes: &BTreeMap<String, Vec<ResolvedNode>>,
    healthy: &BTreeSet<String>,
) -> Option<RelayerPlan> {
    let endpoints = spec
        .chains
        .iter()
        .filter(|chain| chain.relaying && healthy.contains(&chain.id))
        .filter_map(|chain| {
            let node = nodes.get(&chain.id).and_then(|n| n.first())?;
            Some(RelayerEndpoint::from_chain(chain, node))
        })
        .collect();
    RelayerPlan::new(endpoints, spec.relayer.clone())
}

/// hermes `relayer.toml` contents.
///
/// The overlay may carry a `chains` list whose entries are matched by `id`
/// and merged into the corresponding chain section; everything else merges
/// at the top level.
pub fn hermes_document(plan: &RelayerPlan) -> Value {
    let mut chain_overrides: BTreeMap<String, Value> = BTreeMap::new();
    let mut overlay = plan.overlay.clone();
    if let Some(entries) = overlay.get_mut("chains").and_then(Value::as_array_mut) {
        for entry in entries.drain(..) {
            if let Some(id) = entry["id"].as_str() {
                chain_overrides.insert(id.to_string(), entry.clone());
            }
        }
    }
    if let Some(map) = overlay.as_object_mut() {
        map.remove("chains");
    }

    let chains: Vec<Value> = plan
        .endpoints
        .iter()
        .map(|endpoint| {
            let base = json!({
                "id": endpoint.chain_id,
                "key_name": endpoint.key_name,
                "rpc_addr": endpoint.rpc_addr,
                "grpc_addr": endpoint.grpc_addr,
                "event_source": {
                    "mode": "push",
                    "url": endpoint.websocket_addr,
                    "batch_delay": "200ms",
                },
                "rpc_timeout": "10s",
                "account_prefix": endpoint.account_prefix,
                "store_prefix": "ibc",
                "max_gas": 300000,
                "gas_price": {"price": 0.0, "denom": endpoint.gas_denom},
                "trusting_period": "336h",
            });
            match chain_overrides.get(&endpoint.chain_id) {
                Some(patch) => merge_json(base, patch.clone()),
                None => base,
            }
        })
        .collect();

    let document = json!({
        "global": {"log_level": "info"},
        "chains": chains,
    });
    if overlay.is_null() {
        document
    } else {
        merge_json(document, overlay)
    }
}

/// rly `config.yaml` contents, including one path entry per chain pair.
pub fn rly_document(plan: &RelayerPlan) -> Value {
    let chains: serde_json::Map<String, Value> = plan
        .endpoints
        .iter()
        .map(|endpoint| {
            (
                endpoint.chain_id.clone(),
                json!({
                    "type": "cosmos",
                    "value": {
                        "key-directory": endpoint.key_directory,
                        "key": endpoint.key_name,
                        "chain-id": endpoint.chain_id,
                        "rpc-addr": endpoint.rpc_addr,
                        "account-prefix": endpoint.account_prefix,
                        "keyring-backend": "test",
                        "gas-adjustment": 1.2,
                        "gas-prices": format!("0{}", endpoint.gas_denom),
                        "min-gas-amount": 0,
                        "max-gas-amount": 300000,
                        "debug": false,
                        "timeout": "20s",
                        "block-timeout": "",
                        "output-format": "json",
                        "sign-mode": "direct",
                        "coin-type": endpoint.coin_type,
                        "broadcast-mode": "batch",
                        "min-loop-duration": "0s",
                    },
                }),
            )
        })
        .collect();

    let paths: serde_json::Map<String, Value> = plan
        .pairs
        .iter()
        .map(|(src, dst)| {
            (
                format!("{src}-{dst}"),
                json!({
                    "src": {"chain-id": src},
                    "dst": {"chain-id": dst},
                }),
            )
        })
        .collect();

    json!({
        "global": {
            "api-listen-addr": ":5183",
            "timeout": "10s",
            "memo": "",
            "light-cache-size": 20,
            "log-level": "info",
        },
        "chains": chains,
        "paths": paths,
    })
}

/// Command line the supervisor runs for the chosen relayer.
pub fn relayer_command(kind: RelayerKind, plan: &RelayerPlan) -> String {
    match kind {
        RelayerKind::Hermes => "hermes --config relayer.toml start".to_string(),
        RelayerKind::Rly => {
            let path = plan
                .pairs
                .first()
                .map(|(src, dst)| format!("{src}-{dst}"))
                .unwrap_or_default();
            format!("rly start {path} --home relayer")
        }
    }
}

/// `relayer.env` contents: the funded mnemonic for each connected chain.
pub fn env_file(mnemonics: &BTreeMap<String, String>) -> String {
    mnemonics
        .iter()
        .map(|(chain_id, mnemonic)| {
            let key = chain_id.to_uppercase().replace('-', "_");
            format!("{key}_RELAYER_MNEMONIC=\"{mnemonic}\"\n")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::from_document;
    use crate::ports::allocate;
    use std::path::Path;

    fn spec(raw: &str) -> ClusterSpec {
        from_document(serde_yaml::from_str(raw).unwrap()).unwrap()
    }

    fn two_chain_spec() -> ClusterSpec {
        spec(
            r#"
alpha-1:
  validators:
    - name: v1
      staked: 100stake
  accounts:
    - name: relayer
      coins: 1000stake
beta-1:
  account-prefix: beta
  coin-type: 394
  validators:
    - name: v1
      staked: 100ubeta
  accounts:
    - name: relayer
      coins: 1000ubeta
"#,
        )
    }

    fn healthy(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_pairs_healthy_relaying_chains() {
        let spec = two_chain_spec();
        let nodes = allocate(&spec, Path::new("/data"), 26650).unwrap();
        let plan = plan(&spec, &nodes, &healthy(&["alpha-1", "beta-1"])).unwrap();
        assert_eq!(plan.endpoints.len(), 2);
        assert_eq!(plan.pairs, vec![("alpha-1".to_string(), "beta-1".to_string())]);
        // endpoints reference node0 of each chain
        assert_eq!(plan.endpoints[0].rpc_addr, "http://127.0.0.1:26651");
        assert_eq!(plan.endpoints[1].rpc_addr, "http://127.0.0.1:26661");
    }

    #[test]
    fn test_no_plan_when_chain_unhealthy() {
        let spec = two_chain_spec();
        let nodes = allocate(&spec, Path::new("/data"), 26650).unwrap();
        assert!(plan(&spec, &nodes, &healthy(&["alpha-1"])).is_none());
        assert!(plan(&spec, &nodes, &healthy(&[])).is_none());
    }

    #[test]
    fn test_non_relaying_chain_excluded() {
        let spec = spec(
            r#"
alpha-1:
  validators:
    - name: v1
      staked: 100stake
  accounts:
    - name: relayer
      coins: 1000stake
beta-1:
  relaying: false
  validators:
    - name: v1
      staked: 100stake
"#,
        );
        let nodes = allocate(&spec, Path::new("/data"), 26650).unwrap();
        assert!(plan(&spec, &nodes, &healthy(&["alpha-1", "beta-1"])).is_none());
    }

    #[test]
    fn test_hermes_projection() {
        let spec = two_chain_spec();
        let nodes = allocate(&spec, Path::new("/data"), 26650).unwrap();
        let plan = plan(&spec, &nodes, &healthy(&["alpha-1", "beta-1"])).unwrap();
        let doc = hermes_document(&plan);
        assert_eq!(doc["global"]["log_level"], "info");
        let chains = doc["chains"].as_array().unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0]["id"], "alpha-1");
        assert_eq!(chains[0]["event_source"]["mode"], "push");
        assert!(chains[0]["event_source"]["url"]
            .as_str()
            .unwrap()
            .starts_with("ws://"));
        assert_eq!(chains[1]["account_prefix"], "beta");
        assert_eq!(chains[1]["gas_price"]["denom"], "ubeta");
    }

    #[test]
    fn test_hermes_overlay_and_per_chain_override() {
        let mut spec = two_chain_spec();
        spec.relayer = json!({
            "global": {"log_level": "debug"},
            "chains": [{"id": "beta-1", "max_gas": 900000}],
        });
        let nodes = allocate(&spec, Path::new("/data"), 26650).unwrap();
        let plan = plan(&spec, &nodes, &healthy(&["alpha-1", "beta-1"])).unwrap();
        let doc = hermes_document(&plan);
        assert_eq!(doc["global"]["log_level"], "debug");
        let chains = doc["chains"].as_array().unwrap();
        assert_eq!(chains[0]["max_gas"], 300000);
        assert_eq!(chains[1]["max_gas"], 900000);
        // untouched generated fields survive the override
        assert_eq!(chains[1]["store_prefix"], "ibc");
    }

    #[test]
    fn test_rly_projection() {
        let spec = two_chain_spec();
        let nodes = allocate(&spec, Path::new("/data"), 26650).unwrap();
        let plan = plan(&spec, &nodes, &healthy(&["alpha-1", "beta-1"])).unwrap();
        let doc = rly_document(&plan);
        assert_eq!(doc["chains"]["alpha-1"]["type"], "cosmos");
        assert_eq!(doc["chains"]["beta-1"]["value"]["coin-type"], 394);
        assert_eq!(
            doc["paths"]["alpha-1-beta-1"]["src"]["chain-id"],
            "alpha-1"
        );
        assert_eq!(relayer_command(RelayerKind::Rly, &plan), "rly start alpha-1-beta-1 --home relayer");
    }

    #[test]
    fn test_env_file() {
        let mut mnemonics = BTreeMap::new();
        mnemonics.insert("alpha-1".to_string(), "word ".repeat(23) + "word");
        let env = env_file(&mnemonics);
        assert!(env.starts_with("ALPHA_1_RELAYER_MNEMONIC=\"word"));
    }
}
