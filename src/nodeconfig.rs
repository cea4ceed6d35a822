//! Per-node configuration files.
//!
//! Renders the three TOML files each node home directory carries
//! (`config.toml`, `app.toml`, `client.toml`) from chain-type defaults, the
//! chain-wide overlays and the per-validator overlays, with the allocator's
//! ports substituted into every listen/endpoint field so the files can never
//! disagree with the allocation.

use serde_json::json;
use toml::Value as Toml;

use crate::genesis::{AssemblyError, NodeArtifacts};
use crate::spec::{ChainSpec, ValidatorSpec};

/// Tendermint `config.toml` for one node.
pub fn tendermint_config(
    chain: &ChainSpec,
    validator: &ValidatorSpec,
    artifact: &NodeArtifacts,
) -> Result<Toml, AssemblyError> {
    let node = &artifact.node;
    let base = json!({
        "moniker": validator.name,
        "mode": "validator",
        "rpc": {
            "laddr": node.rpc_laddr(),
            "pprof_laddr": node.pprof_laddr(),
            "timeout_broadcast_tx_commit": "30s",
        },
        "p2p": {
            "laddr": node.p2p_laddr(),
            "persistent_peers": artifact.peers,
            "addr_book_strict": false,
            "allow_duplicate_ip": true,
        },
        "consensus": {"timeout_commit": "1s"},
    });
    with_overlays(chain, base, &[&chain.config, &validator.config])
}

/// Application `app.toml` for one node.
pub fn app_config(
    chain: &ChainSpec,
    validator: &ValidatorSpec,
    artifact: &NodeArtifacts,
) -> Result<Toml, AssemblyError> {
    let node = &artifact.node;
    let base = json!({
        "minimum-gas-prices": format!("0{}", chain.bond_denom()),
        "pruning": "nothing",
        "api": {
            "enable": true,
            "swagger": true,
            "enable-unsafe-cors": true,
            "address": node.api_laddr(),
        },
        "grpc": {"address": node.grpc_addr()},
        "grpc-web": {"address": node.grpc_web_addr()},
        "state-sync": {"snapshot-interval": 5, "snapshot-keep-recent": 10},
    });
    with_overlays(chain, base, &[&chain.app_config, &validator.app_config])
}

/// Client `client.toml` for one node.
pub fn client_config(
    chain: &ChainSpec,
    validator: &ValidatorSpec,
    artifact: &NodeArtifacts,
) -> Result<Toml, AssemblyError> {
    let base = json!({
        "chain-id": chain.id,
        "keyring-backend": "test",
        "output": "json",
        "node": artifact.node.rpc_laddr(),
        "broadcast-mode": "sync",
    });
    with_overlays(chain, base, &[&validator.client_config])
}

fn with_overlays(
    chain: &ChainSpec,
    base: serde_json::Value,
    overlays: &[&serde_yaml::Value],
) -> Result<Toml, AssemblyError> {
    let overlay_err = |detail: String| AssemblyError::Overlay {
        chain_id: chain.id.clone(),
        detail,
    };
    let mut doc = json_to_toml(&base).map_err(&overlay_err)?;
    for overlay in overlays {
        if overlay.is_null() {
            continue;
        }
        let patch = crate::merge::yaml_to_json(overlay)
            .map_err(|e| overlay_err(e.to_string()))
            .and_then(|json| json_to_toml(&json).map_err(&overlay_err))?;
        patch_toml(&mut doc, patch);
    }
    Ok(doc)
}

/// Recursively apply `patch` on top of `doc`; patch values win, tables merge.
pub fn patch_toml(doc: &mut Toml, patch: Toml) {
    match (doc, patch) {
        (Toml::Table(table), Toml::Table(patch_table)) => {
            for (key, value) in patch_table {
                match table.get_mut(&key) {
                    Some(existing) => patch_toml(existing, value),
                    None => {
                        table.insert(key, value);
                    }
                }
            }
        }
        (doc, patch) => *doc = patch,
    }
}

/// Convert a JSON value to TOML. Null table entries are dropped (TOML has no
/// null); any other null is an error.
pub fn json_to_toml(value: &serde_json::Value) -> Result<Toml, String> {
    use serde_json::Value as Json;
    Ok(match value {
        Json::Bool(b) => Toml::Boolean(*b),
        Json::String(s) => Toml::String(s.clone()),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Toml::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Toml::Float(f)
            } else {
                return Err(format!("number {n} does not fit a TOML value"));
            }
        }
        Json::Array(items) => Toml::Array(
            items
                .iter()
                .map(json_to_toml)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Json::Object(map) => {
            let mut table = toml::map::Map::new();
            for (key, item) in map {
                if item.is_null() {
                    continue;
                }
                table.insert(key.clone(), json_to_toml(item)?);
            }
            Toml::Table(table)
        }
        Json::Null => return Err("null is not representable in TOML".to_string()),
    })
}
