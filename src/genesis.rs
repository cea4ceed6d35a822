//! Key and genesis assembly.
//!
//! Builds, per chain, the genesis document plus the key material every node
//! needs, keeping the two consistent with the allocator's port assignments.
//! The merge order is fixed: chain template, validator entries, balance and
//! vesting entries, then the user's genesis overlay, which always wins.
//!
//! All derivations are keyed off the declared name's mnemonic, so
//! regenerating a subset of nodes never disturbs the addresses of the rest;
//! only ports come from the positional ordinal.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use serde_json::{json, Value};

use crate::keys::{AccountKey, ConsensusKey, KeyError, KeyService, NodeKey};
use crate::merge::{merge_json, yaml_to_json};
use crate::ports::ResolvedNode;
use crate::spec::{ChainSpec, Coin};

/// Fatal for the affected chain; other chains' artifacts stay untouched.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("chain {chain_id}: {source}")]
    Key {
        chain_id: String,
        #[source]
        source: KeyError,
    },
    #[error("chain {chain_id}: vesting exceeds balance for account `{name}`")]
    InvalidVesting { chain_id: String, name: String },
    #[error("chain {chain_id}: genesis overlay rejected: {detail}")]
    Overlay { chain_id: String, detail: String },
    #[error("chain {chain_id}: recorded supply [{recorded}] != derived supply [{derived}]")]
    SupplyMismatch {
        chain_id: String,
        recorded: String,
        derived: String,
    },
}

/// Everything one node needs on disk before it can start.
#[derive(Debug, Clone)]
pub struct NodeArtifacts {
    pub node: ResolvedNode,
    pub validator: AccountKey,
    pub consensus: ConsensusKey,
    pub node_key: NodeKey,
    /// Persistent peers for this node, self excluded.
    pub peers: String,
}

/// The assembled outputs for one chain.
#[derive(Debug, Clone)]
pub struct ChainArtifacts {
    pub chain_id: String,
    pub genesis: Value,
    /// All funded keys (validators first), written to `accounts.json`.
    pub accounts: Vec<AccountKey>,
    pub nodes: Vec<NodeArtifacts>,
}

impl ChainArtifacts {
    /// Look up a funded account by declared name.
    pub fn account(&self, name: &str) -> Option<&AccountKey> {
        self.accounts.iter().find(|a| a.name == name)
    }
}

/// Assemble genesis, keys and peer wiring for one chain.
pub fn assemble(
    chain: &ChainSpec,
    nodes: &[ResolvedNode],
    keys: &KeyService,
) -> Result<ChainArtifacts, AssemblyError> {
    let key_err = |source| AssemblyError::Key { chain_id: chain.id.clone(), source };
    let genesis_time = chain.genesis_time.unwrap_or_else(Utc::now);

    // key material, keyed off declared names
    let mut accounts = Vec::new();
    let mut node_artifacts = Vec::new();
    for (validator, node) in chain.validators.iter().zip(nodes) {
        let account = keys
            .account_key(&validator.name, validator.mnemonic.as_deref())
            .map_err(key_err)?;
        let consensus = keys
            .consensus_key(&validator.name, &account.mnemonic)
            .map_err(key_err)?;
        let node_key = keys
            .node_key(&validator.name, &account.mnemonic)
            .map_err(key_err)?;
        node_artifacts.push(NodeArtifacts {
            node: node.clone(),
            validator: account.clone(),
            consensus,
            node_key,
            peers: String::new(),
        });
        accounts.push(account);
    }
    for account in &chain.accounts {
        accounts.push(
            keys.account_key(&account.name, account.mnemonic.as_deref())
                .map_err(key_err)?,
        );
    }

    // each node peers with every other node
    let all_peers: Vec<String> = node_artifacts
        .iter()
        .map(|n| {
            format!(
                "tcp://{}@{}:{}",
                n.node_key.node_id,
                n.node.hostname,
                n.node.port(crate::ports::Service::P2p)
            )
        })
        .collect();
    for (i, artifact) in node_artifacts.iter_mut().enumerate() {
        artifact.peers = all_peers
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, p)| p.clone())
            .collect::<Vec<_>>()
            .join(",");
    }

    let genesis = build_genesis(chain, &node_artifacts, &accounts, genesis_time)?;
    verify_supply(&chain.id, &genesis)?;
    debug!("assembled genesis for {} with {} accounts", chain.id, accounts.len());

    Ok(ChainArtifacts {
        chain_id: chain.id.clone(),
        genesis,
        accounts,
        nodes: node_artifacts,
    })
}

fn build_genesis(
    chain: &ChainSpec,
    nodes: &[NodeArtifacts],
    accounts: &[AccountKey],
    genesis_time: DateTime<Utc>,
) -> Result<Value, AssemblyError> {
    let mut balances: Vec<Value> = Vec::new();
    let mut auth_accounts: Vec<Value> = Vec::new();
    let mut consensus_validators: Vec<Value> = Vec::new();
    let mut staking_validators: Vec<Value> = Vec::new();

    // validator entries, declaration order, so voting power is stable
    for (validator, artifact) in chain.validators.iter().zip(nodes) {
        let power = validator.staked.amount / chain.power_reduction;
        consensus_validators.push(json!({
            "address": artifact.consensus.address,
            "pub_key": {"type": "tendermint/PubKeyEd25519", "value": artifact.consensus.pub_key},
            "power": power.to_string(),
            "name": validator.name,
        }));
        staking_validators.push(json!({
            "operator_address": artifact.validator.address,
            "consensus_pubkey": {
                "@type": "/cosmos.crypto.ed25519.PubKey",
                "key": artifact.consensus.pub_key,
            },
            "status": "BOND_STATUS_BONDED",
            "tokens": validator.staked.amount.to_string(),
            "description": {
                "moniker": validator.name,
                "details": validator.details.clone().unwrap_or_default(),
                "security_contact": validator.security_contact.clone().unwrap_or_default(),
            },
            "commission": {
                "commission_rates": {
                    "rate": validator.commission_rate.clone().unwrap_or_else(|| "0.100000000000000000".to_string()),
                    "max_rate": validator.commission_max_rate.clone().unwrap_or_else(|| "0.200000000000000000".to_string()),
                    "max_change_rate": validator.commission_max_change_rate.clone().unwrap_or_else(|| "0.010000000000000000".to_string()),
                },
            },
            "min_self_delegation": validator.min_self_delegation.to_string(),
        }));

        // self-delegation plus any declared extra balance
        let amounts = aggregate([validator.staked.clone()].iter().chain(&validator.coins));
        balances.push(balance_entry(&artifact.validator.address, &amounts));
        auth_accounts.push(base_account(&artifact.validator.address));
    }

    // plain and vesting accounts; keys follow the validators in `accounts`
    let account_keys = accounts.iter().skip(chain.validators.len());
    for (spec, key) in chain.accounts.iter().zip(account_keys) {
        match &spec.vesting {
            None => {
                balances.push(balance_entry(&key.address, &aggregate(spec.coins.iter())));
                auth_accounts.push(base_account(&key.address));
            }
            Some(vesting) => {
                let total = aggregate(spec.coins.iter());
                let vested = if vesting.coins.is_empty() {
                    total.clone()
                } else {
                    aggregate(vesting.coins.iter())
                };
                let mut free = total;
                for (denom, amount) in &vested {
                    let balance = free.get_mut(denom).ok_or_else(|| {
                        AssemblyError::InvalidVesting {
                            chain_id: chain.id.clone(),
                            name: spec.name.clone(),
                        }
                    })?;
                    *balance = balance.checked_sub(*amount).ok_or_else(|| {
                        AssemblyError::InvalidVesting {
                            chain_id: chain.id.clone(),
                            name: spec.name.clone(),
                        }
                    })?;
                }
                free.retain(|_, amount| *amount > 0);
                if !free.is_empty() {
                    balances.push(balance_entry(&key.address, &free));
                }
                let start = genesis_time.timestamp();
                let end = start + vesting.duration.as_secs() as i64;
                auth_accounts.push(json!({
                    "@type": "/cosmos.vesting.v1beta1.ContinuousVestingAccount",
                    "base_vesting_account": {
                        "base_account": {"address": key.address},
                        "original_vesting": coins_json(&vested),
                        "end_time": end.to_string(),
                    },
                    "start_time": start.to_string(),
                }));
            }
        }
    }

    let supply = derived_supply_parts(&balances, &auth_accounts).map_err(|detail| {
        AssemblyError::Overlay { chain_id: chain.id.clone(), detail }
    })?;

    let mut genesis = json!({
        "genesis_time": genesis_time.to_rfc3339_opts(SecondsFormat::Nanos, true),
        "chain_id": chain.id,
        "initial_height": "1",
        "consensus_params": {
            "block": {"max_bytes": "22020096", "max_gas": "-1"},
            "evidence": {"max_age_num_blocks": "100000", "max_age_duration": "172800000000000"},
        },
        "validators": consensus_validators,
        "app_state": {
            "auth": {"accounts": auth_accounts},
            "bank": {"balances": balances, "supply": coins_json(&supply)},
            "staking": {
                "params": {"bond_denom": chain.bond_denom(), "max_validators": 100},
                "validators": staking_validators,
            },
        },
    });

    // user overlay merges last and wins on conflicts
    if !chain.genesis.is_null() {
        let overlay = yaml_to_json(&chain.genesis).map_err(|e| AssemblyError::Overlay {
            chain_id: chain.id.clone(),
            detail: e.to_string(),
        })?;
        genesis = merge_json(genesis, overlay);
    }
    Ok(genesis)
}

/// Recompute supply from the post-overlay document and compare it against
/// the recorded `bank.supply`.
pub fn verify_supply(chain_id: &str, genesis: &Value) -> Result<(), AssemblyError> {
    let balances = genesis["app_state"]["bank"]["balances"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let auth = genesis["app_state"]["auth"]["accounts"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let derived = derived_supply_parts(&balances, &auth).map_err(|detail| {
        AssemblyError::Overlay { chain_id: chain_id.to_string(), detail }
    })?;

    let mut recorded = BTreeMap::new();
    if let Some(entries) = genesis["app_state"]["bank"]["supply"].as_array() {
        for entry in entries {
            let (denom, amount) = parse_coin_entry(entry).map_err(|detail| {
                AssemblyError::Overlay { chain_id: chain_id.to_string(), detail }
            })?;
            *recorded.entry(denom).or_insert(0u128) += amount;
        }
    }

    if recorded != derived {
        return Err(AssemblyError::SupplyMismatch {
            chain_id: chain_id.to_string(),
            recorded: format_supply(&recorded),
            derived: format_supply(&derived),
        });
    }
    Ok(())
}

/// Sum of all balance entries plus all vesting originals.
fn derived_supply_parts(
    balances: &[Value],
    auth_accounts: &[Value],
) -> Result<BTreeMap<String, u128>, String> {
    let mut supply: BTreeMap<String, u128> = BTreeMap::new();
    for entry in balances {
        if let Some(coins) = entry["coins"].as_array() {
            for coin in coins {
                let (denom, amount) = parse_coin_entry(coin)?;
                *supply.entry(denom).or_insert(0) += amount;
            }
        }
    }
    for account in auth_accounts {
        if let Some(coins) = account["base_vesting_account"]["original_vesting"].as_array() {
            for coin in coins {
                let (denom, amount) = parse_coin_entry(coin)?;
                *supply.entry(denom).or_insert(0) += amount;
            }
        }
    }
    Ok(supply)
}

fn parse_coin_entry(entry: &Value) -> Result<(String, u128), String> {
    let denom = entry["denom"]
        .as_str()
        .ok_or_else(|| format!("coin entry without denom: {entry}"))?;
    let amount = entry["amount"]
        .as_str()
        .ok_or_else(|| format!("coin entry without amount: {entry}"))?
        .parse::<u128>()
        .map_err(|e| format!("coin amount in {entry}: {e}"))?;
    Ok((denom.to_string(), amount))
}

fn aggregate<'a>(coins: impl Iterator<Item = &'a Coin>) -> BTreeMap<String, u128> {
    let mut totals = BTreeMap::new();
    for coin in coins {
        *totals.entry(coin.denom.clone()).or_insert(0u128) += coin.amount;
    }
    totals
}

fn coins_json(amounts: &BTreeMap<String, u128>) -> Vec<Value> {
    amounts
        .iter()
        .map(|(denom, amount)| json!({"denom": denom, "amount": amount.to_string()}))
        .collect()
}

fn balance_entry(address: &str, amounts: &BTreeMap<String, u128>) -> Value {
    json!({"address": address, "coins": coins_json(amounts)})
}

fn base_account(address: &str) -> Value {
    json!({"@type": "/cosmos.auth.v1beta1.BaseAccount", "address": address})
}

fn format_supply(supply: &BTreeMap<String, u128>) -> String {
    supply
        .iter()
        .map(|(denom, amount)| format!("{amount}{denom}"))
        .collect::<Vec<_>>()
        .join(",")
}
