//! Typed cluster specification.
//!
//! The expander turns the raw YAML document into these records; everything
//! downstream (allocation, genesis assembly, process generation) works off
//! this typed form and never sees the template layer again.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::expand::ExpansionError;
use crate::lifecycle::LifecycleSettings;

/// Word counts accepted for explicit mnemonics.
pub const MNEMONIC_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

/// A fully expanded cluster: ordered chains plus cluster-wide settings.
///
/// Immutable once expansion completes; identical inputs expand to an
/// identical value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub chains: Vec<ChainSpec>,
    /// Overlay merged into the generated relayer configuration.
    #[serde(default)]
    pub relayer: serde_json::Value,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

/// One chain and its validators/accounts/overlays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ChainSpec {
    /// Chain id, taken from the mapping key in the raw document; persisted
    /// so a stored spec reloads with its ids intact.
    #[serde(default)]
    pub id: String,
    /// Chain binary; overridable per chain like any other field.
    #[serde(default = "defaults::cmd")]
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_flags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_flags: Option<String>,
    #[serde(default = "defaults::account_prefix")]
    pub account_prefix: String,
    #[serde(default = "defaults::coin_type")]
    pub coin_type: u32,
    /// Divisor applied to staked amounts to obtain consensus voting power.
    #[serde(default = "defaults::power_reduction")]
    pub power_reduction: u128,
    /// Fixed genesis time for reproducible clusters; defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_time: Option<DateTime<Utc>>,
    /// Account used to fund and sign relayer transactions.
    #[serde(default = "defaults::key_name")]
    pub key_name: String,
    /// Whether this chain participates in cross-chain relaying.
    #[serde(default = "defaults::relaying")]
    pub relaying: bool,
    pub validators: Vec<ValidatorSpec>,
    #[serde(default)]
    pub accounts: Vec<AccountSpec>,
    /// Partial genesis document deep-merged last, overlay wins.
    #[serde(default)]
    pub genesis: serde_yaml::Value,
    /// Chain-wide tendermint config overlay.
    #[serde(default)]
    pub config: serde_yaml::Value,
    /// Chain-wide application config overlay.
    #[serde(default)]
    pub app_config: serde_yaml::Value,
}

impl ChainSpec {
    /// Staking bond denomination, taken from the first validator's stake.
    pub fn bond_denom(&self) -> &str {
        &self.validators[0].staked.denom
    }

    /// Number of nodes this chain contributes to the cluster.
    pub fn node_count(&self) -> usize {
        self.validators.len()
    }
}

/// A validator and the node that runs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ValidatorSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<String>,
    /// Self-delegated stake; determines voting power.
    pub staked: Coin,
    /// Extra liquid balance on top of the self-delegation.
    #[serde(default, with = "coin_list")]
    pub coins: Vec<Coin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_max_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_max_change_rate: Option<String>,
    #[serde(default = "defaults::min_self_delegation")]
    pub min_self_delegation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_contact: Option<String>,
    /// Per-node tendermint config overlay.
    #[serde(default)]
    pub config: serde_yaml::Value,
    #[serde(default)]
    pub app_config: serde_yaml::Value,
    #[serde(default)]
    pub client_config: serde_yaml::Value,
}

/// A genesis account that is not a validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AccountSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<String>,
    #[serde(with = "coin_list")]
    pub coins: Vec<Coin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vesting: Option<VestingSpec>,
}

/// Vesting schedule relative to genesis time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct VestingSpec {
    /// Time from genesis until the schedule completes.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Portion of the balance that vests; defaults to the whole balance.
    #[serde(default, with = "coin_list")]
    pub coins: Vec<Coin>,
}

/// An amount/denomination pair, written `100basestake` in specs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Coin {
    pub amount: u128,
    pub denom: String,
}

impl Coin {
    pub fn new(amount: u128, denom: impl Into<String>) -> Self {
        Coin { amount, denom: denom.into() }
    }
}

fn coin_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9]+)([a-zA-Z][a-zA-Z0-9/._-]*)$").expect("coin pattern")
    })
}

impl FromStr for Coin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = coin_regex()
            .captures(s.trim())
            .ok_or_else(|| format!("invalid coin literal `{s}`"))?;
        let amount = caps[1]
            .parse::<u128>()
            .map_err(|e| format!("invalid coin amount in `{s}`: {e}"))?;
        Ok(Coin { amount, denom: caps[2].to_string() })
    }
}

impl TryFrom<String> for Coin {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Coin> for String {
    fn from(c: Coin) -> String {
        c.to_string()
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

/// Parse a comma-separated coin list, e.g. `10stake,1000000basestake`.
pub fn parse_coins(s: &str) -> Result<Vec<Coin>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(Coin::from_str)
        .collect()
}

/// Serde adapter for coin lists written as a single string.
mod coin_list {
    use super::{parse_coins, Coin};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(coins: &[Coin], ser: S) -> Result<S::Ok, S::Error> {
        let joined = coins
            .iter()
            .map(Coin::to_string)
            .collect::<Vec<_>>()
            .join(",");
        ser.serialize_str(&joined)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Coin>, D::Error> {
        let raw = String::deserialize(de)?;
        parse_coins(&raw).map_err(serde::de::Error::custom)
    }
}

impl ClusterSpec {
    /// Structural validation applied once at the expansion boundary.
    pub fn validate(&self) -> Result<(), ExpansionError> {
        if self.chains.is_empty() {
            return Err(ExpansionError::Malformed(
                "cluster spec declares no chains".to_string(),
            ));
        }
        for chain in &self.chains {
            chain.validate()?;
        }
        let relaying = self.chains.iter().filter(|c| c.relaying).count();
        if relaying >= 2 {
            for chain in self.chains.iter().filter(|c| c.relaying) {
                let funded = chain
                    .accounts
                    .iter()
                    .any(|a| a.name == chain.key_name)
                    || chain.validators.iter().any(|v| v.name == chain.key_name);
                if !funded {
                    return Err(ExpansionError::Malformed(format!(
                        "chain {} relays but has no `{}` account to fund the relayer",
                        chain.id, chain.key_name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ChainSpec {
    fn validate(&self) -> Result<(), ExpansionError> {
        if self.validators.is_empty() {
            return Err(ExpansionError::Malformed(format!(
                "chain {} declares no validators",
                self.id
            )));
        }
        let bond_denom = self.bond_denom().to_string();
        let mut seen = std::collections::BTreeSet::new();
        for validator in &self.validators {
            if !seen.insert(validator.name.as_str()) {
                return Err(ExpansionError::DuplicateName {
                    chain_id: self.id.clone(),
                    name: validator.name.clone(),
                });
            }
            if validator.staked.denom != bond_denom {
                return Err(ExpansionError::Malformed(format!(
                    "chain {}: validator {} stakes {} but the bond denom is {}",
                    self.id, validator.name, validator.staked.denom, bond_denom
                )));
            }
            check_mnemonic(&self.id, &validator.name, validator.mnemonic.as_deref())?;
        }
        for account in &self.accounts {
            if !seen.insert(account.name.as_str()) {
                return Err(ExpansionError::DuplicateName {
                    chain_id: self.id.clone(),
                    name: account.name.clone(),
                });
            }
            check_mnemonic(&self.id, &account.name, account.mnemonic.as_deref())?;
        }
        Ok(())
    }
}

fn check_mnemonic(
    chain_id: &str,
    name: &str,
    mnemonic: Option<&str>,
) -> Result<(), ExpansionError> {
    let Some(mnemonic) = mnemonic else {
        return Ok(());
    };
    let words = mnemonic.split_whitespace().count();
    if !MNEMONIC_WORD_COUNTS.contains(&words) {
        return Err(ExpansionError::Malformed(format!(
            "chain {chain_id}: mnemonic for `{name}` has {words} words, expected one of {MNEMONIC_WORD_COUNTS:?}"
        )));
    }
    Ok(())
}

mod defaults {
    pub fn cmd() -> String {
        "chaind".to_string()
    }
    pub fn account_prefix() -> String {
        "cosmos".to_string()
    }
    pub fn coin_type() -> u32 {
        118
    }
    pub fn power_reduction() -> u128 {
        1
    }
    pub fn key_name() -> String {
        "relayer".to_string()
    }
    pub fn relaying() -> bool {
        true
    }
    pub fn min_self_delegation() -> u64 {
        1
    }
}
