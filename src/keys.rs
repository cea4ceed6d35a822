//! Mnemonic and key derivation service.
//!
//! Every piece of key material in the cluster comes from here: account keys,
//! consensus keys and node keys are all derived from a mnemonic seed plus a
//! domain context, never from declaration position, so regenerating one
//! node's material can never perturb another's. Callers inject fixed
//! mnemonics for reproducible clusters; absent ones are generated from the
//! OS entropy source.

use base64::Engine as _;
use bip39::{Language, Mnemonic};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key material failures, wrapped into `AssemblyError` by the assembler.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid mnemonic for `{name}`: {source}")]
    InvalidMnemonic { name: String, source: bip39::Error },
    #[error("mnemonic generation failed: {0}")]
    Generation(bip39::Error),
}

/// An account key with its derived address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountKey {
    pub name: String,
    pub address: String,
    pub pub_key: String,
    pub mnemonic: String,
}

/// A tendermint-style consensus key pair.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusKey {
    pub address: String,
    pub pub_key: String,
    pub priv_key: String,
}

impl ConsensusKey {
    /// Contents of `config/priv_validator_key.json`.
    pub fn priv_validator_key(&self) -> serde_json::Value {
        serde_json::json!({
            "address": self.address,
            "pub_key": {"type": "tendermint/PubKeyEd25519", "value": self.pub_key},
            "priv_key": {"type": "tendermint/PrivKeyEd25519", "value": self.priv_key},
        })
    }
}

/// A p2p identity key.
#[derive(Debug, Clone, Serialize)]
pub struct NodeKey {
    pub node_id: String,
    pub priv_key: String,
}

impl NodeKey {
    /// Contents of `config/node_key.json`.
    pub fn node_key_json(&self) -> serde_json::Value {
        serde_json::json!({
            "priv_key": {"type": "tendermint/PrivKeyEd25519", "value": self.priv_key},
        })
    }
}

/// Derivation domains; one sub-key per domain from a single mnemonic.
const CONTEXT_ACCOUNT: &str = "account";
const CONTEXT_CONSENSUS: &str = "consensus";
const CONTEXT_NODE: &str = "node";

#[derive(Debug, Clone)]
pub struct KeyService {
    /// Words in generated mnemonics.
    pub word_count: usize,
}

impl Default for KeyService {
    fn default() -> Self {
        KeyService { word_count: 24 }
    }
}

impl KeyService {
    /// Generate a fresh mnemonic from OS entropy.
    pub fn generate_mnemonic(&self) -> Result<String, KeyError> {
        let mut csprng = rand::rngs::OsRng;
        let mnemonic =
            Mnemonic::generate_in_with(&mut csprng, Language::English, self.word_count)
                .map_err(KeyError::Generation)?;
        Ok(mnemonic.to_string())
    }

    /// Use the given mnemonic or generate one, then derive the account key.
    pub fn account_key(
        &self,
        name: &str,
        mnemonic: Option<&str>,
    ) -> Result<AccountKey, KeyError> {
        let mnemonic = match mnemonic {
            Some(m) => m.to_string(),
            None => self.generate_mnemonic()?,
        };
        let signing = signing_key(name, &mnemonic, CONTEXT_ACCOUNT)?;
        let public = signing.verifying_key().to_bytes();
        Ok(AccountKey {
            name: name.to_string(),
            address: address_of(&public),
            pub_key: b64(&public),
            mnemonic,
        })
    }

    pub fn consensus_key(&self, name: &str, mnemonic: &str) -> Result<ConsensusKey, KeyError> {
        let signing = signing_key(name, mnemonic, CONTEXT_CONSENSUS)?;
        let public = signing.verifying_key().to_bytes();
        Ok(ConsensusKey {
            address: address_of(&public),
            pub_key: b64(&public),
            priv_key: b64(&signing.to_keypair_bytes()),
        })
    }

    pub fn node_key(&self, name: &str, mnemonic: &str) -> Result<NodeKey, KeyError> {
        let signing = signing_key(name, mnemonic, CONTEXT_NODE)?;
        let public = signing.verifying_key().to_bytes();
        Ok(NodeKey {
            // node ids are lowercase hex, unlike account addresses
            node_id: hex::encode(&Sha256::digest(public)[..20]),
            priv_key: b64(&signing.to_keypair_bytes()),
        })
    }
}

fn signing_key(name: &str, mnemonic: &str, context: &str) -> Result<SigningKey, KeyError> {
    let parsed = Mnemonic::parse_in_normalized(Language::English, mnemonic).map_err(|source| {
        KeyError::InvalidMnemonic { name: name.to_string(), source }
    })?;
    let seed = parsed.to_seed("");
    let mut hasher = Sha256::new();
    hasher.update(context.as_bytes());
    hasher.update(seed);
    let digest: [u8; 32] = hasher.finalize().into();
    Ok(SigningKey::from_bytes(&digest))
}

/// Uppercase-hex address: first 20 bytes of sha256 over the public key.
fn address_of(public: &[u8; 32]) -> String {
    hex::encode_upper(&Sha256::digest(public)[..20])
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // standard all-zero-entropy test mnemonics
    const M12: &str = "abandon abandon abandon abandon abandon abandon abandon abandon \
                       abandon abandon abandon about";
    const M24: &str = "abandon abandon abandon abandon abandon abandon abandon abandon \
                       abandon abandon abandon abandon abandon abandon abandon abandon \
                       abandon abandon abandon abandon abandon abandon abandon art";

    #[test]
    fn test_fixed_mnemonic_is_deterministic() {
        let keys = KeyService::default();
        let a = keys.account_key("validator", Some(M24)).unwrap();
        let b = keys.account_key("validator", Some(M24)).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.pub_key, b.pub_key);
        assert_eq!(a.address.len(), 40);
        assert!(a.address.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_contexts_produce_distinct_keys() {
        let keys = KeyService::default();
        let account = keys.account_key("v1", Some(M24)).unwrap();
        let consensus = keys.consensus_key("v1", M24).unwrap();
        let node = keys.node_key("v1", M24).unwrap();
        assert_ne!(account.pub_key, consensus.pub_key);
        assert_ne!(account.address, consensus.address);
        assert_ne!(node.node_id, consensus.address.to_lowercase());
    }

    #[test]
    fn test_generated_mnemonics_are_valid_and_unique() {
        let keys = KeyService::default();
        let first = keys.generate_mnemonic().unwrap();
        let second = keys.generate_mnemonic().unwrap();
        assert_eq!(first.split_whitespace().count(), 24);
        assert_ne!(first, second);
        // a generated mnemonic round-trips through derivation
        keys.account_key("anyone", Some(&first)).unwrap();
    }

    #[test]
    fn test_invalid_mnemonic_rejected() {
        let keys = KeyService::default();
        let err = keys
            .account_key("v1", Some("not a real mnemonic phrase at all"))
            .unwrap_err();
        assert!(matches!(err, KeyError::InvalidMnemonic { .. }));
    }

    #[test]
    fn test_shorter_word_counts_supported() {
        let keys = KeyService { word_count: 12 };
        let generated = keys.generate_mnemonic().unwrap();
        assert_eq!(generated.split_whitespace().count(), 12);
        keys.account_key("short", Some(M12)).unwrap();
    }

    #[test]
    fn test_priv_validator_key_layout() {
        let keys = KeyService::default();
        let consensus = keys.consensus_key("v1", M24).unwrap();
        let doc = consensus.priv_validator_key();
        assert_eq!(doc["pub_key"]["type"], "tendermint/PubKeyEd25519");
        assert_eq!(doc["priv_key"]["type"], "tendermint/PrivKeyEd25519");
        assert_eq!(doc["address"], serde_json::json!(consensus.address));
    }
}
