//! Cluster orchestration.
//!
//! Drives the whole pipeline in order: expand the spec, allocate resources,
//! assemble keys and genesis, write every artifact to the run's data
//! directory, then hand process control to the supervisor and the lifecycle
//! controller. The data directory is owned exclusively by one invocation at
//! a time; relayer configuration is generated only after every
//! participating chain came up.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::expand;
use crate::genesis::{assemble, ChainArtifacts};
use crate::keys::{AccountKey, KeyService};
use crate::lifecycle::{
    all_running, healthy_chains, CrashPolicy, LifecycleController, NodeReport, NodeState, RpcProbe,
};
use crate::nodeconfig;
use crate::ports::{allocate, ResolvedNode};
use crate::relayer::{self, RelayerKind, RelayerPlan};
use crate::spec::{ChainSpec, ClusterSpec};
use crate::supervisor::{
    chain_tasks_ini, root_ini, ProcessControl, ProcessDescriptor, Supervisord, RELAYER_PROGRAM,
    SUPERVISOR_CONFIG_FILE, TASKS_FILE,
};

/// Resolved-spec manifest persisted in the data directory, so later
/// invocations rebuild the identical allocation.
pub const CLUSTER_MANIFEST: &str = "cluster.json";

#[derive(Serialize, Deserialize)]
struct ClusterManifest {
    base_port: u16,
    relayer_kind_hermes: bool,
    spec: ClusterSpec,
}

/// An initialized cluster: the expanded spec plus its allocation.
#[derive(Debug)]
pub struct Cluster {
    pub data_dir: PathBuf,
    pub base_port: u16,
    pub spec: ClusterSpec,
    pub nodes: BTreeMap<String, Vec<ResolvedNode>>,
}

impl Cluster {
    /// All nodes across all chains, in declaration order.
    pub fn all_nodes(&self) -> Vec<ResolvedNode> {
        self.spec
            .chains
            .iter()
            .flat_map(|chain| self.nodes[&chain.id].iter().cloned())
            .collect()
    }
}

/// Expand the spec and write every per-chain artifact under `data_dir`.
///
/// Fails before touching the supervisor if expansion or allocation fail; an
/// assembly failure aborts the affected chain but leaves the artifacts of
/// chains written before it intact.
pub fn init_cluster(
    data_dir: &Path,
    config_path: &Path,
    base_port: u16,
    dotenv: Option<&Path>,
    relayer_kind: RelayerKind,
    force: bool,
) -> Result<Cluster> {
    let spec = expand::expand(config_path, dotenv)
        .wrap_err_with(|| format!("failed to expand {}", config_path.display()))?;
    let nodes = allocate(&spec, data_dir, base_port)?;

    claim_data_dir(data_dir, force)?;

    let keys = KeyService::default();
    let mut chain_ids = Vec::new();
    for chain in &spec.chains {
        let chain_nodes = &nodes[&chain.id];
        let artifacts = assemble(chain, chain_nodes, &keys)?;
        write_chain(data_dir, chain, &artifacts, &spec)
            .wrap_err_with(|| format!("failed to write artifacts for chain {}", chain.id))?;
        info!(
            "chain {}: {} nodes {:?}",
            chain.id,
            chain_nodes.len(),
            NodeState::Configured
        );
        chain_ids.push(chain.id.clone());
    }

    // the relayer program is registered up front (autostart off); its
    // configuration is only written once the chains are actually up
    let every_chain = chain_ids.iter().cloned().collect();
    let relayer_descriptor =
        relayer::plan(&spec, &nodes, &every_chain).map(|plan| relayer_program(relayer_kind, &plan));
    std::fs::write(
        data_dir.join(SUPERVISOR_CONFIG_FILE),
        root_ini(&chain_ids, relayer_descriptor.as_ref()),
    )?;

    let manifest = ClusterManifest {
        base_port,
        relayer_kind_hermes: matches!(relayer_kind, RelayerKind::Hermes),
        spec: spec.clone(),
    };
    std::fs::write(
        data_dir.join(CLUSTER_MANIFEST),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    info!("initialized cluster in {}", data_dir.display());
    info!("  - chains: {}", chain_ids.join(", "));
    info!(
        "  - total nodes: {}",
        nodes.values().map(Vec::len).sum::<usize>()
    );
    Ok(Cluster {
        data_dir: data_dir.to_path_buf(),
        base_port,
        spec,
        nodes,
    })
}

/// Reload an initialized cluster; the allocation is recomputed from the
/// persisted spec and is identical by construction.
pub fn load_cluster(data_dir: &Path) -> Result<(Cluster, RelayerKind)> {
    let manifest_path = data_dir.join(CLUSTER_MANIFEST);
    let raw = std::fs::read_to_string(&manifest_path)
        .wrap_err_with(|| format!("no cluster at {}", data_dir.display()))?;
    let manifest: ClusterManifest = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("corrupt manifest {}", manifest_path.display()))?;
    let nodes = allocate(&manifest.spec, data_dir, manifest.base_port)?;
    let kind = if manifest.relayer_kind_hermes {
        RelayerKind::Hermes
    } else {
        RelayerKind::Rly
    };
    Ok((
        Cluster {
            data_dir: data_dir.to_path_buf(),
            base_port: manifest.base_port,
            spec: manifest.spec,
            nodes,
        },
        kind,
    ))
}

/// Launch the supervisor daemon, bring every node up and, once all
/// relaying chains are healthy, generate and start the relayer.
pub fn start_cluster(
    cluster: &Cluster,
    relayer_kind: RelayerKind,
) -> Result<(Vec<NodeReport>, std::process::Child)> {
    let supervisord = Supervisord::new(&cluster.data_dir);
    let child = supervisord.launch()?;
    wait_for_control_socket(&cluster.data_dir, Duration::from_secs(10));

    let probe = RpcProbe::default();
    let controller =
        LifecycleController::new(&supervisord, &probe, cluster.spec.lifecycle.clone());
    let reports = controller.start_all(&cluster.all_nodes());
    for report in &reports {
        info!("{}: {:?}", report.program, report.state);
        if let Some(detail) = &report.detail {
            warn!("{}: {detail}", report.program);
        }
    }

    let healthy = healthy_chains(&reports);
    match relayer::plan(&cluster.spec, &cluster.nodes, &healthy) {
        Some(plan) => {
            write_relayer_artifacts(&cluster.data_dir, &plan, relayer_kind)?;
            supervisord.start(RELAYER_PROGRAM)?;
            info!("relayer started for {} chain pair(s)", plan.pairs.len());
        }
        None => {
            if !all_running(&reports) {
                warn!("relayer generation skipped: not all chains are healthy");
            }
        }
    }
    Ok((reports, child))
}

/// Tear the cluster down: relayer first, then nodes, then the daemon.
pub fn down_cluster(data_dir: &Path) -> Result<Vec<NodeReport>> {
    let (cluster, _) = load_cluster(data_dir)?;
    let supervisord = Supervisord::new(data_dir);
    if let Err(e) = supervisord.stop(RELAYER_PROGRAM) {
        // no relayer registered for single-chain clusters
        warn!("relayer stop: {e}");
    }
    let probe = RpcProbe::default();
    let controller =
        LifecycleController::new(&supervisord, &probe, cluster.spec.lifecycle.clone());
    controller.request_teardown();
    let reports = controller.stop_all(&cluster.all_nodes());
    supervisord.shutdown()?;
    info!("cluster in {} stopped", data_dir.display());
    Ok(reports)
}

/// Look up a funded account recorded during assembly.
pub fn find_account(data_dir: &Path, chain_id: &str, name: &str) -> Result<AccountKey> {
    let path = data_dir.join(chain_id).join("accounts.json");
    let raw = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("missing {}", path.display()))?;
    let accounts: Vec<AccountKey> = serde_json::from_str(&raw)?;
    accounts
        .into_iter()
        .find(|a| a.name == name)
        .ok_or_else(|| eyre!("no account `{name}` on chain {chain_id}"))
}

/// The data directory belongs to exactly one orchestrator invocation.
fn claim_data_dir(data_dir: &Path, force: bool) -> Result<()> {
    if data_dir.exists() && data_dir.read_dir()?.next().is_some() {
        if !force {
            bail!(
                "data directory {} is not empty; pass --force to recreate it",
                data_dir.display()
            );
        }
        info!("removing previous cluster in {}", data_dir.display());
        std::fs::remove_dir_all(data_dir)?;
    }
    std::fs::create_dir_all(data_dir)?;
    Ok(())
}

fn write_chain(
    data_dir: &Path,
    chain: &ChainSpec,
    artifacts: &ChainArtifacts,
    spec: &ClusterSpec,
) -> Result<()> {
    let chain_dir = data_dir.join(&chain.id);
    std::fs::create_dir_all(&chain_dir)?;

    let genesis_bytes = serde_json::to_string_pretty(&artifacts.genesis)?;
    std::fs::write(chain_dir.join("genesis.json"), &genesis_bytes)?;
    std::fs::write(
        chain_dir.join("accounts.json"),
        serde_json::to_string_pretty(&artifacts.accounts)?,
    )?;
    // human-readable record of the allocation
    let allocation: Vec<_> = artifacts
        .nodes
        .iter()
        .map(|a| {
            serde_json::json!({
                "name": a.node.name,
                "base_port": a.node.base_port,
                "hostname": a.node.hostname,
            })
        })
        .collect();
    std::fs::write(
        chain_dir.join("config.json"),
        serde_json::to_string_pretty(&serde_json::json!({
            "chain_id": chain.id,
            "cmd": chain.cmd,
            "validators": allocation,
        }))?,
    )?;

    for (validator, artifact) in chain.validators.iter().zip(&artifacts.nodes) {
        let config_dir = artifact.node.home.join("config");
        std::fs::create_dir_all(&config_dir)?;
        std::fs::create_dir_all(artifact.node.home.join("data"))?;

        // every node carries its own copy, so homes stay relocatable
        std::fs::write(config_dir.join("genesis.json"), &genesis_bytes)?;
        std::fs::write(
            config_dir.join("priv_validator_key.json"),
            serde_json::to_string_pretty(&artifact.consensus.priv_validator_key())?,
        )?;
        std::fs::write(
            config_dir.join("node_key.json"),
            serde_json::to_string_pretty(&artifact.node_key.node_key_json())?,
        )?;
        std::fs::write(
            artifact.node.home.join("data/priv_validator_state.json"),
            serde_json::to_string_pretty(&serde_json::json!({
                "height": "0",
                "round": 0,
                "step": 0,
            }))?,
        )?;

        let tm = nodeconfig::tendermint_config(chain, validator, artifact)?;
        std::fs::write(config_dir.join("config.toml"), toml::to_string(&tm)?)?;
        let app = nodeconfig::app_config(chain, validator, artifact)?;
        std::fs::write(config_dir.join("app.toml"), toml::to_string(&app)?)?;
        let client = nodeconfig::client_config(chain, validator, artifact)?;
        std::fs::write(config_dir.join("client.toml"), toml::to_string(&client)?)?;
    }

    let autorestart = matches!(spec.lifecycle.on_crash, CrashPolicy::Restart);
    let descriptors: Vec<ProcessDescriptor> = artifacts
        .nodes
        .iter()
        .map(|a| ProcessDescriptor::for_node(chain, &a.node, autorestart))
        .collect();
    std::fs::write(chain_dir.join(TASKS_FILE), chain_tasks_ini(&descriptors))?;
    Ok(())
}

fn relayer_program(kind: RelayerKind, plan: &RelayerPlan) -> ProcessDescriptor {
    ProcessDescriptor {
        name: RELAYER_PROGRAM.to_string(),
        command: relayer::relayer_command(kind, plan),
        directory: "%(here)s".to_string(),
        environment: BTreeMap::new(),
        stdout_logfile: "%(here)s/relayer.log".to_string(),
        autostart: false,
        autorestart: true,
        startsecs: 3,
    }
}

/// Write the relayer configuration artifacts for the chosen profile.
pub fn write_relayer_artifacts(
    data_dir: &Path,
    plan: &RelayerPlan,
    kind: RelayerKind,
) -> Result<()> {
    match kind {
        RelayerKind::Hermes => {
            let doc = relayer::hermes_document(plan);
            let toml_doc = nodeconfig::json_to_toml(&doc)
                .map_err(|detail| eyre!("relayer config not representable in TOML: {detail}"))?;
            std::fs::write(data_dir.join("relayer.toml"), toml::to_string(&toml_doc)?)?;
        }
        RelayerKind::Rly => {
            let config_dir = data_dir.join("relayer/config");
            std::fs::create_dir_all(&config_dir)?;
            let doc = relayer::rly_document(plan);
            std::fs::write(config_dir.join("config.yaml"), serde_yaml::to_string(&doc)?)?;
        }
    }

    // dedicated funded key per connected chain
    let mut mnemonics = BTreeMap::new();
    for endpoint in &plan.endpoints {
        let account = find_account(data_dir, &endpoint.chain_id, &endpoint.key_name)?;
        mnemonics.insert(endpoint.chain_id.clone(), account.mnemonic);
    }
    std::fs::write(data_dir.join("relayer.env"), relayer::env_file(&mnemonics))?;
    Ok(())
}

fn wait_for_control_socket(data_dir: &Path, timeout: Duration) {
    let socket = data_dir.join("supervisor.sock");
    let deadline = Instant::now() + timeout;
    while !socket.exists() {
        if Instant::now() >= deadline {
            warn!("supervisor control socket did not appear within {timeout:?}");
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    const TWO_CHAINS: &str = r#"
alpha-1:
  validators:
    - name: v1
      staked: 100stake
    - name: v2
      staked: 200stake
  accounts:
    - name: relayer
      coins: 1000stake
beta-1:
  validators:
    - name: v1
      staked: 100stake
  accounts:
    - name: relayer
      coins: 1000stake
"#;

    #[test]
    fn test_init_writes_layout() {
        let data = TempDir::new().unwrap();
        let config = write_config(TWO_CHAINS);
        let cluster = init_cluster(
            data.path(),
            config.path(),
            26650,
            None,
            RelayerKind::Hermes,
            true,
        )
        .unwrap();

        assert_eq!(cluster.all_nodes().len(), 3);
        for path in [
            "supervisord.ini",
            "cluster.json",
            "alpha-1/genesis.json",
            "alpha-1/accounts.json",
            "alpha-1/config.json",
            "alpha-1/tasks.ini",
            "alpha-1/node0/config/config.toml",
            "alpha-1/node0/config/app.toml",
            "alpha-1/node0/config/client.toml",
            "alpha-1/node0/config/priv_validator_key.json",
            "alpha-1/node0/config/node_key.json",
            "alpha-1/node0/data/priv_validator_state.json",
            "alpha-1/node1/config/config.toml",
            "beta-1/node0/config/config.toml",
        ] {
            assert!(data.path().join(path).exists(), "missing {path}");
        }

        let ini = std::fs::read_to_string(data.path().join("supervisord.ini")).unwrap();
        assert!(ini.contains("alpha-1/tasks.ini"));
        assert!(ini.contains("[program:relayer]"));
        assert!(ini.contains("hermes --config relayer.toml start"));
    }

    #[test]
    fn test_init_refuses_nonempty_dir() {
        let data = TempDir::new().unwrap();
        std::fs::write(data.path().join("leftover"), "x").unwrap();
        let config = write_config(TWO_CHAINS);
        let err = init_cluster(
            data.path(),
            config.path(),
            26650,
            None,
            RelayerKind::Hermes,
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not empty"));
        // nothing was written next to the leftover
        assert!(!data.path().join("supervisord.ini").exists());
    }

    #[test]
    fn test_load_reproduces_allocation() {
        let data = TempDir::new().unwrap();
        let config = write_config(TWO_CHAINS);
        let cluster = init_cluster(
            data.path(),
            config.path(),
            27000,
            None,
            RelayerKind::Rly,
            true,
        )
        .unwrap();
        let (loaded, kind) = load_cluster(data.path()).unwrap();
        assert_eq!(kind, RelayerKind::Rly);
        assert_eq!(loaded.base_port, 27000);
        assert_eq!(
            serde_json::to_string(&loaded.nodes).unwrap(),
            serde_json::to_string(&cluster.nodes).unwrap()
        );
    }

    #[test]
    fn test_find_account_round_trip() {
        let data = TempDir::new().unwrap();
        let config = write_config(TWO_CHAINS);
        init_cluster(
            data.path(),
            config.path(),
            26650,
            None,
            RelayerKind::Hermes,
            true,
        )
        .unwrap();
        let account = find_account(data.path(), "alpha-1", "relayer").unwrap();
        assert_eq!(account.name, "relayer");
        assert_eq!(account.mnemonic.split_whitespace().count(), 24);
        assert!(find_account(data.path(), "alpha-1", "nobody").is_err());
    }

    #[test]
    fn test_relayer_artifacts() {
        let data = TempDir::new().unwrap();
        let config = write_config(TWO_CHAINS);
        let cluster = init_cluster(
            data.path(),
            config.path(),
            26650,
            None,
            RelayerKind::Hermes,
            true,
        )
        .unwrap();
        let healthy = cluster.nodes.keys().cloned().collect();
        let plan = relayer::plan(&cluster.spec, &cluster.nodes, &healthy).unwrap();

        write_relayer_artifacts(data.path(), &plan, RelayerKind::Hermes).unwrap();
        let hermes = std::fs::read_to_string(data.path().join("relayer.toml")).unwrap();
        assert!(hermes.contains("[[chains]]"));
        assert!(hermes.contains("id = \"alpha-1\""));

        write_relayer_artifacts(data.path(), &plan, RelayerKind::Rly).unwrap();
        let rly =
            std::fs::read_to_string(data.path().join("relayer/config/config.yaml")).unwrap();
        assert!(rly.contains("alpha-1"));

        let env = std::fs::read_to_string(data.path().join("relayer.env")).unwrap();
        assert!(env.contains("ALPHA_1_RELAYER_MNEMONIC="));
        assert!(env.contains("BETA_1_RELAYER_MNEMONIC="));
    }
}
