//! Node process lifecycle control.
//!
//! Drives every node through `uninitialized → configured → starting →
//! running → {stopping → stopped | crashed}` against the external
//! supervisor. Start commands for different nodes are issued without
//! waiting on each other; only the readiness wait blocks, and those waits
//! run concurrently with a bounded window per node. A teardown request is
//! honored even while readiness waits are outstanding.

use std::collections::BTreeSet;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::ports::{ResolvedNode, Service};
use crate::supervisor::{ProcessControl, ProcessStatus, SupervisorError};

/// Lifecycle states of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Uninitialized,
    Configured,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// What to do when a running node exits unexpectedly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrashPolicy {
    /// Leave the node down and report it.
    #[default]
    Report,
    /// Let the supervisor's own restart policy recover it.
    Restart,
}

/// Cluster-wide lifecycle tuning, settable from the spec's `lifecycle` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LifecycleSettings {
    /// Bounded window for a node to answer on its RPC endpoint.
    #[serde(with = "humantime_serde", default = "defaults::startup_timeout")]
    pub startup_timeout: Duration,
    #[serde(with = "humantime_serde", default = "defaults::poll_interval")]
    pub poll_interval: Duration,
    /// Grace period before a stop escalates to SIGKILL.
    #[serde(with = "humantime_serde", default = "defaults::shutdown_grace")]
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub on_crash: CrashPolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        LifecycleSettings {
            startup_timeout: defaults::startup_timeout(),
            poll_interval: defaults::poll_interval(),
            shutdown_grace: defaults::shutdown_grace(),
            on_crash: CrashPolicy::default(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn startup_timeout() -> Duration {
        Duration::from_secs(60)
    }
    pub fn poll_interval() -> Duration {
        Duration::from_millis(500)
    }
    pub fn shutdown_grace() -> Duration {
        Duration::from_secs(10)
    }
}

/// Liveness check for one node; swappable so tests can script readiness.
pub trait HealthProbe: Sync {
    fn ready(&self, node: &ResolvedNode) -> bool;
}

/// Default probe: the node is ready once its RPC port accepts connections.
#[derive(Debug, Clone)]
pub struct RpcProbe {
    pub connect_timeout: Duration,
}

impl Default for RpcProbe {
    fn default() -> Self {
        RpcProbe { connect_timeout: Duration::from_millis(300) }
    }
}

impl HealthProbe for RpcProbe {
    fn ready(&self, node: &ResolvedNode) -> bool {
        let addr = format!("{}:{}", node.hostname, node.port(Service::Rpc));
        match addr.parse::<SocketAddr>() {
            Ok(addr) => TcpStream::connect_timeout(&addr, self.connect_timeout).is_ok(),
            Err(_) => false,
        }
    }
}

/// Outcome of a lifecycle operation for one node.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub chain_id: String,
    pub program: String,
    pub state: NodeState,
    pub detail: Option<String>,
}

impl NodeReport {
    fn new(node: &ResolvedNode, state: NodeState) -> Self {
        NodeReport {
            chain_id: node.chain_id.clone(),
            program: node.program(),
            state,
            detail: None,
        }
    }

    fn with_detail(node: &ResolvedNode, state: NodeState, detail: String) -> Self {
        NodeReport { detail: Some(detail), ..NodeReport::new(node, state) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("node {program} did not become ready within {window:?}")]
    ReadinessTimeout { program: String, window: Duration },
    #[error("node {program} crashed during startup")]
    Crashed { program: String },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Issues lifecycle commands against the supervisor and tracks per-node
/// outcomes. Holds no process state of its own; the supervisor is queried
/// for liveness.
pub struct LifecycleController<'a> {
    control: &'a (dyn ProcessControl + Sync),
    probe: &'a (dyn HealthProbe + Sync),
    settings: LifecycleSettings,
    cancel: AtomicBool,
}

impl<'a> LifecycleController<'a> {
    pub fn new(
        control: &'a (dyn ProcessControl + Sync),
        probe: &'a (dyn HealthProbe + Sync),
        settings: LifecycleSettings,
    ) -> Self {
        LifecycleController { control, probe, settings, cancel: AtomicBool::new(false) }
    }

    /// Abandon outstanding readiness waits; safe to call from any thread.
    pub fn request_teardown(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn teardown_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Start every node and wait for readiness concurrently.
    ///
    /// A node that fails is reported as `Crashed` without aborting its
    /// siblings; callers decide what a partial cluster means.
    pub fn start_all(&self, nodes: &[ResolvedNode]) -> Vec<NodeReport> {
        let mut waiting = Vec::with_capacity(nodes.len());
        let mut reports = Vec::new();
        for node in nodes {
            match self.control.start(&node.program()) {
                Ok(()) => waiting.push(node),
                Err(e) => {
                    warn!("failed to start {}: {e}", node.program());
                    reports.push(NodeReport::with_detail(node, NodeState::Crashed, e.to_string()));
                }
            }
        }
        reports.extend(
            waiting
                .par_iter()
                .map(|node| self.wait_ready(node))
                .collect::<Vec<_>>(),
        );
        reports
    }

    /// Poll the supervisor and the health endpoint until the node answers,
    /// dies, the window elapses or teardown is requested.
    fn wait_ready(&self, node: &ResolvedNode) -> NodeReport {
        let program = node.program();
        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            if self.teardown_requested() {
                return NodeReport::with_detail(
                    node,
                    NodeState::Stopping,
                    "readiness wait abandoned by teardown".to_string(),
                );
            }
            match self.control.status(&program) {
                Ok(status) if status.is_dead() => {
                    let err = LifecycleError::Crashed { program: program.clone() };
                    let detail = match self.settings.on_crash {
                        CrashPolicy::Report => format!("{err}: exited with {status:?}"),
                        CrashPolicy::Restart => {
                            format!("{err}: exited with {status:?}; supervisor will retry")
                        }
                    };
                    warn!("{program}: {detail}");
                    return NodeReport::with_detail(node, NodeState::Crashed, detail);
                }
                Ok(_) => {}
                Err(e) => {
                    return NodeReport::with_detail(node, NodeState::Crashed, e.to_string());
                }
            }
            if self.probe.ready(node) {
                info!("{program} is ready on {}", node.rpc_laddr());
                return NodeReport::new(node, NodeState::Running);
            }
            if Instant::now() >= deadline {
                let err = LifecycleError::ReadinessTimeout {
                    program: program.clone(),
                    window: self.settings.startup_timeout,
                };
                warn!("{err}");
                return NodeReport::with_detail(node, NodeState::Crashed, err.to_string());
            }
            std::thread::sleep(self.settings.poll_interval);
        }
    }

    /// Stop every node, escalating to SIGKILL after the grace period.
    pub fn stop_all(&self, nodes: &[ResolvedNode]) -> Vec<NodeReport> {
        self.request_teardown();
        nodes.iter().map(|node| self.stop_node(node)).collect()
    }

    fn stop_node(&self, node: &ResolvedNode) -> NodeReport {
        let program = node.program();
        if let Err(e) = self.control.stop(&program) {
            warn!("graceful stop of {program} failed: {e}");
        }
        let deadline = Instant::now() + self.settings.shutdown_grace;
        loop {
            match self.control.status(&program) {
                Ok(
                    ProcessStatus::Stopped | ProcessStatus::Exited | ProcessStatus::Fatal,
                ) => {
                    return NodeReport::new(node, NodeState::Stopped);
                }
                Ok(_) => {}
                Err(e) => {
                    return NodeReport::with_detail(node, NodeState::Stopped, e.to_string());
                }
            }
            if Instant::now() >= deadline {
                warn!("{program} did not stop within grace period, sending SIGKILL");
                if let Err(e) = self.control.kill(&program) {
                    return NodeReport::with_detail(node, NodeState::Crashed, e.to_string());
                }
                return NodeReport::with_detail(
                    node,
                    NodeState::Stopped,
                    "forcefully terminated".to_string(),
                );
            }
            std::thread::sleep(self.settings.poll_interval);
        }
    }
}

/// True when every node reached `running`.
pub fn all_running(reports: &[NodeReport]) -> bool {
    reports.iter().all(|r| r.state == NodeState::Running)
}

/// Chains whose nodes are all running; relayer generation is restricted to
/// these.
pub fn healthy_chains(reports: &[NodeReport]) -> BTreeSet<String> {
    let mut chains: BTreeSet<String> =
        reports.iter().map(|r| r.chain_id.clone()).collect();
    for report in reports {
        if report.state != NodeState::Running {
            chains.remove(&report.chain_id);
        }
    }
    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ProcessStatus;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Scripted supervisor: per-program status plus a call log.
    #[derive(Default)]
    struct FakeControl {
        statuses: Mutex<BTreeMap<String, ProcessStatus>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeControl {
        fn set(&self, program: &str, status: ProcessStatus) {
            self.statuses.lock().unwrap().insert(program.to_string(), status);
        }

        fn log(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }
    }

    impl ProcessControl for FakeControl {
        fn start(&self, program: &str) -> Result<(), SupervisorError> {
            self.log(format!("start {program}"));
            self.set(program, ProcessStatus::Running);
            Ok(())
        }

        fn stop(&self, program: &str) -> Result<(), SupervisorError> {
            self.log(format!("stop {program}"));
            self.set(program, ProcessStatus::Stopped);
            Ok(())
        }

        fn kill(&self, program: &str) -> Result<(), SupervisorError> {
            self.log(format!("kill {program}"));
            self.set(program, ProcessStatus::Stopped);
            Ok(())
        }

        fn status(&self, program: &str) -> Result<ProcessStatus, SupervisorError> {
            Ok(*self
                .statuses
                .lock()
                .unwrap()
                .get(program)
                .unwrap_or(&ProcessStatus::Stopped))
        }
    }

    /// Probe that reports ready only for listed programs.
    struct FakeProbe {
        ready: BTreeSet<String>,
    }

    impl HealthProbe for FakeProbe {
        fn ready(&self, node: &ResolvedNode) -> bool {
            self.ready.contains(&node.program())
        }
    }

    fn fast_settings() -> LifecycleSettings {
        LifecycleSettings {
            startup_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
            shutdown_grace: Duration::from_millis(20),
            on_crash: CrashPolicy::Report,
        }
    }

    fn nodes(chain_id: &str, count: usize, first_ordinal: usize) -> Vec<ResolvedNode> {
        (0..count)
            .map(|i| ResolvedNode {
                chain_id: chain_id.to_string(),
                index: i,
                ordinal: first_ordinal + i,
                name: format!("v{i}"),
                hostname: "127.0.0.1".to_string(),
                base_port: 26650 + (first_ordinal + i) as u16 * 10,
                home: format!("/data/{chain_id}/node{i}").into(),
                log_file: format!("/data/{chain_id}/node{i}.log").into(),
            })
            .collect()
    }

    #[test]
    fn test_all_nodes_become_running() {
        let control = FakeControl::default();
        let probe = FakeProbe {
            ready: ["alpha-1-node0", "alpha-1-node1"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let controller = LifecycleController::new(&control, &probe, fast_settings());
        let reports = controller.start_all(&nodes("alpha-1", 2, 0));
        assert!(all_running(&reports));
        assert_eq!(healthy_chains(&reports).len(), 1);
    }

    #[test]
    fn test_unready_node_crashes_and_marks_chain_unhealthy() {
        let control = FakeControl::default();
        let probe = FakeProbe {
            ready: ["alpha-1-node0", "alpha-1-node1", "beta-1-node0"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let controller = LifecycleController::new(&control, &probe, fast_settings());
        let mut cluster = nodes("alpha-1", 2, 0);
        cluster.extend(nodes("beta-1", 2, 2));
        let reports = controller.start_all(&cluster);

        assert!(!all_running(&reports));
        let crashed: Vec<_> = reports
            .iter()
            .filter(|r| r.state == NodeState::Crashed)
            .collect();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].program, "beta-1-node1");

        // the sibling chain stays healthy, the affected one does not
        let healthy = healthy_chains(&reports);
        assert!(healthy.contains("alpha-1"));
        assert!(!healthy.contains("beta-1"));
    }

    #[test]
    fn test_dead_process_detected_before_timeout() {
        let control = FakeControl::default();
        control.set("alpha-1-node0", ProcessStatus::Fatal);
        let probe = FakeProbe { ready: BTreeSet::new() };
        let controller = LifecycleController::new(&control, &probe, fast_settings());

        let batch = nodes("alpha-1", 1, 0);
        let report = controller.wait_ready(&batch[0]);
        assert_eq!(report.state, NodeState::Crashed);
        assert!(report.detail.unwrap().contains("exited"));
    }

    #[test]
    fn test_teardown_abandons_readiness_wait() {
        let control = FakeControl::default();
        let probe = FakeProbe { ready: BTreeSet::new() };
        let mut settings = fast_settings();
        settings.startup_timeout = Duration::from_secs(3600);
        let controller = LifecycleController::new(&control, &probe, settings);
        controller.request_teardown();

        let batch = nodes("alpha-1", 1, 0);
        let start = Instant::now();
        let report = controller.wait_ready(&batch[0]);
        assert_eq!(report.state, NodeState::Stopping);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_graceful_stop() {
        let control = FakeControl::default();
        let probe = FakeProbe { ready: BTreeSet::new() };
        let controller = LifecycleController::new(&control, &probe, fast_settings());
        let reports = controller.stop_all(&nodes("alpha-1", 2, 0));
        assert!(reports.iter().all(|r| r.state == NodeState::Stopped));
        let calls = control.calls.lock().unwrap();
        assert!(calls.contains(&"stop alpha-1-node0".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("kill")));
    }

    #[test]
    fn test_stop_escalates_to_kill() {
        /// Control whose stop never takes effect.
        struct StubbornControl(FakeControl);
        impl ProcessControl for StubbornControl {
            fn start(&self, p: &str) -> Result<(), SupervisorError> {
                self.0.start(p)
            }
            fn stop(&self, p: &str) -> Result<(), SupervisorError> {
                self.0.log(format!("stop {p}"));
                Ok(())
            }
            fn kill(&self, p: &str) -> Result<(), SupervisorError> {
                self.0.kill(p)
            }
            fn status(&self, _p: &str) -> Result<ProcessStatus, SupervisorError> {
                Ok(ProcessStatus::Running)
            }
        }

        let control = StubbornControl(FakeControl::default());
        let probe = FakeProbe { ready: BTreeSet::new() };
        let controller = LifecycleController::new(&control, &probe, fast_settings());
        let reports = controller.stop_all(&nodes("alpha-1", 1, 0));
        assert_eq!(reports[0].state, NodeState::Stopped);
        assert_eq!(reports[0].detail.as_deref(), Some("forcefully terminated"));
        let calls = control.0.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("kill")));
    }
}
