//! Process supervisor interface.
//!
//! The orchestrator never signals node processes itself: it emits
//! declarative `[program:*]` sections for a supervisord-compatible daemon
//! and drives everything through the `supervisorctl` control surface. The
//! daemon is the single source of truth for process liveness; this module
//! only queries it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use log::debug;

use crate::ports::ResolvedNode;
use crate::spec::ChainSpec;

/// File name of the root supervisor configuration inside the data dir.
pub const SUPERVISOR_CONFIG_FILE: &str = "supervisord.ini";

/// File name of the per-chain program include.
pub const TASKS_FILE: &str = "tasks.ini";

/// Program name registered for the relayer process.
pub const RELAYER_PROGRAM: &str = "relayer";

/// Declarative description of one supervised process.
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub name: String,
    pub command: String,
    /// Working directory; may use supervisord's `%(here)s` expansion.
    pub directory: String,
    pub environment: BTreeMap<String, String>,
    pub stdout_logfile: String,
    pub autostart: bool,
    /// Whether the supervisor restarts the process after an unexpected exit.
    pub autorestart: bool,
    pub startsecs: u32,
}

impl ProcessDescriptor {
    /// Descriptor for a chain node; paths are relative to the chain's
    /// `tasks.ini` so node directories stay relocatable.
    pub fn for_node(chain: &ChainSpec, node: &ResolvedNode, autorestart: bool) -> Self {
        let flags = [chain.start_flags.as_deref(), chain.cmd_flags.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        let command = if flags.is_empty() {
            format!("{} start --home .", chain.cmd)
        } else {
            format!("{} start --home . {}", chain.cmd, flags)
        };
        ProcessDescriptor {
            name: node.program(),
            command,
            directory: format!("%(here)s/node{}", node.index),
            environment: BTreeMap::new(),
            stdout_logfile: format!("%(here)s/node{}.log", node.index),
            autostart: false,
            autorestart,
            startsecs: 3,
        }
    }

    /// Ini key/value pairs for this process.
    pub fn ini_section(&self) -> (String, BTreeMap<String, String>) {
        let mut options = BTreeMap::new();
        options.insert("command".to_string(), self.command.clone());
        options.insert("directory".to_string(), self.directory.clone());
        options.insert("autostart".to_string(), self.autostart.to_string());
        options.insert("autorestart".to_string(), self.autorestart.to_string());
        options.insert("redirect_stderr".to_string(), "true".to_string());
        options.insert("startsecs".to_string(), self.startsecs.to_string());
        options.insert("stdout_logfile".to_string(), self.stdout_logfile.clone());
        if !self.environment.is_empty() {
            let env = self
                .environment
                .iter()
                .map(|(k, v)| format!("{k}=\"{v}\""))
                .collect::<Vec<_>>()
                .join(",");
            options.insert("environment".to_string(), env);
        }
        (format!("program:{}", self.name), options)
    }
}

/// Render ini sections in the order given.
pub fn render_ini(sections: &[(String, BTreeMap<String, String>)]) -> String {
    let mut out = String::new();
    for (section, options) in sections {
        out.push_str(&format!("[{section}]\n"));
        for (key, value) in options {
            out.push_str(&format!("{key} = {value}\n"));
        }
        out.push('\n');
    }
    out
}

/// Per-chain `tasks.ini` listing that chain's node programs.
pub fn chain_tasks_ini(descriptors: &[ProcessDescriptor]) -> String {
    let sections: Vec<_> = descriptors.iter().map(ProcessDescriptor::ini_section).collect();
    render_ini(&sections)
}

/// Root supervisord configuration: daemon settings, control socket and the
/// per-chain includes, plus the relayer program when one is registered.
pub fn root_ini(chain_ids: &[String], relayer: Option<&ProcessDescriptor>) -> String {
    let mut sections: Vec<(String, BTreeMap<String, String>)> = Vec::new();

    let includes = chain_ids
        .iter()
        .map(|id| format!("%(here)s/{id}/{TASKS_FILE}"))
        .collect::<Vec<_>>()
        .join(" ");
    sections.push((
        "include".to_string(),
        BTreeMap::from([("files".to_string(), includes)]),
    ));
    sections.push((
        "supervisord".to_string(),
        BTreeMap::from([
            ("pidfile".to_string(), "%(here)s/supervisord.pid".to_string()),
            ("nodaemon".to_string(), "true".to_string()),
            ("logfile".to_string(), "/dev/null".to_string()),
            ("logfile_maxbytes".to_string(), "0".to_string()),
            ("strip_ansi".to_string(), "true".to_string()),
        ]),
    ));
    sections.push((
        "rpcinterface:supervisor".to_string(),
        BTreeMap::from([(
            "supervisor.rpcinterface_factory".to_string(),
            "supervisor.rpcinterface:make_main_rpcinterface".to_string(),
        )]),
    ));
    sections.push((
        "unix_http_server".to_string(),
        BTreeMap::from([("file".to_string(), "%(here)s/supervisor.sock".to_string())]),
    ));
    sections.push((
        "supervisorctl".to_string(),
        BTreeMap::from([(
            "serverurl".to_string(),
            "unix://%(here)s/supervisor.sock".to_string(),
        )]),
    ));
    if let Some(descriptor) = relayer {
        sections.push(descriptor.ini_section());
    }
    render_ini(&sections)
}

/// Process state as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessStatus {
    /// Terminal failure states.
    pub fn is_dead(self) -> bool {
        matches!(self, ProcessStatus::Exited | ProcessStatus::Fatal)
    }
}

impl FromStr for ProcessStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "STOPPED" => ProcessStatus::Stopped,
            "STARTING" => ProcessStatus::Starting,
            "RUNNING" => ProcessStatus::Running,
            "BACKOFF" => ProcessStatus::Backoff,
            "STOPPING" => ProcessStatus::Stopping,
            "EXITED" => ProcessStatus::Exited,
            "FATAL" => ProcessStatus::Fatal,
            _ => ProcessStatus::Unknown,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisorctl {action} {program} failed: {detail}")]
    Control {
        action: String,
        program: String,
        detail: String,
    },
    #[error("unparseable supervisor status line: {0}")]
    Status(String),
    #[error("failed to invoke supervisor tooling")]
    Io(#[from] std::io::Error),
}

/// Narrow control interface the lifecycle controller drives; mockable in
/// tests.
pub trait ProcessControl {
    fn start(&self, program: &str) -> Result<(), SupervisorError>;
    fn stop(&self, program: &str) -> Result<(), SupervisorError>;
    /// Forceful termination, used after the graceful grace period.
    fn kill(&self, program: &str) -> Result<(), SupervisorError>;
    fn status(&self, program: &str) -> Result<ProcessStatus, SupervisorError>;
}

/// supervisord driven through the `supervisorctl` binary.
#[derive(Debug, Clone)]
pub struct Supervisord {
    config_file: PathBuf,
}

impl Supervisord {
    pub fn new(data_dir: &Path) -> Self {
        Supervisord {
            config_file: data_dir.join(SUPERVISOR_CONFIG_FILE),
        }
    }

    /// Launch the supervisor daemon itself; the caller owns the child.
    pub fn launch(&self) -> Result<std::process::Child, SupervisorError> {
        debug!("launching supervisord with {}", self.config_file.display());
        Ok(Command::new("supervisord")
            .arg("-c")
            .arg(&self.config_file)
            .spawn()?)
    }

    /// Re-read program definitions after an ini change.
    pub fn update(&self) -> Result<(), SupervisorError> {
        self.ctl(&["update"]).map(drop)
    }

    pub fn shutdown(&self) -> Result<(), SupervisorError> {
        self.ctl(&["shutdown"]).map(drop)
    }

    fn ctl(&self, args: &[&str]) -> Result<String, SupervisorError> {
        let output = Command::new("supervisorctl")
            .arg("-c")
            .arg(&self.config_file)
            .args(args)
            .output()?;
        // supervisorctl exits non-zero for e.g. `status` of stopped
        // programs, so the caller inspects the output instead
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("supervisorctl {args:?}: {}", stdout.trim_end());
        Ok(stdout)
    }
}

impl ProcessControl for Supervisord {
    fn start(&self, program: &str) -> Result<(), SupervisorError> {
        let out = self.ctl(&["start", program])?;
        if out.contains("ERROR") {
            return Err(SupervisorError::Control {
                action: "start".to_string(),
                program: program.to_string(),
                detail: out.trim().to_string(),
            });
        }
        Ok(())
    }

    fn stop(&self, program: &str) -> Result<(), SupervisorError> {
        let out = self.ctl(&["stop", program])?;
        if out.contains("ERROR") && !out.contains("not running") {
            return Err(SupervisorError::Control {
                action: "stop".to_string(),
                program: program.to_string(),
                detail: out.trim().to_string(),
            });
        }
        Ok(())
    }

    fn kill(&self, program: &str) -> Result<(), SupervisorError> {
        self.ctl(&["signal", "SIGKILL", program]).map(drop)
    }

    fn status(&self, program: &str) -> Result<ProcessStatus, SupervisorError> {
        let out = self.ctl(&["status", program])?;
        parse_status_line(&out)
    }
}

/// Parse one `supervisorctl status` line, e.g.
/// `alpha-1-node0   RUNNING   pid 4242, uptime 0:00:12`.
pub fn parse_status_line(line: &str) -> Result<ProcessStatus, SupervisorError> {
    let mut fields = line.split_whitespace();
    let _name = fields
        .next()
        .ok_or_else(|| SupervisorError::Status(line.to_string()))?;
    let state = fields
        .next()
        .ok_or_else(|| SupervisorError::Status(line.to_string()))?;
    Ok(state.parse().unwrap_or(ProcessStatus::Unknown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSettings;
    use crate::ports::allocate;
    use crate::spec::ClusterSpec;

    fn chain() -> (ChainSpec, Vec<ResolvedNode>) {
        let mut chain: ChainSpec = serde_yaml::from_str(
            "cmd: demod\nstart-flags: --trace\nvalidators:\n  - name: v1\n    staked: 100stake\n  - name: v2\n    staked: 100stake\n",
        )
        .unwrap();
        chain.id = "alpha-1".to_string();
        let spec = ClusterSpec {
            chains: vec![chain.clone()],
            relayer: serde_json::Value::Null,
            lifecycle: LifecycleSettings::default(),
        };
        let nodes = allocate(&spec, Path::new("/data"), 26650).unwrap();
        (chain, nodes["alpha-1"].clone())
    }

    #[test]
    fn test_node_descriptor() {
        let (chain, nodes) = chain();
        let descriptor = ProcessDescriptor::for_node(&chain, &nodes[1], false);
        assert_eq!(descriptor.name, "alpha-1-node1");
        assert_eq!(descriptor.command, "demod start --home . --trace");
        assert_eq!(descriptor.directory, "%(here)s/node1");
        assert!(!descriptor.autostart);
    }

    #[test]
    fn test_tasks_ini_rendering() {
        let (chain, nodes) = chain();
        let descriptors: Vec<_> = nodes
            .iter()
            .map(|n| ProcessDescriptor::for_node(&chain, n, true))
            .collect();
        let ini = chain_tasks_ini(&descriptors);
        assert!(ini.contains("[program:alpha-1-node0]"));
        assert!(ini.contains("[program:alpha-1-node1]"));
        assert!(ini.contains("autorestart = true"));
        assert!(ini.contains("stdout_logfile = %(here)s/node0.log"));
    }

    #[test]
    fn test_root_ini_includes_chains_and_relayer() {
        let relayer = ProcessDescriptor {
            name: RELAYER_PROGRAM.to_string(),
            command: "hermes --config relayer.toml start".to_string(),
            directory: "%(here)s".to_string(),
            environment: BTreeMap::new(),
            stdout_logfile: "%(here)s/relayer.log".to_string(),
            autostart: false,
            autorestart: true,
            startsecs: 3,
        };
        let ini = root_ini(
            &["alpha-1".to_string(), "beta-1".to_string()],
            Some(&relayer),
        );
        assert!(ini.contains("files = %(here)s/alpha-1/tasks.ini %(here)s/beta-1/tasks.ini"));
        assert!(ini.contains("[unix_http_server]"));
        assert!(ini.contains("[program:relayer]"));
    }

    #[test]
    fn test_environment_rendering() {
        let mut descriptor = ProcessDescriptor {
            name: "x".to_string(),
            command: "x".to_string(),
            directory: ".".to_string(),
            environment: BTreeMap::new(),
            stdout_logfile: "x.log".to_string(),
            autostart: true,
            autorestart: false,
            startsecs: 3,
        };
        descriptor
            .environment
            .insert("CHAIN_HOME".to_string(), "/srv/data".to_string());
        let (_, options) = descriptor.ini_section();
        assert_eq!(options["environment"], "CHAIN_HOME=\"/srv/data\"");
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            parse_status_line("alpha-1-node0  RUNNING   pid 4242, uptime 0:00:12").unwrap(),
            ProcessStatus::Running
        );
        assert_eq!(
            parse_status_line("alpha-1-node0  FATAL  Exited too quickly").unwrap(),
            ProcessStatus::Fatal
        );
        assert_eq!(
            parse_status_line("relayer: ERROR (no such process)").unwrap(),
            ProcessStatus::Unknown
        );
        assert!(parse_status_line("").is_err());
    }
}
