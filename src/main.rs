use clap::{Parser, Subcommand};
use color_eyre::Result;
use env_logger::Env;
use log::info;
use std::path::PathBuf;

use starforge::orchestrator;
use starforge::ports::DEFAULT_BASE_PORT;
use starforge::relayer::RelayerKind;

/// Provisioning utility for ephemeral multi-chain validator test clusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expand the spec and write all chain artifacts into the data directory
    Init {
        /// Path to the root data directory
        #[arg(short, long, default_value = "./data")]
        data: PathBuf,

        /// Path to the cluster specification YAML file
        #[arg(short, long, default_value = "./config.yaml")]
        config: PathBuf,

        /// Base port; service ports of every node are derived from it
        #[arg(short, long, default_value_t = DEFAULT_BASE_PORT)]
        base_port: u16,

        /// Optional KEY=VALUE override file for ${VAR} placeholders
        #[arg(long)]
        dotenv: Option<PathBuf>,

        /// Relayer implementation to generate configuration for
        #[arg(long, value_enum, default_value_t = RelayerKind::Hermes)]
        relayer: RelayerKind,

        /// Remove an existing data directory instead of refusing to run
        #[arg(long)]
        force: bool,
    },

    /// Start a previously initialized cluster and wait for it
    Start {
        #[arg(short, long, default_value = "./data")]
        data: PathBuf,
    },

    /// Init and start in one go
    Serve {
        #[arg(short, long, default_value = "./data")]
        data: PathBuf,

        #[arg(short, long, default_value = "./config.yaml")]
        config: PathBuf,

        #[arg(short, long, default_value_t = DEFAULT_BASE_PORT)]
        base_port: u16,

        #[arg(long)]
        dotenv: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = RelayerKind::Hermes)]
        relayer: RelayerKind,

        #[arg(long)]
        force: bool,
    },

    /// Stop all processes of a running cluster
    Down {
        #[arg(short, long, default_value = "./data")]
        data: PathBuf,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match Args::parse().command {
        Command::Init {
            data,
            config,
            base_port,
            dotenv,
            relayer,
            force,
        } => {
            orchestrator::init_cluster(
                &data,
                &config,
                base_port,
                dotenv.as_deref(),
                relayer,
                force,
            )?;
            info!("run `starforge start --data {}` to launch it", data.display());
        }
        Command::Start { data } => {
            let (cluster, relayer) = orchestrator::load_cluster(&data)?;
            run(&cluster, relayer)?;
        }
        Command::Serve {
            data,
            config,
            base_port,
            dotenv,
            relayer,
            force,
        } => {
            let cluster = orchestrator::init_cluster(
                &data,
                &config,
                base_port,
                dotenv.as_deref(),
                relayer,
                force,
            )?;
            run(&cluster, relayer)?;
        }
        Command::Down { data } => {
            orchestrator::down_cluster(&data)?;
        }
    }
    Ok(())
}

/// Bring the cluster up, then block on the supervisor daemon.
fn run(cluster: &orchestrator::Cluster, relayer: RelayerKind) -> Result<()> {
    let (reports, mut supervisord) = orchestrator::start_cluster(cluster, relayer)?;
    let running = reports
        .iter()
        .filter(|r| r.state == starforge::lifecycle::NodeState::Running)
        .count();
    info!("{running}/{} nodes running", reports.len());
    let status = supervisord.wait()?;
    info!("supervisor exited with {status}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let args = Args::parse_from(["starforge", "init", "--config", "cluster.yaml"]);
        match args.command {
            Command::Init {
                config,
                base_port,
                force,
                ..
            } => {
                assert_eq!(config, PathBuf::from("cluster.yaml"));
                assert_eq!(base_port, DEFAULT_BASE_PORT);
                assert!(!force);
            }
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn test_serve_args() {
        let args = Args::parse_from([
            "starforge",
            "serve",
            "--data",
            "/tmp/cluster",
            "--base-port",
            "27000",
            "--relayer",
            "rly",
            "--force",
        ]);
        match args.command {
            Command::Serve {
                data,
                base_port,
                relayer,
                force,
                ..
            } => {
                assert_eq!(data, PathBuf::from("/tmp/cluster"));
                assert_eq!(base_port, 27000);
                assert_eq!(relayer, RelayerKind::Rly);
                assert!(force);
            }
            _ => panic!("expected serve"),
        }
    }
}
