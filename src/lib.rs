//! # Starforge - provisioning utility for multi-chain validator test clusters
//!
//! This library turns one declarative YAML specification into a fully
//! provisioned, running multi-node, multi-chain test cluster on a single
//! host.
//!
//! ## Overview
//!
//! A spec describes chains, their validators and accounts, and optional
//! overlays for genesis and node configuration. Starforge expands that spec
//! into a concrete topology, allocates collision-free ports and home
//! directories, derives all key material, assembles one genesis document per
//! chain, and drives the node (and optional cross-chain relayer) processes
//! through their lifecycle via an external supervisor daemon.
//!
//! ## Architecture
//!
//! The pipeline runs leaves first; each stage consumes the previous one's
//! output:
//!
//! - `expand`: variable interpolation, template composition, validation
//! - `spec`: the typed cluster specification
//! - `merge`: the one deep-merge implementation all overlays go through
//! - `ports`: deterministic port/directory allocation
//! - `keys`: mnemonic generation and key derivation
//! - `genesis`: per-chain genesis assembly and supply reconciliation
//! - `nodeconfig`: per-node config.toml / app.toml / client.toml
//! - `supervisor`: process descriptors and the supervisord control surface
//! - `lifecycle`: node state machine, readiness polling, teardown
//! - `relayer`: relayer configuration from the finalized topology
//! - `orchestrator`: ties the stages together around one data directory
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use starforge::{orchestrator, relayer::RelayerKind};
//! use std::path::Path;
//!
//! let cluster = orchestrator::init_cluster(
//!     Path::new("./data"),
//!     Path::new("./config.yaml"),
//!     26650,
//!     None,
//!     RelayerKind::Hermes,
//!     false,
//! )?;
//! let (reports, supervisord) = orchestrator::start_cluster(&cluster, RelayerKind::Hermes)?;
//! # Ok::<(), color_eyre::eyre::Error>(())
//! ```
//!
//! ## Configuration Format
//!
//! ```yaml
//! alpha-1:
//!   validators:
//!     - name: v1
//!       staked: 1000000stake
//!     - name: v2
//!       staked: 2000000stake
//!   accounts:
//!     - name: relayer
//!       coins: 5000000stake
//!     - name: treasury
//!       coins: 1000000stake
//!       vesting:
//!         duration: 1h
//!   genesis:
//!     app_state:
//!       gov:
//!         voting_params:
//!           voting_period: 10s
//! beta-1:
//!   validators:
//!     - name: v1
//!       staked: 1000000ubeta
//!   accounts:
//!     - name: relayer
//!       coins: 5000000ubeta
//! ```
//!
//! ## Error Handling
//!
//! Each stage has its own `thiserror` taxonomy (`ExpansionError`,
//! `AllocationError`, `AssemblyError`, `SupervisorError`, `LifecycleError`);
//! the orchestrator and binary report them through `color_eyre` with chain
//! and node context attached.

pub mod expand;
pub mod genesis;
pub mod keys;
pub mod lifecycle;
pub mod merge;
pub mod nodeconfig;
pub mod orchestrator;
pub mod ports;
pub mod relayer;
pub mod spec;
pub mod supervisor;
