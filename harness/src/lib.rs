//! Process-level harness for multi-node regtest clusters of the Divi daemon.
//!
//! A [`Cluster`] owns a set of daemon processes addressed by index. Scenario
//! programs start nodes, connect them, drive the logical clock and wait for
//! relay to converge before asserting on node state.

pub mod assert;
pub mod cluster;
pub mod config;
pub mod convergence;
pub mod error;
pub mod masternode;
pub mod mocktime;
pub mod ports;
pub mod process;
pub mod rpc;
pub mod scenario;
pub mod topology;

pub use cluster::Cluster;
pub use config::{HarnessConfig, RpcCredentials};
pub use convergence::Poll;
pub use error::{HarnessError, HarnessResult};
pub use masternode::{
    wait_for_mnsync, ActivationPhase, ActivationPolicy, BroadcastOrigin, MasternodeActivation,
    MasternodeConfigLine,
};
pub use ports::{NodePorts, PortAllocator};
pub use process::NodeHandle;
pub use rpc::RpcClient;
pub use scenario::{ScenarioOptions, Skip};
