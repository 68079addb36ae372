//! Network namespace lab
//!
//! This crate instantiates [`topology`] descriptors on Linux network
//! namespaces with veth pairs and tc qdiscs, manages the session lifecycle
//! (sequential allocation, rollback on failure, idempotent teardown), and
//! runs diagnostics against the live network: ping sweeps, UDP bandwidth
//! tests, port-number validation, and multiplexed per-node process
//! monitoring.
//!
//! The emulation mechanics sit behind the [`engine::Engine`] trait, so the
//! session and diagnostic layers are testable without CAP_NET_ADMIN.

pub mod backend;
pub mod cgroup;
pub mod diag;
pub mod engine;
pub mod netns;
pub mod qdisc;
pub mod session;
pub mod veth;

#[cfg(test)]
pub(crate) mod mock;

// Re-export commonly used types
pub use backend::NetnsEngine;
pub use diag::{Monitor, MonitorEvent, PingReport};
pub use engine::{CmdOutput, Engine, EngineError};
pub use session::{Session, SessionError, SessionPolicy, TeardownReport};
pub use topology::{Topology, TopologyBuilder};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
