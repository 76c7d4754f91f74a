#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Keel sequencing node
//!
//! The node is responsible for:
//! - Reading delayed messages and confirmed batches from the L1 inbox
//! - Batching transactions and submitting them to L1 in one of four modes
//! - Electing a single active sequencer among redundant replicas
//! - Reporting liveness and readiness to load balancers

/// The startup orchestrator and the root event loop.
mod node;
pub use node::{Node, NodeError};

/// The node configuration.
mod config;
pub use config::RuntimeConfig;

/// Handles shared by the pipeline stages.
mod context;

/// The inbox reader, responsible for following delayed messages and confirmed batches on L1.
pub mod inbox_reader;

/// The batcher, responsible for turning accepted transactions into L1 submissions.
pub mod batcher;

/// Leader election between sequencer replicas.
pub mod lockout;

/// Health checks and the health HTTP server.
pub mod health;

/// The metrics for the node.
mod metrics;

#[cfg(test)]
mod testing;
