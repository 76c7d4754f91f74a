#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Client connections to the services the sequencing node depends on.

/// L1 execution layer client connection
pub mod execution;

/// Execution engine ("core") client connection
pub mod engine;

/// Broadcast feed WebSocket client
pub mod feed;

/// JSON-RPC client of the node transactions are forwarded to
pub mod forwarder;

/// Shared lock services used for sequencer leader election
pub mod lock;

/// Minimal JSON-RPC over HTTP helpers
pub mod rpc;
