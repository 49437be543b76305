//! Cluster coordination layer shared by every Conclave node type.
//!
//! Both signaling nodes (`biz`) and media nodes (`sfu`) use this crate to:
//!
//! - register themselves in the coordination store ([`registry`])
//! - discover the other nodes of the cluster ([`discovery`])
//! - talk to them through per-node RPC channels and broadcast topics ([`bus`])
//! - keep one RPC handle per live node and subscribe to the right topics
//!   ([`coordinator`])
//!
//! # Architecture
//!
//! ```text
//! NodeStore (memory | redis) <── NodeRegistry (own record + keepalive)
//!      │
//!      └── ServiceWatcher (poll + diff) ──Up/Down──> ClusterCoordinator
//!                                                     ├── node id -> Requestor
//!                                                     └── node id -> subscription task
//! MessageBus (memory | redis) <── Requestor / Broadcaster / serve()
//! ```
//!
//! The store and bus are traits so that tests and single-process deployments
//! run on the in-memory implementations while clustered deployments use Redis.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Module for message bus (RPC + broadcast) abstractions
pub mod bus;

/// Module for shared cluster configuration
pub mod config;

/// Module for the discovery-driven cluster coordinator
pub mod coordinator;

/// Module for service discovery
pub mod discovery;

/// Module for common error types
pub mod error;

/// Module for typed RPC payloads and event names
pub mod protocol;

/// Module for local node registration
pub mod registry;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for coordination store abstractions
pub mod store;

/// Module for choosing the in-memory or Redis substrate
pub mod substrate;

/// Module for common data types
pub mod types;
