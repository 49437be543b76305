//! Conclave signaling node (`biz`) library.
//!
//! A signaling node terminates client websocket connections, keeps the rooms
//! its clients joined, and relays room events:
//!
//! - to local peers directly
//! - to peers on other signaling nodes through its broadcast topic
//!
//! Presence (who is in which room, which node hosts them, which media node
//! carries each stream) lives in the presence service (`islb`), reached over
//! the cluster bus. Media is negotiated with the least-loaded media node
//! (`sfu`).
//!
//! # Architecture
//!
//! ```text
//! client ──ws──> signaling::ws ──> signaling::handlers ──> islb / sfu RPC
//!                                          │
//!                                          └──> notify (local peers + broadcast)
//! ClusterCoordinator ──inbound broadcasts──> broadcast consumer ──> notify
//! ws close ──> cleanup::disconnect_peer
//! room reconciler ──getBizInfo per peer──> cleanup::purge_peer
//! ```
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`context`] - Shared node state
//! - [`session`] - Rooms and peers
//! - [`signaling`] - Client frame protocol and websocket adapter
//! - [`tasks`] - Background room reconciliation

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod broadcast;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod errors;
pub mod islb;
pub mod notify;
pub mod observability;
pub mod session;
pub mod signaling;
pub mod tasks;
