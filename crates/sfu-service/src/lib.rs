//! Conclave media node (`sfu`) library.
//!
//! A media node accepts publishers on request from signaling nodes, ingests
//! their audio and video over WebRTC, and tells the signaling nodes when a
//! stream goes away on its own.
//!
//! ```text
//! biz ──publish/unpublish RPC──> rpc_handler ──> rtc::Pub (per stream)
//!                                                    │
//!                        pub_reaper ──reap dead──> rtc::PubRegistry
//!                                                    │ cleanup channel
//!                                       stream_cleanup ──sfu-stream-remove──> biz
//! ```
//!
//! The node's reported load is the number of hosted publishers.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod context;
pub mod errors;
pub mod observability;
pub mod rpc_handler;
pub mod rtc;
pub mod tasks;
