//! Background tasks for the signaling node.
//!
//! # Tasks
//!
//! - `room_reconciler` - Evicts local peers whose presence no longer points
//!   at a live signaling node, and prunes empty rooms

pub mod room_reconciler;

pub use room_reconciler::{check_rooms_once, start_room_reconciler};
