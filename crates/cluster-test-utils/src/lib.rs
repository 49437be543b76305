//! # Cluster Test Utilities
//!
//! Mocks and fixtures for exercising signaling and media nodes against an
//! in-memory coordination substrate, without Redis or a real WebRTC stack.
//!
//! ## Modules
//!
//! - `mock_islb` - Stateful presence service served on the bus
//! - `mock_peer` - Recording client transport for signaling tests
//! - `mock_transport` - Scripted media transport for publisher tests
//! - `fixtures` - Cluster, signaling node and media node harnesses
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cluster_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let cluster = TestCluster::new();
//!     let islb = MockIslb::builder().start(&cluster.substrate).await;
//!     let biz = cluster.biz_node("biz-1").await;
//!     biz.sync().await;
//!
//!     let (peer, transport) = MockPeer::connect("alice");
//!     // Drive handlers with biz.ctx ...
//! }
//! ```

pub mod fixtures;
pub mod mock_islb;
pub mod mock_peer;
pub mod mock_transport;

pub use fixtures::*;
pub use mock_islb::*;
pub use mock_peer::*;
pub use mock_transport::*;
