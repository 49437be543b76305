//! Background tasks for the media node.

pub mod pub_reaper;
pub mod stream_cleanup;

pub use pub_reaper::start_pub_reaper;
pub use stream_cleanup::run_stream_cleanup;
