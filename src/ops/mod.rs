//! Ops commands driving a running coordinator over HTTP

pub mod client;
pub mod leader;
pub mod volume;

pub use client::ControlClient;
pub use leader::{abdicate_and_wait, AbdicationReport};
pub use volume::cleanup_volume;
