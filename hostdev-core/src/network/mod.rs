//! Host networking for bridge ports.

pub mod bridge;
mod link;
pub mod netns;

pub use link::{bridge_exists, IpLinkManager, LinkManager};
