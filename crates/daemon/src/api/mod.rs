/// Status API for the bitmesh daemon
///
/// Read-only HTTP endpoints over the snapshot the node publishes every
/// second: wallet, circuits and link status.

pub mod handlers;
pub mod responses;
pub mod server;

pub use server::ApiServer;
pub use responses::*;
