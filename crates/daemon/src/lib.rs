/// bitmesh daemon library
///
/// The status API served next to the node.

pub mod api;

pub use api::ApiServer;
