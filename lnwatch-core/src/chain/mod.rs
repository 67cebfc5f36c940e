/// Capabilities supplied by the host
pub mod interface;
/// The monitor registry
pub mod tracker;
