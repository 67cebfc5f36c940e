//! Persistence gateways for [`lnwatch`] channel monitors.
//!
//! [`kvv::KVVPersister`] stores monitor snapshots synchronously in a
//! key-version-value store.  [`threaded::ThreadedPersister`] moves the writes
//! to a worker thread and acknowledges them through the coordinator's
//! completion channel.

pub mod kvv;
pub mod model;
pub mod threaded;

pub use kvv::{KVVPersister, KVVStore, KVV};
pub use threaded::ThreadedPersister;
