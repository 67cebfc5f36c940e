#![crate_name = "lnwatch"]

//! The on-chain watch and durability core of a Lightning node.
//!
//! See [`chain::tracker::ChainTracker`] for the entry point. It owns one
//! [`monitor::ChannelMonitor`] per channel, feeds them blocks, and gates
//! channel progress on persistence through [`coordinator::UpdateCoordinator`].

#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

#[macro_use]
extern crate alloc;

pub use bitcoin;

/// Various utilities
#[macro_use]
pub mod util;
/// Errors
#[macro_use]
pub mod error;
/// Chain tracking, filter registration and capability interfaces
pub mod chain;
/// Channel identity and off-chain state types
pub mod channel;
/// Configuration
pub mod config;
/// Persistence gating of channel progress
pub mod coordinator;
/// Host-facing events and the event queue
pub mod events;
/// Channel on-chain monitor
pub mod monitor;
/// Persistence gateway contract
pub mod persist;

pub use alloc::sync::Arc;

pub use error::Error;

/// Common imports
pub mod prelude {
    pub use alloc::{boxed::Box, string::String, vec, vec::Vec};

    pub use hashbrown::HashMap as Map;
    pub use hashbrown::HashSet as UnorderedSet;

    pub use alloc::collections::BTreeMap as OrderedMap;
    pub use alloc::collections::BTreeSet as OrderedSet;

    pub use alloc::borrow::ToOwned;
    pub use alloc::string::ToString;

    pub use std::sync::{Mutex, MutexGuard};

    /// Convenience trait for Send + Sync
    pub trait SendSync: Send + Sync {}
}

pub use prelude::SendSync;
