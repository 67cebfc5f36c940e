use crate::channel::ChannelId;
use crate::persist;
use crate::prelude::*;

/// Errors surfaced by the monitor, the registry and the coordinator.
///
/// See [`Error::is_fatal`] for which of these leave a channel in a state
/// that requires reloading it from its persisted snapshot.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// A monitor is already registered for this channel
    #[error("channel {0} is already watched")]
    DuplicateChannel(ChannelId),
    /// No monitor is registered for this channel
    #[error("channel {0} is not watched")]
    UnknownChannel(ChannelId),
    /// A commitment update did not advance the state sequence by exactly one
    #[error("stale update for channel {channel_id}: expected commitment {expected}, got {got}")]
    StaleUpdate {
        /// channel
        channel_id: ChannelId,
        /// the expected commitment number
        expected: u64,
        /// the commitment number we got
        got: u64,
    },
    /// A replayed update skipped ahead of the latest applied update
    #[error("update sequence gap for channel {channel_id}: expected {expected}, got {got}")]
    SequenceGap {
        /// channel
        channel_id: ChannelId,
        /// the expected update id
        expected: u64,
        /// the update id we got
        got: u64,
    },
    /// An update step was malformed
    #[error("invalid update for channel {channel_id}: {reason}")]
    InvalidUpdate {
        /// channel
        channel_id: ChannelId,
        /// what was wrong
        reason: String,
    },
    /// The channel is closing on-chain and no longer accepts new commitments
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),
    /// Persistence failed and the channel cannot advance until it succeeds
    #[error("persistence failure for channel {channel_id}: {reason}")]
    PersistenceFailure {
        /// channel
        channel_id: ChannelId,
        /// the reason
        reason: String,
    },
    /// A disconnect reached below the retained per-block history
    #[error("reorg to height {height} is beyond retention (earliest retained {earliest_retained})")]
    ReorgBeyondRetention {
        /// the height being disconnected
        height: u32,
        /// the earliest height we can still disconnect
        earliest_retained: u32,
    },
    /// A watched output or txid was not registered with the block filter
    #[error("missing filter registration for {0}")]
    MissingFilterRegistration(String),
    /// A block does not connect to the current tip, or otherwise can't be applied
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    /// The channel hit a fatal error earlier and must be reloaded
    #[error("channel {0} failed and must be reloaded from its persisted snapshot")]
    ChannelFailed(ChannelId),
    /// Persisted monitors exist but were not loaded
    #[error("persisted monitors were not loaded: {0}")]
    NotLoaded(String),
    /// Bad argument or configuration
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A snapshot could not be encoded or decoded
    #[error("serialization: {0}")]
    Serialization(String),
    /// The persistence gateway failed
    #[error("persister: {0}")]
    Persister(#[from] persist::Error),
}

impl Error {
    /// Whether this error leaves the channel (or node, for load errors)
    /// in a state that requires reload from persisted snapshots.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StaleUpdate { .. }
                | Error::SequenceGap { .. }
                | Error::ReorgBeyondRetention { .. }
                | Error::MissingFilterRegistration(_)
                | Error::ChannelFailed(_)
                | Error::NotLoaded(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

macro_rules! error_invalid_block {
    ($($arg:tt)*) => {{
        log::error!("InvalidBlock: {}", format!($($arg)*));
        $crate::error::Error::InvalidBlock(format!($($arg)*))
    }};
}

macro_rules! error_invalid_update {
    ($channel_id:expr, $($arg:tt)*) => {{
        log::error!("InvalidUpdate {}: {}", $channel_id, format!($($arg)*));
        $crate::error::Error::InvalidUpdate { channel_id: $channel_id, reason: format!($($arg)*) }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, Txid};

    #[test]
    fn fatal_classification() {
        let channel_id = ChannelId(OutPoint::new(Txid::all_zeros(), 0));
        assert!(Error::StaleUpdate { channel_id, expected: 2, got: 1 }.is_fatal());
        assert!(Error::ReorgBeyondRetention { height: 1, earliest_retained: 5 }.is_fatal());
        assert!(!Error::DuplicateChannel(channel_id).is_fatal());
        assert!(!Error::PersistenceFailure { channel_id, reason: "x".into() }.is_fatal());
    }

    #[test]
    fn display() {
        let channel_id = ChannelId(OutPoint::new(Txid::all_zeros(), 1));
        let e = Error::UnknownChannel(channel_id);
        assert_eq!(
            e.to_string(),
            "channel 0000000000000000000000000000000000000000000000000000000000000000:1 is not watched"
        );
    }
}
