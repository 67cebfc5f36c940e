use crate::channel::ChannelId;
use crate::coordinator::MonitorUpdateId;
use crate::monitor::MonitorUpdate;
use crate::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
/// Error returned by persister
pub enum Error {
    /// Persister is temporarily unavailable, might work later
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Inconsistent state, needed resource is missing
    #[error("not found: {0}")]
    NotFound(String),
    /// Inconsistent state, resource already present
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// A newer version of the entry is already stored
    #[error("version mismatch")]
    VersionMismatch,
    /// Non-recoverable internal error
    #[error("internal: {0}")]
    Internal(String),
}

/// Result of a persistence request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistStatus {
    /// Durably stored before returning
    Completed,
    /// Will complete later, reported through the completion channel
    /// (see [`crate::coordinator::completion_channel`])
    InProgress,
    /// Failed.  The coordinator will retry.
    Failed(Error),
}

/// A serialized channel monitor, as handed to the persister
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorSnapshot {
    /// The channel
    pub channel_id: ChannelId,
    /// The latest off-chain update applied to the monitor
    pub latest_update_id: u64,
    /// Increases with every snapshot taken of this monitor, so that an older
    /// snapshot never replaces a newer one
    pub version: u64,
    /// The encoded monitor
    pub bytes: Vec<u8>,
}

/// Persister of channel monitors
///
/// The registry calls the relevant methods here as needed.
///
/// There are two types of persisters:
///
/// - Synchronous persisters, which store durably before returning
/// [`PersistStatus::Completed`].
///
/// - Asynchronous persisters, which return [`PersistStatus::InProgress`] and
/// later send a [`crate::coordinator::PersistCompletion`] with the same
/// [`MonitorUpdateId`].  Completions may arrive in any order.
///
/// Every write carries a full snapshot, so storing the snapshot alone is
/// sufficient.  The update is provided for persisters that prefer to log
/// updates between full snapshots.
pub trait Persist: SendSync {
    /// Store the first snapshot of a newly watched channel
    fn persist_new_channel(
        &self,
        update_id: &MonitorUpdateId,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus;

    /// Store a new snapshot.
    ///
    /// `update` is `None` when the change was caused by a block rather than an
    /// off-chain update.
    fn update_persisted_channel(
        &self,
        update_id: &MonitorUpdateId,
        update: Option<&MonitorUpdate>,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus;

    /// Read all stored monitors
    fn read_channel_monitors(&self) -> Result<Vec<MonitorSnapshot>, Error>;

    /// Read one stored monitor
    fn read_channel_monitor(&self, channel_id: &ChannelId) -> Result<MonitorSnapshot, Error> {
        self.read_channel_monitors()?
            .into_iter()
            .find(|s| s.channel_id == *channel_id)
            .ok_or_else(|| Error::NotFound(channel_id.to_string()))
    }

    /// Move a fully resolved channel out of the active set
    fn archive_persisted_channel(&self, channel_id: &ChannelId) -> Result<(), Error>;
}

/// A null persister for testing
pub struct DummyPersister;

impl SendSync for DummyPersister {}

#[allow(unused_variables)]
impl Persist for DummyPersister {
    fn persist_new_channel(
        &self,
        update_id: &MonitorUpdateId,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus {
        PersistStatus::Completed
    }

    fn update_persisted_channel(
        &self,
        update_id: &MonitorUpdateId,
        update: Option<&MonitorUpdate>,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus {
        PersistStatus::Completed
    }

    fn read_channel_monitors(&self) -> Result<Vec<MonitorSnapshot>, Error> {
        Ok(Vec::new())
    }

    fn archive_persisted_channel(&self, channel_id: &ChannelId) -> Result<(), Error> {
        Ok(())
    }
}
