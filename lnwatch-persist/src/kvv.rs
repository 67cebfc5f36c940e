pub mod memory;
#[cfg(feature = "redb-kvv")]
pub mod redb;

use core::fmt::Debug;
use core::ops::Deref;
use core::str::FromStr;

use lnwatch::channel::ChannelId;
use lnwatch::coordinator::MonitorUpdateId;
use lnwatch::monitor::MonitorUpdate;
use lnwatch::persist::{Error, MonitorSnapshot, Persist, PersistStatus};
use lnwatch::SendSync;
use log::*;
use serde_json::{from_slice, to_vec};

use crate::model::{ArchivedEntry, MonitorEntry};

const MONITOR_PREFIX: &str = "monitor";
const ARCHIVE_PREFIX: &str = "archive";
const SEPARATOR: &str = "/";

/// key-version-value
pub struct KVV(pub String, pub (u64, Vec<u8>));

impl Debug for KVV {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("KVV").field(&self.0).field(&self.1 .0).field(&self.1 .1).finish()
    }
}

impl KVV {
    /// convert to the inner tuple
    pub fn into_inner(self) -> (String, (u64, Vec<u8>)) {
        (self.0, self.1)
    }
}

/// A key-version-value store
pub trait KVVStore: SendSync {
    type Iter: Iterator<Item = KVV>;

    /// Put a key-value pair into the store, at the next version
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
    /// If the key already exists, the version must be greater than the existing version.
    /// The same version may be written again only with the same value.
    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error>;
    /// Atomically put several KVVs into the store
    fn put_batch(&self, kvvs: Vec<KVV>) -> Result<(), Error>;
    /// Get a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error>;
    /// Get the version of a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get_version(&self, key: &str) -> Result<Option<u64>, Error>;
    /// Get all key-value pairs with the given prefix
    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error>;
    /// Delete a key-value pair from the store, leaving a tombstone (an empty value)
    fn delete(&self, key: &str) -> Result<(), Error>;
    /// Clear the database
    fn clear_database(&self) -> Result<(), Error>;
}

/// Adapter for a KVVStore to implement [`Persist`].
///
/// Writes complete before returning.  An older snapshot arriving after a newer
/// one has been stored is superseded and reported as completed.
pub struct KVVPersister<S: KVVStore>(pub S);

impl<S: KVVStore> Deref for KVVPersister<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S: KVVStore> SendSync for KVVPersister<S> {}

impl<S: KVVStore> KVVPersister<S> {
    /// Store a snapshot, treating a newer stored version as success
    pub(crate) fn write_snapshot(&self, snapshot: &MonitorSnapshot) -> Result<(), Error> {
        let key = monitor_key(&snapshot.channel_id);
        let entry = MonitorEntry {
            latest_update_id: snapshot.latest_update_id,
            snapshot: snapshot.bytes.clone(),
        };
        let value = to_vec(&entry).map_err(|e| Error::Internal(e.to_string()))?;
        match self.put_with_version(&key, snapshot.version, value) {
            Err(Error::VersionMismatch) => match self.get_version(&key)? {
                Some(stored) if stored > snapshot.version => {
                    debug!(
                        "{}: version {} superseded by stored {}",
                        snapshot.channel_id, snapshot.version, stored
                    );
                    Ok(())
                }
                _ => Err(Error::VersionMismatch),
            },
            res => res,
        }
    }

    /// Store the first snapshot of a channel
    pub(crate) fn write_new(&self, snapshot: &MonitorSnapshot) -> Result<(), Error> {
        let key = monitor_key(&snapshot.channel_id);
        if let Some((version, value)) = self.get(&key)? {
            if value.is_empty() {
                return Err(Error::AlreadyExists(format!("{} archived", snapshot.channel_id)));
            }
            if version != snapshot.version {
                return Err(Error::AlreadyExists(snapshot.channel_id.to_string()));
            }
        }
        self.write_snapshot(snapshot)
    }

    /// List archived channels
    pub fn list_archived(&self) -> Result<Vec<(ChannelId, ArchivedEntry)>, Error> {
        let prefix = format!("{}{}", ARCHIVE_PREFIX, SEPARATOR);
        let mut res = Vec::new();
        for kvv in self.get_prefix(&prefix)? {
            let (key, (_version, value)) = kvv.into_inner();
            if value.is_empty() {
                continue;
            }
            let channel_id = extract_channel_id(&prefix, &key)?;
            let entry: ArchivedEntry =
                from_slice(&value).map_err(|e| Error::Internal(e.to_string()))?;
            res.push((channel_id, entry));
        }
        Ok(res)
    }

    /// Read one archived channel
    pub fn read_archived(&self, channel_id: &ChannelId) -> Result<ArchivedEntry, Error> {
        let key = make_key(ARCHIVE_PREFIX, channel_id);
        match self.get(&key)? {
            Some((_, value)) if !value.is_empty() =>
                from_slice(&value).map_err(|e| Error::Internal(e.to_string())),
            _ => Err(Error::NotFound(channel_id.to_string())),
        }
    }
}

impl<S: KVVStore> Persist for KVVPersister<S> {
    fn persist_new_channel(
        &self,
        update_id: &MonitorUpdateId,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus {
        match self.write_new(snapshot) {
            Ok(()) => PersistStatus::Completed,
            Err(e) => {
                error!("persist new {:?} failed: {}", update_id, e);
                PersistStatus::Failed(e)
            }
        }
    }

    fn update_persisted_channel(
        &self,
        update_id: &MonitorUpdateId,
        _update: Option<&MonitorUpdate>,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus {
        match self.write_snapshot(snapshot) {
            Ok(()) => PersistStatus::Completed,
            Err(e) => {
                error!("persist {:?} failed: {}", update_id, e);
                PersistStatus::Failed(e)
            }
        }
    }

    fn read_channel_monitors(&self) -> Result<Vec<MonitorSnapshot>, Error> {
        let prefix = format!("{}{}", MONITOR_PREFIX, SEPARATOR);
        let mut res = Vec::new();
        for kvv in self.get_prefix(&prefix)? {
            let (key, (version, value)) = kvv.into_inner();
            if value.is_empty() {
                continue; // ignore tombstones
            }
            let channel_id = extract_channel_id(&prefix, &key)?;
            let entry: MonitorEntry =
                from_slice(&value).map_err(|e| Error::Internal(e.to_string()))?;
            res.push(MonitorSnapshot {
                channel_id,
                latest_update_id: entry.latest_update_id,
                version,
                bytes: entry.snapshot,
            });
        }
        Ok(res)
    }

    fn read_channel_monitor(&self, channel_id: &ChannelId) -> Result<MonitorSnapshot, Error> {
        match self.get(&monitor_key(channel_id))? {
            Some((version, value)) if !value.is_empty() => {
                let entry: MonitorEntry =
                    from_slice(&value).map_err(|e| Error::Internal(e.to_string()))?;
                Ok(MonitorSnapshot {
                    channel_id: *channel_id,
                    latest_update_id: entry.latest_update_id,
                    version,
                    bytes: entry.snapshot,
                })
            }
            _ => Err(Error::NotFound(channel_id.to_string())),
        }
    }

    fn archive_persisted_channel(&self, channel_id: &ChannelId) -> Result<(), Error> {
        let key = monitor_key(channel_id);
        let (version, value) = match self.get(&key)? {
            Some((version, value)) if !value.is_empty() => (version, value),
            _ => return Err(Error::NotFound(channel_id.to_string())),
        };
        let entry: MonitorEntry = from_slice(&value).map_err(|e| Error::Internal(e.to_string()))?;
        let archived = ArchivedEntry {
            latest_update_id: entry.latest_update_id,
            version,
            snapshot: entry.snapshot,
        };
        let archive_key = make_key(ARCHIVE_PREFIX, channel_id);
        let archive_version = self.get_version(&archive_key)?.map(|v| v + 1).unwrap_or(0);
        let archive_value = to_vec(&archived).map_err(|e| Error::Internal(e.to_string()))?;
        info!("archiving {} at version {}", channel_id, version);
        self.put_batch(vec![
            KVV(archive_key, (archive_version, archive_value)),
            KVV(key, (version + 1, Vec::new())),
        ])
    }
}

fn monitor_key(channel_id: &ChannelId) -> String {
    make_key(MONITOR_PREFIX, channel_id)
}

fn make_key(prefix: &str, channel_id: &ChannelId) -> String {
    format!("{}{}{}", prefix, SEPARATOR, channel_id)
}

fn extract_channel_id(prefix: &str, key: &str) -> Result<ChannelId, Error> {
    let suffix = key
        .strip_prefix(prefix)
        .ok_or_else(|| Error::Internal(format!("key {} outside {}", key, prefix)))?;
    ChannelId::from_str(suffix).map_err(|e| Error::Internal(format!("bad key {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryKVVStore;
    use super::*;
    use lnwatch::bitcoin::hashes::Hash;
    use lnwatch::bitcoin::{OutPoint, Txid};
    use lnwatch::coordinator::UpdateOrigin;
    use test_log::test;

    fn channel(n: u8) -> ChannelId {
        ChannelId::new(OutPoint::new(Txid::from_byte_array([n; 32]), n as u32))
    }

    fn snapshot(channel_id: ChannelId, version: u64, latest_update_id: u64) -> MonitorSnapshot {
        MonitorSnapshot { channel_id, latest_update_id, version, bytes: vec![version as u8; 4] }
    }

    fn update_id(channel_id: ChannelId, n: u64) -> MonitorUpdateId {
        MonitorUpdateId { channel_id, origin: UpdateOrigin::OffChain(n) }
    }

    #[test]
    fn store_and_read() {
        let persister = MemoryKVVStore::new();
        let a = channel(1);
        let b = channel(2);
        assert_eq!(
            persister.persist_new_channel(&update_id(a, 0), &snapshot(a, 1, 0)),
            PersistStatus::Completed
        );
        assert_eq!(
            persister.persist_new_channel(&update_id(b, 0), &snapshot(b, 1, 0)),
            PersistStatus::Completed
        );
        assert_eq!(
            persister.update_persisted_channel(&update_id(a, 1), None, &snapshot(a, 2, 1)),
            PersistStatus::Completed
        );
        let monitors = persister.read_channel_monitors().unwrap();
        assert_eq!(monitors, vec![snapshot(a, 2, 1), snapshot(b, 1, 0)]);
        assert_eq!(persister.read_channel_monitor(&b).unwrap(), snapshot(b, 1, 0));
        assert!(matches!(persister.read_channel_monitor(&channel(3)), Err(Error::NotFound(_))));
    }

    #[test]
    fn older_snapshot_is_superseded() {
        let persister = MemoryKVVStore::new();
        let a = channel(1);
        persister.persist_new_channel(&update_id(a, 0), &snapshot(a, 1, 0));
        persister.update_persisted_channel(&update_id(a, 2), None, &snapshot(a, 3, 2));
        // the write for version 2 lands late
        assert_eq!(
            persister.update_persisted_channel(&update_id(a, 1), None, &snapshot(a, 2, 1)),
            PersistStatus::Completed
        );
        assert_eq!(persister.read_channel_monitor(&a).unwrap(), snapshot(a, 3, 2));
    }

    #[test]
    fn conflicting_same_version_fails() {
        let persister = MemoryKVVStore::new();
        let a = channel(1);
        persister.persist_new_channel(&update_id(a, 0), &snapshot(a, 1, 0));
        let mut conflicting = snapshot(a, 1, 0);
        conflicting.bytes = vec![9];
        assert_eq!(
            persister.update_persisted_channel(&update_id(a, 1), None, &conflicting),
            PersistStatus::Failed(Error::VersionMismatch)
        );
        // the same write again is idempotent
        assert_eq!(
            persister.persist_new_channel(&update_id(a, 0), &snapshot(a, 1, 0)),
            PersistStatus::Completed
        );
    }

    #[test]
    fn archive_moves_the_entry() {
        let persister = MemoryKVVStore::new();
        let a = channel(1);
        persister.persist_new_channel(&update_id(a, 0), &snapshot(a, 1, 0));
        persister.update_persisted_channel(&update_id(a, 4), None, &snapshot(a, 5, 4));
        persister.archive_persisted_channel(&a).unwrap();

        assert!(persister.read_channel_monitors().unwrap().is_empty());
        let archived = persister.read_archived(&a).unwrap();
        assert_eq!(archived.latest_update_id, 4);
        assert_eq!(archived.version, 5);
        assert_eq!(persister.list_archived().unwrap().len(), 1);

        assert!(matches!(persister.archive_persisted_channel(&a), Err(Error::NotFound(_))));
        assert!(matches!(
            persister.persist_new_channel(&update_id(a, 0), &snapshot(a, 1, 0)),
            PersistStatus::Failed(Error::AlreadyExists(_))
        ));
    }
}
