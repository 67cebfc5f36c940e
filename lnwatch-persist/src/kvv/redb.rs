use super::{KVVPersister, KVVStore, KVV};
use lnwatch::persist::Error;
use lnwatch::SendSync;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tracing::*;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

/// A key-version-value store backed by redb
pub struct RedbKVVStore {
    db: Database,
    // current version of each key, so versioning can be enforced without a read.
    // there is one key per channel, so this stays small.
    versions: Mutex<BTreeMap<String, u64>>,
}

impl SendSync for RedbKVVStore {}

fn internal<E: Display>(e: E) -> Error {
    error!("redb: {}", e);
    Error::Internal(e.to_string())
}

impl RedbKVVStore {
    /// Open or create a store in the directory `path`, wrapped in a persister
    pub fn new<P: AsRef<Path>>(path: P) -> Result<KVVPersister<Self>, Error> {
        Ok(KVVPersister(Self::new_store(path)?))
    }

    /// Open or create a store in the directory `path`
    pub fn new_store<P: AsRef<Path>>(path: P) -> Result<RedbKVVStore, Error> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir(path).map_err(internal)?;
        }
        if !path.is_dir() {
            return Err(Error::Internal(format!("{} is not a directory", path.display())));
        }
        let mut db = Database::create(path.join("redb")).map_err(internal)?;
        if !db.check_integrity().map_err(internal)? {
            warn!("database at {} was repaired", path.display());
        }
        {
            // create the table if it doesn't exist
            let tx = db.begin_write().map_err(internal)?;
            tx.open_table(TABLE).map_err(internal)?;
            tx.commit().map_err(internal)?;
        }

        let mut versions = BTreeMap::new();
        {
            let tx = db.begin_read().map_err(internal)?;
            let table = tx.open_table(TABLE).map_err(internal)?;
            for item in table.iter().map_err(internal)? {
                let (key, vv) = item.map_err(internal)?;
                let (version, _) = Self::decode_vv(vv.value())?;
                versions.insert(key.value().to_string(), version);
            }
        }
        info!("opened {} with {} keys", path.display(), versions.len());

        Ok(Self { db, versions: Mutex::new(versions) })
    }

    fn decode_vv(vv: &[u8]) -> Result<(u64, Vec<u8>), Error> {
        if vv.len() < 8 {
            return Err(Error::Internal(format!("short value of {} bytes", vv.len())));
        }
        let mut version = [0u8; 8];
        version.copy_from_slice(&vv[..8]);
        Ok((u64::from_be_bytes(version), vv[8..].to_vec()))
    }

    fn encode_vv(version: u64, value: &[u8]) -> Vec<u8> {
        let mut vv = Vec::with_capacity(value.len() + 8);
        vv.extend_from_slice(&version.to_be_bytes());
        vv.extend_from_slice(value);
        vv
    }

    // Ok(false) if the same version and value is already stored
    fn check_version<T: ReadableTable<&'static str, &'static [u8]>>(
        table: &T,
        versions: &BTreeMap<String, u64>,
        key: &str,
        version: u64,
        vv: &[u8],
    ) -> Result<bool, Error> {
        match versions.get(key) {
            Some(v) if version < *v => {
                error!("version mismatch for {}: {} < {}", key, version, v);
                Err(Error::VersionMismatch)
            }
            Some(v) if version == *v => {
                let existing = table
                    .get(key)
                    .map_err(internal)?
                    .ok_or_else(|| Error::Internal(format!("missing {}", key)))?;
                if existing.value() != vv {
                    error!("value mismatch for {}: {}", key, version);
                    return Err(Error::VersionMismatch);
                }
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

impl KVVStore for RedbKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.versions.lock().expect("lock").get(key).map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    #[instrument(skip(self, value))]
    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        let vv = Self::encode_vv(version, &value);
        let mut versions = self.versions.lock().expect("lock");
        let tx = self.db.begin_write().map_err(internal)?;
        {
            let mut table = tx.open_table(TABLE).map_err(internal)?;
            if !Self::check_version(&table, &versions, key, version, &vv)? {
                return Ok(());
            }
            table.insert(key, vv.as_slice()).map_err(internal)?;
        }
        tx.commit().map_err(internal)?;
        versions.insert(key.to_string(), version);
        Ok(())
    }

    #[instrument(skip(self, kvvs), fields(count = kvvs.len()))]
    fn put_batch(&self, kvvs: Vec<KVV>) -> Result<(), Error> {
        let mut versions = self.versions.lock().expect("lock");
        let tx = self.db.begin_write().map_err(internal)?;
        let mut staged_versions: BTreeMap<String, u64> = BTreeMap::new();
        {
            let mut table = tx.open_table(TABLE).map_err(internal)?;
            for kvv in kvvs.into_iter() {
                let (key, (version, value)) = kvv.into_inner();
                let vv = Self::encode_vv(version, &value);
                // an error drops the transaction uncommitted
                if Self::check_version(&table, &versions, &key, version, &vv)? {
                    table.insert(key.as_str(), vv.as_slice()).map_err(internal)?;
                    staged_versions.insert(key, version);
                }
            }
        }
        tx.commit().map_err(internal)?;
        versions.extend(staged_versions);
        Ok(())
    }

    #[instrument(
        skip(self),
        fields(
            key = key,
        )
    )]
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let tx = self.db.begin_read().map_err(internal)?;
        let table = tx.open_table(TABLE).map_err(internal)?;
        let result = table.get(key).map_err(internal)?;
        match result {
            Some(vv) => Ok(Some(Self::decode_vv(vv.value())?)),
            None => Ok(None),
        }
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.versions.lock().expect("lock").get(key).copied())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let tx = self.db.begin_read().map_err(internal)?;
        let table = tx.open_table(TABLE).map_err(internal)?;
        let mut result = Vec::new();
        for item in table.range(prefix..).map_err(internal)? {
            let (key, vv) = item.map_err(internal)?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let (version, value) = Self::decode_vv(vv.value())?;
            result.push(KVV(key.value().to_string(), (version, value)));
        }
        Ok(Iter(result.into_iter()))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.put(key, Vec::new())
    }

    fn clear_database(&self) -> Result<(), Error> {
        let mut versions = self.versions.lock().expect("lock");
        let tx = self.db.begin_write().map_err(internal)?;
        tx.delete_table(TABLE).map_err(internal)?;
        tx.open_table(TABLE).map_err(internal)?;
        tx.commit().map_err(internal)?;
        versions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn basic_test() -> Result<(), Error> {
        let tempdir = tempfile::tempdir().unwrap();
        let store = RedbKVVStore::new_store(tempdir.path())?;
        store.put("foo1", b"bar".to_vec())?;
        store.put("foo2", b"boo".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 0);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar");
        store.put_with_version("foo1", 1, b"bar2".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        store.put_with_version("foo1", 1, b"bar2".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar2");

        // wrong version
        assert!(store.put_with_version("foo1", 0, b"bar2".to_vec()).is_err());

        // versions survive a reopen
        drop(store);
        let store = RedbKVVStore::new_store(tempdir.path())?;
        assert_eq!(store.get_version("foo1")?, Some(1));
        assert_eq!(store.get("foo2")?, Some((0, b"boo".to_vec())));
        Ok(())
    }

    #[test]
    fn put_batch_test() -> Result<(), Error> {
        let tempdir = tempfile::tempdir().unwrap();
        let store = RedbKVVStore::new_store(tempdir.path())?;
        let kvvs = vec![
            KVV("foo1".to_string(), (0, b"bar".to_vec())),
            KVV("foo2".to_string(), (0, b"bar".to_vec())),
        ];
        assert!(store.put_batch(kvvs).is_ok());
        let kvvs = vec![
            KVV("foo1".to_string(), (1, b"bar2".to_vec())),
            KVV("foo2".to_string(), (0, b"bar3".to_vec())),
        ];
        assert!(store.put_batch(kvvs).is_err());
        assert_eq!(store.get("foo1")?.unwrap(), (0, b"bar".to_vec()));
        store.put_with_version("foo1", 1, b"bar3".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar3");
        Ok(())
    }

    #[test]
    fn prefix_and_clear_test() -> Result<(), Error> {
        let tempdir = tempfile::tempdir().unwrap();
        let store = RedbKVVStore::new_store(tempdir.path())?;
        store.put("monitor/a", b"1".to_vec())?;
        store.put("monitor/b", b"2".to_vec())?;
        store.put("monitorx", b"3".to_vec())?;
        store.delete("monitor/a")?;
        let found: Vec<_> = store.get_prefix("monitor/")?.map(|kvv| kvv.into_inner()).collect();
        assert_eq!(
            found,
            vec![("monitor/a".to_string(), (1, vec![])), ("monitor/b".to_string(), (0, b"2".to_vec()))]
        );
        store.clear_database()?;
        assert_eq!(store.get_prefix("")?.count(), 0);
        assert_eq!(store.get_version("monitor/b")?, None);
        Ok(())
    }
}
