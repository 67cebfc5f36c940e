use crate::kvv::{Error, KVVPersister, KVVStore, KVV};
use lnwatch::prelude::*;
use lnwatch::SendSync;
use log::*;

/// A key-version-value in-memory store.
pub struct MemoryKVVStore {
    data: Mutex<OrderedMap<String, (u64, Vec<u8>)>>,
}

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl MemoryKVVStore {
    /// Create a new MemoryKVVStore, wrapped in a persister
    pub fn new() -> KVVPersister<Self> {
        let store = Self { data: Mutex::new(OrderedMap::new()) };
        KVVPersister(store)
    }
}

impl SendSync for MemoryKVVStore {}

// version cannot go backwards, and the same version must carry the same value
fn check_version(
    data: &OrderedMap<String, (u64, Vec<u8>)>,
    key: &str,
    version: u64,
    value: &[u8],
) -> Result<bool, Error> {
    match data.get(key) {
        Some((ver, _)) if version < *ver => {
            error!("version mismatch for {}: {} < {}", key, version, ver);
            Err(Error::VersionMismatch)
        }
        Some((ver, val)) if version == *ver => {
            if val.as_slice() != value {
                error!("value mismatch for {}: {}", key, version);
                return Err(Error::VersionMismatch);
            }
            Ok(false)
        }
        _ => Ok(true),
    }
}

impl KVVStore for MemoryKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.get_version(key)?.map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        let mut data = self.data.lock().expect("lock");
        if check_version(&data, key, version, &value)? {
            data.insert(key.to_string(), (version, value));
        }
        Ok(())
    }

    fn put_batch(&self, kvvs: Vec<KVV>) -> Result<(), Error> {
        let mut data = self.data.lock().expect("lock");
        for kvv in kvvs.iter() {
            check_version(&data, &kvv.0, kvv.1 .0, &kvv.1 .1)?;
        }
        for kvv in kvvs.into_iter() {
            let (key, vv) = kvv.into_inner();
            data.insert(key, vv);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let data = self.data.lock().expect("lock");
        Ok(data.get(key).cloned())
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        let data = self.data.lock().expect("lock");
        Ok(data.get(key).map(|(v, _)| *v))
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let data = self.data.lock().expect("lock");
        let mut result = Vec::new();
        for (k, (ver, value)) in data.range(prefix.to_string()..) {
            if k.starts_with(prefix) {
                result.push(KVV(k.clone(), (*ver, value.clone())));
            } else {
                break;
            }
        }
        Ok(Iter(result.into_iter()))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.put(key, Vec::new())
    }

    fn clear_database(&self) -> Result<(), Error> {
        self.data.lock().expect("lock").clear();
        Ok(())
    }
}
