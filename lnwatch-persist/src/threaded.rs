//! An asynchronous gateway.
//!
//! Writes are queued to a worker thread and always return
//! [`PersistStatus::InProgress`].  The worker performs them in submission order
//! and reports each one on the coordinator's completion channel.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use lnwatch::channel::ChannelId;
use lnwatch::coordinator::{CompletionSender, MonitorUpdateId, PersistCompletion};
use lnwatch::monitor::MonitorUpdate;
use lnwatch::persist::{Error, MonitorSnapshot, Persist, PersistStatus};
use lnwatch::SendSync;
use log::*;

use crate::kvv::{KVVPersister, KVVStore};

struct Job {
    update_id: MonitorUpdateId,
    snapshot: MonitorSnapshot,
    new_channel: bool,
}

/// Performs writes to a [`KVVPersister`] on a worker thread
pub struct ThreadedPersister<S: KVVStore + 'static> {
    inner: Arc<KVVPersister<S>>,
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: KVVStore + 'static> SendSync for ThreadedPersister<S> {}

impl<S: KVVStore + 'static> ThreadedPersister<S> {
    /// Start the worker.  Completions are sent on `completions`.
    pub fn new(inner: KVVPersister<S>, completions: CompletionSender) -> Result<Self, Error> {
        let inner = Arc::new(inner);
        let (sender, receiver) = unbounded::<Job>();
        let worker_inner = inner.clone();
        let worker = thread::Builder::new()
            .name("lnwatch-persist".to_string())
            .spawn(move || {
                for job in receiver.iter() {
                    let result = if job.new_channel {
                        worker_inner.write_new(&job.snapshot)
                    } else {
                        worker_inner.write_snapshot(&job.snapshot)
                    };
                    if let Err(ref e) = result {
                        error!("persist {:?} failed: {}", job.update_id, e);
                    }
                    let completion = PersistCompletion { update_id: job.update_id, result };
                    if completions.send(completion).is_err() {
                        warn!("completion receiver gone, stopping persist worker");
                        break;
                    }
                }
                debug!("persist worker exiting");
            })
            .map_err(|e| Error::Internal(format!("spawn persist worker: {}", e)))?;
        Ok(ThreadedPersister {
            inner,
            jobs: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The underlying synchronous persister
    pub fn inner(&self) -> &KVVPersister<S> {
        &self.inner
    }

    /// Stop accepting writes and wait for queued ones to finish
    pub fn shutdown(&self) {
        self.jobs.lock().expect("lock").take();
        if let Some(worker) = self.worker.lock().expect("lock").take() {
            if worker.join().is_err() {
                error!("persist worker panicked");
            }
        }
    }

    fn enqueue(&self, job: Job) -> PersistStatus {
        let jobs = self.jobs.lock().expect("lock");
        let sender = match jobs.as_ref() {
            Some(sender) => sender,
            None => return PersistStatus::Failed(Error::Unavailable("shut down".to_string())),
        };
        match sender.send(job) {
            Ok(()) => PersistStatus::InProgress,
            Err(_) => PersistStatus::Failed(Error::Unavailable("persist worker gone".to_string())),
        }
    }
}

impl<S: KVVStore + 'static> Drop for ThreadedPersister<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: KVVStore + 'static> Persist for ThreadedPersister<S> {
    fn persist_new_channel(
        &self,
        update_id: &MonitorUpdateId,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus {
        self.enqueue(Job { update_id: *update_id, snapshot: snapshot.clone(), new_channel: true })
    }

    fn update_persisted_channel(
        &self,
        update_id: &MonitorUpdateId,
        _update: Option<&MonitorUpdate>,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus {
        self.enqueue(Job { update_id: *update_id, snapshot: snapshot.clone(), new_channel: false })
    }

    fn read_channel_monitors(&self) -> Result<Vec<MonitorSnapshot>, Error> {
        self.inner.read_channel_monitors()
    }

    fn read_channel_monitor(&self, channel_id: &ChannelId) -> Result<MonitorSnapshot, Error> {
        self.inner.read_channel_monitor(channel_id)
    }

    fn archive_persisted_channel(&self, channel_id: &ChannelId) -> Result<(), Error> {
        self.inner.archive_persisted_channel(channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvv::memory::MemoryKVVStore;
    use lnwatch::bitcoin::hashes::Hash;
    use lnwatch::bitcoin::{OutPoint, Txid};
    use lnwatch::coordinator::{completion_channel, UpdateOrigin};
    use std::time::Duration;
    use test_log::test;

    fn snapshot(channel_id: ChannelId, version: u64) -> MonitorSnapshot {
        MonitorSnapshot { channel_id, latest_update_id: version, version, bytes: vec![7; 3] }
    }

    #[test]
    fn writes_complete_in_order() {
        let (sender, receiver) = completion_channel();
        let persister = ThreadedPersister::new(MemoryKVVStore::new(), sender).unwrap();
        let channel_id = ChannelId::new(OutPoint::new(Txid::from_byte_array([3; 32]), 0));
        let ids: Vec<MonitorUpdateId> = (0..3)
            .map(|n| MonitorUpdateId { channel_id, origin: UpdateOrigin::OffChain(n) })
            .collect();

        assert_eq!(
            persister.persist_new_channel(&ids[0], &snapshot(channel_id, 1)),
            PersistStatus::InProgress
        );
        for (n, id) in ids.iter().enumerate().skip(1) {
            assert_eq!(
                persister.update_persisted_channel(id, None, &snapshot(channel_id, n as u64 + 1)),
                PersistStatus::InProgress
            );
        }
        for id in ids.iter() {
            let completion = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(completion.update_id, *id);
            assert_eq!(completion.result, Ok(()));
        }
        assert_eq!(persister.read_channel_monitor(&channel_id).unwrap().version, 3);
    }

    #[test]
    fn shutdown_refuses_writes() {
        let (sender, _receiver) = completion_channel();
        let persister = ThreadedPersister::new(MemoryKVVStore::new(), sender).unwrap();
        persister.shutdown();
        let channel_id = ChannelId::new(OutPoint::new(Txid::from_byte_array([4; 32]), 0));
        let id = MonitorUpdateId { channel_id, origin: UpdateOrigin::OffChain(0) };
        assert!(matches!(
            persister.persist_new_channel(&id, &snapshot(channel_id, 1)),
            PersistStatus::Failed(Error::Unavailable(_))
        ));
    }
}
