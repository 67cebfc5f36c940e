#![allow(unused_variables)]

use bitcoin::{Amount, OutPoint, Script, Transaction, Txid, Witness};

use crate::chain::interface::{
    BroadcasterInterface, ChannelSigner, ConfirmationTarget, FeeEstimator, Filter, WatchedOutput,
};
use crate::channel::{ChannelId, CommitmentSecret};
use crate::coordinator::{
    CompletionSender, MonitorUpdateId, PersistCompletion, PersistenceListener,
};
use crate::monitor::MonitorUpdate;
use crate::persist::{self, MonitorSnapshot, Persist, PersistStatus};
use crate::prelude::*;
use crate::util::status::Status;

/// Records registrations
#[derive(Default)]
pub struct MockFilter {
    txids: Mutex<OrderedSet<Txid>>,
    outputs: Mutex<OrderedSet<OutPoint>>,
}

impl SendSync for MockFilter {}

impl MockFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_txid(&self, txid: &Txid) -> bool {
        self.txids.lock().expect("lock").contains(txid)
    }

    pub fn has_output(&self, outpoint: &OutPoint) -> bool {
        self.outputs.lock().expect("lock").contains(outpoint)
    }

    pub fn output_count(&self) -> usize {
        self.outputs.lock().expect("lock").len()
    }
}

impl Filter for MockFilter {
    fn register_tx(&self, txid: &Txid, script_pubkey: &Script) {
        self.txids.lock().expect("lock").insert(*txid);
    }

    fn register_output(&self, output: WatchedOutput) {
        self.outputs.lock().expect("lock").insert(output.outpoint);
    }
}

/// Records broadcasts
#[derive(Default)]
pub struct MockBroadcaster {
    txs: Mutex<Vec<Transaction>>,
}

impl SendSync for MockBroadcaster {}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcasted(&self) -> Vec<Transaction> {
        self.txs.lock().expect("lock").clone()
    }

    pub fn clear(&self) {
        self.txs.lock().expect("lock").clear();
    }
}

impl BroadcasterInterface for MockBroadcaster {
    fn broadcast_transactions(&self, txs: &[&Transaction]) {
        self.txs.lock().expect("lock").extend(txs.iter().map(|tx| (*tx).clone()));
    }
}

/// A fixed feerate for every target
pub struct MockFeeEstimator {
    feerate: u32,
}

impl SendSync for MockFeeEstimator {}

impl MockFeeEstimator {
    pub fn new(feerate: u32) -> Self {
        MockFeeEstimator { feerate }
    }
}

impl FeeEstimator for MockFeeEstimator {
    fn get_est_sat_per_1000_weight(&self, target: ConfirmationTarget) -> u32 {
        self.feerate
    }
}

/// Puts the secret into the witness of each input
#[derive(Default)]
pub struct MockSigner {
    fail: Mutex<bool>,
    tamper: Mutex<bool>,
}

impl SendSync for MockSigner {}

impl MockSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().expect("lock") = fail;
    }

    /// Sign a transaction paying one satoshi less than asked
    pub fn set_tamper(&self, tamper: bool) {
        *self.tamper.lock().expect("lock") = tamper;
    }
}

impl ChannelSigner for MockSigner {
    fn sign_justice_transaction(
        &self,
        channel_id: &ChannelId,
        tx: &Transaction,
        input_amounts_sat: &[u64],
        secret: &CommitmentSecret,
    ) -> Result<Transaction, Status> {
        if *self.fail.lock().expect("lock") {
            return Err(Status::unavailable("signer offline"));
        }
        let mut signed = tx.clone();
        for input in signed.input.iter_mut() {
            input.witness = Witness::from_slice(&[secret.0.to_vec()]);
        }
        if *self.tamper.lock().expect("lock") {
            if let Some(output) = signed.output.first_mut() {
                output.value = output.value - Amount::from_sat(1);
            }
        }
        Ok(signed)
    }
}

#[derive(Default)]
struct PersisterState {
    requests: Vec<MonitorUpdateId>,
    pending: Vec<(MonitorUpdateId, MonitorSnapshot)>,
    stored: OrderedMap<ChannelId, MonitorSnapshot>,
    archived: Vec<ChannelId>,
    fail_next: usize,
}

impl PersisterState {
    fn store(&mut self, snapshot: &MonitorSnapshot) {
        match self.stored.get(&snapshot.channel_id) {
            Some(existing) if existing.version >= snapshot.version => {}
            _ => {
                self.stored.insert(snapshot.channel_id, snapshot.clone());
            }
        }
    }
}

/// An in-memory persister.
///
/// Synchronous by default.  When asynchronous, writes stay pending until
/// completed through [`MockPersister::complete`] or [`MockPersister::complete_all`].
pub struct MockPersister {
    asynchronous: bool,
    state: Mutex<PersisterState>,
}

impl SendSync for MockPersister {}

impl MockPersister {
    pub fn new(asynchronous: bool) -> Self {
        MockPersister { asynchronous, state: Mutex::new(PersisterState::default()) }
    }

    /// Fail the next `n` writes
    pub fn fail_next(&self, n: usize) {
        self.state.lock().expect("lock").fail_next = n;
    }

    /// All write requests, in order
    pub fn requests(&self) -> Vec<MonitorUpdateId> {
        self.state.lock().expect("lock").requests.clone()
    }

    /// Writes not yet completed, in order
    pub fn pending(&self) -> Vec<MonitorUpdateId> {
        self.state.lock().expect("lock").pending.iter().map(|(id, _)| *id).collect()
    }

    /// The durable snapshot of a channel
    pub fn stored(&self, channel_id: &ChannelId) -> Option<MonitorSnapshot> {
        self.state.lock().expect("lock").stored.get(channel_id).cloned()
    }

    pub fn archived(&self) -> Vec<ChannelId> {
        self.state.lock().expect("lock").archived.clone()
    }

    /// Complete one pending write, reporting on `sender`
    pub fn complete(&self, sender: &CompletionSender, update_id: &MonitorUpdateId) {
        let mut state = self.state.lock().expect("lock");
        if let Some(pos) = state.pending.iter().position(|(id, _)| id == update_id) {
            let (id, snapshot) = state.pending.remove(pos);
            state.store(&snapshot);
            sender.send(PersistCompletion { update_id: id, result: Ok(()) }).expect("send");
        }
    }

    /// Complete all pending writes in order
    pub fn complete_all(&self, sender: &CompletionSender) {
        let pending = self.pending();
        for id in pending {
            self.complete(sender, &id);
        }
    }

    /// Drop pending writes, as if the process crashed before they completed
    pub fn drop_pending(&self) {
        self.state.lock().expect("lock").pending.clear();
    }

    fn write(&self, update_id: &MonitorUpdateId, snapshot: &MonitorSnapshot) -> PersistStatus {
        let mut state = self.state.lock().expect("lock");
        state.requests.push(*update_id);
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return PersistStatus::Failed(persist::Error::Unavailable("mock failure".into()));
        }
        if self.asynchronous {
            state.pending.push((*update_id, snapshot.clone()));
            PersistStatus::InProgress
        } else {
            state.store(snapshot);
            PersistStatus::Completed
        }
    }
}

impl Persist for MockPersister {
    fn persist_new_channel(
        &self,
        update_id: &MonitorUpdateId,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus {
        self.write(update_id, snapshot)
    }

    fn update_persisted_channel(
        &self,
        update_id: &MonitorUpdateId,
        update: Option<&MonitorUpdate>,
        snapshot: &MonitorSnapshot,
    ) -> PersistStatus {
        self.write(update_id, snapshot)
    }

    fn read_channel_monitors(&self) -> Result<Vec<MonitorSnapshot>, persist::Error> {
        Ok(self.state.lock().expect("lock").stored.values().cloned().collect())
    }

    fn archive_persisted_channel(&self, channel_id: &ChannelId) -> Result<(), persist::Error> {
        let mut state = self.state.lock().expect("lock");
        state
            .stored
            .remove(channel_id)
            .ok_or_else(|| persist::Error::NotFound(channel_id.to_string()))?;
        state.archived.push(*channel_id);
        Ok(())
    }
}

/// Records unblock notifications
#[derive(Default)]
pub struct RecordingListener {
    notifications: Mutex<Vec<(ChannelId, u64)>>,
}

impl SendSync for RecordingListener {}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(ChannelId, u64)> {
        self.notifications.lock().expect("lock").clone()
    }
}

impl PersistenceListener for RecordingListener {
    fn on_update_persisted(&self, channel_id: &ChannelId, update_id: u64) {
        self.notifications.lock().expect("lock").push((*channel_id, update_id));
    }
}
