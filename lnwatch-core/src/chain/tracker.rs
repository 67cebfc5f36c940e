use core::mem;
use std::time::Instant;

use bitcoin::block::Header;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use log::*;
use tracing::instrument;

use crate::chain::interface::{
    feerate_with_floor, BroadcasterInterface, ChannelSigner, FeeEstimator, Filter,
};
use crate::channel::{ChannelId, CommitmentState, PaymentPreimage};
use crate::config::MonitorConfig;
use crate::coordinator::{CompletionReceiver, PersistenceListener, UpdateCoordinator};
use crate::events::{Event, EventQueue};
use crate::monitor::{
    Balance, BlockOutcome, ChainTip, ChannelMonitor, MonitorUpdate, PendingJustice, UpdateApplied,
};
use crate::persist::{MonitorSnapshot, Persist};
use crate::prelude::*;
use crate::util::status::{invalid_argument, Status};
use crate::{short_function, Arc, Error};

/// The host capabilities the registry depends on
#[derive(Clone)]
pub struct ChainServices {
    /// block source filter
    pub filter: Arc<dyn Filter>,
    /// transaction broadcaster
    pub broadcaster: Arc<dyn BroadcasterInterface>,
    /// fee estimator for justice transactions
    pub fee_estimator: Arc<dyn FeeEstimator>,
    /// signs justice transactions
    pub signer: Arc<dyn ChannelSigner>,
    /// the persistence gateway
    pub persister: Arc<dyn Persist>,
    /// notified when channels may advance
    pub listener: Arc<dyn PersistenceListener>,
}

// Everything ever registered with the filter
#[derive(Default)]
struct FilterLedger {
    txids: OrderedSet<(Txid, ScriptBuf)>,
    outputs: OrderedSet<OutPoint>,
}

impl FilterLedger {
    fn register(&mut self, filter: &dyn Filter, monitor: &ChannelMonitor) {
        for (txid, script) in monitor.watched_txids() {
            if !self.txids.contains(&(txid, script.clone())) {
                filter.register_tx(&txid, &script);
                self.txids.insert((txid, script));
            }
        }
        for output in monitor.watched_outputs() {
            if !self.outputs.contains(&output.outpoint) {
                debug!("{}: watching outpoint {}", short_function!(), output.outpoint);
                self.outputs.insert(output.outpoint);
                filter.register_output(output);
            }
        }
    }

    fn verify(&self, monitor: &ChannelMonitor) -> Result<(), Error> {
        let channel_id = monitor.channel_id();
        if let Some((txid, _)) =
            monitor.watched_txids().into_iter().find(|w| !self.txids.contains(w))
        {
            error!("{}: {} needs txid {} which is not registered", short_function!(), channel_id, txid);
            return Err(Error::MissingFilterRegistration(format!("{}: txid {}", channel_id, txid)));
        }
        if let Some(output) =
            monitor.watched_outputs().into_iter().find(|o| !self.outputs.contains(&o.outpoint))
        {
            error!(
                "{}: {} needs outpoint {} which is not registered",
                short_function!(),
                channel_id,
                output.outpoint
            );
            return Err(Error::MissingFilterRegistration(format!(
                "{}: outpoint {}",
                channel_id, output.outpoint
            )));
        }
        Ok(())
    }
}

struct TrackerState {
    tip: ChainTip,
    monitors: OrderedMap<ChannelId, ChannelMonitor>,
    // channels that hit a fatal error and must be reloaded
    failed: OrderedSet<ChannelId>,
    registered: FilterLedger,
    // per channel, how many of the monitor's pending events are in the queue
    released: OrderedMap<ChannelId, usize>,
    // per channel, how many released events the host drained and may acknowledge
    delivered: OrderedMap<ChannelId, usize>,
}

fn fail_channel(failed: &mut OrderedSet<ChannelId>, channel_id: ChannelId, error: &Error) {
    if error.is_fatal() && failed.insert(channel_id) {
        error!("channel {} failed, reload required: {}", channel_id, error);
    }
}

/// The monitor registry.
///
/// Owns the monitors of all channels and the chain tip.  Blocks are applied
/// to every monitor in strict height order, and every change is handed to the
/// [`UpdateCoordinator`] for persistence.  Events reach the [`EventQueue`]
/// only once the monitor state that produced them is durable.
pub struct ChainTracker {
    state: Mutex<TrackerState>,
    coordinator: UpdateCoordinator,
    events: Arc<EventQueue>,
    services: ChainServices,
    config: MonitorConfig,
}

impl ChainTracker {
    /// Create a registry with no channels, at `tip`.
    ///
    /// Fails with [`Error::NotLoaded`] if the persister holds monitors, which
    /// must be restored with [`ChainTracker::load`] instead.
    pub fn new(
        tip: ChainTip,
        services: ChainServices,
        config: MonitorConfig,
        completions: CompletionReceiver,
    ) -> Result<Self, Error> {
        config.validate()?;
        let persisted = services.persister.read_channel_monitors()?;
        if !persisted.is_empty() {
            error!("{}: {} persisted monitors were not loaded", short_function!(), persisted.len());
            return Err(Error::NotLoaded(format!(
                "{} persisted monitors, use load to restore them",
                persisted.len()
            )));
        }
        Ok(Self::build(tip, OrderedMap::new(), services, config, completions))
    }

    /// Restore all persisted monitors and register their watches.
    ///
    /// The tip is the lowest best block among the monitors, or `default_tip`
    /// if there are none.  The host must deliver blocks from there.  Pending
    /// claims are rebroadcast.
    pub fn load(
        default_tip: ChainTip,
        services: ChainServices,
        config: MonitorConfig,
        completions: CompletionReceiver,
    ) -> Result<Self, Error> {
        config.validate()?;
        let mut monitors = OrderedMap::new();
        for snapshot in services.persister.read_channel_monitors()? {
            let monitor = decode_snapshot(&snapshot, &config)?;
            monitors.insert(snapshot.channel_id, monitor);
        }
        let tip = monitors
            .values()
            .map(|m| m.best_block())
            .min_by_key(|t| t.height)
            .unwrap_or(default_tip);
        info!("{}: loaded {} channels, tip {} at {}", short_function!(), monitors.len(), tip.block_hash, tip.height);
        let tracker = Self::build(tip, monitors, services, config, completions);
        {
            let mut guard = tracker.lock();
            let state = &mut *guard;
            for monitor in state.monitors.values() {
                state.registered.register(&*tracker.services.filter, monitor);
                state.registered.verify(monitor)?;
            }
        }
        tracker.rebroadcast_pending_claims();
        Ok(tracker)
    }

    fn build(
        tip: ChainTip,
        monitors: OrderedMap<ChannelId, ChannelMonitor>,
        services: ChainServices,
        config: MonitorConfig,
        completions: CompletionReceiver,
    ) -> Self {
        let events = Arc::new(EventQueue::new());
        let coordinator = UpdateCoordinator::new(
            Arc::clone(&services.persister),
            Arc::clone(&services.listener),
            Arc::clone(&events),
            config.retry.clone(),
            completions,
        );
        let state = TrackerState {
            tip,
            monitors,
            failed: OrderedSet::new(),
            registered: FilterLedger::default(),
            released: OrderedMap::new(),
            delivered: OrderedMap::new(),
        };
        ChainTracker { state: Mutex::new(state), coordinator, events, services, config }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().expect("lock")
    }

    /// The current chain tip
    pub fn tip(&self) -> ChainTip {
        self.lock().tip
    }

    /// The watched channels
    pub fn list_channels(&self) -> Vec<ChannelId> {
        self.lock().monitors.keys().cloned().collect()
    }

    /// The event queue, which the host may also push its own events to
    pub fn events(&self) -> Arc<EventQueue> {
        Arc::clone(&self.events)
    }

    /// The update coordinator
    pub fn coordinator(&self) -> &UpdateCoordinator {
        &self.coordinator
    }

    /// Whether the channel hit a fatal error and must be reloaded
    pub fn is_failed(&self, channel_id: &ChannelId) -> bool {
        self.lock().failed.contains(channel_id)
    }

    /// Start watching a new channel.  The monitor must be synced to the
    /// current tip.  Its watches are registered with the filter before this
    /// returns.
    pub fn watch_channel(&self, mut monitor: ChannelMonitor) -> Result<(), Error> {
        let channel_id = monitor.channel_id();
        let snapshot = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.monitors.contains_key(&channel_id) {
                return Err(Error::DuplicateChannel(channel_id));
            }
            if monitor.best_block() != state.tip {
                return Err(Error::InvalidArgument(format!(
                    "monitor for {} is at height {}, tip is at {}",
                    channel_id,
                    monitor.best_block().height,
                    state.tip.height
                )));
            }
            monitor.set_config(&self.config);
            state.registered.register(&*self.services.filter, &monitor);
            state.registered.verify(&monitor)?;
            let snapshot = monitor.snapshot()?;
            state.monitors.insert(channel_id, monitor);
            snapshot
        };
        info!("{}: watching {}", short_function!(), channel_id);
        self.coordinator.submit_new(snapshot);
        Ok(())
    }

    /// A copy of the monitor
    pub fn get_monitor(&self, channel_id: &ChannelId) -> Result<ChannelMonitor, Error> {
        self.with_monitor(channel_id, |m| m.clone())
    }

    /// Read access to the monitor
    pub fn with_monitor<T, F: FnOnce(&ChannelMonitor) -> T>(
        &self,
        channel_id: &ChannelId,
        f: F,
    ) -> Result<T, Error> {
        let state = self.lock();
        state.monitors.get(channel_id).map(f).ok_or(Error::UnknownChannel(*channel_id))
    }

    /// Connect the next block.  `txs` are the relevant transactions in block order.
    ///
    /// Errors affecting a single channel don't stop the block from being applied to
    /// the others, and are returned.  Fatal ones mark the channel failed.
    #[instrument(skip(self, header, txs))]
    pub fn block_connected(
        &self,
        header: &Header,
        height: u32,
        txs: &[Transaction],
    ) -> Result<Vec<(ChannelId, Error)>, Error> {
        let block_hash = header.block_hash();
        let feerate = self.justice_feerate();
        let mut failures = Vec::new();
        let mut diverged = Vec::new();
        let mut justices = Vec::new();
        let mut submissions = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if height == state.tip.height && block_hash == state.tip.block_hash {
                debug!("{}: block {} at {} already connected", short_function!(), block_hash, height);
                return Ok(failures);
            }
            if height != state.tip.height + 1 || header.prev_blockhash != state.tip.block_hash {
                return Err(error_invalid_block!(
                    "block {} at {} does not extend tip {} at {}",
                    block_hash,
                    height,
                    state.tip.block_hash,
                    state.tip.height
                ));
            }
            for (channel_id, monitor) in state.monitors.iter_mut() {
                if state.failed.contains(channel_id) {
                    continue;
                }
                if monitor.best_block().height < state.tip.height {
                    // reloaded, catching up through replay_block
                    warn!(
                        "{}: {} is at {}, behind tip {}",
                        short_function!(),
                        channel_id,
                        monitor.best_block().height,
                        state.tip.height
                    );
                    continue;
                }
                let outcome = match connect_monitor(monitor, header, height, txs, feerate) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // the block extends the tip, so the monitor no longer follows the chain
                        diverged.push(*channel_id);
                        failures.push((*channel_id, e));
                        continue;
                    }
                };
                state.registered.register(&*self.services.filter, monitor);
                if let Err(e) = state.registered.verify(monitor) {
                    failures.push((*channel_id, e));
                    continue;
                }
                if let Some(justice) = outcome.justice {
                    justices.push((*channel_id, justice));
                }
                if outcome.changed {
                    match monitor.snapshot() {
                        Ok(snapshot) => submissions.push(snapshot),
                        Err(e) => failures.push((*channel_id, e)),
                    }
                }
            }
            for (channel_id, e) in failures.iter() {
                fail_channel(&mut state.failed, *channel_id, e);
            }
            for channel_id in diverged {
                if state.failed.insert(channel_id) {
                    error!("channel {} rejected block {} at {}, reload required", channel_id, block_hash, height);
                }
            }
            state.tip = ChainTip { height, block_hash };
        }
        debug!("{}: connected {} at {}", short_function!(), block_hash, height);
        for snapshot in submissions {
            self.coordinator.submit(None, snapshot);
        }
        for (channel_id, justice) in justices {
            self.broadcast_justice(&channel_id, &justice);
        }
        Ok(failures)
    }

    /// Disconnect the tip block
    #[instrument(skip(self, header))]
    pub fn block_disconnected(
        &self,
        header: &Header,
        height: u32,
    ) -> Result<Vec<(ChannelId, Error)>, Error> {
        let block_hash = header.block_hash();
        let mut failures = Vec::new();
        let mut submissions = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if height != state.tip.height || block_hash != state.tip.block_hash {
                return Err(error_invalid_block!(
                    "cannot disconnect {} at {}, tip is {} at {}",
                    block_hash,
                    height,
                    state.tip.block_hash,
                    state.tip.height
                ));
            }
            let parent_height = height
                .checked_sub(1)
                .ok_or_else(|| error_invalid_block!("cannot disconnect block {} at height 0", block_hash))?;
            for (channel_id, monitor) in state.monitors.iter_mut() {
                if state.failed.contains(channel_id) {
                    continue;
                }
                match monitor.disconnect_block(height) {
                    Ok(true) => match monitor.snapshot() {
                        Ok(snapshot) => submissions.push(snapshot),
                        Err(e) => failures.push((*channel_id, e)),
                    },
                    Ok(false) => {}
                    Err(e) => failures.push((*channel_id, e)),
                }
            }
            for (channel_id, e) in failures.iter() {
                fail_channel(&mut state.failed, *channel_id, e);
            }
            state.tip = ChainTip { height: parent_height, block_hash: header.prev_blockhash };
        }
        info!("{}: disconnected {} at {}", short_function!(), block_hash, height);
        for snapshot in submissions {
            self.coordinator.submit(None, snapshot);
        }
        Ok(failures)
    }

    /// Apply an already connected block to a single channel whose monitor is
    /// behind the tip, for example after [`ChainTracker::reload_channel`].
    pub fn replay_block(
        &self,
        channel_id: &ChannelId,
        header: &Header,
        height: u32,
        txs: &[Transaction],
    ) -> Result<(), Error> {
        let feerate = self.justice_feerate();
        let (snapshot, justice) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if height > state.tip.height {
                return Err(Error::InvalidArgument(format!(
                    "height {} is above tip {}",
                    height, state.tip.height
                )));
            }
            if state.failed.contains(channel_id) {
                return Err(Error::ChannelFailed(*channel_id));
            }
            let monitor =
                state.monitors.get_mut(channel_id).ok_or(Error::UnknownChannel(*channel_id))?;
            let outcome = match connect_monitor(monitor, header, height, txs, feerate) {
                Ok(outcome) => outcome,
                Err(e) => {
                    fail_channel(&mut state.failed, *channel_id, &e);
                    return Err(e);
                }
            };
            state.registered.register(&*self.services.filter, monitor);
            state.registered.verify(monitor)?;
            let snapshot = if outcome.changed { Some(monitor.snapshot()?) } else { None };
            (snapshot, outcome.justice)
        };
        if let Some(snapshot) = snapshot {
            self.coordinator.submit(None, snapshot);
        }
        if let Some(justice) = justice {
            self.broadcast_justice(channel_id, &justice);
        }
        Ok(())
    }

    /// Advance the channel to a new commitment.  The corresponding message must
    /// not be sent to the peer until the listener is notified that the returned
    /// update is durable.
    pub fn update_commitment(
        &self,
        channel_id: &ChannelId,
        state: CommitmentState,
    ) -> Result<MonitorUpdate, Error> {
        self.update_channel(channel_id, false, |monitor| {
            let update = monitor.update_commitment(state)?;
            Ok((update.clone(), Some(update)))
        })
    }

    /// Apply an update produced elsewhere, for example when replaying updates
    /// after a restart.  Already applied updates are not persisted again.
    pub fn apply_update(
        &self,
        channel_id: &ChannelId,
        update: &MonitorUpdate,
    ) -> Result<UpdateApplied, Error> {
        self.update_channel(channel_id, false, |monitor| {
            let applied = monitor.apply_update(update)?;
            let to_persist = match applied {
                UpdateApplied::Applied => Some(update.clone()),
                UpdateApplied::AlreadyApplied => None,
            };
            Ok((applied, to_persist))
        })
    }

    /// Record a payment preimage
    pub fn provide_preimage(
        &self,
        channel_id: &ChannelId,
        preimage: PaymentPreimage,
    ) -> Result<MonitorUpdate, Error> {
        self.update_channel(channel_id, false, |monitor| {
            let update = monitor.provide_preimage(preimage)?;
            Ok((update.clone(), Some(update)))
        })
    }

    /// Force close the channel and broadcast our commitment.  Allowed while the
    /// channel is blocked on persistence.
    pub fn force_close(&self, channel_id: &ChannelId) -> Result<MonitorUpdate, Error> {
        self.coordinator.force_closed(channel_id);
        let (update, tx) = self.update_channel(channel_id, true, |monitor| {
            let (update, tx) = monitor.force_close()?;
            Ok(((update.clone(), tx), Some(update)))
        })?;
        warn!("{}: force closing {} with {}", short_function!(), channel_id, tx.compute_txid());
        self.services.broadcaster.broadcast_transactions(&[&tx]);
        Ok(update)
    }

    fn update_channel<T, F>(&self, channel_id: &ChannelId, allow_blocked: bool, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut ChannelMonitor) -> Result<(T, Option<MonitorUpdate>), Error>,
    {
        if !allow_blocked && self.coordinator.is_blocked(channel_id) {
            return Err(Error::PersistenceFailure {
                channel_id: *channel_id,
                reason: "an earlier update is not durable yet".into(),
            });
        }
        let (result, submission) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.failed.contains(channel_id) {
                return Err(Error::ChannelFailed(*channel_id));
            }
            let monitor =
                state.monitors.get_mut(channel_id).ok_or(Error::UnknownChannel(*channel_id))?;
            let (result, update) = match f(monitor) {
                Ok(r) => r,
                Err(e) => {
                    fail_channel(&mut state.failed, *channel_id, &e);
                    return Err(e);
                }
            };
            let submission = match update {
                Some(update) => {
                    state.registered.register(&*self.services.filter, monitor);
                    state.registered.verify(monitor)?;
                    Some((update, monitor.snapshot()?))
                }
                None => None,
            };
            (result, submission)
        };
        if let Some((update, snapshot)) = submission {
            self.coordinator.submit(Some(&update), snapshot);
        }
        Ok(result)
    }

    /// Replace the in-memory monitor with its persisted snapshot and clear
    /// its failure.  Returns the best block of the reloaded monitor; blocks
    /// after it must be supplied through [`ChainTracker::replay_block`].
    pub fn reload_channel(&self, channel_id: &ChannelId) -> Result<ChainTip, Error> {
        self.coordinator.process_completions();
        if self.coordinator.has_in_flight(channel_id) {
            return Err(Error::PersistenceFailure {
                channel_id: *channel_id,
                reason: "cannot reload while writes are in flight".into(),
            });
        }
        let snapshot = self.services.persister.read_channel_monitor(channel_id)?;
        let mut monitor = decode_snapshot(&snapshot, &self.config)?;
        if let Some(version) = self.coordinator.highest_version(channel_id) {
            monitor.resume_versions_after(version);
        }
        let best_block = monitor.best_block();
        let mut guard = self.lock();
        let state = &mut *guard;
        if !state.monitors.contains_key(channel_id) {
            return Err(Error::UnknownChannel(*channel_id));
        }
        state.registered.register(&*self.services.filter, &monitor);
        state.registered.verify(&monitor)?;
        state.monitors.insert(*channel_id, monitor);
        state.failed.remove(channel_id);
        // unacknowledged events of the persisted monitor are delivered again
        state.released.remove(channel_id);
        state.delivered.remove(channel_id);
        info!("{}: reloaded {} at height {}", short_function!(), channel_id, best_block.height);
        Ok(best_block)
    }

    /// Copy monitor events to the event queue, for channels whose state is
    /// durable.  Each event is queued once; it stays in the monitor until the
    /// host acknowledges it with [`ChainTracker::ack_events`].
    /// Returns the number of events released.
    pub fn release_pending_events(&self) -> usize {
        let mut guard = self.lock();
        self.release_locked(&mut guard)
    }

    fn release_locked(&self, state: &mut TrackerState) -> usize {
        let mut released = 0;
        for (channel_id, monitor) in state.monitors.iter() {
            let queued = state.released.get(channel_id).copied().unwrap_or(0);
            let pending = monitor.pending_events();
            if pending.len() <= queued
                || state.failed.contains(channel_id)
                || self.coordinator.has_in_flight(channel_id)
            {
                continue;
            }
            self.events.extend(pending[queued..].iter().cloned());
            released += pending.len() - queued;
            state.released.insert(*channel_id, pending.len());
        }
        released
    }

    /// Handle persistence completions, release durable events and drain the queue.
    ///
    /// The returned events must be acknowledged with [`ChainTracker::ack_events`]
    /// once handled.  Events not acknowledged before a restart are delivered
    /// again after [`ChainTracker::load`].
    pub fn drain_events(&self) -> Vec<Event> {
        self.coordinator.process_completions();
        let mut guard = self.lock();
        let state = &mut *guard;
        self.release_locked(state);
        let events = self.events.drain();
        state.delivered = state.released.clone();
        events
    }

    /// The host handled every event returned by [`ChainTracker::drain_events`]
    /// so far.  They are removed from their monitors, which are persisted
    /// again.  Returns the number of events acknowledged.
    pub fn ack_events(&self) -> usize {
        let mut acknowledged = 0;
        let mut submissions = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            for (channel_id, count) in mem::take(&mut state.delivered) {
                if count == 0 || state.failed.contains(&channel_id) {
                    continue;
                }
                let monitor = match state.monitors.get_mut(&channel_id) {
                    Some(monitor) => monitor,
                    None => continue,
                };
                monitor.acknowledge_events(count);
                if let Some(queued) = state.released.get_mut(&channel_id) {
                    *queued = queued.saturating_sub(count);
                }
                acknowledged += count;
                match monitor.snapshot() {
                    Ok(snapshot) => submissions.push(snapshot),
                    Err(e) => error!("{}: cannot snapshot {}: {}", short_function!(), channel_id, e),
                }
            }
        }
        for snapshot in submissions {
            self.coordinator.submit(None, snapshot);
        }
        acknowledged
    }

    /// Handle persistence completions and retry failed writes whose backoff
    /// expired.  The host should call this periodically.
    pub fn process_pending_persistence(&self, now: Instant) -> usize {
        self.coordinator.process_completions() + self.coordinator.retry_failed(now)
    }

    /// Claimable balances across all channels
    pub fn claimable_balances(&self) -> Vec<Balance> {
        let state = self.lock();
        state.monitors.values().flat_map(|m| m.claimable_balances()).collect()
    }

    /// Archive and drop channels that are fully resolved and durable
    pub fn archive_fully_resolved_channels(&self) -> Result<Vec<ChannelId>, Error> {
        let resolved: Vec<ChannelId> = {
            let state = self.lock();
            state
                .monitors
                .iter()
                .filter(|(id, m)| {
                    m.is_fully_resolved()
                        && !state.failed.contains(*id)
                        && !self.coordinator.has_in_flight(id)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for channel_id in resolved.iter() {
            self.services.persister.archive_persisted_channel(channel_id)?;
            {
                let mut state = self.lock();
                state.monitors.remove(channel_id);
                state.released.remove(channel_id);
                state.delivered.remove(channel_id);
            }
            self.coordinator.remove_channel(channel_id);
            info!("{}: archived {}", short_function!(), channel_id);
        }
        Ok(resolved)
    }

    /// Rebroadcast our unconfirmed commitments and justice transactions
    pub fn rebroadcast_pending_claims(&self) {
        let (claims, justices) = {
            let state = self.lock();
            let mut claims = Vec::new();
            let mut justices = Vec::new();
            for (channel_id, monitor) in state.monitors.iter() {
                claims.extend(monitor.pending_claims());
                if let Some(justice) = monitor.pending_justice() {
                    justices.push((*channel_id, justice.clone()));
                }
            }
            (claims, justices)
        };
        if !claims.is_empty() {
            debug!("{}: rebroadcasting {} claims", short_function!(), claims.len());
            let refs: Vec<&Transaction> = claims.iter().collect();
            self.services.broadcaster.broadcast_transactions(&refs);
        }
        for (channel_id, justice) in justices {
            self.broadcast_justice(&channel_id, &justice);
        }
    }

    fn justice_feerate(&self) -> u32 {
        feerate_with_floor(&*self.services.fee_estimator, self.config.justice_confirmation_target)
    }

    fn sign_justice(&self, channel_id: &ChannelId, justice: &PendingJustice) -> Result<Transaction, Status> {
        let tx = self.services.signer.sign_justice_transaction(
            channel_id,
            &justice.tx,
            &justice.input_amounts_sat,
            &justice.revocation.secret,
        )?;
        // signing only adds witnesses
        if tx.compute_txid() != justice.tx.compute_txid() {
            return Err(invalid_argument(format!(
                "{}: signer returned {} for justice {}",
                channel_id,
                tx.compute_txid(),
                justice.tx.compute_txid()
            )));
        }
        Ok(tx)
    }

    fn broadcast_justice(&self, channel_id: &ChannelId, justice: &PendingJustice) {
        match self.sign_justice(channel_id, justice) {
            Ok(tx) => {
                info!("{}: {} broadcasting justice {}", short_function!(), channel_id, tx.compute_txid());
                self.services.broadcaster.broadcast_transactions(&[&tx]);
            }
            // retried by rebroadcast_pending_claims
            Err(e) => warn!("{}: {} cannot sign justice: {}", short_function!(), channel_id, e),
        }
    }
}

fn decode_snapshot(snapshot: &MonitorSnapshot, config: &MonitorConfig) -> Result<ChannelMonitor, Error> {
    let monitor = ChannelMonitor::decode(&snapshot.bytes, config)?;
    if monitor.channel_id() != snapshot.channel_id {
        return Err(Error::Serialization(format!(
            "snapshot for {} contains monitor for {}",
            snapshot.channel_id,
            monitor.channel_id()
        )));
    }
    Ok(monitor)
}

// A monitor persisted ahead of the tip before a reorg may hold a conflicting
// block at this height.  It is rewound to the parent, which it must have
// applied itself.  Otherwise the fork is below its retained history.
fn connect_monitor(
    monitor: &mut ChannelMonitor,
    header: &Header,
    height: u32,
    txs: &[Transaction],
    feerate: u32,
) -> Result<BlockOutcome, Error> {
    match monitor.apply_block(header, height, txs, feerate) {
        Err(Error::InvalidBlock(reason)) if monitor.best_block().height >= height => {
            let parent = height
                .checked_sub(1)
                .filter(|parent| monitor.block_hash_at(*parent) == Some(header.prev_blockhash));
            let parent = match parent {
                Some(parent) => parent,
                None => {
                    error!(
                        "{}: {} forked below its retained history at {}: {}",
                        short_function!(),
                        monitor.channel_id(),
                        height,
                        reason
                    );
                    return Err(Error::ReorgBeyondRetention {
                        height: height.saturating_sub(1),
                        earliest_retained: monitor.earliest_retained_height(),
                    });
                }
            };
            warn!("{}: {} rewinding: {}", short_function!(), monitor.channel_id(), reason);
            let rewound = monitor.rewind_to(parent)?;
            let mut outcome = monitor.apply_block(header, height, txs, feerate)?;
            outcome.changed |= rewound;
            Ok(outcome)
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::HtlcDirection::Received;
    use crate::coordinator::{completion_channel, CompletionSender};
    use crate::events::{ClosureReason, SpendableKind};
    use crate::util::mocks::*;
    use crate::util::test_utils::*;
    use test_log::test;

    struct Harness {
        filter: Arc<MockFilter>,
        broadcaster: Arc<MockBroadcaster>,
        signer: Arc<MockSigner>,
        persister: Arc<MockPersister>,
        listener: Arc<RecordingListener>,
        sender: CompletionSender,
    }

    impl Harness {
        fn new(persister: Arc<MockPersister>) -> Self {
            let (sender, _) = completion_channel();
            Harness {
                filter: Arc::new(MockFilter::new()),
                broadcaster: Arc::new(MockBroadcaster::new()),
                signer: Arc::new(MockSigner::new()),
                persister,
                listener: Arc::new(RecordingListener::new()),
                sender,
            }
        }

        fn services(&self) -> ChainServices {
            ChainServices {
                filter: self.filter.clone(),
                broadcaster: self.broadcaster.clone(),
                fee_estimator: Arc::new(MockFeeEstimator::new(1000)),
                signer: self.signer.clone(),
                persister: self.persister.clone(),
                listener: self.listener.clone(),
            }
        }

        fn tracker(&mut self, tip: ChainTip) -> ChainTracker {
            let (sender, receiver) = completion_channel();
            self.sender = sender;
            ChainTracker::new(tip, self.services(), MonitorConfig::default(), receiver).unwrap()
        }

        fn load(&mut self, tip: ChainTip) -> Result<ChainTracker, Error> {
            let (sender, receiver) = completion_channel();
            self.sender = sender;
            ChainTracker::load(tip, self.services(), MonitorConfig::default(), receiver)
        }
    }

    fn setup(asynchronous: bool) -> (Harness, ChannelFixture, TestChain, ChainTracker) {
        let mut harness = Harness::new(Arc::new(MockPersister::new(asynchronous)));
        let fixture = ChannelFixture::new(1);
        let chain = TestChain::new(100);
        let tracker = harness.tracker(chain.tip());
        tracker.watch_channel(fixture.monitor(chain.tip(), &MonitorConfig::default())).unwrap();
        (harness, fixture, chain, tracker)
    }

    fn connect(tracker: &ChainTracker, chain: &mut TestChain, txs: &[Transaction]) {
        let (header, height) = chain.next();
        let failures = tracker.block_connected(&header, height, txs).unwrap();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn watch_registers_and_persists() {
        let (harness, fixture, chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        assert!(harness.filter.has_output(&fixture.params.funding_outpoint));
        assert!(harness.filter.has_txid(&fixture.params.funding_outpoint.txid));
        assert!(harness.filter.has_txid(&fixture.holder_tx(0, &[]).compute_txid()));
        assert_eq!(harness.persister.stored(&channel_id).unwrap().latest_update_id, 0);
        assert_eq!(harness.listener.notifications(), vec![(channel_id, 0)]);
        assert_eq!(tracker.list_channels(), vec![channel_id]);

        let again = fixture.monitor(chain.tip(), &MonitorConfig::default());
        assert_eq!(tracker.watch_channel(again), Err(Error::DuplicateChannel(channel_id)));
    }

    #[test]
    fn watch_requires_synced_monitor() {
        let (_harness, _fixture, mut chain, tracker) = setup(false);
        let other = ChannelFixture::new(2);
        let stale = other.monitor(chain.tip(), &MonitorConfig::default());
        connect(&tracker, &mut chain, &[]);
        assert!(matches!(tracker.watch_channel(stale), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn blocks_must_extend_tip() {
        let (_harness, _fixture, mut chain, tracker) = setup(false);
        let (header, height) = chain.next();
        tracker.block_connected(&header, height, &[]).unwrap();
        // re-delivery of the tip is a no-op
        assert!(tracker.block_connected(&header, height, &[]).unwrap().is_empty());
        chain.next();
        let (skipped, height) = chain.next();
        assert!(matches!(
            tracker.block_connected(&skipped, height, &[]),
            Err(Error::InvalidBlock(_))
        ));
        assert_eq!(tracker.tip().height, 101);
    }

    #[test]
    fn events_wait_for_durable_state() {
        let (harness, fixture, mut chain, tracker) = setup(true);
        harness.persister.complete_all(&harness.sender);
        connect(&tracker, &mut chain, &[fixture.funding_tx.clone()]);
        connect(&tracker, &mut chain, &[]);
        assert!(tracker.drain_events().is_empty());

        harness.persister.complete_all(&harness.sender);
        let events = tracker.drain_events();
        assert_eq!(
            events,
            vec![Event::ChannelReady { channel_id: fixture.channel_id(), funding_height: 101 }]
        );
        // queued once, but held by the monitor until acknowledged
        assert!(tracker.drain_events().is_empty());
        assert_eq!(tracker.with_monitor(&fixture.channel_id(), |m| m.pending_events().len()).unwrap(), 1);
        assert_eq!(tracker.ack_events(), 1);
        assert!(tracker.with_monitor(&fixture.channel_id(), |m| m.pending_events().is_empty()).unwrap());
        assert_eq!(tracker.ack_events(), 0);
        harness.persister.complete_all(&harness.sender);
        assert!(tracker.drain_events().is_empty());
    }

    #[test]
    fn update_unblocks_after_async_ack() {
        let (harness, fixture, _chain, tracker) = setup(true);
        let channel_id = fixture.channel_id();
        harness.persister.complete_all(&harness.sender);
        tracker.drain_events();
        assert_eq!(harness.listener.notifications(), vec![(channel_id, 0)]);

        let update = tracker.update_commitment(&channel_id, fixture.state(1, &[])).unwrap();
        assert_eq!(update.update_id, 1);
        tracker.process_pending_persistence(Instant::now());
        assert_eq!(harness.listener.notifications(), vec![(channel_id, 0)]);

        harness.persister.complete_all(&harness.sender);
        tracker.process_pending_persistence(Instant::now());
        assert_eq!(harness.listener.notifications(), vec![(channel_id, 0), (channel_id, 1)]);
        // the new holder commitment is watched
        assert!(harness.filter.has_txid(&fixture.holder_tx(1, &[]).compute_txid()));
    }

    #[test]
    fn persistence_failure_blocks_until_force_close() {
        let (harness, fixture, _chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        harness.persister.fail_next(100);
        tracker.update_commitment(&channel_id, fixture.state(1, &[])).unwrap();
        assert!(matches!(
            tracker.update_commitment(&channel_id, fixture.state(2, &[])),
            Err(Error::PersistenceFailure { .. })
        ));

        let update = tracker.force_close(&channel_id).unwrap();
        assert_eq!(update.update_id, 2);
        let broadcast = harness.broadcaster.broadcasted();
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].compute_txid(), fixture.holder_tx(1, &[]).compute_txid());
        assert!(!tracker.coordinator().is_blocked(&channel_id));
    }

    #[test]
    fn stale_update_fails_channel_until_reload() {
        let (_harness, fixture, _chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        tracker.update_commitment(&channel_id, fixture.state(1, &[])).unwrap();
        assert!(matches!(
            tracker.update_commitment(&channel_id, fixture.state(3, &[])),
            Err(Error::StaleUpdate { expected: 2, got: 3, .. })
        ));
        assert!(tracker.is_failed(&channel_id));
        assert_eq!(
            tracker.update_commitment(&channel_id, fixture.state(2, &[])),
            Err(Error::ChannelFailed(channel_id))
        );

        let best = tracker.reload_channel(&channel_id).unwrap();
        assert_eq!(best, tracker.tip());
        assert!(!tracker.is_failed(&channel_id));
        tracker.update_commitment(&channel_id, fixture.state(2, &[])).unwrap();
    }

    #[test]
    fn revoked_commitment_is_punished() {
        let (harness, fixture, mut chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        let htlc = fixture.htlc(1, 50_000, 300, Received);
        for n in 1..=4 {
            let htlcs = if n == 2 { vec![htlc.clone()] } else { vec![] };
            tracker.update_commitment(&channel_id, fixture.state(n, &htlcs)).unwrap();
        }
        connect(&tracker, &mut chain, &[fixture.funding_tx.clone()]);
        connect(&tracker, &mut chain, &[]);
        tracker.drain_events();

        let revoked = fixture.counterparty_tx(2, &[htlc]);
        connect(&tracker, &mut chain, &[revoked.clone()]);
        let events = tracker.drain_events();
        assert_eq!(
            events,
            vec![Event::ChannelClosed {
                channel_id,
                closing_txid: revoked.compute_txid(),
                reason: ClosureReason::CounterpartyRevokedCommitment { commitment_number: 2 },
            }]
        );
        let broadcast = harness.broadcaster.broadcasted();
        assert_eq!(broadcast.len(), 1);
        let justice = broadcast[0].clone();
        assert_eq!(justice.input.len(), 3);
        assert!(justice.input.iter().all(|i| !i.witness.is_empty()));
        assert!(harness.filter.has_txid(&justice.compute_txid()));

        connect(&tracker, &mut chain, &[justice.clone()]);
        for _ in 0..5 {
            connect(&tracker, &mut chain, &[]);
        }
        match &tracker.drain_events()[..] {
            [Event::SpendableOutputs { outputs, .. }] => {
                assert_eq!(outputs.len(), 1);
                assert_eq!(outputs[0].kind, SpendableKind::Justice);
                assert_eq!(outputs[0].outpoint.txid, justice.compute_txid());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unacknowledged_events_survive_restart() {
        let (mut harness, fixture, mut chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        connect(&tracker, &mut chain, &[fixture.funding_tx.clone()]);
        connect(&tracker, &mut chain, &[fixture.cooperative_close_tx(590_000)]);
        for _ in 0..5 {
            connect(&tracker, &mut chain, &[]);
        }
        let spendable = |events: &[Event]| {
            events.iter().filter(|e| matches!(e, Event::SpendableOutputs { .. })).count()
        };
        assert_eq!(spendable(&tracker.drain_events()), 1);

        // crash before the host acknowledged
        drop(tracker);
        let tracker = harness.load(chain.tip()).unwrap();
        assert!(tracker.archive_fully_resolved_channels().unwrap().is_empty());
        let events = tracker.drain_events();
        assert_eq!(spendable(&events), 1);
        match events.iter().find(|e| matches!(e, Event::SpendableOutputs { .. })) {
            Some(Event::SpendableOutputs { outputs, .. }) => assert_eq!(outputs[0].amount_sat, 590_000),
            other => panic!("unexpected {:?}", other),
        }

        assert!(tracker.ack_events() > 0);
        drop(tracker);
        let tracker = harness.load(chain.tip()).unwrap();
        assert!(tracker.drain_events().is_empty());
        assert_eq!(tracker.archive_fully_resolved_channels().unwrap(), vec![channel_id]);
    }

    #[test]
    fn fork_below_retention_fails_channel() {
        let config = MonitorConfig { max_reorg_depth: 10, ..Default::default() };
        let mut harness = Harness::new(Arc::new(MockPersister::new(false)));
        let mut chain = TestChain::new(100);
        let a = ChannelFixture::new(1);
        let b = ChannelFixture::new(2);
        let (_, receiver) = completion_channel();
        let tracker =
            ChainTracker::new(chain.tip(), harness.services(), config.clone(), receiver).unwrap();
        tracker.watch_channel(a.monitor(chain.tip(), &config)).unwrap();
        tracker.watch_channel(b.monitor(chain.tip(), &config)).unwrap();
        connect(&tracker, &mut chain, &[b.funding_tx.clone()]);
        while chain.height() < 130 {
            connect(&tracker, &mut chain, &[]);
        }
        // b is persisted at 130, a is still at 100
        tracker.update_commitment(&b.channel_id(), b.state(1, &[])).unwrap();
        drop(tracker);

        harness.filter = Arc::new(MockFilter::new());
        let (_, receiver) = completion_channel();
        let tracker =
            ChainTracker::load(chain.tip(), harness.services(), config.clone(), receiver).unwrap();
        assert_eq!(tracker.tip().height, 100);
        assert_eq!(tracker.get_monitor(&b.channel_id()).unwrap().earliest_retained_height(), 121);

        // a chain forking at 110, below what b retains
        let mut fork = TestChain::new(100);
        let mut failures = Vec::new();
        while fork.height() < 125 {
            if fork.height() == 110 {
                fork.salt(4);
            }
            let (header, height) = fork.next();
            let txs = if height == 101 { vec![b.funding_tx.clone()] } else { vec![] };
            for (channel_id, e) in tracker.block_connected(&header, height, &txs).unwrap() {
                failures.push((height, channel_id, e));
            }
        }
        assert_eq!(
            failures,
            vec![(
                120,
                b.channel_id(),
                Error::ReorgBeyondRetention { height: 119, earliest_retained: 121 }
            )]
        );
        assert!(tracker.is_failed(&b.channel_id()));
        assert!(!tracker.is_failed(&a.channel_id()));
        assert_eq!(tracker.tip(), fork.tip());
        assert_eq!(tracker.get_monitor(&a.channel_id()).unwrap().best_block(), fork.tip());
    }

    #[test]
    fn reloaded_channel_catches_up_by_replay() {
        let (_harness, fixture, mut chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        connect(&tracker, &mut chain, &[fixture.funding_tx.clone()]);
        // the channel becomes ready at 102, the last change persisted
        while chain.height() < 104 {
            connect(&tracker, &mut chain, &[]);
        }
        assert!(tracker.update_commitment(&channel_id, fixture.state(3, &[])).is_err());
        assert!(tracker.is_failed(&channel_id));
        assert_eq!(tracker.reload_channel(&channel_id).unwrap().height, 102);

        // a block arriving before the replay leaves the channel behind
        connect(&tracker, &mut chain, &[]);
        assert!(!tracker.is_failed(&channel_id));
        assert_eq!(tracker.get_monitor(&channel_id).unwrap().best_block().height, 102);

        for height in 103..=105 {
            tracker.replay_block(&channel_id, &chain.header_at(height), height, &[]).unwrap();
        }
        connect(&tracker, &mut chain, &[]);
        assert_eq!(tracker.get_monitor(&channel_id).unwrap().best_block(), tracker.tip());
    }

    #[test]
    fn cannot_disconnect_below_height_zero() {
        let mut harness = Harness::new(Arc::new(MockPersister::new(false)));
        let chain = TestChain::new(0);
        let tracker = harness.tracker(chain.tip());
        assert!(matches!(
            tracker.block_disconnected(&chain.tip_header(), 0),
            Err(Error::InvalidBlock(_))
        ));
        assert_eq!(tracker.tip(), chain.tip());
    }

    #[test]
    fn altered_justice_is_not_broadcast() {
        let (harness, fixture, mut chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        tracker.update_commitment(&channel_id, fixture.state(1, &[])).unwrap();
        connect(&tracker, &mut chain, &[fixture.funding_tx.clone()]);
        harness.signer.set_tamper(true);
        connect(&tracker, &mut chain, &[fixture.counterparty_tx(0, &[])]);
        assert!(harness.broadcaster.broadcasted().is_empty());

        harness.signer.set_tamper(false);
        tracker.rebroadcast_pending_claims();
        let broadcast = harness.broadcaster.broadcasted();
        assert_eq!(broadcast.len(), 1);
        let justice = tracker.with_monitor(&channel_id, |m| m.pending_justice().cloned()).unwrap();
        assert_eq!(broadcast[0].compute_txid(), justice.unwrap().tx.compute_txid());
    }

    #[test]
    fn justice_is_rebroadcast_when_signer_recovers() {
        let (harness, fixture, mut chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        tracker.update_commitment(&channel_id, fixture.state(1, &[])).unwrap();
        connect(&tracker, &mut chain, &[fixture.funding_tx.clone()]);
        harness.signer.set_fail(true);
        connect(&tracker, &mut chain, &[fixture.counterparty_tx(0, &[])]);
        assert!(harness.broadcaster.broadcasted().is_empty());

        harness.signer.set_fail(false);
        tracker.rebroadcast_pending_claims();
        assert_eq!(harness.broadcaster.broadcasted().len(), 1);
    }

    #[test]
    fn disconnect_restores_tip_and_state() {
        let (_harness, fixture, mut chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        connect(&tracker, &mut chain, &[fixture.funding_tx.clone()]);
        let before = tracker.get_monitor(&channel_id).unwrap().chain_state().clone();
        let close = fixture.cooperative_close_tx(500_000);
        connect(&tracker, &mut chain, &[close]);
        assert!(tracker.get_monitor(&channel_id).unwrap().chain_state().closing.is_some());

        let tip = chain.tip_header();
        // only the tip can be disconnected
        assert!(matches!(
            tracker.block_disconnected(&chain.header_at(101), 101),
            Err(Error::InvalidBlock(_))
        ));
        assert!(tracker.block_disconnected(&tip, 102).unwrap().is_empty());
        assert_eq!(tracker.tip(), ChainTip::from_header(&chain.header_at(101), 101));
        assert_eq!(tracker.get_monitor(&channel_id).unwrap().chain_state(), &before);
    }

    #[test]
    fn new_refuses_unloaded_monitors() {
        let (mut harness, fixture, mut chain, tracker) = setup(false);
        connect(&tracker, &mut chain, &[fixture.funding_tx.clone()]);
        drop(tracker);

        let (_, receiver) = completion_channel();
        assert!(matches!(
            ChainTracker::new(chain.tip(), harness.services(), MonitorConfig::default(), receiver),
            Err(Error::NotLoaded(_))
        ));

        harness.filter = Arc::new(MockFilter::new());
        let tracker = harness.load(chain.tip()).unwrap();
        assert_eq!(tracker.list_channels(), vec![fixture.channel_id()]);
        assert_eq!(tracker.tip(), chain.tip());
        assert!(harness.filter.has_output(&fixture.params.funding_outpoint));
        connect(&tracker, &mut chain, &[]);
    }

    #[test]
    fn load_rebroadcasts_force_close() {
        let (mut harness, fixture, _chain, tracker) = setup(false);
        tracker.force_close(&fixture.channel_id()).unwrap();
        drop(tracker);
        harness.broadcaster.clear();
        let tracker = harness.load(TestChain::new(0).tip()).unwrap();
        assert_eq!(harness.broadcaster.broadcasted(), vec![fixture.holder_tx(0, &[])]);
        assert!(tracker.get_monitor(&fixture.channel_id()).unwrap().is_force_closed());
    }

    #[test]
    fn archive_after_cooperative_close() {
        let (harness, fixture, mut chain, tracker) = setup(false);
        let channel_id = fixture.channel_id();
        connect(&tracker, &mut chain, &[fixture.funding_tx.clone()]);
        connect(&tracker, &mut chain, &[fixture.cooperative_close_tx(590_000)]);
        assert!(tracker.archive_fully_resolved_channels().unwrap().is_empty());
        for _ in 0..5 {
            connect(&tracker, &mut chain, &[]);
        }
        let events = tracker.drain_events();
        assert!(events.iter().any(|e| matches!(e, Event::SpendableOutputs { .. })));
        // not before the host handled the events
        assert!(tracker.archive_fully_resolved_channels().unwrap().is_empty());
        tracker.ack_events();
        assert_eq!(tracker.archive_fully_resolved_channels().unwrap(), vec![channel_id]);
        assert!(tracker.list_channels().is_empty());
        assert_eq!(harness.persister.archived(), vec![channel_id]);
        assert!(tracker.claimable_balances().is_empty());
    }
}
