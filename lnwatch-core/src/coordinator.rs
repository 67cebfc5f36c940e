//! Gates channel progress on durable persistence.
//!
//! Every monitor change is handed to the [`Persist`] gateway as a full
//! snapshot, tagged with a [`MonitorUpdateId`].  Snapshots of a channel are
//! ordered by their version: a durable snapshot supersedes every older
//! request still in flight.  A channel is unblocked
//! (through [`PersistenceListener::on_update_persisted`]) only once its
//! highest submitted off-chain update is durable.  Completions of
//! asynchronous writes arrive over a channel and may be out of order.

use core::fmt;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use log::*;
use tracing::instrument;

use crate::channel::ChannelId;
use crate::config::RetryPolicy;
use crate::events::{Event, EventQueue};
use crate::monitor::MonitorUpdate;
use crate::persist::{self, MonitorSnapshot, Persist, PersistStatus};
use crate::prelude::*;
use crate::Arc;

/// Where an update came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateOrigin {
    /// An off-chain update, with its sequence number.  The initial snapshot is sequence 0.
    OffChain(u64),
    /// A change caused by blocks, numbered per channel
    ChainSync(u64),
}

/// Identifies one persistence request.  Unique per channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonitorUpdateId {
    /// The channel
    pub channel_id: ChannelId,
    /// The origin
    pub origin: UpdateOrigin,
}

impl fmt::Display for MonitorUpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            UpdateOrigin::OffChain(n) => write!(f, "{}/offchain-{}", self.channel_id, n),
            UpdateOrigin::ChainSync(n) => write!(f, "{}/chainsync-{}", self.channel_id, n),
        }
    }
}

/// State of an in-flight persistence request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistenceState {
    /// Handed to the gateway, no result yet
    Pending,
    /// Durable
    Completed,
    /// Failed, waiting to be retried
    Failed,
}

/// The result of an asynchronous persistence request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistCompletion {
    /// The request
    pub update_id: MonitorUpdateId,
    /// Success, or the error
    pub result: Result<(), persist::Error>,
}

/// Sending side of the completion channel, for asynchronous persisters
pub type CompletionSender = Sender<PersistCompletion>;
/// Receiving side of the completion channel, owned by the coordinator
pub type CompletionReceiver = Receiver<PersistCompletion>;

/// Create the channel asynchronous persisters report completions on
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    crossbeam_channel::unbounded()
}

/// Notified when a channel may make progress again
pub trait PersistenceListener: SendSync {
    /// All off-chain updates up to and including `update_id` are durable
    fn on_update_persisted(&self, channel_id: &ChannelId, update_id: u64);
}

/// A listener that ignores notifications
pub struct NullListener;

impl SendSync for NullListener {}

impl PersistenceListener for NullListener {
    fn on_update_persisted(&self, _channel_id: &ChannelId, _update_id: u64) {}
}

#[derive(Clone, Debug)]
enum Request {
    New,
    Update(Option<MonitorUpdate>),
}

#[derive(Debug)]
struct InFlight {
    // snapshot version, which orders requests within the channel
    version: u64,
    state: PersistenceState,
    request: Request,
    snapshot: MonitorSnapshot,
    attempts: u32,
    retry_at: Option<Instant>,
    escalated: bool,
}

#[derive(Debug, Default)]
struct ChannelProgress {
    highest_submitted: u64,
    highest_persisted: u64,
    highest_version: u64,
    notified: Option<u64>,
    next_chain_sync: u64,
    in_flight: OrderedMap<UpdateOrigin, InFlight>,
    failed: bool,
    force_closed: bool,
}

impl ChannelProgress {
    // A completed write carries a full snapshot, so any older snapshot is superseded
    fn discard_superseded(&mut self, version: u64) {
        self.in_flight.retain(|_, f| f.version > version);
    }
}

/// Tracks in-flight persistence per channel
pub struct UpdateCoordinator {
    persister: Arc<dyn Persist>,
    listener: Arc<dyn PersistenceListener>,
    events: Arc<EventQueue>,
    policy: RetryPolicy,
    channels: Mutex<Map<ChannelId, ChannelProgress>>,
    completions: CompletionReceiver,
}

impl UpdateCoordinator {
    /// Create a coordinator
    pub fn new(
        persister: Arc<dyn Persist>,
        listener: Arc<dyn PersistenceListener>,
        events: Arc<EventQueue>,
        policy: RetryPolicy,
        completions: CompletionReceiver,
    ) -> Self {
        UpdateCoordinator {
            persister,
            listener,
            events,
            policy,
            channels: Mutex::new(Map::new()),
            completions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<ChannelId, ChannelProgress>> {
        self.channels.lock().expect("lock")
    }

    /// Persist the first snapshot of a new channel
    pub fn submit_new(&self, snapshot: MonitorSnapshot) -> MonitorUpdateId {
        let update_id = MonitorUpdateId {
            channel_id: snapshot.channel_id,
            origin: UpdateOrigin::OffChain(snapshot.latest_update_id),
        };
        self.submit_request(update_id, Request::New, snapshot);
        update_id
    }

    /// Persist a snapshot.  `update` is the off-chain update that produced it,
    /// or `None` for block-derived changes.
    pub fn submit(
        &self,
        update: Option<&MonitorUpdate>,
        snapshot: MonitorSnapshot,
    ) -> MonitorUpdateId {
        let channel_id = snapshot.channel_id;
        let origin = match update {
            Some(u) => UpdateOrigin::OffChain(u.update_id),
            None => {
                let mut channels = self.lock();
                let progress = channels.entry(channel_id).or_default();
                progress.next_chain_sync += 1;
                UpdateOrigin::ChainSync(progress.next_chain_sync)
            }
        };
        let update_id = MonitorUpdateId { channel_id, origin };
        self.submit_request(update_id, Request::Update(update.cloned()), snapshot);
        update_id
    }

    fn submit_request(&self, update_id: MonitorUpdateId, request: Request, snapshot: MonitorSnapshot) {
        {
            let mut channels = self.lock();
            let progress = channels.entry(update_id.channel_id).or_default();
            if let UpdateOrigin::OffChain(n) = update_id.origin {
                progress.highest_submitted = progress.highest_submitted.max(n);
            }
            progress.highest_version = progress.highest_version.max(snapshot.version);
            progress.in_flight.insert(
                update_id.origin,
                InFlight {
                    version: snapshot.version,
                    state: PersistenceState::Pending,
                    request: request.clone(),
                    snapshot: snapshot.clone(),
                    attempts: 0,
                    retry_at: None,
                    escalated: false,
                },
            );
        }
        self.call_gateway(update_id, &request, &snapshot);
    }

    // Must be called without holding the channels lock
    fn call_gateway(&self, update_id: MonitorUpdateId, request: &Request, snapshot: &MonitorSnapshot) {
        let status = match request {
            Request::New => self.persister.persist_new_channel(&update_id, snapshot),
            Request::Update(update) =>
                self.persister.update_persisted_channel(&update_id, update.as_ref(), snapshot),
        };
        match status {
            PersistStatus::Completed => self.on_persisted(update_id),
            PersistStatus::InProgress => {
                debug!("persistence of {} in progress", update_id);
            }
            PersistStatus::Failed(e) => self.on_persist_failed(update_id, e),
        }
    }

    /// A persistence request completed.  Unknown and superseded ids are ignored.
    #[instrument(skip(self))]
    pub fn on_persisted(&self, update_id: MonitorUpdateId) {
        let channel_id = update_id.channel_id;
        let notify = {
            let mut channels = self.lock();
            let progress = match channels.get_mut(&channel_id) {
                Some(p) => p,
                None => {
                    debug!("completion for unknown channel {}", channel_id);
                    return;
                }
            };
            let entry = match progress.in_flight.remove(&update_id.origin) {
                Some(e) => e,
                None => {
                    debug!("completion for {} which is no longer in flight", update_id);
                    return;
                }
            };
            progress.discard_superseded(entry.version);
            let covered = entry.snapshot.latest_update_id;
            if covered > progress.highest_persisted {
                progress.highest_persisted = covered;
            }
            let any_failed =
                progress.in_flight.values().any(|f| f.state == PersistenceState::Failed);
            progress.failed = any_failed;
            if covered == progress.highest_submitted
                && progress.notified.map_or(true, |n| covered > n)
            {
                progress.notified = Some(covered);
                Some(covered)
            } else {
                None
            }
        };
        debug!("persisted {}", update_id);
        if let Some(n) = notify {
            info!("channel {} unblocked at update {}", channel_id, n);
            self.listener.on_update_persisted(&channel_id, n);
        }
    }

    /// A persistence request failed.  It will be retried after a backoff, and
    /// escalated to the host after repeated failures.
    #[instrument(skip(self))]
    pub fn on_persist_failed(&self, update_id: MonitorUpdateId, error: persist::Error) {
        let channel_id = update_id.channel_id;
        let stalled = {
            let mut channels = self.lock();
            let progress = match channels.get_mut(&channel_id) {
                Some(p) => p,
                None => return,
            };
            let entry = match progress.in_flight.get_mut(&update_id.origin) {
                Some(e) => e,
                None => {
                    debug!("failure for {} which is no longer in flight", update_id);
                    return;
                }
            };
            entry.state = PersistenceState::Failed;
            entry.attempts += 1;
            entry.retry_at = Some(Instant::now() + self.policy.backoff(entry.attempts));
            progress.failed = true;
            warn!("persistence of {} failed (attempt {}): {}", update_id, entry.attempts, error);
            if entry.attempts >= self.policy.escalate_after && !entry.escalated {
                entry.escalated = true;
                Some(entry.attempts)
            } else {
                None
            }
        };
        if let Some(attempts) = stalled {
            error!("persistence of channel {} stalled after {} attempts", channel_id, attempts);
            self.events.push(Event::PersistenceStalled { channel_id, attempts });
        }
    }

    /// Handle completions reported by asynchronous persisters.  Returns the number handled.
    pub fn process_completions(&self) -> usize {
        let mut count = 0;
        while let Ok(completion) = self.completions.try_recv() {
            match completion.result {
                Ok(()) => self.on_persisted(completion.update_id),
                Err(e) => self.on_persist_failed(completion.update_id, e),
            }
            count += 1;
        }
        count
    }

    /// Resubmit failed requests whose backoff expired.  Only the newest failed
    /// request of a channel is retried, older ones are superseded by it.
    pub fn retry_failed(&self, now: Instant) -> usize {
        let due: Vec<(MonitorUpdateId, Request, MonitorSnapshot)> = {
            let mut channels = self.lock();
            let mut due = Vec::new();
            for (channel_id, progress) in channels.iter_mut() {
                let newest = progress
                    .in_flight
                    .iter()
                    .filter(|(_, f)| f.state == PersistenceState::Failed)
                    .max_by_key(|(_, f)| f.version)
                    .map(|(origin, f)| (*origin, f.version));
                let (origin, version) = match newest {
                    Some(n) => n,
                    None => continue,
                };
                // older failed requests are covered by the newest snapshot
                progress.in_flight.retain(|_, f| {
                    f.state != PersistenceState::Failed || f.version >= version
                });
                let entry = match progress.in_flight.get_mut(&origin) {
                    Some(e) => e,
                    None => continue,
                };
                if entry.retry_at.map_or(false, |at| at > now) {
                    continue;
                }
                entry.state = PersistenceState::Pending;
                let update_id = MonitorUpdateId { channel_id: *channel_id, origin };
                due.push((update_id, entry.request.clone(), entry.snapshot.clone()));
            }
            due
        };
        for (update_id, request, snapshot) in &due {
            info!("retrying persistence of {}", update_id);
            self.call_gateway(*update_id, request, snapshot);
        }
        due.len()
    }

    /// The state of a request, or `None` if it is not in flight
    pub fn persistence_state(&self, update_id: &MonitorUpdateId) -> Option<PersistenceState> {
        let channels = self.lock();
        channels
            .get(&update_id.channel_id)
            .and_then(|p| p.in_flight.get(&update_id.origin))
            .map(|f| f.state)
    }

    /// Whether the channel has requests that are not yet durable
    pub fn has_in_flight(&self, channel_id: &ChannelId) -> bool {
        self.lock().get(channel_id).map_or(false, |p| !p.in_flight.is_empty())
    }

    /// Whether the channel is blocked by a persistence failure.  A force-closed
    /// channel is never blocked, so the close can proceed while retries continue.
    pub fn is_blocked(&self, channel_id: &ChannelId) -> bool {
        self.lock().get(channel_id).map_or(false, |p| p.failed && !p.force_closed)
    }

    /// Highest off-chain update known durable
    pub fn highest_persisted(&self, channel_id: &ChannelId) -> Option<u64> {
        self.lock().get(channel_id).map(|p| p.highest_persisted)
    }

    /// Highest snapshot version submitted for the channel
    pub fn highest_version(&self, channel_id: &ChannelId) -> Option<u64> {
        self.lock().get(channel_id).map(|p| p.highest_version)
    }

    /// The channel was force-closed
    pub fn force_closed(&self, channel_id: &ChannelId) {
        if let Some(progress) = self.lock().get_mut(channel_id) {
            progress.force_closed = true;
        }
    }

    /// Forget a channel, after it was archived
    pub fn remove_channel(&self, channel_id: &ChannelId) {
        self.lock().remove(channel_id);
    }
}
