use alloc::collections::VecDeque;

use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelId, PaymentHash};
use crate::prelude::*;

/// Why a channel closed on-chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureReason {
    /// Our commitment transaction confirmed
    HolderForceClosed,
    /// The counterparty's current (or not yet revoked) commitment confirmed
    CounterpartyForceClosed,
    /// A revoked counterparty commitment confirmed and we are claiming it
    CounterpartyRevokedCommitment {
        /// The revoked commitment number
        commitment_number: u64,
    },
    /// A cooperative closing transaction confirmed
    CooperativeClosure,
}

/// What kind of output a [`SpendableOutput`] is
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendableKind {
    /// Our balance on a commitment or closing transaction
    Balance,
    /// An HTLC we offered, past its expiry
    HtlcTimeout {
        /// the payment hash
        payment_hash: PaymentHash,
    },
    /// An HTLC we received, for which we have the preimage
    HtlcSuccess {
        /// the payment hash
        payment_hash: PaymentHash,
    },
    /// The output of our justice transaction
    Justice,
}

/// An output the host wallet can now sweep
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendableOutput {
    /// The outpoint
    pub outpoint: OutPoint,
    /// The value
    pub amount_sat: u64,
    /// The script being spent
    pub script_pubkey: ScriptBuf,
    /// The relative delay the spending input must carry
    pub csv_delay: u16,
    /// What this output is
    pub kind: SpendableKind,
}

/// An event for the host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// The funding transaction reached its minimum depth
    ChannelReady {
        /// channel
        channel_id: ChannelId,
        /// height the funding transaction confirmed at
        funding_height: u32,
    },
    /// A transaction spending the funding output confirmed
    ChannelClosed {
        /// channel
        channel_id: ChannelId,
        /// the closing transaction
        closing_txid: Txid,
        /// classification of the closing transaction
        reason: ClosureReason,
    },
    /// Outputs have matured and are irreversibly ours
    SpendableOutputs {
        /// channel
        channel_id: ChannelId,
        /// the outputs
        outputs: Vec<SpendableOutput>,
    },
    /// An outbound HTLC was resolved by timeout on-chain
    PaymentPathFailed {
        /// channel
        channel_id: ChannelId,
        /// the payment hash
        payment_hash: PaymentHash,
    },
    /// Persistence of a channel keeps failing
    PersistenceStalled {
        /// channel
        channel_id: ChannelId,
        /// the number of failed attempts so far
        attempts: u32,
    },
}

/// A queue of events waiting to be drained by the host.
///
/// Producers may push from any thread.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn push(&self, event: Event) {
        self.lock().push_back(event);
    }

    /// Append several events, preserving their order
    pub fn extend<I: IntoIterator<Item = Event>>(&self, events: I) {
        self.lock().extend(events);
    }

    /// Remove and return all queued events in FIFO order
    pub fn drain(&self) -> Vec<Event> {
        self.lock().drain(..).collect()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        // a poisoned queue still holds valid events
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}
