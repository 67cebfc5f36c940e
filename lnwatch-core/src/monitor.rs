use alloc::collections::VecDeque;
use core::{cmp, mem};

use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use log::*;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::chain::interface::WatchedOutput;
use crate::channel::{
    ChannelId, ChannelParameters, CommitmentOutputs, CommitmentSecret, CommitmentState,
    CounterpartyCommitment, HolderCommitment, Htlc, HtlcDirection, HtlcResolution, HtlcState,
    PaymentHash, PaymentPreimage, Revocation,
};
use crate::config::MonitorConfig;
use crate::events::{ClosureReason, Event, SpendableKind, SpendableOutput};
use crate::persist::MonitorSnapshot;
use crate::prelude::*;
use crate::short_function;
use crate::Error;

/// Outputs below this value are not worth claiming
pub const DUST_LIMIT_SAT: u64 = 546;

// Upper bound on the witness weight of a revocation-path input
const JUSTICE_INPUT_WITNESS_WEIGHT: u64 = 243;

/// A block height and hash
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    /// height
    pub height: u32,
    /// block hash
    pub block_hash: BlockHash,
}

impl ChainTip {
    /// The tip after connecting `header` at `height`
    pub fn from_header(header: &Header, height: u32) -> Self {
        ChainTip { height, block_hash: header.block_hash() }
    }
}

/// A single change to the monitor's off-chain state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStep {
    /// Our new commitment transaction and HTLC set
    LatestHolderCommitment {
        /// the commitment
        commitment: HolderCommitment,
        /// the HTLC set
        htlcs: Vec<Htlc>,
    },
    /// The counterparty's new commitment.  The previous one becomes a prior commitment.
    LatestCounterpartyCommitment {
        /// the commitment
        commitment: CounterpartyCommitment,
    },
    /// The counterparty revoked an earlier commitment
    CommitmentSecret {
        /// the revocation
        revocation: Revocation,
    },
    /// We learned a payment preimage
    PaymentPreimage {
        /// the preimage
        preimage: PaymentPreimage,
    },
    /// We force-closed the channel by broadcasting our commitment
    ChannelForceClosed,
}

/// An ordered off-chain update to a monitor.
///
/// `update_id` is strictly increasing per channel, without gaps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorUpdate {
    /// sequence number
    pub update_id: u64,
    /// the steps, applied in order
    pub steps: Vec<UpdateStep>,
}

/// Result of [`ChannelMonitor::apply_update`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateApplied {
    /// The update was applied
    Applied,
    /// The update was already applied earlier, nothing changed
    AlreadyApplied,
}

/// What a tracked output is, from our point of view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    /// Our balance
    Balance,
    /// An HTLC we offered, ours after expiry
    OfferedHtlc {
        /// the payment hash
        payment_hash: PaymentHash,
    },
    /// An HTLC we received, ours with the preimage
    ReceivedHtlc {
        /// the payment hash
        payment_hash: PaymentHash,
    },
    /// An output of a revoked commitment, swept by the justice transaction.
    /// The counterparty's second-stage spend of a revoked HTLC output is
    /// revocable as well.
    Revoked {
        /// whether this is an HTLC output of the revoked commitment
        htlc: bool,
    },
    /// The output of our justice transaction
    Justice,
}

/// An on-chain output the monitor follows until it is resolved
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedOutput {
    /// the outpoint
    pub outpoint: OutPoint,
    /// the value
    pub amount_sat: u64,
    /// the output script
    pub script_pubkey: ScriptBuf,
    /// what it is
    pub kind: OutputKind,
    /// height of the transaction that created it
    pub confirmation_height: u32,
    /// relative timelock
    pub csv_delay: u16,
    /// HTLC expiry, for HTLC outputs
    pub cltv_expiry: Option<u32>,
    /// the transaction that spent it, if any
    pub spent_by: Option<Txid>,
}

impl TrackedOutput {
    /// The height at which this output becomes irreversibly ours
    pub fn maturity_height(&self, anti_reorg_delay: u32) -> u32 {
        let csv = self.confirmation_height + self.csv_delay as u32;
        let anti_reorg = self.confirmation_height + anti_reorg_delay - 1;
        let cltv = match self.kind {
            OutputKind::OfferedHtlc { .. } => self.cltv_expiry.unwrap_or(0),
            _ => 0,
        };
        cmp::max(cmp::max(csv, anti_reorg), cltv)
    }

    fn watched(&self) -> WatchedOutput {
        WatchedOutput {
            block_hash: None,
            outpoint: self.outpoint,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// The transaction that spent the funding output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosingInfo {
    /// closing txid
    pub txid: Txid,
    /// confirmation height
    pub height: u32,
    /// classification
    pub reason: ClosureReason,
}

/// An unsigned justice transaction, waiting for confirmation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJustice {
    /// the unsigned transaction
    pub tx: Transaction,
    /// values of the spent outputs, in input order
    pub input_amounts_sat: Vec<u64>,
    /// the revocation that lets us sign it
    pub revocation: Revocation,
}

/// The part of the monitor state derived from blocks.
///
/// Every block applied to it is journaled, and disconnecting the block
/// restores it exactly.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    /// last applied block
    pub best_block: ChainTip,
    /// funding confirmation height
    pub funding_height: Option<u32>,
    /// the confirmed funding spend
    pub closing: Option<ClosingInfo>,
    /// outputs we follow
    #[serde_as(as = "Vec<(_, _)>")]
    pub outputs: OrderedMap<OutPoint, TrackedOutput>,
    /// justice transaction awaiting confirmation
    pub pending_justice: Option<PendingJustice>,
}

// A state change detected in a block, with what is needed to revert it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum StateChange {
    // The funding transaction confirmed
    FundingConfirmed,
    // A funding spend confirmed.  The outputs we started tracking are listed.
    ClosingConfirmed { closing: ClosingInfo, outputs: Vec<OutPoint> },
    // A tracked output was spent
    OutputSpent { outpoint: OutPoint },
    // Our justice transaction confirmed, creating the given output
    JusticeConfirmed { justice: PendingJustice, output: Option<OutPoint> },
    // The counterparty spent revoked outputs first.  The justice transaction
    // was rebuilt and their second-stage outputs are tracked.
    JusticeRebuilt { previous: Option<PendingJustice>, outputs: Vec<OutPoint> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct BlockRecord {
    height: u32,
    block_hash: BlockHash,
    prev: ChainTip,
    changes: Vec<StateChange>,
}

// Which events were already emitted.  Never rolled back, so that a
// re-connected block doesn't emit again.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct EventLedger {
    channel_ready: bool,
    closings: OrderedSet<Txid>,
    spendable: OrderedSet<OutPoint>,
}

/// What happened when a block was applied
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    /// whether the monitor changed beyond advancing its best block
    pub changed: bool,
    /// a justice transaction that should be signed and broadcast
    pub justice: Option<PendingJustice>,
}

/// A claimable balance
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Balance {
    /// The channel is open.  This is our balance in the latest commitment.
    ClaimableOnChannelClose {
        /// amount
        amount_sat: u64,
    },
    /// Ours once the given height is reached
    ClaimableAwaitingConfirmations {
        /// amount
        amount_sat: u64,
        /// the height at which it becomes spendable
        confirmation_height: u32,
    },
    /// A received HTLC we have the preimage for
    ContentiousClaimable {
        /// amount
        amount_sat: u64,
        /// the counterparty may time it out after this height
        timeout_height: u32,
        /// payment hash
        payment_hash: PaymentHash,
    },
    /// An offered HTLC, ours after expiry unless the counterparty claims it
    MaybeTimeoutClaimableHtlc {
        /// amount
        amount_sat: u64,
        /// height at which we can claim it
        claimable_height: u32,
        /// payment hash
        payment_hash: PaymentHash,
    },
    /// A received HTLC we don't have the preimage for
    MaybePreimageClaimableHtlc {
        /// amount
        amount_sat: u64,
        /// the HTLC expiry
        expiry_height: u32,
        /// payment hash
        payment_hash: PaymentHash,
    },
    /// An output of a revoked commitment we are sweeping
    CounterpartyRevokedOutputClaimable {
        /// amount
        amount_sat: u64,
    },
}

impl Balance {
    /// The amount
    pub fn amount_sat(&self) -> u64 {
        match self {
            Balance::ClaimableOnChannelClose { amount_sat }
            | Balance::ClaimableAwaitingConfirmations { amount_sat, .. }
            | Balance::ContentiousClaimable { amount_sat, .. }
            | Balance::MaybeTimeoutClaimableHtlc { amount_sat, .. }
            | Balance::MaybePreimageClaimableHtlc { amount_sat, .. }
            | Balance::CounterpartyRevokedOutputClaimable { amount_sat } => *amount_sat,
        }
    }
}

/// Watches the chain on behalf of one channel.
///
/// Holds the off-chain commitment data needed to recognize and react to any
/// transaction spending the funding output, and the block-derived
/// [`ChainState`] with its reorg journal.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelMonitor {
    channel_id: ChannelId,
    params: ChannelParameters,
    latest_update_id: u64,
    commitment_number: u64,
    holder_commitment: HolderCommitment,
    htlcs: Vec<Htlc>,
    counterparty_commitment: CounterpartyCommitment,
    #[serde_as(as = "Vec<(_, _)>")]
    prior_counterparty_commitments: OrderedMap<Txid, CounterpartyCommitment>,
    #[serde_as(as = "Vec<(_, _)>")]
    revocation_secrets: OrderedMap<u64, CommitmentSecret>,
    #[serde_as(as = "Vec<(_, _)>")]
    preimages: OrderedMap<PaymentHash, PaymentPreimage>,
    force_closed: bool,
    chain: ChainState,
    journal: VecDeque<BlockRecord>,
    ledger: EventLedger,
    pending_events: Vec<Event>,
    snapshot_version: u64,
    #[serde(skip)]
    config: MonitorConfig,
}

impl ChannelMonitor {
    /// Create a monitor for a channel in its initial state, synced to `best_block`
    pub fn new(
        params: ChannelParameters,
        initial: CommitmentState,
        best_block: ChainTip,
        config: &MonitorConfig,
    ) -> Result<Self, Error> {
        let channel_id = ChannelId(params.funding_outpoint);
        if !spends(&initial.holder_tx, &params.funding_outpoint) {
            return Err(Error::InvalidArgument(format!(
                "holder commitment does not spend funding outpoint {}",
                params.funding_outpoint
            )));
        }
        let holder_commitment = HolderCommitment {
            commitment_number: initial.commitment_number,
            tx: initial.holder_tx,
            outputs: initial.holder_outputs,
        };
        let counterparty_commitment = CounterpartyCommitment {
            commitment_number: initial.commitment_number,
            txid: initial.counterparty_txid,
            outputs: initial.counterparty_outputs,
        };
        let chain = ChainState {
            best_block,
            funding_height: None,
            closing: None,
            outputs: OrderedMap::new(),
            pending_justice: None,
        };
        Ok(ChannelMonitor {
            channel_id,
            params,
            latest_update_id: 0,
            commitment_number: initial.commitment_number,
            holder_commitment,
            htlcs: initial.htlcs,
            counterparty_commitment,
            prior_counterparty_commitments: OrderedMap::new(),
            revocation_secrets: OrderedMap::new(),
            preimages: OrderedMap::new(),
            force_closed: false,
            chain,
            journal: VecDeque::new(),
            ledger: EventLedger::default(),
            pending_events: Vec::new(),
            snapshot_version: 0,
            config: config.clone(),
        })
    }

    /// The channel
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Static parameters
    pub fn params(&self) -> &ChannelParameters {
        &self.params
    }

    /// Latest applied off-chain update
    pub fn latest_update_id(&self) -> u64 {
        self.latest_update_id
    }

    /// Current commitment number
    pub fn commitment_number(&self) -> u64 {
        self.commitment_number
    }

    /// Our latest commitment
    pub fn holder_commitment(&self) -> &HolderCommitment {
        &self.holder_commitment
    }

    /// Block-derived state
    pub fn chain_state(&self) -> &ChainState {
        &self.chain
    }

    /// Last applied block
    pub fn best_block(&self) -> ChainTip {
        self.chain.best_block
    }

    /// Whether we broadcast our commitment
    pub fn is_force_closed(&self) -> bool {
        self.force_closed
    }

    /// Whether the channel no longer accepts new commitments
    pub fn is_closing(&self) -> bool {
        self.force_closed || self.chain.closing.is_some()
    }

    /// Confirmations of the funding transaction, zero if unconfirmed
    pub fn funding_depth(&self) -> u32 {
        self.chain.funding_height.map(|h| self.chain.best_block.height + 1 - h).unwrap_or(0)
    }

    /// Earliest height that can still be disconnected
    pub fn earliest_retained_height(&self) -> u32 {
        self.journal.front().map(|r| r.height).unwrap_or(self.chain.best_block.height + 1)
    }

    /// Events waiting to be released to the host
    pub fn pending_events(&self) -> &[Event] {
        &self.pending_events
    }

    /// Remove and return the events waiting to be released
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        mem::take(&mut self.pending_events)
    }

    /// Remove the oldest `count` pending events, once the host handled them
    pub fn acknowledge_events(&mut self, count: usize) {
        let count = cmp::min(count, self.pending_events.len());
        self.pending_events.drain(..count);
    }

    /// Hash of the applied block at `height`, if it is still retained
    pub fn block_hash_at(&self, height: u32) -> Option<BlockHash> {
        if height == self.chain.best_block.height {
            return Some(self.chain.best_block.block_hash);
        }
        self.journal.iter().find_map(|r| {
            if r.height == height {
                Some(r.block_hash)
            } else if r.prev.height == height {
                Some(r.prev.block_hash)
            } else {
                None
            }
        })
    }

    pub(crate) fn set_config(&mut self, config: &MonitorConfig) {
        self.config = config.clone();
    }

    // Versions of snapshots taken after a reload must be above anything
    // submitted before it
    pub(crate) fn resume_versions_after(&mut self, version: u64) {
        self.snapshot_version = cmp::max(self.snapshot_version, version);
    }

    /// Apply a new channel state, producing the corresponding update
    pub fn update_commitment(&mut self, state: CommitmentState) -> Result<MonitorUpdate, Error> {
        let expected = self.commitment_number + 1;
        if state.commitment_number != expected {
            return Err(Error::StaleUpdate {
                channel_id: self.channel_id,
                expected,
                got: state.commitment_number,
            });
        }
        let mut steps = vec![
            UpdateStep::LatestHolderCommitment {
                commitment: HolderCommitment {
                    commitment_number: state.commitment_number,
                    tx: state.holder_tx,
                    outputs: state.holder_outputs,
                },
                htlcs: state.htlcs,
            },
            UpdateStep::LatestCounterpartyCommitment {
                commitment: CounterpartyCommitment {
                    commitment_number: state.commitment_number,
                    txid: state.counterparty_txid,
                    outputs: state.counterparty_outputs,
                },
            },
        ];
        if let Some(revocation) = state.revocation {
            steps.push(UpdateStep::CommitmentSecret { revocation });
        }
        self.next_update(steps)
    }

    /// Record a payment preimage
    pub fn provide_preimage(&mut self, preimage: PaymentPreimage) -> Result<MonitorUpdate, Error> {
        self.next_update(vec![UpdateStep::PaymentPreimage { preimage }])
    }

    /// Force close.  Returns the update and our commitment transaction, which
    /// should be broadcast.
    pub fn force_close(&mut self) -> Result<(MonitorUpdate, Transaction), Error> {
        let update = self.next_update(vec![UpdateStep::ChannelForceClosed])?;
        Ok((update, self.holder_commitment.tx.clone()))
    }

    fn next_update(&mut self, steps: Vec<UpdateStep>) -> Result<MonitorUpdate, Error> {
        let update = MonitorUpdate { update_id: self.latest_update_id + 1, steps };
        self.apply_update(&update)?;
        Ok(update)
    }

    /// Apply an update.  Updates at or below the latest applied update are a no-op,
    /// so updates can be replayed after a restart.
    ///
    /// The update is applied atomically: on error nothing changes.
    pub fn apply_update(&mut self, update: &MonitorUpdate) -> Result<UpdateApplied, Error> {
        if update.update_id <= self.latest_update_id {
            debug!(
                "{}: {} update {} already applied (latest {})",
                short_function!(),
                self.channel_id,
                update.update_id,
                self.latest_update_id
            );
            return Ok(UpdateApplied::AlreadyApplied);
        }
        if update.update_id != self.latest_update_id + 1 {
            return Err(Error::SequenceGap {
                channel_id: self.channel_id,
                expected: self.latest_update_id + 1,
                got: update.update_id,
            });
        }
        self.check_steps(&update.steps)?;
        for step in &update.steps {
            self.apply_step(step);
        }
        self.latest_update_id = update.update_id;
        debug!("{}: {} applied update {}", short_function!(), self.channel_id, update.update_id);
        Ok(UpdateApplied::Applied)
    }

    fn check_steps(&self, steps: &[UpdateStep]) -> Result<(), Error> {
        let channel_id = self.channel_id;
        let next = self.commitment_number + 1;
        let mut revocable: OrderedSet<u64> =
            self.prior_counterparty_commitments.values().map(|c| c.commitment_number).collect();
        let mut current_counterparty = self.counterparty_commitment.commitment_number;
        for step in steps {
            match step {
                UpdateStep::LatestHolderCommitment { commitment, .. } => {
                    if self.is_closing() {
                        return Err(Error::ChannelClosed(channel_id));
                    }
                    if commitment.commitment_number != next {
                        return Err(Error::StaleUpdate {
                            channel_id,
                            expected: next,
                            got: commitment.commitment_number,
                        });
                    }
                    if !spends(&commitment.tx, &self.params.funding_outpoint) {
                        return Err(error_invalid_update!(
                            channel_id,
                            "holder commitment {} does not spend the funding output",
                            commitment.commitment_number
                        ));
                    }
                }
                UpdateStep::LatestCounterpartyCommitment { commitment } => {
                    if self.is_closing() {
                        return Err(Error::ChannelClosed(channel_id));
                    }
                    if commitment.commitment_number != next {
                        return Err(Error::StaleUpdate {
                            channel_id,
                            expected: next,
                            got: commitment.commitment_number,
                        });
                    }
                    revocable.insert(current_counterparty);
                    current_counterparty = commitment.commitment_number;
                }
                UpdateStep::CommitmentSecret { revocation } => {
                    if !revocable.contains(&revocation.commitment_number) {
                        return Err(error_invalid_update!(
                            channel_id,
                            "revocation of unknown or current commitment {}",
                            revocation.commitment_number
                        ));
                    }
                    if let Some(existing) =
                        self.revocation_secrets.get(&revocation.commitment_number)
                    {
                        if *existing != revocation.secret {
                            return Err(error_invalid_update!(
                                channel_id,
                                "conflicting secret for commitment {}",
                                revocation.commitment_number
                            ));
                        }
                    }
                }
                UpdateStep::PaymentPreimage { preimage } => {
                    if !self.knows_payment_hash(&preimage.payment_hash()) {
                        return Err(error_invalid_update!(
                            channel_id,
                            "preimage for unknown payment hash {}",
                            preimage.payment_hash()
                        ));
                    }
                }
                UpdateStep::ChannelForceClosed => {}
            }
        }
        Ok(())
    }

    fn apply_step(&mut self, step: &UpdateStep) {
        match step {
            UpdateStep::LatestHolderCommitment { commitment, htlcs } => {
                self.commitment_number = commitment.commitment_number;
                self.holder_commitment = commitment.clone();
                self.htlcs = htlcs.clone();
            }
            UpdateStep::LatestCounterpartyCommitment { commitment } => {
                self.commitment_number = commitment.commitment_number;
                let prior = mem::replace(&mut self.counterparty_commitment, commitment.clone());
                self.prior_counterparty_commitments.insert(prior.txid, prior);
            }
            UpdateStep::CommitmentSecret { revocation } => {
                self.revocation_secrets.insert(revocation.commitment_number, revocation.secret);
            }
            UpdateStep::PaymentPreimage { preimage } => {
                self.preimages.insert(preimage.payment_hash(), *preimage);
            }
            UpdateStep::ChannelForceClosed => {
                info!("{}: {} force-closed", short_function!(), self.channel_id);
                self.force_closed = true;
            }
        }
    }

    fn knows_payment_hash(&self, payment_hash: &PaymentHash) -> bool {
        let in_outputs = |outputs: &CommitmentOutputs| {
            outputs.htlcs.iter().any(|h| h.htlc.payment_hash == *payment_hash)
        };
        self.htlcs.iter().any(|h| h.payment_hash == *payment_hash)
            || in_outputs(&self.holder_commitment.outputs)
            || in_outputs(&self.counterparty_commitment.outputs)
            || self.prior_counterparty_commitments.values().any(|c| in_outputs(&c.outputs))
    }

    /// Apply a block.  `txs` are the relevant transactions in block order.
    ///
    /// Re-delivery of an already applied block is a no-op.  Any other block must
    /// extend the best block.
    pub fn apply_block(
        &mut self,
        header: &Header,
        height: u32,
        txs: &[Transaction],
        justice_feerate_per_kw: u32,
    ) -> Result<BlockOutcome, Error> {
        let block_hash = header.block_hash();
        let best = self.chain.best_block;
        if height <= best.height {
            return match self.block_hash_at(height) {
                Some(hash) if hash == block_hash => Ok(BlockOutcome::default()),
                Some(hash) => Err(error_invalid_block!(
                    "{} has block {} at height {}, got {}",
                    self.channel_id,
                    hash,
                    height,
                    block_hash
                )),
                // Below retention and can't be checked here.  The parent of the
                // earliest retained block is kept, so a fork below retention is
                // caught once the chain reaches it.
                None => Ok(BlockOutcome::default()),
            };
        }
        if height != best.height + 1 {
            return Err(error_invalid_block!(
                "{} expected height {}, got {}",
                self.channel_id,
                best.height + 1,
                height
            ));
        }
        if header.prev_blockhash != best.block_hash {
            return Err(error_invalid_block!(
                "{} block {} does not connect to {}",
                self.channel_id,
                block_hash,
                best.block_hash
            ));
        }

        self.chain.best_block = ChainTip { height, block_hash };
        let mut changes = Vec::new();
        let mut closed = Vec::new();
        let mut outcome = BlockOutcome::default();
        for tx in txs {
            self.scan_transaction(tx, height, justice_feerate_per_kw, &mut changes, &mut closed);
        }
        if changes.iter().any(|c| {
            matches!(c, StateChange::ClosingConfirmed { .. } | StateChange::JusticeRebuilt { .. })
        }) {
            outcome.justice = self.chain.pending_justice.clone();
        }
        if !changes.is_empty() {
            debug!("{}: {} changes at height {}: {:?}", short_function!(), self.channel_id, height, changes);
        }

        self.journal.push_back(BlockRecord { height, block_hash, prev: best, changes });
        while self.journal.len() > self.config.max_reorg_depth as usize {
            self.journal.pop_front();
        }

        let mut events = Vec::new();
        self.check_channel_ready(height, &mut events);
        events.extend(closed);
        self.check_maturity(height, &mut events);

        outcome.changed =
            !events.is_empty() || self.journal.back().map_or(false, |r| !r.changes.is_empty());
        self.pending_events.extend(events);
        Ok(outcome)
    }

    fn scan_transaction(
        &mut self,
        tx: &Transaction,
        height: u32,
        justice_feerate_per_kw: u32,
        changes: &mut Vec<StateChange>,
        events: &mut Vec<Event>,
    ) {
        let txid = tx.compute_txid();
        let funding = self.params.funding_outpoint;

        if self.chain.funding_height.is_none() && txid == funding.txid {
            if (funding.vout as usize) < tx.output.len() {
                info!("{}: {} funding confirmed at {}", short_function!(), self.channel_id, height);
                self.chain.funding_height = Some(height);
                changes.push(StateChange::FundingConfirmed);
            } else {
                warn!("{}: funding tx {} has no output {}", short_function!(), txid, funding.vout);
            }
        }

        if self.chain.closing.is_none() && spends(tx, &funding) {
            let change = self.on_funding_spent(tx, txid, height, justice_feerate_per_kw);
            if let StateChange::ClosingConfirmed { closing, .. } = &change {
                if self.ledger.closings.insert(closing.txid) {
                    events.push(Event::ChannelClosed {
                        channel_id: self.channel_id,
                        closing_txid: closing.txid,
                        reason: closing.reason.clone(),
                    });
                }
            }
            changes.push(change);
        }

        let is_justice =
            self.chain.pending_justice.as_ref().map_or(false, |j| j.tx.compute_txid() == txid);
        let mut revoked_spent = false;
        let mut revoked_htlc_inputs = Vec::new();
        for (index, input) in tx.input.iter().enumerate() {
            if let Some(output) = self.chain.outputs.get_mut(&input.previous_output) {
                if output.spent_by.is_none() {
                    debug!("{}: {} spent by {}", short_function!(), input.previous_output, txid);
                    output.spent_by = Some(txid);
                    changes.push(StateChange::OutputSpent { outpoint: input.previous_output });
                    if let OutputKind::Revoked { htlc } = output.kind {
                        revoked_spent = true;
                        if htlc {
                            revoked_htlc_inputs.push(index as u32);
                        }
                    }
                }
            }
        }
        if revoked_spent && !is_justice {
            changes.push(self.on_revoked_outputs_spent(
                tx,
                txid,
                height,
                &revoked_htlc_inputs,
                justice_feerate_per_kw,
            ));
        }

        if is_justice {
            if let Some(justice) = self.chain.pending_justice.take() {
                info!("{}: {} justice tx {} confirmed", short_function!(), self.channel_id, txid);
                let output = tx.output.first().map(|out| {
                    let outpoint = OutPoint::new(txid, 0);
                    self.chain.outputs.insert(
                        outpoint,
                        TrackedOutput {
                            outpoint,
                            amount_sat: out.value.to_sat(),
                            script_pubkey: out.script_pubkey.clone(),
                            kind: OutputKind::Justice,
                            confirmation_height: height,
                            csv_delay: 0,
                            cltv_expiry: None,
                            spent_by: None,
                        },
                    );
                    outpoint
                });
                changes.push(StateChange::JusticeConfirmed { justice, output });
            }
        }
    }

    // Classify a funding spend and start tracking our outputs on it
    fn on_funding_spent(
        &mut self,
        tx: &Transaction,
        txid: Txid,
        height: u32,
        justice_feerate_per_kw: u32,
    ) -> StateChange {
        let mut tracked = Vec::new();
        let mut justice = None;
        let reason = if txid == self.holder_commitment.txid() {
            let layout = self.holder_commitment.outputs.clone();
            let delay = self.params.holder_to_self_delay;
            self.track_commitment_outputs(tx, txid, height, &layout, delay, &mut tracked);
            ClosureReason::HolderForceClosed
        } else if txid == self.counterparty_commitment.txid {
            let layout = self.counterparty_commitment.outputs.clone();
            self.track_commitment_outputs(tx, txid, height, &layout, 0, &mut tracked);
            ClosureReason::CounterpartyForceClosed
        } else if let Some(prior) = self.prior_counterparty_commitments.get(&txid).cloned() {
            match self.revocation_secrets.get(&prior.commitment_number) {
                Some(secret) => {
                    let revocation =
                        Revocation { commitment_number: prior.commitment_number, secret: *secret };
                    warn!(
                        "{}: {} revoked commitment {} confirmed in {}",
                        short_function!(),
                        self.channel_id,
                        prior.commitment_number,
                        txid
                    );
                    let htlc_vouts: OrderedSet<u32> =
                        prior.outputs.htlcs.iter().map(|h| h.vout).collect();
                    for (vout, _) in prior.outputs.all_outputs() {
                        let kind = OutputKind::Revoked { htlc: htlc_vouts.contains(&vout) };
                        tracked.extend(self.track_output(tx, txid, vout, height, kind, 0, None));
                    }
                    justice = self.build_justice(revocation, justice_feerate_per_kw);
                    ClosureReason::CounterpartyRevokedCommitment {
                        commitment_number: prior.commitment_number,
                    }
                }
                None => {
                    self.track_commitment_outputs(tx, txid, height, &prior.outputs, 0, &mut tracked);
                    ClosureReason::CounterpartyForceClosed
                }
            }
        } else {
            for (vout, out) in tx.output.iter().enumerate() {
                if out.script_pubkey == self.params.destination_script {
                    tracked.extend(self.track_output(tx, txid, vout as u32, height, OutputKind::Balance, 0, None));
                }
            }
            ClosureReason::CooperativeClosure
        };
        info!(
            "{}: {} closed by {} at {}: {:?}, tracking {:?}",
            short_function!(),
            self.channel_id,
            txid,
            height,
            reason,
            tracked
        );
        let closing = ClosingInfo { txid, height, reason };
        self.chain.closing = Some(closing.clone());
        self.chain.pending_justice = justice;
        StateChange::ClosingConfirmed { closing, outputs: tracked }
    }

    fn track_commitment_outputs(
        &mut self,
        tx: &Transaction,
        txid: Txid,
        height: u32,
        layout: &CommitmentOutputs,
        csv_delay: u16,
        tracked: &mut Vec<OutPoint>,
    ) {
        if let Some(o) = layout.to_holder {
            tracked.extend(self.track_output(tx, txid, o.vout, height, OutputKind::Balance, csv_delay, None));
        }
        for h in &layout.htlcs {
            let payment_hash = h.htlc.payment_hash;
            let kind = match h.htlc.direction {
                HtlcDirection::Offered => OutputKind::OfferedHtlc { payment_hash },
                HtlcDirection::Received => OutputKind::ReceivedHtlc { payment_hash },
            };
            tracked.extend(self.track_output(tx, txid, h.vout, height, kind, csv_delay, Some(h.htlc.cltv_expiry)));
        }
    }

    fn track_output(
        &mut self,
        tx: &Transaction,
        txid: Txid,
        vout: u32,
        height: u32,
        kind: OutputKind,
        csv_delay: u16,
        cltv_expiry: Option<u32>,
    ) -> Option<OutPoint> {
        let out = match tx.output.get(vout as usize) {
            Some(out) => out,
            None => {
                warn!("{}: {} has no output {}", short_function!(), txid, vout);
                return None;
            }
        };
        let outpoint = OutPoint::new(txid, vout);
        self.chain.outputs.insert(
            outpoint,
            TrackedOutput {
                outpoint,
                amount_sat: out.value.to_sat(),
                script_pubkey: out.script_pubkey.clone(),
                kind,
                confirmation_height: height,
                csv_delay,
                cltv_expiry,
                spent_by: None,
            },
        );
        Some(outpoint)
    }

    // The counterparty spent revoked outputs before our justice transaction
    // confirmed.  A second-stage HTLC transaction pays each input to the output
    // at the same index, under the same revocation key.
    fn on_revoked_outputs_spent(
        &mut self,
        tx: &Transaction,
        txid: Txid,
        height: u32,
        htlc_inputs: &[u32],
        justice_feerate_per_kw: u32,
    ) -> StateChange {
        let mut outputs = Vec::new();
        for index in htlc_inputs {
            let kind = OutputKind::Revoked { htlc: false };
            outputs.extend(self.track_output(tx, txid, *index, height, kind, 0, None));
        }
        let previous = self.chain.pending_justice.take();
        let revocation = previous.as_ref().map(|j| j.revocation).or_else(|| self.closing_revocation());
        self.chain.pending_justice =
            revocation.and_then(|r| self.build_justice(r, justice_feerate_per_kw));
        warn!(
            "{}: {} counterparty spent revoked outputs in {}, justice now {:?}, tracking {:?}",
            short_function!(),
            self.channel_id,
            txid,
            self.chain.pending_justice.as_ref().map(|j| j.tx.compute_txid()),
            outputs
        );
        StateChange::JusticeRebuilt { previous, outputs }
    }

    fn closing_revocation(&self) -> Option<Revocation> {
        match self.chain.closing.as_ref().map(|c| &c.reason) {
            Some(ClosureReason::CounterpartyRevokedCommitment { commitment_number }) => self
                .revocation_secrets
                .get(commitment_number)
                .map(|secret| Revocation { commitment_number: *commitment_number, secret: *secret }),
            _ => None,
        }
    }

    // Sweep every unspent revoked output
    fn build_justice(&self, revocation: Revocation, feerate_per_kw: u32) -> Option<PendingJustice> {
        let mut input = Vec::new();
        let mut input_amounts_sat = Vec::new();
        for output in self.chain.outputs.values() {
            if output.spent_by.is_some() || !matches!(output.kind, OutputKind::Revoked { .. }) {
                continue;
            }
            input.push(TxIn {
                previous_output: output.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            });
            input_amounts_sat.push(output.amount_sat);
        }
        if input.is_empty() {
            return None;
        }
        let total: u64 = input_amounts_sat.iter().sum();
        let mut justice_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output: vec![TxOut {
                value: Amount::from_sat(total),
                script_pubkey: self.params.destination_script.clone(),
            }],
        };
        let weight = justice_tx.weight().to_wu()
            + JUSTICE_INPUT_WITNESS_WEIGHT * justice_tx.input.len() as u64;
        let fee = feerate_per_kw as u64 * weight / 1000;
        if total < fee + DUST_LIMIT_SAT {
            warn!(
                "{}: {} revoked outputs worth {} don't cover fee {}",
                short_function!(),
                self.channel_id,
                total,
                fee
            );
            return None;
        }
        justice_tx.output[0].value = Amount::from_sat(total - fee);
        Some(PendingJustice { tx: justice_tx, input_amounts_sat, revocation })
    }

    fn check_channel_ready(&mut self, height: u32, events: &mut Vec<Event>) {
        if self.ledger.channel_ready {
            return;
        }
        if let Some(funding_height) = self.chain.funding_height {
            if height + 1 >= funding_height + self.params.funding_min_depth {
                self.ledger.channel_ready = true;
                events.push(Event::ChannelReady { channel_id: self.channel_id, funding_height });
            }
        }
    }

    // Emit outputs that reached maturity, at most once each
    fn check_maturity(&mut self, height: u32, events: &mut Vec<Event>) {
        let anti_reorg_delay = self.config.anti_reorg_delay;
        let mut spendable = Vec::new();
        let mut failed = Vec::new();
        for output in self.chain.outputs.values() {
            if output.spent_by.is_some() || self.ledger.spendable.contains(&output.outpoint) {
                continue;
            }
            if height < output.maturity_height(anti_reorg_delay) {
                continue;
            }
            let kind = match &output.kind {
                OutputKind::Balance => SpendableKind::Balance,
                OutputKind::OfferedHtlc { payment_hash } => {
                    failed.push(*payment_hash);
                    SpendableKind::HtlcTimeout { payment_hash: *payment_hash }
                }
                OutputKind::ReceivedHtlc { payment_hash } => {
                    if !self.preimages.contains_key(payment_hash) {
                        continue;
                    }
                    SpendableKind::HtlcSuccess { payment_hash: *payment_hash }
                }
                OutputKind::Revoked { .. } => continue,
                OutputKind::Justice => SpendableKind::Justice,
            };
            spendable.push(SpendableOutput {
                outpoint: output.outpoint,
                amount_sat: output.amount_sat,
                script_pubkey: output.script_pubkey.clone(),
                csv_delay: output.csv_delay,
                kind,
            });
        }
        if spendable.is_empty() {
            return;
        }
        for output in &spendable {
            self.ledger.spendable.insert(output.outpoint);
        }
        info!(
            "{}: {} {} outputs spendable at {}",
            short_function!(),
            self.channel_id,
            spendable.len(),
            height
        );
        events.push(Event::SpendableOutputs { channel_id: self.channel_id, outputs: spendable });
        for payment_hash in failed {
            events.push(Event::PaymentPathFailed { channel_id: self.channel_id, payment_hash });
        }
    }

    /// Disconnect the block at `height`, restoring the state from before it was applied.
    ///
    /// Returns whether the block had changed the monitor beyond its best block.
    /// Disconnecting a block this monitor never applied is a no-op.
    pub fn disconnect_block(&mut self, height: u32) -> Result<bool, Error> {
        if height > self.chain.best_block.height {
            return Ok(false);
        }
        if self.journal.back().map(|r| r.height) != Some(height) {
            return Err(Error::ReorgBeyondRetention {
                height,
                earliest_retained: self.earliest_retained_height(),
            });
        }
        let record = self.journal.pop_back().expect("checked above");
        let changed = !record.changes.is_empty();
        for change in record.changes.into_iter().rev() {
            self.revert(change);
        }
        self.chain.best_block = record.prev;
        debug!("{}: {} disconnected {}", short_function!(), self.channel_id, height);
        Ok(changed)
    }

    /// Disconnect blocks until the best block is at `height`
    pub fn rewind_to(&mut self, height: u32) -> Result<bool, Error> {
        let mut changed = false;
        while self.chain.best_block.height > height {
            changed |= self.disconnect_block(self.chain.best_block.height)?;
        }
        Ok(changed)
    }

    fn revert(&mut self, change: StateChange) {
        match change {
            StateChange::FundingConfirmed => {
                self.chain.funding_height = None;
            }
            StateChange::ClosingConfirmed { closing, outputs } => {
                info!("{}: {} closing {} reorged out", short_function!(), self.channel_id, closing.txid);
                self.chain.closing = None;
                self.chain.pending_justice = None;
                for outpoint in outputs {
                    self.chain.outputs.remove(&outpoint);
                }
            }
            StateChange::OutputSpent { outpoint } => {
                if let Some(output) = self.chain.outputs.get_mut(&outpoint) {
                    output.spent_by = None;
                }
            }
            StateChange::JusticeConfirmed { justice, output } => {
                if let Some(outpoint) = output {
                    self.chain.outputs.remove(&outpoint);
                }
                self.chain.pending_justice = Some(justice);
            }
            StateChange::JusticeRebuilt { previous, outputs } => {
                for outpoint in outputs {
                    self.chain.outputs.remove(&outpoint);
                }
                self.chain.pending_justice = previous;
            }
        }
    }

    /// Outputs the block source must deliver spends of
    pub fn watched_outputs(&self) -> Vec<WatchedOutput> {
        let mut watched = vec![WatchedOutput {
            block_hash: None,
            outpoint: self.params.funding_outpoint,
            script_pubkey: self.params.funding_script.clone(),
        }];
        watched.extend(
            self.chain.outputs.values().filter(|o| o.spent_by.is_none()).map(|o| o.watched()),
        );
        watched
    }

    /// Transactions the block source must deliver, with a script they pay to
    pub fn watched_txids(&self) -> Vec<(Txid, ScriptBuf)> {
        let mut watched =
            vec![(self.params.funding_outpoint.txid, self.params.funding_script.clone())];
        let holder_txid = self.holder_commitment.txid();
        for out in &self.holder_commitment.tx.output {
            watched.push((holder_txid, out.script_pubkey.clone()));
        }
        if let Some(justice) = &self.chain.pending_justice {
            watched.push((justice.tx.compute_txid(), self.params.destination_script.clone()));
        }
        watched
    }

    /// Transactions that should be (re)broadcast: our commitment if we force-closed
    /// and it didn't confirm yet.  A pending justice transaction is returned
    /// separately by [`Self::pending_justice`], since it needs signing.
    pub fn pending_claims(&self) -> Vec<Transaction> {
        if self.force_closed && self.chain.closing.is_none() {
            vec![self.holder_commitment.tx.clone()]
        } else {
            vec![]
        }
    }

    /// A justice transaction awaiting confirmation
    pub fn pending_justice(&self) -> Option<&PendingJustice> {
        self.chain.pending_justice.as_ref()
    }

    /// The current HTLC set with on-chain resolutions
    pub fn htlcs(&self) -> Vec<HtlcState> {
        self.htlcs
            .iter()
            .map(|htlc| HtlcState { htlc: htlc.clone(), resolution: self.htlc_resolution(htlc) })
            .collect()
    }

    fn htlc_resolution(&self, htlc: &Htlc) -> HtlcResolution {
        let output = self.chain.outputs.values().find(|o| match &o.kind {
            OutputKind::OfferedHtlc { payment_hash } | OutputKind::ReceivedHtlc { payment_hash } =>
                *payment_hash == htlc.payment_hash,
            _ => false,
        });
        match output {
            Some(o) if self.ledger.spendable.contains(&o.outpoint) => match htlc.direction {
                HtlcDirection::Offered => HtlcResolution::TimedOut,
                HtlcDirection::Received => HtlcResolution::Claimed,
            },
            Some(o) if o.spent_by.is_some() => HtlcResolution::ClaimedByCounterparty,
            _ => HtlcResolution::Pending,
        }
    }

    /// Balances we can claim, now or in the future
    pub fn claimable_balances(&self) -> Vec<Balance> {
        let mut balances = Vec::new();
        if self.chain.closing.is_none() {
            let outputs = &self.holder_commitment.outputs;
            if let Some(o) = outputs.to_holder {
                balances.push(Balance::ClaimableOnChannelClose { amount_sat: o.amount_sat });
            }
            for h in &outputs.htlcs {
                balances.push(self.htlc_balance(&h.htlc, h.htlc.amount_sat, h.htlc.cltv_expiry));
            }
            return balances;
        }
        let anti_reorg_delay = self.config.anti_reorg_delay;
        for output in self.chain.outputs.values() {
            if output.spent_by.is_some() || self.ledger.spendable.contains(&output.outpoint) {
                continue;
            }
            let amount_sat = output.amount_sat;
            let maturity = output.maturity_height(anti_reorg_delay);
            let balance = match &output.kind {
                OutputKind::Balance | OutputKind::Justice =>
                    Balance::ClaimableAwaitingConfirmations {
                        amount_sat,
                        confirmation_height: maturity,
                    },
                OutputKind::OfferedHtlc { payment_hash } => Balance::MaybeTimeoutClaimableHtlc {
                    amount_sat,
                    claimable_height: maturity,
                    payment_hash: *payment_hash,
                },
                OutputKind::ReceivedHtlc { payment_hash } => {
                    let expiry = output.cltv_expiry.unwrap_or(0);
                    if self.preimages.contains_key(payment_hash) {
                        Balance::ContentiousClaimable {
                            amount_sat,
                            timeout_height: expiry,
                            payment_hash: *payment_hash,
                        }
                    } else {
                        Balance::MaybePreimageClaimableHtlc {
                            amount_sat,
                            expiry_height: expiry,
                            payment_hash: *payment_hash,
                        }
                    }
                }
                OutputKind::Revoked { .. } =>
                    Balance::CounterpartyRevokedOutputClaimable { amount_sat },
            };
            balances.push(balance);
        }
        balances
    }

    fn htlc_balance(&self, htlc: &Htlc, amount_sat: u64, expiry: u32) -> Balance {
        let payment_hash = htlc.payment_hash;
        match htlc.direction {
            HtlcDirection::Offered => Balance::MaybeTimeoutClaimableHtlc {
                amount_sat,
                claimable_height: expiry,
                payment_hash,
            },
            HtlcDirection::Received if self.preimages.contains_key(&payment_hash) =>
                Balance::ContentiousClaimable { amount_sat, timeout_height: expiry, payment_hash },
            HtlcDirection::Received =>
                Balance::MaybePreimageClaimableHtlc { amount_sat, expiry_height: expiry, payment_hash },
        }
    }

    /// Whether the channel is closed, the close is irreversible, and nothing is
    /// left for us to claim or watch
    pub fn is_fully_resolved(&self) -> bool {
        let closing = match &self.chain.closing {
            Some(c) => c,
            None => return false,
        };
        if self.chain.best_block.height + 1 < closing.height + self.config.anti_reorg_delay {
            return false;
        }
        if self.chain.pending_justice.is_some() || !self.pending_events.is_empty() {
            return false;
        }
        self.chain
            .outputs
            .values()
            .all(|o| o.spent_by.is_some() || self.ledger.spendable.contains(&o.outpoint))
    }

    /// Serialize into a snapshot for the persister.  Each call gets a higher version.
    pub fn snapshot(&mut self) -> Result<MonitorSnapshot, Error> {
        self.snapshot_version += 1;
        Ok(MonitorSnapshot {
            channel_id: self.channel_id,
            latest_update_id: self.latest_update_id,
            version: self.snapshot_version,
            bytes: self.encode()?,
        })
    }

    /// Serialize
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize
    pub fn decode(bytes: &[u8], config: &MonitorConfig) -> Result<Self, Error> {
        let mut monitor: ChannelMonitor = serde_json::from_slice(bytes)?;
        monitor.set_config(config);
        Ok(monitor)
    }
}

fn spends(tx: &Transaction, outpoint: &OutPoint) -> bool {
    tx.input.iter().any(|i| i.previous_output == *outpoint)
}
