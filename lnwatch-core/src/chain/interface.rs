//! Capabilities supplied by the host: block filtering, broadcasting,
//! fee estimation and justice signing.

use bitcoin::{BlockHash, OutPoint, Script, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelId, CommitmentSecret};
use crate::prelude::*;
use crate::util::status::Status;

/// The minimum feerate we will ever use, in sats per 1000 weight units
pub const FEERATE_FLOOR_SATS_PER_KW: u32 = 253;

/// An output the block source must deliver spends of
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WatchedOutput {
    /// The block the output was confirmed in, if known
    pub block_hash: Option<BlockHash>,
    /// The outpoint
    pub outpoint: OutPoint,
    /// The output script
    pub script_pubkey: ScriptBuf,
}

/// Block source filter.
///
/// Registrations must take effect before the next block is delivered, so that
/// no relevant transaction is missed.
pub trait Filter: SendSync {
    /// Deliver transactions with this txid or paying to this script
    fn register_tx(&self, txid: &Txid, script_pubkey: &Script);
    /// Deliver transactions spending this output
    fn register_output(&self, output: WatchedOutput);
}

/// Transaction broadcaster
pub trait BroadcasterInterface: SendSync {
    /// Broadcast transactions.  Must be idempotent, since claims are rebroadcast.
    fn broadcast_transactions(&self, txs: &[&Transaction]);
}

/// How soon a transaction should confirm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmationTarget {
    /// No hurry
    Background,
    /// Within a few blocks
    Normal,
    /// As soon as possible
    HighPriority,
}

/// Fee estimator
pub trait FeeEstimator: SendSync {
    /// Estimated feerate in sats per 1000 weight units
    fn get_est_sat_per_1000_weight(&self, target: ConfirmationTarget) -> u32;
}

/// Feerate for `target`, never below [`FEERATE_FLOOR_SATS_PER_KW`]
pub fn feerate_with_floor(estimator: &dyn FeeEstimator, target: ConfirmationTarget) -> u32 {
    core::cmp::max(estimator.get_est_sat_per_1000_weight(target), FEERATE_FLOOR_SATS_PER_KW)
}

/// Signs justice transactions with the revocation key derived from a
/// per-commitment secret.
pub trait ChannelSigner: SendSync {
    /// Sign all inputs of `tx`, which spends outputs of a revoked counterparty commitment.
    ///
    /// `input_amounts_sat` are the values of the spent outputs, in input order.
    fn sign_justice_transaction(
        &self,
        channel_id: &ChannelId,
        tx: &Transaction,
        input_amounts_sat: &[u64],
        secret: &CommitmentSecret,
    ) -> Result<Transaction, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedFee(u32);

    impl SendSync for FixedFee {}

    impl FeeEstimator for FixedFee {
        fn get_est_sat_per_1000_weight(&self, _target: ConfirmationTarget) -> u32 {
            self.0
        }
    }

    #[test]
    fn feerate_floor() {
        assert_eq!(feerate_with_floor(&FixedFee(0), ConfirmationTarget::HighPriority), 253);
        assert_eq!(feerate_with_floor(&FixedFee(1000), ConfirmationTarget::Normal), 1000);
    }
}
