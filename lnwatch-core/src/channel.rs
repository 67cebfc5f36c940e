use core::fmt;
use core::str::FromStr;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;

use crate::prelude::*;

/// Channel identifier.
///
/// This is the funding outpoint, which is stable for the life of the channel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub OutPoint);

impl ChannelId {
    /// Create from the funding outpoint
    pub fn new(funding_outpoint: OutPoint) -> Self {
        ChannelId(funding_outpoint)
    }

    /// The funding outpoint
    pub fn funding_outpoint(&self) -> OutPoint {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0.txid, self.0.vout)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self)
    }
}

impl FromStr for ChannelId {
    type Err = bitcoin::transaction::ParseOutPointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ChannelId(OutPoint::from_str(s)?))
    }
}

macro_rules! hash_newtype_32 {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[serde_as]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(#[serde_as(as = "Hex")] pub [u8; 32]);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0))
            }
        }
    };
}

hash_newtype_32!(PaymentHash, "The SHA256 of a payment preimage");
hash_newtype_32!(PaymentPreimage, "A payment preimage");
hash_newtype_32!(CommitmentSecret, "A per-commitment secret, revealed to revoke a commitment");

impl PaymentPreimage {
    /// The payment hash this preimage unlocks
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }
}

/// Direction of an HTLC, from our point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HtlcDirection {
    /// We offered this HTLC, and can time it out after its CLTV expiry
    Offered,
    /// We received this HTLC, and can claim it with the preimage
    Received,
}

/// On-chain resolution of an HTLC
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcResolution {
    /// Not resolved on-chain
    Pending,
    /// The counterparty spent the HTLC output
    ClaimedByCounterparty,
    /// We can sweep an offered HTLC after its expiry
    TimedOut,
    /// We can sweep a received HTLC with its preimage
    Claimed,
}

/// An HTLC in the channel's current state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Htlc {
    /// The payment hash
    pub payment_hash: PaymentHash,
    /// The amount
    pub amount_sat: u64,
    /// Absolute expiry height
    pub cltv_expiry: u32,
    /// Direction
    pub direction: HtlcDirection,
}

/// An HTLC together with its on-chain resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcState {
    /// The HTLC
    pub htlc: Htlc,
    /// How it was resolved on-chain, if at all
    pub resolution: HtlcResolution,
}

/// A plain balance output of a commitment transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputInfo {
    /// Output index
    pub vout: u32,
    /// Output value
    pub amount_sat: u64,
}

/// An HTLC output of a commitment transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcOutput {
    /// Output index
    pub vout: u32,
    /// The HTLC this output carries
    pub htlc: Htlc,
}

/// Describes which outputs of a commitment transaction belong to whom
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentOutputs {
    /// Our balance
    pub to_holder: Option<OutputInfo>,
    /// The counterparty's balance
    pub to_counterparty: Option<OutputInfo>,
    /// HTLC outputs
    pub htlcs: Vec<HtlcOutput>,
}

impl CommitmentOutputs {
    /// All output indexes with their values
    pub fn all_outputs(&self) -> Vec<(u32, u64)> {
        let mut outputs = Vec::new();
        if let Some(o) = self.to_holder {
            outputs.push((o.vout, o.amount_sat));
        }
        if let Some(o) = self.to_counterparty {
            outputs.push((o.vout, o.amount_sat));
        }
        for h in &self.htlcs {
            outputs.push((h.vout, h.htlc.amount_sat));
        }
        outputs.sort();
        outputs
    }
}

/// Our latest commitment transaction, signed and ready to broadcast
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderCommitment {
    /// Commitment number
    pub commitment_number: u64,
    /// The fully signed transaction
    pub tx: Transaction,
    /// Output ownership
    pub outputs: CommitmentOutputs,
}

impl HolderCommitment {
    /// The commitment txid
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

/// A counterparty commitment transaction.  We only know its txid and layout,
/// since the counterparty holds the signed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterpartyCommitment {
    /// Commitment number
    pub commitment_number: u64,
    /// The txid
    pub txid: Txid,
    /// Output ownership
    pub outputs: CommitmentOutputs,
}

/// The revocation of an earlier counterparty commitment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    /// The revoked commitment number
    pub commitment_number: u64,
    /// The per-commitment secret
    pub secret: CommitmentSecret,
}

/// A new channel state, as produced by the off-chain channel state machine.
///
/// `commitment_number` is the per-channel state sequence and must advance by exactly one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentState {
    /// The state sequence number
    pub commitment_number: u64,
    /// Our commitment transaction for this state
    pub holder_tx: Transaction,
    /// Output ownership in our commitment transaction
    pub holder_outputs: CommitmentOutputs,
    /// The counterparty commitment txid for this state
    pub counterparty_txid: Txid,
    /// Output ownership in the counterparty commitment transaction
    pub counterparty_outputs: CommitmentOutputs,
    /// The HTLC set
    pub htlcs: Vec<Htlc>,
    /// Revocation of the previous counterparty commitment, if it was revoked with this state
    pub revocation: Option<Revocation>,
}

/// Static channel parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelParameters {
    /// The funding outpoint
    pub funding_outpoint: OutPoint,
    /// The funding output script
    pub funding_script: ScriptBuf,
    /// The channel value
    pub channel_value_sat: u64,
    /// The relative delay on our own balance in our commitment transaction
    pub holder_to_self_delay: u16,
    /// Confirmations of the funding transaction before the channel is ready
    pub funding_min_depth: u32,
    /// Where claims and justice transactions sweep funds to
    pub destination_script: ScriptBuf,
}
