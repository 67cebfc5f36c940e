use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};

use crate::channel::{
    ChannelId, ChannelParameters, CommitmentOutputs, CommitmentSecret, CommitmentState, Htlc,
    HtlcDirection, HtlcOutput, OutputInfo, PaymentPreimage, Revocation,
};
use crate::config::MonitorConfig;
use crate::monitor::{ChainTip, ChannelMonitor};
use crate::prelude::*;

pub const CHANNEL_VALUE_SAT: u64 = 1_000_000;
pub const TO_HOLDER_SAT: u64 = 600_000;
pub const TO_SELF_DELAY: u16 = 144;
pub const FUNDING_MIN_DEPTH: u32 = 2;

/// A P2WSH-shaped script unique to `tag`
pub fn make_script(tag: &[u8]) -> ScriptBuf {
    let hash = sha256::Hash::hash(tag);
    let mut bytes = vec![0x00, 0x20];
    bytes.extend_from_slice(hash.as_byte_array());
    ScriptBuf::from_bytes(bytes)
}

pub fn make_outpoint(n: u32) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([0xee; 32]), n)
}

pub fn make_txin(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ZERO,
        witness: Witness::new(),
    }
}

/// A transaction spending `outpoints` into a single output
pub fn make_spend(outpoints: &[OutPoint], value_sat: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: outpoints.iter().map(|o| make_txin(*o)).collect(),
        output: vec![TxOut {
            value: Amount::from_sat(value_sat),
            script_pubkey: make_script(b"elsewhere"),
        }],
    }
}

pub fn make_header(prev_blockhash: BlockHash, height: u32, salt: u32) -> Header {
    Header {
        version: BlockVersion::ONE,
        prev_blockhash,
        merkle_root: TxMerkleNode::all_zeros(),
        time: height,
        bits: CompactTarget::from_consensus(0x207fffff),
        nonce: salt,
    }
}

/// A chain of headers starting at an arbitrary height.
///
/// Different salts produce different block hashes, for building forks.
pub struct TestChain {
    base_height: u32,
    headers: Vec<Header>,
    salt: u32,
}

impl TestChain {
    pub fn new(base_height: u32) -> Self {
        Self::with_salt(base_height, 0)
    }

    pub fn with_salt(base_height: u32, salt: u32) -> Self {
        let base = make_header(BlockHash::all_zeros(), base_height, salt);
        TestChain { base_height, headers: vec![base], salt }
    }

    pub fn height(&self) -> u32 {
        self.base_height + self.headers.len() as u32 - 1
    }

    pub fn tip(&self) -> ChainTip {
        ChainTip::from_header(&self.tip_header(), self.height())
    }

    pub fn tip_header(&self) -> Header {
        *self.headers.last().expect("chain is never empty")
    }

    pub fn header_at(&self, height: u32) -> Header {
        self.headers[(height - self.base_height) as usize]
    }

    /// Extend the chain by one block
    pub fn next(&mut self) -> (Header, u32) {
        let height = self.height() + 1;
        let header = make_header(self.tip_header().block_hash(), height, self.salt);
        self.headers.push(header);
        (header, height)
    }

    /// Drop blocks above `height`
    pub fn truncate(&mut self, height: u32) {
        self.headers.truncate((height - self.base_height + 1) as usize);
    }

    /// Use a different salt for future blocks
    pub fn salt(&mut self, salt: u32) {
        self.salt = salt;
    }
}

/// A channel with deterministic commitment transactions.
///
/// Holder commitments pay our balance at output 0 and the counterparty at
/// output 1.  Counterparty commitments are the other way around.  HTLC outputs
/// follow from output 2.
pub struct ChannelFixture {
    pub seed: u8,
    pub params: ChannelParameters,
    pub funding_tx: Transaction,
}

impl ChannelFixture {
    pub fn new(seed: u8) -> Self {
        let funding_script = make_script(&[seed, b'f']);
        let funding_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![make_txin(make_outpoint(seed as u32))],
            output: vec![TxOut {
                value: Amount::from_sat(CHANNEL_VALUE_SAT),
                script_pubkey: funding_script.clone(),
            }],
        };
        let params = ChannelParameters {
            funding_outpoint: OutPoint::new(funding_tx.compute_txid(), 0),
            funding_script,
            channel_value_sat: CHANNEL_VALUE_SAT,
            holder_to_self_delay: TO_SELF_DELAY,
            funding_min_depth: FUNDING_MIN_DEPTH,
            destination_script: make_script(&[seed, b'd']),
        };
        ChannelFixture { seed, params, funding_tx }
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId(self.params.funding_outpoint)
    }

    pub fn secret(&self, n: u64) -> CommitmentSecret {
        let mut bytes = [self.seed; 32];
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        CommitmentSecret(bytes)
    }

    pub fn preimage(&self, n: u8) -> PaymentPreimage {
        let mut bytes = [n; 32];
        bytes[0] = self.seed;
        PaymentPreimage(bytes)
    }

    pub fn htlc(&self, n: u8, amount_sat: u64, cltv_expiry: u32, direction: HtlcDirection) -> Htlc {
        Htlc { payment_hash: self.preimage(n).payment_hash(), amount_sat, cltv_expiry, direction }
    }

    fn commitment(&self, n: u64, holder: bool, htlcs: &[Htlc]) -> (Transaction, CommitmentOutputs) {
        let side = if holder { b'h' } else { b'c' };
        let htlc_total: u64 = htlcs.iter().map(|h| h.amount_sat).sum();
        let to_counterparty = CHANNEL_VALUE_SAT - TO_HOLDER_SAT - htlc_total;
        let (holder_vout, counterparty_vout) = if holder { (0, 1) } else { (1, 0) };
        let ours = TxOut {
            value: Amount::from_sat(TO_HOLDER_SAT),
            script_pubkey: make_script(&[self.seed, side, b'h']),
        };
        let theirs = TxOut {
            value: Amount::from_sat(to_counterparty),
            script_pubkey: make_script(&[self.seed, side, b'c']),
        };
        let mut output = if holder { vec![ours, theirs] } else { vec![theirs, ours] };
        let mut layout = CommitmentOutputs {
            to_holder: Some(OutputInfo { vout: holder_vout, amount_sat: TO_HOLDER_SAT }),
            to_counterparty: Some(OutputInfo {
                vout: counterparty_vout,
                amount_sat: to_counterparty,
            }),
            htlcs: vec![],
        };
        for (i, htlc) in htlcs.iter().enumerate() {
            layout.htlcs.push(HtlcOutput { vout: output.len() as u32, htlc: htlc.clone() });
            output.push(TxOut {
                value: Amount::from_sat(htlc.amount_sat),
                script_pubkey: make_script(&[self.seed, side, b'x', i as u8]),
            });
        }
        let marker = if holder { 0x2000_0000 } else { 0x2100_0000 };
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(marker | n as u32),
            input: vec![make_txin(self.params.funding_outpoint)],
            output,
        };
        (tx, layout)
    }

    pub fn holder_tx(&self, n: u64, htlcs: &[Htlc]) -> Transaction {
        self.commitment(n, true, htlcs).0
    }

    pub fn counterparty_tx(&self, n: u64, htlcs: &[Htlc]) -> Transaction {
        self.commitment(n, false, htlcs).0
    }

    /// The state at commitment `n`, revoking `n - 1`
    pub fn state(&self, n: u64, htlcs: &[Htlc]) -> CommitmentState {
        let (holder_tx, holder_outputs) = self.commitment(n, true, htlcs);
        let (counterparty_tx, counterparty_outputs) = self.commitment(n, false, htlcs);
        CommitmentState {
            commitment_number: n,
            holder_tx,
            holder_outputs,
            counterparty_txid: counterparty_tx.compute_txid(),
            counterparty_outputs,
            htlcs: htlcs.to_vec(),
            revocation: n
                .checked_sub(1)
                .map(|prev| Revocation { commitment_number: prev, secret: self.secret(prev) }),
        }
    }

    pub fn monitor(&self, best_block: ChainTip, config: &MonitorConfig) -> ChannelMonitor {
        ChannelMonitor::new(self.params.clone(), self.state(0, &[]), best_block, config)
            .expect("valid initial state")
    }

    /// A cooperative close paying `to_us_sat` to our destination script
    pub fn cooperative_close_tx(&self, to_us_sat: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![make_txin(self.params.funding_outpoint)],
            output: vec![
                TxOut {
                    value: Amount::from_sat(to_us_sat),
                    script_pubkey: self.params.destination_script.clone(),
                },
                TxOut {
                    value: Amount::from_sat(CHANNEL_VALUE_SAT - to_us_sat - 1000),
                    script_pubkey: make_script(&[self.seed, b'o']),
                },
            ],
        }
    }
}
