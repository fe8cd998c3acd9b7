use crate::{PendingTx, TxReceipt};
use alloy::{
    consensus::{
        constants::{EMPTY_OMMER_ROOT_HASH, EMPTY_ROOT_HASH},
        Header,
    },
    eips::eip1559::{calc_next_block_base_fee, BaseFeeParams},
    primitives::{keccak256, Address, Bloom, B256},
};

/// A block: a header, its hash, and the transactions it includes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    header: Header,
    hash: B256,
    transactions: Vec<PendingTx>,
}

impl Block {
    /// Seal a header and its transactions.
    pub fn new(header: Header, transactions: Vec<PendingTx>) -> Self {
        let hash = header.hash_slow();
        Self { header, hash, transactions }
    }

    /// Create a genesis block.
    pub fn genesis(
        timestamp: u64,
        gas_limit: u64,
        base_fee: u64,
        state_root: B256,
        beneficiary: Address,
    ) -> Self {
        let header = Header {
            beneficiary,
            state_root,
            timestamp,
            gas_limit,
            base_fee_per_gas: Some(base_fee),
            ..empty_header()
        };
        Self::new(header, vec![])
    }

    /// The block header.
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// The block hash.
    pub const fn hash(&self) -> B256 {
        self.hash
    }

    /// The block number.
    pub const fn number(&self) -> u64 {
        self.header.number
    }

    /// The block timestamp.
    pub const fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// The transactions included in the block, in execution order.
    pub fn transactions(&self) -> &[PendingTx] {
        &self.transactions
    }

    /// Hashes of the included transactions, in execution order.
    pub fn transaction_hashes(&self) -> impl Iterator<Item = B256> + '_ {
        self.transactions.iter().map(PendingTx::hash)
    }

    /// The base fee a child of this block pays, per EIP-1559 with Ethereum
    /// parameters.
    pub fn next_base_fee(&self) -> u64 {
        next_base_fee(&self.header)
    }
}

/// A header with every commitment set to its empty value.
fn empty_header() -> Header {
    Header {
        ommers_hash: EMPTY_OMMER_ROOT_HASH,
        transactions_root: EMPTY_ROOT_HASH,
        receipts_root: EMPTY_ROOT_HASH,
        ..Default::default()
    }
}

/// Compute the base fee of the child of `parent`.
///
/// A parent without a base fee is treated as the fork block, whose child
/// pays the parent-less initial value of zero.
pub fn next_base_fee(parent: &Header) -> u64 {
    parent.base_fee_per_gas.map_or(0, |base_fee| {
        calc_next_block_base_fee(
            parent.gas_used,
            parent.gas_limit,
            base_fee,
            BaseFeeParams::ethereum(),
        )
    })
}

/// Compute the timestamp of the block at position `index` of a round.
///
/// The first block uses `max(now, parent)`. Each later block advances the
/// previous timestamp by `interval`.
pub const fn next_timestamp(index: u64, previous: u64, now: u64, interval: u64) -> u64 {
    if index == 0 {
        if now > previous {
            now
        } else {
            previous
        }
    } else {
        previous.saturating_add(interval)
    }
}

/// Header fields chosen by the miner for a block about to be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderData {
    /// Block number.
    pub number: u64,
    /// Block timestamp.
    pub timestamp: u64,
    /// Block gas limit.
    pub gas_limit: u64,
    /// Block base fee.
    pub base_fee: u64,
    /// Fee recipient.
    pub beneficiary: Address,
}

impl HeaderData {
    /// Seal the header for a built block.
    pub(crate) fn seal(
        self,
        parent_hash: B256,
        state_root: B256,
        receipts: &[TxReceipt],
        transactions: Vec<PendingTx>,
    ) -> Block {
        let gas_used = receipts.last().map(|r| r.cumulative_gas_used).unwrap_or_default();
        let logs_bloom = receipts.iter().fold(Bloom::ZERO, |mut bloom, receipt| {
            bloom.accrue_bloom(&receipt.logs_bloom);
            bloom
        });
        let header = Header {
            parent_hash,
            beneficiary: self.beneficiary,
            state_root,
            transactions_root: commitment(transactions.iter().map(PendingTx::hash)),
            receipts_root: commitment(receipts.iter().map(TxReceipt::commitment)),
            logs_bloom,
            number: self.number,
            gas_limit: self.gas_limit,
            gas_used,
            timestamp: self.timestamp,
            base_fee_per_gas: Some(self.base_fee),
            ..empty_header()
        };
        Block::new(header, transactions)
    }
}

/// A flat commitment to an ordered list of hashes. Empty lists commit to
/// the empty trie root.
fn commitment(hashes: impl Iterator<Item = B256>) -> B256 {
    let buf: Vec<u8> = hashes.flat_map(|h| h.0).collect();
    if buf.is_empty() {
        EMPTY_ROOT_HASH
    } else {
        keccak256(buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloy::eips::eip1559::INITIAL_BASE_FEE;

    #[test]
    fn timestamps() {
        assert_eq!(next_timestamp(0, 100, 50, 5), 100);
        assert_eq!(next_timestamp(0, 100, 150, 5), 150);
        assert_eq!(next_timestamp(1, 150, 9999, 5), 155);
        assert_eq!(next_timestamp(2, u64::MAX, 0, 5), u64::MAX);
    }

    #[test]
    fn base_fee_of_empty_parent_drops() {
        let genesis = Block::genesis(0, 30_000_000, INITIAL_BASE_FEE, EMPTY_ROOT_HASH, Address::ZERO);
        // An empty block is below target, so the base fee falls by 1/8.
        assert_eq!(genesis.next_base_fee(), INITIAL_BASE_FEE - INITIAL_BASE_FEE / 8);
    }

    #[test]
    fn base_fee_of_full_parent_rises() {
        let header = Header {
            gas_limit: 30_000_000,
            gas_used: 30_000_000,
            base_fee_per_gas: Some(INITIAL_BASE_FEE),
            ..Default::default()
        };
        assert_eq!(next_base_fee(&header), INITIAL_BASE_FEE + INITIAL_BASE_FEE / 8);
    }

    #[test]
    fn empty_block_commits_to_empty_roots() {
        let block = HeaderData {
            number: 1,
            timestamp: 1,
            gas_limit: 30_000_000,
            base_fee: 7,
            beneficiary: Address::ZERO,
        }
        .seal(B256::ZERO, EMPTY_ROOT_HASH, &[], vec![]);
        assert_eq!(block.header().transactions_root, EMPTY_ROOT_HASH);
        assert_eq!(block.header().receipts_root, EMPTY_ROOT_HASH);
        assert_eq!(block.header().gas_used, 0);
        assert_eq!(block.hash(), block.header().hash_slow());
    }
}
