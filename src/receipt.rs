use crate::Block;
use alloy::primitives::{keccak256, Address, Bloom, Log, B256};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

/// A log emitted by a mined transaction, with its position in the chain.
///
/// Serializes as a JSON-RPC log object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLog {
    /// The emitted log.
    #[serde(flatten)]
    pub inner: Log,
    /// Index of the log within its block.
    #[serde(with = "alloy::serde::quantity")]
    pub log_index: u64,
    /// Index of the emitting transaction within its block.
    #[serde(with = "alloy::serde::quantity")]
    pub transaction_index: u64,
    /// Hash of the emitting transaction.
    pub transaction_hash: B256,
    /// Hash of the containing block.
    pub block_hash: B256,
    /// Number of the containing block.
    #[serde(with = "alloy::serde::quantity")]
    pub block_number: u64,
}

/// The receipt of a mined transaction.
///
/// Serializes as a JSON-RPC receipt object, plus `error` for failed
/// executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    /// Transaction hash.
    pub transaction_hash: B256,
    /// Index within the block.
    #[serde(with = "alloy::serde::quantity")]
    pub transaction_index: u64,
    /// Hash of the containing block.
    pub block_hash: B256,
    /// Number of the containing block.
    #[serde(with = "alloy::serde::quantity")]
    pub block_number: u64,
    /// Sender.
    pub from: Address,
    /// Call target. `None` for creations.
    pub to: Option<Address>,
    /// Address of the created contract, if any.
    pub contract_address: Option<Address>,
    /// Gas used by this transaction.
    #[serde(with = "alloy::serde::quantity")]
    pub gas_used: u64,
    /// Gas used by this and all previous transactions in the block.
    #[serde(with = "alloy::serde::quantity")]
    pub cumulative_gas_used: u64,
    /// Price per gas paid.
    #[serde(with = "alloy::serde::quantity")]
    pub effective_gas_price: u128,
    /// True if execution succeeded.
    #[serde(with = "alloy::serde::quantity")]
    pub status: bool,
    /// Logs emitted, empty unless `status` is set.
    pub logs: Vec<ReceiptLog>,
    /// Bloom over the logs.
    pub logs_bloom: Bloom,
    /// The reason execution did not succeed, e.g. `"out of gas"` or
    /// `"revert"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TxReceipt {
    /// A hash committing to the consensus fields of the receipt.
    pub(crate) fn commitment(&self) -> B256 {
        let mut buf = Vec::with_capacity(1 + 8 + 256 + 32 * self.logs.len());
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.cumulative_gas_used.to_be_bytes());
        buf.extend_from_slice(self.logs_bloom.as_slice());
        for log in &self.logs {
            buf.extend_from_slice(log.inner.address.as_slice());
            for topic in log.inner.topics() {
                buf.extend_from_slice(topic.as_slice());
            }
            buf.extend_from_slice(&log.inner.data.data);
        }
        keccak256(buf)
    }

    /// Fill in the hash of the block the receipt was mined in.
    pub(crate) fn set_block_hash(&mut self, hash: B256) {
        self.block_hash = hash;
        for log in &mut self.logs {
            log.block_hash = hash;
        }
    }
}

/// Receipts indexed by block hash and by transaction hash.
///
/// The manager is part of the [`Vm`], so receipts are swapped into the live
/// node together with the blocks they belong to.
///
/// [`Vm`]: crate::Vm
#[derive(Debug, Clone, Default)]
pub struct ReceiptsManager {
    by_block: HashMap<B256, Arc<Vec<TxReceipt>>>,
    by_tx: HashMap<B256, (B256, usize)>,
}

impl ReceiptsManager {
    /// Save the receipts of a block.
    pub fn save_receipts(&mut self, block: &Block, receipts: impl Into<Arc<Vec<TxReceipt>>>) {
        let receipts = receipts.into();
        for (idx, receipt) in receipts.iter().enumerate() {
            self.by_tx.insert(receipt.transaction_hash, (block.hash(), idx));
        }
        self.by_block.insert(block.hash(), receipts);
    }

    /// Take over the receipts saved in `other`.
    pub fn extend(&mut self, other: Self) {
        self.by_block.extend(other.by_block);
        self.by_tx.extend(other.by_tx);
    }

    /// The receipts of a block, if saved.
    pub fn receipts(&self, block_hash: B256) -> Option<Arc<Vec<TxReceipt>>> {
        self.by_block.get(&block_hash).cloned()
    }

    /// The receipt of a transaction, if mined.
    pub fn receipt_by_tx_hash(&self, tx_hash: B256) -> Option<&TxReceipt> {
        let (block_hash, idx) = self.by_tx.get(&tx_hash)?;
        self.by_block.get(block_hash)?.get(*idx)
    }
}
