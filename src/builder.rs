use crate::{
    block::HeaderData,
    exec::{BlockEnv, ExecError},
    state::StateError,
    Block, Executor, PendingTx, ReceiptLog, StateManager, TxReceipt,
};
use alloy::primitives::{Bloom, B256};
use revm::context::result::{ExecutionResult, HaltReason, Output};
use std::sync::Arc;
use tracing::{debug, trace};

/// The outcome of feeding a transaction to a [`BlockBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// The transaction was included. Its receipt may still record a failed
    /// execution.
    Included {
        /// Index of the transaction in the block.
        index: usize,
        /// True if execution succeeded.
        success: bool,
    },
    /// The transaction does not fit in the remaining block gas. Nothing was
    /// executed.
    BlockFull {
        /// Gas left in the block.
        remaining: u64,
    },
    /// The executor rejected the transaction. It was not included and left
    /// no trace in the state.
    Invalid(ExecError),
}

/// A block that has been built, with the receipts of its transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedBlock {
    /// The block.
    pub block: Arc<Block>,
    /// Receipts, in transaction order.
    pub receipts: Arc<Vec<TxReceipt>>,
}

/// Builds a single block on top of a parent.
///
/// The builder opens a state checkpoint when the first transaction is
/// added. [`BlockBuilder::build`] commits that checkpoint and seals the
/// block. [`BlockBuilder::revert`] discards every change the builder made.
#[derive(Debug)]
pub struct BlockBuilder<'a> {
    state: &'a mut dyn StateManager,
    executor: &'a dyn Executor,
    parent_hash: B256,
    header: HeaderData,
    env: BlockEnv,
    checkpointed: bool,
    gas_used: u64,
    log_index: u64,
    transactions: Vec<PendingTx>,
    receipts: Vec<TxReceipt>,
}

impl<'a> BlockBuilder<'a> {
    /// Open a builder for a child of `parent`.
    pub fn open(
        state: &'a mut dyn StateManager,
        executor: &'a dyn Executor,
        parent: &Block,
        header: HeaderData,
        chain_id: u64,
    ) -> Self {
        let env = BlockEnv {
            chain_id,
            number: header.number,
            timestamp: header.timestamp,
            gas_limit: header.gas_limit,
            base_fee: header.base_fee,
            coinbase: header.beneficiary,
        };
        Self {
            state,
            executor,
            parent_hash: parent.hash(),
            header,
            env,
            checkpointed: false,
            gas_used: 0,
            log_index: 0,
            transactions: vec![],
            receipts: vec![],
        }
    }

    /// The environment transactions are executed in.
    pub const fn env(&self) -> &BlockEnv {
        &self.env
    }

    /// The gas used so far.
    pub const fn gas_used(&self) -> u64 {
        self.gas_used
    }

    /// The gas left in the block.
    pub const fn remaining_gas(&self) -> u64 {
        self.header.gas_limit.saturating_sub(self.gas_used)
    }

    /// The receipts accumulated so far.
    pub fn receipts(&self) -> &[TxReceipt] {
        &self.receipts
    }

    /// Execute a transaction and append it to the block.
    ///
    /// Only state manager failures are returned as `Err`. Execution failures
    /// are recorded in the receipt, invalid transactions are reported as
    /// [`TxOutcome::Invalid`].
    pub fn add_transaction(&mut self, tx: PendingTx) -> Result<TxOutcome, ExecError> {
        let remaining = self.remaining_gas();
        if tx.gas_limit() > remaining {
            return Ok(TxOutcome::BlockFull { remaining });
        }

        if !self.checkpointed {
            self.state.checkpoint();
            self.checkpointed = true;
        }

        // Each transaction runs in its own checkpoint so that a rejected one
        // leaves no partial writes.
        self.state.checkpoint();
        let result = match self.executor.execute(self.state, &self.env, &tx) {
            Ok(result) => {
                self.state.commit(false)?;
                result
            }
            Err(err) => {
                self.state.revert()?;
                if !err.is_invalid_tx() {
                    return Err(err);
                }
                return Ok(TxOutcome::Invalid(err));
            }
        };

        let index = self.transactions.len();
        let receipt = self.receipt(index, &tx, result);
        let success = receipt.status;
        trace!(tx = %tx.hash(), index, success, gas_used = receipt.gas_used, "added transaction");
        if let Some(error) = &receipt.error {
            debug!(tx = %tx.hash(), %error, "transaction execution failed");
        }

        self.receipts.push(receipt);
        self.transactions.push(tx);
        Ok(TxOutcome::Included { index, success })
    }

    fn receipt(&mut self, index: usize, tx: &PendingTx, result: ExecutionResult) -> TxReceipt {
        let gas_used = result.gas_used();
        self.gas_used = self.gas_used.saturating_add(gas_used);

        let (status, logs, contract_address, error) = match result {
            ExecutionResult::Success { logs, output, .. } => {
                let created = match output {
                    Output::Create(_, created) => created,
                    Output::Call(_) => None,
                };
                (true, logs, created, None)
            }
            ExecutionResult::Revert { .. } => (false, vec![], None, Some("revert".to_owned())),
            ExecutionResult::Halt { reason, .. } => (false, vec![], None, Some(halt_message(&reason))),
        };

        let mut logs_bloom = Bloom::ZERO;
        let logs = logs
            .into_iter()
            .map(|log| {
                logs_bloom.accrue_log(&log);
                let log = ReceiptLog {
                    inner: log,
                    log_index: self.log_index,
                    transaction_index: index as u64,
                    transaction_hash: tx.hash(),
                    block_hash: B256::ZERO,
                    block_number: self.header.number,
                };
                self.log_index += 1;
                log
            })
            .collect();

        TxReceipt {
            transaction_hash: tx.hash(),
            transaction_index: index as u64,
            block_hash: B256::ZERO,
            block_number: self.header.number,
            from: tx.sender(),
            to: tx.to(),
            contract_address,
            gas_used,
            cumulative_gas_used: self.gas_used,
            effective_gas_price: tx.effective_gas_price(Some(self.header.base_fee)),
            status,
            logs,
            logs_bloom,
            error,
        }
    }

    /// Commit the current state to a new state root, which the block will
    /// carry.
    pub fn commit_state_root(&mut self) -> Result<(), StateError> {
        self.state.checkpoint();
        self.state.commit(true)
    }

    /// Commit the builder checkpoint and seal the block against the current
    /// state root.
    pub fn build(self) -> Result<MinedBlock, StateError> {
        if self.checkpointed {
            self.state.commit(false)?;
        }
        let block = self.header.seal(
            self.parent_hash,
            self.state.state_root(),
            &self.receipts,
            self.transactions,
        );
        let mut receipts = self.receipts;
        for receipt in &mut receipts {
            receipt.set_block_hash(block.hash());
        }
        Ok(MinedBlock { block: Arc::new(block), receipts: Arc::new(receipts) })
    }

    /// Discard every state change made by the builder.
    pub fn revert(self) -> Result<(), StateError> {
        if self.checkpointed {
            self.state.revert()?;
        }
        Ok(())
    }
}

/// A short description of why execution halted.
fn halt_message(reason: &HaltReason) -> String {
    match reason {
        HaltReason::OutOfGas(_) => "out of gas".to_owned(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{test_utils::*, MemoryState, TransferExecutor};
    use alloy::{
        consensus::constants::EMPTY_ROOT_HASH,
        primitives::{Address, U256},
    };

    fn header(gas_limit: u64) -> HeaderData {
        HeaderData {
            number: 1,
            timestamp: 1,
            gas_limit,
            base_fee: 1,
            beneficiary: Address::ZERO,
        }
    }

    fn genesis() -> Block {
        Block::genesis(0, 30_000_000, 1, EMPTY_ROOT_HASH, Address::ZERO)
    }

    #[test]
    fn build_fills_receipts() {
        let mut state = MemoryState::genesis([(ALICE, U256::MAX >> 1)]);
        let parent = genesis();
        let mut builder = BlockBuilder::open(&mut state, &TransferExecutor, &parent, header(30_000_000), 900);

        let outcome = builder.add_transaction(impersonated_transfer(ALICE, 0, BOB)).unwrap();
        assert_eq!(outcome, TxOutcome::Included { index: 0, success: true });
        builder.add_transaction(impersonated_transfer(ALICE, 1, BOB)).unwrap();

        let mined = builder.build().unwrap();
        assert_eq!(mined.block.header().parent_hash, parent.hash());
        assert_eq!(mined.block.header().gas_used, 42_000);
        assert_eq!(mined.receipts[1].cumulative_gas_used, 42_000);
        assert!(mined.receipts.iter().all(|r| r.block_hash == mined.block.hash()));
        assert_eq!(state.depth(), 0);
        assert_eq!(state.nonce(ALICE).unwrap(), 2);
    }

    #[test]
    fn block_full_executes_nothing() {
        let mut state = MemoryState::genesis([(ALICE, U256::MAX >> 1)]);
        let parent = genesis();
        let mut builder = BlockBuilder::open(&mut state, &TransferExecutor, &parent, header(30_000), 900);
        builder.add_transaction(impersonated_transfer(ALICE, 0, BOB)).unwrap();
        let outcome = builder.add_transaction(impersonated_transfer(ALICE, 1, BOB)).unwrap();
        assert_eq!(outcome, TxOutcome::BlockFull { remaining: 9_000 });
        assert_eq!(builder.receipts().len(), 1);
    }

    #[test]
    fn invalid_tx_leaves_no_trace() {
        let mut state = MemoryState::genesis([(ALICE, U256::MAX >> 1)]);
        let parent = genesis();
        let mut builder = BlockBuilder::open(&mut state, &TransferExecutor, &parent, header(30_000_000), 900);
        let poor = Address::repeat_byte(0x99);
        let outcome = builder.add_transaction(impersonated_transfer(poor, 0, BOB)).unwrap();
        assert!(matches!(outcome, TxOutcome::Invalid(ExecError::InsufficientFunds { .. })));
        let mined = builder.build().unwrap();
        assert!(mined.block.transactions().is_empty());
        assert_eq!(mined.block.header().transactions_root, EMPTY_ROOT_HASH);
    }

    #[test]
    fn halts_and_logs_are_recorded() {
        let mut state = MemoryState::genesis([(ALICE, U256::MAX >> 1)]);
        let parent = genesis();
        let executor = ScriptedExecutor::default()
            .with_script(LOGGER, Script::Log)
            .with_script(BURNER, Script::OutOfGas);
        let mut builder = BlockBuilder::open(&mut state, &executor, &parent, header(30_000_000), 900);

        builder.add_transaction(impersonated_transfer(ALICE, 0, LOGGER)).unwrap();
        let outcome = builder.add_transaction(impersonated_transfer(ALICE, 1, BURNER)).unwrap();
        assert_eq!(outcome, TxOutcome::Included { index: 1, success: false });
        builder.add_transaction(impersonated_transfer(ALICE, 2, LOGGER)).unwrap();

        let mined = builder.build().unwrap();
        let receipts = &mined.receipts;
        assert_eq!(receipts[1].error.as_deref(), Some("out of gas"));
        assert!(receipts[1].logs.is_empty());
        assert_eq!(receipts[0].logs[0].log_index, 0);
        assert_eq!(receipts[2].logs[0].log_index, 1);
        assert_eq!(receipts[2].logs[0].transaction_index, 2);
        assert_ne!(mined.block.header().logs_bloom, Bloom::ZERO);
    }

    #[test]
    fn revert_discards_changes() {
        let mut state = MemoryState::genesis([(ALICE, U256::MAX >> 1)]);
        let parent = genesis();
        let mut builder = BlockBuilder::open(&mut state, &TransferExecutor, &parent, header(30_000_000), 900);
        builder.add_transaction(impersonated_transfer(ALICE, 0, BOB)).unwrap();
        builder.revert().unwrap();
        assert!(state.account(BOB).unwrap().is_none());
        assert_eq!(state.depth(), 0);
    }
}
