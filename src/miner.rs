use crate::{
    block::{next_timestamp, HeaderData},
    builder::{BlockBuilder, MinedBlock, TxOutcome},
    events::{observe, round_events},
    node::BlockOverrides,
    state::StateSnapshot,
    Block, Executor, MineError, MineObserver, Node, StateManager, TxPool, Vm,
};
use alloy::primitives::B256;
use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, debug_span, error, warn, Instrument};

/// Parameters of a mining round.
pub struct MineParams {
    /// Return recoverable failures as `Err` rather than as
    /// [`MineResponse::Failed`]. Defaults to `true`.
    pub throw_on_fail: bool,
    /// Seconds between the timestamps of consecutive blocks of the round.
    /// Defaults to `1`.
    pub interval: u64,
    /// Number of blocks to mine. Defaults to `1`.
    pub block_count: u64,
    /// Callbacks run while the round's events are published.
    pub observer: Option<Box<dyn MineObserver>>,
}

impl fmt::Debug for MineParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MineParams")
            .field("throw_on_fail", &self.throw_on_fail)
            .field("interval", &self.interval)
            .field("block_count", &self.block_count)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Default for MineParams {
    fn default() -> Self {
        Self { throw_on_fail: true, interval: 1, block_count: 1, observer: None }
    }
}

impl MineParams {
    /// Set whether recoverable failures are returned as `Err`.
    pub const fn with_throw_on_fail(mut self, throw_on_fail: bool) -> Self {
        self.throw_on_fail = throw_on_fail;
        self
    }

    /// Set the interval between block timestamps.
    pub const fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval;
        self
    }

    /// Set the number of blocks to mine.
    pub const fn with_block_count(mut self, block_count: u64) -> Self {
        self.block_count = block_count;
        self
    }

    /// Set the observer.
    pub fn with_observer(mut self, observer: impl MineObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    fn validate(&self, overrides: &BlockOverrides) -> Result<u64, MineError> {
        let interval = overrides.timestamp_interval.unwrap_or(self.interval);
        if interval == 0 && self.block_count > 1 {
            return Err(MineError::invalid_params(
                "interval must be positive when mining more than one block",
            ));
        }
        Ok(interval)
    }
}

/// The blocks mined by a successful round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MineOutcome {
    /// Hashes of the mined blocks, in order.
    pub block_hashes: Vec<B256>,
    /// The mined blocks and their receipts, in order.
    pub blocks: Vec<MinedBlock>,
}

/// The result of a round that did not hit an internal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MineResponse {
    /// The round committed.
    Mined(MineOutcome),
    /// The round failed and `throw_on_fail` was unset. Nothing was
    /// committed.
    Failed {
        /// Why the round failed.
        errors: Vec<MineError>,
    },
}

impl MineResponse {
    /// The outcome, if the round committed.
    pub const fn outcome(&self) -> Option<&MineOutcome> {
        match self {
            Self::Mined(outcome) => Some(outcome),
            Self::Failed { .. } => None,
        }
    }

    /// The errors, if the round failed.
    pub fn errors(&self) -> &[MineError] {
        match self {
            Self::Mined(_) => &[],
            Self::Failed { errors } => errors,
        }
    }
}

/// A private fork of the VM and a copy of the pool that a round builds
/// against. The fork starts at the head, so its cost does not grow with the
/// chain.
///
/// Nothing a session does is visible to the node until
/// [`MiningSession::commit`].
#[derive(Debug)]
pub(crate) struct MiningSession {
    vm: Vm,
    pool: TxPool,
    mined: Vec<MinedBlock>,
}

impl MiningSession {
    pub(crate) const fn new(vm: Vm, pool: TxPool) -> Self {
        Self { vm, pool, mined: Vec::new() }
    }

    /// Build, persist and account for one block. Returns the new state root
    /// and the snapshot it commits to.
    pub(crate) fn mine_block(
        &mut self,
        executor: &dyn Executor,
        chain_id: u64,
        header: HeaderData,
    ) -> Result<(B256, StateSnapshot), MineError> {
        let parent = self.vm.chain.head();
        let ordered = self.pool.txs_by_price_and_nonce(Some(header.base_fee));
        debug!(number = header.number, timestamp = header.timestamp, candidates = ordered.len(), "building block");

        let mut builder = BlockBuilder::open(&mut self.vm.state, executor, &parent, header, chain_id);
        let mut dropped = Vec::new();
        for tx in ordered {
            let hash = tx.hash();
            match builder.add_transaction(tx)? {
                TxOutcome::Included { .. } => {}
                TxOutcome::BlockFull { remaining } => {
                    debug!(tx = %hash, remaining, "block full");
                    break;
                }
                TxOutcome::Invalid(err) => {
                    warn!(tx = %hash, %err, "dropping invalid transaction");
                    dropped.push(hash);
                }
            }
        }

        builder.commit_state_root()?;
        let mined = builder.build()?;
        let block = &mined.block;

        self.vm.receipts.save_receipts(block, mined.receipts.clone());
        self.vm.chain.put_block(block.clone())?;
        if self.vm.receipts.receipts(block.hash()).is_none() {
            return Err(MineError::ReceiptsMissing(block.hash()));
        }

        self.pool.remove_new_block_txs([block.as_ref()]);
        for hash in dropped {
            self.pool.remove(hash);
        }

        let root = block.header().state_root;
        let value =
            self.vm.state.state_root_value(root).ok_or(MineError::StateRootMissing(root))?;
        self.mined.push(mined);
        Ok((root, value))
    }

    /// The head of the working chain.
    pub(crate) fn head(&self) -> Arc<Block> {
        self.vm.chain.head()
    }

    /// Swap the session into the live VM and pool. This is the only place a
    /// round mutates the node's chain, receipts, active state root and pool.
    pub(crate) fn commit(self, vm: &mut Vm, pool: &mut TxPool) -> Result<Vec<MinedBlock>, MineError> {
        vm.chain.ensure_extends(&self.vm.chain)?;
        vm.state.set_state_root(self.vm.state.state_root())?;
        vm.chain.extend(self.vm.chain)?;
        vm.receipts.extend(self.vm.receipts);
        *pool = self.pool;
        Ok(self.mined)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

impl Node {
    /// Mine `block_count` blocks from the pending transactions.
    ///
    /// The round builds against a private copy of the VM and pool and swaps
    /// both into the node once every block has been built. Events are
    /// published after the swap.
    ///
    /// Recoverable failures are returned as `Err` if
    /// [`MineParams::throw_on_fail`] is set, and as
    /// [`MineResponse::Failed`] otherwise. Internal errors are always
    /// returned as `Err`.
    pub async fn mine(&self, params: MineParams) -> Result<MineResponse, MineError> {
        let span = debug_span!("mine", block_count = params.block_count, interval = params.interval);
        self.mine_inner(params).instrument(span).await
    }

    async fn mine_inner(&self, params: MineParams) -> Result<MineResponse, MineError> {
        let throw_on_fail = params.throw_on_fail;
        let overrides = *self.inner.overrides.lock().await;
        let interval = params.validate(&overrides);
        let interval = round_try!(interval, throw_on_fail);
        let guard = round_try!(self.begin_mining().await, throw_on_fail);

        let result = self.run_round(params.block_count, interval).await;
        drop(guard);
        if let Err(err) = &result {
            error!(%err, "mining round failed");
        }
        let mined = round_try!(result, throw_on_fail);

        let mut observer = params.observer;
        for event in round_events(&mined) {
            let stop = observer.as_deref_mut().is_some_and(|obs| observe(obs, &event).is_break());
            if stop {
                debug!("observer stopped callback delivery");
                observer = None;
            }
            self.publish(event);
        }

        let block_hashes = mined.iter().map(|m| m.block.hash()).collect();
        Ok(MineResponse::Mined(MineOutcome { block_hashes, blocks: mined }))
    }

    async fn run_round(&self, block_count: u64, interval: u64) -> Result<Vec<MinedBlock>, MineError> {
        // The pool stays locked for the whole round, so transactions
        // submitted meanwhile wait for the swap.
        let mut pool = self.inner.pool.lock().await;
        let mut session = MiningSession::new(self.inner.vm.read().await.fork(), pool.clone());

        let (first_timestamp, first_base_fee, gas_limit) = {
            let mut overrides = self.inner.overrides.lock().await;
            (overrides.next_timestamp.take(), overrides.next_base_fee.take(), overrides.gas_limit)
        };

        let coinbase = self.inner.config.coinbase;
        let chain_id = self.inner.config.chain_id;
        let now = unix_now();
        let mut previous = session.head().timestamp();

        for index in 0..block_count {
            let parent = session.head();
            let timestamp = match first_timestamp {
                Some(ts) if index == 0 => ts,
                _ => next_timestamp(index, previous, now, interval),
            };
            let base_fee = match first_base_fee {
                Some(fee) if index == 0 => fee,
                _ => parent.next_base_fee(),
            };
            let header = HeaderData {
                number: parent.number() + 1,
                timestamp,
                gas_limit: gas_limit.unwrap_or(parent.header().gas_limit),
                base_fee,
                beneficiary: coinbase,
            };

            let (root, value) = session.mine_block(self.inner.executor.as_ref(), chain_id, header)?;
            self.inner.vm.write().await.state.save_state_root(root, value);
            previous = timestamp;
        }

        let mut vm = self.inner.vm.write().await;
        session.commit(&mut vm, &mut pool)
    }
}
