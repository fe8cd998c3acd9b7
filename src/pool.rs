use crate::{config::PoolConfig, state::StateError, Block, PendingTx, StateManager};
use alloy::{
    consensus::Header,
    primitives::{Address, B256, U256},
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap, HashMap},
};
use tracing::trace;

/// Reasons a transaction is refused by the [`TxPool`].
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The transaction is unsigned and a signature was required.
    #[error("Attempting to add tx to txpool which is not signed")]
    NotSigned,

    /// The same transaction is already pooled.
    #[error("{0}: this transaction is already in the TxPool")]
    AlreadyKnown(B256),

    /// The calldata exceeds the configured limit.
    #[error("Tx is too large ({size} bytes) and exceeds the max data size of {max} bytes")]
    DataTooLarge {
        /// Calldata size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The pool holds its maximum number of remote transactions.
    #[error("Transaction pool is full")]
    PoolFull,

    /// The tip is below the configured minimum.
    #[error("Tx does not pay the minimum gas price of {min}")]
    Underpriced {
        /// Configured minimum.
        min: u128,
    },

    /// The sender holds its maximum number of remote transactions.
    #[error("Sender has too many transactions: already have {count} txs for this account")]
    SenderLimit {
        /// Transactions already pooled for the sender.
        count: usize,
    },

    /// A same-nonce replacement does not bump the fees enough.
    #[error("replacement gas too low, got tip {tip}, min: {min_tip}, got fee {max_fee}, min: {min_max_fee}")]
    ReplacementUnderpriced {
        /// Offered tip.
        tip: u128,
        /// Required tip.
        min_tip: u128,
        /// Offered fee cap.
        max_fee: u128,
        /// Required fee cap.
        min_max_fee: u128,
    },

    /// The fee cap is less than half the head base fee.
    #[error("Tx cannot pay basefee of {base_fee}, have {max_fee} (not within 50% range of current basefee)")]
    BaseFeeOutOfRange {
        /// Head base fee.
        base_fee: u64,
        /// Offered fee cap.
        max_fee: u128,
    },

    /// The gas limit exceeds the head block gas limit.
    #[error("Tx gaslimit of {gas_limit} exceeds block gas limit of {block_gas_limit} (exceeds last block gas limit)")]
    GasLimitExceeded {
        /// Transaction gas limit.
        gas_limit: u64,
        /// Head gas limit.
        block_gas_limit: u64,
    },

    /// The nonce was already used.
    #[error("{sender} tries to send a tx with nonce {nonce}, but account has nonce {expected} (tx nonce too low)")]
    NonceTooLow {
        /// Sender.
        sender: Address,
        /// Transaction nonce.
        nonce: u64,
        /// Account nonce.
        expected: u64,
    },

    /// The sender cannot cover value plus the maximum gas cost.
    #[error("{sender} does not have enough balance to cover transaction costs, need {cost}, but have {balance} (insufficient balance)")]
    InsufficientFunds {
        /// Sender.
        sender: Address,
        /// Required balance.
        cost: U256,
        /// Account balance.
        balance: U256,
    },

    /// The state manager failed.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Options for [`TxPool::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOptions {
    /// Local transactions bypass pool size, sender limit, minimum tip and
    /// base-fee window checks.
    pub is_local: bool,
    /// Refuse impersonated transactions.
    pub require_signature: bool,
    /// Skip the sender balance check. The pooled transaction keeps the flag,
    /// so its sender is not checked when it is mined either.
    pub skip_balance: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self { is_local: true, require_signature: true, skip_balance: false }
    }
}

impl AddOptions {
    /// Options for transactions submitted by the node on behalf of a caller.
    pub const fn impersonated(skip_balance: bool) -> Self {
        Self { is_local: true, require_signature: false, skip_balance }
    }

    /// Options for transactions received from a remote peer.
    pub const fn remote() -> Self {
        Self { is_local: false, require_signature: true, skip_balance: false }
    }
}

/// Pending transactions, indexed by sender and nonce.
///
/// The pool is cheap to clone so that a mining round can work on its own
/// copy and swap it in when the round completes.
#[derive(Debug, Clone, Default)]
pub struct TxPool {
    config: PoolConfig,
    by_sender: HashMap<Address, BTreeMap<u64, PendingTx>>,
    by_hash: HashMap<B256, (Address, u64)>,
}

impl TxPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self { config, ..Default::default() }
    }

    /// The number of pooled transactions.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// True if no transactions are pooled.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// The gas reserved by all pooled transactions.
    pub fn pending_gas(&self) -> u64 {
        self.iter().map(PendingTx::gas_limit).fold(0, u64::saturating_add)
    }

    /// Iterate over all pooled transactions, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingTx> + '_ {
        self.by_sender.values().flat_map(BTreeMap::values)
    }

    /// Look up a pooled transaction by hash.
    pub fn get(&self, hash: B256) -> Option<&PendingTx> {
        let (sender, nonce) = self.by_hash.get(&hash)?;
        self.by_sender.get(sender)?.get(nonce)
    }

    /// True if the transaction is pooled.
    pub fn contains(&self, hash: B256) -> bool {
        self.by_hash.contains_key(&hash)
    }

    /// The transactions of a sender, in nonce order.
    pub fn by_sender(&self, sender: Address) -> impl Iterator<Item = &PendingTx> + '_ {
        self.by_sender.get(&sender).into_iter().flat_map(BTreeMap::values)
    }

    /// Validate and add a transaction. A pooled transaction from the same
    /// sender with the same nonce is replaced.
    pub fn add(
        &mut self,
        tx: PendingTx,
        head: &Header,
        state: &dyn StateManager,
        opts: AddOptions,
    ) -> Result<B256, PoolError> {
        let skip_balance = opts.skip_balance || tx.skip_balance();
        let tx = tx.with_skip_balance(skip_balance);
        self.validate(&tx, head, state, opts)?;
        Ok(self.add_unverified(tx))
    }

    /// Add a transaction without validation.
    pub fn add_unverified(&mut self, tx: PendingTx) -> B256 {
        let (sender, nonce, hash) = (tx.sender(), tx.nonce(), tx.hash());
        if let Some(replaced) = self.by_sender.entry(sender).or_default().insert(nonce, tx) {
            trace!(replaced = %replaced.hash(), %hash, "replacing pooled transaction");
            self.by_hash.remove(&replaced.hash());
        }
        self.by_hash.insert(hash, (sender, nonce));
        hash
    }

    /// Remove a transaction by hash, returning it if it was pooled.
    pub fn remove(&mut self, hash: B256) -> Option<PendingTx> {
        let (sender, nonce) = self.by_hash.remove(&hash)?;
        let txs = self.by_sender.get_mut(&sender)?;
        let removed = txs.remove(&nonce);
        if txs.is_empty() {
            self.by_sender.remove(&sender);
        }
        removed
    }

    /// Remove the transactions included in `blocks`.
    pub fn remove_new_block_txs<'a>(&mut self, blocks: impl IntoIterator<Item = &'a Block>) {
        for block in blocks {
            for hash in block.transaction_hashes() {
                self.remove(hash);
            }
        }
    }

    /// The pooled transactions in mining order.
    ///
    /// Each sender's transactions are taken in ascending nonce order. With a
    /// non-zero `base_fee`, a sender's list is cut at its first transaction
    /// whose fee cap is below the base fee. Sender lists are then merged by
    /// [`PendingTx::normalized_gas_price`], highest first, comparing only
    /// the next transaction of each sender.
    pub fn txs_by_price_and_nonce(&self, base_fee: Option<u64>) -> Vec<PendingTx> {
        let mut by_nonce: HashMap<Address, std::vec::IntoIter<&PendingTx>> = HashMap::new();
        let mut by_price = BinaryHeap::new();

        for (sender, txs) in &self.by_sender {
            let mut sorted: Vec<&PendingTx> = txs.values().collect();
            if let Some(base_fee) = base_fee.filter(|b| *b != 0) {
                if let Some(cut) =
                    sorted.iter().position(|tx| tx.normalized_gas_price(None) < base_fee as u128)
                {
                    trace!(%sender, skipped = sorted.len() - cut, "skipping underpriced transactions");
                    sorted.truncate(cut);
                }
            }
            let mut rest = sorted.into_iter();
            if let Some(head) = rest.next() {
                by_price.push(Priced::new(head, base_fee));
                by_nonce.insert(*sender, rest);
            }
        }

        let mut ordered = Vec::with_capacity(self.len());
        while let Some(Priced { tx, .. }) = by_price.pop() {
            if let Some(next) = by_nonce.get_mut(&tx.sender()).and_then(Iterator::next) {
                by_price.push(Priced::new(next, base_fee));
            }
            ordered.push(tx.clone());
        }
        ordered
    }

    fn validate(
        &self,
        tx: &PendingTx,
        head: &Header,
        state: &dyn StateManager,
        opts: AddOptions,
    ) -> Result<(), PoolError> {
        pool_ensure!(!opts.require_signature || !tx.is_impersonated(), PoolError::NotSigned);

        let size = tx.input().len();
        pool_ensure!(
            size <= self.config.max_data_size,
            PoolError::DataTooLarge { size, max: self.config.max_data_size }
        );

        let tip = tx.max_priority_fee_per_gas();
        let max_fee = tx.max_fee_per_gas();
        if !opts.is_local {
            pool_ensure!(self.len() < self.config.max_size, PoolError::PoolFull);
            pool_ensure!(
                tip >= self.config.min_gas_price,
                PoolError::Underpriced { min: self.config.min_gas_price }
            );
        }

        if let Some(pooled) = self.by_sender.get(&tx.sender()) {
            if !opts.is_local {
                pool_ensure!(
                    pooled.len() < self.config.max_per_sender,
                    PoolError::SenderLimit { count: pooled.len() }
                );
            }
            if let Some(existing) = pooled.get(&tx.nonce()) {
                pool_ensure!(existing.hash() != tx.hash(), PoolError::AlreadyKnown(tx.hash()));
                self.validate_bump(existing, tip, max_fee)?;
            }
        }

        if let Some(base_fee) = head.base_fee_per_gas.filter(|b| *b != 0) {
            pool_ensure!(
                opts.is_local || max_fee >= (base_fee / 2) as u128,
                PoolError::BaseFeeOutOfRange { base_fee, max_fee }
            );
        }
        pool_ensure!(
            tx.gas_limit() <= head.gas_limit,
            PoolError::GasLimitExceeded { gas_limit: tx.gas_limit(), block_gas_limit: head.gas_limit }
        );

        let account = state.account(tx.sender())?.unwrap_or_default();
        pool_ensure!(
            account.nonce <= tx.nonce(),
            PoolError::NonceTooLow { sender: tx.sender(), nonce: tx.nonce(), expected: account.nonce }
        );
        let cost = tx.max_cost();
        pool_ensure!(
            tx.skip_balance() || account.balance >= cost,
            PoolError::InsufficientFunds { sender: tx.sender(), cost, balance: account.balance }
        );
        Ok(())
    }

    fn validate_bump(&self, existing: &PendingTx, tip: u128, max_fee: u128) -> Result<(), PoolError> {
        let bump = |price: u128| price + price * self.config.price_bump_percent / 100;
        let min_tip = bump(existing.max_priority_fee_per_gas());
        let min_max_fee = bump(existing.max_fee_per_gas());
        pool_ensure!(
            tip >= min_tip && max_fee >= min_max_fee,
            PoolError::ReplacementUnderpriced { tip, min_tip, max_fee, min_max_fee }
        );
        Ok(())
    }
}

/// Heap entry ordering transactions by price, then by age, then by sender.
#[derive(Debug)]
struct Priced<'a> {
    price: u128,
    tx: &'a PendingTx,
}

impl<'a> Priced<'a> {
    fn new(tx: &'a PendingTx, base_fee: Option<u64>) -> Self {
        Self { price: tx.normalized_gas_price(base_fee), tx }
    }
}

impl PartialEq for Priced<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Priced<'_> {}

impl PartialOrd for Priced<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priced<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher price first, then older, then lower sender.
        self.price
            .cmp(&other.price)
            .then_with(|| other.tx.added().cmp(&self.tx.added()))
            .then_with(|| other.tx.sender().cmp(&self.tx.sender()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryState;
    use alloy::consensus::TxEip1559;
    use std::time::{Duration, SystemTime};

    const ALICE: Address = Address::repeat_byte(0xa1);
    const BOB: Address = Address::repeat_byte(0xb0);

    fn tx(sender: Address, nonce: u64, max_fee: u128, tip: u128) -> PendingTx {
        PendingTx::impersonated(
            TxEip1559 {
                nonce,
                gas_limit: 21_000,
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: tip,
                ..Default::default()
            },
            sender,
        )
    }

    fn head(base_fee: u64) -> Header {
        Header { gas_limit: 30_000_000, base_fee_per_gas: Some(base_fee), ..Default::default() }
    }

    fn state() -> MemoryState {
        MemoryState::genesis([(ALICE, U256::from(u64::MAX)), (BOB, U256::from(u64::MAX))])
    }

    #[test]
    fn price_then_nonce() {
        let mut pool = TxPool::default();
        // Alice's second tx pays more than anything, but must wait for her
        // first.
        pool.add_unverified(tx(ALICE, 1, 1000, 100));
        pool.add_unverified(tx(ALICE, 0, 1000, 1));
        pool.add_unverified(tx(BOB, 0, 1000, 50));

        let order: Vec<_> =
            pool.txs_by_price_and_nonce(Some(10)).iter().map(|t| (t.sender(), t.nonce())).collect();
        assert_eq!(order, vec![(BOB, 0), (ALICE, 0), (ALICE, 1)]);
    }

    #[test]
    fn underpriced_cuts_sender_list() {
        let mut pool = TxPool::default();
        pool.add_unverified(tx(ALICE, 0, 100, 1));
        pool.add_unverified(tx(ALICE, 1, 5, 1));
        pool.add_unverified(tx(ALICE, 2, 100, 1));

        let ordered = pool.txs_by_price_and_nonce(Some(10));
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].nonce(), 0);
        // Without a base fee nothing is cut.
        assert_eq!(pool.txs_by_price_and_nonce(None).len(), 3);
    }

    #[test]
    fn ties_break_by_age() {
        let mut pool = TxPool::default();
        let older = tx(BOB, 0, 100, 5).with_added(SystemTime::UNIX_EPOCH);
        let newer = tx(ALICE, 0, 100, 5).with_added(SystemTime::UNIX_EPOCH + Duration::from_secs(1));
        pool.add_unverified(newer);
        pool.add_unverified(older);

        let ordered = pool.txs_by_price_and_nonce(Some(10));
        assert_eq!(ordered[0].sender(), BOB);
    }

    #[test]
    fn replacement_needs_bump() {
        let state = state();
        let mut pool = TxPool::default();
        let opts = AddOptions::impersonated(false);
        pool.add(tx(ALICE, 0, 100, 10), &head(10), &state, opts).unwrap();

        let err = pool.add(tx(ALICE, 0, 105, 11), &head(10), &state, opts).unwrap_err();
        assert!(matches!(err, PoolError::ReplacementUnderpriced { min_tip: 11, min_max_fee: 110, .. }));

        let replacement = tx(ALICE, 0, 110, 11);
        let hash = pool.add(replacement, &head(10), &state, opts).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(hash));

        let err = pool.add(pool.get(hash).unwrap().clone(), &head(10), &state, opts).unwrap_err();
        assert_eq!(err, PoolError::AlreadyKnown(hash));
    }

    #[test]
    fn validation() {
        let state = state();
        let mut pool = TxPool::new(PoolConfig { max_data_size: 0, ..Default::default() });

        let unsigned = pool.add(tx(ALICE, 0, 100, 10), &head(10), &state, AddOptions::default());
        assert_eq!(unsigned.unwrap_err(), PoolError::NotSigned);

        let remote = AddOptions { require_signature: false, ..AddOptions::remote() };
        let err = pool.add(tx(ALICE, 0, 1_000_000_000, 1), &head(10), &state, remote).unwrap_err();
        assert!(matches!(err, PoolError::Underpriced { .. }));

        let err = pool
            .add(tx(ALICE, 0, 1, 200_000_000), &head(1_000), &state, remote)
            .unwrap_err();
        assert!(matches!(err, PoolError::BaseFeeOutOfRange { .. }));

        let mut big = tx(ALICE, 0, 100, 10);
        if let crate::tx::PooledTx::Impersonated(inner) = &mut big.tx {
            inner.gas_limit = 40_000_000;
        }
        let err = pool.add(big, &head(10), &state, AddOptions::impersonated(false)).unwrap_err();
        assert!(matches!(err, PoolError::GasLimitExceeded { .. }));

        let poor = Address::repeat_byte(0x99);
        let err = pool
            .add(tx(poor, 0, 100, 10), &head(10), &state, AddOptions::impersonated(false))
            .unwrap_err();
        assert!(matches!(err, PoolError::InsufficientFunds { .. }));
        let hash =
            pool.add(tx(poor, 0, 100, 10), &head(10), &state, AddOptions::impersonated(true)).unwrap();
        assert!(pool.get(hash).unwrap().skip_balance());
    }

    #[test]
    fn nonce_too_low() {
        let mut state = state();
        state.modify_account(ALICE, &mut |a| a.nonce = 3).unwrap();
        let mut pool = TxPool::default();
        let err = pool
            .add(tx(ALICE, 2, 100, 10), &head(10), &state, AddOptions::impersonated(false))
            .unwrap_err();
        assert!(matches!(err, PoolError::NonceTooLow { expected: 3, .. }));
    }

    #[test]
    fn removal_and_pending_gas() {
        let mut pool = TxPool::default();
        let a = pool.add_unverified(tx(ALICE, 0, 100, 10));
        pool.add_unverified(tx(ALICE, 1, 100, 10));
        assert_eq!(pool.pending_gas(), 42_000);

        assert!(pool.remove(a).is_some());
        assert!(pool.remove(a).is_none());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.by_sender(ALICE).count(), 1);
    }
}
