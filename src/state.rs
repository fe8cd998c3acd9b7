use alloy::{
    consensus::constants::EMPTY_ROOT_HASH,
    primitives::{keccak256, Address, B256, U256},
};
use revm::state::AccountInfo;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

/// Errors produced by a [`StateManager`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// Commit or revert was called without an open checkpoint.
    #[error("no checkpoint to commit or revert")]
    NoCheckpoint,

    /// The requested state root is not in the root cache.
    #[error("state root {0} is not known")]
    UnknownRoot(B256),
}

/// The account set a state root commits to.
///
/// Snapshots are cheap to clone and are shared between the root caches of a
/// [`StateManager`] and its deep copies.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot(Arc<BTreeMap<Address, AccountInfo>>);

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSnapshot").field("accounts", &self.0.len()).finish()
    }
}

impl StateSnapshot {
    /// The number of accounts in the snapshot.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the snapshot holds no accounts.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up an account in the snapshot.
    pub fn account(&self, address: &Address) -> Option<&AccountInfo> {
        self.0.get(address)
    }
}

/// Account state with checkpoints and a cache of committed roots.
///
/// The trait is object safe so that executors can operate on any
/// implementation.
pub trait StateManager: fmt::Debug + Send + Sync {
    /// Load an account. Returns `None` if the account does not exist.
    fn account(&self, address: Address) -> Result<Option<AccountInfo>, StateError>;

    /// Overwrite an account.
    fn put_account(&mut self, address: Address, info: AccountInfo) -> Result<(), StateError>;

    /// Open a checkpoint. Changes after this point can be reverted as a unit.
    fn checkpoint(&mut self);

    /// Close the most recent checkpoint, keeping its changes. If
    /// `create_new_state_root` is set, the current state is committed to a
    /// new root, which is saved in the root cache and becomes the current
    /// root.
    fn commit(&mut self, create_new_state_root: bool) -> Result<(), StateError>;

    /// Close the most recent checkpoint, discarding its changes.
    fn revert(&mut self) -> Result<(), StateError>;

    /// The current state root.
    fn state_root(&self) -> B256;

    /// The snapshot saved under `root`, if any.
    fn state_root_value(&self, root: B256) -> Option<StateSnapshot>;

    /// Save a snapshot under `root`.
    fn save_state_root(&mut self, root: B256, value: StateSnapshot);

    /// Replace the current state with the snapshot saved under `root`.
    fn set_state_root(&mut self, root: B256) -> Result<(), StateError>;

    /// Balance of an account, zero if it does not exist.
    fn balance(&self, address: Address) -> Result<U256, StateError> {
        Ok(self.account(address)?.map(|acct| acct.balance).unwrap_or_default())
    }

    /// Nonce of an account, zero if it does not exist.
    fn nonce(&self, address: Address) -> Result<u64, StateError> {
        Ok(self.account(address)?.map(|acct| acct.nonce).unwrap_or_default())
    }

    /// Modify an account with the provided closure, creating it if absent.
    /// Returns the original account info.
    fn modify_account(
        &mut self,
        address: Address,
        f: &mut dyn FnMut(&mut AccountInfo),
    ) -> Result<AccountInfo, StateError> {
        let original = self.account(address)?.unwrap_or_default();
        let mut info = original.clone();
        f(&mut info);
        self.put_account(address, info)?;
        Ok(original)
    }
}

/// An in-memory [`StateManager`].
///
/// Checkpoints are a stack of journals recording the previous value of every
/// account touched since the checkpoint was opened.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    accounts: BTreeMap<Address, AccountInfo>,
    journal: Vec<BTreeMap<Address, Option<AccountInfo>>>,
    roots: HashMap<B256, StateSnapshot>,
    current_root: B256,
}

impl MemoryState {
    /// Create a state holding the given balances, with its root committed.
    pub fn genesis<I>(alloc: I) -> Self
    where
        I: IntoIterator<Item = (Address, U256)>,
    {
        let accounts = alloc
            .into_iter()
            .map(|(address, balance)| (address, AccountInfo { balance, ..Default::default() }))
            .collect();
        let mut state = Self { accounts, ..Default::default() };
        state.commit_root();
        state
    }

    /// Create an independent copy. Root cache entries are shared by
    /// reference, the current account set is copied.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// Create an independent copy that caches only the current root.
    ///
    /// The root cache of a long-lived state grows with every committed
    /// root, so working copies leave it behind.
    pub fn fork(&self) -> Self {
        let roots = self
            .roots
            .get(&self.current_root)
            .map(|value| HashMap::from([(self.current_root, value.clone())]))
            .unwrap_or_default();
        Self {
            accounts: self.accounts.clone(),
            journal: self.journal.clone(),
            roots,
            current_root: self.current_root,
        }
    }

    /// The number of open checkpoints.
    pub fn depth(&self) -> usize {
        self.journal.len()
    }

    /// The accounts currently held.
    pub const fn accounts(&self) -> &BTreeMap<Address, AccountInfo> {
        &self.accounts
    }

    /// Compute the commitment to the current account set. Accounts are
    /// hashed in address order as `address ‖ nonce ‖ balance ‖ code_hash`.
    pub fn compute_root(&self) -> B256 {
        if self.accounts.is_empty() {
            return EMPTY_ROOT_HASH;
        }
        let mut buf = Vec::with_capacity(self.accounts.len() * (20 + 8 + 32 + 32));
        for (address, info) in &self.accounts {
            buf.extend_from_slice(address.as_slice());
            buf.extend_from_slice(&info.nonce.to_be_bytes());
            buf.extend_from_slice(&info.balance.to_be_bytes::<32>());
            buf.extend_from_slice(info.code_hash.as_slice());
        }
        keccak256(buf)
    }

    fn commit_root(&mut self) {
        let root = self.compute_root();
        self.roots.insert(root, StateSnapshot(Arc::new(self.accounts.clone())));
        self.current_root = root;
    }

    fn record(&mut self, address: Address) {
        let prev = self.accounts.get(&address).cloned();
        if let Some(frame) = self.journal.last_mut() {
            frame.entry(address).or_insert(prev);
        }
    }
}

impl StateManager for MemoryState {
    fn account(&self, address: Address) -> Result<Option<AccountInfo>, StateError> {
        Ok(self.accounts.get(&address).cloned())
    }

    fn put_account(&mut self, address: Address, info: AccountInfo) -> Result<(), StateError> {
        self.record(address);
        self.accounts.insert(address, info);
        Ok(())
    }

    fn checkpoint(&mut self) {
        self.journal.push(BTreeMap::new());
    }

    fn commit(&mut self, create_new_state_root: bool) -> Result<(), StateError> {
        let frame = self.journal.pop().ok_or(StateError::NoCheckpoint)?;
        // The parent keeps its own, older, previous values.
        if let Some(parent) = self.journal.last_mut() {
            for (address, prev) in frame {
                parent.entry(address).or_insert(prev);
            }
        }
        if create_new_state_root {
            self.commit_root();
        }
        Ok(())
    }

    fn revert(&mut self) -> Result<(), StateError> {
        let frame = self.journal.pop().ok_or(StateError::NoCheckpoint)?;
        for (address, prev) in frame {
            match prev {
                Some(info) => self.accounts.insert(address, info),
                None => self.accounts.remove(&address),
            };
        }
        Ok(())
    }

    fn state_root(&self) -> B256 {
        self.current_root
    }

    fn state_root_value(&self, root: B256) -> Option<StateSnapshot> {
        self.roots.get(&root).cloned()
    }

    fn save_state_root(&mut self, root: B256, value: StateSnapshot) {
        self.roots.insert(root, value);
    }

    fn set_state_root(&mut self, root: B256) -> Result<(), StateError> {
        let snapshot = self.roots.get(&root).ok_or(StateError::UnknownRoot(root))?;
        self.accounts = snapshot.0.as_ref().clone();
        self.journal.clear();
        self.current_root = root;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ALICE: Address = Address::repeat_byte(0xa1);
    const BOB: Address = Address::repeat_byte(0xb0);

    fn funded() -> MemoryState {
        MemoryState::genesis([(ALICE, U256::from(100))])
    }

    #[test]
    fn revert_restores_and_removes() {
        let mut state = funded();
        state.checkpoint();
        state.modify_account(ALICE, &mut |a| a.balance = U256::from(1)).unwrap();
        state.modify_account(BOB, &mut |a| a.nonce = 3).unwrap();
        state.revert().unwrap();

        assert_eq!(state.balance(ALICE).unwrap(), U256::from(100));
        assert!(state.account(BOB).unwrap().is_none());
    }

    #[test]
    fn nested_commit_then_outer_revert() {
        let mut state = funded();
        state.checkpoint();
        state.checkpoint();
        state.modify_account(ALICE, &mut |a| a.balance = U256::from(7)).unwrap();
        state.commit(false).unwrap();
        assert_eq!(state.depth(), 1);
        state.revert().unwrap();
        assert_eq!(state.balance(ALICE).unwrap(), U256::from(100));
    }

    #[test]
    fn commit_creates_root() {
        let mut state = funded();
        let genesis_root = state.state_root();
        assert!(state.state_root_value(genesis_root).is_some());

        state.checkpoint();
        state.modify_account(BOB, &mut |a| a.balance = U256::from(5)).unwrap();
        state.commit(true).unwrap();

        let root = state.state_root();
        assert_ne!(root, genesis_root);
        assert_eq!(state.state_root_value(root).unwrap().len(), 2);

        state.set_state_root(genesis_root).unwrap();
        assert!(state.account(BOB).unwrap().is_none());
        assert_eq!(state.state_root(), genesis_root);
    }

    #[test]
    fn errors() {
        let mut state = funded();
        assert_eq!(state.commit(true), Err(StateError::NoCheckpoint));
        assert_eq!(state.revert(), Err(StateError::NoCheckpoint));
        assert_eq!(state.set_state_root(B256::ZERO), Err(StateError::UnknownRoot(B256::ZERO)));
    }

    #[test]
    fn deep_copy_is_independent() {
        let state = funded();
        let mut copy = state.deep_copy();
        copy.put_account(BOB, AccountInfo::default()).unwrap();
        assert!(state.account(BOB).unwrap().is_none());
        assert_eq!(copy.state_root_value(state.state_root()), state.state_root_value(state.state_root()));
    }

    #[test]
    fn fork_keeps_current_root_only() {
        let mut state = funded();
        let old = state.state_root();
        state.checkpoint();
        state.put_account(BOB, AccountInfo { balance: U256::from(1), ..Default::default() }).unwrap();
        state.commit(true).unwrap();

        let fork = state.fork();
        assert_eq!(fork.state_root(), state.state_root());
        assert!(fork.state_root_value(state.state_root()).is_some());
        assert!(fork.state_root_value(old).is_none());
        assert!(state.state_root_value(old).is_some());
        assert_eq!(fork.balance(BOB).unwrap(), U256::from(1));
    }

    #[test]
    fn empty_state_root() {
        assert_eq!(MemoryState::default().compute_root(), EMPTY_ROOT_HASH);
    }
}
