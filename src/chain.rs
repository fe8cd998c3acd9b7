use crate::Block;
use alloy::primitives::B256;
use std::{collections::HashMap, sync::Arc};

/// Errors produced by a [`Chain`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    /// The block does not extend the canonical head.
    #[error("block {number} has parent {parent}, expected head {head}")]
    InvalidParent {
        /// Number of the rejected block.
        number: u64,
        /// Parent hash of the rejected block.
        parent: B256,
        /// Hash of the canonical head.
        head: B256,
    },

    /// The block number does not follow the canonical head.
    #[error("block number {got} does not follow head {head}")]
    InvalidNumber {
        /// Number of the rejected block.
        got: u64,
        /// Number of the canonical head.
        head: u64,
    },

    /// The fork does not start at the canonical head.
    #[error("fork starts at {origin}, expected head {head}")]
    ForkOrigin {
        /// Hash of the block the fork starts at.
        origin: B256,
        /// Hash of the canonical head.
        head: B256,
    },

    /// The requested block is not known.
    #[error("block {0} not found")]
    BlockNotFound(B256),
}

/// An in-memory blockchain holding a single canonical chain.
///
/// Blocks are reference counted. A [`Chain::fork`] holds only the head, so
/// building against it costs nothing per historical block.
#[derive(Debug, Clone)]
pub struct Chain {
    by_hash: HashMap<B256, Arc<Block>>,
    canonical: Vec<B256>,
    head: Arc<Block>,
    /// Number of `canonical[0]`.
    first: u64,
}

impl Chain {
    /// Create a chain from its genesis block.
    pub fn new(genesis: Block) -> Self {
        let head = Arc::new(genesis);
        Self {
            by_hash: HashMap::from([(head.hash(), head.clone())]),
            canonical: vec![head.hash()],
            first: head.number(),
            head,
        }
    }

    /// Start a chain at the current head. Blocks put on the fork can later
    /// be moved back with [`Chain::extend`].
    pub fn fork(&self) -> Self {
        Self {
            by_hash: HashMap::from([(self.head.hash(), self.head.clone())]),
            canonical: vec![self.head.hash()],
            head: self.head.clone(),
            first: self.head.number(),
        }
    }

    /// Check that `fork` starts at the current head.
    pub fn ensure_extends(&self, fork: &Self) -> Result<(), ChainError> {
        let origin = fork.canonical.first().copied().unwrap_or_default();
        if origin != self.head.hash() {
            return Err(ChainError::ForkOrigin { origin, head: self.head.hash() });
        }
        Ok(())
    }

    /// Append the blocks of a fork started at the current head.
    pub fn extend(&mut self, fork: Self) -> Result<(), ChainError> {
        self.ensure_extends(&fork)?;
        for hash in fork.canonical.iter().skip(1) {
            self.put_block(fork.block(*hash)?)?;
        }
        Ok(())
    }

    /// The canonical head.
    pub fn head(&self) -> Arc<Block> {
        self.head.clone()
    }

    /// The number of the canonical head.
    pub fn head_number(&self) -> u64 {
        self.head.number()
    }

    /// Look up a block by hash.
    pub fn block(&self, hash: B256) -> Result<Arc<Block>, ChainError> {
        self.by_hash.get(&hash).cloned().ok_or(ChainError::BlockNotFound(hash))
    }

    /// Look up a canonical block by number.
    pub fn block_by_number(&self, number: u64) -> Option<Arc<Block>> {
        let idx = usize::try_from(number.checked_sub(self.first)?).ok()?;
        let hash = self.canonical.get(idx)?;
        self.by_hash.get(hash).cloned()
    }

    /// Append a block to the canonical chain. The block must be the child of
    /// the current head.
    pub fn put_block(&mut self, block: impl Into<Arc<Block>>) -> Result<Arc<Block>, ChainError> {
        let block = block.into();
        let head = &self.head;
        if block.header().parent_hash != head.hash() {
            return Err(ChainError::InvalidParent {
                number: block.number(),
                parent: block.header().parent_hash,
                head: head.hash(),
            });
        }
        if block.number() != head.number() + 1 {
            return Err(ChainError::InvalidNumber { got: block.number(), head: head.number() });
        }

        self.by_hash.insert(block.hash(), block.clone());
        self.canonical.push(block.hash());
        self.head = block.clone();
        Ok(block)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloy::{
        consensus::{constants::EMPTY_ROOT_HASH, Header},
        primitives::Address,
    };

    fn genesis() -> Block {
        Block::genesis(0, 30_000_000, 7, EMPTY_ROOT_HASH, Address::ZERO)
    }

    fn child(parent: &Block) -> Block {
        Block::new(
            Header {
                parent_hash: parent.hash(),
                number: parent.number() + 1,
                timestamp: parent.timestamp() + 1,
                ..Default::default()
            },
            vec![],
        )
    }

    #[test]
    fn extends_head() {
        let genesis = genesis();
        let mut chain = Chain::new(genesis.clone());
        let one = child(&genesis);
        chain.put_block(one.clone()).unwrap();
        assert_eq!(chain.head().hash(), one.hash());
        assert_eq!(chain.head_number(), 1);
        assert_eq!(chain.block_by_number(0).unwrap().hash(), genesis.hash());
        assert!(chain.block_by_number(2).is_none());
    }

    #[test]
    fn rejects_orphans() {
        let genesis = genesis();
        let mut chain = Chain::new(genesis.clone());
        let one = child(&genesis);
        let two = child(&one);
        assert!(matches!(chain.put_block(two), Err(ChainError::InvalidParent { .. })));
        assert_eq!(chain.head_number(), 0);
    }

    #[test]
    fn fork_extends_origin() {
        let genesis = genesis();
        let mut chain = Chain::new(genesis.clone());
        let one = child(&genesis);
        chain.put_block(one.clone()).unwrap();

        let mut fork = chain.fork();
        assert!(fork.block_by_number(0).is_none());
        assert_eq!(fork.block_by_number(1).unwrap().hash(), one.hash());
        let two = child(&one);
        let three = child(&two);
        fork.put_block(two.clone()).unwrap();
        fork.put_block(three.clone()).unwrap();
        assert_eq!(chain.head_number(), 1);

        chain.extend(fork).unwrap();
        assert_eq!(chain.head().hash(), three.hash());
        assert_eq!(chain.block_by_number(0).unwrap().hash(), genesis.hash());
        assert_eq!(chain.block_by_number(2).unwrap().hash(), two.hash());
        assert!(chain.block(two.hash()).is_ok());
    }

    #[test]
    fn stale_fork_is_rejected() {
        let genesis = genesis();
        let mut chain = Chain::new(genesis.clone());
        let mut fork = chain.fork();
        fork.put_block(child(&genesis)).unwrap();

        let other = Block::new(
            Header { parent_hash: genesis.hash(), number: 1, timestamp: 99, ..Default::default() },
            vec![],
        );
        chain.put_block(other).unwrap();
        assert!(matches!(chain.extend(fork), Err(ChainError::ForkOrigin { .. })));
        assert_eq!(chain.head_number(), 1);
    }

    #[test]
    fn clone_is_independent() {
        let genesis = genesis();
        let chain = Chain::new(genesis.clone());
        let mut copy = chain.clone();
        copy.put_block(child(&genesis)).unwrap();
        assert_eq!(chain.head_number(), 0);
        assert_eq!(copy.head_number(), 1);
    }
}
