use crate::{config::NodeConfig, Block, Chain, MemoryState, ReceiptsManager, StateManager};

/// The chain, state and receipts a node executes against.
///
/// A mining round works on a [`Vm::fork`] and never on the live VM.
#[derive(Debug, Clone)]
pub struct Vm {
    pub(crate) chain: Chain,
    pub(crate) state: MemoryState,
    pub(crate) receipts: ReceiptsManager,
}

impl Vm {
    /// Create a VM at genesis.
    pub fn genesis(config: &NodeConfig) -> Self {
        let state = MemoryState::genesis(config.genesis_alloc.iter().map(|(a, b)| (*a, *b)));
        let genesis = Block::genesis(
            config.genesis_timestamp,
            config.genesis_gas_limit,
            config.genesis_base_fee,
            state.state_root(),
            config.coinbase,
        );
        Self { chain: Chain::new(genesis), state, receipts: ReceiptsManager::default() }
    }

    /// Create a copy that holds the head, current state and no receipts.
    /// Blocks and receipts added to it are merged back by the mining round.
    pub fn fork(&self) -> Self {
        Self {
            chain: self.chain.fork(),
            state: self.state.fork(),
            receipts: ReceiptsManager::default(),
        }
    }

    /// The blockchain.
    pub const fn chain(&self) -> &Chain {
        &self.chain
    }

    /// The state manager.
    pub const fn state(&self) -> &MemoryState {
        &self.state
    }

    /// Mutable access to the state manager.
    pub fn state_mut(&mut self) -> &mut MemoryState {
        &mut self.state
    }

    /// The receipts manager.
    pub const fn receipts(&self) -> &ReceiptsManager {
        &self.receipts
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloy::primitives::{Address, U256};

    #[test]
    fn genesis_commits_alloc() {
        let config = NodeConfig::default().with_funds(Address::repeat_byte(1), U256::from(5));
        let vm = Vm::genesis(&config);
        let head = vm.chain().head();
        assert_eq!(head.number(), 0);
        assert_eq!(head.header().state_root, vm.state().state_root());
        assert!(vm.state().state_root_value(head.header().state_root).is_some());
    }

    #[test]
    fn fork_starts_at_head() {
        let config = NodeConfig::default().with_funds(Address::repeat_byte(1), U256::from(5));
        let vm = Vm::genesis(&config);
        let fork = vm.fork();
        assert_eq!(fork.chain().head().hash(), vm.chain().head().hash());
        assert_eq!(fork.state().state_root(), vm.state().state_root());
        assert_eq!(fork.state().balance(Address::repeat_byte(1)).unwrap(), U256::from(5));
        assert!(vm.chain().ensure_extends(fork.chain()).is_ok());
    }
}
