use alloy::{
    eips::eip1559::INITIAL_BASE_FEE,
    primitives::{Address, U256},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// The default block gas limit of a freshly created chain.
pub const DEFAULT_GAS_LIMIT: u64 = 30_000_000;

/// The default chain id, matching the conventional development chain.
pub const DEFAULT_CHAIN_ID: u64 = 900;

/// How the node decides when to mine.
///
/// Exactly one mode is active at a time. The mode is read once at the start
/// of every automining decision and may not be switched while a mining round
/// is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MiningConfig {
    /// Mine a block immediately after every accepted transaction.
    #[default]
    Auto,
    /// Only mine on explicit request.
    Manual,
    /// Mine on a fixed timer, independent of transaction submission.
    Interval {
        /// Time between two interval-mined blocks.
        #[serde(with = "secs_f64", rename = "blockTime")]
        block_time: Duration,
    },
    /// Mine once the pending transactions reserve at least `limit` gas.
    Gas {
        /// Pending gas threshold.
        limit: u64,
    },
}

impl MiningConfig {
    /// Interval mining with the given block time.
    pub const fn interval(block_time: Duration) -> Self {
        Self::Interval { block_time }
    }

    /// Gas-threshold mining with the given limit.
    pub const fn gas(limit: u64) -> Self {
        Self::Gas { limit }
    }

    /// True if the mode is [`MiningConfig::Auto`].
    pub const fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }

    /// The block time, if the mode is [`MiningConfig::Interval`].
    pub const fn block_time(&self) -> Option<Duration> {
        match self {
            Self::Interval { block_time } => Some(*block_time),
            _ => None,
        }
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Limits and price rules enforced by the transaction pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Maximum number of transactions held. Local transactions bypass it.
    pub max_size: usize,
    /// Maximum number of transactions per sender. Local transactions bypass
    /// it.
    pub max_per_sender: usize,
    /// Minimum priority fee for remote transactions, in wei.
    pub min_gas_price: u128,
    /// Minimum fee increase, in percent, for a same-nonce replacement.
    pub price_bump_percent: u128,
    /// Maximum calldata size in bytes.
    pub max_data_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5000,
            max_per_sender: 100,
            min_gas_price: 100_000_000,
            price_bump_percent: 10,
            max_data_size: 128 * 1024,
        }
    }
}

/// Configuration of a [`Node`].
///
/// [`Node`]: crate::Node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Chain id reported by the node and used for impersonated transactions.
    pub chain_id: u64,
    /// Fee recipient of mined blocks.
    pub coinbase: Address,
    /// Timestamp of the genesis block.
    pub genesis_timestamp: u64,
    /// Gas limit of the genesis block, inherited by its descendants.
    pub genesis_gas_limit: u64,
    /// Base fee of the genesis block.
    pub genesis_base_fee: u64,
    /// Balances allocated at genesis.
    pub genesis_alloc: BTreeMap<Address, U256>,
    /// The initial mining mode.
    pub mining: MiningConfig,
    /// Transaction pool limits.
    pub pool: PoolConfig,
    /// Capacity of the lifecycle event channel. Slow subscribers lag beyond
    /// this many events.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID,
            coinbase: Address::ZERO,
            genesis_timestamp: 0,
            genesis_gas_limit: DEFAULT_GAS_LIMIT,
            genesis_base_fee: INITIAL_BASE_FEE,
            genesis_alloc: BTreeMap::new(),
            mining: MiningConfig::default(),
            pool: PoolConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl NodeConfig {
    /// Set the chain id.
    pub const fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Set the coinbase.
    pub const fn with_coinbase(mut self, coinbase: Address) -> Self {
        self.coinbase = coinbase;
        self
    }

    /// Set the genesis timestamp.
    pub const fn with_genesis_timestamp(mut self, timestamp: u64) -> Self {
        self.genesis_timestamp = timestamp;
        self
    }

    /// Set the genesis gas limit.
    pub const fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.genesis_gas_limit = gas_limit;
        self
    }

    /// Set the genesis base fee.
    pub const fn with_base_fee(mut self, base_fee: u64) -> Self {
        self.genesis_base_fee = base_fee;
        self
    }

    /// Set the mining mode.
    pub const fn with_mining(mut self, mining: MiningConfig) -> Self {
        self.mining = mining;
        self
    }

    /// Set the pool limits.
    pub const fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Allocate `balance` to `address` at genesis.
    pub fn with_funds(mut self, address: Address, balance: U256) -> Self {
        self.genesis_alloc.insert(address, balance);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mining_config_wire_shape() {
        let auto: MiningConfig = serde_json::from_str(r#"{"type":"auto"}"#).unwrap();
        assert_eq!(auto, MiningConfig::Auto);

        let interval: MiningConfig =
            serde_json::from_str(r#"{"type":"interval","blockTime":0.5}"#).unwrap();
        assert_eq!(interval.block_time(), Some(Duration::from_millis(500)));

        let gas: MiningConfig = serde_json::from_str(r#"{"type":"gas","limit":21000}"#).unwrap();
        assert_eq!(gas, MiningConfig::gas(21_000));

        assert_eq!(serde_json::to_string(&MiningConfig::Manual).unwrap(), r#"{"type":"manual"}"#);
    }

    #[test]
    fn negative_block_time_is_rejected() {
        assert!(serde_json::from_str::<MiningConfig>(r#"{"type":"interval","blockTime":-1}"#)
            .is_err());
    }
}
