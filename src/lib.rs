//! Block production for an in-memory EVM development node.
//!
//! This crate implements the mining core of a development node: it turns the
//! pending transactions of a [`TxPool`] into sealed blocks, commits them to
//! the node's [`Vm`] as one atomic step, and publishes the resulting
//! [`NodeEvent`]s. It also decides when to mine, according to the node's
//! [`MiningConfig`].
//!
//! The crate does NOT implement an EVM interpreter. Transactions are run by
//! an [`Executor`]. The bundled [`TransferExecutor`] handles value transfers
//! and contract address derivation with EIP-1559 fee accounting, which is
//! enough to exercise everything around execution.
//!
//! ## Quickstart
//!
//! ```
//! # async fn _f() -> Result<(), Box<dyn std::error::Error>> {
//! use tevm_miner::{MineParams, MineResponse, MiningConfig, Node, NodeConfig};
//!
//! let node = Node::new(NodeConfig::default().with_mining(MiningConfig::Manual));
//!
//! // Mine three empty blocks, 12 seconds apart.
//! let params = MineParams::default().with_block_count(3).with_interval(12);
//! if let MineResponse::Mined(outcome) = node.mine(params).await? {
//!     assert_eq!(outcome.block_hashes.len(), 3);
//! }
//! assert_eq!(node.block_number().await, 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Mining rounds
//!
//! A call to [`Node::mine`] is a round. A round:
//!
//! - rejects the call if the node is mining, syncing or stopped, and waits
//!   while it initializes.
//! - forks the live [`Vm`] at its head and copies the pool.
//! - builds each block against the copy. Transactions are taken in
//!   price-and-nonce order. Failed executions are recorded in their receipts
//!   and included. Transactions the [`Executor`] rejects are dropped.
//! - swaps the copy into the node. Readers observe either the chain before
//!   the round or the chain after it, never a partial round.
//! - publishes, for each block, [`NodeEvent::NewBlock`], then every
//!   [`NodeEvent::NewReceipt`] followed by its [`NodeEvent::NewLog`]s.
//!
//! Recoverable failures are returned as `Err` or as
//! [`MineResponse::Failed`], as selected by [`MineParams::throw_on_fail`].
//! Broken invariants are always `Err`.
//!
//! ## Mining modes
//!
//! ```none
//! +--------+   tx pooled   +-----------------------+
//! | Auto   | ------------> | mine one block        |
//! +--------+               +-----------------------+
//! +--------+   tx pooled   +-----------------------+
//! | Gas    | ------------> | mine if pending gas   |
//! +--------+               | reaches the limit     |
//!                          +-----------------------+
//! +--------+   timer tick  +-----------------------+
//! |Interval| ------------> | mine one block        |
//! +--------+               +-----------------------+
//! +--------+
//! | Manual |   only explicit `mine` calls
//! +--------+
//! ```
//!
//! When a write triggers automining and the round fails, the write reports
//! the mining errors instead of its own success. See
//! [`Node::handle_automining`].
//!
//! ## JSON-RPC
//!
//! [`Node::handle_rpc`] serves the mining procedures (`tevm_mine`,
//! `anvil_mine`, `evm_mine`, `anvil_mineDetailed`), the transaction and call
//! procedures that feed the pool, and the `anvil_*`/`evm_*` procedures that
//! override the header of upcoming blocks.
//!
//! ## Feature flags
//!
//! - `test-utils` - provides funded nodes, transaction builders, a scripted
//!   [`Executor`] and a recording [`MineObserver`] for tests.

#![doc(
    html_logo_url = "https://raw.githubusercontent.com/alloy-rs/core/main/assets/alloy.jpg",
    html_favicon_url = "https://raw.githubusercontent.com/alloy-rs/core/main/assets/favicon.ico"
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
mod macros;

mod actions;
pub use actions::{CallOutcome, SendOutcome};

mod automine;
pub use automine::AutomineResult;

mod block;
pub use block::{next_base_fee, next_timestamp, Block, HeaderData};

mod builder;
pub use builder::{BlockBuilder, MinedBlock, TxOutcome};

mod chain;
pub use chain::{Chain, ChainError};

mod config;
pub use config::{MiningConfig, NodeConfig, PoolConfig, DEFAULT_CHAIN_ID, DEFAULT_GAS_LIMIT};

mod error;
pub use error::{
    ActionError, MineError, EXECUTION_REVERTED, INTERNAL_ERROR, INVALID_PARAMS, SERVER_ERROR,
};

mod est;
pub use est::EstimationResult;

mod events;
pub use events::{MineObserver, NodeEvent};

mod exec;
pub use exec::{
    charge_gas, intrinsic_gas, validate_tx, BlockEnv, ExecError, Executor, TransferExecutor,
    CREATE_GAS, MIN_TRANSACTION_GAS,
};

mod interval;
pub use interval::IntervalMiner;

mod miner;
pub use miner::{MineOutcome, MineParams, MineResponse};

mod node;
pub use node::{BlockOverrides, Node, NodeStatus};

mod pool;
pub use pool::{AddOptions, PoolError, TxPool};

mod receipt;
pub use receipt::{ReceiptLog, ReceiptsManager, TxReceipt};

mod rpc;
pub use rpc::{RpcError, RpcRequest, RpcResponse, METHOD_NOT_FOUND, PARSE_ERROR};

mod state;
pub use state::{MemoryState, StateError, StateManager, StateSnapshot};

mod tx;
pub use tx::{PendingTx, PooledTx, TxDecodeError, TxRequest};

mod vm;
pub use vm::Vm;

pub use revm;

/// Utilities for testing the miner or testing with it.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
