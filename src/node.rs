use crate::{
    config::{MiningConfig, NodeConfig},
    interval::IntervalMiner,
    Executor, MineError, NodeEvent, TransferExecutor, TxPool, Vm,
};
use std::{fmt, sync::Arc};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::debug;

/// Lifecycle status of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// The node is starting. Mining requests wait until it is ready.
    Initializing,
    /// The node is idle.
    Ready,
    /// A mining round is in progress.
    Mining,
    /// The node is syncing from a remote chain.
    Syncing,
    /// The node has been stopped.
    Stopped,
}

/// Header values applied to upcoming blocks, set through the `anvil_*` and
/// `evm_*` procedures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockOverrides {
    /// Timestamp of the first block of the next round. Cleared once used.
    pub next_timestamp: Option<u64>,
    /// Seconds between blocks of a round. Preferred over the `interval`
    /// mining parameter.
    pub timestamp_interval: Option<u64>,
    /// Gas limit of every following block.
    pub gas_limit: Option<u64>,
    /// Base fee of the first block of the next round. Cleared once used.
    pub next_base_fee: Option<u64>,
}

pub(crate) struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) vm: RwLock<Vm>,
    pub(crate) pool: Mutex<TxPool>,
    pub(crate) mining: RwLock<MiningConfig>,
    pub(crate) overrides: Mutex<BlockOverrides>,
    pub(crate) status: watch::Sender<NodeStatus>,
    pub(crate) events: broadcast::Sender<NodeEvent>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) interval: Mutex<Option<IntervalMiner>>,
}

/// An in-memory development node.
///
/// The node owns the live [`Vm`] and the transaction pool. Cloning a node is
/// cheap and yields a handle to the same node.
///
/// ```
/// # async fn _f() -> Result<(), tevm_miner::MineError> {
/// use tevm_miner::{MineParams, MineResponse, Node, NodeConfig};
///
/// let node = Node::new(NodeConfig::default());
/// let MineResponse::Mined(outcome) = node.mine(MineParams::default()).await? else {
///     unreachable!("mining throws on failure by default");
/// };
/// assert_eq!(outcome.block_hashes.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("chain_id", &self.inner.config.chain_id)
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Create a node that executes value transfers.
    pub fn new(config: NodeConfig) -> Self {
        Self::with_executor(config, TransferExecutor)
    }

    /// Create a node with a custom executor.
    ///
    /// If the mining mode is [`MiningConfig::Interval`], the interval miner
    /// is spawned on the current tokio runtime.
    pub fn with_executor(config: NodeConfig, executor: impl Executor + 'static) -> Self {
        let vm = Vm::genesis(&config);
        let pool = TxPool::new(config.pool);
        let (status, _) = watch::channel(NodeStatus::Ready);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mining = config.mining;

        let node = Self {
            inner: Arc::new(NodeInner {
                vm: RwLock::new(vm),
                pool: Mutex::new(pool),
                mining: RwLock::new(mining),
                overrides: Mutex::new(BlockOverrides::default()),
                status,
                events,
                executor: Arc::new(executor),
                interval: Mutex::new(None),
                config,
            }),
        };
        if let Some(block_time) = mining.block_time() {
            let miner = IntervalMiner::start(&node, block_time);
            // The node is not shared yet, so the lock is free.
            if let Ok(mut slot) = node.inner.interval.try_lock() {
                *slot = miner;
            }
        }
        node
    }

    /// The node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// The chain id.
    pub fn chain_id(&self) -> u64 {
        self.inner.config.chain_id
    }

    /// The live VM, for reading.
    pub async fn vm(&self) -> tokio::sync::RwLockReadGuard<'_, Vm> {
        self.inner.vm.read().await
    }

    /// The transaction pool. Holding the guard blocks mining.
    pub async fn pool(&self) -> tokio::sync::MutexGuard<'_, TxPool> {
        self.inner.pool.lock().await
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// The current status.
    pub fn status(&self) -> NodeStatus {
        *self.inner.status.borrow()
    }

    /// Set the status. Use [`NodeStatus::Initializing`] to hold back mining
    /// until the node is marked [`NodeStatus::Ready`].
    pub fn set_status(&self, status: NodeStatus) {
        debug!(?status, "node status changed");
        self.inner.status.send_replace(status);
    }

    /// Stop the node. Interval mining ends and later mining requests fail.
    pub async fn stop(&self) {
        self.set_status(NodeStatus::Stopped);
        self.inner.interval.lock().await.take();
    }

    /// The current mining mode.
    pub async fn mining_config(&self) -> MiningConfig {
        *self.inner.mining.read().await
    }

    /// Switch the mining mode. Rejected while a round is in progress.
    pub async fn set_mining_config(&self, mining: MiningConfig) -> Result<(), MineError> {
        if self.status() == NodeStatus::Mining {
            return Err(MineError::ConfigLocked);
        }
        *self.inner.mining.write().await = mining;

        let mut interval = self.inner.interval.lock().await;
        *interval = mining.block_time().and_then(|block_time| IntervalMiner::start(self, block_time));
        debug!(?mining, "mining config changed");
        Ok(())
    }

    /// The pending header overrides.
    pub async fn block_overrides(&self) -> BlockOverrides {
        *self.inner.overrides.lock().await
    }

    /// Set the timestamp of the next block. It must be later than the head.
    pub async fn set_next_block_timestamp(&self, timestamp: u64) -> Result<(), MineError> {
        let head = self.inner.vm.read().await.chain().head();
        if timestamp <= head.timestamp() {
            return Err(MineError::invalid_params(format!(
                "timestamp {timestamp} is lower than or equal to previous block's timestamp {}",
                head.timestamp()
            )));
        }
        self.inner.overrides.lock().await.next_timestamp = Some(timestamp);
        Ok(())
    }

    /// Set the seconds between blocks of a round, or clear it.
    pub async fn set_block_timestamp_interval(&self, interval: Option<u64>) {
        self.inner.overrides.lock().await.timestamp_interval = interval;
    }

    /// Set the gas limit of following blocks.
    pub async fn set_next_block_gas_limit(&self, gas_limit: u64) -> Result<(), MineError> {
        if gas_limit == 0 {
            return Err(MineError::invalid_params("gas limit must be positive"));
        }
        self.inner.overrides.lock().await.gas_limit = Some(gas_limit);
        Ok(())
    }

    /// Set the base fee of the next block.
    pub async fn set_next_block_base_fee_per_gas(&self, base_fee: u64) {
        self.inner.overrides.lock().await.next_base_fee = Some(base_fee);
    }

    /// Mark the node as mining, waiting while it initializes.
    pub(crate) async fn begin_mining(&self) -> Result<StatusGuard<'_>, MineError> {
        loop {
            let mut outcome = None;
            self.inner.status.send_if_modified(|status| match status {
                NodeStatus::Ready => {
                    *status = NodeStatus::Mining;
                    outcome = Some(Ok(()));
                    true
                }
                NodeStatus::Mining => {
                    outcome = Some(Err(MineError::AlreadyMining));
                    false
                }
                NodeStatus::Syncing => {
                    outcome = Some(Err(MineError::Syncing));
                    false
                }
                NodeStatus::Stopped => {
                    outcome = Some(Err(MineError::Stopped));
                    false
                }
                NodeStatus::Initializing => false,
            });

            match outcome {
                Some(Ok(())) => return Ok(StatusGuard { status: &self.inner.status }),
                Some(Err(err)) => return Err(err),
                None => {
                    debug!("waiting for node to initialize");
                    let mut rx = self.inner.status.subscribe();
                    rx.wait_for(|status| *status != NodeStatus::Initializing)
                        .await
                        .map_err(|_| MineError::Stopped)?;
                }
            }
        }
    }

    pub(crate) fn publish(&self, event: NodeEvent) {
        // Sending only fails when nobody is subscribed.
        let _ = self.inner.events.send(event);
    }
}

/// Resets the status to [`NodeStatus::Ready`] when a round ends, unless the
/// node was stopped meanwhile.
#[derive(Debug)]
pub(crate) struct StatusGuard<'a> {
    status: &'a watch::Sender<NodeStatus>,
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        self.status.send_if_modified(|status| {
            if *status == NodeStatus::Mining {
                *status = NodeStatus::Ready;
                true
            } else {
                false
            }
        });
    }
}
