use crate::{node::NodeInner, MineError, MineParams, MineResponse, Node};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, trace, warn};

/// Mines a block every `block_time` in a background task.
///
/// Ticks are scheduled from a fixed start, so the period does not drift with
/// the duration of a round. A tick that finds a round in progress is
/// skipped. The task stops when the miner is dropped or the node goes away.
#[derive(Debug)]
pub struct IntervalMiner {
    block_time: Duration,
    task: JoinHandle<()>,
}

impl IntervalMiner {
    /// Spawn the miner on the current runtime. Returns `None` outside a
    /// runtime or for a zero block time.
    pub(crate) fn start(node: &Node, block_time: Duration) -> Option<Self> {
        if block_time.is_zero() {
            warn!("refusing to start interval mining with a zero block time");
            return None;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("no tokio runtime, interval mining not started");
            return None;
        };
        let weak = Arc::downgrade(&node.inner);
        let task = handle.spawn(run(weak, block_time));
        debug!(?block_time, "interval mining started");
        Some(Self { block_time, task })
    }

    /// The time between two blocks.
    pub const fn block_time(&self) -> Duration {
        self.block_time
    }
}

impl Drop for IntervalMiner {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(node: Weak<NodeInner>, block_time: Duration) {
    let mut ticker = interval_at(Instant::now() + block_time, block_time);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = node.upgrade() else {
            return;
        };
        let node = Node { inner };

        let params = MineParams::default().with_throw_on_fail(false);
        match node.mine(params).await {
            Ok(MineResponse::Mined(outcome)) => {
                trace!(blocks = outcome.block_hashes.len(), "interval block mined");
            }
            Ok(MineResponse::Failed { errors }) => {
                if errors.iter().all(|e| *e == MineError::AlreadyMining) {
                    trace!("round in progress, skipping interval tick");
                } else if errors.contains(&MineError::Stopped) {
                    return;
                } else {
                    error!(?errors, "interval mining failed");
                }
            }
            Err(err) => error!(%err, "interval mining failed"),
        }
    }
}
