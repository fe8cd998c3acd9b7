use crate::{MineError, MineOutcome, MineParams, MineResponse, MiningConfig, Node};
use alloy::primitives::B256;
use tracing::{debug, trace};

/// The result of an automining decision.
///
/// `Ok(None)` if the mode did not call for mining, `Ok(Some(_))` with the
/// mined blocks otherwise. Mining failures are returned as a value so the
/// triggering write can report them instead of its own success.
pub type AutomineResult = Result<Option<MineOutcome>, Vec<MineError>>;

impl Node {
    /// Decide whether to mine after a transaction entered the pool, and mine
    /// a single block if so.
    ///
    /// - [`MiningConfig::Auto`] always mines.
    /// - [`MiningConfig::Manual`] and [`MiningConfig::Interval`] never mine
    ///   here.
    /// - [`MiningConfig::Gas`] mines only when `is_gas_mining` is set, i.e.
    ///   when called from [`Node::handle_gas_mining`].
    ///
    /// With `skip_if_not_auto` set, any mode but [`MiningConfig::Auto`]
    /// returns without mining.
    pub async fn handle_automining(
        &self,
        tx_hash: Option<B256>,
        skip_if_not_auto: bool,
        is_gas_mining: bool,
    ) -> AutomineResult {
        let mining = self.mining_config().await;
        if skip_if_not_auto && !mining.is_auto() {
            trace!(?mining, "not automining, skipping");
            return Ok(None);
        }

        let should_mine = match mining {
            MiningConfig::Auto => true,
            MiningConfig::Manual | MiningConfig::Interval { .. } => false,
            MiningConfig::Gas { .. } => is_gas_mining,
        };
        if !should_mine {
            return Ok(None);
        }

        debug!(tx = ?tx_hash, ?mining, "automining");
        match self.mine(MineParams::default().with_throw_on_fail(false)).await {
            Ok(MineResponse::Mined(outcome)) => Ok(Some(outcome)),
            Ok(MineResponse::Failed { errors }) => Err(errors),
            Err(err) => Err(vec![err]),
        }
    }

    /// Mine if the node is in [`MiningConfig::Gas`] mode and the pooled
    /// transactions reserve at least the configured gas.
    pub async fn handle_gas_mining(&self, tx_hash: Option<B256>) -> AutomineResult {
        let MiningConfig::Gas { limit } = self.mining_config().await else {
            return Ok(None);
        };
        let pending = self.pool().await.pending_gas();
        if pending < limit {
            trace!(pending, limit, "below gas mining threshold");
            return Ok(None);
        }
        self.handle_automining(tx_hash, false, true).await
    }

    /// Run the trigger matching the current mode after a pool insertion.
    pub(crate) async fn after_pool_insert(&self, tx_hash: B256) -> AutomineResult {
        if matches!(self.mining_config().await, MiningConfig::Gas { .. }) {
            self.handle_gas_mining(Some(tx_hash)).await
        } else {
            self.handle_automining(Some(tx_hash), false, false).await
        }
    }
}
