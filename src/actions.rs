use crate::{
    automine::AutomineResult,
    est::{EstimationResult, SearchRange},
    exec::{intrinsic_gas, BlockEnv, MIN_TRANSACTION_GAS},
    miner::unix_now,
    pool::AddOptions,
    ActionError, MemoryState, MineOutcome, Node, NodeEvent, PendingTx, StateManager,
    TxReceipt, TxRequest, Vm,
};
use alloy::{consensus::constants::KECCAK_EMPTY, primitives::B256};
use revm::context::result::ExecutionResult;
use tracing::{debug, debug_span, trace, warn};

/// The result of a transaction write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// Hash of the pooled transaction.
    pub hash: B256,
    /// The blocks mined by automining, if the mining mode called for it.
    pub mined: Option<MineOutcome>,
}

/// The result of [`Node::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    /// The simulated execution.
    pub result: ExecutionResult,
    /// The transaction created from the call, if requested and the
    /// simulation succeeded.
    pub transaction: Option<SendOutcome>,
}

impl Node {
    /// The environment of the next block, honouring pending overrides.
    async fn pending_env(&self, vm: &Vm) -> BlockEnv {
        let head = vm.chain().head();
        let overrides = self.block_overrides().await;
        BlockEnv {
            chain_id: self.chain_id(),
            number: head.number() + 1,
            timestamp: overrides.next_timestamp.unwrap_or_else(|| unix_now().max(head.timestamp())),
            gas_limit: overrides.gas_limit.unwrap_or(head.header().gas_limit),
            base_fee: overrides.next_base_fee.unwrap_or_else(|| head.next_base_fee()),
            coinbase: self.config().coinbase,
        }
    }

    /// A private copy of the live state and the environment to simulate
    /// `request` in. Requests without a fee cap are simulated without a base
    /// fee, so callers need not hold funds for gas.
    async fn simulation(&self, request: &TxRequest) -> (MemoryState, BlockEnv) {
        let vm = self.vm().await;
        let mut env = self.pending_env(&vm).await;
        if request.max_fee_per_gas.is_none() {
            env.base_fee = 0;
        }
        (vm.state().fork(), env)
    }

    async fn add_to_pool(&self, tx: PendingTx, opts: AddOptions) -> Result<B256, ActionError> {
        let hash = {
            let mut pool = self.pool().await;
            let vm = self.vm().await;
            let head = vm.chain().head();
            pool.add(tx, head.header(), vm.state(), opts)?
        };
        debug!(%hash, "transaction added to pool");
        self.publish(NodeEvent::NewPendingTransaction(hash));
        Ok(hash)
    }

    fn finish_write(hash: B256, automined: AutomineResult) -> Result<SendOutcome, ActionError> {
        match automined {
            Ok(mined) => Ok(SendOutcome { hash, mined }),
            Err(errors) => {
                warn!(%hash, ?errors, "automining failed after pool insertion");
                Err(ActionError::Automine { hash, errors })
            }
        }
    }

    /// Add a raw signed transaction to the pool and run the automining
    /// trigger.
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<SendOutcome, ActionError> {
        let tx = PendingTx::decode_raw(raw)?;
        let hash = self.add_to_pool(tx, AddOptions::default()).await?;
        Self::finish_write(hash, self.after_pool_insert(hash).await)
    }

    /// Add an impersonated transaction to the pool on behalf of
    /// `request.from` and run the automining trigger.
    ///
    /// The nonce defaults to the next one after the sender's account nonce
    /// and pooled transactions. A missing gas limit defaults to the
    /// estimate, so the transaction does not reserve the whole block.
    pub async fn send_transaction(&self, request: TxRequest) -> Result<SendOutcome, ActionError> {
        let request = self.fill_gas(request).await;
        let skip_balance = request.skip_balance;
        let tx = {
            let pool = self.pool().await;
            let vm = self.vm().await;
            let env = self.pending_env(&vm).await;
            let from = request.from.unwrap_or_default();
            let account = vm.state().nonce(from)?;
            let nonce = pool.by_sender(from).last().map_or(account, |tx| account.max(tx.nonce() + 1));
            request.into_impersonated(env.chain_id, nonce, env.gas_limit, env.base_fee)
        };
        let hash = self.add_to_pool(tx, AddOptions::impersonated(skip_balance)).await?;
        Self::finish_write(hash, self.after_pool_insert(hash).await)
    }

    /// Set a missing gas limit from a gas estimate. Failing executions get
    /// the gas they used, which reproduces the failure.
    async fn fill_gas(&self, mut request: TxRequest) -> TxRequest {
        if request.gas.is_some() {
            return request;
        }
        match self.estimate_gas(request.clone()).await {
            Ok(estimate) => {
                let gas = estimate.gas_estimation().unwrap_or_else(|| estimate.gas_used());
                trace!(gas, "gas limit set from estimate");
                request.gas = Some(gas);
            }
            // Pool validation reports the problem.
            Err(err) => debug!(%err, "could not estimate gas for sent transaction"),
        }
        request
    }

    /// Simulate `request` against the live state without changing it.
    ///
    /// With `create_transaction` set and a successful simulation, the
    /// request is then sent as with [`Node::send_transaction`].
    pub async fn call(
        &self,
        request: TxRequest,
        create_transaction: bool,
    ) -> Result<CallOutcome, ActionError> {
        let (mut state, env) = self.simulation(&request).await;
        let nonce = state.nonce(request.from.unwrap_or_default())?;
        let tx = request.clone().into_impersonated(env.chain_id, nonce, env.gas_limit, env.base_fee);
        let result = self.inner.executor.execute(&mut state, &env, &tx)?;
        debug!(success = result.is_success(), gas_used = result.gas_used(), "simulated call");

        let transaction = if create_transaction && result.is_success() {
            Some(self.send_transaction(request).await?)
        } else {
            None
        };
        Ok(CallOutcome { result, transaction })
    }

    /// Estimate the gas limit `request` needs to succeed.
    ///
    /// The estimate is found by binary search over simulated executions. It
    /// never touches the pool and never mines. A request that fails at every
    /// gas limit yields the failed [`EstimationResult`].
    pub async fn estimate_gas(&self, request: TxRequest) -> Result<EstimationResult, ActionError> {
        let (state, env) = self.simulation(&request).await;
        let from = request.from.unwrap_or_default();
        let nonce = state.nonce(from)?;

        // Plain transfers to accounts without code cost exactly the
        // intrinsic gas.
        if request.input.is_empty() {
            if let Some(to) = request.to {
                let code_hash = state.account(to)?.map_or(KECCAK_EMPTY, |acct| acct.code_hash);
                if code_hash == KECCAK_EMPTY {
                    trace!(%to, "using intrinsic gas for simple transfer");
                    return Ok(EstimationResult::basic_transfer_success());
                }
            }
        }

        let fill = |gas_limit: u64| {
            TxRequest { gas: Some(gas_limit), ..request.clone() }.into_impersonated(
                env.chain_id,
                nonce,
                env.gas_limit,
                env.base_fee,
            )
        };
        let run = |gas_limit: u64| -> Result<EstimationResult, ActionError> {
            let mut scratch = state.deep_copy();
            let result = self.inner.executor.execute(&mut scratch, &env, &fill(gas_limit))?;
            Ok(EstimationResult::from(&result))
        };

        let mut range = SearchRange::new(MIN_TRANSACTION_GAS, env.gas_limit);
        if let Some(gas) = request.gas {
            range.maybe_lower_max(gas);
        }
        range.maybe_raise_min(intrinsic_gas(&fill(range.max())).saturating_sub(1));

        let span = debug_span!("estimate_gas", start_min = range.min(), start_max = range.max());
        let _e = span.enter();

        let estimate = run(range.max())?;
        if estimate.is_failure() {
            debug!(%estimate, "optimistic estimate failed");
            return Ok(estimate);
        }
        let gas_used = estimate.gas_used();
        let mut best = estimate;
        range.maybe_raise_min(gas_used.saturating_sub(1));

        // Each call frame forwards at most 63/64 of its gas, so the used gas
        // plus that margin is a likely fit.
        let mut needle = gas_used.saturating_mul(64) / 63;
        if !range.contains(needle) {
            needle = range.midpoint();
        }

        while range.size() > 1 && range.ratio() > 0.015 {
            trace!(best = best.gas_used(), %range, needle, "running gas estimation");
            let estimate = run(needle)?;
            if estimate.is_success() {
                best = estimate.clone();
            }
            if let Err(e) = estimate.adjust_binary_search_range(needle, &mut range) {
                trace!(%e, "error adjusting binary search range");
                return Ok(e);
            }
            needle = range.midpoint();
        }

        Ok(best.with_estimation(range.max()))
    }

    /// The number of the head block.
    pub async fn block_number(&self) -> u64 {
        self.vm().await.chain().head_number()
    }

    /// The receipt of a mined transaction.
    pub async fn transaction_receipt(&self, hash: B256) -> Option<TxReceipt> {
        self.vm().await.receipts().receipt_by_tx_hash(hash).cloned()
    }
}
