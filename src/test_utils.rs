use crate::{
    config::DEFAULT_CHAIN_ID,
    exec::{charge_gas, intrinsic_gas, validate_tx, BlockEnv},
    Block, ExecError, Executor, MineObserver, Node, NodeConfig, PendingTx, ReceiptLog,
    StateManager, TransferExecutor, TxReceipt,
};
use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope},
    eips::eip2718::Encodable2718,
    primitives::{b256, Address, Bytes, Log, LogData, TxKind, B256, U256},
    signers::{local::PrivateKeySigner, SignerSync},
};
use revm::context::result::{ExecutionResult, HaltReason, OutOfGasError, Output, SuccessReason};
use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::{Arc, Mutex},
};

/// A funded account.
pub const ALICE: Address = Address::repeat_byte(0xa1);

/// An unfunded account.
pub const BOB: Address = Address::repeat_byte(0xb0);

/// Target that emits one log per call under [`Script::Log`].
pub const LOGGER: Address = Address::repeat_byte(0x10);

/// Target that runs out of gas under [`Script::OutOfGas`].
pub const BURNER: Address = Address::repeat_byte(0xbb);

/// Target that reverts under [`Script::Revert`].
pub const REVERTER: Address = Address::repeat_byte(0x5e);

/// Private key of the funded signing account.
pub const SIGNER_KEY: B256 =
    b256!("0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80");

/// Balance given to funded accounts.
pub const FUNDS: U256 = U256::from_limbs([0, 0, 1, 0]);

/// Fee cap of test transactions.
pub const TEST_MAX_FEE: u128 = 10_000_000_000;

/// Tip of test transactions.
pub const TEST_TIP: u128 = 1_000_000_000;

/// The signer for [`SIGNER_KEY`].
pub fn signer() -> PrivateKeySigner {
    PrivateKeySigner::from_bytes(&SIGNER_KEY).expect("valid key")
}

/// Fund [`ALICE`] and the [`signer`] account.
pub fn funded_config(config: NodeConfig) -> NodeConfig {
    config.with_funds(ALICE, FUNDS).with_funds(signer().address(), FUNDS)
}

/// A node executing value transfers, with funded accounts.
pub fn funded_node(config: NodeConfig) -> Node {
    Node::new(funded_config(config))
}

/// A node with a custom executor, with funded accounts.
pub fn funded_node_with(config: NodeConfig, executor: impl Executor + 'static) -> Node {
    Node::with_executor(funded_config(config), executor)
}

/// An impersonated 21000 gas transfer of 1 wei.
pub fn impersonated_transfer(sender: Address, nonce: u64, to: Address) -> PendingTx {
    PendingTx::impersonated(
        TxEip1559 {
            chain_id: DEFAULT_CHAIN_ID,
            nonce,
            gas_limit: 21_000,
            max_fee_per_gas: TEST_MAX_FEE,
            max_priority_fee_per_gas: TEST_TIP,
            to: TxKind::Call(to),
            value: U256::from(1),
            ..Default::default()
        },
        sender,
    )
}

/// A signed, EIP-2718 encoded 21000 gas transfer.
pub fn signed_transfer(signer: &PrivateKeySigner, nonce: u64, to: Address, value: U256) -> Vec<u8> {
    let tx = TxEip1559 {
        chain_id: DEFAULT_CHAIN_ID,
        nonce,
        gas_limit: 21_000,
        max_fee_per_gas: TEST_MAX_FEE,
        max_priority_fee_per_gas: TEST_TIP,
        to: TxKind::Call(to),
        value,
        ..Default::default()
    };
    let signature = signer.sign_hash_sync(&tx.signature_hash()).expect("signing succeeds");
    TxEnvelope::from(tx.into_signed(signature)).encoded_2718()
}

/// Behaviour of a scripted call target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Succeed and emit one log carrying the transaction hash as topic.
    Log,
    /// Halt, consuming the whole gas limit.
    OutOfGas,
    /// Revert after the intrinsic gas.
    Revert,
}

/// An [`Executor`] that runs [`Script`]s for selected targets and value
/// transfers for everything else.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<Address, Script>,
}

impl ScriptedExecutor {
    /// Run `script` for calls to `target`.
    pub fn with_script(mut self, target: Address, script: Script) -> Self {
        self.scripts.insert(target, script);
        self
    }
}

impl Executor for ScriptedExecutor {
    fn execute(
        &self,
        state: &mut dyn StateManager,
        env: &BlockEnv,
        tx: &PendingTx,
    ) -> Result<ExecutionResult, ExecError> {
        let Some((target, script)) =
            tx.to().and_then(|to| self.scripts.get(&to).map(|script| (to, *script)))
        else {
            return TransferExecutor.execute(state, env, tx);
        };

        let price = validate_tx(state, env, tx)?;
        let gas_used = match script {
            Script::OutOfGas => tx.gas_limit(),
            Script::Log | Script::Revert => intrinsic_gas(tx),
        };
        charge_gas(state, env, tx, price, gas_used)?;

        Ok(match script {
            Script::Log => ExecutionResult::Success {
                reason: SuccessReason::Stop,
                gas_used,
                gas_refunded: 0,
                logs: vec![Log {
                    address: target,
                    data: LogData::new_unchecked(vec![tx.hash()], tx.input().clone()),
                }],
                output: Output::Call(Bytes::new()),
            },
            Script::OutOfGas => {
                ExecutionResult::Halt { reason: HaltReason::OutOfGas(OutOfGasError::Basic), gas_used }
            }
            Script::Revert => {
                ExecutionResult::Revert { gas_used, output: Bytes::from_static(b"reverted") }
            }
        })
    }
}

/// A [`MineObserver`] recording the callbacks it receives, as `block N`,
/// `receipt I` and `log I/L` labels.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    seen: Arc<Mutex<Vec<String>>>,
    limit: Option<usize>,
}

impl RecordingObserver {
    /// Stop callback delivery once `limit` callbacks have been recorded.
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The labels recorded so far. Clones share the record.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().expect("not poisoned").clone()
    }

    fn record(&self, label: String) -> ControlFlow<()> {
        let mut seen = self.seen.lock().expect("not poisoned");
        seen.push(label);
        if self.limit.is_some_and(|limit| seen.len() >= limit) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

impl MineObserver for RecordingObserver {
    fn on_block(&mut self, block: &Block) -> ControlFlow<()> {
        self.record(format!("block {}", block.number()))
    }

    fn on_receipt(&mut self, receipt: &TxReceipt) -> ControlFlow<()> {
        self.record(format!("receipt {}", receipt.transaction_index))
    }

    fn on_log(&mut self, log: &ReceiptLog) -> ControlFlow<()> {
        self.record(format!("log {}/{}", log.transaction_index, log.log_index))
    }
}
