use crate::{state::StateError, PendingTx, StateManager};
use alloy::primitives::{Address, Bytes, TxKind, U256};
use revm::context::result::{ExecutionResult, Output, SuccessReason};
use std::{fmt, sync::Arc};
use tracing::trace;

/// The gas cost of a plain value transfer.
pub const MIN_TRANSACTION_GAS: u64 = 21_000;

/// Additional intrinsic gas of a contract creation.
pub const CREATE_GAS: u64 = 32_000;

const ZERO_BYTE_GAS: u64 = 4;
const NON_ZERO_BYTE_GAS: u64 = 16;

/// Errors produced by an [`Executor`].
///
/// Every variant except [`ExecError::State`] marks the transaction itself as
/// invalid. Invalid transactions are dropped from the block and the pool and
/// get no receipt.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The gas limit does not cover the intrinsic cost.
    #[error("intrinsic gas too low: have {gas_limit}, want {intrinsic}")]
    IntrinsicGasTooLow {
        /// The intrinsic cost.
        intrinsic: u64,
        /// The transaction gas limit.
        gas_limit: u64,
    },

    /// The fee cap is below the block base fee.
    #[error("max fee per gas {max_fee} less than block base fee {base_fee}")]
    FeeCapTooLow {
        /// The transaction fee cap.
        max_fee: u128,
        /// The block base fee.
        base_fee: u64,
    },

    /// The sender cannot pay for gas and value.
    #[error("insufficient funds for gas * price + value: have {balance} want {cost}")]
    InsufficientFunds {
        /// The upfront cost.
        cost: U256,
        /// The sender balance.
        balance: U256,
    },

    /// The state manager failed.
    #[error(transparent)]
    State(#[from] StateError),
}

impl ExecError {
    /// True if the error is attributable to the transaction rather than to
    /// the node.
    pub const fn is_invalid_tx(&self) -> bool {
        !matches!(self, Self::State(_))
    }
}

/// The block a transaction is executed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEnv {
    /// Chain id.
    pub chain_id: u64,
    /// Block number.
    pub number: u64,
    /// Block timestamp.
    pub timestamp: u64,
    /// Block gas limit.
    pub gas_limit: u64,
    /// Block base fee.
    pub base_fee: u64,
    /// Fee recipient.
    pub coinbase: Address,
}

/// Runs transactions against a state.
///
/// Exceptional execution (revert, out of gas and other halts) is reported
/// in the returned [`ExecutionResult`] and must still charge the sender.
/// Only transactions that cannot be included at all are reported as `Err`.
pub trait Executor: fmt::Debug + Send + Sync {
    /// Execute `tx` in `env`, applying its effects to `state`.
    fn execute(
        &self,
        state: &mut dyn StateManager,
        env: &BlockEnv,
        tx: &PendingTx,
    ) -> Result<ExecutionResult, ExecError>;
}

impl<T: Executor + ?Sized> Executor for Arc<T> {
    fn execute(
        &self,
        state: &mut dyn StateManager,
        env: &BlockEnv,
        tx: &PendingTx,
    ) -> Result<ExecutionResult, ExecError> {
        (**self).execute(state, env, tx)
    }
}

/// Compute the intrinsic gas of a transaction.
pub fn intrinsic_gas(tx: &PendingTx) -> u64 {
    let data = tx.input().iter().fold(0u64, |acc, byte| {
        acc + if *byte == 0 { ZERO_BYTE_GAS } else { NON_ZERO_BYTE_GAS }
    });
    let create = if tx.kind().is_create() { CREATE_GAS } else { 0 };
    MIN_TRANSACTION_GAS + data + create
}

/// Check that `tx` can be included in `env`, returning the price per gas it
/// pays.
///
/// A transaction pooled with [`PendingTx::skip_balance`] has its sender
/// topped up to the upfront cost instead of being rejected.
pub fn validate_tx(
    state: &mut dyn StateManager,
    env: &BlockEnv,
    tx: &PendingTx,
) -> Result<u128, ExecError> {
    let intrinsic = intrinsic_gas(tx);
    if tx.gas_limit() < intrinsic {
        return Err(ExecError::IntrinsicGasTooLow { intrinsic, gas_limit: tx.gas_limit() });
    }
    if tx.max_fee_per_gas() < env.base_fee as u128 {
        return Err(ExecError::FeeCapTooLow {
            max_fee: tx.max_fee_per_gas(),
            base_fee: env.base_fee,
        });
    }
    let price = tx.effective_gas_price(Some(env.base_fee));
    let cost = U256::from(price)
        .saturating_mul(U256::from(tx.gas_limit()))
        .saturating_add(tx.value());
    let balance = state.balance(tx.sender())?;
    if balance < cost {
        if !tx.skip_balance() {
            return Err(ExecError::InsufficientFunds { cost, balance });
        }
        trace!(sender = %tx.sender(), %balance, %cost, "topping up sender");
        state.modify_account(tx.sender(), &mut |acct| acct.balance = cost)?;
    }
    Ok(price)
}

/// Charge the sender for `gas_used` at `price`, pay the tip to the
/// coinbase and bump the sender nonce. The base fee portion is burned.
pub fn charge_gas(
    state: &mut dyn StateManager,
    env: &BlockEnv,
    tx: &PendingTx,
    price: u128,
    gas_used: u64,
) -> Result<(), ExecError> {
    let fee = U256::from(price) * U256::from(gas_used);
    state.modify_account(tx.sender(), &mut |acct| {
        acct.balance = acct.balance.saturating_sub(fee);
        acct.nonce = acct.nonce.saturating_add(1);
    })?;

    let tip = U256::from(price.saturating_sub(env.base_fee as u128)) * U256::from(gas_used);
    if !tip.is_zero() {
        state.modify_account(env.coinbase, &mut |acct| {
            acct.balance = acct.balance.saturating_add(tip)
        })?;
    }
    Ok(())
}

/// An [`Executor`] for value transfers and code-less contract creations.
///
/// Every valid transaction succeeds and uses exactly its intrinsic gas.
/// Creations deploy an empty account at the address derived from the sender
/// and nonce.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferExecutor;

impl Executor for TransferExecutor {
    fn execute(
        &self,
        state: &mut dyn StateManager,
        env: &BlockEnv,
        tx: &PendingTx,
    ) -> Result<ExecutionResult, ExecError> {
        let price = validate_tx(state, env, tx)?;
        let gas_used = intrinsic_gas(tx);
        let value = tx.value();
        let nonce = state.nonce(tx.sender())?;

        charge_gas(state, env, tx, price, gas_used)?;
        state.modify_account(tx.sender(), &mut |acct| {
            acct.balance = acct.balance.saturating_sub(value)
        })?;

        let (target, output) = match tx.kind() {
            TxKind::Call(to) => (to, Output::Call(Bytes::new())),
            TxKind::Create => {
                let created = tx.sender().create(nonce);
                (created, Output::Create(Bytes::new(), Some(created)))
            }
        };
        state.modify_account(target, &mut |acct| {
            acct.balance = acct.balance.saturating_add(value)
        })?;

        Ok(ExecutionResult::Success {
            reason: SuccessReason::Stop,
            gas_used,
            gas_refunded: 0,
            logs: vec![],
            output,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryState;
    use alloy::{
        consensus::TxEip1559,
        primitives::{bytes, Address},
    };

    const ALICE: Address = Address::repeat_byte(0xa1);
    const BOB: Address = Address::repeat_byte(0xb0);
    const COINBASE: Address = Address::repeat_byte(0xcb);

    fn env() -> BlockEnv {
        BlockEnv {
            chain_id: 900,
            number: 1,
            timestamp: 1,
            gas_limit: 30_000_000,
            base_fee: 10,
            coinbase: COINBASE,
        }
    }

    fn transfer(to: TxKind, value: u64) -> PendingTx {
        PendingTx::impersonated(
            TxEip1559 {
                gas_limit: 100_000,
                max_fee_per_gas: 20,
                max_priority_fee_per_gas: 2,
                to,
                value: U256::from(value),
                ..Default::default()
            },
            ALICE,
        )
    }

    #[test]
    fn intrinsic() {
        let mut tx = transfer(TxKind::Create, 0);
        assert_eq!(intrinsic_gas(&tx), MIN_TRANSACTION_GAS + CREATE_GAS);

        if let crate::tx::PooledTx::Impersonated(inner) = &mut tx.tx {
            inner.input = bytes!("0001");
        }
        assert_eq!(intrinsic_gas(&tx), MIN_TRANSACTION_GAS + CREATE_GAS + 4 + 16);
    }

    #[test]
    fn transfer_moves_value_and_pays_tip() {
        let mut state = MemoryState::genesis([(ALICE, U256::from(10_000_000))]);
        let result = TransferExecutor.execute(&mut state, &env(), &transfer(TxKind::Call(BOB), 5)).unwrap();

        assert!(result.is_success());
        assert_eq!(result.gas_used(), MIN_TRANSACTION_GAS);
        assert_eq!(state.balance(BOB).unwrap(), U256::from(5));
        assert_eq!(state.balance(COINBASE).unwrap(), U256::from(2 * MIN_TRANSACTION_GAS));
        assert_eq!(
            state.balance(ALICE).unwrap(),
            U256::from(10_000_000 - 5 - 12 * MIN_TRANSACTION_GAS)
        );
        assert_eq!(state.nonce(ALICE).unwrap(), 1);
    }

    #[test]
    fn create_reports_address() {
        let mut state = MemoryState::genesis([(ALICE, U256::from(10_000_000))]);
        let result = TransferExecutor.execute(&mut state, &env(), &transfer(TxKind::Create, 0)).unwrap();
        let ExecutionResult::Success { output: Output::Create(_, created), .. } = &result else {
            panic!("expected a successful creation, got {result:?}");
        };
        assert_eq!(*created, Some(ALICE.create(0)));
    }

    #[test]
    fn skip_balance_tops_up_sender() {
        let mut state = MemoryState::default();
        let tx = PendingTx::impersonated(
            TxEip1559 {
                gas_limit: 21_000,
                max_fee_per_gas: 20,
                max_priority_fee_per_gas: 2,
                to: TxKind::Call(BOB),
                value: U256::from(1_000),
                ..Default::default()
            },
            ALICE,
        );
        let err = TransferExecutor.execute(&mut state, &env(), &tx).unwrap_err();
        assert!(matches!(err, ExecError::InsufficientFunds { .. }));

        let result =
            TransferExecutor.execute(&mut state, &env(), &tx.with_skip_balance(true)).unwrap();
        assert!(result.is_success());
        assert_eq!(state.balance(BOB).unwrap(), U256::from(1_000));
        // Topped up to the upfront cost at 12 per gas, then charged for it.
        assert_eq!(state.balance(ALICE).unwrap(), U256::ZERO);
    }

    #[test]
    fn invalid_transactions() {
        let mut state = MemoryState::genesis([(ALICE, U256::from(1))]);
        let err = TransferExecutor
            .execute(&mut state, &env(), &transfer(TxKind::Call(BOB), 0))
            .unwrap_err();
        assert!(matches!(err, ExecError::InsufficientFunds { .. }));
        assert!(err.is_invalid_tx());

        let mut low_fee = env();
        low_fee.base_fee = 100;
        let err = TransferExecutor
            .execute(&mut state, &low_fee, &transfer(TxKind::Call(BOB), 0))
            .unwrap_err();
        assert_eq!(err, ExecError::FeeCapTooLow { max_fee: 20, base_fee: 100 });
    }
}
