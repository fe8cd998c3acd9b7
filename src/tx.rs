use alloy::{
    consensus::{
        transaction::SignerRecoverable, SignableTransaction, Transaction, TxEip1559, TxEnvelope,
    },
    eips::eip2718::Decodable2718,
    primitives::{keccak256, Address, Bytes, TxKind, B256, U256},
};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Errors produced while decoding a raw transaction.
#[derive(Debug, thiserror::Error)]
pub enum TxDecodeError {
    /// The bytes are not a valid EIP-2718 envelope.
    #[error("invalid transaction encoding: {0}")]
    Decode(#[from] alloy::eips::eip2718::Eip2718Error),
    /// The signature does not recover to a sender.
    #[error("invalid transaction signature: {0}")]
    Recovery(#[from] alloy::consensus::crypto::RecoveryError),
}

/// The transaction body held by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PooledTx {
    /// A transaction whose sender was recovered from its signature.
    Signed(TxEnvelope),
    /// An unsigned EIP-1559 transaction with a caller-declared sender. These
    /// are created by the node itself for `eth_sendTransaction` and
    /// `tevm_call`.
    Impersonated(TxEip1559),
}

/// A transaction plus the metadata the pool keeps about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub(crate) tx: PooledTx,
    sender: Address,
    hash: B256,
    added: SystemTime,
    skip_balance: bool,
}

impl PendingTx {
    /// Wrap a signed envelope, recovering its sender.
    pub fn signed(envelope: TxEnvelope) -> Result<Self, TxDecodeError> {
        let sender = envelope.recover_signer()?;
        let hash = *envelope.tx_hash();
        Ok(Self {
            tx: PooledTx::Signed(envelope),
            sender,
            hash,
            added: SystemTime::now(),
            skip_balance: false,
        })
    }

    /// Decode a raw EIP-2718 encoded, signed transaction.
    pub fn decode_raw(mut raw: &[u8]) -> Result<Self, TxDecodeError> {
        let envelope = TxEnvelope::decode_2718(&mut raw)?;
        Self::signed(envelope)
    }

    /// Wrap an unsigned transaction sent on behalf of `sender`.
    ///
    /// The hash commits to both the signing hash and the sender, so two
    /// senders impersonating the same body do not collide.
    pub fn impersonated(tx: TxEip1559, sender: Address) -> Self {
        let mut preimage = tx.signature_hash().to_vec();
        preimage.extend_from_slice(sender.as_slice());
        let hash = keccak256(preimage);
        Self {
            tx: PooledTx::Impersonated(tx),
            sender,
            hash,
            added: SystemTime::now(),
            skip_balance: false,
        }
    }

    /// The pooled transaction body.
    pub const fn pooled(&self) -> &PooledTx {
        &self.tx
    }

    /// True if the transaction carries no signature.
    pub const fn is_impersonated(&self) -> bool {
        matches!(self.tx, PooledTx::Impersonated(_))
    }

    /// The sender of the transaction.
    pub const fn sender(&self) -> Address {
        self.sender
    }

    /// The transaction hash.
    pub const fn hash(&self) -> B256 {
        self.hash
    }

    /// The time at which the transaction was created.
    pub const fn added(&self) -> SystemTime {
        self.added
    }

    /// Override the creation time. The pool breaks price ties in favour of
    /// older transactions.
    pub const fn with_added(mut self, added: SystemTime) -> Self {
        self.added = added;
        self
    }

    /// True if the sender's balance is not checked when the transaction is
    /// pooled or executed. A sender short of the upfront cost is topped up
    /// to it before execution.
    pub const fn skip_balance(&self) -> bool {
        self.skip_balance
    }

    /// Set whether the sender's balance is checked.
    pub const fn with_skip_balance(mut self, skip_balance: bool) -> Self {
        self.skip_balance = skip_balance;
        self
    }

    /// The transaction nonce.
    pub fn nonce(&self) -> u64 {
        with_inner_tx!(self, |tx| tx.nonce())
    }

    /// The transaction gas limit.
    pub fn gas_limit(&self) -> u64 {
        with_inner_tx!(self, |tx| tx.gas_limit())
    }

    /// The maximum total fee per gas. For legacy transactions this is the
    /// gas price.
    pub fn max_fee_per_gas(&self) -> u128 {
        with_inner_tx!(self, |tx| tx.max_fee_per_gas())
    }

    /// The tip per gas the sender is willing to pay. For legacy transactions
    /// this is the gas price.
    pub fn max_priority_fee_per_gas(&self) -> u128 {
        with_inner_tx!(self, |tx| tx.max_priority_fee_per_gas().unwrap_or_else(|| tx.max_fee_per_gas()))
    }

    /// True if the transaction prices gas with a fee cap and a tip.
    pub fn is_dynamic_fee(&self) -> bool {
        with_inner_tx!(self, |tx| tx.is_dynamic_fee())
    }

    /// The value transferred.
    pub fn value(&self) -> U256 {
        with_inner_tx!(self, |tx| tx.value())
    }

    /// The call target, or create.
    pub fn kind(&self) -> TxKind {
        with_inner_tx!(self, |tx| tx.kind())
    }

    /// The call target, if any.
    pub fn to(&self) -> Option<Address> {
        self.kind().to().copied()
    }

    /// The calldata.
    pub fn input(&self) -> &Bytes {
        with_inner_tx!(self, |tx| tx.input())
    }

    /// The price used to order transactions in the pool.
    ///
    /// With a non-zero base fee this is the miner tip: the priority fee for
    /// dynamic-fee transactions, or `gas_price - base_fee` for legacy ones.
    /// Without a base fee it is the fee cap.
    pub fn normalized_gas_price(&self, base_fee: Option<u64>) -> u128 {
        match base_fee {
            Some(base_fee) if base_fee != 0 => {
                if self.is_dynamic_fee() {
                    self.max_priority_fee_per_gas()
                } else {
                    self.max_fee_per_gas().saturating_sub(base_fee as u128)
                }
            }
            _ => self.max_fee_per_gas(),
        }
    }

    /// The price per gas actually paid in a block with the given base fee.
    pub fn effective_gas_price(&self, base_fee: Option<u64>) -> u128 {
        with_inner_tx!(self, |tx| tx.effective_gas_price(base_fee))
    }

    /// The upfront cost the sender must be able to cover:
    /// `value + max_fee * gas_limit`.
    pub fn max_cost(&self) -> U256 {
        self.value()
            .saturating_add(U256::from(self.max_fee_per_gas()) * U256::from(self.gas_limit()))
    }
}

/// A partially specified transaction, filled in by the node before it is
/// executed or pooled. Used by `eth_sendTransaction`, `eth_call`,
/// `eth_estimateGas` and `tevm_call`.
///
/// The serde shape is the JSON-RPC transaction object: camelCase keys, hex
/// quantities, `gasPrice` accepted for `maxFeePerGas` and `data` for
/// `input`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TxRequest {
    /// The sender. Defaults to the zero address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    /// The call target. `None` creates a contract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    /// Gas limit. Sent transactions default to the estimated gas, calls to
    /// the block gas limit.
    #[serde(with = "alloy::serde::quantity::opt", skip_serializing_if = "Option::is_none")]
    pub gas: Option<u64>,
    /// Fee cap. Defaults to twice the pending base fee.
    #[serde(
        alias = "gasPrice",
        with = "alloy::serde::quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_fee_per_gas: Option<u128>,
    /// Tip. Defaults to zero.
    #[serde(with = "alloy::serde::quantity::opt", skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<u128>,
    /// Value transferred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    /// Calldata.
    #[serde(alias = "data")]
    pub input: Bytes,
    /// Nonce. Defaults to the sender's account nonce.
    #[serde(with = "alloy::serde::quantity::opt", skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    /// Skip the sender balance check, in the pool and at execution.
    pub skip_balance: bool,
}

impl TxRequest {
    /// Fill the request into an impersonated transaction.
    pub(crate) fn into_impersonated(
        self,
        chain_id: u64,
        account_nonce: u64,
        block_gas_limit: u64,
        base_fee: u64,
    ) -> PendingTx {
        let max_fee_per_gas =
            self.max_fee_per_gas.unwrap_or_else(|| (base_fee as u128).saturating_mul(2));
        let max_priority_fee_per_gas =
            self.max_priority_fee_per_gas.unwrap_or_default().min(max_fee_per_gas);
        let tx = TxEip1559 {
            chain_id,
            nonce: self.nonce.unwrap_or(account_nonce),
            gas_limit: self.gas.unwrap_or(block_gas_limit),
            max_fee_per_gas,
            max_priority_fee_per_gas,
            to: self.to.map(TxKind::Call).unwrap_or(TxKind::Create),
            value: self.value.unwrap_or_default(),
            access_list: Default::default(),
            input: self.input,
        };
        PendingTx::impersonated(tx, self.from.unwrap_or_default())
            .with_skip_balance(self.skip_balance)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloy::consensus::TxLegacy;

    fn dynamic(max_fee: u128, tip: u128) -> PendingTx {
        PendingTx::impersonated(
            TxEip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: tip,
                gas_limit: 21_000,
                ..Default::default()
            },
            Address::repeat_byte(1),
        )
    }

    #[test]
    fn normalized_price_uses_tip_when_base_fee_set() {
        let tx = dynamic(100, 7);
        assert_eq!(tx.normalized_gas_price(Some(10)), 7);
        assert_eq!(tx.normalized_gas_price(Some(0)), 100);
        assert_eq!(tx.normalized_gas_price(None), 100);
    }

    #[test]
    fn legacy_price_pays_base_fee_first() {
        let legacy = TxLegacy { gas_price: 50, gas_limit: 21_000, ..Default::default() };
        let signed = legacy.into_signed(alloy::primitives::Signature::test_signature());
        let tx = PendingTx {
            tx: PooledTx::Signed(TxEnvelope::Legacy(signed)),
            sender: Address::repeat_byte(2),
            hash: B256::repeat_byte(2),
            added: SystemTime::now(),
            skip_balance: false,
        };
        assert_eq!(tx.normalized_gas_price(Some(20)), 30);
        assert_eq!(tx.effective_gas_price(Some(20)), 50);
    }

    #[test]
    fn impersonated_hash_commits_to_sender() {
        let body = TxEip1559::default();
        let a = PendingTx::impersonated(body.clone(), Address::repeat_byte(1));
        let b = PendingTx::impersonated(body, Address::repeat_byte(2));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn request_defaults() {
        let pending = TxRequest { from: Some(Address::repeat_byte(3)), ..Default::default() }
            .into_impersonated(900, 4, 30_000_000, 10);
        assert_eq!(pending.nonce(), 4);
        assert_eq!(pending.gas_limit(), 30_000_000);
        assert_eq!(pending.max_fee_per_gas(), 20);
        assert_eq!(pending.kind(), TxKind::Create);
    }

    #[test]
    fn request_from_json() {
        let request: TxRequest = serde_json::from_value(serde_json::json!({
            "from": "0x0303030303030303030303030303030303030303",
            "to": null,
            "gas": "0x5208",
            "gasPrice": 7,
            "value": "0x10",
            "data": "0x6001",
            "skipBalance": true,
            "createTransaction": true,
        }))
        .unwrap();
        assert_eq!(request.from, Some(Address::repeat_byte(3)));
        assert_eq!(request.to, None);
        assert_eq!(request.gas, Some(21_000));
        assert_eq!(request.max_fee_per_gas, Some(7));
        assert_eq!(request.value, Some(U256::from(16)));
        assert_eq!(request.input, Bytes::from_static(&[0x60, 0x01]));
        assert!(request.skip_balance);

        let pending = request.into_impersonated(900, 0, 30_000_000, 1);
        assert!(pending.skip_balance());
        assert_eq!(pending.gas_limit(), 21_000);

        assert!(serde_json::from_value::<TxRequest>(serde_json::json!("0x1")).is_err());
    }
}
