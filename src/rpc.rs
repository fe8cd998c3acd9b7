//! JSON-RPC procedures over a [`Node`].
//!
//! Quantities are `0x`-prefixed hex strings, as in the Ethereum JSON-RPC
//! API. Decimal JSON numbers are accepted as input.

use crate::{
    error::{EXECUTION_REVERTED, INTERNAL_ERROR, INVALID_PARAMS, SERVER_ERROR},
    est::EstimationResult,
    ActionError, MineError, MineOutcome, MineParams, MineResponse, MinedBlock, MiningConfig, Node,
    TxReceipt, TxRequest,
};
use alloy::primitives::{Bytes, B256};
use revm::context::result::{ExecutionResult, Output};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{fmt, str::FromStr, time::Duration};
use tracing::{debug, debug_span, Instrument};

/// JSON-RPC code for a body that is not valid JSON.
pub const PARSE_ERROR: i64 = -32700;

/// JSON-RPC code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version, `"2.0"`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Request id, echoed in the response.
    #[serde(default)]
    pub id: Value,
    /// Method name.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// Create a request with id `1`.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { jsonrpc: "2.0".to_owned(), id: json!(1), method: method.into(), params }
    }
}

/// A JSON-RPC 2.0 response. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version, `"2.0"`.
    pub jsonrpc: String,
    /// The request id.
    pub id: Value,
    /// The result, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn new(id: Value, outcome: Result<Value, RpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Self { jsonrpc: "2.0".to_owned(), id, result, error }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{message} ({code})")]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    /// An invalid-params error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// An internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    fn reverted(reason: &Bytes) -> Self {
        Self {
            code: EXECUTION_REVERTED,
            message: "execution reverted".to_owned(),
            data: Some(json!(reason.to_string())),
        }
    }

    /// The error of a failed mining round. The first error provides the code
    /// and message, all of them are listed under `data.errors`.
    pub fn from_mine_errors(errors: &[MineError]) -> Self {
        let first = errors.first();
        Self {
            code: first.map_or(SERVER_ERROR, MineError::code),
            message: first.map_or_else(|| "mining failed".to_owned(), ToString::to_string),
            data: Some(json!({ "errors": errors.iter().map(ToString::to_string).collect::<Vec<_>>() })),
        }
    }
}

impl From<MineError> for RpcError {
    fn from(err: MineError) -> Self {
        Self::from_mine_errors(&[err])
    }
}

impl From<ActionError> for RpcError {
    fn from(err: ActionError) -> Self {
        match &err {
            ActionError::Automine { hash, errors } => {
                // The transaction stays pooled, so callers still need its
                // hash.
                let mut rpc = Self::from_mine_errors(errors);
                if let Some(Value::Object(data)) = &mut rpc.data {
                    data.insert("txHash".to_owned(), json!(hash));
                }
                rpc
            }
            ActionError::Estimation(EstimationResult::Revert { reason, .. }) => {
                let mut rpc = Self::reverted(reason);
                rpc.message = err.to_string();
                rpc
            }
            _ => Self::new(err.code(), err.to_string()),
        }
    }
}

fn hex(n: impl fmt::LowerHex) -> String {
    format!("{n:#x}")
}

fn params(value: &Value) -> Result<&[Value], RpcError> {
    match value {
        Value::Null => Ok(&[]),
        Value::Array(items) => Ok(items),
        _ => Err(RpcError::invalid_params("params must be an array")),
    }
}

fn quantity_u128(value: &Value, name: &str) -> Result<u128, RpcError> {
    let invalid = || RpcError::invalid_params(format!("invalid {name}: {value}"));
    match value {
        Value::Number(n) => n.as_u64().map(u128::from).ok_or_else(invalid),
        Value::String(s) => {
            let digits = s.strip_prefix("0x").ok_or_else(invalid)?;
            u128::from_str_radix(digits, 16).map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

fn quantity(value: &Value, name: &str) -> Result<u64, RpcError> {
    let n = quantity_u128(value, name)?;
    u64::try_from(n).map_err(|_| RpcError::invalid_params(format!("{name} out of range: {n}")))
}

fn parse<T>(value: &Value, name: &str) -> Result<T, RpcError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::invalid_params(format!("{name} must be a hex string")))?;
    s.parse().map_err(|e| RpcError::invalid_params(format!("invalid {name}: {e}")))
}

fn param<'a>(params: &'a [Value], idx: usize) -> Option<&'a Value> {
    params.get(idx).filter(|v| !v.is_null())
}

fn required<'a>(params: &'a [Value], idx: usize, name: &str) -> Result<&'a Value, RpcError> {
    param(params, idx).ok_or_else(|| RpcError::invalid_params(format!("missing {name}")))
}

fn tx_request(value: &Value) -> Result<TxRequest, RpcError> {
    serde_json::from_value(value.clone())
        .map_err(|e| RpcError::invalid_params(format!("invalid transaction: {e}")))
}

fn to_json(value: impl Serialize) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}

/// A mined block as reported by `anvil_mineDetailed`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DetailedBlock<'a> {
    #[serde(with = "alloy::serde::quantity")]
    number: u64,
    hash: B256,
    parent_hash: B256,
    #[serde(with = "alloy::serde::quantity")]
    timestamp: u64,
    #[serde(with = "alloy::serde::quantity")]
    gas_used: u64,
    #[serde(with = "alloy::serde::quantity")]
    gas_limit: u64,
    #[serde(with = "alloy::serde::quantity::opt")]
    base_fee_per_gas: Option<u64>,
    state_root: B256,
    transactions: &'a [TxReceipt],
}

impl<'a> From<&'a MinedBlock> for DetailedBlock<'a> {
    fn from(mined: &'a MinedBlock) -> Self {
        let header = mined.block.header();
        Self {
            number: header.number,
            hash: mined.block.hash(),
            parent_hash: header.parent_hash,
            timestamp: header.timestamp,
            gas_used: header.gas_used,
            gas_limit: header.gas_limit,
            base_fee_per_gas: header.base_fee_per_gas,
            state_root: header.state_root,
            transactions: &mined.receipts,
        }
    }
}

async fn mine_blocks(node: &Node, params: &[Value]) -> Result<MineOutcome, RpcError> {
    let block_count = param(params, 0).map(|v| quantity(v, "blockCount")).transpose()?.unwrap_or(1);
    let interval = param(params, 1).map(|v| quantity(v, "interval")).transpose()?.unwrap_or(1);

    let mine = MineParams::default()
        .with_throw_on_fail(false)
        .with_block_count(block_count)
        .with_interval(interval);
    match node.mine(mine).await? {
        MineResponse::Mined(outcome) if outcome.block_hashes.is_empty() => {
            Err(RpcError::internal("No blocks were mined"))
        }
        MineResponse::Mined(outcome) => Ok(outcome),
        MineResponse::Failed { errors } => Err(RpcError::from_mine_errors(&errors)),
    }
}

fn call_result(result: &ExecutionResult) -> Result<Bytes, RpcError> {
    match result {
        ExecutionResult::Success { output, .. } => Ok(output.data().clone()),
        ExecutionResult::Revert { output, .. } => Err(RpcError::reverted(output)),
        ExecutionResult::Halt { reason, .. } => {
            Err(RpcError::new(SERVER_ERROR, format!("execution halted: {reason:?}")))
        }
    }
}

async fn dispatch(node: &Node, method: &str, raw: &Value) -> Result<Value, RpcError> {
    let params = params(raw)?;
    match method {
        "tevm_mine" | "anvil_mine" | "evm_mine" => {
            let outcome = mine_blocks(node, params).await?;
            Ok(json!({ "blockHashes": outcome.block_hashes }))
        }
        "anvil_mineDetailed" => {
            let outcome = mine_blocks(node, params).await.map_err(|mut err| {
                err.code = SERVER_ERROR;
                err
            })?;
            to_json(outcome.blocks.iter().map(DetailedBlock::from).collect::<Vec<_>>())
        }
        "eth_sendRawTransaction" => {
            let raw: Bytes = parse(required(params, 0, "transaction")?, "transaction")?;
            let sent = node.send_raw_transaction(&raw).await?;
            Ok(json!(sent.hash.to_string()))
        }
        "eth_sendTransaction" => {
            let request = tx_request(required(params, 0, "transaction")?)?;
            let sent = node.send_transaction(request).await?;
            Ok(json!(sent.hash.to_string()))
        }
        "eth_call" => {
            let request = tx_request(required(params, 0, "transaction")?)?;
            let outcome = node.call(request, false).await?;
            Ok(json!(call_result(&outcome.result)?.to_string()))
        }
        "tevm_call" => {
            let value = required(params, 0, "call")?;
            let create_transaction =
                value.get("createTransaction").and_then(Value::as_bool).unwrap_or(false);
            let outcome = node.call(tx_request(value)?, create_transaction).await?;
            let created = match &outcome.result {
                ExecutionResult::Success { output: Output::Create(_, created), .. } => *created,
                _ => None,
            };
            let mut body = json!({
                "rawData": outcome.result.output(),
                "executionGasUsed": hex(outcome.result.gas_used()),
                "createdAddress": created,
            });
            if let Err(err) = call_result(&outcome.result) {
                body["errors"] = json!([err]);
            }
            if let Some(sent) = outcome.transaction {
                body["txHash"] = json!(sent.hash.to_string());
            }
            Ok(body)
        }
        "eth_estimateGas" => {
            let request = tx_request(required(params, 0, "transaction")?)?;
            let estimate = node.estimate_gas(request).await?;
            let gas = estimate.gas_estimation().ok_or(ActionError::Estimation(estimate))?;
            Ok(json!(hex(gas)))
        }
        "eth_blockNumber" => Ok(json!(hex(node.block_number().await))),
        "eth_getTransactionReceipt" => {
            let hash: B256 = parse(required(params, 0, "hash")?, "hash")?;
            to_json(node.transaction_receipt(hash).await)
        }
        "anvil_setNextBlockTimestamp" | "evm_setNextBlockTimestamp" => {
            let timestamp = quantity(required(params, 0, "timestamp")?, "timestamp")?;
            node.set_next_block_timestamp(timestamp).await?;
            Ok(Value::Null)
        }
        "anvil_setBlockTimestampInterval" => {
            let interval = quantity(required(params, 0, "interval")?, "interval")?;
            node.set_block_timestamp_interval(Some(interval)).await;
            Ok(Value::Null)
        }
        "anvil_removeBlockTimestampInterval" => {
            let removed = node.block_overrides().await.timestamp_interval.is_some();
            node.set_block_timestamp_interval(None).await;
            Ok(json!(removed))
        }
        "anvil_setNextBlockBaseFeePerGas" => {
            let base_fee = quantity(required(params, 0, "baseFee")?, "baseFee")?;
            node.set_next_block_base_fee_per_gas(base_fee).await;
            Ok(Value::Null)
        }
        "evm_setBlockGasLimit" => {
            let gas_limit = quantity(required(params, 0, "gasLimit")?, "gasLimit")?;
            node.set_next_block_gas_limit(gas_limit).await?;
            Ok(json!(true))
        }
        "anvil_setAutomine" | "evm_setAutomine" => {
            let enabled = required(params, 0, "enabled")?
                .as_bool()
                .ok_or_else(|| RpcError::invalid_params("enabled must be a boolean"))?;
            let mining = if enabled { MiningConfig::Auto } else { MiningConfig::Manual };
            node.set_mining_config(mining).await?;
            Ok(Value::Null)
        }
        "anvil_getAutomine" => Ok(json!(node.mining_config().await.is_auto())),
        "anvil_setIntervalMining" | "evm_setIntervalMining" => {
            let seconds = quantity(required(params, 0, "interval")?, "interval")?;
            let mining = if seconds == 0 {
                MiningConfig::Manual
            } else {
                MiningConfig::interval(Duration::from_secs(seconds))
            };
            node.set_mining_config(mining).await?;
            Ok(Value::Null)
        }
        _ => Err(RpcError::method_not_found(method)),
    }
}

impl Node {
    /// Handle a JSON-RPC request.
    pub async fn handle_rpc(&self, request: RpcRequest) -> RpcResponse {
        let span = debug_span!("rpc", method = %request.method);
        let outcome = dispatch(self, &request.method, &request.params).instrument(span).await;
        if let Err(err) = &outcome {
            debug!(method = %request.method, code = err.code, message = %err.message, "rpc request failed");
        }
        RpcResponse::new(request.id, outcome)
    }

    /// Handle a serialized JSON-RPC request, returning the serialized
    /// response.
    pub async fn handle_rpc_json(&self, body: &str) -> String {
        let response = match serde_json::from_str::<RpcRequest>(body) {
            Ok(request) => self.handle_rpc(request).await,
            Err(err) => RpcResponse::new(Value::Null, Err(RpcError::new(PARSE_ERROR, err.to_string()))),
        };
        serde_json::to_string(&response).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{test_utils::*, NodeConfig};
    use alloy::primitives::{Address, U256};

    async fn call(node: &Node, method: &str, params: Value) -> Result<Value, RpcError> {
        let response = node.handle_rpc(RpcRequest::new(method, params)).await;
        assert_eq!(response.id, json!(1));
        match (response.result, response.error) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(error),
            other => panic!("malformed response {other:?}"),
        }
    }

    #[tokio::test]
    async fn mine_returns_block_hashes() {
        let node = funded_node(NodeConfig::default());
        let result = call(&node, "anvil_mine", json!(["0x3", "0x2"])).await.unwrap();
        let hashes = result["blockHashes"].as_array().unwrap();
        assert_eq!(hashes.len(), 3);

        let head = node.vm().await.chain().head().hash();
        assert_eq!(hashes[2], json!(head.to_string()));
        assert_eq!(call(&node, "eth_blockNumber", Value::Null).await.unwrap(), json!("0x3"));
    }

    #[tokio::test]
    async fn empty_round_is_internal_error() {
        let node = funded_node(NodeConfig::default());
        let err = call(&node, "evm_mine", json!([0])).await.unwrap_err();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert_eq!(err.message, "No blocks were mined");
    }

    #[tokio::test]
    async fn mine_failure_lists_errors() {
        let node = funded_node(NodeConfig::default());
        node.stop().await;

        let err = call(&node, "tevm_mine", Value::Null).await.unwrap_err();
        assert_eq!(err.code, SERVER_ERROR);
        assert_eq!(err.message, "Client is stopped");
        assert_eq!(err.data.unwrap()["errors"], json!(["Client is stopped"]));

        let err = call(&node, "anvil_mine", json!(["0x2", "0x0"])).await.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn mine_detailed_reports_transactions() {
        let node = funded_node(NodeConfig::default());
        call(&node, "evm_setAutomine", json!([false])).await.unwrap();

        let raw = signed_transfer(&signer(), 0, BOB, U256::from(5));
        let hash = call(&node, "eth_sendRawTransaction", json!([Bytes::from(raw).to_string()]))
            .await
            .unwrap();
        assert_eq!(node.pool().await.len(), 1);

        let blocks = call(&node, "anvil_mineDetailed", Value::Null).await.unwrap();
        let tx = &blocks[0]["transactions"][0];
        assert_eq!(tx["transactionHash"], hash);
        assert_eq!(tx["status"], json!("0x1"));
        assert_eq!(tx["gasUsed"], json!("0x5208"));

        let receipt =
            call(&node, "eth_getTransactionReceipt", json!([hash])).await.unwrap();
        assert_eq!(receipt["blockNumber"], json!("0x1"));
    }

    #[tokio::test]
    async fn send_transaction_automines() {
        let node = funded_node(NodeConfig::default());
        let tx = json!({ "from": ALICE.to_string(), "to": BOB.to_string(), "value": "0x7", "gas": "0x5208" });
        call(&node, "eth_sendTransaction", json!([tx])).await.unwrap();
        assert_eq!(node.block_number().await, 1);
        assert!(node.pool().await.is_empty());

        let estimate = call(&node, "eth_estimateGas", json!([tx])).await.unwrap();
        assert_eq!(estimate, json!("0x5208"));
        assert_eq!(node.block_number().await, 1);
    }

    #[tokio::test]
    async fn automine_failure_reports_pooled_hash() {
        let node = funded_node(NodeConfig::default());
        node.stop().await;

        let raw = signed_transfer(&signer(), 0, BOB, U256::from(5));
        let err = call(&node, "eth_sendRawTransaction", json!([Bytes::from(raw).to_string()]))
            .await
            .unwrap_err();
        assert_eq!(err.message, "Client is stopped");

        let data = err.data.unwrap();
        assert_eq!(data["errors"], json!(["Client is stopped"]));
        let hash: B256 = parse(&data["txHash"], "txHash").unwrap();
        assert!(node.pool().await.contains(hash));
        assert_eq!(node.pool().await.len(), 1);
    }

    #[tokio::test]
    async fn tevm_call_skips_balance() {
        let node = funded_node(NodeConfig::default());
        call(&node, "anvil_setAutomine", json!([false])).await.unwrap();

        let poor = Address::repeat_byte(0x42);
        let body = json!({
            "from": poor.to_string(),
            "to": BOB.to_string(),
            "value": "0xde0b6b3a7640000",
            "skipBalance": true,
            "createTransaction": true,
        });
        let result = call(&node, "tevm_call", json!([body])).await.unwrap();
        let hash: B256 = parse(&result["txHash"], "txHash").unwrap();
        assert!(node.pool().await.get(hash).unwrap().skip_balance());

        call(&node, "evm_mine", Value::Null).await.unwrap();
        let receipt = call(&node, "eth_getTransactionReceipt", json!([hash])).await.unwrap();
        assert_eq!(receipt["status"], json!("0x1"));
    }

    #[tokio::test]
    async fn tevm_call_creates_transaction() {
        let node = funded_node(NodeConfig::default());
        call(&node, "anvil_setAutomine", json!([false])).await.unwrap();
        assert_eq!(call(&node, "anvil_getAutomine", Value::Null).await.unwrap(), json!(false));

        let body = json!({ "from": ALICE.to_string(), "to": BOB.to_string(), "createTransaction": true });
        let result = call(&node, "tevm_call", json!([body])).await.unwrap();
        assert_eq!(result["executionGasUsed"], json!("0x5208"));
        let hash: B256 = parse(&result["txHash"], "txHash").unwrap();
        assert!(node.pool().await.contains(hash));
    }

    #[tokio::test]
    async fn eth_call_reports_revert() {
        let executor = ScriptedExecutor::default().with_script(REVERTER, Script::Revert);
        let node = funded_node_with(NodeConfig::default(), executor);

        let tx = json!({ "from": ALICE.to_string(), "to": REVERTER.to_string() });
        let err = call(&node, "eth_call", json!([tx])).await.unwrap_err();
        assert_eq!(err.code, EXECUTION_REVERTED);
        assert_eq!(node.block_number().await, 0);
    }

    #[tokio::test]
    async fn overrides_through_rpc() {
        let node = funded_node(NodeConfig::default().with_genesis_timestamp(10));
        call(&node, "anvil_setNextBlockTimestamp", json!(["0x64"])).await.unwrap();
        call(&node, "anvil_setNextBlockBaseFeePerGas", json!([3])).await.unwrap();
        call(&node, "evm_setBlockGasLimit", json!(["0x1000000"])).await.unwrap();
        assert!(call(&node, "evm_setBlockGasLimit", json!(["0x0"])).await.is_err());

        let blocks = call(&node, "anvil_mineDetailed", Value::Null).await.unwrap();
        assert_eq!(blocks[0]["timestamp"], json!("0x64"));
        assert_eq!(blocks[0]["baseFeePerGas"], json!("0x3"));
        assert_eq!(blocks[0]["gasLimit"], json!("0x1000000"));

        let err = call(&node, "anvil_setNextBlockTimestamp", json!(["0x64"])).await.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn malformed_requests() {
        let node = funded_node(NodeConfig::default());
        let err = call(&node, "eth_foo", Value::Null).await.unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);

        let err = call(&node, "eth_sendRawTransaction", json!(["nothex"])).await.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);

        let response: RpcResponse =
            serde_json::from_str(&node.handle_rpc_json("{not json").await).unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);

        let body = r#"{"jsonrpc":"2.0","id":7,"method":"eth_blockNumber","params":[]}"#;
        let response: RpcResponse = serde_json::from_str(&node.handle_rpc_json(body).await).unwrap();
        assert_eq!(response.id, json!(7));
        assert_eq!(response.result, Some(json!("0x0")));
    }
}
