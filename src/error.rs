use crate::{
    chain::ChainError, est::EstimationResult, exec::ExecError, pool::PoolError, state::StateError,
    tx::TxDecodeError,
};
use alloy::primitives::B256;

/// JSON-RPC code for malformed parameters.
pub const INVALID_PARAMS: i64 = -32602;

/// JSON-RPC code for internal errors.
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC code for server-side request failures.
pub const SERVER_ERROR: i64 = -32000;

/// JSON-RPC code for a reverted execution.
pub const EXECUTION_REVERTED: i64 = 3;

/// Errors that can occur while mining.
///
/// Recoverable errors are subject to the `throw_on_fail` contract of
/// [`MineParams`]. Errors for which [`MineError::is_internal`] returns true
/// indicate a broken invariant of the node and are always returned as `Err`.
///
/// [`MineParams`]: crate::MineParams
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MineError {
    /// The request parameters are malformed.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Another round is in progress.
    #[error("Mining is already in progress")]
    AlreadyMining,

    /// The node has been stopped.
    #[error("Client is stopped")]
    Stopped,

    /// The node is syncing.
    #[error("Syncing not currently implemented")]
    Syncing,

    /// The mining mode may not change while a round is running.
    #[error("Cannot change the mining config while mining")]
    ConfigLocked,

    /// The blockchain rejected a block.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// The state manager failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// The executor failed in a way that is not attributable to a single
    /// transaction.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A freshly committed state root was not found in the root cache.
    #[error("State root {0} not found in mineHandler")]
    StateRootMissing(B256),

    /// Receipts for a freshly mined block were not persisted.
    #[error("receipts missing for mined block {0}")]
    ReceiptsMissing(B256),
}

impl MineError {
    /// Create an invalid-params error.
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// True if the error indicates a broken node invariant rather than a
    /// failed request.
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::StateRootMissing(_) | Self::ReceiptsMissing(_))
    }

    /// The JSON-RPC error code for this error.
    pub const fn code(&self) -> i64 {
        match self {
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::StateRootMissing(_) | Self::ReceiptsMissing(_) => INTERNAL_ERROR,
            Self::AlreadyMining
            | Self::Stopped
            | Self::Syncing
            | Self::ConfigLocked
            | Self::Chain(_)
            | Self::State(_)
            | Self::Exec(_) => SERVER_ERROR,
        }
    }
}

/// Errors returned by the transaction and call actions of a [`Node`].
///
/// [`Node`]: crate::Node
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The raw transaction could not be decoded.
    #[error(transparent)]
    Decode(#[from] TxDecodeError),

    /// The pool refused the transaction.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The executor refused the transaction.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// The state manager failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Gas estimation found no gas limit at which the transaction succeeds.
    #[error("gas estimation failed: {0}")]
    Estimation(EstimationResult),

    /// The transaction was pooled, but the block it triggered could not be
    /// mined.
    #[error("transaction {hash} was added to the pool, but mining failed: {}", join_errors(.errors))]
    Automine {
        /// Hash of the pooled transaction.
        hash: B256,
        /// Why the round failed.
        errors: Vec<MineError>,
    },
}

fn join_errors(errors: &[MineError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl ActionError {
    /// The JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::Decode(_) => INVALID_PARAMS,
            Self::Estimation(EstimationResult::Revert { .. }) => EXECUTION_REVERTED,
            Self::Pool(PoolError::State(_)) | Self::Exec(ExecError::State(_)) | Self::State(_) => {
                INTERNAL_ERROR
            }
            Self::Automine { errors, .. } => errors.first().map_or(SERVER_ERROR, MineError::code),
            Self::Pool(_) | Self::Exec(_) | Self::Estimation(_) => SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(MineError::invalid_params("x").code(), INVALID_PARAMS);
        assert_eq!(MineError::AlreadyMining.code(), SERVER_ERROR);
        assert!(MineError::StateRootMissing(B256::ZERO).is_internal());
        assert!(!MineError::Stopped.is_internal());
        assert_eq!(MineError::AlreadyMining.to_string(), "Mining is already in progress");
    }
}
