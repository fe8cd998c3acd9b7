/// Evaluate an expression against the inner transaction of a [`PendingTx`],
/// whichever variant it is.
///
/// [`PendingTx`]: crate::PendingTx
macro_rules! with_inner_tx {
    ($pending:expr, |$tx:ident| $body:expr) => {
        match &$pending.tx {
            $crate::tx::PooledTx::Signed($tx) => $body,
            $crate::tx::PooledTx::Impersonated($tx) => $body,
        }
    };
}

/// Return a pool error from the enclosing function if the condition does not
/// hold.
macro_rules! pool_ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}

/// Unwrap a round result. Recoverable errors are routed through the
/// fail-or-throw contract of the enclosing mine call, internal errors are
/// always returned as `Err`.
macro_rules! round_try {
    ($e:expr, $throw_on_fail:expr) => {
        match $e {
            Ok(val) => val,
            Err(err) => {
                let err: $crate::MineError = err.into();
                if $throw_on_fail || err.is_internal() {
                    return Err(err);
                }
                return Ok($crate::MineResponse::Failed { errors: vec![err] });
            }
        }
    };
}
