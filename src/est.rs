use crate::exec::MIN_TRANSACTION_GAS;
use alloy::primitives::Bytes;
use revm::context::result::{ExecutionResult, HaltReason, Output};
use std::fmt;

/// The range of gas limits a gas estimation searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SearchRange {
    min: u64,
    max: u64,
}

impl fmt::Display for SearchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

impl SearchRange {
    /// Create a new search range.
    pub(crate) const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub(crate) const fn min(&self) -> u64 {
        self.min
    }

    pub(crate) const fn max(&self) -> u64 {
        self.max
    }

    /// Raise the minimum, if `min` is higher than the current one.
    pub(crate) fn maybe_raise_min(&mut self, min: u64) {
        self.min = self.min.max(min);
    }

    /// Lower the maximum, if `max` is lower than the current one.
    pub(crate) fn maybe_lower_max(&mut self, max: u64) {
        self.max = self.max.min(max);
    }

    pub(crate) const fn midpoint(&self) -> u64 {
        self.min + (self.max - self.min) / 2
    }

    pub(crate) const fn size(&self) -> u64 {
        self.max.saturating_sub(self.min)
    }

    pub(crate) const fn contains(&self, value: u64) -> bool {
        self.min < value && value <= self.max
    }

    /// The size of the range relative to its maximum.
    pub(crate) fn ratio(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.size() as f64 / self.max as f64
    }
}

/// The result of gas estimation.
///
/// This is a trimmed version of [`ExecutionResult`], that contains only
/// information relevant to gas estimation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstimationResult {
    /// The estimation was successful, the result is the gas estimation.
    Success {
        /// The gas estimation.
        estimation: u64,
        /// The amount of gas used in the execution.
        gas_used: u64,
        /// The output of execution.
        output: Output,
    },
    /// Estimation failed due to contract revert.
    Revert {
        /// The revert reason.
        reason: Bytes,
        /// The amount of gas used in the execution.
        gas_used: u64,
    },
    /// The estimation failed due to an execution halt.
    Halt {
        /// The halt reason.
        reason: HaltReason,
        /// The amount of gas used in the execution
        gas_used: u64,
    },
}

impl fmt::Display for EstimationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { estimation, gas_used, .. } => {
                write!(f, "success: estimation {estimation}, gas used {gas_used}")
            }
            Self::Revert { gas_used, .. } => write!(f, "revert after {gas_used} gas"),
            Self::Halt { reason, gas_used } => write!(f, "halt ({reason:?}) after {gas_used} gas"),
        }
    }
}

impl From<&ExecutionResult> for EstimationResult {
    fn from(value: &ExecutionResult) -> Self {
        match value {
            ExecutionResult::Success { gas_used, output, .. } => {
                Self::Success { estimation: *gas_used, gas_used: *gas_used, output: output.clone() }
            }
            ExecutionResult::Revert { output, gas_used } => {
                Self::Revert { reason: output.clone(), gas_used: *gas_used }
            }
            ExecutionResult::Halt { reason, gas_used } => {
                Self::Halt { reason: *reason, gas_used: *gas_used }
            }
        }
    }
}

impl EstimationResult {
    /// Create a successful estimation result with a gas estimation of 21000.
    pub const fn basic_transfer_success() -> Self {
        Self::Success {
            estimation: MIN_TRANSACTION_GAS,
            gas_used: MIN_TRANSACTION_GAS,
            output: Output::Call(Bytes::new()),
        }
    }

    /// Return true if the execution was successful.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Return true if the execution was not successful.
    pub const fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Get the gas estimation, if the execution was successful.
    pub const fn gas_estimation(&self) -> Option<u64> {
        match self {
            Self::Success { estimation, .. } => Some(*estimation),
            _ => None,
        }
    }

    /// Get the gas used in execution, regardless of the outcome.
    pub const fn gas_used(&self) -> u64 {
        match self {
            Self::Success { gas_used, .. } => *gas_used,
            Self::Revert { gas_used, .. } => *gas_used,
            Self::Halt { gas_used, .. } => *gas_used,
        }
    }

    /// Get the revert reason if the execution failed due to revert.
    pub const fn revert_reason(&self) -> Option<&Bytes> {
        match self {
            Self::Revert { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Get the halt reason if the execution failed due to a halt.
    pub const fn halt_reason(&self) -> Option<&HaltReason> {
        match self {
            Self::Halt { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Set the estimation of a successful result.
    pub(crate) const fn with_estimation(mut self, gas: u64) -> Self {
        if let Self::Success { estimation, .. } = &mut self {
            *estimation = gas;
        }
        self
    }

    /// Adjust the binary search range based on the estimation outcome.
    pub(crate) fn adjust_binary_search_range(&self, limit: u64, range: &mut SearchRange) -> Result<(), Self> {
        match self {
            Self::Success { .. } => range.maybe_lower_max(limit),
            Self::Revert { .. } => range.maybe_raise_min(limit),
            Self::Halt { reason, gas_used } => {
                // Both `OutOfGas` and `InvalidEFOpcode` can occur dynamically
                // if the gas left is too low. Treat this as an out of gas
                // condition, knowing that the call succeeds with a
                // higher gas limit.
                if matches!(reason, HaltReason::OutOfGas(_) | HaltReason::InvalidFEOpcode) {
                    range.maybe_raise_min(limit);
                } else {
                    return Err(Self::Halt { reason: *reason, gas_used: *gas_used });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use revm::context::result::OutOfGasError;

    #[test]
    fn range_narrows() {
        let mut range = SearchRange::new(MIN_TRANSACTION_GAS, 100_000);
        assert_eq!(range.midpoint(), 60_500);
        assert!(range.contains(100_000));
        assert!(!range.contains(MIN_TRANSACTION_GAS));

        EstimationResult::basic_transfer_success().adjust_binary_search_range(50_000, &mut range).unwrap();
        assert_eq!(range.max(), 50_000);

        let oog = EstimationResult::Halt { reason: HaltReason::OutOfGas(OutOfGasError::Basic), gas_used: 30_000 };
        oog.adjust_binary_search_range(30_000, &mut range).unwrap();
        assert_eq!(range.min(), 30_000);
        assert_eq!(range.size(), 20_000);
    }

    #[test]
    fn static_halt_stops_search() {
        let mut range = SearchRange::new(0, 100);
        let halt = EstimationResult::Halt { reason: HaltReason::OpcodeNotFound, gas_used: 7 };
        assert_eq!(halt.adjust_binary_search_range(50, &mut range), Err(halt.clone()));
        assert_eq!(range, SearchRange::new(0, 100));
    }
}

// Some code above is reproduced from `reth`. It is reused here under the MIT
// license.
//
// The MIT License (MIT)
//
// Copyright (c) 2022-2024 Reth Contributors
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.
