use thiserror::Error;

use crate::state::{SatPerKWeight, ShortChannelId};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the liquidity manager, hop hint selection and loop in
/// planning.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed parameters or options, rejected before any state changed.
    #[error("invalid parameters: {0}")]
    Validation(#[from] ValidationError),

    /// A backend call failed; the current cycle produced nothing.
    #[error("{call} failed: {cause:#}")]
    Upstream {
        call: &'static str,
        cause: anyhow::Error,
    },

    #[error("cancelled during {0}")]
    Cancelled(&'static str),

    #[error(
        "miner fee estimation not possible, node has insufficient funds to \
         create a sample transaction for {amount_sat} sat"
    )]
    MinerFeeEstimationFailed { amount_sat: u64 },
}

impl Error {
    pub fn upstream(call: &'static str, cause: anyhow::Error) -> Self {
        Error::Upstream { call, cause }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("zero channel ID not allowed")]
    ZeroChannelId,

    #[error("channel: {channel} has invalid rule: {reason}")]
    InvalidRule {
        channel: ShortChannelId,
        reason: RuleError,
    },

    #[error("sweep fee rate limit must be >= {} sat/vByte", .floor.sat_per_vbyte())]
    SweepFeeRateTooLow { floor: SatPerKWeight },

    #[error("confirmation target must be at least: {minimum}")]
    ConfTargetTooLow { minimum: u32 },

    #[error("external and conf_target both set")]
    ExternalWithConfTarget,

    #[error("private and route_hints both set")]
    PrivateWithRouteHints,

    #[error("label of length {length} exceeds maximum length {max}")]
    LabelTooLong { length: usize, max: usize },

    #[error("label may not start with reserved prefix: {0}")]
    ReservedLabel(&'static str),

    #[error("swap amount must be non-zero")]
    ZeroAmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("{which} threshold {value}% not in [0, 100]")]
    PercentOutOfRange { which: &'static str, value: u32 },

    #[error("combined incoming and outgoing thresholds must be <= 100%")]
    ThresholdSumTooHigh,

    #[error("rule must set at least one threshold")]
    NoThreshold,
}
