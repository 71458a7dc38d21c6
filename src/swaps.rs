use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::state::{NodeId, ShortChannelId};

/// Swap states as recorded by the swap client's execution subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Initiated,
    PreimageRevealed,
    HtlcPublished,
    InvoiceSettled,
    Success,
    FailOffchainPayments,
    FailTimeout,
    FailSweepTimeout,
    FailInsufficientValue,
    FailIncorrectHtlcAmt,
    /// Failed in a way that may be retried on restart.
    FailTemporary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStateType {
    Pending,
    Success,
    Fail,
}

impl SwapState {
    pub fn state_type(self) -> SwapStateType {
        match self {
            SwapState::Initiated
            | SwapState::PreimageRevealed
            | SwapState::HtlcPublished
            | SwapState::InvoiceSettled
            | SwapState::FailTemporary => SwapStateType::Pending,
            SwapState::Success => SwapStateType::Success,
            SwapState::FailOffchainPayments
            | SwapState::FailTimeout
            | SwapState::FailSweepTimeout
            | SwapState::FailInsufficientValue
            | SwapState::FailIncorrectHtlcAmt => SwapStateType::Fail,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapState::Initiated => "initiated",
            SwapState::PreimageRevealed => "preimage_revealed",
            SwapState::HtlcPublished => "htlc_published",
            SwapState::InvoiceSettled => "invoice_settled",
            SwapState::Success => "success",
            SwapState::FailOffchainPayments => "failed_offchain_payments",
            SwapState::FailTimeout => "failed_timeout",
            SwapState::FailSweepTimeout => "failed_sweep_timeout",
            SwapState::FailInsufficientValue => "failed_insufficient_value",
            SwapState::FailIncorrectHtlcAmt => "failed_incorrect_htlc_amt",
            SwapState::FailTemporary => "failed_temporary",
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let state = match s {
            "initiated" => SwapState::Initiated,
            "preimage_revealed" => SwapState::PreimageRevealed,
            "htlc_published" => SwapState::HtlcPublished,
            "invoice_settled" => SwapState::InvoiceSettled,
            "success" => SwapState::Success,
            "failed_offchain_payments" => SwapState::FailOffchainPayments,
            "failed_timeout" => SwapState::FailTimeout,
            "failed_sweep_timeout" => SwapState::FailSweepTimeout,
            "failed_insufficient_value" => SwapState::FailInsufficientValue,
            "failed_incorrect_htlc_amt" => SwapState::FailIncorrectHtlcAmt,
            "failed_temporary" => SwapState::FailTemporary,
            other => anyhow::bail!("unknown swap state: {:?}", other),
        };
        Ok(state)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutRecord {
    pub swap_hash: String,
    pub state: SwapState,
    /// Channels the swap may leave through; empty means unrestricted.
    pub outgoing_chan_set: Vec<ShortChannelId>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopInRecord {
    pub swap_hash: String,
    pub state: SwapState,
    /// Peer the swap must arrive through; `None` means unrestricted.
    pub last_hop: Option<NodeId>,
    pub last_update: DateTime<Utc>,
}

/// Read-only listing of swaps owned by the execution subsystem.
pub trait SwapStore: Send + Sync {
    fn list_loop_out(&self) -> anyhow::Result<Vec<LoopOutRecord>>;
    fn list_loop_in(&self) -> anyhow::Result<Vec<LoopInRecord>>;
}
