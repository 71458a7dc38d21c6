use serde::Deserialize;
use std::fmt;

use crate::error::RuleError;
use crate::state::{ChannelSnapshot, ShortChannelId};

/// Per-channel liquidity bounds, expressed as percentages of capacity.
///
/// A rule asks for a loop out when incoming liquidity drops below
/// `minimum_incoming_percent`, as long as outgoing liquidity stays above
/// `minimum_outgoing_percent` afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ThresholdRule {
    pub minimum_incoming_percent: u32,
    pub minimum_outgoing_percent: u32,
}

impl ThresholdRule {
    pub fn new(minimum_incoming_percent: u32, minimum_outgoing_percent: u32) -> Self {
        Self {
            minimum_incoming_percent,
            minimum_outgoing_percent,
        }
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        validate_percent("incoming", self.minimum_incoming_percent)?;
        validate_percent("outgoing", self.minimum_outgoing_percent)?;

        if self.minimum_incoming_percent + self.minimum_outgoing_percent > 100 {
            return Err(RuleError::ThresholdSumTooHigh);
        }
        if self.minimum_incoming_percent == 0 && self.minimum_outgoing_percent == 0 {
            return Err(RuleError::NoThreshold);
        }
        Ok(())
    }

    /// Recommend a loop out for this channel, or `None` when no action is
    /// needed or possible within the server's restrictions.
    pub fn suggest_swap(
        &self,
        balances: &Balances,
        restrictions: &Restrictions,
    ) -> Option<Recommendation> {
        let amount = loop_out_amount(
            balances,
            self.minimum_incoming_percent,
            self.minimum_outgoing_percent,
        );
        if amount == 0 || amount < restrictions.minimum_sat {
            return None;
        }

        Some(Recommendation {
            channel_id: balances.channel_id,
            amount_sat: amount.min(restrictions.maximum_sat),
        })
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min incoming: {}%, min outgoing: {}%",
            self.minimum_incoming_percent, self.minimum_outgoing_percent
        )
    }
}

fn validate_percent(which: &'static str, value: u32) -> Result<(), RuleError> {
    if value > 100 {
        return Err(RuleError::PercentOutOfRange { which, value });
    }
    Ok(())
}

/// Amount to loop out so that incoming liquidity lands at the midpoint of the
/// band the rule allows, never pushing outgoing below its own minimum.
fn loop_out_amount(balances: &Balances, incoming_percent: u32, outgoing_percent: u32) -> u64 {
    let minimum_incoming = balances.capacity_sat * incoming_percent as u64 / 100;
    let minimum_outgoing = balances.capacity_sat * outgoing_percent as u64 / 100;

    if balances.incoming_sat >= minimum_incoming {
        return 0;
    }
    if balances.outgoing_sat <= minimum_outgoing {
        return 0;
    }

    let maximum_incoming = balances.capacity_sat.saturating_sub(minimum_outgoing);
    let midpoint = (minimum_incoming + maximum_incoming) / 2;
    let required = midpoint.saturating_sub(balances.incoming_sat);

    // Pending htlcs mean outgoing may be less than capacity - incoming.
    let available = balances.outgoing_sat - minimum_outgoing;

    required.min(available)
}

/// Balance view of a single channel in whole satoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balances {
    pub channel_id: ShortChannelId,
    pub capacity_sat: u64,
    pub incoming_sat: u64,
    pub outgoing_sat: u64,
}

impl From<&ChannelSnapshot> for Balances {
    fn from(channel: &ChannelSnapshot) -> Self {
        Self {
            channel_id: channel.channel_id,
            capacity_sat: channel.capacity_sats,
            incoming_sat: channel.remote_balance_msat / 1000,
            outgoing_sat: channel.local_balance_msat / 1000,
        }
    }
}

/// Swap size limits the server currently enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restrictions {
    pub minimum_sat: u64,
    pub maximum_sat: u64,
}

impl Restrictions {
    pub fn new(minimum_sat: u64, maximum_sat: u64) -> anyhow::Result<Self> {
        if minimum_sat > maximum_sat {
            anyhow::bail!(
                "minimum swap amount {} sat exceeds maximum {} sat",
                minimum_sat,
                maximum_sat
            );
        }
        Ok(Self {
            minimum_sat,
            maximum_sat,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recommendation {
    pub channel_id: ShortChannelId,
    pub amount_sat: u64,
}
