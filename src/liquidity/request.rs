use std::fmt;

use crate::liquidity::rule::Recommendation;
use crate::state::ShortChannelId;

/// Base for fees expressed in parts per million.
pub const FEE_BASE: u64 = 1_000_000;

/// Swap fee budget, 0.5% of swap volume.
pub const DEFAULT_SWAP_FEE_PPM: u64 = 5_000;

/// Routing fee budget for the swap invoice, 1% of swap volume.
pub const DEFAULT_ROUTING_FEE_PPM: u64 = 10_000;

/// Routing fee budget for the prepay invoice, 0.5% of prepay volume.
pub const DEFAULT_PREPAY_ROUTING_FEE_PPM: u64 = 5_000;

pub const DEFAULT_MAXIMUM_MINER_FEE_SAT: u64 = 15_000;

pub const DEFAULT_MAXIMUM_PREPAY_SAT: u64 = 30_000;

/// A fully bounded loop out request ready to hand to the swap client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutRequest {
    pub amount_sat: u64,
    pub outgoing_chan_set: Vec<ShortChannelId>,
    pub max_swap_fee_sat: u64,
    pub max_swap_routing_fee_sat: u64,
    pub max_prepay_routing_fee_sat: u64,
    pub max_miner_fee_sat: u64,
    pub max_prepay_amount_sat: u64,
    pub sweep_conf_target: u32,
}

impl LoopOutRequest {
    /// Translate a recommendation into a request using the default fee limits.
    pub fn from_recommendation(recommendation: &Recommendation, sweep_conf_target: u32) -> Self {
        let amount = recommendation.amount_sat;

        Self {
            amount_sat: amount,
            outgoing_chan_set: vec![recommendation.channel_id],
            max_swap_fee_sat: ppm_to_sat(amount, DEFAULT_SWAP_FEE_PPM),
            max_swap_routing_fee_sat: ppm_to_sat(amount, DEFAULT_ROUTING_FEE_PPM),
            max_prepay_routing_fee_sat: ppm_to_sat(
                DEFAULT_MAXIMUM_PREPAY_SAT,
                DEFAULT_PREPAY_ROUTING_FEE_PPM,
            ),
            max_miner_fee_sat: DEFAULT_MAXIMUM_MINER_FEE_SAT,
            max_prepay_amount_sat: DEFAULT_MAXIMUM_PREPAY_SAT,
            sweep_conf_target,
        }
    }
}

impl fmt::Display for LoopOutRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chans: Vec<String> = self.outgoing_chan_set.iter().map(|c| c.to_string()).collect();
        write!(
            f,
            "loop out {} sat over [{}] (max swap fee {} sat, max routing fee {} sat, \
             max miner fee {} sat, conf target {})",
            self.amount_sat,
            chans.join(", "),
            self.max_swap_fee_sat,
            self.max_swap_routing_fee_sat,
            self.max_miner_fee_sat,
            self.sweep_conf_target,
        )
    }
}

/// Portion of `amount` that `ppm` parts per million represents.
pub fn ppm_to_sat(amount: u64, ppm: u64) -> u64 {
    (amount as u128 * ppm as u128 / FEE_BASE as u128) as u64
}
