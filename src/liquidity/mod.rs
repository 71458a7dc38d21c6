//! Monitors channel liquidity and suggests loop out swaps.
//!
//! Each channel can carry a [`ThresholdRule`] describing the liquidity balance
//! we want on it. Suggestions are limited to channels not already in use by a
//! pending swap, and none are made while an unrestricted swap is in flight.
//!
//! Fee restrictions keep suggestions economical: when the estimated fee for
//! sweeping within `sweep_conf_target` blocks exceeds `sweep_fee_rate_limit`,
//! no swaps are suggested at all.

pub mod eligibility;
pub mod params;
pub mod request;
pub mod rule;

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cancel::CancelSignal;
use crate::client::{NodeBackend, SwapServer};
use crate::clock::Clock;
use crate::error::Result;
use crate::swaps::SwapStore;

pub use eligibility::SwapExclusions;
pub use params::Parameters;
pub use request::LoopOutRequest;
pub use rule::{Balances, Restrictions, ThresholdRule};

/// External functionality the manager needs to assess liquidity.
pub struct ManagerConfig {
    pub node: Arc<dyn NodeBackend>,
    pub swap_server: Arc<dyn SwapServer>,
    pub swaps: Arc<dyn SwapStore>,
    pub clock: Arc<dyn Clock>,
    /// Lowest sweep confirmation target that may be configured.
    pub minimum_confirmations: u32,
}

/// Holds the liquidity rules for our channels and turns them into swap
/// suggestions.
pub struct Manager {
    cfg: ManagerConfig,
    /// Held for the whole of a suggestion cycle so every cycle works from one
    /// consistent set of parameters.
    params: Mutex<Parameters>,
}

impl Manager {
    /// Create a manager with default parameters and no rules.
    pub fn new(cfg: ManagerConfig) -> Self {
        Self {
            cfg,
            params: Mutex::new(Parameters::default()),
        }
    }

    /// An independent copy of the current parameters.
    pub async fn get_parameters(&self) -> Parameters {
        self.params.lock().await.clone()
    }

    /// Replace the current parameters if `params` is valid; otherwise the
    /// existing parameters are left untouched.
    pub async fn set_parameters(&self, params: Parameters) -> Result<()> {
        params.validate(self.cfg.minimum_confirmations)?;

        let mut current = self.params.lock().await;
        *current = params;
        info!("Liquidity parameters updated: {}", *current);
        Ok(())
    }

    /// Suggest loop outs for every eligible channel whose rule calls for one.
    ///
    /// Either the complete list is returned or an error; a failure anywhere in
    /// the cycle never yields a partial list.
    pub async fn suggest_swaps(&self, cancel: &CancelSignal) -> Result<Vec<LoopOutRequest>> {
        let params = self.params.lock().await;

        // Nothing to evaluate, don't bother the node or the server.
        if params.channel_rules.is_empty() {
            return Ok(Vec::new());
        }

        let estimate = cancel
            .run("EstimateFee", self.cfg.node.estimate_fee(params.sweep_conf_target))
            .await?;

        if estimate > params.sweep_fee_rate_limit {
            debug!(
                "Current fee estimate to sweep within: {} blocks {} sat/vByte exceeds limit \
                 of: {} sat/vByte",
                params.sweep_conf_target,
                estimate.sat_per_vbyte(),
                params.sweep_fee_rate_limit.sat_per_vbyte(),
            );
            return Ok(Vec::new());
        }

        let restrictions = cancel
            .run("LoopOutTerms", self.cfg.swap_server.loop_out_restrictions())
            .await?;

        // These listings may race with manually initiated swaps.
        let loop_out = cancel
            .run("ListLoopOut", async { self.cfg.swaps.list_loop_out() })
            .await?;
        let loop_in = cancel
            .run("ListLoopIn", async { self.cfg.swaps.list_loop_in() })
            .await?;

        let cutoff = failure_cutoff(self.cfg.clock.now(), params.failure_backoff);
        let Some(exclusions) = SwapExclusions::from_swaps(&loop_out, &loop_in, cutoff) else {
            return Ok(Vec::new());
        };

        let channels = cancel
            .run("ListChannels", self.cfg.node.list_channels())
            .await?;
        let eligible = exclusions.filter(channels);

        let mut suggestions = Vec::new();
        for channel in &eligible {
            let Some(rule) = params.channel_rules.get(&channel.channel_id) else {
                continue;
            };

            let balances = Balances::from(channel);
            if let Some(recommendation) = rule.suggest_swap(&balances, &restrictions) {
                suggestions.push(LoopOutRequest::from_recommendation(
                    &recommendation,
                    params.sweep_conf_target,
                ));
            }
        }

        debug!(
            "Suggestion cycle: {} eligible channels, {} suggestions",
            eligible.len(),
            suggestions.len()
        );

        Ok(suggestions)
    }
}

/// Most recent failure time at which a channel is still considered eligible.
fn failure_cutoff(now: DateTime<Utc>, backoff: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(backoff)
        .ok()
        .and_then(|backoff| now.checked_sub_signed(backoff))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
