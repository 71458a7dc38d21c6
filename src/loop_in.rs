//! Quotes and dispatches loop in swaps.
//!
//! A loop in moves on-chain funds into a channel. When the node only has
//! private channels the swap server cannot find a route to us, so for
//! `private` swaps we attach our own hop hints to both the quote and the
//! swap request.

use log::{info, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::client::SwapServer;
use crate::error::{Error, Result, ValidationError};
use crate::hophints::{HopHint, HopHintSelector, MAX_HOP_HINTS};
use crate::state::NodeId;

pub const MAX_LABEL_LENGTH: usize = 500;

/// Labels with this prefix are reserved for swaps the daemon creates itself.
pub const RESERVED_LABEL_PREFIX: &str = "[reserved]";

/// Initiator tag sent with every swap we dispatch.
pub const DEFAULT_INITIATOR: &str = "liquidity-boss";

/// Publish fee the server quotes when the node could not build a sample
/// htlc transaction.
pub const MINER_FEE_ESTIMATION_FAILED: i64 = -1;

/// Headroom over the quoted htlc publish fee.
const MINER_FEE_MULTIPLIER: u64 = 3;

pub fn validate_label(label: &str) -> std::result::Result<(), ValidationError> {
    // Bytes, not chars: the swap daemon enforces the same limit on the encoded label.
    let length = label.len();
    if length > MAX_LABEL_LENGTH {
        return Err(ValidationError::LabelTooLong {
            length,
            max: MAX_LABEL_LENGTH,
        });
    }
    if label.starts_with(RESERVED_LABEL_PREFIX) {
        return Err(ValidationError::ReservedLabel(RESERVED_LABEL_PREFIX));
    }
    Ok(())
}

/// What the user asked for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopInOptions {
    pub amount_sat: u64,
    /// The htlc is published by someone else, not by our wallet.
    pub external_htlc: bool,
    pub htlc_conf_target: Option<u32>,
    pub last_hop: Option<NodeId>,
    pub label: String,
    /// Hints supplied by the caller, mutually exclusive with `private`.
    pub route_hints: Option<Vec<Vec<HopHint>>>,
    /// Generate hints from our own private channels.
    pub private: bool,
}

impl LoopInOptions {
    pub fn new(amount_sat: u64) -> Self {
        Self {
            amount_sat,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.amount_sat == 0 {
            return Err(ValidationError::ZeroAmount);
        }
        if self.external_htlc && self.htlc_conf_target.is_some() {
            return Err(ValidationError::ExternalWithConfTarget);
        }
        if self.private && self.route_hints.is_some() {
            return Err(ValidationError::PrivateWithRouteHints);
        }
        validate_label(&self.label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteRequest {
    pub amount_sat: u64,
    /// Zero leaves the choice to the server.
    pub conf_target: u32,
    pub external_htlc: bool,
    pub last_hop: Option<NodeId>,
    pub route_hints: Vec<Vec<HopHint>>,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InQuote {
    pub swap_fee_sat: u64,
    /// [`MINER_FEE_ESTIMATION_FAILED`] when no estimate was possible.
    pub htlc_publish_fee_sat: i64,
    pub cltv_delta: u32,
    pub conf_target: u32,
}

/// Upper bounds we accept for a loop in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopInLimits {
    pub max_miner_fee_sat: u64,
    pub max_swap_fee_sat: u64,
}

impl LoopInLimits {
    pub fn from_quote(quote: &InQuote) -> Self {
        let publish_fee = u64::try_from(quote.htlc_publish_fee_sat).unwrap_or(0);
        Self {
            max_miner_fee_sat: publish_fee.saturating_mul(MINER_FEE_MULTIPLIER),
            max_swap_fee_sat: quote.swap_fee_sat,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopInRequest {
    pub amount_sat: u64,
    pub max_miner_fee_sat: u64,
    pub max_swap_fee_sat: u64,
    pub external_htlc: bool,
    pub htlc_conf_target: u32,
    pub label: String,
    pub initiator: String,
    pub last_hop: Option<NodeId>,
    pub route_hints: Vec<Vec<HopHint>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopInResponse {
    pub id: String,
    pub htlc_address_p2wsh: String,
    pub htlc_address_np2wsh: Option<String>,
    pub server_message: Option<String>,
}

/// A quoted swap, ready to be dispatched unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopInPlan {
    pub request: QuoteRequest,
    pub quote: InQuote,
    pub limits: LoopInLimits,
    pub label: String,
}

impl LoopInPlan {
    fn to_request(&self) -> LoopInRequest {
        LoopInRequest {
            amount_sat: self.request.amount_sat,
            max_miner_fee_sat: self.limits.max_miner_fee_sat,
            max_swap_fee_sat: self.limits.max_swap_fee_sat,
            external_htlc: self.request.external_htlc,
            htlc_conf_target: self.request.conf_target,
            label: self.label.clone(),
            initiator: DEFAULT_INITIATOR.to_string(),
            last_hop: self.request.last_hop,
            route_hints: self.request.route_hints.clone(),
        }
    }
}

impl fmt::Display for LoopInPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loop in {} sat: swap fee {} sat, max miner fee {} sat, cltv delta {}, {} route hints",
            self.request.amount_sat,
            self.quote.swap_fee_sat,
            self.limits.max_miner_fee_sat,
            self.quote.cltv_delta,
            self.request.route_hints.len()
        )?;
        if let Some(hop) = &self.request.last_hop {
            write!(f, ", last hop {}", hop)?;
        }
        Ok(())
    }
}

pub struct LoopInPlanner {
    swap_server: Arc<dyn SwapServer>,
    hints: HopHintSelector,
    max_hints: usize,
    dry_run: bool,
}

impl LoopInPlanner {
    pub fn new(swap_server: Arc<dyn SwapServer>, hints: HopHintSelector) -> Self {
        Self {
            swap_server,
            hints,
            max_hints: MAX_HOP_HINTS,
            dry_run: false,
        }
    }

    pub fn with_max_hints(mut self, max_hints: usize) -> Self {
        self.max_hints = max_hints.min(MAX_HOP_HINTS);
        self
    }

    /// Plan swaps without ever dispatching them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Validate `opts`, gather hints if needed and fetch a quote.
    pub async fn quote(&self, cancel: &CancelSignal, opts: &LoopInOptions) -> Result<LoopInPlan> {
        opts.validate()?;

        let route_hints = if opts.private {
            let include: Option<HashSet<NodeId>> =
                opts.last_hop.map(|hop| [hop].into_iter().collect());
            self.hints
                .select_hop_hints(
                    cancel,
                    opts.amount_sat.saturating_mul(1000),
                    self.max_hints,
                    include.as_ref(),
                )
                .await?
        } else {
            opts.route_hints.clone().unwrap_or_default()
        };

        if opts.private && route_hints.is_empty() {
            warn!("Private loop in requested but no usable hop hints were found");
        }

        let request = QuoteRequest {
            amount_sat: opts.amount_sat,
            conf_target: opts.htlc_conf_target.unwrap_or(0),
            external_htlc: opts.external_htlc,
            last_hop: opts.last_hop,
            route_hints,
            private: opts.private,
        };

        let quote = cancel
            .run("LoopInQuote", self.swap_server.loop_in_quote(&request))
            .await?;

        // Our wallet could not fund a sample htlc, so it cannot fund the real one.
        if !opts.external_htlc && quote.htlc_publish_fee_sat == MINER_FEE_ESTIMATION_FAILED {
            return Err(Error::MinerFeeEstimationFailed {
                amount_sat: opts.amount_sat,
            });
        }

        let limits = LoopInLimits::from_quote(&quote);
        Ok(LoopInPlan {
            request,
            quote,
            limits,
            label: opts.label.clone(),
        })
    }

    /// Hand a quoted plan to the swap server. Returns `None` in dry-run mode.
    pub async fn dispatch(
        &self,
        cancel: &CancelSignal,
        plan: &LoopInPlan,
    ) -> Result<Option<LoopInResponse>> {
        if self.dry_run {
            info!("[DRY RUN] Would dispatch {}", plan);
            return Ok(None);
        }

        let request = plan.to_request();
        let response = cancel
            .run("LoopIn", self.swap_server.loop_in(&request))
            .await?;

        info!("Loop in {} initiated: {}", response.id, plan);
        if let Some(message) = &response.server_message {
            info!("Server message for {}: {}", response.id, message);
        }
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockNode, MockSwapServer};
    use crate::state::fixtures::{channel, node};

    struct Harness {
        node: Arc<MockNode>,
        server: Arc<MockSwapServer>,
        planner: LoopInPlanner,
    }

    fn harness() -> Harness {
        let node = Arc::new(MockNode::new());
        let server = Arc::new(MockSwapServer::new());
        let planner = LoopInPlanner::new(server.clone(), HopHintSelector::new(node.clone()));
        Harness {
            node,
            server,
            planner,
        }
    }

    #[test]
    fn test_label_rules() {
        assert!(validate_label("").is_ok());
        assert!(validate_label(&"x".repeat(500)).is_ok());
        assert_eq!(
            validate_label(&"x".repeat(501)),
            Err(ValidationError::LabelTooLong { length: 501, max: 500 })
        );
        assert!(matches!(
            validate_label("[reserved] autoloop"),
            Err(ValidationError::ReservedLabel(_))
        ));
        assert!(validate_label("not [reserved]").is_ok());
    }

    #[test]
    fn test_label_length_counts_bytes() {
        // 300 chars but 600 bytes.
        let label = "é".repeat(300);
        assert_eq!(
            validate_label(&label),
            Err(ValidationError::LabelTooLong { length: 600, max: 500 })
        );
        assert!(validate_label(&"é".repeat(250)).is_ok());
    }

    #[test]
    fn test_option_conflicts() {
        let mut opts = LoopInOptions::new(100_000);
        opts.external_htlc = true;
        opts.htlc_conf_target = Some(6);
        assert_eq!(opts.validate(), Err(ValidationError::ExternalWithConfTarget));

        let mut opts = LoopInOptions::new(100_000);
        opts.private = true;
        opts.route_hints = Some(vec![]);
        assert_eq!(opts.validate(), Err(ValidationError::PrivateWithRouteHints));

        assert_eq!(LoopInOptions::new(0).validate(), Err(ValidationError::ZeroAmount));
    }

    #[test]
    fn test_limits_from_quote() {
        let quote = InQuote {
            swap_fee_sat: 120,
            htlc_publish_fee_sat: 500,
            cltv_delta: 40,
            conf_target: 6,
        };
        assert_eq!(
            LoopInLimits::from_quote(&quote),
            LoopInLimits {
                max_miner_fee_sat: 1_500,
                max_swap_fee_sat: 120,
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_options_contact_nothing() {
        let h = harness();
        let mut opts = LoopInOptions::new(100_000);
        opts.label = "[reserved]".to_string();
        let err = h.planner.quote(&CancelSignal::never(), &opts).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::ReservedLabel(_))));
        assert_eq!(h.server.calls(), 0);
        assert_eq!(h.node.calls(), 0);
    }

    #[tokio::test]
    async fn test_private_quote_carries_hints_for_last_hop() {
        let h = harness();
        h.node.set_channels_with_edges(vec![
            channel(1, node(1), 0, 500_000_000),
            channel(2, node(2), 0, 500_000_000),
        ]);

        let mut opts = LoopInOptions::new(100_000);
        opts.private = true;
        opts.last_hop = Some(node(2));
        let plan = h.planner.quote(&CancelSignal::never(), &opts).await.unwrap();

        let quoted = h.server.quote_requests();
        assert_eq!(quoted.len(), 1);
        assert!(quoted[0].private);
        assert_eq!(quoted[0].route_hints.len(), 1);
        assert_eq!(quoted[0].route_hints[0][0].node_id, node(2));
        assert_eq!(plan.request, quoted[0]);
    }

    #[tokio::test]
    async fn test_failed_fee_estimate_rejected_unless_external() {
        let h = harness();
        h.server.set_quote(InQuote {
            swap_fee_sat: 100,
            htlc_publish_fee_sat: MINER_FEE_ESTIMATION_FAILED,
            cltv_delta: 40,
            conf_target: 6,
        });

        let err = h
            .planner
            .quote(&CancelSignal::never(), &LoopInOptions::new(100_000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MinerFeeEstimationFailed { amount_sat: 100_000 }
        ));

        let mut opts = LoopInOptions::new(100_000);
        opts.external_htlc = true;
        let plan = h.planner.quote(&CancelSignal::never(), &opts).await.unwrap();
        assert_eq!(plan.limits.max_miner_fee_sat, 0);
    }

    #[tokio::test]
    async fn test_dispatch_forwards_plan() {
        let h = harness();
        let mut opts = LoopInOptions::new(250_000);
        opts.label = "refill".to_string();
        opts.last_hop = Some(node(3));
        opts.htlc_conf_target = Some(6);
        let cancel = CancelSignal::never();

        let plan = h.planner.quote(&cancel, &opts).await.unwrap();
        let response = h.planner.dispatch(&cancel, &plan).await.unwrap().unwrap();
        assert!(!response.id.is_empty());

        let sent = h.server.loop_in_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].amount_sat, 250_000);
        assert_eq!(sent[0].label, "refill");
        assert_eq!(sent[0].initiator, DEFAULT_INITIATOR);
        assert_eq!(sent[0].last_hop, Some(node(3)));
        assert_eq!(sent[0].htlc_conf_target, 6);
        assert_eq!(sent[0].max_swap_fee_sat, plan.quote.swap_fee_sat);
    }

    #[tokio::test]
    async fn test_dry_run_skips_dispatch() {
        let h = harness();
        let planner = h.planner.with_dry_run(true);
        let cancel = CancelSignal::never();
        let plan = planner.quote(&cancel, &LoopInOptions::new(100_000)).await.unwrap();
        assert!(planner.dispatch(&cancel, &plan).await.unwrap().is_none());
        assert!(h.server.loop_in_requests().is_empty());
    }
}
