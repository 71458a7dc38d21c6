//! Route hint selection for invoices paid to a node with private channels.
//!
//! Hints are added in two passes. The first takes every qualifying channel
//! whose inbound liquidity alone could carry the payment. If that leaves room,
//! the second tops up with further channels until the hinted inbound
//! bandwidth exceeds twice the amount, which leaves a margin for channels that
//! turn out to be unusable when the payment arrives.
//!
//! A channel only qualifies when its counterparty is already visible through
//! one of our public channels, so a hint never reveals a peer that intends to
//! stay unadvertised.

use log::{debug, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::client::NodeBackend;
use crate::error::{Error, Result};
use crate::state::{public_peers, ChannelSnapshot, NodeId, ShortChannelId};

/// Upper bound on hints a single invoice carries.
pub const MAX_HOP_HINTS: usize = 20;

/// Stop topping up once hinted bandwidth exceeds this multiple of the amount.
const HOP_HINT_BANDWIDTH_FACTOR: u64 = 2;

/// Routing information for the final hop towards us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopHint {
    pub node_id: NodeId,
    pub channel_id: ShortChannelId,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

impl fmt::Display for HopHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} (base {} msat, {} ppm, cltv delta {})",
            self.node_id,
            self.channel_id,
            self.fee_base_msat,
            self.fee_proportional_millionths,
            self.cltv_expiry_delta
        )
    }
}

/// Stateless selector; safe to share and to run concurrently.
#[derive(Clone)]
pub struct HopHintSelector {
    node: Arc<dyn NodeBackend>,
}

impl HopHintSelector {
    pub fn new(node: Arc<dyn NodeBackend>) -> Self {
        Self { node }
    }

    /// Select at most `max_hints` hint groups for an invoice of
    /// `amount_msat`. With `include_nodes` set, only channels with those
    /// peers are considered.
    pub async fn select_hop_hints(
        &self,
        cancel: &CancelSignal,
        amount_msat: u64,
        max_hints: usize,
        include_nodes: Option<&HashSet<NodeId>>,
    ) -> Result<Vec<Vec<HopHint>>> {
        let channels = cancel
            .run("ListChannels", self.node.list_channels())
            .await?;

        select_from_channels(
            self.node.as_ref(),
            cancel,
            &channels,
            amount_msat,
            max_hints,
            include_nodes,
        )
        .await
    }
}

/// Two-pass greedy selection over an explicit channel snapshot. Graph edges
/// are looked up through `graph`, one call per candidate channel.
pub async fn select_from_channels(
    graph: &dyn NodeBackend,
    cancel: &CancelSignal,
    channels: &[ChannelSnapshot],
    amount_msat: u64,
    max_hints: usize,
    include_nodes: Option<&HashSet<NodeId>>,
) -> Result<Vec<Vec<HopHint>>> {
    let public = public_peers(channels);
    let mut hints: Vec<Vec<HopHint>> = Vec::with_capacity(max_hints);
    let mut selected: HashSet<ShortChannelId> = HashSet::new();
    let mut bandwidth_msat: u64 = 0;

    for channel in channels {
        if hints.len() >= max_hints {
            break;
        }

        // This pass only takes channels that could carry the payment alone.
        if channel.remote_balance_msat < amount_msat {
            continue;
        }

        let Some(peer) = screen(channel, &public, include_nodes) else {
            continue;
        };

        // TODO: cache edge lookups across invoices, this is one round trip per channel.
        let Some(hint) = hint_for(graph, cancel, channel, peer).await? else {
            continue;
        };

        hints.push(vec![hint]);
        selected.insert(channel.channel_id);
        bandwidth_msat = bandwidth_msat.saturating_add(channel.remote_balance_msat);
    }

    if hints.len() >= max_hints {
        return Ok(hints);
    }

    let target_msat = amount_msat.saturating_mul(HOP_HINT_BANDWIDTH_FACTOR);
    for channel in channels {
        if bandwidth_msat > target_msat || hints.len() >= max_hints {
            break;
        }

        if selected.contains(&channel.channel_id) {
            continue;
        }

        let Some(peer) = screen(channel, &public, include_nodes) else {
            continue;
        };

        // Best effort from here on: keep what we have on any failure.
        let hint = match hint_for(graph, cancel, channel, peer).await {
            Ok(Some(hint)) => hint,
            Ok(None) => continue,
            Err(Error::Cancelled(_)) => {
                warn!(
                    "Hop hint selection cancelled, returning {} hints collected so far",
                    hints.len()
                );
                break;
            }
            Err(e) => {
                warn!("Skipping channel {} as hop hint: {}", channel.channel_id, e);
                continue;
            }
        };

        hints.push(vec![hint]);
        selected.insert(channel.channel_id);
        bandwidth_msat = bandwidth_msat.saturating_add(channel.remote_balance_msat);
    }

    debug!(
        "Selected {} hop hints for {} msat, {} msat hinted bandwidth",
        hints.len(),
        amount_msat,
        bandwidth_msat
    );

    Ok(hints)
}

/// Privacy and restriction checks that need no network access. Returns the
/// resolved counterparty when the channel may be hinted.
fn screen(
    channel: &ChannelSnapshot,
    public: &HashSet<&str>,
    include_nodes: Option<&HashSet<NodeId>>,
) -> Option<NodeId> {
    if !public.contains(channel.counterparty_node_id.as_str()) {
        debug!(
            "Skipping channel {} due to counterparty {} being unadvertised",
            channel.channel_id, channel.counterparty_node_id
        );
        return None;
    }

    let peer = match channel.counterparty_node_id.parse::<NodeId>() {
        Ok(peer) => peer,
        Err(e) => {
            warn!(
                "Skipping channel {}, cannot resolve counterparty: {:#}",
                channel.channel_id, e
            );
            return None;
        }
    };

    if let Some(include) = include_nodes {
        if !include.contains(&peer) {
            return None;
        }
    }

    Some(peer)
}

/// Build a hint from the policy the counterparty advertises for this channel.
async fn hint_for(
    graph: &dyn NodeBackend,
    cancel: &CancelSignal,
    channel: &ChannelSnapshot,
    peer: NodeId,
) -> Result<Option<HopHint>> {
    let edge = cancel
        .run("GetChanInfo", graph.get_chan_info(channel.channel_id))
        .await?;

    let Some(policy) = edge.policy_of(&peer) else {
        debug!(
            "Skipping channel {}, no routing policy advertised by {}",
            channel.channel_id, peer
        );
        return Ok(None);
    };

    Ok(Some(HopHint {
        node_id: peer,
        channel_id: channel.channel_id,
        fee_base_msat: policy.fee_base_msat,
        fee_proportional_millionths: policy.fee_rate_milli_msat,
        cltv_expiry_delta: policy.time_lock_delta,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockNode;
    use crate::state::fixtures::{channel, node};
    use crate::state::RoutingPolicy;
    use proptest::prelude::*;
    use tokio::sync::watch;

    fn selector(mock: &Arc<MockNode>) -> HopHintSelector {
        HopHintSelector::new(mock.clone())
    }

    fn hinted(hints: &[Vec<HopHint>]) -> Vec<u64> {
        hints.iter().map(|group| group[0].channel_id.to_u64()).collect()
    }

    async fn select(
        mock: &Arc<MockNode>,
        amount_msat: u64,
        max_hints: usize,
    ) -> Result<Vec<Vec<HopHint>>> {
        selector(mock)
            .select_hop_hints(&CancelSignal::never(), amount_msat, max_hints, None)
            .await
    }

    #[tokio::test]
    async fn test_phase_one_takes_only_channels_covering_amount() {
        let mock = Arc::new(MockNode::new());
        mock.set_channels_with_edges(vec![
            channel(1, node(1), 0, 150_000),
            channel(2, node(2), 0, 80_000),
        ]);

        let hints = select(&mock, 100_000, 1).await.unwrap();
        assert_eq!(hinted(&hints), vec![1]);
    }

    #[tokio::test]
    async fn test_phase_two_tops_up_bandwidth() {
        let mock = Arc::new(MockNode::new());
        mock.set_channels_with_edges(vec![
            channel(1, node(1), 0, 80_000),
            channel(2, node(2), 0, 150_000),
            channel(3, node(3), 0, 30_000),
        ]);

        // Phase 1 takes 2 (150k), phase 2 adds 1 (230k > 200k) and stops.
        let hints = select(&mock, 100_000, 20).await.unwrap();
        assert_eq!(hinted(&hints), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_phase_two_skipped_when_bandwidth_already_covered() {
        let mock = Arc::new(MockNode::new());
        mock.set_channels_with_edges(vec![
            channel(1, node(1), 0, 250_000),
            channel(2, node(2), 0, 50_000),
        ]);

        let hints = select(&mock, 100_000, 20).await.unwrap();
        assert_eq!(hinted(&hints), vec![1]);
    }

    #[tokio::test]
    async fn test_unadvertised_peer_never_hinted() {
        let mock = Arc::new(MockNode::new());
        let mut hidden = channel(1, node(1), 0, 500_000);
        hidden.private = true;
        let mut private_but_known = channel(2, node(2), 0, 150_000);
        private_but_known.private = true;
        mock.set_channels_with_edges(vec![
            hidden,
            private_but_known,
            channel(3, node(2), 0, 0),
        ]);

        let hints = select(&mock, 100_000, 20).await.unwrap();
        assert_eq!(hinted(&hints), vec![2, 3]);
        assert!(hints.iter().all(|g| g[0].node_id == node(2)));
    }

    #[tokio::test]
    async fn test_include_nodes_restricts_peers() {
        let mock = Arc::new(MockNode::new());
        mock.set_channels_with_edges(vec![
            channel(1, node(1), 0, 500_000),
            channel(2, node(2), 0, 500_000),
        ]);

        let include: HashSet<NodeId> = [node(2)].into_iter().collect();
        let hints = selector(&mock)
            .select_hop_hints(&CancelSignal::never(), 100_000, 20, Some(&include))
            .await
            .unwrap();
        assert_eq!(hinted(&hints), vec![2]);
    }

    #[tokio::test]
    async fn test_uses_counterparty_side_policy() {
        let mock = Arc::new(MockNode::new());
        let ch = channel(1, node(1), 0, 500_000);
        mock.set_channels(vec![ch.clone()]);
        let ours = RoutingPolicy { fee_base_msat: 1, fee_rate_milli_msat: 1, time_lock_delta: 18 };
        let theirs = RoutingPolicy { fee_base_msat: 1000, fee_rate_milli_msat: 250, time_lock_delta: 144 };
        // Counterparty is node2 of the edge.
        mock.set_edge(crate::state::ChannelEdge {
            channel_id: ch.channel_id,
            node1: node(0),
            node2: node(1),
            node1_policy: Some(ours),
            node2_policy: Some(theirs),
        });

        let hints = select(&mock, 100_000, 20).await.unwrap();
        assert_eq!(
            hints,
            vec![vec![HopHint {
                node_id: node(1),
                channel_id: ch.channel_id,
                fee_base_msat: 1000,
                fee_proportional_millionths: 250,
                cltv_expiry_delta: 144,
            }]]
        );
    }

    #[tokio::test]
    async fn test_missing_policy_skips_channel() {
        let mock = Arc::new(MockNode::new());
        mock.set_channels_with_edges(vec![
            channel(1, node(1), 0, 500_000),
            channel(2, node(2), 0, 500_000),
        ]);
        mock.clear_policies(ShortChannelId::from_u64(1));

        let hints = select(&mock, 100_000, 20).await.unwrap();
        assert_eq!(hinted(&hints), vec![2]);
    }

    #[tokio::test]
    async fn test_listing_failure_is_an_error() {
        let mock = Arc::new(MockNode::new());
        mock.set_list_error("node offline");
        let err = select(&mock, 100_000, 20).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { call: "ListChannels", .. }));
    }

    #[tokio::test]
    async fn test_phase_one_edge_failure_is_an_error() {
        let mock = Arc::new(MockNode::new());
        mock.set_channels_with_edges(vec![channel(1, node(1), 0, 500_000)]);
        mock.fail_edge(ShortChannelId::from_u64(1));
        let err = select(&mock, 100_000, 20).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { call: "GetChanInfo", .. }));
    }

    #[tokio::test]
    async fn test_phase_two_edge_failure_is_skipped() {
        let mock = Arc::new(MockNode::new());
        mock.set_channels_with_edges(vec![
            channel(1, node(1), 0, 150_000),
            channel(2, node(2), 0, 10_000),
            channel(3, node(3), 0, 10_000),
        ]);
        mock.fail_edge(ShortChannelId::from_u64(2));

        let hints = select(&mock, 100_000, 20).await.unwrap();
        assert_eq!(hinted(&hints), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_malformed_node_id_skipped_in_both_phases() {
        let mock = Arc::new(MockNode::new());
        // Channel 1 is big enough for Phase 1, channel 3 is only reached in
        // Phase 2. Channel 2 leaves the bandwidth target unmet so Phase 2 runs.
        let mut big_bad = channel(1, node(1), 0, 500_000);
        big_bad.counterparty_node_id = "not-a-key".to_string();
        let mut small_bad = channel(3, node(3), 0, 50_000);
        small_bad.counterparty_node_id = "zz".to_string();
        mock.set_channels_with_edges(vec![
            big_bad,
            channel(2, node(2), 0, 150_000),
            small_bad,
            channel(4, node(4), 0, 10_000),
        ]);

        let hints = select(&mock, 100_000, 20).await.unwrap();
        assert_eq!(hinted(&hints), vec![2, 4]);
        // Only the two good channels ever reach the graph.
        assert_eq!(mock.edge_calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_max_hints() {
        let mock = Arc::new(MockNode::new());
        mock.set_channels_with_edges(vec![channel(1, node(1), 0, 500_000)]);
        let hints = select(&mock, 100_000, 0).await.unwrap();
        assert!(hints.is_empty());
        assert_eq!(mock.edge_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_listing_is_an_error() {
        let mock = Arc::new(MockNode::new());
        mock.set_channels_with_edges(vec![channel(1, node(1), 0, 500_000)]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let err = selector(&mock)
            .select_hop_hints(&CancelSignal::from_watch(rx), 100_000, 20, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled("ListChannels")));
    }

    #[tokio::test]
    async fn test_cancelled_in_phase_two_keeps_collected_hints() {
        let mock = Arc::new(MockNode::new());
        let channels = vec![
            channel(1, node(1), 0, 150_000),
            channel(2, node(2), 0, 10_000),
        ];
        mock.set_channels_with_edges(channels.clone());

        let (tx, rx) = watch::channel(false);
        let cancel = CancelSignal::from_watch(rx);
        // Fire the signal after the first edge lookup.
        mock.cancel_after_edge_calls(1, tx);

        let hints = select_from_channels(mock.as_ref(), &cancel, &channels, 100_000, 20, None)
            .await
            .unwrap();
        assert_eq!(hinted(&hints), vec![1]);
    }

    fn arb_channels() -> impl Strategy<Value = Vec<(u8, bool, u64)>> {
        prop::collection::vec((1u8..6, any::<bool>(), 0u64..300_000), 0..12)
    }

    proptest! {
        #[test]
        fn prop_hints_private_bounded_and_margin_respected(
            layout in arb_channels(),
            amount_msat in 1u64..200_000,
            max_hints in 0usize..8,
        ) {
            let channels: Vec<ChannelSnapshot> = layout
                .iter()
                .enumerate()
                .map(|(i, (peer, private, remote))| {
                    let mut c = channel(i as u64 + 1, node(*peer), 0, *remote);
                    c.private = *private;
                    c
                })
                .collect();

            let mock = MockNode::new();
            mock.set_channels_with_edges(channels.clone());

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let hints = rt
                .block_on(select_from_channels(
                    &mock,
                    &CancelSignal::never(),
                    &channels,
                    amount_msat,
                    max_hints,
                    None,
                ))
                .unwrap();

            prop_assert!(hints.len() <= max_hints);

            let public = public_peers(&channels);
            let mut seen = HashSet::new();
            let mut bandwidth = 0u64;
            for group in &hints {
                let hint = &group[0];
                prop_assert!(public.contains(hint.node_id.to_string().as_str()));
                prop_assert!(seen.insert(hint.channel_id));

                let remote = channels
                    .iter()
                    .find(|c| c.channel_id == hint.channel_id)
                    .unwrap()
                    .remote_balance_msat;
                // Top-up hints are only added while under the margin.
                if remote < amount_msat {
                    prop_assert!(bandwidth <= amount_msat * 2);
                }
                bandwidth += remote;
            }
        }
    }
}
