//! Works out which channels are free to be suggested for a new swap.
//!
//! Channels already carrying a pending swap are skipped, as are channels that
//! recently took part in a loop out whose off-chain payment failed. A pending
//! swap with no channel restriction (a loop out without outgoing channels, or a
//! loop in without a last hop) can shift the balance of any channel, so while
//! one is in flight nothing is eligible at all.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, HashSet};

use crate::state::{ChannelSnapshot, NodeId, ShortChannelId};
use crate::swaps::{LoopInRecord, LoopOutRecord, SwapState, SwapStateType};

/// Channels and peers ruled out by the current swap history.
#[derive(Debug, Default)]
pub struct SwapExclusions {
    recently_failed: HashMap<ShortChannelId, DateTime<Utc>>,
    loop_out_channels: HashSet<ShortChannelId>,
    loop_in_peers: HashSet<NodeId>,
}

impl SwapExclusions {
    /// Build the exclusion set from swap history. Returns `None` when an
    /// unrestricted swap is pending and no channel may be suggested.
    pub fn from_swaps(
        loop_out: &[LoopOutRecord],
        loop_in: &[LoopInRecord],
        failure_cutoff: DateTime<Utc>,
    ) -> Option<Self> {
        let mut exclusions = Self::default();

        for out in loop_out {
            // Back off from every channel in the set, even though the
            // failure may have been caused by only one of them.
            if out.state == SwapState::FailOffchainPayments && out.last_update > failure_cutoff {
                for channel in &out.outgoing_chan_set {
                    exclusions.recently_failed.insert(*channel, out.last_update);
                }
            }

            // Temporary failures count as pending, they may be re-dispatched.
            if out.state.state_type() != SwapStateType::Pending {
                continue;
            }

            if out.outgoing_chan_set.is_empty() {
                debug!(
                    "Ongoing unrestricted loop out: {}, no suggestions at present",
                    out.swap_hash
                );
                return None;
            }

            exclusions
                .loop_out_channels
                .extend(out.outgoing_chan_set.iter().copied());
        }

        for swap in loop_in {
            if swap.state.state_type() != SwapStateType::Pending {
                continue;
            }

            match swap.last_hop {
                Some(peer) => {
                    exclusions.loop_in_peers.insert(peer);
                }
                None => {
                    debug!(
                        "Ongoing unrestricted loop in: {}, no suggestions at present",
                        swap.swap_hash
                    );
                    return None;
                }
            }
        }

        Some(exclusions)
    }

    /// Keep the channels not touched by any exclusion, in the order given.
    pub fn filter(&self, channels: Vec<ChannelSnapshot>) -> Vec<ChannelSnapshot> {
        channels
            .into_iter()
            .filter(|channel| self.is_eligible(channel))
            .collect()
    }

    fn is_eligible(&self, channel: &ChannelSnapshot) -> bool {
        if let Some(failed_at) = self.recently_failed.get(&channel.channel_id) {
            debug!(
                "Channel: {} not eligible for suggestions, was part of a failed swap at: {}",
                channel.channel_id, failed_at
            );
            return false;
        }

        if self.loop_out_channels.contains(&channel.channel_id) {
            debug!(
                "Channel: {} not eligible for suggestions, ongoing loop out utilizing channel",
                channel.channel_id
            );
            return false;
        }

        let peer_in_use = channel
            .counterparty_node_id
            .parse::<NodeId>()
            .map(|peer| self.loop_in_peers.contains(&peer))
            .unwrap_or(false);
        if peer_in_use {
            debug!(
                "Channel: {} not eligible for suggestions, ongoing loop in utilizing peer",
                channel.channel_id
            );
            return false;
        }

        true
    }
}
