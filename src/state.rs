use hex::{DisplayHex, FromHex};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Compact channel identifier: funding block height, transaction index and
/// output index packed into 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ShortChannelId(u64);

impl ShortChannelId {
    pub fn new(block_height: u32, tx_index: u32, output_index: u16) -> Self {
        Self(
            ((block_height as u64 & 0xFF_FFFF) << 40)
                | ((tx_index as u64 & 0xFF_FFFF) << 16)
                | output_index as u64,
        )
    }

    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn block_height(self) -> u32 {
        (self.0 >> 40) as u32
    }

    pub fn tx_index(self) -> u32 {
        ((self.0 >> 16) & 0xFF_FFFF) as u32
    }

    pub fn output_index(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

/// Accepts the integer form (`770000123456`) as well as `block:tx:out` and
/// `blockxtxxout`.
impl FromStr for ShortChannelId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if let Ok(id) = s.parse::<u64>() {
            return Ok(Self(id));
        }

        let sep = if s.contains(':') { ':' } else { 'x' };
        let parts: Vec<&str> = s.split(sep).collect();
        if parts.len() != 3 {
            anyhow::bail!("malformed short channel id: {:?}", s);
        }

        let block: u32 = parts[0].parse()?;
        let tx: u32 = parts[1].parse()?;
        let out: u16 = parts[2].parse()?;
        if block > 0xFF_FFFF || tx > 0xFF_FFFF {
            anyhow::bail!("short channel id component out of range: {:?}", s);
        }

        Ok(Self::new(block, tx, out))
    }
}

/// A compressed secp256k1 public key identifying a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; 33]);

impl NodeId {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let arr: [u8; 33] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node id must be 33 bytes, got {}", bytes.len()))?;
        if arr[0] != 0x02 && arr[0] != 0x03 {
            anyhow::bail!("node id has invalid prefix byte {:#04x}", arr[0]);
        }
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_slice().as_hex())
    }
}

impl FromStr for NodeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let bytes = Vec::<u8>::from_hex(s.trim())
            .map_err(|e| anyhow::anyhow!("node id {:?} is not hex: {}", s, e))?;
        Self::from_bytes(&bytes)
    }
}

/// Fee rate in satoshis per 1000 weight units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SatPerKWeight(pub u64);

impl SatPerKWeight {
    /// Lowest fee rate a user may configure (1 sat/vByte).
    pub const ABSOLUTE_FLOOR: SatPerKWeight = SatPerKWeight(250);

    pub fn from_sat_per_vbyte(sat_per_vbyte: u64) -> Self {
        Self(sat_per_vbyte.saturating_mul(250))
    }

    pub fn sat_per_vbyte(self) -> u64 {
        self.0 * 4 / 1000
    }
}

impl fmt::Display for SatPerKWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/kw", self.0)
    }
}

/// One open channel as reported by the node, fetched fresh every cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelSnapshot {
    pub channel_id: ShortChannelId,
    /// Counterparty public key, hex-encoded as the node reports it.
    pub counterparty_node_id: String,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub capacity_sats: u64,
    pub private: bool,
    pub active: bool,
}

/// Forwarding policy one side of a channel advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingPolicy {
    pub fee_base_msat: u32,
    pub fee_rate_milli_msat: u32,
    pub time_lock_delta: u16,
}

/// Channel graph edge: both endpoints and the policy each one advertises.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEdge {
    pub channel_id: ShortChannelId,
    pub node1: NodeId,
    pub node2: NodeId,
    pub node1_policy: Option<RoutingPolicy>,
    pub node2_policy: Option<RoutingPolicy>,
}

impl ChannelEdge {
    /// Policy advertised by `peer`, i.e. the side that forwards HTLCs to us.
    pub fn policy_of(&self, peer: &NodeId) -> Option<RoutingPolicy> {
        if self.node1 == *peer {
            self.node1_policy
        } else if self.node2 == *peer {
            self.node2_policy
        } else {
            None
        }
    }
}

/// Counterparties we share at least one non-private channel with.
pub fn public_peers(channels: &[ChannelSnapshot]) -> HashSet<&str> {
    channels
        .iter()
        .filter(|c| !c.private)
        .map(|c| c.counterparty_node_id.as_str())
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Deterministic, well-formed node id derived from a single byte.
    pub fn node(n: u8) -> NodeId {
        let mut bytes = [n; 33];
        bytes[0] = 0x02;
        NodeId(bytes)
    }

    pub fn channel(id: u64, peer: NodeId, local_msat: u64, remote_msat: u64) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: ShortChannelId::from_u64(id),
            counterparty_node_id: peer.to_string(),
            local_balance_msat: local_msat,
            remote_balance_msat: remote_msat,
            capacity_sats: (local_msat + remote_msat) / 1000,
            private: false,
            active: true,
        }
    }
}
