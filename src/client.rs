use anyhow::Context;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use hex::DisplayHex;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::{NodeConfig, SwapServerConfig};
use crate::hophints::HopHint;
use crate::liquidity::Restrictions;
use crate::loop_in::{InQuote, LoopInRequest, LoopInResponse, QuoteRequest};
use crate::state::{ChannelEdge, ChannelSnapshot, NodeId, RoutingPolicy, SatPerKWeight, ShortChannelId};

/// Lightning node calls the liquidity manager and hint selection depend on.
///
/// Implemented over lnd's REST gateway, and by a mock for tests.
#[async_trait::async_trait]
pub trait NodeBackend: Send + Sync {
    /// Fee rate needed to confirm within `conf_target` blocks.
    async fn estimate_fee(&self, conf_target: u32) -> anyhow::Result<SatPerKWeight>;
    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelSnapshot>>;
    async fn get_chan_info(&self, channel_id: ShortChannelId) -> anyhow::Result<ChannelEdge>;
}

/// Swap server calls, reached through the local swap client daemon.
#[async_trait::async_trait]
pub trait SwapServer: Send + Sync {
    async fn loop_out_restrictions(&self) -> anyhow::Result<Restrictions>;
    async fn loop_in_quote(&self, request: &QuoteRequest) -> anyhow::Result<InQuote>;
    async fn loop_in(&self, request: &LoopInRequest) -> anyhow::Result<LoopInResponse>;
}

const MAX_CONCURRENT_REQUESTS: usize = 4;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Authenticated, concurrency-bounded REST transport. Failures are returned
/// to the caller as they happen; nothing is retried here.
struct RestTransport {
    http: reqwest::Client,
    base_url: String,
    macaroon_hex: String,
    rate_limiter: Arc<Semaphore>,
}

impl RestTransport {
    fn new(base_url: &str, tls_cert_path: &Path, macaroon_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read(tls_cert_path).with_context(|| {
            format!("Failed to read TLS cert at {}", tls_cert_path.display())
        })?;
        let cert = reqwest::Certificate::from_pem(&cert_pem)
            .with_context(|| format!("Invalid TLS cert at {}", tls_cert_path.display()))?;

        let macaroon = std::fs::read(macaroon_path).with_context(|| {
            format!("Failed to read macaroon at {}", macaroon_path.display())
        })?;

        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            macaroon_hex: macaroon.as_slice().as_hex().to_string(),
            rate_limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS)),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        name: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        let request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query);
        self.send(name, request).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        name: &str,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        self.send(name, request).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        name: &str,
        request: reqwest::RequestBuilder,
    ) -> anyhow::Result<T> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("Rate limiter semaphore closed"))?;

        let response = request
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .send()
            .await
            .with_context(|| format!("{}: request failed", name))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{}: HTTP {}: {}", name, status, body);
        }

        let parsed = response
            .json::<T>()
            .await
            .with_context(|| format!("{}: malformed response", name))?;
        debug!("{}: success", name);
        Ok(parsed)
    }
}

/// The REST gateways encode 64-bit integers as JSON strings.
fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct LndChannels {
    #[serde(default)]
    channels: Vec<LndChannel>,
}

#[derive(Debug, Deserialize)]
struct LndChannel {
    #[serde(default)]
    active: bool,
    remote_pubkey: String,
    #[serde(deserialize_with = "de_u64")]
    chan_id: u64,
    #[serde(default, deserialize_with = "de_u64")]
    capacity: u64,
    #[serde(default, deserialize_with = "de_u64")]
    local_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    remote_balance: u64,
    #[serde(default)]
    private: bool,
}

impl From<LndChannel> for ChannelSnapshot {
    fn from(c: LndChannel) -> Self {
        ChannelSnapshot {
            channel_id: ShortChannelId::from_u64(c.chan_id),
            counterparty_node_id: c.remote_pubkey,
            local_balance_msat: c.local_balance.saturating_mul(1000),
            remote_balance_msat: c.remote_balance.saturating_mul(1000),
            capacity_sats: c.capacity,
            private: c.private,
            active: c.active,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LndEdge {
    #[serde(deserialize_with = "de_u64")]
    channel_id: u64,
    node1_pub: String,
    node2_pub: String,
    node1_policy: Option<LndPolicy>,
    node2_policy: Option<LndPolicy>,
}

#[derive(Debug, Deserialize)]
struct LndPolicy {
    #[serde(default)]
    time_lock_delta: u16,
    #[serde(default, deserialize_with = "de_u64")]
    fee_base_msat: u64,
    #[serde(default, deserialize_with = "de_u64")]
    fee_rate_milli_msat: u64,
    #[serde(default)]
    disabled: bool,
}

impl LndPolicy {
    fn into_policy(self) -> anyhow::Result<RoutingPolicy> {
        Ok(RoutingPolicy {
            fee_base_msat: u32::try_from(self.fee_base_msat).context("fee_base_msat out of range")?,
            fee_rate_milli_msat: u32::try_from(self.fee_rate_milli_msat)
                .context("fee_rate_milli_msat out of range")?,
            time_lock_delta: self.time_lock_delta,
        })
    }
}

impl TryFrom<LndEdge> for ChannelEdge {
    type Error = anyhow::Error;

    fn try_from(e: LndEdge) -> anyhow::Result<Self> {
        // A disabled policy is as good as none for routing towards us.
        let policy = |p: Option<LndPolicy>| -> anyhow::Result<Option<RoutingPolicy>> {
            p.filter(|p| !p.disabled).map(LndPolicy::into_policy).transpose()
        };

        Ok(ChannelEdge {
            channel_id: ShortChannelId::from_u64(e.channel_id),
            node1: e.node1_pub.parse().context("Invalid node1_pub")?,
            node2: e.node2_pub.parse().context("Invalid node2_pub")?,
            node1_policy: policy(e.node1_policy)?,
            node2_policy: policy(e.node2_policy)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct LndFeeEstimate {
    #[serde(deserialize_with = "de_u64")]
    sat_per_kw: u64,
}

/// lnd over its REST gateway.
pub struct LndRestClient {
    transport: RestTransport,
}

impl LndRestClient {
    pub fn new(config: &NodeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            transport: RestTransport::new(
                &config.rest_url,
                &config.tls_cert_path,
                &config.macaroon_path,
            )
            .context("Failed to create node client")?,
        })
    }
}

#[async_trait::async_trait]
impl NodeBackend for LndRestClient {
    async fn estimate_fee(&self, conf_target: u32) -> anyhow::Result<SatPerKWeight> {
        let resp: LndFeeEstimate = self
            .transport
            .get(
                "EstimateFee",
                &format!("/v2/wallet/estimatefee/{}", conf_target),
                &[],
            )
            .await?;
        Ok(SatPerKWeight(resp.sat_per_kw))
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelSnapshot>> {
        let resp: LndChannels = self.transport.get("ListChannels", "/v1/channels", &[]).await?;
        Ok(resp.channels.into_iter().map(ChannelSnapshot::from).collect())
    }

    async fn get_chan_info(&self, channel_id: ShortChannelId) -> anyhow::Result<ChannelEdge> {
        let resp: LndEdge = self
            .transport
            .get(
                "GetChanInfo",
                &format!("/v1/graph/edge/{}", channel_id.to_u64()),
                &[],
            )
            .await?;
        ChannelEdge::try_from(resp)
    }
}

#[derive(Debug, Deserialize)]
struct LoopOutTerms {
    #[serde(deserialize_with = "de_u64")]
    min_swap_amount: u64,
    #[serde(deserialize_with = "de_u64")]
    max_swap_amount: u64,
}

#[derive(Debug, Deserialize)]
struct LoopInQuoteResponse {
    #[serde(default, deserialize_with = "de_u64")]
    swap_fee_sat: u64,
    #[serde(default, deserialize_with = "de_i64")]
    htlc_publish_fee_sat: i64,
    #[serde(default)]
    cltv_delta: u32,
    #[serde(default)]
    conf_target: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct RestHopHint {
    node_id: String,
    #[serde(deserialize_with = "de_id_string")]
    chan_id: String,
    #[serde(default)]
    fee_base_msat: u32,
    #[serde(default)]
    fee_proportional_millionths: u32,
    #[serde(default)]
    cltv_expiry_delta: u16,
}

/// Channel ids show up both as JSON numbers and as strings.
fn de_id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n.to_string(),
        Raw::Str(s) => s,
    })
}

impl TryFrom<RestHopHint> for HopHint {
    type Error = anyhow::Error;

    fn try_from(h: RestHopHint) -> anyhow::Result<Self> {
        Ok(Self {
            node_id: parse_node_id(&h.node_id)?,
            channel_id: h
                .chan_id
                .parse::<ShortChannelId>()
                .with_context(|| format!("Invalid hint channel id: {}", h.chan_id))?,
            fee_base_msat: h.fee_base_msat,
            fee_proportional_millionths: h.fee_proportional_millionths,
            cltv_expiry_delta: h.cltv_expiry_delta,
        })
    }
}

impl From<&HopHint> for RestHopHint {
    fn from(h: &HopHint) -> Self {
        Self {
            node_id: h.node_id.to_string(),
            chan_id: h.channel_id.to_u64().to_string(),
            fee_base_msat: h.fee_base_msat,
            fee_proportional_millionths: h.fee_proportional_millionths,
            cltv_expiry_delta: h.cltv_expiry_delta,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RestRouteHint {
    hop_hints: Vec<RestHopHint>,
}

#[derive(Debug, Serialize)]
struct RestLoopInRequest {
    amt: String,
    max_swap_fee: String,
    max_miner_fee: String,
    external_htlc: bool,
    htlc_conf_target: u32,
    label: String,
    initiator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_hop: Option<String>,
    route_hints: Vec<RestRouteHint>,
}

impl From<&LoopInRequest> for RestLoopInRequest {
    fn from(r: &LoopInRequest) -> Self {
        Self {
            amt: r.amount_sat.to_string(),
            max_swap_fee: r.max_swap_fee_sat.to_string(),
            max_miner_fee: r.max_miner_fee_sat.to_string(),
            external_htlc: r.external_htlc,
            htlc_conf_target: r.htlc_conf_target,
            label: r.label.clone(),
            initiator: r.initiator.clone(),
            last_hop: r.last_hop.map(|hop| STANDARD.encode(hop.as_bytes())),
            route_hints: route_hints(&r.route_hints),
        }
    }
}

fn route_hints(hints: &[Vec<HopHint>]) -> Vec<RestRouteHint> {
    hints
        .iter()
        .map(|group| RestRouteHint {
            hop_hints: group.iter().map(RestHopHint::from).collect(),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RestLoopInResponse {
    id: String,
    #[serde(default)]
    htlc_address_p2wsh: String,
    #[serde(default)]
    htlc_address_np2wsh: String,
    #[serde(default)]
    server_message: String,
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// The swap client daemon over its REST gateway.
pub struct LoopdRestClient {
    transport: RestTransport,
}

impl LoopdRestClient {
    pub fn new(config: &SwapServerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            transport: RestTransport::new(
                &config.rest_url,
                &config.tls_cert_path,
                &config.macaroon_path,
            )
            .context("Failed to create swap client")?,
        })
    }
}

#[async_trait::async_trait]
impl SwapServer for LoopdRestClient {
    async fn loop_out_restrictions(&self) -> anyhow::Result<Restrictions> {
        let terms: LoopOutTerms = self
            .transport
            .get("LoopOutTerms", "/v1/loop/out/terms", &[])
            .await?;
        Restrictions::new(terms.min_swap_amount, terms.max_swap_amount)
    }

    async fn loop_in_quote(&self, request: &QuoteRequest) -> anyhow::Result<InQuote> {
        // Explicit hints cannot be expressed as query parameters; they travel
        // with the swap request instead.
        let mut query = vec![
            ("conf_target", request.conf_target.to_string()),
            ("external_htlc", request.external_htlc.to_string()),
            ("private", request.private.to_string()),
        ];
        if let Some(hop) = request.last_hop {
            query.push(("loop_in_last_hop", URL_SAFE.encode(hop.as_bytes())));
        }

        let resp: LoopInQuoteResponse = self
            .transport
            .get(
                "LoopInQuote",
                &format!("/v1/loop/in/quote/{}", request.amount_sat),
                &query,
            )
            .await?;

        Ok(InQuote {
            swap_fee_sat: resp.swap_fee_sat,
            htlc_publish_fee_sat: resp.htlc_publish_fee_sat,
            cltv_delta: resp.cltv_delta,
            conf_target: resp.conf_target,
        })
    }

    async fn loop_in(&self, request: &LoopInRequest) -> anyhow::Result<LoopInResponse> {
        let body = RestLoopInRequest::from(request);
        let resp: RestLoopInResponse = self.transport.post("LoopIn", "/v1/loop/in", &body).await?;

        Ok(LoopInResponse {
            id: resp.id,
            htlc_address_p2wsh: resp.htlc_address_p2wsh,
            htlc_address_np2wsh: non_empty(resp.htlc_address_np2wsh),
            server_message: non_empty(resp.server_message),
        })
    }
}

/// Parse a node id given on the command line or in config.
pub fn parse_node_id(s: &str) -> anyhow::Result<NodeId> {
    s.parse().with_context(|| format!("Invalid node id: {}", s))
}

/// Parse route hints given on the command line. The JSON has the same shape
/// as the `route_hints` field of a loop in request:
/// `[{"hop_hints": [{"node_id": "02..", "chan_id": "..", ...}]}]`.
pub fn parse_route_hints(json: &str) -> anyhow::Result<Vec<Vec<HopHint>>> {
    let raw: Vec<RestRouteHint> =
        serde_json::from_str(json).context("Route hints are not valid JSON")?;

    raw.into_iter()
        .enumerate()
        .map(|(i, route)| {
            if route.hop_hints.is_empty() {
                anyhow::bail!("Route hint {} has no hops", i);
            }
            route.hop_hints.into_iter().map(HopHint::try_from).collect()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Mock backends for integration testing
// ---------------------------------------------------------------------------
