use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hophints::MAX_HOP_HINTS;
use crate::liquidity::params::{DEFAULT_FAILURE_BACKOFF, DEFAULT_SWEEP_CONF_TARGET};
use crate::liquidity::{Parameters, ThresholdRule};
use crate::state::{SatPerKWeight, ShortChannelId};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub swap_server: SwapServerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub liquidity: LiquidityConfig,
    #[serde(default)]
    pub hop_hints: HopHintsConfig,
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    /// lnd REST endpoint, including scheme
    pub rest_url: String,
    /// Path to lnd's TLS certificate
    pub tls_cert_path: PathBuf,
    /// Macaroon sent with every request
    pub macaroon_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct SwapServerConfig {
    /// Swap client daemon REST endpoint, including scheme
    pub rest_url: String,
    pub tls_cert_path: PathBuf,
    pub macaroon_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// SQLite database holding the swap history
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Master enable/disable for the daemon loop
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Dry-run mode: log decisions but dispatch nothing
    #[serde(default)]
    pub dry_run: bool,
    /// Suggestion cycle interval in seconds
    #[serde(default = "default_loop_interval")]
    pub loop_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct LiquidityConfig {
    /// Seconds to back off from channels in a swap that failed off-chain
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff_secs: u64,
    /// No suggestions while sweeping costs more than this
    #[serde(default = "default_sweep_fee_rate")]
    pub sweep_fee_rate_sat_per_vbyte: u64,
    #[serde(default = "default_sweep_conf_target")]
    pub sweep_conf_target: u32,
    /// Lowest sweep confirmation target accepted
    #[serde(default = "default_minimum_confirmations")]
    pub minimum_confirmations: u32,
    /// Threshold rules keyed by short channel id ("block:tx:out" or integer)
    #[serde(default)]
    pub rules: HashMap<String, ThresholdRule>,
}

#[derive(Debug, Deserialize)]
pub struct HopHintsConfig {
    /// Maximum route hints attached to a private loop in
    #[serde(default = "default_max_hints")]
    pub max_hints: usize,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("loop.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_loop_interval() -> u64 {
    600
}
fn default_failure_backoff() -> u64 {
    DEFAULT_FAILURE_BACKOFF.as_secs()
}
fn default_sweep_fee_rate() -> u64 {
    3
}
fn default_sweep_conf_target() -> u32 {
    DEFAULT_SWEEP_CONF_TARGET
}
fn default_minimum_confirmations() -> u32 {
    2
}
fn default_max_hints() -> usize {
    MAX_HOP_HINTS
}

// Default implementations
impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            enabled: true,
            dry_run: false,
            loop_interval_secs: default_loop_interval(),
        }
    }
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            failure_backoff_secs: default_failure_backoff(),
            sweep_fee_rate_sat_per_vbyte: default_sweep_fee_rate(),
            sweep_conf_target: default_sweep_conf_target(),
            minimum_confirmations: default_minimum_confirmations(),
            rules: HashMap::new(),
        }
    }
}

impl Default for HopHintsConfig {
    fn default() -> Self {
        Self {
            max_hints: default_max_hints(),
        }
    }
}

impl LiquidityConfig {
    /// Manager parameters described by this section. Rule keys are parsed
    /// here; the parameters themselves are checked by the manager.
    pub fn parameters(&self) -> anyhow::Result<Parameters> {
        let mut channel_rules = HashMap::with_capacity(self.rules.len());
        for (key, rule) in &self.rules {
            let channel: ShortChannelId = key
                .parse()
                .with_context(|| format!("Invalid channel in [liquidity.rules]: {}", key))?;
            if channel_rules.insert(channel, *rule).is_some() {
                anyhow::bail!("Duplicate rule for channel {}", channel);
            }
        }

        Ok(Parameters {
            failure_backoff: Duration::from_secs(self.failure_backoff_secs),
            sweep_fee_rate_limit: SatPerKWeight::from_sat_per_vbyte(
                self.sweep_fee_rate_sat_per_vbyte,
            ),
            sweep_conf_target: self.sweep_conf_target,
            channel_rules,
        })
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Hard limits (non-configurable safety rails)
        const ABS_MIN_LOOP_INTERVAL_SECS: u64 = 10;

        if self.hop_hints.max_hints > MAX_HOP_HINTS {
            anyhow::bail!(
                "max_hints ({}) above absolute maximum ({})",
                self.hop_hints.max_hints,
                MAX_HOP_HINTS
            );
        }
        if self.general.loop_interval_secs < ABS_MIN_LOOP_INTERVAL_SECS {
            anyhow::bail!(
                "loop_interval_secs ({}) below absolute minimum ({})",
                self.general.loop_interval_secs,
                ABS_MIN_LOOP_INTERVAL_SECS
            );
        }

        self.liquidity
            .parameters()?
            .validate(self.liquidity.minimum_confirmations)
            .context("Invalid [liquidity] section")?;

        for (what, path) in [
            ("Node TLS cert", &self.node.tls_cert_path),
            ("Node macaroon", &self.node.macaroon_path),
            ("Swap server TLS cert", &self.swap_server.tls_cert_path),
            ("Swap server macaroon", &self.swap_server.macaroon_path),
        ] {
            if !path.exists() {
                anyhow::bail!("{} not found at: {}", what, path.display());
            }
        }
        Ok(())
    }

    /// Create a config with all defaults for testing purposes.
    /// Every credential path is set to `path` (must exist for validation).
    #[cfg(test)]
    pub fn test_default(path: PathBuf) -> Self {
        Self {
            node: NodeConfig {
                rest_url: "https://localhost:8080".to_string(),
                tls_cert_path: path.clone(),
                macaroon_path: path.clone(),
            },
            swap_server: SwapServerConfig {
                rest_url: "https://localhost:8081".to_string(),
                tls_cert_path: path.clone(),
                macaroon_path: path,
            },
            general: GeneralConfig::default(),
            liquidity: LiquidityConfig::default(),
            hop_hints: HopHintsConfig::default(),
        }
    }
}
