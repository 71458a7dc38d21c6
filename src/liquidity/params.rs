use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::ValidationError;
use crate::liquidity::rule::ThresholdRule;
use crate::state::{SatPerKWeight, ShortChannelId};

/// Back off from channels in a recently failed swap for this long.
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// 750 sat/kw, 3 sat/vByte.
pub const DEFAULT_SWEEP_FEE_RATE_LIMIT: SatPerKWeight = SatPerKWeight(750);

pub const DEFAULT_SWEEP_CONF_TARGET: u32 = 100;

/// User-provided parameters guiding how liquidity is assessed.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    /// Time that must pass after a channel was part of a swap that failed
    /// off-chain before it is suggested again.
    pub failure_backoff: Duration,

    /// No swaps are suggested while the sweep fee estimate is above this.
    pub sweep_fee_rate_limit: SatPerKWeight,

    /// Blocks the sweep transaction should confirm within.
    pub sweep_conf_target: u32,

    pub channel_rules: HashMap<ShortChannelId, ThresholdRule>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            sweep_fee_rate_limit: DEFAULT_SWEEP_FEE_RATE_LIMIT,
            sweep_conf_target: DEFAULT_SWEEP_CONF_TARGET,
            channel_rules: HashMap::new(),
        }
    }
}

impl Parameters {
    /// Check every rule and global constraint; `min_confs` is the lowest
    /// sweep confirmation target we accept.
    pub fn validate(&self, min_confs: u32) -> Result<(), ValidationError> {
        for (channel, rule) in &self.channel_rules {
            if channel.is_zero() {
                return Err(ValidationError::ZeroChannelId);
            }
            rule.validate()
                .map_err(|reason| ValidationError::InvalidRule {
                    channel: *channel,
                    reason,
                })?;
        }

        // Absolute floor rather than the relay floor so 1 sat/vByte is allowed.
        if self.sweep_fee_rate_limit < SatPerKWeight::ABSOLUTE_FLOOR {
            return Err(ValidationError::SweepFeeRateTooLow {
                floor: SatPerKWeight::ABSOLUTE_FLOOR,
            });
        }

        if self.sweep_conf_target < min_confs {
            return Err(ValidationError::ConfTargetTooLow { minimum: min_confs });
        }

        Ok(())
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rules: Vec<_> = self.channel_rules.iter().collect();
        rules.sort_by_key(|(channel, _)| **channel);
        let rules: Vec<String> = rules
            .iter()
            .map(|(channel, rule)| format!("{}: {}", channel, rule))
            .collect();

        write!(
            f,
            "channel rules: [{}], failure backoff: {}s, sweep fee rate limit: {} sat/vByte, \
             sweep conf target: {}",
            rules.join(", "),
            self.failure_backoff.as_secs(),
            self.sweep_fee_rate_limit.sat_per_vbyte(),
            self.sweep_conf_target,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleError;

    fn chan(id: u64) -> ShortChannelId {
        ShortChannelId::from_u64(id)
    }

    #[test]
    fn test_defaults_valid() {
        assert!(Parameters::default().validate(2).is_ok());
        assert_eq!(Parameters::default().sweep_fee_rate_limit.sat_per_vbyte(), 3);
    }

    #[test]
    fn test_zero_channel_rejected() {
        let mut params = Parameters::default();
        params.channel_rules.insert(chan(0), ThresholdRule::new(10, 10));
        assert_eq!(params.validate(2), Err(ValidationError::ZeroChannelId));
    }

    #[test]
    fn test_invalid_rule_names_channel() {
        let mut params = Parameters::default();
        params.channel_rules.insert(chan(7), ThresholdRule::new(0, 0));
        assert_eq!(
            params.validate(2),
            Err(ValidationError::InvalidRule {
                channel: chan(7),
                reason: RuleError::NoThreshold,
            })
        );
    }

    #[test]
    fn test_fee_floor() {
        let mut params = Parameters::default();
        params.sweep_fee_rate_limit = SatPerKWeight(249);
        assert!(matches!(
            params.validate(2),
            Err(ValidationError::SweepFeeRateTooLow { .. })
        ));
        params.sweep_fee_rate_limit = SatPerKWeight::ABSOLUTE_FLOOR;
        assert!(params.validate(2).is_ok());
    }

    #[test]
    fn test_conf_target_minimum() {
        let mut params = Parameters::default();
        params.sweep_conf_target = 1;
        assert_eq!(
            params.validate(2),
            Err(ValidationError::ConfTargetTooLow { minimum: 2 })
        );
    }

    #[test]
    fn test_display_is_sorted() {
        let mut params = Parameters::default();
        params.channel_rules.insert(chan(2), ThresholdRule::new(10, 10));
        params.channel_rules.insert(chan(1), ThresholdRule::new(20, 20));
        let s = params.to_string();
        let first = s.find("0:0:1").unwrap();
        let second = s.find("0:0:2").unwrap();
        assert!(first < second, "{}", s);
        assert!(s.contains("sweep conf target: 100"));
    }
}
