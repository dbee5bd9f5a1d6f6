//! Projection consumer configuration.

use serde::Deserialize;

const DEFAULT_CONSUME_INTERVAL_MS: u64 = 1000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 500;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Interval (ms) between background consumption passes.
    pub consume_interval_ms: u64,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
    /// Feed the usage ledger. When off, every event is ignored by it.
    pub usage_enabled: bool,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            consume_interval_ms: DEFAULT_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            usage_enabled: true,
        }
    }
}

impl From<&crate::config::Settings> for ProjectionConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            consume_interval_ms: u64::try_from(settings.projection.consume_interval.as_millis())
                .unwrap_or(u64::MAX),
            consume_batch_limit: settings.projection.consume_batch_limit.get(),
            usage_enabled: settings.usage.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ProjectionConfig::default();
        assert_eq!(config.consume_interval_ms, 1000);
        assert_eq!(config.consume_batch_limit, 500);
        assert!(config.usage_enabled);
    }
}
