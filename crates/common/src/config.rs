//! Common configuration types for verification binaries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter directive (trace, debug, info, warn, error or a full `EnvFilter` spec)
    pub log_level: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Read `RUST_LOG` and `LOG_JSON` from a variable map.
    ///
    /// `LOG_JSON` accepts `1`, `true` or `yes` (case-insensitive); anything else
    /// selects human-readable output.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let log_level = vars
            .get("RUST_LOG")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let json_logs = vars
            .get("LOG_JSON")
            .is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"));

        Self {
            log_level,
            json_logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let config = ObservabilityConfig::from_vars(&HashMap::new());
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_json_logs_flag_parsing() {
        for (value, expected) in [("true", true), ("1", true), ("YES", true), ("no", false)] {
            let vars = HashMap::from([("LOG_JSON".to_string(), value.to_string())]);
            assert_eq!(
                ObservabilityConfig::from_vars(&vars).json_logs,
                expected,
                "LOG_JSON={value}"
            );
        }
    }

    #[test]
    fn test_rust_log_is_passed_through() {
        let vars = HashMap::from([(
            "RUST_LOG".to_string(),
            "deploy_verify=debug".to_string(),
        )]);
        assert_eq!(
            ObservabilityConfig::from_vars(&vars).log_level,
            "deploy_verify=debug"
        );
    }
}
