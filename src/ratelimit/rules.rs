//! Declarative limiter definitions.
//!
//! Limiters can be described in configuration instead of code:
//!
//! ```yaml
//! limiters:
//!   - kind: route
//!     name: login
//!     requests: 5
//!     per: minute
//!   - kind: user_action
//!     name: upload
//!     requests: 10
//!     per: hour
//!   - kind: custom
//!     namespace: webhooks
//!     max: 20
//!     refill_interval_secs: 0.5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Time unit for "N requests per unit" limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// One limiter definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimiterRule {
    /// Quota shared by every caller of one route, namespaced `api:<name>`.
    Route {
        name: String,
        requests: u64,
        per: TimeUnit,
    },
    /// Quota for one user action, namespaced `user:<name>`.
    UserAction {
        name: String,
        requests: u64,
        per: TimeUnit,
    },
    /// Explicit capacity, refill interval and namespace.
    Custom {
        namespace: String,
        max: u64,
        refill_interval_secs: f64,
    },
}

/// A list of limiter definitions, as found in a standalone rules file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterRules {
    #[serde(default)]
    pub limiters: Vec<LimiterRule>,
}

impl LimiterRules {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse rules from YAML: either a `limiters:` map or a bare list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(limiters) = serde_yaml::from_str::<Vec<LimiterRule>>(yaml) {
            return Ok(Self { limiters });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse limiter rules: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_map_form() {
        let yaml = r#"
limiters:
  - kind: route
    name: login
    requests: 5
    per: minute
  - kind: user_action
    name: upload
    requests: 10
    per: hour
  - kind: custom
    namespace: webhooks
    max: 20
    refill_interval_secs: 0.5
"#;
        let rules = LimiterRules::from_yaml(yaml).unwrap();
        assert_eq!(
            rules.limiters,
            vec![
                LimiterRule::Route {
                    name: "login".to_string(),
                    requests: 5,
                    per: TimeUnit::Minute,
                },
                LimiterRule::UserAction {
                    name: "upload".to_string(),
                    requests: 10,
                    per: TimeUnit::Hour,
                },
                LimiterRule::Custom {
                    namespace: "webhooks".to_string(),
                    max: 20,
                    refill_interval_secs: 0.5,
                },
            ]
        );
    }

    #[test]
    fn test_parse_list_form() {
        let yaml = r#"
- kind: route
  name: search
  requests: 100
  per: second
"#;
        let rules = LimiterRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.limiters.len(), 1);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let yaml = r#"
limiters:
  - kind: sliding_window
    name: nope
"#;
        let err = LimiterRules::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
    }

    #[test]
    fn test_from_file_missing() {
        let err = LimiterRules::from_file("/no/such/rules.yaml").unwrap_err();
        assert!(matches!(err, TollgateError::Io(_)));
    }
}
