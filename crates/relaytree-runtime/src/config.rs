//! Coordinator configuration

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relaytree_core::{RelayError, RelayResult};
use relaytree_topology::TopologyConfig;

/// Coordinator configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub topology: TopologyConfig,
    /// Attempts after the first when an atomic update reports `Conflict`
    pub max_conflict_retries: u32,
    /// Bound on each negotiation step; `None` disables abandonment
    pub negotiation_timeout: Option<Duration>,
    /// Per-session notification queue size
    pub notification_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            topology: TopologyConfig::default(),
            max_conflict_retries: 8,
            negotiation_timeout: Some(Duration::from_secs(30)),
            notification_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overlaid with `RELAYTREE_*` environment variables
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("RELAYTREE_FANOUT") {
            config.topology.fanout = parse_var("RELAYTREE_FANOUT", &value)?;
        }
        if let Some(value) = lookup("RELAYTREE_MAX_CONFLICT_RETRIES") {
            config.max_conflict_retries = parse_var("RELAYTREE_MAX_CONFLICT_RETRIES", &value)?;
        }
        if let Some(value) = lookup("RELAYTREE_NEGOTIATION_TIMEOUT") {
            config.negotiation_timeout = match value.trim() {
                "off" | "none" => None,
                text => Some(humantime::parse_duration(text).map_err(|e| {
                    RelayError::Internal(format!(
                        "RELAYTREE_NEGOTIATION_TIMEOUT: invalid duration `{}`: {}",
                        text, e
                    ))
                })?),
            };
        }
        if let Some(value) = lookup("RELAYTREE_NOTIFICATION_CAPACITY") {
            config.notification_capacity = parse_var("RELAYTREE_NOTIFICATION_CAPACITY", &value)?;
        }

        if config.topology.fanout == 0 {
            return Err(RelayError::Internal("RELAYTREE_FANOUT must be at least 1".into()));
        }

        Ok(config)
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.topology.fanout = fanout;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }
}

fn parse_var<T>(name: &str, value: &str) -> RelayResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RelayError::Internal(format!("{}: invalid value `{}`: {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.topology.fanout, 2);
    }

    #[test]
    fn test_overrides() {
        let config = CoordinatorConfig::from_lookup(lookup(&[
            ("RELAYTREE_FANOUT", "3"),
            ("RELAYTREE_MAX_CONFLICT_RETRIES", "2"),
            ("RELAYTREE_NEGOTIATION_TIMEOUT", "1m 30s"),
            ("RELAYTREE_NOTIFICATION_CAPACITY", " 16 "),
        ]))
        .unwrap();

        assert_eq!(config.topology.fanout, 3);
        assert_eq!(config.max_conflict_retries, 2);
        assert_eq!(config.negotiation_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.notification_capacity, 16);

        let off = CoordinatorConfig::from_lookup(lookup(&[("RELAYTREE_NEGOTIATION_TIMEOUT", "off")]))
            .unwrap();
        assert_eq!(off.negotiation_timeout, None);
    }

    #[test]
    fn test_malformed_values() {
        let err = CoordinatorConfig::from_lookup(lookup(&[("RELAYTREE_FANOUT", "two")])).unwrap_err();
        assert!(err.to_string().contains("RELAYTREE_FANOUT"));

        assert!(CoordinatorConfig::from_lookup(lookup(&[("RELAYTREE_FANOUT", "0")])).is_err());
        assert!(
            CoordinatorConfig::from_lookup(lookup(&[("RELAYTREE_NEGOTIATION_TIMEOUT", "soon")]))
                .is_err()
        );
    }
}
