//! Coalescer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ParcelError;

/// Configuration for a [`Coalescer`](crate::Coalescer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// Identifier used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Parcel size at which the leader ships without waiting for idleness.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Quiet period (ms) after the last admission before an under-full parcel ships.
    #[serde(default = "default_idle_ship_timeout_ms")]
    pub idle_ship_timeout_ms: u64,
    /// Hard cap (ms) on how long a parcel may stay open. `None` = no cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_age_ms: Option<u64>,
}

fn default_name() -> String {
    "parcel".into()
}

fn default_max_batch_size() -> usize {
    50
}

fn default_idle_ship_timeout_ms() -> u64 {
    5
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_batch_size: default_max_batch_size(),
            idle_ship_timeout_ms: default_idle_ship_timeout_ms(),
            max_batch_age_ms: None,
        }
    }
}

impl CoalescerConfig {
    pub fn new(
        name: impl Into<String>,
        max_batch_size: usize,
        idle_ship_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            max_batch_size,
            idle_ship_timeout_ms: duration_ms(idle_ship_timeout),
            max_batch_age_ms: None,
        }
    }

    /// Builder-style setter for the age cap.
    pub fn with_max_batch_age(mut self, age: Duration) -> Self {
        self.max_batch_age_ms = Some(duration_ms(age));
        self
    }

    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self, ParcelError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ParcelError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ParcelError> {
        validate_max_batch_size(self.max_batch_size)?;
        if self.max_batch_age_ms == Some(0) {
            return Err(ParcelError::InvalidConfig(
                "max_batch_age_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_ship_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_ship_timeout_ms)
    }

    pub fn max_batch_age(&self) -> Option<Duration> {
        self.max_batch_age_ms.map(Duration::from_millis)
    }
}

pub(crate) fn validate_max_batch_size(size: usize) -> Result<(), ParcelError> {
    if size == 0 {
        return Err(ParcelError::InvalidConfig(
            "max_batch_size must be positive".into(),
        ));
    }
    Ok(())
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoalescerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.idle_ship_timeout(), Duration::from_millis(5));
        assert_eq!(config.max_batch_age(), None);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config = CoalescerConfig::new("t", 0, Duration::from_millis(10));
        assert!(matches!(
            config.validate(),
            Err(ParcelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_age_cap_rejected() {
        let config = CoalescerConfig::new("t", 4, Duration::from_millis(10))
            .with_max_batch_age(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_json_fills_defaults() {
        let config = CoalescerConfig::from_json(r#"{ "max_batch_size": 8 }"#).unwrap();
        assert_eq!(config.name, "parcel");
        assert_eq!(config.max_batch_size, 8);
        assert_eq!(config.idle_ship_timeout_ms, 5);
    }

    #[test]
    fn from_json_rejects_invalid() {
        assert!(CoalescerConfig::from_json(r#"{ "max_batch_size": 0 }"#).is_err());
        assert!(CoalescerConfig::from_json("not json").is_err());
    }
}
