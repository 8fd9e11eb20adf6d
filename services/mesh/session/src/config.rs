//! Engine tuning parameters

use mesh_wire::MAX_TTL;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::MeshError;

/// Timers and limits used by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// TTL for locally originated PDUs
    pub default_ttl: u8,
    /// Base segment acknowledgment interval; 50 ms per TTL hop is added
    #[serde(with = "duration_ms", rename = "segment_ack_base_ms")]
    pub segment_ack_base: Duration,
    /// Retransmissions of a segmented message before giving up
    pub segment_retransmit_limit: u32,
    /// How often segments to a group destination are sent
    pub group_segment_repeats: u32,
    /// Idle time after which a reassembly context is dropped
    #[serde(with = "duration_ms", rename = "reassembly_timeout_ms")]
    pub reassembly_timeout: Duration,
    /// Period of the reassembly sweep
    #[serde(with = "duration_ms", rename = "reassembly_sweep_interval_ms")]
    pub reassembly_sweep_interval: Duration,
    /// Time an acknowledged message waits for its response
    #[serde(with = "duration_ms", rename = "acknowledged_message_timeout_ms")]
    pub acknowledged_message_timeout: Duration,
    /// Maximum wait for each provisioning step
    #[serde(with = "duration_ms", rename = "provisioning_timeout_ms")]
    pub provisioning_timeout: Duration,
    /// Attention timer sent in Provisioning Invite, in seconds
    pub attention_duration: u8,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            segment_ack_base: Duration::from_millis(200),
            segment_retransmit_limit: 4,
            group_segment_repeats: 2,
            reassembly_timeout: Duration::from_secs(10),
            reassembly_sweep_interval: Duration::from_secs(1),
            acknowledged_message_timeout: Duration::from_secs(30),
            provisioning_timeout: Duration::from_secs(60),
            attention_duration: 5,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Check values the engine cannot run with
    pub fn validate(&self) -> Result<(), MeshError> {
        // TTL 1 is never used for originated messages
        if self.default_ttl > MAX_TTL || self.default_ttl == 1 {
            return Err(MeshError::Invalid(format!(
                "default TTL {} not allowed",
                self.default_ttl
            )));
        }
        if self.group_segment_repeats == 0 {
            return Err(MeshError::Invalid(
                "group_segment_repeats must be at least 1".to_string(),
            ));
        }
        if self.reassembly_sweep_interval.is_zero() || self.event_capacity == 0 {
            return Err(MeshError::Invalid(
                "sweep interval and event capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Initial segment retransmission interval for a TTL
    pub fn segment_interval(&self, ttl: u8) -> Duration {
        self.segment_ack_base + Duration::from_millis(50 * ttl as u64)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.segment_interval(5), Duration::from_millis(450));
    }

    #[test]
    fn test_rejects_ttl_one() {
        let config = EngineConfig {
            default_ttl: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let json = r#"{"default_ttl": 7, "acknowledged_message_timeout_ms": 2000}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.default_ttl, 7);
        assert_eq!(config.acknowledged_message_timeout, Duration::from_secs(2));
        assert_eq!(config.provisioning_timeout, Duration::from_secs(60));
    }
}
