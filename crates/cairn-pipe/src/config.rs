use serde::{Deserialize, Serialize};

/// Runtime configuration for a [`DataProvider`](crate::DataProvider).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Check generator preconditions, holistic vs. per-field size and the
    /// measured byte count on every full write.
    pub validate_writes: bool,
    /// Extra bytes requested on top of the encoded size when allocating a
    /// chunk for a reference-based value.
    pub reference_slack: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            validate_writes: cfg!(debug_assertions),
            reference_slack: 0,
        }
    }
}

impl PipeConfig {
    /// Upper bound on `reference_slack`.
    pub const MAX_REFERENCE_SLACK: u64 = 1 << 20;

    /// A configuration with write validation forced on.
    pub fn validating() -> Self {
        Self {
            validate_writes: true,
            ..Default::default()
        }
    }

    /// Reject nonsensical values.
    pub fn validate(&self) -> Result<(), String> {
        if self.reference_slack > Self::MAX_REFERENCE_SLACK {
            return Err(format!(
                "reference_slack {} exceeds {}",
                self.reference_slack,
                Self::MAX_REFERENCE_SLACK
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(PipeConfig::default().validate().is_ok());
        assert!(PipeConfig::validating().validate_writes);
    }

    #[test]
    fn oversized_slack_is_rejected() {
        let config = PipeConfig {
            reference_slack: PipeConfig::MAX_REFERENCE_SLACK + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: PipeConfig = serde_json::from_str(r#"{"reference_slack": 16}"#).unwrap();
        assert_eq!(config.reference_slack, 16);
        assert_eq!(config.validate_writes, PipeConfig::default().validate_writes);

        let json = serde_json::to_string(&config).unwrap();
        let back: PipeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
