use crate::error::FileStorError;
use crate::throttle::DynamicThrottleParams;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for a [`crate::FileStorHandler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStorConfig {
    pub num_stripes: usize,
    pub max_merges_per_stripe: u32,
    pub throttle_apply_bucket_diff_ops: bool,
    pub use_dynamic_operation_throttling: bool,
    pub dynamic_throttling: DynamicThrottleParams,
    pub get_next_message_wait_ms: u64,
    pub merge_timeout_ms: u64,
    pub threads_per_stripe: usize,
}

impl Default for FileStorConfig {
    fn default() -> Self {
        Self {
            num_stripes: 4,
            max_merges_per_stripe: 16,
            throttle_apply_bucket_diff_ops: false,
            use_dynamic_operation_throttling: false,
            dynamic_throttling: DynamicThrottleParams::default(),
            get_next_message_wait_ms: 100,
            merge_timeout_ms: 60_000,
            threads_per_stripe: 1,
        }
    }
}

impl FileStorConfig {
    /// Small footprint with short waits, for local runs and tests.
    pub fn development() -> Self {
        Self {
            num_stripes: 2,
            get_next_message_wait_ms: 10,
            merge_timeout_ms: 5_000,
            ..Self::default()
        }
    }

    pub fn get_next_message_wait(&self) -> Duration {
        Duration::from_millis(self.get_next_message_wait_ms)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_millis(self.merge_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), FileStorError> {
        if self.num_stripes == 0 {
            return Err(invalid("num_stripes must be at least 1"));
        }
        if self.max_merges_per_stripe == 0 {
            return Err(invalid("max_merges_per_stripe must be at least 1"));
        }
        if self.threads_per_stripe == 0 {
            return Err(invalid("threads_per_stripe must be at least 1"));
        }
        self.dynamic_throttling.validate()
    }
}

fn invalid(message: &str) -> FileStorError {
    FileStorError::InvalidConfig {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::FileStorConfig;
    use crate::error::FileStorErrorCode;

    #[test]
    fn default_config_is_valid() {
        FileStorConfig::default().validate().expect("default valid");
        FileStorConfig::development()
            .validate()
            .expect("development valid");
    }

    #[test]
    fn zero_stripes_rejected() {
        let config = FileStorConfig {
            num_stripes: 0,
            ..FileStorConfig::default()
        };
        let err = config.validate().expect_err("zero stripes");
        assert_eq!(err.code(), FileStorErrorCode::InvalidConfig);
    }

    #[test]
    fn inverted_throttle_window_rejected() {
        let mut config = FileStorConfig::default();
        config.dynamic_throttling.min_window_size = 50;
        config.dynamic_throttling.max_window_size = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: FileStorConfig =
            serde_json::from_str(r#"{"num_stripes": 8, "dynamic_throttling": {"min_window_size": 4}}"#)
                .expect("parse");
        assert_eq!(config.num_stripes, 8);
        assert_eq!(config.max_merges_per_stripe, 16);
        assert_eq!(config.dynamic_throttling.min_window_size, 4);
        assert_eq!(config.dynamic_throttling.max_window_size, 1_000);
        let encoded = serde_json::to_string(&config).expect("encode");
        let decoded: FileStorConfig = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, config);
    }
}
