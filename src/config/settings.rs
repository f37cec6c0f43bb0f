//! Runtime settings

use std::{path::PathBuf, time::Duration};

use crate::config::CliArgs;
use crate::core::{connection::RetryPolicy, registry::DEFAULT_CAPACITY, types::ModelIdFormat};

/// Timeouts and retry bounds of the scan and probe engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimings {
    pub connect_attempts: u32,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub backoff_step: Duration,
    pub outer_attempts: u32,
    /// Age after which a record is reacquired before connecting
    pub stale_after: Duration,
    pub stale_reacquire: Duration,
    /// Reacquisition window before every handshake write
    pub pre_handshake_reacquire: Duration,
    pub sub_attempts: u32,
    pub notification_wait: Duration,
    pub cool_down: Duration,
    pub reacquire_poll: Duration,
    pub post_subscribe_settle: Duration,
    pub post_reacquire_settle: Duration,
    /// Registry lock budget on the advertisement path
    pub lock_timeout: Duration,
    pub capacity: usize,
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(8),
            initial_backoff: Duration::from_millis(1000),
            backoff_step: Duration::from_millis(500),
            outer_attempts: 3,
            stale_after: Duration::from_secs(5),
            stale_reacquire: Duration::from_secs(4),
            pre_handshake_reacquire: Duration::from_secs(2),
            sub_attempts: 2,
            notification_wait: Duration::from_secs(5),
            cool_down: Duration::from_secs(5),
            reacquire_poll: Duration::from_millis(50),
            post_subscribe_settle: Duration::from_millis(500),
            post_reacquire_settle: Duration::from_millis(200),
            lock_timeout: Duration::from_millis(5),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ProtocolTimings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            connect_timeout: self.connect_timeout,
            initial_backoff: self.initial_backoff,
            backoff_step: self.backoff_step,
        }
    }
}

/// Runtime configuration settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub adapter: Option<String>,
    pub scan_duration: Duration,
    pub test_index: Option<usize>,
    pub store_path: PathBuf,
    pub model_id_format: ModelIdFormat,
    pub clear_paired: bool,
    pub timings: ProtocolTimings,
}

impl From<CliArgs> for Settings {
    fn from(args: CliArgs) -> Self {
        Settings {
            adapter: args.adapter,
            scan_duration: Duration::from_secs(args.scan_secs),
            test_index: args.test,
            store_path: PathBuf::from(args.store),
            model_id_format: args.model_id_format.into(),
            clear_paired: args.clear_paired,
            timings: ProtocolTimings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_settings_from_args() {
        let args = CliArgs::parse_from([
            "fastpair-audit",
            "--scan-secs",
            "3",
            "--test",
            "2",
            "--model-id-format",
            "prefixed",
        ]);
        let settings = Settings::from(args);

        assert_eq!(settings.scan_duration, Duration::from_secs(3));
        assert_eq!(settings.test_index, Some(2));
        assert_eq!(settings.model_id_format, ModelIdFormat::Prefixed);
        assert_eq!(
            settings.store_path,
            PathBuf::from("/var/lib/fastpair-audit/paired.json")
        );
        assert!(!settings.clear_paired);
        assert!(settings.adapter.is_none());
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = ProtocolTimings::default().retry_policy();
        assert_eq!(policy, RetryPolicy::default());
    }
}
