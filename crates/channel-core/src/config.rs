//! Channel core configuration
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration. Policy constants such as the read queue caps live here
//! rather than in code.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};
use crate::logging::LogSettings;

/// Top-level configuration for the channel core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelCoreConfig {
    /// Prefix for unique ids, for multi-node deployments
    pub system_name: Option<String>,
    pub default_language: String,
    pub default_context: String,
    pub default_exten: String,
    pub default_priority: i32,
    /// Force signed linear as the intermediate format when two channels need transcoding
    pub transcode_via_slin: bool,
    pub queue: QueueConfig,
    pub lookup: LookupConfig,
    pub dtmf: DtmfConfig,
    pub jitterbuffer: JitterBufferSettings,
    pub events: EventsConfig,
    pub cdr: CdrConfig,
    pub logging: LogSettings,
}

impl Default for ChannelCoreConfig {
    fn default() -> Self {
        Self {
            system_name: None,
            default_language: "en".to_string(),
            default_context: "default".to_string(),
            default_exten: "s".to_string(),
            default_priority: 1,
            transcode_via_slin: false,
            queue: QueueConfig::default(),
            lookup: LookupConfig::default(),
            dtmf: DtmfConfig::default(),
            jitterbuffer: JitterBufferSettings::default(),
            events: EventsConfig::default(),
            cdr: CdrConfig::default(),
            logging: LogSettings::default(),
        }
    }
}

/// Read queue limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Voice frames are dropped once this many frames are queued
    pub voice_drop_depth: usize,
    /// Any frame queued at this depth is a queue fault
    pub hard_limit: usize,
    /// Digits buffered while DTMF is deferred
    pub deferred_dtmf_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            voice_drop_depth: 96,
            hard_limit: 128,
            deferred_dtmf_capacity: 78,
        }
    }
}

/// Retry policy of the search-and-lock routine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_ms: 1,
        }
    }
}

impl LookupConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Software DTMF generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DtmfConfig {
    pub digit_duration_ms: u64,
    pub digit_gap_ms: u64,
    /// Peak amplitude of each tone component
    pub tone_volume: i16,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        Self {
            digit_duration_ms: 100,
            digit_gap_ms: 100,
            tone_volume: 7000,
        }
    }
}

/// Jitter buffer used by the generic bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterBufferSettings {
    pub enabled: bool,
    /// Use the jitter buffer even when neither side asks for it
    pub force: bool,
    pub max_size_ms: u64,
    pub resync_threshold_ms: i64,
    pub target_extra_ms: u64,
}

impl Default for JitterBufferSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            force: false,
            max_size_ms: 200,
            resync_threshold_ms: 1000,
            target_extra_ms: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of the broadcast event bus
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CdrConfig {
    pub enabled: bool,
    /// Post records of calls that were never answered
    pub unanswered: bool,
}

impl Default for CdrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unanswered: false,
        }
    }
}

impl ChannelCoreConfig {
    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.queue.hard_limit == 0 {
            return Err(ChannelError::config("queue.hard_limit must be positive"));
        }
        if self.queue.voice_drop_depth > self.queue.hard_limit {
            return Err(ChannelError::config(format!(
                "queue.voice_drop_depth ({}) exceeds queue.hard_limit ({})",
                self.queue.voice_drop_depth, self.queue.hard_limit
            )));
        }
        if self.events.capacity == 0 {
            return Err(ChannelError::config("events.capacity must be positive"));
        }
        if self.default_exten.is_empty() {
            return Err(ChannelError::config("default_exten must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ChannelCoreConfig::default();
        assert_eq!(config.queue.voice_drop_depth, 96);
        assert_eq!(config.queue.hard_limit, 128);
        assert_eq!(config.lookup.max_retries, 10);
        assert_eq!(config.default_exten, "s");
        assert_eq!(config.default_priority, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ChannelCoreConfig::from_toml_str(
            r#"
            system_name = "node1"

            [queue]
            voice_drop_depth = 10
            hard_limit = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.system_name.as_deref(), Some("node1"));
        assert_eq!(config.queue.voice_drop_depth, 10);
        assert_eq!(config.queue.deferred_dtmf_capacity, 78);
        assert_eq!(config.default_language, "en");
    }

    #[test]
    fn test_invalid_queue_limits() {
        let err = ChannelCoreConfig::from_toml_str("[queue]\nvoice_drop_depth = 200\n").unwrap_err();
        assert!(matches!(err, ChannelError::Configuration { .. }));
    }

    #[test]
    fn test_parse_error() {
        let err = ChannelCoreConfig::from_toml_str("queue = 5").unwrap_err();
        assert!(matches!(err, ChannelError::ConfigParse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "default_context = \"from-internal\"\n[cdr]\nenabled = false\n[logging]\nframe_dumps = true"
        )
        .unwrap();
        let config = ChannelCoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.default_context, "from-internal");
        assert!(!config.cdr.enabled);
        assert!(config.logging.frame_dumps);
        assert_eq!(config.logging.level, "info");
    }
}
