//! Log filtering for the channel core
//!
//! Everything the core logs is under the `rvoip_channel_core` target. Frame
//! dumps from channels with frame debugging on go to the separate
//! [`FRAME_TARGET`], so a busy system can turn them off without losing the
//! rest of the debug output.

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{ChannelError, Result};

/// Target of per-frame dumps
pub const FRAME_TARGET: &str = "rvoip_channel_core::frames";

const CRATE_TARGET: &str = "rvoip_channel_core";

/// `[logging]` section of the channel core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Level for the channel core itself
    pub level: String,
    /// Level for everything else when `RUST_LOG` is unset
    pub default_level: String,
    /// Show frame dumps of channels with frame debugging on
    pub frame_dumps: bool,
    pub json: bool,
    /// Extra `target=level` directives, applied last
    pub directives: Vec<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            default_level: "warn".to_string(),
            frame_dumps: false,
            json: false,
            directives: Vec::new(),
        }
    }
}

fn directive(text: &str) -> Result<Directive> {
    text.parse()
        .map_err(|e| ChannelError::config(format!("Invalid log directive '{}': {}", text, e)))
}

/// Build the filter described by `settings`, on top of `RUST_LOG` when set
pub fn build_filter(settings: &LogSettings) -> Result<EnvFilter> {
    let base = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| settings.default_level.clone());
    let mut filter = EnvFilter::try_new(&base)
        .map_err(|e| ChannelError::config(format!("Invalid log filter '{}': {}", base, e)))?;

    filter = filter.add_directive(directive(&format!("{}={}", CRATE_TARGET, settings.level))?);
    let frames = if settings.frame_dumps { "debug" } else { "off" };
    filter = filter.add_directive(directive(&format!("{}={}", FRAME_TARGET, frames))?);

    for extra in &settings.directives {
        filter = filter.add_directive(directive(extra)?);
    }
    Ok(filter)
}

/// Install a global fmt subscriber for `settings`. Fails if one is already installed.
pub fn init_logging(settings: &LogSettings) -> Result<()> {
    let filter = build_filter(settings)?;
    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ChannelError::config(format!("Failed to install subscriber: {}", e)))?;

    tracing::debug!(
        "Channel core logging at {}, frame dumps {}",
        settings.level,
        if settings.frame_dumps { "on" } else { "off" }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_dumps_directive() {
        let filter = build_filter(&LogSettings::default()).unwrap().to_string();
        assert!(filter.contains("rvoip_channel_core=info"));
        assert!(filter.contains("rvoip_channel_core::frames=off"));

        let settings = LogSettings {
            level: "debug".to_string(),
            frame_dumps: true,
            ..LogSettings::default()
        };
        let filter = build_filter(&settings).unwrap().to_string();
        assert!(filter.contains("rvoip_channel_core=debug"));
        assert!(filter.contains("rvoip_channel_core::frames=debug"));
    }

    #[test]
    fn test_invalid_directive() {
        let settings = LogSettings {
            level: "loud".to_string(),
            ..LogSettings::default()
        };
        assert!(matches!(
            build_filter(&settings),
            Err(ChannelError::Configuration { .. })
        ));
    }

    #[test]
    #[serial_test::serial]
    fn test_init_logging_installs_once() {
        let settings = LogSettings::default();
        // Another test binary may already own the global subscriber
        if init_logging(&settings).is_ok() {
            assert!(init_logging(&settings).is_err());
        }
    }
}
