//! Device state
//!
//! A device is a channel name with its per-call suffix removed
//! (`SIP/alice-0001` is device `SIP/alice`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelState;
use crate::registry::ChannelRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    Unknown,
    NotInUse,
    InUse,
    Busy,
    /// No such technology or malformed device
    Invalid,
    Unavailable,
    Ringing,
}

impl DeviceState {
    pub fn name(self) -> &'static str {
        match self {
            DeviceState::Unknown => "Unknown",
            DeviceState::NotInUse => "Not in use",
            DeviceState::InUse => "In use",
            DeviceState::Busy => "Busy",
            DeviceState::Invalid => "Invalid",
            DeviceState::Unavailable => "Unavailable",
            DeviceState::Ringing => "Ringing",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device name for a channel name: everything before the last `-`
pub fn device_name(channel_name: &str) -> String {
    match channel_name.rfind('-') {
        Some(pos) => channel_name[..pos].to_string(),
        None => channel_name.to_string(),
    }
}

impl ChannelRegistry {
    /// State derived from live channels named `<device>-...`
    pub async fn parse_device_state(&self, device: &str) -> DeviceState {
        let prefix = format!("{}-", device);
        match self.find_by_name_prefix(&prefix).await {
            Some(chan) if chan.state() == ChannelState::Ringing => DeviceState::Ringing,
            Some(_) => DeviceState::InUse,
            None => DeviceState::Unknown,
        }
    }

    /// State of `Tech/resource`. Asks the technology first and falls back
    /// to scanning live channels.
    pub async fn device_state(&self, device: &str) -> DeviceState {
        let Some((tech_name, number)) = device.split_once('/') else {
            return DeviceState::Invalid;
        };
        let Some(tech) = self.lookup_technology(tech_name) else {
            return DeviceState::Invalid;
        };
        match tech.devicestate(number).await {
            Ok(DeviceState::Unknown) => match self.parse_device_state(device).await {
                DeviceState::Unknown => DeviceState::NotInUse,
                state => state,
            },
            Ok(state) => state,
            Err(_) => self.parse_device_state(device).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_strips_call_suffix() {
        assert_eq!(device_name("SIP/alice-0001"), "SIP/alice");
        assert_eq!(device_name("Zap/1-1-2"), "Zap/1-1");
        assert_eq!(device_name("Local/park"), "Local/park");
        assert_eq!(device_name("Mock/1-0001<ZOMBIE>"), "Mock/1");
    }
}
