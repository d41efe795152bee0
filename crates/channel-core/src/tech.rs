//! Technology drivers
//!
//! A channel delegates every device-specific operation to its technology.
//! Drivers implement [`ChannelTech`]; each method that a driver leaves at its
//! default returns [`ChannelError::NotSupported`], and the core falls back to
//! software behaviour (tone synthesis for digits, no-op for most indications).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::bridge::{BridgeFlags, BridgeOutcome};
use crate::channel::{Channel, ChannelInner, HangupCause};
use crate::devicestate::DeviceState;
use crate::error::{ChannelError, Result};
use crate::format::Format;
use crate::frame::{ControlType, Frame};
use crate::registry::ChannelRegistry;

/// Optional capabilities a driver advertises, shown by `show_channeltypes`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TechFeatures {
    pub devicestate: bool,
    pub indications: bool,
    pub transfer: bool,
    pub send_digit: bool,
    pub send_html: bool,
}

/// Media timing behaviour of a driver, used to decide on jitter buffering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TechProperties {
    /// The driver accepts jittered frames and buffers them itself
    pub wants_jitter: bool,
    /// Frames read from this driver arrive with network jitter
    pub creates_jitter: bool,
}

/// Channel technology interface
#[async_trait]
pub trait ChannelTech: Send + Sync {
    /// Type name, unique among registered technologies (case-insensitive)
    fn type_name(&self) -> &str;

    fn description(&self) -> &str;

    /// Formats this driver can produce and consume
    fn capabilities(&self) -> Format;

    fn features(&self) -> TechFeatures {
        TechFeatures::default()
    }

    fn properties(&self) -> TechProperties {
        TechProperties::default()
    }

    /// Drivers sharing an id can bridge natively
    fn native_bridge_id(&self) -> Option<&'static str> {
        None
    }

    /// Create a channel for an outbound call to `data`
    async fn requester(
        &self,
        registry: &ChannelRegistry,
        format: Format,
        data: &str,
    ) -> std::result::Result<Arc<Channel>, HangupCause> {
        let _ = (registry, format, data);
        Err(HangupCause::ChanNotImplemented)
    }

    /// Device state of `data`
    async fn devicestate(&self, data: &str) -> Result<DeviceState> {
        let _ = data;
        Err(ChannelError::not_supported(self.type_name(), "devicestate"))
    }

    /// Place the call
    async fn call(&self, chan: &mut ChannelInner, dest: &str, timeout: Option<Duration>) -> Result<()> {
        let _ = (chan, dest, timeout);
        Err(ChannelError::not_supported(self.type_name(), "call"))
    }

    async fn answer(&self, chan: &mut ChannelInner) -> Result<()> {
        let _ = chan;
        Err(ChannelError::not_supported(self.type_name(), "answer"))
    }

    /// Disconnect the device and release the private data
    async fn hangup(&self, chan: &mut ChannelInner) -> Result<()> {
        chan.tech_pvt = None;
        Ok(())
    }

    /// Read one frame from the device. `None` means the device hung up.
    async fn read(&self, chan: &mut ChannelInner) -> Option<Frame>;

    async fn write(&self, chan: &mut ChannelInner, frame: &Frame) -> Result<()> {
        let _ = (chan, frame);
        Err(ChannelError::not_supported(self.type_name(), "write"))
    }

    async fn write_video(&self, chan: &mut ChannelInner, frame: &Frame) -> Result<()> {
        let _ = (chan, frame);
        Err(ChannelError::not_supported(self.type_name(), "write_video"))
    }

    /// Handle an exception condition flagged on one of the descriptors
    async fn exception(&self, chan: &mut ChannelInner) -> Result<Option<Frame>> {
        let _ = chan;
        Err(ChannelError::not_supported(self.type_name(), "exception"))
    }

    async fn indicate(&self, chan: &mut ChannelInner, condition: ControlType) -> Result<()> {
        let _ = (chan, condition);
        Err(ChannelError::not_supported(self.type_name(), "indicate"))
    }

    async fn send_digit(&self, chan: &mut ChannelInner, digit: char) -> Result<()> {
        let _ = (chan, digit);
        Err(ChannelError::not_supported(self.type_name(), "send_digit"))
    }

    async fn send_text(&self, chan: &mut ChannelInner, text: &str) -> Result<()> {
        let _ = (chan, text);
        Err(ChannelError::not_supported(self.type_name(), "send_text"))
    }

    async fn send_html(&self, chan: &mut ChannelInner, subclass: u32, data: &Bytes) -> Result<()> {
        let _ = (chan, subclass, data);
        Err(ChannelError::not_supported(self.type_name(), "send_html"))
    }

    async fn transfer(&self, chan: &mut ChannelInner, dest: &str) -> Result<()> {
        let _ = (chan, dest);
        Err(ChannelError::not_supported(self.type_name(), "transfer"))
    }

    async fn setoption(&self, chan: &mut ChannelInner, option: u32, data: &[u8]) -> Result<()> {
        let _ = (chan, option, data);
        Err(ChannelError::not_supported(self.type_name(), "setoption"))
    }

    /// Repoint driver back-references after a masquerade. `inner` belongs to `new`.
    async fn fixup(&self, old: &Arc<Channel>, new: &Arc<Channel>, inner: &mut ChannelInner) -> Result<()> {
        let _ = (old, new, inner);
        Ok(())
    }

    /// Relay media between two channels of this technology without the core
    async fn bridge(
        &self,
        c0: &Arc<Channel>,
        c1: &Arc<Channel>,
        flags: BridgeFlags,
        timeout: Option<Duration>,
    ) -> Result<BridgeOutcome> {
        let _ = (c0, c1, flags, timeout);
        Err(ChannelError::not_supported(self.type_name(), "bridge"))
    }
}

impl std::fmt::Debug for dyn ChannelTech {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTech")
            .field("type", &self.type_name())
            .field("description", &self.description())
            .finish()
    }
}
