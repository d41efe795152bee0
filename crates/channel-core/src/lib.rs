//! # Channel-Core: PBX Channel Abstraction
//!
//! The call-leg core of a PBX. A [`Channel`] is one leg of a call (a phone,
//! a trunk, a local pseudo-leg) whose device work is delegated to a
//! pluggable [`ChannelTech`] driver. On top of that the core provides:
//!
//! - **Registry**: technologies and live channels, with lookups that never
//!   deadlock against channel locks ([`ChannelRegistry`])
//! - **Frame pipeline**: read queue, DTMF deferral, format translation,
//!   generators, spies and monitors on every read and write
//! - **Waiting**: one multiplexed wait over channels and extra descriptors,
//!   clamped to hangup deadlines ([`waitfor_nandfds`])
//! - **Masquerade**: one channel takes over another's live call
//! - **Bridging**: native or generic relay between two channels, with time
//!   limits and jitter buffering ([`channel_bridge`])
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_channel_core::prelude::*;
//!
//! # async fn example(tech: Arc<dyn ChannelTech>) -> Result<()> {
//! let registry = ChannelRegistry::builder()
//!     .config(ChannelCoreConfig::default())
//!     .build()?;
//! registry.register_technology(tech)?;
//!
//! let outcome = registry
//!     .request_and_dial("Mock", Format::ULAW, "1000", Some(std::time::Duration::from_secs(30)), None, None)
//!     .await?;
//! if let Some(chan) = outcome.channel {
//!     chan.hangup().await?;
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod channel;

pub mod autoservice;
pub mod bridge;
pub mod cdr;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod devicestate;
pub mod dtmf;
pub mod error;
pub mod events;
pub mod format;
pub mod frame;
pub mod generator;
pub mod group;
pub mod jitterbuf;
pub mod logging;
pub mod masquerade;
pub mod monitor;
pub mod prompt;
pub mod registry;
pub mod request;
pub mod spy;
pub mod tech;
pub mod translate;
pub mod waitfor;

pub use autoservice::{autoservice_start, autoservice_stop};
pub use bridge::{channel_bridge, BridgeConfig, BridgeFeatures, BridgeFlags, BridgeOutcome, BridgeResult};
pub use channel::{
    channel_make_compatible, CallerId, Channel, ChannelFlags, ChannelInner, ChannelState, HangupCause,
    LockedChannel, SoftHangup,
};
pub use config::ChannelCoreConfig;
pub use descriptor::Descriptor;
pub use devicestate::DeviceState;
pub use error::{ChannelError, Result};
pub use events::ChannelEvent;
pub use format::Format;
pub use frame::{ControlType, Frame, FrameKind};
pub use masquerade::channel_masquerade;
pub use registry::{ChannelRegistry, ChannelRegistryBuilder, ChannelServices};
pub use request::DialOutcome;
pub use tech::{ChannelTech, TechFeatures, TechProperties};
pub use waitfor::{waitfor, waitfor_fd, waitfor_n, waitfor_nandfds, WaitResult, WaitStatus};

/// Version of the channel core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types for applications and drivers
pub mod prelude {
    pub use crate::bridge::{channel_bridge, BridgeConfig, BridgeFlags, BridgeResult};
    pub use crate::channel::{Channel, ChannelInner, ChannelState, HangupCause, SoftHangup};
    pub use crate::config::ChannelCoreConfig;
    pub use crate::error::{ChannelError, Result};
    pub use crate::format::Format;
    pub use crate::frame::{ControlType, Frame, FrameKind};
    pub use crate::registry::ChannelRegistry;
    pub use crate::tech::ChannelTech;
    pub use crate::waitfor::{waitfor, waitfor_n, WaitStatus};
}
