//! Prompt playback used for bridge announcements

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::channel::Channel;
use crate::error::Result;

/// Plays recorded sounds to a channel. File handling lives outside the core.
#[async_trait]
pub trait PromptPlayer: Send + Sync {
    /// Play `sound` to completion
    async fn stream_and_wait(&self, chan: &Arc<Channel>, sound: &str) -> Result<()>;

    /// Say a number in the channel's language
    async fn say_number(&self, chan: &Arc<Channel>, number: i64) -> Result<()>;
}

/// Player that plays nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPromptPlayer;

#[async_trait]
impl PromptPlayer for NullPromptPlayer {
    async fn stream_and_wait(&self, chan: &Arc<Channel>, sound: &str) -> Result<()> {
        debug!("No prompt player, skipping '{}' on {}", sound, chan.name());
        Ok(())
    }

    async fn say_number(&self, chan: &Arc<Channel>, number: i64) -> Result<()> {
        debug!("No prompt player, skipping number {} on {}", number, chan.name());
        Ok(())
    }
}
