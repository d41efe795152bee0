//! The per-channel read queue
//!
//! Frames queued here are returned by `read` ahead of anything the
//! technology produces. Each queued frame adds one token to the alert
//! descriptor and each dequeue removes one.

use std::sync::Arc;

use tracing::{debug, error};

use super::{Channel, ChannelInner, SoftHangup};
use crate::error::{ChannelError, Result};
use crate::frame::{ControlType, Frame};

impl ChannelInner {
    /// Append a frame to the read queue.
    ///
    /// Nothing is queued behind a HANGUP. Voice frames are dropped once the
    /// queue reaches the voice drop depth; any frame at the hard limit is a
    /// queue fault.
    pub fn queue_frame(&mut self, frame: Frame) -> Result<()> {
        let qlen = self.readq.len();
        if self.readq.back().is_some_and(|f| f.is_hangup()) {
            return Ok(());
        }

        let limits = &self.services.config.queue;
        if qlen >= limits.hard_limit {
            error!(
                "Exceptionally long queue length queuing to {} ({} frames)",
                self.name(),
                qlen
            );
            return Err(ChannelError::QueueOverflow {
                channel: self.name(),
                depth: qlen,
            });
        }
        if frame.is_voice() && qlen >= limits.voice_drop_depth {
            debug!("Dropping voice to exceptionally long queue on {}", self.name());
            return Ok(());
        }

        self.readq.push_back(frame);
        self.alert.signal();
        Ok(())
    }

    /// Flag a device hangup and queue a HANGUP control frame
    pub fn queue_hangup(&mut self) -> Result<()> {
        self.softhangup.insert(SoftHangup::DEV);
        self.queue_frame(Frame::hangup())
    }

    pub fn queue_control(&mut self, control: ControlType) -> Result<()> {
        self.queue_frame(Frame::control(control))
    }

    /// Pop the head of the read queue, consuming its alert token
    pub(crate) fn dequeue(&mut self) -> Option<Frame> {
        let frame = self.readq.pop_front()?;
        if !self.alert.consume() {
            tracing::warn!("Alert descriptor out of step with read queue on {}", self.name());
        }
        Some(frame)
    }

    /// Discard every queued frame
    pub(crate) fn clear_queue(&mut self) -> usize {
        let n = self.readq.len();
        self.readq.clear();
        self.alert.drain();
        n
    }
}

impl Channel {
    /// Queue a frame for the next `read`
    pub async fn queue_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        self.lock().await.queue_frame(frame)
    }

    pub async fn queue_hangup(self: &Arc<Self>) -> Result<()> {
        self.lock().await.queue_hangup()
    }

    pub async fn queue_control(self: &Arc<Self>, control: ControlType) -> Result<()> {
        self.lock().await.queue_control(control)
    }
}
