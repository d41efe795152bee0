//! Outbound channel requests

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelState, HangupCause};
use crate::error::{ChannelError, Result};
use crate::events::ChannelEvent;
use crate::format::Format;
use crate::frame::{ControlType, FrameKind};
use crate::registry::ChannelRegistry;
use crate::waitfor::{waitfor, WaitStatus};

/// Result of [`ChannelRegistry::request_and_dial`]
#[derive(Debug)]
pub struct DialOutcome {
    /// The answered channel. `None` when the call did not complete.
    pub channel: Option<Arc<Channel>>,
    /// Last call progress seen: Ringing, Answer, Busy, Congestion or Hangup
    pub state: Option<ControlType>,
}

fn cause_to_control(cause: HangupCause) -> Option<ControlType> {
    match cause {
        HangupCause::UserBusy => Some(ControlType::Busy),
        HangupCause::NormalCircuitCongestion | HangupCause::SwitchCongestion => Some(ControlType::Congestion),
        _ => None,
    }
}

impl ChannelRegistry {
    /// Ask technology `tech` for a new channel towards `data`.
    ///
    /// The format handed to the driver is the best choice among its
    /// capabilities for the requested `format`.
    pub async fn request(&self, tech: &str, format: Format, data: &str) -> Result<Arc<Channel>> {
        let Some(driver) = self.lookup_technology(tech) else {
            warn!("No channel type registered for '{}'", tech);
            return Err(ChannelError::TechnologyNotFound { name: tech.to_string() });
        };

        let (_, capabilities) = self
            .translators()
            .best_choice(format, driver.capabilities())
            .map_err(|e| {
                warn!(
                    "No translator path exists for channel type {} (native {}) to {}",
                    tech,
                    driver.capabilities(),
                    format
                );
                e
            })?;

        let chan = driver
            .requester(self, capabilities, data)
            .await
            .map_err(|cause| ChannelError::RequestFailed {
                tech: tech.to_string(),
                data: data.to_string(),
                cause,
            })?;

        let c = chan.lock().await;
        if c.state() == ChannelState::Down {
            self.services().emit(ChannelEvent::Newchannel {
                channel: c.name(),
                state: c.state().name().to_string(),
                callerid: c.cid.num.clone(),
                calleridname: c.cid.name.clone(),
                uniqueid: c.uniqueid().to_string(),
            });
        }
        drop(c);
        debug!("Requested channel {} from {}", chan.name(), tech);
        Ok(chan)
    }

    /// Request a channel, call it and wait up to `timeout` for an answer.
    ///
    /// Only an answered channel is returned; anything else is hung up and
    /// reported through `state`.
    pub async fn request_and_dial(
        &self,
        tech: &str,
        format: Format,
        data: &str,
        timeout: Option<Duration>,
        cid_num: Option<&str>,
        cid_name: Option<&str>,
    ) -> Result<DialOutcome> {
        let chan = match self.request(tech, format, data).await {
            Ok(chan) => chan,
            Err(e) => {
                info!("Unable to request channel {}/{}: {}", tech, data, e);
                let state = match e {
                    ChannelError::RequestFailed { cause, .. } => cause_to_control(cause),
                    _ => None,
                };
                return Ok(DialOutcome { channel: None, state });
            }
        };

        chan.set_callerid(cid_num, cid_name, cid_num).await;

        let mut state = None;
        match chan.call(data, timeout).await {
            Ok(()) => {
                let mut remaining = timeout;
                while remaining.map_or(true, |r| !r.is_zero()) && chan.state().await != ChannelState::Up {
                    match waitfor(&chan, remaining).await {
                        Ok(WaitStatus::Ready { remaining: r }) | Ok(WaitStatus::Interrupted { remaining: r }) => {
                            remaining = r;
                        }
                        Ok(WaitStatus::TimedOut) | Err(_) => break,
                    }
                    let Some(f) = chan.read().await else {
                        state = Some(ControlType::Hangup);
                        break;
                    };
                    if let FrameKind::Control(control) = f.kind {
                        match control {
                            ControlType::Ringing => state = Some(control),
                            ControlType::Busy | ControlType::Congestion | ControlType::Answer => {
                                state = Some(control);
                                break;
                            }
                            ControlType::Progress | ControlType::StopIndication => {}
                            other => info!("Don't know what to do with control frame {}", other.name()),
                        }
                    }
                }
            }
            Err(e) => info!("Unable to call channel {}/{}: {}", tech, data, e),
        }

        if chan.state().await == ChannelState::Up {
            return Ok(DialOutcome {
                channel: Some(chan),
                state,
            });
        }

        {
            let mut c = chan.lock().await;
            match state {
                Some(ControlType::Busy) => c.hangupcause = HangupCause::UserBusy,
                Some(ControlType::Congestion) => c.hangupcause = HangupCause::NormalCircuitCongestion,
                _ => c.hangupcause = HangupCause::NoAnswer,
            }
            if let Some(cdr) = c.cdr.as_mut() {
                cdr.setapp("Call", data);
            }
        }
        chan.hangup().await?;
        Ok(DialOutcome { channel: None, state })
    }
}
