//! Channel control operations

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{CallerId, Channel, ChannelFlags, ChannelInner, ChannelState, HangupCause, SoftHangup, DEBUGCHAN_FLAG};
use crate::error::{ChannelError, Result};
use crate::events::ChannelEvent;
use crate::format::Format;
use crate::frame::{ControlType, Frame, FrameKind};
use crate::generator::{Generator, ToneGenerator};
use crate::masquerade::do_masquerade;
use crate::monitor::ChannelMonitor;
use crate::spy::{Spy, SpyHandle};

impl ChannelInner {
    /// True when the channel should be hung up. A passed hangup deadline
    /// is turned into a TIMEOUT soft hangup here.
    pub fn check_hangup(&mut self) -> bool {
        if !self.softhangup.is_empty() {
            return true;
        }
        if self.tech_pvt.is_none() {
            return true;
        }
        match self.whentohangup {
            Some(deadline) if deadline <= tokio::time::Instant::now() => {
                self.softhangup.insert(SoftHangup::TIMEOUT);
                true
            }
            _ => false,
        }
    }

    /// Flag a soft hangup and wake any reader
    pub fn softhangup_nolock(&mut self, cause: SoftHangup) {
        debug!("Soft-Hanging up channel '{}'", self.name());
        self.softhangup.insert(cause);
        let _ = self.queue_frame(Frame::null());
    }

    /// Clear soft hangup bits, typically UNBRIDGE after a bridge consumed it
    pub fn clear_softhangup(&mut self, cause: SoftHangup) {
        self.softhangup.remove(cause);
    }

    /// Schedule an absolute hangup `offset` from now; `None` cancels it
    pub fn set_whentohangup(&mut self, offset: Option<Duration>) {
        self.whentohangup = offset
            .filter(|d| !d.is_zero())
            .map(|d| tokio::time::Instant::now() + d);
        let _ = self.queue_frame(Frame::null());
    }

    /// Change state, publishing Newchannel (from DOWN) or Newstate
    pub fn setstate(&mut self, state: ChannelState) {
        let oldstate = self.state;
        if oldstate == state {
            return;
        }
        self.state = state;
        let name = self.name();
        self.services.device_state_changed(&name);
        let (channel, state, callerid, calleridname, uniqueid) = (
            name,
            state.name().to_string(),
            self.cid.num.clone(),
            self.cid.name.clone(),
            self.uniqueid.clone(),
        );
        self.services.emit(if oldstate == ChannelState::Down {
            ChannelEvent::Newchannel {
                channel,
                state,
                callerid,
                calleridname,
                uniqueid,
            }
        } else {
            ChannelEvent::Newstate {
                channel,
                state,
                callerid,
                calleridname,
                uniqueid,
            }
        });
    }

    /// Update caller identity; `None` leaves a field unchanged
    pub fn set_callerid(&mut self, num: Option<&str>, name: Option<&str>, ani: Option<&str>) {
        if let Some(num) = num {
            self.cid.num = Some(num.to_string());
        }
        if let Some(name) = name {
            self.cid.name = Some(name.to_string());
        }
        if let Some(ani) = ani {
            self.cid.ani = Some(ani.to_string());
        }
        if let Some(cdr) = self.cdr.as_mut() {
            cdr.setcid(&self.cid);
        }
        self.services.emit(ChannelEvent::Newcallerid {
            channel: self.name(),
            callerid: self.cid.num.clone(),
            calleridname: self.cid.name.clone(),
            uniqueid: self.uniqueid.clone(),
            cid_callingpres: self.cid.pres,
        });
    }

    pub fn set_accountcode(&mut self, account: &str) {
        self.accountcode = account.to_string();
        if let Some(cdr) = self.cdr.as_mut() {
            cdr.setaccount(account);
        }
    }

    /// Rename the channel, publishing a Rename event
    pub fn change_name(&mut self, newname: impl Into<String>) {
        let newname = newname.into();
        let oldname = std::mem::replace(&mut self.ident.write().name, newname.clone());
        self.services.emit(ChannelEvent::Rename {
            oldname,
            newname,
            uniqueid: self.uniqueid.clone(),
        });
    }

    pub fn set_var(&mut self, name: &str, value: &str) {
        match self.vars.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.vars.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get_var(&self, name: &str) -> Option<&str> {
        self.vars.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn remove_var(&mut self, name: &str) -> Option<String> {
        let pos = self.vars.iter().position(|(k, _)| k == name)?;
        Some(self.vars.remove(pos).1)
    }

    /// Start buffering incoming DTMF. Returns whether it was already deferred.
    pub fn defer_dtmf(&mut self) -> bool {
        let was = self.flags.contains(ChannelFlags::DEFER_DTMF);
        self.flags.insert(ChannelFlags::DEFER_DTMF);
        was
    }

    /// Stop buffering DTMF; buffered digits are returned by subsequent reads
    pub fn undefer_dtmf(&mut self) {
        self.flags.remove(ChannelFlags::DEFER_DTMF);
    }

    /// Dump every frame read or written at debug level
    pub fn set_frame_debug(&mut self, on: bool) {
        if on {
            self.fin |= DEBUGCHAN_FLAG;
            self.fout |= DEBUGCHAN_FLAG;
        } else {
            self.fin &= !DEBUGCHAN_FLAG;
            self.fout &= !DEBUGCHAN_FLAG;
        }
    }

    pub fn frame_debug(&self) -> bool {
        self.fin & DEBUGCHAN_FLAG != 0
    }

    /// Install a generator, releasing any previous one
    pub fn activate_generator(&mut self, mut gen: Box<dyn Generator>) -> Result<()> {
        self.deactivate_generator();
        gen.start(self)?;
        debug!("Activated generator {} on {}", gen.name(), self.name());
        self.generator = Some(gen);
        Ok(())
    }

    pub fn deactivate_generator(&mut self) {
        if let Some(mut gen) = self.generator.take() {
            gen.release(self);
        }
    }

    /// Play a tone cadence; ordinary writes stop it
    pub fn playtones_start(&mut self, tone: ToneGenerator) -> Result<()> {
        self.activate_generator(Box::new(tone.interruptible()))
    }

    pub fn playtones_stop(&mut self) {
        self.deactivate_generator();
    }

    /// Attach a passive tap; frames are delivered in `format` when given
    pub fn attach_spy(&mut self, capacity: usize, format: Option<Format>) -> SpyHandle {
        let (spy, handle) = Spy::new(capacity, format);
        self.spies.push(spy);
        handle
    }

    /// End every spy; their receivers see end of stream
    pub fn detach_spies(&mut self) {
        self.spies.clear();
    }

    pub fn start_monitor(&mut self, monitor: ChannelMonitor) {
        self.insmpl = 0;
        self.outsmpl = 0;
        self.monitor = Some(monitor);
    }

    pub fn stop_monitor(&mut self) -> Option<ChannelMonitor> {
        self.monitor.take()
    }

    pub(crate) async fn send_digit_locked(&mut self, digit: char) -> Result<()> {
        let tech = self.tech.clone();
        match tech.send_digit(self, digit).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !e.is_not_supported() {
                    debug!("Native digit send failed on {}: {}, using tones", self.name(), e);
                }
                let dtmf = self.services.config.dtmf.clone();
                match ToneGenerator::dtmf(
                    digit,
                    dtmf.digit_duration_ms as u32,
                    dtmf.digit_gap_ms as u32,
                    dtmf.tone_volume,
                ) {
                    Some(tone) => self.activate_generator(Box::new(tone)),
                    None => {
                        warn!("Unable to generate DTMF tone '{}' for '{}'", digit, self.name());
                        Ok(())
                    }
                }
            }
        }
    }

    pub(crate) async fn indicate_locked(&mut self, condition: ControlType) -> Result<()> {
        if self.is_zombie() || self.check_hangup() {
            return Err(ChannelError::hung_up(self.name()));
        }
        let tech = self.tech.clone();
        let res = tech.indicate(self, condition).await;
        if res.is_ok() {
            return res;
        }
        let volume = self.services.config.dtmf.tone_volume;
        let tone = match condition {
            ControlType::Ringing => Some(ToneGenerator::ringback(volume)),
            ControlType::Busy => Some(ToneGenerator::busy(volume)),
            ControlType::Congestion => Some(ToneGenerator::congestion(volume)),
            _ => None,
        };
        if let Some(tone) = tone {
            debug!(
                "Driver for channel '{}' does not support indication {}, emulating it",
                self.name(),
                condition.name()
            );
            return self.playtones_start(tone);
        }
        match condition {
            ControlType::StopIndication => {
                self.playtones_stop();
                Ok(())
            }
            ControlType::Progress
            | ControlType::Proceeding
            | ControlType::Hold
            | ControlType::Unhold
            | ControlType::VidUpdate => Ok(()),
            _ => {
                warn!("Unable to handle indication {} for '{}'", condition.name(), self.name());
                res
            }
        }
    }

    /// Release every sub-resource owned by the channel
    pub(crate) fn release_resources(&mut self) {
        self.free_translation();
        self.cid = CallerId::default();
        self.detach_spies();
        self.clear_queue();
        self.vars.clear();
        self.monitor = None;
        self.deactivate_generator();
        self.masq = None;
        self.masqr = None;
    }
}

impl Channel {
    /// Request a soft hangup and wake anyone blocked on the channel
    pub async fn softhangup(self: &Arc<Self>, cause: SoftHangup) {
        self.lock().await.softhangup_nolock(cause);
        self.interrupt_blocker();
    }

    pub async fn check_hangup(self: &Arc<Self>) -> bool {
        self.lock().await.check_hangup()
    }

    pub async fn set_whentohangup(self: &Arc<Self>, offset: Option<Duration>) {
        self.lock().await.set_whentohangup(offset);
    }

    pub async fn setstate(self: &Arc<Self>, state: ChannelState) {
        self.lock().await.setstate(state);
    }

    pub async fn state(self: &Arc<Self>) -> ChannelState {
        self.lock().await.state
    }

    pub async fn set_callerid(self: &Arc<Self>, num: Option<&str>, name: Option<&str>, ani: Option<&str>) {
        self.lock().await.set_callerid(num, name, ani);
    }

    pub async fn change_name(self: &Arc<Self>, newname: impl Into<String>) {
        self.lock().await.change_name(newname);
    }

    pub async fn set_var(self: &Arc<Self>, name: &str, value: &str) {
        self.lock().await.set_var(name, value);
    }

    pub async fn get_var(self: &Arc<Self>, name: &str) -> Option<String> {
        self.lock().await.get_var(name).map(str::to_string)
    }

    pub async fn defer_dtmf(self: &Arc<Self>) -> bool {
        self.lock().await.defer_dtmf()
    }

    pub async fn undefer_dtmf(self: &Arc<Self>) {
        self.lock().await.undefer_dtmf();
    }

    pub async fn set_frame_debug(self: &Arc<Self>, on: bool) {
        self.lock().await.set_frame_debug(on);
    }

    pub async fn activate_generator(self: &Arc<Self>, gen: Box<dyn Generator>) -> Result<()> {
        self.lock().await.activate_generator(gen)
    }

    pub async fn deactivate_generator(self: &Arc<Self>) {
        self.lock().await.deactivate_generator();
    }

    pub async fn attach_spy(self: &Arc<Self>, capacity: usize, format: Option<Format>) -> SpyHandle {
        self.lock().await.attach_spy(capacity, format)
    }

    /// Answer an inbound call that is ringing
    pub async fn answer(self: &Arc<Self>) -> Result<()> {
        let mut chan = self.lock().await;
        if chan.is_zombie() || chan.check_hangup() {
            return Err(ChannelError::hung_up(chan.name()));
        }
        match chan.state {
            ChannelState::Ringing | ChannelState::Ring => {
                let tech = chan.tech.clone();
                let res = match tech.answer(&mut chan).await {
                    Err(e) if e.is_not_supported() => Ok(()),
                    other => other,
                };
                chan.setstate(ChannelState::Up);
                if let Some(cdr) = chan.cdr.as_mut() {
                    cdr.answer();
                }
                res
            }
            ChannelState::Up => {
                if let Some(cdr) = chan.cdr.as_mut() {
                    cdr.answer();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Place an outbound call on a requested channel
    pub async fn call(self: &Arc<Self>, dest: &str, timeout: Option<Duration>) -> Result<()> {
        let mut chan = self.lock().await;
        if chan.is_zombie() || chan.check_hangup() {
            return Err(ChannelError::hung_up(chan.name()));
        }
        let tech = chan.tech.clone();
        tech.call(&mut chan, dest, timeout).await?;
        chan.flags.insert(ChannelFlags::OUTGOING);
        Ok(())
    }

    /// Ask the technology to transfer the call
    pub async fn transfer(self: &Arc<Self>, dest: &str) -> Result<()> {
        let mut chan = self.lock().await;
        if chan.is_zombie() || chan.check_hangup() {
            return Err(ChannelError::hung_up(chan.name()));
        }
        let tech = chan.tech.clone();
        tech.transfer(&mut chan, dest).await
    }

    /// Indicate a condition to the far end, emulating common tones when the
    /// technology cannot
    pub async fn indicate(self: &Arc<Self>, condition: ControlType) -> Result<()> {
        self.lock().await.indicate_locked(condition).await
    }

    /// Send a DTMF digit, natively or as generated tones
    pub async fn send_digit(self: &Arc<Self>, digit: char) -> Result<()> {
        let mut chan = self.lock().await;
        if chan.is_zombie() || chan.check_hangup() {
            return Err(ChannelError::hung_up(chan.name()));
        }
        chan.send_digit_locked(digit).await
    }

    /// Send text; a technology without text support silently accepts it
    pub async fn send_text(self: &Arc<Self>, text: &str) -> Result<()> {
        let mut chan = self.lock().await;
        if chan.is_zombie() || chan.check_hangup() {
            return Err(ChannelError::hung_up(chan.name()));
        }
        let tech = chan.tech.clone();
        match tech.send_text(&mut chan, text).await {
            Err(e) if e.is_not_supported() => Ok(()),
            other => other,
        }
    }

    /// Send HTML; fails with NotSupported when the technology lacks it
    pub async fn send_html(self: &Arc<Self>, subclass: u32, data: Bytes) -> Result<()> {
        let mut chan = self.lock().await;
        let tech = chan.tech.clone();
        tech.send_html(&mut chan, subclass, &data).await
    }

    pub async fn supports_html(self: &Arc<Self>) -> bool {
        self.lock().await.tech.features().send_html
    }

    /// Write a video frame; a technology without a video path drops it
    pub async fn write_video(self: &Arc<Self>, frame: &Frame) -> Result<()> {
        if !matches!(frame.kind, FrameKind::Video(_)) {
            return Err(ChannelError::invalid("write_video needs a video frame"));
        }
        self.write(frame).await
    }

    pub async fn set_option(self: &Arc<Self>, option: u32, data: &[u8]) -> Result<()> {
        let mut chan = self.lock().await;
        let tech = chan.tech.clone();
        tech.setoption(&mut chan, option, data).await
    }

    /// Hang up and free the channel.
    ///
    /// A pending masquerade is completed first. A channel that is about to be
    /// masqueraded into another is only marked as a zombie here and freed by
    /// the masquerade.
    pub async fn hangup(self: &Arc<Self>) -> Result<()> {
        let mut chan = self.lock().await;
        if chan.masq.is_some() {
            chan = match do_masquerade(chan).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to perform masquerade: {}", e);
                    self.lock().await
                }
            };
        }
        if chan.masq.is_some() {
            warn!("{} getting hung up, but someone is trying to masq into us?!?", chan.name());
            return Ok(());
        }
        if chan.masqr.is_some() {
            chan.flags.insert(ChannelFlags::ZOMBIE);
            return Ok(());
        }

        chan.free_translation();
        chan.deactivate_generator();
        chan.detach_spies();

        let cause = chan.hangupcause;
        if let Some(mut cdr) = chan.cdr.take() {
            cdr.set_disposition(cause);
            cdr.end();
            let services = chan.services.clone();
            cdr.detach(services.cdr_sink(), services.config.cdr.unanswered);
        }

        if self.is_blocking() {
            warn!("Hard hangup called on {} while a wait is blocked on it", chan.name());
        }

        if !chan.is_zombie() {
            debug!("Hanging up channel '{}'", chan.name());
            let tech = chan.tech.clone();
            if let Err(e) = tech.hangup(&mut chan).await {
                warn!("Technology hangup failed on {}: {}", chan.name(), e);
            }
            if chan.tech_pvt.is_some() {
                warn!("Channel '{}' may not have been hung up properly", chan.name());
            }
        } else {
            debug!("Hanging up zombie '{}'", chan.name());
        }

        let services = chan.services.clone();
        let name = chan.name();
        drop(chan);

        services.emit(ChannelEvent::Hangup {
            channel: name,
            uniqueid: self.uniqueid().to_string(),
            cause: cause.code(),
            cause_txt: cause.description().to_string(),
        });
        services.free_channel(self).await;
        Ok(())
    }

    /// Hang up with a specific cause
    pub async fn hangup_with_cause(self: &Arc<Self>, cause: HangupCause) -> Result<()> {
        self.lock().await.hangupcause = cause;
        self.hangup().await
    }
}

/// Parse a call/pickup group list such as `"1,3-5"` into a bitmask
pub fn get_group(s: &str) -> u64 {
    let mut group = 0u64;
    for piece in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let range = match piece.split_once('-') {
            Some((a, b)) => a.trim().parse::<u32>().ok().zip(b.trim().parse::<u32>().ok()),
            None => piece.parse::<u32>().ok().map(|n| (n, n)),
        };
        match range {
            Some((start, end)) => {
                for bit in start..=end.min(63) {
                    group |= 1u64 << bit;
                }
            }
            None => warn!("Ignoring invalid group '{}'", piece),
        }
    }
    group
}

/// Print a group bitmask as a comma separated list
pub fn print_group(group: u64) -> String {
    (0..64)
        .filter(|bit| group & (1u64 << bit) != 0)
        .map(|bit| bit.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_parse_print() {
        assert_eq!(get_group("1,3-5"), 0b111010);
        assert_eq!(print_group(get_group("1,3-5")), "1,3,4,5");
        assert_eq!(get_group(""), 0);
        assert_eq!(get_group("2, x ,63"), (1 << 2) | (1 << 63));
    }
}
