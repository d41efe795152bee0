//! Read/write pipeline

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{framecount_inc, Channel, ChannelFlags, ChannelInner, ChannelState, LockedChannel, SoftHangup, DEBUGCHAN_FLAG};
use crate::descriptor::TIMING_FD;
use crate::error::{ChannelError, Result};
use crate::frame::{frame_dump, ControlType, Frame, FrameKind};
use crate::masquerade::do_masquerade;
use crate::monitor::record_frame;
use crate::spy::{queue_frame_to_spies, SpyDirection};

/// Samples requested from a generator on each timing tick
pub(crate) const TIMING_TICK_SAMPLES: usize = 160;

impl Channel {
    /// Read one frame.
    ///
    /// `None` means the channel is hung up; every later read returns `None`
    /// too. A null frame means "nothing for the caller this time".
    pub async fn read(self: &Arc<Self>) -> Option<Frame> {
        let chan = self.lock().await;
        read_locked(chan).await
    }

    /// Write one frame. A technology failure flags a device soft hangup and
    /// is also returned to the caller.
    pub async fn write(self: &Arc<Self>, frame: &Frame) -> Result<()> {
        let mut chan = self.lock().await;
        if chan.is_zombie() || chan.check_hangup() {
            return Err(ChannelError::hung_up(chan.name()));
        }
        if chan.masq.is_some() {
            chan = do_masquerade(chan).await.map_err(|e| {
                warn!("Failed to perform masquerade: {}", e);
                e
            })?;
        }
        if chan.masqr.is_some() {
            return Ok(());
        }
        write_locked(&mut chan, frame, false).await
    }
}

pub(crate) async fn read_locked(mut chan: LockedChannel) -> Option<Frame> {
    if chan.masq.is_some() {
        return match do_masquerade(chan).await {
            Ok(_) => Some(Frame::null()),
            Err(e) => {
                warn!("Failed to perform masquerade: {}", e);
                None
            }
        };
    }

    let c: &mut ChannelInner = &mut chan;
    if c.is_zombie() || c.check_hangup() {
        c.deactivate_generator();
        return None;
    }

    let prestate = c.state;
    if !c.flags.contains(ChannelFlags::DEFER_DTMF) && !c.dtmfq.is_empty() {
        let digit = c.dtmfq.remove(0);
        return Some(Frame::dtmf(digit));
    }

    if c.fdno == Some(TIMING_FD) {
        if let Some(timing) = c.timing.clone() {
            c.fdno = None;
            timing.consume();
            if c.generator.is_some() {
                run_generator(c, TIMING_TICK_SAMPLES).await;
            }
            return Some(Frame::null());
        }
    }

    let mut f = if !c.readq.is_empty() {
        c.dequeue().filter(|fr| !fr.is_hangup())
    } else {
        let tech = c.tech.clone();
        if c.flags.contains(ChannelFlags::EXCEPTION) {
            c.flags.remove(ChannelFlags::EXCEPTION);
            match tech.exception(c).await {
                Ok(fr) => fr,
                Err(e) if e.is_not_supported() => {
                    warn!("Exception flag set on '{}', but no exception handler", c.name());
                    Some(Frame::null())
                }
                Err(e) => {
                    warn!("Exception handler failed on {}: {}", c.name(), e);
                    None
                }
            }
        } else {
            tech.read(c).await
        }
    };

    if let Some(fr) = f.take() {
        f = Some(match fr.kind {
            FrameKind::Voice(fmt) if !c.nativeformats.intersects(fmt) => {
                info!(
                    "Dropping incompatible voice frame on {} of format {} since our native format has changed to {}",
                    c.name(),
                    fmt.name(),
                    c.nativeformats
                );
                Frame::null()
            }
            FrameKind::Voice(_) => {
                if !c.spies.is_empty() {
                    queue_frame_to_spies(&mut c.spies, SpyDirection::Read, &fr, &c.services.translators);
                }
                if let Some(mon) = c.monitor.as_mut().filter(|m| m.is_running()) {
                    if let Some(stream) = mon.read_stream.as_mut() {
                        let name = c.ident.read().name.clone();
                        record_frame(stream.as_mut(), &fr, &mut c.insmpl, c.outsmpl, &name);
                    }
                }
                match c.readtrans.as_mut() {
                    Some(trans) => trans.translate(&fr).unwrap_or_else(Frame::null),
                    None => fr,
                }
            }
            _ => fr,
        });
    }

    match f.as_ref().map(|fr| fr.kind) {
        None => {
            c.softhangup.insert(SoftHangup::DEV);
            c.deactivate_generator();
            if let Some(cdr) = c.cdr.as_mut() {
                cdr.end();
            }
        }
        Some(FrameKind::Dtmf(digit)) if c.flags.contains(ChannelFlags::DEFER_DTMF) => {
            if c.dtmfq.len() < c.services.config.queue.deferred_dtmf_capacity {
                c.dtmfq.push(digit);
            } else {
                warn!("Dropping deferred DTMF digits on {}", c.name());
            }
            f = Some(Frame::null());
        }
        Some(FrameKind::Control(ControlType::Answer)) => {
            if !c.flags.contains(ChannelFlags::OUTGOING) {
                debug!("Ignoring answer on an inbound call {}", c.name());
                f = Some(Frame::null());
            } else if prestate == ChannelState::Up {
                debug!("Dropping duplicate answer on {}", c.name());
                f = Some(Frame::null());
            } else {
                c.setstate(ChannelState::Up);
                if let Some(cdr) = c.cdr.as_mut() {
                    cdr.answer();
                }
            }
        }
        _ => {}
    }

    if let Some(fr) = f.as_ref() {
        if fr.is_voice() && c.generator.is_some() && c.timing.is_none() {
            let samples = if fr.samples > 0 { fr.samples } else { TIMING_TICK_SAMPLES };
            run_generator(c, samples).await;
        }
    }

    if c.fin & DEBUGCHAN_FLAG != 0 {
        frame_dump(&c.name(), f.as_ref(), "<<");
    }
    c.fin = framecount_inc(c.fin);
    f
}

/// Write with the channel already locked and masquerade handled.
/// `from_generator` skips the active-generator check.
pub(crate) async fn write_locked(c: &mut ChannelInner, frame: &Frame, from_generator: bool) -> Result<()> {
    if c.is_zombie() || c.check_hangup() {
        return Err(ChannelError::hung_up(c.name()));
    }
    if !from_generator {
        if let Some(gen) = c.generator.as_ref() {
            if c.flags.contains(ChannelFlags::WRITE_INT) || gen.writes_interrupt() {
                c.deactivate_generator();
            } else {
                return Ok(());
            }
        }
    }

    if c.fout & DEBUGCHAN_FLAG != 0 {
        frame_dump(&c.name(), Some(frame), ">>");
    }

    let tech = c.tech.clone();
    let res = match frame.kind {
        FrameKind::Control(control) => {
            warn!("Don't know how to handle control frame {} on write", control.name());
            Ok(())
        }
        FrameKind::Dtmf(digit) => c.send_digit_locked(digit).await,
        FrameKind::Text => tech.send_text(c, &String::from_utf8_lossy(&frame.data)).await,
        FrameKind::Html(subclass) => tech.send_html(c, subclass, &frame.data).await,
        FrameKind::Video(_) => tech.write_video(c, frame).await,
        FrameKind::Null => Ok(()),
        FrameKind::Voice(fmt) => {
            let out = if fmt == c.rawwriteformat {
                Some(frame.clone())
            } else {
                match c.writetrans.as_mut() {
                    Some(trans) => trans.translate(frame),
                    None => Some(frame.clone()),
                }
            };
            match out {
                Some(out) => {
                    if !c.spies.is_empty() {
                        queue_frame_to_spies(&mut c.spies, SpyDirection::Write, &out, &c.services.translators);
                    }
                    if let Some(mon) = c.monitor.as_mut().filter(|m| m.is_running()) {
                        if let Some(stream) = mon.write_stream.as_mut() {
                            let name = c.ident.read().name.clone();
                            record_frame(stream.as_mut(), &out, &mut c.outsmpl, c.insmpl, &name);
                        }
                    }
                    tech.write(c, &out).await
                }
                None => Ok(()),
            }
        }
        FrameKind::Image(_) | FrameKind::Modem(_) | FrameKind::Cng(_) => tech.write(c, frame).await,
    };

    match res {
        Ok(()) => {
            c.fout = framecount_inc(c.fout);
            Ok(())
        }
        Err(e) if e.is_not_supported() => Ok(()),
        Err(e) => {
            debug!("Write failed on {}: {}", c.name(), e);
            c.softhangup.insert(SoftHangup::DEV);
            Err(e)
        }
    }
}

/// Ask the active generator for `samples` samples and write the result
pub(crate) async fn run_generator(c: &mut ChannelInner, samples: usize) {
    let Some(mut gen) = c.generator.take() else {
        return;
    };
    match gen.generate(samples) {
        Some(frame) => {
            c.generator = Some(gen);
            if let Err(e) = write_locked(c, &frame, true).await {
                debug!("Generator write failed on {}: {}", c.name(), e);
            }
        }
        None => {
            debug!("Auto-deactivating generator {} on {}", gen.name(), c.name());
            gen.release(c);
        }
    }
}
