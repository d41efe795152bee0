//! Bridging two channels
//!
//! [`channel_bridge`] first tries a native bridge, where the technology moves
//! media itself, and otherwise relays frames between the channels in
//! [`generic_bridge`]. A time limit with optional warning prompts wraps both.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::autoservice::{autoservice_start, autoservice_stop};
use crate::channel::{channel_make_compatible, Channel, ChannelFlags, SoftHangup};
use crate::config::JitterBufferSettings;
use crate::error::{ChannelError, Result};
use crate::events::ChannelEvent;
use crate::format::Format;
use crate::frame::{ControlType, Frame, FrameKind};
use crate::jitterbuf::{JbPut, JitterBuffer};
use crate::tech::{ChannelTech, TechProperties};
use crate::waitfor::waitfor_n;

flag_set! {
    /// Behaviour of a bridge
    BridgeFlags {
        /// DTMF from channel 0 ends the bridge
        WATCH_DTMF_0 = 0x01,
        /// DTMF from channel 1 ends the bridge
        WATCH_DTMF_1 = 0x02,
        /// Do not end the bridge on control frames
        IGNORE_SIGS = 0x04,
    }
}

/// Per-party bridge features
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeFeatures {
    /// Hear the start, warning and end prompts of a time limit
    pub play_warning: bool,
    /// Party may redirect the call; rules out a native bridge
    pub redirect: bool,
}

/// Bridge configuration, owned by the caller
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub flags: BridgeFlags,
    /// Features of channel 0
    pub features_caller: BridgeFeatures,
    /// Features of channel 1
    pub features_callee: BridgeFeatures,
    /// Start of the time limit clock; set on first use when empty
    pub start_time: Option<Instant>,
    pub timelimit: Option<Duration>,
    /// Warn this long before the limit
    pub play_warning: Option<Duration>,
    /// Repeat the warning this often
    pub warning_freq: Option<Duration>,
    pub warning_sound: Option<String>,
    pub start_sound: Option<String>,
    pub end_sound: Option<String>,
    /// End the bridge after this long without a time limit
    pub feature_timer: Option<Duration>,
    /// First bridge of the call. Cleared by the bridge.
    pub firstpass: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            flags: BridgeFlags::empty(),
            features_caller: BridgeFeatures::default(),
            features_callee: BridgeFeatures::default(),
            start_time: None,
            timelimit: None,
            play_warning: None,
            warning_freq: None,
            warning_sound: None,
            start_sound: None,
            end_sound: None,
            feature_timer: None,
            firstpass: true,
        }
    }
}

/// How a bridge attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeResult {
    Complete,
    Failed,
    FailedNowarn,
    /// Something changed underneath; bridge again
    Retry,
}

/// Result of a bridge together with the frame that ended it
#[derive(Debug)]
pub struct BridgeOutcome {
    pub result: BridgeResult,
    /// Control or watched DTMF frame that ended the bridge
    pub frame: Option<Frame>,
    /// Channel the ending frame (or hangup) came from
    pub who: Option<Arc<Channel>>,
}

impl BridgeOutcome {
    pub fn new(result: BridgeResult) -> Self {
        Self {
            result,
            frame: None,
            who: None,
        }
    }

    fn with_frame(result: BridgeResult, frame: Option<Frame>, who: &Arc<Channel>) -> Self {
        Self {
            result,
            frame,
            who: Some(who.clone()),
        }
    }
}

/// Channel fields the bridge loop looks at, taken under a short lock
struct BridgeView {
    tech: Arc<dyn ChannelTech>,
    unusable: bool,
    unbridge_only: bool,
    nativeformats: Format,
    readformat: Format,
    writeformat: Format,
    generator: bool,
    monitored: bool,
    pvt_generation: u64,
}

async fn view(chan: &Arc<Channel>) -> BridgeView {
    let mut c = chan.lock().await;
    let unbridge_only = c.softhangup == SoftHangup::UNBRIDGE;
    let unusable = !unbridge_only && (c.is_zombie() || c.check_hangup());
    BridgeView {
        tech: c.tech.clone(),
        unusable,
        unbridge_only,
        nativeformats: c.nativeformats,
        readformat: c.readformat,
        writeformat: c.writeformat,
        generator: c.generator.is_some(),
        monitored: c.monitor.is_some() || !c.spies.is_empty(),
        pvt_generation: c.pvt_generation,
    }
}

/// Clear a lone UNBRIDGE soft hangup. Returns whether one was cleared.
async fn clear_unbridge(chan: &Arc<Channel>) -> bool {
    let mut c = chan.lock().await;
    if c.softhangup == SoftHangup::UNBRIDGE {
        c.softhangup = SoftHangup::empty();
        true
    } else {
        false
    }
}

async fn handle_unbridge(c0: &Arc<Channel>, c1: &Arc<Channel>) -> bool {
    let cleared0 = clear_unbridge(c0).await;
    let cleared1 = clear_unbridge(c1).await;
    if cleared0 || cleared1 {
        c0.set_bridge(Some(c1));
        c1.set_bridge(Some(c0));
        true
    } else {
        false
    }
}

async fn set_nbridge(chan: &Arc<Channel>, on: bool) {
    chan.lock().await.set_flag(ChannelFlags::NBRIDGE, on);
}

/// Record each side's peer name in `BRIDGEPEER`
async fn update_bridgepeer(c0: &Arc<Channel>, c1: &Arc<Channel>) {
    let (n0, n1) = (c0.name(), c1.name());
    c0.lock().await.set_var("BRIDGEPEER", &n1);
    c1.lock().await.set_var("BRIDGEPEER", &n0);
}

fn link_event(c0: &Arc<Channel>, c1: &Arc<Channel>, link: bool) -> ChannelEvent {
    let (channel1, channel2) = (c0.name(), c1.name());
    let (uniqueid1, uniqueid2) = (c0.uniqueid().to_string(), c1.uniqueid().to_string());
    if link {
        ChannelEvent::Link {
            channel1,
            channel2,
            uniqueid1,
            uniqueid2,
        }
    } else {
        ChannelEvent::Unlink {
            channel1,
            channel2,
            uniqueid1,
            uniqueid2,
        }
    }
}

/// Play `sound` to `chan` while `peer` is kept serviced. `"timeleft"`
/// announces `remain` seconds as minutes and seconds.
pub async fn bridge_playfile(chan: &Arc<Channel>, peer: &Arc<Channel>, sound: &str, remain: i64) {
    if autoservice_start(peer).await.is_err() {
        return;
    }
    let prompts = chan.lock().await.services().prompts().clone();

    let (mut min, mut sec) = (0, 0);
    if remain > 0 {
        if remain / 60 > 1 {
            min = remain / 60;
            sec = remain % 60;
        } else {
            sec = remain;
        }
    }

    let played = async {
        if sound == "timeleft" {
            prompts.stream_and_wait(chan, "vm-youhave").await?;
            if min > 0 {
                prompts.say_number(chan, min).await?;
                prompts.stream_and_wait(chan, "queue-minutes").await?;
            }
            if sec > 0 {
                prompts.say_number(chan, sec).await?;
                prompts.stream_and_wait(chan, "queue-seconds").await?;
            }
            Ok(())
        } else {
            prompts.stream_and_wait(chan, sound).await
        }
    }
    .await;
    if let Err(e) = played {
        debug!("Prompt '{}' on {} stopped: {}", sound, chan.name(), e);
    }

    if let Err(e) = autoservice_stop(peer).await {
        debug!("Autoservice on {} ended with {}", peer.name(), e);
    }
}

/// Which side's jitter buffer to use: frames written to side `i` are
/// buffered when `use[i]` is set
fn jb_usecheck(props: [TechProperties; 2], settings: &JitterBufferSettings) -> [bool; 2] {
    let wants = |i: usize| {
        let other = props[1 - i];
        ((!props[i].wants_jitter && other.creates_jitter) || (settings.force && other.creates_jitter))
            && settings.enabled
    };
    [wants(0), wants(1)]
}

async fn jb_deliver(jbs: &mut [Option<JitterBuffer>; 2], chans: &[Arc<Channel>; 2]) {
    let now = Instant::now();
    for (jb, chan) in jbs.iter_mut().zip(chans.iter()) {
        let Some(jb) = jb.as_mut() else {
            continue;
        };
        while let Some(frame) = jb.get(now) {
            if let Err(e) = chan.write(&frame).await {
                debug!("Jitter buffer delivery to {} failed: {}", chan.name(), e);
            }
        }
    }
}

fn jb_next_wakeup(jbs: &[Option<JitterBuffer>; 2], to: Option<Duration>) -> Option<Duration> {
    let now = Instant::now();
    jbs.iter()
        .flatten()
        .filter_map(|jb| jb.next_delivery())
        .map(|at| at.saturating_duration_since(now))
        .chain(to)
        .min()
}

/// Relay frames between `c0` and `c1` until something ends the bridge.
///
/// Returns `Retry` when either side changed technology data or native
/// formats, or when `bridge_end` passed under a time limit.
pub async fn generic_bridge(
    c0: &Arc<Channel>,
    c1: &Arc<Channel>,
    config: &BridgeConfig,
    bridge_end: Option<Instant>,
) -> Result<BridgeOutcome> {
    let chans = [c0.clone(), c1.clone()];
    let (v0, v1) = (view(c0).await, view(c1).await);
    let (pvt0, pvt1) = (v0.pvt_generation, v1.pvt_generation);
    let (o0native, o1native) = (v0.nativeformats, v1.nativeformats);
    let watch_dtmf = [
        config.flags.contains(BridgeFlags::WATCH_DTMF_0),
        config.flags.contains(BridgeFlags::WATCH_DTMF_1),
    ];

    let jb_settings = c0.lock().await.services().config.jitterbuffer.clone();
    let use_jb = jb_usecheck([v0.tech.properties(), v1.tech.properties()], &jb_settings);
    let mut jbs: [Option<JitterBuffer>; 2] = [
        use_jb[0].then(|| JitterBuffer::new(jb_settings.clone())),
        use_jb[1].then(|| JitterBuffer::new(jb_settings.clone())),
    ];
    let jb_in_use = use_jb[0] || use_jb[1];

    let mut cs = [c0.clone(), c1.clone()];
    loop {
        let (v0, v1) = (view(c0).await, view(c1).await);
        if v0.pvt_generation != pvt0
            || v1.pvt_generation != pvt1
            || v0.nativeformats != o0native
            || v1.nativeformats != o1native
        {
            return Ok(BridgeOutcome::new(BridgeResult::Retry));
        }

        let mut to = match bridge_end {
            Some(end) => {
                let now = Instant::now();
                if end <= now {
                    let result = if config.timelimit.is_some() {
                        BridgeResult::Retry
                    } else {
                        BridgeResult::Complete
                    };
                    return Ok(BridgeOutcome::new(result));
                }
                Some(end - now)
            }
            None => None,
        };
        if jb_in_use {
            to = jb_next_wakeup(&jbs, to);
        }

        let Some(who) = waitfor_n(&cs, &mut to).await? else {
            if jb_in_use {
                jb_deliver(&mut jbs, &chans).await;
            }
            handle_unbridge(c0, c1).await;
            continue;
        };

        if handle_unbridge(c0, c1).await {
            return Ok(BridgeOutcome::new(BridgeResult::Retry));
        }

        let Some(f) = who.read().await else {
            debug!("Didn't get a frame from channel: {}", who.name());
            return Ok(BridgeOutcome::with_frame(BridgeResult::Complete, None, &who));
        };

        let (who_idx, other_idx) = if Channel::same(&who, c0) { (0, 1) } else { (1, 0) };
        let other = &chans[other_idx];

        let mut put_in_jb = false;
        if f.is_voice() {
            if let Some(jb) = jbs[other_idx].as_mut() {
                put_in_jb = !matches!(jb.put(f.clone(), Instant::now()), JbPut::Unbuffered(_));
            }
        }

        match f.kind {
            FrameKind::Control(control) if !config.flags.contains(BridgeFlags::IGNORE_SIGS) => match control {
                ControlType::Hold | ControlType::Unhold | ControlType::VidUpdate => {
                    if let Err(e) = other.indicate(control).await {
                        debug!("Unable to relay {} to {}: {}", control.name(), other.name(), e);
                    }
                }
                _ => {
                    debug!("Got a FRAME_CONTROL ({}) frame on channel {}", control.name(), who.name());
                    return Ok(BridgeOutcome::with_frame(BridgeResult::Complete, Some(f), &who));
                }
            },
            FrameKind::Voice(_)
            | FrameKind::Dtmf(_)
            | FrameKind::Video(_)
            | FrameKind::Image(_)
            | FrameKind::Html(_)
            | FrameKind::Modem(_)
            | FrameKind::Text => {
                if watch_dtmf[who_idx] && matches!(f.kind, FrameKind::Dtmf(_)) {
                    debug!("Got DTMF on channel ({})", who.name());
                    return Ok(BridgeOutcome::with_frame(BridgeResult::Complete, Some(f), &who));
                }
                if !put_in_jb {
                    if let Err(e) = other.write(&f).await {
                        debug!("Relay to {} failed: {}", other.name(), e);
                    }
                }
                if jb_in_use {
                    jb_deliver(&mut jbs, &chans).await;
                }
            }
            _ => {}
        }

        cs.swap(0, 1);
    }
}

/// Bridge `c0` and `c1` until one hangs up, a control or watched DTMF frame
/// arrives, or the time limit runs out.
///
/// Fails with `BridgeRejected` when either channel is already bridged or is
/// unusable. Both channels are unlinked again whatever the outcome; an error
/// inside the relay ends the bridge with `Failed`.
pub async fn channel_bridge(c0: &Arc<Channel>, c1: &Arc<Channel>, config: &mut BridgeConfig) -> Result<BridgeOutcome> {
    for (chan, other) in [(c0, c1), (c1, c0)] {
        if let Some(peer) = chan.bridged_channel() {
            warn!("{} is already in a bridge with {}", chan.name(), peer.name());
            return Err(ChannelError::BridgeRejected {
                reason: format!("{} is already bridged", chan.name()),
            });
        }
        if Channel::same(chan, other) {
            return Err(ChannelError::BridgeRejected {
                reason: "cannot bridge a channel to itself".to_string(),
            });
        }
    }
    let (v0, v1) = (view(c0).await, view(c1).await);
    if v0.unusable || v1.unusable {
        return Err(ChannelError::BridgeRejected {
            reason: "channel is hung up or a zombie".to_string(),
        });
    }

    let firstpass = config.firstpass;
    config.firstpass = false;
    let start_time = *config.start_time.get_or_insert_with(Instant::now);

    let caller_warning = config.features_caller.play_warning;
    let callee_warning = config.features_callee.play_warning;

    if firstpass && config.timelimit.is_some() {
        if let Some(sound) = config.start_sound.clone() {
            let left = config.timelimit.map_or(0, |t| t.as_secs() as i64);
            if caller_warning {
                bridge_playfile(c0, c1, &sound, left).await;
            }
            if callee_warning {
                bridge_playfile(c1, c0, &sound, left).await;
            }
        }
    }

    c0.set_bridge(Some(c1));
    c1.set_bridge(Some(c0));
    let services = c0.lock().await.services().clone();
    services.emit(link_event(c0, c1, true));

    let mut o0native = v0.nativeformats;
    let mut o1native = v1.nativeformats;

    let mut nexteventts = if let Some(timer) = config.feature_timer {
        Some(start_time + timer)
    } else if let Some(limit) = config.timelimit {
        let end = start_time + limit;
        match config.play_warning {
            Some(warn_at) if caller_warning || callee_warning => {
                Some(end.checked_sub(warn_at).unwrap_or(start_time))
            }
            _ => Some(end),
        }
    } else {
        None
    };

    let mut nativefailed = 0u32;
    let mut outcome = BridgeOutcome::new(BridgeResult::Complete);
    let mut who: Option<Arc<Channel>> = None;

    loop {
        let now = Instant::now();
        let mut to: Option<Duration> = None;
        if let Some(next) = nexteventts {
            if next <= now {
                if config.timelimit.is_none() {
                    outcome = BridgeOutcome::new(BridgeResult::Complete);
                    break;
                }
                to = Some(Duration::ZERO);
            } else {
                to = Some(next - now);
            }
        }

        if let Some(limit) = config.timelimit {
            let elapsed = now.saturating_duration_since(start_time);
            let time_left = limit.checked_sub(elapsed).unwrap_or(Duration::ZERO);
            if to.map_or(true, |t| time_left < t) {
                to = Some(time_left);
            }
            if time_left.is_zero() {
                if let Some(sound) = config.end_sound.clone() {
                    if caller_warning {
                        bridge_playfile(c0, c1, &sound, 0).await;
                    }
                    if callee_warning {
                        bridge_playfile(c1, c0, &sound, 0).await;
                    }
                }
                outcome = BridgeOutcome {
                    result: BridgeResult::Complete,
                    frame: None,
                    who: who.clone(),
                };
                break;
            }
            if to == Some(Duration::ZERO) {
                if let (Some(sound), Some(_)) = (config.warning_sound.clone(), config.play_warning) {
                    if time_left >= Duration::from_secs(5) {
                        let t = ((time_left.as_millis() + 500) / 1000) as i64;
                        if caller_warning {
                            bridge_playfile(c0, c1, &sound, t).await;
                        }
                        if callee_warning {
                            bridge_playfile(c1, c0, &sound, t).await;
                        }
                    }
                }
                // The next warning never lands past the end of the limit
                let end = start_time + limit;
                nexteventts = match config.warning_freq {
                    Some(freq) if !freq.is_zero() => nexteventts.map(|n| (n + freq).min(end)),
                    _ => Some(end),
                };
            }
        }

        if handle_unbridge(c0, c1).await {
            debug!("Unbridge signal received. Ending native bridge.");
            continue;
        }

        let (v0, v1) = (view(c0).await, view(c1).await);
        if v0.unusable || v1.unusable {
            debug!(
                "Bridge stops because we're zombie or need a soft hangup: c0={}, c1={}",
                c0.name(),
                c1.name()
            );
            outcome = BridgeOutcome {
                result: BridgeResult::Complete,
                frame: None,
                who: who.clone(),
            };
            break;
        }

        update_bridgepeer(c0, c1).await;

        let native = match (v0.tech.native_bridge_id(), v1.tech.native_bridge_id()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if native
            && config.timelimit.is_none()
            && nativefailed == 0
            && !v0.monitored
            && !v1.monitored
            && !config.features_caller.redirect
            && !config.features_callee.redirect
        {
            set_nbridge(c0, true).await;
            set_nbridge(c1, true).await;
            let res = v0.tech.bridge(c0, c1, config.flags, to).await;
            set_nbridge(c0, false).await;
            set_nbridge(c1, false).await;
            match res {
                Ok(native_outcome) if native_outcome.result == BridgeResult::Complete => {
                    services.emit(link_event(c0, c1, false));
                    debug!("Returning from native bridge, channels: {}, {}", c0.name(), c1.name());
                    if handle_unbridge(c0, c1).await {
                        continue;
                    }
                    c0.set_bridge(None);
                    c1.set_bridge(None);
                    return Ok(native_outcome);
                }
                Ok(native_outcome) if native_outcome.result == BridgeResult::Retry => continue,
                Ok(native_outcome) => {
                    if native_outcome.result != BridgeResult::FailedNowarn {
                        info!("Native bridging {} and {} ended", c0.name(), c1.name());
                    }
                    nativefailed += 1;
                }
                Err(e) => {
                    info!("Native bridging {} and {} ended: {}", c0.name(), c1.name(), e);
                    nativefailed += 1;
                }
            }
        }

        let (v0, v1) = (view(c0).await, view(c1).await);
        if (v0.writeformat != v1.readformat
            || v0.readformat != v1.writeformat
            || v0.nativeformats != o0native
            || v1.nativeformats != o1native)
            && !(v0.generator || v1.generator)
        {
            if let Err(e) = channel_make_compatible(c0, c1).await {
                warn!("Can't make {} and {} compatible: {}", c0.name(), c1.name(), e);
                c0.set_bridge(None);
                c1.set_bridge(None);
                services.emit(link_event(c0, c1, false));
                return Ok(BridgeOutcome::new(BridgeResult::Failed));
            }
            o0native = v0.nativeformats;
            o1native = v1.nativeformats;
        }

        let bridge_end = match (nexteventts, config.timelimit) {
            (Some(next), Some(limit)) => Some(next.min(start_time + limit)),
            (None, Some(limit)) => Some(start_time + limit),
            (next, None) => next,
        };
        let res = match generic_bridge(c0, c1, config, bridge_end).await {
            Ok(res) => res,
            Err(e) => {
                warn!("Bridge between {} and {} failed: {}", c0.name(), c1.name(), e);
                outcome = BridgeOutcome {
                    result: BridgeResult::Failed,
                    frame: None,
                    who: who.clone(),
                };
                break;
            }
        };
        who = res.who.clone();
        if res.result != BridgeResult::Retry {
            outcome = res;
            break;
        }
    }

    c0.set_bridge(None);
    c1.set_bridge(None);
    services.emit(link_event(c0, c1, false));
    debug!("Bridge stops bridging channels {} and {}", c0.name(), c1.name());
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(wants: bool, creates: bool) -> TechProperties {
        TechProperties {
            wants_jitter: wants,
            creates_jitter: creates,
        }
    }

    #[test]
    fn test_jb_usecheck() {
        let mut settings = JitterBufferSettings {
            enabled: true,
            ..JitterBufferSettings::default()
        };
        // c1 creates jitter, c0 does not buffer itself: buffer towards c0
        assert_eq!(jb_usecheck([props(false, false), props(false, true)], &settings), [true, false]);
        // c0 handles jitter itself
        assert_eq!(jb_usecheck([props(true, false), props(false, true)], &settings), [false, false]);
        settings.force = true;
        assert_eq!(jb_usecheck([props(true, false), props(false, true)], &settings), [true, false]);
        settings.enabled = false;
        assert_eq!(jb_usecheck([props(false, true), props(false, true)], &settings), [false, false]);
    }

    #[test]
    fn test_bridge_flags() {
        let flags = BridgeFlags::WATCH_DTMF_0 | BridgeFlags::IGNORE_SIGS;
        assert!(flags.contains(BridgeFlags::WATCH_DTMF_0));
        assert!(!flags.contains(BridgeFlags::WATCH_DTMF_1));
        assert_eq!(format!("{:?}", flags), "BridgeFlags(WATCH_DTMF_0|IGNORE_SIGS)");
        assert!(BridgeConfig::default().firstpass);
    }
}
