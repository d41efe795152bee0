//! Masquerade: one channel takes over another's call in place
//!
//! `channel_masquerade(original, clone)` only plans the swap. The swap runs
//! the next time anyone reads, writes, waits on or hangs up `original`. The
//! technology, its private data, queued frames, raw and native formats, state,
//! caller id, device descriptors, monitor and variables move from `clone`
//! into `original`. Every `Arc<Channel>` pointing at `original` stays valid
//! and now drives the clone's call; `clone` is left as a zombie.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::channel::{Channel, ChannelFlags, ChannelInner, LockedChannel, SoftHangup};
use crate::descriptor::TIMING_FD;
use crate::error::{ChannelError, Result};
use crate::events::ChannelEvent;
use crate::frame::Frame;
use crate::group::GROUP_CATEGORY_PREFIX;

/// Back-off between attempts to take a second channel lock
const LOCK_BACKOFF: Duration = Duration::from_millis(1);

/// Lock `first`, then try-lock `second`, backing off until both are held
pub(crate) async fn lock_both(first: &Arc<Channel>, second: &Arc<Channel>) -> (LockedChannel, LockedChannel) {
    loop {
        let a = first.lock().await;
        if let Some(b) = second.try_lock() {
            return (a, b);
        }
        drop(a);
        tokio::time::sleep(LOCK_BACKOFF).await;
    }
}

/// Plan for `clone` to be masqueraded into `original`.
///
/// Fails if the two are the same channel or either already takes part in a
/// pending masquerade. Both channels get a null frame so blocked readers
/// notice.
pub async fn channel_masquerade(original: &Arc<Channel>, clone: &Arc<Channel>) -> Result<()> {
    if Channel::same(original, clone) {
        warn!("Can't masquerade channel '{}' into itself", original.name());
        return Err(ChannelError::masquerade(original.name(), "cannot masquerade into itself"));
    }
    debug!("Planning to masquerade channel {} into the structure of {}", clone.name(), original.name());

    let (mut orig, mut cl) = lock_both(original, clone).await;
    if let Some(masq) = orig.masq.as_ref() {
        warn!("{} is already going to masquerade as {}", masq.name(), orig.name());
        return Err(ChannelError::masquerade(orig.name(), "masquerade already pending"));
    }
    if let Some(masqr) = cl.masqr.as_ref().and_then(|w| w.upgrade()) {
        warn!("{} is already going to masquerade as {}", cl.name(), masqr.name());
        return Err(ChannelError::masquerade(cl.name(), "masquerade already pending"));
    }
    if cl.masqr.is_some() || orig.masqr.is_some() || cl.masq.is_some() {
        warn!("{} or {} is already part of a masquerade", orig.name(), cl.name());
        return Err(ChannelError::masquerade(orig.name(), "masquerade already pending"));
    }

    orig.masq = Some(clone.clone());
    cl.masqr = Some(Arc::downgrade(original));
    let _ = orig.queue_frame(Frame::null());
    let _ = cl.queue_frame(Frame::null());
    debug!("Done planning to masquerade channel {} into the structure of {}", cl.name(), orig.name());
    Ok(())
}

/// `GROUP` or `GROUP_<category>`
fn is_group_var(name: &str) -> bool {
    match name.strip_prefix(GROUP_CATEGORY_PREFIX) {
        Some(rest) => rest.is_empty() || rest.starts_with('_'),
        None => false,
    }
}

/// Move group accounting off `original` and append the clone's variables
fn clone_variables(original: &mut ChannelInner, clone: &mut ChannelInner) {
    original.vars.retain(|(name, _)| !is_group_var(name));
    original.vars.append(&mut clone.vars);
}

/// Carry out the pending masquerade on `original`, which must be locked.
///
/// The lock may be released and retaken while waiting for the clone's lock;
/// the returned guard is the one to keep using.
pub(crate) async fn do_masquerade(mut original: LockedChannel) -> Result<LockedChannel> {
    let orig_handle = original.channel().clone();

    let (clone_handle, mut clone) = loop {
        let Some(clone_handle) = original.masq.clone() else {
            return Ok(original);
        };
        if let Some(clone) = clone_handle.try_lock() {
            break (clone_handle, clone);
        }
        let handle = original.unlock();
        tokio::time::sleep(LOCK_BACKOFF).await;
        original = handle.lock().await;
    };
    debug!("Got clone lock for masquerade on '{}'", clone.name());

    original.services.emit(ChannelEvent::Masquerade {
        original: original.name(),
        clone: clone.name(),
        original_state: original.state.name().to_string(),
        clone_state: clone.state.name().to_string(),
    });

    let wformat = original.writeformat;
    let rformat = original.readformat;
    clone.free_translation();
    original.free_translation();

    original.masq = None;
    clone.masqr = None;

    let orig_name = original.name();
    let new_name = clone.name();
    let masq_name = format!("{}<MASQ>", new_name);
    clone.change_name(masq_name);
    original.change_name(new_name);

    std::mem::swap(&mut original.tech, &mut clone.tech);
    std::mem::swap(&mut original.tech_pvt, &mut clone.tech_pvt);
    std::mem::swap(&mut original.pvt_generation, &mut clone.pvt_generation);

    // The clone's pending frames go first; the old device's hangup
    // indication goes away with it
    original.readq.retain(|f| !f.is_hangup());
    let moved = clone.readq.len();
    let mut readq = std::mem::take(&mut clone.readq);
    readq.append(&mut original.readq);
    original.readq = readq;
    clone.alert.drain();
    original.alert.drain();
    let pending = original.readq.len();
    original.alert.signal_n(pending);
    debug!("Moved {} queued frames into {}", moved, original.name());

    std::mem::swap(&mut original.rawreadformat, &mut clone.rawreadformat);
    std::mem::swap(&mut original.rawwriteformat, &mut clone.rawwriteformat);

    clone.softhangup = SoftHangup::DEV;

    std::mem::swap(&mut original.state, &mut clone.state);

    let clone_tech = clone.tech.clone();
    if let Err(e) = clone_tech.fixup(&orig_handle, &clone_handle, &mut clone).await {
        warn!("Fixup failed on channel {}, strange things may happen: {}", clone.name(), e);
    }

    if let Err(e) = clone_tech.hangup(&mut clone).await {
        warn!("Hangup failed!  Strange things may happen!");
        return Err(ChannelError::masquerade(original.name(), format!("clone hangup failed: {}", e)));
    }

    let zombie_name = format!("{}<ZOMBIE>", orig_name);
    clone.change_name(zombie_name.clone());

    std::mem::swap(&mut original.monitor, &mut clone.monitor);
    original.language = clone.language.clone();

    for slot in 0..TIMING_FD {
        let fd = clone.fds[slot].take();
        clone.fds[slot] = std::mem::replace(&mut original.fds[slot], fd);
    }

    clone_variables(&mut original, &mut clone);

    let exception = clone.flags.contains(ChannelFlags::EXCEPTION);
    original.flags.set(ChannelFlags::EXCEPTION, exception);
    original.fdno = clone.fdno;

    std::mem::swap(&mut original.cid, &mut clone.cid);

    original.nativeformats = clone.nativeformats;
    if let Err(e) = original.set_write_format(wformat) {
        warn!("Unable to restore write format {} on {}: {}", wformat, original.name(), e);
    }
    if let Err(e) = original.set_read_format(rformat) {
        warn!("Unable to restore read format {} on {}: {}", rformat, original.name(), e);
    }
    original.musicclass = clone.musicclass.clone();
    debug!("Putting channel {} in {}/{} formats", original.name(), wformat, rformat);

    let orig_tech = original.tech.clone();
    if let Err(e) = orig_tech.fixup(&clone_handle, &orig_handle, &mut original).await {
        warn!(
            "Channel for type '{}' could not fixup channel {}",
            orig_tech.type_name(),
            original.name()
        );
        return Err(ChannelError::masquerade(original.name(), format!("fixup failed: {}", e)));
    }

    if clone.is_zombie() {
        debug!("Destroying channel clone '{}'", clone.name());
        let cause = clone.hangupcause;
        let services = clone.services.clone();
        drop(clone);
        services.free_channel(&clone_handle).await;
        services.emit(ChannelEvent::Hangup {
            channel: zombie_name,
            uniqueid: clone_handle.uniqueid().to_string(),
            cause: cause.code(),
            cause_txt: cause.description().to_string(),
        });
    } else {
        debug!("Released clone lock on '{}'", clone.name());
        clone.flags.insert(ChannelFlags::ZOMBIE);
        let _ = clone.queue_frame(Frame::null());
        drop(clone);
        clone_handle.interrupt_blocker();
    }

    orig_handle.interrupt_blocker();
    debug!("Done Masquerading {} ({})", original.name(), original.state.name());
    Ok(original)
}

impl Channel {
    /// Plan for `clone` to take over this channel's call
    pub async fn masquerade(self: &Arc<Self>, clone: &Arc<Channel>) -> Result<()> {
        channel_masquerade(self, clone).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_var_names() {
        assert!(is_group_var("GROUP"));
        assert!(is_group_var("GROUP_outbound"));
        assert!(!is_group_var("GROUPING"));
        assert!(!is_group_var("MYGROUP"));
    }
}
