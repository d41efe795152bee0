//! Read/write format negotiation

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Channel, ChannelInner};
use crate::error::{ChannelError, Result};
use crate::format::Format;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl ChannelInner {
    /// Choose the format frames are returned in by `read`
    pub fn set_read_format(&mut self, fmts: Format) -> Result<()> {
        self.set_format(fmts, Direction::Read)
    }

    /// Choose the format callers hand to `write`
    pub fn set_write_format(&mut self, fmts: Format) -> Result<()> {
        self.set_format(fmts, Direction::Write)
    }

    fn set_format(&mut self, fmts: Format, direction: Direction) -> Result<()> {
        let wanted = fmts.audio();
        let native = self.nativeformats;
        let translators = self.services.translators.clone();

        let (fmt, native) = match direction {
            Direction::Read => translators.best_choice(wanted, native),
            Direction::Write => translators.best_choice(native, wanted).map(|(n, f)| (f, n)),
        }
        .map_err(|e| {
            warn!(
                "Unable to find a codec translation path from {} to {} on {}",
                native,
                wanted,
                self.name()
            );
            e
        })?;

        let (raw, format, trans) = match direction {
            Direction::Read => (&mut self.rawreadformat, &mut self.readformat, &mut self.readtrans),
            Direction::Write => (&mut self.rawwriteformat, &mut self.writeformat, &mut self.writetrans),
        };

        if *raw == native && *format == fmt && (*raw == *format || trans.is_some()) {
            return Ok(());
        }

        *raw = native;
        *format = fmt;
        *trans = None;
        if native != fmt {
            let path = match direction {
                Direction::Read => translators.build_path(fmt, native),
                Direction::Write => translators.build_path(native, fmt),
            };
            *trans = Some(path?);
        }

        debug!(
            "Set channel {} to {} format {}",
            self.name(),
            if direction == Direction::Read { "read" } else { "write" },
            fmt.name()
        );
        Ok(())
    }

    /// Drop both translation paths
    pub(crate) fn free_translation(&mut self) {
        self.readtrans = None;
        self.writetrans = None;
    }
}

impl Channel {
    pub async fn set_read_format(self: &Arc<Self>, fmts: Format) -> Result<()> {
        self.lock().await.set_read_format(fmts)
    }

    pub async fn set_write_format(self: &Arc<Self>, fmts: Format) -> Result<()> {
        self.lock().await.set_write_format(fmts)
    }
}

async fn make_one_way(chan: &Arc<Channel>, peer: &Arc<Channel>) -> Result<()> {
    let (src, translators, via_slin) = {
        let c = chan.lock().await;
        (c.nativeformats, c.services.translators.clone(), c.services.config.transcode_via_slin)
    };
    let dst = peer.lock().await.nativeformats;

    let (mut dst, src) = translators.best_choice(dst, src).map_err(|e| {
        warn!(
            "No path to translate from {}({}) to {}({})",
            chan.name(),
            src,
            peer.name(),
            dst
        );
        e
    })?;
    if src != dst && via_slin {
        dst = Format::SLINEAR;
    }

    chan.lock().await.set_read_format(dst).map_err(|e| {
        warn!("Unable to set read format on channel {} to {}", chan.name(), dst.name());
        e
    })?;
    peer.lock().await.set_write_format(dst).map_err(|e| {
        warn!("Unable to set write format on channel {} to {}", peer.name(), dst.name());
        e
    })?;
    Ok(())
}

/// Set up translation so `chan` and `peer` can exchange frames in both
/// directions. Only one channel lock is held at a time.
pub async fn channel_make_compatible(chan: &Arc<Channel>, peer: &Arc<Channel>) -> Result<()> {
    if Channel::same(chan, peer) {
        return Err(ChannelError::invalid("cannot make a channel compatible with itself"));
    }
    make_one_way(chan, peer).await?;
    make_one_way(peer, chan).await
}
