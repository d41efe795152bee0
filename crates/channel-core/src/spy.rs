//! Passive frame taps
//!
//! A spy receives a copy of every voice frame read from or written to a
//! channel. Delivery never blocks the media path: when a spy's queue is full
//! the frame is dropped for that spy only.

use tokio::sync::mpsc;
use tracing::debug;

use crate::format::Format;
use crate::frame::Frame;
use crate::translate::{TranslatorPath, TranslatorRegistry};

/// Which side of the channel a spied frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpyDirection {
    Read,
    Write,
}

/// A frame delivered to a spy
#[derive(Debug, Clone)]
pub struct SpyFrame {
    pub direction: SpyDirection,
    pub frame: Frame,
}

/// Receiving end of a spy. Dropping it detaches the spy on the next frame.
#[derive(Debug)]
pub struct SpyHandle {
    rx: mpsc::Receiver<SpyFrame>,
}

impl SpyHandle {
    pub async fn recv(&mut self) -> Option<SpyFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SpyFrame> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving; frames already queued can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }
}

struct Direction {
    format: Format,
    trans: Option<TranslatorPath>,
}

/// Core side of a spy, stored on the channel
pub(crate) struct Spy {
    tx: mpsc::Sender<SpyFrame>,
    /// Requested delivery format, `None` for whatever the channel carries
    format: Option<Format>,
    read: Direction,
    write: Direction,
}

impl Spy {
    pub(crate) fn new(capacity: usize, format: Option<Format>) -> (Self, SpyHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let none = || Direction {
            format: Format::NONE,
            trans: None,
        };
        (
            Self {
                tx,
                format,
                read: none(),
                write: none(),
            },
            SpyHandle { rx },
        )
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn convert(&mut self, direction: SpyDirection, frame: &Frame, translators: &TranslatorRegistry) -> Option<Frame> {
        let Some(wanted) = self.format else {
            return Some(frame.clone());
        };
        let src = frame.format()?;
        if src == wanted {
            return Some(frame.clone());
        }
        let dir = match direction {
            SpyDirection::Read => &mut self.read,
            SpyDirection::Write => &mut self.write,
        };
        if dir.format != src || dir.trans.is_none() {
            match translators.build_path(wanted, src) {
                Ok(path) => {
                    dir.trans = Some(path);
                    dir.format = src;
                }
                Err(e) => {
                    debug!("Spy cannot translate {} to {}: {}", src.name(), wanted.name(), e);
                    return None;
                }
            }
        }
        dir.trans.as_mut().and_then(|t| t.translate(frame))
    }
}

/// Copy a frame to every spy, pruning spies whose receiver is gone
pub(crate) fn queue_frame_to_spies(
    spies: &mut Vec<Spy>,
    direction: SpyDirection,
    frame: &Frame,
    translators: &TranslatorRegistry,
) {
    spies.retain(|s| !s.is_closed());
    for spy in spies.iter_mut() {
        let Some(out) = spy.convert(direction, frame, translators) else {
            continue;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = spy.tx.try_send(SpyFrame { direction, frame: out }) {
            debug!("Spy queue full, dropping frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_and_prune() {
        let translators = TranslatorRegistry::new();
        let (spy_a, mut handle_a) = Spy::new(4, None);
        let (spy_b, handle_b) = Spy::new(4, None);
        let mut spies = vec![spy_a, spy_b];
        drop(handle_b);

        let frame = Frame::voice(Format::ULAW, vec![0u8; 160]);
        queue_frame_to_spies(&mut spies, SpyDirection::Read, &frame, &translators);
        assert_eq!(spies.len(), 1);

        let got = handle_a.try_recv().unwrap();
        assert_eq!(got.direction, SpyDirection::Read);
        assert_eq!(got.frame, frame);
    }

    #[test]
    fn test_full_queue_drops() {
        let translators = TranslatorRegistry::new();
        let (spy, mut handle) = Spy::new(1, None);
        let mut spies = vec![spy];
        let frame = Frame::voice(Format::ULAW, vec![0u8; 160]);
        queue_frame_to_spies(&mut spies, SpyDirection::Write, &frame, &translators);
        queue_frame_to_spies(&mut spies, SpyDirection::Write, &frame, &translators);
        assert!(handle.try_recv().is_some());
        assert!(handle.try_recv().is_none());
        assert_eq!(spies.len(), 1);
    }

    #[test]
    fn test_untranslatable_skipped() {
        let translators = TranslatorRegistry::new();
        let (spy, mut handle) = Spy::new(4, Some(Format::SLINEAR));
        let mut spies = vec![spy];
        queue_frame_to_spies(
            &mut spies,
            SpyDirection::Read,
            &Frame::voice(Format::GSM, vec![0u8; 33]),
            &translators,
        );
        assert!(handle.try_recv().is_none());
    }
}
