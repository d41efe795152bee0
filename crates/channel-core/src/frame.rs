//! Frames: the unit of media and control data moving through a channel
//!
//! A frame is immutable once built. Fan-out points (spies, bridge relay,
//! masquerade queue moves) hand out clones; the payload is a [`Bytes`] so a
//! clone never aliases mutable state.

use std::fmt;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use crate::format::Format;
use crate::logging::FRAME_TARGET;

/// Headroom reserved in front of payloads allocated by [`Frame::alloc_payload`],
/// so drivers can prepend a transport header without copying.
pub const FRIENDLY_OFFSET: usize = 64;

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Dtmf,
    Voice,
    Video,
    Control,
    Null,
    Text,
    Image,
    Html,
    Modem,
    Cng,
}

impl FrameType {
    pub fn name(self) -> &'static str {
        match self {
            FrameType::Dtmf => "DTMF",
            FrameType::Voice => "VOICE",
            FrameType::Video => "VIDEO",
            FrameType::Control => "CONTROL",
            FrameType::Null => "NULL",
            FrameType::Text => "TEXT",
            FrameType::Image => "IMAGE",
            FrameType::Html => "HTML",
            FrameType::Modem => "MODEM",
            FrameType::Cng => "CNG",
        }
    }
}

/// Control frame subclasses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlType {
    /// Other end has hung up
    Hangup,
    /// Local ring
    Ring,
    /// Remote end is ringing
    Ringing,
    /// Remote end has answered
    Answer,
    /// Remote end is busy
    Busy,
    TakeOffHook,
    OffHook,
    /// Congestion (circuits busy)
    Congestion,
    Flash,
    Wink,
    Option,
    RadioKey,
    RadioUnkey,
    /// In-band progress
    Progress,
    Proceeding,
    /// Put the peer on hold
    Hold,
    Unhold,
    /// Request a video key frame
    VidUpdate,
    /// Stop any indication currently playing
    StopIndication,
}

impl ControlType {
    pub fn name(self) -> &'static str {
        match self {
            ControlType::Hangup => "Hangup",
            ControlType::Ring => "Ring",
            ControlType::Ringing => "Ringing",
            ControlType::Answer => "Answer",
            ControlType::Busy => "Busy",
            ControlType::TakeOffHook => "Take Off Hook",
            ControlType::OffHook => "Line Off Hook",
            ControlType::Congestion => "Congestion",
            ControlType::Flash => "Flash",
            ControlType::Wink => "Wink",
            ControlType::Option => "Option",
            ControlType::RadioKey => "Key Radio",
            ControlType::RadioUnkey => "Unkey Radio",
            ControlType::Progress => "Call Progress",
            ControlType::Proceeding => "Proceeding",
            ControlType::Hold => "Hold",
            ControlType::Unhold => "Unhold",
            ControlType::VidUpdate => "Video Update",
            ControlType::StopIndication => "Stop Indication",
        }
    }
}

/// The type tag together with its subclass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Voice(Format),
    Video(Format),
    Image(Format),
    Dtmf(char),
    Control(ControlType),
    Text,
    Html(u32),
    Modem(u32),
    Cng(u32),
    Null,
}

/// One unit of media or control data
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub data: Bytes,
    pub samples: usize,
    /// When the frame should be delivered, if the producer cares
    pub delivery: Option<Instant>,
    /// Producer timestamp in milliseconds, used by the jitter buffer
    pub ts: Option<i64>,
    /// Frame length in milliseconds
    pub len_ms: Option<u32>,
    pub seqno: Option<u32>,
    /// Name of the producer, for debugging
    pub src: Option<String>,
}

impl Frame {
    fn bare(kind: FrameKind) -> Self {
        Self {
            kind,
            data: Bytes::new(),
            samples: 0,
            delivery: None,
            ts: None,
            len_ms: None,
            seqno: None,
            src: None,
        }
    }

    /// Voice frame; the sample count is derived from the payload when the codec allows it
    pub fn voice(format: Format, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let mut f = Self::bare(FrameKind::Voice(format));
        f.samples = format.samples_for(data.len());
        f.data = data;
        f
    }

    pub fn video(format: Format, data: impl Into<Bytes>) -> Self {
        let mut f = Self::bare(FrameKind::Video(format));
        f.data = data.into();
        f
    }

    pub fn image(format: Format, data: impl Into<Bytes>) -> Self {
        let mut f = Self::bare(FrameKind::Image(format));
        f.data = data.into();
        f
    }

    pub fn dtmf(digit: char) -> Self {
        Self::bare(FrameKind::Dtmf(digit))
    }

    pub fn control(control: ControlType) -> Self {
        Self::bare(FrameKind::Control(control))
    }

    pub fn hangup() -> Self {
        Self::control(ControlType::Hangup)
    }

    pub fn null() -> Self {
        Self::bare(FrameKind::Null)
    }

    pub fn text(text: &str) -> Self {
        let mut f = Self::bare(FrameKind::Text);
        f.data = Bytes::copy_from_slice(text.as_bytes());
        f
    }

    pub fn html(subclass: u32, data: impl Into<Bytes>) -> Self {
        let mut f = Self::bare(FrameKind::Html(subclass));
        f.data = data.into();
        f
    }

    pub fn modem(subclass: u32, data: impl Into<Bytes>) -> Self {
        let mut f = Self::bare(FrameKind::Modem(subclass));
        f.data = data.into();
        f
    }

    /// Attach timing information so the frame can go through a jitter buffer
    pub fn with_timing(mut self, ts: i64, len_ms: u32, seqno: u32) -> Self {
        self.ts = Some(ts);
        self.len_ms = Some(len_ms);
        self.seqno = Some(seqno);
        self
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    /// Allocate a payload buffer with [`FRIENDLY_OFFSET`] bytes of headroom.
    /// Write the payload after the headroom and call `split_off(FRIENDLY_OFFSET)`.
    pub fn alloc_payload(len: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRIENDLY_OFFSET + len);
        buf.resize(FRIENDLY_OFFSET, 0);
        buf
    }

    pub fn frame_type(&self) -> FrameType {
        match self.kind {
            FrameKind::Voice(_) => FrameType::Voice,
            FrameKind::Video(_) => FrameType::Video,
            FrameKind::Image(_) => FrameType::Image,
            FrameKind::Dtmf(_) => FrameType::Dtmf,
            FrameKind::Control(_) => FrameType::Control,
            FrameKind::Text => FrameType::Text,
            FrameKind::Html(_) => FrameType::Html,
            FrameKind::Modem(_) => FrameType::Modem,
            FrameKind::Cng(_) => FrameType::Cng,
            FrameKind::Null => FrameType::Null,
        }
    }

    pub fn datalen(&self) -> usize {
        self.data.len()
    }

    /// Codec of a voice, video or image frame
    pub fn format(&self) -> Option<Format> {
        match self.kind {
            FrameKind::Voice(f) | FrameKind::Video(f) | FrameKind::Image(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_voice(&self) -> bool {
        matches!(self.kind, FrameKind::Voice(_))
    }

    pub fn is_control(&self, control: ControlType) -> bool {
        self.kind == FrameKind::Control(control)
    }

    pub fn is_hangup(&self) -> bool {
        self.is_control(ControlType::Hangup)
    }

    pub fn is_null(&self) -> bool {
        self.kind == FrameKind::Null
    }

    /// True when the frame carries enough timing info for a jitter buffer
    pub fn has_timing_info(&self) -> bool {
        self.ts.is_some() && self.len_ms.is_some()
    }

    /// Text payload of a TEXT frame
    pub fn text_payload(&self) -> Option<String> {
        match self.kind {
            FrameKind::Text => Some(String::from_utf8_lossy(&self.data).into_owned()),
            _ => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FrameKind::Voice(fmt_) | FrameKind::Video(fmt_) | FrameKind::Image(fmt_) => write!(
                f,
                "{} ({}) len={} samples={}",
                self.frame_type().name(),
                fmt_.name(),
                self.datalen(),
                self.samples
            ),
            FrameKind::Dtmf(d) => write!(f, "DTMF '{}'", d),
            FrameKind::Control(c) => write!(f, "CONTROL ({})", c.name()),
            FrameKind::Text => write!(f, "TEXT '{}'", String::from_utf8_lossy(&self.data)),
            FrameKind::Html(sub) | FrameKind::Modem(sub) | FrameKind::Cng(sub) => {
                write!(f, "{} ({}) len={}", self.frame_type().name(), sub, self.datalen())
            }
            FrameKind::Null => write!(f, "NULL"),
        }
    }
}

/// Dump one frame at debug level on the frame-dump target. `prefix` is "<<" for reads and ">>" for writes.
pub fn frame_dump(channel: &str, frame: Option<&Frame>, prefix: &str) {
    match frame {
        Some(fr) => tracing::debug!(target: FRAME_TARGET, "{} [ {} ] {}", prefix, fr, channel),
        None => tracing::debug!(target: FRAME_TARGET, "{} [ HANGUP (NULL) ] {}", prefix, channel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_samples() {
        let f = Frame::voice(Format::SLINEAR, vec![0u8; 320]);
        assert_eq!(f.samples, 160);
        assert_eq!(f.frame_type(), FrameType::Voice);
        assert_eq!(f.format(), Some(Format::SLINEAR));
    }

    #[test]
    fn test_control_predicates() {
        let f = Frame::hangup();
        assert!(f.is_hangup());
        assert!(!Frame::null().is_hangup());
        assert_eq!(f.frame_type(), FrameType::Control);
    }

    #[test]
    fn test_payload_headroom() {
        let mut buf = Frame::alloc_payload(4);
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let payload = buf.split_off(FRIENDLY_OFFSET);
        assert_eq!(&payload[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Frame::dtmf('5').to_string(), "DTMF '5'");
        assert_eq!(Frame::text("hi").text_payload().as_deref(), Some("hi"));
    }
}
