//! Call recording taps
//!
//! A monitor writes the read side and the write side of a channel to two
//! separate streams. The core keeps the two sample positions aligned: when one
//! side falls more than four frames behind the other, its stream is seeked
//! forward instead of letting the recordings drift apart.

use crate::error::Result;
use crate::frame::Frame;

/// Destination of recorded audio, provided by a file format module
pub trait MonitorStream: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Skip `samples` forward, leaving silence behind
    fn seek_forward(&mut self, samples: usize) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorState {
    #[default]
    Running,
    Paused,
}

/// Recording state attached to a channel
#[derive(Default)]
pub struct ChannelMonitor {
    pub read_stream: Option<Box<dyn MonitorStream>>,
    pub write_stream: Option<Box<dyn MonitorStream>>,
    pub state: MonitorState,
}

impl ChannelMonitor {
    pub fn new(read_stream: Option<Box<dyn MonitorStream>>, write_stream: Option<Box<dyn MonitorStream>>) -> Self {
        Self {
            read_stream,
            write_stream,
            state: MonitorState::Running,
        }
    }

    pub fn pause(&mut self) {
        self.state = MonitorState::Paused;
    }

    pub fn unpause(&mut self) {
        self.state = MonitorState::Running;
    }

    pub fn is_running(&self) -> bool {
        self.state == MonitorState::Running
    }
}

impl std::fmt::Debug for ChannelMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMonitor")
            .field("read_stream", &self.read_stream.is_some())
            .field("write_stream", &self.write_stream.is_some())
            .field("state", &self.state)
            .finish()
    }
}

/// Record one frame on `stream`, reconciling `own` (this side's sample
/// position) against `other` (the opposite side's).
pub(crate) fn record_frame(
    stream: &mut dyn MonitorStream,
    frame: &Frame,
    own: &mut i64,
    other: i64,
    channel: &str,
) {
    let samples = frame.samples as i64;
    let jump = other - *own - 4 * samples;
    if jump >= 0 {
        if stream.seek_forward((jump + samples) as usize).is_err() {
            tracing::warn!(
                "Failed to perform seek in monitoring stream of {}, synchronization between the files may be broken",
                channel
            );
        }
        *own += jump + 4 * samples;
    } else {
        *own += samples;
    }
    if stream.write_frame(frame).is_err() {
        tracing::warn!("Failed to write data to channel monitor stream of {}", channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    #[derive(Default)]
    struct Recorder {
        written: usize,
        seeks: Vec<usize>,
    }

    impl MonitorStream for Recorder {
        fn write_frame(&mut self, frame: &Frame) -> Result<()> {
            self.written += frame.samples;
            Ok(())
        }

        fn seek_forward(&mut self, samples: usize) -> Result<()> {
            self.seeks.push(samples);
            Ok(())
        }
    }

    #[test]
    fn test_in_step_no_seek() {
        let mut rec = Recorder::default();
        let frame = Frame::voice(Format::ULAW, vec![0u8; 160]);
        let mut own = 0;
        record_frame(&mut rec, &frame, &mut own, 160, "Mock/1");
        assert_eq!(own, 160);
        assert!(rec.seeks.is_empty());
        assert_eq!(rec.written, 160);
    }

    #[test]
    fn test_lagging_side_seeks() {
        let mut rec = Recorder::default();
        let frame = Frame::voice(Format::ULAW, vec![0u8; 160]);
        let mut own = 0;
        // other side is ten frames ahead
        record_frame(&mut rec, &frame, &mut own, 1600, "Mock/1");
        assert_eq!(rec.seeks, vec![1600 - 640 + 160]);
        assert_eq!(own, 1600);
    }
}
