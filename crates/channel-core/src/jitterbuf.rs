//! Fixed-delay jitter buffer for the generic bridge
//!
//! Frames carrying a producer timestamp are held until their scheduled
//! playout time: the arrival time of the first frame, plus the timestamp
//! offset from that frame, plus a fixed target delay. Frames without timing
//! information bypass the buffer.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::JitterBufferSettings;
use crate::frame::Frame;

/// Outcome of offering a frame to the buffer
#[derive(Debug, Clone, PartialEq)]
pub enum JbPut {
    /// Held for later delivery
    Buffered,
    /// No timing information; the caller delivers it now
    Unbuffered(Frame),
    /// Arrived after its slot was played out
    DroppedLate,
    /// Buffer span would exceed the configured maximum
    DroppedFull,
}

/// Fixed-delay jitter buffer
#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterBufferSettings,
    buffer: BTreeMap<i64, Frame>,
    /// Local time and producer timestamp of the reference frame
    base: Option<(Instant, i64)>,
    last_delivered: Option<i64>,
    stats: JitterBufferStats,
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterBufferStats {
    pub buffered_frames: usize,
    pub delivered: u64,
    pub dropped_late: u64,
    pub dropped_full: u64,
    pub resyncs: u64,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferSettings) -> Self {
        Self {
            config,
            buffer: BTreeMap::new(),
            base: None,
            last_delivered: None,
            stats: JitterBufferStats::default(),
        }
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.config.target_extra_ms)
    }

    /// Offer a frame received at `now`
    pub fn put(&mut self, frame: Frame, now: Instant) -> JbPut {
        let (Some(ts), Some(len)) = (frame.ts, frame.len_ms) else {
            return JbPut::Unbuffered(frame);
        };

        match self.base {
            None => self.base = Some((now, ts)),
            Some((base_at, base_ts)) => {
                let expected = now.saturating_duration_since(base_at).as_millis() as i64;
                let skew = (ts - base_ts) - expected;
                if skew.abs() > self.config.resync_threshold_ms {
                    tracing::debug!("Jitter buffer resync, timestamp skew {} ms", skew);
                    self.stats.resyncs += 1;
                    self.base = Some((now, ts));
                    self.last_delivered = None;
                }
            }
        }

        if let Some(last) = self.last_delivered {
            if ts <= last {
                self.stats.dropped_late += 1;
                return JbPut::DroppedLate;
            }
        }

        if let Some((&first, _)) = self.buffer.first_key_value() {
            let span = ts.max(first) - ts.min(first) + len as i64;
            if span as u64 > self.config.max_size_ms {
                self.stats.dropped_full += 1;
                return JbPut::DroppedFull;
            }
        }

        self.buffer.insert(ts, frame);
        JbPut::Buffered
    }

    /// When the next held frame is due
    pub fn next_delivery(&self) -> Option<Instant> {
        let (base_at, base_ts) = self.base?;
        let (&ts, _) = self.buffer.first_key_value()?;
        let offset = Duration::from_millis((ts - base_ts).max(0) as u64);
        Some(base_at + offset + self.delay())
    }

    /// Pop the next frame if it is due at `now`
    pub fn get(&mut self, now: Instant) -> Option<Frame> {
        if self.next_delivery()? > now {
            return None;
        }
        let (ts, frame) = self.buffer.pop_first()?;
        self.last_delivered = Some(ts);
        self.stats.delivered += 1;
        Some(frame)
    }

    /// Remove every held frame in timestamp order
    pub fn flush(&mut self) -> Vec<Frame> {
        let frames = std::mem::take(&mut self.buffer).into_values().collect();
        self.base = None;
        self.last_delivered = None;
        frames
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            buffered_frames: self.buffer.len(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    fn settings() -> JitterBufferSettings {
        JitterBufferSettings {
            enabled: true,
            force: false,
            max_size_ms: 200,
            resync_threshold_ms: 1000,
            target_extra_ms: 40,
        }
    }

    fn frame(ts: i64, seq: u32) -> Frame {
        Frame::voice(Format::ULAW, vec![0u8; 160]).with_timing(ts, 20, seq)
    }

    #[test]
    fn test_untimed_bypass() {
        let mut jb = JitterBuffer::new(settings());
        let f = Frame::voice(Format::ULAW, vec![0u8; 160]);
        assert_eq!(jb.put(f.clone(), Instant::now()), JbPut::Unbuffered(f));
        assert!(jb.is_empty());
    }

    #[test]
    fn test_reorders_and_delays() {
        let mut jb = JitterBuffer::new(settings());
        let now = Instant::now();
        assert_eq!(jb.put(frame(0, 0), now), JbPut::Buffered);
        assert_eq!(jb.put(frame(40, 2), now), JbPut::Buffered);
        assert_eq!(jb.put(frame(20, 1), now), JbPut::Buffered);

        assert!(jb.get(now).is_none());
        assert_eq!(jb.next_delivery(), Some(now + Duration::from_millis(40)));

        let later = now + Duration::from_millis(100);
        let order: Vec<i64> = std::iter::from_fn(|| jb.get(later)).map(|f| f.ts.unwrap()).collect();
        assert_eq!(order, vec![0, 20, 40]);
    }

    #[test]
    fn test_late_frame_dropped() {
        let mut jb = JitterBuffer::new(settings());
        let now = Instant::now();
        jb.put(frame(0, 0), now);
        jb.put(frame(20, 1), now);
        let later = now + Duration::from_millis(70);
        assert!(jb.get(later).is_some());
        assert!(jb.get(later).is_some());
        assert_eq!(jb.put(frame(20, 1), later), JbPut::DroppedLate);
        assert_eq!(jb.stats().dropped_late, 1);
    }

    #[test]
    fn test_span_limit() {
        let mut jb = JitterBuffer::new(settings());
        let now = Instant::now();
        jb.put(frame(0, 0), now);
        assert_eq!(jb.put(frame(400, 20), now), JbPut::DroppedFull);
        assert_eq!(jb.flush().len(), 1);
        assert!(jb.is_empty());
    }
}
