//! Audio generators
//!
//! A generator owns the write side of a channel while it is active: the core
//! asks it for audio, either once per timing tick or once per frame read, and
//! writes whatever it produces. Ordinary writes are dropped meanwhile unless
//! the generator (or the channel's WRITE_INT flag) lets them interrupt it.

use std::f32::consts::PI;

use bytes::{BufMut, BytesMut};

use crate::channel::ChannelInner;
use crate::error::Result;
use crate::format::Format;
use crate::frame::Frame;

const SAMPLE_RATE: f32 = 8000.0;

/// Audio source driving a channel's write side
pub trait Generator: Send {
    fn name(&self) -> &str {
        "generator"
    }

    /// Called once on activation, with the channel locked
    fn start(&mut self, chan: &mut ChannelInner) -> Result<()> {
        let _ = chan;
        Ok(())
    }

    /// Produce audio for `samples` samples. `None` ends the generator.
    fn generate(&mut self, samples: usize) -> Option<Frame>;

    /// Called once when the generator is removed
    fn release(&mut self, chan: &mut ChannelInner) {
        let _ = chan;
    }

    /// Whether an ordinary write stops this generator
    fn writes_interrupt(&self) -> bool {
        false
    }
}

const LOW_FREQS: [f32; 4] = [697.0, 770.0, 852.0, 941.0];
const HIGH_FREQS: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];
const KEYPAD: [[char; 4]; 4] = [
    ['1', '2', '3', 'A'],
    ['4', '5', '6', 'B'],
    ['7', '8', '9', 'C'],
    ['*', '0', '#', 'D'],
];

/// Low and high frequency of a DTMF digit
pub fn dtmf_frequencies(digit: char) -> Option<(f32, f32)> {
    let digit = digit.to_ascii_uppercase();
    KEYPAD.iter().enumerate().find_map(|(row, keys)| {
        keys.iter()
            .position(|k| *k == digit)
            .map(|col| (LOW_FREQS[row], HIGH_FREQS[col]))
    })
}

/// One step of a tone cadence; zero frequencies give silence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSegment {
    pub freq1: f32,
    pub freq2: f32,
    pub duration_ms: u32,
}

impl ToneSegment {
    pub fn new(freq1: f32, freq2: f32, duration_ms: u32) -> Self {
        Self {
            freq1,
            freq2,
            duration_ms,
        }
    }

    pub fn silence(duration_ms: u32) -> Self {
        Self::new(0.0, 0.0, duration_ms)
    }

    fn samples(&self) -> usize {
        (self.duration_ms as usize) * 8
    }
}

/// Dual-frequency signed linear tone player with an on/off cadence
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    segments: Vec<ToneSegment>,
    repeat: bool,
    volume: f32,
    segment: usize,
    offset: usize,
    interruptible: bool,
    saved_writeformat: Option<Format>,
}

impl ToneGenerator {
    pub fn new(segments: Vec<ToneSegment>, repeat: bool, volume: i16) -> Self {
        Self {
            segments,
            repeat,
            volume: volume as f32,
            segment: 0,
            offset: 0,
            interruptible: false,
            saved_writeformat: None,
        }
    }

    /// A single DTMF digit followed by a gap, played once
    pub fn dtmf(digit: char, duration_ms: u32, gap_ms: u32, volume: i16) -> Option<Self> {
        let (low, high) = dtmf_frequencies(digit)?;
        Some(Self::new(
            vec![ToneSegment::new(low, high, duration_ms), ToneSegment::silence(gap_ms)],
            false,
            volume,
        ))
    }

    /// North American ringback
    pub fn ringback(volume: i16) -> Self {
        Self::new(
            vec![ToneSegment::new(440.0, 480.0, 2000), ToneSegment::silence(4000)],
            true,
            volume,
        )
    }

    pub fn busy(volume: i16) -> Self {
        Self::new(
            vec![ToneSegment::new(480.0, 620.0, 500), ToneSegment::silence(500)],
            true,
            volume,
        )
    }

    pub fn congestion(volume: i16) -> Self {
        Self::new(
            vec![ToneSegment::new(480.0, 620.0, 250), ToneSegment::silence(250)],
            true,
            volume,
        )
    }

    /// Let ordinary writes stop this tone
    pub fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    /// Total length of one cadence cycle in samples
    pub fn cycle_samples(&self) -> usize {
        self.segments.iter().map(|s| s.samples()).sum()
    }

    fn next_sample(&mut self) -> Option<i16> {
        loop {
            let seg = *self.segments.get(self.segment)?;
            if self.offset < seg.samples() {
                let t = self.offset as f32 / SAMPLE_RATE;
                self.offset += 1;
                let mut v = 0.0;
                if seg.freq1 > 0.0 {
                    v += (2.0 * PI * seg.freq1 * t).sin();
                }
                if seg.freq2 > 0.0 {
                    v += (2.0 * PI * seg.freq2 * t).sin();
                }
                return Some((v * self.volume).clamp(i16::MIN as f32, i16::MAX as f32) as i16);
            }
            self.offset = 0;
            self.segment += 1;
            if self.segment >= self.segments.len() {
                if !self.repeat || self.cycle_samples() == 0 {
                    return None;
                }
                self.segment = 0;
            }
        }
    }
}

impl Generator for ToneGenerator {
    fn name(&self) -> &str {
        "playtones"
    }

    fn start(&mut self, chan: &mut ChannelInner) -> Result<()> {
        self.saved_writeformat = Some(chan.writeformat());
        chan.set_write_format(Format::SLINEAR)
    }

    fn generate(&mut self, samples: usize) -> Option<Frame> {
        let mut buf = BytesMut::with_capacity(samples * 2);
        let mut produced = 0;
        while produced < samples {
            match self.next_sample() {
                Some(s) => buf.put_i16_le(s),
                None => break,
            }
            produced += 1;
        }
        if produced == 0 {
            return None;
        }
        Some(Frame::voice(Format::SLINEAR, buf.freeze()).with_src("playtones"))
    }

    fn release(&mut self, chan: &mut ChannelInner) {
        if let Some(fmt) = self.saved_writeformat.take() {
            if !fmt.is_empty() {
                if let Err(e) = chan.set_write_format(fmt) {
                    tracing::warn!("Unable to restore write format {} on {}: {}", fmt.name(), chan.name(), e);
                }
            }
        }
    }

    fn writes_interrupt(&self) -> bool {
        self.interruptible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtmf_frequencies() {
        assert_eq!(dtmf_frequencies('5'), Some((770.0, 1336.0)));
        assert_eq!(dtmf_frequencies('#'), Some((941.0, 1477.0)));
        assert_eq!(dtmf_frequencies('d'), Some((941.0, 1633.0)));
        assert_eq!(dtmf_frequencies('x'), None);
    }

    #[test]
    fn test_one_shot_ends() {
        let mut tone = ToneGenerator::dtmf('1', 20, 20, 7000).unwrap();
        // 40 ms total, 320 samples
        let a = tone.generate(160).unwrap();
        assert_eq!(a.samples, 160);
        assert_eq!(a.datalen(), 320);
        let b = tone.generate(200).unwrap();
        assert_eq!(b.samples, 160);
        assert!(tone.generate(160).is_none());
    }

    #[test]
    fn test_repeating_tone_never_ends() {
        let mut tone = ToneGenerator::busy(7000);
        for _ in 0..100 {
            assert_eq!(tone.generate(160).unwrap().samples, 160);
        }
    }

    #[test]
    fn test_silence_segment_is_zero() {
        let mut tone = ToneGenerator::new(vec![ToneSegment::silence(10)], false, 7000);
        let f = tone.generate(80).unwrap();
        assert!(f.data.iter().all(|b| *b == 0));
    }
}
