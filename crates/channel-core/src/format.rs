//! Codec identifiers and format sets
//!
//! A [`Format`] is a bitmask. A single bit names one codec; several bits form
//! a capability set such as a channel's native formats.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

/// Codec bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Format(u64);

impl Format {
    pub const NONE: Format = Format(0);
    pub const G723_1: Format = Format(1 << 0);
    pub const GSM: Format = Format(1 << 1);
    pub const ULAW: Format = Format(1 << 2);
    pub const ALAW: Format = Format(1 << 3);
    pub const G726: Format = Format(1 << 4);
    pub const ADPCM: Format = Format(1 << 5);
    /// Raw 16-bit signed linear, 8000 Hz
    pub const SLINEAR: Format = Format(1 << 6);
    pub const LPC10: Format = Format(1 << 7);
    pub const G729A: Format = Format(1 << 8);
    pub const SPEEX: Format = Format(1 << 9);
    pub const ILBC: Format = Format(1 << 10);
    pub const MAX_AUDIO: Format = Format(1 << 15);
    pub const AUDIO_MASK: Format = Format((1 << 16) - 1);

    pub const JPEG: Format = Format(1 << 16);
    pub const PNG: Format = Format(1 << 17);
    pub const H261: Format = Format(1 << 18);
    pub const H263: Format = Format(1 << 19);
    pub const H263_PLUS: Format = Format(1 << 20);
    pub const H264: Format = Format(1 << 21);
    pub const MAX_VIDEO: Format = Format(1 << 24);
    pub const VIDEO_MASK: Format = Format(((1 << 25) - 1) & !((1 << 16) - 1));

    /// Build from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Format(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is present in `self`
    pub const fn contains(self, other: Format) -> bool {
        other.0 != 0 && (self.0 & other.0) == other.0
    }

    /// True when any bit is shared
    pub const fn intersects(self, other: Format) -> bool {
        (self.0 & other.0) != 0
    }

    /// Only the audio part of the mask
    pub const fn audio(self) -> Format {
        Format(self.0 & Self::AUDIO_MASK.0)
    }

    /// True when exactly one codec bit is set
    pub const fn is_single(self) -> bool {
        self.0 != 0 && (self.0 & (self.0 - 1)) == 0
    }

    /// Iterate over the single-codec bits of this set, lowest first
    pub fn iter(self) -> impl Iterator<Item = Format> {
        (0..64u32)
            .map(|bit| Format(1u64 << bit))
            .filter(move |f| self.intersects(*f))
    }

    /// Bit index of a single-codec format
    pub fn index(self) -> Option<usize> {
        if self.is_single() {
            Some(self.0.trailing_zeros() as usize)
        } else {
            None
        }
    }

    /// Pick the preferred audio codec out of a set
    pub fn best_codec(self) -> Option<Format> {
        PREFERENCE.iter().copied().find(|f| self.intersects(*f))
    }

    /// Short codec name for a single-codec format
    pub fn name(self) -> &'static str {
        FORMAT_NAMES
            .iter()
            .find(|(f, _)| *f == self)
            .map(|(_, n)| *n)
            .unwrap_or("unknown")
    }

    /// Look a codec up by its short name (case-insensitive); "all" gives every known codec
    pub fn from_name(name: &str) -> Option<Format> {
        if name.eq_ignore_ascii_case("all") {
            return Some(FORMAT_NAMES.iter().fold(Format::NONE, |acc, (f, _)| acc | *f));
        }
        FORMAT_NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(f, _)| *f)
    }

    /// Number of samples carried by `datalen` bytes, for codecs where that is a fixed ratio
    pub fn samples_for(self, datalen: usize) -> usize {
        match self {
            Format::SLINEAR => datalen / 2,
            Format::ULAW | Format::ALAW => datalen,
            Format::G726 | Format::ADPCM => datalen * 2,
            Format::GSM => (datalen / 33) * 160,
            Format::ILBC => (datalen / 50) * 240,
            Format::G729A => datalen * 8,
            Format::G723_1 => (datalen / 24) * 240,
            Format::LPC10 => (datalen / 7) * 180,
            _ => 0,
        }
    }
}

/// Audio codec preference, best first
const PREFERENCE: [Format; 11] = [
    Format::ULAW,
    Format::ALAW,
    Format::SLINEAR,
    Format::G726,
    Format::ADPCM,
    Format::GSM,
    Format::ILBC,
    Format::SPEEX,
    Format::LPC10,
    Format::G729A,
    Format::G723_1,
];

const FORMAT_NAMES: [(Format, &str); 17] = [
    (Format::G723_1, "g723"),
    (Format::GSM, "gsm"),
    (Format::ULAW, "ulaw"),
    (Format::ALAW, "alaw"),
    (Format::G726, "g726"),
    (Format::ADPCM, "adpcm"),
    (Format::SLINEAR, "slin"),
    (Format::LPC10, "lpc10"),
    (Format::G729A, "g729"),
    (Format::SPEEX, "speex"),
    (Format::ILBC, "ilbc"),
    (Format::JPEG, "jpeg"),
    (Format::PNG, "png"),
    (Format::H261, "h261"),
    (Format::H263, "h263"),
    (Format::H263_PLUS, "h263p"),
    (Format::H264, "h264"),
];

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "0x0 (nothing)");
        }
        let names: Vec<&str> = self.iter().map(|c| c.name()).collect();
        write!(f, "0x{:x} ({})", self.0, names.join("|"))
    }
}

impl BitOr for Format {
    type Output = Format;
    fn bitor(self, rhs: Format) -> Format {
        Format(self.0 | rhs.0)
    }
}

impl BitOrAssign for Format {
    fn bitor_assign(&mut self, rhs: Format) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Format {
    type Output = Format;
    fn bitand(self, rhs: Format) -> Format {
        Format(self.0 & rhs.0)
    }
}

impl BitAndAssign for Format {
    fn bitand_assign(&mut self, rhs: Format) {
        self.0 &= rhs.0;
    }
}

impl Not for Format {
    type Output = Format;
    fn not(self) -> Format {
        Format(!self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_codec_prefers_ulaw() {
        let set = Format::GSM | Format::ULAW | Format::SLINEAR;
        assert_eq!(set.best_codec(), Some(Format::ULAW));
        assert_eq!((Format::GSM | Format::ILBC).best_codec(), Some(Format::GSM));
        assert_eq!(Format::H263.best_codec(), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(Format::ALAW.name(), "alaw");
        assert_eq!(Format::from_name("SLIN"), Some(Format::SLINEAR));
        assert!(Format::from_name("all").unwrap().contains(Format::H264));
        assert_eq!(Format::from_name("bogus"), None);
    }

    #[test]
    fn test_masks() {
        let set = Format::ULAW | Format::H263;
        assert_eq!(set.audio(), Format::ULAW);
        assert!(Format::VIDEO_MASK.contains(Format::H263));
        assert!(!Format::AUDIO_MASK.intersects(Format::H263));
        assert_eq!(set.iter().count(), 2);
        assert!(Format::ULAW.is_single());
        assert!(!set.is_single());
    }

    #[test]
    fn test_samples() {
        assert_eq!(Format::SLINEAR.samples_for(320), 160);
        assert_eq!(Format::ULAW.samples_for(160), 160);
        assert_eq!(Format::GSM.samples_for(33), 160);
    }
}
