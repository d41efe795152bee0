//! Codec translation paths
//!
//! The channel core does not convert audio itself. Codec modules register
//! [`Translator`] steps here; the registry strings them into the cheapest
//! multi-step [`TranslatorPath`] between two formats.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};
use crate::format::Format;
use crate::frame::Frame;

/// One codec conversion step, registered by a codec module
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;
    fn src_format(&self) -> Format;
    fn dst_format(&self) -> Format;
    /// Relative cost of this step, used when picking a path
    fn cost(&self) -> u32 {
        1
    }
    /// Create per-path conversion state
    fn new_instance(&self) -> Box<dyn TranslatorInstance>;
}

/// Conversion state for one step of one path
pub trait TranslatorInstance: Send {
    /// Feed one frame in. `None` means the step is buffering and has nothing to emit yet.
    fn translate(&mut self, frame: &Frame) -> Option<Frame>;
}

static NEXT_PATH_ID: AtomicU64 = AtomicU64::new(1);

/// An owned chain of translator instances from one format to another
pub struct TranslatorPath {
    id: u64,
    src: Format,
    dst: Format,
    steps: Vec<(String, Box<dyn TranslatorInstance>)>,
}

impl TranslatorPath {
    /// Unique id; a rebuilt path always gets a new one
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn src(&self) -> Format {
        self.src
    }

    pub fn dst(&self) -> Format {
        self.dst
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Run a frame through every step
    pub fn translate(&mut self, frame: &Frame) -> Option<Frame> {
        let mut current = frame.clone();
        for (_, step) in self.steps.iter_mut() {
            current = step.translate(&current)?;
        }
        Some(current)
    }
}

impl fmt::Debug for TranslatorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("TranslatorPath")
            .field("id", &self.id)
            .field("src", &self.src.name())
            .field("dst", &self.dst.name())
            .field("steps", &names)
            .finish()
    }
}

/// Registered translators
#[derive(Default)]
pub struct TranslatorRegistry {
    translators: RwLock<Vec<Arc<dyn Translator>>>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a translation step
    pub fn register(&self, translator: Arc<dyn Translator>) -> Result<()> {
        let src = translator.src_format();
        let dst = translator.dst_format();
        if !src.is_single() || !dst.is_single() {
            return Err(ChannelError::invalid(format!(
                "Translator {} must convert between single formats",
                translator.name()
            )));
        }
        debug!(
            "Registered translator '{}' from {} to {}, cost {}",
            translator.name(),
            src.name(),
            dst.name(),
            translator.cost()
        );
        self.translators.write().push(translator);
        Ok(())
    }

    /// Remove a translator by name; no-op if absent
    pub fn unregister(&self, name: &str) {
        self.translators.write().retain(|t| t.name() != name);
    }

    /// Every source format that has at least one outgoing step
    pub fn sources(&self) -> Format {
        self.translators
            .read()
            .iter()
            .fold(Format::NONE, |acc, t| acc | t.src_format())
    }

    /// Cheapest chain of steps from `src` to `dst`, as translator list
    fn shortest(&self, src: Format, dst: Format) -> Option<(u32, Vec<Arc<dyn Translator>>)> {
        let (si, di) = (src.index()?, dst.index()?);
        let translators = self.translators.read();
        let mut dist = [u32::MAX; 64];
        let mut via: [Option<usize>; 64] = [None; 64];
        let mut heap = BinaryHeap::new();
        dist[si] = 0;
        heap.push(Reverse((0u32, si)));

        while let Some(Reverse((cost, node))) = heap.pop() {
            if node == di {
                break;
            }
            if cost > dist[node] {
                continue;
            }
            for (ti, t) in translators.iter().enumerate() {
                if t.src_format().index() != Some(node) {
                    continue;
                }
                let Some(next) = t.dst_format().index() else { continue };
                let next_cost = cost.saturating_add(t.cost());
                if next_cost < dist[next] {
                    dist[next] = next_cost;
                    via[next] = Some(ti);
                    heap.push(Reverse((next_cost, next)));
                }
            }
        }

        if dist[di] == u32::MAX {
            return None;
        }
        let mut chain = Vec::new();
        let mut node = di;
        while node != si {
            let ti = via[node]?;
            let t = translators[ti].clone();
            node = t.src_format().index()?;
            chain.push(t);
        }
        chain.reverse();
        Some((dist[di], chain))
    }

    /// Cost of the cheapest path, `None` if there is none
    pub fn path_cost(&self, src: Format, dst: Format) -> Option<u32> {
        if src == dst {
            return Some(0);
        }
        self.shortest(src, dst).map(|(cost, _)| cost)
    }

    /// Build a translation path from `src` to `dst`
    pub fn build_path(&self, dst: Format, src: Format) -> Result<TranslatorPath> {
        let no_path = || ChannelError::NoTranslationPath {
            from: src.name().to_string(),
            to: dst.name().to_string(),
        };
        let (_, chain) = self.shortest(src, dst).ok_or_else(no_path)?;
        if chain.is_empty() {
            return Err(no_path());
        }
        let steps = chain
            .iter()
            .map(|t| (t.name().to_string(), t.new_instance()))
            .collect();
        let path = TranslatorPath {
            id: NEXT_PATH_ID.fetch_add(1, Ordering::Relaxed),
            src,
            dst,
            steps,
        };
        debug!("Built translation path {:?}", path);
        Ok(path)
    }

    /// Pick formats for talking between a `dst` set and a `src` set.
    ///
    /// Returns `(dst_choice, src_choice)`. A common format is preferred;
    /// otherwise the cheapest translatable pair is chosen.
    pub fn best_choice(&self, dst: Format, src: Format) -> Result<(Format, Format)> {
        let common = dst & src;
        if let Some(best) = common.best_codec().or_else(|| common.iter().next()) {
            return Ok((best, best));
        }

        let mut best: Option<(u32, Format, Format)> = None;
        for y in dst.audio().iter() {
            for x in src.audio().iter() {
                if let Some(cost) = self.path_cost(x, y) {
                    if best.map_or(true, |(c, _, _)| cost < c) {
                        best = Some((cost, y, x));
                    }
                }
            }
        }
        match best {
            Some((_, y, x)) => Ok((y, x)),
            None => {
                warn!("No translator path between {} and {}", dst, src);
                Err(ChannelError::NoTranslationPath {
                    from: src.to_string(),
                    to: dst.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Relabel {
        name: &'static str,
        src: Format,
        dst: Format,
        cost: u32,
    }

    struct RelabelInstance(Format);

    impl TranslatorInstance for RelabelInstance {
        fn translate(&mut self, frame: &Frame) -> Option<Frame> {
            Some(Frame::voice(self.0, Bytes::copy_from_slice(&frame.data)).with_samples(frame.samples))
        }
    }

    impl Translator for Relabel {
        fn name(&self) -> &str {
            self.name
        }
        fn src_format(&self) -> Format {
            self.src
        }
        fn dst_format(&self) -> Format {
            self.dst
        }
        fn cost(&self) -> u32 {
            self.cost
        }
        fn new_instance(&self) -> Box<dyn TranslatorInstance> {
            Box::new(RelabelInstance(self.dst))
        }
    }

    fn step(name: &'static str, src: Format, dst: Format, cost: u32) -> Arc<dyn Translator> {
        Arc::new(Relabel { name, src, dst, cost })
    }

    fn registry() -> TranslatorRegistry {
        let reg = TranslatorRegistry::new();
        reg.register(step("ulawtolin", Format::ULAW, Format::SLINEAR, 1)).unwrap();
        reg.register(step("lintoulaw", Format::SLINEAR, Format::ULAW, 1)).unwrap();
        reg.register(step("gsmtolin", Format::GSM, Format::SLINEAR, 3)).unwrap();
        reg.register(step("lintogsm", Format::SLINEAR, Format::GSM, 3)).unwrap();
        reg
    }

    #[test]
    fn test_multi_step_path() {
        let reg = registry();
        let mut path = reg.build_path(Format::GSM, Format::ULAW).unwrap();
        assert_eq!(path.len(), 2);
        let out = path.translate(&Frame::voice(Format::ULAW, vec![0u8; 160])).unwrap();
        assert_eq!(out.format(), Some(Format::GSM));
        assert_eq!(reg.path_cost(Format::ULAW, Format::GSM), Some(4));
    }

    #[test]
    fn test_no_path() {
        let reg = registry();
        let err = reg.build_path(Format::ILBC, Format::ULAW).unwrap_err();
        assert!(matches!(err, ChannelError::NoTranslationPath { .. }));
    }

    #[test]
    fn test_path_ids_unique() {
        let reg = registry();
        let a = reg.build_path(Format::SLINEAR, Format::ULAW).unwrap();
        let b = reg.build_path(Format::SLINEAR, Format::ULAW).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_best_choice() {
        let reg = registry();
        let (d, s) = reg.best_choice(Format::ULAW | Format::GSM, Format::GSM | Format::ALAW).unwrap();
        assert_eq!((d, s), (Format::GSM, Format::GSM));

        let (d, s) = reg.best_choice(Format::SLINEAR, Format::GSM | Format::ULAW).unwrap();
        assert_eq!((d, s), (Format::SLINEAR, Format::ULAW));

        assert!(reg.best_choice(Format::ILBC, Format::ULAW).is_err());
    }

    #[test]
    fn test_rejects_multi_format_translator() {
        let reg = TranslatorRegistry::new();
        let bad = step("bad", Format::ULAW | Format::ALAW, Format::SLINEAR, 1);
        assert!(reg.register(bad).is_err());
    }
}
