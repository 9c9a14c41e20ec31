//! Format translation.
//!
//! Codec implementations are opaque stream transformers registered per
//! (src, dst) pair; the registry finds a chain from a channel's raw format
//! to the requested one and read/write apply it transparently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use xb_frame::{AudioFormat, Frame};

use crate::error::{CoreError, CoreResult};

/// One-hop stream transformer.
pub trait Translator: Send + Sync {
    fn src(&self) -> AudioFormat;
    fn dst(&self) -> AudioFormat;
    /// Translate a voice frame in `src()` format. Non-voice frames are
    /// never passed in.
    fn translate(&self, frame: &Frame) -> Frame;
}

#[derive(Default)]
pub struct TranslatorRegistry {
    inner: RwLock<Vec<Arc<dyn Translator>>>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, t: Arc<dyn Translator>) {
        self.inner.write().push(t);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Shortest chain of translators from `src` to `dst`.
    pub fn find_path(&self, src: AudioFormat, dst: AudioFormat) -> Option<Vec<Arc<dyn Translator>>> {
        if src == dst {
            return Some(Vec::new());
        }
        let all = self.inner.read();
        // BFS over the format graph.
        let mut prev: HashMap<AudioFormat, Arc<dyn Translator>> = HashMap::new();
        let mut queue = VecDeque::from([src]);
        while let Some(cur) = queue.pop_front() {
            for t in all.iter() {
                if t.src() == cur && t.dst() != src && !prev.contains_key(&t.dst()) {
                    prev.insert(t.dst(), Arc::clone(t));
                    if t.dst() == dst {
                        let mut path = Vec::new();
                        let mut at = dst;
                        while at != src {
                            let hop = Arc::clone(&prev[&at]);
                            at = hop.src();
                            path.push(hop);
                        }
                        path.reverse();
                        return Some(path);
                    }
                    queue.push_back(t.dst());
                }
            }
        }
        None
    }

    /// Translate a voice frame to `dst`, or fail if no path exists.
    pub fn translate(&self, frame: &Frame, dst: AudioFormat) -> CoreResult<Frame> {
        let src = match &frame.kind {
            xb_frame::FrameKind::Voice { format, .. } => *format,
            _ => return Ok(frame.clone()),
        };
        let path = self
            .find_path(src, dst)
            .ok_or(CoreError::FormatUnsupported { from: src, to: dst })?;
        let mut out = frame.clone();
        for hop in path {
            out = hop.translate(&out);
        }
        Ok(out)
    }

    /// Best-effort variant used on the read path: on a dead end the frame
    /// passes through unchanged with a warning.
    pub fn translate_or_pass(&self, frame: Frame, dst: AudioFormat) -> Frame {
        match self.translate(&frame, dst) {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "passing frame through untranslated");
                frame
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Test translator that just relabels the format.
    struct Relabel {
        src: AudioFormat,
        dst: AudioFormat,
    }

    impl Translator for Relabel {
        fn src(&self) -> AudioFormat {
            self.src
        }
        fn dst(&self) -> AudioFormat {
            self.dst
        }
        fn translate(&self, frame: &Frame) -> Frame {
            match &frame.kind {
                xb_frame::FrameKind::Voice { data, samples, .. } => {
                    Frame::voice(self.dst, data.clone(), *samples, frame.src)
                }
                _ => frame.clone(),
            }
        }
    }

    #[test]
    fn identity_path_is_empty() {
        let reg = TranslatorRegistry::new();
        assert!(reg
            .find_path(AudioFormat::Slin, AudioFormat::Slin)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn two_hop_path_found() {
        let reg = TranslatorRegistry::new();
        reg.register(Arc::new(Relabel {
            src: AudioFormat::Ulaw,
            dst: AudioFormat::Slin,
        }));
        reg.register(Arc::new(Relabel {
            src: AudioFormat::Slin,
            dst: AudioFormat::Gsm,
        }));

        let path = reg.find_path(AudioFormat::Ulaw, AudioFormat::Gsm).unwrap();
        assert_eq!(path.len(), 2);

        let f = Frame::voice(AudioFormat::Ulaw, Bytes::from_static(&[1, 2]), 1, "t");
        let out = reg.translate(&f, AudioFormat::Gsm).unwrap();
        match out.kind {
            xb_frame::FrameKind::Voice { format, .. } => assert_eq!(format, AudioFormat::Gsm),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dead_end_is_format_unsupported() {
        let reg = TranslatorRegistry::new();
        let f = Frame::voice(AudioFormat::G729, Bytes::new(), 0, "t");
        let err = reg.translate(&f, AudioFormat::Slin).unwrap_err();
        assert!(matches!(err, CoreError::FormatUnsupported { .. }));
    }
}
