use bytes::Bytes;

use crate::{AudioFormat, SAMPLES_PER_FRAME};

/// Call-progress and indication events carried by control frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlOp {
    Hangup,
    Ring,
    Ringing,
    Answer,
    Busy,
    Congestion,
    Hold,
    Unhold,
    Progress,
    Flash,
}

/// Frame payload variants. Voice data is opaque bytes in `format`.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameKind {
    Voice {
        format: AudioFormat,
        data: Bytes,
        samples: usize,
    },
    Dtmf(char),
    Control(ControlOp),
    Image {
        data: Bytes,
    },
    Null,
    Hangup,
}

/// One typed unit of inter-channel communication.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Diagnostic tag naming the producer ("mixer", "chan_loop", ...).
    pub src: &'static str,
}

impl Frame {
    pub fn voice(format: AudioFormat, data: Bytes, samples: usize, src: &'static str) -> Self {
        Frame {
            kind: FrameKind::Voice {
                format,
                data,
                samples,
            },
            src,
        }
    }

    pub fn dtmf(digit: char, src: &'static str) -> Self {
        Frame {
            kind: FrameKind::Dtmf(digit),
            src,
        }
    }

    pub fn control(op: ControlOp, src: &'static str) -> Self {
        Frame {
            kind: FrameKind::Control(op),
            src,
        }
    }

    pub fn hangup(src: &'static str) -> Self {
        Frame {
            kind: FrameKind::Hangup,
            src,
        }
    }

    pub fn null(src: &'static str) -> Self {
        Frame {
            kind: FrameKind::Null,
            src,
        }
    }

    /// One tick of signed-linear silence.
    pub fn silence(src: &'static str) -> Self {
        Frame::voice(
            AudioFormat::Slin,
            Bytes::from(vec![0u8; SAMPLES_PER_FRAME * 2]),
            SAMPLES_PER_FRAME,
            src,
        )
    }

    pub fn is_voice(&self) -> bool {
        matches!(self.kind, FrameKind::Voice { .. })
    }

    pub fn is_hangup(&self) -> bool {
        matches!(
            self.kind,
            FrameKind::Hangup | FrameKind::Control(ControlOp::Hangup)
        )
    }

    pub fn samples(&self) -> usize {
        match &self.kind {
            FrameKind::Voice { samples, .. } => *samples,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_one_tick_of_slin() {
        let f = Frame::silence("test");
        match &f.kind {
            FrameKind::Voice {
                format,
                data,
                samples,
            } => {
                assert_eq!(*format, AudioFormat::Slin);
                assert_eq!(*samples, SAMPLES_PER_FRAME);
                assert_eq!(data.len(), SAMPLES_PER_FRAME * 2);
                assert!(data.iter().all(|&b| b == 0));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn hangup_detection_covers_control_hangup() {
        assert!(Frame::hangup("t").is_hangup());
        assert!(Frame::control(ControlOp::Hangup, "t").is_hangup());
        assert!(!Frame::control(ControlOp::Ringing, "t").is_hangup());
    }
}
