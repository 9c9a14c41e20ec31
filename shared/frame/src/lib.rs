//! Typed media/control frames and audio format plumbing.
//!
//! Frames are the unit of inter-channel communication: voice payloads are
//! opaque `Bytes` interpreted per [`AudioFormat`]; control frames carry call
//! progress events. Payload clones are cheap, so a frame fanned out to many
//! receivers shares one buffer.

mod format;
mod frame;
pub mod slin;

pub use format::{AudioFormat, FormatMask};
pub use frame::{ControlOp, Frame, FrameKind};

/// Conference/telephony base rate.
pub const SAMPLE_RATE: u32 = 8_000;
/// Mixer tick length.
pub const FRAME_MS: u64 = 20;
/// Samples in one 20 ms tick at 8 kHz.
pub const SAMPLES_PER_FRAME: usize = 160;
