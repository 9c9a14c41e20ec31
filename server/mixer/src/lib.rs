//! Conference mixer.
//!
//! One worker task per conference ticks every 20 ms: it drains the admin
//! command queue, pulls one window of samples from each speaking member's
//! input ring, and writes each member's personal mix (everyone else who is
//! audible to them) out through a channel generator. Speech gating is an
//! energy VAD behind a hysteresis so state doesn't flap at the threshold.

mod app;
mod conference;
mod member;
mod mix;
mod vad;

pub use app::{modinfo, ConferenceApp};
pub use conference::{ConfCommand, Conference, Conferences};
pub use member::{Member, MemberKind};
pub use vad::{energy_vad, VadGate};

/// Seconds an empty, no-auto-destroy conference lingers before removal.
pub const DESTROY_LINGER_SECS: u64 = 300;

/// Input ring capacity in samples (~384 ms at 8 kHz).
pub const INPUT_RING_SAMPLES: usize = 3072;
