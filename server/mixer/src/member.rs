use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use xb_core::{Channel, Generator, ManagerEvent};
use xb_frame::{slin, AudioFormat, Frame, FrameKind, SAMPLES_PER_FRAME};

use crate::INPUT_RING_SAMPLES;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberKind {
    /// Full privileges, may run admin commands.
    Master,
    /// May talk and listen.
    Speaker,
    /// May not talk.
    Listener,
    /// May talk but receives no audio.
    Talker,
    /// May hear and be heard only by masters.
    Consultant,
}

impl MemberKind {
    /// Member type letter from the application's flags argument; anything
    /// unrecognised keeps the listener default.
    pub fn from_flags(flags: &str) -> MemberKind {
        for c in flags.chars() {
            match c {
                'M' => return MemberKind::Master,
                'S' => return MemberKind::Speaker,
                'L' => return MemberKind::Listener,
                'T' => return MemberKind::Talker,
                'C' => return MemberKind::Consultant,
                _ => {}
            }
        }
        MemberKind::Listener
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberKind::Master => "Master",
            MemberKind::Speaker => "Speaker",
            MemberKind::Listener => "Listener",
            MemberKind::Talker => "Talker",
            MemberKind::Consultant => "Consultant",
        }
    }

    pub fn may_talk(self) -> bool {
        !matches!(self, MemberKind::Listener)
    }

    pub fn receives_audio(self) -> bool {
        !matches!(self, MemberKind::Talker)
    }
}

pub struct Member {
    chan: Arc<Channel>,
    kind: MemberKind,
    input: Mutex<VecDeque<i16>>,
    outbound: Mutex<VecDeque<Frame>>,
    is_speaking: AtomicBool,
    talk_mute: AtomicBool,
    quiet: AtomicBool,
    sounds_enabled: AtomicBool,
    remove: AtomicBool,
    on_hold: AtomicBool,
    admin_mode: AtomicBool,
    admin_buffer: Mutex<String>,
    volume: AtomicI32,
    vad: Option<Mutex<crate::VadGate>>,
    vad_bypass: AtomicBool,
}

impl Member {
    pub fn new(chan: Arc<Channel>, kind: MemberKind, vad: bool) -> Arc<Member> {
        Arc::new(Member {
            chan,
            kind,
            input: Mutex::new(VecDeque::with_capacity(INPUT_RING_SAMPLES)),
            outbound: Mutex::new(VecDeque::new()),
            // Without VAD a member counts as speaking whenever unmuted.
            is_speaking: AtomicBool::new(!vad),
            talk_mute: AtomicBool::new(false),
            quiet: AtomicBool::new(false),
            sounds_enabled: AtomicBool::new(true),
            remove: AtomicBool::new(false),
            on_hold: AtomicBool::new(false),
            admin_mode: AtomicBool::new(false),
            admin_buffer: Mutex::new(String::new()),
            volume: AtomicI32::new(0),
            vad: if vad {
                Some(Mutex::new(crate::VadGate::new(-40.0, 4)))
            } else {
                None
            },
            vad_bypass: AtomicBool::new(false),
        })
    }

    pub fn chan(&self) -> &Arc<Channel> {
        &self.chan
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking.load(Ordering::SeqCst) && !self.talk_mute.load(Ordering::SeqCst)
    }

    pub fn talk_mute(&self) -> bool {
        self.talk_mute.load(Ordering::SeqCst)
    }

    pub fn set_talk_mute(&self, mute: bool) {
        self.talk_mute.store(mute, Ordering::SeqCst);
        if mute {
            // Drop anything buffered so stale audio doesn't leak out when
            // the member unmutes.
            self.clear_input();
        }
    }

    pub fn quiet(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }

    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::SeqCst);
    }

    pub fn sounds_enabled(&self) -> bool {
        self.sounds_enabled.load(Ordering::SeqCst)
    }

    pub fn set_sounds_enabled(&self, on: bool) {
        self.sounds_enabled.store(on, Ordering::SeqCst);
    }

    pub fn marked_for_removal(&self) -> bool {
        self.remove.load(Ordering::SeqCst)
    }

    pub fn mark_for_removal(&self) {
        self.remove.store(true, Ordering::SeqCst);
    }

    pub fn on_hold(&self) -> bool {
        self.on_hold.load(Ordering::SeqCst)
    }

    pub fn set_on_hold(&self, hold: bool) {
        self.on_hold.store(hold, Ordering::SeqCst);
    }

    pub fn admin_mode(&self) -> bool {
        self.admin_mode.load(Ordering::SeqCst)
    }

    pub fn set_admin_mode(&self, on: bool) {
        self.admin_mode.store(on, Ordering::SeqCst);
        if on {
            self.admin_buffer.lock().clear();
        }
    }

    pub fn admin_push(&self, digit: char) {
        self.admin_buffer.lock().push(digit);
    }

    pub fn admin_take(&self) -> String {
        std::mem::take(&mut *self.admin_buffer.lock())
    }

    pub fn volume(&self) -> i32 {
        self.volume.load(Ordering::SeqCst)
    }

    /// Clamp talk volume to [-5, 5].
    pub fn adjust_volume(&self, delta: i32) -> i32 {
        let v = (self.volume.load(Ordering::SeqCst) + delta).clamp(-5, 5);
        self.volume.store(v, Ordering::SeqCst);
        v
    }

    pub fn vad_enabled(&self) -> bool {
        self.vad.is_some()
    }

    /// With the bypass set, a VAD member counts as always speaking.
    pub fn vad_bypass(&self) -> bool {
        self.vad_bypass.load(Ordering::SeqCst)
    }

    pub fn set_vad_bypass(&self, bypass: bool) {
        self.vad_bypass.store(bypass, Ordering::SeqCst);
        if bypass {
            self.is_speaking.store(true, Ordering::SeqCst);
        }
    }

    /// Feed one inbound voice frame: VAD gating, then the sample ring.
    /// Returns true when the speaking state changed.
    pub fn feed_voice(&self, frame: &Frame) -> bool {
        let FrameKind::Voice {
            format,
            data,
            samples,
        } = &frame.kind
        else {
            return false;
        };
        if *format != AudioFormat::Slin || *samples == 0 {
            return false;
        }
        if !self.kind.may_talk() || self.talk_mute.load(Ordering::SeqCst) {
            return false;
        }

        let pcm = slin::decode(data);
        let was = self.is_speaking.load(Ordering::SeqCst);
        let now = match &self.vad {
            Some(gate) if !self.vad_bypass() => gate.lock().update(&pcm),
            _ => true,
        };
        self.is_speaking.store(now, Ordering::SeqCst);

        if now {
            let mut ring = self.input.lock();
            for s in pcm {
                if ring.len() >= INPUT_RING_SAMPLES {
                    ring.pop_front();
                }
                ring.push_back(s);
            }
        }
        was != now
    }

    /// Pull one mixing window; None when the member has nothing queued.
    pub(crate) fn take_window(&self) -> Option<Vec<i16>> {
        let mut ring = self.input.lock();
        if ring.len() < SAMPLES_PER_FRAME {
            return None;
        }
        Some(ring.drain(..SAMPLES_PER_FRAME).collect())
    }

    pub(crate) fn clear_input(&self) {
        self.input.lock().clear();
    }

    /// Deliver this tick's personal mix toward the channel generator.
    /// Members on hold hear their hold source instead.
    pub(crate) fn deliver(&self, frame: Frame) {
        if self.on_hold() {
            return;
        }
        let mut q = self.outbound.lock();
        if q.len() >= 4 {
            q.pop_front();
        }
        q.push_back(frame);
    }

    pub fn emit_state_event(&self) {
        let speaking = self.is_speaking();
        debug!(chan = %self.chan.name(), speaking, "member state change");
        self.chan.core().events.emit(
            ManagerEvent::new("NConference-State")
                .field("Channel", self.chan.name())
                .field("State", if speaking { "speaking" } else { "silent" }),
        );
    }
}

/// Generator feeding the member's outbound queue down its channel.
pub(crate) struct MemberGen {
    pub member: Arc<Member>,
}

impl Generator for MemberGen {
    fn generate(&self, _chan: &Arc<Channel>, _samples: usize) -> Option<Frame> {
        self.member.outbound.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing() {
        assert_eq!(MemberKind::from_flags("M"), MemberKind::Master);
        assert_eq!(MemberKind::from_flags("Sq"), MemberKind::Speaker);
        assert_eq!(MemberKind::from_flags("xT"), MemberKind::Talker);
        assert_eq!(MemberKind::from_flags(""), MemberKind::Listener);
        assert_eq!(MemberKind::from_flags("C"), MemberKind::Consultant);
    }

    #[test]
    fn audibility_matrix() {
        assert!(MemberKind::Master.may_talk());
        assert!(!MemberKind::Listener.may_talk());
        assert!(MemberKind::Talker.may_talk());
        assert!(!MemberKind::Talker.receives_audio());
        assert!(MemberKind::Consultant.may_talk());
    }
}
