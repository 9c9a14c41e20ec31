//! The per-tick mixing step, kept free of task machinery so it can be
//! exercised directly.

use std::sync::Arc;

use xb_frame::{slin, AudioFormat, Frame, SAMPLES_PER_FRAME};

use crate::member::{Member, MemberKind};

/// Whether `talker`'s audio is audible to `listener`. Consultants are
/// audible only to masters; nobody hears themselves.
fn audible(talker: MemberKind, listener: MemberKind) -> bool {
    talker != MemberKind::Consultant || listener == MemberKind::Master
}

/// Run one 20 ms mixing tick over the member set.
///
/// Each speaking member contributes exactly one window; each member that
/// receives audio gets the saturating sum of every *other* audible
/// contribution (silence when there is none).
pub(crate) fn tick(members: &[Arc<Member>]) {
    // Pull contributions first so every listener sees the same windows.
    let contributions: Vec<Option<Vec<i16>>> = members
        .iter()
        .map(|m| {
            if m.is_speaking() {
                m.take_window()
            } else {
                None
            }
        })
        .collect();

    for (i, member) in members.iter().enumerate() {
        if !member.kind().receives_audio() {
            continue;
        }
        let mut mixed = vec![0i16; SAMPLES_PER_FRAME];
        for (j, contribution) in contributions.iter().enumerate() {
            if i == j {
                continue;
            }
            let Some(samples) = contribution else { continue };
            if !audible(members[j].kind(), member.kind()) {
                continue;
            }
            slin::saturating_mix(&mut mixed, samples);
        }
        member.deliver(Frame::voice(
            AudioFormat::Slin,
            slin::encode(&mixed),
            SAMPLES_PER_FRAME,
            "mixer",
        ));
    }
}
