//! The `NConference` application and its module wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use xb_core::{softhangup, AppReturn, Application, Channel, ChannelState, ManagerEvent};
use xb_frame::{AudioFormat, FrameKind};
use xb_loader::{ModuleContext, ModuleError, ModuleImpl};
use xb_registry::EntryId;

use crate::conference::{ConfCommand, Conference, Conferences};
use crate::member::{Member, MemberGen, MemberKind};

pub struct ConferenceApp {
    conferences: Arc<Conferences>,
}

impl ConferenceApp {
    pub fn new(conferences: Arc<Conferences>) -> ConferenceApp {
        ConferenceApp { conferences }
    }

    pub fn conferences(&self) -> &Arc<Conferences> {
        &self.conferences
    }
}

#[async_trait]
impl Application for ConferenceApp {
    fn name(&self) -> &str {
        "NConference"
    }

    fn synopsis(&self) -> &str {
        "Channel independent conference application"
    }

    /// `NConference(name[,flags[,pin]])`. Flags: `M`aster, `S`peaker,
    /// `L`istener, `T`alker, `C`onsultant; `V` enables speech detection,
    /// `q` quiet mode, `d` disables auto-destroy, `x` passes DTMF through.
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        let Some(name) = args.first().filter(|n| !n.is_empty()) else {
            warn!("NConference requires a conference name");
            return AppReturn::Failure;
        };
        let flags = args.get(1).map(String::as_str).unwrap_or("");
        let pin = args.get(2).map(String::as_str).unwrap_or("");

        let kind = MemberKind::from_flags(flags);
        let vad = flags.contains('V');
        let member = Member::new(Arc::clone(chan), kind, vad);
        if flags.contains('q') {
            member.set_quiet(true);
        }

        // Seat the member: an existing conference gates on lock state and
        // PIN; a fresh one is created with the member already inside.
        let conf = match self.conferences.get(name) {
            Some(conf) => {
                if conf.is_locked() && kind != MemberKind::Master {
                    debug!(conf = %name, chan = %chan.name(), "conference is locked");
                    conf.queue_sound(None, "conf-locked");
                    return AppReturn::Ok;
                }
                if let Some(expected) = conf.pin() {
                    if kind != MemberKind::Master && pin != expected {
                        debug!(conf = %name, chan = %chan.name(), "wrong conference PIN");
                        conf.queue_sound(None, "conf-invalidpin");
                        return AppReturn::Ok;
                    }
                }
                conf.add_member(Arc::clone(&member));
                conf
            }
            None => {
                let (conf, _created) = self.conferences.find_or_create(name, Some(&member));
                if flags.contains('d') && kind == MemberKind::Master {
                    conf.set_auto_destroy(false);
                }
                if kind == MemberKind::Master && !pin.is_empty() {
                    conf.set_pin(&chan.name(), pin);
                }
                conf
            }
        };

        if chan.state() != ChannelState::Up {
            if let Err(e) = chan.answer().await {
                warn!(chan = %chan.name(), error = %e, "cannot answer");
                conf.remove_member(&member);
                return AppReturn::Failure;
            }
        }
        // The mixer works in signed linear.
        if let Err(e) = chan.set_read_format(AudioFormat::Slin) {
            warn!(chan = %chan.name(), error = %e, "no translator path to slin");
        }
        if let Err(e) = chan.set_write_format(AudioFormat::Slin) {
            warn!(chan = %chan.name(), error = %e, "no translator path from slin");
        }
        chan.activate_generator(Arc::new(MemberGen {
            member: Arc::clone(&member),
        }));

        let manage_dtmf = !flags.contains('x');
        let res = member_loop(&conf, &member, chan, manage_dtmf).await;

        chan.deactivate_generator();
        conf.remove_member(&member);
        conf.command(ConfCommand::QueueSound {
            sound: "conf-hasleft".to_owned(),
            issuer: Some(chan.name()),
        });
        debug!(conf = %conf.name(), chan = %chan.name(), "member left");
        res
    }
}

/// Frame pump for one member: voice feeds the VAD and the input ring,
/// DTMF drives member options or master admin commands.
async fn member_loop(
    conf: &Arc<Conference>,
    member: &Arc<Member>,
    chan: &Arc<Channel>,
    manage_dtmf: bool,
) -> AppReturn {
    loop {
        if member.marked_for_removal() || chan.check_hangup() {
            return AppReturn::Ok;
        }
        let frame = match chan.read().await {
            Ok(f) => f,
            Err(_) => return AppReturn::Failure,
        };
        match &frame.kind {
            FrameKind::Hangup => return AppReturn::Ok,
            FrameKind::Dtmf(d) if manage_dtmf => {
                chan.core().events.emit(
                    ManagerEvent::new("NConference-DTMF")
                        .field("Channel", chan.name())
                        .field("Key", d.to_string()),
                );
                handle_dtmf(conf, member, *d);
            }
            FrameKind::Voice { .. } => {
                if member.feed_voice(&frame) {
                    member.emit_state_event();
                }
            }
            _ => {}
        }
    }
}

/// Member-local DTMF options; masters reach conference-wide admin actions
/// through `*` + digits + `#`.
fn handle_dtmf(conf: &Arc<Conference>, member: &Arc<Member>, digit: char) {
    if member.admin_mode() {
        match digit {
            '*' => member.set_admin_mode(false),
            '#' => {
                let buffer = member.admin_take();
                member.set_admin_mode(false);
                run_admin_command(conf, member, &buffer);
            }
            d => member.admin_push(d),
        }
        return;
    }

    match digit {
        '*' => {
            if member.kind() == MemberKind::Master {
                member.set_admin_mode(true);
                conf.queue_sound(Some(member), "conf-sysop");
            }
        }
        '#' => {
            debug!(chan = %member.chan().name(), "member requested disconnect");
            member.mark_for_removal();
            member.chan().softhangup(softhangup::SHUTDOWN);
        }
        '1' => {
            conf.queue_sound(Some(member), "beep");
            member.adjust_volume(-1);
        }
        '2' => {
            let mute = !member.talk_mute();
            member.set_talk_mute(mute);
            member.emit_state_event();
        }
        '3' => {
            conf.queue_sound(Some(member), "beep");
            member.adjust_volume(1);
        }
        '4' => {
            if member.vad_enabled() {
                let bypass = !member.vad_bypass();
                member.set_vad_bypass(bypass);
                conf.queue_sound(Some(member), if bypass { "disabled" } else { "enabled" });
            } else {
                debug!(chan = %member.chan().name(), "member not enabled for VAD");
            }
        }
        '5' => {
            let mute = !member.talk_mute();
            member.set_talk_mute(mute);
            conf.queue_sound(Some(member), if mute { "conf-muted" } else { "conf-unmuted" });
        }
        '6' => {
            let on = !member.sounds_enabled();
            member.set_sounds_enabled(on);
            if on {
                conf.queue_sound(Some(member), "beep");
            }
        }
        '0' => {
            conf.queue_sound(Some(member), "conf-thereare");
            conf.queue_sound(Some(member), &conf.member_count().to_string());
            conf.queue_sound(Some(member), "conf-peopleinconf");
        }
        other => {
            debug!(key = %other, "don't know how to manage DTMF key");
        }
    }
}

/// `<action><parameters>` collected in admin mode.
fn run_admin_command(conf: &Arc<Conference>, member: &Arc<Member>, buffer: &str) {
    let issuer = Some(member.chan().name());
    let mut chars = buffer.chars();
    let action = chars.next().unwrap_or('\0');
    let params: String = chars.collect();
    let toggled_on = params.starts_with('1');

    match action {
        '4' => conf.command(ConfCommand::EnableSounds { enable: toggled_on }),
        '5' => conf.command(ConfCommand::MuteAll {
            mute: toggled_on,
            issuer,
        }),
        '6' => conf.command(ConfCommand::PlayMoh { start: toggled_on }),
        '7' => {
            conf.set_locked(toggled_on);
            conf.queue_sound(
                Some(member),
                if toggled_on { "conf-lockednow" } else { "conf-unlockednow" },
            );
        }
        '9' => {
            conf.set_pin(&member.chan().name(), &params);
            conf.queue_sound(Some(member), "beep");
        }
        '0' => conf.command(ConfCommand::Hangup {
            all: params.starts_with('1') || params.starts_with('2'),
            issuer,
        }),
        other => {
            debug!(action = %other, params = %params, "invalid or unknown admin command");
            conf.queue_sound(Some(member), "beeperr");
        }
    }
}

/// Module descriptor registering the conference application.
struct ConferenceModule {
    app_entry: Mutex<Option<EntryId>>,
    conferences: Mutex<Option<Arc<Conferences>>>,
}

impl ModuleImpl for ConferenceModule {
    fn description(&self) -> &str {
        "Channel independent conference application"
    }

    fn register(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        let conferences = Conferences::new(&ctx.core);
        let entry = ctx.register_app(Arc::new(ConferenceApp::new(Arc::clone(&conferences))));
        *self.app_entry.lock() = Some(entry);
        *self.conferences.lock() = Some(conferences);
        Ok(())
    }

    fn deregister(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        if let Some(entry) = self.app_entry.lock().take() {
            ctx.unregister_app(entry);
        }
        if let Some(conferences) = self.conferences.lock().take() {
            conferences.shutdown();
        }
        Ok(())
    }
}

/// Module entry point for the loader.
pub fn modinfo() -> Box<dyn ModuleImpl> {
    Box::new(ConferenceModule {
        app_entry: Mutex::new(None),
        conferences: Mutex::new(None),
    })
}
