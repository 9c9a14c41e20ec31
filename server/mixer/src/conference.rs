use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use xb_core::{softhangup, Core, ManagerEvent};
use xb_frame::FRAME_MS;

use crate::member::Member;
use crate::{mix, DESTROY_LINGER_SECS};

/// Administrative actions serialised with mixing by the conference's
/// command queue. `issuer` (a channel name) is exempted from actions that
/// target "everyone else".
#[derive(Clone, Debug)]
pub enum ConfCommand {
    MuteAll { mute: bool, issuer: Option<String> },
    EnableSounds { enable: bool },
    QueueSound { sound: String, issuer: Option<String> },
    QueueNumber { number: String, issuer: Option<String> },
    PlayMoh { start: bool },
    /// Kick members; `all` also removes the issuer.
    Hangup { all: bool, issuer: Option<String> },
    SetPin { pin: String },
    Lock { locked: bool },
}

struct ConfState {
    auto_destroy: bool,
    locked: bool,
    pin: Option<String>,
}

pub struct Conference {
    name: String,
    core: Arc<Core>,
    members: Mutex<Vec<Arc<Member>>>,
    state: Mutex<ConfState>,
    cmd_tx: mpsc::UnboundedSender<ConfCommand>,
    stop: CancellationToken,
}

impl Conference {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn set_locked(&self, locked: bool) {
        self.state.lock().locked = locked;
    }

    pub fn pin(&self) -> Option<String> {
        self.state.lock().pin.clone()
    }

    pub fn set_pin(&self, chan_name: &str, pin: &str) {
        self.state.lock().pin = if pin.is_empty() {
            None
        } else {
            Some(pin.to_owned())
        };
        self.core.events.emit(
            ManagerEvent::new("NConference-SetPIN")
                .field("Channel", chan_name)
                .field("Conference", self.name.clone())
                .field("PIN", pin),
        );
    }

    pub fn auto_destroy(&self) -> bool {
        self.state.lock().auto_destroy
    }

    pub fn set_auto_destroy(&self, on: bool) {
        self.state.lock().auto_destroy = on;
    }

    /// Enqueue an admin action; it runs between mixer ticks.
    pub fn command(&self, cmd: ConfCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub(crate) fn add_member(&self, member: Arc<Member>) {
        let chan_name = member.chan().name();
        self.members.lock().push(member);
        self.core.events.emit(
            ManagerEvent::new("NConference-Join")
                .field("Channel", chan_name)
                .field("Conference", self.name.clone())
                .field("Members", self.member_count().to_string()),
        );
    }

    pub(crate) fn remove_member(&self, member: &Arc<Member>) {
        let mut members = self.members.lock();
        members.retain(|m| !Arc::ptr_eq(m, member));
    }

    pub fn members_snapshot(&self) -> Vec<Arc<Member>> {
        self.members.lock().clone()
    }

    /// Play a sound name to every (non-quiet) member. Streams are a file
    /// layer above this crate; the event carries the request.
    pub fn queue_sound(&self, member: Option<&Arc<Member>>, sound: &str) {
        let target = member.map(|m| m.chan().name()).unwrap_or_default();
        self.core.events.emit(
            ManagerEvent::new("NConference-Sound")
                .field("Conference", self.name.clone())
                .field("Channel", target)
                .field("Sound", sound),
        );
    }

    fn run_command(&self, cmd: ConfCommand) {
        debug!(conf = %self.name, ?cmd, "executing conference command");
        match cmd {
            ConfCommand::MuteAll { mute, issuer } => {
                for m in self.members_snapshot() {
                    if issuer.as_deref() == Some(m.chan().name().as_str()) {
                        continue;
                    }
                    m.set_talk_mute(mute);
                    if !m.quiet() && m.sounds_enabled() {
                        self.queue_sound(Some(&m), if mute { "conf-muted" } else { "conf-unmuted" });
                    }
                }
            }
            ConfCommand::EnableSounds { enable } => {
                for m in self.members_snapshot() {
                    m.set_sounds_enabled(enable);
                }
            }
            ConfCommand::QueueSound { sound, issuer } => {
                for m in self.members_snapshot() {
                    if issuer.as_deref() == Some(m.chan().name().as_str()) {
                        continue;
                    }
                    if m.sounds_enabled() && !m.quiet() {
                        self.queue_sound(Some(&m), &sound);
                    }
                }
            }
            ConfCommand::QueueNumber { number, issuer } => {
                for m in self.members_snapshot() {
                    if issuer.as_deref() == Some(m.chan().name().as_str()) {
                        continue;
                    }
                    if m.sounds_enabled() && !m.quiet() {
                        self.queue_sound(Some(&m), &number);
                    }
                }
            }
            ConfCommand::PlayMoh { start } => {
                for m in self.members_snapshot() {
                    m.set_on_hold(start);
                    if start {
                        self.queue_sound(Some(&m), "moh");
                    }
                }
            }
            ConfCommand::Hangup { all, issuer } => {
                for m in self.members_snapshot() {
                    let name = m.chan().name();
                    if !all && issuer.as_deref() == Some(name.as_str()) {
                        continue;
                    }
                    if m.sounds_enabled() && !m.quiet() {
                        self.queue_sound(Some(&m), if all { "conf-kicked" } else { "goodbye" });
                    }
                    m.mark_for_removal();
                    m.chan().softhangup(softhangup::SHUTDOWN);
                    debug!(conf = %self.name, chan = %name, "member kicked");
                }
            }
            ConfCommand::SetPin { pin } => {
                self.state.lock().pin = if pin.is_empty() { None } else { Some(pin) };
            }
            ConfCommand::Lock { locked } => {
                self.set_locked(locked);
            }
        }
    }
}

/// Process-wide conference registry; conferences are created lazily on
/// first join and removed by their own worker when done.
pub struct Conferences {
    core: Arc<Core>,
    map: Mutex<HashMap<String, Arc<Conference>>>,
}

impl Conferences {
    pub fn new(core: &Arc<Core>) -> Arc<Conferences> {
        Arc::new(Conferences {
            core: Arc::clone(core),
            map: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Conference>> {
        self.map.lock().get(name).cloned()
    }

    pub fn count(&self) -> usize {
        self.map.lock().len()
    }

    /// Find `name`, or lazily create it with its first member already
    /// seated (so the new worker never sees a spuriously empty room) and
    /// spawn its mixer task. Returns the conference and whether this call
    /// created it.
    pub fn find_or_create(
        self: &Arc<Self>,
        name: &str,
        first_member: Option<&Arc<Member>>,
    ) -> (Arc<Conference>, bool) {
        let mut map = self.map.lock();
        if let Some(conf) = map.get(name) {
            return (Arc::clone(conf), false);
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let conf = Arc::new(Conference {
            name: name.to_owned(),
            core: Arc::clone(&self.core),
            members: Mutex::new(Vec::new()),
            state: Mutex::new(ConfState {
                auto_destroy: true,
                locked: false,
                pin: None,
            }),
            cmd_tx,
            stop: CancellationToken::new(),
        });
        map.insert(name.to_owned(), Arc::clone(&conf));

        self.core.events.emit(
            ManagerEvent::new("NConference-ConfCreate").field("Conference", name),
        );
        info!(conf = %name, "conference created");

        if let Some(member) = first_member {
            conf.add_member(Arc::clone(member));
        }

        let registry = Arc::clone(self);
        let worker = Arc::clone(&conf);
        tokio::spawn(async move {
            mixer_loop(registry, worker, cmd_rx).await;
        });
        (conf, true)
    }

    fn remove(&self, name: &str) {
        if self.map.lock().remove(name).is_some() {
            self.core.events.emit(
                ManagerEvent::new("NConference-ConfRemove").field("Conference", name),
            );
            info!(conf = %name, "conference removed");
        }
    }

    pub fn shutdown(&self) {
        for conf in self.map.lock().values() {
            conf.stop.cancel();
        }
    }
}

/// Per-conference worker: command drain + mixing every 20 ms, empty-room
/// accounting, removal.
async fn mixer_loop(
    registry: Arc<Conferences>,
    conf: Arc<Conference>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConfCommand>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(FRAME_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut empty_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = conf.stop.cancelled() => break,
            _ = tick.tick() => {}
        }

        while let Ok(cmd) = cmd_rx.try_recv() {
            conf.run_command(cmd);
        }

        // Sweep members flagged for removal.
        let leavers: Vec<Arc<Member>> = conf
            .members_snapshot()
            .into_iter()
            .filter(|m| m.marked_for_removal())
            .collect();
        for m in leavers {
            conf.remove_member(&m);
        }

        let members = conf.members_snapshot();
        if members.is_empty() {
            let now = Instant::now();
            let since = *empty_since.get_or_insert(now);
            if conf.auto_destroy() {
                registry.remove(conf.name());
                break;
            }
            if now.duration_since(since) > Duration::from_secs(DESTROY_LINGER_SECS) {
                conf.set_auto_destroy(true);
            }
            continue;
        }
        empty_since = None;

        mix::tick(&members);
    }
    debug!(conf = %conf.name(), "mixer loop exited");
}
