//! Hints: priority-0 extensions exposing device state to watchers.
//!
//! A hint names one or more devices (`SIP/alice&SIP/bob`); its state is the
//! aggregate of their device states. Watchers are invoked only when the
//! aggregate changes, and survive dialplan reloads via the engine's resync.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use xb_core::{Core, DeviceState};
use xb_strings::DynStr;

/// Aggregate extension state. Bit-combinable (`INUSE | RINGING`), with two
/// negative sentinels for watcher teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtState(pub i32);

impl ExtState {
    pub const REMOVED: ExtState = ExtState(-2);
    pub const DEACTIVATED: ExtState = ExtState(-1);
    pub const NOT_INUSE: ExtState = ExtState(0);
    pub const INUSE: ExtState = ExtState(1);
    pub const BUSY: ExtState = ExtState(2);
    pub const UNAVAILABLE: ExtState = ExtState(4);
    pub const RINGING: ExtState = ExtState(8);

    pub fn contains(self, other: ExtState) -> bool {
        self.0 >= 0 && other.0 >= 0 && self.0 & other.0 == other.0
    }

    pub fn as_str(self) -> &'static str {
        match self.0 {
            -2 => "Removed",
            -1 => "Deactivated",
            0 => "Idle",
            1 => "InUse",
            2 => "Busy",
            4 => "Unavailable",
            8 => "Ringing",
            9 => "InUse&Ringing",
            _ => "Unknown",
        }
    }
}

impl std::ops::BitOr for ExtState {
    type Output = ExtState;
    fn bitor(self, rhs: ExtState) -> ExtState {
        ExtState(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

type WatcherFn = Arc<dyn Fn(&str, &str, ExtState) + Send + Sync>;

struct Hint {
    context: String,
    exten: String,
    devices: String,
    laststate: ExtState,
    watchers: Vec<(WatcherId, WatcherFn)>,
}

pub(crate) struct HintTable {
    inner: Mutex<Vec<Hint>>,
    next_id: AtomicU64,
}

impl HintTable {
    pub fn new() -> HintTable {
        HintTable {
            inner: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Replace the hint set with `entries` (context, exten, devices),
    /// carrying watchers over by (context, exten). Watchers whose hint
    /// vanished are notified `REMOVED` and dropped.
    pub fn sync(&self, core: &Arc<Core>, entries: Vec<(String, String, String)>) {
        let mut orphans: Vec<(String, String, Vec<(WatcherId, WatcherFn)>)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut old: Vec<Hint> = std::mem::take(&mut *inner);
            for (context, exten, devices) in entries {
                let carried = old
                    .iter_mut()
                    .find(|h| h.context == context && h.exten == exten);
                let (watchers, laststate) = match carried {
                    Some(h) => (std::mem::take(&mut h.watchers), h.laststate),
                    None => (Vec::new(), aggregate(core, &devices)),
                };
                inner.push(Hint {
                    context,
                    exten,
                    devices,
                    laststate,
                    watchers,
                });
            }
            for h in old {
                if !h.watchers.is_empty() {
                    orphans.push((h.context, h.exten, h.watchers));
                }
            }
        }
        for (context, exten, watchers) in orphans {
            for (_, cb) in watchers {
                cb(&context, &exten, ExtState::REMOVED);
            }
        }
    }

    /// Watch a hint. Returns None when no such hint exists.
    pub fn add_watcher(
        &self,
        context: &str,
        exten: &str,
        cb: impl Fn(&str, &str, ExtState) + Send + Sync + 'static,
    ) -> Option<WatcherId> {
        let mut inner = self.inner.lock();
        let hint = inner
            .iter_mut()
            .find(|h| h.context == context && h.exten == exten)?;
        let id = WatcherId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let cb: WatcherFn = Arc::new(cb);
        hint.watchers.push((id, cb));
        Some(id)
    }

    pub fn del_watcher(&self, id: WatcherId) -> bool {
        let mut inner = self.inner.lock();
        for hint in inner.iter_mut() {
            let before = hint.watchers.len();
            hint.watchers.retain(|(wid, _)| *wid != id);
            if hint.watchers.len() != before {
                return true;
            }
        }
        false
    }

    /// Devices string of the hint covering (context, exten).
    pub fn get_hint(&self, context: &str, exten: &str) -> Option<String> {
        self.inner
            .lock()
            .iter()
            .find(|h| h.context == context && h.exten == exten)
            .map(|h| h.devices.clone())
    }

    /// Current aggregate state of a hint.
    pub fn extension_state(&self, core: &Arc<Core>, context: &str, exten: &str) -> Option<ExtState> {
        let devices = self.get_hint(context, exten)?;
        Some(aggregate(core, &devices))
    }

    /// Re-evaluate every hint naming `device`; fire watchers on change.
    pub fn device_changed(&self, core: &Arc<Core>, device: &str) {
        let mut fired: Vec<(String, String, ExtState, Vec<WatcherFn>)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            for hint in inner.iter_mut() {
                if !hint.devices.split('&').any(|d| d.trim() == device) {
                    continue;
                }
                let state = aggregate(core, &hint.devices);
                if state != hint.laststate {
                    hint.laststate = state;
                    fired.push((
                        hint.context.clone(),
                        hint.exten.clone(),
                        state,
                        hint.watchers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                    ));
                }
            }
        }
        for (context, exten, state, watchers) in fired {
            debug!(context = %context, exten = %exten, state = %state.as_str(), "hint changed");
            for cb in watchers {
                cb(&context, &exten, state);
            }
        }
    }

    /// `show hints` rendering.
    pub fn render(&self, core: &Arc<Core>, out: &mut DynStr) {
        let inner = self.inner.lock();
        let _ = writeln!(out, "    -= Registered Hints =-");
        for hint in inner.iter() {
            let state = aggregate(core, &hint.devices);
            let _ = writeln!(
                out,
                "   {}@{:<20}: {:<20} State:{:<15} Watchers {}",
                hint.exten,
                hint.context,
                hint.devices,
                state.as_str(),
                hint.watchers.len()
            );
        }
        let _ = writeln!(out, "----------------");
        let _ = writeln!(out, "- {} hints registered", inner.len());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Fold the device states of an ampersand-separated device list into one
/// extension state.
fn aggregate(core: &Arc<Core>, devices: &str) -> ExtState {
    let mut all_unavailable = true;
    let mut all_busy = true;
    let mut all_free = true;
    let mut busy = false;
    let mut inuse = false;
    let mut ring = false;

    for device in devices.split('&').map(str::trim).filter(|d| !d.is_empty()) {
        match core.device_state(device) {
            DeviceState::NotInUse => {
                all_unavailable = false;
                all_busy = false;
            }
            DeviceState::InUse => {
                inuse = true;
                all_unavailable = false;
                all_free = false;
            }
            DeviceState::Ringing => {
                ring = true;
                all_unavailable = false;
                all_free = false;
            }
            DeviceState::Busy => {
                busy = true;
                all_unavailable = false;
                all_free = false;
            }
            DeviceState::Unavailable | DeviceState::Invalid => {
                all_busy = false;
                all_free = false;
            }
            DeviceState::Unknown => {
                all_unavailable = false;
                all_busy = false;
                all_free = false;
            }
        }
    }

    if !inuse && ring {
        ExtState::RINGING
    } else if inuse && ring {
        ExtState::INUSE | ExtState::RINGING
    } else if inuse {
        ExtState::INUSE
    } else if all_free {
        ExtState::NOT_INUSE
    } else if all_busy {
        ExtState::BUSY
    } else if all_unavailable {
        ExtState::UNAVAILABLE
    } else if busy {
        ExtState::INUSE
    } else {
        ExtState::NOT_INUSE
    }
}
