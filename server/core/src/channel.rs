//! The channel: one endpoint of a call.
//!
//! Identity fields live under one mutex (the "channel lock"); soft-hangup
//! reasons are atomic bits any thread may set and only the owning
//! interpreter clears. Inbound frames arrive on a bounded queue fed by the
//! transport driver; `read` layers masquerade handling and format
//! translation on top of it.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use xb_cdr::{CallSnapshot, Cdr};
use xb_frame::{AudioFormat, ControlOp, Frame, FrameKind, FormatMask};

use crate::error::{CoreError, CoreResult};
use crate::generator::{Generator, GeneratorSlot};
use crate::sched::SchedId;
use crate::state::Core;
use crate::tech::ChannelTech;

/// Soft-hangup reason bits.
pub mod softhangup {
    /// The device layer is gone.
    pub const DEV: u32 = 1 << 0;
    /// An asynchronous goto repositioned the interpreter.
    pub const ASYNCGOTO: u32 = 1 << 1;
    pub const SHUTDOWN: u32 = 1 << 2;
    /// The absolute timeout (`whentohangup`) fired.
    pub const TIMEOUT: u32 = 1 << 3;
    /// A module owning this channel is being unloaded.
    pub const APPUNLOAD: u32 = 1 << 4;
    pub const EXPLICIT: u32 = 1 << 5;

    pub const ALL: u32 = DEV | ASYNCGOTO | SHUTDOWN | TIMEOUT | APPUNLOAD | EXPLICIT;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Down,
    Reserved,
    OffHook,
    Dialing,
    Ring,
    Ringing,
    Up,
    Busy,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Down => "Down",
            ChannelState::Reserved => "Rsrvd",
            ChannelState::OffHook => "OffHook",
            ChannelState::Dialing => "Dialing",
            ChannelState::Ring => "Ring",
            ChannelState::Ringing => "Ringing",
            ChannelState::Up => "Up",
            ChannelState::Busy => "Busy",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CallerId {
    pub num: Option<String>,
    pub name: Option<String>,
    pub ani: Option<String>,
    pub dnid: Option<String>,
    pub rdnis: Option<String>,
    pub pres: i32,
    pub ani2: i32,
    pub ton: i32,
    pub tns: i32,
}

/// Identity fields guarded by the channel lock.
#[derive(Clone, Debug)]
pub struct ChanState {
    pub name: String,
    pub state: ChannelState,
    pub cid: CallerId,
    pub context: String,
    pub exten: String,
    pub priority: i32,
    pub language: String,
    pub accountcode: String,
    pub amaflags: Option<xb_cdr::AmaFlags>,
    pub hangupcause: i32,
    pub read_format: AudioFormat,
    pub write_format: AudioFormat,
    pub raw_read_format: AudioFormat,
    pub raw_write_format: AudioFormat,
    pub native_formats: FormatMask,
}

/// Queue depth for inbound frames; over-queueing drops with a warning.
const FRAME_QUEUE: usize = 256;

pub struct Channel {
    core: Arc<Core>,
    uniqueid: String,
    lock: Mutex<ChanState>,
    softhangup_flags: AtomicU32,
    hangup_done: AtomicBool,
    /// Set while an interpreter auto-increments priorities; goto targets
    /// compensate by one.
    autoloop: AtomicBool,
    /// Set while a dialplan interpreter owns this channel.
    pbx_active: AtomicBool,
    frame_tx: mpsc::Sender<Frame>,
    reader: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    tech: RwLock<Arc<dyn ChannelTech>>,
    tech_pvt: Mutex<Option<Box<dyn Any + Send>>>,
    vars: xb_registry::Registry<str>,
    cdr: Mutex<Option<Arc<Cdr>>>,
    generator: Mutex<Option<GeneratorSlot>>,
    masq: Mutex<Option<Arc<Channel>>>,
    whentohangup: Mutex<Option<SchedId>>,
    /// Wakes a blocked reader on soft-hangup or queued masquerade.
    poke: Notify,
}

impl Channel {
    /// Allocate and register a channel. `name` is the full channel name
    /// (`Tech/resource-seq`); the tech keeps its private state in
    /// [`Channel::set_tech_pvt`].
    pub fn alloc(
        core: &Arc<Core>,
        tech: Arc<dyn ChannelTech>,
        name: String,
        native_formats: FormatMask,
    ) -> CoreResult<Arc<Channel>> {
        core.call_started()?;

        let fmt = native_formats.first().unwrap_or(AudioFormat::Slin);
        let uniqueid = format!(
            "{}-{}",
            core.options.system_name,
            uuid::Uuid::new_v4().simple()
        );
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);

        let chan = Arc::new(Channel {
            core: Arc::clone(core),
            uniqueid,
            lock: Mutex::new(ChanState {
                name,
                state: ChannelState::Down,
                cid: CallerId::default(),
                context: core.options.default_context.clone(),
                exten: "s".to_owned(),
                priority: 1,
                language: "en".to_owned(),
                accountcode: String::new(),
                amaflags: None,
                hangupcause: 0,
                read_format: fmt,
                write_format: fmt,
                raw_read_format: fmt,
                raw_write_format: fmt,
                native_formats,
            }),
            softhangup_flags: AtomicU32::new(0),
            hangup_done: AtomicBool::new(false),
            autoloop: AtomicBool::new(false),
            pbx_active: AtomicBool::new(false),
            frame_tx,
            reader: tokio::sync::Mutex::new(frame_rx),
            tech: RwLock::new(tech),
            tech_pvt: Mutex::new(None),
            vars: xb_registry::Registry::new("channel-vars"),
            cdr: Mutex::new(None),
            generator: Mutex::new(None),
            masq: Mutex::new(None),
            whentohangup: Mutex::new(None),
            poke: Notify::new(),
        });
        core.insert_channel(Arc::clone(&chan));
        debug!(chan = %chan.name(), uniqueid = %chan.uniqueid, "channel allocated");
        Ok(chan)
    }

    // --- identity ---------------------------------------------------------

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn uniqueid(&self) -> &str {
        &self.uniqueid
    }

    pub fn name(&self) -> String {
        self.lock.lock().name.clone()
    }

    pub fn tech(&self) -> Arc<dyn ChannelTech> {
        Arc::clone(&self.tech.read())
    }

    pub fn set_tech_pvt(&self, pvt: Option<Box<dyn Any + Send>>) {
        *self.tech_pvt.lock() = pvt;
    }

    /// Run `f` over the driver's private state.
    pub fn with_tech_pvt<R>(&self, f: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R) -> R {
        let mut guard = self.tech_pvt.lock();
        f(guard.as_deref_mut())
    }

    /// Snapshot of the locked identity fields.
    pub fn snapshot(&self) -> ChanState {
        self.lock.lock().clone()
    }

    /// Run `f` under the channel lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ChanState) -> R) -> R {
        f(&mut self.lock.lock())
    }

    pub fn state(&self) -> ChannelState {
        self.lock.lock().state
    }

    /// Set the channel state and kick a device-state re-evaluation.
    pub fn set_state(&self, state: ChannelState) {
        let device = {
            let mut guard = self.lock.lock();
            if guard.state == state {
                return;
            }
            guard.state = state;
            device_of(&guard.name)
        };
        self.core.notify_device_state(&device);
    }

    pub fn context(&self) -> String {
        self.lock.lock().context.clone()
    }

    pub fn exten(&self) -> String {
        self.lock.lock().exten.clone()
    }

    pub fn priority(&self) -> i32 {
        self.lock.lock().priority
    }

    /// Reposition the dialplan cursor (explicit goto).
    pub fn set_position(&self, context: Option<&str>, exten: Option<&str>, priority: Option<i32>) {
        let mut guard = self.lock.lock();
        if let Some(c) = context {
            guard.context = c.to_owned();
        }
        if let Some(e) = exten {
            guard.exten = e.to_owned();
        }
        if let Some(p) = priority {
            guard.priority = p;
        }
    }

    pub fn caller_id(&self) -> CallerId {
        self.lock.lock().cid.clone()
    }

    pub fn set_caller_id(&self, cid: CallerId) {
        self.lock.lock().cid = cid;
        if let Some(cdr) = self.cdr() {
            cdr.set_cid(&self.call_snapshot());
        }
    }

    pub fn set_autoloop(&self, on: bool) -> bool {
        self.autoloop.swap(on, Ordering::SeqCst)
    }

    pub fn in_autoloop(&self) -> bool {
        self.autoloop.load(Ordering::SeqCst)
    }

    pub fn set_pbx_active(&self, on: bool) {
        self.pbx_active.store(on, Ordering::SeqCst);
    }

    pub fn pbx_active(&self) -> bool {
        self.pbx_active.load(Ordering::SeqCst)
    }

    pub fn hangupcause(&self) -> i32 {
        self.lock.lock().hangupcause
    }

    pub fn set_hangupcause(&self, cause: i32) {
        self.lock.lock().hangupcause = cause;
    }

    // --- variables --------------------------------------------------------

    pub fn set_var(&self, name: &str, value: Option<&str>) {
        self.vars.replace(name, value.map(Arc::from));
    }

    pub fn get_var(&self, name: &str) -> Option<Arc<str>> {
        self.vars.find(name)
    }

    pub fn vars(&self) -> &xb_registry::Registry<str> {
        &self.vars
    }

    // --- CDR --------------------------------------------------------------

    pub fn cdr(&self) -> Option<Arc<Cdr>> {
        self.cdr.lock().clone()
    }

    pub fn set_cdr(&self, cdr: Option<Arc<Cdr>>) {
        *self.cdr.lock() = cdr;
    }

    /// Channel fields the CDR layer mirrors.
    pub fn call_snapshot(&self) -> CallSnapshot {
        let guard = self.lock.lock();
        CallSnapshot {
            channel: guard.name.clone(),
            uniqueid: self.uniqueid.clone(),
            cid_num: guard.cid.num.clone(),
            cid_name: guard.cid.name.clone(),
            cid_ani: guard.cid.ani.clone(),
            context: guard.context.clone(),
            exten: guard.exten.clone(),
            accountcode: guard.accountcode.clone(),
            amaflags: guard.amaflags,
            answered: guard.state == ChannelState::Up,
        }
    }

    /// Create and attach a CDR if the channel has none yet.
    pub fn ensure_cdr(&self) -> Arc<Cdr> {
        let mut guard = self.cdr.lock();
        match &*guard {
            Some(cdr) => Arc::clone(cdr),
            None => {
                let cdr = Cdr::from_snapshot(&self.call_snapshot());
                *guard = Some(Arc::clone(&cdr));
                cdr
            }
        }
    }

    // --- soft hangup ------------------------------------------------------

    pub fn softhangup(&self, bits: u32) {
        self.softhangup_flags.fetch_or(bits, Ordering::SeqCst);
        self.poke.notify_one();
    }

    pub fn clear_softhangup(&self, bits: u32) {
        self.softhangup_flags.fetch_and(!bits, Ordering::SeqCst);
    }

    pub fn softhangup_bits(&self) -> u32 {
        self.softhangup_flags.load(Ordering::SeqCst)
    }

    pub fn is_softhangup(&self) -> bool {
        self.softhangup_bits() != 0
    }

    /// Whether the channel should unwind: a soft-hangup bit is set or the
    /// hard hangup already ran.
    pub fn check_hangup(&self) -> bool {
        self.is_softhangup() || self.hangup_done.load(Ordering::SeqCst)
    }

    // --- frame pipeline ---------------------------------------------------

    /// Driver-side: push an inbound frame. A full queue drops the frame.
    pub fn queue_frame(&self, frame: Frame) {
        if let Err(e) = self.frame_tx.try_send(frame) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(chan = %self.name(), "frame queue full, dropping");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    /// Driver-side: the remote end hung up.
    pub fn queue_hangup(&self) {
        self.softhangup(softhangup::DEV);
        self.queue_frame(Frame::hangup("core"));
    }

    /// Read one frame. Returns a Hangup frame once the channel is dead;
    /// pending masquerades are executed here, at a safe point on the owning
    /// task.
    pub async fn read(self: &Arc<Self>) -> CoreResult<Frame> {
        loop {
            let pending = self.masq.lock().take();
            if let Some(clone) = pending {
                self.do_masquerade(clone).await?;
            }
            if self.check_hangup() {
                return Ok(Frame::hangup("core"));
            }

            let mut rx = self.reader.lock().await;
            tokio::select! {
                frame = rx.recv() => {
                    drop(rx);
                    let Some(frame) = frame else {
                        return Ok(Frame::hangup("core"));
                    };
                    if frame.is_hangup() {
                        return Ok(frame);
                    }
                    let read_format = self.lock.lock().read_format;
                    if let FrameKind::Voice { format, .. } = &frame.kind {
                        if *format != read_format {
                            return Ok(self
                                .core
                                .translators
                                .translate_or_pass(frame, read_format));
                        }
                    }
                    return Ok(frame);
                }
                _ = self.poke.notified() => {
                    // Re-check hangup/masquerade.
                }
            }
        }
    }

    /// Write one frame toward the driver, translating voice into the
    /// channel's raw write format first.
    pub async fn write(self: &Arc<Self>, frame: Frame) -> CoreResult<()> {
        if self.hangup_done.load(Ordering::SeqCst) {
            return Err(CoreError::Hangup);
        }
        let tech = self.tech();
        match &frame.kind {
            FrameKind::Voice { format, .. } => {
                let raw = self.lock.lock().raw_write_format;
                let out = if *format != raw {
                    self.core.translators.translate(&frame, raw)?
                } else {
                    frame
                };
                tech.write(self, &out).await
            }
            FrameKind::Dtmf(d) => tech.send_digit(self, *d).await,
            FrameKind::Control(op) => tech.indicate(self, *op).await,
            FrameKind::Null => Ok(()),
            FrameKind::Image { .. } => tech.write(self, &frame).await,
            FrameKind::Hangup => Err(CoreError::Hangup),
        }
    }

    // --- call control -----------------------------------------------------

    /// Start outbound signalling.
    pub async fn call(self: &Arc<Self>, dest: &str, timeout_ms: u64) -> CoreResult<()> {
        self.set_state(ChannelState::Dialing);
        self.tech().call(self, dest, timeout_ms).await
    }

    pub async fn answer(self: &Arc<Self>) -> CoreResult<()> {
        if self.check_hangup() {
            return Err(CoreError::Hangup);
        }
        match self.state() {
            ChannelState::Up => Ok(()),
            _ => {
                self.tech().answer(self).await?;
                self.set_state(ChannelState::Up);
                if let Some(cdr) = self.cdr() {
                    cdr.answer();
                }
                Ok(())
            }
        }
    }

    /// Emit a call-progress indication toward the caller.
    pub async fn indicate(self: &Arc<Self>, condition: ControlOp) -> CoreResult<()> {
        match self.tech().indicate(self, condition).await {
            Err(CoreError::NotSupported(_)) => {
                debug!(chan = %self.name(), ?condition, "tech cannot indicate, ignoring");
                Ok(())
            }
            other => other,
        }
    }

    /// Tear the channel down: driver hangup, CDR finalisation and engine
    /// detach, deregistration. Idempotent.
    pub async fn hangup(self: &Arc<Self>) -> CoreResult<()> {
        if self.hangup_done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.generator.lock() = None;
        if let Some(id) = self.whentohangup.lock().take() {
            self.core.sched.cancel(id);
        }

        let res = self.tech().hangup(self).await;
        self.set_state(ChannelState::Down);
        self.poke.notify_one();

        if let Some(cdr) = self.cdr.lock().take() {
            if !cdr.is_posted() {
                cdr.end();
                self.core.cdr.detach(cdr);
            }
        }
        let name = self.name();
        self.core.remove_channel(&self.uniqueid);
        self.core.call_ended();
        self.core.notify_device_state(&device_of(&name));
        info!(chan = %name, "hung up");
        res
    }

    /// Wait up to `timeout_ms` for a DTMF digit. `Ok(None)` is a timeout;
    /// hangup surfaces as an error so interpreter loops unwind.
    pub async fn waitfor_digit(self: &Arc<Self>, timeout_ms: u64) -> CoreResult<Option<char>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let frame = tokio::select! {
                f = self.read() => f?,
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            };
            match frame.kind {
                FrameKind::Dtmf(d) => return Ok(Some(d)),
                FrameKind::Hangup | FrameKind::Control(ControlOp::Hangup) => {
                    return Err(CoreError::Hangup)
                }
                _ => {}
            }
        }
    }

    /// Sleep while keeping the frame pump serviced.
    pub async fn safe_sleep(self: &Arc<Self>, ms: u64) -> CoreResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
        loop {
            let frame = tokio::select! {
                f = self.read() => f?,
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
            };
            if frame.is_hangup() {
                return Err(CoreError::Hangup);
            }
        }
    }

    // --- format negotiation ----------------------------------------------

    /// Ask for frames from `read` in `format`; fails when no translator
    /// path reaches it from the channel's raw read format.
    pub fn set_read_format(&self, format: AudioFormat) -> CoreResult<()> {
        let raw = self.lock.lock().raw_read_format;
        if self.core.translators.find_path(raw, format).is_none() {
            return Err(CoreError::FormatUnsupported {
                from: raw,
                to: format,
            });
        }
        self.lock.lock().read_format = format;
        Ok(())
    }

    /// Accept frames into `write` in `format`.
    pub fn set_write_format(&self, format: AudioFormat) -> CoreResult<()> {
        let raw = self.lock.lock().raw_write_format;
        if self.core.translators.find_path(format, raw).is_none() {
            return Err(CoreError::FormatUnsupported {
                from: format,
                to: raw,
            });
        }
        self.lock.lock().write_format = format;
        Ok(())
    }

    // --- timeout ----------------------------------------------------------

    /// Arrange a soft-hangup TIMEOUT `secs` from now; 0 cancels.
    pub fn set_whentohangup(self: &Arc<Self>, secs: u64) {
        let mut slot = self.whentohangup.lock();
        if let Some(id) = slot.take() {
            self.core.sched.cancel(id);
        }
        if secs == 0 {
            return;
        }
        let weak = Arc::downgrade(self);
        let id = self.core.sched.run_after(secs * 1000, move || {
            if let Some(chan) = weak.upgrade() {
                chan.softhangup(softhangup::TIMEOUT);
            }
        });
        *slot = Some(id);
    }

    // --- generator --------------------------------------------------------

    pub fn activate_generator(self: &Arc<Self>, gen: Arc<dyn Generator>) {
        let slot = GeneratorSlot::spawn(Arc::clone(self), gen);
        *self.generator.lock() = Some(slot);
    }

    pub fn deactivate_generator(&self) {
        *self.generator.lock() = None;
    }

    pub fn generator_active(&self) -> bool {
        self.generator.lock().is_some()
    }

    // --- masquerade -------------------------------------------------------

    /// Queue an identity swap: `clone`'s tech and identity will move into
    /// this channel at its next safe point; `clone` becomes a zombie
    /// scheduled for hangup.
    pub fn masquerade(self: &Arc<Self>, clone: Arc<Channel>) {
        *self.masq.lock() = Some(clone);
        self.poke.notify_one();
    }

    async fn do_masquerade(self: &Arc<Self>, clone: Arc<Channel>) -> CoreResult<()> {
        debug!(original = %self.name(), clone = %clone.name(), "masquerading");

        // Swap tech vtables and private state.
        {
            let mut a = self.tech.write();
            let mut b = clone.tech.write();
            std::mem::swap(&mut *a, &mut *b);
        }
        {
            let mut a = self.tech_pvt.lock();
            let mut b = clone.tech_pvt.lock();
            std::mem::swap(&mut *a, &mut *b);
        }

        // Swap identity: the original carries the clone's call; the clone
        // keeps the original's dead identity under a zombie name.
        {
            // Lock order by address keeps concurrent masquerades deadlock
            // free.
            let (first, second) = lock_pair(self, &clone);
            let mut a = first.lock.lock();
            let mut b = second.lock.lock();
            let (orig, zombie) = if std::ptr::eq(first, self.as_ref()) {
                (&mut *a, &mut *b)
            } else {
                (&mut *b, &mut *a)
            };
            std::mem::swap(&mut orig.name, &mut zombie.name);
            std::mem::swap(&mut orig.cid, &mut zombie.cid);
            std::mem::swap(&mut orig.native_formats, &mut zombie.native_formats);
            std::mem::swap(&mut orig.raw_read_format, &mut zombie.raw_read_format);
            std::mem::swap(&mut orig.raw_write_format, &mut zombie.raw_write_format);
            orig.state = zombie.state;
            zombie.name.push_str("<ZOMBIE>");
        }

        // Let the surviving driver repoint at its new owner.
        self.tech().fixup(&clone, self).await?;

        clone.softhangup(softhangup::DEV);
        Ok(())
    }
}

fn lock_pair<'a>(a: &'a Arc<Channel>, b: &'a Arc<Channel>) -> (&'a Channel, &'a Channel) {
    let pa = Arc::as_ptr(a) as usize;
    let pb = Arc::as_ptr(b) as usize;
    if pa <= pb {
        (a.as_ref(), b.as_ref())
    } else {
        (b.as_ref(), a.as_ref())
    }
}

/// Channel name without the allocation sequence suffix: the device name.
pub(crate) fn device_of(name: &str) -> String {
    name.rsplit_once('-')
        .map(|(base, _)| base.to_owned())
        .unwrap_or_else(|| name.to_owned())
}
