use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use libloading::Library;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use xb_core::Channel;
use xb_registry::EntryId;

use crate::context::ModuleContext;

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("no such module: {0}")]
    NotFound(String),

    #[error("module rejected registration: {0}")]
    Rejected(String),

    #[error("module is in use: {0}")]
    InUse(String),

    #[error("cannot load library: {0}")]
    Library(String),

    #[error("module has no {symbol} symbol: {name}")]
    NoSymbol { name: String, symbol: String },
}

/// Module lifecycle hooks. `register` wires the module's applications,
/// techs, switches and back-ends through the [`ModuleContext`];
/// `deregister` must undo them and may refuse (nonzero use).
pub trait ModuleImpl: Send + Sync {
    fn description(&self) -> &str;

    fn register(&self, ctx: &ModuleContext) -> Result<(), ModuleError>;

    fn deregister(&self, ctx: &ModuleContext) -> Result<(), ModuleError>;

    fn reconfigure(&self, ctx: &ModuleContext) {
        let _ = ctx;
    }

    /// Called when the module object is finally released.
    fn release(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleState {
    Uninitialized = 0,
    Active = 1,
    /// Deregistered; the code stays mapped until the last reference to an
    /// exported object drops.
    UnmapOnIdle = 2,
}

pub struct Module {
    name: String,
    state: AtomicU8,
    /// MUST be declared (and therefore dropped) before `lib`: the trait
    /// object's code lives inside the mapped library.
    info: Box<dyn ModuleImpl>,
    lib: Option<Library>,
    pub(crate) reg_entry: Mutex<Option<EntryId>>,
    local_users: Mutex<Vec<Weak<Channel>>>,
    use_count: AtomicUsize,
}

impl Module {
    pub(crate) fn new(name: String, info: Box<dyn ModuleImpl>, lib: Option<Library>) -> Module {
        Module {
            name,
            state: AtomicU8::new(ModuleState::Uninitialized as u8),
            info,
            lib,
            reg_entry: Mutex::new(None),
            local_users: Mutex::new(Vec::new()),
            use_count: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> String {
        self.info.description().to_owned()
    }

    pub fn is_dynamic(&self) -> bool {
        self.lib.is_some()
    }

    pub fn state(&self) -> ModuleState {
        match self.state.load(Ordering::SeqCst) {
            1 => ModuleState::Active,
            2 => ModuleState::UnmapOnIdle,
            _ => ModuleState::Uninitialized,
        }
    }

    pub(crate) fn set_state(&self, state: ModuleState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn info(&self) -> &dyn ModuleImpl {
        self.info.as_ref()
    }

    // --- local users ------------------------------------------------------

    /// Track a channel currently executing inside this module.
    pub fn add_local_user(&self, chan: &Arc<Channel>) {
        self.use_count.fetch_add(1, Ordering::SeqCst);
        self.local_users.lock().push(Arc::downgrade(chan));
    }

    pub fn remove_local_user(&self, chan: &Arc<Channel>) {
        self.use_count.fetch_sub(1, Ordering::SeqCst);
        let mut users = self.local_users.lock();
        users.retain(|w| match w.upgrade() {
            Some(c) => !Arc::ptr_eq(&c, chan),
            None => false,
        });
    }

    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::SeqCst)
    }

    pub(crate) fn local_users(&self) -> Vec<Arc<Channel>> {
        self.local_users
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if self.state() == ModuleState::UnmapOnIdle {
            // Explicit removal rather than replacement: worth a log line.
            info!(module = %self.name, "Unloaded {} => ({})", self.name, self.info.description());
        }
        self.info.release();
        // `info` drops before `lib` by field order; the Library unmaps last.
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("dynamic", &self.is_dynamic())
            .field("use_count", &self.use_count())
            .finish()
    }
}
