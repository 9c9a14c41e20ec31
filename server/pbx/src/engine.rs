//! The dialplan engine: context table, lookup walker, executor.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use xb_core::{AppReturn, Channel, Core, ManagerEvent};
use xb_registry::Registry;
use xb_strings::{split_args, DynStr};

use crate::context::{Context, ContextSet, PriorityEntry};
use crate::error::LookupStatus;
use crate::hints::HintTable;
use crate::pattern::{match_cid, pattern_match, MatchResult};
use crate::subst::substitute;
use crate::{funcs, MAX_INCLUDE_DEPTH};

/// Alternate resolver consulted when a context's own extensions miss.
#[async_trait]
pub trait Switch: Send + Sync {
    fn name(&self) -> &str;

    fn exists(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
        data: &str,
    ) -> bool;

    fn canmatch(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
        data: &str,
    ) -> bool;

    fn matchmore(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
        data: &str,
    ) -> bool;

    async fn exec(
        &self,
        chan: &Arc<Channel>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
        data: &str,
    ) -> AppReturn;
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// When a run ends with nothing more to match, indicate busy/congestion
    /// instead of waiting for digits.
    pub autofallthrough: bool,
    /// Post-congestion lingering before hangup.
    pub congestion_sleep_ms: u64,
    /// First-digit wait.
    pub response_timeout_secs: u64,
    /// Inter-digit wait.
    pub digit_timeout_secs: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            autofallthrough: true,
            congestion_sleep_ms: 10_000,
            response_timeout_secs: 10,
            digit_timeout_secs: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Exists,
    Exec,
    CanMatch,
    MatchMore,
    FindLabel,
}

/// Outcome of the dialplan walker. The found context is not reported for
/// priorities: execution repositions the channel at the *requested* context
/// even when an include supplied the match.
pub(crate) enum Found {
    Priority {
        entry: PriorityEntry,
    },
    Switch {
        switch: Arc<dyn Switch>,
        data: String,
        context: String,
    },
    None,
}

pub struct DialplanEngine {
    core: Arc<Core>,
    contexts: RwLock<Vec<Arc<Context>>>,
    pub globals: Registry<str>,
    pub switches: Registry<dyn Switch>,
    pub funcs: Registry<dyn crate::funcs::DialplanFunction>,
    pub(crate) hints: HintTable,
    autofallthrough: AtomicBool,
    pub congestion_sleep_ms: AtomicU64,
    pub response_timeout_secs: AtomicU64,
    pub digit_timeout_secs: AtomicU64,
}

impl DialplanEngine {
    pub fn new(core: &Arc<Core>, options: EngineOptions) -> Arc<DialplanEngine> {
        let engine = Arc::new(DialplanEngine {
            core: Arc::clone(core),
            contexts: RwLock::new(Vec::new()),
            globals: Registry::new("global-vars"),
            switches: Registry::new("switches"),
            funcs: Registry::new("dialplan-functions"),
            hints: HintTable::new(),
            autofallthrough: AtomicBool::new(options.autofallthrough),
            congestion_sleep_ms: AtomicU64::new(options.congestion_sleep_ms),
            response_timeout_secs: AtomicU64::new(options.response_timeout_secs),
            digit_timeout_secs: AtomicU64::new(options.digit_timeout_secs),
        });

        crate::builtins::register(core, &engine);
        funcs::register_builtins(&engine);
        spawn_hint_watcher(core, &engine);
        engine
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn set_autofallthrough(&self, on: bool) -> bool {
        self.autofallthrough.swap(on, Ordering::SeqCst)
    }

    pub fn autofallthrough(&self) -> bool {
        self.autofallthrough.load(Ordering::SeqCst)
    }

    // --- globals ----------------------------------------------------------

    pub fn set_global(&self, name: &str, value: Option<&str>) {
        self.globals.replace(name, value.map(Arc::from));
    }

    pub fn get_global(&self, name: &str) -> Option<Arc<str>> {
        self.globals.find(name)
    }

    // --- context table ----------------------------------------------------

    pub fn context_find(&self, name: &str) -> Option<Arc<Context>> {
        let hash = xb_registry::hash_str(name);
        self.contexts
            .read()
            .iter()
            .find(|c| c.hash() == hash && c.name() == name)
            .map(Arc::clone)
    }

    pub fn contexts_snapshot(&self) -> Vec<Arc<Context>> {
        self.contexts.read().clone()
    }

    /// Atomically replace every context owned by `registrar` with the
    /// freshly built `set`, preserving hint watchers across the swap.
    pub fn merge_contexts_and_delete(&self, set: ContextSet, registrar: &str) {
        {
            let mut contexts = self.contexts.write();
            contexts.retain(|c| c.registrar() != registrar);
            let mut merged = set.contexts;
            merged.extend(contexts.drain(..));
            *contexts = merged;
        }
        self.resync_hints();
        info!(registrar, "dialplan merged");
    }

    /// Remove one context by name.
    pub fn context_destroy(&self, name: &str) -> bool {
        let removed = {
            let mut contexts = self.contexts.write();
            let before = contexts.len();
            contexts.retain(|c| c.name() != name);
            contexts.len() != before
        };
        if removed {
            self.resync_hints();
        }
        removed
    }

    /// Rebuild the hint table from the live contexts (watchers preserved by
    /// (context, exten); watchers of vanished hints are told `Removed`).
    pub(crate) fn resync_hints(&self) {
        let mut entries = Vec::new();
        for ctx in self.contexts.read().iter() {
            for (exten, devices) in ctx.hint_entries() {
                entries.push((ctx.name().to_owned(), exten, devices));
            }
        }
        self.hints.sync(&self.core, entries);
    }

    // --- lookup -----------------------------------------------------------

    pub(crate) fn find(
        &self,
        chan: Option<&Arc<Channel>>,
        bypass: Option<&Arc<Context>>,
        context: &str,
        exten: &str,
        priority: i32,
        label: Option<&str>,
        callerid: Option<&str>,
        action: Action,
    ) -> (Found, LookupStatus) {
        let mut stack: Vec<String> = Vec::new();
        let mut status = LookupStatus::NoContext;
        let found = self.find_rec(
            chan, bypass, context, exten, priority, label, callerid, action, &mut stack,
            &mut status,
        );
        (found, status)
    }

    #[allow(clippy::too_many_arguments)]
    fn find_rec(
        &self,
        chan: Option<&Arc<Channel>>,
        bypass: Option<&Arc<Context>>,
        context: &str,
        exten: &str,
        priority: i32,
        label: Option<&str>,
        callerid: Option<&str>,
        action: Action,
        stack: &mut Vec<String>,
        status: &mut LookupStatus,
    ) -> Found {
        if stack.len() >= MAX_INCLUDE_DEPTH {
            warn!("maximum include stack exceeded");
            return Found::None;
        }
        if stack.iter().any(|c| c.eq_ignore_ascii_case(context)) {
            return Found::None;
        }

        let ctx = match bypass {
            Some(c) => Arc::clone(c),
            None => match self.context_find(context) {
                Some(c) => c,
                None => return Found::None,
            },
        };
        if *status < LookupStatus::NoExtension {
            *status = LookupStatus::NoExtension;
        }

        // Rank candidate extension groups under the context lock, then
        // resolve priorities from a snapshot outside it.
        let mut candidates: Vec<(MatchResult, crate::context::ExtenEntry)> = Vec::new();
        let mut earlymatch = false;
        {
            let inner = ctx.inner.lock();
            for group in &inner.extens {
                let m = pattern_match(exten, &group.exten);
                if group.matchcid && !match_cid(&group.cidmatch, callerid) {
                    continue;
                }
                let acceptable = match action {
                    Action::Exists | Action::Exec | Action::FindLabel => matches!(
                        m,
                        MatchResult::Possible | MatchResult::Exact | MatchResult::Stretchable
                    ),
                    Action::CanMatch => matches!(
                        m,
                        MatchResult::Possible
                            | MatchResult::Exact
                            | MatchResult::Stretchable
                            | MatchResult::Incomplete
                    ),
                    Action::MatchMore => {
                        if m == MatchResult::Possible && !earlymatch {
                            // A '!' wildcard matched: break the caller out of
                            // its digit-collection loop; the extension will
                            // then match normally.
                            earlymatch = true;
                            continue;
                        }
                        matches!(m, MatchResult::Stretchable | MatchResult::Incomplete)
                    }
                };
                if acceptable {
                    candidates.push((m, group.clone()));
                }
            }
        }

        if !candidates.is_empty() {
            if *status < LookupStatus::NoPriority {
                *status = LookupStatus::NoPriority;
            }
            // Strongest match first; insertion order breaks ties.
            candidates.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, group) in &candidates {
                if action == Action::FindLabel {
                    if *status < LookupStatus::NoLabel {
                        *status = LookupStatus::NoLabel;
                    }
                    if let Some(label) = label {
                        if let Some(p) = group
                            .priorities
                            .iter()
                            .find(|p| p.label.as_deref() == Some(label))
                        {
                            *status = LookupStatus::Success;
                            return Found::Priority { entry: p.clone() };
                        }
                    }
                } else if let Some(p) =
                    group.priorities.iter().find(|p| p.priority == priority)
                {
                    *status = LookupStatus::Success;
                    return Found::Priority { entry: p.clone() };
                }
            }
        }

        if earlymatch && action == Action::MatchMore {
            return Found::None;
        }

        // Alternate switches.
        for sw in ctx.switches() {
            let Some(switch) = self.switches.find(&sw.name) else {
                warn!(switch = %sw.name, "no such switch");
                continue;
            };
            let data = if sw.eval {
                let mut ds = DynStr::with_limit(256);
                substitute(self, chan, None, &sw.data, &mut ds, 0);
                ds.steal()
            } else {
                sw.data.clone()
            };
            let hit = match action {
                Action::CanMatch => switch.canmatch(chan, context, exten, priority, callerid, &data),
                Action::MatchMore => {
                    switch.matchmore(chan, context, exten, priority, callerid, &data)
                }
                _ => switch.exists(chan, context, exten, priority, callerid, &data),
            };
            if hit {
                return Found::Switch {
                    switch,
                    data,
                    context: context.to_owned(),
                };
            }
        }

        // Includes, depth first.
        stack.push(ctx.name().to_owned());
        for inc in ctx.includes() {
            if !inc.valid() {
                continue;
            }
            match self.find_rec(
                chan,
                None,
                &inc.context,
                exten,
                priority,
                label,
                callerid,
                action,
                stack,
                status,
            ) {
                Found::None => {}
                found => return found,
            }
        }
        Found::None
    }

    // --- classic helpers --------------------------------------------------

    pub fn exists_extension(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
    ) -> bool {
        !matches!(
            self.find(chan, None, context, exten, priority, None, callerid, Action::Exists)
                .0,
            Found::None
        )
    }

    pub fn canmatch_extension(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
    ) -> bool {
        !matches!(
            self.find(chan, None, context, exten, priority, None, callerid, Action::CanMatch)
                .0,
            Found::None
        )
    }

    pub fn matchmore_extension(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
    ) -> bool {
        !matches!(
            self.find(chan, None, context, exten, priority, None, callerid, Action::MatchMore)
                .0,
            Found::None
        )
    }

    /// Resolve a label to its priority number.
    pub fn find_label_extension(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        label: &str,
        callerid: Option<&str>,
    ) -> Option<i32> {
        match self
            .find(chan, None, context, exten, 0, Some(label), callerid, Action::FindLabel)
            .0
        {
            Found::Priority { entry, .. } => Some(entry.priority),
            _ => None,
        }
    }

    /// Execute one (context, exten, priority): substitute the app data,
    /// record Newexten and CDR position, dispatch the application.
    pub async fn exec_extension(
        self: &Arc<Self>,
        chan: &Arc<Channel>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
    ) -> AppReturn {
        let (found, status) = self.find(
            Some(chan),
            None,
            context,
            exten,
            priority,
            None,
            callerid,
            Action::Exec,
        );
        match found {
            Found::Priority { entry, .. } => {
                chan.set_position(Some(context), Some(exten), Some(priority));

                let mut data = DynStr::with_limit(8192);
                substitute(self, Some(chan), None, &entry.data, &mut data, 0);
                let data = data.steal();

                self.core.events.emit(
                    ManagerEvent::new("Newexten")
                        .field("Channel", chan.name())
                        .field("Context", context)
                        .field("Extension", exten)
                        .field("Priority", priority.to_string())
                        .field("Application", entry.app.clone())
                        .field("AppData", data.clone())
                        .field("Uniqueid", chan.uniqueid()),
                );
                if let Some(cdr) = chan.cdr() {
                    cdr.set_app(&entry.app, &data);
                    cdr.update(&chan.call_snapshot());
                }

                let Some(app) = self.core.apps.find(&entry.app) else {
                    warn!(app = %entry.app, "no such application");
                    return AppReturn::Failure;
                };
                let args = if data.is_empty() {
                    Vec::new()
                } else {
                    split_args(&data)
                };
                debug!(chan = %chan.name(), app = %entry.app, data = %data, "executing");
                app.exec(chan, &args).await
            }
            Found::Switch {
                switch,
                data,
                context: foundcontext,
            } => {
                switch
                    .exec(chan, &foundcontext, exten, priority, callerid, &data)
                    .await
            }
            Found::None => {
                match status {
                    LookupStatus::NoContext => {
                        warn!(context, "cannot find extension context");
                    }
                    LookupStatus::NoExtension => {
                        warn!(context, exten, "cannot find extension");
                    }
                    LookupStatus::NoPriority => {
                        warn!(context, exten, priority, "no such priority");
                    }
                    _ => {}
                }
                AppReturn::Failure
            }
        }
    }

    // --- CLI rendering ----------------------------------------------------

    /// `show dialplan [exten@][context]`.
    pub fn render_dialplan(&self, out: &mut DynStr, context: Option<&str>, exten: Option<&str>) {
        let mut shown_contexts = 0usize;
        let mut shown_extens = 0usize;
        for ctx in self.contexts.read().iter() {
            if let Some(filter) = context {
                if ctx.name() != filter {
                    continue;
                }
            }
            shown_contexts += 1;
            let _ = writeln!(
                out,
                "[ Context '{}' created by '{}' ]",
                ctx.name(),
                ctx.registrar()
            );
            let inner = ctx.inner.lock();
            for group in &inner.extens {
                if let Some(filter) = exten {
                    if group.exten != filter {
                        continue;
                    }
                }
                shown_extens += 1;
                let mut first = true;
                for p in &group.priorities {
                    let label = p
                        .label
                        .as_deref()
                        .map(|l| format!("({l}) "))
                        .unwrap_or_default();
                    if first {
                        let head = if group.matchcid {
                            format!("'{}' (CID match '{}')", group.exten, group.cidmatch)
                        } else {
                            format!("'{}'", group.exten)
                        };
                        let _ = writeln!(
                            out,
                            "  {:<20} => {}{}: {}({})",
                            head, label, p.priority, p.app, p.data
                        );
                        first = false;
                    } else {
                        let _ = writeln!(
                            out,
                            "  {:<20}    {}{}: {}({})",
                            "", label, p.priority, p.app, p.data
                        );
                    }
                }
            }
            for inc in &inner.includes {
                let _ = writeln!(out, "  Include =>          '{}'", inc.context);
            }
            for sw in &inner.switches {
                let _ = writeln!(out, "  Switch =>           '{}/{}'", sw.name, sw.data);
            }
            for pat in &inner.ignorepats {
                let _ = writeln!(out, "  Ignore pattern =>   '{}'", pat.pattern);
            }
            let _ = writeln!(out);
        }
        let _ = writeln!(
            out,
            "-= {shown_extens} extensions ({shown_contexts} contexts) =-"
        );
    }

    // --- hints ------------------------------------------------------------

    /// Watch the hint at (context, exten); the callback fires on aggregate
    /// state changes. None when no hint covers the extension.
    pub fn add_hint_watcher(
        &self,
        context: &str,
        exten: &str,
        cb: impl Fn(&str, &str, crate::hints::ExtState) + Send + Sync + 'static,
    ) -> Option<crate::hints::WatcherId> {
        self.hints.add_watcher(context, exten, cb)
    }

    pub fn del_hint_watcher(&self, id: crate::hints::WatcherId) -> bool {
        self.hints.del_watcher(id)
    }

    /// Current aggregate device state of a hint.
    pub fn extension_state(&self, context: &str, exten: &str) -> Option<crate::hints::ExtState> {
        self.hints.extension_state(&self.core, context, exten)
    }

    /// Device list of the hint covering (context, exten).
    pub fn get_hint(&self, context: &str, exten: &str) -> Option<String> {
        self.hints.get_hint(context, exten)
    }

    pub fn render_hints(&self, out: &mut DynStr) {
        self.hints.render(&self.core, out);
    }

    pub fn render_switches(&self, out: &mut DynStr) {
        let _ = writeln!(out, "Registered alternative switches:");
        self.switches.iterate_ordered(|name, _| {
            let _ = writeln!(out, "    {name}");
            false
        });
    }

    pub fn render_globals(&self, out: &mut DynStr) {
        let mut count = 0usize;
        self.globals.iterate_ordered(|name, value| {
            let _ = writeln!(out, "   {name}={value}");
            count += 1;
            false
        });
        let _ = writeln!(out, "    -- {count} variables");
    }
}

fn spawn_hint_watcher(core: &Arc<Core>, engine: &Arc<DialplanEngine>) {
    let weak: Weak<DialplanEngine> = Arc::downgrade(engine);
    let mut rx = core.subscribe_device_state();
    let core = Arc::clone(core);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(device) => {
                    let Some(engine) = weak.upgrade() else { break };
                    engine.hints.device_changed(&core, &device);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "device state watcher lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
