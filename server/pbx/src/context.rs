//! Dialplan data model: contexts, extensions, includes, switches.
//!
//! Extensions are kept ordered (literals before `_` patterns, then by name)
//! with per-extension priority chains in ascending order. Mutations take the
//! per-context lock; the engine's context list has its own.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use xb_registry::hash_str;

use crate::error::{PbxError, PbxResult};
use crate::timing::TimeSpec;

#[derive(Clone, Debug)]
pub struct PriorityEntry {
    pub priority: i32,
    pub label: Option<String>,
    pub app: String,
    pub app_hash: u32,
    pub data: String,
    pub registrar: String,
}

/// All priorities registered under one (exten, cid-pattern) pair.
#[derive(Clone, Debug)]
pub(crate) struct ExtenEntry {
    pub exten: String,
    pub hash: u32,
    pub matchcid: bool,
    pub cidmatch: String,
    pub priorities: Vec<PriorityEntry>,
}

#[derive(Clone, Debug)]
pub struct Include {
    pub context: String,
    pub timing: Option<TimeSpec>,
    pub registrar: String,
}

impl Include {
    pub fn valid(&self) -> bool {
        self.timing.as_ref().map(|t| t.check()).unwrap_or(true)
    }
}

#[derive(Clone, Debug)]
pub struct SwitchRef {
    pub name: String,
    pub data: String,
    /// Substitute variables into `data` at match time.
    pub eval: bool,
    pub registrar: String,
}

#[derive(Clone, Debug)]
pub struct IgnorePat {
    pub pattern: String,
    pub registrar: String,
}

#[derive(Default)]
pub(crate) struct ContextInner {
    pub extens: Vec<ExtenEntry>,
    pub includes: Vec<Include>,
    pub ignorepats: Vec<IgnorePat>,
    pub switches: Vec<SwitchRef>,
}

pub struct Context {
    name: String,
    hash: u32,
    registrar: String,
    pub(crate) inner: Mutex<ContextInner>,
}

impl Context {
    pub fn new(name: &str, registrar: &str) -> Arc<Context> {
        Arc::new(Context {
            name: name.to_owned(),
            hash: hash_str(name),
            registrar: registrar.to_owned(),
            inner: Mutex::new(ContextInner::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn registrar(&self) -> &str {
        &self.registrar
    }

    /// Register a priority. `replace` overwrites an existing equal
    /// (exten, cid, priority); otherwise that case errors.
    #[allow(clippy::too_many_arguments)]
    pub fn add_extension(
        &self,
        replace: bool,
        exten: &str,
        priority: i32,
        label: Option<&str>,
        cidmatch: Option<&str>,
        app: &str,
        data: &str,
        registrar: &str,
    ) -> PbxResult<()> {
        let entry = PriorityEntry {
            priority,
            label: label.map(str::to_owned),
            app: app.to_owned(),
            app_hash: hash_str(app),
            data: data.to_owned(),
            registrar: registrar.to_owned(),
        };
        let stripped = strip_exten(exten);

        let mut inner = self.inner.lock();
        let pos = inner.extens.iter().position(|e| {
            exten_order(&e.exten, e.matchcid, &e.cidmatch, &stripped, cidmatch)
                != std::cmp::Ordering::Less
        });
        let insert_at = pos.unwrap_or(inner.extens.len());

        let group_matches = pos
            .map(|p| {
                let e = &inner.extens[p];
                exten_order(&e.exten, e.matchcid, &e.cidmatch, &stripped, cidmatch)
                    == std::cmp::Ordering::Equal
            })
            .unwrap_or(false);

        if group_matches {
            let group = &mut inner.extens[insert_at];
            match group.priorities.binary_search_by_key(&priority, |p| p.priority) {
                Ok(i) => {
                    if !replace {
                        return Err(PbxError::ExtensionExists {
                            context: self.name.clone(),
                            exten: stripped,
                            priority,
                        });
                    }
                    group.priorities[i] = entry;
                }
                Err(i) => group.priorities.insert(i, entry),
            }
        } else {
            inner.extens.insert(
                insert_at,
                ExtenEntry {
                    exten: stripped.clone(),
                    hash: hash_str(&stripped),
                    matchcid: cidmatch.is_some(),
                    cidmatch: cidmatch.unwrap_or("").to_owned(),
                    priorities: vec![entry],
                },
            );
        }
        debug!(
            context = %self.name,
            exten = %stripped,
            priority,
            "added extension"
        );
        Ok(())
    }

    /// Remove one priority, or the whole extension when `priority` is None.
    pub fn remove_extension(&self, exten: &str, priority: Option<i32>) -> PbxResult<()> {
        let mut inner = self.inner.lock();
        let before = inner.extens.len();
        match priority {
            None => {
                inner.extens.retain(|e| e.exten != exten);
                if inner.extens.len() == before {
                    return Err(PbxError::NoExtension {
                        context: self.name.clone(),
                        exten: exten.to_owned(),
                    });
                }
            }
            Some(p) => {
                let mut removed = false;
                for e in inner.extens.iter_mut().filter(|e| e.exten == exten) {
                    let len = e.priorities.len();
                    e.priorities.retain(|pe| pe.priority != p);
                    removed |= e.priorities.len() != len;
                }
                inner.extens.retain(|e| !e.priorities.is_empty());
                if !removed {
                    return Err(PbxError::NoPriority {
                        context: self.name.clone(),
                        exten: exten.to_owned(),
                        priority: p,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn add_include(
        &self,
        value: &str,
        timing: Option<TimeSpec>,
        registrar: &str,
    ) -> PbxResult<()> {
        let mut inner = self.inner.lock();
        if inner.includes.iter().any(|i| i.context == value) {
            return Err(PbxError::AlreadyIncluded(value.to_owned()));
        }
        inner.includes.push(Include {
            context: value.to_owned(),
            timing,
            registrar: registrar.to_owned(),
        });
        Ok(())
    }

    pub fn remove_include(&self, value: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.includes.len();
        inner.includes.retain(|i| i.context != value);
        inner.includes.len() != before
    }

    pub fn add_switch(&self, name: &str, data: &str, eval: bool, registrar: &str) {
        self.inner.lock().switches.push(SwitchRef {
            name: name.to_owned(),
            data: data.to_owned(),
            eval,
            registrar: registrar.to_owned(),
        });
    }

    pub fn remove_switch(&self, name: &str, data: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.switches.len();
        inner
            .switches
            .retain(|s| !(s.name == name && s.data == data));
        inner.switches.len() != before
    }

    pub fn add_ignorepat(&self, pattern: &str, registrar: &str) {
        self.inner.lock().ignorepats.push(IgnorePat {
            pattern: pattern.to_owned(),
            registrar: registrar.to_owned(),
        });
    }

    pub fn remove_ignorepat(&self, pattern: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.ignorepats.len();
        inner.ignorepats.retain(|p| p.pattern != pattern);
        inner.ignorepats.len() != before
    }

    /// Whether dialled digits so far fall under an ignore pattern (keep
    /// playing dialtone).
    pub fn ignore_pattern(&self, digits: &str) -> bool {
        use crate::pattern::{pattern_match, MatchResult};
        self.inner.lock().ignorepats.iter().any(|p| {
            matches!(
                pattern_match(digits, &p.pattern),
                MatchResult::Exact | MatchResult::Stretchable | MatchResult::Possible
            )
        })
    }

    pub fn includes(&self) -> Vec<Include> {
        self.inner.lock().includes.clone()
    }

    pub fn switches(&self) -> Vec<SwitchRef> {
        self.inner.lock().switches.clone()
    }

    /// Priority-0 hint entries: (exten, device string).
    pub(crate) fn hint_entries(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for e in &inner.extens {
            for p in &e.priorities {
                if p.priority == crate::PRIORITY_HINT {
                    out.push((e.exten.clone(), p.app.clone()));
                }
            }
        }
        out
    }
}

/// A freshly built set of contexts, merged into the engine atomically.
#[derive(Default)]
pub struct ContextSet {
    pub(crate) contexts: Vec<Arc<Context>>,
}

impl ContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create `name` inside the set.
    pub fn context(&mut self, name: &str, registrar: &str) -> Arc<Context> {
        if let Some(c) = self.contexts.iter().find(|c| c.name() == name) {
            return Arc::clone(c);
        }
        let c = Context::new(name, registrar);
        self.contexts.push(Arc::clone(&c));
        c
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// Copy an extension name dropping the separators the matcher skips.
fn strip_exten(exten: &str) -> String {
    if exten.starts_with('_') {
        exten.to_owned()
    } else {
        exten.chars().filter(|c| *c != ' ' && *c != '-').collect()
    }
}

/// Sort key: literals before patterns, then name order, then cid-less
/// before cid-matched, then cid pattern order.
fn exten_order(
    a_exten: &str,
    a_matchcid: bool,
    a_cid: &str,
    b_exten: &str,
    b_cid: Option<&str>,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let a_pat = a_exten.starts_with('_');
    let b_pat = b_exten.starts_with('_');
    match (a_pat, b_pat) {
        (false, true) => return Ordering::Less,
        (true, false) => return Ordering::Greater,
        _ => {}
    }
    match a_exten.cmp(b_exten) {
        Ordering::Equal => {}
        other => return other,
    }
    match (a_matchcid, b_cid.is_some()) {
        (false, false) => Ordering::Equal,
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        (true, true) => {
            let b = b_cid.unwrap_or("");
            a_cid.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
        }
    }
}
