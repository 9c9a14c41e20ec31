use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use tracing::{info, warn};

use xb_cdr::CdrEngine;
use xb_core::{softhangup, Core};
use xb_pbx::DialplanEngine;
use xb_registry::Registry;
use xb_strings::DynStr;

use crate::context::ModuleContext;
use crate::module::{Module, ModuleError, ModuleImpl, ModuleState};
use crate::{ModuleResult, MODINFO_SYMBOL};

/// Boot-time module selection. With an explicit `load` list only those are
/// loaded; otherwise `module_dir` is scanned with `noload` filtering.
#[derive(Clone, Debug, Default)]
pub struct BootConfig {
    pub module_dir: Option<PathBuf>,
    /// Loaded in a first pass, before everything else.
    pub preload: Vec<String>,
    pub load: Vec<String>,
    pub noload: Vec<String>,
    pub autoload: bool,
}

pub struct Loader {
    core: Arc<Core>,
    dialplan: Arc<DialplanEngine>,
    cdr: Arc<CdrEngine>,
    registry: Registry<Module>,
    /// Serialises register/deregister/reconfigure across all modules, so
    /// module code never needs its own lifecycle locking. Never held across
    /// a call into module code that could re-enter the loader.
    lifecycle: Mutex<()>,
}

impl Loader {
    pub fn new(core: &Arc<Core>, dialplan: &Arc<DialplanEngine>, cdr: &Arc<CdrEngine>) -> Arc<Loader> {
        Arc::new(Loader {
            core: Arc::clone(core),
            dialplan: Arc::clone(dialplan),
            cdr: Arc::clone(cdr),
            registry: Registry::new("modules"),
            lifecycle: Mutex::new(()),
        })
    }

    fn context_for(&self, module: &Arc<Module>) -> ModuleContext {
        ModuleContext {
            core: Arc::clone(&self.core),
            dialplan: Arc::clone(&self.dialplan),
            cdr: Arc::clone(&self.cdr),
            module: Arc::clone(module),
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<Module>> {
        self.registry.find(name)
    }

    pub fn module_count(&self) -> usize {
        self.registry.len()
    }

    /// Load a shared object from `path` (module name = file stem).
    pub fn load(&self, path: &Path) -> ModuleResult<()> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();
        if name.is_empty() {
            return Err(ModuleError::Library(format!("{}: no module name", path.display())));
        }

        // Library loading is inherently unsafe: the module's constructors
        // run on our address space.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| ModuleError::Library(format!("{name}: {e}")))?;
        let info = unsafe {
            lib.get::<fn() -> Box<dyn ModuleImpl>>(MODINFO_SYMBOL)
                .map_err(|_| ModuleError::NoSymbol {
                    name: name.clone(),
                    symbol: "get_modinfo".to_owned(),
                })?()
        };
        self.install(name, info, Some(lib))
    }

    /// Register a statically linked module.
    pub fn load_builtin(&self, name: &str, info: Box<dyn ModuleImpl>) -> ModuleResult<()> {
        self.install(name.to_owned(), info, None)
    }

    fn install(
        &self,
        name: String,
        info: Box<dyn ModuleImpl>,
        lib: Option<Library>,
    ) -> ModuleResult<()> {
        let module = Arc::new(Module::new(name.clone(), info, lib));
        let ctx = self.context_for(&module);

        let old = {
            let _guard = self.lifecycle.lock();
            let old = self.registry.find(&name);
            let entry = self.registry.add(&name, Arc::clone(&module));
            *module.reg_entry.lock() = Some(entry);
            old
        };

        if let Err(e) = module.info().register(&ctx) {
            warn!(module = %name, error = %e, "register failed");
            let _ = module.info().deregister(&ctx);
            let _guard = self.lifecycle.lock();
            if let Some(entry) = module.reg_entry.lock().take() {
                self.registry.del(entry);
            }
            return Err(ModuleError::Rejected(name));
        }
        module.set_state(ModuleState::Active);
        info!(module = %name, "[{}] => ({})", name, module.description());

        // Replacing an older module of the same name: deregister it after
        // the new one is in place.
        if let Some(old) = old {
            let old_ctx = self.context_for(&old);
            let _guard = self.lifecycle.lock();
            if let Err(e) = old.info().deregister(&old_ctx) {
                warn!(module = %name, error = %e, "deregister of old instance failed");
            }
            if let Some(entry) = old.reg_entry.lock().take() {
                self.registry.del(entry);
            }
        }
        Ok(())
    }

    /// Deregister `name`. On success the registry entry is removed and the
    /// module transitions to UNMAP_ON_IDLE; the code is released when the
    /// last reference to an exported object drops. With `hangup`, every
    /// channel in the module's local-user list is soft-hung-up first.
    pub fn unload(&self, name: &str, hangup: bool) -> ModuleResult<()> {
        let module = self
            .registry
            .find(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_owned()))?;

        info!(module = %name, "Deregistering {} => ({})", name, module.description());
        let ctx = self.context_for(&module);
        module.info().deregister(&ctx)?;

        {
            let _guard = self.lifecycle.lock();
            module.set_state(ModuleState::UnmapOnIdle);
            if let Some(entry) = module.reg_entry.lock().take() {
                self.registry.del(entry);
            }
        }

        if hangup {
            for chan in module.local_users() {
                chan.softhangup(softhangup::APPUNLOAD);
            }
        }
        Ok(())
    }

    /// Reconfigure one module, or all of them. Core pseudo-modules (`cdr`)
    /// are dispatched first. Returns how many modules were touched.
    pub fn reconfigure(&self, name: Option<&str>) -> usize {
        let _guard = self.lifecycle.lock();
        let mut touched = 0usize;

        if name.is_none() || name.is_some_and(|n| n.eq_ignore_ascii_case("cdr")) {
            // The CDR engine re-reads its own enablement.
            self.cdr.set_enabled(self.cdr.enabled());
            touched += 1;
        }

        let mut targets = Vec::new();
        self.registry.iterate(|mod_name, module| {
            if name.is_none() || name == Some(mod_name) {
                targets.push(Arc::clone(module));
            }
            false
        });
        for module in targets {
            info!(module = %module.name(), "Reloading module '{}' ({})", module.name(), module.description());
            let ctx = self.context_for(&module);
            module.info().reconfigure(&ctx);
            touched += 1;
        }
        touched
    }

    /// Boot-time loading. Errors are logged, boot continues.
    pub fn boot(&self, cfg: &BootConfig) {
        for name in &cfg.preload {
            self.load_by_name(cfg, name);
        }
        if !cfg.load.is_empty() {
            for name in &cfg.load {
                if !cfg.preload.contains(name) {
                    self.load_by_name(cfg, name);
                }
            }
            return;
        }
        if !cfg.autoload {
            return;
        }
        let Some(dir) = &cfg.module_dir else { return };
        let mut found = match scan_module_dir(dir) {
            Ok(found) => found,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot scan module directory");
                return;
            }
        };
        // Resource modules first, then channel drivers, then dialplan
        // providers, then the rest.
        found.sort_by_key(|p| {
            let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            let class = if stem.starts_with("res_") {
                0
            } else if stem.starts_with("chan_") {
                1
            } else if stem.starts_with("pbx_") {
                2
            } else {
                3
            };
            (class, stem.to_owned())
        });
        for path in found {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if cfg.noload.iter().any(|n| n == stem) {
                continue;
            }
            if cfg.preload.iter().any(|n| n == stem) {
                continue;
            }
            if let Err(e) = self.load(&path) {
                warn!(module = %stem, error = %e, "load failed");
            }
        }
    }

    fn load_by_name(&self, cfg: &BootConfig, name: &str) {
        let path = match &cfg.module_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        let path = if path.extension().is_some() {
            path
        } else {
            path.with_extension(dylib_extension())
        };
        if let Err(e) = self.load(&path) {
            warn!(module = %name, error = %e, "load failed");
        }
    }

    /// `show modules [like PAT]` rendering.
    pub fn render_modules(&self, out: &mut DynStr, like: Option<&str>) {
        let _ = writeln!(out, "{:<30} {:<40} {:<10}", "Module", "Description", "Use Count");
        let mut count = 0usize;
        self.registry.iterate_ordered(|name, module| {
            if like.map(|pat| name.contains(pat)).unwrap_or(true) {
                let _ = writeln!(
                    out,
                    "{:<30} {:<40} {:<10}",
                    name,
                    module.description(),
                    module.use_count()
                );
                count += 1;
            }
            false
        });
        let _ = writeln!(out, "{count} modules loaded");
    }
}

fn scan_module_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == dylib_extension())
        {
            out.push(path);
        }
    }
    Ok(out)
}

fn dylib_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}
