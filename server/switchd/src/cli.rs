//! Transport-agnostic CLI verbs.
//!
//! Any front-end (console, manager, socket) tokenises a line and calls
//! [`Cli::dispatch`]; output is rendered into the caller's accumulator.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use xb_cdr::CdrEngine;
use xb_core::Core;
use xb_loader::Loader;
use xb_pbx::DialplanEngine;
use xb_strings::DynStr;

pub struct Cli {
    pub core: Arc<Core>,
    pub engine: Arc<DialplanEngine>,
    pub cdr: Arc<CdrEngine>,
    pub loader: Arc<Loader>,
    pub dialplan_path: Option<PathBuf>,
}

impl Cli {
    /// Execute one command line. Returns false for an unknown verb.
    pub async fn dispatch(&self, line: &str, out: &mut DynStr) -> bool {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["show", "modules"] => self.loader.render_modules(out, None),
            ["show", "modules", "like", pat] => self.loader.render_modules(out, Some(pat)),
            ["load", file] => match self.loader.load(Path::new(file)) {
                Ok(()) => {
                    let _ = writeln!(out, "Loaded {file}");
                }
                Err(e) => {
                    let _ = writeln!(out, "Unable to load module {file}: {e}");
                }
            },
            ["unload", name] => self.unload(name, false, out),
            ["unload", "-h", name] => self.unload(name, true, out),
            ["reconfigure"] => {
                let n = self.loader.reconfigure(None);
                self.reload_dialplan(out).await;
                let _ = writeln!(out, "{n} modules reconfigured");
            }
            ["reconfigure", names @ ..] => {
                let mut n = 0;
                for name in names {
                    n += self.loader.reconfigure(Some(name));
                }
                let _ = writeln!(out, "{n} modules reconfigured");
            }
            ["show", "dialplan"] => self.engine.render_dialplan(out, None, None),
            ["show", "dialplan", what] => match what.split_once('@') {
                Some((exten, context)) => {
                    self.engine.render_dialplan(out, Some(context), Some(exten))
                }
                None => self.engine.render_dialplan(out, Some(what), None),
            },
            ["show", "switches"] => self.engine.render_switches(out),
            ["show", "hints"] => self.engine.render_hints(out),
            ["show", "globals"] => self.engine.render_globals(out),
            ["set", "global", name, value] => {
                self.engine.set_global(name, Some(value));
                let _ = writeln!(out, "Global variable '{name}' set to '{value}'");
            }
            ["cdr", "status"] => self.cdr.render_status(out),
            ["show", "channels"] => {
                for chan in self.core.channels_snapshot() {
                    let snap = chan.snapshot();
                    let _ = writeln!(
                        out,
                        "{:<30} {:<10} {}@{}:{}",
                        snap.name,
                        snap.state.as_str(),
                        snap.exten,
                        snap.context,
                        snap.priority
                    );
                }
                let _ = writeln!(out, "{} active channels", self.core.channel_count());
            }
            _ => return false,
        }
        true
    }

    fn unload(&self, name: &str, hangup: bool, out: &mut DynStr) {
        match self.loader.unload(name, hangup) {
            Ok(()) => {
                let _ = writeln!(out, "Unloaded {name}");
            }
            Err(e) => {
                let _ = writeln!(out, "Unable to unload module {name}: {e}");
            }
        }
    }

    async fn reload_dialplan(&self, out: &mut DynStr) {
        if let Some(path) = &self.dialplan_path {
            if let Err(e) = crate::dialplan::load_into(&self.engine, path).await {
                let _ = writeln!(out, "Dialplan reload failed, previous kept: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xb_core::CoreOptions;
    use xb_pbx::{ContextSet, EngineOptions};

    async fn cli() -> Cli {
        let core = Core::start(CoreOptions::default());
        let engine = DialplanEngine::new(&core, EngineOptions::default());
        let loader = Loader::new(&core, &engine, &core.cdr);
        Cli {
            cdr: Arc::clone(&core.cdr),
            core,
            engine,
            loader,
            dialplan_path: None,
        }
    }

    #[tokio::test]
    async fn verbs_dispatch_and_render() {
        let cli = cli().await;

        let mut set = ContextSet::new();
        set.context("default", "test")
            .add_extension(false, "s", 1, None, None, "NoOp", "", "test")
            .unwrap();
        cli.engine.merge_contexts_and_delete(set, "test");

        let mut out = DynStr::new();
        assert!(cli.dispatch("show dialplan default", &mut out).await);
        assert!(out.as_str().contains("Context 'default'"));

        let mut out = DynStr::new();
        assert!(cli.dispatch("set global COLOR green", &mut out).await);
        assert_eq!(cli.engine.get_global("COLOR").as_deref(), Some("green"));

        let mut out = DynStr::new();
        assert!(cli.dispatch("show globals", &mut out).await);
        assert!(out.as_str().contains("COLOR=green"));

        let mut out = DynStr::new();
        assert!(cli.dispatch("cdr status", &mut out).await);
        assert!(out.as_str().contains("CDR logging: enabled"));

        let mut out = DynStr::new();
        assert!(cli.dispatch("show modules", &mut out).await);
        assert!(out.as_str().contains("0 modules loaded"));

        let mut out = DynStr::new();
        assert!(!cli.dispatch("frob the widget", &mut out).await);
    }

    #[tokio::test]
    async fn unload_of_missing_module_reports() {
        let cli = cli().await;
        let mut out = DynStr::new();
        assert!(cli.dispatch("unload app_missing", &mut out).await);
        assert!(out.as_str().contains("Unable to unload module app_missing"));
    }
}
