//! Module lifecycle: load, unload with outstanding references, reload.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use xb_core::{AppReturn, Application, Channel, Core, CoreOptions};
use xb_loader::{BootConfig, Loader, ModuleContext, ModuleError, ModuleImpl, ModuleState};
use xb_pbx::{DialplanEngine, EngineOptions};
use xb_registry::EntryId;
use xb_strings::DynStr;

struct TestApp {
    name: String,
}

#[async_trait]
impl Application for TestApp {
    fn name(&self) -> &str {
        &self.name
    }
    async fn exec(&self, _chan: &Arc<Channel>, _args: &[String]) -> AppReturn {
        AppReturn::Ok
    }
}

/// A module exporting one application, with observable lifecycle hooks.
struct TestModule {
    app_name: String,
    entry: Mutex<Option<EntryId>>,
    registered: AtomicUsize,
    released: Arc<AtomicBool>,
    refuse_deregister: AtomicBool,
}

impl TestModule {
    fn new(app_name: &str, released: Arc<AtomicBool>) -> Box<TestModule> {
        Box::new(TestModule {
            app_name: app_name.to_owned(),
            entry: Mutex::new(None),
            registered: AtomicUsize::new(0),
            released,
            refuse_deregister: AtomicBool::new(false),
        })
    }
}

impl ModuleImpl for TestModule {
    fn description(&self) -> &str {
        "Test application module"
    }

    fn register(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        let entry = ctx.register_app(Arc::new(TestApp {
            name: self.app_name.clone(),
        }));
        *self.entry.lock() = Some(entry);
        self.registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deregister(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        if self.refuse_deregister.load(Ordering::SeqCst) {
            return Err(ModuleError::InUse(self.app_name.clone()));
        }
        if let Some(entry) = self.entry.lock().take() {
            ctx.unregister_app(entry);
        }
        Ok(())
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

async fn setup() -> (Arc<Core>, Arc<Loader>) {
    let core = Core::start(CoreOptions::default());
    let engine = DialplanEngine::new(&core, EngineOptions::default());
    let loader = Loader::new(&core, &engine, &core.cdr);
    (core, loader)
}

#[tokio::test]
async fn load_then_unload_restores_prior_state() {
    let (core, loader) = setup().await;
    let apps_before = core.apps.len();
    let released = Arc::new(AtomicBool::new(false));

    loader
        .load_builtin("app_test", TestModule::new("TestApp", Arc::clone(&released)))
        .unwrap();
    assert!(core.apps.find("TestApp").is_some());
    assert_eq!(loader.module_count(), 1);

    loader.unload("app_test", false).unwrap();
    assert!(core.apps.find("TestApp").is_none());
    assert_eq!(loader.module_count(), 0);
    assert_eq!(core.apps.len(), apps_before);
    assert!(released.load(Ordering::SeqCst), "no references held: released");

    // Loading again succeeds.
    let released2 = Arc::new(AtomicBool::new(false));
    loader
        .load_builtin("app_test", TestModule::new("TestApp", released2))
        .unwrap();
    assert!(core.apps.find("TestApp").is_some());
}

#[tokio::test]
async fn unload_with_outstanding_reference_defers_release() {
    let (core, loader) = setup().await;
    let released = Arc::new(AtomicBool::new(false));

    loader
        .load_builtin("app_ref", TestModule::new("RefApp", Arc::clone(&released)))
        .unwrap();

    // Someone is holding the exported application.
    let held = core.apps.find("RefApp").expect("registered");
    let module = loader.find("app_ref").expect("module registered");

    loader.unload("app_ref", false).unwrap();
    assert_eq!(module.state(), ModuleState::UnmapOnIdle);
    assert!(core.apps.find("RefApp").is_none(), "registry entry gone");
    assert!(
        !released.load(Ordering::SeqCst),
        "library must stay mapped while the app is referenced"
    );

    drop(module);
    drop(held);
    assert!(
        released.load(Ordering::SeqCst),
        "last reference dropped: module released"
    );
}

#[tokio::test]
async fn failed_deregister_keeps_module_active() {
    let (core, loader) = setup().await;
    let released = Arc::new(AtomicBool::new(false));
    let module_impl = TestModule::new("StubbornApp", Arc::clone(&released));
    module_impl.refuse_deregister.store(true, Ordering::SeqCst);

    loader.load_builtin("app_stubborn", module_impl).unwrap();
    assert!(loader.unload("app_stubborn", false).is_err());
    assert!(core.apps.find("StubbornApp").is_some());
    assert_eq!(loader.module_count(), 1);
}

#[tokio::test]
async fn replacement_swaps_registration() {
    let (core, loader) = setup().await;
    let released_a = Arc::new(AtomicBool::new(false));
    let released_b = Arc::new(AtomicBool::new(false));

    loader
        .load_builtin("app_dup", TestModule::new("DupApp", Arc::clone(&released_a)))
        .unwrap();
    loader
        .load_builtin("app_dup", TestModule::new("DupApp", Arc::clone(&released_b)))
        .unwrap();

    assert_eq!(loader.module_count(), 1, "replacement leaves one module");
    assert!(core.apps.find("DupApp").is_some());
    assert!(released_a.load(Ordering::SeqCst), "old instance released");
    assert!(!released_b.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unload_with_hangup_flags_local_users() {
    use xb_core::tech_null::NullTech;
    use xb_core::ChannelTech;

    let (core, loader) = setup().await;
    let tech = NullTech::new();
    core.techs
        .add("Null", Arc::clone(&tech) as Arc<dyn ChannelTech>);

    let released = Arc::new(AtomicBool::new(false));
    loader
        .load_builtin("app_busycall", TestModule::new("BusyApp", released))
        .unwrap();
    let module = loader.find("app_busycall").unwrap();

    let chan = tech.new_channel(&core, "u1").unwrap();
    module.add_local_user(&chan);
    assert_eq!(module.use_count(), 1);

    loader.unload("app_busycall", true).unwrap();
    assert!(
        chan.softhangup_bits() & xb_core::softhangup::APPUNLOAD != 0,
        "channel flagged for app unload"
    );
    chan.hangup().await.unwrap();
}

#[tokio::test]
async fn boot_with_explicit_missing_modules_does_not_panic() {
    let (_core, loader) = setup().await;
    loader.boot(&BootConfig {
        load: vec!["res_missing".into()],
        ..BootConfig::default()
    });
    assert_eq!(loader.module_count(), 0);
}

#[tokio::test]
async fn module_listing_renders_use_counts() {
    let (_core, loader) = setup().await;
    let released = Arc::new(AtomicBool::new(false));
    loader
        .load_builtin("app_render", TestModule::new("RenderApp", released))
        .unwrap();

    let mut out = DynStr::new();
    loader.render_modules(&mut out, None);
    let text = out.steal();
    assert!(text.contains("app_render"));
    assert!(text.contains("Test application module"));
    assert!(text.contains("1 modules loaded"));

    let mut out = DynStr::new();
    loader.render_modules(&mut out, Some("nomatch"));
    assert!(out.as_str().contains("0 modules loaded"));
}
