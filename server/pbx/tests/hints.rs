//! Hint aggregation and watcher notification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use xb_core::{Core, CoreOptions, DeviceState, DeviceStateProvider};
use xb_pbx::{ContextSet, DialplanEngine, EngineOptions, ExtState};

struct TestProvider {
    states: Mutex<HashMap<String, DeviceState>>,
}

impl TestProvider {
    fn set(&self, device: &str, state: DeviceState) {
        self.states.lock().insert(device.to_owned(), state);
    }
}

impl DeviceStateProvider for TestProvider {
    fn state(&self, device: &str) -> DeviceState {
        self.states
            .lock()
            .get(device)
            .copied()
            .unwrap_or(DeviceState::NotInUse)
    }
}

async fn setup_hint() -> (Arc<Core>, Arc<DialplanEngine>, Arc<TestProvider>) {
    let core = Core::start(CoreOptions::default());
    let provider = Arc::new(TestProvider {
        states: Mutex::new(HashMap::new()),
    });
    core.devstate_providers
        .add("SIP", Arc::clone(&provider) as Arc<dyn DeviceStateProvider>);

    let engine = DialplanEngine::new(&core, EngineOptions::default());
    let mut set = ContextSet::new();
    set.context("default", "test")
        .add_extension(false, "100", 0, None, None, "SIP/alice&SIP/bob", "", "test")
        .unwrap();
    engine.merge_contexts_and_delete(set, "test");

    (core, engine, provider)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn aggregate_inuse_and_ringing() {
    let (core, engine, provider) = setup_hint().await;

    provider.set("SIP/alice", DeviceState::InUse);
    provider.set("SIP/bob", DeviceState::Ringing);
    assert_eq!(
        engine.extension_state("default", "100"),
        Some(ExtState::INUSE | ExtState::RINGING)
    );

    provider.set("SIP/bob", DeviceState::NotInUse);
    assert_eq!(
        engine.extension_state("default", "100"),
        Some(ExtState::INUSE)
    );

    provider.set("SIP/alice", DeviceState::NotInUse);
    assert_eq!(
        engine.extension_state("default", "100"),
        Some(ExtState::NOT_INUSE)
    );

    provider.set("SIP/alice", DeviceState::Busy);
    provider.set("SIP/bob", DeviceState::Busy);
    assert_eq!(engine.extension_state("default", "100"), Some(ExtState::BUSY));
    drop(core);
}

#[tokio::test]
async fn watcher_fires_once_per_aggregate_change() {
    let (core, engine, provider) = setup_hint().await;

    // alice is already in use before the watcher arrives.
    provider.set("SIP/alice", DeviceState::InUse);
    core.notify_device_state("SIP/alice");
    settle().await;

    let seen: Arc<Mutex<Vec<ExtState>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine
        .add_hint_watcher("default", "100", move |_ctx, _exten, state| {
            sink.lock().push(state);
        })
        .expect("hint exists");

    // bob starts ringing: exactly one callback with the combined state.
    provider.set("SIP/bob", DeviceState::Ringing);
    core.notify_device_state("SIP/bob");
    settle().await;
    assert_eq!(*seen.lock(), vec![ExtState::INUSE | ExtState::RINGING]);

    // Same state announced again: no further callback.
    core.notify_device_state("SIP/bob");
    settle().await;
    assert_eq!(seen.lock().len(), 1);

    // A device outside the hint never triggers it.
    core.notify_device_state("SIP/carol");
    settle().await;
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn reload_preserves_watchers_and_flags_removal() {
    let (core, engine, _provider) = setup_hint().await;

    let seen: Arc<Mutex<Vec<ExtState>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine
        .add_hint_watcher("default", "100", move |_c, _e, state| {
            sink.lock().push(state);
        })
        .expect("hint exists");

    // Reload keeping the hint: watcher carried over silently.
    let mut set = ContextSet::new();
    set.context("default", "test")
        .add_extension(false, "100", 0, None, None, "SIP/alice&SIP/bob", "", "test")
        .unwrap();
    engine.merge_contexts_and_delete(set, "test");
    assert!(seen.lock().is_empty());
    assert!(engine.get_hint("default", "100").is_some());

    // Reload dropping the hint: watcher is told Removed.
    let set = ContextSet::new();
    engine.merge_contexts_and_delete(set, "test");
    settle().await;
    assert_eq!(*seen.lock(), vec![ExtState::REMOVED]);
    assert!(engine.get_hint("default", "100").is_none());
    drop(core);
}

#[tokio::test]
async fn hint_rendering_lists_devices() {
    let (_core, engine, _provider) = setup_hint().await;
    let mut out = xb_strings::DynStr::new();
    engine.render_hints(&mut out);
    let text = out.steal();
    assert!(text.contains("100@default"));
    assert!(text.contains("SIP/alice&SIP/bob"));
    assert!(text.contains("- 1 hints registered"));
}
