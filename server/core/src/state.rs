use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

use xb_cdr::CdrEngine;
use xb_frame::FormatMask;
use xb_registry::Registry;

use crate::app::Application;
use crate::channel::Channel;
use crate::devstate::{self, DeviceState, DeviceStateProvider};
use crate::error::{CoreError, CoreResult};
use crate::events::ManagerBus;
use crate::sched::Scheduler;
use crate::tech::ChannelTech;
use crate::translate::TranslatorRegistry;

#[derive(Clone, Debug)]
pub struct CoreOptions {
    pub system_name: String,
    pub default_context: String,
    /// End the CDR before running the `h` extension chain.
    pub end_cdr_before_h: bool,
    pub max_calls: Option<usize>,
}

impl Default for CoreOptions {
    fn default() -> Self {
        CoreOptions {
            system_name: "crossbar".to_owned(),
            default_context: "default".to_owned(),
            end_cdr_before_h: false,
            max_calls: None,
        }
    }
}

/// Shared runtime state: every registry the switch core owns, plus the
/// scheduler, CDR engine and manager bus. One per process, shared as an
/// `Arc` by channels, the dialplan and modules.
pub struct Core {
    pub options: CoreOptions,
    pub techs: Registry<dyn ChannelTech>,
    pub apps: Registry<dyn Application>,
    pub translators: TranslatorRegistry,
    pub devstate_providers: Registry<dyn DeviceStateProvider>,
    pub events: ManagerBus,
    pub sched: Arc<Scheduler>,
    pub cdr: Arc<CdrEngine>,
    channels: DashMap<String, Arc<Channel>>,
    devstate_tx: broadcast::Sender<String>,
    active_calls: AtomicUsize,
}

impl Core {
    /// Build the core and spawn its background tasks on the current runtime.
    pub fn start(options: CoreOptions) -> Arc<Core> {
        let sched = Scheduler::new();
        sched.start();
        let (devstate_tx, _) = broadcast::channel(256);
        Arc::new(Core {
            options,
            techs: Registry::new("channel-techs"),
            apps: Registry::new("applications"),
            translators: TranslatorRegistry::new(),
            devstate_providers: Registry::new("devstate-providers"),
            events: ManagerBus::new(),
            sched,
            cdr: CdrEngine::start(),
            channels: DashMap::new(),
            devstate_tx,
            active_calls: AtomicUsize::new(0),
        })
    }

    // --- live channel table ----------------------------------------------

    pub(crate) fn insert_channel(&self, chan: Arc<Channel>) {
        self.channels.insert(chan.uniqueid().to_owned(), chan);
    }

    pub(crate) fn remove_channel(&self, uniqueid: &str) {
        self.channels.remove(uniqueid);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_by_name(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .iter()
            .find(|e| e.value().name() == name)
            .map(|e| Arc::clone(e.value()))
    }

    pub fn channels_snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|e| Arc::clone(e.value())).collect()
    }

    // --- call accounting --------------------------------------------------

    pub(crate) fn call_started(&self) -> CoreResult<()> {
        let count = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max) = self.options.max_calls {
            if count > max {
                self.active_calls.fetch_sub(1, Ordering::SeqCst);
                warn!(max, "maximum call limit reached");
                return Err(CoreError::CallLimit);
            }
        }
        Ok(())
    }

    pub(crate) fn call_ended(&self) {
        self.active_calls.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    // --- outbound requests ------------------------------------------------

    /// Ask a registered tech driver for a new outbound channel.
    pub async fn request(
        self: &Arc<Self>,
        tech: &str,
        formats: FormatMask,
        data: &str,
    ) -> CoreResult<Arc<Channel>> {
        let driver = self
            .techs
            .find(tech)
            .ok_or(CoreError::NotFound("channel tech"))?;
        if driver.capabilities().intersect(formats).is_empty() && !formats.is_empty() {
            return Err(CoreError::FormatUnsupported {
                from: formats.first().unwrap_or(xb_frame::AudioFormat::Slin),
                to: driver
                    .capabilities()
                    .first()
                    .unwrap_or(xb_frame::AudioFormat::Slin),
            });
        }
        driver.request(self, formats, data).await
    }

    // --- device state -----------------------------------------------------

    /// Current state of `Tech/resource`, via the tech's provider when it has
    /// one, else derived from any live channel on that device.
    pub fn device_state(&self, device: &str) -> DeviceState {
        let prefix = device.split('/').next().unwrap_or(device);
        if let Some(provider) = self.devstate_providers.find(prefix) {
            return provider.state(device);
        }
        for entry in self.channels.iter() {
            let chan = entry.value();
            let name = chan.name();
            let base = name.rsplit_once('-').map(|(b, _)| b).unwrap_or(&name);
            if base == device {
                return devstate::state_from_channel(chan.state());
            }
        }
        DeviceState::Unknown
    }

    /// Announce that a device's state may have changed; hint watchers
    /// re-evaluate on this signal.
    pub fn notify_device_state(&self, device: &str) {
        let _ = self.devstate_tx.send(device.to_owned());
    }

    pub fn subscribe_device_state(&self) -> broadcast::Receiver<String> {
        self.devstate_tx.subscribe()
    }
}
