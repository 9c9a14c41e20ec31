use std::sync::Arc;

use async_trait::async_trait;

use xb_cdr::{Cdr, CdrBackend, CdrEngine};
use xb_core::{AppReturn, Application, Channel, ChannelTech, Core};
use xb_pbx::{DialplanEngine, Switch};
use xb_registry::EntryId;

use crate::module::Module;

/// Everything a module's lifecycle hooks get to work with. Registration
/// goes through the `register_*` wrappers so every exported object holds a
/// strong reference to its module: while any of them is referenced, the
/// module's code cannot be unmapped.
pub struct ModuleContext {
    pub core: Arc<Core>,
    pub dialplan: Arc<DialplanEngine>,
    pub cdr: Arc<CdrEngine>,
    pub module: Arc<Module>,
}

impl ModuleContext {
    pub fn register_app(&self, app: Arc<dyn Application>) -> EntryId {
        let name = app.name().to_owned();
        self.core.apps.add(
            &name,
            Arc::new(ModuleOwnedApp {
                inner: app,
                _module: Arc::clone(&self.module),
            }),
        )
    }

    pub fn unregister_app(&self, entry: EntryId) {
        self.core.apps.del(entry);
    }

    pub fn register_tech(&self, tech: Arc<dyn ChannelTech>) -> EntryId {
        let name = tech.tech_type().to_owned();
        self.core.techs.add(
            &name,
            Arc::new(ModuleOwnedTech {
                inner: tech,
                _module: Arc::clone(&self.module),
            }),
        )
    }

    pub fn unregister_tech(&self, entry: EntryId) {
        self.core.techs.del(entry);
    }

    pub fn register_switch(&self, switch: Arc<dyn Switch>) -> EntryId {
        let name = switch.name().to_owned();
        self.dialplan.switches.add(
            &name,
            Arc::new(ModuleOwnedSwitch {
                inner: switch,
                _module: Arc::clone(&self.module),
            }),
        )
    }

    pub fn unregister_switch(&self, entry: EntryId) {
        self.dialplan.switches.del(entry);
    }

    pub fn register_cdr_backend(&self, backend: Arc<dyn CdrBackend>) -> EntryId {
        self.cdr.register_backend(Arc::new(ModuleOwnedBackend {
            inner: backend,
            _module: Arc::clone(&self.module),
        }))
    }

    pub fn unregister_cdr_backend(&self, entry: EntryId) {
        self.cdr.unregister_backend(entry);
    }
}

struct ModuleOwnedApp {
    inner: Arc<dyn Application>,
    _module: Arc<Module>,
}

#[async_trait]
impl Application for ModuleOwnedApp {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn synopsis(&self) -> &str {
        self.inner.synopsis()
    }
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        self._module.add_local_user(chan);
        let res = self.inner.exec(chan, args).await;
        self._module.remove_local_user(chan);
        res
    }
}

struct ModuleOwnedTech {
    inner: Arc<dyn ChannelTech>,
    _module: Arc<Module>,
}

#[async_trait]
impl ChannelTech for ModuleOwnedTech {
    fn tech_type(&self) -> &'static str {
        self.inner.tech_type()
    }
    fn description(&self) -> &'static str {
        self.inner.description()
    }
    fn capabilities(&self) -> xb_frame::FormatMask {
        self.inner.capabilities()
    }
    async fn request(
        &self,
        core: &Arc<Core>,
        formats: xb_frame::FormatMask,
        data: &str,
    ) -> xb_core::CoreResult<Arc<Channel>> {
        self.inner.request(core, formats, data).await
    }
    async fn call(
        &self,
        chan: &Arc<Channel>,
        dest: &str,
        timeout_ms: u64,
    ) -> xb_core::CoreResult<()> {
        self.inner.call(chan, dest, timeout_ms).await
    }
    async fn hangup(&self, chan: &Arc<Channel>) -> xb_core::CoreResult<()> {
        self.inner.hangup(chan).await
    }
    async fn answer(&self, chan: &Arc<Channel>) -> xb_core::CoreResult<()> {
        self.inner.answer(chan).await
    }
    async fn write(&self, chan: &Arc<Channel>, frame: &xb_frame::Frame) -> xb_core::CoreResult<()> {
        self.inner.write(chan, frame).await
    }
    async fn indicate(
        &self,
        chan: &Arc<Channel>,
        condition: xb_frame::ControlOp,
    ) -> xb_core::CoreResult<()> {
        self.inner.indicate(chan, condition).await
    }
    async fn fixup(&self, old: &Arc<Channel>, new: &Arc<Channel>) -> xb_core::CoreResult<()> {
        self.inner.fixup(old, new).await
    }
    async fn send_digit(&self, chan: &Arc<Channel>, digit: char) -> xb_core::CoreResult<()> {
        self.inner.send_digit(chan, digit).await
    }
    async fn send_text(&self, chan: &Arc<Channel>, text: &str) -> xb_core::CoreResult<()> {
        self.inner.send_text(chan, text).await
    }
    async fn bridge(
        &self,
        a: &Arc<Channel>,
        b: &Arc<Channel>,
    ) -> xb_core::CoreResult<()> {
        self.inner.bridge(a, b).await
    }
    async fn setoption(
        &self,
        chan: &Arc<Channel>,
        option: &str,
        value: &str,
    ) -> xb_core::CoreResult<()> {
        self.inner.setoption(chan, option, value).await
    }
}

struct ModuleOwnedSwitch {
    inner: Arc<dyn Switch>,
    _module: Arc<Module>,
}

#[async_trait]
impl Switch for ModuleOwnedSwitch {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn exists(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
        data: &str,
    ) -> bool {
        self.inner.exists(chan, context, exten, priority, callerid, data)
    }
    fn canmatch(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
        data: &str,
    ) -> bool {
        self.inner
            .canmatch(chan, context, exten, priority, callerid, data)
    }
    fn matchmore(
        &self,
        chan: Option<&Arc<Channel>>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
        data: &str,
    ) -> bool {
        self.inner
            .matchmore(chan, context, exten, priority, callerid, data)
    }
    async fn exec(
        &self,
        chan: &Arc<Channel>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
        data: &str,
    ) -> AppReturn {
        self.inner
            .exec(chan, context, exten, priority, callerid, data)
            .await
    }
}

struct ModuleOwnedBackend {
    inner: Arc<dyn CdrBackend>,
    _module: Arc<Module>,
}

impl CdrBackend for ModuleOwnedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn description(&self) -> &str {
        self.inner.description()
    }
    fn post(&self, batch: &[Arc<Cdr>]) {
        self.inner.post(batch)
    }
}
