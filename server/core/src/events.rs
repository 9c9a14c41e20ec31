//! Manager event bus.
//!
//! Events are key/value records fanned out to any number of subscribers
//! (manager front-ends, tests). Emission never blocks: with no subscriber
//! the event is dropped.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::broadcast;

use xb_cdr::{Cdr, CdrBackend, CdrView};
use xb_strings::DynStr;

#[derive(Clone, Debug)]
pub struct ManagerEvent {
    pub name: &'static str,
    pub fields: Vec<(&'static str, String)>,
}

impl ManagerEvent {
    pub fn new(name: &'static str) -> Self {
        ManagerEvent {
            name,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((key, value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Wire rendering used by manager front-ends.
    pub fn render(&self, out: &mut DynStr) {
        let _ = write!(out, "Event: {}\r\n", self.name);
        for (k, v) in &self.fields {
            let _ = write!(out, "{k}: {v}\r\n");
        }
        let _ = write!(out, "\r\n");
    }
}

#[derive(Clone)]
pub struct ManagerBus {
    tx: broadcast::Sender<ManagerEvent>,
}

impl ManagerBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        ManagerBus { tx }
    }

    pub fn emit(&self, event: ManagerEvent) {
        // No subscriber is fine; the bus is fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.tx.subscribe()
    }
}

impl Default for ManagerBus {
    fn default() -> Self {
        Self::new()
    }
}

/// CDR back-end that republishes every posted record as a `Cdr` manager
/// event with `YYYY-MM-DD HH:MM:SS` formatted times.
pub struct CdrManagerBackend {
    bus: ManagerBus,
}

impl CdrManagerBackend {
    pub fn new(bus: ManagerBus) -> Self {
        CdrManagerBackend { bus }
    }

    fn emit_one(&self, view: &CdrView) {
        self.bus.emit(
            ManagerEvent::new("Cdr")
                .field("AccountCode", view.accountcode.clone())
                .field("Source", view.src.clone())
                .field("Destination", view.dst.clone())
                .field("DestinationContext", view.dcontext.clone())
                .field("CallerID", view.clid.clone())
                .field("Channel", view.channel.clone())
                .field("DestinationChannel", view.dstchannel.clone())
                .field("LastApplication", view.lastapp.clone())
                .field("LastData", view.lastdata.clone())
                .field("StartTime", CdrView::format_time(view.start))
                .field("AnswerTime", CdrView::format_time(view.answer))
                .field("EndTime", CdrView::format_time(view.end))
                .field("Duration", view.duration.to_string())
                .field("BillableSeconds", view.billsec.to_string())
                .field("Disposition", view.disposition.as_str())
                .field("AMAFlags", view.amaflags.as_str())
                .field("UniqueID", view.uniqueid.clone())
                .field("UserField", view.userfield.clone()),
        );
    }
}

impl CdrBackend for CdrManagerBackend {
    fn name(&self) -> &str {
        "cdr_manager"
    }

    fn description(&self) -> &str {
        "Manager event CDR back-end"
    }

    fn post(&self, batch: &[Arc<Cdr>]) {
        for cdr in batch {
            self.emit_one(&cdr.snapshot());
            let mut leg = cdr.next_leg();
            while let Some(c) = leg {
                self.emit_one(&c.snapshot());
                leg = c.next_leg();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_shape() {
        let mut out = DynStr::new();
        ManagerEvent::new("Newexten")
            .field("Channel", "Null/1")
            .field("Priority", "1")
            .render(&mut out);
        assert_eq!(
            out.as_str(),
            "Event: Newexten\r\nChannel: Null/1\r\nPriority: 1\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = ManagerBus::new();
        let mut rx = bus.subscribe();
        bus.emit(ManagerEvent::new("Test").field("K", "v"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name, "Test");
        assert_eq!(ev.get("K"), Some("v"));
    }
}
