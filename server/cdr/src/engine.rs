use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use xb_registry::{EntryId, Registry};
use xb_strings::DynStr;

use crate::record::Cdr;

/// A CDR sink. Back-ends are iterated in name order for each batch and must
/// not retain references past the call.
pub trait CdrBackend: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn post(&self, batch: &[Arc<Cdr>]);
}

/// Owns the submission queue and the poster task.
///
/// `detach` is cheap and callable from call paths; the poster task steals the
/// whole pending queue as one batch, stamps POSTED, then fans out to the
/// back-end registry without holding any lock.
pub struct CdrEngine {
    backends: Arc<Registry<dyn CdrBackend>>,
    tx: mpsc::UnboundedSender<Arc<Cdr>>,
    enabled: AtomicBool,
}

impl CdrEngine {
    /// Create the engine and spawn its poster task on the current runtime.
    pub fn start() -> Arc<CdrEngine> {
        let backends: Arc<Registry<dyn CdrBackend>> = Arc::new(Registry::new("cdr-backends"));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(poster(Arc::clone(&backends), rx));

        Arc::new(CdrEngine {
            backends,
            tx,
            enabled: AtomicBool::new(true),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            info!("CDR logging enabled");
        } else {
            info!("CDR logging disabled, data will be discarded");
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn register_backend(&self, backend: Arc<dyn CdrBackend>) -> EntryId {
        let name = backend.name().to_owned();
        debug!(backend = %name, "CDR back-end registered");
        self.backends.add(&name, backend)
    }

    pub fn unregister_backend(&self, entry: EntryId) {
        self.backends.del(entry);
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Queue a finished record for posting. With the engine disabled the
    /// record is marked posted and dropped.
    pub fn detach(&self, cdr: Arc<Cdr>) {
        if !self.enabled() {
            cdr.mark_posted();
            return;
        }
        if self.tx.send(cdr).is_err() {
            warn!("CDR poster task is gone, record discarded");
        }
    }

    /// `cdr status` rendering.
    pub fn render_status(&self, out: &mut DynStr) {
        let _ = writeln!(
            out,
            "CDR logging: {}",
            if self.enabled() { "enabled" } else { "disabled" }
        );
        if self.enabled() {
            self.backends.iterate_ordered(|_, be| {
                let _ = writeln!(out, "CDR registered backend: {}", be.name());
                false
            });
        }
    }
}

async fn poster(
    backends: Arc<Registry<dyn CdrBackend>>,
    mut rx: mpsc::UnboundedReceiver<Arc<Cdr>>,
) {
    while let Some(first) = rx.recv().await {
        // Steal everything queued so far; one batch per wakeup.
        let mut batch = vec![first];
        while let Ok(more) = rx.try_recv() {
            batch.push(more);
        }
        post_batch(&backends, &batch);
    }
    debug!("CDR poster task stopped");
}

fn post_batch(backends: &Registry<dyn CdrBackend>, batch: &[Arc<Cdr>]) {
    for cdr in batch {
        // Stamp every record in each submission's leg chain.
        cdr.mark_posted();
        let mut leg = cdr.next_leg();
        while let Some(c) = leg {
            c.mark_posted();
            leg = c.next_leg();
        }
    }
    backends.iterate_ordered(|_, be| {
        be.post(batch);
        false
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CallSnapshot;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Collector {
        name: String,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl CdrBackend for Collector {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "test collector"
        }
        fn post(&self, batch: &[Arc<Cdr>]) {
            let mut seen = self.seen.lock();
            for cdr in batch {
                seen.push(cdr.snapshot().uniqueid);
            }
        }
    }

    fn record(uid: &str) -> Arc<Cdr> {
        let cdr = Cdr::from_snapshot(&CallSnapshot {
            channel: format!("Test/{uid}"),
            uniqueid: uid.into(),
            ..Default::default()
        });
        cdr.start();
        cdr.end();
        cdr
    }

    #[tokio::test]
    async fn backends_see_records_in_order_exactly_once() {
        let engine = CdrEngine::start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        engine.register_backend(Arc::new(Collector {
            name: "collect".into(),
            seen: Arc::clone(&seen),
        }));

        for i in 0..50 {
            engine.detach(record(&format!("uid-{i:03}")));
        }

        // Poster runs asynchronously; wait for it to drain.
        for _ in 0..100 {
            if seen.lock().len() == 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 50, "every record exactly once");
        let expected: Vec<String> = (0..50).map(|i| format!("uid-{i:03}")).collect();
        assert_eq!(*seen, expected, "submission order preserved");
    }

    #[tokio::test]
    async fn disabled_engine_discards_but_marks_posted() {
        let engine = CdrEngine::start();
        engine.set_enabled(false);
        let cdr = record("uid-x");
        engine.detach(Arc::clone(&cdr));
        assert!(cdr.is_posted());
    }

    #[tokio::test]
    async fn status_lists_backends_in_order() {
        let engine = CdrEngine::start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["zeta", "alpha"] {
            engine.register_backend(Arc::new(Collector {
                name: name.into(),
                seen: Arc::clone(&seen),
            }));
        }
        let mut out = DynStr::new();
        engine.render_status(&mut out);
        let text = out.steal();
        assert!(text.starts_with("CDR logging: enabled"));
        let alpha = text.find("alpha").unwrap();
        let zeta = text.find("zeta").unwrap();
        assert!(alpha < zeta);
    }
}
