//! General-purpose one-shot timer scheduler.
//!
//! Jobs are plain closures run on the scheduler task; keep them short (the
//! usual job flips a soft-hangup bit or pokes a queue).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SchedId(u64);

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    queue: BTreeMap<(Instant, u64), Job>,
    next_id: u64,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
    poke: Notify,
    stop: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Arc<Scheduler> {
        Arc::new(Scheduler {
            inner: Mutex::new(Inner {
                queue: BTreeMap::new(),
                next_id: 1,
            }),
            poke: Notify::new(),
            stop: CancellationToken::new(),
        })
    }

    /// Spawn the runner task on the current runtime.
    pub fn start(self: &Arc<Self>) {
        let sched = Arc::clone(self);
        tokio::spawn(async move {
            sched.run().await;
        });
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Run `job` at `when`.
    pub fn run_at(&self, when: Instant, job: impl FnOnce() + Send + 'static) -> SchedId {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.queue.insert((when, id), Box::new(job));
            id
        };
        self.poke.notify_one();
        SchedId(id)
    }

    /// Run `job` after `ms` milliseconds.
    pub fn run_after(&self, ms: u64, job: impl FnOnce() + Send + 'static) -> SchedId {
        self.run_at(Instant::now() + Duration::from_millis(ms), job)
    }

    /// Cancel a pending job. Returns false when it already ran.
    pub fn cancel(&self, id: SchedId) -> bool {
        let mut inner = self.inner.lock();
        let key = inner
            .queue
            .keys()
            .find(|(_, jid)| *jid == id.0)
            .copied();
        match key {
            Some(key) => {
                inner.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Time until the next pending job, if any.
    pub fn time_to_next(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .queue
            .keys()
            .next()
            .map(|(when, _)| when.saturating_duration_since(Instant::now()))
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    async fn run(self: Arc<Self>) {
        loop {
            let due: Vec<Job> = {
                let inner = &mut *self.inner.lock();
                let now = Instant::now();
                let ready: Vec<(Instant, u64)> = inner
                    .queue
                    .keys()
                    .take_while(|(when, _)| *when <= now)
                    .copied()
                    .collect();
                ready
                    .into_iter()
                    .filter_map(|key| inner.queue.remove(&key))
                    .collect()
            };
            for job in due {
                job();
            }

            let sleep_for = self
                .time_to_next()
                .unwrap_or(Duration::from_secs(3600));
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.poke.notified() => {}
                _ = self.stop.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_jobs_in_deadline_order() {
        let sched = Scheduler::new();
        sched.start();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        sched.run_after(40, move || o.lock().push("late"));
        let o = Arc::clone(&order);
        sched.run_after(10, move || o.lock().push("early"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn cancel_prevents_execution() {
        let sched = Scheduler::new();
        sched.start();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let id = sched.run_after(30, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sched.cancel(id));
        assert!(!sched.cancel(id), "second cancel is a no-op");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn time_to_next_reflects_queue() {
        let sched = Scheduler::new();
        assert!(sched.time_to_next().is_none());
        sched.run_after(500, || {});
        let next = sched.time_to_next().unwrap();
        assert!(next <= Duration::from_millis(500));
        assert_eq!(sched.pending(), 1);
    }
}
