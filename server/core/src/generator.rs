//! Channel generators: periodic frame sources (mixer output, hold music).
//!
//! While a generator is active its task ticks every frame interval, asks the
//! generator for a frame and writes it down the channel. Deactivation and
//! hangup both stop the task.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use xb_frame::{FRAME_MS, SAMPLES_PER_FRAME};

use crate::channel::Channel;

pub trait Generator: Send + Sync {
    /// Produce the next frame, or `None` to skip this tick.
    fn generate(&self, chan: &Arc<Channel>, samples: usize) -> Option<xb_frame::Frame>;
}

pub(crate) struct GeneratorSlot {
    pub stop: CancellationToken,
}

impl GeneratorSlot {
    pub fn spawn(chan: Arc<Channel>, gen: Arc<dyn Generator>) -> GeneratorSlot {
        let stop = CancellationToken::new();
        let token = stop.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(FRAME_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if chan.check_hangup() {
                    break;
                }
                if let Some(frame) = gen.generate(&chan, SAMPLES_PER_FRAME) {
                    if chan.write(frame).await.is_err() {
                        break;
                    }
                }
            }
            debug!(chan = %chan.name(), "generator stopped");
        });
        GeneratorSlot { stop }
    }
}

impl Drop for GeneratorSlot {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
