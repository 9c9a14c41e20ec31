//! Null channel tech: a loopback driver with no wire behind it.
//!
//! Written frames are collected (and optionally echoed to the peer's read
//! queue), signalling succeeds immediately. It backs local test calls the
//! way a real transport backs production ones, so the rest of the core is
//! exercised through the same code paths either way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use xb_frame::{AudioFormat, ControlOp, Frame, FormatMask};

use crate::channel::Channel;
use crate::error::CoreResult;
use crate::state::Core;
use crate::tech::ChannelTech;

pub struct NullTech {
    seq: AtomicU64,
    /// Frames written to any Null channel, newest last.
    written: Mutex<Vec<(String, Frame)>>,
}

impl NullTech {
    pub fn new() -> Arc<NullTech> {
        Arc::new(NullTech {
            seq: AtomicU64::new(1),
            written: Mutex::new(Vec::new()),
        })
    }

    /// Allocate an inbound-style channel directly (tests and local calls).
    pub fn new_channel(self: &Arc<Self>, core: &Arc<Core>, data: &str) -> CoreResult<Arc<Channel>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        Channel::alloc(
            core,
            Arc::clone(self) as Arc<dyn ChannelTech>,
            format!("Null/{data}-{seq:04x}"),
            FormatMask::of(AudioFormat::Slin),
        )
    }

    /// Everything written so far to the named channel.
    pub fn written_to(&self, chan_name: &str) -> Vec<Frame> {
        self.written
            .lock()
            .iter()
            .filter(|(name, _)| name == chan_name)
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }
}

#[async_trait]
impl ChannelTech for NullTech {
    fn tech_type(&self) -> &'static str {
        "Null"
    }

    fn description(&self) -> &'static str {
        "Null channel driver (loopback)"
    }

    fn capabilities(&self) -> FormatMask {
        FormatMask::of(AudioFormat::Slin)
    }

    async fn request(
        &self,
        core: &Arc<Core>,
        _formats: FormatMask,
        data: &str,
    ) -> CoreResult<Arc<Channel>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let this = core
            .techs
            .find("Null")
            .ok_or(crate::CoreError::NotFound("channel tech"))?;
        Channel::alloc(
            core,
            this,
            format!("Null/{data}-{seq:04x}"),
            FormatMask::of(AudioFormat::Slin),
        )
    }

    async fn call(&self, chan: &Arc<Channel>, _dest: &str, _timeout_ms: u64) -> CoreResult<()> {
        chan.set_state(crate::channel::ChannelState::Ringing);
        Ok(())
    }

    async fn hangup(&self, _chan: &Arc<Channel>) -> CoreResult<()> {
        Ok(())
    }

    async fn answer(&self, _chan: &Arc<Channel>) -> CoreResult<()> {
        Ok(())
    }

    async fn write(&self, chan: &Arc<Channel>, frame: &Frame) -> CoreResult<()> {
        self.written.lock().push((chan.name(), frame.clone()));
        Ok(())
    }

    async fn indicate(&self, chan: &Arc<Channel>, condition: ControlOp) -> CoreResult<()> {
        self.written
            .lock()
            .push((chan.name(), Frame::control(condition, "null")));
        Ok(())
    }

    async fn send_digit(&self, chan: &Arc<Channel>, digit: char) -> CoreResult<()> {
        self.written
            .lock()
            .push((chan.name(), Frame::dtmf(digit, "null")));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::softhangup;
    use crate::state::CoreOptions;
    use bytes::Bytes;
    use xb_frame::FrameKind;

    fn setup() -> (Arc<Core>, Arc<NullTech>) {
        let core = Core::start(CoreOptions::default());
        let tech = NullTech::new();
        core.techs.add("Null", Arc::clone(&tech) as Arc<dyn ChannelTech>);
        (core, tech)
    }

    #[tokio::test]
    async fn frames_roundtrip_through_the_queue() {
        let (core, tech) = setup();
        let chan = tech.new_channel(&core, "t1").unwrap();

        let f = Frame::voice(AudioFormat::Slin, Bytes::from_static(&[1, 2, 3, 4]), 2, "test");
        chan.queue_frame(f.clone());
        let got = chan.read().await.unwrap();
        assert_eq!(got, f, "same type, subclass, samples and payload");

        chan.queue_frame(Frame::dtmf('5', "test"));
        match chan.read().await.unwrap().kind {
            FrameKind::Dtmf(d) => assert_eq!(d, '5'),
            other => panic!("unexpected {other:?}"),
        }
        chan.hangup().await.unwrap();
    }

    #[tokio::test]
    async fn softhangup_wakes_reader() {
        let (core, tech) = setup();
        let chan = tech.new_channel(&core, "t2").unwrap();

        let reader = Arc::clone(&chan);
        let task = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        chan.softhangup(softhangup::EXPLICIT);

        let frame = task.await.unwrap().unwrap();
        assert!(frame.is_hangup());
        chan.hangup().await.unwrap();
    }

    #[tokio::test]
    async fn hangup_finalises_cdr_and_deregisters() {
        let (core, tech) = setup();
        let chan = tech.new_channel(&core, "t3").unwrap();
        let cdr = chan.ensure_cdr();
        cdr.start();
        assert_eq!(core.channel_count(), 1);

        chan.hangup().await.unwrap();
        assert_eq!(core.channel_count(), 0);
        assert_eq!(core.active_calls(), 0);
        // Detached to the engine; the poster stamps POSTED asynchronously.
        for _ in 0..50 {
            if cdr.is_posted() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(cdr.is_posted());
        assert!(cdr.snapshot().end.is_some());
    }

    #[tokio::test]
    async fn call_limit_blocks_allocation() {
        let core = Core::start(CoreOptions {
            max_calls: Some(1),
            ..CoreOptions::default()
        });
        let tech = NullTech::new();
        core.techs.add("Null", Arc::clone(&tech) as Arc<dyn ChannelTech>);

        let first = tech.new_channel(&core, "one").unwrap();
        let second = tech.new_channel(&core, "two");
        assert!(matches!(second, Err(crate::CoreError::CallLimit)));
        first.hangup().await.unwrap();
        assert!(tech.new_channel(&core, "three").is_ok());
    }

    #[tokio::test]
    async fn masquerade_swaps_identity_at_read_safe_point() {
        let (core, tech) = setup();
        let original = tech.new_channel(&core, "orig").unwrap();
        let clone = tech.new_channel(&core, "clone").unwrap();
        let clone_name = clone.name();

        original.masquerade(Arc::clone(&clone));
        original.queue_frame(Frame::null("test"));
        let _ = original.read().await.unwrap();

        assert_eq!(original.name(), clone_name, "identity moved");
        assert!(clone.name().ends_with("<ZOMBIE>"));
        assert!(clone.is_softhangup());

        original.hangup().await.unwrap();
        clone.hangup().await.unwrap();
    }

    #[tokio::test]
    async fn whentohangup_injects_timeout_bit() {
        let (core, tech) = setup();
        let chan = tech.new_channel(&core, "t4").unwrap();
        chan.set_whentohangup(1);
        // Fires one second later via the scheduler.
        for _ in 0..150 {
            if chan.softhangup_bits() & softhangup::TIMEOUT != 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(chan.softhangup_bits() & softhangup::TIMEOUT != 0);
        chan.hangup().await.unwrap();
    }

    #[tokio::test]
    async fn generic_bridge_forwards_until_hangup() {
        let (core, tech) = setup();
        let a = tech.new_channel(&core, "a").unwrap();
        let b = tech.new_channel(&core, "b").unwrap();
        let b_name = b.name();

        let (a2, b2) = (Arc::clone(&a), Arc::clone(&b));
        let bridge = tokio::spawn(async move { crate::bridge_channels(&a2, &b2).await });

        a.queue_frame(Frame::voice(
            AudioFormat::Slin,
            Bytes::from_static(&[9, 9]),
            1,
            "test",
        ));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        a.queue_hangup();

        let outcome = bridge.await.unwrap().unwrap();
        assert_eq!(outcome, crate::BridgeOutcome::CallerHangup);

        let forwarded = tech.written_to(&b_name);
        assert!(forwarded.iter().any(|f| f.is_voice()), "voice reached peer");

        b.hangup().await.unwrap();
        a.hangup().await.unwrap();
    }
}
