use std::sync::Arc;

use async_trait::async_trait;

use xb_frame::{ControlOp, Frame, FormatMask};

use crate::channel::Channel;
use crate::error::{CoreError, CoreResult};
use crate::state::Core;

/// Transport driver vtable.
///
/// Inbound frames are pushed by the driver through [`Channel::queue_frame`];
/// the remaining operations are pulled through this trait. `fixup` is called
/// after a masquerade so the driver can repoint its private state at the
/// surviving channel object.
#[async_trait]
pub trait ChannelTech: Send + Sync {
    /// Tech prefix, e.g. `"Null"` in `Null/whatever-1`.
    fn tech_type(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Codec capability bitmask.
    fn capabilities(&self) -> FormatMask;

    /// Allocate a new outbound channel for `data` (driver-specific address).
    async fn request(
        &self,
        core: &Arc<Core>,
        formats: FormatMask,
        data: &str,
    ) -> CoreResult<Arc<Channel>>;

    /// Start outbound signalling toward `dest`.
    async fn call(&self, chan: &Arc<Channel>, dest: &str, timeout_ms: u64) -> CoreResult<()>;

    async fn hangup(&self, chan: &Arc<Channel>) -> CoreResult<()>;

    async fn answer(&self, chan: &Arc<Channel>) -> CoreResult<()>;

    /// Emit one frame toward the wire.
    async fn write(&self, chan: &Arc<Channel>, frame: &Frame) -> CoreResult<()>;

    async fn indicate(&self, chan: &Arc<Channel>, condition: ControlOp) -> CoreResult<()> {
        let _ = (chan, condition);
        Err(CoreError::NotSupported("indicate"))
    }

    async fn fixup(&self, old: &Arc<Channel>, new: &Arc<Channel>) -> CoreResult<()> {
        let _ = (old, new);
        Ok(())
    }

    async fn send_digit(&self, chan: &Arc<Channel>, digit: char) -> CoreResult<()> {
        let _ = (chan, digit);
        Err(CoreError::NotSupported("send_digit"))
    }

    async fn send_text(&self, chan: &Arc<Channel>, text: &str) -> CoreResult<()> {
        let _ = (chan, text);
        Err(CoreError::NotSupported("send_text"))
    }

    /// Native bridge attempt; `NotSupported` falls back to the generic
    /// frame-forwarding bridge.
    async fn bridge(&self, a: &Arc<Channel>, b: &Arc<Channel>) -> CoreResult<()> {
        let _ = (a, b);
        Err(CoreError::NotSupported("bridge"))
    }

    async fn setoption(&self, chan: &Arc<Channel>, option: &str, value: &str) -> CoreResult<()> {
        let _ = (chan, option, value);
        Err(CoreError::NotSupported("setoption"))
    }
}
