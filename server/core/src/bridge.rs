//! Channel bridging.
//!
//! Native bridging is offered to the tech when both legs share a driver;
//! otherwise the generic bridge forwards frames between the two read sides
//! and write sides until one leg hangs up.

use std::sync::Arc;

use tracing::debug;

use xb_frame::FrameKind;

use crate::channel::Channel;
use crate::error::{CoreError, CoreResult};

/// Which leg ended the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// First channel hung up.
    CallerHangup,
    /// Second channel hung up.
    CalleeHangup,
}

/// Bridge two channels until one side hangs up.
pub async fn bridge_channels(a: &Arc<Channel>, b: &Arc<Channel>) -> CoreResult<BridgeOutcome> {
    // Native attempt first when the techs match.
    let ta = a.tech();
    let tb = b.tech();
    if ta.tech_type() == tb.tech_type() {
        match ta.bridge(a, b).await {
            Ok(()) => {
                debug!(a = %a.name(), b = %b.name(), "native bridge complete");
                return Ok(if a.check_hangup() {
                    BridgeOutcome::CallerHangup
                } else {
                    BridgeOutcome::CalleeHangup
                });
            }
            Err(CoreError::NotSupported(_)) => {}
            Err(e) => return Err(e),
        }
    }

    debug!(a = %a.name(), b = %b.name(), "generic bridge");
    loop {
        if a.check_hangup() {
            return Ok(BridgeOutcome::CallerHangup);
        }
        if b.check_hangup() {
            return Ok(BridgeOutcome::CalleeHangup);
        }

        tokio::select! {
            frame = a.read() => {
                let frame = frame?;
                if forward(&frame, b).await? {
                    return Ok(BridgeOutcome::CallerHangup);
                }
            }
            frame = b.read() => {
                let frame = frame?;
                if forward(&frame, a).await? {
                    return Ok(BridgeOutcome::CalleeHangup);
                }
            }
        }
    }
}

/// Forward one frame to the peer; true when the source leg is done.
async fn forward(frame: &xb_frame::Frame, to: &Arc<Channel>) -> CoreResult<bool> {
    match &frame.kind {
        FrameKind::Hangup => Ok(true),
        FrameKind::Control(op) => {
            if frame.is_hangup() {
                return Ok(true);
            }
            to.indicate(*op).await?;
            Ok(false)
        }
        FrameKind::Null => Ok(false),
        _ => {
            to.write(frame.clone()).await?;
            Ok(false)
        }
    }
}
