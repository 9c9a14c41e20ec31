use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::Channel;

/// What an application hands back to the interpreter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppReturn {
    /// Continue at the next priority.
    Ok,
    /// A collected digit escapes the current extension.
    Digit(char),
    /// Jump to the `h` extension without hanging up the channel.
    KeepAlive,
    /// Error or hangup; the interpreter unwinds.
    Failure,
}

/// A named callable registered in the application registry and invoked by
/// the dialplan interpreter. Arguments arrive already substituted and split.
#[async_trait]
pub trait Application: Send + Sync {
    fn name(&self) -> &str;

    fn synopsis(&self) -> &str {
        ""
    }

    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn;
}
