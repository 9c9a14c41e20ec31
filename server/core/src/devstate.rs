//! Device state: what a hint watcher ultimately observes.
//!
//! Transport drivers (or tests) register a [`DeviceStateProvider`] per tech
//! prefix. Devices without a provider are derived from any live channel
//! whose name starts with the device name.

use crate::channel::ChannelState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    NotInUse,
    InUse,
    Busy,
    Invalid,
    Unavailable,
    Ringing,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Unknown => "Unknown",
            DeviceState::NotInUse => "Not in use",
            DeviceState::InUse => "In use",
            DeviceState::Busy => "Busy",
            DeviceState::Invalid => "Invalid",
            DeviceState::Unavailable => "Unavailable",
            DeviceState::Ringing => "Ringing",
        }
    }
}

/// Per-tech device state source, keyed in the provider registry by the tech
/// prefix (the part of `Tech/resource` before the slash).
pub trait DeviceStateProvider: Send + Sync {
    fn state(&self, device: &str) -> DeviceState;
}

/// Fallback mapping from a live channel's state, used when no provider
/// covers the device.
pub fn state_from_channel(state: ChannelState) -> DeviceState {
    match state {
        ChannelState::Down => DeviceState::NotInUse,
        ChannelState::Reserved | ChannelState::OffHook | ChannelState::Dialing => {
            DeviceState::InUse
        }
        ChannelState::Ring | ChannelState::Ringing => DeviceState::Ringing,
        ChannelState::Up => DeviceState::InUse,
        ChannelState::Busy => DeviceState::Busy,
    }
}
