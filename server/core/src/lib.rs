//! Channel runtime core.
//!
//! Turns a pool of transport-driven I/O sources into uniform [`Channel`]
//! objects: typed frame read/write with transparent format translation,
//! soft-hangup semantics, bridging, masquerading, generators, a scheduler
//! and the manager event bus. Transport drivers plug in through the
//! [`ChannelTech`] vtable; dialplan applications through [`Application`].

mod app;
mod bridge;
mod channel;
mod error;
mod events;
mod generator;
mod sched;
mod state;
mod tech;
mod translate;

pub mod devstate;
pub mod tech_null;

pub use app::{AppReturn, Application};
pub use bridge::{bridge_channels, BridgeOutcome};
pub use channel::{softhangup, CallerId, ChanState, Channel, ChannelState};
pub use devstate::{DeviceState, DeviceStateProvider};
pub use error::{CoreError, CoreResult};
pub use events::{CdrManagerBackend, ManagerBus, ManagerEvent};
pub use generator::Generator;
pub use sched::{SchedId, Scheduler};
pub use state::{Core, CoreOptions};
pub use tech::ChannelTech;
pub use translate::{Translator, TranslatorRegistry};
