#![forbid(unsafe_code)]

//! Always-on event-loop runtime hosting small application modules
//! (nanoapps) on a low-power hub.
//!
//! A single dedicated loop thread distributes typed, reference-counted
//! events to per-nanoapp inboxes and delivers them round-robin. Timers,
//! sensor arbitration, wifi scan monitoring, and host communication all
//! feed that one loop; external threads only ever post into its bounded
//! inbound queue.

pub mod config;
pub mod core;
pub mod error;
pub mod host;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types an embedder touches to bring a hub up.
pub use crate::config::{Config, HostConfig, HubInfoConfig, Limits};
pub use crate::core::{
    AppId, Cookie, EventData, EventLoop, EventType, FreeCallback, InstanceId, LifecycleError,
    LoopHandle, Nanoapp, NanoappHooks, Nanoseconds, Platform, PlatformSensor, PlatformWifi,
    RuntimeContext, SensorMode, SensorRequest, SensorType, SystemTimer, TimerId, event_type,
};
pub use crate::host::{ClientCallbacks, HostError, HostLink, LinkSlot, ReconnectPolicy, SocketClient};
