//! Runtime core: events, nanoapps, the event loop, timers, and request
//! arbitration.

pub mod collections;
pub mod context;
pub mod event;
pub mod event_loop;
pub mod inbound;
pub mod multiplexer;
pub mod nanoapp;
pub mod sensor;
pub mod time;
pub mod timer;
pub mod wifi;

pub use collections::{BoundedVec, CapacityExceeded, RingQueue, SortKey, SortedList};
pub use context::{Platform, RuntimeContext};
pub use event::{
    AppId, Event, EventData, EventKey, EventPool, EventType, FreeCallback, InstanceId,
    PoolExhausted, event_type,
};
pub use event_loop::{EventLoop, LifecycleError, LoopCommand, LoopHandle, LoopState, NanoappSummary};
pub use inbound::{EventSender, LoopShared, PostError};
pub use multiplexer::{MergeableRequest, RequestMultiplexer};
pub use nanoapp::{Nanoapp, NanoappHooks};
pub use sensor::{
    PlatformSensor, SensorError, SensorMode, SensorRequest, SensorRequestManager, SensorType,
};
pub use time::{ClockSource, MonotonicClock, Nanoseconds, SharedClock};
pub use timer::{Cookie, SystemTimer, ThreadSystemTimer, TimerError, TimerFired, TimerId, TimerPool};
pub use wifi::{AsyncErrorCode, PlatformWifi, ScanMonitorResult, WifiError, WifiScanManager};
