use thiserror::Error;

use crate::config::ConfigError;
use crate::core::event_loop::LifecycleError;
use crate::core::inbound::PostError;
use crate::core::sensor::SensorError;
use crate::core::timer::TimerError;
use crate::core::wifi::WifiError;
use crate::host::HostError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient pressure or outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error: a thin wrapper over the canonical
/// subsystem errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Post(#[from] PostError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Wifi(#[from] WifiError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            // Queue and pool pressure clears as the loop drains.
            Error::Post(PostError::QueueFull { .. }) => Transience::Retryable,
            Error::Post(PostError::PoolExhausted(_)) => Transience::Retryable,
            Error::Post(_) => Transience::Permanent,
            Error::Lifecycle(_) => Transience::Permanent,
            Error::Timer(TimerError::PoolFull { .. }) => Transience::Retryable,
            Error::Sensor(SensorError::PlatformFailure { .. }) => Transience::Unknown,
            Error::Sensor(_) => Transience::Permanent,
            Error::Wifi(WifiError::TransitionQueueFull { .. }) => Transience::Retryable,
            Error::Wifi(_) => Transience::Unknown,
            Error::Host(HostError::NotConnected) => Transience::Retryable,
            Error::Host(HostError::Io(_)) => Transience::Retryable,
            Error::Host(_) => Transience::Permanent,
            Error::Config(_) => Transience::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
