//! Sensor requests and per-sensor arbitration.
//!
//! Each sensor carries a [`RequestMultiplexer`] of the outstanding
//! per-nanoapp requests; the platform only ever sees the maximal request,
//! and only on change edges.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use super::event::{EventType, InstanceId, event_type};
use super::multiplexer::{MergeableRequest, RequestMultiplexer};
use super::time::Nanoseconds;

/// Sampling mode, ordered by increasing priority.
///
/// Passive modes piggyback on another client's sampling; active modes
/// demand it. Continuous outranks one-shot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum SensorMode {
    #[default]
    Off,
    PassiveOneShot,
    PassiveContinuous,
    ActiveOneShot,
    ActiveContinuous,
}

impl SensorMode {
    pub fn is_active(self) -> bool {
        matches!(self, SensorMode::ActiveOneShot | SensorMode::ActiveContinuous)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SensorType {
    Accelerometer,
    InstantMotion,
    StationaryDetect,
    Gyroscope,
    GeomagneticField,
    Pressure,
    Light,
    Proximity,
}

impl SensorType {
    pub fn name(self) -> &'static str {
        match self {
            SensorType::Accelerometer => "Accelerometer",
            SensorType::InstantMotion => "Instant Motion",
            SensorType::StationaryDetect => "Stationary Detect",
            SensorType::Gyroscope => "Gyroscope",
            SensorType::GeomagneticField => "Geomagnetic Field",
            SensorType::Pressure => "Pressure",
            SensorType::Light => "Light",
            SensorType::Proximity => "Proximity",
        }
    }

    fn offset(self) -> u16 {
        match self {
            SensorType::Accelerometer => 1,
            SensorType::InstantMotion => 2,
            SensorType::StationaryDetect => 3,
            SensorType::Gyroscope => 4,
            SensorType::GeomagneticField => 5,
            SensorType::Pressure => 6,
            SensorType::Light => 7,
            SensorType::Proximity => 8,
        }
    }

    /// Event type carrying this sensor's samples.
    pub fn sample_event_type(self) -> EventType {
        EventType(event_type::SENSOR_DATA_BASE + self.offset())
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One client's sampling request.
///
/// A zero interval or latency means "unconstrained": the default request
/// is the identity of [`MergeableRequest::merge`], so zeros defer to any
/// bounded peer constraint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SensorRequest {
    pub mode: SensorMode,
    pub interval: Nanoseconds,
    pub latency: Nanoseconds,
}

impl SensorRequest {
    pub fn new(mode: SensorMode, interval: Nanoseconds, latency: Nanoseconds) -> Self {
        Self {
            mode,
            interval,
            latency,
        }
    }

    pub fn is_off(&self) -> bool {
        self.mode == SensorMode::Off
    }
}

fn merge_bound(a: Nanoseconds, b: Nanoseconds) -> Nanoseconds {
    match (a.is_zero(), b.is_zero()) {
        (true, _) => b,
        (_, true) => a,
        _ => a.min(b),
    }
}

impl MergeableRequest for SensorRequest {
    fn is_equivalent_to(&self, other: &Self) -> bool {
        self == other
    }

    fn merge(&self, other: &Self) -> Self {
        SensorRequest {
            mode: self.mode.max(other.mode),
            interval: merge_bound(self.interval, other.interval),
            latency: merge_bound(self.latency, other.latency),
        }
    }
}

/// Platform seam for one physical sensor.
pub trait PlatformSensor: Send {
    /// Apply the merged request; returns false on failure.
    fn configure(&mut self, request: &SensorRequest) -> bool;
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("no such sensor: {0:?}")]
    UnknownSensor(SensorType),
    #[error("platform rejected {sensor_type} configuration")]
    PlatformFailure { sensor_type: SensorType },
}

struct Sensor {
    sensor_type: SensorType,
    multiplexer: RequestMultiplexer<SensorRequest>,
    /// Owner of the request at the same index in the multiplexer.
    owners: Vec<InstanceId>,
    platform: Box<dyn PlatformSensor>,
}

impl Sensor {
    /// Push the maximal to the platform, rolling back `undo` on rejection.
    fn apply(
        &mut self,
        changed: bool,
        undo: impl FnOnce(&mut RequestMultiplexer<SensorRequest>, &mut Vec<InstanceId>),
    ) -> Result<(), SensorError> {
        if !changed {
            return Ok(());
        }
        let maximal = *self.multiplexer.maximal();
        if self.platform.configure(&maximal) {
            debug!(sensor = %self.sensor_type, ?maximal, "sensor reconfigured");
            Ok(())
        } else {
            undo(&mut self.multiplexer, &mut self.owners);
            Err(SensorError::PlatformFailure {
                sensor_type: self.sensor_type,
            })
        }
    }
}

/// Arbitrates all nanoapp sensor requests.
pub struct SensorRequestManager {
    sensors: Vec<Sensor>,
}

impl SensorRequestManager {
    pub fn new(platforms: Vec<(SensorType, Box<dyn PlatformSensor>)>) -> Self {
        let sensors = platforms
            .into_iter()
            .map(|(sensor_type, platform)| Sensor {
                sensor_type,
                multiplexer: RequestMultiplexer::new(),
                owners: Vec::new(),
                platform,
            })
            .collect();
        Self { sensors }
    }

    /// Set (or clear, with an Off request) one nanoapp's request for a
    /// sensor. The platform is reconfigured only when the maximal moved.
    pub fn set_request(
        &mut self,
        instance_id: InstanceId,
        sensor_type: SensorType,
        request: SensorRequest,
    ) -> Result<(), SensorError> {
        let sensor = self
            .sensors
            .iter_mut()
            .find(|s| s.sensor_type == sensor_type)
            .ok_or(SensorError::UnknownSensor(sensor_type))?;

        let existing = sensor.owners.iter().position(|&owner| owner == instance_id);
        match (existing, request.is_off()) {
            (None, true) => Ok(()),
            (None, false) => {
                sensor.owners.push(instance_id);
                let changed = sensor.multiplexer.add(request);
                sensor.apply(changed, |mux, owners| {
                    let index = owners.len() - 1;
                    mux.remove(index);
                    owners.remove(index);
                })
            }
            (Some(index), true) => {
                let previous = sensor.multiplexer.requests()[index];
                sensor.owners.remove(index);
                let changed = sensor.multiplexer.remove(index);
                sensor.apply(changed, move |mux, owners| {
                    // Position within the list is immaterial (the fold is
                    // commutative); only the owner/request pairing matters.
                    owners.push(instance_id);
                    mux.add(previous);
                })
            }
            (Some(index), false) => {
                let previous = sensor.multiplexer.requests()[index];
                let changed = sensor.multiplexer.update(index, request);
                sensor.apply(changed, move |mux, _owners| {
                    mux.update(index, previous);
                })
            }
        }
    }

    /// Drop every request owned by `instance_id`; used at nanoapp unload.
    pub fn remove_all_requests_for(&mut self, instance_id: InstanceId) {
        for sensor in &mut self.sensors {
            while let Some(index) = sensor
                .owners
                .iter()
                .position(|&owner| owner == instance_id)
            {
                sensor.owners.remove(index);
                let changed = sensor.multiplexer.remove(index);
                if changed {
                    let maximal = *sensor.multiplexer.maximal();
                    if !sensor.platform.configure(&maximal) {
                        debug!(sensor = %sensor.sensor_type, "platform rejected teardown reconfigure");
                    }
                }
            }
        }
    }

    /// The request currently applied to a sensor's platform.
    pub fn maximal_request(&self, sensor_type: SensorType) -> Option<SensorRequest> {
        self.sensors
            .iter()
            .find(|s| s.sensor_type == sensor_type)
            .map(|s| *s.multiplexer.maximal())
    }
}
