use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::variant::DeviceVariant;

/// Speed unit the console is configured for.
///
/// The driver never converts: the device reports speed in whatever unit its
/// console uses and commands are written in the same unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpeedUnit {
    /// Kilometers per hour
    #[default]
    Kilometers,
    /// Miles per hour
    Miles,
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kilometers => write!(f, "km/h"),
            Self::Miles => write!(f, "mph"),
        }
    }
}

/// Lifecycle phase of the connection to the treadmill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionPhase {
    /// No link to the device
    #[default]
    Disconnected,
    /// Link requested, waiting for the controller
    Connecting,
    /// Communication service found
    ServiceDiscovered,
    /// Write and notify characteristics resolved and subscribed
    CharacteristicsReady,
    /// Init sequence in flight
    Initializing,
    /// Polling and accepting commands
    Ready,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovered => write!(f, "Service Discovered"),
            Self::CharacteristicsReady => write!(f, "Characteristics Ready"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// User settings consumed by the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Body weight in kilograms, used for calorie and power estimates
    pub weight_kg: f64,
    /// Console speed unit
    pub unit: SpeedUnit,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            weight_kg: 75.0,
            unit: SpeedUnit::Kilometers,
        }
    }
}

/// Protocol timing constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTiming {
    /// Poll tick period in milliseconds
    pub poll_interval_ms: u64,
    /// Pause after every init frame in milliseconds
    pub init_step_delay_ms: u64,
    /// Cap on a response wait in milliseconds
    pub response_timeout_ms: u64,
}

impl ProtocolTiming {
    /// Poll tick period
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pause after every init frame
    #[must_use]
    pub const fn init_step_delay(&self) -> Duration {
        Duration::from_millis(self.init_step_delay_ms)
    }

    /// Cap on a response wait
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            init_step_delay_ms: 400,
            response_timeout_ms: 300,
        }
    }
}

/// Driver configuration, fixed for the lifetime of one driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Firmware dialect spoken by the device
    pub variant: DeviceVariant,
    /// User settings
    pub settings: UserSettings,
    /// Protocol timing
    pub timing: ProtocolTiming,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_timing_defaults() {
        let timing = ProtocolTiming::default();

        assert_eq!(timing.poll_interval(), Duration::from_millis(200));
        assert_eq!(timing.init_step_delay(), Duration::from_millis(400));
        assert_eq!(timing.response_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_driver_config_default() {
        let config = DriverConfig::default();
        assert_eq!(config.variant, DeviceVariant::Generic);
        assert!((config.settings.weight_kg - 75.0).abs() < f64::EPSILON);
        assert_eq!(config.settings.unit, SpeedUnit::Kilometers);
    }

    #[test]
    fn test_display() {
        assert_eq!(SpeedUnit::Miles.to_string(), "mph");
        assert_eq!(ConnectionPhase::Ready.to_string(), "Ready");
        assert_eq!(ConnectionPhase::default(), ConnectionPhase::Disconnected);
    }
}
