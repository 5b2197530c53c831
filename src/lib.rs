#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Proformers
//!
//! A Rust driver for ProForm and NordicTrack treadmills that speak the iFit
//! Bluetooth Low Energy protocol.
//!
//! The consoles expose a single vendor service with one write and one
//! notify characteristic. Everything else is a byte-level dialogue captured
//! from working consoles:
//!
//! - **Frames**: 20-byte payloads, some preceded by a 4-byte announce frame
//! - **Init sequence**: a fixed list of frames replayed once per connection
//! - **Poll cycle**: keep-alive frames on a 200 ms rhythm, with speed and
//!   incline changes slotted in at one fixed position of the cycle
//! - **Telemetry**: speed, incline and power notifications, integrated into
//!   distance and calories on the host
//!
//! Two firmware dialects are supported, see [`DeviceVariant`].
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library moves the belt of physical exercise
//! equipment. Keep the console's own stop key and safety clip within reach.
//! Speed and incline requests are best-effort and can be dropped silently.
//!
//! ## Quick Start
//!
//! ```no_run
//! use proformers::{find_treadmill, DriverConfig, NullSink, ProformTreadmill, DEVICE_NAME_PREFIX};
//! use std::{sync::Arc, time::Duration};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = find_treadmill(DEVICE_NAME_PREFIX, Duration::from_secs(10)).await?;
//!     let driver = ProformTreadmill::start(Arc::new(transport), DriverConfig::default(), NullSink);
//!
//!     // Belt to 6 km/h, 2% incline
//!     driver.request_speed(6.0).await?;
//!     driver.request_incline(2.0).await?;
//!
//!     let metrics = driver.snapshot();
//!     println!("{:.2} km, {:.0} kcal", metrics.distance, metrics.calories);
//!
//!     driver.shutdown().await?;
//!     Ok(())
//! }
//! ```

/// btleplug transport
pub mod ble;
/// Outbound frame path with bounded response wait
pub mod channel;
/// Connection state machine and driver task
pub mod device;
/// Error types and handling
pub mod error;
/// Workout metrics accumulation
pub mod metrics;
/// Frame codec
pub mod protocol;
/// Per-connection protocol state
pub mod session;
/// Transport contract
pub mod transport;
/// Configuration and state types
pub mod types;
/// Firmware dialects and their frame tables
pub mod variant;

pub use ble::{find_treadmill, BleTransport};
pub use device::{DriverEvent, DriverHandle, ProformTreadmill};
pub use error::{ProformError, Result};
pub use metrics::{MetricsSink, MetricsSnapshot, NullSink};
pub use protocol::{decode, encode_incline, encode_speed, Rejection, TelemetryFrame};
pub use transport::{LinkState, Transport, TransportEvent};
pub use types::{ConnectionPhase, DriverConfig, ProtocolTiming, SpeedUnit, UserSettings};
pub use variant::DeviceVariant;

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// iFit vendor service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1533_1412_efde_1523_785f_eabc_d123);

/// Characteristic commands are written to
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_1534_1412_efde_1523_785f_eabc_d123);

/// Characteristic telemetry is notified on
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_1535_1412_efde_1523_785f_eabc_d123);

/// Advertised local name prefix of iFit treadmill consoles
pub const DEVICE_NAME_PREFIX: &str = "I_TL";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "00001533-1412-efde-1523-785feabcd123"
        );
        assert_eq!(
            WRITE_CHAR_UUID.to_string(),
            "00001534-1412-efde-1523-785feabcd123"
        );
        assert_eq!(
            NOTIFY_CHAR_UUID.to_string(),
            "00001535-1412-efde-1523-785feabcd123"
        );
    }
}
