//! MushPi: single-chamber environmental controller for mushroom cultivation.
//!
//! ## Architecture
//!
//! - **Sensor Aggregator** (`sensors`): samples CO2/temperature/humidity/light.
//! - **Actuator Driver** (`actuators`): drives the fan/mist/light/heater relays.
//! - **Persistent Store** (`storage`): append-only history plus current-stage state.
//! - **Stage Engine** (`stage`): species/stage lifecycle and compliance tracking.
//! - **Control Engine** (`control`): hysteresis, duty caps, condensation guard,
//!   light verification.
//! - **Mode/Override Arbiter** (`arbiter`): automatic/manual/safety precedence.
//! - **BLE Peripheral** (`ble`): the six-characteristic GATT service.
//! - **Watchdog** (`watchdog`): per-subsystem health checks.
//! - **Supervisor** (`supervisor`): wires everything into the boot/tick/shutdown loop.

pub mod actuators;
pub mod arbiter;
pub mod ble;
pub mod config;
pub mod control;
pub mod error;
pub mod sensors;
pub mod stage;
pub mod storage;
pub mod supervisor;
pub mod types;
pub mod watchdog;

pub use config::MushPiConfig;
pub use supervisor::Supervisor;
