//! Compiled-in defaults. Grouped by subsystem, one block per concern, each
//! constant documented with its unit and rationale — mirrored on the
//! environment variable table that can override most of these at boot.

// ============================================================================
// Supervisor Loop Timing
// ============================================================================

/// Control tick period (s). Bounded to [1, 300] by `TICK_INTERVAL_S`.
pub const TICK_INTERVAL_S: u64 = 30;
/// Sensor sampling period (s). Bounded to [1, 60] by `SAMPLE_INTERVAL_S`.
pub const SAMPLE_INTERVAL_S: u64 = 5;
/// Per-sample sensor read timeout (ms).
pub const SENSOR_TIMEOUT_MS: u64 = 500;
/// Maximum time a single tick may spend before it is considered stuck.
pub const TICK_BUDGET_S: u64 = 5;
/// Time allotted to drain the notify queue and force relays off on shutdown.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 1_500;
/// A primary/backup reading older than this is treated as stale.
pub const STALENESS_LIMIT_S: u64 = 30;
/// Consecutive sensor failures before an alert is raised.
pub const SENSOR_ALERT_THRESHOLD: u32 = 3;

// ============================================================================
// Control Engine — Hysteresis Bands
// ============================================================================

/// Temperature hysteresis band width (C).
pub const HYSTERESIS_TEMP_C: f64 = 1.0;
/// Relative humidity hysteresis band width (percentage points).
pub const HYSTERESIS_RH_PCT: f64 = 3.0;
/// CO2 hysteresis band width (ppm).
pub const HYSTERESIS_CO2_PPM: f64 = 100.0;

// ============================================================================
// Control Engine — Condensation Guard
// ============================================================================

/// Humidity at or above this forces FAN on / MIST off unconditionally (%).
pub const CONDENSATION_RH_CAP: f64 = 98.0;
/// Dew-point heuristic margin (C): guard trips when
/// `temp_c - rh_pct / 5.0 <= CONDENSATION_DELTA_C`.
pub const CONDENSATION_DELTA_C: f64 = 2.0;

// ============================================================================
// Control Engine — Duty Cycle Caps
// ============================================================================

/// Rolling duty-cycle accounting window (s).
pub const DUTY_WINDOW_S: u64 = 3_600;
/// Per-relay on-time caps within the window (s). 0 means "no cap".
pub const DUTY_CAP_S_FAN: u64 = 0;
pub const DUTY_CAP_S_MIST: u64 = 600;
pub const DUTY_CAP_S_LIGHT: u64 = 0;
pub const DUTY_CAP_S_HEATER: u64 = 1_800;

// ============================================================================
// Control Engine — Light Verification
// ============================================================================

/// Delay after commanding LIGHT on before verifying it actually turned on (s).
pub const LIGHT_VERIFY_DELAY_S: u64 = 5;
/// Minimum raw ADC reading that counts as "light is on".
pub const LIGHT_ON_THRESHOLD_RAW: u16 = 200;

// ============================================================================
// Stage Engine
// ============================================================================

/// Global default compliance ratio required to auto-advance (%).
pub const COMPLIANCE_THRESHOLD_PCT: f64 = 70.0;

// ============================================================================
// BLE Peripheral
// ============================================================================

/// Max pending notifications held in the priority queue.
pub const BLE_QUEUE_MAX_SIZE: usize = 16;
/// Default backpressure policy name.
pub const BLE_BACKPRESSURE_POLICY: &str = "priority";
/// How long a CRITICAL enqueue waits for space before counting as a drop (ms).
pub const BLE_QUEUE_PUT_TIMEOUT_MS: u64 = 10;
/// Per-notification publish timeout (ms).
pub const BLE_PUBLISH_TIMEOUT_MS: u64 = 2_000;
/// Publishes slower than this are logged with their latency (ms).
pub const BLE_LOG_SLOW_PUBLISH_MS: u64 = 250;

// ============================================================================
// Persistence
// ============================================================================

/// Default sled database path.
pub const DB_PATH: &str = "./mushpi-data";
/// Rolling retention window for append-only streams (days).
pub const RETENTION_DAYS: u32 = 30;

// ============================================================================
// Actuators
// ============================================================================

/// Relay line polarity: true means a logical ON writes a low line level.
pub const RELAYS_ACTIVE_LOW: bool = true;

/// Per-species, per-stage threshold defaults, keyed by array index matching
/// `Species::to_wire()` then `Stage::to_wire()`. Operators can override any
/// profile at runtime; these are only the out-of-the-box values.
pub mod species_profiles {
    use crate::types::{LightMode, ThresholdProfile};

    const fn profile(
        temp_min_c: f64,
        temp_max_c: f64,
        rh_min_pct: f64,
        co2_max_ppm: u16,
        light_mode: LightMode,
        on_minutes: u16,
        off_minutes: u16,
        expected_days: u16,
    ) -> ThresholdProfile {
        ThresholdProfile {
            temp_min_c,
            temp_max_c,
            rh_min_pct,
            co2_max_ppm,
            light_mode,
            on_minutes,
            off_minutes,
            expected_days,
            compliance_threshold_pct: None,
        }
    }

    // --- Oyster ---
    pub const OYSTER_INCUBATION: ThresholdProfile =
        profile(21.0, 27.0, 85.0, 5_000, LightMode::Off, 0, 0, 14);
    pub const OYSTER_PINNING: ThresholdProfile =
        profile(15.0, 21.0, 90.0, 800, LightMode::Cycle, 720, 720, 4);
    pub const OYSTER_FRUITING: ThresholdProfile =
        profile(15.0, 24.0, 85.0, 1_000, LightMode::Cycle, 720, 720, 7);

    // --- Shiitake ---
    pub const SHIITAKE_INCUBATION: ThresholdProfile =
        profile(21.0, 26.0, 80.0, 10_000, LightMode::Off, 0, 0, 30);
    pub const SHIITAKE_PINNING: ThresholdProfile =
        profile(12.0, 18.0, 90.0, 1_000, LightMode::Cycle, 720, 720, 5);
    pub const SHIITAKE_FRUITING: ThresholdProfile =
        profile(16.0, 21.0, 85.0, 1_500, LightMode::Cycle, 720, 720, 10);

    // --- Lion's Mane ---
    pub const LIONS_MANE_INCUBATION: ThresholdProfile =
        profile(21.0, 24.0, 85.0, 5_000, LightMode::Off, 0, 0, 21);
    pub const LIONS_MANE_PINNING: ThresholdProfile =
        profile(18.0, 22.0, 90.0, 800, LightMode::Cycle, 720, 720, 3);
    pub const LIONS_MANE_FRUITING: ThresholdProfile =
        profile(16.0, 21.0, 85.0, 1_000, LightMode::Cycle, 720, 720, 10);

    /// Look up the compiled-in default for a (species, stage) pair.
    pub fn default_for(species: crate::types::Species, stage: crate::types::Stage) -> ThresholdProfile {
        use crate::types::{Species, Stage};
        match (species, stage) {
            (Species::Oyster, Stage::Incubation) => OYSTER_INCUBATION,
            (Species::Oyster, Stage::Pinning) => OYSTER_PINNING,
            (Species::Oyster, Stage::Fruiting) => OYSTER_FRUITING,
            (Species::Shiitake, Stage::Incubation) => SHIITAKE_INCUBATION,
            (Species::Shiitake, Stage::Pinning) => SHIITAKE_PINNING,
            (Species::Shiitake, Stage::Fruiting) => SHIITAKE_FRUITING,
            (Species::LionsMane, Stage::Incubation) => LIONS_MANE_INCUBATION,
            (Species::LionsMane, Stage::Pinning) => LIONS_MANE_PINNING,
            (Species::LionsMane, Stage::Fruiting) => LIONS_MANE_FRUITING,
        }
    }
}
