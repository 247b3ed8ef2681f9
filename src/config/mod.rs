//! Runtime configuration.
//!
//! ## Loading order
//!
//! MushPi takes configuration exclusively from the process environment — no
//! TOML/YAML file is read. `MushPiConfig::from_env()` reads every recognized
//! key, falling back to the compiled-in default and clamping or warning on
//! out-of-range values (see `validation`).
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! config::init(MushPiConfig::from_env());
//! let hysteresis = config::get().hysteresis_temp_c;
//! ```

pub mod defaults;
pub mod validation;

use std::str::FromStr;
use std::sync::OnceLock;

use crate::types::{BackpressurePolicy, Relay};

static CONFIG: OnceLock<MushPiConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// Must be called exactly once before any call to `get()`.
pub fn init(config: MushPiConfig) {
    if CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Panics if `init()` has not been called. This is by design — a missing
/// config is a fatal startup error, not a recoverable condition.
pub fn get() -> &'static MushPiConfig {
    CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}

/// Logical-relay-to-GPIO-line assignment.
#[derive(Debug, Clone, Copy)]
pub struct RelayLines {
    pub fan: u8,
    pub mist: u8,
    pub light: u8,
    pub heater: u8,
}

impl RelayLines {
    pub fn line_for(&self, relay: Relay) -> u8 {
        match relay {
            Relay::Fan => self.fan,
            Relay::Mist => self.mist,
            Relay::Light => self.light,
            Relay::Heater => self.heater,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MushPiConfig {
    pub tick_interval_s: u64,
    pub sample_interval_s: u64,
    pub relay_lines: RelayLines,
    pub relays_active_low: bool,
    pub hysteresis_temp_c: f64,
    pub hysteresis_rh_pct: f64,
    pub hysteresis_co2_ppm: f64,
    pub duty_window_s: u64,
    pub duty_cap_s_fan: u64,
    pub duty_cap_s_mist: u64,
    pub duty_cap_s_light: u64,
    pub duty_cap_s_heater: u64,
    pub condensation_rh_cap: f64,
    pub condensation_delta_c: f64,
    pub light_verify_delay_s: u64,
    pub light_on_threshold_raw: u16,
    pub compliance_threshold_pct: f64,
    pub ble_queue_max_size: usize,
    pub ble_backpressure_policy: BackpressurePolicy,
    pub ble_queue_put_timeout_ms: u64,
    pub ble_publish_timeout_ms: u64,
    pub ble_log_slow_publish_ms: u64,
    pub db_path: String,
    pub retention_days: u32,
    pub simulation_mode: bool,
}

impl MushPiConfig {
    pub fn duty_cap_s(&self, relay: Relay) -> u64 {
        match relay {
            Relay::Fan => self.duty_cap_s_fan,
            Relay::Mist => self.duty_cap_s_mist,
            Relay::Light => self.duty_cap_s_light,
            Relay::Heater => self.duty_cap_s_heater,
        }
    }

    /// Read every recognized environment variable, falling back to
    /// compiled-in defaults, then clamp/validate via `validation`.
    pub fn from_env() -> Self {
        use defaults as d;

        let mut cfg = Self {
            tick_interval_s: env_u64("TICK_INTERVAL_S", d::TICK_INTERVAL_S),
            sample_interval_s: env_u64("SAMPLE_INTERVAL_S", d::SAMPLE_INTERVAL_S),
            relay_lines: RelayLines {
                fan: env_u8("RELAY_FAN", 17),
                mist: env_u8("RELAY_MIST", 27),
                light: env_u8("RELAY_LIGHT", 22),
                heater: env_u8("RELAY_HEATER", 23),
            },
            relays_active_low: env_bool("RELAYS_ACTIVE_LOW", d::RELAYS_ACTIVE_LOW),
            hysteresis_temp_c: env_f64("HYSTERESIS_TEMP_C", d::HYSTERESIS_TEMP_C),
            hysteresis_rh_pct: env_f64("HYSTERESIS_RH_PCT", d::HYSTERESIS_RH_PCT),
            hysteresis_co2_ppm: env_f64("HYSTERESIS_CO2_PPM", d::HYSTERESIS_CO2_PPM),
            duty_window_s: env_u64("DUTY_WINDOW_S", d::DUTY_WINDOW_S),
            duty_cap_s_fan: env_u64("DUTY_CAP_S_FAN", d::DUTY_CAP_S_FAN),
            duty_cap_s_mist: env_u64("DUTY_CAP_S_MIST", d::DUTY_CAP_S_MIST),
            duty_cap_s_light: env_u64("DUTY_CAP_S_LIGHT", d::DUTY_CAP_S_LIGHT),
            duty_cap_s_heater: env_u64("DUTY_CAP_S_HEATER", d::DUTY_CAP_S_HEATER),
            condensation_rh_cap: env_f64("CONDENSATION_RH_CAP", d::CONDENSATION_RH_CAP),
            condensation_delta_c: env_f64("CONDENSATION_DELTA_C", d::CONDENSATION_DELTA_C),
            light_verify_delay_s: env_u64("LIGHT_VERIFY_DELAY_S", d::LIGHT_VERIFY_DELAY_S),
            light_on_threshold_raw: env_u16("LIGHT_ON_THRESHOLD_RAW", d::LIGHT_ON_THRESHOLD_RAW),
            compliance_threshold_pct: env_f64(
                "COMPLIANCE_THRESHOLD_PCT",
                d::COMPLIANCE_THRESHOLD_PCT,
            ),
            ble_queue_max_size: env_usize("BLE_QUEUE_MAX_SIZE", d::BLE_QUEUE_MAX_SIZE),
            ble_backpressure_policy: std::env::var("BLE_BACKPRESSURE_POLICY")
                .ok()
                .and_then(|s| BackpressurePolicy::from_str(&s).ok())
                .unwrap_or(BackpressurePolicy::Priority),
            ble_queue_put_timeout_ms: env_u64(
                "BLE_QUEUE_PUT_TIMEOUT_MS",
                d::BLE_QUEUE_PUT_TIMEOUT_MS,
            ),
            ble_publish_timeout_ms: env_u64("BLE_PUBLISH_TIMEOUT_MS", d::BLE_PUBLISH_TIMEOUT_MS),
            ble_log_slow_publish_ms: env_u64(
                "BLE_LOG_SLOW_PUBLISH_MS",
                d::BLE_LOG_SLOW_PUBLISH_MS,
            ),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| d::DB_PATH.to_string()),
            retention_days: env_u32("RETENTION_DAYS", d::RETENTION_DAYS),
            simulation_mode: env_bool("SIMULATION_MODE", false),
        };
        validation::clamp(&mut cfg);
        cfg
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u8(key: &str, default: u8) -> u8 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}
