//! Bounds validation for environment-sourced configuration.
//!
//! Out-of-range values are clamped with a warning rather than failing
//! startup — configuration is operator-facing and a typo in an env var
//! should degrade gracefully, not take the controller down.

use super::MushPiConfig;

fn clamp_u64(name: &str, value: u64, min: u64, max: u64) -> u64 {
    if value < min || value > max {
        tracing::warn!(
            key = name,
            value,
            min,
            max,
            "configuration value out of range, clamping"
        );
        value.clamp(min, max)
    } else {
        value
    }
}

pub fn clamp(cfg: &mut MushPiConfig) {
    cfg.tick_interval_s = clamp_u64("TICK_INTERVAL_S", cfg.tick_interval_s, 1, 300);
    cfg.sample_interval_s = clamp_u64("SAMPLE_INTERVAL_S", cfg.sample_interval_s, 1, 60);

    if cfg.compliance_threshold_pct < 0.0 || cfg.compliance_threshold_pct > 100.0 {
        tracing::warn!(
            value = cfg.compliance_threshold_pct,
            "COMPLIANCE_THRESHOLD_PCT out of [0, 100], clamping"
        );
        cfg.compliance_threshold_pct = cfg.compliance_threshold_pct.clamp(0.0, 100.0);
    }

    if cfg.ble_queue_max_size == 0 {
        tracing::warn!("BLE_QUEUE_MAX_SIZE was 0, forcing to 1");
        cfg.ble_queue_max_size = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackpressurePolicy;

    fn base_config() -> MushPiConfig {
        MushPiConfig {
            tick_interval_s: 30,
            sample_interval_s: 5,
            relay_lines: super::super::RelayLines {
                fan: 1,
                mist: 2,
                light: 3,
                heater: 4,
            },
            relays_active_low: true,
            hysteresis_temp_c: 1.0,
            hysteresis_rh_pct: 3.0,
            hysteresis_co2_ppm: 100.0,
            duty_window_s: 3_600,
            duty_cap_s_fan: 0,
            duty_cap_s_mist: 600,
            duty_cap_s_light: 0,
            duty_cap_s_heater: 1_800,
            condensation_rh_cap: 98.0,
            condensation_delta_c: 2.0,
            light_verify_delay_s: 5,
            light_on_threshold_raw: 200,
            compliance_threshold_pct: 70.0,
            ble_queue_max_size: 16,
            ble_backpressure_policy: BackpressurePolicy::Priority,
            ble_queue_put_timeout_ms: 10,
            ble_publish_timeout_ms: 2_000,
            ble_log_slow_publish_ms: 250,
            db_path: "./mushpi-data".into(),
            retention_days: 30,
            simulation_mode: true,
        }
    }

    #[test]
    fn tick_interval_clamped_to_bounds() {
        let mut cfg = base_config();
        cfg.tick_interval_s = 10_000;
        clamp(&mut cfg);
        assert_eq!(cfg.tick_interval_s, 300);

        cfg.tick_interval_s = 0;
        clamp(&mut cfg);
        assert_eq!(cfg.tick_interval_s, 1);
    }

    #[test]
    fn compliance_threshold_clamped() {
        let mut cfg = base_config();
        cfg.compliance_threshold_pct = 150.0;
        clamp(&mut cfg);
        assert_eq!(cfg.compliance_threshold_pct, 100.0);
    }

    #[test]
    fn queue_size_never_zero() {
        let mut cfg = base_config();
        cfg.ble_queue_max_size = 0;
        clamp(&mut cfg);
        assert_eq!(cfg.ble_queue_max_size, 1);
    }
}
