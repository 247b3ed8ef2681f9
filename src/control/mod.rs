//! Control Engine (component E).
//!
//! Computes, once per tick, the commanded state of all four relays from
//! the latest reading, the active threshold profile, and the arbiter's
//! override state. Decision order is fixed: emergency stop, condensation
//! guard, per-relay manual overrides, domain controllers (hysteresis),
//! duty-cycle caps, light verification. Each step only decides relays the
//! steps before it left undecided.

pub mod domains;
pub mod reason;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::actuators::ActuatorDriver;
use crate::config::MushPiConfig;
use crate::types::{
    Alert, AlertKind, AlertSeverity, DutyWindow, OverrideState, Reading, Relay, RelayOverride, RelayTarget,
    ThresholdProfile,
};

/// Per-relay light-on-verification state, carried across ticks so a
/// single missed verification doesn't repeat the alert every tick.
#[derive(Debug, Clone, Copy)]
enum LightVerification {
    Idle,
    Pending(DateTime<Utc>),
    Verified,
    Failed,
}

pub struct ControlEngine {
    duty: Mutex<HashMap<Relay, DutyWindow>>,
    light_verification: Mutex<LightVerification>,
}

impl Default for ControlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlEngine {
    pub fn new() -> Self {
        Self {
            duty: Mutex::new(HashMap::new()),
            light_verification: Mutex::new(LightVerification::Idle),
        }
    }

    /// Decide every relay's command for this tick. Returns the four
    /// commands (one per relay, in `Relay::ALL` order) plus any alerts
    /// raised by the light-verification check.
    pub fn decide(
        &self,
        now: DateTime<Utc>,
        reading: &Reading,
        thresholds: &ThresholdProfile,
        stage_start_time: DateTime<Utc>,
        overrides: &OverrideState,
        actuator: &ActuatorDriver,
        cfg: &MushPiConfig,
    ) -> (Vec<crate::types::ActuatorCommand>, Vec<Alert>) {
        use crate::types::ActuatorCommand;

        if overrides.emergency_stop {
            let commands = Relay::ALL
                .into_iter()
                .map(|relay| ActuatorCommand {
                    relay,
                    target: RelayTarget::Off,
                    reason_code: reason::EMERGENCY_STOP,
                })
                .collect();
            return (commands, Vec::new());
        }

        let mut commands: HashMap<Relay, ActuatorCommand> = HashMap::new();
        let mut alerts = Vec::new();

        let guard_active = reading.usable_for_control()
            && domains::condensation_guard_active(
                reading.temperature_c(),
                reading.relative_humidity_pct(),
                cfg.condensation_rh_cap,
                cfg.condensation_delta_c,
            );
        if guard_active {
            commands.insert(
                Relay::Fan,
                ActuatorCommand {
                    relay: Relay::Fan,
                    target: RelayTarget::On,
                    reason_code: reason::CONDENSATION_GUARD_ACTIVE,
                },
            );
            commands.insert(
                Relay::Mist,
                ActuatorCommand {
                    relay: Relay::Mist,
                    target: RelayTarget::Off,
                    reason_code: reason::CONDENSATION_GUARD_ACTIVE,
                },
            );
        }

        for relay in Relay::ALL {
            if commands.contains_key(&relay) {
                continue;
            }
            let target = match overrides.get(relay) {
                RelayOverride::ForcedOn => Some(RelayTarget::On),
                RelayOverride::ForcedOff => Some(RelayTarget::Off),
                RelayOverride::Auto => None,
            };
            if let Some(target) = target {
                commands.insert(
                    relay,
                    ActuatorCommand {
                        relay,
                        target,
                        reason_code: reason::MANUAL_OVERRIDE,
                    },
                );
            }
        }

        if !overrides.disable_automation && reading.usable_for_control() {
            if let std::collections::hash_map::Entry::Vacant(e) = commands.entry(Relay::Fan) {
                let currently_on = actuator.current(Relay::Fan).is_on();
                let temp_on = domains::temperature_fan_on(
                    reading.temperature_c(),
                    thresholds.temp_max_c,
                    cfg.hysteresis_temp_c,
                    currently_on,
                );
                let co2_on =
                    domains::co2_fan_on(reading.co2_ppm, thresholds.co2_max_ppm, cfg.hysteresis_co2_ppm, currently_on);
                let on = temp_on || co2_on;
                let reason_code = if on {
                    if temp_on {
                        reason::TEMP_FAN_ON
                    } else {
                        reason::CO2_FAN_ON
                    }
                } else {
                    reason::TEMP_FAN_OFF
                };
                e.insert(ActuatorCommand {
                    relay: Relay::Fan,
                    target: if on { RelayTarget::On } else { RelayTarget::Off },
                    reason_code,
                });
            }

            if let std::collections::hash_map::Entry::Vacant(e) = commands.entry(Relay::Heater) {
                let currently_on = actuator.current(Relay::Heater).is_on();
                let on = domains::temperature_heater_on(
                    reading.temperature_c(),
                    thresholds.temp_min_c,
                    cfg.hysteresis_temp_c,
                    currently_on,
                );
                e.insert(ActuatorCommand {
                    relay: Relay::Heater,
                    target: if on { RelayTarget::On } else { RelayTarget::Off },
                    reason_code: if on { reason::TEMP_HEATER_ON } else { reason::TEMP_HEATER_OFF },
                });
            }

            if let std::collections::hash_map::Entry::Vacant(e) = commands.entry(Relay::Mist) {
                let currently_on = actuator.current(Relay::Mist).is_on();
                let on = domains::humidity_mist_on(
                    reading.relative_humidity_pct(),
                    thresholds.rh_min_pct,
                    cfg.hysteresis_rh_pct,
                    currently_on,
                );
                e.insert(ActuatorCommand {
                    relay: Relay::Mist,
                    target: if on { RelayTarget::On } else { RelayTarget::Off },
                    reason_code: if on { reason::RH_MIST_ON } else { reason::RH_MIST_OFF },
                });
            }

            if let std::collections::hash_map::Entry::Vacant(e) = commands.entry(Relay::Light) {
                let on = domains::light_schedule_on(
                    thresholds.light_mode,
                    now,
                    stage_start_time,
                    thresholds.on_minutes,
                    thresholds.off_minutes,
                );
                e.insert(ActuatorCommand {
                    relay: Relay::Light,
                    target: if on { RelayTarget::On } else { RelayTarget::Off },
                    reason_code: if on { reason::LIGHT_SCHEDULE_ON } else { reason::LIGHT_SCHEDULE_OFF },
                });
            }
        } else {
            for relay in Relay::ALL {
                commands.entry(relay).or_insert_with(|| ActuatorCommand {
                    relay,
                    target: actuator.current(relay),
                    reason_code: reason::HELD_STATE,
                });
            }
        }

        {
            let mut duty = self.duty.lock().expect("duty lock poisoned");
            for relay in Relay::ALL {
                let window = duty.entry(relay).or_insert_with(|| DutyWindow::new(now));
                if now.signed_duration_since(window.window_start).num_seconds() as u64 >= cfg.duty_window_s {
                    *window = DutyWindow::new(now);
                }
                if actuator.current(relay).is_on() {
                    window.on_seconds_in_window += cfg.tick_interval_s;
                }

                let cap = cfg.duty_cap_s(relay);
                if cap == 0 {
                    continue;
                }
                if let Some(cmd) = commands.get_mut(&relay) {
                    let automatic = matches!(
                        cmd.reason_code,
                        reason::TEMP_FAN_ON
                            | reason::CO2_FAN_ON
                            | reason::RH_MIST_ON
                            | reason::TEMP_HEATER_ON
                            | reason::LIGHT_SCHEDULE_ON
                    );
                    if cmd.target.is_on() && automatic && window.on_seconds_in_window >= cap {
                        cmd.target = RelayTarget::Off;
                        cmd.reason_code = reason::DUTY_LIMIT_REACHED;
                    }
                }
            }
        }

        {
            let mut verification = self.light_verification.lock().expect("light_verification lock poisoned");
            let light_cmd = commands.get_mut(&Relay::Light).expect("light command always decided by now");
            if !light_cmd.target.is_on() {
                *verification = LightVerification::Idle;
            } else {
                let passes = reading.usable_for_control() && reading.light_raw >= cfg.light_on_threshold_raw;
                *verification = match *verification {
                    LightVerification::Idle => LightVerification::Pending(now),
                    LightVerification::Pending(since) => {
                        let elapsed = now.signed_duration_since(since).num_seconds() as u64;
                        if elapsed < cfg.light_verify_delay_s {
                            LightVerification::Pending(since)
                        } else if passes {
                            LightVerification::Verified
                        } else {
                            light_cmd.reason_code = reason::LIGHT_VERIFICATION_FAILED;
                            alerts.push(Alert {
                                timestamp: now,
                                kind: AlertKind::LightVerificationFailed,
                                severity: AlertSeverity::Warning,
                                relay: Some(Relay::Light),
                                resolved: false,
                            });
                            LightVerification::Failed
                        }
                    }
                    LightVerification::Verified => LightVerification::Verified,
                    LightVerification::Failed => {
                        if passes {
                            alerts.push(Alert {
                                timestamp: now,
                                kind: AlertKind::LightVerificationFailed,
                                severity: AlertSeverity::Warning,
                                relay: Some(Relay::Light),
                                resolved: true,
                            });
                            LightVerification::Verified
                        } else {
                            light_cmd.reason_code = reason::LIGHT_VERIFICATION_FAILED;
                            // Re-raised every tick while still failing; the
                            // store's upsert_alert dedups this into a
                            // timestamp bump rather than a new row.
                            alerts.push(Alert {
                                timestamp: now,
                                kind: AlertKind::LightVerificationFailed,
                                severity: AlertSeverity::Warning,
                                relay: Some(Relay::Light),
                                resolved: false,
                            });
                            LightVerification::Failed
                        }
                    }
                };
            }
        }

        let mut out: Vec<ActuatorCommand> = Relay::ALL
            .into_iter()
            .map(|relay| commands.remove(&relay).expect("every relay decided"))
            .collect();
        out.sort_by_key(|c| c.relay.bit());
        (out, alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::{ActuatorDriver, Simulated};
    use crate::config::RelayLines;
    use crate::types::{LightMode, RelayOverride, Species, Stage, Validity};

    fn cfg() -> MushPiConfig {
        MushPiConfig {
            tick_interval_s: 30,
            sample_interval_s: 5,
            relay_lines: RelayLines { fan: 1, mist: 2, light: 3, heater: 4 },
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
            ble_backpressure_policy: crate::types::BackpressurePolicy::Priority,
            ble_queue_put_timeout_ms: 10,
            ble_publish_timeout_ms: 2_000,
            ble_log_slow_publish_ms: 250,
            db_path: "./mushpi-data".into(),
            retention_days: 30,
            simulation_mode: true,
        }
    }

    fn thresholds() -> ThresholdProfile {
        crate::config::defaults::species_profiles::default_for(Species::Oyster, Stage::Fruiting)
    }

    fn reading(temp_tenths: i16, rh_tenths: u16, co2: u16, light_raw: u16) -> Reading {
        Reading {
            timestamp: Utc::now(),
            co2_ppm: co2,
            temperature_c_tenths: temp_tenths,
            relative_humidity_pct_tenths: rh_tenths,
            light_raw,
            validity: Validity::Valid,
        }
    }

    async fn driver() -> ActuatorDriver {
        ActuatorDriver::init(Box::new(Simulated::default()), RelayLines { fan: 1, mist: 2, light: 3, heater: 4 }, true)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn emergency_stop_forces_everything_off() {
        let engine = ControlEngine::new();
        let actuator = driver().await;
        let mut overrides = OverrideState::default();
        overrides.emergency_stop = true;
        let (commands, _) = engine.decide(
            Utc::now(),
            &reading(300, 900, 2000, 300),
            &thresholds(),
            Utc::now(),
            &overrides,
            &actuator,
            &cfg(),
        );
        assert!(commands.iter().all(|c| c.target == RelayTarget::Off && c.reason_code == reason::EMERGENCY_STOP));
    }

    #[tokio::test]
    async fn fan_turns_on_above_temp_max() {
        let engine = ControlEngine::new();
        let actuator = driver().await;
        let overrides = OverrideState::default();
        let (commands, _) = engine.decide(
            Utc::now(),
            &reading(260, 850, 900, 300),
            &thresholds(),
            Utc::now(),
            &overrides,
            &actuator,
            &cfg(),
        );
        let fan = commands.iter().find(|c| c.relay == Relay::Fan).unwrap();
        assert_eq!(fan.target, RelayTarget::On);
        assert_eq!(fan.reason_code, reason::TEMP_FAN_ON);
    }

    #[tokio::test]
    async fn manual_override_bypasses_domain_controller() {
        let engine = ControlEngine::new();
        let actuator = driver().await;
        let mut overrides = OverrideState::default();
        overrides.set(Relay::Fan, RelayOverride::ForcedOff);
        let (commands, _) = engine.decide(
            Utc::now(),
            &reading(300, 850, 900, 300),
            &thresholds(),
            Utc::now(),
            &overrides,
            &actuator,
            &cfg(),
        );
        let fan = commands.iter().find(|c| c.relay == Relay::Fan).unwrap();
        assert_eq!(fan.target, RelayTarget::Off);
        assert_eq!(fan.reason_code, reason::MANUAL_OVERRIDE);
    }

    #[tokio::test]
    async fn condensation_guard_overrides_manual_mist_override() {
        let engine = ControlEngine::new();
        let actuator = driver().await;
        let mut overrides = OverrideState::default();
        overrides.set(Relay::Mist, RelayOverride::ForcedOn);
        let (commands, _) = engine.decide(
            Utc::now(),
            &reading(200, 990, 900, 300),
            &thresholds(),
            Utc::now(),
            &overrides,
            &actuator,
            &cfg(),
        );
        let mist = commands.iter().find(|c| c.relay == Relay::Mist).unwrap();
        assert_eq!(mist.target, RelayTarget::Off);
        assert_eq!(mist.reason_code, reason::CONDENSATION_GUARD_ACTIVE);
    }

    #[tokio::test]
    async fn light_verification_fails_when_raw_stays_low() {
        let engine = ControlEngine::new();
        let actuator = driver().await;
        let overrides = OverrideState::default();
        let mut on_thresholds = thresholds();
        on_thresholds.light_mode = LightMode::On;

        let t0 = Utc::now();
        let (_, alerts0) = engine.decide(t0, &reading(180, 900, 900, 10), &on_thresholds, t0, &overrides, &actuator, &cfg());
        assert!(alerts0.is_empty());

        let t1 = t0 + chrono::Duration::seconds(6);
        let (commands1, alerts1) =
            engine.decide(t1, &reading(180, 900, 900, 10), &on_thresholds, t0, &overrides, &actuator, &cfg());
        let light = commands1.iter().find(|c| c.relay == Relay::Light).unwrap();
        assert_eq!(light.reason_code, reason::LIGHT_VERIFICATION_FAILED);
        assert_eq!(alerts1.len(), 1);
        assert!(!alerts1[0].resolved);
    }

    #[tokio::test]
    async fn duty_cap_suppresses_mist_after_cap_reached() {
        let engine = ControlEngine::new();
        let actuator = driver().await;
        let overrides = OverrideState::default();
        let mut caps = cfg();
        caps.duty_cap_s_mist = 60;
        caps.tick_interval_s = 30;

        let dry_reading = reading(200, 500, 900, 300);
        let t0 = Utc::now();
        let (commands0, _) = engine.decide(t0, &dry_reading, &thresholds(), t0, &overrides, &actuator, &caps);
        let mist0 = commands0.iter().find(|c| c.relay == Relay::Mist).unwrap();
        assert_eq!(mist0.target, RelayTarget::On);
        actuator.apply(Relay::Mist, RelayTarget::On).await.unwrap();

        let t1 = t0 + chrono::Duration::seconds(30);
        let (commands1, _) = engine.decide(t1, &dry_reading, &thresholds(), t0, &overrides, &actuator, &caps);
        let mist1 = commands1.iter().find(|c| c.relay == Relay::Mist).unwrap();
        assert_eq!(mist1.target, RelayTarget::On);
        actuator.apply(Relay::Mist, RelayTarget::On).await.unwrap();

        let t2 = t1 + chrono::Duration::seconds(30);
        let (commands2, _) = engine.decide(t2, &dry_reading, &thresholds(), t0, &overrides, &actuator, &caps);
        let mist2 = commands2.iter().find(|c| c.relay == Relay::Mist).unwrap();
        assert_eq!(mist2.target, RelayTarget::Off);
        assert_eq!(mist2.reason_code, reason::DUTY_LIMIT_REACHED);
    }
}
