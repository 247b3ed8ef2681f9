//! Cross-module scenario regression tests.
//!
//! Exercises the control engine, the arbiter, and the BLE wire codec
//! together the way a real tick does, rather than through each module's own
//! colocated unit tests in isolation.

use mushpi::actuators::{ActuatorDriver, Simulated};
use mushpi::arbiter::Arbiter;
use mushpi::ble::wire;
use mushpi::config::{defaults::species_profiles, MushPiConfig, RelayLines};
use mushpi::control::ControlEngine;
use mushpi::stage::StageEngine;
use mushpi::storage::Store;
use mushpi::types::{
    BackpressurePolicy, ControlMode, OverrideState, Reading, Relay, RelayOverride, RelayTarget, Species, Stage,
    StageInfo, StageMode, Validity,
};

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
        duty_cap_s_mist: 0,
        duty_cap_s_light: 0,
        duty_cap_s_heater: 0,
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

fn reading(temp_c: f64) -> Reading {
    Reading {
        timestamp: chrono::Utc::now(),
        co2_ppm: 900,
        temperature_c_tenths: (temp_c * 10.0).round() as i16,
        relative_humidity_pct_tenths: 850,
        light_raw: 300,
        validity: Validity::Valid,
    }
}

async fn driver() -> ActuatorDriver {
    ActuatorDriver::init(Box::new(Simulated::default()), RelayLines { fan: 1, mist: 2, light: 3, heater: 4 }, true)
        .await
        .unwrap()
}

/// S1: fan hysteresis across 24.9 -> 25.1 -> 25.0 -> 24.0 -> 24.1, with
/// temp_max_c = 25.0 and a 1.0C hysteresis band. Expected sequence:
/// OFF, ON, ON, OFF, OFF.
#[tokio::test]
async fn s1_temperature_hysteresis_sequence() {
    let engine = ControlEngine::new();
    let actuator = driver().await;
    let overrides = OverrideState::default();
    let c = cfg();
    let thresholds = species_profiles::default_for(Species::Oyster, Stage::Fruiting);
    let now = chrono::Utc::now();

    for (temp, want_on) in [(24.9, false), (25.1, true), (25.0, true), (24.0, false), (24.1, false)] {
        let (commands, _) = engine.decide(now, &reading(temp), &thresholds, now, &overrides, &actuator, &c);
        let fan = commands.iter().find(|cmd| cmd.relay == Relay::Fan).unwrap();
        assert_eq!(fan.target.is_on(), want_on, "at {temp}C");
        actuator.apply(Relay::Fan, fan.target).await.unwrap();
    }
}

/// S2: an override_bits write of 0x8000 latches emergency stop and forces
/// every relay off regardless of prior state; clearing with 0x0000
/// restores the mode that was active before the latch.
#[tokio::test]
async fn s2_emergency_stop_latch_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(Store::open(dir.path()).unwrap());
    let info = StageInfo {
        mode: StageMode::Full,
        species: Species::Oyster,
        stage: Stage::Fruiting,
        stage_start_time: chrono::Utc::now(),
        expected_days: 7,
        control_mode: ControlMode::Automatic,
        stage_id: 0,
    };
    let stage = std::sync::Arc::new(StageEngine::new(store.clone(), info, 70.0));
    let arbiter = Arbiter::new(stage.clone());
    stage
        .record_compliance(&Reading {
            timestamp: chrono::Utc::now(),
            co2_ppm: 900,
            temperature_c_tenths: 220,
            relative_humidity_pct_tenths: 900,
            light_raw: 0,
            validity: Validity::Valid,
        })
        .unwrap();
    assert_eq!(store.recent_compliance(usize::MAX).unwrap().len(), 1);

    let latch = wire::decode_override_bits(&0x8000u16.to_le_bytes()).unwrap();
    assert!(latch.emergency_stop);
    arbiter.latch_emergency_stop().unwrap();
    assert_eq!(arbiter.control_mode(), ControlMode::Safety);
    // Latching emergency stop is a control_mode change, not a stage
    // transition — compliance history must survive it.
    assert_eq!(store.recent_compliance(usize::MAX).unwrap().len(), 1);

    let engine = ControlEngine::new();
    let actuator = driver().await;
    actuator.apply(Relay::Fan, RelayTarget::On).await.unwrap();
    let overrides = arbiter.snapshot();
    let (commands, _) =
        engine.decide(chrono::Utc::now(), &reading(30.0), &species_profiles::default_for(Species::Oyster, Stage::Fruiting), chrono::Utc::now(), &overrides, &actuator, &cfg());
    assert!(commands.iter().all(|c| c.target == RelayTarget::Off));

    let clear = wire::decode_override_bits(&0x0000u16.to_le_bytes()).unwrap();
    assert!(!clear.emergency_stop);
    let restored = arbiter.clear_emergency_stop().unwrap();
    assert_eq!(restored, ControlMode::Automatic);
    assert_eq!(store.recent_compliance(usize::MAX).unwrap().len(), 1);
}

/// S6: a manual fan-off override survives an automatic cooling demand.
#[tokio::test]
async fn s6_manual_override_survives_automatic_cooling_demand() {
    let engine = ControlEngine::new();
    let actuator = driver().await;
    let mut overrides = OverrideState::default();
    overrides.set(Relay::Fan, RelayOverride::ForcedOff);

    let hot_reading = reading(30.0);
    let thresholds = species_profiles::default_for(Species::Oyster, Stage::Fruiting);
    let now = chrono::Utc::now();
    let (commands, _) = engine.decide(now, &hot_reading, &thresholds, now, &overrides, &actuator, &cfg());

    let fan = commands.iter().find(|c| c.relay == Relay::Fan).unwrap();
    assert_eq!(fan.target, RelayTarget::Off);
    assert_eq!(fan.reason_code, mushpi::control::reason::MANUAL_OVERRIDE);
}

/// S3: a stage fully meeting its age and compliance requirements advances,
/// and the new stage's thresholds come from the species profile table.
#[test]
fn s3_stage_advances_and_adopts_next_profile_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(Store::open(dir.path()).unwrap());
    let start = chrono::Utc::now() - chrono::Duration::days(15);
    let info = StageInfo {
        mode: StageMode::Full,
        species: Species::Oyster,
        stage: Stage::Incubation,
        stage_start_time: start,
        expected_days: 14,
        control_mode: ControlMode::Automatic,
        stage_id: 0,
    };
    let engine = StageEngine::new(store, info, 70.0);
    for _ in 0..100 {
        engine
            .record_compliance(&Reading {
                timestamp: chrono::Utc::now(),
                co2_ppm: 900,
                temperature_c_tenths: 220,
                relative_humidity_pct_tenths: 900,
                light_raw: 0,
                validity: Validity::Valid,
            })
            .unwrap();
    }
    let (advance, _) = engine.should_advance();
    assert!(advance);
    engine.advance().unwrap();
    assert_eq!(engine.current().stage, Stage::Pinning);

    let pinning_defaults = species_profiles::default_for(Species::Oyster, Stage::Pinning);
    assert_eq!(engine.thresholds_for(Stage::Pinning).temp_max_c, pinning_defaults.temp_max_c);
}
