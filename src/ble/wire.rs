//! Wire encoding for the six GATT characteristics. All multibyte integers
//! are little-endian; temperature/humidity use tenths-of-a-unit encoding.
//!
//! `control_targets` and `stage_state` each declare a payload size one
//! field-count byte larger than their listed fields sum to (13 vs 15, 9
//! vs 10). Padded with reserved zero bytes at the end, the same
//! "reserved, zero" convention `status_flags` uses at the bit level —
//! see DESIGN.md for the Open Question this resolves.

use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::{LightMode, Reading, Species, Stage, StageInfo, StageMode, ThresholdProfile};

fn service_base(suffix: &str) -> Uuid {
    Uuid::parse_str(&format!("12345678-1234-5678-1234-56789abc{suffix}")).expect("hard-coded UUID is well-formed")
}

pub fn service_uuid() -> Uuid {
    service_base("def0")
}
pub fn char_env_measurements() -> Uuid {
    service_base("def1")
}
pub fn char_control_targets() -> Uuid {
    service_base("def2")
}
pub fn char_stage_state() -> Uuid {
    service_base("def3")
}
pub fn char_override_bits() -> Uuid {
    service_base("def4")
}
pub fn char_status_flags() -> Uuid {
    service_base("def5")
}
pub fn char_actuator_status() -> Uuid {
    service_base("def6")
}

pub const ENV_MEASUREMENTS_LEN: usize = 12;
pub const CONTROL_TARGETS_LEN: usize = 15;
pub const STAGE_STATE_LEN: usize = 10;
pub const OVERRIDE_BITS_LEN: usize = 2;
pub const STATUS_FLAGS_LEN: usize = 4;
pub const ACTUATOR_STATUS_LEN: usize = 6;

pub fn encode_env_measurements(reading: &Reading, uptime_s: u32) -> [u8; ENV_MEASUREMENTS_LEN] {
    let mut buf = [0u8; ENV_MEASUREMENTS_LEN];
    buf[0..2].copy_from_slice(&reading.co2_ppm.to_le_bytes());
    buf[2..4].copy_from_slice(&reading.temperature_c_tenths.to_le_bytes());
    buf[4..6].copy_from_slice(&reading.relative_humidity_pct_tenths.to_le_bytes());
    buf[6..8].copy_from_slice(&reading.light_raw.to_le_bytes());
    buf[8..12].copy_from_slice(&uptime_s.to_le_bytes());
    buf
}

pub fn encode_control_targets(t: &ThresholdProfile) -> [u8; CONTROL_TARGETS_LEN] {
    let mut buf = [0u8; CONTROL_TARGETS_LEN];
    buf[0..2].copy_from_slice(&((t.temp_min_c * 10.0).round() as i16).to_le_bytes());
    buf[2..4].copy_from_slice(&((t.temp_max_c * 10.0).round() as i16).to_le_bytes());
    buf[4..6].copy_from_slice(&((t.rh_min_pct * 10.0).round() as u16).to_le_bytes());
    buf[6..8].copy_from_slice(&t.co2_max_ppm.to_le_bytes());
    buf[8] = t.light_mode.to_wire();
    buf[9..11].copy_from_slice(&t.on_minutes.to_le_bytes());
    buf[11..13].copy_from_slice(&t.off_minutes.to_le_bytes());
    buf
}

/// Decode a `control_targets` write. `compliance_threshold_pct` and
/// `expected_days` are not part of this characteristic and are left
/// unchanged by the caller; the returned profile only carries the fields
/// this characteristic actually encodes.
pub fn decode_control_targets(payload: &[u8]) -> Result<ThresholdProfile, ProtocolError> {
    if payload.len() != CONTROL_TARGETS_LEN {
        return Err(ProtocolError::WrongSize { expected: CONTROL_TARGETS_LEN, actual: payload.len() });
    }
    let temp_min_tenths = i16::from_le_bytes(payload[0..2].try_into().unwrap());
    let temp_max_tenths = i16::from_le_bytes(payload[2..4].try_into().unwrap());
    let rh_min_tenths = u16::from_le_bytes(payload[4..6].try_into().unwrap());
    let co2_max_ppm = u16::from_le_bytes(payload[6..8].try_into().unwrap());
    let light_mode = LightMode::from_wire(payload[8])
        .ok_or(ProtocolError::UnknownDiscriminant { field: "light_mode", value: payload[8] })?;
    let on_minutes = u16::from_le_bytes(payload[9..11].try_into().unwrap());
    let off_minutes = u16::from_le_bytes(payload[11..13].try_into().unwrap());

    let profile = ThresholdProfile {
        temp_min_c: f64::from(temp_min_tenths) / 10.0,
        temp_max_c: f64::from(temp_max_tenths) / 10.0,
        rh_min_pct: f64::from(rh_min_tenths) / 10.0,
        co2_max_ppm,
        light_mode,
        on_minutes,
        off_minutes,
        expected_days: 0,
        compliance_threshold_pct: None,
    };
    profile.validate().map_err(ProtocolError::InvalidThresholds)?;
    Ok(profile)
}

pub fn encode_stage_state(info: &StageInfo) -> [u8; STAGE_STATE_LEN] {
    let mut buf = [0u8; STAGE_STATE_LEN];
    buf[0] = info.mode.to_wire();
    buf[1] = info.species.to_wire();
    buf[2] = info.stage.to_wire();
    let start_ts = info.stage_start_time.timestamp().max(0) as u32;
    buf[3..7].copy_from_slice(&start_ts.to_le_bytes());
    buf[7..9].copy_from_slice(&info.expected_days.to_le_bytes());
    buf
}

/// Decode a `stage_state` write. `control_mode` is never set by a BLE
/// write — it is derived by the arbiter from `mode` plus override state —
/// so the caller must re-derive it after accepting this. `start_ts` is the
/// client-supplied stage start time, epoch seconds; the caller is expected
/// to use it verbatim rather than substitute the server's own clock.
pub struct StageStateWrite {
    pub mode: StageMode,
    pub species: Species,
    pub stage: Stage,
    pub start_ts: u32,
    pub expected_days: u16,
}

pub fn decode_stage_state(payload: &[u8]) -> Result<StageStateWrite, ProtocolError> {
    if payload.len() != STAGE_STATE_LEN {
        return Err(ProtocolError::WrongSize { expected: STAGE_STATE_LEN, actual: payload.len() });
    }
    let mode =
        StageMode::from_wire(payload[0]).ok_or(ProtocolError::UnknownDiscriminant { field: "mode", value: payload[0] })?;
    let species = Species::from_wire(payload[1])
        .ok_or(ProtocolError::UnknownDiscriminant { field: "species", value: payload[1] })?;
    let stage =
        Stage::from_wire(payload[2]).ok_or(ProtocolError::UnknownDiscriminant { field: "stage", value: payload[2] })?;
    let start_ts = u32::from_le_bytes(payload[3..7].try_into().unwrap());
    let expected_days = u16::from_le_bytes(payload[7..9].try_into().unwrap());
    Ok(StageStateWrite { mode, species, stage, start_ts, expected_days })
}

/// `override_bits` write semantics: bit0-3 force the matching relay on;
/// bit7 toggles `disable_automation`; bit15 engages the emergency latch.
/// The payload is always a full snapshot — relays whose bit is unset
/// return to `auto`.
pub struct OverrideBitsWrite {
    pub light: bool,
    pub fan: bool,
    pub mist: bool,
    pub heater: bool,
    pub disable_automation: bool,
    pub emergency_stop: bool,
}

pub fn decode_override_bits(payload: &[u8]) -> Result<OverrideBitsWrite, ProtocolError> {
    if payload.len() != OVERRIDE_BITS_LEN {
        return Err(ProtocolError::WrongSize { expected: OVERRIDE_BITS_LEN, actual: payload.len() });
    }
    let bits = u16::from_le_bytes(payload.try_into().unwrap());
    Ok(OverrideBitsWrite {
        light: bits & (1 << 0) != 0,
        fan: bits & (1 << 1) != 0,
        mist: bits & (1 << 2) != 0,
        heater: bits & (1 << 3) != 0,
        disable_automation: bits & (1 << 7) != 0,
        emergency_stop: bits & (1 << 15) != 0,
    })
}

pub fn encode_override_bits(w: &OverrideBitsWrite) -> [u8; OVERRIDE_BITS_LEN] {
    let mut bits: u16 = 0;
    if w.light {
        bits |= 1 << 0;
    }
    if w.fan {
        bits |= 1 << 1;
    }
    if w.mist {
        bits |= 1 << 2;
    }
    if w.heater {
        bits |= 1 << 3;
    }
    if w.disable_automation {
        bits |= 1 << 7;
    }
    if w.emergency_stop {
        bits |= 1 << 15;
    }
    bits.to_le_bytes()
}

pub mod status_bit {
    pub const SENSOR_PRIMARY_OK: u32 = 0;
    pub const SENSOR_BACKUP_OK: u32 = 1;
    pub const LIGHT_VERIFICATION_FAILED_ACTIVE: u32 = 2;
    pub const CONDENSATION_GUARD_ACTIVE: u32 = 3;
    pub const DUTY_LIMIT_ACTIVE_ANY: u32 = 4;
    pub const SAFETY_MODE: u32 = 5;
    pub const MANUAL_MODE: u32 = 6;
    pub const EMERGENCY_STOP_LATCHED: u32 = 7;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusFlags {
    pub sensor_primary_ok: bool,
    pub sensor_backup_ok: bool,
    pub light_verification_failed_active: bool,
    pub condensation_guard_active: bool,
    pub duty_limit_active_any: bool,
    pub safety_mode: bool,
    pub manual_mode: bool,
    pub emergency_stop_latched: bool,
}

pub fn encode_status_flags(flags: &StatusFlags) -> [u8; STATUS_FLAGS_LEN] {
    let mut bits: u32 = 0;
    let set = |bits: &mut u32, bit: u32, on: bool| {
        if on {
            *bits |= 1 << bit;
        }
    };
    set(&mut bits, status_bit::SENSOR_PRIMARY_OK, flags.sensor_primary_ok);
    set(&mut bits, status_bit::SENSOR_BACKUP_OK, flags.sensor_backup_ok);
    set(&mut bits, status_bit::LIGHT_VERIFICATION_FAILED_ACTIVE, flags.light_verification_failed_active);
    set(&mut bits, status_bit::CONDENSATION_GUARD_ACTIVE, flags.condensation_guard_active);
    set(&mut bits, status_bit::DUTY_LIMIT_ACTIVE_ANY, flags.duty_limit_active_any);
    set(&mut bits, status_bit::SAFETY_MODE, flags.safety_mode);
    set(&mut bits, status_bit::MANUAL_MODE, flags.manual_mode);
    set(&mut bits, status_bit::EMERGENCY_STOP_LATCHED, flags.emergency_stop_latched);
    bits.to_le_bytes()
}

pub fn encode_actuator_status(commands: &[crate::types::ActuatorCommand]) -> [u8; ACTUATOR_STATUS_LEN] {
    use crate::types::Relay;
    let mut state: u16 = 0;
    let mut reason_fan = 0u8;
    let mut reason_mist = 0u8;
    let mut reason_light = 0u8;
    let mut reason_heater = 0u8;
    for c in commands {
        if c.target.is_on() {
            state |= 1 << c.relay.bit();
        }
        match c.relay {
            Relay::Fan => reason_fan = c.reason_code,
            Relay::Mist => reason_mist = c.reason_code,
            Relay::Light => reason_light = c.reason_code,
            Relay::Heater => reason_heater = c.reason_code,
        }
    }
    let mut buf = [0u8; ACTUATOR_STATUS_LEN];
    buf[0..2].copy_from_slice(&state.to_le_bytes());
    buf[2] = reason_fan;
    buf[3] = reason_mist;
    buf[4] = reason_light;
    buf[5] = reason_heater;
    buf
}
