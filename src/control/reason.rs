//! The closed reason-code taxonomy attached to every `ActuatorCommand`.
//! Part of the wire protocol (`actuator_status.reason_*` fields) — ranges
//! are normative, not implementation detail.
//!
//! | Range | Domain |
//! |---|---|
//! | 0-9 | system states |
//! | 10-29 | temperature |
//! | 30-49 | humidity |
//! | 50-69 | CO2 |
//! | 70-89 | light |
//! | 90-109 | duty cycle |
//! | 110-129 | safety |
//! | 130-149 | manual |
//! | 150-169 | stage |

pub const NONE: u8 = 0;
pub const CONDENSATION_GUARD_ACTIVE: u8 = 1;

pub const TEMP_FAN_ON: u8 = 10;
pub const TEMP_FAN_OFF: u8 = 11;
pub const TEMP_HEATER_ON: u8 = 12;
pub const TEMP_HEATER_OFF: u8 = 13;

pub const RH_MIST_ON: u8 = 30;
pub const RH_MIST_OFF: u8 = 31;

pub const CO2_FAN_ON: u8 = 50;
pub const CO2_FAN_OFF: u8 = 51;

pub const LIGHT_SCHEDULE_ON: u8 = 70;
pub const LIGHT_SCHEDULE_OFF: u8 = 71;
pub const LIGHT_VERIFICATION_FAILED: u8 = 72;

pub const DUTY_LIMIT_REACHED: u8 = 90;

pub const EMERGENCY_STOP: u8 = 110;

pub const MANUAL_OVERRIDE: u8 = 130;
pub const HELD_STATE: u8 = 131;

pub const STAGE_TRANSITION: u8 = 150;

/// Validate that a byte falls in one of the ten closed sub-ranges. Used
/// when decoding a reason code off the wire (diagnostics/tests only —
/// reason codes are never written by the mobile client).
pub fn in_known_range(code: u8) -> bool {
    matches!(code, 0..=9 | 10..=29 | 30..=49 | 50..=69 | 70..=89 | 90..=109 | 110..=129 | 130..=149 | 150..=169)
}
