//! Pure per-domain decision functions. Each takes the relevant reading
//! value, its threshold band, and the relay's current commanded state,
//! and returns the domain's "should this relay be on" verdict for this
//! tick. The control engine combines these; none of them know about
//! relays, overrides, or reason codes.

use chrono::{DateTime, Utc};

use crate::types::LightMode;

/// Hysteresis for a "high value turns it on" relay (FAN cooling against
/// temperature or CO2). Stays on `currently_on` while inside the band.
pub fn hysteresis_on_above(value: f64, on_threshold: f64, off_threshold: f64, currently_on: bool) -> bool {
    if value > on_threshold {
        true
    } else if value <= off_threshold {
        false
    } else {
        currently_on
    }
}

/// Hysteresis for a "low value turns it on" relay (MIST against humidity,
/// HEATER against temperature).
pub fn hysteresis_on_below(value: f64, on_threshold: f64, off_threshold: f64, currently_on: bool) -> bool {
    if value < on_threshold {
        true
    } else if value >= off_threshold {
        false
    } else {
        currently_on
    }
}

pub fn temperature_fan_on(temp_c: f64, temp_max_c: f64, hysteresis_c: f64, currently_on: bool) -> bool {
    hysteresis_on_above(temp_c, temp_max_c, temp_max_c - hysteresis_c, currently_on)
}

pub fn temperature_heater_on(temp_c: f64, temp_min_c: f64, hysteresis_c: f64, currently_on: bool) -> bool {
    hysteresis_on_below(temp_c, temp_min_c, temp_min_c + hysteresis_c, currently_on)
}

pub fn humidity_mist_on(rh_pct: f64, rh_min_pct: f64, hysteresis_pct: f64, currently_on: bool) -> bool {
    hysteresis_on_below(rh_pct, rh_min_pct, rh_min_pct + hysteresis_pct, currently_on)
}

pub fn co2_fan_on(co2_ppm: u16, co2_max_ppm: u16, hysteresis_ppm: f64, currently_on: bool) -> bool {
    hysteresis_on_above(f64::from(co2_ppm), f64::from(co2_max_ppm), f64::from(co2_max_ppm) - hysteresis_ppm, currently_on)
}

/// Dew-point heuristic: guard trips when humidity is pinned at the cap or
/// the temp/humidity spread crosses the configured delta.
pub fn condensation_guard_active(temp_c: f64, rh_pct: f64, rh_cap: f64, delta_c: f64) -> bool {
    rh_pct >= rh_cap || (temp_c - rh_pct / 5.0) <= delta_c
}

/// Whether LIGHT should be on right now under the stage's light schedule.
/// `CYCLE` runs a fixed on/off duty cycle anchored to `stage_start_time`,
/// so a restart mid-cycle resumes at the correct phase rather than
/// restarting the clock.
pub fn light_schedule_on(
    mode: LightMode,
    now: DateTime<Utc>,
    stage_start_time: DateTime<Utc>,
    on_minutes: u16,
    off_minutes: u16,
) -> bool {
    match mode {
        LightMode::Off => false,
        LightMode::On => true,
        LightMode::Cycle => {
            let period_min = i64::from(on_minutes) + i64::from(off_minutes);
            if period_min <= 0 {
                return false;
            }
            let elapsed_min = (now - stage_start_time).num_seconds() as f64 / 60.0;
            let phase = elapsed_min.rem_euclid(period_min as f64);
            phase < f64::from(on_minutes)
        }
    }
}
