//! Core domain types shared across the sensor, control, stage, arbiter,
//! storage, and BLE modules.
//!
//! These mirror the wire and persistence schemas described for the GATT
//! service: every multi-byte value here has a canonical little-endian
//! encoding defined in `ble::wire`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical relay identifiers. Bit position in `override_bits` and in
/// `actuator_status.state` matches the declaration order here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relay {
    Light,
    Fan,
    Mist,
    Heater,
}

impl Relay {
    pub const ALL: [Relay; 4] = [Relay::Light, Relay::Fan, Relay::Mist, Relay::Heater];

    /// Bit position within `override_bits` / `actuator_status.state`.
    pub const fn bit(self) -> u8 {
        match self {
            Relay::Light => 0,
            Relay::Fan => 1,
            Relay::Mist => 2,
            Relay::Heater => 3,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Relay::Light => "light",
            Relay::Fan => "fan",
            Relay::Mist => "mist",
            Relay::Heater => "heater",
        }
    }
}

impl std::fmt::Display for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Commanded state for a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayTarget {
    On,
    Off,
}

impl RelayTarget {
    pub const fn is_on(self) -> bool {
        matches!(self, RelayTarget::On)
    }
}

/// Confidence in a `Reading`'s sensor values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    Valid,
    Stale,
    Invalid,
}

impl Validity {
    pub const fn is_valid(self) -> bool {
        matches!(self, Validity::Valid)
    }
}

/// One sampled environmental reading. Produced by the sensor aggregator,
/// consumed by the stage engine, control engine, and persistent store.
/// Never mutated after construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub co2_ppm: u16,
    /// Tenths of a degree Celsius, e.g. 215 = 21.5 C.
    pub temperature_c_tenths: i16,
    /// Tenths of a percent, e.g. 825 = 82.5%.
    pub relative_humidity_pct_tenths: u16,
    pub light_raw: u16,
    pub validity: Validity,
}

impl Reading {
    pub fn temperature_c(&self) -> f64 {
        f64::from(self.temperature_c_tenths) / 10.0
    }

    pub fn relative_humidity_pct(&self) -> f64 {
        f64::from(self.relative_humidity_pct_tenths) / 10.0
    }

    /// A Reading that is not `Valid` must never influence control decisions.
    pub fn usable_for_control(&self) -> bool {
        self.validity.is_valid()
    }
}

/// Cultivated species. Numeric encoding matches `stage_state.species`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Species {
    Oyster,
    Shiitake,
    LionsMane,
}

impl Species {
    pub const fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Species::Oyster),
            1 => Some(Species::Shiitake),
            2 => Some(Species::LionsMane),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u8 {
        match self {
            Species::Oyster => 0,
            Species::Shiitake => 1,
            Species::LionsMane => 2,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Species::Oyster => "oyster",
            Species::Shiitake => "shiitake",
            Species::LionsMane => "lions_mane",
        }
    }
}

/// Lifecycle stage. Numeric encoding matches `stage_state.stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Incubation,
    Pinning,
    Fruiting,
}

impl Stage {
    pub const fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Stage::Incubation),
            1 => Some(Stage::Pinning),
            2 => Some(Stage::Fruiting),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u8 {
        match self {
            Stage::Incubation => 0,
            Stage::Pinning => 1,
            Stage::Fruiting => 2,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Stage::Incubation => "incubation",
            Stage::Pinning => "pinning",
            Stage::Fruiting => "fruiting",
        }
    }

    /// The stage reached by auto-advancing from this one, or `None` if
    /// terminal.
    pub const fn next(self) -> Option<Self> {
        match self {
            Stage::Incubation => Some(Stage::Pinning),
            Stage::Pinning => Some(Stage::Fruiting),
            Stage::Fruiting => None,
        }
    }
}

/// Stage-advancement automation policy. Numeric encoding matches
/// `stage_state.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageMode {
    /// Auto-advance when eligible.
    Full,
    /// Control stays automatic; advancement is manual.
    Semi,
    /// Manual everything.
    Manual,
}

impl StageMode {
    pub const fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(StageMode::Full),
            1 => Some(StageMode::Semi),
            2 => Some(StageMode::Manual),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u8 {
        match self {
            StageMode::Full => 0,
            StageMode::Semi => 1,
            StageMode::Manual => 2,
        }
    }
}

/// Arbiter state. Derived from `StageMode` and override bits; never set
/// directly by a BLE write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    Automatic,
    Manual,
    Safety,
}

/// Light schedule policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightMode {
    Off,
    On,
    Cycle,
}

impl LightMode {
    pub const fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(LightMode::Off),
            1 => Some(LightMode::On),
            2 => Some(LightMode::Cycle),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u8 {
        match self {
            LightMode::Off => 0,
            LightMode::On => 1,
            LightMode::Cycle => 2,
        }
    }
}

/// Per-(species, stage) environmental targets and light schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdProfile {
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    pub rh_min_pct: f64,
    pub co2_max_ppm: u16,
    pub light_mode: LightMode,
    pub on_minutes: u16,
    pub off_minutes: u16,
    pub expected_days: u16,
    /// Overrides the global default compliance threshold when present.
    pub compliance_threshold_pct: Option<f64>,
}

impl ThresholdProfile {
    /// Structural validity, independent of any runtime state.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(self.temp_min_c < self.temp_max_c) {
            return Err("temp_min must be < temp_max");
        }
        if !(0.0..=100.0).contains(&self.rh_min_pct) {
            return Err("rh_min must be within [0, 100]");
        }
        if matches!(self.light_mode, LightMode::Cycle)
            && self.on_minutes == 0
            && self.off_minutes == 0
        {
            return Err("on_minutes + off_minutes must be > 0 in CYCLE mode");
        }
        Ok(())
    }
}

/// The singleton current-stage row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageInfo {
    pub mode: StageMode,
    pub species: Species,
    pub stage: Stage,
    pub stage_start_time: DateTime<Utc>,
    pub expected_days: u16,
    pub control_mode: ControlMode,
    /// Monotonic id for this stage occupancy, bumped on every genuine
    /// transition. Persisted here so a restart mid-stage doesn't discard
    /// the compliance records accrued before it — see `ComplianceRecord`.
    pub stage_id: u64,
}

/// A single relay's override state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RelayOverride {
    #[default]
    Auto,
    ForcedOn,
    ForcedOff,
}

/// Runtime-only override and safety-latch state. `emergency_stop` and
/// `disable_automation` are additionally reflected into
/// `StageInfo::control_mode`, which is what actually persists.
#[derive(Debug, Clone, Copy)]
pub struct OverrideState {
    pub relays: [RelayOverride; 4],
    pub disable_automation: bool,
    pub emergency_stop: bool,
    /// Control mode captured the instant emergency_stop latched, so it can
    /// be restored verbatim when the latch clears.
    pub mode_before_latch: Option<ControlMode>,
}

impl Default for OverrideState {
    fn default() -> Self {
        Self {
            relays: [RelayOverride::Auto; 4],
            disable_automation: false,
            emergency_stop: false,
            mode_before_latch: None,
        }
    }
}

impl OverrideState {
    pub fn get(&self, relay: Relay) -> RelayOverride {
        self.relays[relay.bit() as usize]
    }

    pub fn set(&mut self, relay: Relay, state: RelayOverride) {
        self.relays[relay.bit() as usize] = state;
    }
}

/// Sliding on-time accounting for one relay's duty-cycle cap.
#[derive(Debug, Clone, Copy)]
pub struct DutyWindow {
    pub on_seconds_in_window: u64,
    pub window_start: DateTime<Utc>,
}

impl DutyWindow {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            on_seconds_in_window: 0,
            window_start: now,
        }
    }
}

/// One tick's pass/fail record against the strict threshold envelope,
/// appended while the stage is in FULL mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComplianceRecord {
    pub timestamp: DateTime<Utc>,
    pub stage_id: u64,
    pub temp_ok: bool,
    pub rh_ok: bool,
    pub co2_ok: bool,
}

impl ComplianceRecord {
    pub fn fully_compliant(self) -> bool {
        self.temp_ok && self.rh_ok && self.co2_ok
    }
}

/// A decision emitted by the control engine, arbitrated by the mode/override
/// arbiter, applied by the actuator driver, and logged to the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub relay: Relay,
    pub target: RelayTarget,
    pub reason_code: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    LightVerificationFailed,
    SensorPrimaryDown,
    ActuatorWriteFailed,
    CriticalNotificationDropped,
    StoreAppendFailed,
}

/// A deduplicated, resolvable event. An unresolved alert of the same
/// `(kind, relay)` is never duplicated; later occurrences update its
/// timestamp in place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub relay: Option<Relay>,
    pub resolved: bool,
}

/// Notification priority tag for the BLE notify queue. Variant order is
/// significant: `Critical` is numerically lowest and wins eviction contests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotifyPriority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

/// Notify-queue backpressure policy. `Priority` is the default; the others
/// are configurable but not default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    Priority,
    DropOldest,
    DropNewest,
    Coalesce,
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(Self::Priority),
            "drop_oldest" => Ok(Self::DropOldest),
            "drop_newest" => Ok(Self::DropNewest),
            "coalesce" => Ok(Self::Coalesce),
            _ => Err("unknown backpressure policy"),
        }
    }
}
