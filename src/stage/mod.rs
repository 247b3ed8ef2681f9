//! Stage Engine (component D).
//!
//! Owns the current species/stage/mode, resolves thresholds (persisted
//! override if present, compiled-in default otherwise), records compliance,
//! and decides auto-advancement eligibility.

use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::config::defaults::species_profiles;
use crate::error::StoreError;
use crate::storage::Store;
use crate::types::{ComplianceRecord, ControlMode, Reading, Species, Stage, StageInfo, StageMode, ThresholdProfile};

/// Derive the arbiter's baseline control mode from the stage-advancement
/// mode alone (before override bits are applied); see the arbiter for the
/// full precedence rules.
pub fn control_mode_for_stage_mode(mode: StageMode) -> ControlMode {
    match mode {
        StageMode::Full | StageMode::Semi => ControlMode::Automatic,
        StageMode::Manual => ControlMode::Manual,
    }
}

pub struct StageEngine {
    store: Arc<Store>,
    current: RwLock<StageInfo>,
    compliance_threshold_default: f64,
}

impl StageEngine {
    pub fn new(store: Arc<Store>, initial: StageInfo, compliance_threshold_default: f64) -> Self {
        Self {
            store,
            current: RwLock::new(initial),
            compliance_threshold_default,
        }
    }

    /// Load persisted state, or fall back to a fresh oyster/incubation/FULL
    /// stage if this is a first boot. `stage_id` rides along inside the
    /// persisted `StageInfo` row, so a restart resumes counting compliance
    /// against the same occupancy rather than resetting to 0.
    pub fn load_or_default(store: Arc<Store>, compliance_threshold_default: f64) -> Result<Self, StoreError> {
        let stage = match store.get_stage()? {
            Some(s) => s,
            None => {
                let now = Utc::now();
                let defaults = species_profiles::default_for(Species::Oyster, Stage::Incubation);
                let stage = StageInfo {
                    mode: StageMode::Full,
                    species: Species::Oyster,
                    stage: Stage::Incubation,
                    stage_start_time: now,
                    expected_days: defaults.expected_days,
                    control_mode: control_mode_for_stage_mode(StageMode::Full),
                    stage_id: 0,
                };
                store.set_stage(&stage)?;
                stage
            }
        };
        Ok(Self::new(store, stage, compliance_threshold_default))
    }

    pub fn current(&self) -> StageInfo {
        *self.current.read().expect("stage lock poisoned")
    }

    pub fn stage_id(&self) -> u64 {
        self.current().stage_id
    }

    pub fn thresholds_for(&self, stage: Stage) -> ThresholdProfile {
        let species = self.current().species;
        match self.store.get_profile(species, stage) {
            Ok(Some(profile)) => profile,
            _ => species_profiles::default_for(species, stage),
        }
    }

    /// Persist a genuine stage transition atomically, reset the compliance
    /// stream, bump `stage_id`, and return the new derived control mode so
    /// callers (the arbiter) can react without a second round trip through
    /// the store. Never call this just to persist a `control_mode` change —
    /// use `set_control_mode`, which leaves compliance history alone.
    pub fn set_stage(&self, stage: StageInfo) -> Result<ControlMode, StoreError> {
        let mut stage = stage;
        stage.stage_id = self.stage_id().wrapping_add(1);
        self.store.set_stage(&stage)?;
        *self.current.write().expect("stage lock poisoned") = stage;
        Ok(stage.control_mode)
    }

    /// Persist a `control_mode`-only change (emergency-stop latch/clear,
    /// manual-mode toggle) without clearing compliance history or bumping
    /// `stage_id` — this is not a stage transition.
    pub fn set_control_mode(&self, mode: ControlMode) -> Result<(), StoreError> {
        let updated = self.store.set_control_mode(mode)?;
        *self.current.write().expect("stage lock poisoned") = updated;
        Ok(())
    }

    /// Append a compliance record if the stage is in FULL mode and the
    /// reading is valid. Compliance is recorded at decision time, never
    /// reconstructed lazily from raw readings.
    pub fn record_compliance(&self, reading: &Reading) -> Result<(), StoreError> {
        let stage = self.current();
        if stage.mode != StageMode::Full || !reading.usable_for_control() {
            return Ok(());
        }
        let thresholds = self.thresholds_for(stage.stage);
        let temp_ok =
            reading.temperature_c() >= thresholds.temp_min_c && reading.temperature_c() <= thresholds.temp_max_c;
        let rh_ok = reading.relative_humidity_pct() >= thresholds.rh_min_pct;
        let co2_ok = reading.co2_ppm <= thresholds.co2_max_ppm;

        self.store.append_compliance(ComplianceRecord {
            timestamp: reading.timestamp,
            stage_id: self.stage_id(),
            temp_ok,
            rh_ok,
            co2_ok,
        })
    }

    /// `true` iff `mode = FULL`, elapsed time has reached `expected_days`,
    /// and the compliance ratio over the current stage meets its
    /// threshold. Ties count as eligible. The reason string names which
    /// condition(s) failed, with the numeric values that drove the
    /// decision, so tests can assert on exact wording.
    pub fn should_advance(&self) -> (bool, String) {
        let stage = self.current();
        if stage.mode != StageMode::Full {
            return (false, "stage mode is not FULL".to_string());
        }

        let elapsed_days = (Utc::now() - stage.stage_start_time).num_minutes() as f64 / (24.0 * 60.0);
        let threshold = self
            .thresholds_for(stage.stage)
            .compliance_threshold_pct
            .unwrap_or(self.compliance_threshold_default);

        let records = self.store.recent_compliance(usize::MAX).unwrap_or_default();
        let stage_id = self.stage_id();
        let relevant: Vec<_> = records.iter().filter(|r| r.stage_id == stage_id).collect();
        let compliance_ratio = if relevant.is_empty() {
            0.0
        } else {
            let compliant = relevant.iter().filter(|r| r.fully_compliant()).count();
            100.0 * compliant as f64 / relevant.len() as f64
        };

        let age_ok = elapsed_days >= f64::from(stage.expected_days);
        let compliance_ok = compliance_ratio >= threshold;

        if age_ok && compliance_ok {
            (
                true,
                format!(
                    "age {elapsed_days:.1} >= {} and compliance {compliance_ratio:.0}% >= {threshold:.0}%",
                    stage.expected_days
                ),
            )
        } else if !age_ok {
            (
                false,
                format!("age {elapsed_days:.1} < {}", stage.expected_days),
            )
        } else {
            (
                false,
                format!("compliance {compliance_ratio:.0}% < {threshold:.0}%"),
            )
        }
    }

    /// Persist a BLE-written `control_targets` profile for the current
    /// (species, stage), filling in the fields that characteristic doesn't
    /// carry (`expected_days`, `compliance_threshold_pct`) from whatever is
    /// already in effect, so a targets-only write can never clobber them.
    pub fn set_profile_override(&self, partial: ThresholdProfile) -> Result<(), StoreError> {
        let stage = self.current();
        let existing = self.thresholds_for(stage.stage);
        let merged = ThresholdProfile {
            expected_days: existing.expected_days,
            compliance_threshold_pct: existing.compliance_threshold_pct,
            ..partial
        };
        self.store.set_profile(stage.species, stage.stage, &merged)
    }

    /// Transition to the next stage. `fruiting` is terminal; calling this
    /// while already fruiting is a no-op.
    pub fn advance(&self) -> Result<(), StoreError> {
        let stage = self.current();
        let Some(next_stage) = stage.stage.next() else {
            return Ok(());
        };
        let next_thresholds = self.thresholds_for(next_stage);
        let updated = StageInfo {
            stage: next_stage,
            stage_start_time: Utc::now(),
            expected_days: next_thresholds.expected_days,
            ..stage
        };
        self.set_stage(updated)?;
        Ok(())
    }
}
