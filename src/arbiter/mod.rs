//! Mode/Override Arbiter (component F).
//!
//! Owns the runtime `OverrideState` (per-relay overrides, the manual-mode
//! gate, and the emergency-stop latch) and keeps `StageInfo::control_mode`
//! in sync with it. Precedence on conflict, highest first: emergency stop,
//! condensation guard, per-relay override, automatic control, held state.
//! The first two are enforced by the control engine itself; this module is
//! the source of truth for the override state the control engine reads.

use std::sync::{Arc, RwLock};

use crate::error::StoreError;
use crate::stage::StageEngine;
use crate::types::{ControlMode, OverrideState, Relay, RelayOverride, StageMode};

pub struct Arbiter {
    stage: Arc<StageEngine>,
    state: RwLock<OverrideState>,
}

impl Arbiter {
    /// The initial override state mirrors the persisted stage mode: a
    /// stage left in MANUAL mode across a restart boots back into MANUAL,
    /// not AUTOMATIC.
    pub fn new(stage: Arc<StageEngine>) -> Self {
        let disable_automation = stage.current().mode == StageMode::Manual;
        Self {
            stage,
            state: RwLock::new(OverrideState {
                disable_automation,
                ..OverrideState::default()
            }),
        }
    }

    pub fn snapshot(&self) -> OverrideState {
        *self.state.read().expect("arbiter state lock poisoned")
    }

    pub fn control_mode(&self) -> ControlMode {
        let state = self.snapshot();
        if state.emergency_stop {
            ControlMode::Safety
        } else if state.disable_automation {
            ControlMode::Manual
        } else {
            ControlMode::Automatic
        }
    }

    /// Persists the derived `control_mode` without touching compliance
    /// history — emergency-stop latch/clear and manual-mode toggles are not
    /// stage transitions, so `StageEngine::set_stage` (which clears
    /// compliance and bumps `stage_id`) must never be used here.
    fn sync_persisted_mode(&self) -> Result<(), StoreError> {
        let mode = self.control_mode();
        let info = self.stage.current();
        if info.control_mode != mode {
            self.stage.set_control_mode(mode)?;
        }
        Ok(())
    }

    pub fn set_relay_override(&self, relay: Relay, ovr: RelayOverride) -> Result<(), StoreError> {
        self.state.write().expect("arbiter state lock poisoned").set(relay, ovr);
        // Overrides don't change control_mode, but a SAFETY-latched arbiter
        // should reject them entirely; callers check `control_mode()` first.
        Ok(())
    }

    pub fn clear_relay_override(&self, relay: Relay) -> Result<(), StoreError> {
        self.set_relay_override(relay, RelayOverride::Auto)
    }

    /// Toggle the global manual gate (`StageMode::Manual` maps to this).
    /// No-op, returns the unchanged mode, while emergency-stopped.
    pub fn set_disable_automation(&self, disable: bool) -> Result<ControlMode, StoreError> {
        {
            let mut state = self.state.write().expect("arbiter state lock poisoned");
            if state.emergency_stop {
                return Ok(ControlMode::Safety);
            }
            state.disable_automation = disable;
        }
        self.sync_persisted_mode()?;
        Ok(self.control_mode())
    }

    /// Latch the emergency stop. Capturing the mode in effect at the
    /// instant of latching lets `clear_emergency_stop` restore it exactly,
    /// rather than always falling back to AUTOMATIC.
    pub fn latch_emergency_stop(&self) -> Result<(), StoreError> {
        {
            let mut state = self.state.write().expect("arbiter state lock poisoned");
            if !state.emergency_stop {
                state.mode_before_latch = Some(if state.disable_automation {
                    ControlMode::Manual
                } else {
                    ControlMode::Automatic
                });
                state.emergency_stop = true;
            }
        }
        self.sync_persisted_mode()
    }

    pub fn clear_emergency_stop(&self) -> Result<ControlMode, StoreError> {
        {
            let mut state = self.state.write().expect("arbiter state lock poisoned");
            state.emergency_stop = false;
            if let Some(prev) = state.mode_before_latch.take() {
                state.disable_automation = matches!(prev, ControlMode::Manual);
            }
        }
        self.sync_persisted_mode()?;
        Ok(self.control_mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use crate::types::{Species, Stage, StageInfo};
    use chrono::Utc;
    use tempfile::tempdir;

    fn arbiter_with_mode(mode: StageMode) -> Arbiter {
        arbiter_with_mode_and_store(mode).0
    }

    fn arbiter_with_mode_and_store(mode: StageMode) -> (Arbiter, Arc<Store>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let info = StageInfo {
            mode,
            species: Species::Oyster,
            stage: Stage::Incubation,
            stage_start_time: Utc::now(),
            expected_days: 14,
            control_mode: crate::stage::control_mode_for_stage_mode(mode),
            stage_id: 0,
        };
        let stage = Arc::new(StageEngine::new(store.clone(), info, 70.0));
        (Arbiter::new(stage), store)
    }

    #[test]
    fn boots_manual_when_stage_mode_is_manual() {
        let arbiter = arbiter_with_mode(StageMode::Manual);
        assert_eq!(arbiter.control_mode(), ControlMode::Manual);
    }

    #[test]
    fn relay_override_is_visible_in_snapshot() {
        let arbiter = arbiter_with_mode(StageMode::Full);
        arbiter.set_relay_override(Relay::Fan, RelayOverride::ForcedOn).unwrap();
        assert_eq!(arbiter.snapshot().get(Relay::Fan), RelayOverride::ForcedOn);
    }

    #[test]
    fn emergency_stop_latches_and_restores_prior_mode() {
        let arbiter = arbiter_with_mode(StageMode::Full);
        assert_eq!(arbiter.control_mode(), ControlMode::Automatic);

        arbiter.latch_emergency_stop().unwrap();
        assert_eq!(arbiter.control_mode(), ControlMode::Safety);

        let restored = arbiter.clear_emergency_stop().unwrap();
        assert_eq!(restored, ControlMode::Automatic);
    }

    #[test]
    fn emergency_stop_restores_manual_if_that_was_active_before_latch() {
        let arbiter = arbiter_with_mode(StageMode::Full);
        arbiter.set_disable_automation(true).unwrap();
        arbiter.latch_emergency_stop().unwrap();
        let restored = arbiter.clear_emergency_stop().unwrap();
        assert_eq!(restored, ControlMode::Manual);
    }

    #[test]
    fn set_disable_automation_is_rejected_while_latched() {
        let arbiter = arbiter_with_mode(StageMode::Full);
        arbiter.latch_emergency_stop().unwrap();
        let mode = arbiter.set_disable_automation(false).unwrap();
        assert_eq!(mode, ControlMode::Safety);
    }

    #[test]
    fn emergency_stop_latch_and_clear_preserve_compliance_history() {
        let (arbiter, store) = arbiter_with_mode_and_store(StageMode::Full);
        store
            .append_compliance(crate::types::ComplianceRecord {
                timestamp: Utc::now(),
                stage_id: arbiter.stage.stage_id(),
                temp_ok: true,
                rh_ok: true,
                co2_ok: true,
            })
            .unwrap();

        arbiter.latch_emergency_stop().unwrap();
        arbiter.clear_emergency_stop().unwrap();

        assert_eq!(store.recent_compliance(usize::MAX).unwrap().len(), 1);
    }
}
