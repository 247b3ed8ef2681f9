//! Persistent Store (component C).
//!
//! Append-only time series for readings, actuator commands, alerts, and
//! compliance records, plus a single-row `current_stage` entity. Backed by
//! `sled`, one tree per stream, with big-endian nanosecond-timestamp keys
//! so iteration order is insertion order (ties broken by an in-process
//! sequence counter, matching the teacher's `AnalysisStorage` key scheme).
//!
//! Concurrency contract: single writer, many readers; readers observe at
//! least everything committed before their read started, which sled's
//! tree reads give for free. The write methods here serialize on an
//! internal lock so the alert-dedup read-modify-write is atomic; the
//! Supervisor Loop and BLE write handlers are the only callers that should
//! ever invoke them (documented contract, not separately enforced).

pub mod lockfile;
pub mod migrations;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sled::Transactional;

use crate::error::StoreError;
use crate::types::{
    ActuatorCommand, Alert, AlertKind, ComplianceRecord, ControlMode, Reading, Relay, Species, Stage, StageInfo,
    ThresholdProfile,
};

pub struct Store {
    _lock: lockfile::ProcessLock,
    db: sled::Db,
    readings: sled::Tree,
    actions: sled::Tree,
    alerts: sled::Tree,
    alert_index: sled::Tree,
    compliance: sled::Tree,
    current_stage: sled::Tree,
    profiles: sled::Tree,
    write_lock: Mutex<()>,
    seq: AtomicU64,
}

const CURRENT_STAGE_KEY: &[u8] = b"current";

impl Store {
    /// Open (creating if absent) the sled database at `path`, running all
    /// pending migrations before returning. Migration failure is fatal.
    /// Acquires a process lock on `path` first so two supervisor instances
    /// never open the same database concurrently.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let lock = lockfile::ProcessLock::acquire(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let db = sled::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        migrations::run(&db)?;

        let readings = db.open_tree("readings").map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let actions = db.open_tree("actions").map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let alerts = db.open_tree("alerts").map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let alert_index =
            db.open_tree("alert_index").map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let compliance =
            db.open_tree("compliance_records").map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let current_stage =
            db.open_tree("current_stage").map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let profiles = db.open_tree("profiles").map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::info!(path = %path.display(), "persistent store opened");

        Ok(Self {
            _lock: lock,
            db,
            readings,
            actions,
            alerts,
            alert_index,
            compliance,
            current_stage,
            profiles,
            write_lock: Mutex::new(()),
            seq: AtomicU64::new(0),
        })
    }

    fn next_key(&self, timestamp: DateTime<Utc>) -> [u8; 16] {
        let nanos = timestamp.timestamp_nanos_opt().unwrap_or(0) as u64;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&nanos.to_be_bytes());
        key[8..].copy_from_slice(&seq.to_be_bytes());
        key
    }

    pub fn append_reading(&self, reading: Reading) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let key = self.next_key(reading.timestamp);
        let value = serde_json::to_vec(&reading)?;
        self.readings
            .insert(key, value)
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        Ok(())
    }

    pub fn append_action(&self, timestamp: DateTime<Utc>, command: ActuatorCommand) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let key = self.next_key(timestamp);
        let value = serde_json::to_vec(&command)?;
        self.actions
            .insert(key, value)
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        Ok(())
    }

    pub fn append_compliance(&self, record: ComplianceRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let key = self.next_key(record.timestamp);
        let value = serde_json::to_vec(&record)?;
        self.compliance
            .insert(key, value)
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        Ok(())
    }

    /// Clear the compliance stream on stage transition, per the contract
    /// that compliance is tracked only for the *current* stage.
    pub fn clear_compliance(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        self.compliance
            .clear()
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        Ok(())
    }

    pub fn recent_compliance(&self, limit: usize) -> Result<Vec<ComplianceRecord>, StoreError> {
        let mut out = Vec::with_capacity(limit);
        for entry in self.compliance.iter().rev().take(limit) {
            let (_, value) = entry.map_err(|e| StoreError::AppendFailed(e.to_string()))?;
            out.push(serde_json::from_slice(&value)?);
        }
        out.reverse();
        Ok(out)
    }

    fn dedup_key(kind: AlertKind, relay: Option<Relay>) -> Vec<u8> {
        let kind_byte = kind as u8;
        let relay_byte = relay.map_or(0xFF, |r| r.bit());
        vec![kind_byte, relay_byte]
    }

    /// Insert a new Alert, or, if an unresolved Alert of the same
    /// `(kind, relay)` already exists, update its timestamp in place
    /// without inserting a new row.
    pub fn upsert_alert(&self, alert: Alert) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let dedup = Self::dedup_key(alert.kind, alert.relay);

        if let Some(existing_key) = self
            .alert_index
            .get(&dedup)
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?
        {
            if let Some(raw) = self
                .alerts
                .get(&existing_key)
                .map_err(|e| StoreError::AppendFailed(e.to_string()))?
            {
                let mut existing: Alert = serde_json::from_slice(&raw)?;
                if !existing.resolved {
                    existing.timestamp = alert.timestamp;
                    let value = serde_json::to_vec(&existing)?;
                    self.alerts
                        .insert(existing_key, value)
                        .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
                    return Ok(());
                }
            }
        }

        let key = self.next_key(alert.timestamp);
        let value = serde_json::to_vec(&alert)?;
        self.alerts
            .insert(&key, value)
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        self.alert_index
            .insert(dedup, key.to_vec())
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        Ok(())
    }

    pub fn resolve_alert(&self, kind: AlertKind, relay: Option<Relay>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let dedup = Self::dedup_key(kind, relay);
        if let Some(existing_key) = self
            .alert_index
            .get(&dedup)
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?
        {
            if let Some(raw) = self
                .alerts
                .get(&existing_key)
                .map_err(|e| StoreError::AppendFailed(e.to_string()))?
            {
                let mut existing: Alert = serde_json::from_slice(&raw)?;
                existing.resolved = true;
                let value = serde_json::to_vec(&existing)?;
                self.alerts
                    .insert(&existing_key, value)
                    .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
            }
            self.alert_index
                .remove(&dedup)
                .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        }
        Ok(())
    }

    pub fn unresolved_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let mut out = Vec::new();
        for entry in self.alert_index.iter() {
            let (_, alert_key) = entry.map_err(|e| StoreError::AppendFailed(e.to_string()))?;
            if let Some(raw) = self
                .alerts
                .get(&alert_key)
                .map_err(|e| StoreError::AppendFailed(e.to_string()))?
            {
                out.push(serde_json::from_slice(&raw)?);
            }
        }
        Ok(out)
    }

    pub fn get_stage(&self) -> Result<Option<StageInfo>, StoreError> {
        match self
            .current_stage
            .get(CURRENT_STAGE_KEY)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Atomically persist the new current-stage row and clear the
    /// compliance stream for the new stage, per `StageEngine::set_stage`.
    /// Only for genuine stage transitions; a `control_mode`-only change
    /// must go through `set_control_mode` instead, which leaves compliance
    /// history untouched.
    pub fn set_stage(&self, stage: &StageInfo) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let value = serde_json::to_vec(stage)?;
        (&self.current_stage, &self.compliance)
            .transaction(|(stage_tree, compliance_tree)| {
                stage_tree.insert(CURRENT_STAGE_KEY, value.clone())?;
                compliance_tree.clear()?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        Ok(())
    }

    /// Persist a `control_mode` change against the current-stage row
    /// without touching the compliance stream. The arbiter calls this when
    /// engaging/clearing emergency stop or toggling manual mode — none of
    /// those are stage transitions, so `should_advance`'s compliance ratio
    /// must survive them untouched.
    pub fn set_control_mode(&self, mode: ControlMode) -> Result<StageInfo, StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let raw = self
            .current_stage
            .get(CURRENT_STAGE_KEY)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .ok_or(StoreError::NoStageRow)?;
        let mut stage: StageInfo = serde_json::from_slice(&raw)?;
        stage.control_mode = mode;
        let value = serde_json::to_vec(&stage)?;
        self.current_stage
            .insert(CURRENT_STAGE_KEY, value)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(stage)
    }

    fn profile_key(species: Species, stage: Stage) -> [u8; 2] {
        [species.to_wire(), stage.to_wire()]
    }

    /// Persisted profile override for `(species, stage)`, if the operator
    /// has customized it; `None` means "use the compiled-in default".
    pub fn get_profile(
        &self,
        species: Species,
        stage: Stage,
    ) -> Result<Option<ThresholdProfile>, StoreError> {
        match self
            .profiles
            .get(Self::profile_key(species, stage))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_profile(
        &self,
        species: Species,
        stage: Stage,
        profile: &ThresholdProfile,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let value = serde_json::to_vec(profile)?;
        self.profiles
            .insert(Self::profile_key(species, stage), value)
            .map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        Ok(())
    }

    /// Remove rows older than `retention_days` from the append-only
    /// streams and flush. Run on a low-frequency timer by the supervisor.
    pub fn cleanup_old(&self, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let cutoff_nanos = cutoff.timestamp_nanos_opt().unwrap_or(0) as u64;
        let mut removed = 0usize;

        for tree in [&self.readings, &self.actions, &self.compliance] {
            let keys: Vec<_> = tree
                .iter()
                .keys()
                .filter_map(Result::ok)
                .take_while(|k| {
                    k.len() >= 8 && u64::from_be_bytes(k[..8].try_into().unwrap()) < cutoff_nanos
                })
                .collect();
            for key in keys {
                tree.remove(key).map_err(|e| StoreError::AppendFailed(e.to_string()))?;
                removed += 1;
            }
        }

        self.db.flush().map_err(|e| StoreError::AppendFailed(e.to_string()))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertSeverity, ControlMode, LightMode, Species, Stage, StageMode, Validity};
    use tempfile::tempdir;

    fn sample_reading(ts: DateTime<Utc>) -> Reading {
        Reading {
            timestamp: ts,
            co2_ppm: 800,
            temperature_c_tenths: 210,
            relative_humidity_pct_tenths: 850,
            light_raw: 0,
            validity: Validity::Valid,
        }
    }

    #[test]
    fn open_runs_migrations_and_creates_trees() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.get_stage().unwrap().is_none());
    }

    #[test]
    fn append_and_read_back_readings() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let now = Utc::now();
        store.append_reading(sample_reading(now)).unwrap();
        store
            .append_reading(sample_reading(now + chrono::Duration::seconds(1)))
            .unwrap();
        assert_eq!(store.readings.len(), 2);
    }

    #[test]
    fn alert_dedup_updates_timestamp_without_new_row() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let first = Alert {
            timestamp: Utc::now(),
            kind: AlertKind::LightVerificationFailed,
            severity: AlertSeverity::Warning,
            relay: Some(Relay::Light),
            resolved: false,
        };
        store.upsert_alert(first).unwrap();
        assert_eq!(store.alerts.len(), 1);

        let second = Alert {
            timestamp: Utc::now() + chrono::Duration::seconds(30),
            ..first
        };
        store.upsert_alert(second).unwrap();
        assert_eq!(store.alerts.len(), 1, "dedup must not insert a second row");

        let unresolved = store.unresolved_alerts().unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].timestamp, second.timestamp);
    }

    #[test]
    fn resolve_alert_clears_index() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let alert = Alert {
            timestamp: Utc::now(),
            kind: AlertKind::SensorPrimaryDown,
            severity: AlertSeverity::Warning,
            relay: None,
            resolved: false,
        };
        store.upsert_alert(alert).unwrap();
        store.resolve_alert(AlertKind::SensorPrimaryDown, None).unwrap();
        assert!(store.unresolved_alerts().unwrap().is_empty());
    }

    #[test]
    fn set_stage_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let stage = StageInfo {
            mode: StageMode::Full,
            species: Species::Oyster,
            stage: Stage::Fruiting,
            stage_start_time: Utc::now(),
            expected_days: 7,
            control_mode: ControlMode::Automatic,
            stage_id: 0,
        };
        store.set_stage(&stage).unwrap();
        let reloaded = store.get_stage().unwrap().unwrap();
        assert_eq!(reloaded.expected_days, 7);
        let _ = LightMode::Off;
    }

    #[test]
    fn set_stage_clears_compliance() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .append_compliance(ComplianceRecord {
                timestamp: Utc::now(),
                stage_id: 1,
                temp_ok: true,
                rh_ok: true,
                co2_ok: true,
            })
            .unwrap();
        assert_eq!(store.recent_compliance(10).unwrap().len(), 1);

        let stage = StageInfo {
            mode: StageMode::Full,
            species: Species::Oyster,
            stage: Stage::Pinning,
            stage_start_time: Utc::now(),
            expected_days: 4,
            control_mode: ControlMode::Automatic,
            stage_id: 0,
        };
        store.set_stage(&stage).unwrap();
        assert!(store.recent_compliance(10).unwrap().is_empty());
    }

    #[test]
    fn set_control_mode_persists_mode_without_clearing_compliance() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let stage = StageInfo {
            mode: StageMode::Full,
            species: Species::Oyster,
            stage: Stage::Pinning,
            stage_start_time: Utc::now(),
            expected_days: 4,
            control_mode: ControlMode::Automatic,
            stage_id: 3,
        };
        store.set_stage(&stage).unwrap();
        store
            .append_compliance(ComplianceRecord {
                timestamp: Utc::now(),
                stage_id: 3,
                temp_ok: true,
                rh_ok: true,
                co2_ok: true,
            })
            .unwrap();

        let updated = store.set_control_mode(ControlMode::Manual).unwrap();

        assert_eq!(updated.control_mode, ControlMode::Manual);
        assert_eq!(updated.stage_id, 3);
        assert_eq!(store.get_stage().unwrap().unwrap().control_mode, ControlMode::Manual);
        assert_eq!(store.recent_compliance(10).unwrap().len(), 1);
    }
}
