//! Supervisor Loop (component H).
//!
//! Wires every other component together: boot sequencing, the once-per-tick
//! decide/arbitrate/apply/persist cycle, and an orderly shutdown that forces
//! every relay off before the store closes. Concurrency follows the
//! teacher's main-loop shape — a `tokio::task::JoinSet` of named workers and
//! a `CancellationToken` that brings all of them down together the moment
//! any one fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::actuators::{self, ActuatorDriver};
use crate::arbiter::Arbiter;
use crate::ble::{queue::Characteristic, wire, BlePeripheral, Command};
use crate::config::MushPiConfig;
use crate::control::ControlEngine;
use crate::error::exit_code;
use crate::sensors::{self, SensorAggregator};
use crate::stage::StageEngine;
use crate::storage::Store;
use crate::types::{Alert, AlertKind, AlertSeverity, NotifyPriority, Relay, RelayOverride, StageInfo};
use crate::watchdog::Watchdog;

/// One of the supervisor's concurrently-run tasks, named for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskName {
    Tick,
    Sensor,
    BleCommands,
    BlePublish,
    BleGatt,
    Compaction,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskName::Tick => "tick",
            TaskName::Sensor => "sensor",
            TaskName::BleCommands => "ble_commands",
            TaskName::BlePublish => "ble_publish",
            TaskName::BleGatt => "ble_gatt",
            TaskName::Compaction => "compaction",
        };
        write!(f, "{s}")
    }
}

/// Owns every long-lived component and the boot-time start of day.
pub struct Supervisor {
    cfg: MushPiConfig,
    store: Arc<Store>,
    stage: Arc<StageEngine>,
    arbiter: Arc<Arbiter>,
    control: ControlEngine,
    actuator: Arc<ActuatorDriver>,
    sensor: Arc<SensorAggregator>,
    ble: Arc<BlePeripheral>,
    watchdog: Arc<Watchdog>,
    boot_instant: Instant,
    tick_count: AtomicU64,
}

impl Supervisor {
    /// Run migrations (inside `Store::open`, fatal on failure), load stage
    /// state, force every relay off, and construct every component. Nothing
    /// here starts a background task; call `run` for that.
    pub async fn boot(cfg: MushPiConfig) -> anyhow::Result<(Self, mpsc::Receiver<Command>)> {
        let store = Arc::new(Store::open(std::path::Path::new(&cfg.db_path))?);
        let stage = Arc::new(StageEngine::load_or_default(store.clone(), cfg.compliance_threshold_pct)?);
        let arbiter = Arc::new(Arbiter::new(stage.clone()));
        let watchdog = Arc::new(Watchdog::new(crate::config::defaults::SENSOR_ALERT_THRESHOLD));

        let actuator_backend: Box<dyn actuators::RelayBackend> = Box::new(actuators::Simulated::default());
        let actuator = Arc::new(
            ActuatorDriver::init(actuator_backend, cfg.relay_lines, cfg.relays_active_low)
                .await
                .map_err(|e| anyhow::anyhow!("relay init failed: {e}"))?,
        );

        let sensor_backend: Box<dyn sensors::SensorBackend> = Box::new(sensors::Simulated::default());
        let staleness = Duration::from_secs(crate::config::defaults::STALENESS_LIMIT_S);
        let sensor = Arc::new(SensorAggregator::new(sensor_backend, staleness));

        let (ble, commands_rx) = BlePeripheral::new(&cfg, watchdog.ble.clone());
        let ble = Arc::new(ble);

        tracing::info!(
            species = stage.current().species.label(),
            stage = stage.current().stage.label(),
            control_mode = ?arbiter.control_mode(),
            "supervisor boot complete"
        );

        Ok((
            Self {
                cfg,
                store,
                stage,
                arbiter,
                control: ControlEngine::new(),
                actuator,
                sensor,
                ble,
                watchdog,
                boot_instant: Instant::now(),
                tick_count: AtomicU64::new(0),
            },
            commands_rx,
        ))
    }

    /// Spawn every worker, wait for the first failure or `cancel`, then run
    /// the shutdown sequence. Returns once shutdown has completed.
    pub async fn run(self: Arc<Self>, commands_rx: mpsc::Receiver<Command>, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut tasks = tokio::task::JoinSet::new();

        tasks.spawn({
            let me = self.clone();
            let cancel = cancel.clone();
            async move { (TaskName::Tick, me.run_tick_loop(cancel).await) }
        });
        tasks.spawn({
            let me = self.clone();
            let cancel = cancel.clone();
            async move { (TaskName::Sensor, me.run_sensor_loop(cancel).await) }
        });
        tasks.spawn({
            let me = self.clone();
            let cancel = cancel.clone();
            async move { (TaskName::BleCommands, me.run_ble_command_loop(commands_rx, cancel).await) }
        });
        tasks.spawn({
            let me = self.clone();
            let cancel = cancel.clone();
            async move { (TaskName::BlePublish, me.run_ble_publish_loop(cancel).await) }
        });
        tasks.spawn({
            let me = self.clone();
            let cancel = cancel.clone();
            async move { (TaskName::Compaction, me.run_compaction_loop(cancel).await) }
        });
        if !self.cfg.simulation_mode {
            tasks.spawn({
                let ble = self.ble.clone();
                let cancel = cancel.clone();
                async move {
                    (TaskName::BleGatt, ble.run_gatt_server("mushpi".to_string(), cancel).await.map_err(anyhow::Error::from))
                }
            });
        }

        let mut first_failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => tracing::info!(task = %name, "worker stopped"),
                Ok((name, Err(e))) => {
                    tracing::error!(task = %name, error = %e, "worker failed, bringing down supervisor");
                    first_failure.get_or_insert(e);
                    cancel.cancel();
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "worker task panicked");
                    first_failure.get_or_insert(anyhow::anyhow!("worker task panicked: {join_err}"));
                    cancel.cancel();
                }
            }
        }

        self.shutdown().await;
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One full pass of the tick pseudocode: sample, record compliance,
    /// decide, apply, persist, advance, notify. Kept as its own method so it
    /// can be driven directly by tests without the surrounding task/timer.
    async fn tick_once(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let reading = self.sensor.downgrade_if_stale(self.sensor.latest(), now);

        if reading.usable_for_control() {
            if let Err(e) = self.store.append_reading(reading) {
                self.watchdog.store.record_failure();
                tracing::warn!(error = %e, "failed to append reading");
            } else {
                self.watchdog.store.record_success();
            }
            if let Err(e) = self.stage.record_compliance(&reading) {
                tracing::warn!(error = %e, "failed to record compliance");
            }
        }

        let sensor_failures = self.sensor.consecutive_failures();
        self.watchdog.sensors.observe(sensor_failures);
        if sensor_failures >= crate::config::defaults::SENSOR_ALERT_THRESHOLD {
            let _ = self.store.upsert_alert(Alert {
                timestamp: now,
                kind: AlertKind::SensorPrimaryDown,
                severity: AlertSeverity::Warning,
                relay: None,
                resolved: false,
            });
        } else if sensor_failures == 0 {
            let _ = self.store.resolve_alert(AlertKind::SensorPrimaryDown, None);
        }

        let stage_info = self.stage.current();
        let thresholds = self.stage.thresholds_for(stage_info.stage);
        let overrides = self.arbiter.snapshot();

        let (commands, alerts) = self.control.decide(
            now,
            &reading,
            &thresholds,
            stage_info.stage_start_time,
            &overrides,
            &self.actuator,
            &self.cfg,
        );

        for alert in alerts {
            let _ = self.store.upsert_alert(alert);
        }

        for command in &commands {
            match self.actuator.apply(command.relay, command.target).await {
                Ok(()) => self.watchdog.actuators.record_success(),
                Err(e) => {
                    let failures = self.watchdog.actuators.record_failure();
                    tracing::error!(relay = %command.relay, error = %e, failures, "relay write failed");
                    let _ = self.store.upsert_alert(Alert {
                        timestamp: now,
                        kind: AlertKind::ActuatorWriteFailed,
                        severity: AlertSeverity::Critical,
                        relay: Some(command.relay),
                        resolved: false,
                    });
                    if failures >= 2 {
                        tracing::error!("repeated actuator failures, latching emergency stop");
                        self.arbiter.latch_emergency_stop()?;
                    }
                }
            }
            if let Err(e) = self.store.append_action(now, *command) {
                tracing::warn!(error = %e, "failed to append actuator command");
            }
        }

        let (advance, reason) = self.stage.should_advance();
        if advance {
            tracing::info!(reason = %reason, "advancing stage");
            self.stage.advance()?;
        }

        self.publish_tick_notifications(&reading, &commands).await;
        self.tick_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn publish_tick_notifications(&self, reading: &crate::types::Reading, commands: &[crate::types::ActuatorCommand]) {
        let uptime_s = self.boot_instant.elapsed().as_secs() as u32;
        self.ble
            .publish(
                Characteristic::EnvMeasurements,
                NotifyPriority::Critical,
                wire::encode_env_measurements(reading, uptime_s).to_vec(),
            )
            .await;
        self.ble
            .publish(
                Characteristic::ActuatorStatus,
                NotifyPriority::Critical,
                wire::encode_actuator_status(commands).to_vec(),
            )
            .await;

        let overrides = self.arbiter.snapshot();
        let control_mode = self.arbiter.control_mode();
        let flags = wire::StatusFlags {
            sensor_primary_ok: self.sensor.consecutive_failures() == 0,
            sensor_backup_ok: reading.validity != crate::types::Validity::Invalid,
            light_verification_failed_active: commands
                .iter()
                .any(|c| c.relay == Relay::Light && c.reason_code == crate::control::reason::LIGHT_VERIFICATION_FAILED),
            condensation_guard_active: commands
                .iter()
                .any(|c| c.reason_code == crate::control::reason::CONDENSATION_GUARD_ACTIVE),
            duty_limit_active_any: commands.iter().any(|c| c.reason_code == crate::control::reason::DUTY_LIMIT_REACHED),
            safety_mode: matches!(control_mode, crate::types::ControlMode::Safety),
            manual_mode: matches!(control_mode, crate::types::ControlMode::Manual),
            emergency_stop_latched: overrides.emergency_stop,
        };
        self.ble
            .publish(Characteristic::StatusFlags, NotifyPriority::High, wire::encode_status_flags(&flags).to_vec())
            .await;
    }

    async fn run_tick_loop(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(self.cfg.tick_interval_s));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let budget = Duration::from_secs(crate::config::defaults::TICK_BUDGET_S);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {
                    match tokio::time::timeout(budget, self.tick_once()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::error!(error = %e, "tick failed"),
                        Err(_) => tracing::error!("tick exceeded its time budget"),
                    }
                }
            }
        }
    }

    async fn run_sensor_loop(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(self.cfg.sample_interval_s));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let timeout = Duration::from_millis(crate::config::defaults::SENSOR_TIMEOUT_MS);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {
                    if tokio::time::timeout(timeout, self.sensor.sample_once()).await.is_err() {
                        tracing::warn!("sensor sample timed out");
                    }
                }
            }
        }
    }

    /// Apply BLE writes forwarded by the peripheral. The BLE task never
    /// touches control/stage state itself — every mutation happens here.
    async fn run_ble_command_loop(&self, mut commands_rx: mpsc::Receiver<Command>, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                c = commands_rx.recv() => match c {
                    Some(c) => c,
                    None => return Ok(()),
                },
            };
            if let Err(e) = self.apply_command(command) {
                tracing::warn!(error = %e, "failed to apply BLE command");
            }
        }
    }

    fn apply_command(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::SetControlTargets(profile) => {
                self.stage.set_profile_override(profile)?;
            }
            Command::SetStageState(w) => {
                let current = self.stage.current();
                let start_ts = chrono::DateTime::from_timestamp(i64::from(w.start_ts), 0).unwrap_or_else(Utc::now);
                let next = StageInfo {
                    mode: w.mode,
                    species: w.species,
                    stage: w.stage,
                    stage_start_time: start_ts,
                    expected_days: w.expected_days,
                    control_mode: crate::stage::control_mode_for_stage_mode(w.mode),
                    ..current
                };
                self.stage.set_stage(next)?;
                self.arbiter.set_disable_automation(w.mode == crate::types::StageMode::Manual)?;
            }
            Command::SetOverrideBits(w) => {
                if w.emergency_stop {
                    self.arbiter.latch_emergency_stop()?;
                    tracing::warn!("emergency stop latched via BLE write");
                } else {
                    self.arbiter.clear_emergency_stop()?;
                }
                self.arbiter.set_disable_automation(w.disable_automation)?;
                for (relay, forced_on) in [
                    (Relay::Light, w.light),
                    (Relay::Fan, w.fan),
                    (Relay::Mist, w.mist),
                    (Relay::Heater, w.heater),
                ] {
                    let ovr = if forced_on { RelayOverride::ForcedOn } else { RelayOverride::Auto };
                    self.arbiter.set_relay_override(relay, ovr)?;
                }
            }
        }
        Ok(())
    }

    async fn run_ble_publish_loop(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.ble
            .run_publish_loop(cancel, |notification| async move {
                tracing::trace!(characteristic = ?notification.characteristic, len = notification.payload.len(), "publish");
                Ok(())
            })
            .await
            .map_err(anyhow::Error::from)
    }

    async fn run_compaction_loop(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(3_600));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {
                    match self.store.cleanup_old(self.cfg.retention_days) {
                        Ok(removed) if removed > 0 => tracing::info!(removed, "retention cleanup"),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "retention cleanup failed"),
                    }
                }
            }
        }
    }

    /// Stop accepting new work, drain the notify queue within a bounded
    /// time, then force every relay off. Mirrors the fail-safe boot
    /// sequence: whatever else goes wrong, the chamber is left de-energized.
    async fn shutdown(&self) {
        let drain_budget = Duration::from_millis(crate::config::defaults::SHUTDOWN_TIMEOUT_MS);
        let deadline = Instant::now() + drain_budget;
        while !self.ble.notify_queue().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if let Err(e) = self.actuator.all_off().await {
            tracing::error!(error = %e, "failed to force relays off during shutdown");
        }
        tracing::info!(ticks = self.tick_count.load(Ordering::Relaxed), "supervisor shutdown complete");
    }
}

pub const EXIT_CLEAN: i32 = exit_code::CLEAN;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackpressurePolicy;
    use tempfile::tempdir;

    fn cfg(db_path: &std::path::Path) -> MushPiConfig {
        MushPiConfig {
            tick_interval_s: 30,
            sample_interval_s: 5,
            relay_lines: crate::config::RelayLines { fan: 1, mist: 2, light: 3, heater: 4 },
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
            db_path: db_path.to_string_lossy().into_owned(),
            retention_days: 30,
            simulation_mode: true,
        }
    }

    #[tokio::test]
    async fn boot_forces_relays_off_and_loads_default_stage() {
        let dir = tempdir().unwrap();
        let (sup, _rx) = Supervisor::boot(cfg(dir.path())).await.unwrap();
        assert_eq!(sup.stage.current().species, crate::types::Species::Oyster);
        for relay in Relay::ALL {
            assert_eq!(sup.actuator.current(relay), crate::types::RelayTarget::Off);
        }
    }

    #[tokio::test]
    async fn tick_once_appends_a_reading_when_sensor_is_valid() {
        let dir = tempdir().unwrap();
        let (sup, _rx) = Supervisor::boot(cfg(dir.path())).await.unwrap();
        sup.sensor.sample_once().await;
        sup.tick_once().await.unwrap();
        assert_eq!(sup.tick_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn ble_override_write_is_reflected_in_arbiter() {
        let dir = tempdir().unwrap();
        let (sup, _rx) = Supervisor::boot(cfg(dir.path())).await.unwrap();
        sup.apply_command(Command::SetOverrideBits(wire::OverrideBitsWrite {
            light: false,
            fan: true,
            mist: false,
            heater: false,
            disable_automation: false,
            emergency_stop: false,
        }))
        .unwrap();
        assert_eq!(sup.arbiter.snapshot().get(Relay::Fan), RelayOverride::ForcedOn);
    }

    #[tokio::test]
    async fn emergency_stop_write_forces_safety_mode() {
        let dir = tempdir().unwrap();
        let (sup, _rx) = Supervisor::boot(cfg(dir.path())).await.unwrap();
        sup.apply_command(Command::SetOverrideBits(wire::OverrideBitsWrite {
            light: false,
            fan: false,
            mist: false,
            heater: false,
            disable_automation: false,
            emergency_stop: true,
        }))
        .unwrap();
        assert_eq!(sup.arbiter.control_mode(), crate::types::ControlMode::Safety);
    }

    #[tokio::test]
    async fn shutdown_forces_all_relays_off() {
        let dir = tempdir().unwrap();
        let (sup, _rx) = Supervisor::boot(cfg(dir.path())).await.unwrap();
        sup.actuator.apply(Relay::Fan, crate::types::RelayTarget::On).await.unwrap();
        sup.shutdown().await;
        assert_eq!(sup.actuator.current(Relay::Fan), crate::types::RelayTarget::Off);
    }

    #[tokio::test]
    async fn set_stage_state_write_adopts_client_supplied_start_ts() {
        let dir = tempdir().unwrap();
        let (sup, _rx) = Supervisor::boot(cfg(dir.path())).await.unwrap();
        let start_ts: u32 = 1_700_000_000;
        sup.apply_command(Command::SetStageState(wire::StageStateWrite {
            mode: crate::types::StageMode::Full,
            species: crate::types::Species::Shiitake,
            stage: crate::types::Stage::Pinning,
            start_ts,
            expected_days: 10,
        }))
        .unwrap();
        assert_eq!(sup.stage.current().stage_start_time.timestamp(), i64::from(start_ts));
    }
}
