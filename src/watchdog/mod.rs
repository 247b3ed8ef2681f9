//! Health checks (ambient module). Each subsystem boundary gets a small
//! counter-backed check; the supervisor records failures/successes as it
//! drives each worker, and periodically logs `Watchdog::status_flags()`.
//! Failures here never force a state transition by themselves — they
//! surface in logs and in the BLE status word so an operator (or the
//! mobile client) can see degradation before it becomes an outage.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn status(&self) -> HealthStatus;
}

/// Tracks consecutive sensor read failures against the configured alert
/// threshold (`SENSOR_ALERT_THRESHOLD`).
pub struct SensorHealth {
    consecutive_failures: AtomicU32,
    alert_threshold: u32,
}

impl SensorHealth {
    pub fn new(alert_threshold: u32) -> Self {
        Self { consecutive_failures: AtomicU32::new(0), alert_threshold }
    }

    pub fn observe(&self, consecutive_failures: u32) {
        self.consecutive_failures.store(consecutive_failures, Ordering::Relaxed);
    }
}

impl HealthCheck for SensorHealth {
    fn name(&self) -> &'static str {
        "sensors"
    }

    fn status(&self) -> HealthStatus {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures == 0 {
            HealthStatus::Healthy
        } else if failures < self.alert_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Counts GPIO write failures since the last success. A single failure is
/// degraded; two in a row (the retry budget, per the error handling
/// design) is unhealthy and should trigger the SAFETY latch upstream.
#[derive(Default)]
pub struct ActuatorHealth {
    consecutive_failures: AtomicU32,
}

impl ActuatorHealth {
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }
}

impl HealthCheck for ActuatorHealth {
    fn name(&self) -> &'static str {
        "actuators"
    }

    fn status(&self) -> HealthStatus {
        match self.consecutive_failures.load(Ordering::Relaxed) {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

#[derive(Default)]
pub struct StoreHealth {
    consecutive_failures: AtomicU32,
}

impl StoreHealth {
    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }
}

impl HealthCheck for StoreHealth {
    fn name(&self) -> &'static str {
        "store"
    }

    fn status(&self) -> HealthStatus {
        match self.consecutive_failures.load(Ordering::Relaxed) {
            0 => HealthStatus::Healthy,
            1..=2 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

/// Set when BlueZ advertisement registration fails but the GATT server
/// itself stays up (connect-by-name still works). Not a spec wire bit —
/// an operational signal only, per the design note on reserved bits.
#[derive(Default)]
pub struct BleHealth {
    advertise_degraded: AtomicBool,
    critical_notifications_dropped: AtomicU64,
}

impl BleHealth {
    pub fn set_advertise_degraded(&self, degraded: bool) {
        self.advertise_degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn record_critical_notification_dropped(&self) {
        self.critical_notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn critical_notifications_dropped(&self) -> u64 {
        self.critical_notifications_dropped.load(Ordering::Relaxed)
    }
}

impl HealthCheck for BleHealth {
    fn name(&self) -> &'static str {
        "ble"
    }

    fn status(&self) -> HealthStatus {
        if self.critical_notifications_dropped.load(Ordering::Relaxed) > 0 {
            HealthStatus::Unhealthy
        } else if self.advertise_degraded.load(Ordering::Relaxed) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Bit assignments for the diagnostic status byte logged alongside
/// `tracing` spans; not part of the wire protocol.
pub mod status_bit {
    pub const SENSORS: u8 = 0;
    pub const ACTUATORS: u8 = 1;
    pub const STORE: u8 = 2;
    pub const BLE: u8 = 3;
}

pub struct Watchdog {
    pub sensors: Arc<SensorHealth>,
    pub actuators: Arc<ActuatorHealth>,
    pub store: Arc<StoreHealth>,
    pub ble: Arc<BleHealth>,
}

impl Watchdog {
    pub fn new(sensor_alert_threshold: u32) -> Self {
        Self {
            sensors: Arc::new(SensorHealth::new(sensor_alert_threshold)),
            actuators: Arc::new(ActuatorHealth::default()),
            store: Arc::new(StoreHealth::default()),
            ble: Arc::new(BleHealth::default()),
        }
    }

    fn checks(&self) -> [&dyn HealthCheck; 4] {
        [self.sensors.as_ref(), self.actuators.as_ref(), self.store.as_ref(), self.ble.as_ref()]
    }

    /// Worst status across all checks, for a single top-line log field.
    pub fn overall(&self) -> HealthStatus {
        self.checks()
            .into_iter()
            .map(HealthCheck::status)
            .max_by_key(|s| match s {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
            })
            .unwrap_or(HealthStatus::Healthy)
    }

    /// One bit per degraded-or-worse subsystem, in `status_bit` order.
    pub fn status_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.sensors.status() != HealthStatus::Healthy {
            flags |= 1 << status_bit::SENSORS;
        }
        if self.actuators.status() != HealthStatus::Healthy {
            flags |= 1 << status_bit::ACTUATORS;
        }
        if self.store.status() != HealthStatus::Healthy {
            flags |= 1 << status_bit::STORE;
        }
        if self.ble.status() != HealthStatus::Healthy {
            flags |= 1 << status_bit::BLE;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_by_default() {
        let wd = Watchdog::new(3);
        assert_eq!(wd.overall(), HealthStatus::Healthy);
        assert_eq!(wd.status_flags(), 0);
    }

    #[test]
    fn sensor_failures_below_threshold_are_degraded_not_unhealthy() {
        let wd = Watchdog::new(3);
        wd.sensors.observe(2);
        assert_eq!(wd.sensors.status(), HealthStatus::Degraded);
        assert_eq!(wd.overall(), HealthStatus::Degraded);
    }

    #[test]
    fn actuator_two_consecutive_failures_is_unhealthy() {
        let wd = Watchdog::new(3);
        wd.actuators.record_failure();
        wd.actuators.record_failure();
        assert_eq!(wd.actuators.status(), HealthStatus::Unhealthy);
        assert_eq!(wd.overall(), HealthStatus::Unhealthy);
        assert_ne!(wd.status_flags() & (1 << status_bit::ACTUATORS), 0);
    }

    #[test]
    fn actuator_success_clears_failure_count() {
        let wd = Watchdog::new(3);
        wd.actuators.record_failure();
        wd.actuators.record_success();
        assert_eq!(wd.actuators.status(), HealthStatus::Healthy);
    }

    #[test]
    fn dropped_critical_notification_marks_ble_unhealthy() {
        let wd = Watchdog::new(3);
        wd.ble.record_critical_notification_dropped();
        assert_eq!(wd.ble.status(), HealthStatus::Unhealthy);
    }
}
