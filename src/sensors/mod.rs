//! Sensor Aggregator (component A).
//!
//! Samples the primary sensor cluster (CO2 + temperature + RH), falls back
//! to the backup temperature/RH sensor when the primary is invalid or
//! stale, and reads the light ADC. Raw I2C/1-Wire register access is out of
//! scope for this crate — `SensorBackend` is the hardware boundary; the
//! `Simulated` backend below is the only implementation shipped here.

mod simulated;

pub use simulated::Simulated;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::SensorError;
use crate::types::{Reading, Validity};

/// One sample from the primary cluster.
#[derive(Debug, Clone, Copy)]
pub struct PrimarySample {
    pub co2_ppm: u16,
    pub temperature_c_tenths: i16,
    pub relative_humidity_pct_tenths: u16,
}

/// One sample from the backup temperature/RH sensor.
#[derive(Debug, Clone, Copy)]
pub struct BackupSample {
    pub temperature_c_tenths: i16,
    pub relative_humidity_pct_tenths: u16,
}

/// Hardware boundary for sensor I/O. A real backend performs blocking
/// register reads on its own thread; this trait only describes the
/// contract, not the transport.
#[async_trait]
pub trait SensorBackend: Send + Sync {
    async fn read_primary(&mut self) -> Result<PrimarySample, SensorError>;
    async fn read_backup(&mut self) -> Result<BackupSample, SensorError>;
    async fn read_light(&mut self) -> Result<u16, SensorError>;
}

const RING_CAPACITY: usize = 120;

/// Owns the sensor backend, the latest `Reading`, and a bounded ring buffer
/// of recent readings for diagnostics. Runs on a dedicated worker; the
/// control tick only ever calls `latest()`, a lock-free snapshot read.
pub struct SensorAggregator {
    backend: tokio::sync::Mutex<Box<dyn SensorBackend>>,
    latest: Mutex<Reading>,
    ring: Mutex<VecDeque<Reading>>,
    staleness_limit: Duration,
    consecutive_failures: Mutex<u32>,
}

impl SensorAggregator {
    pub fn new(backend: Box<dyn SensorBackend>, staleness_limit: Duration) -> Self {
        let boot_reading = Reading {
            timestamp: Utc::now(),
            co2_ppm: 0,
            temperature_c_tenths: 0,
            relative_humidity_pct_tenths: 0,
            light_raw: 0,
            validity: Validity::Invalid,
        };
        Self {
            backend: tokio::sync::Mutex::new(backend),
            latest: Mutex::new(boot_reading),
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            staleness_limit,
            consecutive_failures: Mutex::new(0),
        }
    }

    /// Lock-free-for-callers snapshot of the most recent reading. Never
    /// blocks on sensor I/O.
    pub fn latest(&self) -> Reading {
        *self.latest.lock().expect("sensor latest lock poisoned")
    }

    /// Last `N` readings, most recent last, for diagnostics.
    pub fn recent(&self, n: usize) -> Vec<Reading> {
        let ring = self.ring.lock().expect("sensor ring lock poisoned");
        ring.iter().rev().take(n).rev().copied().collect()
    }

    /// One full sample cycle: primary, then backup fallback, then light.
    /// Never panics; sensor failures degrade the Reading's validity instead.
    pub async fn sample_once(&self) -> Reading {
        let mut backend = self.backend.lock().await;
        let now = Utc::now();

        let primary = backend.read_primary().await;
        let light = backend.read_light().await.unwrap_or(0);

        let reading = match primary {
            Ok(p) => {
                *self.consecutive_failures.lock().expect("lock poisoned") = 0;
                Reading {
                    timestamp: now,
                    co2_ppm: p.co2_ppm,
                    temperature_c_tenths: p.temperature_c_tenths,
                    relative_humidity_pct_tenths: p.relative_humidity_pct_tenths,
                    light_raw: light,
                    validity: Validity::Valid,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "primary sensor read failed, falling back to backup");
                let mut failures = self.consecutive_failures.lock().expect("lock poisoned");
                *failures = failures.saturating_add(1);
                drop(failures);

                match backend.read_backup().await {
                    Ok(b) => Reading {
                        timestamp: now,
                        co2_ppm: 0,
                        temperature_c_tenths: b.temperature_c_tenths,
                        relative_humidity_pct_tenths: b.relative_humidity_pct_tenths,
                        light_raw: light,
                        validity: Validity::Stale,
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "backup sensor read also failed");
                        Reading {
                            timestamp: now,
                            co2_ppm: 0,
                            temperature_c_tenths: 0,
                            relative_humidity_pct_tenths: 0,
                            light_raw: light,
                            validity: Validity::Invalid,
                        }
                    }
                }
            }
        };

        drop(backend);
        self.publish(reading);
        reading
    }

    /// Downgrade a reading to `stale` if it has aged past the staleness
    /// limit relative to `now`. Used by the caller when reusing a cached
    /// reading rather than sampling fresh.
    pub fn downgrade_if_stale(&self, reading: Reading, now: chrono::DateTime<Utc>) -> Reading {
        if reading.validity == Validity::Valid {
            let age = now.signed_duration_since(reading.timestamp);
            if age.to_std().unwrap_or(Duration::MAX) > self.staleness_limit {
                return Reading {
                    validity: Validity::Stale,
                    ..reading
                };
            }
        }
        reading
    }

    pub fn consecutive_failures(&self) -> u32 {
        *self.consecutive_failures.lock().expect("lock poisoned")
    }

    fn publish(&self, reading: Reading) {
        *self.latest.lock().expect("sensor latest lock poisoned") = reading;
        let mut ring = self.ring.lock().expect("sensor ring lock poisoned");
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(reading);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlakyBackend {
        fail_primary: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SensorBackend for FlakyBackend {
        async fn read_primary(&mut self) -> Result<PrimarySample, SensorError> {
            if self.fail_primary.load(Ordering::SeqCst) {
                Err(SensorError::Io("primary down".into()))
            } else {
                Ok(PrimarySample {
                    co2_ppm: 800,
                    temperature_c_tenths: 220,
                    relative_humidity_pct_tenths: 850,
                })
            }
        }

        async fn read_backup(&mut self) -> Result<BackupSample, SensorError> {
            Ok(BackupSample {
                temperature_c_tenths: 215,
                relative_humidity_pct_tenths: 840,
            })
        }

        async fn read_light(&mut self) -> Result<u16, SensorError> {
            Ok(50)
        }
    }

    #[tokio::test]
    async fn primary_reading_is_valid() {
        let backend = FlakyBackend {
            fail_primary: Arc::new(AtomicBool::new(false)),
        };
        let agg = SensorAggregator::new(Box::new(backend), Duration::from_secs(30));
        let r = agg.sample_once().await;
        assert_eq!(r.validity, Validity::Valid);
        assert_eq!(r.co2_ppm, 800);
    }

    #[tokio::test]
    async fn primary_failure_falls_back_to_stale_backup() {
        let fail = Arc::new(AtomicBool::new(true));
        let backend = FlakyBackend {
            fail_primary: fail.clone(),
        };
        let agg = SensorAggregator::new(Box::new(backend), Duration::from_secs(30));
        let r = agg.sample_once().await;
        assert_eq!(r.validity, Validity::Stale);
        assert_eq!(r.temperature_c_tenths, 215);
        assert_eq!(agg.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn latest_reflects_last_sample() {
        let backend = FlakyBackend {
            fail_primary: Arc::new(AtomicBool::new(false)),
        };
        let agg = SensorAggregator::new(Box::new(backend), Duration::from_secs(30));
        agg.sample_once().await;
        let latest = agg.latest();
        assert_eq!(latest.co2_ppm, 800);
    }
}
