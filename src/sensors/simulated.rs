//! Default `SensorBackend` used when `SIMULATION_MODE` is set, and in
//! tests. Generates plausible readings with jitter instead of touching
//! real hardware.

use async_trait::async_trait;
use rand::Rng;

use super::{BackupSample, PrimarySample, SensorBackend};
use crate::error::SensorError;

pub struct Simulated {
    co2_ppm: u16,
    temperature_c_tenths: i16,
    relative_humidity_pct_tenths: u16,
    light_raw: u16,
}

impl Simulated {
    pub fn new() -> Self {
        Self {
            co2_ppm: 900,
            temperature_c_tenths: 210,
            relative_humidity_pct_tenths: 850,
            light_raw: 0,
        }
    }

    fn jitter_i16(base: i16, spread: i16) -> i16 {
        let mut rng = rand::thread_rng();
        base + rng.gen_range(-spread..=spread)
    }

    fn jitter_u16(base: u16, spread: u16) -> u16 {
        let mut rng = rand::thread_rng();
        let delta: i32 = rng.gen_range(-(i32::from(spread))..=i32::from(spread));
        (i32::from(base) + delta).clamp(0, i32::from(u16::MAX)) as u16
    }
}

impl Default for Simulated {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorBackend for Simulated {
    async fn read_primary(&mut self) -> Result<PrimarySample, SensorError> {
        Ok(PrimarySample {
            co2_ppm: Self::jitter_u16(self.co2_ppm, 20),
            temperature_c_tenths: Self::jitter_i16(self.temperature_c_tenths, 2),
            relative_humidity_pct_tenths: Self::jitter_u16(
                self.relative_humidity_pct_tenths,
                10,
            ),
        })
    }

    async fn read_backup(&mut self) -> Result<BackupSample, SensorError> {
        Ok(BackupSample {
            temperature_c_tenths: Self::jitter_i16(self.temperature_c_tenths, 3),
            relative_humidity_pct_tenths: Self::jitter_u16(
                self.relative_humidity_pct_tenths,
                15,
            ),
        })
    }

    async fn read_light(&mut self) -> Result<u16, SensorError> {
        Ok(self.light_raw)
    }
}
