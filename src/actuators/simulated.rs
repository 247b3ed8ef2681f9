//! Default `RelayBackend` used when `SIMULATION_MODE` is set. Tracks line
//! levels in memory instead of touching real GPIO hardware.

use async_trait::async_trait;
use std::collections::HashMap;

use super::RelayBackend;
use crate::error::ActuatorError;

pub struct Simulated {
    lines: HashMap<u8, bool>,
    /// When set, the next write fails — used to exercise the
    /// retry-then-SAFETY-latch path in tests.
    pub fail_next_write: bool,
}

impl Simulated {
    pub fn new() -> Self {
        Self {
            lines: HashMap::new(),
            fail_next_write: false,
        }
    }

    pub fn line_level(&self, line: u8) -> Option<bool> {
        self.lines.get(&line).copied()
    }
}

impl Default for Simulated {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayBackend for Simulated {
    async fn write_line(&mut self, line: u8, level_high: bool) -> Result<(), ActuatorError> {
        if self.fail_next_write {
            self.fail_next_write = false;
            return Err(ActuatorError::GpioWriteFailed {
                relay: "unknown",
                reason: "simulated failure".into(),
            });
        }
        self.lines.insert(line, level_high);
        Ok(())
    }
}
