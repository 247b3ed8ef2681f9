//! Actuator Driver (component B).
//!
//! A pure mapping from logical relay to GPIO line level, parameterized by
//! `active_low`. Writes are idempotent: commanding a relay to a state it
//! already holds is a no-op that still returns success. Raw GPIO line
//! toggling is out of scope for this crate — `RelayBackend` is the
//! hardware boundary.

mod simulated;

pub use simulated::Simulated;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::RelayLines;
use crate::error::ActuatorError;
use crate::types::{Relay, RelayTarget};

/// Hardware boundary for a single relay write. A real backend sets a GPIO
/// line; this trait only describes the contract.
#[async_trait]
pub trait RelayBackend: Send + Sync {
    async fn write_line(&mut self, line: u8, level_high: bool) -> Result<(), ActuatorError>;
}

/// Owns the logical relay state and translates it to line-level writes.
/// On construction and on `shutdown()`, every relay is forced OFF before
/// any other action, per the fail-safe contract.
pub struct ActuatorDriver {
    backend: tokio::sync::Mutex<Box<dyn RelayBackend>>,
    lines: RelayLines,
    active_low: bool,
    state: Mutex<HashMap<Relay, RelayTarget>>,
}

impl ActuatorDriver {
    /// Construct the driver and force every relay OFF before returning.
    /// Propagates a `gpio_write_failed` error if boot-time fail-safe fails.
    pub async fn init(
        backend: Box<dyn RelayBackend>,
        lines: RelayLines,
        active_low: bool,
    ) -> Result<Self, ActuatorError> {
        let driver = Self {
            backend: tokio::sync::Mutex::new(backend),
            lines,
            active_low,
            state: Mutex::new(HashMap::new()),
        };
        for relay in Relay::ALL {
            driver.apply(relay, RelayTarget::Off).await?;
        }
        Ok(driver)
    }

    /// Idempotent relay write: a no-op if the relay already holds `target`,
    /// but still returns `Ok`. Does not retry internally on failure — the
    /// caller (control/supervisor) owns the retry-then-SAFETY-latch policy.
    pub async fn apply(&self, relay: Relay, target: RelayTarget) -> Result<(), ActuatorError> {
        {
            let state = self.state.lock().expect("actuator state lock poisoned");
            if state.get(&relay) == Some(&target) {
                return Ok(());
            }
        }

        let line = self.lines.line_for(relay);
        let level_high = target.is_on() != self.active_low;

        let mut backend = self.backend.lock().await;
        backend.write_line(line, level_high).await.map_err(|_| {
            ActuatorError::GpioWriteFailed {
                relay: relay.label(),
                reason: "backend write failed".into(),
            }
        })?;
        drop(backend);

        self.state
            .lock()
            .expect("actuator state lock poisoned")
            .insert(relay, target);
        Ok(())
    }

    pub fn current(&self, relay: Relay) -> RelayTarget {
        *self
            .state
            .lock()
            .expect("actuator state lock poisoned")
            .get(&relay)
            .unwrap_or(&RelayTarget::Off)
    }

    /// Force every relay OFF. Called on shutdown per the fail-safe contract;
    /// also the implementation of the emergency-stop synchronous guarantee.
    pub async fn all_off(&self) -> Result<(), ActuatorError> {
        for relay in Relay::ALL {
            self.apply(relay, RelayTarget::Off).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingBackend {
        writes: Arc<AsyncMutex<Vec<(u8, bool)>>>,
        fail_next: bool,
    }

    #[async_trait]
    impl RelayBackend for RecordingBackend {
        async fn write_line(&mut self, line: u8, level_high: bool) -> Result<(), ActuatorError> {
            if self.fail_next {
                return Err(ActuatorError::GpioWriteFailed {
                    relay: "test",
                    reason: "injected".into(),
                });
            }
            self.writes.lock().await.push((line, level_high));
            Ok(())
        }
    }

    fn lines() -> RelayLines {
        RelayLines {
            fan: 1,
            mist: 2,
            light: 3,
            heater: 4,
        }
    }

    #[tokio::test]
    async fn boot_forces_all_relays_off() {
        let writes = Arc::new(AsyncMutex::new(Vec::new()));
        let backend = RecordingBackend {
            writes: writes.clone(),
            fail_next: false,
        };
        let driver = ActuatorDriver::init(Box::new(backend), lines(), true)
            .await
            .unwrap();
        assert_eq!(writes.lock().await.len(), 4);
        for relay in Relay::ALL {
            assert_eq!(driver.current(relay), RelayTarget::Off);
        }
    }

    #[tokio::test]
    async fn repeated_on_write_is_idempotent() {
        let writes = Arc::new(AsyncMutex::new(Vec::new()));
        let backend = RecordingBackend {
            writes: writes.clone(),
            fail_next: false,
        };
        let driver = ActuatorDriver::init(Box::new(backend), lines(), true)
            .await
            .unwrap();
        writes.lock().await.clear();

        driver.apply(Relay::Fan, RelayTarget::On).await.unwrap();
        driver.apply(Relay::Fan, RelayTarget::On).await.unwrap();
        assert_eq!(writes.lock().await.len(), 1, "second ON write must be a no-op");
    }

    #[tokio::test]
    async fn active_low_inverts_line_level() {
        let writes = Arc::new(AsyncMutex::new(Vec::new()));
        let backend = RecordingBackend {
            writes: writes.clone(),
            fail_next: false,
        };
        let driver = ActuatorDriver::init(Box::new(backend), lines(), true)
            .await
            .unwrap();
        writes.lock().await.clear();

        driver.apply(Relay::Fan, RelayTarget::On).await.unwrap();
        let recorded = writes.lock().await.clone();
        assert_eq!(recorded, vec![(1, false)], "active_low ON must drive line low");
    }
}
