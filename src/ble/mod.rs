//! BLE Peripheral (component G).
//!
//! A single primary GATT service exposing the six characteristics in
//! `wire`. Writes are decoded synchronously on the BLE task, turned into a
//! `Command`, and handed to the supervisor over an mpsc channel — this
//! task never mutates control/stage state directly. Outbound state is
//! published through `NotifyQueue`, drained by a dedicated publish loop.

pub mod queue;
pub mod wire;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::MushPiConfig;
use crate::error::{BleError, ProtocolError};
use crate::types::{NotifyPriority, ThresholdProfile};
use crate::watchdog::BleHealth;
use queue::{Characteristic, EnqueueOutcome, Notification, NotifyQueue};

/// A BLE write, decoded and validated, ready for the supervisor to apply.
/// `control_mode` is deliberately absent — it is never set directly by a
/// write, only derived by the arbiter.
#[derive(Debug, Clone)]
pub enum Command {
    SetControlTargets(ThresholdProfile),
    SetStageState(wire::StageStateWrite),
    SetOverrideBits(wire::OverrideBitsWrite),
}

impl Command {
    fn priority(&self) -> NotifyPriority {
        match self {
            Command::SetControlTargets(_) | Command::SetStageState(_) => NotifyPriority::Medium,
            Command::SetOverrideBits(_) => NotifyPriority::High,
        }
    }
}

/// Decode a raw write payload for one of the three writable
/// characteristics. Unknown UUIDs, wrong sizes, and invalid discriminants
/// are all rejected here with a logged reason — the service never panics
/// on bad input.
pub fn decode_write(uuid: uuid::Uuid, payload: &[u8]) -> Result<Command, ProtocolError> {
    if uuid == wire::char_control_targets() {
        wire::decode_control_targets(payload).map(Command::SetControlTargets)
    } else if uuid == wire::char_stage_state() {
        wire::decode_stage_state(payload).map(Command::SetStageState)
    } else if uuid == wire::char_override_bits() {
        wire::decode_override_bits(payload).map(Command::SetOverrideBits)
    } else {
        Err(ProtocolError::UnknownDiscriminant { field: "characteristic_uuid", value: 0xFF })
    }
}

/// Owns the notify queue and the command channel to the supervisor. The
/// GATT transport itself (`run`) is a thin adapter around this.
pub struct BlePeripheral {
    queue: Arc<NotifyQueue>,
    commands_tx: mpsc::Sender<Command>,
    health: Arc<BleHealth>,
    put_timeout: Duration,
    publish_timeout: Duration,
    log_slow_publish: Duration,
    /// Last value published per characteristic, so a GATT read can answer
    /// without waiting on the next tick. Empty until the first publish.
    last_values: Mutex<HashMap<Characteristic, Vec<u8>>>,
}

impl BlePeripheral {
    pub fn new(cfg: &MushPiConfig, health: Arc<BleHealth>) -> (Self, mpsc::Receiver<Command>) {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let queue = Arc::new(NotifyQueue::new(cfg.ble_queue_max_size, cfg.ble_backpressure_policy));
        let peripheral = Self {
            queue,
            commands_tx,
            health,
            put_timeout: Duration::from_millis(cfg.ble_queue_put_timeout_ms),
            publish_timeout: Duration::from_millis(cfg.ble_publish_timeout_ms),
            log_slow_publish: Duration::from_millis(cfg.ble_log_slow_publish_ms),
            last_values: Mutex::new(HashMap::new()),
        };
        (peripheral, commands_rx)
    }

    pub fn notify_queue(&self) -> Arc<NotifyQueue> {
        self.queue.clone()
    }

    /// The most recently published value for a readable characteristic, or
    /// an empty payload if nothing has been published yet this boot.
    pub fn current_value(&self, characteristic: Characteristic) -> Vec<u8> {
        self.last_values.lock().expect("last_values lock poisoned").get(&characteristic).cloned().unwrap_or_default()
    }

    /// Enqueue a characteristic update for the publish loop. CRITICAL
    /// characteristics (`env_measurements`, `actuator_status`) honor the
    /// never-dropped invariant by waiting out `put_timeout_ms`; anything
    /// lower-priority is a best-effort synchronous attempt.
    pub async fn publish(&self, characteristic: Characteristic, priority: NotifyPriority, payload: Vec<u8>) {
        self.last_values.lock().expect("last_values lock poisoned").insert(characteristic, payload.clone());
        let notification = Notification { characteristic, priority, payload };
        if priority == NotifyPriority::Critical {
            if !self.queue.enqueue_critical(notification, self.put_timeout).await {
                self.health.record_critical_notification_dropped();
                tracing::warn!(?characteristic, "critical notification dropped after put_timeout elapsed");
            }
            return;
        }
        match self.queue.try_enqueue(notification) {
            EnqueueOutcome::Dropped(p) => {
                tracing::debug!(?characteristic, priority = ?p, "notification dropped under backpressure");
            }
            EnqueueOutcome::Evicted(p) => {
                tracing::debug!(?characteristic, evicted_priority = ?p, "lower-priority notification evicted");
            }
            EnqueueOutcome::Enqueued | EnqueueOutcome::Coalesced | EnqueueOutcome::Blocked => {}
        }
    }

    /// Drain the queue forever, handing each notification to `publisher`
    /// (the actual GATT characteristic value update + notify call). Runs
    /// as one of the supervisor's tracked tasks.
    pub async fn run_publish_loop<F, Fut>(&self, cancel: CancellationToken, mut publisher: F) -> Result<(), BleError>
    where
        F: FnMut(Notification) -> Fut,
        Fut: std::future::Future<Output = Result<(), BleError>>,
    {
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                n = self.wait_for_notification() => n,
            };
            let started = tokio::time::Instant::now();
            match tokio::time::timeout(self.publish_timeout, publisher(notification)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "characteristic publish failed"),
                Err(_) => tracing::warn!("characteristic publish timed out"),
            }
            let elapsed = started.elapsed();
            if elapsed > self.log_slow_publish {
                tracing::warn!(?elapsed, "slow characteristic publish");
            }
        }
    }

    async fn wait_for_notification(&self) -> Notification {
        loop {
            if let Some(n) = self.queue.dequeue() {
                return n;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Decode a write and forward it to the supervisor. Malformed payloads
    /// are logged and discarded, never propagated as a fatal error.
    pub async fn handle_write(&self, uuid: uuid::Uuid, payload: &[u8]) {
        match decode_write(uuid, payload) {
            Ok(command) => {
                if self.commands_tx.send(command).await.is_err() {
                    tracing::warn!("supervisor command channel closed, dropping BLE write");
                }
            }
            Err(e) => tracing::warn!(error = %e, "rejected malformed BLE write"),
        }
    }

    /// Register the GATT service and advertisement with BlueZ and serve
    /// forever. Out of scope for unit tests — this is the one function in
    /// the module that touches real D-Bus/adapter state; `handle_write`
    /// and `publish` above carry all the logic that can be exercised
    /// without real hardware.
    pub async fn run_gatt_server(self: Arc<Self>, advertise_name: String, cancel: CancellationToken) -> Result<(), BleError> {
        let session = bluer::Session::new().await.map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        let adapter = session.default_adapter().await.map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        adapter.set_powered(true).await.map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;

        let advertisement = bluer::adv::Advertisement {
            service_uuids: vec![wire::service_uuid()].into_iter().collect(),
            local_name: Some(advertise_name),
            discoverable: Some(true),
            ..Default::default()
        };
        let advertise_handle = match adapter.advertise(advertisement).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Advertisement registration can fail on constrained BlueZ
                // stacks; GATT (connect-by-name) still works, so this is
                // degraded, not fatal.
                tracing::warn!(error = %e, "BLE advertisement registration failed, continuing without it");
                self.health.set_advertise_degraded(true);
                None
            }
        };

        // A tokio mutex, not std::sync::Mutex: the guard is held across the
        // `.await` in `notifier.notify(...)` below.
        let notifiers: Arc<tokio::sync::Mutex<HashMap<Characteristic, bluer::gatt::local::CharacteristicNotifier>>> =
            Arc::new(tokio::sync::Mutex::new(HashMap::new()));

        let readable = |characteristic: Characteristic, me: Arc<Self>| -> bluer::gatt::local::CharacteristicRead {
            bluer::gatt::local::CharacteristicRead {
                read: true,
                fun: Box::new(move |_req| {
                    let me = me.clone();
                    Box::pin(async move { Ok(me.current_value(characteristic)) })
                }),
                ..Default::default()
            }
        };
        let notifiable = |characteristic: Characteristic,
                           notifiers: Arc<tokio::sync::Mutex<HashMap<Characteristic, bluer::gatt::local::CharacteristicNotifier>>>|
         -> bluer::gatt::local::CharacteristicNotify {
            bluer::gatt::local::CharacteristicNotify {
                notify: true,
                method: bluer::gatt::local::CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let notifiers = notifiers.clone();
                    Box::pin(async move {
                        notifiers.lock().await.insert(characteristic, notifier);
                    })
                })),
                ..Default::default()
            }
        };
        let writable = |uuid: uuid::Uuid, me: Arc<Self>| -> bluer::gatt::local::CharacteristicWrite {
            bluer::gatt::local::CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: bluer::gatt::local::CharacteristicWriteMethod::Fun(Box::new(move |new_value, _req| {
                    let me = me.clone();
                    Box::pin(async move {
                        me.handle_write(uuid, &new_value).await;
                        Ok(())
                    })
                })),
                ..Default::default()
            }
        };

        let characteristics = vec![
            bluer::gatt::local::Characteristic {
                uuid: wire::char_env_measurements(),
                read: Some(readable(Characteristic::EnvMeasurements, self.clone())),
                notify: Some(notifiable(Characteristic::EnvMeasurements, notifiers.clone())),
                ..Default::default()
            },
            bluer::gatt::local::Characteristic {
                uuid: wire::char_control_targets(),
                read: Some(readable(Characteristic::ControlTargets, self.clone())),
                write: Some(writable(wire::char_control_targets(), self.clone())),
                notify: Some(notifiable(Characteristic::ControlTargets, notifiers.clone())),
                ..Default::default()
            },
            bluer::gatt::local::Characteristic {
                uuid: wire::char_stage_state(),
                read: Some(readable(Characteristic::StageState, self.clone())),
                write: Some(writable(wire::char_stage_state(), self.clone())),
                notify: Some(notifiable(Characteristic::StageState, notifiers.clone())),
                ..Default::default()
            },
            bluer::gatt::local::Characteristic {
                uuid: wire::char_override_bits(),
                write: Some(writable(wire::char_override_bits(), self.clone())),
                ..Default::default()
            },
            bluer::gatt::local::Characteristic {
                uuid: wire::char_status_flags(),
                read: Some(readable(Characteristic::StatusFlags, self.clone())),
                notify: Some(notifiable(Characteristic::StatusFlags, notifiers.clone())),
                ..Default::default()
            },
            bluer::gatt::local::Characteristic {
                uuid: wire::char_actuator_status(),
                read: Some(readable(Characteristic::ActuatorStatus, self.clone())),
                notify: Some(notifiable(Characteristic::ActuatorStatus, notifiers.clone())),
                ..Default::default()
            },
        ];

        let app = bluer::gatt::local::Application {
            services: vec![bluer::gatt::local::Service { uuid: wire::service_uuid(), primary: true, characteristics, ..Default::default() }],
            ..Default::default()
        };
        let _app_handle = adapter.serve_gatt_application(app).await.map_err(|e| BleError::AdvertiseFailed(e.to_string()))?;

        // Route queued notifications to whichever characteristic currently
        // has a subscriber; no subscriber yet just drops the notify (the
        // cached value in `last_values` still answers the next read).
        let publish_result = self
            .run_publish_loop(cancel, |notification| {
                let notifiers = notifiers.clone();
                async move {
                    let mut notifiers = notifiers.lock().await;
                    if let Some(notifier) = notifiers.get_mut(&notification.characteristic) {
                        if notifier.notify(notification.payload).await.is_err() {
                            notifiers.remove(&notification.characteristic);
                        }
                    }
                    Ok(())
                }
            })
            .await;

        drop(advertise_handle);
        publish_result
    }
}
