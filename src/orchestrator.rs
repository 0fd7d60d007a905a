//! Gateway Orchestrator (C7): owns the Session state machine and routes
//! commands (spec §4.6). All state mutation happens on one logical task
//! (spec §5); I/O (writing to the transport, appending to the buffer) is
//! delegated to the methods below but never runs concurrently with another
//! mutation, matching the single-threaded-for-mutation discipline the spec
//! requires. The strict-ordering discipline over device frames is grounded
//! on `runtime/sequencer.rs`'s `OrderingValidator` in spirit, reimplemented
//! here directly against `seq` rather than a ring-buffer ticket.

use crate::barcode;
use crate::buffer::DurableBuffer;
use crate::clock;
use crate::device::{DeviceSessions, FrameEffect};
use crate::events::{DeviceSnapshot, EngineEvent, EventBus};
use crate::model::{Increment, IncrementSource, Order, Session, SessionPhase, Station};
use crate::transport::{Frame, OutboundCommand, Rs485Transport};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Operator decision awaited after a `STALE_COUNTER_DETECTED` event
/// (spec §4.6).
#[derive(Debug, Clone, Copy)]
pub enum StaleCounterDecision {
    KeepCounter,
    RequireManualReset,
}

#[derive(Debug)]
pub enum CommandError {
    NoStationSelected,
    OrderNotOpen,
    WrongPhase { expected: &'static str },
    InvalidUpcFormat,
    UpcMismatch,
}

/// The command surface a presentation layer drives (spec §4.6); this binary
/// exposes it over a channel rather than shipping a GUI/TUI of its own.
pub enum OrchestratorCommand {
    SelectStationAndOrder { station: Station, order: Order },
    ValidateUpc { device_id: String, code: String },
    ResolveStaleCounter(StaleCounterDecision),
    RequestOrderChange { device_id: String, close: bool },
}

pub struct GatewayOrchestrator {
    session: Session,
    devices: DeviceSessions,
    buffer: Arc<DurableBuffer>,
    transport: Arc<Mutex<Rs485Transport>>,
    events: Arc<EventBus>,
    user_id: u64,
    pending_stale: Option<(String, i64)>,
    close_requested: bool,
}

impl GatewayOrchestrator {
    pub fn new(
        buffer: Arc<DurableBuffer>,
        transport: Arc<Mutex<Rs485Transport>>,
        events: Arc<EventBus>,
        user_id: u64,
    ) -> Self {
        Self {
            session: Session::new(),
            devices: DeviceSessions::new(),
            buffer,
            transport,
            events,
            user_id,
            pending_stale: None,
            close_requested: false,
        }
    }

    /// Whether the current (or most recently completed) drain was requested
    /// as an order close rather than a plain order change, so the caller
    /// knows whether to invoke `MesClient::close_order` once draining
    /// finishes (spec §4.6).
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn current_order(&self) -> Option<&Order> {
        self.session.order.as_ref()
    }

    pub fn current_station_id(&self) -> Option<u64> {
        self.session.station.as_ref().map(|s| s.id)
    }

    /// Operator-requested `PRODUCING → DRAINING` transition, e.g. from a
    /// "change order" or "close order" command (spec §4.6).
    pub async fn request_order_change(&mut self, device_id: &str, close: bool) {
        self.begin_drain(device_id, close).await;
    }

    fn transition_to(&mut self, to: SessionPhase) {
        let from = self.session.phase();
        self.session.phase = Some(to);
        self.events.publish(EngineEvent::StateChanged { from, to });
    }

    /// `IDLE → ORDER_SELECTED`. Station must be resolvable; order must be
    /// open and have `quantityPending > 0`.
    pub fn select_station_and_order(
        &mut self,
        station: Station,
        order: Order,
    ) -> Result<(), CommandError> {
        if self.session.phase() != SessionPhase::Idle {
            return Err(CommandError::WrongPhase { expected: "IDLE" });
        }
        if !order.is_open() {
            return Err(CommandError::OrderNotOpen);
        }
        self.session.station = Some(station);
        self.session.order = Some(order);
        self.transition_to(SessionPhase::OrderSelected);
        // Recipe load is advisory and has no bearing on this transition.
        self.transition_to(SessionPhase::AwaitingUpc);
        Ok(())
    }

    /// `AWAITING_UPC → PRODUCING` when `code == order.productUPC` (cleaned
    /// digit comparison). Snapshots `counterBaseline`, activates the device.
    pub async fn validate_upc(&mut self, device_id: &str, code: &str) -> Result<(), CommandError> {
        if self.session.phase() != SessionPhase::AwaitingUpc {
            return Err(CommandError::WrongPhase {
                expected: "AWAITING_UPC",
            });
        }
        if !barcode::format_is_valid(code) {
            return Err(CommandError::InvalidUpcFormat);
        }
        let order = self
            .session
            .order
            .clone()
            .ok_or(CommandError::NoStationSelected)?;
        if !barcode::matches_order(code, &order.product_upc) {
            return Err(CommandError::UpcMismatch);
        }

        let counter = self.devices.get(device_id).map(|d| d.counter).unwrap_or(0);
        if counter > 0 {
            self.pending_stale = Some((device_id.to_string(), counter));
            // Halt the device without losing its ACTIVE state while the
            // operator decides (spec §4.3: PAUSAR/REANUDAR flow control).
            self.send_command(device_id, OutboundCommand::Pausar).await;
            self.events.publish(EngineEvent::StaleCounterDetected {
                device_id: device_id.to_string(),
                counter,
                delta: counter,
            });
            return Ok(());
        }

        self.activate_production(device_id, &order, 0).await
    }

    /// Operator's answer to a `STALE_COUNTER_DETECTED` event.
    pub async fn resolve_stale_counter(
        &mut self,
        decision: StaleCounterDecision,
    ) -> Result<(), CommandError> {
        let (device_id, counter) = self
            .pending_stale
            .take()
            .ok_or(CommandError::WrongPhase {
                expected: "awaiting stale-counter decision",
            })?;
        let order = self
            .session
            .order
            .clone()
            .ok_or(CommandError::NoStationSelected)?;

        match decision {
            StaleCounterDecision::KeepCounter => {
                self.send_command(&device_id, OutboundCommand::Reanudar).await;
                self.activate_production(&device_id, &order, counter).await
            }
            StaleCounterDecision::RequireManualReset => {
                // Stay in AWAITING_UPC; operator must re-validate after the
                // device itself is reset. Resume device flow so it can emit
                // the RESET/CONT frames the operator needs to see.
                self.send_command(&device_id, OutboundCommand::Reanudar).await;
                Ok(())
            }
        }
    }

    async fn activate_production(
        &mut self,
        device_id: &str,
        order: &Order,
        initial_counter: i64,
    ) -> Result<(), CommandError> {
        self.session.counter_baseline = initial_counter;
        self.session.validated_upc = Some(order.product_upc.clone());

        self.send_command(device_id, OutboundCommand::Activar {
            product_code: order.product_code.clone(),
        })
        .await;
        self.send_command(device_id, OutboundCommand::Meta {
            quantity: order.quantity_pending,
        })
        .await;

        if initial_counter > 0 {
            self.append_increment(device_id, initial_counter, IncrementSource::Initial)
                .await;
        }

        self.transition_to(SessionPhase::Producing);
        Ok(())
    }

    /// Dispatches one inbound frame: updates device state, and for a device
    /// delta during PRODUCING, appends the increment and publishes
    /// `COUNT_UPDATED`. Frame processing is strictly FIFO within this
    /// method's caller (the single Orchestrator task), so deltas observed
    /// by the buffer are in physical arrival order (spec §5).
    pub async fn handle_frame(&mut self, frame: Frame) {
        let device_id = frame.device_id.clone();
        let effect = self.devices.apply_frame(&frame);

        match effect {
            FrameEffect::None => {}
            FrameEffect::DeviceReset { previous_counter } => {
                self.events.publish(EngineEvent::DeviceReset {
                    device_id: device_id.clone(),
                    previous_counter,
                    snapshot: self.devices.snapshot(&device_id).map(DeviceSnapshot),
                });
            }
            FrameEffect::LecturaCompleted => {
                self.events.publish(EngineEvent::LecturaCompleted {
                    device_id: device_id.clone(),
                });
            }
            FrameEffect::Delta(delta) => {
                if self.session.phase() == SessionPhase::Producing {
                    self.append_increment(&device_id, delta, IncrementSource::Device)
                        .await;
                    self.maybe_enter_draining(&device_id).await;
                }
            }
        }

        if matches!(frame.tag, crate::transport::FrameTag::Heartbeat) {
            let snapshot = self.devices.snapshot(&device_id).map(DeviceSnapshot);
            self.events
                .publish(EngineEvent::DeviceHeartbeat { device_id, snapshot });
        }
    }

    async fn maybe_enter_draining(&mut self, device_id: &str) {
        let Some(order) = self.session.order.clone() else {
            return;
        };
        let counter = self.devices.get(device_id).map(|d| d.counter).unwrap_or(0);
        if counter >= order.quantity_pending {
            self.begin_drain(device_id, false).await;
        }
    }

    async fn append_increment(
        &mut self,
        device_id: &str,
        quantity: i64,
        source: IncrementSource,
    ) {
        let Some(order) = self.session.order.clone() else {
            return;
        };
        let Some(station) = self.session.station.clone() else {
            return;
        };
        let upc = self
            .session
            .validated_upc
            .clone()
            .unwrap_or_else(|| order.product_upc.clone());
        let occurred_at = clock::now_utc();
        let fingerprint = clock::fingerprint(&order.code, &upc, &occurred_at, station.id);

        let increment = Increment {
            seq: 0,
            order_code: order.code.clone(),
            upc,
            quantity,
            occurred_at,
            source,
            station_id: station.id,
            user_id: self.user_id,
            order_id: order.id,
            synced: false,
            rejected: false,
            fingerprint,
        };

        match self.buffer.append(&increment).await {
            Ok(seq) => {
                self.events.publish(EngineEvent::CountUpdated {
                    order_code: increment.order_code,
                    seq,
                    quantity,
                });
            }
            Err(e) => {
                warn!("failed to append increment: {e}");
                self.transition_to(SessionPhase::Error);
                self.events.publish(EngineEvent::EngineFailed {
                    reason: format!("durable buffer append failed: {e}"),
                });
            }
        }
        let _ = device_id;
    }

    /// `PRODUCING → DRAINING` on operator `ChangeOrder`/`CloseOrder` or meta
    /// reached. Sends `DESACTIVAR`; the caller's Replicator signal and the
    /// drain-complete wait happen outside this method (spec §5 task split).
    pub async fn begin_drain(&mut self, device_id: &str, close_requested: bool) {
        if self.session.phase() != SessionPhase::Producing {
            return;
        }
        self.send_command(device_id, OutboundCommand::Desactivar).await;
        self.transition_to(SessionPhase::Draining);
        self.close_requested = close_requested;
    }

    /// `DRAINING → IDLE` once the Replicator reports `PendingCount()==0` or
    /// the grace deadline elapses. Clears session fields.
    pub fn complete_drain(&mut self) {
        if self.session.phase() != SessionPhase::Draining {
            return;
        }
        self.transition_to(SessionPhase::Idle);
        self.session.order = None;
        self.session.validated_upc = None;
        self.session.counter_baseline = 0;
        self.close_requested = false;
    }

    /// Marks devices that have gone quiet past the heartbeat timeout as
    /// disconnected; run periodically by the Housekeeper task (spec §5).
    pub fn sweep_stale_devices(&mut self) -> Vec<String> {
        self.devices.sweep_stale()
    }

    pub async fn handle_command(&mut self, command: OrchestratorCommand) -> Result<(), CommandError> {
        match command {
            OrchestratorCommand::SelectStationAndOrder { station, order } => {
                self.select_station_and_order(station, order)
            }
            OrchestratorCommand::ValidateUpc { device_id, code } => {
                self.validate_upc(&device_id, &code).await
            }
            OrchestratorCommand::ResolveStaleCounter(decision) => {
                self.resolve_stale_counter(decision).await
            }
            OrchestratorCommand::RequestOrderChange { device_id, close } => {
                self.request_order_change(&device_id, close).await;
                Ok(())
            }
        }
    }

    async fn send_command(&self, device_id: &str, command: OutboundCommand) {
        let text = command.to_frame_text(device_id);
        let mut transport = self.transport.lock().await;
        if let Err(e) = transport.write_frame(&text).await {
            warn!("failed to write command {text}: {e}");
        }
    }
}
