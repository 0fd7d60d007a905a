//! Shared data types passed between components (spec §3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: u64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub code: String,
    pub product_code: String,
    pub product_upc: String,
    pub quantity_target: i64,
    pub quantity_pending: i64,
    pub closed: bool,
    pub priority: Option<String>,
}

impl Order {
    pub fn is_open(&self) -> bool {
        !self.closed && self.quantity_pending > 0
    }
}

/// Source of an increment: a real device delta, or the synthetic row created
/// when the operator keeps a stale counter at UPC-validation time (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncrementSource {
    Device,
    Initial,
}

impl IncrementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncrementSource::Device => "DEVICE",
            IncrementSource::Initial => "INITIAL",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "INITIAL" => IncrementSource::Initial,
            _ => IncrementSource::Device,
        }
    }
}

/// One durable unit of production destined for the MES (§3, §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Increment {
    pub seq: i64,
    pub order_code: String,
    pub upc: String,
    pub quantity: i64,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
    pub source: IncrementSource,
    pub station_id: u64,
    pub user_id: u64,
    pub order_id: u64,
    pub synced: bool,
    pub rejected: bool,
    pub fingerprint: String,
}

/// Per-device runtime record owned by the Device Session component (§3, §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub device_id: String,
    pub counter: i64,
    pub total: i64,
    pub target: i64,
    pub active: bool,
    pub connected: bool,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    pub inactive_seconds: i64,
    pub log_counter: i64,
    pub last_frame_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl DeviceState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            counter: 0,
            total: 0,
            target: 0,
            active: false,
            connected: true,
            last_heartbeat_at: None,
            inactive_seconds: 0,
            log_counter: 0,
            last_frame_at: None,
        }
    }
}

/// The engine's top-level state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Idle,
    OrderSelected,
    AwaitingUpc,
    Producing,
    Draining,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub phase: Option<SessionPhase>,
    pub station: Option<Station>,
    pub order: Option<Order>,
    pub validated_upc: Option<String>,
    pub counter_baseline: i64,
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Some(SessionPhase::Idle),
            ..Default::default()
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.unwrap_or(SessionPhase::Idle)
    }
}
