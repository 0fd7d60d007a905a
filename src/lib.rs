pub mod barcode;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod mes;
pub mod model;
pub mod orchestrator;
pub mod replicator;
pub mod transport;

pub use config::GatewayConfig;
pub use error::{StorageError, TransportError};
pub use events::{EngineEvent, EventBus};
