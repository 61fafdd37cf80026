//! # OCPP Engine
//!
//! Reliable OCPP 2.0.1 message exchange for charging station controllers.
//!
//! The engine sits between station application code and a WebSocket to the
//! CSMS and makes every outbound CALL survive timeouts, connection loss and
//! process restarts.
//!
//! ## Architecture
//!
//! ```text
//!  Station / TransactionManager
//!       │ enqueue / respond
//!       ▼
//! ┌─────────────────────────────────┐
//! │ Engine                          │
//! │  PendingQueue  CorrelationTable │──── QueueStore (WAL on disk)
//! │  RetryPolicy   ReportSplitter   │
//! └─────────────┬───────────────────┘
//!               │ TransportCommand / TransportEvent
//!               ▼
//! ┌─────────────────────────────────┐
//! │ Transport (plain ws / TLS wss)  │
//! └─────────────┬───────────────────┘
//!               │ OCPP-J over WebSocket
//!               ▼
//!             CSMS
//! ```
//!
//! ## Delivery guarantees
//!
//! | Guarantee | Where |
//! |-----------|-------|
//! | Persisted before `enqueue` returns | `queue::store` |
//! | At most one CALL awaiting a response | `queue::correlation` |
//! | FIFO + priority, retransmissions first | `queue::ordering` |
//! | Gapless `seqNo` per transaction | `transaction` |
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_engine::{shared, BootReason, Engine, FileQueueStore, Station, StationConfig, Transport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StationConfig::new("CS001", "ws://localhost:9000/ocpp");
//!     let store = shared(FileQueueStore::open(config.storage.clone())?);
//!
//!     let (transport, events) =
//!         Transport::new(&config.connection, &config.station_id, None)?.spawn();
//!     let (engine, requests) = Engine::new(&config, store.clone(), transport.clone())?;
//!
//!     let runner = engine.clone();
//!     tokio::spawn(async move { runner.run(events).await });
//!
//!     let station = Arc::new(Station::new(config, engine, store)?);
//!     tokio::spawn(station.clone().serve_requests(requests));
//!
//!     transport.connect();
//!     station.boot_notification(BootReason::PowerUp).await?;
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod ocpp;
pub mod queue;
pub mod retry;
pub mod splitter;
pub mod station;
pub mod transaction;
pub mod transport;

pub use config::{SecurityProfile, StationConfig};
pub use engine::{Engine, IncomingRequest, PendingResponse};
pub use error::{ConnectError, EngineError, StoreError, TransportError};
pub use station::Station;
pub use transaction::{EnhancedTransaction, TransactionManager};
pub use transport::{
    security::{FileSecurityProvider, SecurityProvider},
    Transport, TransportHandle,
};

// Re-export key types
pub use ocpp::{
    Action, BootReason, Call, CallResult, ConnectorStatus, ErrorCode, OcppMessage,
    RegistrationStatus,
};
pub use queue::{shared, FileQueueStore, MemoryQueueStore, MessagePriority, QueueStore, SharedStore};
