//! OCPP 2.0.1 protocol layer
//!
//! - `types`: OCPP data structures the engine builds or inspects
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)

pub mod types;
pub mod messages;

pub use types::*;
pub use messages::*;
