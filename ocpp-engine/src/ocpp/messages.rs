//! OCPP 2.0.1 JSON-RPC message framing
//!
//! OCPP uses JSON-RPC over WebSocket with a specific message format:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Result<Self, OcppError> {
        match code {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            other => Err(OcppError::UnknownMessageType(other)),
        }
    }
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP action names the engine knows how to classify
///
/// Unknown actions still travel through the engine as plain strings; this enum
/// only drives priority, transaction bookkeeping and report splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // CS -> CSMS
    Authorize,
    BootNotification,
    Heartbeat,
    MeterValues,
    NotifyEvent,
    NotifyMonitoringReport,
    NotifyReport,
    SecurityEventNotification,
    SignCertificate,
    StatusNotification,
    TransactionEvent,

    // CSMS -> CS
    CertificateSigned,
    GetBaseReport,
    GetVariables,
    RequestStartTransaction,
    RequestStopTransaction,
    Reset,
    SetVariables,
    TriggerMessage,

    // Bidirectional
    DataTransfer,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::MeterValues => "MeterValues",
            Action::NotifyEvent => "NotifyEvent",
            Action::NotifyMonitoringReport => "NotifyMonitoringReport",
            Action::NotifyReport => "NotifyReport",
            Action::SecurityEventNotification => "SecurityEventNotification",
            Action::SignCertificate => "SignCertificate",
            Action::StatusNotification => "StatusNotification",
            Action::TransactionEvent => "TransactionEvent",
            Action::CertificateSigned => "CertificateSigned",
            Action::GetBaseReport => "GetBaseReport",
            Action::GetVariables => "GetVariables",
            Action::RequestStartTransaction => "RequestStartTransaction",
            Action::RequestStopTransaction => "RequestStopTransaction",
            Action::Reset => "Reset",
            Action::SetVariables => "SetVariables",
            Action::TriggerMessage => "TriggerMessage",
            Action::DataTransfer => "DataTransfer",
        }
    }

    /// Messages that must jump ahead of queued bulk traffic.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Action::BootNotification | Action::Authorize)
    }

    /// Periodic meter-value traffic a full queue may shed: MeterValues and
    /// TransactionEvent(Updated). Started/Ended events are never shed.
    pub fn is_transaction_update(&self, payload: &Value) -> bool {
        match self {
            Action::MeterValues => true,
            Action::TransactionEvent => {
                payload.get("eventType").and_then(Value::as_str) == Some("Updated")
            }
            _ => false,
        }
    }

    /// Name of the item list carried by reports that may be split into
    /// sequenced parts (`seqNo` / `tbc`).
    pub fn report_items_field(&self) -> Option<&'static str> {
        match self {
            Action::NotifyReport => Some("reportData"),
            Action::NotifyMonitoringReport => Some("monitor"),
            Action::NotifyEvent => Some("eventData"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Authorize" => Ok(Action::Authorize),
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "MeterValues" => Ok(Action::MeterValues),
            "NotifyEvent" => Ok(Action::NotifyEvent),
            "NotifyMonitoringReport" => Ok(Action::NotifyMonitoringReport),
            "NotifyReport" => Ok(Action::NotifyReport),
            "SecurityEventNotification" => Ok(Action::SecurityEventNotification),
            "SignCertificate" => Ok(Action::SignCertificate),
            "StatusNotification" => Ok(Action::StatusNotification),
            "TransactionEvent" => Ok(Action::TransactionEvent),
            "CertificateSigned" => Ok(Action::CertificateSigned),
            "GetBaseReport" => Ok(Action::GetBaseReport),
            "GetVariables" => Ok(Action::GetVariables),
            "RequestStartTransaction" => Ok(Action::RequestStartTransaction),
            "RequestStopTransaction" => Ok(Action::RequestStopTransaction),
            "Reset" => Ok(Action::Reset),
            "SetVariables" => Ok(Action::SetVariables),
            "TriggerMessage" => Ok(Action::TriggerMessage),
            "DataTransfer" => Ok(Action::DataTransfer),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(
        message_id: impl Into<String>,
        action: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::Call.code(),
            &self.message_id,
            &self.action,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Length of the serialized envelope in bytes
    pub fn wire_len(&self) -> Result<usize, OcppError> {
        Ok(self.to_bytes()?.len())
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult.code(),
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError.code(),
            &self.message_id,
            self.error_code.to_string(),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        if array.len() < 3 {
            return Err(OcppError::InvalidFormat);
        }

        let msg_type = array[0].as_i64().ok_or(OcppError::InvalidFormat)?;
        let message_id = array[1]
            .as_str()
            .ok_or(OcppError::InvalidFormat)?
            .to_string();

        match MessageType::from_code(msg_type)? {
            MessageType::Call => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let action = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            MessageType::CallResult => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload: array[2].clone(),
                }))
            }
            MessageType::CallError => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let error_code_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;

                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                let error_description = array[3].as_str().unwrap_or("").to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }

    /// Serialize to the text frame sent over the WebSocket
    pub fn to_text(&self) -> Result<String, OcppError> {
        let bytes = self.to_bytes()?;
        String::from_utf8(bytes).map_err(|_| OcppError::InvalidFormat)
    }
}
