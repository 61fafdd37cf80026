//! Charging station facade
//!
//! Typed OCPP operations on top of the engine: registration, heartbeat,
//! connector status and transactions, plus answers to the CSMS requests the
//! station supports.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StationConfig;
use crate::engine::{Engine, IncomingRequest, PendingResponse};
use crate::error::EngineError;
use crate::ocpp::{
    Action, BootNotificationRequest, BootNotificationResponse, BootReason, ChargingStationInfo,
    ConnectorStatus, ErrorCode, HeartbeatRequest, HeartbeatResponse, MeterValue,
    MeterValuesRequest, NotifyReportRequest, RegistrationStatus, ReportData,
    StatusNotificationRequest, StoppedReason, TriggerReason,
};
use crate::queue::{MessagePriority, SharedStore};
use crate::transaction::{EnhancedTransaction, TransactionManager};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

pub struct Station {
    config: StationConfig,
    engine: Engine,
    transactions: Arc<TransactionManager>,
    heartbeat_interval: Mutex<Duration>,
    /// Last reported status per (evse, connector)
    connectors: Mutex<BTreeMap<(i32, i32), ConnectorStatus>>,
}

impl Station {
    pub fn new(config: StationConfig, engine: Engine, store: SharedStore) -> Result<Self, EngineError> {
        let transactions = Arc::new(TransactionManager::new(
            engine.clone(),
            store,
            &config.metering,
        )?);

        let connectors = (1..=config.evse_count as i32)
            .map(|evse_id| ((evse_id, 1), ConnectorStatus::Available))
            .collect();

        Ok(Self {
            config,
            engine,
            transactions,
            heartbeat_interval: Mutex::new(DEFAULT_HEARTBEAT_INTERVAL),
            connectors: Mutex::new(connectors),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Interval from the last BootNotification response
    pub fn heartbeat_interval(&self) -> Duration {
        *self.heartbeat_interval.lock()
    }

    pub fn charging_station_info(&self) -> ChargingStationInfo {
        ChargingStationInfo {
            model: self.config.model.clone(),
            vendor_name: self.config.vendor.clone(),
            serial_number: self.config.serial_number.clone(),
            firmware_version: self.config.firmware_version.clone(),
        }
    }

    fn enqueue_boot(&self, reason: BootReason) -> Result<PendingResponse, EngineError> {
        let request = BootNotificationRequest {
            charging_station: self.charging_station_info(),
            reason,
        };
        self.engine
            .enqueue(Action::BootNotification.as_str(), request, MessagePriority::High)
    }

    /// Register with the CSMS and wait for the answer
    pub async fn boot_notification(
        &self,
        reason: BootReason,
    ) -> Result<BootNotificationResponse, EngineError> {
        let result = self.enqueue_boot(reason)?.wait().await?;
        let response: BootNotificationResponse = result.parse_payload()?;

        self.engine
            .set_registration_accepted(response.status == RegistrationStatus::Accepted);
        if response.interval > 0 {
            *self.heartbeat_interval.lock() = Duration::from_secs(response.interval as u64);
        }
        info!(
            "Station: BootNotification {:?} (interval {}s)",
            response.status, response.interval
        );
        Ok(response)
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatResponse, EngineError> {
        let result = self
            .engine
            .enqueue(Action::Heartbeat.as_str(), HeartbeatRequest {}, MessagePriority::Normal)?
            .wait()
            .await?;
        let response: HeartbeatResponse = result.parse_payload()?;
        debug!("Station: Heartbeat, CSMS time {}", response.current_time);
        Ok(response)
    }

    pub fn status_notification(
        &self,
        evse_id: i32,
        connector_id: i32,
        status: ConnectorStatus,
    ) -> Result<PendingResponse, EngineError> {
        self.connectors.lock().insert((evse_id, connector_id), status);
        let request = StatusNotificationRequest {
            timestamp: Utc::now(),
            connector_status: status,
            evse_id,
            connector_id,
        };
        self.engine
            .enqueue(Action::StatusNotification.as_str(), request, MessagePriority::Normal)
    }

    /// Report the last known status of every connector
    pub fn status_notification_all(&self) -> Result<Vec<PendingResponse>, EngineError> {
        let connectors: Vec<_> = self
            .connectors
            .lock()
            .iter()
            .map(|(&(evse_id, connector_id), &status)| (evse_id, connector_id, status))
            .collect();

        connectors
            .into_iter()
            .map(|(evse_id, connector_id, status)| {
                self.status_notification(evse_id, connector_id, status)
            })
            .collect()
    }

    /// Readings taken outside a transaction
    pub fn meter_values(
        &self,
        evse_id: i32,
        meter_value: Vec<MeterValue>,
    ) -> Result<PendingResponse, EngineError> {
        let request = MeterValuesRequest {
            evse_id,
            meter_value,
        };
        self.engine
            .enqueue(Action::MeterValues.as_str(), request, MessagePriority::Normal)
    }

    /// Queue a device-model report. The engine splits it into `tbc` parts
    /// when it exceeds the CSMS message size.
    pub fn notify_report(
        &self,
        request_id: i32,
        report_data: Vec<ReportData>,
    ) -> Result<PendingResponse, EngineError> {
        let request = NotifyReportRequest {
            request_id,
            generated_at: Utc::now(),
            seq_no: 0,
            tbc: false,
            report_data: Some(report_data),
        };
        self.engine
            .enqueue(Action::NotifyReport.as_str(), request, MessagePriority::Normal)
    }

    /// Occupy the EVSE's connector and open the transaction
    pub fn start_transaction(
        &self,
        record: EnhancedTransaction,
        trigger_reason: TriggerReason,
        meter_start: Option<MeterValue>,
    ) -> Result<PendingResponse, EngineError> {
        self.status_notification(record.evse_id, 1, ConnectorStatus::Occupied)?;
        self.transactions.start(record, trigger_reason, meter_start)
    }

    /// Close the transaction and free the EVSE's connector
    pub fn end_transaction(
        &self,
        transaction_id: &str,
        stopped_reason: StoppedReason,
        trigger_reason: TriggerReason,
        meter_stop: Option<MeterValue>,
    ) -> Result<PendingResponse, EngineError> {
        let evse_id = self
            .transactions
            .get(transaction_id)
            .map(|tx| tx.evse_id)
            .ok_or_else(|| EngineError::UnknownTransaction(transaction_id.to_string()))?;
        let pending =
            self.transactions
                .end(transaction_id, stopped_reason, trigger_reason, meter_stop)?;
        self.status_notification(evse_id, 1, ConnectorStatus::Available)?;
        Ok(pending)
    }

    /// Answer one CSMS request
    pub fn handle_request(&self, request: &IncomingRequest) -> Result<(), EngineError> {
        match request.action.parse::<Action>() {
            Ok(Action::TriggerMessage) => self.handle_trigger(request),
            _ => {
                debug!("Station: {} not supported", request.action);
                self.engine.respond_error(
                    &request.message_id,
                    ErrorCode::NotImplemented,
                    format!("{} is not supported", request.action),
                )
            }
        }
    }

    fn handle_trigger(&self, request: &IncomingRequest) -> Result<(), EngineError> {
        let requested = request
            .payload
            .get("requestedMessage")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let supported = matches!(
            requested,
            "BootNotification" | "Heartbeat" | "StatusNotification"
        );
        let status = if supported { "Accepted" } else { "NotImplemented" };
        self.engine
            .respond(&request.message_id, json!({ "status": status }))?;

        // Triggered messages are fire-and-forget; the queue delivers them
        match requested {
            "BootNotification" => {
                self.enqueue_boot(BootReason::Triggered)?;
            }
            "Heartbeat" => {
                self.engine.enqueue(
                    Action::Heartbeat.as_str(),
                    HeartbeatRequest {},
                    MessagePriority::Normal,
                )?;
            }
            "StatusNotification" => {
                self.status_notification_all()?;
            }
            other => debug!("Station: Trigger for {} ignored", other),
        }
        Ok(())
    }

    /// Answer CSMS requests until the stream closes
    pub async fn serve_requests(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<IncomingRequest>) {
        while let Some(request) = requests.recv().await {
            if let Err(e) = self.handle_request(&request) {
                warn!(
                    "Station: Failed to answer {} {}: {}",
                    request.action, request.message_id, e
                );
            }
        }
        debug!("Station: Request stream closed");
    }
}
