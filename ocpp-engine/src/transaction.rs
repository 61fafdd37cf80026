//! Transaction state and meter-value reporting
//!
//! Each active transaction owns its aggregator and a durable `seq_no`
//! counter. The counter is persisted before a value is handed out, so no
//! seqNo is ever reused, across reconnects and restarts alike. The only link
//! to the queue is the transaction id carried by each queued message.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::aggregator::MeterValueAggregator;
use crate::config::MeteringConfig;
use crate::engine::{Engine, PendingResponse};
use crate::error::EngineError;
use crate::ocpp::{
    Action, ChargingState, IdToken, Measurand, MeterValue, StoppedReason, TransactionEventKind,
    TransactionEventRequest, TransactionInfo, TriggerReason, EVSE,
};
use crate::queue::SharedStore;

/// A charging transaction as tracked by the station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedTransaction {
    pub transaction_id: String,
    pub evse_id: i32,
    pub id_token: IdToken,
    pub charging_state: ChargingState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_reason: Option<StoppedReason>,
    #[serde(default)]
    pub remote_start_id: Option<i32>,
    #[serde(default)]
    pub reservation_id: Option<i32>,
    /// Next seqNo to hand out
    pub seq_no: i32,
    /// Flushed meter values not yet reported
    #[serde(skip)]
    pub meter_values: Vec<MeterValue>,
}

impl EnhancedTransaction {
    pub fn new(transaction_id: impl Into<String>, evse_id: i32, id_token: IdToken) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            evse_id,
            id_token,
            charging_state: ChargingState::EVConnected,
            started_at: Utc::now(),
            stopped_at: None,
            stopped_reason: None,
            remote_start_id: None,
            reservation_id: None,
            seq_no: 0,
            meter_values: Vec::new(),
        }
    }

    pub fn with_reservation(mut self, reservation_id: i32) -> Self {
        self.reservation_id = Some(reservation_id);
        self
    }

    pub fn with_remote_start_id(mut self, remote_start_id: i32) -> Self {
        self.remote_start_id = Some(remote_start_id);
        self
    }

    fn info(&self) -> TransactionInfo {
        TransactionInfo {
            transaction_id: self.transaction_id.clone(),
            charging_state: Some(self.charging_state),
            stopped_reason: self.stopped_reason,
            remote_start_id: self.remote_start_id,
        }
    }

    fn event(
        &self,
        kind: TransactionEventKind,
        trigger_reason: TriggerReason,
        seq_no: i32,
        meter_value: Vec<MeterValue>,
    ) -> TransactionEventRequest {
        let started = kind == TransactionEventKind::Started;
        TransactionEventRequest {
            event_type: kind,
            timestamp: Utc::now(),
            trigger_reason,
            seq_no,
            transaction_info: self.info(),
            offline: None,
            id_token: started.then(|| self.id_token.clone()),
            evse: started.then(|| EVSE {
                id: self.evse_id,
                connector_id: Some(1),
            }),
            meter_value: (!meter_value.is_empty()).then_some(meter_value),
            reservation_id: if started { self.reservation_id } else { None },
        }
    }
}

struct ActiveTransaction {
    record: EnhancedTransaction,
    aggregator: Arc<MeterValueAggregator>,
}

/// Owns every active transaction
pub struct TransactionManager {
    engine: Engine,
    store: SharedStore,
    averaged: BTreeSet<Measurand>,
    active: Mutex<HashMap<String, ActiveTransaction>>,
}

impl TransactionManager {
    /// Create the manager, restoring transactions left open by a previous run
    pub fn new(
        engine: Engine,
        store: SharedStore,
        metering: &MeteringConfig,
    ) -> Result<Self, EngineError> {
        let restored = store.lock().transactions()?;
        let averaged = metering.aligned_measurands.clone();

        let active: HashMap<_, _> = restored
            .into_iter()
            .map(|record| {
                info!(
                    "Transactions: Restored {} (next seqNo {})",
                    record.transaction_id, record.seq_no
                );
                let aggregator = Arc::new(MeterValueAggregator::new(averaged.clone()));
                (
                    record.transaction_id.clone(),
                    ActiveTransaction { record, aggregator },
                )
            })
            .collect();

        Ok(Self {
            engine,
            store,
            averaged,
            active: Mutex::new(active),
        })
    }

    /// Open a transaction and queue its Started event (seqNo 0). Fails with
    /// `TransactionExists` if the id is already active.
    pub fn start(
        &self,
        record: EnhancedTransaction,
        trigger_reason: TriggerReason,
        meter_start: Option<MeterValue>,
    ) -> Result<PendingResponse, EngineError> {
        let transaction_id = record.transaction_id.clone();
        let mut active = self.active.lock();
        if active.contains_key(&transaction_id) {
            return Err(EngineError::TransactionExists(transaction_id));
        }

        self.store.lock().save_transaction(&record)?;
        active.insert(
            transaction_id.clone(),
            ActiveTransaction {
                record,
                aggregator: Arc::new(MeterValueAggregator::new(self.averaged.clone())),
            },
        );

        let tx = Self::get_mut(&mut active, &transaction_id)?;
        let seq_no = Self::take_seq_no(&self.store, &mut tx.record)?;
        let event = tx.record.event(
            TransactionEventKind::Started,
            trigger_reason,
            seq_no,
            meter_start.into_iter().collect(),
        );
        info!("Transactions: Started {} on EVSE {}", transaction_id, tx.record.evse_id);
        self.enqueue_event(&transaction_id, event)
    }

    /// Hand out the next seqNo of a transaction
    pub fn next_seq_no(&self, transaction_id: &str) -> Result<i32, EngineError> {
        let mut active = self.active.lock();
        let tx = Self::get_mut(&mut active, transaction_id)?;
        Self::take_seq_no(&self.store, &mut tx.record)
    }

    /// Persist the increment, then return the previous value
    fn take_seq_no(store: &SharedStore, record: &mut EnhancedTransaction) -> Result<i32, EngineError> {
        let seq_no = record.seq_no;
        store
            .lock()
            .update_seq_no(&record.transaction_id, seq_no + 1)?;
        record.seq_no = seq_no + 1;
        Ok(seq_no)
    }

    /// Feed a raw reading into the transaction's aggregator
    pub fn record_meter_value(
        &self,
        transaction_id: &str,
        meter_value: &MeterValue,
    ) -> Result<(), EngineError> {
        let aggregator = {
            let mut active = self.active.lock();
            Self::get_mut(&mut active, transaction_id)?.aggregator.clone()
        };
        aggregator.record(meter_value);
        Ok(())
    }

    /// Flush the aggregator into the transaction's unreported meter values.
    /// Returns `None` when nothing was recorded since the last flush.
    pub fn flush(&self, transaction_id: &str) -> Result<Option<MeterValue>, EngineError> {
        let mut active = self.active.lock();
        let tx = Self::get_mut(&mut active, transaction_id)?;
        let flushed = tx.aggregator.flush();
        if flushed.is_empty() {
            return Ok(None);
        }
        tx.record.meter_values.push(flushed.clone());
        Ok(Some(flushed))
    }

    /// Queue a TransactionEvent(Updated) with everything flushed so far.
    ///
    /// Nothing is sent when there are no meter values and the charging
    /// state did not change.
    pub fn update(
        &self,
        transaction_id: &str,
        trigger_reason: TriggerReason,
        charging_state: Option<ChargingState>,
    ) -> Result<Option<PendingResponse>, EngineError> {
        self.flush(transaction_id)?;

        let mut active = self.active.lock();
        let tx = Self::get_mut(&mut active, transaction_id)?;

        let state_changed = match charging_state {
            Some(state) if state != tx.record.charging_state => {
                tx.record.charging_state = state;
                self.store.lock().save_transaction(&tx.record)?;
                true
            }
            _ => false,
        };
        if tx.record.meter_values.is_empty() && !state_changed {
            debug!("Transactions: Nothing to report for {}", transaction_id);
            return Ok(None);
        }

        let seq_no = Self::take_seq_no(&self.store, &mut tx.record)?;
        let meter_values = std::mem::take(&mut tx.record.meter_values);
        let event = tx.record.event(
            TransactionEventKind::Updated,
            trigger_reason,
            seq_no,
            meter_values,
        );

        // Queued under `active` so seqNos reach the queue in order
        self.enqueue_event(transaction_id, event).map(Some)
    }

    /// Close a transaction: queue TransactionEvent(Ended) and forget it
    pub fn end(
        &self,
        transaction_id: &str,
        stopped_reason: StoppedReason,
        trigger_reason: TriggerReason,
        meter_stop: Option<MeterValue>,
    ) -> Result<PendingResponse, EngineError> {
        self.flush(transaction_id)?;

        let mut active = self.active.lock();
        let tx = Self::get_mut(&mut active, transaction_id)?;
        tx.record.stopped_at = Some(Utc::now());
        tx.record.stopped_reason = Some(stopped_reason);
        tx.record.charging_state = ChargingState::Idle;

        let seq_no = Self::take_seq_no(&self.store, &mut tx.record)?;
        let mut meter_values = std::mem::take(&mut tx.record.meter_values);
        meter_values.extend(meter_stop);
        let event = tx.record.event(
            TransactionEventKind::Ended,
            trigger_reason,
            seq_no,
            meter_values,
        );

        let pending = self.enqueue_event(transaction_id, event)?;
        active.remove(transaction_id);
        self.store.lock().remove_transaction(transaction_id)?;
        info!("Transactions: Ended {} ({:?})", transaction_id, stopped_reason);
        Ok(pending)
    }

    /// Drop a transaction without reporting anything further
    pub fn abort(&self, transaction_id: &str) -> Result<(), EngineError> {
        let mut active = self.active.lock();
        let tx = active
            .remove(transaction_id)
            .ok_or_else(|| EngineError::UnknownTransaction(transaction_id.to_string()))?;
        tx.aggregator.clear();
        self.store.lock().remove_transaction(transaction_id)?;
        warn!("Transactions: Aborted {}", transaction_id);
        Ok(())
    }

    pub fn get(&self, transaction_id: &str) -> Option<EnhancedTransaction> {
        self.active
            .lock()
            .get(transaction_id)
            .map(|tx| tx.record.clone())
    }

    pub fn active_transactions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Periodic report for every active transaction
    pub fn flush_all(&self, trigger_reason: TriggerReason) -> Result<usize, EngineError> {
        let mut sent = 0;
        for transaction_id in self.active_transactions() {
            match self.update(&transaction_id, trigger_reason, None) {
                Ok(Some(_)) => sent += 1,
                Ok(None) => {}
                // Ended concurrently
                Err(EngineError::UnknownTransaction(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Flush every `interval`, emitting TransactionEvent(Updated). Stops on
    /// the first fatal error.
    pub fn spawn_flush_timer(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.flush_all(TriggerReason::MeterValuePeriodic) {
                    Ok(0) => {}
                    Ok(n) => debug!("Transactions: Periodic report for {} transactions", n),
                    Err(e) if e.is_fatal() || matches!(e, EngineError::Stopped) => {
                        error!("Transactions: Flush timer stopped: {}", e);
                        break;
                    }
                    Err(e) => warn!("Transactions: Periodic report failed: {}", e),
                }
            }
        })
    }

    fn enqueue_event(
        &self,
        transaction_id: &str,
        event: TransactionEventRequest,
    ) -> Result<PendingResponse, EngineError> {
        debug!(
            "Transactions: {:?} for {} (seqNo {})",
            event.event_type, transaction_id, event.seq_no
        );
        self.engine
            .enqueue_transaction(transaction_id, Action::TransactionEvent.as_str(), event)
    }

    fn get_mut<'a>(
        active: &'a mut HashMap<String, ActiveTransaction>,
        transaction_id: &str,
    ) -> Result<&'a mut ActiveTransaction, EngineError> {
        active
            .get_mut(transaction_id)
            .ok_or_else(|| EngineError::UnknownTransaction(transaction_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StationConfig;
    use crate::ocpp::{Phase, SampledValue};
    use crate::queue::{shared, FileQueueStore, MemoryQueueStore, StorageConfig};
    use crate::transport::TransportHandle;
    use tempfile::tempdir;

    fn token() -> IdToken {
        IdToken {
            id_token: "04A2B3C4".to_string(),
            token_type: "ISO14443".to_string(),
        }
    }

    fn manager(store: SharedStore) -> TransactionManager {
        let config = StationConfig::default();
        let (transport, _commands) = TransportHandle::channel();
        let (engine, _requests) = Engine::new(&config, store.clone(), transport).unwrap();
        TransactionManager::new(engine, store, &config.metering).unwrap()
    }

    fn voltage(value: f64) -> MeterValue {
        MeterValue::new(
            Utc::now(),
            vec![SampledValue::new(Measurand::Voltage, value).with_phase(Phase::L1)],
        )
    }

    fn seq_nos(store: &SharedStore) -> Vec<i64> {
        store
            .lock()
            .scan_all()
            .unwrap()
            .iter()
            .map(|m| m.payload["seqNo"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_seq_no_is_gapless() {
        let store = shared(MemoryQueueStore::new());
        let manager = manager(store.clone());

        manager
            .start(EnhancedTransaction::new("tx-1", 1, token()), TriggerReason::Authorized, None)
            .unwrap();
        manager.record_meter_value("tx-1", &voltage(230.0)).unwrap();
        manager
            .update("tx-1", TriggerReason::MeterValuePeriodic, None)
            .unwrap()
            .unwrap();
        manager
            .end("tx-1", StoppedReason::Local, TriggerReason::StopAuthorized, None)
            .unwrap();

        assert_eq!(seq_nos(&store), vec![0, 1, 2]);
        assert!(manager.get("tx-1").is_none());
        assert!(store.lock().transactions().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let store = shared(MemoryQueueStore::new());
        let manager = manager(store.clone());

        manager
            .start(EnhancedTransaction::new("tx-1", 1, token()), TriggerReason::Authorized, None)
            .unwrap();
        assert_eq!(manager.next_seq_no("tx-1").unwrap(), 1);

        assert!(matches!(
            manager.start(EnhancedTransaction::new("tx-1", 2, token()), TriggerReason::Authorized, None),
            Err(EngineError::TransactionExists(id)) if id == "tx-1"
        ));
        assert_eq!(seq_nos(&store), vec![0]);

        let current = manager.get("tx-1").unwrap();
        assert_eq!(current.seq_no, 2);
        assert_eq!(current.evse_id, 1);
        assert_eq!(store.lock().transactions().unwrap()[0].seq_no, 2);
    }

    #[test]
    fn test_concurrent_updates_keep_seq_no_order() {
        for _ in 0..20 {
            let store = shared(MemoryQueueStore::new());
            let manager = manager(store);
            manager
                .start(EnhancedTransaction::new("tx-1", 1, token()), TriggerReason::Authorized, None)
                .unwrap();

            std::thread::scope(|s| {
                for t in 0..4 {
                    let manager = &manager;
                    s.spawn(move || {
                        for i in 0..20 {
                            manager
                                .record_meter_value("tx-1", &voltage(220.0 + (t * 20 + i) as f64))
                                .unwrap();
                            manager
                                .update("tx-1", TriggerReason::MeterValuePeriodic, None)
                                .unwrap();
                        }
                    });
                }
            });

            let queued: Vec<i64> = manager
                .engine
                .pending_messages()
                .iter()
                .map(|m| m.payload["seqNo"].as_i64().unwrap())
                .collect();
            assert!(queued.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", queued);
            assert_eq!(queued.len() as i32, manager.get("tx-1").unwrap().seq_no);
        }
    }

    #[test]
    fn test_empty_update_is_suppressed() {
        let store = shared(MemoryQueueStore::new());
        let manager = manager(store.clone());
        manager
            .start(EnhancedTransaction::new("tx-1", 1, token()), TriggerReason::Authorized, None)
            .unwrap();

        assert!(manager
            .update("tx-1", TriggerReason::MeterValuePeriodic, None)
            .unwrap()
            .is_none());
        assert!(manager
            .update("tx-1", TriggerReason::ChargingStateChanged, Some(ChargingState::Charging))
            .unwrap()
            .is_some());
        assert_eq!(manager.get("tx-1").unwrap().seq_no, 2);
    }

    #[test]
    fn test_updated_event_carries_average() {
        let store = shared(MemoryQueueStore::new());
        let manager = manager(store.clone());
        manager
            .start(EnhancedTransaction::new("tx-1", 1, token()), TriggerReason::Authorized, None)
            .unwrap();
        manager.record_meter_value("tx-1", &voltage(230.0)).unwrap();
        manager.record_meter_value("tx-1", &voltage(232.0)).unwrap();
        manager
            .update("tx-1", TriggerReason::MeterValuePeriodic, None)
            .unwrap();

        let rows = store.lock().scan_all().unwrap();
        let updated = &rows[1].payload;
        assert_eq!(updated["eventType"], "Updated");
        assert_eq!(updated["meterValue"][0]["sampledValue"][0]["value"], 231.0);
        assert_eq!(rows[1].transaction_id.as_deref(), Some("tx-1"));
    }

    #[test]
    fn test_seq_no_survives_restart() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            dir: dir.path().to_path_buf(),
            fsync_on_write: false,
            ..Default::default()
        };

        {
            let store = shared(FileQueueStore::open(config.clone()).unwrap());
            let manager = manager(store);
            manager
                .start(EnhancedTransaction::new("tx-9", 2, token()), TriggerReason::Authorized, None)
                .unwrap();
            assert_eq!(manager.next_seq_no("tx-9").unwrap(), 1);
        }

        let store = shared(FileQueueStore::open(config).unwrap());
        let manager = manager(store);
        assert_eq!(manager.active_transactions(), vec!["tx-9".to_string()]);
        assert_eq!(manager.next_seq_no("tx-9").unwrap(), 2);
    }

    #[test]
    fn test_abort_discards_readings() {
        let store = shared(MemoryQueueStore::new());
        let manager = manager(store.clone());
        manager
            .start(EnhancedTransaction::new("tx-1", 1, token()), TriggerReason::Authorized, None)
            .unwrap();
        manager.record_meter_value("tx-1", &voltage(230.0)).unwrap();
        manager.abort("tx-1").unwrap();

        assert!(matches!(
            manager.flush("tx-1"),
            Err(EngineError::UnknownTransaction(_))
        ));
        assert_eq!(store.lock().scan_all().unwrap().len(), 1);
    }
}
