//! End-to-end message exchange scenarios
//!
//! The CSMS side is simulated by reading `TransportCommand::Send` frames and
//! feeding `TransportEvent`s back into the engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ocpp_engine::config::StationConfig;
use ocpp_engine::engine::{Engine, IncomingRequest};
use ocpp_engine::error::EngineError;
use ocpp_engine::ocpp::{
    IdToken, Measurand, MeterValue, OcppMessage, SampledValue, StoppedReason, TriggerReason,
};
use ocpp_engine::queue::{
    shared, FileQueueStore, MemoryQueueStore, MessageIdGenerator, MessagePriority, SharedStore,
    StorageConfig,
};
use ocpp_engine::transaction::{EnhancedTransaction, TransactionManager};
use ocpp_engine::transport::{TransportCommand, TransportEvent, TransportHandle};
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Csms {
    engine: Engine,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    runner: JoinHandle<Result<(), EngineError>>,
    _requests: mpsc::UnboundedReceiver<IncomingRequest>,
}

impl Csms {
    fn start(config: &StationConfig, store: SharedStore) -> Self {
        let (transport, commands) = TransportHandle::channel();
        let (engine, requests) = Engine::with_id_generator(
            config,
            store,
            transport,
            MessageIdGenerator::with_prefix("cs"),
        )
        .unwrap();

        let (events, events_rx) = mpsc::unbounded_channel();
        let engine_clone = engine.clone();
        let runner = tokio::spawn(async move { engine_clone.run(events_rx).await });

        Self {
            engine,
            commands,
            events,
            runner,
            _requests: requests,
        }
    }

    fn connect(&self) {
        self.events.send(TransportEvent::Connected).unwrap();
    }

    fn drop_connection(&self) {
        self.events
            .send(TransportEvent::Disconnected {
                reason: "link down".to_string(),
                requested: true,
            })
            .unwrap();
    }

    async fn next_call(&mut self) -> (String, String, serde_json::Value) {
        loop {
            match self.commands.recv().await {
                Some(TransportCommand::Send(frame)) => match OcppMessage::parse(frame.as_bytes()).unwrap() {
                    OcppMessage::Call(call) => return (call.message_id, call.action, call.payload),
                    other => panic!("expected a CALL, got {:?}", other),
                },
                Some(_) => continue,
                None => panic!("engine dropped its transport handle"),
            }
        }
    }

    fn answer(&self, unique_id: &str, payload: serde_json::Value) {
        self.events
            .send(TransportEvent::Message(format!(r#"[3,"{}",{}]"#, unique_id, payload)))
            .unwrap();
    }

    fn sends_so_far(&mut self) -> usize {
        let mut sends = 0;
        while let Ok(command) = self.commands.try_recv() {
            if matches!(command, TransportCommand::Send(_)) {
                sends += 1;
            }
        }
        sends
    }

    async fn stop(self) {
        self.engine.shutdown();
        let _ = self.runner.await;
    }
}

async fn drained(engine: &Engine) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.queue_len() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn storage(dir: &std::path::Path) -> StorageConfig {
    StorageConfig {
        dir: dir.to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_heartbeat_confirmed() {
    let mut csms = Csms::start(&StationConfig::default(), shared(MemoryQueueStore::new()));
    csms.connect();

    let pending = csms
        .engine
        .enqueue("Heartbeat", json!({}), MessagePriority::Normal)
        .unwrap();
    let (unique_id, action, _) = csms.next_call().await;
    assert_eq!(action, "Heartbeat");
    assert_eq!(unique_id, pending.unique_id());

    csms.answer(&unique_id, json!({"currentTime": "2026-01-20T12:00:00Z"}));
    let result = pending.wait().await.unwrap();
    assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
    assert_eq!(csms.engine.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhausted_after_max_attempts() {
    let config = StationConfig::default().with_retry(Duration::from_secs(5), 3);
    let store = shared(MemoryQueueStore::new());
    let mut csms = Csms::start(&config, store.clone());
    csms.connect();

    let pending = csms
        .engine
        .enqueue("Heartbeat", json!({}), MessagePriority::Normal)
        .unwrap();
    let unique_id = pending.unique_id().to_string();

    match pending.wait().await {
        Err(EngineError::RetryExhausted { unique_id: id, attempts }) => {
            assert_eq!(id, unique_id);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert_eq!(csms.sends_so_far(), 3);
    assert_eq!(csms.engine.queue_len(), 0);
    assert!(store.lock().scan_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_reconnect_replays_in_order() {
    let mut csms = Csms::start(&StationConfig::default(), shared(MemoryQueueStore::new()));
    csms.connect();

    let in_flight = csms
        .engine
        .enqueue("Heartbeat", json!({}), MessagePriority::Normal)
        .unwrap();
    let (first_id, _, _) = csms.next_call().await;
    assert_eq!(first_id, in_flight.unique_id());

    let normal = csms
        .engine
        .enqueue("DataTransfer", json!({"vendorId": "EK"}), MessagePriority::Normal)
        .unwrap();
    let high = csms
        .engine
        .enqueue("Authorize", json!({"idToken": {"idToken": "A1", "type": "ISO14443"}}), MessagePriority::High)
        .unwrap();

    csms.drop_connection();
    csms.connect();

    // The interrupted message goes out again first, under the same id
    let (replayed, _, _) = csms.next_call().await;
    assert_eq!(replayed, first_id);

    // Traffic enqueued after the reconnect waits behind the replay
    let fresh = csms
        .engine
        .enqueue("DataTransfer", json!({"vendorId": "EK", "messageId": "late"}), MessagePriority::High)
        .unwrap();

    let mut order = Vec::new();
    csms.answer(&replayed, json!({"currentTime": "2026-01-20T12:00:00Z"}));
    for _ in 0..3 {
        let (unique_id, _, _) = csms.next_call().await;
        csms.answer(&unique_id, json!({"status": "Accepted"}));
        order.push(unique_id);
    }

    assert_eq!(
        order,
        vec![
            high.unique_id().to_string(),
            normal.unique_id().to_string(),
            fresh.unique_id().to_string(),
        ]
    );
    assert!(in_flight.wait().await.is_ok());
    assert!(fresh.wait().await.is_ok());
}

#[tokio::test]
async fn test_restart_replays_with_same_id() {
    let dir = tempdir().unwrap();
    let config = StationConfig::default();

    let unique_id = {
        let store = shared(FileQueueStore::open(storage(dir.path())).unwrap());
        let mut csms = Csms::start(&config, store);
        csms.connect();
        let pending = csms
            .engine
            .enqueue("Heartbeat", json!({}), MessagePriority::Normal)
            .unwrap();
        let (unique_id, _, _) = csms.next_call().await;
        assert_eq!(unique_id, pending.unique_id());

        // Crash before the CSMS answers
        csms.stop().await;
        unique_id
    };

    let store = shared(FileQueueStore::open(storage(dir.path())).unwrap());
    let mut csms = Csms::start(&config, store.clone());
    let recovered = csms.engine.pending_messages();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].unique_id, unique_id);
    assert_eq!(recovered[0].message_attempts, 1);

    csms.connect();
    let (replayed, action, _) = csms.next_call().await;
    assert_eq!(replayed, unique_id);
    assert_eq!(action, "Heartbeat");
    assert_eq!(store.lock().scan_all().unwrap()[0].message_attempts, 2);

    csms.answer(&replayed, json!({"currentTime": "2026-01-20T12:00:00Z"}));
    drained(&csms.engine).await;
    assert!(store.lock().scan_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_transaction_seq_no_across_reconnect() {
    let config = StationConfig::default();
    let store = shared(MemoryQueueStore::new());
    let mut csms = Csms::start(&config, store.clone());
    let transactions = Arc::new(
        TransactionManager::new(csms.engine.clone(), store, &config.metering).unwrap(),
    );
    csms.connect();

    let token = IdToken {
        id_token: "04A2B3C4".to_string(),
        token_type: "ISO14443".to_string(),
    };
    transactions
        .start(EnhancedTransaction::new("tx-7", 1, token), TriggerReason::Authorized, None)
        .unwrap();
    let (started, _, payload) = csms.next_call().await;
    assert_eq!(payload["seqNo"], 0);
    assert_eq!(payload["eventType"], "Started");

    csms.drop_connection();
    transactions
        .record_meter_value(
            "tx-7",
            &MeterValue::new(Utc::now(), vec![SampledValue::new(Measurand::Voltage, 229.5)]),
        )
        .unwrap();
    transactions
        .update("tx-7", TriggerReason::MeterValuePeriodic, None)
        .unwrap()
        .unwrap();
    transactions
        .end("tx-7", StoppedReason::EVDisconnected, TriggerReason::EVCommunicationLost, None)
        .unwrap();
    csms.connect();

    let mut seq_nos = Vec::new();
    let (unique_id, _, payload) = csms.next_call().await;
    assert_eq!(unique_id, started);
    seq_nos.push(payload["seqNo"].as_i64().unwrap());
    csms.answer(&unique_id, json!({}));

    for _ in 0..2 {
        let (unique_id, action, payload) = csms.next_call().await;
        assert_eq!(action, "TransactionEvent");
        seq_nos.push(payload["seqNo"].as_i64().unwrap());
        csms.answer(&unique_id, json!({}));
    }

    assert_eq!(seq_nos, vec![0, 1, 2]);
    drained(&csms.engine).await;
    assert!(!csms.engine.has_transaction_messages("tx-7"));
}
