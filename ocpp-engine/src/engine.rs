//! Message exchange engine
//!
//! Turns the unreliable transport into at-least-once delivery:
//! - Every CALL is persisted before `enqueue` returns
//! - One CALL on the wire at a time, in FIFO + priority order
//! - Response timeout, exponential backoff, bounded attempts
//! - Bounded queue: unsent meter-value updates are shed oldest first
//! - Replay of everything pending, ahead of new traffic, on each connection
//! - Inbound frames demultiplexed by unique id
//!
//! The engine is a cloneable handle. `run` consumes the transport event
//! stream; application code calls `enqueue` from any task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::StationConfig;
use crate::error::{EngineError, StoreError, TransportError};
use crate::ocpp::{
    Action, BootNotificationResponse, Call, CallError, CallResult, ErrorCode, MessageType,
    OcppMessage, RegistrationStatus,
};
use crate::queue::{
    CorrelationTable, MessageIdGenerator, MessagePriority, OutboundMessage, PendingCorrelation,
    PendingQueue, QueuedEntry, SharedStore,
};
use crate::retry::{ReconnectPolicy, RetryPolicy};
use crate::splitter::ReportSplitter;
use crate::transport::{wait_until, TransportEvent, TransportHandle};

/// CSMS request for the application to answer with `respond`/`respond_error`
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

type Outcome = Result<CallResult, EngineError>;

/// Result handle returned by `enqueue`
///
/// A report split into several parts resolves once every part is confirmed.
#[derive(Debug)]
pub struct PendingResponse {
    parts: Vec<(String, oneshot::Receiver<Outcome>)>,
}

impl PendingResponse {
    /// Unique id of the (first) message
    pub fn unique_id(&self) -> &str {
        self.parts.first().map_or("", |(id, _)| id.as_str())
    }

    /// Unique ids of all parts, in send order
    pub fn unique_ids(&self) -> Vec<&str> {
        self.parts.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Wait for the CSMS answer. For split reports: the first failure, or
    /// the answer to the last part.
    pub async fn wait(self) -> Result<CallResult, EngineError> {
        let mut last = Err(EngineError::Stopped);
        for (_, rx) in self.parts {
            let result = rx.await.map_err(|_| EngineError::Stopped)?;
            last = Ok(result?);
        }
        last
    }
}

struct EngineState {
    queue: PendingQueue,
    correlation: CorrelationTable,
    waiters: HashMap<String, oneshot::Sender<Outcome>>,
    ids: MessageIdGenerator,
    next_sequence: u64,
    retry: RetryPolicy,
    reconnect: ReconnectPolicy,
    connected: bool,
    paused: bool,
    registration_accepted: bool,
    failed: bool,
}

struct Inner {
    state: Mutex<EngineState>,
    store: SharedStore,
    transport: TransportHandle,
    requests: mpsc::UnboundedSender<IncomingRequest>,
    splitter: ReportSplitter,
    max_queue_size: usize,
    registration_gate: bool,
    auto_reconnect: bool,
    wakeup: Notify,
    stopping: AtomicBool,
}

/// Handle to the message exchange engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create an engine over `store`, recovering every undelivered message.
    ///
    /// Returns the engine and the stream of CSMS requests.
    pub fn new(
        config: &StationConfig,
        store: SharedStore,
        transport: TransportHandle,
    ) -> Result<(Self, mpsc::UnboundedReceiver<IncomingRequest>), EngineError> {
        Self::with_id_generator(config, store, transport, MessageIdGenerator::new())
    }

    /// Same as `new` with an explicit unique-id supplier
    pub fn with_id_generator(
        config: &StationConfig,
        store: SharedStore,
        transport: TransportHandle,
        ids: MessageIdGenerator,
    ) -> Result<(Self, mpsc::UnboundedReceiver<IncomingRequest>), EngineError> {
        let recovered = store.lock().scan_all()?;
        let next_sequence = recovered
            .iter()
            .map(|m| m.sequence + 1)
            .max()
            .unwrap_or(0);

        let mut queue = PendingQueue::new();
        for message in recovered {
            queue.push(QueuedEntry::new(message));
        }
        if !queue.is_empty() {
            info!("Engine: Recovered {} undelivered messages", queue.len());
        }

        let (requests, requests_rx) = mpsc::unbounded_channel();

        let state = EngineState {
            queue,
            correlation: CorrelationTable::single_channel(),
            waiters: HashMap::new(),
            ids,
            next_sequence,
            retry: RetryPolicy::from(&config.queue),
            reconnect: ReconnectPolicy::new(config.connection.reconnect.clone()),
            connected: false,
            paused: false,
            registration_accepted: false,
            failed: false,
        };

        let engine = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                store,
                transport,
                requests,
                splitter: ReportSplitter::new(config.queue.max_message_size),
                max_queue_size: config.queue.max_queue_size,
                registration_gate: config.queue.registration_gate,
                auto_reconnect: config.connection.auto_reconnect,
                wakeup: Notify::new(),
                stopping: AtomicBool::new(false),
            }),
        };

        Ok((engine, requests_rx))
    }

    /// Persist a CALL and schedule it for transmission.
    ///
    /// Returns once the message is durable; the CSMS answer arrives through
    /// the returned handle. An error here means nothing was queued (or, for
    /// `Persistence`, that the engine can no longer guarantee delivery).
    pub fn enqueue(
        &self,
        action: &str,
        payload: impl Serialize,
        priority: MessagePriority,
    ) -> Result<PendingResponse, EngineError> {
        let payload = serde_json::to_value(payload).map_err(crate::ocpp::OcppError::from)?;
        self.enqueue_message(action, payload, priority, None)
    }

    /// `enqueue` for a message that belongs to a transaction
    pub fn enqueue_transaction(
        &self,
        transaction_id: &str,
        action: &str,
        payload: impl Serialize,
    ) -> Result<PendingResponse, EngineError> {
        let payload = serde_json::to_value(payload).map_err(crate::ocpp::OcppError::from)?;
        self.enqueue_message(
            action,
            payload,
            MessagePriority::Normal,
            Some(transaction_id.to_string()),
        )
    }

    fn enqueue_message(
        &self,
        action: &str,
        payload: Value,
        priority: MessagePriority,
        transaction_id: Option<String>,
    ) -> Result<PendingResponse, EngineError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.failed || self.inner.stopping.load(Ordering::Acquire) {
            return Err(EngineError::Stopped);
        }

        let parsed = action.parse::<Action>().ok();
        let priority = match parsed {
            Some(a) if a.is_high_priority() => MessagePriority::High,
            _ => priority,
        };

        let call = Call {
            message_id: next_free_id(&mut state.ids, &state.queue),
            action: action.to_string(),
            payload,
        };

        let calls = if self.inner.splitter.is_oversized(&call)? {
            let items_field = parsed.and_then(|a| a.report_items_field());
            match items_field {
                Some(field) => {
                    let ids = &mut state.ids;
                    let queue = &state.queue;
                    let parts = self.inner.splitter.split(action, &call.payload, field, || {
                        next_free_id(ids, queue)
                    })?;
                    info!("Engine: Split oversized {} into {} parts", action, parts.len());
                    parts
                }
                None => {
                    warn!(
                        "Engine: {} {} exceeds the {} byte limit and cannot be split",
                        action,
                        call.message_id,
                        self.inner.splitter.max_message_size()
                    );
                    vec![call]
                }
            }
        } else {
            vec![call]
        };

        let enqueued_at = Utc::now();
        let mut parts = Vec::with_capacity(calls.len());
        for call in calls {
            let message = OutboundMessage {
                unique_id: call.message_id,
                sequence: state.next_sequence,
                message_type: MessageType::Call,
                action: call.action,
                payload: call.payload,
                priority,
                transaction_id: transaction_id.clone(),
                message_attempts: 0,
                enqueued_at,
            };

            if let Err(e) = self.inner.store.lock().insert(&message) {
                return Err(self.fatal(state, e));
            }
            state.next_sequence += 1;

            let (tx, rx) = oneshot::channel();
            state.waiters.insert(message.unique_id.clone(), tx);
            parts.push((message.unique_id.clone(), rx));

            debug!(
                "Engine: Queued {} {} (queue length {})",
                message.action,
                message.unique_id,
                state.queue.len() + 1
            );
            state.queue.push(QueuedEntry::new(message));
        }

        self.shed(state)?;
        self.pump(state)?;
        drop(guard);
        self.inner.wakeup.notify_one();

        Ok(PendingResponse { parts })
    }

    /// Answer a CSMS request. Responses are not queued: they go out at once
    /// or not at all (the CSMS repeats its request).
    pub fn respond(&self, message_id: &str, payload: impl Serialize) -> Result<(), EngineError> {
        let frame = OcppMessage::CallResult(CallResult::new(message_id, payload)?).to_text()?;
        self.send_response(message_id, frame)
    }

    pub fn respond_error(
        &self,
        message_id: &str,
        code: ErrorCode,
        description: impl Into<String>,
    ) -> Result<(), EngineError> {
        let frame =
            OcppMessage::CallError(CallError::new(message_id, code, description)).to_text()?;
        self.send_response(message_id, frame)
    }

    fn send_response(&self, message_id: &str, frame: String) -> Result<(), EngineError> {
        if !self.inner.state.lock().connected {
            warn!("Engine: Not connected, dropping response to {}", message_id);
            return Err(TransportError::SendFailed("not connected".to_string()).into());
        }
        if !self.inner.transport.send(frame) {
            return Err(TransportError::SendFailed("transport stopped".to_string()).into());
        }
        debug!("Engine: Responded to {}", message_id);
        Ok(())
    }

    /// Withdraw a message that has not been transmitted yet
    pub fn cancel(&self, unique_id: &str) -> Result<(), EngineError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let Some(entry) = state.queue.get(unique_id) else {
            return Err(EngineError::CorrelationMiss(unique_id.to_string()));
        };
        if entry.message.message_attempts > 0 || state.correlation.contains(unique_id) {
            return Err(EngineError::AlreadySent(unique_id.to_string()));
        }

        if let Err(e) = self.inner.store.lock().remove(unique_id) {
            return Err(self.fatal(state, e));
        }
        state.queue.remove(unique_id);
        if let Some(waiter) = state.waiters.remove(unique_id) {
            let _ = waiter.send(Err(EngineError::Cancelled(unique_id.to_string())));
        }
        info!("Engine: Cancelled {}", unique_id);
        Ok(())
    }

    /// Whether undelivered messages of `transaction_id` remain queued
    pub fn has_transaction_messages(&self, transaction_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .queue
            .iter()
            .any(|e| e.message.transaction_id.as_deref() == Some(transaction_id))
    }

    /// Replace the retry policy; applies from the next timeout on
    pub fn update_retry_policy(&self, policy: RetryPolicy) {
        info!("Engine: Retry policy updated: {:?}", policy);
        self.inner.state.lock().retry = policy;
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.state.lock().retry
    }

    /// Record the registration status from outside the engine (e.g. after
    /// a Pending boot was accepted through a later BootNotification).
    pub fn set_registration_accepted(&self, accepted: bool) {
        self.inner.state.lock().registration_accepted = accepted;
        self.inner.wakeup.notify_one();
    }

    pub fn is_registration_accepted(&self) -> bool {
        self.inner.state.lock().registration_accepted
    }

    /// Stop transmitting; queued messages stay queued
    pub fn pause(&self) {
        info!("Engine: Paused");
        self.inner.state.lock().paused = true;
    }

    pub fn resume(&self) {
        info!("Engine: Resumed");
        self.inner.state.lock().paused = false;
        self.inner.wakeup.notify_one();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// Undelivered messages (including the one on the wire)
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Snapshot of undelivered messages in send order
    pub fn pending_messages(&self) -> Vec<OutboundMessage> {
        self.inner
            .state
            .lock()
            .queue
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Ask `run` to return
    pub fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.wakeup.notify_one();
    }

    /// Drive the engine from the transport event stream until shutdown or
    /// until the stream closes. Returns an error on persistence failure.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(), EngineError> {
        info!("Engine: Running with {} queued messages", self.queue_len());

        loop {
            if self.inner.stopping.load(Ordering::Acquire) {
                info!("Engine: Stopped");
                return Ok(());
            }
            if self.inner.state.lock().failed {
                return Err(EngineError::Stopped);
            }

            let timer = self.next_timer();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event)?,
                    None => {
                        info!("Engine: Transport event stream closed");
                        return Ok(());
                    }
                },
                _ = self.inner.wakeup.notified() => {}
                _ = wait_until(timer) => self.on_timer()?,
            }

            let mut state = self.inner.state.lock();
            self.pump(&mut state)?;
        }
    }

    fn handle_event(&self, event: TransportEvent) -> Result<(), EngineError> {
        match event {
            TransportEvent::Connected => {
                let mut state = self.inner.state.lock();
                state.connected = true;
                state.reconnect.reset();
                state.correlation.clear();
                state.queue.mark_all_replay();
                info!(
                    "Engine: Connected, replaying {} pending messages",
                    state.queue.len()
                );
            }
            TransportEvent::Disconnected { reason, requested } => {
                warn!("Engine: Disconnected: {}", reason);
                let delay = {
                    let mut state = self.inner.state.lock();
                    state.connected = false;
                    for pending in state.correlation.clear() {
                        info!(
                            "Engine: {} interrupted by disconnect, resending on reconnect",
                            pending.unique_id
                        );
                    }
                    self.reconnect_delay(&mut state, requested)
                };
                if let Some(delay) = delay {
                    self.inner.transport.reconnect(reason, delay);
                }
            }
            TransportEvent::ConnectFailed(e) => {
                warn!("Engine: Connect failed: {}", e);
                let delay = {
                    let mut state = self.inner.state.lock();
                    self.reconnect_delay(&mut state, false)
                };
                if let Some(delay) = delay {
                    self.inner.transport.reconnect(e.to_string(), delay);
                }
            }
            TransportEvent::Message(text) => self.on_transport_message(&text)?,
            TransportEvent::CertificateSignRequested => {
                warn!("Engine: Client certificate missing, a SignCertificate request is needed");
            }
        }
        Ok(())
    }

    fn reconnect_delay(
        &self,
        state: &mut EngineState,
        requested: bool,
    ) -> Option<std::time::Duration> {
        if requested || !self.inner.auto_reconnect || self.inner.stopping.load(Ordering::Acquire) {
            return None;
        }
        Some(state.reconnect.next_delay())
    }

    /// Demultiplex one inbound frame
    pub fn on_transport_message(&self, raw: &str) -> Result<(), EngineError> {
        let message = match OcppMessage::parse(raw.as_bytes()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Engine: Dropping malformed frame ({}): {}", e, raw);
                return Ok(());
            }
        };

        match message {
            OcppMessage::Call(call) => self.dispatch_request(call),
            OcppMessage::CallResult(result) => {
                let unique_id = result.message_id.clone();
                self.resolve(&unique_id, Ok(result))
            }
            OcppMessage::CallError(error) => {
                let unique_id = error.message_id.clone();
                self.resolve(
                    &unique_id,
                    Err(EngineError::Remote {
                        unique_id: error.message_id,
                        code: error.error_code,
                        description: error.error_description,
                        details: error.error_details,
                    }),
                )
            }
        }
    }

    fn dispatch_request(&self, call: Call) -> Result<(), EngineError> {
        debug!("Engine: CSMS request {} {}", call.action, call.message_id);
        let request = IncomingRequest {
            message_id: call.message_id,
            action: call.action,
            payload: call.payload,
        };

        if let Err(mpsc::error::SendError(request)) = self.inner.requests.send(request) {
            debug!("Engine: No request handler, rejecting {}", request.action);
            if let Err(e) = self.respond_error(
                &request.message_id,
                ErrorCode::NotImplemented,
                format!("{} is not supported", request.action),
            ) {
                warn!("Engine: Could not reject {}: {}", request.message_id, e);
            }
        }
        Ok(())
    }

    fn resolve(&self, unique_id: &str, outcome: Outcome) -> Result<(), EngineError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let Some(pending) = state.correlation.remove(unique_id) else {
            debug!(
                "Engine: Discarding response: {}",
                EngineError::CorrelationMiss(unique_id.to_string())
            );
            return Ok(());
        };

        if let Err(e) = self.inner.store.lock().remove(unique_id) {
            return Err(self.fatal(state, e));
        }
        state.queue.remove(unique_id);

        if pending.action == Action::BootNotification.as_str() {
            if let Ok(result) = &outcome {
                match result.parse_payload::<BootNotificationResponse>() {
                    Ok(response) => {
                        state.registration_accepted =
                            response.status == RegistrationStatus::Accepted;
                        info!("Engine: Registration {:?}", response.status);
                    }
                    Err(e) => warn!("Engine: Unreadable BootNotification response: {}", e),
                }
            }
        }

        match &outcome {
            Ok(_) => debug!("Engine: {} confirmed", unique_id),
            Err(e) => warn!("Engine: {}", e),
        }
        if let Some(waiter) = state.waiters.remove(unique_id) {
            let _ = waiter.send(outcome);
        }

        self.pump(state)
    }

    fn on_timer(&self) -> Result<(), EngineError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let now = Instant::now();

        for expired in state.correlation.take_expired(now) {
            let Some(entry) = state.queue.get(&expired.unique_id) else {
                continue;
            };
            let attempts = entry.message.message_attempts;

            if state.retry.is_exhausted(attempts) {
                self.exhaust(state, &expired.unique_id, attempts)?;
            } else {
                let backoff = state.retry.backoff(attempts);
                info!(
                    "Engine: No response to {} {} (attempt {}, {} retries left), retrying in {:?}",
                    expired.action, expired.unique_id, attempts, expired.retries_remaining, backoff
                );
                state.queue.defer(&expired.unique_id, now + backoff);
            }
        }

        self.pump(state)
    }

    fn next_timer(&self) -> Option<Instant> {
        let state = self.inner.state.lock();
        let deadline = state.correlation.next_deadline();
        let wakeup = if state.connected && !state.paused {
            state.queue.next_wakeup(Instant::now())
        } else {
            None
        };
        match (deadline, wakeup) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Transmit the next message if the channel is free. Check-and-set of
    /// the in-flight slot happens under the state lock.
    fn pump(&self, state: &mut EngineState) -> Result<(), EngineError> {
        loop {
            if !state.connected || state.paused || state.failed || !state.correlation.is_idle() {
                return Ok(());
            }

            let now = Instant::now();
            let gate_closed = self.inner.registration_gate && !state.registration_accepted;
            let Some(entry) = state.queue.next_sendable(gate_closed, now) else {
                return Ok(());
            };

            let unique_id = entry.message.unique_id.clone();
            let action = entry.message.action.clone();
            let attempts = entry.message.message_attempts;
            let frame = entry.message.to_frame()?;
            if state.retry.is_exhausted(attempts) {
                self.exhaust(state, &unique_id, attempts)?;
                continue;
            }

            let attempts = state.queue.record_attempt(&unique_id).unwrap_or(attempts + 1);
            if let Err(e) = self.inner.store.lock().update_attempts(&unique_id, attempts) {
                return Err(self.fatal(state, e));
            }

            let pending = PendingCorrelation {
                unique_id: unique_id.clone(),
                action: action.clone(),
                deadline: now + state.retry.message_timeout,
                retries_remaining: state.retry.max_attempts.saturating_sub(attempts),
            };
            if state.correlation.insert(pending).is_err() {
                // is_idle() was checked above
                return Ok(());
            }

            if self.inner.transport.send(frame) {
                debug!("Engine: Sent {} {} (attempt {})", action, unique_id, attempts);
            } else {
                warn!("Engine: Transport stopped, {} stays queued", unique_id);
            }
            return Ok(());
        }
    }

    fn exhaust(
        &self,
        state: &mut EngineState,
        unique_id: &str,
        attempts: u32,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.inner.store.lock().remove(unique_id) {
            return Err(self.fatal(state, e));
        }
        state.queue.remove(unique_id);

        let err = EngineError::RetryExhausted {
            unique_id: unique_id.to_string(),
            attempts,
        };
        warn!("Engine: {}", err);
        if let Some(waiter) = state.waiters.remove(unique_id) {
            let _ = waiter.send(Err(err));
        }
        Ok(())
    }

    /// Drop unsent meter-value traffic, oldest first, while the queue is
    /// above its bound. Everything else stays queued.
    fn shed(&self, state: &mut EngineState) -> Result<(), EngineError> {
        let max = self.inner.max_queue_size;
        while state.queue.len() > max {
            let victim = state
                .queue
                .iter()
                .filter(|e| {
                    e.message.message_attempts == 0
                        && !state.correlation.contains(&e.message.unique_id)
                })
                .filter(|e| {
                    e.message
                        .action
                        .parse::<Action>()
                        .map_or(false, |a| a.is_transaction_update(&e.message.payload))
                })
                .min_by_key(|e| e.message.sequence)
                .map(|e| e.message.unique_id.clone());

            let Some(unique_id) = victim else {
                warn!(
                    "Engine: Queue holds {} messages (limit {}), nothing left to drop",
                    state.queue.len(),
                    max
                );
                return Ok(());
            };

            if let Err(e) = self.inner.store.lock().remove(&unique_id) {
                return Err(self.fatal(state, e));
            }
            state.queue.remove(&unique_id);

            let err = EngineError::Dropped(unique_id.clone());
            warn!("Engine: Queue limit {} exceeded: {}", max, err);
            if let Some(waiter) = state.waiters.remove(&unique_id) {
                let _ = waiter.send(Err(err));
            }
        }
        Ok(())
    }

    fn fatal(&self, state: &mut EngineState, err: StoreError) -> EngineError {
        error!("Engine: Persistence failure, delivery can no longer be guaranteed: {}", err);
        state.failed = true;
        self.inner.wakeup.notify_one();
        EngineError::Persistence(err)
    }
}

fn next_free_id(ids: &mut MessageIdGenerator, queue: &PendingQueue) -> String {
    loop {
        let id = ids.next_id();
        if !queue.contains(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueueStore;
    use crate::transport::TransportCommand;
    use serde_json::json;

    struct Harness {
        engine: Engine,
        commands: mpsc::UnboundedReceiver<TransportCommand>,
        events: mpsc::UnboundedSender<TransportEvent>,
        requests: Option<mpsc::UnboundedReceiver<IncomingRequest>>,
        store: Arc<Mutex<MemoryQueueStore>>,
    }

    fn harness(config: StationConfig) -> Harness {
        let store = Arc::new(Mutex::new(MemoryQueueStore::new()));
        let (transport, commands) = TransportHandle::channel();
        let (engine, requests) = Engine::with_id_generator(
            &config,
            store.clone(),
            transport,
            MessageIdGenerator::with_prefix("t"),
        )
        .unwrap();

        let (events, events_rx) = mpsc::unbounded_channel();
        let runner = engine.clone();
        tokio::spawn(async move { runner.run(events_rx).await });

        Harness {
            engine,
            commands,
            events,
            requests: Some(requests),
            store,
        }
    }

    async fn next_frame(commands: &mut mpsc::UnboundedReceiver<TransportCommand>) -> OcppMessage {
        loop {
            match commands.recv().await {
                Some(TransportCommand::Send(frame)) => {
                    return OcppMessage::parse(frame.as_bytes()).unwrap()
                }
                Some(_) => continue,
                None => panic!("transport handle dropped"),
            }
        }
    }

    fn config() -> StationConfig {
        StationConfig::default()
    }

    #[tokio::test]
    async fn test_heartbeat_round_trip() {
        let mut h = harness(config());

        let pending = h
            .engine
            .enqueue("Heartbeat", json!({}), MessagePriority::Normal)
            .unwrap();
        assert_eq!(h.engine.queue_len(), 1);
        assert_eq!(h.store.lock().len(), 1);

        h.events.send(TransportEvent::Connected).unwrap();
        let frame = next_frame(&mut h.commands).await;
        assert_eq!(frame.message_id(), pending.unique_id());

        h.events
            .send(TransportEvent::Message(format!(
                r#"[3,"{}",{{"currentTime":"2026-01-20T12:00:00Z"}}]"#,
                frame.message_id()
            )))
            .unwrap();

        let result = pending.wait().await.unwrap();
        assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
        assert_eq!(h.engine.queue_len(), 0);
        assert!(h.store.lock().is_empty());
    }

    #[tokio::test]
    async fn test_call_error_is_remote_rejection() {
        let mut h = harness(config());
        h.events.send(TransportEvent::Connected).unwrap();

        let pending = h
            .engine
            .enqueue("DataTransfer", json!({"vendorId": "EK"}), MessagePriority::Normal)
            .unwrap();
        let frame = next_frame(&mut h.commands).await;
        h.events
            .send(TransportEvent::Message(format!(
                r#"[4,"{}","NotSupported","nope",{{}}]"#,
                frame.message_id()
            )))
            .unwrap();

        match pending.wait().await {
            Err(EngineError::Remote { code, .. }) => assert_eq!(code, ErrorCode::NotSupported),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(h.store.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_and_malformed_frames_are_dropped() {
        let mut h = harness(config());
        h.events.send(TransportEvent::Connected).unwrap();

        let pending = h
            .engine
            .enqueue("Heartbeat", json!({}), MessagePriority::Normal)
            .unwrap();
        let frame = next_frame(&mut h.commands).await;

        h.events
            .send(TransportEvent::Message(r#"[3,"unknown-id",{}]"#.to_string()))
            .unwrap();
        h.events
            .send(TransportEvent::Message("{garbage".to_string()))
            .unwrap();
        h.events
            .send(TransportEvent::Message(format!(r#"[3,"{}",{{}}]"#, frame.message_id())))
            .unwrap();
        // Duplicate answer after resolution
        h.events
            .send(TransportEvent::Message(format!(r#"[3,"{}",{{}}]"#, frame.message_id())))
            .unwrap();

        assert!(pending.wait().await.is_ok());
        assert_eq!(h.engine.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_one_request_outstanding() {
        let mut h = harness(config());
        h.events.send(TransportEvent::Connected).unwrap();

        let first = h.engine.enqueue("Heartbeat", json!({}), MessagePriority::Normal).unwrap();
        let second = h.engine.enqueue("Heartbeat", json!({}), MessagePriority::Normal).unwrap();

        let frame = next_frame(&mut h.commands).await;
        assert_eq!(frame.message_id(), first.unique_id());
        assert!(h.commands.try_recv().is_err());

        h.events
            .send(TransportEvent::Message(format!(r#"[3,"{}",{{}}]"#, first.unique_id())))
            .unwrap();
        let frame = next_frame(&mut h.commands).await;
        assert_eq!(frame.message_id(), second.unique_id());
    }

    #[tokio::test]
    async fn test_request_without_handler_gets_not_implemented() {
        let mut h = harness(config());
        drop(h.requests.take());
        h.events.send(TransportEvent::Connected).unwrap();
        h.events
            .send(TransportEvent::Message(r#"[2,"csms-1","Reset",{"type":"Immediate"}]"#.to_string()))
            .unwrap();

        match next_frame(&mut h.commands).await {
            OcppMessage::CallError(err) => {
                assert_eq!(err.message_id, "csms-1");
                assert_eq!(err.error_code, ErrorCode::NotImplemented);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_forwarded_and_answered() {
        let mut h = harness(config());
        let mut requests = h.requests.take().unwrap();
        h.events.send(TransportEvent::Connected).unwrap();
        h.events
            .send(TransportEvent::Message(r#"[2,"csms-2","GetVariables",{}]"#.to_string()))
            .unwrap();

        let request = requests.recv().await.unwrap();
        assert_eq!(request.action, "GetVariables");
        h.engine
            .respond(&request.message_id, json!({"getVariableResult": []}))
            .unwrap();

        match next_frame(&mut h.commands).await {
            OcppMessage::CallResult(result) => assert_eq!(result.message_id, "csms-2"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_only_before_send() {
        let mut h = harness(config());

        let queued = h.engine.enqueue("Heartbeat", json!({}), MessagePriority::Normal).unwrap();
        let cancelled = h.engine.enqueue("Heartbeat", json!({}), MessagePriority::Normal).unwrap();
        h.engine.cancel(cancelled.unique_id()).unwrap();
        assert!(matches!(
            cancelled.wait().await,
            Err(EngineError::Cancelled(_))
        ));

        h.events.send(TransportEvent::Connected).unwrap();
        next_frame(&mut h.commands).await;
        assert!(matches!(
            h.engine.cancel(queued.unique_id()),
            Err(EngineError::AlreadySent(_))
        ));
        assert_eq!(h.store.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let h = harness(config());
        h.store.lock().set_fail_writes(true);

        let err = h
            .engine
            .enqueue("Heartbeat", json!({}), MessagePriority::Normal)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            h.engine.enqueue("Heartbeat", json!({}), MessagePriority::Normal),
            Err(EngineError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_oversized_report_is_split_and_persisted() {
        let h = harness(config().with_max_message_size(400));
        let items: Vec<Value> = (0..30)
            .map(|i| json!({"component": {"name": format!("C{}", i)}, "variable": {"name": "Enabled"}, "variableAttribute": []}))
            .collect();
        let payload = json!({"requestId": 1, "generatedAt": "2026-01-20T12:00:00Z", "seqNo": 0, "reportData": items});

        let pending = h
            .engine
            .enqueue("NotifyReport", payload, MessagePriority::Normal)
            .unwrap();
        let ids = pending.unique_ids();
        assert!(ids.len() > 1);
        assert_eq!(h.store.lock().len(), ids.len());

        let messages = h.engine.pending_messages();
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message.payload["seqNo"], i);
            assert!(message.to_frame().unwrap().len() <= 400);
        }
    }

    #[tokio::test]
    async fn test_registration_gate_holds_traffic() {
        let mut h = harness(config().with_registration_gate(true));

        let heartbeat = h.engine.enqueue("Heartbeat", json!({}), MessagePriority::Normal).unwrap();
        let boot = h
            .engine
            .enqueue("BootNotification", json!({"reason": "PowerUp"}), MessagePriority::High)
            .unwrap();
        h.events.send(TransportEvent::Connected).unwrap();

        let frame = next_frame(&mut h.commands).await;
        assert_eq!(frame.message_id(), boot.unique_id());
        h.events
            .send(TransportEvent::Message(format!(
                r#"[3,"{}",{{"currentTime":"2026-01-20T12:00:00Z","interval":300,"status":"Accepted"}}]"#,
                boot.unique_id()
            )))
            .unwrap();

        let frame = next_frame(&mut h.commands).await;
        assert_eq!(frame.message_id(), heartbeat.unique_id());
        assert!(h.engine.is_registration_accepted());
    }

    #[tokio::test]
    async fn test_pause_holds_traffic() {
        let mut h = harness(config());
        h.engine.pause();
        h.events.send(TransportEvent::Connected).unwrap();
        let pending = h.engine.enqueue("Heartbeat", json!({}), MessagePriority::Normal).unwrap();

        let held = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            next_frame(&mut h.commands),
        )
        .await;
        assert!(held.is_err());

        h.engine.resume();
        let frame = next_frame(&mut h.commands).await;
        assert_eq!(frame.message_id(), pending.unique_id());
    }

    #[tokio::test]
    async fn test_retry_policy_update() {
        let h = harness(config());
        let policy = RetryPolicy {
            max_attempts: 5,
            ..h.engine.retry_policy()
        };
        h.engine.update_retry_policy(policy);
        assert_eq!(h.engine.retry_policy().max_attempts, 5);
        assert!(!h.engine.retry_policy().is_exhausted(4));
    }

    #[tokio::test]
    async fn test_disconnect_schedules_reconnect() {
        let mut h = harness(config());
        h.events.send(TransportEvent::Connected).unwrap();
        h.events
            .send(TransportEvent::Disconnected {
                reason: "network down".to_string(),
                requested: false,
            })
            .unwrap();

        loop {
            match h.commands.recv().await {
                Some(TransportCommand::Reconnect { reason, delay }) => {
                    assert_eq!(reason, "network down");
                    assert!(delay >= std::time::Duration::from_secs(5));
                    break;
                }
                Some(_) => continue,
                None => panic!("transport handle dropped"),
            }
        }
        assert!(!h.engine.is_connected());
    }

    #[tokio::test]
    async fn test_transaction_message_query() {
        let h = harness(config());
        h.engine
            .enqueue_transaction("tx-1", "TransactionEvent", json!({}))
            .unwrap();

        assert!(h.engine.has_transaction_messages("tx-1"));
        assert!(!h.engine.has_transaction_messages("tx-2"));
    }

    #[tokio::test]
    async fn test_full_queue_sheds_oldest_meter_values() {
        let h = harness(config().with_max_queue_size(3));

        let started = h
            .engine
            .enqueue_transaction("tx-1", "TransactionEvent", json!({"eventType": "Started", "seqNo": 0}))
            .unwrap();
        let meter_values = h
            .engine
            .enqueue("MeterValues", json!({"evseId": 1, "meterValue": []}), MessagePriority::Normal)
            .unwrap();
        let updated = h
            .engine
            .enqueue_transaction("tx-1", "TransactionEvent", json!({"eventType": "Updated", "seqNo": 1}))
            .unwrap();
        let meter_values_id = meter_values.unique_id().to_string();
        let updated_id = updated.unique_id().to_string();
        assert_eq!(h.engine.queue_len(), 3);

        let boot = h
            .engine
            .enqueue("BootNotification", json!({"reason": "PowerUp"}), MessagePriority::Normal)
            .unwrap();
        match meter_values.wait().await {
            Err(EngineError::Dropped(id)) => assert_eq!(id, meter_values_id),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.engine.queue_len(), 3);
        assert_eq!(h.store.lock().len(), 3);

        let ended = h
            .engine
            .enqueue_transaction("tx-1", "TransactionEvent", json!({"eventType": "Ended", "seqNo": 2}))
            .unwrap();
        match updated.wait().await {
            Err(EngineError::Dropped(id)) => assert_eq!(id, updated_id),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Nothing sheddable left: the bound is exceeded rather than losing
        // Started/Ended or BootNotification
        h.engine
            .enqueue("Heartbeat", json!({}), MessagePriority::Normal)
            .unwrap();
        assert_eq!(h.engine.queue_len(), 4);
        assert_eq!(h.store.lock().len(), 4);

        let kept: Vec<String> = h
            .engine
            .pending_messages()
            .into_iter()
            .map(|m| m.unique_id)
            .collect();
        for id in [started.unique_id(), boot.unique_id(), ended.unique_id()] {
            assert!(kept.iter().any(|k| k == id), "{} was dropped", id);
        }
        assert!(!kept.contains(&meter_values_id));
        assert!(!kept.contains(&updated_id));
    }

    #[tokio::test]
    async fn test_boot_notification_always_high_priority() {
        let mut h = harness(config());

        let heartbeat = h.engine.enqueue("Heartbeat", json!({}), MessagePriority::Normal).unwrap();
        let boot = h
            .engine
            .enqueue("BootNotification", json!({"reason": "PowerUp"}), MessagePriority::Normal)
            .unwrap();

        let queued = h.engine.pending_messages();
        assert_eq!(queued[0].unique_id, boot.unique_id());
        assert_eq!(queued[0].priority, MessagePriority::High);
        assert_eq!(queued[1].unique_id, heartbeat.unique_id());

        h.events.send(TransportEvent::Connected).unwrap();
        let frame = next_frame(&mut h.commands).await;
        assert_eq!(frame.message_id(), boot.unique_id());
    }

    #[tokio::test]
    async fn test_response_pending_until_answered() {
        let mut h = harness(config());
        let pending = h
            .engine
            .enqueue("Heartbeat", json!({}), MessagePriority::Normal)
            .unwrap();
        let unique_id = pending.unique_id().to_string();
        let mut wait = tokio_test::task::spawn(pending.wait());
        tokio_test::assert_pending!(wait.poll());

        h.events.send(TransportEvent::Connected).unwrap();
        let frame = next_frame(&mut h.commands).await;
        assert_eq!(frame.message_id(), unique_id);
        tokio_test::assert_pending!(wait.poll());

        h.events
            .send(TransportEvent::Message(format!(r#"[3,"{}",{{}}]"#, unique_id)))
            .unwrap();
        let result = loop {
            if let std::task::Poll::Ready(result) = wait.poll() {
                break result;
            }
            tokio::task::yield_now().await;
        };
        assert!(result.is_ok());
    }
}
