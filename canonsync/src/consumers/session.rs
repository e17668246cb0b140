// canonsync/src/consumers/session.rs - Per-session sequential dispatch under a global session cap

use canonsync_core::{Envelope, HandleOutcome, HandlerRegistry, PayloadEvent, WorkError};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::{settlement_for, InboundMessage, MetricsSnapshot, SessionMetrics, Settlement};
use crate::config::ConsumerSettings;
use crate::observability::{CorrelationContext, OperationLogger, SpanBuilder};

/// The value date of an event: its producer timestamp, capped at the broker enqueue time
pub fn value_date(event_date_time: DateTime<Utc>, enqueued_at: DateTime<Utc>) -> DateTime<Utc> {
    event_date_time.min(enqueued_at)
}

/// Decode a delivery, resolve its handler and run it. Handler panics come back as errors.
pub async fn dispatch(
    registry: &HandlerRegistry,
    message: &InboundMessage,
    ctx: &mut CorrelationContext,
) -> Result<HandleOutcome, WorkError> {
    let envelope = Envelope::decode(&message.body)?;
    *ctx = ctx.clone().with_envelope(&envelope);

    let handler = registry.get(envelope.payload_type()?)?;
    let event = PayloadEvent {
        value_date: value_date(envelope.event_date_time, message.enqueued_at),
        event_id: envelope.event_id,
        operation: envelope.operation,
        session_id: Some(message.session_id.clone()),
        payload: envelope.payload,
    };

    let span = SpanBuilder::new(ctx.clone()).payload_handling();
    AssertUnwindSafe(handler.handle_payload(event))
        .catch_unwind()
        .instrument(span)
        .await
        .unwrap_or_else(|_| Err(WorkError::Other("Payload handler panicked".to_string())))
}

// ============ SESSION WORKER ============

/// State shared by every session task
struct SessionWorker {
    registry: HandlerRegistry,
    metrics: Arc<SessionMetrics>,
    max_delivery_count: u32,
    retry_backoff: Duration,
}

impl SessionWorker {
    /// Run a delivery until it is completed or dead-lettered. A retryable failure is
    /// retried in place after a backoff, so the session takes nothing else meanwhile.
    /// Shutdown during the backoff hands the delivery back to the broker.
    async fn process(&self, mut message: InboundMessage, shutdown: &watch::Receiver<bool>) {
        loop {
            let mut ctx = CorrelationContext::new(message.session_id.clone(), message.delivery_count)
                .with_subject(message.subject.clone());
            let ingestion_span = SpanBuilder::new(ctx.clone()).message_ingestion();

            let retry = async {
                OperationLogger::message_received(&ctx);

                let result = dispatch(&self.registry, &message, &mut ctx).await;
                let settlement = settlement_for(&result, message.delivery_count, self.max_delivery_count);

                match (&settlement, &result) {
                    (Settlement::Complete, Ok(outcome)) => {
                        OperationLogger::message_completed(&ctx, &format!("{:?}", outcome))
                    }
                    (Settlement::Abandon, Err(err)) => OperationLogger::message_abandoned(&ctx, &err.to_string()),
                    (Settlement::DeadLetter { reason, description }, _) => {
                        OperationLogger::message_dead_lettered(&ctx, reason, description)
                    }
                    _ => {}
                }

                if settlement != Settlement::Abandon {
                    self.settle(&mut message, &settlement, &ctx).await;
                    return false;
                }

                self.metrics.record(&settlement);
                if self.back_off(&message, shutdown).await {
                    return true;
                }
                debug!(correlation_id = %ctx.correlation_id, "Shutting down, releasing message to the broker");
                // already counted as abandoned above
                self.settle(&mut message, &settlement, &ctx).await;
                false
            }
            .instrument(ingestion_span)
            .await;

            if !retry {
                return;
            }
            message.delivery_count += 1;
        }
    }

    async fn settle(&self, message: &mut InboundMessage, settlement: &Settlement, ctx: &CorrelationContext) {
        let settle_span = SpanBuilder::new(ctx.clone()).message_settle(settlement.name());
        match message.settle(settlement).instrument(settle_span).await {
            Ok(()) if *settlement != Settlement::Abandon => self.metrics.record(settlement),
            Ok(()) => {}
            Err(e) => error!(
                correlation_id = %ctx.correlation_id,
                error = %e,
                settlement = settlement.name(),
                "Failed to settle message, broker will redeliver"
            ),
        }
    }

    /// Wait `retry_backoff * delivery_count` while keeping the broker lease. Returns
    /// false when shutdown was signalled.
    async fn back_off(&self, message: &InboundMessage, shutdown: &watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        if let Err(e) = message.keep_alive().await {
            warn!(session.id = %message.session_id, error = %e, "Failed to extend message lease");
        }

        let mut stop = shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.retry_backoff * message.delivery_count) => true,
            Ok(_) = stop.wait_for(|stop| *stop) => false,
        }
    }
}

/// Runs one session: strictly sequential, closes after the idle window
async fn run_session(
    worker: Arc<SessionWorker>,
    session_id: String,
    mut rx: mpsc::Receiver<InboundMessage>,
    idle_timeout: Duration,
    predecessor: Option<JoinHandle<()>>,
    mut shutdown: watch::Receiver<bool>,
    _permit: OwnedSemaphorePermit,
) {
    // the previous incarnation may still be draining
    if let Some(previous) = predecessor {
        let _ = previous.await;
    }

    let active = worker.metrics.session_opened();
    info!("Initializing session '{}' ({} active)", session_id, active);

    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = tokio::time::timeout(idle_timeout, rx.recv()) => next,
        };
        match next {
            Ok(Some(message)) => worker.process(message, &shutdown).await,
            Ok(None) => break,
            Err(_idle) => {
                rx.close();
                while let Some(message) = rx.recv().await {
                    if *shutdown.borrow() {
                        break;
                    }
                    worker.process(message, &shutdown).await;
                }
                break;
            }
        }
    }

    info!("Closing session '{}'", session_id);
    worker.metrics.session_closed();
}

// ============ ROUTER ============

/// Capacity reserved in a session channel, tagged with the slot generation it was asked for
type Reservation = BoxFuture<'static, (String, u64, Option<mpsc::OwnedPermit<InboundMessage>>)>;

fn reserve(session_id: String, generation: u64, tx: mpsc::Sender<InboundMessage>) -> Reservation {
    async move { (session_id, generation, tx.reserve_owned().await.ok()) }.boxed()
}

struct SessionSlot {
    tx: mpsc::Sender<InboundMessage>,
    handle: JoinHandle<()>,
    generation: u64,
    /// Arrived while the channel was full, in arrival order
    overflow: VecDeque<InboundMessage>,
}

/// A session waiting for a free slot
struct ParkedSession {
    predecessor: Option<JoinHandle<()>>,
    queued: VecDeque<InboundMessage>,
}

/// Owns the session table. Never awaits a single session: a full channel parks the
/// message in the slot's overflow and a session without a slot waits in line, while
/// the run loop keeps serving everyone else.
struct SessionRouter {
    worker: Arc<SessionWorker>,
    settings: ConsumerSettings,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    sessions: HashMap<String, SessionSlot>,
    parked: HashMap<String, ParkedSession>,
    parked_order: VecDeque<String>,
    reservations: FuturesUnordered<Reservation>,
    generation: u64,
}

impl SessionRouter {
    fn new(worker: Arc<SessionWorker>, settings: ConsumerSettings, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(settings.max_concurrent_sessions)),
            worker,
            settings,
            shutdown,
            sessions: HashMap::new(),
            parked: HashMap::new(),
            parked_order: VecDeque::new(),
            reservations: FuturesUnordered::new(),
            generation: 0,
        }
    }

    /// Messages held by the router rather than by a session channel
    fn pending(&self) -> usize {
        self.sessions.values().map(|slot| slot.overflow.len()).sum::<usize>()
            + self.parked.values().map(|parked| parked.queued.len()).sum::<usize>()
    }

    fn pending_limit(&self) -> usize {
        (self.settings.max_concurrent_sessions * self.settings.session_prefetch).max(1)
    }

    fn is_idle(&self) -> bool {
        self.reservations.is_empty() && self.parked_order.is_empty()
    }

    /// Hand a message to its session, starting one if needed
    fn route(&mut self, message: InboundMessage) {
        let session_id = message.session_id.clone();

        if let Some(parked) = self.parked.get_mut(&session_id) {
            parked.queued.push_back(message);
            return;
        }

        let message = match self.sessions.get_mut(&session_id) {
            Some(slot) if !slot.overflow.is_empty() => {
                slot.overflow.push_back(message);
                return;
            }
            Some(slot) => match slot.tx.try_send(message) {
                Ok(()) => return,
                Err(TrySendError::Full(message)) => {
                    slot.overflow.push_back(message);
                    self.reservations
                        .push(reserve(session_id, slot.generation, slot.tx.clone()));
                    return;
                }
                // session closed itself after idling; a successor takes over
                Err(TrySendError::Closed(message)) => message,
            },
            None => message,
        };

        self.open_session(session_id, VecDeque::from([message]));
    }

    /// Channel room opened up for a session with overflow, or its channel closed
    fn on_room(&mut self, session_id: String, generation: u64, permit: Option<mpsc::OwnedPermit<InboundMessage>>) {
        let Some(slot) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if slot.generation != generation {
            return;
        }

        let Some(permit) = permit else {
            let queued = std::mem::take(&mut slot.overflow);
            self.open_session(session_id, queued);
            return;
        };

        if let Some(message) = slot.overflow.pop_front() {
            permit.send(message);
        }
        while let Some(message) = slot.overflow.pop_front() {
            if let Err(TrySendError::Full(message) | TrySendError::Closed(message)) = slot.tx.try_send(message) {
                slot.overflow.push_front(message);
                break;
            }
        }
        if !slot.overflow.is_empty() {
            self.reservations.push(reserve(session_id, generation, slot.tx.clone()));
        }
    }

    /// Start a session task for `queued`, or park it until a slot frees up
    fn open_session(&mut self, session_id: String, queued: VecDeque<InboundMessage>) {
        if self.sessions.len() >= self.settings.max_concurrent_sessions {
            self.sessions
                .retain(|_, slot| !slot.handle.is_finished() || !slot.overflow.is_empty());
        }

        let (predecessor, queued) = match self.sessions.remove(&session_id) {
            Some(mut slot) => {
                let mut carried = std::mem::take(&mut slot.overflow);
                carried.extend(queued);
                (Some(slot.handle).filter(|handle| !handle.is_finished()), carried)
            }
            None => (None, queued),
        };

        // sessions already waiting keep their place in line
        let permit = if self.parked_order.is_empty() {
            self.permits.clone().try_acquire_owned().ok()
        } else {
            None
        };

        match permit {
            Some(permit) => self.start_session(session_id, predecessor, queued, permit),
            None => {
                debug!(session.id = %session_id, sessions.waiting = self.parked_order.len() + 1, "All session slots taken");
                self.parked_order.push_back(session_id.clone());
                self.parked.insert(session_id, ParkedSession { predecessor, queued });
            }
        }
    }

    /// A slot freed up: give it to the longest waiting session
    fn start_parked(&mut self, permit: OwnedSemaphorePermit) {
        let Some(session_id) = self.parked_order.pop_front() else {
            return;
        };
        if let Some(parked) = self.parked.remove(&session_id) {
            self.start_session(session_id, parked.predecessor, parked.queued, permit);
        }
    }

    fn start_session(
        &mut self,
        session_id: String,
        predecessor: Option<JoinHandle<()>>,
        mut queued: VecDeque<InboundMessage>,
        permit: OwnedSemaphorePermit,
    ) {
        let (tx, rx) = mpsc::channel(self.settings.session_prefetch.max(1));
        while let Some(message) = queued.pop_front() {
            if let Err(TrySendError::Full(message) | TrySendError::Closed(message)) = tx.try_send(message) {
                queued.push_front(message);
                break;
            }
        }

        self.generation += 1;
        let generation = self.generation;
        if !queued.is_empty() {
            self.reservations
                .push(reserve(session_id.clone(), generation, tx.clone()));
        }

        debug!(session.id = %session_id, has_predecessor = predecessor.is_some(), "Starting session task");
        let handle = tokio::spawn(
            run_session(
                self.worker.clone(),
                session_id.clone(),
                rx,
                self.settings.session_idle_timeout,
                predecessor,
                self.shutdown.clone(),
                permit,
            )
            .instrument(tracing::info_span!("session", session.id = %session_id)),
        );
        self.sessions.insert(
            session_id,
            SessionSlot {
                tx,
                handle,
                generation,
                overflow: queued,
            },
        );
    }

    /// Drops every sender, so idle sessions finish as soon as they are drained
    fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.sessions.into_values().map(|slot| slot.handle).collect()
    }
}

// ============ SESSION CONSUMER ============

/// Routes deliveries to per-session tasks.
///
/// Each session (document id) gets its own task that handles one message at a time,
/// so updates to a document are applied in queue order. At most
/// `max_concurrent_sessions` session tasks exist at once; further sessions wait for a
/// slot in arrival order. The router stops pulling while the messages it holds for
/// busy or waiting sessions reach `max_concurrent_sessions * session_prefetch`.
pub struct SessionConsumer {
    worker: Arc<SessionWorker>,
    settings: ConsumerSettings,
}

impl SessionConsumer {
    pub fn new(registry: HandlerRegistry, settings: ConsumerSettings) -> Self {
        let worker = Arc::new(SessionWorker {
            registry,
            metrics: Arc::new(SessionMetrics::default()),
            max_delivery_count: settings.max_delivery_count,
            retry_backoff: settings.retry_backoff,
        });
        Self { worker, settings }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.worker.metrics.snapshot()
    }

    /// Consume until the stream ends or `shutdown` flips to true.
    ///
    /// When the stream ends every session drains before this returns. On shutdown the
    /// in-flight handlers get the configured grace period and are then aborted; anything
    /// left unsettled is redelivered by the broker.
    pub async fn run<S>(&self, mut messages: S, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkError>
    where
        S: Stream<Item = Result<InboundMessage, WorkError>> + Send + Unpin,
    {
        let mut router = SessionRouter::new(self.worker.clone(), self.settings.clone(), shutdown.clone());
        let mut stopping = *shutdown.borrow();
        let mut stream_done = false;

        info!(
            sessions.max = self.settings.max_concurrent_sessions,
            sessions.prefetch = self.settings.session_prefetch,
            "Session consumer started"
        );

        while !stopping {
            if stream_done && router.is_idle() {
                break;
            }
            let accepting = !stream_done && router.pending() < router.pending_limit();
            let reserving = !router.reservations.is_empty();
            let waiting = !router.parked_order.is_empty();

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    stopping = changed.is_err() || *shutdown.borrow();
                }
                Some((session_id, generation, permit)) = router.reservations.next(), if reserving => {
                    router.on_room(session_id, generation, permit);
                }
                permit = router.permits.clone().acquire_owned(), if waiting => match permit {
                    Ok(permit) => router.start_parked(permit),
                    Err(e) => {
                        error!(error = %e, "Session slots unavailable");
                        stopping = true;
                    }
                },
                next = messages.next(), if accepting => match next {
                    Some(Ok(message)) => router.route(message),
                    Some(Err(e)) => {
                        error!(error = %e, "Error receiving from input queue, continuing");
                    }
                    None => {
                        info!("Input stream ended, draining sessions");
                        stream_done = true;
                    }
                },
            }
        }

        let held = router.pending();
        let handles = router.into_handles();

        if !stopping {
            futures::future::join_all(handles).await;
            return Ok(());
        }

        info!(sessions.open = handles.len(), messages.unrouted = held, "Shutting down session consumer");
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(self.settings.shutdown_grace, futures::future::join_all(handles)).await {
            Ok(_) => info!("All sessions closed"),
            Err(_) => {
                warn!("clean shutdown timed out");
                for abort in aborts {
                    abort.abort();
                }
            }
        }
        Ok(())
    }
}
