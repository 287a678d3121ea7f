//! Dispatch transport: a bounded queue feeding long-lived relay connections.
//!
//! Callers hand a composed message to [`DispatchTransport::send`] and await its
//! [`DispatchOutcome`]. Messages wait in a bounded queue (callers block when
//! it is full; they are never rejected) and are transmitted by
//! `max_connections` workers, each owning at most one open relay connection.
//! With the default of one connection every send is serialized through a
//! single SMTP session, which keeps the relay's rate limits out of reach.
//!
//! Each worker rotates its connection after `max_messages_per_connection`
//! sends and discards it after any failure. Connect and transmit are bounded
//! by their own deadlines; an elapsed deadline fails that send only. The
//! transport never retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use crate::compose::OutboundMessage;
use crate::error::DispatchFailure;
use crate::relay::{MailRelay, RelayConnection};

pub mod types;

pub use types::{ConnectionId, DispatchOutcome, DispatchReceipt, TransportConfig, TransportStats};

struct DispatchJob {
    message: OutboundMessage,
    enqueued_at: Instant,
    reply: oneshot::Sender<DispatchOutcome>,
    _slot: QueueSlot,
}

/// Counts a job as queued until a worker picks it up or it is dropped.
struct QueueSlot(Arc<TransportCounters>);

impl QueueSlot {
    fn new(counters: Arc<TransportCounters>) -> Self {
        counters.queued.fetch_add(1, Ordering::Relaxed);
        Self(counters)
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct TransportCounters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    sent: AtomicU64,
    failed: AtomicU64,
    connections_opened: AtomicU64,
    connections_rotated: AtomicU64,
    connections_expired: AtomicU64,
    next_connection_id: AtomicU64,
}

/// Pooled, rate-limited channel to the mail relay.
pub struct DispatchTransport {
    queue: mpsc::Sender<DispatchJob>,
    counters: Arc<TransportCounters>,
    shutdown_token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchTransport {
    /// Spawn the transport workers.
    ///
    /// Workers stop when `shutdown_token` is cancelled; a send in progress at
    /// that moment finishes (within its deadline), queued sends fail with
    /// [`DispatchFailure::Shutdown`].
    pub fn start<R: MailRelay>(
        relay: Arc<R>,
        config: TransportConfig,
        shutdown_token: CancellationToken,
    ) -> Arc<Self> {
        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(TransportCounters::default());

        let mut workers = Vec::with_capacity(config.max_connections);
        for id in 0..config.max_connections.max(1) {
            let worker = Worker {
                id,
                relay: relay.clone(),
                receiver: receiver.clone(),
                config: config.clone(),
                counters: counters.clone(),
                shutdown_token: shutdown_token.clone(),
                connection: None,
            };
            workers.push(tokio::spawn(worker.run()));
        }

        if let Some(interval_ms) = config.status_log_interval_ms {
            let counters = counters.clone();
            let shutdown_token = shutdown_token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            tracing::debug!(
                                queued = counters.queued.load(Ordering::Relaxed),
                                in_flight = counters.in_flight.load(Ordering::Relaxed),
                                sent = counters.sent.load(Ordering::Relaxed),
                                failed = counters.failed.load(Ordering::Relaxed),
                                "Dispatch transport status"
                            );
                        }
                        _ = shutdown_token.cancelled() => break,
                    }
                }
            });
        }

        tracing::info!(
            max_connections = config.max_connections,
            max_messages_per_connection = config.max_messages_per_connection,
            connect_timeout_ms = config.connect_timeout_ms,
            socket_timeout_ms = config.socket_timeout_ms,
            "Dispatch transport started"
        );

        Arc::new(Self {
            queue,
            counters,
            shutdown_token,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a message and wait for its outcome.
    ///
    /// Waits while the queue is full. Dropping the returned future does not
    /// stop a send that a worker has already started.
    pub async fn send(&self, message: OutboundMessage) -> DispatchOutcome {
        if self.shutdown_token.is_cancelled() {
            return DispatchOutcome::Failed(DispatchFailure::Shutdown);
        }

        let submission_id = message.submission_id;
        let (reply, outcome) = oneshot::channel();
        let job = DispatchJob {
            message,
            enqueued_at: Instant::now(),
            reply,
            _slot: QueueSlot::new(self.counters.clone()),
        };

        if self.queue.send(job).await.is_err() {
            tracing::warn!(submission_id = %submission_id, "Dispatch queue closed");
            return DispatchOutcome::Failed(DispatchFailure::Shutdown);
        }

        // A dropped reply means the job was discarded at shutdown
        outcome
            .await
            .unwrap_or(DispatchOutcome::Failed(DispatchFailure::Shutdown))
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            queued: c.queued.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            connections_opened: c.connections_opened.load(Ordering::Relaxed),
            connections_rotated: c.connections_rotated.load(Ordering::Relaxed),
            connections_expired: c.connections_expired.load(Ordering::Relaxed),
        }
    }

    /// Stop the workers and wait for them to close their connections.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Dispatch worker panicked");
            }
        }
        tracing::info!("Dispatch transport stopped");
    }
}

struct ActiveConnection<C> {
    id: ConnectionId,
    conn: C,
    sent: usize,
    last_used: Instant,
}

struct Worker<R: MailRelay> {
    id: usize,
    relay: Arc<R>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<DispatchJob>>>,
    config: TransportConfig,
    counters: Arc<TransportCounters>,
    shutdown_token: CancellationToken,
    connection: Option<ActiveConnection<R::Connection>>,
}

impl<R: MailRelay> Worker<R> {
    #[tracing::instrument(skip(self), fields(worker = self.id))]
    async fn run(mut self) {
        tracing::debug!("Dispatch worker started");

        loop {
            let job = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => None,
                job = async { self.receiver.lock().await.recv().await } => job,
            };
            let Some(DispatchJob {
                message,
                enqueued_at,
                reply,
                _slot,
            }) = job
            else {
                break;
            };
            drop(_slot);

            let outcome = self.dispatch(&message, enqueued_at.elapsed()).await;
            match &outcome {
                DispatchOutcome::Sent(receipt) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        submission_id = %message.submission_id,
                        connection = %receipt.connection,
                        attachments = message.attachments.len(),
                        queued_ms = receipt.queued_for.as_millis() as u64,
                        elapsed_ms = receipt.elapsed.as_millis() as u64,
                        "Message sent"
                    );
                }
                DispatchOutcome::Failed(failure) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        submission_id = %message.submission_id,
                        error = %failure,
                        "Message dispatch failed"
                    );
                }
            }

            if reply.send(outcome).is_err() {
                tracing::debug!(
                    submission_id = %message.submission_id,
                    "Caller stopped waiting for dispatch outcome"
                );
            }
        }

        if let Some(active) = self.connection.take() {
            self.close(active, "shutdown").await;
        }
        tracing::debug!("Dispatch worker stopped");
    }

    async fn dispatch(&mut self, message: &OutboundMessage, queued_for: Duration) -> DispatchOutcome {
        let started = Instant::now();
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let counters = self.counters.clone();
        let _guard = scopeguard::guard((), move |_| {
            counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        });

        if let Some(active) = self.connection.take() {
            if active.last_used.elapsed() >= self.config.max_idle() {
                self.counters
                    .connections_expired
                    .fetch_add(1, Ordering::Relaxed);
                self.close(active, "idle").await;
            } else {
                self.connection = Some(active);
            }
        }

        let mut active = match self.connection.take() {
            Some(active) => active,
            None => match self.open().await {
                Ok(active) => active,
                Err(failure) => return DispatchOutcome::Failed(failure),
            },
        };

        match timeout(self.config.socket_timeout(), active.conn.deliver(message)).await {
            Ok(Ok(())) => {
                active.sent += 1;
                active.last_used = Instant::now();
                let receipt = DispatchReceipt {
                    connection: active.id,
                    queued_for,
                    elapsed: started.elapsed(),
                };
                if active.sent >= self.config.max_messages_per_connection {
                    self.counters
                        .connections_rotated
                        .fetch_add(1, Ordering::Relaxed);
                    self.close(active, "message ceiling reached").await;
                } else {
                    self.connection = Some(active);
                }
                DispatchOutcome::Sent(receipt)
            }
            Ok(Err(e)) if e.is_local() => {
                // Nothing reached the relay; the session is still good
                self.connection = Some(active);
                DispatchOutcome::Failed(DispatchFailure::Message(e.to_string()))
            }
            Ok(Err(e)) => {
                self.close(active, "delivery failed").await;
                DispatchOutcome::Failed(DispatchFailure::Relay(e.to_string()))
            }
            Err(_) => {
                self.close(active, "delivery timed out").await;
                DispatchOutcome::Failed(DispatchFailure::SendTimeout)
            }
        }
    }

    async fn open(&self) -> Result<ActiveConnection<R::Connection>, DispatchFailure> {
        let id = ConnectionId(self.counters.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1);

        match timeout(self.config.connect_timeout(), self.relay.connect()).await {
            Ok(Ok(conn)) => {
                self.counters
                    .connections_opened
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!(connection = %id, "Opened relay connection");
                Ok(ActiveConnection {
                    id,
                    conn,
                    sent: 0,
                    last_used: Instant::now(),
                })
            }
            Ok(Err(e)) => {
                tracing::error!(connection = %id, error = %e, "Failed to open relay connection");
                Err(DispatchFailure::Connect(e.to_string()))
            }
            Err(_) => {
                tracing::error!(
                    connection = %id,
                    timeout_ms = self.config.connect_timeout_ms,
                    "Timed out opening relay connection"
                );
                Err(DispatchFailure::ConnectTimeout)
            }
        }
    }

    async fn close(&self, mut active: ActiveConnection<R::Connection>, reason: &str) {
        if timeout(self.config.greeting_timeout(), active.conn.close())
            .await
            .is_err()
        {
            tracing::warn!(connection = %active.id, "Timed out closing relay connection");
        }
        tracing::debug!(
            connection = %active.id,
            messages = active.sent,
            reason,
            "Closed relay connection"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::OutboundAttachment;
    use crate::domain::submission::SubmissionId;
    use crate::error::FieldlogError;
    use crate::relay::{MockRelay, RelayError};

    fn test_config() -> TransportConfig {
        TransportConfig {
            max_connections: 1,
            max_messages_per_connection: 30,
            connect_timeout_ms: 1_000,
            greeting_timeout_ms: 500,
            socket_timeout_ms: 1_000,
            max_idle_ms: 60_000,
            queue_capacity: 8,
            status_log_interval_ms: None,
        }
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            submission_id: SubmissionId::new(),
            recipient: "office@example.com".to_string(),
            subject: "Daily Log - 01/15/2024 - Jeff LaFave".to_string(),
            body_text: "body".to_string(),
            attachments: Vec::new(),
        }
    }

    fn start(relay: &MockRelay, config: TransportConfig) -> Arc<DispatchTransport> {
        DispatchTransport::start(Arc::new(relay.clone()), config, CancellationToken::new())
    }

    #[test_log::test(tokio::test)]
    async fn test_send_reuses_one_connection() {
        let relay = MockRelay::new();
        let transport = start(&relay, test_config());

        for _ in 0..3 {
            assert!(transport.send(message()).await.is_sent());
        }

        assert_eq!(relay.delivery_count(), 3);
        assert_eq!(relay.connections_opened(), 1);
        let stats = transport.stats();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.connections_opened, 1);

        transport.shutdown().await;
        assert_eq!(relay.connections_closed(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_sends_are_serialized() {
        let relay = MockRelay::new();
        let trigger = relay.add_response_with_trigger(Ok(()));
        let transport = start(&relay, test_config());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move { transport.send(message()).await }));
        }

        // First send is held open by the trigger; the rest must queue behind it
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.in_flight_count(), 1);
        assert_eq!(transport.stats().queued, 4);

        trigger.send(()).unwrap();
        for handle in handles {
            assert!(handle.await.unwrap().is_sent());
        }

        assert_eq!(relay.max_in_flight(), 1);
        assert_eq!(relay.connections_opened(), 1);
        assert_eq!(transport.stats().queued, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_full_queue_blocks_instead_of_rejecting() {
        let relay = MockRelay::new();
        let trigger = relay.add_response_with_trigger(Ok(()));
        let transport = start(
            &relay,
            TransportConfig {
                queue_capacity: 1,
                ..test_config()
            },
        );

        let mut handles = Vec::new();
        for _ in 0..4 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move { transport.send(message()).await }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handles.iter().all(|h| !h.is_finished()));

        trigger.send(()).unwrap();
        for handle in handles {
            assert!(handle.await.unwrap().is_sent());
        }
        assert_eq!(relay.delivery_count(), 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_connection_rotates_after_message_ceiling() {
        let relay = MockRelay::new();
        let transport = start(
            &relay,
            TransportConfig {
                max_messages_per_connection: 2,
                ..test_config()
            },
        );

        for _ in 0..5 {
            assert!(transport.send(message()).await.is_sent());
        }

        assert_eq!(relay.connections_opened(), 3);
        assert_eq!(relay.connections_closed(), 2);
        assert_eq!(transport.stats().connections_rotated, 2);

        let connections: Vec<_> = relay.deliveries().iter().map(|d| d.connection).collect();
        assert_eq!(connections, vec![1, 1, 2, 2, 3]);
    }

    #[test_log::test(tokio::test)]
    async fn test_send_timeout_fails_and_discards_connection() {
        let relay = MockRelay::new();
        relay.add_delayed_response(Duration::from_secs(5), Ok(()));
        let transport = start(
            &relay,
            TransportConfig {
                socket_timeout_ms: 50,
                ..test_config()
            },
        );

        let outcome = transport.send(message()).await;
        assert_eq!(outcome, DispatchOutcome::Failed(DispatchFailure::SendTimeout));
        assert_eq!(relay.connections_closed(), 1);
        assert_eq!(relay.in_flight_count(), 0);

        // The next send gets a fresh connection
        assert!(transport.send(message()).await.is_sent());
        assert_eq!(relay.connections_opened(), 2);

        let stats = transport.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_timeout() {
        let relay = MockRelay::new();
        relay.delay_next_connect(Duration::from_secs(5));
        let transport = start(
            &relay,
            TransportConfig {
                connect_timeout_ms: 50,
                ..test_config()
            },
        );

        let outcome = transport.send(message()).await;
        assert_eq!(outcome, DispatchOutcome::Failed(DispatchFailure::ConnectTimeout));
        assert_eq!(relay.delivery_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_and_relay_errors() {
        let relay = MockRelay::new();
        relay.fail_next_connect(RelayError::Connect("535 authentication rejected".to_string()));
        let transport = start(&relay, test_config());

        match transport.send(message()).await {
            DispatchOutcome::Failed(DispatchFailure::Connect(reason)) => {
                assert!(reason.contains("535"));
            }
            other => panic!("Expected connect failure, got {:?}", other),
        }

        relay.add_response(Err(RelayError::Rejected("552 message too large".to_string())));
        match transport.send(message()).await {
            DispatchOutcome::Failed(failure @ DispatchFailure::Relay(_)) => {
                assert_eq!(
                    FieldlogError::from(failure).to_string(),
                    "Failed to send email: mail relay rejected message: 552 message too large"
                );
            }
            other => panic!("Expected relay failure, got {:?}", other),
        }

        // No internal retry: each failure was a single attempt
        assert_eq!(transport.stats().failed, 2);
        assert_eq!(relay.delivery_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_unreadable_attachment_is_local_failure() {
        let relay = MockRelay::new();
        let transport = start(&relay, test_config());
        assert!(transport.send(message()).await.is_sent());

        let mut broken = message();
        broken.attachments.push(OutboundAttachment {
            display_name: "x.jpg".to_string(),
            source: "/nonexistent/x".into(),
            content_type: "image/jpeg".to_string(),
        });
        match transport.send(broken).await {
            DispatchOutcome::Failed(DispatchFailure::Message(reason)) => {
                assert!(reason.starts_with("could not read attachment 'x.jpg'"));
            }
            other => panic!("Expected local message failure, got {:?}", other),
        }

        // The healthy session is kept for the next message
        assert!(transport.send(message()).await.is_sent());
        assert_eq!(relay.connections_opened(), 1);
        assert_eq!(relay.connections_closed(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_idle_connection_is_replaced() {
        let relay = MockRelay::new();
        let transport = start(
            &relay,
            TransportConfig {
                max_idle_ms: 50,
                ..test_config()
            },
        );

        assert!(transport.send(message()).await.is_sent());
        assert!(transport.send(message()).await.is_sent());
        assert_eq!(relay.connections_opened(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.send(message()).await.is_sent());

        assert_eq!(relay.connections_opened(), 2);
        assert_eq!(relay.connections_closed(), 1);
        let stats = transport.stats();
        assert_eq!(stats.connections_expired, 1);
        assert_eq!(stats.connections_rotated, 0);

        let connections: Vec<_> = relay.deliveries().iter().map(|d| d.connection).collect();
        assert_eq!(connections, vec![1, 1, 2]);
    }

    #[test_log::test(tokio::test)]
    async fn test_send_after_shutdown_fails() {
        let relay = MockRelay::new();
        let transport = start(&relay, test_config());
        transport.shutdown().await;

        assert_eq!(
            transport.send(message()).await,
            DispatchOutcome::Failed(DispatchFailure::Shutdown)
        );
    }
}
