//! Mail relay abstraction.
//!
//! [`MailRelay`] opens connections to the outbound relay and
//! [`RelayConnection`] transmits one message at a time over an open
//! connection. The dispatch transport owns every connection it opens; callers
//! never see them. The abstraction lets the transport be exercised against
//! [`MockRelay`] without a real SMTP server.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compose::OutboundMessage;

/// Errors reported by a relay implementation.
///
/// Timeouts are not represented here: the transport bounds every call and
/// classifies elapsed deadlines itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("{0}")]
    Connect(String),

    #[error("{0}")]
    Rejected(String),

    #[error("could not read attachment '{name}': {reason}")]
    Attachment { name: String, reason: String },

    #[error("could not build message: {0}")]
    Build(String),
}

impl RelayError {
    /// The message could not be prepared locally; the relay never saw it and
    /// the connection is still usable.
    pub fn is_local(&self) -> bool {
        matches!(self, RelayError::Attachment { .. } | RelayError::Build(_))
    }
}

/// Opens authenticated connections to a single mail relay.
#[async_trait]
pub trait MailRelay: Send + Sync + 'static {
    type Connection: RelayConnection;

    /// Open a connection and complete the protocol greeting and login.
    async fn connect(&self) -> Result<Self::Connection, RelayError>;
}

/// One open connection to the relay.
///
/// Connections are owned by transport workers running on the multi-threaded
/// runtime, so they must be shareable across threads.
#[async_trait]
pub trait RelayConnection: Send + Sync + 'static {
    /// Transmit a message with all of its attachments.
    ///
    /// Either the relay accepted the whole message or an error is returned;
    /// there is no partially sent state.
    async fn deliver(&mut self, message: &OutboundMessage) -> Result<(), RelayError>;

    /// Close the connection. Errors are not reported.
    async fn close(&mut self);
}

/// Relay account and addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Sender address; defaults to `username` (the authenticated account)
    pub from: Option<String>,
    /// Fixed office recipient for every notification
    pub recipient: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from: None,
            recipient: String::new(),
        }
    }
}

impl RelayConfig {
    pub fn sender(&self) -> &str {
        self.from.as_deref().unwrap_or(&self.username)
    }
}

// ============================================================================
// Production Implementation using lettre
// ============================================================================

pub use smtp::{LettreConnection, LettreRelay};

mod smtp {
    use super::*;

    use lettre::message::header::ContentType;
    use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
    use lettre::transport::smtp::PoolConfig;
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

    /// Lettre drops pooled sockets idle for longer than this and reconnects
    /// on the next send. The transport retires idle connections itself well
    /// before, so every reconnect goes through `connect` and its deadline.
    const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

    /// SMTP relay using lettre over STARTTLS.
    ///
    /// Each [`LettreConnection`] wraps a lettre transport whose internal pool
    /// holds at most one socket, so a connection here is one SMTP session.
    #[derive(Clone)]
    pub struct LettreRelay {
        host: String,
        port: u16,
        credentials: Credentials,
        sender: Mailbox,
        command_timeout: Duration,
    }

    impl LettreRelay {
        /// Build a relay client.
        ///
        /// `command_timeout` bounds each protocol read/write, including the
        /// server greeting.
        pub fn new(config: &RelayConfig, command_timeout: Duration) -> Result<Self, RelayError> {
            let sender = config
                .sender()
                .parse::<Mailbox>()
                .map_err(|e| RelayError::Build(format!("invalid sender address: {}", e)))?;

            Ok(Self {
                host: config.host.clone(),
                port: config.port,
                credentials: Credentials::new(config.username.clone(), config.password.clone()),
                sender,
                command_timeout,
            })
        }
    }

    /// An SMTP session opened by [`LettreRelay`].
    pub struct LettreConnection {
        transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
        sender: Mailbox,
    }

    #[async_trait]
    impl MailRelay for LettreRelay {
        type Connection = LettreConnection;

        #[tracing::instrument(skip(self), fields(host = %self.host, port = self.port))]
        async fn connect(&self) -> Result<LettreConnection, RelayError> {
            let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
                .map_err(|e| RelayError::Connect(e.to_string()))?
                .port(self.port)
                .credentials(self.credentials.clone())
                .timeout(Some(self.command_timeout))
                .pool_config(
                    PoolConfig::new()
                        .max_size(1)
                        .idle_timeout(POOL_IDLE_TIMEOUT),
                )
                .build();

            // Opens the pooled socket: TCP connect, greeting, STARTTLS and AUTH
            match transport.test_connection().await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(RelayError::Connect(
                        "relay did not answer the connection test".to_string(),
                    ));
                }
                Err(e) => {
                    tracing::error!(error = %e, "SMTP connection failed");
                    return Err(RelayError::Connect(e.to_string()));
                }
            }

            tracing::debug!("SMTP connection established");
            Ok(LettreConnection {
                transport: Some(transport),
                sender: self.sender.clone(),
            })
        }
    }

    #[async_trait]
    impl RelayConnection for LettreConnection {
        #[tracing::instrument(skip(self, message), fields(submission_id = %message.submission_id, attachments = message.attachments.len()))]
        async fn deliver(&mut self, message: &OutboundMessage) -> Result<(), RelayError> {
            let transport = self
                .transport
                .as_ref()
                .ok_or_else(|| RelayError::Connect("connection already closed".to_string()))?;

            let email = build_email(&self.sender, message).await?;
            let response = transport.send(email).await.map_err(|e| {
                tracing::error!(error = %e, "SMTP relay rejected message");
                RelayError::Rejected(e.to_string())
            })?;

            tracing::debug!(code = %response.code(), "SMTP relay accepted message");
            Ok(())
        }

        async fn close(&mut self) {
            // Dropping the transport shuts down its pool and the socket with it
            self.transport.take();
        }
    }

    async fn build_email(sender: &Mailbox, message: &OutboundMessage) -> Result<Message, RelayError> {
        let recipient = message
            .recipient
            .parse::<Mailbox>()
            .map_err(|e| RelayError::Build(format!("invalid recipient address: {}", e)))?;

        let mut body = MultiPart::mixed().singlepart(SinglePart::plain(message.body_text.clone()));

        for attachment in &message.attachments {
            let bytes = tokio::fs::read(&attachment.source)
                .await
                .map_err(|e| RelayError::Attachment {
                    name: attachment.display_name.clone(),
                    reason: e.to_string(),
                })?;
            let content_type = ContentType::parse(&attachment.content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| RelayError::Build(e.to_string()))?;
            body = body.singlepart(
                Attachment::new(attachment.display_name.clone()).body(bytes, content_type),
            );
        }

        Message::builder()
            .from(sender.clone())
            .to(recipient)
            .subject(message.subject.clone())
            .multipart(body)
            .map_err(|e| RelayError::Build(e.to_string()))
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// Mock relay for testing.
///
/// Accepts every delivery unless scripted otherwise. Responses queued with
/// [`MockRelay::add_response`] and friends are consumed in FIFO order, one per
/// delivery; connection attempts can be scripted the same way. Every delivery
/// reads its attachments from disk, so a test observes a missing staged file
/// as a delivery error.
///
/// # Example
/// ```ignore
/// let relay = MockRelay::new();
/// relay.add_response(Err(RelayError::Rejected("550 mailbox unavailable".into())));
/// let transport = DispatchTransport::start(Arc::new(relay.clone()), config, shutdown);
/// ```
#[derive(Clone, Default)]
pub struct MockRelay {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    responses: Mutex<VecDeque<MockResponse>>,
    connects: Mutex<VecDeque<MockConnect>>,
    deliveries: Mutex<Vec<MockDelivery>>,
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

enum MockResponse {
    /// Immediate response
    Immediate(Result<(), RelayError>),
    /// Response that waits for a trigger signal before completing
    Triggered {
        response: Result<(), RelayError>,
        trigger: oneshot::Receiver<()>,
    },
    /// Response that completes after a delay
    Delayed {
        response: Result<(), RelayError>,
        delay: Duration,
    },
}

enum MockConnect {
    Fail(RelayError),
    Delay(Duration),
}

/// Record of a message delivered through the mock relay.
#[derive(Debug, Clone)]
pub struct MockDelivery {
    pub connection: usize,
    pub recipient: String,
    pub subject: String,
    pub body_text: String,
    /// (display name, bytes read from the staged file)
    pub attachments: Vec<(String, usize)>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next unscripted delivery.
    pub fn add_response(&self, response: Result<(), RelayError>) {
        self.state
            .responses
            .lock()
            .push_back(MockResponse::Immediate(response));
    }

    /// Queue a response that is held until the returned sender fires (or is dropped).
    pub fn add_response_with_trigger(&self, response: Result<(), RelayError>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.responses.lock().push_back(MockResponse::Triggered {
            response,
            trigger: rx,
        });
        tx
    }

    /// Queue a response that completes only after `delay`.
    pub fn add_delayed_response(&self, delay: Duration, response: Result<(), RelayError>) {
        self.state
            .responses
            .lock()
            .push_back(MockResponse::Delayed { response, delay });
    }

    /// Make the next connection attempt fail.
    pub fn fail_next_connect(&self, error: RelayError) {
        self.state.connects.lock().push_back(MockConnect::Fail(error));
    }

    /// Make the next connection attempt stall for `delay` before succeeding.
    pub fn delay_next_connect(&self, delay: Duration) {
        self.state.connects.lock().push_back(MockConnect::Delay(delay));
    }

    pub fn deliveries(&self) -> Vec<MockDelivery> {
        self.state.deliveries.lock().clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.state.deliveries.lock().len()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.state.connections_closed.load(Ordering::SeqCst)
    }

    /// Number of deliveries currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of deliveries that were ever executing at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Connection handed out by [`MockRelay`].
pub struct MockConnection {
    id: usize,
    state: Arc<MockState>,
    closed: bool,
}

#[async_trait]
impl MailRelay for MockRelay {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, RelayError> {
        let scripted = self.state.connects.lock().pop_front();
        match scripted {
            Some(MockConnect::Fail(e)) => return Err(e),
            Some(MockConnect::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }
        let id = self.state.connections_opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConnection {
            id,
            state: self.state.clone(),
            closed: false,
        })
    }
}

#[async_trait]
impl RelayConnection for MockConnection {
    async fn deliver(&mut self, message: &OutboundMessage) -> Result<(), RelayError> {
        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(current, Ordering::SeqCst);

        // Decrement even if the delivery future is dropped by a timeout
        let state = self.state.clone();
        let _guard = scopeguard::guard((), move |_| {
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let mut attachments = Vec::with_capacity(message.attachments.len());
        for attachment in &message.attachments {
            let bytes = tokio::fs::read(&attachment.source)
                .await
                .map_err(|e| RelayError::Attachment {
                    name: attachment.display_name.clone(),
                    reason: e.to_string(),
                })?;
            attachments.push((attachment.display_name.clone(), bytes.len()));
        }

        let scripted = self.state.responses.lock().pop_front();
        let response = match scripted {
            None => Ok(()),
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                // Proceed whether the trigger fires or is dropped
                let _ = trigger.await;
                response
            }
            Some(MockResponse::Delayed { response, delay }) => {
                tokio::time::sleep(delay).await;
                response
            }
        };

        if response.is_ok() {
            self.state.deliveries.lock().push(MockDelivery {
                connection: self.id,
                recipient: message.recipient.clone(),
                subject: message.subject.clone(),
                body_text: message.body_text.clone(),
                attachments,
            });
        }
        response
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::OutboundAttachment;
    use crate::domain::submission::SubmissionId;

    fn message(attachments: Vec<OutboundAttachment>) -> OutboundMessage {
        OutboundMessage {
            submission_id: SubmissionId::new(),
            recipient: "office@example.com".to_string(),
            subject: "Daily Log - 01/15/2024 - Jeff LaFave".to_string(),
            body_text: "body".to_string(),
            attachments,
        }
    }

    #[tokio::test]
    async fn test_mock_relay_accepts_by_default() {
        let relay = MockRelay::new();
        let mut conn = relay.connect().await.unwrap();

        conn.deliver(&message(vec![])).await.unwrap();

        let deliveries = relay.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].connection, 1);
        assert_eq!(deliveries[0].recipient, "office@example.com");
        assert_eq!(relay.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_relay_scripted_responses_in_order() {
        let relay = MockRelay::new();
        relay.add_response(Err(RelayError::Rejected("550".to_string())));
        relay.add_response(Ok(()));

        let mut conn = relay.connect().await.unwrap();
        assert!(conn.deliver(&message(vec![])).await.is_err());
        assert!(conn.deliver(&message(vec![])).await.is_ok());
        assert_eq!(relay.delivery_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_relay_reads_attachments() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("01-photo_1.jpg");
        std::fs::write(&path, b"12345").unwrap();

        let relay = MockRelay::new();
        let mut conn = relay.connect().await.unwrap();
        conn.deliver(&message(vec![OutboundAttachment {
            display_name: "photo_1.jpg".to_string(),
            source: path.clone(),
            content_type: "image/jpeg".to_string(),
        }]))
        .await
        .unwrap();
        assert_eq!(relay.deliveries()[0].attachments, vec![("photo_1.jpg".to_string(), 5)]);

        std::fs::remove_file(&path).unwrap();
        let err = conn
            .deliver(&message(vec![OutboundAttachment {
                display_name: "photo_1.jpg".to_string(),
                source: path,
                content_type: "image/jpeg".to_string(),
            }]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Attachment { .. }));
    }

    #[tokio::test]
    async fn test_mock_relay_with_trigger() {
        let relay = MockRelay::new();
        let trigger = relay.add_response_with_trigger(Ok(()));

        let mut conn = relay.connect().await.unwrap();
        let handle = tokio::spawn(async move { conn.deliver(&message(vec![])).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(relay.in_flight_count(), 1);

        trigger.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(relay.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_relay_connect_failure() {
        let relay = MockRelay::new();
        relay.fail_next_connect(RelayError::Connect("535 bad credentials".to_string()));

        assert!(relay.connect().await.is_err());
        assert!(relay.connect().await.is_ok());
        assert_eq!(relay.connections_opened(), 1);
    }

    #[test]
    fn test_sender_defaults_to_username() {
        let mut config = RelayConfig {
            username: "logs@example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(config.sender(), "logs@example.com");

        config.from = Some("Field Logs <logs@example.com>".to_string());
        assert_eq!(config.sender(), "Field Logs <logs@example.com>");
    }

    #[test]
    fn test_connections_can_move_between_worker_threads() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<MockConnection>();
        assert_send_sync::<LettreConnection>();
    }

    #[test]
    fn test_local_errors_are_distinguished_from_relay_errors() {
        assert!(
            RelayError::Attachment {
                name: "photo_1.jpg".to_string(),
                reason: "No such file or directory".to_string(),
            }
            .is_local()
        );
        assert!(RelayError::Build("invalid recipient".to_string()).is_local());
        assert!(!RelayError::Rejected("552 message too large".to_string()).is_local());
        assert!(!RelayError::Connect("connection reset".to_string()).is_local());

        // Relay texts carry the server's reply without a second prefix
        assert_eq!(
            RelayError::Rejected("552 message too large".to_string()).to_string(),
            "552 message too large"
        );
    }
}
