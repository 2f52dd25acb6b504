//! Publish/subscribe messaging between services.
//!
//! Services talk to each other over NATS with JSON payloads. The broker is
//! hidden behind the [`Transport`] trait, so that services and probes can be
//! exercised against the in-process [`MemoryTransport`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("not connected to the message broker")]
    NotConnected,
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("failed to flush pending messages: {0}")]
    Flush(String),
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
}

impl Message {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.payload).map_err(MessagingError::Decode)
    }
}

/// Messages received on a subscription. Dropping the stream unsubscribes.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// A unique subject to receive replies on.
    fn new_inbox(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), MessagingError>;

    async fn subscribe(&self, subject: String) -> Result<MessageStream, MessagingError>;

    async fn flush(&self) -> Result<(), MessagingError>;

    /// Flushes what can be flushed and stops accepting new messages.
    async fn close(&self) -> Result<(), MessagingError>;
}

pub struct NatsTransport {
    client: async_nats::Client,
    closed: AtomicBool,
}

impl NatsTransport {
    pub async fn connect(
        name: &str,
        url: &str,
        connect_timeout: Duration,
    ) -> Result<Self, MessagingError> {
        let client = async_nats::ConnectOptions::new()
            .name(name)
            .connection_timeout(connect_timeout)
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Connected => info!("messaging: connected"),
                    async_nats::Event::Disconnected => warn!("messaging: disconnected"),
                    other => debug!(event = %other, "messaging: client event"),
                }
            })
            .connect(url)
            .await
            .map_err(|err| MessagingError::Connect {
                url: url.to_owned(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            client,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && matches!(
                self.client.connection_state(),
                async_nats::connection::State::Connected
            )
    }

    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::NotConnected);
        }
        self.client
            .publish(subject.clone(), payload)
            .await
            .map_err(|err| MessagingError::Publish {
                subject,
                reason: err.to_string(),
            })
    }

    async fn subscribe(&self, subject: String) -> Result<MessageStream, MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::NotConnected);
        }
        let subscriber =
            self.client
                .subscribe(subject.clone())
                .await
                .map_err(|err| MessagingError::Subscribe {
                    subject,
                    reason: err.to_string(),
                })?;

        Ok(Box::pin(subscriber.map(|message| Message {
            subject: message.subject.to_string(),
            payload: message.payload,
        })))
    }

    async fn flush(&self) -> Result<(), MessagingError> {
        self.client
            .flush()
            .await
            .map_err(|err| MessagingError::Flush(err.to_string()))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush().await
    }
}

/// In-process broker: every message published on a subject is delivered to
/// each live subscriber of that exact subject.
#[derive(Default)]
pub struct MemoryTransport {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    disconnected: AtomicBool,
    stalled: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a broker outage (or its recovery).
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Simulates a half-open connection: the client still looks connected,
    /// but messages go nowhere and flushes never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Live subscriptions on `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers
            .get(subject)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Subjects still holding a subscriber entry, live or not.
    #[cfg(test)]
    fn subject_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Drops the senders whose stream is gone, and the subjects left without any.
fn prune(subscribers: &mut HashMap<String, Vec<mpsc::UnboundedSender<Message>>>) {
    subscribers.retain(|_, senders| {
        senders.retain(|sender| !sender.is_closed());
        !senders.is_empty()
    });
}

#[async_trait]
impl Transport for MemoryTransport {
    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().simple())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), MessagingError> {
        if !self.is_connected() {
            return Err(MessagingError::NotConnected);
        }

        if self.stalled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let message = Message {
            subject: subject.clone(),
            payload,
        };
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = subscribers.get_mut(&subject) {
            senders.retain(|sender| sender.unbounded_send(message.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(&subject);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: String) -> Result<MessageStream, MessagingError> {
        if !self.is_connected() {
            return Err(MessagingError::NotConnected);
        }

        let (sender, receiver) = mpsc::unbounded();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut subscribers);
        subscribers.entry(subject).or_default().push(sender);
        Ok(Box::pin(receiver))
    }

    async fn flush(&self) -> Result<(), MessagingError> {
        if !self.is_connected() {
            return Err(MessagingError::NotConnected);
        }
        if self.stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.set_connected(false);
        // Ends every open stream.
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}

/// Typed handler for the messages of one subscription.
#[async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, message: T);
}

/// A running subscription, see [`MessagingClient::subscribe`].
pub struct Subscription {
    subject: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

/// JSON messaging over a [`Transport`]. Cheap to clone.
#[derive(Clone)]
pub struct MessagingClient {
    transport: Arc<dyn Transport>,
}

impl MessagingClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Connects to a NATS server, identifying as `name`.
    pub async fn connect(
        name: &str,
        url: &str,
        connect_timeout: Duration,
    ) -> Result<Self, MessagingError> {
        let transport = NatsTransport::connect(name, url, connect_timeout).await?;
        Ok(Self::new(Arc::new(transport)))
    }

    pub fn new_inbox(&self) -> String {
        self.transport.new_inbox()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        payload: &T,
    ) -> Result<(), MessagingError> {
        let payload = serde_json::to_vec(payload).map_err(MessagingError::Encode)?;
        self.transport
            .publish(subject.to_owned(), Bytes::from(payload))
            .await
    }

    /// Undecoded messages, for callers that need to control how long they listen.
    pub async fn subscribe_raw(&self, subject: &str) -> Result<MessageStream, MessagingError> {
        self.transport.subscribe(subject.to_owned()).await
    }

    /// Spawns a task feeding every message received on `subject` to
    /// `handler`. Messages that don't decode as `T` are logged and dropped.
    pub async fn subscribe<T, H>(
        &self,
        subject: &str,
        handler: H,
    ) -> Result<Subscription, MessagingError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let mut stream = self.subscribe_raw(subject).await?;

        let task_subject = subject.to_owned();
        let task = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message.decode::<T>() {
                    Ok(payload) => handler.handle(payload).await,
                    Err(err) => warn!(
                        subject = %message.subject,
                        error = %err,
                        "messaging: dropping undecodable message"
                    ),
                }
            }
            debug!(subject = %task_subject, "messaging: subscription closed");
        });

        Ok(Subscription {
            subject: subject.to_owned(),
            task,
        })
    }

    pub async fn flush(&self) -> Result<(), MessagingError> {
        self.transport.flush().await
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.transport.close().await
    }
}
