//! Bus abstraction and the in-process implementation.
//!
//! The control plane only ever talks to compute nodes and the health-signal
//! subsystem through a [`Bus`]: publish, subscribe, request with a timeout,
//! and reply. Requests never fail on timeout; they return whatever replies
//! arrived in time, which may be none.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};

use crate::error::{BusError, BusResult};
use crate::subjects::INBOX_PREFIX;

/// A message as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub subject: String,
    pub payload: Value,
    /// Where a reply should go, if the sender expects one.
    pub reply_to: Option<String>,
}

/// Options for a request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Stop collecting once this many replies arrived. `None` collects
    /// until the timeout.
    pub expected: Option<usize>,
    pub timeout: Duration,
}

impl RequestOptions {
    /// Wait for a single reply.
    pub fn single(timeout: Duration) -> Self {
        Self {
            expected: Some(1),
            timeout,
        }
    }

    /// Collect every reply arriving before `timeout`.
    pub fn all(timeout: Duration) -> Self {
        Self {
            expected: None,
            timeout,
        }
    }

    pub fn expecting(expected: usize, timeout: Duration) -> Self {
        Self {
            expected: Some(expected),
            timeout,
        }
    }
}

/// Receiving end of a subscription.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            subject: subject.into(),
            rx,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next delivered message, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// Asynchronous publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish. Succeeds even when nobody listens.
    async fn publish(&self, subject: &str, payload: Value) -> BusResult<()>;

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription>;

    /// Publish with a private reply subject and collect replies until
    /// `options.expected` arrived or `options.timeout` elapsed.
    async fn request(
        &self,
        subject: &str,
        payload: Value,
        options: RequestOptions,
    ) -> BusResult<Vec<Value>>;

    /// Reply to a received envelope.
    async fn respond(&self, envelope: &Envelope, payload: Value) -> BusResult<()> {
        let Some(reply_to) = envelope.reply_to.as_deref() else {
            return Err(BusError::NoReplySubject {
                subject: envelope.subject.clone(),
            });
        };
        self.publish(reply_to, payload).await
    }
}

type Senders = HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>;

/// Single-process bus: exact-subject fan-out over unbounded channels.
///
/// Every subscriber of a subject receives every message published to it.
/// Subscriptions whose receiver was dropped are pruned on the next publish.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    subscribers: Arc<RwLock<Senders>>,
    next_inbox: Arc<AtomicU64>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand an envelope to every subscriber of its subject.
    pub async fn deliver(&self, envelope: Envelope) {
        let mut subscribers = self.subscribers.write().await;
        let Some(senders) = subscribers.get_mut(&envelope.subject) else {
            trace!(subject = %envelope.subject, "no subscribers");
            return;
        };
        senders.retain(|tx| tx.send(envelope.clone()).is_ok());
        if senders.is_empty() {
            subscribers.remove(&envelope.subject);
        }
    }

    fn inbox(&self) -> String {
        let n = self.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("{INBOX_PREFIX}.{n}")
    }

    /// Drop every subscription on `subject`.
    pub(crate) async fn forget(&self, subject: &str) {
        self.subscribers.write().await.remove(subject);
    }

    /// Drop every subscription. Their receivers see the end of the stream.
    pub async fn close(&self) {
        self.subscribers.write().await.clear();
    }

    /// Number of live subscriptions on a subject.
    pub async fn subscriber_count(&self, subject: &str) -> usize {
        let subscribers = self.subscribers.read().await;
        subscribers
            .get(subject)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Value) -> BusResult<()> {
        self.deliver(Envelope {
            subject: subject.to_string(),
            payload,
            reply_to: None,
        })
        .await;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.write().await;
        subscribers.entry(subject.to_string()).or_default().push(tx);
        debug!(%subject, "subscribed");
        Ok(Subscription::new(subject, rx))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Value,
        options: RequestOptions,
    ) -> BusResult<Vec<Value>> {
        let inbox = self.inbox();
        let mut replies = self.subscribe(&inbox).await?;

        self.deliver(Envelope {
            subject: subject.to_string(),
            payload,
            reply_to: Some(inbox.clone()),
        })
        .await;

        let collected = collect_replies(&mut replies, subject, options).await;
        // Late replies are discarded.
        drop(replies);
        self.forget(&inbox).await;
        collected
    }
}

/// Gather replies from an inbox until enough arrived or the deadline passed.
pub(crate) async fn collect_replies(
    replies: &mut Subscription,
    subject: &str,
    options: RequestOptions,
) -> BusResult<Vec<Value>> {
    let mut collected = Vec::new();
    let wanted = options.expected.unwrap_or(usize::MAX);
    let deadline = tokio::time::Instant::now() + options.timeout;

    while collected.len() < wanted {
        match tokio::time::timeout_at(deadline, replies.next()).await {
            Ok(Some(envelope)) => collected.push(envelope.payload),
            Ok(None) => return Err(BusError::Closed),
            Err(_) => {
                debug!(
                    %subject,
                    received = collected.len(),
                    expected = ?options.expected,
                    "request timed out"
                );
                break;
            }
        }
    }
    Ok(collected)
}
