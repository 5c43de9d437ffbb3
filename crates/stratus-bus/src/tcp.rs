//! TCP bus client: a [`Bus`] backed by a connection to a [`BusServer`].
//!
//! Incoming `message` frames are fanned out through a private
//! [`InMemoryBus`], so subscriptions behave exactly like in-process ones.
//! When the connection drops every subscription ends and further
//! publishes fail with [`BusError::Closed`].
//!
//! [`BusServer`]: crate::server::BusServer

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::bus::{Bus, Envelope, InMemoryBus, RequestOptions, Subscription, collect_replies};
use crate::error::{BusError, BusResult};
use crate::subjects::INBOX_PREFIX;
use crate::wire::{Frame, FrameReader, write_frame};

#[derive(Clone)]
pub struct TcpBus {
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
    local: InMemoryBus,
    /// Subjects the server already forwards to this connection.
    forwarded: Arc<Mutex<HashSet<String>>>,
    inbox_prefix: String,
    next_inbox: Arc<AtomicU64>,
}

impl TcpBus {
    pub async fn connect(addr: &str) -> BusResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let local_addr = stream.local_addr()?;
        let (read, mut write) = stream.into_split();
        info!(%addr, "connected to bus server");

        let closed = Arc::new(AtomicBool::new(false));
        let (outbound, mut queued) = mpsc::unbounded_channel::<Frame>();
        let write_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = queued.recv().await {
                if let Err(e) = write_frame(&mut write, &frame).await {
                    warn!(error = %e, "bus write failed, closing");
                    break;
                }
            }
            write_closed.store(true, Ordering::Release);
        });

        let local = InMemoryBus::new();
        let inbound = local.clone();
        let read_closed = closed.clone();
        tokio::spawn(async move {
            let mut frames = FrameReader::new(read);
            loop {
                match frames.next_frame().await {
                    Ok(Some(Frame::Message {
                        subject,
                        payload,
                        reply_to,
                    })) => {
                        inbound
                            .deliver(Envelope {
                                subject,
                                payload,
                                reply_to,
                            })
                            .await;
                    }
                    Ok(Some(other)) => debug!(frame = ?other, "unexpected frame from bus server"),
                    Ok(None) => {
                        warn!("bus server closed the connection");
                        break;
                    }
                    Err(BusError::Frame(e)) => warn!(error = %e, "dropping malformed frame"),
                    Err(e) => {
                        warn!(error = %e, "bus read failed");
                        break;
                    }
                }
            }
            read_closed.store(true, Ordering::Release);
            inbound.close().await;
        });

        Ok(Self {
            outbound,
            closed,
            local,
            forwarded: Arc::new(Mutex::new(HashSet::new())),
            inbox_prefix: format!("{INBOX_PREFIX}.{local_addr}.{}", std::process::id()),
            next_inbox: Arc::new(AtomicU64::new(0)),
        })
    }

    fn send(&self, frame: Frame) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        self.outbound.send(frame).map_err(|_| BusError::Closed)
    }

    fn inbox(&self) -> String {
        let n = self.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("{}.{n}", self.inbox_prefix)
    }
}

#[async_trait]
impl Bus for TcpBus {
    async fn publish(&self, subject: &str, payload: Value) -> BusResult<()> {
        self.send(Frame::Publish {
            subject: subject.to_string(),
            payload,
            reply_to: None,
        })
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        let subscription = self.local.subscribe(subject).await?;
        if self.forwarded.lock().await.insert(subject.to_string()) {
            self.send(Frame::Subscribe {
                subject: subject.to_string(),
            })?;
        }
        Ok(subscription)
    }

    async fn request(
        &self,
        subject: &str,
        payload: Value,
        options: RequestOptions,
    ) -> BusResult<Vec<Value>> {
        let inbox = self.inbox();
        let mut replies = self.local.subscribe(&inbox).await?;
        self.send(Frame::Subscribe {
            subject: inbox.clone(),
        })?;
        self.send(Frame::Publish {
            subject: subject.to_string(),
            payload,
            reply_to: Some(inbox.clone()),
        })?;

        let collected = collect_replies(&mut replies, subject, options).await;
        drop(replies);
        self.local.forget(&inbox).await;
        if let Err(e) = self.send(Frame::Unsubscribe { subject: inbox }) {
            debug!(error = %e, "inbox unsubscribe not sent");
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::watch;

    use crate::server::BusServer;

    struct Served {
        local: InMemoryBus,
        addr: String,
        shutdown: watch::Sender<bool>,
    }

    async fn serve() -> Served {
        let local = InMemoryBus::new();
        let server = BusServer::bind(local.clone(), "127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(server.serve(rx));
        Served {
            local,
            addr,
            shutdown,
        }
    }

    /// Wait until the server forwards `subject` to a peer.
    async fn wait_for_subscriber(bus: &InMemoryBus, subject: &str) {
        for _ in 0..400 {
            if bus.subscriber_count(subject).await > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("nobody subscribed to {subject}");
    }

    async fn next_payload(subscription: &mut Subscription) -> Value {
        tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed")
            .payload
    }

    #[tokio::test]
    async fn remote_publish_reaches_local_subscribers() {
        let served = serve().await;
        let mut heartbeats = served.local.subscribe("node.heartbeat").await.unwrap();
        let node = TcpBus::connect(&served.addr).await.unwrap();

        node.publish("node.heartbeat", json!({"node_id": "node-1"}))
            .await
            .unwrap();

        assert_eq!(next_payload(&mut heartbeats).await["node_id"], "node-1");
    }

    #[tokio::test]
    async fn local_publish_reaches_remote_subscribers() {
        let served = serve().await;
        let node = TcpBus::connect(&served.addr).await.unwrap();
        let mut starts = node.subscribe("node.start").await.unwrap();
        let mut again = node.subscribe("node.start").await.unwrap();
        wait_for_subscriber(&served.local, "node.start").await;

        served
            .local
            .publish("node.start", json!({"app_id": "app-1"}))
            .await
            .unwrap();

        assert_eq!(next_payload(&mut starts).await["app_id"], "app-1");
        assert_eq!(next_payload(&mut again).await["app_id"], "app-1");
        // One forwarder per subject, however many local subscriptions.
        assert_eq!(served.local.subscriber_count("node.start").await, 1);
    }

    #[tokio::test]
    async fn local_request_is_answered_by_remote_responder() {
        let served = serve().await;
        let stager = TcpBus::connect(&served.addr).await.unwrap();
        let mut stage = stager.subscribe("stager.stage").await.unwrap();
        wait_for_subscriber(&served.local, "stager.stage").await;
        tokio::spawn(async move {
            while let Some(envelope) = stage.next().await {
                let app_id = envelope.payload["app_id"].clone();
                stager
                    .respond(&envelope, json!({"status": "staged", "app_id": app_id}))
                    .await
                    .unwrap();
            }
        });

        let replies = served
            .local
            .request(
                "stager.stage",
                json!({"app_id": "app-1"}),
                RequestOptions::single(Duration::from_secs(2)),
            )
            .await
            .unwrap();

        assert_eq!(replies, vec![json!({"status": "staged", "app_id": "app-1"})]);
    }

    #[tokio::test]
    async fn remote_request_is_answered_locally_and_inbox_released() {
        let served = serve().await;
        let mut status = served.local.subscribe("hm.status").await.unwrap();
        let local = served.local.clone();
        tokio::spawn(async move {
            while let Some(envelope) = status.next().await {
                local.respond(&envelope, json!({"ok": true})).await.unwrap();
            }
        });
        let client = TcpBus::connect(&served.addr).await.unwrap();

        let replies = client
            .request(
                "hm.status",
                json!({}),
                RequestOptions::single(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(replies, vec![json!({"ok": true})]);

        let empty = client
            .request(
                "nobody.home",
                json!({}),
                RequestOptions::single(Duration::from_millis(30)),
            )
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_keeps_the_peer_connected() {
        let served = serve().await;
        let mut heartbeats = served.local.subscribe("node.heartbeat").await.unwrap();
        let mut raw = TcpStream::connect(&served.addr).await.unwrap();

        raw.write_all(b"{\"op\":\"publish\"\n").await.unwrap();
        raw.write_all(
            b"{\"op\":\"publish\",\"subject\":\"node.heartbeat\",\"payload\":{\"node_id\":\"node-2\"}}\n",
        )
        .await
        .unwrap();

        assert_eq!(next_payload(&mut heartbeats).await["node_id"], "node-2");
    }

    #[tokio::test]
    async fn server_shutdown_ends_remote_subscriptions() {
        let served = serve().await;
        let node = TcpBus::connect(&served.addr).await.unwrap();
        let mut starts = node.subscribe("node.start").await.unwrap();
        wait_for_subscriber(&served.local, "node.start").await;

        served.shutdown.send(true).unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(2), starts.next())
            .await
            .expect("subscription should end");
        assert!(ended.is_none());
        assert!(matches!(
            node.publish("node.heartbeat", json!({})).await,
            Err(BusError::Closed)
        ));
    }
}
