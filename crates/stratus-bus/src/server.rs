//! TCP bus server: exposes an [`InMemoryBus`] to remote peers.
//!
//! Compute nodes, stagers and the health-signal subsystem connect over TCP
//! and speak the line-delimited frames from [`crate::wire`]. Each peer gets
//! one forwarding task per subscribed subject; a peer's published frames are
//! delivered onto the local bus as if they were published in-process, reply
//! subjects included, so requests work in both directions.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Envelope, InMemoryBus, Subscription};
use crate::error::{BusError, BusResult};
use crate::wire::{Frame, FrameReader, write_frame};

pub struct BusServer {
    bus: InMemoryBus,
    listener: TcpListener,
}

impl BusServer {
    /// Bind the listener. Serving starts with [`BusServer::serve`].
    pub async fn bind(bus: InMemoryBus, addr: &str) -> BusResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { bus, listener })
    }

    pub fn local_addr(&self) -> BusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept peers until shutdown. Each peer is served on its own task.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, "bus server listening"),
            Err(e) => warn!(error = %e, "bus server address unknown"),
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "bus peer connected");
                            tokio::spawn(serve_peer(self.bus.clone(), stream, peer, shutdown.clone()));
                        }
                        Err(e) => warn!(error = %e, "bus accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("bus server shutting down");
                    break;
                }
            }
        }
    }
}

async fn serve_peer(
    bus: InMemoryBus,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read, mut write) = stream.into_split();
    let (outbound, mut queued) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = queued.recv().await {
            if let Err(e) = write_frame(&mut write, &frame).await {
                debug!(%peer, error = %e, "bus peer write failed");
                break;
            }
        }
    });

    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut frames = FrameReader::new(read);
    loop {
        let frame = tokio::select! {
            frame = frames.next_frame() => frame,
            _ = shutdown.changed() => break,
        };
        match frame {
            Ok(Some(Frame::Subscribe { subject })) => {
                if forwarders.contains_key(&subject) {
                    continue;
                }
                match bus.subscribe(&subject).await {
                    Ok(subscription) => {
                        let forwarder = tokio::spawn(forward(subscription, outbound.clone()));
                        forwarders.insert(subject, forwarder);
                    }
                    Err(e) => warn!(%peer, %subject, error = %e, "bus peer subscribe failed"),
                }
            }
            Ok(Some(Frame::Unsubscribe { subject })) => {
                if let Some(forwarder) = forwarders.remove(&subject) {
                    forwarder.abort();
                }
            }
            Ok(Some(Frame::Publish {
                subject,
                payload,
                reply_to,
            })) => {
                bus.deliver(Envelope {
                    subject,
                    payload,
                    reply_to,
                })
                .await;
            }
            Ok(Some(Frame::Message { subject, .. })) => {
                warn!(%peer, %subject, "peer sent a message frame, ignoring");
            }
            Ok(None) => {
                debug!(%peer, "bus peer disconnected");
                break;
            }
            Err(BusError::Frame(e)) => {
                warn!(%peer, error = %e, "dropping malformed frame");
            }
            Err(e) => {
                debug!(%peer, error = %e, "bus peer read failed");
                break;
            }
        }
    }

    for forwarder in forwarders.into_values() {
        forwarder.abort();
    }
    writer.abort();
}

async fn forward(mut subscription: Subscription, outbound: mpsc::UnboundedSender<Frame>) {
    while let Some(envelope) = subscription.next().await {
        if outbound.send(Frame::message(envelope)).is_err() {
            break;
        }
    }
}
