//! Subscriber loops with per-message failure isolation.
//!
//! Each delivered envelope is handled on its own task and awaited before
//! the next one is taken, so messages on one subject are processed in
//! order while a panic in the handler only loses that one message.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::bus::{Envelope, Subscription};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked for every envelope delivered on a subscription.
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn boxed_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |envelope| -> BoxFuture { Box::pin(f(envelope)) })
}

/// Run `handler` for every message on `subscription` until shutdown.
pub fn spawn_handler(
    mut subscription: Subscription,
    handler: Handler,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let subject = subscription.subject().to_string();
        debug!(%subject, "handler loop starting");

        loop {
            tokio::select! {
                next = subscription.next() => {
                    let Some(envelope) = next else {
                        debug!(%subject, "subscription closed");
                        break;
                    };
                    if let Err(e) = tokio::spawn(handler(envelope)).await {
                        error!(%subject, error = %e, "message handler failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(%subject, "handler loop shutting down");
                    break;
                }
            }
        }
    })
}
