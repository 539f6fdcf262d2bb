// src/notify.rs

//! Outbound notification seam.
//!
//! Delivery is best effort everywhere: a failed send is logged and never
//! blocks or fails the marathon.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{info, warn};

/// Send a human-readable message to a named channel.
pub trait Notifier: Send + Sync {
    /// Resolves to `true` when the message was delivered.
    fn send<'a>(
        &'a self,
        channel: &'a str,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Writes notifications to the tracing log. Default when no other channel
/// integration is configured.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send<'a>(
        &'a self,
        channel: &'a str,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            info!(target: "marathon::notify", channel, "{message}");
            true
        })
    }
}

/// Send and wait, logging failures.
pub async fn notify_best_effort(notifier: &dyn Notifier, channel: &str, message: &str) {
    if !notifier.send(channel, message).await {
        warn!(channel, "notification delivery failed");
    }
}

/// Fire-and-forget delivery to every channel; never awaited by the caller.
pub fn spawn_alerts(notifier: Arc<dyn Notifier>, channels: &[String], message: String) {
    for channel in channels {
        let notifier = notifier.clone();
        let channel = channel.clone();
        let message = message.clone();
        tokio::spawn(async move {
            notify_best_effort(notifier.as_ref(), &channel, &message).await;
        });
    }
}
