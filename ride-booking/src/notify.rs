use async_trait::async_trait;
use ride_core::{Notification, NotificationSink, NotifyError};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Hands notifications to a background worker so callers never wait on delivery.
///
/// `enqueue` only pushes onto a bounded channel. A full queue fails fast with
/// [`NotifyError::QueueFull`] rather than applying backpressure to the request path.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    /// Starts the delivery worker. It runs until every queue handle is dropped.
    pub fn spawn(sink: Arc<dyn NotificationSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));

        let handle = tokio::spawn(async move {
            info!("Notification worker started");

            while let Some(notification) = rx.recv().await {
                let kind = notification.kind.as_str();
                let user_id = notification.user_id;

                if let Err(e) = sink.enqueue(notification).await {
                    error!("Failed to deliver {} notification to {}: {}", kind, user_id, e);
                }
            }

            info!("Notification worker stopped");
        });

        (Self { tx }, handle)
    }
}

#[async_trait]
impl NotificationSink for NotificationQueue {
    async fn enqueue(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx.try_send(notification).map_err(|e| match e {
            TrySendError::Full(_) => NotifyError::QueueFull,
            TrySendError::Closed(_) => NotifyError::Closed,
        })
    }
}

/// Writes each notification to the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn enqueue(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            user_id = %notification.user_id,
            kind = notification.kind.as_str(),
            payload = %notification.payload,
            "Notification"
        );
        Ok(())
    }
}
