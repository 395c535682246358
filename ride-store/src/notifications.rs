use async_trait::async_trait;
use ride_core::{Notification, NotificationSink, NotifyError};
use sqlx::PgPool;
use uuid::Uuid;

/// Persists notifications for the in-app inbox. Uses its own pooled connection, never
/// the transaction that produced the decision.
pub struct PgNotificationSink {
    pool: PgPool,
}

impl PgNotificationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgNotificationSink {
    async fn enqueue(&self, notification: Notification) -> Result<(), NotifyError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, type, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification.user_id)
        .bind(notification.kind.as_str())
        .bind(&notification.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        Ok(())
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaNotificationSink;

#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use rdkafka::config::ClientConfig;
    use rdkafka::error::KafkaError;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::util::Timeout;
    use std::time::Duration;
    use tracing::{debug, error};

    /// Publishes each notification as JSON to one topic, keyed by recipient so a
    /// user's notifications stay ordered within a partition.
    #[derive(Clone)]
    pub struct KafkaNotificationSink {
        producer: FutureProducer,
        topic: String,
    }

    impl KafkaNotificationSink {
        pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, KafkaError> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("message.timeout.ms", "5000")
                .set("enable.idempotence", "true")
                .create()?;

            Ok(Self {
                producer,
                topic: topic.into(),
            })
        }

        fn key(notification: &Notification) -> String {
            notification.user_id.to_string()
        }
    }

    #[async_trait]
    impl NotificationSink for KafkaNotificationSink {
        async fn enqueue(&self, notification: Notification) -> Result<(), NotifyError> {
            let key = Self::key(&notification);
            let body = serde_json::to_string(&notification)
                .map_err(|e| NotifyError::Delivery(e.to_string()))?;

            let record = FutureRecord::to(&self.topic).key(&key).payload(&body);

            // Zero queue timeout: a full local producer queue is reported, not waited on.
            match self.producer.send(record, Timeout::After(Duration::ZERO)).await {
                Ok(delivery) => {
                    debug!(
                        "{} notification for {} on partition {} offset {}",
                        notification.kind.as_str(),
                        key,
                        delivery.partition,
                        delivery.offset
                    );
                    Ok(())
                }
                Err((e, _msg)) => {
                    error!("Failed to publish notification to {}: {}", self.topic, e);
                    Err(NotifyError::Delivery(e.to_string()))
                }
            }
        }
    }
}
