use anyhow::Context;
use ride_api::{app, state::{AppState, AuthConfig}};
use ride_booking::{AcceptanceCoordinator, LogNotificationSink, NotificationQueue, RetryPolicy};
use ride_core::NotificationSink;
use ride_store::app_config::{Config, NotificationConfig, SinkKind};
use ride_store::{DbClient, PgBookingLedger, PgNotificationSink};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ride_api=debug,ride_booking=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting ride API on port {}", config.server.port);
    tracing::debug!("Config: {:?}", config);

    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.ping().await.context("Postgres is not answering")?;
    db.migrate().await.context("Failed to run migrations")?;

    let ledger = PgBookingLedger::new(db.pool.clone()).with_timeouts(
        Duration::from_millis(config.booking.lock_timeout_ms),
        Duration::from_millis(config.booking.statement_timeout_ms),
    );

    let sink = notification_sink(&config.notifications, &db)?;
    let (queue, _worker) = NotificationQueue::spawn(sink, config.notifications.queue_capacity);

    let retry = RetryPolicy::new(
        config.booking.max_attempts,
        Duration::from_millis(config.booking.retry_base_delay_ms),
        Duration::from_millis(config.booking.retry_max_delay_ms),
    );
    let coordinator =
        AcceptanceCoordinator::new(Arc::new(ledger), Arc::new(queue)).with_retry_policy(retry);

    let app_state = AppState {
        bookings: Arc::new(coordinator),
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn notification_sink(
    config: &NotificationConfig,
    db: &DbClient,
) -> anyhow::Result<Arc<dyn NotificationSink>> {
    let sink: Arc<dyn NotificationSink> = match config.sink {
        SinkKind::Log => Arc::new(LogNotificationSink),
        SinkKind::Postgres => Arc::new(PgNotificationSink::new(db.pool.clone())),
        #[cfg(feature = "kafka")]
        SinkKind::Kafka => {
            let brokers = config
                .kafka_brokers
                .as_deref()
                .context("notifications.kafka_brokers is required for the kafka sink")?;
            let sink = ride_store::KafkaNotificationSink::new(brokers, config.kafka_topic.clone())
                .context("Failed to create Kafka producer")?;
            Arc::new(sink)
        }
        #[cfg(not(feature = "kafka"))]
        SinkKind::Kafka => {
            anyhow::bail!("notifications.sink = \"kafka\" needs the `kafka` feature")
        }
    };

    tracing::info!("Notification sink: {:?}", config.sink);
    Ok(sink)
}
