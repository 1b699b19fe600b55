//! user-notifier: change-notification side-car.
//!
//! Listens for committed mutations on the `users` table via the storage
//! notification channel and republishes each one to the Kafka topic, with
//! trace-propagation headers attached.
//!
//! ## Configuration
//!
//! - `NOTIFIER_CONFIG`: path to the TOML config (default: `config/notifier.toml`)
//! - `RUST_LOG`: logging level (default: "info")
//!
//! Connect or listen failures at startup exit the process with a failure
//! status; per-event publish failures are logged and absorbed so the
//! pipeline stays live.

use std::sync::Arc;

use tracing::{error, info};

use userv_notifier::config::NotifierConfig;
use userv_notifier::listener::ChangeListener;
use userv_notifier::notifier::Notifier;
use userv_notifier::publisher::{KafkaPublisher, Publisher};
use userv_notifier::shutdown::Shutdown;
use userv_notifier::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = NotifierConfig::load()?;

    // Keep the guard alive so spans flush on exit
    let _telemetry = telemetry::init(&config.telemetry)?;

    info!(
        channel = %config.notifier.channel,
        topic = %config.kafka.topic,
        brokers = ?config.kafka.brokers,
        "user-notifier starting"
    );

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait_for_signal().await });

    let listener = ChangeListener::connect(
        &config.storage,
        config.notifier.min_reconnect_interval(),
        config.notifier.max_reconnect_interval(),
    )
    .await?;

    let publisher: Arc<dyn Publisher> = Arc::new(KafkaPublisher::new(&config.kafka)?);

    let mut notifier = Notifier::new(listener, publisher, &config, shutdown);

    if let Err(e) = notifier.run().await {
        error!(error = %e, "notifier stopped with error");
        return Err(e.into());
    }

    info!("notifier shutdown complete");
    Ok(())
}
