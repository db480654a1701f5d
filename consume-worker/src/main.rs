// ============================================================================
// Consume Worker
// ============================================================================
//
// Reference process around the consumer engine.
//
// Flow:
// 1. Load configuration from the environment (.env honoured)
// 2. Connect the Redis Streams broker adapter
// 3. Optionally install the DLQ hook (MQ_DLQ_ENABLED)
// 4. Start the consumer, with a distributed lock when LOCK_ENABLED=true
// 5. Log every message it receives
// 6. SIGTERM / Ctrl-C -> shutdown (drains the current batch)
//
// ============================================================================

use anyhow::{Context, Result};
use mq_config::Config;
use mq_redis::RedisClient;
use mq_shared::dlq::DeadLetterPublisher;
use mq_shared::metrics::gather_metrics;
use mq_shared::{
    handler_fn, ConsumeContext, HandlerError, HandlerLockOptions, Message, MessageConsumer,
    MessageHandlerHelper, RedisLocker, RedisStreamsConnector,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Consume Worker Starting ===");
    info!("Topic: {}", config.consumer.topic);
    info!("Consumer Group: {}", config.consumer.consumer_group);
    info!("Tag Filter: {}", config.consumer.consumer_tag);
    info!("Consumer Name: {}", config.streams.consumer_name);
    info!("Connecting to Redis at: {}", config.redis_url_safe());

    let redis = RedisClient::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis");

    let connector = Arc::new(RedisStreamsConnector::new(
        config.redis_url.clone(),
        config.streams.clone(),
    ));
    let mut consumer = MessageConsumer::new(config.consumer.clone(), connector);

    if config.streams.dlq_enabled {
        consumer = consumer.with_max_retries_hook(Arc::new(DeadLetterPublisher::new(
            redis.clone(),
            &config.streams,
        )));
        info!("Dead-letter queue enabled");
    }

    let handler = handler_fn(log_message);

    if config.lock.enabled {
        let locker = Arc::new(RedisLocker::from_config(redis.clone(), &config.lock));
        let helper = MessageHandlerHelper::new(locker).with_trace_spans(true);
        helper
            .start_consumer_with_lock(&consumer, HandlerLockOptions::from_config(&config.lock), handler)
            .await
            .context("Failed to start consumer")?;
        info!(lock_key = %config.lock.lock_key, "Consumer started with distributed lock");
    } else {
        consumer
            .start()
            .await
            .context("Failed to start consumer")?;
        consumer
            .subscribe(handler)
            .await
            .context("Failed to subscribe")?;
        info!("Consumer started");
    }

    wait_for_shutdown_signal().await;

    consumer
        .shutdown()
        .await
        .context("Failed to shut down consumer")?;

    match gather_metrics() {
        Ok(metrics) => debug!("Final metrics:\n{}", metrics),
        Err(e) => warn!(error = %e, "Failed to gather metrics"),
    }

    info!("=== Consume Worker Stopped ===");
    Ok(())
}

async fn log_message(ctx: ConsumeContext, message: Message) -> Result<(), HandlerError> {
    ctx.check()?;
    info!(
        topic = %message.topic(),
        message_id = %message.message_id(),
        tags = %message.tags(),
        keys = %message.keys(),
        business_key = %message.business_key(),
        delivery_attempt = ctx.delivery_attempt(),
        body_len = message.body().len(),
        "Message received"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("SIGINT received, initiating graceful shutdown...");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler, waiting for Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
                info!("Ctrl-C received, initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, initiating graceful shutdown...");
    }
}
