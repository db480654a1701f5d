// ============================================================================
// Consumer Lifecycle
// ============================================================================
//
// Owns the broker client and the receive loop task.
//
// States:  Stopped -> Starting -> Running -> Draining -> Stopped
//
// - start():     connect + start the broker client. No-op when running.
// - subscribe(): spawn the receive loop. Requires Running.
// - shutdown():  cancel, join the loop, graceful-stop the client.
//                No-op once stopped.
//
// All three serialize on one async mutex. The receive loop never takes it.
//
// ============================================================================

use super::handler::{MessageHandler, SharedHandler};
use super::hooks::{ConsumerHooks, ErrorHook, MaxRetriesHook};
use super::receive_loop::{LoopSettings, ReceiveLoop};
use crate::broker::{BrokerClient, BrokerConnector, Subscription};
use crate::filter::FilterExpression;
use mq_config::ConsumerOptions;
use mq_error::{MqError, MqResult};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerState::Starting,
            2 => ConsumerState::Running,
            3 => ConsumerState::Draining,
            _ => ConsumerState::Stopped,
        }
    }
}

#[derive(Default)]
struct Inner {
    client: Option<Arc<dyn BrokerClient>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    /// Set by the first successful start()
    initialized: bool,
}

/// A consumer bound to one topic and consumer group
pub struct MessageConsumer {
    options: ConsumerOptions,
    connector: Arc<dyn BrokerConnector>,
    hooks: ConsumerHooks,
    state: AtomicU8,
    inner: Mutex<Inner>,
}

impl MessageConsumer {
    pub fn new(options: ConsumerOptions, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            options,
            connector,
            hooks: ConsumerHooks::default(),
            state: AtomicU8::new(ConsumerState::Stopped as u8),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_hooks(mut self, hooks: ConsumerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_error_hook(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.hooks.error = Some(hook);
        self
    }

    pub fn with_max_retries_hook(mut self, hook: Arc<dyn MaxRetriesHook>) -> Self {
        self.hooks.max_retries = Some(hook);
        self
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn topic(&self) -> &str {
        &self.options.topic
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn subscription(&self) -> Subscription {
        Subscription {
            topic: self.options.topic.clone(),
            consumer_group: self.options.consumer_group.clone(),
            filter: FilterExpression::parse(&self.options.consumer_tag),
        }
    }

    /// Connect to the broker and start the client
    ///
    /// Connection failures are returned as `MqError::Connection` and are not
    /// retried here.
    pub async fn start(&self) -> MqResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.client.is_some() {
            debug!(topic = %self.options.topic, "Consumer already running");
            return Ok(());
        }

        self.options
            .validate()
            .map_err(|e| MqError::Config(e.to_string()))?;

        self.set_state(ConsumerState::Starting);
        let subscription = self.subscription();

        let client = match self.connector.connect(&subscription).await {
            Ok(client) => client,
            Err(e) => {
                self.set_state(ConsumerState::Stopped);
                error!(topic = %subscription.topic, error = %e, "Failed to create broker client");
                return Err(MqError::Connection(e));
            }
        };

        if let Err(e) = client.start().await {
            self.set_state(ConsumerState::Stopped);
            error!(topic = %subscription.topic, error = %e, "Failed to start broker client");
            return Err(MqError::Connection(e));
        }

        inner.client = Some(client);
        inner.initialized = true;
        self.set_state(ConsumerState::Running);

        info!(
            topic = %subscription.topic,
            group = %subscription.consumer_group,
            filter = %subscription.filter,
            "Consumer started"
        );
        Ok(())
    }

    /// Launch the receive loop with `handler`; returns immediately
    pub async fn subscribe<H>(&self, handler: H) -> MqResult<()>
    where
        H: MessageHandler + 'static,
    {
        self.subscribe_shared(Arc::new(handler)).await
    }

    pub async fn subscribe_shared(&self, handler: SharedHandler) -> MqResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(client) = inner.client.clone() else {
            return Err(if inner.initialized {
                MqError::NotRunning
            } else {
                MqError::NotInitialized
            });
        };

        if inner.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(MqError::AlreadySubscribed(self.options.topic.clone()));
        }

        let cancel = CancellationToken::new();
        let receive_loop = ReceiveLoop::new(
            client,
            handler,
            self.hooks.clone(),
            LoopSettings::from(&self.options),
            cancel.clone(),
        );

        inner.task = Some(tokio::spawn(receive_loop.run()));
        inner.cancel = Some(cancel);

        info!(topic = %self.options.topic, "Subscribed");
        Ok(())
    }

    /// Stop the receive loop and release the broker client
    ///
    /// Waits for the batch in progress to finish. With a shutdown timeout
    /// configured, a loop that does not exit in time is aborted.
    pub async fn shutdown(&self) -> MqResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(client) = inner.client.take() else {
            if !inner.initialized {
                return Err(MqError::NotInitialized);
            }
            debug!(topic = %self.options.topic, "Consumer already stopped");
            return Ok(());
        };

        self.set_state(ConsumerState::Draining);
        info!(topic = %self.options.topic, "Shutting down consumer");

        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = inner.task.take() {
            self.join_loop(task).await;
        }

        if let Err(e) = client.graceful_stop().await {
            error!(topic = %self.options.topic, error = %e, "Broker client graceful stop failed");
        }

        self.set_state(ConsumerState::Stopped);
        info!(topic = %self.options.topic, "Consumer stopped");
        Ok(())
    }

    async fn join_loop(&self, mut task: JoinHandle<()>) {
        let joined = match self.options.shutdown_timeout() {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        topic = %self.options.topic,
                        timeout_ms = limit.as_millis() as u64,
                        "Receive loop did not drain in time, aborting it"
                    );
                    task.abort();
                    // Wait for the cancellation so nothing still holds the client
                    let _ = task.await;
                    return;
                }
            },
            None => task.await,
        };

        if let Err(e) = joined {
            if e.is_panic() {
                error!(topic = %self.options.topic, "Receive loop panicked");
            }
        }
    }
}

impl Drop for MessageConsumer {
    fn drop(&mut self) {
        // Do not leave an orphaned loop polling the broker
        if let Some(cancel) = self.inner.get_mut().cancel.take() {
            cancel.cancel();
        }
    }
}
