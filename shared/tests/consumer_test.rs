// ============================================================================
// Consumer Engine Integration Tests
// ============================================================================
//
// Lifecycle, receive loop and retry policy against the in-memory broker.
// No external services needed.
//
// ============================================================================


use async_trait::async_trait;
use mq_shared::{
    handler_fn, ConsumeContext, ConsumerState, ErrorHook, ErrorHookOutcome, FilterExpression,
    HandlerError, MaxRetriesHook, Message, MessageConsumer, MqError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::{test_options, view, wait_until, MockBroker, MockConnector};

const WAIT: Duration = Duration::from_secs(5);

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingMaxRetriesHook {
    calls: AtomicUsize,
    timeouts: AtomicUsize,
    attempts: Mutex<Vec<u32>>,
}

#[async_trait]
impl MaxRetriesHook for CountingMaxRetriesHook {
    async fn on_max_retries(
        &self,
        ctx: &ConsumeContext,
        _message: &Message,
        error: &HandlerError,
    ) -> anyhow::Result<()> {
        assert!(ctx.deadline().is_none(), "hooks run without a deadline");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if error.is_timeout() {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
        self.attempts.lock().unwrap().push(ctx.delivery_attempt());
        Ok(())
    }
}

struct FixedErrorHook {
    auto_ack: bool,
    fail: bool,
    calls: AtomicUsize,
}

impl FixedErrorHook {
    fn new(auto_ack: bool, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_ack,
            fail,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ErrorHook for FixedErrorHook {
    async fn on_error(
        &self,
        _ctx: &ConsumeContext,
        _message: &Message,
        _error: &HandlerError,
    ) -> ErrorHookOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = if self.auto_ack {
            ErrorHookOutcome::ack()
        } else {
            ErrorHookOutcome::retry()
        };
        if self.fail {
            outcome.with_error(anyhow::anyhow!("hook storage down"))
        } else {
            outcome
        }
    }
}

fn counting_ok_handler(
    calls: Arc<AtomicUsize>,
) -> impl mq_shared::MessageHandler + 'static {
    handler_fn(move |_ctx, _message| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn always_failing_handler(calls: Arc<AtomicUsize>) -> impl mq_shared::MessageHandler + 'static {
    handler_fn(move |_ctx, message: Message| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::business(format!(
                "cannot process {}",
                message.message_id()
            )))
        }
    })
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_subscribe_before_start_is_not_initialized() {
    let broker = MockBroker::new();
    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker));

    let err = consumer
        .subscribe(counting_ok_handler(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::NotInitialized));

    let err = consumer.shutdown().await.unwrap_err();
    assert!(matches!(err, MqError::NotInitialized));
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_subscribe_after_shutdown_is_not_running() {
    let broker = MockBroker::new();
    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker));

    consumer.start().await.unwrap();
    consumer.shutdown().await.unwrap();

    let err = consumer
        .subscribe(counting_ok_handler(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::NotRunning));
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let broker = MockBroker::new();
    let connector = MockConnector::new(broker.clone());
    let consumer = MessageConsumer::new(test_options("orders"), connector.clone());

    consumer.start().await.unwrap();
    consumer.start().await.unwrap();

    assert_eq!(connector.connects(), 1);
    assert_eq!(broker.starts(), 1);
    assert_eq!(consumer.state(), ConsumerState::Running);
    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_connection_error() {
    let broker = MockBroker::new();
    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::failing(broker));

    let err = consumer.start().await.unwrap_err();
    assert!(matches!(err, MqError::Connection(_)));
    assert_eq!(consumer.state(), ConsumerState::Stopped);

    let err = consumer
        .subscribe(counting_ok_handler(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::NotInitialized));
}

#[tokio::test]
async fn test_broker_start_failure_is_connection_error() {
    let broker = MockBroker::new();
    broker.fail_start();
    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker));

    let err = consumer.start().await.unwrap_err();
    assert!(matches!(err, MqError::Connection(_)));
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let broker = MockBroker::new();
    let consumer = MessageConsumer::new(test_options(""), MockConnector::new(broker));

    let err = consumer.start().await.unwrap_err();
    assert!(matches!(err, MqError::Config(_)));
}

#[tokio::test]
async fn test_second_subscription_rejected() {
    let broker = MockBroker::new();
    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker));
    consumer.start().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    consumer
        .subscribe(counting_ok_handler(calls.clone()))
        .await
        .unwrap();
    let err = consumer
        .subscribe(counting_ok_handler(calls))
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::AlreadySubscribed(ref topic) if topic == "orders"));

    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_subscription_carries_tag_filter() {
    let broker = MockBroker::new();
    let connector = MockConnector::new(broker);
    let mut options = test_options("upload-callback");
    options.consumer_tag = "pdf || docx".to_string();

    let consumer = MessageConsumer::new(options, connector.clone());
    consumer.start().await.unwrap();

    let subscription = connector.subscription().expect("connected");
    assert_eq!(subscription.topic, "upload-callback");
    assert_eq!(subscription.consumer_group, "test-group");
    assert_eq!(
        subscription.filter,
        FilterExpression::Tags(vec!["pdf".to_string(), "docx".to_string()])
    );
    consumer.shutdown().await.unwrap();
}

// ============================================================================
// Receive loop
// ============================================================================

#[tokio::test]
async fn test_ack_suppresses_redelivery() {
    let broker = MockBroker::new();
    broker.push(view("orders", "m-1"));
    broker.push(view("orders", "m-2"));

    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker.clone()));
    let calls = Arc::new(AtomicUsize::new(0));
    consumer.start().await.unwrap();
    consumer
        .subscribe(counting_ok_handler(calls.clone()))
        .await
        .unwrap();

    wait_until(WAIT, || broker.acked().len() == 2).await;
    let after_ack = broker.receive_calls();
    wait_until(WAIT, || broker.receive_calls() >= after_ack + 3).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(broker.deliveries_of("m-1"), vec![1]);
    assert_eq!(broker.deliveries_of("m-2"), vec![1]);
    assert_eq!(broker.acked(), vec!["m-1".to_string(), "m-2".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_bound_drops_and_calls_hook_once() {
    let broker = MockBroker::new();
    broker.push(view("orders", "poison"));

    let mut options = test_options("orders");
    options.max_reconsume_times = 3;
    let hook = Arc::new(CountingMaxRetriesHook::default());
    let consumer = MessageConsumer::new(options, MockConnector::new(broker.clone()))
        .with_max_retries_hook(hook.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    consumer.start().await.unwrap();
    consumer
        .subscribe(always_failing_handler(calls.clone()))
        .await
        .unwrap();

    wait_until(WAIT, || !broker.acked().is_empty()).await;
    let after_ack = broker.receive_calls();
    wait_until(WAIT, || broker.receive_calls() >= after_ack + 3).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(broker.deliveries_of("poison"), vec![1, 2, 3]);
    assert_eq!(broker.acked(), vec!["poison".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*hook.attempts.lock().unwrap(), vec![3]);
}

#[tokio::test]
async fn test_unlimited_retries_never_drop() {
    let broker = MockBroker::new();
    broker.push(view("orders", "poison"));

    let mut options = test_options("orders");
    options.max_reconsume_times = 0;
    let hook = Arc::new(CountingMaxRetriesHook::default());
    let consumer = MessageConsumer::new(options, MockConnector::new(broker.clone()))
        .with_max_retries_hook(hook.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    consumer.start().await.unwrap();
    consumer
        .subscribe(always_failing_handler(calls.clone()))
        .await
        .unwrap();

    wait_until(WAIT, || broker.deliveries_of("poison").len() >= 20).await;
    consumer.shutdown().await.unwrap();

    let attempts = broker.deliveries_of("poison");
    assert_eq!(attempts[..5].to_vec(), vec![1, 2, 3, 4, 5]);
    assert!(broker.acked().is_empty());
    assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_error_hook_auto_ack_overrides_retries() {
    let broker = MockBroker::new();
    broker.push(view("orders", "m-1"));

    let mut options = test_options("orders");
    options.max_reconsume_times = 5;
    let error_hook = FixedErrorHook::new(true, false);
    let max_hook = Arc::new(CountingMaxRetriesHook::default());
    let consumer = MessageConsumer::new(options, MockConnector::new(broker.clone()))
        .with_error_hook(error_hook.clone())
        .with_max_retries_hook(max_hook.clone());

    consumer.start().await.unwrap();
    consumer
        .subscribe(always_failing_handler(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();

    wait_until(WAIT, || !broker.acked().is_empty()).await;
    let after_ack = broker.receive_calls();
    wait_until(WAIT, || broker.receive_calls() >= after_ack + 2).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(broker.deliveries_of("m-1"), vec![1]);
    assert_eq!(broker.acked(), vec!["m-1".to_string()]);
    assert_eq!(error_hook.calls.load(Ordering::SeqCst), 1);
    assert_eq!(max_hook.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_auto_ack_on_last_attempt_acks_once() {
    let broker = MockBroker::new();
    broker.push(view("orders", "m-1"));

    let mut options = test_options("orders");
    options.max_reconsume_times = 1;
    let max_hook = Arc::new(CountingMaxRetriesHook::default());
    let consumer = MessageConsumer::new(options, MockConnector::new(broker.clone()))
        .with_error_hook(FixedErrorHook::new(true, false))
        .with_max_retries_hook(max_hook.clone());

    consumer.start().await.unwrap();
    consumer
        .subscribe(always_failing_handler(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();

    wait_until(WAIT, || max_hook.calls.load(Ordering::SeqCst) == 1).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(broker.acked(), vec!["m-1".to_string()]);
}

#[tokio::test]
async fn test_error_hook_failure_is_not_fatal() {
    let broker = MockBroker::new();
    broker.push(view("orders", "m-1"));

    let error_hook = FixedErrorHook::new(false, true);
    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker.clone()))
        .with_error_hook(error_hook.clone());

    // Fails on the first delivery, succeeds on the redelivery
    let handler = handler_fn(|ctx: ConsumeContext, _message| async move {
        if ctx.delivery_attempt() == 1 {
            Err(HandlerError::business("transient"))
        } else {
            Ok(())
        }
    });

    consumer.start().await.unwrap();
    consumer.subscribe(handler).await.unwrap();

    wait_until(WAIT, || !broker.acked().is_empty()).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(broker.deliveries_of("m-1"), vec![1, 2]);
    assert_eq!(error_hook.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_manual_ack_leaves_ack_to_handler() {
    let broker = MockBroker::new();
    broker.push(view("orders", "m-1"));

    let mut options = test_options("orders");
    options.manual_ack = true;
    let consumer = MessageConsumer::new(options, MockConnector::new(broker.clone()));
    let calls = Arc::new(AtomicUsize::new(0));

    consumer.start().await.unwrap();
    consumer
        .subscribe(counting_ok_handler(calls.clone()))
        .await
        .unwrap();

    wait_until(WAIT, || calls.load(Ordering::SeqCst) >= 1).await;
    consumer.shutdown().await.unwrap();

    assert!(broker.acked().is_empty());
}

#[tokio::test]
async fn test_ack_failure_is_not_fatal() {
    let broker = MockBroker::new();
    broker.fail_acks();
    broker.push(view("orders", "m-1"));

    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker.clone()));
    let calls = Arc::new(AtomicUsize::new(0));
    consumer.start().await.unwrap();
    consumer
        .subscribe(counting_ok_handler(calls.clone()))
        .await
        .unwrap();

    // Ack never lands, so the broker keeps redelivering and the loop keeps going
    wait_until(WAIT, || calls.load(Ordering::SeqCst) >= 3).await;
    consumer.shutdown().await.unwrap();

    assert!(broker.acked().is_empty());
}

#[tokio::test]
async fn test_handler_panic_does_not_stop_loop() {
    let broker = MockBroker::new();
    broker.push(view("orders", "m-1"));

    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker.clone()));
    let handler = handler_fn(|ctx: ConsumeContext, _message| async move {
        if ctx.delivery_attempt() == 1 {
            panic!("handler bug");
        }
        Ok(())
    });

    consumer.start().await.unwrap();
    consumer.subscribe(handler).await.unwrap();

    wait_until(WAIT, || !broker.acked().is_empty()).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(broker.deliveries_of("m-1"), vec![1, 2]);
}

#[tokio::test]
async fn test_batch_processed_in_order() {
    let broker = MockBroker::new();
    for i in 0..5 {
        broker.push(view("orders", &format!("m-{}", i)));
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let handler = handler_fn(move |_ctx, message: Message| {
        let recorder = recorder.clone();
        async move {
            recorder.lock().unwrap().push(message.message_id().to_string());
            Ok(())
        }
    });

    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker.clone()));
    consumer.start().await.unwrap();
    consumer.subscribe(handler).await.unwrap();

    wait_until(WAIT, || broker.acked().len() == 5).await;
    consumer.shutdown().await.unwrap();

    let expected: Vec<String> = (0..5).map(|i| format!("m-{}", i)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

// ============================================================================
// Backoff & timeouts (virtual time)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_empty_batch_backoff() {
    let broker = MockBroker::new();
    let mut options = test_options("orders");
    options.max_await_time_ms = 1_000;

    let consumer = MessageConsumer::new(options, MockConnector::new(broker.clone()));
    let calls = Arc::new(AtomicUsize::new(0));
    consumer.start().await.unwrap();
    consumer
        .subscribe(counting_ok_handler(calls.clone()))
        .await
        .unwrap();

    // Receives at t = 0, 1s, 2s, 3s; each empty batch sleeps max_await_time
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(broker.receive_calls(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_receive_errors_back_off_and_recover() {
    let broker = MockBroker::new();
    broker.fail_next_receives(2);
    broker.push(view("orders", "m-1"));

    let mut options = test_options("orders");
    options.max_await_time_ms = 1_000;
    let consumer = MessageConsumer::new(options, MockConnector::new(broker.clone()));
    let calls = Arc::new(AtomicUsize::new(0));

    let started = tokio::time::Instant::now();
    consumer.start().await.unwrap();
    consumer
        .subscribe(counting_ok_handler(calls.clone()))
        .await
        .unwrap();

    wait_until(WAIT, || !broker.acked().is_empty()).await;
    assert!(started.elapsed() >= Duration::from_millis(2_000));
    assert!(broker.receive_calls() >= 3);
    consumer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout_counts_as_failure() {
    let broker = MockBroker::new();
    broker.push(view("orders", "slow"));

    let mut options = test_options("orders");
    options.consume_timeout_ms = 200;
    options.max_reconsume_times = 1;
    let hook = Arc::new(CountingMaxRetriesHook::default());
    let consumer = MessageConsumer::new(options, MockConnector::new(broker.clone()))
        .with_max_retries_hook(hook.clone());

    let handler = handler_fn(|ctx: ConsumeContext, _message| async move {
        ctx.done().await;
        ctx.check()
    });

    consumer.start().await.unwrap();
    consumer.subscribe(handler).await.unwrap();

    wait_until(WAIT, || !broker.acked().is_empty()).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    assert_eq!(hook.timeouts.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_graceful_shutdown_waits_for_batch() {
    let broker = MockBroker::new();
    for i in 0..3 {
        broker.push(view("orders", &format!("m-{}", i)));
    }

    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (s, f) = (started.clone(), finished.clone());
    let handler = handler_fn(move |_ctx, _message| {
        let (s, f) = (s.clone(), f.clone());
        async move {
            s.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let consumer = MessageConsumer::new(test_options("orders"), MockConnector::new(broker.clone()));
    consumer.start().await.unwrap();
    consumer.subscribe(handler).await.unwrap();

    wait_until(WAIT, || started.load(Ordering::SeqCst) >= 1).await;
    consumer.shutdown().await.unwrap();

    // The whole batch finished before shutdown returned
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert_eq!(broker.acked().len(), 3);
    assert_eq!(broker.graceful_stops(), 1);
    assert_eq!(consumer.state(), ConsumerState::Stopped);

    let receives = broker.receive_calls();
    consumer.shutdown().await.unwrap();
    assert_eq!(broker.graceful_stops(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.receive_calls(), receives);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_aborts_stuck_loop() {
    let broker = MockBroker::new();
    broker.push(view("orders", "stuck"));

    let mut options = test_options("orders");
    options.shutdown_timeout_ms = Some(500);
    let consumer = MessageConsumer::new(options, MockConnector::new(broker.clone()));

    let entered = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));
    let flag = entered.clone();
    let drops = dropped.clone();
    // Ignores its deadline entirely
    let handler = handler_fn(move |_ctx, _message| {
        let flag = flag.clone();
        let guard = DropCounter(drops.clone());
        async move {
            let _guard = guard;
            flag.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }
    });

    consumer.start().await.unwrap();
    consumer.subscribe(handler).await.unwrap();
    wait_until(WAIT, || entered.load(Ordering::SeqCst) == 1).await;

    let before = tokio::time::Instant::now();
    consumer.shutdown().await.unwrap();

    assert!(before.elapsed() >= Duration::from_millis(500));
    // The aborted loop is gone before the client is stopped
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert_eq!(broker.graceful_stops(), 1);
    assert!(broker.acked().is_empty());
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_restart_after_shutdown() {
    let broker = MockBroker::new();
    let connector = MockConnector::new(broker.clone());
    let consumer = MessageConsumer::new(test_options("orders"), connector.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    consumer.start().await.unwrap();
    consumer
        .subscribe(counting_ok_handler(calls.clone()))
        .await
        .unwrap();
    consumer.shutdown().await.unwrap();

    broker.push(view("orders", "m-1"));
    consumer.start().await.unwrap();
    consumer
        .subscribe(counting_ok_handler(calls.clone()))
        .await
        .unwrap();

    wait_until(WAIT, || !broker.acked().is_empty()).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(connector.connects(), 2);
    assert_eq!(broker.graceful_stops(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
