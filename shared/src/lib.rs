// ============================================================================
// MQ Shared - Reliable message consumption engine
// ============================================================================
//
// Pulls batches from a broker, hands each message to a handler with a
// deadline, retries failures a bounded number of times, optionally
// serializes processing with a distributed lock, and shuts down without
// losing ack state.
//
// Modules:
// - message:  broker-agnostic message model
// - filter:   subscription tag filter
// - broker:   broker seam + Redis Streams adapter
// - consumer: lifecycle, receive loop, retry policy, hooks
// - distlock: lock providers (Redis, in-memory)
// - helper:   lock wrapper and consumer start helpers
// - dlq:      dead-letter max-retries hook
// - metrics:  Prometheus counters
//
// ============================================================================

pub mod broker;
pub mod consumer;
pub mod distlock;
pub mod dlq;
pub mod filter;
pub mod helper;
pub mod message;
pub mod metrics;

pub use broker::{
    BrokerClient, BrokerConnector, MessageView, RedisStreamsBroker, RedisStreamsConnector,
    Subscription,
};
pub use consumer::{
    handler_fn, ConsumeContext, ConsumerHooks, ConsumerState, ErrorHook, ErrorHookOutcome,
    MaxRetriesHook, MessageConsumer, MessageHandler, SharedHandler,
};
pub use distlock::{LockHandle, Locker, MemoryLocker, RedisLocker};
pub use filter::FilterExpression;
pub use helper::{HandlerLockOptions, LockScope, LockedHandler, MessageHandlerHelper};
pub use message::{Message, OutboundMessage};

pub use mq_config::ConsumerOptions;
pub use mq_error::{HandlerError, MqError, MqResult};
