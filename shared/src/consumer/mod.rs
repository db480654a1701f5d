//! Consumer engine: lifecycle, receive loop, retry policy and hooks

mod context;
mod handler;
mod hooks;
mod lifecycle;
mod receive_loop;
mod retry;

pub use context::ConsumeContext;
pub use handler::{handler_fn, FnHandler, MessageHandler, SharedHandler};
pub use hooks::{ConsumerHooks, ErrorHook, ErrorHookOutcome, MaxRetriesHook};
pub use lifecycle::{ConsumerState, MessageConsumer};
pub use retry::{FailureDecision, RetryPolicy};
