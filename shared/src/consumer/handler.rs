//! Handler contract consumed from business code
//!
//! A handler must tolerate being called more than once for the same message
//! ID: delivery is at-least-once and nothing here deduplicates.

use super::context::ConsumeContext;
use crate::message::Message;
use async_trait::async_trait;
use mq_error::HandlerError;
use std::future::Future;
use std::sync::Arc;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &ConsumeContext, message: &Message) -> Result<(), HandlerError>;
}

pub type SharedHandler = Arc<dyn MessageHandler>;

#[async_trait]
impl<T: MessageHandler + ?Sized> MessageHandler for Arc<T> {
    async fn handle(&self, ctx: &ConsumeContext, message: &Message) -> Result<(), HandlerError> {
        (**self).handle(ctx, message).await
    }
}

/// Handler backed by an async closure, see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from `Fn(ConsumeContext, Message) -> impl Future`
///
/// The closure receives owned copies so it can move them into its future.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ConsumeContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ConsumeContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &ConsumeContext, message: &Message) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), message.clone()).await
    }
}
