//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::consumers::{error::HandlerError, Incoming};
use std::future::Future;

/// Implementers of the `Handler` trait can be passed to
/// [`QueueListener::start`](crate::consumers::QueueListener::start) to process
/// messages retrieved from the input queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying broker channel.
/// The framework takes care of diverting the message to the error queue when
/// processing fails - `handle`'s error type is never inspected, any failure is
/// treated identically.
/// This decouples the low-level interactions with the message broker from the
/// actual business logic associated with the processing of a message.
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time you
/// will be relying on our implementation of `Handler` for async functions that
/// have a matching signature - `Fn(Incoming<Context>) -> Fut` - via
/// [`ClosureHandler`].
#[async_trait::async_trait]
pub trait Handler<Context>: Send + Sync + 'static {
    async fn handle(&self, incoming: Incoming<Context>) -> Result<(), HandlerError>;
}

/// Implement the [`Handler`] trait for all Boxed handlers.
///
/// E.g. Box<dyn Handler<Context>>.
#[async_trait::async_trait]
impl<Context, H> Handler<Context> for Box<H>
where
    Context: Send + Sync + 'static,
    H: Handler<Context> + ?Sized,
{
    async fn handle(&self, incoming: Incoming<Context>) -> Result<(), HandlerError> {
        H::handle(self, incoming).await
    }
}

/// `AsyncClosure` is implemented for all functions of the form:
/// ```ignore
/// async fn(incoming: Incoming<Context>) -> Result<(), impl Into<HandlerError>>;
/// ```
///
/// When combined with the [`ClosureHandler`] type, you get a [`Handler`] that can be
/// passed to the listener.
pub trait AsyncClosure<Context>: Send + Sync + 'static {
    type Output: Future<Output = Result<(), Self::Err>> + Send;
    type Err: Into<HandlerError> + 'static;
    fn call(&self, incoming: Incoming<Context>) -> Self::Output;
}

/// Implement `AsyncClosure` for all functions that match the required signature.
impl<F, Fut, Err, Context> AsyncClosure<Context> for F
where
    Context: 'static,
    F: Fn(Incoming<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Err>> + Send,
    Err: Into<HandlerError> + 'static,
{
    type Err = Err;
    type Output = Fut;

    fn call(&self, incoming: Incoming<Context>) -> Self::Output {
        // `self`, in this case, is a function, which we are calling on its argument using
        // parenthesis notation - self(_)
        (self)(incoming)
    }
}

/// Wrapper type to turn an [`AsyncClosure`] into a [`Handler`].
pub struct ClosureHandler<H>(pub H);

/// Implement the [`Handler`] trait for all [`ClosureHandler`]s that match the expected signature.
///
/// We do not require handlers to return a [`HandlerError`] directly - it is enough for them to
/// return an error type that can be converted to [`HandlerError`].
#[async_trait::async_trait]
impl<Context, F> Handler<Context> for ClosureHandler<F>
where
    Context: Send + Sync + 'static,
    F: AsyncClosure<Context>,
{
    async fn handle(&self, incoming: Incoming<Context>) -> Result<(), HandlerError> {
        self.0.call(incoming).await.map_err(|e| e.into())
    }
}
