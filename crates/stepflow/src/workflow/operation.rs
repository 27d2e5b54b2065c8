use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use crate::{
    workflow::{Retry, RetryOptions, Timeout},
    Result,
};

/// A step body: something that can be invoked, possibly more than once, and
/// yields a value or an error.
#[async_trait]
pub trait Operation: Send {
    type Output: Send;

    async fn call(&mut self) -> Result<Self::Output>;
}

/// Adapter turning an async closure into an [`Operation`]
pub struct FnOperation<F, Fut> {
    f: F,
    _future: PhantomData<Fut>,
}

/// Wrap an async closure as an [`Operation`].
///
/// The closure is called once per attempt, so it must produce a fresh future
/// each time (clone what it captures inside the closure body).
pub fn from_fn<F, Fut, T>(f: F) -> FnOperation<F, Fut>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    FnOperation {
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> Operation for FnOperation<F, Fut>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    type Output = T;

    async fn call(&mut self) -> Result<T> {
        (self.f)().await
    }
}

/// Combinator methods for any [`Operation`]
pub trait OperationExt: Operation + Sized {
    /// Bound each invocation by `duration`.
    fn with_timeout(self, duration: Duration) -> Timeout<Self> {
        Timeout::new(duration, self)
    }

    fn with_retry(self, options: RetryOptions) -> Retry<Self> {
        Retry::new(options, self)
    }
}

impl<O: Operation> OperationExt for O {}
