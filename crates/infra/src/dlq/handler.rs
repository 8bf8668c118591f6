use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::DeadLetterEntry;

/// Re-processes a dead-lettered event.
///
/// `Ok(true)` resolves the entry. `Ok(false)` and `Err(_)` both count as a
/// failed attempt; the error text is recorded on the entry.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry(&self, entry: &DeadLetterEntry) -> anyhow::Result<bool>;
}

/// Adapts an async closure into a [`RetryHandler`].
pub struct FnRetryHandler<F>(F);

#[async_trait]
impl<F, Fut> RetryHandler for FnRetryHandler<F>
where
    F: Fn(DeadLetterEntry) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn retry(&self, entry: &DeadLetterEntry) -> anyhow::Result<bool> {
        (self.0)(entry.clone()).await
    }
}

pub fn retry_fn<F, Fut>(f: F) -> Arc<dyn RetryHandler>
where
    F: Fn(DeadLetterEntry) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(FnRetryHandler(f))
}
